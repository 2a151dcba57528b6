//! Per-symbol pattern detection.
//!
//! A pattern is data: an ordered list of steps, each a declarative predicate,
//! plus per-regime entry policy. The engine runs one state machine per
//! watchlisted symbol over that definition.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::CoreError;
use crate::regime::RegimeLabel;

pub mod engine;
pub mod machine;
pub mod oi;
pub mod predicate;

pub use engine::{AlertOutcome, PatternEngine, PatternMatch, RearmPolicy, WatchlistEntry};
pub use machine::{MachineStatus, PatternStateMachine, StepOutcome};
pub use oi::{OiWallModel, StrikeOi};
pub use predicate::{Aggregation, Comparator, Operand, Predicate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    #[default]
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub when: Predicate,
    /// Values recorded into the machine's evidence when this step passes.
    #[serde(default)]
    pub capture: BTreeMap<String, Operand>,
    /// Events this step may fail on before the machine expires, counted from
    /// the previous step passing. `None` leaves only the staleness window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
}

fn default_allow_entry() -> bool {
    true
}

fn default_quantity_mod() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimePolicy {
    #[serde(default = "default_allow_entry")]
    pub allow_entry: bool,
    #[serde(default = "default_quantity_mod")]
    pub quantity_mod: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternDefinition {
    pub pattern_id: String,
    #[serde(default)]
    pub side: Side,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub regime_config: BTreeMap<String, RegimePolicy>,
}

impl PatternDefinition {
    /// Two-step volume-surge breakout used when no pattern file is configured.
    pub fn builtin() -> Self {
        let policy = |allow_entry, quantity_mod| RegimePolicy { allow_entry, quantity_mod };
        Self {
            pattern_id: "volume_breakout".to_string(),
            side: Side::Buy,
            steps: vec![
                Step {
                    id: "volume_surge".to_string(),
                    when: Predicate::Threshold {
                        field: "volume".to_string(),
                        op: Comparator::Gt,
                        value: Operand::Window { field: "volume".to_string(), agg: Aggregation::Mean, window: 5 },
                    },
                    capture: BTreeMap::from([(
                        "entry_high".to_string(),
                        Operand::Field { field: "high".to_string() },
                    )]),
                    timeout: None,
                },
                Step {
                    id: "breakout".to_string(),
                    when: Predicate::Threshold {
                        field: "close".to_string(),
                        op: Comparator::Gt,
                        value: Operand::Field { field: "vars.entry_high".to_string() },
                    },
                    capture: BTreeMap::new(),
                    timeout: Some(10),
                },
            ],
            regime_config: BTreeMap::from([
                ("COMPLETE_BEARISH".to_string(), policy(false, 0.0)),
                ("BEARISH".to_string(), policy(false, 0.0)),
                ("SIDEWAYS_BEARISH".to_string(), policy(true, 0.5)),
                ("COMPLETE_BULLISH".to_string(), policy(true, 1.5)),
            ]),
        }
    }

    pub fn from_path(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("read pattern {}", path))?;
        let def: PatternDefinition =
            serde_json::from_str(&raw).with_context(|| format!("parse pattern {}", path))?;
        def.validate()?;
        Ok(def)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.steps.is_empty() {
            return Err(CoreError::config(format!("pattern {} has no steps", self.pattern_id)));
        }
        for step in &self.steps {
            step.when
                .validate()
                .map_err(|e| CoreError::config(format!("pattern {} step {}: {}", self.pattern_id, step.id, e)))?;
            if step.timeout == Some(0) {
                return Err(CoreError::config(format!("pattern {} step {}: timeout must be > 0", self.pattern_id, step.id)));
            }
        }
        for (label, policy) in &self.regime_config {
            if !policy.quantity_mod.is_finite() || policy.quantity_mod < 0.0 {
                return Err(CoreError::config(format!("quantity_mod for {} must be >= 0", label)));
            }
        }
        Ok(())
    }

    /// Deepest rolling window needed per field across all steps.
    pub fn window_depths(&self) -> BTreeMap<String, usize> {
        let mut depths = BTreeMap::new();
        for step in &self.steps {
            step.when.window_depths(&mut depths);
            for operand in step.capture.values() {
                operand.window_depths(&mut depths);
            }
        }
        depths
    }

    /// Regimes in which this pattern must not enter.
    pub fn blocked_regimes(&self) -> Vec<RegimeLabel> {
        self.regime_config
            .iter()
            .filter(|(_, p)| !p.allow_entry)
            .map(|(label, _)| RegimeLabel::new(label.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_is_valid() {
        let def = PatternDefinition::builtin();
        def.validate().unwrap();
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[0].id, "volume_surge");
        assert_eq!(def.window_depths().get("volume"), Some(&5));
    }

    #[test]
    fn test_blocked_regimes() {
        let def = PatternDefinition::builtin();
        let blocked = def.blocked_regimes();
        assert!(blocked.contains(&RegimeLabel::new("BEARISH")));
        assert!(!blocked.contains(&RegimeLabel::new("BULLISH")));
        assert!(!blocked.contains(&RegimeLabel::new("SIDEWAYS_BEARISH")));
    }

    #[test]
    fn test_parse_from_json_with_defaults() {
        let def: PatternDefinition = serde_json::from_str(
            r#"{
                "pattern_id": "p",
                "steps": [
                    {"id": "a", "when": {"kind": "threshold", "field": "close", "op": "gt", "value": 1}},
                    {"id": "b", "when": {"kind": "threshold", "field": "close", "op": "gt", "value": 2}, "timeout": 5}
                ],
                "regime_config": {"SIDEWAYS": {"allow_entry": false}}
            }"#,
        )
        .unwrap();
        assert_eq!(def.side, Side::Buy);
        assert!(def.steps[0].capture.is_empty());
        assert_eq!(def.steps[0].timeout, None);
        assert_eq!(def.steps[1].timeout, Some(5));
        assert_eq!(def.regime_config["SIDEWAYS"].quantity_mod, 1.0);
        assert_eq!(def.blocked_regimes(), vec![RegimeLabel::new("SIDEWAYS")]);
    }

    #[test]
    fn test_validate_rejects_empty_pattern() {
        let def = PatternDefinition { pattern_id: "p".into(), side: Side::Sell, steps: vec![], regime_config: BTreeMap::new() };
        assert!(matches!(def.validate(), Err(CoreError::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut def = PatternDefinition::builtin();
        def.steps[1].timeout = Some(0);
        assert!(matches!(def.validate(), Err(CoreError::Config { .. })));
    }
}
