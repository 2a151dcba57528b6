use anyhow::Result;

use crate::error::CoreError;
use crate::gate::{DispatchMap, RegimeValidity};
use crate::pattern::{PatternDefinition, RearmPolicy};
use crate::pipeline::SaturationPolicy;
use crate::regime::{RegimeLabel, RegimeTable};

#[derive(Debug, Clone)]
pub struct Config {
    pub pipeline_capacity: usize,
    pub saturation_policy: SaturationPolicy,
    pub staleness_ms: u64,
    pub rearm_policy: RearmPolicy,
    pub veto_regimes: Vec<RegimeLabel>,
    pub allow_unknown_regime: bool,
    pub regime_validity: RegimeValidity,
    pub regime_table_path: Option<String>,
    pub pattern_path: Option<String>,
    pub dispatch_map_path: Option<String>,
    pub backfill_path: Option<String>,
    pub events_path: Option<String>,
    pub journal_path: Option<String>,
    pub sqlite_path: Option<String>,
    pub journal_capacity: usize,
    pub recovery_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_labels(v: &str) -> Vec<RegimeLabel> {
    v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(RegimeLabel::new).collect()
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unparseable values fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let path = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        Self {
            pipeline_capacity: get("PIPELINE_CAPACITY").and_then(|v| v.parse().ok()).unwrap_or(1024),
            saturation_policy: get("SATURATION_POLICY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(SaturationPolicy::Block),
            staleness_ms: get("STALENESS_MS").and_then(|v| v.parse().ok()).unwrap_or(900_000),
            rearm_policy: get("REARM_ON_SATISFY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(RearmPolicy::Terminate),
            veto_regimes: get("VETO_REGIMES")
                .map(|v| parse_labels(&v))
                .unwrap_or_else(|| vec![RegimeLabel::new("SIDEWAYS")]),
            allow_unknown_regime: get("ALLOW_UNKNOWN_REGIME").and_then(|v| parse_bool(&v)).unwrap_or(false),
            regime_validity: get("REGIME_VALIDITY")
                .and_then(|v| v.parse().ok())
                .unwrap_or(RegimeValidity::AfterRecovery),
            regime_table_path: path("REGIME_TABLE_PATH"),
            pattern_path: path("PATTERN_PATH"),
            dispatch_map_path: path("DISPATCH_MAP_PATH"),
            backfill_path: path("BACKFILL_PATH"),
            events_path: path("EVENTS_PATH"),
            journal_path: path("JOURNAL_PATH"),
            sqlite_path: path("SQLITE_PATH"),
            journal_capacity: get("JOURNAL_CAPACITY").and_then(|v| v.parse().ok()).unwrap_or(4096),
            recovery_timeout_ms: get("RECOVERY_TIMEOUT_MS").and_then(|v| v.parse().ok()).unwrap_or(30_000),
        }
    }

    pub fn validate(&self, table: &RegimeTable) -> Result<(), CoreError> {
        if self.pipeline_capacity == 0 {
            return Err(CoreError::config("PIPELINE_CAPACITY must be > 0"));
        }
        if self.journal_capacity == 0 {
            return Err(CoreError::config("JOURNAL_CAPACITY must be > 0"));
        }
        table.validate()?;
        if let Some(label) = self.veto_regimes.iter().find(|l| !table.contains(l)) {
            return Err(CoreError::config(format!("veto regime {} is not in the regime table", label)));
        }
        Ok(())
    }

    pub fn load_regime_table(&self) -> Result<RegimeTable> {
        match &self.regime_table_path {
            Some(path) => RegimeTable::from_path(path),
            None => Ok(RegimeTable::standard()),
        }
    }

    pub fn load_pattern(&self) -> Result<PatternDefinition> {
        match &self.pattern_path {
            Some(path) => PatternDefinition::from_path(path),
            None => Ok(PatternDefinition::builtin()),
        }
    }

    pub fn load_dispatch_map(&self) -> Result<DispatchMap> {
        match &self.dispatch_map_path {
            Some(path) => DispatchMap::from_path(path),
            None => Ok(DispatchMap::passthrough()),
        }
    }
}
