//! Order Gate: turns pattern matches into trade intents or recorded vetoes.
//!
//! `on_pattern_match` is a pure function of the match, the current regime
//! snapshot, readiness and the dispatch table. Emission to the outside world
//! goes through `DecisionSink`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::error::CoreError;
use crate::events::{Fields, Timestamp};
use crate::logging::{log, log_intent, log_veto, obj, v_str, Domain, Level};
use crate::metrics::CoreCounters;
use crate::pattern::{PatternDefinition, PatternMatch, Side};
use crate::recovery::{ReadyState, Readiness};
use crate::regime::{RegimeLabel, RegimeReader};

/// Machine-readable rationale carried by every gate decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionReason {
    Approved,
    RegimeVeto,
    Degraded,
    Recovering,
    RegimeUnknown,
    UnmappedSymbol,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::Approved => "APPROVED",
            DecisionReason::RegimeVeto => "REGIME_VETO",
            DecisionReason::Degraded => "DEGRADED",
            DecisionReason::Recovering => "RECOVERING",
            DecisionReason::RegimeUnknown => "REGIME_UNKNOWN",
            DecisionReason::UnmappedSymbol => "UNMAPPED_SYMBOL",
        }
    }
}

/// When the regime snapshot counts as valid for gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegimeValidity {
    /// Valid once recovery has completed, even if no sentiment was seen.
    #[default]
    AfterRecovery,
    /// Valid only once a sentiment update (backfilled or live) was applied.
    FirstSentiment,
}

impl FromStr for RegimeValidity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "after_recovery" => Ok(RegimeValidity::AfterRecovery),
            "first_sentiment" => Ok(RegimeValidity::FirstSentiment),
            other => Err(CoreError::config(format!("unknown regime validity: {}", other))),
        }
    }
}

/// Static `symbol -> dispatch_id` table supplied at sync time.
#[derive(Debug, Clone, Default)]
pub struct DispatchMap {
    table: HashMap<String, String>,
    passthrough: bool,
}

impl DispatchMap {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            table: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            passthrough: false,
        }
    }

    /// Every symbol dispatches under its own name. Used when no table is
    /// configured for local replay.
    pub fn passthrough() -> Self {
        Self { table: HashMap::new(), passthrough: true }
    }

    pub fn from_path(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("read dispatch map {}", path))?;
        let table: HashMap<String, String> =
            serde_json::from_str(&raw).with_context(|| format!("parse dispatch map {}", path))?;
        Ok(Self { table, passthrough: false })
    }

    pub fn resolve(&self, symbol: &str) -> Option<String> {
        match self.table.get(symbol) {
            Some(id) => Some(id.clone()),
            None if self.passthrough => Some(symbol.to_string()),
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeIntent {
    pub symbol: String,
    pub dispatch_id: String,
    pub pattern_id: String,
    pub side: Side,
    pub evidence: Fields,
    pub timestamp: Timestamp,
    pub regime_at_decision: RegimeLabel,
    pub size_multiplier: f64,
    pub reason: DecisionReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VetoReport {
    pub symbol: String,
    pub pattern_id: String,
    pub reason: DecisionReason,
    pub detail: String,
    pub regime: RegimeLabel,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum GateDecision {
    Emit(TradeIntent),
    Veto(VetoReport),
}

impl GateDecision {
    pub fn symbol(&self) -> &str {
        match self {
            GateDecision::Emit(i) => &i.symbol,
            GateDecision::Veto(v) => &v.symbol,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            GateDecision::Emit(i) => i.timestamp,
            GateDecision::Veto(v) => v.timestamp,
        }
    }

    pub fn reason(&self) -> DecisionReason {
        match self {
            GateDecision::Emit(i) => i.reason,
            GateDecision::Veto(v) => v.reason,
        }
    }

    pub fn is_veto(&self) -> bool {
        matches!(self, GateDecision::Veto(_))
    }
}

/// Veto and sizing rules, merged from configuration and the pattern's
/// `regime_config`.
#[derive(Debug, Clone)]
pub struct GatePolicy {
    pub veto: HashSet<RegimeLabel>,
    pub allow_unknown: bool,
    pub validity: RegimeValidity,
    pub side: Side,
    pub sizing: HashMap<RegimeLabel, f64>,
}

impl GatePolicy {
    pub fn new(veto_regimes: &[RegimeLabel], allow_unknown: bool, validity: RegimeValidity, pattern: &PatternDefinition) -> Self {
        let mut veto: HashSet<RegimeLabel> = veto_regimes.iter().cloned().collect();
        veto.extend(pattern.blocked_regimes());
        let sizing = pattern
            .regime_config
            .iter()
            .map(|(label, p)| (RegimeLabel::new(label.as_str()), p.quantity_mod))
            .collect();
        Self { veto, allow_unknown, validity, side: pattern.side, sizing }
    }

    pub fn size_multiplier(&self, regime: &RegimeLabel) -> f64 {
        self.sizing.get(regime).copied().unwrap_or(1.0)
    }
}

pub struct OrderGate {
    policy: GatePolicy,
    regime: RegimeReader,
    readiness: Readiness,
    dispatch: DispatchMap,
    counters: Arc<CoreCounters>,
}

impl OrderGate {
    pub fn new(
        policy: GatePolicy,
        regime: RegimeReader,
        readiness: Readiness,
        dispatch: DispatchMap,
        counters: Arc<CoreCounters>,
    ) -> Self {
        Self { policy, regime, readiness, dispatch, counters }
    }

    pub fn on_pattern_match(&self, m: &PatternMatch) -> GateDecision {
        let snapshot = self.regime.get_regime();
        let regime = snapshot.label.clone();

        let veto = |reason: DecisionReason, detail: String| {
            GateDecision::Veto(VetoReport {
                symbol: m.symbol.clone(),
                pattern_id: m.pattern_id.clone(),
                reason,
                detail,
                regime: regime.clone(),
                timestamp: m.timestamp,
            })
        };

        let decision = match &*self.readiness.get() {
            ReadyState::Degraded { reason } => veto(DecisionReason::Degraded, reason.clone()),
            ReadyState::Recovering => veto(DecisionReason::Recovering, "recovery in progress".to_string()),
            ReadyState::Ready => {
                if self.policy.validity == RegimeValidity::FirstSentiment && snapshot.updated_at.is_none() {
                    veto(DecisionReason::RegimeUnknown, "no sentiment applied yet".to_string())
                } else if regime.is_unknown() && !self.policy.allow_unknown {
                    veto(DecisionReason::RegimeUnknown, "regime not yet classified".to_string())
                } else if self.policy.veto.contains(&regime) {
                    veto(DecisionReason::RegimeVeto, format!("regime {} is vetoed", regime))
                } else {
                    match self.dispatch.resolve(&m.symbol) {
                        None => veto(DecisionReason::UnmappedSymbol, "no dispatch id".to_string()),
                        Some(dispatch_id) => GateDecision::Emit(TradeIntent {
                            symbol: m.symbol.clone(),
                            dispatch_id,
                            pattern_id: m.pattern_id.clone(),
                            side: self.policy.side,
                            evidence: m.evidence.clone(),
                            timestamp: m.timestamp,
                            size_multiplier: self.policy.size_multiplier(&regime),
                            regime_at_decision: regime.clone(),
                            reason: DecisionReason::Approved,
                        }),
                    }
                }
            }
        };

        match &decision {
            GateDecision::Emit(i) => {
                CoreCounters::incr(&self.counters.intents);
                log_intent(&i.symbol, &i.dispatch_id, i.regime_at_decision.as_str(), i.size_multiplier, i.timestamp);
            }
            GateDecision::Veto(v) => {
                CoreCounters::incr(&self.counters.vetoes);
                log_veto(&v.symbol, v.reason.as_str(), &v.detail, v.regime.as_str(), v.timestamp);
            }
        }
        decision
    }
}

/// Dispatch boundary. Must not block for long: it runs on the gate stage.
pub trait DecisionSink: Send + 'static {
    fn deliver(&mut self, decision: &GateDecision);
}

impl DecisionSink for Sender<GateDecision> {
    fn deliver(&mut self, decision: &GateDecision) {
        if self.send(decision.clone()).is_err() {
            log(
                Level::Warn,
                Domain::Gate,
                "sink_closed",
                obj(&[("symbol", v_str(decision.symbol())), ("reason", v_str(decision.reason().as_str()))]),
            );
        }
    }
}
