//! Pattern Engine: owns the watchlist, one state machine per watched symbol,
//! and the per-symbol OI wall models.
//!
//! All mutation goes through `&mut self`; the pattern stage is the only
//! owner, so evaluation never sees a half-built or destroyed machine.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use super::machine::{MachineStatus, PatternStateMachine, StepOutcome};
use super::oi::OiWallModel;
use super::PatternDefinition;
use crate::error::{AlertNoop, CoreError};
use crate::events::{AlertAction, Event, Fields, OptionChainBackfill, OptionChainUpdate, Timestamp};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::metrics::CoreCounters;

/// What a machine does after reaching SATISFIED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RearmPolicy {
    #[default]
    Terminate,
    Rearm,
}

impl FromStr for RearmPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "terminate" | "false" | "0" => Ok(RearmPolicy::Terminate),
            "rearm" | "true" | "1" => Ok(RearmPolicy::Rearm),
            other => Err(CoreError::config(format!("unknown rearm policy: {}", other))),
        }
    }
}

/// Trade-signal candidate handed to the order gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternMatch {
    pub symbol: String,
    pub pattern_id: String,
    pub evidence: Fields,
    pub timestamp: Timestamp,
    /// Input-ring sequence of the event that completed the pattern.
    pub source_seq: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct WatchlistEntry {
    pub symbol: String,
    pub metrics: Fields,
    pub timeframe: String,
    pub added_at: Timestamp,
    pub machine: PatternStateMachine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertOutcome {
    Added,
    Removed,
}

pub struct PatternEngine {
    definition: Arc<PatternDefinition>,
    rearm: RearmPolicy,
    staleness_ms: u64,
    watchlist: HashMap<String, WatchlistEntry>,
    oi: HashMap<String, OiWallModel>,
    counters: Arc<CoreCounters>,
}

impl PatternEngine {
    pub fn new(
        definition: Arc<PatternDefinition>,
        rearm: RearmPolicy,
        staleness_ms: u64,
        counters: Arc<CoreCounters>,
    ) -> Self {
        Self {
            definition,
            rearm,
            staleness_ms,
            watchlist: HashMap::new(),
            oi: HashMap::new(),
            counters,
        }
    }

    pub fn definition(&self) -> &PatternDefinition {
        &self.definition
    }

    pub fn watchlist_len(&self) -> usize {
        self.watchlist.len()
    }

    pub fn is_watched(&self, symbol: &str) -> bool {
        self.watchlist.contains_key(symbol)
    }

    pub fn entry(&self, symbol: &str) -> Option<&WatchlistEntry> {
        self.watchlist.get(symbol)
    }

    pub fn machine(&self, symbol: &str) -> Option<&PatternStateMachine> {
        self.watchlist.get(symbol).map(|e| &e.machine)
    }

    pub fn oi_model(&self, symbol: &str) -> Option<&OiWallModel> {
        self.oi.get(symbol)
    }

    /// ADD creates a machine at step 0; REMOVE destroys it. A duplicate ADD
    /// or an absent REMOVE changes nothing and comes back as
    /// `UnknownSymbolAlert`.
    pub fn on_watchlist_alert(
        &mut self,
        symbol: &str,
        action: AlertAction,
        metrics: &Fields,
        timeframe: &str,
        timestamp: Timestamp,
    ) -> Result<AlertOutcome, CoreError> {
        match action {
            AlertAction::Add => {
                if self.watchlist.contains_key(symbol) {
                    return Err(self.noop(symbol, AlertNoop::DuplicateAdd));
                }
                let machine = PatternStateMachine::new(symbol, Arc::clone(&self.definition), timestamp);
                self.watchlist.insert(
                    symbol.to_string(),
                    WatchlistEntry {
                        symbol: symbol.to_string(),
                        metrics: metrics.clone(),
                        timeframe: timeframe.to_string(),
                        added_at: timestamp,
                        machine,
                    },
                );
                log(
                    Level::Info,
                    Domain::Pattern,
                    "watch_add",
                    obj(&[
                        ("symbol", v_str(symbol)),
                        ("timeframe", v_str(timeframe)),
                        ("watched", json!(self.watchlist.len())),
                    ]),
                );
                Ok(AlertOutcome::Added)
            }
            AlertAction::Remove => {
                if self.watchlist.remove(symbol).is_none() {
                    return Err(self.noop(symbol, AlertNoop::AbsentRemove));
                }
                log(
                    Level::Info,
                    Domain::Pattern,
                    "watch_remove",
                    obj(&[("symbol", v_str(symbol)), ("watched", json!(self.watchlist.len()))]),
                );
                Ok(AlertOutcome::Removed)
            }
        }
    }

    fn noop(&self, symbol: &str, kind: AlertNoop) -> CoreError {
        let counter = match kind {
            AlertNoop::DuplicateAdd => &self.counters.duplicate_add,
            AlertNoop::AbsentRemove => &self.counters.absent_remove,
        };
        CoreCounters::incr(counter);
        log(
            Level::Debug,
            Domain::Pattern,
            "alert_noop",
            obj(&[("symbol", v_str(symbol)), ("reason", v_str(kind.as_str()))]),
        );
        CoreError::UnknownSymbolAlert { symbol: symbol.to_string(), kind }
    }

    /// Evaluate the symbol's current step. Returns a match when the final
    /// step passes.
    pub fn on_market_event(&mut self, symbol: &str, fields: &Fields, timestamp: Timestamp) -> Option<PatternMatch> {
        let entry = self.watchlist.get_mut(symbol)?;
        let outcome = entry.machine.on_event(
            fields,
            &entry.metrics,
            self.oi.get(symbol),
            timestamp,
            self.staleness_ms,
        );

        match outcome {
            StepOutcome::Satisfied => {
                let machine = &mut entry.machine;
                let m = PatternMatch {
                    symbol: symbol.to_string(),
                    pattern_id: machine.pattern_id().to_string(),
                    evidence: machine.accumulated_evidence.clone(),
                    timestamp,
                    source_seq: None,
                };
                if self.rearm == RearmPolicy::Rearm {
                    machine.rearm(timestamp);
                }
                CoreCounters::incr(&self.counters.matches);
                log(
                    Level::Info,
                    Domain::Pattern,
                    "pattern_match",
                    obj(&[
                        ("symbol", v_str(symbol)),
                        ("pattern_id", v_str(&m.pattern_id)),
                        ("match_ts", json!(timestamp)),
                    ]),
                );
                Some(m)
            }
            StepOutcome::Advanced { next_step } => {
                log(
                    Level::Debug,
                    Domain::Pattern,
                    "step_advanced",
                    obj(&[("symbol", v_str(symbol)), ("next_step", json!(next_step))]),
                );
                None
            }
            StepOutcome::Expired => {
                self.destroy_expired(symbol, timestamp);
                None
            }
            StepOutcome::OutOfOrder { last } => {
                CoreCounters::incr(&self.counters.dropped_out_of_order);
                log(
                    Level::Warn,
                    Domain::Pattern,
                    "out_of_order_dropped",
                    obj(&[("symbol", v_str(symbol)), ("last", json!(last)), ("got", json!(timestamp))]),
                );
                None
            }
            StepOutcome::Pending | StepOutcome::Ignored => None,
        }
    }

    fn destroy_expired(&mut self, symbol: &str, now: Timestamp) {
        if let Some(entry) = self.watchlist.remove(symbol) {
            CoreCounters::incr(&self.counters.expired);
            log(
                Level::Info,
                Domain::Pattern,
                "machine_expired",
                obj(&[
                    ("symbol", v_str(symbol)),
                    ("step", json!(entry.machine.current_step_index)),
                    ("last_event_at", json!(entry.machine.last_event_at)),
                    ("now", json!(now)),
                ]),
            );
        }
    }

    /// Destroy every active machine with no progress inside the staleness
    /// window. Returns the symbols removed.
    pub fn expire_stale(&mut self, now: Timestamp) -> Vec<String> {
        let staleness = self.staleness_ms;
        let mut stale: Vec<String> = self
            .watchlist
            .values_mut()
            .filter(|e| e.machine.status == MachineStatus::Active && e.machine.is_stale(now, staleness))
            .map(|e| {
                e.machine.expire();
                e.symbol.clone()
            })
            .collect();
        stale.sort();
        for symbol in &stale {
            self.destroy_expired(symbol, now);
        }
        stale
    }

    pub fn apply_backfill(&mut self, backfill: &OptionChainBackfill) {
        let model = self.oi.entry(backfill.symbol.clone()).or_default();
        model.apply_backfill(backfill);
        log(
            Level::Debug,
            Domain::Pattern,
            "oi_backfill",
            obj(&[("symbol", v_str(&backfill.symbol)), ("rows", json!(backfill.history.len()))]),
        );
    }

    pub fn apply_chain(&mut self, update: &OptionChainUpdate) {
        self.oi.entry(update.symbol.clone()).or_default().apply_chain(update);
    }

    /// Route one pipeline event to the matching operation.
    pub fn on_event(&mut self, event: &Event) -> Option<PatternMatch> {
        match event {
            Event::Candle(c) => self.on_market_event(&c.symbol, &c.fields(), c.timestamp),
            Event::Market(m) => self.on_market_event(&m.symbol, &m.fields, m.timestamp),
            Event::Screener(a) => {
                // No-ops are already counted and logged.
                let _ = self.on_watchlist_alert(&a.symbol, a.action, &a.metrics, &a.timeframe, a.timestamp);
                None
            }
            Event::OptionChainBackfill(b) => {
                self.apply_backfill(b);
                None
            }
            Event::OptionChain(u) => {
                self.apply_chain(u);
                None
            }
            Event::Sentiment(s) => {
                self.expire_stale(s.timestamp);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{MarketUpdate, ScreenerAlert, SentimentUpdate};
    use crate::pattern::{Comparator, Operand, Predicate, Side, Step};
    use std::collections::BTreeMap;

    fn fields(pairs: &[(&str, f64)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn step(id: &str, field: &str, value: f64) -> Step {
        Step {
            id: id.into(),
            when: Predicate::Threshold { field: field.into(), op: Comparator::Gt, value: Operand::Const(value) },
            capture: BTreeMap::new(),
            timeout: None,
        }
    }

    fn engine(rearm: RearmPolicy) -> (PatternEngine, Arc<CoreCounters>) {
        let def = PatternDefinition {
            pattern_id: "two".into(),
            side: Side::Buy,
            steps: vec![step("a", "rsi", 60.0), step("b", "close", 100.0)],
            regime_config: BTreeMap::new(),
        };
        let counters = Arc::new(CoreCounters::new());
        (PatternEngine::new(Arc::new(def), rearm, 10_000, Arc::clone(&counters)), counters)
    }

    fn add(e: &mut PatternEngine, symbol: &str, ts: u64) -> Result<AlertOutcome, CoreError> {
        e.on_watchlist_alert(symbol, AlertAction::Add, &Fields::new(), "5m", ts)
    }

    #[test]
    fn test_duplicate_add_keeps_one_machine() {
        let (mut e, counters) = engine(RearmPolicy::Terminate);
        assert_eq!(add(&mut e, "X", 1), Ok(AlertOutcome::Added));
        e.on_market_event("X", &fields(&[("rsi", 70.0)]), 2);
        let err = add(&mut e, "X", 3).unwrap_err();
        assert!(matches!(err, CoreError::UnknownSymbolAlert { kind: AlertNoop::DuplicateAdd, .. }));
        assert_eq!(e.watchlist_len(), 1);
        // The existing machine keeps its progress.
        assert_eq!(e.machine("X").unwrap().current_step_index, 1);
        assert_eq!(counters.snapshot().duplicate_add, 1);
    }

    #[test]
    fn test_remove_absent_symbol_is_noop() {
        let (mut e, counters) = engine(RearmPolicy::Terminate);
        let err = e.on_watchlist_alert("NOPE", AlertAction::Remove, &Fields::new(), "5m", 1).unwrap_err();
        assert!(matches!(err, CoreError::UnknownSymbolAlert { kind: AlertNoop::AbsentRemove, .. }));
        assert_eq!(e.watchlist_len(), 0);
        assert_eq!(counters.snapshot().absent_remove, 1);
    }

    #[test]
    fn test_remove_destroys_machine() {
        let (mut e, _) = engine(RearmPolicy::Terminate);
        add(&mut e, "X", 1).unwrap();
        assert_eq!(e.on_watchlist_alert("X", AlertAction::Remove, &Fields::new(), "5m", 2), Ok(AlertOutcome::Removed));
        assert!(e.machine("X").is_none());
        assert!(e.on_market_event("X", &fields(&[("rsi", 70.0)]), 3).is_none());
    }

    #[test]
    fn test_match_only_after_final_step() {
        let (mut e, counters) = engine(RearmPolicy::Terminate);
        add(&mut e, "X", 1).unwrap();
        assert!(e.on_market_event("X", &fields(&[("rsi", 70.0), ("close", 90.0)]), 2).is_none());
        let m = e.on_market_event("X", &fields(&[("close", 101.0)]), 3).unwrap();
        assert_eq!(m.symbol, "X");
        assert_eq!(m.pattern_id, "two");
        assert_eq!(m.timestamp, 3);
        assert_eq!(m.evidence["b.close"], 101.0);
        assert_eq!(e.machine("X").unwrap().status, MachineStatus::Satisfied);
        // Terminated: no second match.
        assert!(e.on_market_event("X", &fields(&[("rsi", 70.0), ("close", 101.0)]), 4).is_none());
        assert_eq!(counters.snapshot().matches, 1);
    }

    #[test]
    fn test_rearm_policy_matches_again() {
        let (mut e, _) = engine(RearmPolicy::Rearm);
        add(&mut e, "X", 1).unwrap();
        e.on_market_event("X", &fields(&[("rsi", 70.0)]), 2);
        assert!(e.on_market_event("X", &fields(&[("close", 101.0)]), 3).is_some());
        assert_eq!(e.machine("X").unwrap().status, MachineStatus::Active);
        e.on_market_event("X", &fields(&[("rsi", 70.0)]), 4);
        assert!(e.on_market_event("X", &fields(&[("close", 101.0)]), 5).is_some());
    }

    #[test]
    fn test_out_of_order_is_dropped_and_counted() {
        let (mut e, counters) = engine(RearmPolicy::Terminate);
        add(&mut e, "X", 1).unwrap();
        e.on_market_event("X", &fields(&[("rsi", 10.0)]), 10);
        assert!(e.on_market_event("X", &fields(&[("rsi", 70.0)]), 5).is_none());
        assert_eq!(e.machine("X").unwrap().current_step_index, 0);
        assert_eq!(counters.snapshot().dropped_out_of_order, 1);
    }

    #[test]
    fn test_expire_stale_on_sentiment_clock() {
        let (mut e, counters) = engine(RearmPolicy::Terminate);
        add(&mut e, "OLD", 1_000).unwrap();
        add(&mut e, "NEW", 15_000).unwrap();
        let sentiment = Event::Sentiment(SentimentUpdate { timestamp: 20_000, pcr: 1.0, advances: 1, declines: 1 });
        assert!(e.on_event(&sentiment).is_none());
        assert!(!e.is_watched("OLD"));
        assert!(e.is_watched("NEW"));
        assert_eq!(counters.snapshot().expired, 1);
    }

    #[test]
    fn test_on_event_routes_alerts_and_updates() {
        let (mut e, _) = engine(RearmPolicy::Terminate);
        let alert = Event::Screener(ScreenerAlert {
            symbol: "X".into(),
            timestamp: 1,
            action: AlertAction::Add,
            metrics: fields(&[("rvol", 2.5)]),
            timeframe: "15m".into(),
        });
        e.on_event(&alert);
        assert_eq!(e.entry("X").unwrap().metrics["rvol"], 2.5);
        e.on_event(&Event::Market(MarketUpdate { symbol: "X".into(), timestamp: 2, fields: fields(&[("rsi", 61.0)]) }));
        let m = e.on_event(&Event::Market(MarketUpdate {
            symbol: "X".into(),
            timestamp: 3,
            fields: fields(&[("close", 150.0)]),
        }));
        assert!(m.is_some());
    }

    #[test]
    fn test_unvalidated_empty_definition_never_matches() {
        let def = PatternDefinition { pattern_id: "empty".into(), side: Side::Buy, steps: vec![], regime_config: BTreeMap::new() };
        let mut e = PatternEngine::new(Arc::new(def), RearmPolicy::Terminate, 10_000, Arc::new(CoreCounters::new()));
        add(&mut e, "X", 1).unwrap();
        assert!(e.on_market_event("X", &fields(&[("rsi", 70.0)]), 2).is_none());
        assert!(e.is_watched("X"));
    }

    #[test]
    fn test_step_timeout_destroys_machine() {
        let mut def = PatternDefinition {
            pattern_id: "two".into(),
            side: Side::Buy,
            steps: vec![step("a", "rsi", 60.0), step("b", "close", 100.0)],
            regime_config: BTreeMap::new(),
        };
        def.steps[1].timeout = Some(2);
        let counters = Arc::new(CoreCounters::new());
        let mut e = PatternEngine::new(Arc::new(def), RearmPolicy::Terminate, 10_000, Arc::clone(&counters));
        add(&mut e, "X", 1).unwrap();
        e.on_market_event("X", &fields(&[("rsi", 70.0)]), 2);
        e.on_market_event("X", &fields(&[("close", 90.0)]), 3);
        assert!(e.is_watched("X"));
        e.on_market_event("X", &fields(&[("close", 90.0)]), 4);
        assert!(!e.is_watched("X"));
        assert_eq!(counters.snapshot().expired, 1);
    }

    #[test]
    fn test_oi_fields_visible_to_steps() {
        let def = PatternDefinition {
            pattern_id: "wall".into(),
            side: Side::Buy,
            steps: vec![Step {
                id: "above_call_wall".into(),
                when: Predicate::Threshold {
                    field: "close".into(),
                    op: Comparator::Gt,
                    value: Operand::Field { field: "oi.call_wall".into() },
                },
                capture: BTreeMap::new(),
                timeout: None,
            }],
            regime_config: BTreeMap::new(),
        };
        let mut e = PatternEngine::new(Arc::new(def), RearmPolicy::Terminate, 10_000, Arc::new(CoreCounters::new()));
        add(&mut e, "NIFTY", 1).unwrap();
        // No OI yet: predicate cannot resolve.
        assert!(e.on_market_event("NIFTY", &fields(&[("close", 20_500.0)]), 2).is_none());

        e.apply_chain(&OptionChainUpdate {
            symbol: "NIFTY".into(),
            timestamp: 3,
            chain: vec![crate::events::ChainRow {
                strike: 20_400.0,
                call_oi: Some(5_000.0),
                put_oi: Some(100.0),
                call_oi_chg: 0.0,
                put_oi_chg: 0.0,
            }],
        });
        assert!(e.on_market_event("NIFTY", &fields(&[("close", 20_500.0)]), 4).is_some());
    }
}
