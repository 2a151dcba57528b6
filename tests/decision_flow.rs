//! End-to-end decision scenarios: screener alerts, pattern steps, regime
//! changes and the order gate, run through both drivers.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;

use sos_engine::events::{AlertAction, Event, Fields, MarketUpdate, ScreenerAlert, SentimentUpdate};
use sos_engine::gate::{DecisionReason, DecisionSink, DispatchMap, GateDecision};
use sos_engine::journal::WriteBehind;
use sos_engine::metrics::CoreCounters;
use sos_engine::pattern::{Comparator, MachineStatus, Operand, PatternDefinition, Predicate, Side, Step};
use sos_engine::recovery::NoBackfill;
use sos_engine::regime::RegimeTable;
use sos_engine::{Config, CoreSetup, DecisionCore, SerialCore};

fn fields(pairs: &[(&str, f64)]) -> Fields {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn sentiment(ts: u64, pcr: f64, advances: u64, declines: u64) -> Event {
    Event::Sentiment(SentimentUpdate { timestamp: ts, pcr, advances, declines })
}

fn alert(symbol: &str, ts: u64, action: AlertAction) -> Event {
    Event::Screener(ScreenerAlert {
        symbol: symbol.to_string(),
        timestamp: ts,
        action,
        metrics: fields(&[("rvol", 2.5)]),
        timeframe: "5m".to_string(),
    })
}

fn market(symbol: &str, ts: u64, pairs: &[(&str, f64)]) -> Event {
    Event::Market(MarketUpdate { symbol: symbol.to_string(), timestamp: ts, fields: fields(pairs) })
}

fn threshold_step(id: &str, field: &str, value: f64) -> Step {
    Step {
        id: id.to_string(),
        when: Predicate::Threshold { field: field.to_string(), op: Comparator::Gt, value: Operand::Const(value) },
        capture: BTreeMap::new(),
        timeout: None,
    }
}

/// Two steps: `a > 1`, then `b > 1`.
fn two_step() -> PatternDefinition {
    PatternDefinition {
        pattern_id: "two_step".to_string(),
        side: Side::Buy,
        steps: vec![threshold_step("first", "a", 1.0), threshold_step("second", "b", 1.0)],
        regime_config: PatternDefinition::builtin().regime_config,
    }
}

fn setup_with(config: Config, pattern: PatternDefinition) -> CoreSetup {
    CoreSetup::new(config, RegimeTable::standard(), pattern, DispatchMap::passthrough()).unwrap()
}

async fn serial(pattern: PatternDefinition) -> SerialCore {
    let mut core = SerialCore::new(setup_with(Config::default(), pattern), Arc::new(CoreCounters::new()));
    core.recover(&NoBackfill).await.unwrap();
    core
}

#[tokio::test]
async fn add_then_both_steps_emits_one_intent() {
    let mut core = serial(two_step()).await;
    assert!(core.process(sentiment(1, 0.85, 1300, 1000)).is_none());
    assert!(core.process(alert("X", 2, AlertAction::Add)).is_none());

    assert!(core.process(market("X", 3, &[("a", 2.0)])).is_none());
    assert_eq!(core.engine().machine("X").unwrap().current_step_index, 1);

    let decision = core.process(market("X", 4, &[("b", 5.0)])).expect("final step matches");
    match decision {
        GateDecision::Emit(intent) => {
            assert_eq!(intent.symbol, "X");
            assert_eq!(intent.dispatch_id, "X");
            assert_eq!(intent.pattern_id, "two_step");
            assert_eq!(intent.regime_at_decision.as_str(), "BULLISH");
            assert_eq!(intent.evidence["first.a"], 2.0);
            assert_eq!(intent.evidence["second.b"], 5.0);
            assert_eq!(intent.timestamp, 4);
        }
        other => panic!("expected intent, got {:?}", other),
    }
    assert_eq!(core.engine().machine("X").unwrap().status, MachineStatus::Satisfied);

    // Satisfied machines do not fire again under the default policy.
    assert!(core.process(market("X", 5, &[("a", 2.0), ("b", 2.0)])).is_none());
    assert_eq!(core.counters().matches, 1);
    assert_eq!(core.counters().intents, 1);
}

#[tokio::test]
async fn bearish_regime_vetoes_the_match() {
    let mut core = serial(two_step()).await;
    core.process(sentiment(1, 1.8, 300, 1200));
    assert_eq!(core.regime().label.as_str(), "COMPLETE_BEARISH");

    core.process(alert("X", 2, AlertAction::Add));
    core.process(market("X", 3, &[("a", 2.0)]));
    match core.process(market("X", 4, &[("b", 2.0)])) {
        Some(GateDecision::Veto(veto)) => {
            assert_eq!(veto.reason, DecisionReason::RegimeVeto);
            assert_eq!(veto.regime.as_str(), "COMPLETE_BEARISH");
        }
        other => panic!("expected veto, got {:?}", other),
    }
    assert_eq!(core.counters().intents, 0);
    assert_eq!(core.counters().vetoes, 1);
}

#[tokio::test]
async fn regime_flip_between_steps_is_seen_by_gate() {
    let mut core = serial(two_step()).await;
    core.process(sentiment(1, 0.85, 1300, 1000));
    core.process(alert("X", 2, AlertAction::Add));
    core.process(market("X", 3, &[("a", 2.0)]));
    core.process(sentiment(4, 1.3, 500, 1000));
    let decision = core.process(market("X", 5, &[("b", 2.0)])).unwrap();
    assert!(decision.is_veto());
    assert_eq!(decision.reason(), DecisionReason::RegimeVeto);
}

#[tokio::test]
async fn duplicate_add_keeps_progress() {
    let mut core = serial(two_step()).await;
    core.process(sentiment(1, 0.85, 1300, 1000));
    core.process(alert("X", 2, AlertAction::Add));
    core.process(market("X", 3, &[("a", 2.0)]));
    core.process(alert("X", 4, AlertAction::Add));

    assert_eq!(core.engine().watchlist_len(), 1);
    assert_eq!(core.engine().machine("X").unwrap().current_step_index, 1);
    assert_eq!(core.counters().duplicate_add, 1);
    assert!(core.process(market("X", 5, &[("b", 2.0)])).is_some());
}

#[tokio::test]
async fn remove_of_unwatched_symbol_is_noop() {
    let mut core = serial(two_step()).await;
    core.process(alert("X", 1, AlertAction::Add));
    core.process(alert("Y", 2, AlertAction::Remove));
    assert_eq!(core.engine().watchlist_len(), 1);
    assert_eq!(core.counters().absent_remove, 1);
}

#[tokio::test]
async fn remove_mid_pattern_discards_progress() {
    let mut core = serial(two_step()).await;
    core.process(sentiment(1, 0.85, 1300, 1000));
    core.process(alert("X", 2, AlertAction::Add));
    core.process(market("X", 3, &[("a", 2.0)]));
    core.process(alert("X", 4, AlertAction::Remove));
    assert!(!core.engine().is_watched("X"));
    assert!(core.process(market("X", 5, &[("b", 2.0)])).is_none());

    // Re-adding starts from step zero.
    core.process(alert("X", 6, AlertAction::Add));
    assert!(core.process(market("X", 7, &[("b", 2.0)])).is_none());
    assert_eq!(core.engine().machine("X").unwrap().current_step_index, 0);
}

#[tokio::test]
async fn n_step_pattern_matches_only_after_last_step() {
    let steps: Vec<Step> = (0..5).map(|i| threshold_step(&format!("s{}", i), &format!("f{}", i), 0.0)).collect();
    let pattern = PatternDefinition {
        pattern_id: "five".to_string(),
        side: Side::Sell,
        steps,
        regime_config: BTreeMap::new(),
    };
    let mut core = serial(pattern).await;
    core.process(sentiment(1, 0.85, 1300, 1000));
    core.process(alert("X", 2, AlertAction::Add));
    for i in 0..4u64 {
        let name = format!("f{}", i);
        assert!(core.process(market("X", 3 + i, &[(name.as_str(), 1.0)])).is_none());
    }
    assert_eq!(core.engine().machine("X").unwrap().current_step_index, 4);
    // Only the current step is evaluated.
    assert!(core.process(market("X", 8, &[("f0", 1.0)])).is_none());
    match core.process(market("X", 10, &[("f4", 1.0)])) {
        Some(GateDecision::Emit(intent)) => assert_eq!(intent.side, Side::Sell),
        other => panic!("expected intent, got {:?}", other),
    }
}

#[tokio::test]
async fn stale_machine_expires_on_sentiment_clock() {
    let config = Config { staleness_ms: 1_000, ..Config::default() };
    let mut core = SerialCore::new(setup_with(config, two_step()), Arc::new(CoreCounters::new()));
    core.recover(&NoBackfill).await.unwrap();

    core.process(alert("X", 100, AlertAction::Add));
    core.process(market("X", 200, &[("a", 2.0)]));
    core.process(sentiment(900, 0.85, 1300, 1000));
    assert!(core.engine().is_watched("X"));
    core.process(sentiment(1_500, 0.85, 1300, 1000));
    assert!(!core.engine().is_watched("X"));
    assert_eq!(core.counters().expired, 1);
}

#[tokio::test]
async fn out_of_order_market_event_does_not_advance() {
    let mut core = serial(two_step()).await;
    core.process(alert("X", 1, AlertAction::Add));
    core.process(market("X", 10, &[("c", 0.0)]));
    assert!(core.process(market("X", 5, &[("a", 2.0)])).is_none());
    assert_eq!(core.engine().machine("X").unwrap().current_step_index, 0);
    assert_eq!(core.counters().out_of_order, 1);
    assert_eq!(core.counters().dropped_out_of_order, 1);
}

struct Collect(mpsc::Sender<GateDecision>);

impl DecisionSink for Collect {
    fn deliver(&mut self, decision: &GateDecision) {
        let _ = self.0.send(decision.clone());
    }
}

#[tokio::test]
async fn threaded_core_agrees_with_serial_core() {
    let script = vec![
        sentiment(1, 0.85, 1300, 1000),
        alert("X", 2, AlertAction::Add),
        alert("Y", 2, AlertAction::Add),
        market("X", 3, &[("a", 2.0)]),
        market("Y", 3, &[("a", 2.0)]),
        market("X", 4, &[("b", 2.0)]),
        sentiment(5, 1.8, 300, 1200),
        market("Y", 6, &[("b", 2.0)]),
    ];

    let mut serial_core = serial(two_step()).await;
    let expected: Vec<GateDecision> = script.iter().cloned().filter_map(|e| serial_core.process(e)).collect();
    assert_eq!(expected.len(), 2);

    let counters = Arc::new(CoreCounters::new());
    let (tx, rx) = mpsc::channel::<GateDecision>();
    let core = DecisionCore::start(
        setup_with(Config::default(), two_step()),
        Arc::clone(&counters),
        vec![Box::new(Collect(tx))],
        WriteBehind::disabled(Arc::clone(&counters)),
    )
    .unwrap();
    core.recover(&NoBackfill).await.unwrap();
    for event in script {
        core.publish(event).unwrap();
    }
    core.shutdown().unwrap();

    let got: Vec<GateDecision> = rx.try_iter().collect();
    assert_eq!(got, expected);
    assert!(!got[0].is_veto());
    assert_eq!(got[1].reason(), DecisionReason::RegimeVeto);
}
