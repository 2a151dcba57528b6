//! Inbound JSON lines to outbound decisions, with the journal as the record
//! of what happened. A journal replayed into a fresh core must reproduce the
//! same decisions.

use std::sync::mpsc;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::BufReader;

use sos_engine::driver::feed_lines;
use sos_engine::events::wire;
use sos_engine::gate::{DecisionReason, GateDecision};
use sos_engine::journal::{JsonlJournal, RecordStore, SqliteStore, WriteBehind};
use sos_engine::metrics::CoreCounters;
use sos_engine::recovery::NoBackfill;
use sos_engine::{Config, CoreSetup, DecisionCore, SerialCore};

fn candle(symbol: &str, ts: u64, high: f64, close: f64, volume: f64) -> String {
    format!(
        r#"{{"type":"CANDLE_UPDATE","timestamp":{},"data":{{"symbol":"{}","candle":{{"open":{},"high":{},"low":{},"close":{},"volume":{}}}}}}}"#,
        ts,
        symbol,
        close - 0.5,
        high,
        close - 1.0,
        close,
        volume
    )
}

fn session() -> Vec<String> {
    let mut lines = vec![
        r#"{"type":"SENTIMENT_UPDATE","timestamp":1000,"data":{"pcr":0.75,"advances":1600,"declines":1000}}"#
            .to_string(),
        r#"{"type":"SCREENER_ALERT","timestamp":1001,"data":{"symbol":"RELIANCE","action":"ADD","metrics":{"rvol":3.1},"timeframe":"5m"}}"#
            .to_string(),
        "{ truncated".to_string(),
    ];
    for i in 0..4 {
        lines.push(candle("RELIANCE", 1_010 + i, 2_501.0, 2_500.0, 10_000.0));
    }
    lines.push(candle("RELIANCE", 1_020, 2_510.0, 2_505.0, 60_000.0));
    lines.push(candle("RELIANCE", 1_030, 2_520.0, 2_515.0, 12_000.0));
    lines
}

fn config_with_dispatch(dir: &std::path::Path) -> Config {
    let path = dir.join("dispatch.json");
    std::fs::write(&path, r#"{"RELIANCE":"NSE_EQ|INE002A01018"}"#).unwrap();
    Config { dispatch_map_path: Some(path.to_string_lossy().into_owned()), ..Config::default() }
}

#[tokio::test]
async fn bridge_session_produces_one_dispatchable_intent() {
    let dir = tempfile::tempdir().unwrap();
    let jsonl_path = dir.path().join("journal.jsonl").to_string_lossy().into_owned();
    let db_path = dir.path().join("journal.db").to_string_lossy().into_owned();

    let counters = Arc::new(CoreCounters::new());
    let mut sqlite = SqliteStore::new(&db_path).unwrap();
    sqlite.init().unwrap();
    let stores: Vec<Box<dyn RecordStore>> = vec![Box::new(JsonlJournal::open(&jsonl_path).unwrap()), Box::new(sqlite)];
    let (journal, handle) = WriteBehind::spawn(stores, 256, Arc::clone(&counters)).unwrap();

    let setup = CoreSetup::from_config(config_with_dispatch(dir.path())).unwrap();
    let mut core = SerialCore::new(setup, Arc::clone(&counters)).with_journal(journal);
    core.recover(&NoBackfill).await.unwrap();

    let mut decisions = Vec::new();
    for line in session() {
        if let Ok(Some(d)) = core.process_line(&line) {
            decisions.push(d);
        }
    }
    assert_eq!(core.counters().malformed, 1);
    assert_eq!(decisions.len(), 1);

    let out: Value = serde_json::to_value(&decisions[0]).unwrap();
    assert_eq!(out["decision"], "emit");
    assert_eq!(out["symbol"], "RELIANCE");
    assert_eq!(out["dispatch_id"], "NSE_EQ|INE002A01018");
    assert_eq!(out["pattern_id"], "volume_breakout");
    assert_eq!(out["side"], "BUY");
    assert_eq!(out["regime_at_decision"], "COMPLETE_BULLISH");
    assert_eq!(out["size_multiplier"], 1.5);
    assert_eq!(out["reason"], "APPROVED");
    assert_eq!(out["timestamp"], 1_030);
    assert_eq!(out["evidence"]["entry_high"], 2_510.0);

    drop(core);
    // 8 valid events plus one decision.
    assert_eq!(handle.join().unwrap(), 9);

    let records = JsonlJournal::replay(&jsonl_path).unwrap();
    assert_eq!(records.len(), 9);
    assert_eq!(records.last().unwrap().kind, "TRADE_INTENT");
    let sqlite = SqliteStore::new(&db_path).unwrap();
    assert_eq!(sqlite.count().unwrap(), 9);
    assert_eq!(sqlite.records_for("RELIANCE").unwrap().len(), 8);
}

#[tokio::test]
async fn journal_replay_reproduces_decisions() {
    let dir = tempfile::tempdir().unwrap();
    let jsonl_path = dir.path().join("journal.jsonl").to_string_lossy().into_owned();

    let counters = Arc::new(CoreCounters::new());
    let stores: Vec<Box<dyn RecordStore>> = vec![Box::new(JsonlJournal::open(&jsonl_path).unwrap())];
    let (journal, handle) = WriteBehind::spawn(stores, 256, Arc::clone(&counters)).unwrap();
    let mut live = SerialCore::new(CoreSetup::from_config(config_with_dispatch(dir.path())).unwrap(), counters)
        .with_journal(journal);
    live.recover(&NoBackfill).await.unwrap();
    let original: Vec<GateDecision> = session().iter().filter_map(|l| live.process_line(l).ok().flatten()).collect();
    drop(live);
    handle.join().unwrap();

    let mut replay = SerialCore::new(
        CoreSetup::from_config(config_with_dispatch(dir.path())).unwrap(),
        Arc::new(CoreCounters::new()),
    );
    replay.recover(&NoBackfill).await.unwrap();
    let replayed: Vec<GateDecision> = JsonlJournal::replay(&jsonl_path)
        .unwrap()
        .into_iter()
        .filter(|r| r.seq.is_some())
        .map(|r| wire::decode_value(r.payload).unwrap())
        .filter_map(|e| replay.process(e))
        .collect();

    assert_eq!(replayed, original);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_utf8_line_is_dropped_and_the_feed_continues() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let mut raw: Vec<u8> = Vec::new();
    for (i, line) in session().iter().enumerate() {
        if i == 2 {
            raw.extend_from_slice(b"{\"type\":\"CANDLE_UPDATE\",\"data\":\"\xff\xfe\"}\n");
        }
        raw.extend_from_slice(line.as_bytes());
        raw.push(b'\n');
    }
    raw.extend_from_slice(b"\n   \n");
    std::fs::write(&path, &raw).unwrap();

    let counters = Arc::new(CoreCounters::new());
    let (tx, rx) = mpsc::channel::<GateDecision>();
    let core = DecisionCore::start(
        CoreSetup::from_config(config_with_dispatch(dir.path())).unwrap(),
        Arc::clone(&counters),
        vec![Box::new(tx)],
        WriteBehind::disabled(Arc::clone(&counters)),
    )
    .unwrap();
    core.recover(&NoBackfill).await.unwrap();

    let file = tokio::fs::File::open(&path).await.unwrap();
    let report = feed_lines(&core, BufReader::new(file), std::future::pending::<()>()).await;
    assert_eq!(report.accepted, 8);
    // The invalid UTF-8 line and the truncated one.
    assert_eq!(report.malformed, 2);
    assert!(!report.read_failed);

    let snapshot = core.shutdown().unwrap();
    assert_eq!(snapshot.malformed, 2);
    assert_eq!(snapshot.published, 8);
    let decisions: Vec<GateDecision> = rx.try_iter().collect();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].reason(), DecisionReason::Approved);
    assert_eq!(decisions[0].symbol(), "RELIANCE");
}
