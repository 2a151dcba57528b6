use anyhow::{Context, Result};
use serde_json::json;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tokio::io::{AsyncRead, BufReader};

use sos_engine::gate::{DecisionSink, GateDecision};
use sos_engine::journal::{JournalHandle, JsonlJournal, RecordStore, SqliteStore, WriteBehind};
use sos_engine::logging::{log, obj, v_str, Domain, Level};
use sos_engine::metrics::CoreCounters;
use sos_engine::recovery::{BackfillSource, JsonlBackfillSource, NoBackfill};
use sos_engine::driver::feed_lines;
use sos_engine::{Config, CoreSetup, DecisionCore};

fn open_journal(cfg: &Config, counters: &Arc<CoreCounters>) -> Result<(WriteBehind, Option<JournalHandle>)> {
    let mut stores: Vec<Box<dyn RecordStore>> = Vec::new();
    if let Some(path) = &cfg.journal_path {
        stores.push(Box::new(JsonlJournal::open(path)?));
    }
    if let Some(path) = &cfg.sqlite_path {
        let mut store = SqliteStore::new(path)?;
        store.init()?;
        stores.push(Box::new(store));
    }
    if stores.is_empty() {
        return Ok((WriteBehind::disabled(Arc::clone(counters)), None));
    }
    let names: Vec<&str> = stores.iter().map(|s| s.name()).collect();
    log(Level::Info, Domain::Storage, "journal_open", obj(&[("stores", json!(names))]));
    let (journal, handle) = WriteBehind::spawn(stores, cfg.journal_capacity, Arc::clone(counters))?;
    Ok((journal, Some(handle)))
}

/// Decisions leave the process as JSON lines on stdout.
fn spawn_printer(rx: mpsc::Receiver<GateDecision>) -> Result<thread::JoinHandle<u64>> {
    let handle = thread::Builder::new().name("decision-printer".to_string()).spawn(move || {
        let mut printed = 0u64;
        for decision in rx {
            match serde_json::to_string(&decision) {
                Ok(line) => {
                    println!("{}", line);
                    printed += 1;
                }
                Err(err) => log(
                    Level::Error,
                    Domain::Gate,
                    "decision_encode_failed",
                    obj(&[("symbol", v_str(decision.symbol())), ("error", v_str(&err.to_string()))]),
                ),
            }
        }
        printed
    })?;
    Ok(handle)
}

async fn open_events(cfg: &Config) -> Result<BufReader<Box<dyn AsyncRead + Unpin + Send>>> {
    let reader: Box<dyn AsyncRead + Unpin + Send> = match &cfg.events_path {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("open events {}", path))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };
    Ok(BufReader::new(reader))
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_ok() {
        log(Level::Info, Domain::System, "signal", obj(&[("kind", v_str("ctrl_c"))]));
    } else {
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let setup = CoreSetup::from_config(cfg.clone())?;
    let counters = Arc::new(CoreCounters::new());

    let events = open_events(&cfg).await?;
    let (journal, journal_handle) = open_journal(&cfg, &counters)?;
    let (tx, rx) = mpsc::channel::<GateDecision>();
    let printer = spawn_printer(rx)?;
    let sinks: Vec<Box<dyn DecisionSink>> = vec![Box::new(tx)];

    let core = DecisionCore::start(setup, Arc::clone(&counters), sinks, journal)?;

    let source: Box<dyn BackfillSource> = match &cfg.backfill_path {
        Some(path) => Box::new(JsonlBackfillSource::new(path)),
        None => Box::new(NoBackfill),
    };
    // A failed recovery leaves the core DEGRADED; events still flow so the
    // vetoes are observable.
    if let Err(err) = core.recover(source.as_ref()).await {
        log(Level::Error, Domain::System, "degraded_start", obj(&[("reason", v_str(&err.to_string()))]));
    }

    let fed = feed_lines(&core, events, ctrl_c()).await;
    log(
        Level::Info,
        Domain::System,
        "input_closed",
        obj(&[
            ("accepted", json!(fed.accepted)),
            ("malformed", json!(fed.malformed)),
            ("rejected", json!(fed.rejected)),
            ("read_failed", json!(fed.read_failed)),
        ]),
    );

    let snapshot = core.shutdown()?;
    let printed = printer.join().map_err(|_| anyhow::anyhow!("decision printer panicked"))?;
    if let Some(handle) = journal_handle {
        let written = handle.join()?;
        log(Level::Info, Domain::Storage, "journal_closed", obj(&[("records", json!(written))]));
    }
    log(
        Level::Info,
        Domain::System,
        "exit",
        obj(&[("decisions", json!(printed)), ("intents", json!(snapshot.intents)), ("vetoes", json!(snapshot.vetoes))]),
    );
    Ok(())
}
