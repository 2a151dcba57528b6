//! Write-behind persistence for events and gate decisions.
//!
//! The hot path only does a non-blocking `try_send` into a bounded queue; a
//! writer thread drains it into one or more record stores. When the queue is
//! full the record is dropped and counted.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::events::{wire, Event, SENTIMENT_STREAM};
use crate::gate::GateDecision;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::metrics::CoreCounters;

/// One persisted record, keyed by `(symbol, ts)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub symbol: String,
    pub ts: u64,
    pub kind: String,
    #[serde(default)]
    pub seq: Option<u64>,
    pub payload: Value,
}

impl JournalRecord {
    pub fn from_event(seq: Option<u64>, event: &Event) -> Self {
        Self {
            symbol: event.symbol().unwrap_or(SENTIMENT_STREAM).to_string(),
            ts: event.timestamp(),
            kind: event.kind().to_string(),
            seq,
            payload: wire::encode(event),
        }
    }

    pub fn from_decision(decision: &GateDecision) -> Self {
        let kind = match decision {
            GateDecision::Emit(_) => "TRADE_INTENT",
            GateDecision::Veto(_) => "VETO",
        };
        Self {
            symbol: decision.symbol().to_string(),
            ts: decision.timestamp(),
            kind: kind.to_string(),
            seq: None,
            payload: serde_json::to_value(decision).unwrap_or(Value::Null),
        }
    }
}

pub trait RecordStore: Send {
    fn name(&self) -> &'static str;

    fn append(&mut self, record: &JournalRecord) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Append-only JSONL journal.
pub struct JsonlJournal {
    writer: BufWriter<File>,
}

impl JsonlJournal {
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { writer: BufWriter::new(file) })
    }

    /// Every parseable record in the file; unparseable lines are skipped.
    pub fn replay(path: &str) -> Result<Vec<JournalRecord>> {
        if !Path::new(path).exists() {
            return Ok(vec![]);
        }
        let reader = BufReader::new(File::open(path)?);
        Ok(reader
            .lines()
            .map_while(|l| l.ok())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect())
    }
}

impl RecordStore for JsonlJournal {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn append(&mut self, record: &JournalRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// SQLite table `records`, indexed on `(symbol, ts)`.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self { conn: Connection::open(path)? })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS records (
                symbol TEXT NOT NULL,
                ts INTEGER NOT NULL,
                kind TEXT NOT NULL,
                seq INTEGER,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_records_symbol_ts ON records (symbol, ts);
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn records_for(&self, symbol: &str) -> Result<Vec<JournalRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT symbol, ts, kind, seq, payload FROM records WHERE symbol = ?1 ORDER BY ts, rowid")?;
        let rows = stmt.query_map(params![symbol], |row| {
            let payload: String = row.get(4)?;
            Ok(JournalRecord {
                symbol: row.get(0)?,
                ts: row.get::<_, i64>(1)? as u64,
                kind: row.get(2)?,
                seq: row.get::<_, Option<i64>>(3)?.map(|s| s as u64),
                payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM records", [], |r| r.get(0))?;
        Ok(n as u64)
    }
}

impl RecordStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn append(&mut self, record: &JournalRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO records (symbol, ts, kind, seq, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.symbol,
                record.ts as i64,
                record.kind,
                record.seq.map(|s| s as i64),
                record.payload.to_string()
            ],
        )?;
        Ok(())
    }
}

/// Producer side of the write-behind queue. Cheap to clone.
#[derive(Clone)]
pub struct WriteBehind {
    tx: Option<SyncSender<JournalRecord>>,
    counters: Arc<CoreCounters>,
}

impl WriteBehind {
    /// Sink that records nothing.
    pub fn disabled(counters: Arc<CoreCounters>) -> Self {
        Self { tx: None, counters }
    }

    pub fn spawn(
        stores: Vec<Box<dyn RecordStore>>,
        capacity: usize,
        counters: Arc<CoreCounters>,
    ) -> Result<(Self, JournalHandle)> {
        let (tx, rx) = sync_channel(capacity.max(1));
        let handle = thread::Builder::new()
            .name("journal-writer".to_string())
            .spawn(move || run_writer(rx, stores))?;
        Ok((Self { tx: Some(tx), counters }, JournalHandle { handle }))
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Never blocks. Returns false if the record was dropped.
    pub fn record(&self, record: JournalRecord) -> bool {
        let Some(tx) = &self.tx else { return true };
        match tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(rec)) | Err(TrySendError::Disconnected(rec)) => {
                CoreCounters::incr(&self.counters.journal_dropped);
                log(
                    Level::Warn,
                    Domain::Storage,
                    "journal_drop",
                    obj(&[("symbol", v_str(&rec.symbol)), ("kind", v_str(&rec.kind)), ("ts", json!(rec.ts))]),
                );
                false
            }
        }
    }

    pub fn record_event(&self, seq: Option<u64>, event: &Event) -> bool {
        if !self.is_enabled() {
            return true;
        }
        self.record(JournalRecord::from_event(seq, event))
    }

    pub fn record_decision(&self, decision: &GateDecision) -> bool {
        if !self.is_enabled() {
            return true;
        }
        self.record(JournalRecord::from_decision(decision))
    }
}

pub struct JournalHandle {
    handle: JoinHandle<u64>,
}

impl JournalHandle {
    /// Returns once every `WriteBehind` clone is dropped and the queue is
    /// drained. Yields the number of records written.
    pub fn join(self) -> Result<u64> {
        self.handle.join().map_err(|_| anyhow!("journal writer panicked"))
    }
}

fn run_writer(rx: Receiver<JournalRecord>, mut stores: Vec<Box<dyn RecordStore>>) -> u64 {
    let mut written = 0u64;
    for record in rx {
        for store in stores.iter_mut() {
            if let Err(err) = store.append(&record) {
                log(
                    Level::Error,
                    Domain::Storage,
                    "journal_write_failed",
                    obj(&[("store", v_str(store.name())), ("error", v_str(&err.to_string()))]),
                );
            }
        }
        written += 1;
    }
    for store in stores.iter_mut() {
        if let Err(err) = store.flush() {
            log(
                Level::Error,
                Domain::Storage,
                "journal_flush_failed",
                obj(&[("store", v_str(store.name())), ("error", v_str(&err.to_string()))]),
            );
        }
    }
    log(Level::Info, Domain::Storage, "journal_closed", obj(&[("written", json!(written))]));
    written
}
