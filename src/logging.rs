//! Structured logging for the decision core.
//!
//! Each record is one JSON object on stderr, mirrored under `LOG_DIR/<run_id>/`
//! when that is set. Records carry the run id and a process-wide sequence
//! number so a run can be lined up against its journal. Level, domain and
//! profiling filters are read from the environment on first use and never
//! again, so the stage threads never touch the environment.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use crate::metrics::CountersSnapshot;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Level::Trace),
            "debug" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" => Some(Level::Warn),
            "error" => Some(Level::Error),
            "fatal" => Some(Level::Fatal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Pipeline, // Ring publish/consume, saturation, shutdown
    Ingress,  // Wire parsing, ordering monitor
    Regime,   // Sentiment classification
    Pattern,  // Watchlist lifecycle, step evaluation
    Gate,     // Veto / intent decisions
    Recovery, // Backfill warm start
    Storage,  // Write-behind journal
    System,   // Startup, shutdown
    Profile,  // Stage timing
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Pipeline => "pipeline",
            Domain::Ingress => "ingress",
            Domain::Regime => "regime",
            Domain::Pattern => "pattern",
            Domain::Gate => "gate",
            Domain::Recovery => "recovery",
            Domain::Storage => "storage",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }

    pub fn is_enabled(&self) -> bool {
        filter().allows_domain(*self)
    }
}

// =============================================================================
// Filter, read from the environment once per process
// =============================================================================

/// `LOG_LEVEL`, `LOG_DOMAINS` and `PROFILE_SAMPLE`, parsed on first use.
#[derive(Debug, Clone, PartialEq)]
pub struct LogFilter {
    pub min_level: Level,
    /// `None` means every domain.
    pub domains: Option<Vec<Domain>>,
    /// Fraction of stage steps to time, in `[0, 1]`.
    pub profile_sample: f64,
}

static LOG_FILTER: OnceLock<LogFilter> = OnceLock::new();

fn filter() -> &'static LogFilter {
    LOG_FILTER.get_or_init(|| {
        let var = |k: &str| std::env::var(k).ok();
        LogFilter::parse(var("LOG_LEVEL").as_deref(), var("LOG_DOMAINS").as_deref(), var("PROFILE_SAMPLE").as_deref())
    })
}

const ALL_DOMAINS: [Domain; 9] = [
    Domain::Pipeline,
    Domain::Ingress,
    Domain::Regime,
    Domain::Pattern,
    Domain::Gate,
    Domain::Recovery,
    Domain::Storage,
    Domain::System,
    Domain::Profile,
];

impl LogFilter {
    pub fn parse(level: Option<&str>, domains: Option<&str>, profile_sample: Option<&str>) -> Self {
        let domains = match domains.map(str::trim) {
            None | Some("all") => None,
            Some(list) => Some(
                list.split(',')
                    .filter_map(|name| ALL_DOMAINS.iter().copied().find(|d| d.as_str() == name.trim()))
                    .collect(),
            ),
        };
        Self {
            min_level: level.and_then(Level::parse).unwrap_or(Level::Info),
            domains,
            profile_sample: profile_sample
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|p| p.is_finite())
                .map_or(0.0, |p| p.clamp(0.0, 1.0)),
        }
    }

    pub fn allows(&self, level: Level, domain: Domain) -> bool {
        level >= self.min_level && self.allows_domain(domain)
    }

    fn allows_domain(&self, domain: Domain) -> bool {
        self.domains.as_ref().map_or(true, |ds| ds.contains(&domain))
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static PROFILE_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    files: Option<RunFiles>,
}

#[derive(Debug)]
struct RunFiles {
    events: Mutex<BufWriter<File>>,
    trace: Mutex<BufWriter<File>>,
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let files = std::env::var("LOG_DIR").ok().and_then(|base| open_run_files(&base, &run_id));
        RunContext { run_id, files }
    })
}

fn open_run_files(base: &str, run_id: &str) -> Option<RunFiles> {
    let mut run_dir = PathBuf::from(base);
    run_dir.push(run_id);
    if let Err(err) = create_dir_all(&run_dir) {
        eprintln!("[log] failed to create run dir: {}", err);
        return None;
    }
    let _ = std::fs::write(
        run_dir.join("manifest.json"),
        json!({
            "run_id": run_id,
            "ts": ts_now(),
            "pid": process::id(),
        })
        .to_string(),
    );
    let events = File::create(run_dir.join("events.jsonl"));
    let trace = File::create(run_dir.join("trace.jsonl"));
    match (events, trace) {
        (Ok(events), Ok(trace)) => Some(RunFiles {
            events: Mutex::new(BufWriter::new(events)),
            trace: Mutex::new(BufWriter::new(trace)),
        }),
        (Err(err), _) | (_, Err(err)) => {
            eprintln!("[log] failed to create run logs: {}", err);
            None
        }
    }
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["symbol", "stage", "reason", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Mutex<BufWriter<File>>, line: &str) {
    if let Ok(mut w) = writer.lock() {
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if !filter().allows(level, domain) {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    if let Some(files) = &ctx.files {
        match level {
            Level::Trace | Level::Debug => write_line(&files.trace, &line),
            _ => write_line(&files.events, &line),
        }
    }
    eprintln!("{}", line);
}

// =============================================================================
// Domain-specific helpers
// =============================================================================

pub fn log_regime_change(from: &str, to: &str, pcr: f64, advances: u64, declines: u64, ts: u64) {
    log(
        Level::Info,
        Domain::Regime,
        "regime_change",
        obj(&[
            ("from", v_str(from)),
            ("to", v_str(to)),
            ("pcr", v_num(pcr)),
            ("advances", json!(advances)),
            ("declines", json!(declines)),
            ("updated_at", json!(ts)),
        ]),
    );
}

pub fn log_veto(symbol: &str, reason: &str, detail: &str, regime: &str, ts: u64) {
    log(
        Level::Info,
        Domain::Gate,
        "veto",
        obj(&[
            ("symbol", v_str(symbol)),
            ("reason", v_str(reason)),
            ("detail", v_str(detail)),
            ("regime", v_str(regime)),
            ("match_ts", json!(ts)),
        ]),
    );
}

pub fn log_intent(symbol: &str, dispatch_id: &str, regime: &str, size_multiplier: f64, ts: u64) {
    log(
        Level::Info,
        Domain::Gate,
        "trade_intent",
        obj(&[
            ("symbol", v_str(symbol)),
            ("dispatch_id", v_str(dispatch_id)),
            ("regime", v_str(regime)),
            ("size_multiplier", v_num(size_multiplier)),
            ("match_ts", json!(ts)),
        ]),
    );
}

pub fn log_counters(event: &str, counters: &CountersSnapshot) {
    let data = match serde_json::to_value(counters) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    log(Level::Info, Domain::System, event, data);
}

// =============================================================================
// Field helpers
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Emits structured timing for one stage step on drop.
pub struct ProfileScope {
    label: &'static str,
    context: Option<Map<String, Value>>,
    started: Instant,
    enabled: bool,
}

impl ProfileScope {
    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        let enabled = Self::should_sample();
        Self {
            label,
            context: if enabled { Some(obj(fields)) } else { None },
            started: Instant::now(),
            enabled,
        }
    }

    fn should_sample() -> bool {
        let p = filter().profile_sample;
        if p >= 1.0 {
            return true;
        }
        if p <= 0.0 {
            return false;
        }
        let seq = PROFILE_SEQ.fetch_add(1, Ordering::Relaxed);
        ((seq % 10_000) as f64 / 10_000.0) < p
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        let elapsed_us = self.started.elapsed().as_secs_f64() * 1_000_000.0;
        let mut fields = self.context.take().unwrap_or_default();
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_us".to_string(), v_num(elapsed_us));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_split_fields_promotes_symbol() {
        let (top, data) = split_fields(obj(&[("symbol", v_str("X")), ("pcr", v_num(1.1))]));
        assert_eq!(top.get("symbol").unwrap(), "X");
        assert!(data.contains_key("pcr"));
        assert!(!data.contains_key("symbol"));
    }

    #[test]
    fn test_filter_defaults_and_domain_list() {
        let f = LogFilter::parse(None, None, None);
        assert_eq!(f.min_level, Level::Info);
        assert!(f.allows(Level::Warn, Domain::Gate));
        assert!(!f.allows(Level::Debug, Domain::Gate));
        assert_eq!(f.profile_sample, 0.0);

        let f = LogFilter::parse(Some("DEBUG"), Some("gate, regime,bogus"), Some("2.5"));
        assert_eq!(f.domains, Some(vec![Domain::Gate, Domain::Regime]));
        assert!(f.allows(Level::Debug, Domain::Regime));
        assert!(!f.allows(Level::Error, Domain::Pipeline));
        assert_eq!(f.profile_sample, 1.0);
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }
}
