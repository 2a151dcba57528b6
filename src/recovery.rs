//! Startup recovery: warm the regime and OI models from backfill before any
//! match may reach the dispatch boundary.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::CoreError;
use crate::events::{wire, Event, OptionChainBackfill, SentimentUpdate};
use crate::logging::{log, obj, v_str, Domain, Level};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ReadyState {
    Recovering,
    Ready,
    Degraded { reason: String },
}

/// Shared gate flag. Written by recovery, read by the order gate.
#[derive(Debug, Clone)]
pub struct Readiness {
    state: Arc<ArcSwap<ReadyState>>,
}

impl Readiness {
    pub fn new() -> Self {
        Self { state: Arc::new(ArcSwap::from_pointee(ReadyState::Recovering)) }
    }

    /// Already ready; for drivers that skip recovery.
    pub fn ready() -> Self {
        Self { state: Arc::new(ArcSwap::from_pointee(ReadyState::Ready)) }
    }

    pub fn get(&self) -> Arc<ReadyState> {
        self.state.load_full()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.load_full(), ReadyState::Ready)
    }

    pub fn is_recovering(&self) -> bool {
        matches!(*self.state.load_full(), ReadyState::Recovering)
    }

    pub fn mark_ready(&self) {
        self.state.store(Arc::new(ReadyState::Ready));
    }

    pub fn mark_degraded(&self, reason: impl Into<String>) {
        self.state.store(Arc::new(ReadyState::Degraded { reason: reason.into() }));
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconstructed startup context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Backfill {
    pub option_chains: Vec<OptionChainBackfill>,
    pub sentiment: Option<SentimentUpdate>,
}

impl Backfill {
    /// Option chains first, then the latest sentiment.
    pub fn into_events(self) -> Vec<Event> {
        let mut events: Vec<Event> = self.option_chains.into_iter().map(Event::OptionChainBackfill).collect();
        events.extend(self.sentiment.map(Event::Sentiment));
        events
    }

    fn push(&mut self, event: Event) -> bool {
        match event {
            Event::OptionChainBackfill(b) => self.option_chains.push(b),
            Event::Sentiment(s) => {
                if self.sentiment.as_ref().map_or(true, |cur| s.timestamp >= cur.timestamp) {
                    self.sentiment = Some(s);
                }
            }
            _ => return false,
        }
        true
    }
}

/// External backfill collaborator.
#[async_trait]
pub trait BackfillSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self) -> Result<Backfill>;
}

/// JSONL file of wire envelopes (`BACKFILL_DATA`, `SENTIMENT_UPDATE`).
pub struct JsonlBackfillSource {
    path: PathBuf,
}

impl JsonlBackfillSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl BackfillSource for JsonlBackfillSource {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn fetch(&self) -> Result<Backfill> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("read backfill {}", self.path.display()))?;
        let mut backfill = Backfill::default();
        for (n, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event = wire::decode(line).with_context(|| format!("backfill line {}", n + 1))?;
            let kind = event.kind();
            if !backfill.push(event) {
                log(
                    Level::Warn,
                    Domain::Recovery,
                    "backfill_skip",
                    obj(&[("line", json!(n + 1)), ("type", v_str(kind))]),
                );
            }
        }
        Ok(backfill)
    }
}

/// In-memory backfill.
pub struct StaticBackfill(pub Backfill);

#[async_trait]
impl BackfillSource for StaticBackfill {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(&self) -> Result<Backfill> {
        Ok(self.0.clone())
    }
}

/// No backfill configured; recovery succeeds with empty context.
pub struct NoBackfill;

#[async_trait]
impl BackfillSource for NoBackfill {
    fn name(&self) -> &str {
        "none"
    }

    async fn fetch(&self) -> Result<Backfill> {
        Ok(Backfill::default())
    }
}

/// Where recovered events are applied: the regime and pattern paths only,
/// never the order gate.
pub trait BackfillSink {
    fn apply(&mut self, event: Event) -> Result<(), CoreError>;

    /// Wait until everything applied is visible to readers.
    fn settle(&mut self) -> Result<(), CoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub source: String,
    pub option_chains: usize,
    pub oi_rows: usize,
    pub sentiment_applied: bool,
    pub elapsed_ms: u64,
}

pub struct RecoveryCoordinator {
    readiness: Readiness,
    timeout: Duration,
}

impl RecoveryCoordinator {
    pub fn new(readiness: Readiness, timeout: Duration) -> Self {
        Self { readiness, timeout }
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    /// Fetch, apply, then flip readiness. Any failure leaves the process
    /// DEGRADED for the rest of the run.
    pub async fn recover<S>(&self, source: &S, sink: &mut dyn BackfillSink) -> Result<RecoveryReport, CoreError>
    where
        S: BackfillSource + ?Sized,
    {
        let started = Instant::now();
        log(Level::Info, Domain::Recovery, "recovery_start", obj(&[("source", v_str(source.name()))]));

        let backfill = match tokio::time::timeout(self.timeout, source.fetch()).await {
            Ok(Ok(b)) => b,
            Ok(Err(err)) => return Err(self.fail(format!("fetch: {:#}", err))),
            Err(_) => return Err(self.fail(format!("fetch timed out after {}ms", self.timeout.as_millis()))),
        };

        let report = RecoveryReport {
            source: source.name().to_string(),
            option_chains: backfill.option_chains.len(),
            oi_rows: backfill.option_chains.iter().map(|b| b.history.len()).sum(),
            sentiment_applied: backfill.sentiment.is_some(),
            elapsed_ms: 0,
        };
        for event in backfill.into_events() {
            if let Err(err) = sink.apply(event) {
                return Err(self.fail(format!("apply: {}", err)));
            }
        }
        if let Err(err) = sink.settle() {
            return Err(self.fail(format!("settle: {}", err)));
        }

        self.readiness.mark_ready();
        let report = RecoveryReport { elapsed_ms: started.elapsed().as_millis() as u64, ..report };
        log(
            Level::Info,
            Domain::Recovery,
            "recovery_ready",
            obj(&[
                ("option_chains", json!(report.option_chains)),
                ("oi_rows", json!(report.oi_rows)),
                ("sentiment_applied", json!(report.sentiment_applied)),
                ("elapsed_ms", json!(report.elapsed_ms)),
            ]),
        );
        Ok(report)
    }

    fn fail(&self, reason: String) -> CoreError {
        self.readiness.mark_degraded(reason.clone());
        log(Level::Error, Domain::Recovery, "recovery_failed", obj(&[("reason", v_str(&reason))]));
        CoreError::RecoveryFailure { reason }
    }
}
