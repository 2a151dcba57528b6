//! Assembly of the decision core.
//!
//! `DecisionCore` runs Regime, Pattern and Gate as pipeline stages on their
//! own threads. `SerialCore` applies the same components in order on the
//! caller's thread, for replay tools and deterministic tests.

use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::config::Config;
use crate::error::CoreError;
use crate::events::{wire, Event, SentimentUpdate, Timestamp};
use crate::gate::{DecisionSink, DispatchMap, GateDecision, GatePolicy, OrderGate};
use crate::journal::WriteBehind;
use crate::logging::{log, log_counters, obj, v_str, Domain, Level};
use crate::metrics::{CoreCounters, CountersSnapshot};
use crate::pattern::{PatternDefinition, PatternEngine, PatternMatch};
use crate::pipeline::{spawn_stage, ConsumerId, RingPipeline, SaturationPolicy, Stage, StageHandle};
use crate::recovery::{BackfillSink, BackfillSource, Readiness, RecoveryCoordinator, RecoveryReport};
use crate::regime::{RegimeLabel, RegimeReader, RegimeSnapshot, RegimeTable, RegimeTracker};

/// Validated inputs shared by both drivers.
#[derive(Debug, Clone)]
pub struct CoreSetup {
    pub config: Config,
    pub table: RegimeTable,
    pub pattern: Arc<PatternDefinition>,
    pub dispatch: DispatchMap,
}

impl CoreSetup {
    pub fn new(
        config: Config,
        table: RegimeTable,
        pattern: PatternDefinition,
        dispatch: DispatchMap,
    ) -> Result<Self, CoreError> {
        config.validate(&table)?;
        pattern.validate()?;
        for label in pattern.regime_config.keys() {
            if !table.contains(&RegimeLabel::new(label.as_str())) {
                return Err(CoreError::config(format!(
                    "pattern {} configures unknown regime {}",
                    pattern.pattern_id, label
                )));
            }
        }
        Ok(Self { config, table, pattern: Arc::new(pattern), dispatch })
    }

    /// Load every configured file, falling back to the built-ins.
    pub fn from_config(config: Config) -> Result<Self> {
        let table = config.load_regime_table()?;
        let pattern = config.load_pattern()?;
        let dispatch = config.load_dispatch_map()?;
        Ok(Self::new(config, table, pattern, dispatch)?)
    }

    fn engine(&self, counters: &Arc<CoreCounters>) -> PatternEngine {
        PatternEngine::new(
            Arc::clone(&self.pattern),
            self.config.rearm_policy,
            self.config.staleness_ms,
            Arc::clone(counters),
        )
    }

    fn gate(&self, regime: RegimeReader, readiness: Readiness, counters: &Arc<CoreCounters>) -> OrderGate {
        let policy = GatePolicy::new(
            &self.config.veto_regimes,
            self.config.allow_unknown_regime,
            self.config.regime_validity,
            &self.pattern,
        );
        OrderGate::new(policy, regime, readiness, self.dispatch.clone(), Arc::clone(counters))
    }

    fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.config.recovery_timeout_ms)
    }
}

/// Per-stream timestamp monotonicity check at ingress. Reports regressions;
/// never reorders or drops.
pub struct OrderingMonitor {
    last: HashMap<String, Timestamp>,
    counters: Arc<CoreCounters>,
}

impl OrderingMonitor {
    pub fn new(counters: Arc<CoreCounters>) -> Self {
        Self { last: HashMap::new(), counters }
    }

    pub fn observe(&mut self, event: &Event) -> Result<(), CoreError> {
        let ts = event.timestamp();
        let stream = event.stream_key();
        match self.last.get_mut(stream) {
            Some(last) if ts < *last => {
                CoreCounters::incr(&self.counters.out_of_order);
                log(
                    Level::Warn,
                    Domain::Ingress,
                    "out_of_order",
                    obj(&[
                        ("symbol", v_str(stream)),
                        ("type", v_str(event.kind())),
                        ("last", json!(*last)),
                        ("got", json!(ts)),
                    ]),
                );
                Err(CoreError::OutOfOrderEvent { stream: stream.to_string(), last: *last, got: ts })
            }
            Some(last) => {
                *last = ts;
                Ok(())
            }
            None => {
                self.last.insert(stream.to_string(), ts);
                Ok(())
            }
        }
    }
}

fn counted(decoded: Result<Event, CoreError>, counters: &CoreCounters) -> Result<Event, CoreError> {
    decoded.map_err(|err| {
        CoreCounters::incr(&counters.malformed);
        log(Level::Warn, Domain::Ingress, "malformed", obj(&[("reason", v_str(&err.to_string()))]));
        err
    })
}

fn apply_sentiment(tracker: &mut RegimeTracker, counters: &CoreCounters, s: &SentimentUpdate) {
    if let Err(err) = tracker.on_sentiment_update(s.pcr, s.advances, s.declines, s.timestamp) {
        CoreCounters::incr(&counters.regime_rejected);
        log(
            Level::Warn,
            Domain::Regime,
            "sentiment_rejected",
            obj(&[("reason", v_str(err.code())), ("detail", v_str(&err.to_string()))]),
        );
    }
}

// =============================================================================
// Serial driver
// =============================================================================

pub struct SerialCore {
    tracker: RegimeTracker,
    engine: PatternEngine,
    gate: OrderGate,
    readiness: Readiness,
    monitor: OrderingMonitor,
    counters: Arc<CoreCounters>,
    journal: WriteBehind,
    recovery_timeout: Duration,
    next_seq: u64,
}

impl SerialCore {
    pub fn new(setup: CoreSetup, counters: Arc<CoreCounters>) -> Self {
        let tracker = RegimeTracker::new(setup.table.clone());
        let readiness = Readiness::new();
        Self {
            engine: setup.engine(&counters),
            gate: setup.gate(tracker.reader(), readiness.clone(), &counters),
            tracker,
            readiness,
            monitor: OrderingMonitor::new(Arc::clone(&counters)),
            journal: WriteBehind::disabled(Arc::clone(&counters)),
            recovery_timeout: setup.recovery_timeout(),
            counters,
            next_seq: 0,
        }
    }

    pub fn with_journal(mut self, journal: WriteBehind) -> Self {
        self.journal = journal;
        self
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    pub fn regime(&self) -> Arc<RegimeSnapshot> {
        self.tracker.get_regime()
    }

    pub fn engine(&self) -> &PatternEngine {
        &self.engine
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    pub async fn recover<S>(&mut self, source: &S) -> Result<RecoveryReport, CoreError>
    where
        S: BackfillSource + ?Sized,
    {
        let coordinator = RecoveryCoordinator::new(self.readiness.clone(), self.recovery_timeout);
        coordinator.recover(source, self).await
    }

    /// Regime and pattern paths only.
    fn apply_state(&mut self, event: &Event) -> Option<PatternMatch> {
        if let Event::Sentiment(s) = event {
            apply_sentiment(&mut self.tracker, &self.counters, s);
        }
        self.engine.on_event(event)
    }

    /// Run one event through regime, pattern and gate, in that order.
    pub fn process(&mut self, event: Event) -> Option<GateDecision> {
        let _ = self.monitor.observe(&event);
        let seq = self.next_seq;
        self.next_seq += 1;
        CoreCounters::incr(&self.counters.published);
        self.journal.record_event(Some(seq), &event);

        let mut m = self.apply_state(&event)?;
        m.source_seq = Some(seq);
        let decision = self.gate.on_pattern_match(&m);
        self.journal.record_decision(&decision);
        Some(decision)
    }

    pub fn process_line(&mut self, line: &str) -> Result<Option<GateDecision>, CoreError> {
        let event = counted(wire::decode(line), &self.counters)?;
        Ok(self.process(event))
    }
}

impl BackfillSink for SerialCore {
    fn apply(&mut self, event: Event) -> Result<(), CoreError> {
        self.journal.record_event(None, &event);
        self.apply_state(&event);
        Ok(())
    }
}

// =============================================================================
// Threaded driver
// =============================================================================

struct RegimeStage {
    tracker: RegimeTracker,
    counters: Arc<CoreCounters>,
}

impl Stage<Event> for RegimeStage {
    fn name(&self) -> &'static str {
        "regime"
    }

    fn on_event(&mut self, _seq: u64, event: &Event) {
        if let Event::Sentiment(s) = event {
            apply_sentiment(&mut self.tracker, &self.counters, s);
        }
    }
}

struct PatternStage {
    engine: PatternEngine,
    matches: RingPipeline<PatternMatch>,
}

impl Stage<Event> for PatternStage {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn on_event(&mut self, seq: u64, event: &Event) {
        let Some(mut m) = self.engine.on_event(event) else { return };
        m.source_seq = Some(seq);
        if let Err(err) = self.matches.publish(m) {
            log(
                Level::Error,
                Domain::Pipeline,
                "match_publish_failed",
                obj(&[("reason", v_str(err.code())), ("seq", json!(seq))]),
            );
        }
    }

    fn on_shutdown(&mut self) {
        self.matches.close();
    }
}

struct GateStage {
    gate: OrderGate,
    input: RingPipeline<Event>,
    regime_consumer: ConsumerId,
    sinks: Vec<Box<dyn DecisionSink>>,
    journal: WriteBehind,
}

impl Stage<PatternMatch> for GateStage {
    fn name(&self) -> &'static str {
        "gate"
    }

    fn on_event(&mut self, _seq: u64, m: &PatternMatch) {
        // Decide against a regime at least as fresh as the triggering event.
        if let Some(source) = m.source_seq {
            self.input.wait_consumed(self.regime_consumer, source, None);
        }
        let decision = self.gate.on_pattern_match(m);
        self.journal.record_decision(&decision);
        for sink in self.sinks.iter_mut() {
            sink.deliver(&decision);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Published(u64),
    /// Held until recovery completes.
    Queued,
}

struct PendingQueue {
    events: VecDeque<Event>,
    holding: bool,
}

/// Totals for one `feed_lines` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedReport {
    pub accepted: u64,
    pub malformed: u64,
    pub rejected: u64,
    /// Input ended on a read error rather than end of stream or stop.
    pub read_failed: bool,
}

pub struct DecisionCore {
    input: RingPipeline<Event>,
    matches: RingPipeline<PatternMatch>,
    stages: Vec<StageHandle>,
    readiness: Readiness,
    regime: RegimeReader,
    counters: Arc<CoreCounters>,
    monitor: Mutex<OrderingMonitor>,
    pending: Mutex<PendingQueue>,
    /// Signalled when held events are released.
    pending_space: Condvar,
    journal: WriteBehind,
    recovery_timeout: Duration,
}

impl DecisionCore {
    /// Spawn the stages. Live events are held until `recover` finishes.
    pub fn start(
        setup: CoreSetup,
        counters: Arc<CoreCounters>,
        sinks: Vec<Box<dyn DecisionSink>>,
        journal: WriteBehind,
    ) -> Result<Self> {
        let capacity = setup.config.pipeline_capacity;
        let input = RingPipeline::new("input", capacity, setup.config.saturation_policy, Arc::clone(&counters));
        // Matches are never rejected: losing one would lose a decision.
        let matches = RingPipeline::new("matches", capacity, SaturationPolicy::Block, Arc::clone(&counters));

        let readiness = Readiness::new();
        let tracker = RegimeTracker::new(setup.table.clone());
        let regime = tracker.reader();
        let gate = setup.gate(regime.clone(), readiness.clone(), &counters);
        let engine = setup.engine(&counters);

        let regime_stage = spawn_stage(&input, RegimeStage { tracker, counters: Arc::clone(&counters) })?;
        let regime_consumer = regime_stage.consumer();
        let gate_stage = spawn_stage(
            &matches,
            GateStage { gate, input: input.clone(), regime_consumer, sinks, journal: journal.clone() },
        )?;
        let pattern_stage = spawn_stage(&input, PatternStage { engine, matches: matches.clone() })?;

        log(
            Level::Info,
            Domain::System,
            "core_start",
            obj(&[
                ("capacity", json!(capacity)),
                ("policy", json!(setup.config.saturation_policy)),
                ("pattern_id", v_str(&setup.pattern.pattern_id)),
                ("steps", json!(setup.pattern.steps.len())),
            ]),
        );

        Ok(Self {
            input,
            matches,
            stages: vec![regime_stage, pattern_stage, gate_stage],
            readiness,
            regime,
            monitor: Mutex::new(OrderingMonitor::new(Arc::clone(&counters))),
            pending: Mutex::new(PendingQueue { events: VecDeque::new(), holding: true }),
            pending_space: Condvar::new(),
            journal,
            recovery_timeout: setup.recovery_timeout(),
            counters,
        })
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    pub fn regime(&self) -> Arc<RegimeSnapshot> {
        self.regime.get_regime()
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    /// Ingress entry point. May block under backpressure.
    ///
    /// Until `recover` finishes, events are held in arrival order, at most
    /// `capacity` of them. A full hold queue follows the saturation policy:
    /// `Block` waits for the release, `Reject` returns `PipelineSaturated`.
    pub fn publish(&self, event: Event) -> Result<Admission, CoreError> {
        let _ = self.monitor.lock().observe(&event);
        let capacity = self.input.capacity();
        let mut pending = self.pending.lock();
        let mut reported = false;
        while pending.holding && pending.events.len() >= capacity {
            if !reported {
                CoreCounters::incr(&self.counters.saturated);
                log(
                    Level::Warn,
                    Domain::Pipeline,
                    "pending_full",
                    obj(&[("capacity", json!(capacity)), ("policy", json!(self.input.policy()))]),
                );
                reported = true;
            }
            match self.input.policy() {
                SaturationPolicy::Reject => return Err(CoreError::PipelineSaturated { capacity }),
                SaturationPolicy::Block => self.pending_space.wait(&mut pending),
            }
        }
        if pending.holding {
            pending.events.push_back(event);
            return Ok(Admission::Queued);
        }
        drop(pending);
        self.admit(event).map(Admission::Published)
    }

    pub fn publish_line(&self, line: &str) -> Result<Admission, CoreError> {
        let event = counted(wire::decode(line), &self.counters)?;
        self.publish(event)
    }

    /// Like `publish_line`, for input that may not be valid UTF-8.
    pub fn publish_bytes(&self, raw: &[u8]) -> Result<Admission, CoreError> {
        let event = counted(wire::decode_bytes(raw), &self.counters)?;
        self.publish(event)
    }

    fn admit(&self, event: Event) -> Result<u64, CoreError> {
        let record = self.journal.is_enabled().then(|| event.clone());
        let seq = self.input.publish(event)?;
        CoreCounters::incr(&self.counters.published);
        if let Some(event) = record {
            self.journal.record_event(Some(seq), &event);
        }
        Ok(seq)
    }

    /// Apply backfill through the regime and pattern stages, flip readiness,
    /// then release held live events in arrival order. On failure the core
    /// stays up in DEGRADED mode and held events are still released.
    pub async fn recover<S>(&self, source: &S) -> Result<RecoveryReport, CoreError>
    where
        S: BackfillSource + ?Sized,
    {
        let coordinator = RecoveryCoordinator::new(self.readiness.clone(), self.recovery_timeout);
        let result = coordinator.recover(source, &mut CoreBackfill { core: self }).await;
        self.release_pending();
        result
    }

    fn release_pending(&self) {
        let mut pending = self.pending.lock();
        if !pending.holding {
            return;
        }
        pending.holding = false;
        let held = pending.events.len();
        while let Some(event) = pending.events.pop_front() {
            if let Err(err) = self.admit(event) {
                log(Level::Error, Domain::Pipeline, "pending_release_failed", obj(&[("reason", v_str(err.code()))]));
            }
        }
        drop(pending);
        // Producers parked on a full hold queue now publish straight through,
        // behind everything released above.
        self.pending_space.notify_all();
        log(Level::Info, Domain::Pipeline, "pending_released", obj(&[("events", json!(held))]));
    }

    /// Block until every admitted event, and every match it produced, has
    /// been fully processed.
    pub fn wait_idle(&self) {
        self.input.wait_drained();
        self.matches.wait_drained();
    }

    /// Stop accepting events, drain everything in flight, join the stages.
    pub fn shutdown(self) -> Result<CountersSnapshot> {
        let held = self.pending.lock().events.len();
        if held > 0 {
            log(Level::Warn, Domain::System, "pending_discarded", obj(&[("events", json!(held))]));
        }
        self.input.close();
        for stage in self.stages {
            let name = stage.name();
            let processed = stage.join()?;
            log(
                Level::Debug,
                Domain::System,
                "stage_joined",
                obj(&[("stage", v_str(name)), ("processed", json!(processed))]),
            );
        }
        self.matches.close();
        let snapshot = self.counters.snapshot();
        log_counters("core_shutdown", &snapshot);
        Ok(snapshot)
    }
}

struct CoreBackfill<'a> {
    core: &'a DecisionCore,
}

impl BackfillSink for CoreBackfill<'_> {
    fn apply(&mut self, event: Event) -> Result<(), CoreError> {
        self.core.admit(event).map(|_| ())
    }

    fn settle(&mut self) -> Result<(), CoreError> {
        self.core.input.wait_drained();
        Ok(())
    }
}

/// Publish newline-delimited JSON events from `reader` until end of input or
/// until `stop` resolves. Bad lines are counted and skipped; a read error ends
/// the feed but is not returned, so the caller can still shut the core down.
///
/// Publishing may block on backpressure, so this must run on a multi-threaded
/// runtime.
pub async fn feed_lines<R, F>(core: &DecisionCore, mut reader: R, stop: F) -> FeedReport
where
    R: AsyncBufRead + Unpin,
    F: Future<Output = ()>,
{
    tokio::pin!(stop);
    let mut report = FeedReport::default();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        tokio::select! {
            _ = &mut stop => {
                log(Level::Info, Domain::Ingress, "feed_stopped", obj(&[("accepted", json!(report.accepted))]));
                break;
            }
            read = reader.read_until(b'\n', &mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err) => {
                        report.read_failed = true;
                        log(Level::Error, Domain::Ingress, "read_failed", obj(&[("reason", v_str(&err.to_string()))]));
                        break;
                    }
                }
                if buf.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match tokio::task::block_in_place(|| core.publish_bytes(&buf)) {
                    Ok(_) => report.accepted += 1,
                    Err(CoreError::MalformedEvent { .. }) => report.malformed += 1,
                    Err(err) => {
                        report.rejected += 1;
                        log(
                            Level::Warn,
                            Domain::Ingress,
                            "publish_failed",
                            obj(&[("reason", v_str(err.code())), ("detail", v_str(&err.to_string()))]),
                        );
                    }
                }
            }
        }
    }
    report
}
