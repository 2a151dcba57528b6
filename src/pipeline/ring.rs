//! Bounded multi-consumer ring.
//!
//! Every subscriber sees every event published after it subscribed, once, in
//! publication order. A slot is reusable only after the slowest subscriber has
//! finished with it, so capacity bounds outstanding work rather than memory
//! alone.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::CoreError;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::metrics::CoreCounters;
use serde_json::json;

/// What `publish` does when the ring is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaturationPolicy {
    /// Producer waits for the slowest consumer.
    Block,
    /// Producer gets `PipelineSaturated` back.
    Reject,
}

impl FromStr for SaturationPolicy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(SaturationPolicy::Block),
            "reject" => Ok(SaturationPolicy::Reject),
            other => Err(CoreError::config(format!("unknown saturation policy: {}", other))),
        }
    }
}

/// Handle identifying one subscriber's cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(usize);

struct RingState<T> {
    slots: Vec<Option<Arc<T>>>,
    /// Next sequence to be published.
    head: u64,
    /// Next sequence each consumer will finish; `None` once detached.
    cursors: Vec<Option<u64>>,
    closed: bool,
}

impl<T> RingState<T> {
    fn outstanding(&self) -> u64 {
        self.cursors
            .iter()
            .flatten()
            .min()
            .map(|slowest| self.head - slowest)
            .unwrap_or(0)
    }
}

struct Shared<T> {
    name: &'static str,
    capacity: usize,
    policy: SaturationPolicy,
    counters: Arc<CoreCounters>,
    state: Mutex<RingState<T>>,
    /// Signalled on publish and close.
    readable: Condvar,
    /// Signalled when any cursor advances, detaches, or on close.
    progress: Condvar,
}

pub struct RingPipeline<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for RingPipeline<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T: Send + Sync + 'static> RingPipeline<T> {
    pub fn new(
        name: &'static str,
        capacity: usize,
        policy: SaturationPolicy,
        counters: Arc<CoreCounters>,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                name,
                capacity,
                policy,
                counters,
                state: Mutex::new(RingState {
                    slots: (0..capacity).map(|_| None).collect(),
                    head: 0,
                    cursors: Vec::new(),
                    closed: false,
                }),
                readable: Condvar::new(),
                progress: Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn policy(&self) -> SaturationPolicy {
        self.shared.policy
    }

    /// Events published but not yet finished by the slowest consumer.
    pub fn outstanding(&self) -> u64 {
        self.shared.state.lock().outstanding()
    }

    /// Sequence the next publish will get.
    pub fn head(&self) -> u64 {
        self.shared.state.lock().head
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Register a consumer starting at the current head.
    pub fn subscribe(&self) -> Subscription<T> {
        let mut st = self.shared.state.lock();
        let id = st.cursors.len();
        let head = st.head;
        st.cursors.push(Some(head));
        Subscription {
            shared: Arc::clone(&self.shared),
            id: ConsumerId(id),
            in_hand: false,
        }
    }

    /// Append an event, returning its sequence number.
    pub fn publish(&self, event: T) -> Result<u64, CoreError> {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        let mut reported = false;
        loop {
            if st.closed {
                return Err(CoreError::PipelineClosed);
            }
            if st.outstanding() < shared.capacity as u64 {
                break;
            }
            if !reported {
                CoreCounters::incr(&shared.counters.saturated);
                log(
                    Level::Warn,
                    Domain::Pipeline,
                    "saturated",
                    obj(&[
                        ("ring", v_str(shared.name)),
                        ("capacity", json!(shared.capacity)),
                        ("policy", json!(shared.policy)),
                    ]),
                );
                reported = true;
            }
            match shared.policy {
                SaturationPolicy::Reject => {
                    return Err(CoreError::PipelineSaturated { capacity: shared.capacity });
                }
                SaturationPolicy::Block => shared.progress.wait(&mut st),
            }
        }

        let seq = st.head;
        let idx = (seq % shared.capacity as u64) as usize;
        st.slots[idx] = Some(Arc::new(event));
        st.head += 1;
        drop(st);
        shared.readable.notify_all();
        Ok(seq)
    }

    /// Block until `consumer` has finished processing `seq`, the consumer
    /// detaches, or `timeout` elapses. Returns whether `seq` was consumed.
    pub fn wait_consumed(&self, consumer: ConsumerId, seq: u64, timeout: Option<Duration>) -> bool {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        loop {
            match st.cursors.get(consumer.0).copied().flatten() {
                Some(cursor) if cursor > seq => return true,
                Some(_) => {}
                None => return false,
            }
            match timeout {
                Some(t) => {
                    if shared.progress.wait_for(&mut st, t).timed_out() {
                        return false;
                    }
                }
                None => shared.progress.wait(&mut st),
            }
        }
    }

    /// Block until every attached consumer has finished every published event.
    pub fn wait_drained(&self) {
        let shared = &self.shared;
        let mut st = shared.state.lock();
        while st.outstanding() > 0 {
            shared.progress.wait(&mut st);
        }
    }

    /// Stop accepting publishes. Consumers drain what is left, then see `None`.
    pub fn close(&self) {
        let mut st = self.shared.state.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        let head = st.head;
        drop(st);
        self.shared.readable.notify_all();
        self.shared.progress.notify_all();
        log(
            Level::Info,
            Domain::Pipeline,
            "closed",
            obj(&[("ring", v_str(self.shared.name)), ("published", json!(head))]),
        );
    }
}

/// One consumer's view of the ring. The event returned by `next` stays
/// reserved until `finish`, the following `next`, or drop.
pub struct Subscription<T> {
    shared: Arc<Shared<T>>,
    id: ConsumerId,
    in_hand: bool,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Release the event last returned by `next`.
    pub fn finish(&mut self) {
        if !self.in_hand {
            return;
        }
        let mut st = self.shared.state.lock();
        if let Some(Some(cursor)) = st.cursors.get_mut(self.id.0) {
            *cursor += 1;
        }
        self.in_hand = false;
        drop(st);
        self.shared.progress.notify_all();
    }

    /// Next event in publication order; `None` once closed and drained.
    /// Implicitly finishes the previous event.
    pub fn next(&mut self) -> Option<(u64, Arc<T>)> {
        self.finish();
        let shared = &self.shared;
        let mut st = shared.state.lock();
        loop {
            let cursor = match st.cursors.get(self.id.0).copied().flatten() {
                Some(c) => c,
                None => return None,
            };
            if cursor < st.head {
                let idx = (cursor % shared.capacity as u64) as usize;
                let event = st.slots[idx].clone()?;
                self.in_hand = true;
                return Some((cursor, event));
            }
            if st.closed {
                return None;
            }
            shared.readable.wait(&mut st);
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let mut st = self.shared.state.lock();
        if let Some(slot) = st.cursors.get_mut(self.id.0) {
            *slot = None;
        }
        drop(st);
        self.shared.progress.notify_all();
    }
}
