//! Consumer stages: one OS thread per stage, fed by a ring subscription.

use anyhow::{anyhow, Result};
use serde_json::json;
use std::thread::{self, JoinHandle};

use super::ring::{ConsumerId, RingPipeline};
use crate::logging::{log, obj, v_str, Domain, Level, ProfileScope};

/// A pipeline consumer. Called with events in strict publication order.
pub trait Stage<T>: Send + 'static {
    fn name(&self) -> &'static str;

    fn on_event(&mut self, seq: u64, event: &T);

    /// Runs once after the ring is closed and drained.
    fn on_shutdown(&mut self) {}
}

pub struct StageHandle {
    name: &'static str,
    consumer: ConsumerId,
    handle: JoinHandle<u64>,
}

impl StageHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Cursor of this stage on its input ring.
    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    /// Wait for the stage to drain; returns how many events it processed.
    pub fn join(self) -> Result<u64> {
        self.handle
            .join()
            .map_err(|_| anyhow!("stage {} panicked", self.name))
    }
}

/// Subscribe `stage` to `ring` and run it on its own thread. The subscription
/// is taken before the thread starts, so no event published after this call
/// returns can be missed.
pub fn spawn_stage<T, S>(ring: &RingPipeline<T>, mut stage: S) -> Result<StageHandle>
where
    T: Send + Sync + 'static,
    S: Stage<T>,
{
    let mut sub = ring.subscribe();
    let consumer = sub.id();
    let name = stage.name();
    let handle = thread::Builder::new()
        .name(format!("stage-{}", name))
        .spawn(move || {
            log(Level::Debug, Domain::Pipeline, "stage_start", obj(&[("stage", v_str(name))]));
            let mut processed = 0u64;
            while let Some((seq, event)) = sub.next() {
                let _scope = ProfileScope::with_context(name, &[("seq", json!(seq))]);
                stage.on_event(seq, &event);
                sub.finish();
                processed += 1;
            }
            stage.on_shutdown();
            log(
                Level::Debug,
                Domain::Pipeline,
                "stage_stop",
                obj(&[("stage", v_str(name)), ("processed", json!(processed))]),
            );
            processed
        })?;
    Ok(StageHandle { name, consumer, handle })
}
