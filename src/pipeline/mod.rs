//! Ordered event conduit between ingress and the decision stages.

pub mod ring;
pub mod stage;

pub use ring::{ConsumerId, RingPipeline, SaturationPolicy, Subscription};
pub use stage::{spawn_stage, Stage, StageHandle};
