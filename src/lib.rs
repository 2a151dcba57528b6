//! Signal-to-order decision core.
//!
//! Market, sentiment, screener and option-chain events flow through a
//! bounded pipeline into a regime tracker and per-symbol pattern machines;
//! completed patterns are checked against the current regime and readiness
//! before they become trade intents.

pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod gate;
pub mod journal;
pub mod logging;
pub mod metrics;
pub mod pattern;
pub mod pipeline;
pub mod recovery;
pub mod regime;

pub use crate::config::Config;
pub use crate::driver::{Admission, CoreSetup, DecisionCore, FeedReport, OrderingMonitor, SerialCore};
pub use crate::error::CoreError;
