//! Error taxonomy for the decision core.
//!
//! Hot-path failures are values, not panics: a stage that receives one logs
//! it, bumps a counter and moves on to the next event.

use thiserror::Error;

/// Why a screener alert did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertNoop {
    DuplicateAdd,
    AbsentRemove,
}

impl AlertNoop {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertNoop::DuplicateAdd => "duplicate_add",
            AlertNoop::AbsentRemove => "absent_remove",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    #[error("malformed event: {reason}")]
    MalformedEvent { reason: String },

    #[error("out-of-order event on {stream}: last={last} got={got}")]
    OutOfOrderEvent { stream: String, last: u64, got: u64 },

    #[error("pipeline saturated (capacity {capacity})")]
    PipelineSaturated { capacity: usize },

    #[error("pipeline closed")]
    PipelineClosed,

    #[error("recovery failed: {reason}")]
    RecoveryFailure { reason: String },

    #[error("no-op alert for {symbol}: {}", .kind.as_str())]
    UnknownSymbolAlert { symbol: String, kind: AlertNoop },

    #[error("invalid configuration: {reason}")]
    Config { reason: String },
}

impl CoreError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        CoreError::MalformedEvent { reason: reason.into() }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        CoreError::Config { reason: reason.into() }
    }

    /// Stable code used in logs and journal records.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::MalformedEvent { .. } => "MALFORMED_EVENT",
            CoreError::OutOfOrderEvent { .. } => "OUT_OF_ORDER_EVENT",
            CoreError::PipelineSaturated { .. } => "PIPELINE_SATURATED",
            CoreError::PipelineClosed => "PIPELINE_CLOSED",
            CoreError::RecoveryFailure { .. } => "RECOVERY_FAILURE",
            CoreError::UnknownSymbolAlert { .. } => "UNKNOWN_SYMBOL_ALERT",
            CoreError::Config { .. } => "CONFIG",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let e = CoreError::OutOfOrderEvent { stream: "NIFTY".into(), last: 20, got: 10 };
        assert_eq!(e.to_string(), "out-of-order event on NIFTY: last=20 got=10");
        assert_eq!(e.code(), "OUT_OF_ORDER_EVENT");
    }

    #[test]
    fn test_alert_noop_message() {
        let e = CoreError::UnknownSymbolAlert { symbol: "X".into(), kind: AlertNoop::AbsentRemove };
        assert_eq!(e.to_string(), "no-op alert for X: absent_remove");
    }
}
