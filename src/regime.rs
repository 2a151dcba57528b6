//! Global market-regime tracking from sentiment/breadth updates.
//!
//! The tracker is the single writer of the regime value. Everyone else holds a
//! `RegimeReader`, which hands out whole immutable snapshots (`ArcSwap`), so a
//! reader never observes a half-applied update.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::error::CoreError;
use crate::events::{Timestamp, SENTIMENT_STREAM};
use crate::logging::log_regime_change;

/// Sentinel label before the regime becomes valid.
pub const UNKNOWN: &str = "UNKNOWN";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegimeLabel(String);

impl RegimeLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into().trim().to_ascii_uppercase())
    }

    pub fn unknown() -> Self {
        Self(UNKNOWN.to_string())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One threshold band. All present bounds are strict and must hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeBand {
    pub label: String,
    #[serde(default)]
    pub pcr_below: Option<f64>,
    #[serde(default)]
    pub pcr_above: Option<f64>,
    #[serde(default)]
    pub ratio_above: Option<f64>,
    #[serde(default)]
    pub ratio_below: Option<f64>,
}

impl RegimeBand {
    fn matches(&self, pcr: f64, ratio: f64) -> bool {
        self.pcr_below.map_or(true, |t| pcr < t)
            && self.pcr_above.map_or(true, |t| pcr > t)
            && self.ratio_above.map_or(true, |t| ratio > t)
            && self.ratio_below.map_or(true, |t| ratio < t)
    }
}

/// Ordered first-match table from `(pcr, advance/decline ratio)` to a label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeTable {
    pub bands: Vec<RegimeBand>,
    /// Label when no band matches.
    pub fallback: String,
}

impl RegimeTable {
    pub const LABEL_COUNT: usize = 7;

    /// Thresholds used by the upstream data bridge.
    pub fn standard() -> Self {
        let band = |label: &str, pcr_below, pcr_above, ratio_above, ratio_below| RegimeBand {
            label: label.to_string(),
            pcr_below,
            pcr_above,
            ratio_above,
            ratio_below,
        };
        Self {
            bands: vec![
                band("COMPLETE_BULLISH", Some(0.8), None, Some(1.5), None),
                band("BULLISH", Some(0.9), None, Some(1.2), None),
                band("SIDEWAYS_BULLISH", Some(1.0), None, Some(1.0), None),
                band("COMPLETE_BEARISH", None, Some(1.2), None, Some(0.7)),
                band("BEARISH", None, Some(1.1), None, Some(0.9)),
                band("SIDEWAYS_BEARISH", None, Some(1.0), None, Some(1.0)),
            ],
            fallback: "SIDEWAYS".to_string(),
        }
    }

    pub fn from_path(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("read regime table {}", path))?;
        let table: RegimeTable =
            serde_json::from_str(&raw).with_context(|| format!("parse regime table {}", path))?;
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let labels = self.labels();
        let distinct: HashSet<&RegimeLabel> = labels.iter().collect();
        if distinct.len() != Self::LABEL_COUNT {
            return Err(CoreError::config(format!(
                "regime table must define {} distinct labels, found {}",
                Self::LABEL_COUNT,
                distinct.len()
            )));
        }
        if distinct.iter().any(|l| l.is_unknown()) {
            return Err(CoreError::config(format!("{} is reserved", UNKNOWN)));
        }
        Ok(())
    }

    /// Band labels in table order, then the fallback.
    pub fn labels(&self) -> Vec<RegimeLabel> {
        self.bands
            .iter()
            .map(|b| RegimeLabel::new(b.label.as_str()))
            .chain(std::iter::once(RegimeLabel::new(self.fallback.as_str())))
            .collect()
    }

    pub fn contains(&self, label: &RegimeLabel) -> bool {
        self.labels().iter().any(|l| l == label)
    }

    /// Pure classification of one observation.
    pub fn classify(&self, pcr: f64, advances: u64, declines: u64) -> RegimeLabel {
        let ratio = breadth_ratio(advances, declines);
        self.bands
            .iter()
            .find(|b| b.matches(pcr, ratio))
            .map(|b| RegimeLabel::new(b.label.as_str()))
            .unwrap_or_else(|| RegimeLabel::new(self.fallback.as_str()))
    }
}

impl Default for RegimeTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Advance/decline ratio; with no declines the advance count stands in.
pub fn breadth_ratio(advances: u64, declines: u64) -> f64 {
    if declines > 0 {
        advances as f64 / declines as f64
    } else {
        advances as f64
    }
}

/// Immutable view of the global regime.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegimeSnapshot {
    pub label: RegimeLabel,
    pub pcr: f64,
    pub advances: u64,
    pub declines: u64,
    pub updated_at: Option<Timestamp>,
}

impl RegimeSnapshot {
    pub fn unknown() -> Self {
        Self {
            label: RegimeLabel::unknown(),
            pcr: 0.0,
            advances: 0,
            declines: 0,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegimeUpdate {
    Changed { from: RegimeLabel, to: RegimeLabel },
    Refreshed,
    Duplicate,
}

/// Read side of the regime. Cloneable; never blocks.
#[derive(Debug, Clone)]
pub struct RegimeReader {
    current: Arc<ArcSwap<RegimeSnapshot>>,
}

impl RegimeReader {
    pub fn get_regime(&self) -> Arc<RegimeSnapshot> {
        self.current.load_full()
    }

    /// Reader pinned to a fixed snapshot.
    pub fn fixed(snapshot: RegimeSnapshot) -> Self {
        Self { current: Arc::new(ArcSwap::from_pointee(snapshot)) }
    }
}

/// Write side of the regime. Not `Clone`: exactly one owner.
#[derive(Debug)]
pub struct RegimeTracker {
    table: RegimeTable,
    current: Arc<ArcSwap<RegimeSnapshot>>,
}

impl RegimeTracker {
    pub fn new(table: RegimeTable) -> Self {
        Self {
            table,
            current: Arc::new(ArcSwap::from_pointee(RegimeSnapshot::unknown())),
        }
    }

    pub fn reader(&self) -> RegimeReader {
        RegimeReader { current: Arc::clone(&self.current) }
    }

    pub fn get_regime(&self) -> Arc<RegimeSnapshot> {
        self.current.load_full()
    }

    /// Reclassify from one sentiment observation. Older-than-current updates
    /// are rejected; an identical repeat is a no-op.
    pub fn on_sentiment_update(
        &mut self,
        pcr: f64,
        advances: u64,
        declines: u64,
        timestamp: Timestamp,
    ) -> Result<RegimeUpdate, CoreError> {
        let prev = self.current.load_full();
        if let Some(last) = prev.updated_at {
            if timestamp < last {
                return Err(CoreError::OutOfOrderEvent {
                    stream: SENTIMENT_STREAM.to_string(),
                    last,
                    got: timestamp,
                });
            }
            if timestamp == last && prev.pcr == pcr && prev.advances == advances && prev.declines == declines {
                return Ok(RegimeUpdate::Duplicate);
            }
        }

        let label = self.table.classify(pcr, advances, declines);
        let next = RegimeSnapshot {
            label: label.clone(),
            pcr,
            advances,
            declines,
            updated_at: Some(timestamp),
        };
        self.current.store(Arc::new(next));

        if label != prev.label {
            log_regime_change(prev.label.as_str(), label.as_str(), pcr, advances, declines, timestamp);
            Ok(RegimeUpdate::Changed { from: prev.label.clone(), to: label })
        } else {
            Ok(RegimeUpdate::Refreshed)
        }
    }
}
