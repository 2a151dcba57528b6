//! Per-symbol open-interest wall model.
//!
//! Built from option-chain backfill, then kept current by live chain updates.
//! Contextual evidence only: nothing here can veto a decision.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::events::{OiRow, OptionChainBackfill, OptionChainUpdate, Timestamp};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StrikeOi {
    pub strike: f64,
    pub call_oi: f64,
    pub put_oi: f64,
    pub call_oi_delta: f64,
    pub put_oi_delta: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OiWallModel {
    /// Keyed by strike in hundredths so float strikes order and compare exactly.
    strikes: BTreeMap<i64, StrikeOi>,
    supplied_max_pain: Option<f64>,
    updated_at: Option<Timestamp>,
}

fn strike_key(strike: f64) -> i64 {
    (strike * 100.0).round() as i64
}

impl OiWallModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.strikes.is_empty()
    }

    pub fn updated_at(&self) -> Option<Timestamp> {
        self.updated_at
    }

    pub fn strike(&self, strike: f64) -> Option<&StrikeOi> {
        self.strikes.get(&strike_key(strike))
    }

    /// Absolute OI observation; deltas are against the previous observation.
    pub fn apply_row(&mut self, row: &OiRow) {
        let entry = self.strikes.entry(strike_key(row.strike)).or_insert_with(|| StrikeOi {
            strike: row.strike,
            call_oi: row.call_oi,
            put_oi: row.put_oi,
            ..StrikeOi::default()
        });
        entry.call_oi_delta = row.call_oi - entry.call_oi;
        entry.put_oi_delta = row.put_oi - entry.put_oi;
        entry.call_oi = row.call_oi;
        entry.put_oi = row.put_oi;
        if row.max_pain.is_some() {
            self.supplied_max_pain = row.max_pain;
        }
        self.touch(row.timestamp);
    }

    pub fn apply_backfill(&mut self, backfill: &OptionChainBackfill) {
        for row in &backfill.history {
            self.apply_row(row);
        }
    }

    /// Live chain snapshot. Absolute OI wins when present, otherwise the
    /// change is added to what we already hold.
    pub fn apply_chain(&mut self, update: &OptionChainUpdate) {
        for row in &update.chain {
            let entry = self
                .strikes
                .entry(strike_key(row.strike))
                .or_insert_with(|| StrikeOi { strike: row.strike, ..StrikeOi::default() });
            entry.call_oi = row.call_oi.unwrap_or(entry.call_oi + row.call_oi_chg);
            entry.put_oi = row.put_oi.unwrap_or(entry.put_oi + row.put_oi_chg);
            entry.call_oi_delta = row.call_oi_chg;
            entry.put_oi_delta = row.put_oi_chg;
        }
        if !update.chain.is_empty() {
            // Backfilled max pain is stale once live OI moves.
            self.supplied_max_pain = None;
        }
        self.touch(update.timestamp);
    }

    fn touch(&mut self, ts: Timestamp) {
        self.updated_at = Some(self.updated_at.map_or(ts, |prev| prev.max(ts)));
    }

    pub fn total_call_oi(&self) -> f64 {
        self.strikes.values().map(|s| s.call_oi).sum()
    }

    pub fn total_put_oi(&self) -> f64 {
        self.strikes.values().map(|s| s.put_oi).sum()
    }

    pub fn pcr(&self) -> Option<f64> {
        let calls = self.total_call_oi();
        (calls > 0.0).then(|| self.total_put_oi() / calls)
    }

    /// Strike with the largest call OI (resistance).
    pub fn call_wall(&self) -> Option<f64> {
        self.wall(|s| s.call_oi)
    }

    /// Strike with the largest put OI (support).
    pub fn put_wall(&self) -> Option<f64> {
        self.wall(|s| s.put_oi)
    }

    fn wall(&self, oi: impl Fn(&StrikeOi) -> f64) -> Option<f64> {
        self.strikes
            .values()
            .filter(|s| oi(s) > 0.0)
            .fold(None::<&StrikeOi>, |best, s| match best {
                Some(b) if oi(b) >= oi(s) => Some(b),
                _ => Some(s),
            })
            .map(|s| s.strike)
    }

    pub fn max_pain(&self) -> Option<f64> {
        self.supplied_max_pain.or_else(|| self.derived_max_pain())
    }

    /// Expiry strike that minimises total payout to option holders.
    pub fn derived_max_pain(&self) -> Option<f64> {
        let mut best: Option<(f64, f64)> = None;
        for expiry in self.strikes.values() {
            let payout: f64 = self
                .strikes
                .values()
                .map(|s| {
                    s.call_oi * (expiry.strike - s.strike).max(0.0) + s.put_oi * (s.strike - expiry.strike).max(0.0)
                })
                .sum();
            if best.map_or(true, |(_, p)| payout < p) {
                best = Some((expiry.strike, payout));
            }
        }
        best.map(|(strike, _)| strike)
    }

    /// Named model field as seen by step predicates (`oi.<name>`).
    pub fn field(&self, name: &str) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        match name {
            "max_pain" => self.max_pain(),
            "pcr" => self.pcr(),
            "call_wall" => self.call_wall(),
            "put_wall" => self.put_wall(),
            "total_call_oi" => Some(self.total_call_oi()),
            "total_put_oi" => Some(self.total_put_oi()),
            _ => None,
        }
    }
}
