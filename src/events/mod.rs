//! Canonical typed events consumed by the decision core.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod wire;

/// Timestamp in epoch milliseconds
pub type Timestamp = u64;

/// Evaluable numeric fields of a market observation, keyed by dotted name.
pub type Fields = BTreeMap<String, f64>;

/// Stream key used for ordering checks on events that carry no symbol.
pub const SENTIMENT_STREAM: &str = "sentiment";

/// All events that can affect core state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    Candle(CandleUpdate),
    Sentiment(SentimentUpdate),
    Screener(ScreenerAlert),
    OptionChainBackfill(OptionChainBackfill),
    OptionChain(OptionChainUpdate),
    Market(MarketUpdate),
}

impl Event {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Event::Candle(e) => e.timestamp,
            Event::Sentiment(e) => e.timestamp,
            Event::Screener(e) => e.timestamp,
            Event::OptionChainBackfill(e) => e.timestamp,
            Event::OptionChain(e) => e.timestamp,
            Event::Market(e) => e.timestamp,
        }
    }

    pub fn symbol(&self) -> Option<&str> {
        match self {
            Event::Candle(e) => Some(&e.symbol),
            Event::Sentiment(_) => None,
            Event::Screener(e) => Some(&e.symbol),
            Event::OptionChainBackfill(e) => Some(&e.symbol),
            Event::OptionChain(e) => Some(&e.symbol),
            Event::Market(e) => Some(&e.symbol),
        }
    }

    /// Key under which per-stream timestamp monotonicity is tracked.
    pub fn stream_key(&self) -> &str {
        self.symbol().unwrap_or(SENTIMENT_STREAM)
    }

    /// Wire `type` tag of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Candle(_) => wire::CANDLE_UPDATE,
            Event::Sentiment(_) => wire::SENTIMENT_UPDATE,
            Event::Screener(_) => wire::SCREENER_ALERT,
            Event::OptionChainBackfill(_) => wire::BACKFILL_DATA,
            Event::OptionChain(_) => wire::OPTION_CHAIN_UPDATE,
            Event::Market(_) => wire::MARKET_UPDATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleUpdate {
    pub symbol: String,
    pub timestamp: Timestamp,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub interval: String,
}

impl CandleUpdate {
    /// Candle as evaluable fields for pattern steps.
    pub fn fields(&self) -> Fields {
        let mut f = Fields::new();
        f.insert("open".to_string(), self.open);
        f.insert("high".to_string(), self.high);
        f.insert("low".to_string(), self.low);
        f.insert("close".to_string(), self.close);
        f.insert("volume".to_string(), self.volume);
        f
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentUpdate {
    pub timestamp: Timestamp,
    pub pcr: f64,
    pub advances: u64,
    pub declines: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertAction {
    Add,
    Remove,
}

impl AlertAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertAction::Add => "ADD",
            AlertAction::Remove => "REMOVE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenerAlert {
    pub symbol: String,
    pub timestamp: Timestamp,
    pub action: AlertAction,
    pub metrics: Fields,
    pub timeframe: String,
}

/// One historical open-interest observation for a strike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OiRow {
    pub timestamp: Timestamp,
    pub strike: f64,
    pub call_oi: f64,
    pub put_oi: f64,
    pub max_pain: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionChainBackfill {
    pub symbol: String,
    pub timestamp: Timestamp,
    /// Ordered by `OiRow::timestamp`, oldest first.
    pub history: Vec<OiRow>,
}

/// One strike of a live option-chain snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRow {
    pub strike: f64,
    pub call_oi: Option<f64>,
    pub put_oi: Option<f64>,
    pub call_oi_chg: f64,
    pub put_oi_chg: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionChainUpdate {
    pub symbol: String,
    pub timestamp: Timestamp,
    pub chain: Vec<ChainRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketUpdate {
    pub symbol: String,
    pub timestamp: Timestamp,
    pub fields: Fields,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentiment_uses_shared_stream() {
        let e = Event::Sentiment(SentimentUpdate { timestamp: 5, pcr: 1.0, advances: 1, declines: 1 });
        assert_eq!(e.symbol(), None);
        assert_eq!(e.stream_key(), SENTIMENT_STREAM);
        assert_eq!(e.timestamp(), 5);
        assert_eq!(e.kind(), "SENTIMENT_UPDATE");
    }

    #[test]
    fn test_candle_fields() {
        let c = CandleUpdate {
            symbol: "SBIN".into(),
            timestamp: 1,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 100.0,
            interval: "1m".into(),
        };
        let f = c.fields();
        assert_eq!(f["close"], 1.5);
        assert_eq!(f["volume"], 100.0);
        assert_eq!(f.len(), 5);
    }
}
