//! Inbound JSON envelope: `{"type": .., "timestamp": .., "data": {..}}`.
//!
//! Decoding never panics; anything unparseable or missing a required field
//! comes back as `CoreError::MalformedEvent` so the caller can count and drop it.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::*;
use crate::error::CoreError;

pub const CANDLE_UPDATE: &str = "CANDLE_UPDATE";
pub const SENTIMENT_UPDATE: &str = "SENTIMENT_UPDATE";
pub const SCREENER_ALERT: &str = "SCREENER_ALERT";
pub const BACKFILL_DATA: &str = "BACKFILL_DATA";
pub const OPTION_CHAIN_BACKFILL: &str = "OPTION_CHAIN_BACKFILL";
pub const OPTION_CHAIN_UPDATE: &str = "OPTION_CHAIN_UPDATE";
pub const MARKET_UPDATE: &str = "MARKET_UPDATE";

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    timestamp: Option<u64>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct CandleBody {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

#[derive(Debug, Deserialize)]
struct SentimentBody {
    pcr: f64,
    advances: u64,
    declines: u64,
}

#[derive(Debug, Deserialize)]
struct ScreenerBody {
    symbol: String,
    action: String,
    #[serde(default)]
    metrics: Map<String, Value>,
    #[serde(default)]
    timeframe: String,
}

#[derive(Debug, Deserialize)]
struct BackfillRow {
    ts: u64,
    strike: f64,
    ce_oi: f64,
    pe_oi: f64,
    #[serde(default)]
    max_pain: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BackfillBody {
    symbol: String,
    history: Vec<BackfillRow>,
}

#[derive(Debug, Deserialize)]
struct ChainBody {
    symbol: String,
    chain: Vec<ChainRow>,
}

/// Decode one inbound message.
pub fn decode(line: &str) -> Result<Event, CoreError> {
    let env: Envelope = serde_json::from_str(line)
        .map_err(|e| CoreError::malformed(format!("envelope: {}", e)))?;
    decode_envelope(env)
}

/// Decode one raw line as read off the wire. Bytes that are not UTF-8 are
/// malformed like any other bad input.
pub fn decode_bytes(raw: &[u8]) -> Result<Event, CoreError> {
    let line = std::str::from_utf8(raw).map_err(|e| CoreError::malformed(format!("utf-8: {}", e)))?;
    decode(line)
}

/// Decode an already-parsed JSON message.
pub fn decode_value(value: Value) -> Result<Event, CoreError> {
    let env: Envelope = serde_json::from_value(value)
        .map_err(|e| CoreError::malformed(format!("envelope: {}", e)))?;
    decode_envelope(env)
}

fn decode_envelope(env: Envelope) -> Result<Event, CoreError> {
    let data = match env.data {
        Value::Object(map) => map,
        _ => return Err(CoreError::malformed(format!("{}: data is not an object", env.kind))),
    };
    let timestamp = env
        .timestamp
        .or_else(|| data.get("timestamp").and_then(Value::as_u64))
        .ok_or_else(|| CoreError::malformed(format!("{}: missing timestamp", env.kind)))?;

    match env.kind.as_str() {
        CANDLE_UPDATE => decode_candle(data, timestamp),
        SENTIMENT_UPDATE => {
            let body: SentimentBody = from_map(SENTIMENT_UPDATE, data)?;
            if !body.pcr.is_finite() || body.pcr < 0.0 {
                return Err(CoreError::malformed("SENTIMENT_UPDATE: pcr must be finite and >= 0"));
            }
            Ok(Event::Sentiment(SentimentUpdate {
                timestamp,
                pcr: body.pcr,
                advances: body.advances,
                declines: body.declines,
            }))
        }
        SCREENER_ALERT => {
            let body: ScreenerBody = from_map(SCREENER_ALERT, data)?;
            let action = match body.action.to_ascii_uppercase().as_str() {
                "ADD" => AlertAction::Add,
                "REMOVE" => AlertAction::Remove,
                other => {
                    return Err(CoreError::malformed(format!("SCREENER_ALERT: unknown action {}", other)))
                }
            };
            let symbol = require_symbol(SCREENER_ALERT, body.symbol)?;
            Ok(Event::Screener(ScreenerAlert {
                symbol,
                timestamp,
                action,
                metrics: numeric_only(&body.metrics),
                timeframe: body.timeframe,
            }))
        }
        BACKFILL_DATA | OPTION_CHAIN_BACKFILL => {
            let body: BackfillBody = from_map(BACKFILL_DATA, data)?;
            let symbol = require_symbol(BACKFILL_DATA, body.symbol)?;
            if body.history.windows(2).any(|w| w[1].ts < w[0].ts) {
                return Err(CoreError::malformed("BACKFILL_DATA: history is not ordered by ts"));
            }
            let history = body
                .history
                .into_iter()
                .map(|r| OiRow {
                    timestamp: r.ts,
                    strike: r.strike,
                    call_oi: r.ce_oi,
                    put_oi: r.pe_oi,
                    max_pain: r.max_pain,
                })
                .collect();
            Ok(Event::OptionChainBackfill(OptionChainBackfill { symbol, timestamp, history }))
        }
        OPTION_CHAIN_UPDATE => {
            let body: ChainBody = from_map(OPTION_CHAIN_UPDATE, data)?;
            let symbol = require_symbol(OPTION_CHAIN_UPDATE, body.symbol)?;
            Ok(Event::OptionChain(OptionChainUpdate { symbol, timestamp, chain: body.chain }))
        }
        MARKET_UPDATE => {
            let symbol = data
                .get("symbol")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| CoreError::malformed("MARKET_UPDATE: missing symbol"))?;
            let symbol = require_symbol(MARKET_UPDATE, symbol)?;
            let mut fields = Fields::new();
            for (k, v) in &data {
                if k == "symbol" || k == "timestamp" {
                    continue;
                }
                flatten_into(&mut fields, k, v);
            }
            Ok(Event::Market(MarketUpdate { symbol, timestamp, fields }))
        }
        other => Err(CoreError::malformed(format!("unknown message type {}", other))),
    }
}

fn decode_candle(mut data: Map<String, Value>, timestamp: u64) -> Result<Event, CoreError> {
    let symbol = data
        .get("symbol")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CoreError::malformed("CANDLE_UPDATE: missing symbol"))?;
    let symbol = require_symbol(CANDLE_UPDATE, symbol)?;
    let interval = data
        .get("interval")
        .and_then(Value::as_str)
        .unwrap_or("1m")
        .to_string();
    // Bridge format nests OHLCV under "candle"; replay tools send it flat.
    let body_value = match data.remove("candle") {
        Some(nested @ Value::Object(_)) => nested,
        _ => Value::Object(data),
    };
    let body: CandleBody = serde_json::from_value(body_value)
        .map_err(|e| CoreError::malformed(format!("CANDLE_UPDATE: {}", e)))?;
    Ok(Event::Candle(CandleUpdate {
        symbol,
        timestamp,
        open: body.open,
        high: body.high,
        low: body.low,
        close: body.close,
        volume: body.volume,
        interval,
    }))
}

fn from_map<T: for<'de> Deserialize<'de>>(kind: &str, data: Map<String, Value>) -> Result<T, CoreError> {
    serde_json::from_value(Value::Object(data)).map_err(|e| CoreError::malformed(format!("{}: {}", kind, e)))
}

fn require_symbol(kind: &str, symbol: String) -> Result<String, CoreError> {
    let trimmed = symbol.trim();
    if trimmed.is_empty() {
        return Err(CoreError::malformed(format!("{}: empty symbol", kind)));
    }
    Ok(trimmed.to_string())
}

fn numeric_only(map: &Map<String, Value>) -> Fields {
    map.iter()
        .filter_map(|(k, v)| v.as_f64().map(|n| (k.clone(), n)))
        .collect()
}

fn flatten_into(out: &mut Fields, prefix: &str, value: &Value) {
    match value {
        Value::Number(n) => {
            if let Some(x) = n.as_f64() {
                out.insert(prefix.to_string(), x);
            }
        }
        Value::Bool(b) => {
            out.insert(prefix.to_string(), if *b { 1.0 } else { 0.0 });
        }
        Value::Object(map) => {
            for (k, v) in map {
                flatten_into(out, &format!("{}.{}", prefix, k), v);
            }
        }
        _ => {}
    }
}

/// Encode an event in the canonical inbound shape, so journals and generated
/// streams can be replayed through `decode`.
pub fn encode(event: &Event) -> Value {
    let data = match event {
        Event::Candle(c) => json!({
            "symbol": c.symbol,
            "interval": c.interval,
            "candle": {
                "open": c.open,
                "high": c.high,
                "low": c.low,
                "close": c.close,
                "volume": c.volume,
            },
        }),
        Event::Sentiment(s) => json!({
            "pcr": s.pcr,
            "advances": s.advances,
            "declines": s.declines,
        }),
        Event::Screener(a) => json!({
            "symbol": a.symbol,
            "action": a.action.as_str(),
            "metrics": a.metrics,
            "timeframe": a.timeframe,
        }),
        Event::OptionChainBackfill(b) => json!({
            "symbol": b.symbol,
            "history": b.history.iter().map(|r| json!({
                "ts": r.timestamp,
                "strike": r.strike,
                "ce_oi": r.call_oi,
                "pe_oi": r.put_oi,
                "max_pain": r.max_pain,
            })).collect::<Vec<_>>(),
        }),
        Event::OptionChain(c) => json!({
            "symbol": c.symbol,
            "chain": c.chain,
        }),
        Event::Market(m) => {
            let mut data = Map::new();
            data.insert("symbol".to_string(), json!(m.symbol));
            for (k, v) in &m.fields {
                data.insert(k.clone(), json!(v));
            }
            Value::Object(data)
        }
    };
    json!({
        "type": event.kind(),
        "timestamp": event.timestamp(),
        "data": data,
    })
}
