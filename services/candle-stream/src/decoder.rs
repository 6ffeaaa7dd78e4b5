//! Frame Decoder
//!
//! Turns raw capture-layer payloads into [`Tick`] values. The capture layer
//! makes no framing promises, so every field is validated here and nothing
//! downstream sees untyped data.
//!
//! Accepted shapes (UTF-8 JSON):
//! - object: `{"asset": "EURUSD_otc", "price": 1.0842, "timestamp": 1700000000}`
//!   (`symbol`, `value`, `time`/`t` and `volume`/`size`/`amount` are aliases)
//! - positional: `["EURUSD_otc", 1700000000, 1.0842]` with an optional volume
//! - batch: an array of either of the above (see [`FrameDecoder::decode_all`])
//!
//! Malformed payloads are dropped and counted per rejection class.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::debug;
use types::errors::DecodeError;
use types::ids::AssetId;
use types::market::Tick;

/// Timestamps above this are taken to be milliseconds.
const MILLIS_THRESHOLD: f64 = 1e11;

const ASSET_KEYS: &[&str] = &["asset", "symbol"];
const PRICE_KEYS: &[&str] = &["price", "value"];
const TIMESTAMP_KEYS: &[&str] = &["timestamp", "time", "t"];
const VOLUME_KEYS: &[&str] = &["volume", "size", "amount"];

/// Stateless parsing plus per-class rejection counters.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    frames_seen: u64,
    ticks_decoded: u64,
    rejections: BTreeMap<&'static str, u64>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a single-tick payload. `None` means the frame was dropped.
    pub fn decode(&mut self, raw: &[u8]) -> Option<Tick> {
        self.frames_seen += 1;
        match parse_value(raw).and_then(|value| tick_from_value(&value)) {
            Ok(tick) => {
                self.ticks_decoded += 1;
                Some(tick)
            }
            Err(err) => {
                self.reject(&err);
                None
            }
        }
    }

    /// Decode a payload that may carry a batch of ticks.
    ///
    /// Valid elements are returned in payload order; each invalid element is
    /// counted on its own and does not affect its neighbours.
    pub fn decode_all(&mut self, raw: &[u8]) -> Vec<Tick> {
        self.frames_seen += 1;
        let value = match parse_value(raw) {
            Ok(value) => value,
            Err(err) => {
                self.reject(&err);
                return Vec::new();
            }
        };

        let elements: Vec<&Value> = match &value {
            Value::Array(items) if is_batch(items) => items.iter().collect(),
            single => vec![single],
        };

        let mut ticks = Vec::with_capacity(elements.len());
        for element in elements {
            match tick_from_value(element) {
                Ok(tick) => ticks.push(tick),
                Err(err) => self.reject(&err),
            }
        }
        self.ticks_decoded += ticks.len() as u64;
        ticks
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn ticks_decoded(&self) -> u64 {
        self.ticks_decoded
    }

    /// Rejection counts keyed by [`DecodeError::kind`].
    pub fn rejections(&self) -> &BTreeMap<&'static str, u64> {
        &self.rejections
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejections.values().sum()
    }

    fn reject(&mut self, err: &DecodeError) {
        *self.rejections.entry(err.kind()).or_insert(0) += 1;
        debug!(kind = err.kind(), error = %err, "Dropping malformed frame");
    }
}

/// Parse one tick without touching any counters.
pub fn parse_tick(raw: &[u8]) -> Result<Tick, DecodeError> {
    parse_value(raw).and_then(|value| tick_from_value(&value))
}

fn parse_value(raw: &[u8]) -> Result<Value, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::NotUtf8)?;
    serde_json::from_str(text.trim()).map_err(|e| DecodeError::InvalidJson(e.to_string()))
}

fn is_batch(items: &[Value]) -> bool {
    matches!(items.first(), Some(Value::Array(_) | Value::Object(_)))
}

fn tick_from_value(value: &Value) -> Result<Tick, DecodeError> {
    match value {
        Value::Object(map) => tick_from_object(map),
        Value::Array(items) if !is_batch(items) => tick_from_positional(items),
        _ => Err(DecodeError::UnsupportedShape),
    }
}

fn tick_from_object(map: &Map<String, Value>) -> Result<Tick, DecodeError> {
    let asset = lookup(map, ASSET_KEYS).ok_or(DecodeError::MissingField("asset"))?;
    let price = lookup(map, PRICE_KEYS).ok_or(DecodeError::MissingField("price"))?;
    let timestamp =
        lookup(map, TIMESTAMP_KEYS).ok_or(DecodeError::MissingField("timestamp"))?;

    build_tick(asset, price, timestamp, lookup(map, VOLUME_KEYS))
}

fn tick_from_positional(items: &[Value]) -> Result<Tick, DecodeError> {
    match items {
        [asset, timestamp, price] => build_tick(asset, price, timestamp, None),
        [asset, timestamp, price, volume] => build_tick(asset, price, timestamp, Some(volume)),
        _ => Err(DecodeError::UnsupportedShape),
    }
}

fn lookup<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| map.get(*key))
        .filter(|v| !v.is_null())
}

fn build_tick(
    asset: &Value,
    price: &Value,
    timestamp: &Value,
    volume: Option<&Value>,
) -> Result<Tick, DecodeError> {
    let asset = asset
        .as_str()
        .ok_or(DecodeError::MissingField("asset"))
        .and_then(|name| AssetId::try_new(name).ok_or(DecodeError::EmptyAsset))?;

    let price = number(price)
        .filter(|p| p.is_finite() && *p > 0.0)
        .ok_or_else(|| DecodeError::InvalidPrice(price.to_string()))?;

    let timestamp = number(timestamp)
        .filter(|t| t.is_finite() && *t >= 0.0)
        .map(to_unix_seconds)
        .ok_or_else(|| DecodeError::InvalidTimestamp(timestamp.to_string()))?;

    let mut tick = Tick::new(asset, price, timestamp);
    if let Some(raw) = volume {
        match number(raw).filter(|v| v.is_finite() && *v >= 0.0) {
            Some(v) => tick = tick.with_volume(v),
            None => debug!(volume = %raw, "Ignoring invalid volume, using tick volume"),
        }
    }
    Ok(tick)
}

/// Numbers may arrive as JSON numbers or numeric strings.
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn to_unix_seconds(raw: f64) -> i64 {
    let seconds = if raw > MILLIS_THRESHOLD { raw / 1_000.0 } else { raw };
    seconds.floor() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_object() {
        let mut decoder = FrameDecoder::new();
        let tick = decoder
            .decode(br#"{"asset":"EURUSD_otc","price":1.0842,"timestamp":1700000000}"#)
            .unwrap();
        assert_eq!(tick.asset.as_str(), "EURUSD_otc");
        assert_eq!(tick.price, 1.0842);
        assert_eq!(tick.timestamp, 1_700_000_000);
        assert_eq!(tick.volume, 1.0);
        assert_eq!(decoder.ticks_decoded(), 1);
    }

    #[test]
    fn test_decode_object_aliases_and_volume() {
        let mut decoder = FrameDecoder::new();
        let tick = decoder
            .decode(br#"{"symbol":"BTCUSD","value":"43000.5","t":1700000000.75,"size":0.25}"#)
            .unwrap();
        assert_eq!(tick.asset.as_str(), "BTCUSD");
        assert_eq!(tick.price, 43_000.5);
        assert_eq!(tick.timestamp, 1_700_000_000);
        assert_eq!(tick.volume, 0.25);
    }

    #[test]
    fn test_decode_positional() {
        let mut decoder = FrameDecoder::new();
        let tick = decoder.decode(br#"["EURUSD_otc",1700000031,1.001]"#).unwrap();
        assert_eq!(tick.timestamp, 1_700_000_031);
        assert_eq!(tick.price, 1.001);

        let tick = decoder.decode(br#"["EURUSD_otc",1700000031,1.001,5]"#).unwrap();
        assert_eq!(tick.volume, 5.0);
    }

    #[test]
    fn test_millisecond_timestamps_converted() {
        let tick = parse_tick(br#"{"asset":"X","price":1.0,"timestamp":1700000031999}"#).unwrap();
        assert_eq!(tick.timestamp, 1_700_000_031);
    }

    #[test]
    fn test_rejections_counted_by_class() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode(&[0xff, 0xfe]).is_none());
        assert!(decoder.decode(b"{not json").is_none());
        assert!(decoder.decode(br#"{"asset":"X","timestamp":1}"#).is_none());
        assert!(decoder.decode(br#"{"asset":"X","price":-1,"timestamp":1}"#).is_none());
        assert!(decoder.decode(br#"{"asset":"X","price":"NaN","timestamp":1}"#).is_none());
        assert!(decoder.decode(br#"{"asset":"X","price":1,"timestamp":-5}"#).is_none());
        assert!(decoder.decode(br#"{"asset":"  ","price":1,"timestamp":1}"#).is_none());
        assert!(decoder.decode(br#"42"#).is_none());

        let rejections = decoder.rejections();
        assert_eq!(rejections.get("not_utf8"), Some(&1));
        assert_eq!(rejections.get("invalid_json"), Some(&1));
        assert_eq!(rejections.get("missing_field"), Some(&1));
        assert_eq!(rejections.get("invalid_price"), Some(&2));
        assert_eq!(rejections.get("invalid_timestamp"), Some(&1));
        assert_eq!(rejections.get("empty_asset"), Some(&1));
        assert_eq!(rejections.get("unsupported_shape"), Some(&1));
        assert_eq!(decoder.rejected_total(), 8);
        assert_eq!(decoder.frames_seen(), 8);
        assert_eq!(decoder.ticks_decoded(), 0);
    }

    #[test]
    fn test_decode_rejects_batch() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode(br#"[["X",1,1.0],["X",2,1.1]]"#).is_none());
        assert_eq!(decoder.rejections().get("unsupported_shape"), Some(&1));
    }

    #[test]
    fn test_decode_all_batch_keeps_valid_elements() {
        let mut decoder = FrameDecoder::new();
        let ticks = decoder.decode_all(
            br#"[["X",1,1.0],["X",2,"bad"],{"asset":"X","price":1.2,"timestamp":3}]"#,
        );
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].timestamp, 1);
        assert_eq!(ticks[1].timestamp, 3);
        assert_eq!(decoder.rejected_total(), 1);
        assert_eq!(decoder.ticks_decoded(), 2);
    }

    #[test]
    fn test_decode_all_single_frame() {
        let mut decoder = FrameDecoder::new();
        let ticks = decoder.decode_all(br#"["X",1,1.0]"#);
        assert_eq!(ticks.len(), 1);
    }

    #[test]
    fn test_invalid_volume_falls_back_to_tick_volume() {
        let tick = parse_tick(br#"{"asset":"X","price":1.0,"timestamp":1,"volume":-3}"#).unwrap();
        assert_eq!(tick.volume, 1.0);
    }
}
