//! Tick and candle value types
//!
//! A [`Tick`] is a single price observation; a [`Candle`] folds every tick
//! whose timestamp falls into the same [`Timeframe`] boundary.
//!
//! Boundaries are aligned to the Unix epoch:
//! `boundary = floor(timestamp / timeframe) * timeframe`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::ids::AssetId;

/// Candle interval length in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Timeframe(u32);

impl Timeframe {
    pub const S5: Timeframe = Timeframe(5);
    pub const S30: Timeframe = Timeframe(30);
    pub const M1: Timeframe = Timeframe(60);
    pub const M5: Timeframe = Timeframe(300);
    pub const H1: Timeframe = Timeframe(3_600);

    /// Create a timeframe, rejecting zero-length intervals.
    pub fn from_seconds(seconds: u32) -> Result<Self, ConfigError> {
        if seconds == 0 {
            return Err(ConfigError::InvalidTimeframe(seconds));
        }
        Ok(Self(seconds))
    }

    pub fn seconds(&self) -> u32 {
        self.0
    }

    /// Align a timestamp (seconds) to this timeframe's boundary (floor).
    ///
    /// Euclidean division keeps pre-epoch timestamps flooring downward.
    pub fn boundary(&self, timestamp_seconds: i64) -> i64 {
        let duration = i64::from(self.0);
        timestamp_seconds.div_euclid(duration) * duration
    }

    /// Compact label used in chunk file names (`30s`, `1m`, `4h`).
    pub fn label(&self) -> String {
        match self.0 {
            s if s % 3_600 == 0 => format!("{}h", s / 3_600),
            s if s % 60 == 0 => format!("{}m", s / 60),
            s => format!("{}s", s),
        }
    }
}

impl TryFrom<u32> for Timeframe {
    type Error = ConfigError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_seconds(value)
    }
}

impl From<Timeframe> for u32 {
    fn from(value: Timeframe) -> Self {
        value.0
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A single normalized price observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub asset: AssetId,
    pub price: f64,
    /// Unix seconds.
    pub timestamp: i64,
    /// Traded size when the feed reports one, otherwise `1.0` (tick volume).
    pub volume: f64,
}

impl Tick {
    pub fn new(asset: AssetId, price: f64, timestamp: i64) -> Self {
        Self {
            asset,
            price,
            timestamp,
            volume: 1.0,
        }
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = volume;
        self
    }

    /// UTC wall-clock time of this tick.
    pub fn time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }
}

/// A single OHLCV candle.
///
/// Identity is `(asset, timeframe, boundary)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub asset: AssetId,
    pub timeframe: Timeframe,
    /// Start of the interval in Unix seconds.
    pub boundary: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Open a candle from the first tick of its boundary.
    pub fn open_from(tick: &Tick, timeframe: Timeframe) -> Self {
        Self {
            asset: tick.asset.clone(),
            timeframe,
            boundary: timeframe.boundary(tick.timestamp),
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.volume,
        }
    }

    /// Fold a tick that belongs to this candle's boundary.
    pub fn apply(&mut self, price: f64, volume: f64) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += volume;
    }

    /// First second after this candle's interval.
    pub fn end(&self) -> i64 {
        self.boundary + i64::from(self.timeframe.seconds())
    }

    /// UTC wall-clock time of the boundary.
    pub fn time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.boundary, 0)
    }

    /// Validate candle integrity (OHLC ordering, finite values).
    pub fn is_valid(&self) -> bool {
        let finite = [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite());
        finite
            && self.low <= self.open
            && self.low <= self.close
            && self.high >= self.open
            && self.high >= self.close
            && self.volume >= 0.0
            && self.boundary == self.timeframe.boundary(self.boundary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(price: f64, ts: i64) -> Tick {
        Tick::new(AssetId::new("EURUSD"), price, ts)
    }

    #[test]
    fn test_timeframe_rejects_zero() {
        assert!(Timeframe::from_seconds(0).is_err());
        assert_eq!(Timeframe::from_seconds(30).unwrap(), Timeframe::S30);
    }

    #[test]
    fn test_boundary_alignment() {
        let tf = Timeframe::S30;
        assert_eq!(tf.boundary(0), 0);
        assert_eq!(tf.boundary(29), 0);
        assert_eq!(tf.boundary(30), 30);
        assert_eq!(tf.boundary(31), 30);
        assert_eq!(Timeframe::M1.boundary(1_700_000_059), 1_700_000_040);
    }

    #[test]
    fn test_boundary_floors_negative_timestamps() {
        assert_eq!(Timeframe::S30.boundary(-1), -30);
    }

    #[test]
    fn test_timeframe_labels() {
        assert_eq!(Timeframe::S5.label(), "5s");
        assert_eq!(Timeframe::M5.label(), "5m");
        assert_eq!(Timeframe::H1.label(), "1h");
        assert_eq!(Timeframe::from_seconds(90).unwrap().label(), "90s");
    }

    #[test]
    fn test_timeframe_deserialize_validates() {
        let ok: Timeframe = serde_json::from_str("60").unwrap();
        assert_eq!(ok, Timeframe::M1);
        assert!(serde_json::from_str::<Timeframe>("0").is_err());
    }

    #[test]
    fn test_candle_open_from_tick() {
        let candle = Candle::open_from(&tick(1.0, 15), Timeframe::S30);
        assert_eq!(candle.boundary, 0);
        assert_eq!(candle.open, 1.0);
        assert_eq!(candle.high, 1.0);
        assert_eq!(candle.low, 1.0);
        assert_eq!(candle.close, 1.0);
        assert_eq!(candle.volume, 1.0);
        assert_eq!(candle.end(), 30);
        assert!(candle.is_valid());
    }

    #[test]
    fn test_candle_apply() {
        let mut candle = Candle::open_from(&tick(1.000, 0), Timeframe::S30);
        candle.apply(1.002, 1.0); // New high
        candle.apply(0.998, 1.0); // New low
        candle.apply(1.001, 2.0); // Close

        assert_eq!(candle.open, 1.000);
        assert_eq!(candle.high, 1.002);
        assert_eq!(candle.low, 0.998);
        assert_eq!(candle.close, 1.001);
        assert_eq!(candle.volume, 5.0);
        assert!(candle.is_valid());
    }

    #[test]
    fn test_candle_integrity_validation() {
        let mut invalid = Candle::open_from(&tick(1.0, 0), Timeframe::S30);
        invalid.high = 0.5; // High < Open
        assert!(!invalid.is_valid());

        let mut misaligned = Candle::open_from(&tick(1.0, 0), Timeframe::S30);
        misaligned.boundary = 7;
        assert!(!misaligned.is_valid());
    }

    #[test]
    fn test_tick_time() {
        let t = tick(1.0, 1_700_000_000);
        assert_eq!(t.time().unwrap().timestamp(), 1_700_000_000);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_boundary_contains_timestamp(ts in -1_000_000_000i64..4_000_000_000, secs in 1u32..86_400) {
                let tf = Timeframe::from_seconds(secs).unwrap();
                let b = tf.boundary(ts);
                prop_assert!(b <= ts);
                prop_assert!(ts < b + i64::from(secs));
                prop_assert_eq!(b.rem_euclid(i64::from(secs)), 0);
                prop_assert_eq!(tf.boundary(b), b);
            }

            #[test]
            fn prop_folded_candle_stays_valid(prices in prop::collection::vec(0.01f64..1_000.0, 1..64)) {
                let mut candle = Candle::open_from(&tick(prices[0], 0), Timeframe::M1);
                for &p in &prices[1..] {
                    candle.apply(p, 1.0);
                }
                prop_assert!(candle.is_valid());
                prop_assert_eq!(candle.close, *prices.last().unwrap());
                prop_assert_eq!(candle.volume, prices.len() as f64);
            }
        }
    }
}
