//! Deterministic tick replay
//!
//! Feeds a recorded tick sequence through a fresh [`CandleAggregator`] and
//! fingerprints the resulting candle sequence with SHA-256. Replaying the
//! same ticks twice must produce the same checksum.

use std::time::Instant;

use sha2::{Digest, Sha256};
use tracing::{error, info};
use types::ids::AssetId;
use types::market::{Candle, Tick, Timeframe};

use crate::candles::{CandleAggregator, IngestOutcome};

#[derive(Debug, Clone)]
pub struct ReplayMetrics {
    pub ticks_replayed: u64,
    pub duration_ms: u128,
    pub ticks_per_second: f64,
    /// SHA-256 over closed candles followed by the trailing candle.
    pub checksum: String,
}

#[derive(Debug, Clone)]
pub struct ReplayResult {
    /// Candles closed during replay, in boundary order.
    pub closed: Vec<Candle>,
    /// Candle still in progress after the last tick.
    pub current: Option<Candle>,
    pub stale_ticks: u64,
    pub filtered_ticks: u64,
    pub metrics: ReplayMetrics,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("candle checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, Default)]
pub struct ReplayEngine {
    expected_checksum: Option<String>,
}

impl ReplayEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the replay unless it reproduces this checksum.
    pub fn with_expected_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.expected_checksum = Some(checksum.into());
        self
    }

    pub fn replay(
        &self,
        asset: &AssetId,
        timeframe: Timeframe,
        ticks: &[Tick],
    ) -> Result<ReplayResult, ReplayError> {
        let start = Instant::now();
        info!(asset = %asset, timeframe = %timeframe, tick_count = ticks.len(), "Starting tick replay");

        let mut aggregator = CandleAggregator::new(asset.clone(), timeframe);
        let mut closed = Vec::new();

        for tick in ticks {
            if let IngestOutcome::Updated {
                closed: Some(candle),
                ..
            } = aggregator.ingest(tick)
            {
                closed.push(candle);
            }
        }

        let current = aggregator.current().cloned();
        let checksum = candle_checksum(closed.iter().chain(current.iter()));

        let elapsed = start.elapsed();
        let ticks_per_second = if elapsed.as_secs_f64() > 0.0 {
            ticks.len() as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        if let Some(expected) = &self.expected_checksum {
            if *expected != checksum {
                error!(expected = %expected, actual = %checksum, "Replay checksum mismatch");
                return Err(ReplayError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual: checksum,
                });
            }
        }

        info!(
            closed = closed.len(),
            stale = aggregator.stale_ticks(),
            checksum = %checksum,
            "Tick replay complete"
        );

        Ok(ReplayResult {
            closed,
            current,
            stale_ticks: aggregator.stale_ticks(),
            filtered_ticks: aggregator.filtered_ticks(),
            metrics: ReplayMetrics {
                ticks_replayed: ticks.len() as u64,
                duration_ms: elapsed.as_millis(),
                ticks_per_second,
                checksum,
            },
        })
    }
}

/// Hash a candle sequence bit-exactly (prices via their IEEE-754 bits).
pub fn candle_checksum<'a>(candles: impl IntoIterator<Item = &'a Candle>) -> String {
    let mut hasher = Sha256::new();
    for candle in candles {
        hasher.update(candle.asset.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(candle.timeframe.seconds().to_be_bytes());
        hasher.update(candle.boundary.to_be_bytes());
        for value in [candle.open, candle.high, candle.low, candle.close, candle.volume] {
            hasher.update(value.to_bits().to_be_bytes());
        }
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
