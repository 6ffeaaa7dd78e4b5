//! Candle Aggregator
//!
//! Folds ticks for one `(asset, timeframe)` session into OHLCV candles.
//! At most one candle is in progress; it closes the instant a tick for a
//! later boundary arrives and is never touched again.
//!
//! Ticks whose boundary lies before the in-progress candle are stale and
//! dropped: once a boundary advances, time never moves backward.

use serde::{Deserialize, Serialize};
use tracing::debug;
use types::ids::AssetId;
use types::market::{Candle, Tick, Timeframe};

/// Result of feeding one tick to the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IngestOutcome {
    /// The tick was folded. `candle` is the in-progress state after the tick;
    /// `closed` is the candle this tick finished, if it crossed a boundary.
    Updated {
        candle: Candle,
        closed: Option<Candle>,
    },
    /// Tick belongs to another asset.
    Filtered,
    /// Tick maps to a boundary older than the in-progress candle.
    Stale { boundary: i64, current: i64 },
}

impl IngestOutcome {
    pub fn closed(&self) -> Option<&Candle> {
        match self {
            IngestOutcome::Updated { closed, .. } => closed.as_ref(),
            _ => None,
        }
    }
}

/// Single-producer candle state for the active session.
#[derive(Debug, Clone)]
pub struct CandleAggregator {
    asset: AssetId,
    timeframe: Timeframe,
    /// Currently building candle (not yet closed).
    current: Option<Candle>,
    /// Highest boundary ever opened; survives finalize/discard.
    high_water: Option<i64>,
    candles_closed: u64,
    stale_ticks: u64,
    filtered_ticks: u64,
}

impl CandleAggregator {
    pub fn new(asset: AssetId, timeframe: Timeframe) -> Self {
        Self {
            asset,
            timeframe,
            current: None,
            high_water: None,
            candles_closed: 0,
            stale_ticks: 0,
            filtered_ticks: 0,
        }
    }

    /// Fold a tick into the session's candle state.
    pub fn ingest(&mut self, tick: &Tick) -> IngestOutcome {
        if tick.asset != self.asset {
            self.filtered_ticks += 1;
            return IngestOutcome::Filtered;
        }

        let boundary = self.timeframe.boundary(tick.timestamp);

        if let Some(high_water) = self.high_water {
            // A finalized or discarded boundary cannot be reopened.
            let reopened = boundary == high_water && self.current.is_none();
            if boundary < high_water || reopened {
                self.stale_ticks += 1;
                debug!(
                    asset = %self.asset,
                    boundary,
                    current = high_water,
                    timestamp = tick.timestamp,
                    "Dropping stale tick"
                );
                return IngestOutcome::Stale {
                    boundary,
                    current: high_water,
                };
            }
        }

        // Same boundary: fold in place
        if let Some(candle) = self.current.as_mut() {
            if candle.boundary == boundary {
                candle.apply(tick.price, tick.volume);
                return IngestOutcome::Updated {
                    candle: candle.clone(),
                    closed: None,
                };
            }
        }

        // New boundary: the previous candle (if any) is now immutable
        let closed = self.current.take();
        if closed.is_some() {
            self.candles_closed += 1;
        }

        let candle = Candle::open_from(tick, self.timeframe);
        self.high_water = Some(boundary);
        self.current = Some(candle.clone());

        IngestOutcome::Updated { candle, closed }
    }

    /// Close the in-progress candle without waiting for the next boundary.
    ///
    /// Used when a session stops: no further ticks can reach this candle.
    pub fn finalize(&mut self) -> Option<Candle> {
        let candle = self.current.take()?;
        self.candles_closed += 1;
        Some(candle)
    }

    /// Throw away the in-progress candle (its data can no longer be trusted).
    pub fn discard_current(&mut self) -> Option<Candle> {
        self.current.take()
    }

    pub fn current(&self) -> Option<&Candle> {
        self.current.as_ref()
    }

    pub fn asset(&self) -> &AssetId {
        &self.asset
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn candles_closed(&self) -> u64 {
        self.candles_closed
    }

    pub fn stale_ticks(&self) -> u64 {
        self.stale_ticks
    }

    pub fn filtered_ticks(&self) -> u64 {
        self.filtered_ticks
    }
}
