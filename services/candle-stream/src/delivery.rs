//! Delivery Buffer for the rendering client
//!
//! Coalesces candle updates between drains: one entry per
//! `(asset, boundary)`, replaced in place on every update. The aggregator
//! pushes from the ingestion path; a timer-driven task drains. This buffer
//! is the only state shared between the two, guarded by a mutex.
//!
//! Memory is bounded by a hard capacity. When a new entry would exceed it,
//! the oldest half is evicted: fresh data is favoured over stale, and the
//! producer never blocks.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use types::ids::AssetId;
use types::market::Candle;

/// A candle queued for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferEntry {
    pub candle: Candle,
    pub is_closed: bool,
}

impl BufferEntry {
    pub fn in_progress(candle: Candle) -> Self {
        Self {
            candle,
            is_closed: false,
        }
    }

    pub fn closed(candle: Candle) -> Self {
        Self {
            candle,
            is_closed: true,
        }
    }
}

/// What `push` did with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// New `(asset, boundary)` entry; `evicted` older entries made room.
    Inserted { evicted: usize },
    /// Existing entry for the same boundary replaced.
    Replaced,
    /// Boundary older than the newest seen for this asset.
    RejectedStale,
    /// In-progress update for a boundary already delivered as closed.
    RejectedClosed,
}

/// Configuration for the delivery buffer.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Hard cap on buffered entries.
    pub capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub pushes: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub drains: u64,
}

#[derive(Debug, Default)]
struct BufferState {
    /// Keyed by (boundary, asset) so iteration is ascending by boundary.
    entries: BTreeMap<(i64, AssetId), BufferEntry>,
    /// Newest boundary accepted per asset; survives drains.
    newest: HashMap<AssetId, i64>,
    stats: DeliveryStats,
}

/// Thread-safe, bounded, coalescing buffer.
#[derive(Debug)]
pub struct DeliveryBuffer {
    capacity: usize,
    state: Mutex<BufferState>,
}

impl DeliveryBuffer {
    pub fn new(config: DeliveryConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            state: Mutex::new(BufferState::default()),
        }
    }

    /// Producer side. Never blocks beyond the mutex hand-off.
    pub fn push(&self, entry: BufferEntry) -> PushOutcome {
        let mut state = self.lock();
        state.stats.pushes += 1;

        let asset = entry.candle.asset.clone();
        let boundary = entry.candle.boundary;

        if let Some(&newest) = state.newest.get(&asset) {
            if boundary < newest {
                state.stats.rejected += 1;
                debug!(asset = %asset, boundary, newest, "Rejecting out-of-order update");
                return PushOutcome::RejectedStale;
            }
        }
        state.newest.insert(asset.clone(), boundary);

        let key = (boundary, asset);
        if let Some(existing) = state.entries.get_mut(&key) {
            if existing.is_closed && !entry.is_closed {
                state.stats.rejected += 1;
                return PushOutcome::RejectedClosed;
            }
            *existing = entry;
            return PushOutcome::Replaced;
        }

        let evicted = if state.entries.len() >= self.capacity {
            Self::evict_oldest_half(&mut state)
        } else {
            0
        };
        state.entries.insert(key, entry);
        PushOutcome::Inserted { evicted }
    }

    /// Consumer side: take every entry in ascending boundary order.
    pub fn drain(&self) -> Vec<BufferEntry> {
        let mut state = self.lock();
        state.stats.drains += 1;
        let mut drained = BTreeMap::new();
        std::mem::swap(&mut drained, &mut state.entries);
        drained.into_values().collect()
    }

    /// Drop every entry and forget per-asset ordering. Returns entries dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.entries.len();
        state.entries.clear();
        state.newest.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> DeliveryStats {
        self.lock().stats
    }

    fn evict_oldest_half(state: &mut BufferState) -> usize {
        let to_evict = (state.entries.len() / 2).max(1);
        for _ in 0..to_evict {
            state.entries.pop_first();
        }
        state.stats.evicted += to_evict as u64;
        warn!(
            evicted = to_evict,
            retained = state.entries.len(),
            "Delivery buffer full: evicted oldest half"
        );
        to_evict
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        // Every mutation leaves the map consistent; poisoning is ignored.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for DeliveryBuffer {
    fn default() -> Self {
        Self::new(DeliveryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use types::market::{Tick, Timeframe};

    fn candle(asset: &str, boundary: i64, price: f64) -> Candle {
        Candle::open_from(&Tick::new(AssetId::new(asset), price, boundary), Timeframe::S30)
    }

    fn buffer(capacity: usize) -> DeliveryBuffer {
        DeliveryBuffer::new(DeliveryConfig { capacity })
    }

    #[test]
    fn test_update_replaces_same_boundary() {
        let buf = buffer(10);
        assert_eq!(
            buf.push(BufferEntry::in_progress(candle("X", 0, 1.0))),
            PushOutcome::Inserted { evicted: 0 }
        );
        assert_eq!(
            buf.push(BufferEntry::in_progress(candle("X", 0, 1.5))),
            PushOutcome::Replaced
        );
        assert_eq!(buf.len(), 1);

        let drained = buf.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].candle.open, 1.5);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_out_of_order_rejected() {
        let buf = buffer(10);
        buf.push(BufferEntry::in_progress(candle("X", 30, 1.0)));
        assert_eq!(
            buf.push(BufferEntry::in_progress(candle("X", 0, 1.0))),
            PushOutcome::RejectedStale
        );

        // Still rejected after a drain
        buf.drain();
        assert_eq!(
            buf.push(BufferEntry::closed(candle("X", 0, 1.0))),
            PushOutcome::RejectedStale
        );
        assert_eq!(buf.stats().rejected, 2);
    }

    #[test]
    fn test_closed_not_downgraded() {
        let buf = buffer(10);
        buf.push(BufferEntry::closed(candle("X", 0, 1.0)));
        assert_eq!(
            buf.push(BufferEntry::in_progress(candle("X", 0, 2.0))),
            PushOutcome::RejectedClosed
        );
        let drained = buf.drain();
        assert!(drained[0].is_closed);
        assert_eq!(drained[0].candle.open, 1.0);
    }

    #[test]
    fn test_drain_ascending_boundary_order() {
        let buf = buffer(10);
        buf.push(BufferEntry::in_progress(candle("B", 60, 1.0)));
        buf.push(BufferEntry::in_progress(candle("A", 0, 1.0)));
        buf.push(BufferEntry::in_progress(candle("A", 30, 1.0)));

        let boundaries: Vec<i64> = buf.drain().iter().map(|e| e.candle.boundary).collect();
        assert_eq!(boundaries, vec![0, 30, 60]);
    }

    #[test]
    fn test_overflow_evicts_oldest_half() {
        let buf = buffer(4);
        for i in 0..4 {
            buf.push(BufferEntry::closed(candle("X", i * 30, 1.0)));
        }
        assert_eq!(
            buf.push(BufferEntry::in_progress(candle("X", 120, 1.0))),
            PushOutcome::Inserted { evicted: 2 }
        );
        assert_eq!(buf.len(), 3);

        let boundaries: Vec<i64> = buf.drain().iter().map(|e| e.candle.boundary).collect();
        assert_eq!(boundaries, vec![60, 90, 120]);
        assert_eq!(buf.stats().evicted, 2);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let buf = buffer(7);
        for i in 0..100 {
            buf.push(BufferEntry::in_progress(candle("X", i * 30, 1.0)));
            assert!(buf.len() <= buf.capacity());
        }
    }

    #[test]
    fn test_clear_resets_ordering() {
        let buf = buffer(10);
        buf.push(BufferEntry::in_progress(candle("X", 90, 1.0)));
        assert_eq!(buf.clear(), 1);
        assert!(buf.is_empty());
        assert_eq!(
            buf.push(BufferEntry::in_progress(candle("X", 0, 1.0))),
            PushOutcome::Inserted { evicted: 0 }
        );
    }

    #[test]
    fn test_concurrent_push_and_drain() {
        let buf = Arc::new(buffer(64));
        let producer = {
            let buf = Arc::clone(&buf);
            std::thread::spawn(move || {
                for i in 0..1_000 {
                    buf.push(BufferEntry::in_progress(candle("X", i * 30, 1.0)));
                }
            })
        };

        let mut seen = Vec::new();
        while !producer.is_finished() {
            seen.extend(buf.drain().into_iter().map(|e| e.candle.boundary));
        }
        producer.join().unwrap();
        seen.extend(buf.drain().into_iter().map(|e| e.candle.boundary));

        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seen.last(), Some(&(999 * 30)));
    }
}
