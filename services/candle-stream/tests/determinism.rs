//! Determinism tests for the candle pipeline
//!
//! Identical tick sequences must yield identical candles, and no tick
//! ordering can corrupt a candle that has already been closed.
//!
//! Tests include:
//! - Dual replay comparison
//! - Boundary-aligned OHLC invariants over random tick streams
//! - Out-of-order tick rejection
//! - Delivery buffer capacity under sustained load

use candle_stream::candles::{CandleAggregator, IngestOutcome};
use candle_stream::delivery::{BufferEntry, DeliveryBuffer, DeliveryConfig};
use candle_stream::replay::{candle_checksum, ReplayEngine};
use proptest::prelude::*;
use std::collections::BTreeMap;
use types::ids::AssetId;
use types::market::{Candle, Tick, Timeframe};

fn asset() -> AssetId {
    AssetId::new("EURUSD_otc")
}

fn ticks_from(pairs: &[(f64, i64)]) -> Vec<Tick> {
    pairs.iter().map(|&(p, t)| Tick::new(asset(), p, t)).collect()
}

/// Run ticks through an aggregator, returning closed candles plus the tail.
fn aggregate(ticks: &[Tick], timeframe: Timeframe) -> Vec<Candle> {
    let mut agg = CandleAggregator::new(asset(), timeframe);
    let mut out = Vec::new();
    for tick in ticks {
        if let Some(closed) = agg.ingest(tick).closed() {
            out.push(closed.clone());
        }
    }
    out.extend(agg.finalize());
    out
}

/// Timestamps that only move forward, with repeats inside a boundary.
fn monotonic_ticks() -> impl Strategy<Value = Vec<Tick>> {
    prop::collection::vec((0.5f64..2.0, 0i64..20), 1..200).prop_map(|steps| {
        let mut ts = 1_700_000_000i64;
        steps
            .into_iter()
            .map(|(price, gap)| {
                ts += gap;
                Tick::new(asset(), price, ts)
            })
            .collect()
    })
}

/// Test 1: A concrete 30s session produces the expected candles.
#[test]
fn test_thirty_second_session() {
    let ticks = ticks_from(&[
        (1.0840, 0),
        (1.0845, 12),
        (1.0838, 29),
        (1.0842, 30),
        (1.0850, 59),
        (1.0849, 95),
    ]);
    let candles = aggregate(&ticks, Timeframe::S30);

    assert_eq!(candles.len(), 3);
    assert_eq!(candles[0].boundary, 0);
    assert_eq!(
        (candles[0].open, candles[0].high, candles[0].low, candles[0].close),
        (1.0840, 1.0845, 1.0838, 1.0838)
    );
    assert_eq!(candles[0].volume, 3.0);
    assert_eq!(candles[1].boundary, 30);
    assert_eq!(candles[1].close, 1.0850);
    // The gap 60..90 produces no candle.
    assert_eq!(candles[2].boundary, 90);
}

/// Test 2: A late tick for a closed boundary never mutates it.
#[test]
fn test_late_tick_does_not_reopen_closed_candle() {
    let mut agg = CandleAggregator::new(asset(), Timeframe::S30);
    agg.ingest(&Tick::new(asset(), 1.0, 0));
    let closed = agg.ingest(&Tick::new(asset(), 1.1, 31)).closed().cloned().unwrap();

    let late = agg.ingest(&Tick::new(asset(), 9.9, 10));
    assert_eq!(late, IngestOutcome::Stale { boundary: 0, current: 30 });
    assert_eq!(closed.high, 1.0);
    assert_eq!(agg.current().unwrap().high, 1.1);
    assert_eq!(agg.stale_ticks(), 1);
}

/// Test 3: Two replays of the same ticks agree bit for bit.
#[test]
fn test_deterministic_replay_produces_identical_checksums() {
    let ticks = ticks_from(&[(1.0, 0), (1.2, 5), (0.9, 61), (1.1, 62), (1.3, 185)]);
    let engine = ReplayEngine::new();

    let first = engine.replay(&asset(), Timeframe::M1, &ticks).unwrap();
    let second = engine.replay(&asset(), Timeframe::M1, &ticks).unwrap();

    assert_eq!(
        first.metrics.checksum, second.metrics.checksum,
        "Two replays of the same ticks must produce identical checksums"
    );
    assert_eq!(first.closed, second.closed);
    assert_eq!(first.current, second.current);
}

/// Test 4: Foreign-asset ticks leave the candle stream untouched.
#[test]
fn test_foreign_ticks_do_not_change_checksum() {
    let clean = ticks_from(&[(1.0, 0), (1.1, 31), (1.2, 62)]);
    let mut noisy = clean.clone();
    noisy.insert(1, Tick::new(AssetId::new("GBPUSD_otc"), 5.0, 20));
    noisy.insert(3, Tick::new(AssetId::new("GBPUSD_otc"), 5.0, 45));

    let a = ReplayEngine::new().replay(&asset(), Timeframe::S30, &clean).unwrap();
    let b = ReplayEngine::new().replay(&asset(), Timeframe::S30, &noisy).unwrap();
    assert_eq!(a.metrics.checksum, b.metrics.checksum);
    assert_eq!(b.filtered_ticks, 2);
}

/// Test 5: High-volatility burst inside one boundary.
#[test]
fn test_high_volatility_single_boundary() {
    let prices = [1.0, 3.0, 0.2, 2.5, 0.7, 1.9, 0.1, 4.0, 1.5];
    let ticks: Vec<Tick> = prices
        .iter()
        .enumerate()
        .map(|(i, &p)| Tick::new(asset(), p, 60 + i as i64))
        .collect();

    let candles = aggregate(&ticks, Timeframe::M1);
    assert_eq!(candles.len(), 1);
    let c = &candles[0];
    assert_eq!((c.open, c.high, c.low, c.close), (1.0, 4.0, 0.1, 1.5));
    assert_eq!(c.volume, prices.len() as f64);
    assert!(c.is_valid());
}

/// Test 6: The delivery buffer never outgrows its capacity.
#[test]
fn test_buffer_bounded_under_sustained_load() {
    let buffer = DeliveryBuffer::new(DeliveryConfig { capacity: 50 });
    for boundary in 0..1_000i64 {
        let candle = Candle::open_from(&Tick::new(asset(), 1.0, boundary * 5), Timeframe::S5);
        buffer.push(BufferEntry::closed(candle));
        assert!(buffer.len() <= 50);
    }

    let drained = buffer.drain();
    assert!(!drained.is_empty());
    assert_eq!(drained.last().unwrap().candle.boundary, 999 * 5);
    assert!(drained.windows(2).all(|w| w[0].candle.boundary < w[1].candle.boundary));
    assert!(buffer.stats().evicted > 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// One candle per distinct boundary, with open/close from the first/last tick.
    #[test]
    fn prop_one_candle_per_boundary(ticks in monotonic_ticks(), tf in prop::sample::select(vec![5u32, 30, 60])) {
        let timeframe = Timeframe::from_seconds(tf).unwrap();
        let candles = aggregate(&ticks, timeframe);

        let mut by_boundary: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
        for tick in &ticks {
            by_boundary.entry(timeframe.boundary(tick.timestamp)).or_default().push(tick.price);
        }

        prop_assert_eq!(candles.len(), by_boundary.len());
        for (candle, (boundary, prices)) in candles.iter().zip(by_boundary.iter()) {
            prop_assert_eq!(candle.boundary, *boundary);
            prop_assert_eq!(candle.open, prices[0]);
            prop_assert_eq!(candle.close, *prices.last().unwrap());
            prop_assert_eq!(candle.high, prices.iter().cloned().fold(f64::MIN, f64::max));
            prop_assert_eq!(candle.low, prices.iter().cloned().fold(f64::MAX, f64::min));
            prop_assert_eq!(candle.volume, prices.len() as f64);
            prop_assert!(candle.is_valid());
        }
    }

    /// Shuffling in late ticks can only drop ticks; closed candles never change after closing.
    #[test]
    fn prop_closed_candles_immutable(ticks in monotonic_ticks(), late in prop::collection::vec((0usize..200, 0.1f64..5.0), 0..20)) {
        let timeframe = Timeframe::S30;
        let mut agg = CandleAggregator::new(asset(), timeframe);
        let mut closed: Vec<Candle> = Vec::new();

        for (i, tick) in ticks.iter().enumerate() {
            if let Some(c) = agg.ingest(tick).closed() {
                closed.push(c.clone());
            }
            for &(at, price) in &late {
                if at == i {
                    if let Some(first) = closed.first() {
                        let stale = Tick::new(asset(), price, first.boundary);
                        let outcome = agg.ingest(&stale);
                        let is_stale = matches!(outcome, IngestOutcome::Stale { .. });
                        prop_assert!(is_stale);
                    }
                }
            }
        }

        let replayed = aggregate(&ticks, timeframe);
        prop_assert_eq!(&replayed[..closed.len()], &closed[..]);
    }

    /// Replay checksums are a pure function of the tick sequence.
    #[test]
    fn prop_replay_checksum_stable(ticks in monotonic_ticks()) {
        let engine = ReplayEngine::new();
        let a = engine.replay(&asset(), Timeframe::M1, &ticks).unwrap();
        let b = engine.replay(&asset(), Timeframe::M1, &ticks).unwrap();
        prop_assert_eq!(&a.metrics.checksum, &b.metrics.checksum);
        prop_assert_eq!(
            candle_checksum(a.closed.iter().chain(a.current.iter())),
            a.metrics.checksum
        );
    }

    /// Buffer length stays within capacity for any push pattern.
    #[test]
    fn prop_buffer_capacity_holds(capacity in 1usize..32, boundaries in prop::collection::vec(0i64..500, 1..300)) {
        let buffer = DeliveryBuffer::new(DeliveryConfig { capacity });
        for b in boundaries {
            let candle = Candle::open_from(&Tick::new(asset(), 1.0, b * 5), Timeframe::S5);
            buffer.push(BufferEntry::in_progress(candle));
            prop_assert!(buffer.len() <= capacity);
        }
    }
}
