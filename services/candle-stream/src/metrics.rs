//! Pipeline counters and ingest latency
//!
//! Shared between the ingestion path and the drain task, so every counter
//! is atomic. `export()` returns a sorted map suitable for a status dump.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Counters for one stream runtime.
#[derive(Debug)]
pub struct PipelineMetrics {
    // Decoder
    pub frames_received: AtomicU64,
    pub ticks_decoded: AtomicU64,
    /// Payloads and batch elements the decoder rejected.
    pub rejected_ticks: AtomicU64,

    // Aggregator
    pub stale_ticks: AtomicU64,
    pub filtered_ticks: AtomicU64,
    pub ticks_while_inactive: AtomicU64,
    pub candles_closed: AtomicU64,

    // Delivery
    pub buffer_pushes: AtomicU64,
    pub buffer_rejections: AtomicU64,
    pub buffer_evictions: AtomicU64,
    pub drains: AtomicU64,
    pub events_emitted: AtomicU64,

    // Persistence hand-off
    pub persistence_rejected: AtomicU64,

    pub ingest_latency_ns: Mutex<LatencyTracker>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            frames_received: AtomicU64::new(0),
            ticks_decoded: AtomicU64::new(0),
            rejected_ticks: AtomicU64::new(0),
            stale_ticks: AtomicU64::new(0),
            filtered_ticks: AtomicU64::new(0),
            ticks_while_inactive: AtomicU64::new(0),
            candles_closed: AtomicU64::new(0),
            buffer_pushes: AtomicU64::new(0),
            buffer_rejections: AtomicU64::new(0),
            buffer_evictions: AtomicU64::new(0),
            drains: AtomicU64::new(0),
            events_emitted: AtomicU64::new(0),
            persistence_rejected: AtomicU64::new(0),
            ingest_latency_ns: Mutex::new(LatencyTracker::new(1000)),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Record the wall time spent handling one capture payload.
    pub fn record_ingest(&self, latency_ns: u64) {
        if let Ok(mut tracker) = self.ingest_latency_ns.lock() {
            tracker.record(latency_ns);
        }
    }

    pub fn ingest_p99_ns(&self) -> Option<u64> {
        self.ingest_latency_ns
            .lock()
            .ok()
            .and_then(|tracker| tracker.percentile(99))
    }

    /// Export metrics as a sorted map.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let counters: [(&str, &AtomicU64); 13] = [
            ("frames_received", &self.frames_received),
            ("ticks_decoded", &self.ticks_decoded),
            ("rejected_ticks", &self.rejected_ticks),
            ("stale_ticks", &self.stale_ticks),
            ("filtered_ticks", &self.filtered_ticks),
            ("ticks_while_inactive", &self.ticks_while_inactive),
            ("candles_closed", &self.candles_closed),
            ("buffer_pushes", &self.buffer_pushes),
            ("buffer_rejections", &self.buffer_rejections),
            ("buffer_evictions", &self.buffer_evictions),
            ("drains", &self.drains),
            ("events_emitted", &self.events_emitted),
            ("persistence_rejected", &self.persistence_rejected),
        ];

        let mut m: BTreeMap<String, u64> = counters
            .iter()
            .map(|(name, counter)| (name.to_string(), counter.load(Ordering::Relaxed)))
            .collect();

        if let Ok(tracker) = self.ingest_latency_ns.lock() {
            if let Some(p50) = tracker.percentile(50) {
                m.insert("ingest_p50_ns".to_string(), p50);
            }
            if let Some(p99) = tracker.percentile(99) {
                m.insert("ingest_p99_ns".to_string(), p99);
            }
        }
        m
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding window of latency samples.
#[derive(Debug)]
pub struct LatencyTracker {
    samples: VecDeque<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
        }
    }

    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (p.min(100) as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx])
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_exported() {
        let metrics = PipelineMetrics::new();
        PipelineMetrics::incr(&metrics.frames_received);
        PipelineMetrics::incr(&metrics.frames_received);
        PipelineMetrics::add(&metrics.stale_ticks, 3);

        let exported = metrics.export();
        assert_eq!(exported["frames_received"], 2);
        assert_eq!(exported["stale_ticks"], 3);
        assert_eq!(exported["candles_closed"], 0);
        assert!(!exported.contains_key("ingest_p99_ns"));
    }

    #[test]
    fn test_ingest_latency_exported() {
        let metrics = PipelineMetrics::new();
        for ns in 1..=100 {
            metrics.record_ingest(ns);
        }
        let exported = metrics.export();
        assert!(exported["ingest_p50_ns"] >= 49 && exported["ingest_p50_ns"] <= 51);
        assert_eq!(metrics.ingest_p99_ns(), Some(99));
    }

    #[test]
    fn test_latency_tracker_window_eviction() {
        let mut tracker = LatencyTracker::new(3);
        for v in [10, 20, 30, 40] {
            tracker.record(v);
        }
        assert_eq!(tracker.count(), 3);
        assert_eq!(tracker.percentile(0), Some(20));
        assert_eq!(tracker.percentile(100), Some(40));
    }
}
