//! Persistence Sink: asynchronous, best-effort chunk writer
//!
//! Producers on the real-time path call [`PersistenceSink::write_tick`] and
//! [`PersistenceSink::write_candle`], which never block: records are handed to
//! a FIFO queue drained by a dedicated writer thread that owns the
//! [`ChunkStore`].
//!
//! Only ticks are budgeted: once `queue_capacity` ticks are pending, further
//! ticks are dropped and counted. Closed candles are never dropped for lack
//! of queue space; there is at most one per boundary.
//!
//! Failed writes are retried once on a fresh chunk; a second failure is
//! logged and suppressed. A chunk that fails to close after its last record
//! was written is logged and counted, never rewritten. Nothing here can stop
//! the ingestion loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use types::ids::AssetId;
use types::market::{Candle, Tick, Timeframe};

use crate::chunk::{AppendReceipt, ChunkConfig, ChunkError, ChunkKind, ChunkStore};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Chunk store error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("Failed to spawn writer thread: {0}")]
    Spawn(std::io::Error),

    #[error("Persistence writer has stopped")]
    WriterStopped,

    #[error("Queue capacity must be > 0")]
    ZeroCapacity,
}

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub chunk: ChunkConfig,
    /// Ticks allowed to wait for the writer thread; closed candles bypass it.
    pub queue_capacity: usize,
}

impl SinkConfig {
    pub fn new(chunk: ChunkConfig) -> Self {
        Self {
            chunk,
            queue_capacity: 4_096,
        }
    }
}

// ── Statistics ──────────────────────────────────────────────────────

/// Counters shared between the producer handle and the writer thread.
#[derive(Debug, Default)]
pub struct SinkStats {
    ticks_written: AtomicU64,
    candles_written: AtomicU64,
    duplicates_skipped: AtomicU64,
    invalid_skipped: AtomicU64,
    dropped_queue_full: AtomicU64,
    write_retries: AtomicU64,
    write_failures: AtomicU64,
    close_failures: AtomicU64,
    chunks_rotated: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStatsSnapshot {
    pub ticks_written: u64,
    pub candles_written: u64,
    pub duplicates_skipped: u64,
    pub invalid_skipped: u64,
    pub dropped_queue_full: u64,
    pub write_retries: u64,
    pub write_failures: u64,
    pub close_failures: u64,
    pub chunks_rotated: u64,
}

impl SinkStats {
    pub fn snapshot(&self) -> SinkStatsSnapshot {
        SinkStatsSnapshot {
            ticks_written: self.ticks_written.load(Ordering::Relaxed),
            candles_written: self.candles_written.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            invalid_skipped: self.invalid_skipped.load(Ordering::Relaxed),
            dropped_queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
            write_retries: self.write_retries.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            close_failures: self.close_failures.load(Ordering::Relaxed),
            chunks_rotated: self.chunks_rotated.load(Ordering::Relaxed),
        }
    }
}

/// Result of closing a session's chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCloseReport {
    pub chunks_closed: usize,
    /// Set when at least one chunk failed to close cleanly.
    pub error: Option<String>,
}

// ── Sink Handle ─────────────────────────────────────────────────────

enum SinkMessage {
    Tick { tick: Tick, timeframe: Timeframe },
    Candle(Candle),
    CloseSession { ack: oneshot::Sender<SessionCloseReport> },
    Shutdown { ack: oneshot::Sender<SessionCloseReport> },
}

/// Producer-side handle to the persistence writer thread.
pub struct PersistenceSink {
    tx: mpsc::UnboundedSender<SinkMessage>,
    stats: Arc<SinkStats>,
    /// Ticks queued but not yet taken by the writer.
    pending_ticks: Arc<AtomicUsize>,
    tick_capacity: usize,
    handle: Option<JoinHandle<()>>,
}

impl PersistenceSink {
    /// Open the chunk store and start the writer thread.
    pub fn spawn(config: SinkConfig) -> Result<Self, SinkError> {
        if config.queue_capacity == 0 {
            return Err(SinkError::ZeroCapacity);
        }
        let store = ChunkStore::new(config.chunk.clone())?;
        let stats = Arc::new(SinkStats::default());
        let pending_ticks = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();

        let writer = SinkWriter::new(store, Arc::clone(&stats), Arc::clone(&pending_ticks));
        let handle = thread::Builder::new()
            .name("candle-persistence".to_string())
            .spawn(move || writer.run(rx))
            .map_err(SinkError::Spawn)?;

        info!(
            root = %config.chunk.root.display(),
            queue_capacity = config.queue_capacity,
            max_candles_per_chunk = config.chunk.max_candles_per_chunk,
            max_ticks_per_chunk = config.chunk.max_ticks_per_chunk,
            "Persistence sink started"
        );

        Ok(Self {
            tx,
            stats,
            pending_ticks,
            tick_capacity: config.queue_capacity,
            handle: Some(handle),
        })
    }

    /// Queue a raw tick. Never blocks; dropped when the tick budget is spent.
    pub fn write_tick(&self, tick: Tick, timeframe: Timeframe) -> bool {
        let pending = self.pending_ticks.fetch_add(1, Ordering::AcqRel);
        if pending >= self.tick_capacity {
            self.pending_ticks.fetch_sub(1, Ordering::AcqRel);
            let dropped = self.stats.dropped_queue_full.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped % 1_000 == 0 {
                warn!(dropped, pending, "Persistence queue full: dropping tick");
            }
            return false;
        }

        if self.enqueue(SinkMessage::Tick { tick, timeframe }) {
            true
        } else {
            self.pending_ticks.fetch_sub(1, Ordering::AcqRel);
            false
        }
    }

    /// Queue a closed candle. Never blocks and never yields to queued ticks.
    pub fn write_candle(&self, candle: Candle) -> bool {
        self.enqueue(SinkMessage::Candle(candle))
    }

    /// Flush and close every open chunk, waiting for the writer to confirm.
    ///
    /// Records queued before this call are written first.
    pub async fn close_session(&self) -> Result<SessionCloseReport, SinkError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(SinkMessage::CloseSession { ack })
            .map_err(|_| SinkError::WriterStopped)?;
        done.await.map_err(|_| SinkError::WriterStopped)
    }

    /// Close all chunks and stop the writer thread.
    pub async fn shutdown(mut self) -> Result<SessionCloseReport, SinkError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(SinkMessage::Shutdown { ack })
            .map_err(|_| SinkError::WriterStopped)?;
        let report = done.await.map_err(|_| SinkError::WriterStopped)?;

        // The writer has acknowledged and is leaving its loop.
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Persistence writer thread panicked during shutdown");
            }
        }
        info!(stats = ?self.stats.snapshot(), "Persistence sink stopped");
        Ok(report)
    }

    pub fn stats(&self) -> SinkStatsSnapshot {
        self.stats.snapshot()
    }

    fn enqueue(&self, msg: SinkMessage) -> bool {
        if self.tx.send(msg).is_err() {
            self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
            error!("Persistence writer has stopped: record lost");
            return false;
        }
        true
    }
}

// ── Writer Thread ───────────────────────────────────────────────────

struct SinkWriter {
    store: ChunkStore,
    /// Last persisted boundary per stream; candles must move strictly forward.
    last_boundary: HashMap<(AssetId, Timeframe), i64>,
    stats: Arc<SinkStats>,
    pending_ticks: Arc<AtomicUsize>,
}

impl SinkWriter {
    fn new(store: ChunkStore, stats: Arc<SinkStats>, pending_ticks: Arc<AtomicUsize>) -> Self {
        Self {
            store,
            last_boundary: HashMap::new(),
            stats,
            pending_ticks,
        }
    }

    fn run(mut self, mut rx: mpsc::UnboundedReceiver<SinkMessage>) {
        while let Some(msg) = rx.blocking_recv() {
            match msg {
                SinkMessage::Tick { tick, timeframe } => {
                    self.pending_ticks.fetch_sub(1, Ordering::AcqRel);
                    self.write_tick(&tick, timeframe);
                }
                SinkMessage::Candle(candle) => self.write_candle(&candle),
                SinkMessage::CloseSession { ack } => {
                    let _ = ack.send(self.close_session());
                }
                SinkMessage::Shutdown { ack } => {
                    let _ = ack.send(self.close_session());
                    return;
                }
            }
        }

        // All handles dropped without an explicit shutdown.
        self.close_session();
    }

    fn write_tick(&mut self, tick: &Tick, timeframe: Timeframe) {
        let written = self.append_with_retry(ChunkKind::Ticks, &tick.asset, timeframe, |store| {
            store.append_tick(tick, timeframe)
        });
        if written {
            self.stats.ticks_written.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn write_candle(&mut self, candle: &Candle) {
        if !candle.is_valid() {
            self.stats.invalid_skipped.fetch_add(1, Ordering::Relaxed);
            warn!(
                asset = %candle.asset,
                boundary = candle.boundary,
                "Skipping invalid candle"
            );
            return;
        }

        let key = (candle.asset.clone(), candle.timeframe);
        if let Some(&last) = self.last_boundary.get(&key) {
            if candle.boundary <= last {
                self.stats.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    asset = %candle.asset,
                    boundary = candle.boundary,
                    last_persisted = last,
                    "Skipping already persisted candle"
                );
                return;
            }
        }

        let written = self.append_with_retry(
            ChunkKind::Candles,
            &candle.asset,
            candle.timeframe,
            |store| store.append_candle(candle),
        );
        if written {
            self.stats.candles_written.fetch_add(1, Ordering::Relaxed);
            self.last_boundary.insert(key, candle.boundary);
        }
    }

    fn append_with_retry<F>(
        &mut self,
        kind: ChunkKind,
        asset: &AssetId,
        timeframe: Timeframe,
        mut append: F,
    ) -> bool
    where
        F: FnMut(&mut ChunkStore) -> Result<AppendReceipt, ChunkError>,
    {
        let first = match append(&mut self.store) {
            Ok(receipt) => return self.record_receipt(receipt),
            Err(err) => err,
        };

        warn!(
            kind = kind.dir_name(),
            asset = %asset,
            error = %first,
            "Chunk write failed, retrying on a fresh chunk"
        );
        self.stats.write_retries.fetch_add(1, Ordering::Relaxed);
        self.store.abandon(kind, asset, timeframe);

        match append(&mut self.store) {
            Ok(receipt) => self.record_receipt(receipt),
            Err(err) => {
                self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    kind = kind.dir_name(),
                    asset = %asset,
                    error = %err,
                    "Chunk write failed after retry; record not persisted"
                );
                false
            }
        }
    }

    /// The record is on disk; a failed close of its chunk is not retried.
    fn record_receipt(&self, receipt: AppendReceipt) -> bool {
        if receipt.rotated {
            self.stats.chunks_rotated.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(err) = &receipt.close_error {
            self.stats.close_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                path = %receipt.path.display(),
                error = %err,
                "Chunk failed to close after rotation"
            );
        }
        true
    }

    fn close_session(&mut self) -> SessionCloseReport {
        match self.store.close_all() {
            Ok(chunks_closed) => {
                debug!(chunks_closed, "Session chunks closed");
                SessionCloseReport {
                    chunks_closed,
                    error: None,
                }
            }
            Err(err) => {
                error!(error = %err, "Failed to close session chunks");
                SessionCloseReport {
                    chunks_closed: 0,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
