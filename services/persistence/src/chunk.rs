//! Chunk Writer: append-only CSV chunks rotated by record count
//!
//! One stream of chunks exists per `(kind, asset, timeframe)`. A chunk is
//! created lazily on its first record, holds a header row plus at most
//! `threshold` records, and is flushed, fsynced and closed the moment the
//! threshold is reached. The next record opens `index + 1`.
//!
//! # File naming
//! ```text
//! {ASSET}_{TIMEFRAME}_{CHUNK_INDEX:04}.csv
//! ```
//! On open the directory is scanned and numbering resumes after the highest
//! existing index, so a restart never appends to a previous process's chunk.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use types::ids::AssetId;
use types::market::{Candle, Tick, Timeframe};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid chunk threshold for {kind}: must be > 0")]
    InvalidThreshold { kind: &'static str },
}

// ── Records ─────────────────────────────────────────────────────────

/// Which record stream a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChunkKind {
    Candles,
    Ticks,
}

impl ChunkKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            ChunkKind::Candles => "candles",
            ChunkKind::Ticks => "ticks",
        }
    }
}

/// One row of a candle chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleRecord {
    pub asset: String,
    pub timeframe_seconds: u32,
    pub boundary: i64,
    /// RFC 3339 UTC rendering of `boundary`.
    pub time: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl From<&Candle> for CandleRecord {
    fn from(candle: &Candle) -> Self {
        Self {
            asset: candle.asset.as_str().to_string(),
            timeframe_seconds: candle.timeframe.seconds(),
            boundary: candle.boundary,
            time: rfc3339(candle.boundary),
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
        }
    }
}

/// One row of a tick chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    pub asset: String,
    pub timestamp: i64,
    pub time: String,
    pub price: f64,
    pub volume: f64,
}

impl From<&Tick> for TickRecord {
    fn from(tick: &Tick) -> Self {
        Self {
            asset: tick.asset.as_str().to_string(),
            timestamp: tick.timestamp,
            time: rfc3339(tick.timestamp),
            price: tick.price,
            volume: tick.volume,
        }
    }
}

fn rfc3339(timestamp: i64) -> String {
    DateTime::from_timestamp(timestamp, 0)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for chunk storage.
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Root directory; `candles/` and `ticks/` are created beneath it.
    pub root: PathBuf,
    /// Candle records per chunk before rotation (default 100).
    pub max_candles_per_chunk: usize,
    /// Tick records per chunk before rotation (default 1000).
    pub max_ticks_per_chunk: usize,
    /// Fsync each chunk when it is closed.
    pub fsync_on_close: bool,
}

impl ChunkConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_candles_per_chunk: 100,
            max_ticks_per_chunk: 1_000,
            fsync_on_close: true,
        }
    }

    pub fn threshold(&self, kind: ChunkKind) -> usize {
        match kind {
            ChunkKind::Candles => self.max_candles_per_chunk,
            ChunkKind::Ticks => self.max_ticks_per_chunk,
        }
    }

    pub fn validate(&self) -> Result<(), ChunkError> {
        if self.max_candles_per_chunk == 0 {
            return Err(ChunkError::InvalidThreshold { kind: "candles" });
        }
        if self.max_ticks_per_chunk == 0 {
            return Err(ChunkError::InvalidThreshold { kind: "ticks" });
        }
        Ok(())
    }
}

// ── Naming ──────────────────────────────────────────────────────────

pub fn chunk_file_name(asset: &AssetId, timeframe: Timeframe, index: u64) -> String {
    format!("{}{:04}.csv", chunk_prefix(asset, timeframe), index)
}

fn chunk_prefix(asset: &AssetId, timeframe: Timeframe) -> String {
    format!("{}_{}_", asset.file_stem(), timeframe.label())
}

/// Parse the chunk index out of a file name belonging to `(asset, timeframe)`.
pub fn parse_chunk_index(file_name: &str, asset: &AssetId, timeframe: Timeframe) -> Option<u64> {
    file_name
        .strip_prefix(&chunk_prefix(asset, timeframe))?
        .strip_suffix(".csv")?
        .parse::<u64>()
        .ok()
}

fn find_latest_index(dir: &Path, asset: &AssetId, timeframe: Timeframe) -> Option<u64> {
    fs::read_dir(dir).ok().and_then(|entries| {
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                parse_chunk_index(&name, asset, timeframe)
            })
            .max()
    })
}

// ── Chunk Stream ────────────────────────────────────────────────────

/// Where a record landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendReceipt {
    pub path: PathBuf,
    pub index: u64,
    pub records_in_chunk: usize,
    /// The chunk reached its threshold with this record and was closed.
    pub rotated: bool,
    /// Set when closing the rotated chunk failed. The record itself is on disk.
    pub close_error: Option<String>,
}

struct OpenChunk {
    writer: csv::Writer<File>,
    path: PathBuf,
    index: u64,
    records: usize,
}

/// Sequence of rotating chunks for one `(kind, asset, timeframe)`.
pub struct ChunkStream {
    kind: ChunkKind,
    dir: PathBuf,
    asset: AssetId,
    timeframe: Timeframe,
    threshold: usize,
    fsync_on_close: bool,
    next_index: u64,
    open: Option<OpenChunk>,
    #[cfg(test)]
    fail_next_close: bool,
}

impl ChunkStream {
    /// Prepare a stream, creating its directory and resuming numbering.
    pub fn open(
        config: &ChunkConfig,
        kind: ChunkKind,
        asset: AssetId,
        timeframe: Timeframe,
    ) -> Result<Self, ChunkError> {
        let dir = config.root.join(kind.dir_name());
        fs::create_dir_all(&dir)?;

        let next_index = find_latest_index(&dir, &asset, timeframe)
            .map(|latest| latest + 1)
            .unwrap_or(0);

        debug!(
            kind = kind.dir_name(),
            asset = %asset,
            timeframe = %timeframe,
            next_index,
            "Chunk stream opened"
        );

        Ok(Self {
            kind,
            dir,
            asset,
            timeframe,
            threshold: config.threshold(kind),
            fsync_on_close: config.fsync_on_close,
            next_index,
            open: None,
            #[cfg(test)]
            fail_next_close: false,
        })
    }

    /// Append one record, rotating when the threshold is reached.
    ///
    /// If the write fails the open chunk is abandoned, so the next call
    /// starts a fresh chunk rather than appending after a torn row. Once the
    /// record is flushed the call succeeds; a failed rotation close is
    /// reported through [`AppendReceipt::close_error`].
    pub fn append<R: Serialize>(&mut self, record: &R) -> Result<AppendReceipt, ChunkError> {
        let mut chunk = match self.open.take() {
            Some(chunk) => chunk,
            None => self.create_chunk()?,
        };

        chunk.writer.serialize(record)?;
        chunk.writer.flush()?;
        chunk.records += 1;

        let mut receipt = AppendReceipt {
            path: chunk.path.clone(),
            index: chunk.index,
            records_in_chunk: chunk.records,
            rotated: false,
            close_error: None,
        };

        if chunk.records >= self.threshold {
            receipt.rotated = true;
            if let Err(err) = self.finish(chunk) {
                warn!(path = %receipt.path.display(), error = %err, "Rotated chunk failed to close");
                receipt.close_error = Some(err.to_string());
            }
        } else {
            self.open = Some(chunk);
        }

        Ok(receipt)
    }

    /// Close the open chunk, if any. Returns its path.
    pub fn close(&mut self) -> Result<Option<PathBuf>, ChunkError> {
        match self.open.take() {
            Some(chunk) => self.finish(chunk).map(Some),
            None => Ok(None),
        }
    }

    /// Drop the open chunk handle without further writes.
    pub fn abandon(&mut self) {
        if let Some(chunk) = self.open.take() {
            warn!(path = %chunk.path.display(), records = chunk.records, "Abandoning chunk");
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn create_chunk(&mut self) -> Result<OpenChunk, ChunkError> {
        let index = self.next_index;
        let path = self
            .dir
            .join(chunk_file_name(&self.asset, self.timeframe, index));

        // create_new: never clobber an existing chunk
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        self.next_index += 1;

        debug!(path = %path.display(), "Chunk created");

        Ok(OpenChunk {
            writer: csv::WriterBuilder::new().has_headers(true).from_writer(file),
            path,
            index,
            records: 0,
        })
    }

    fn finish(&mut self, mut chunk: OpenChunk) -> Result<PathBuf, ChunkError> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_close) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected close failure").into());
        }

        chunk.writer.flush()?;
        let file = chunk.writer.into_inner().map_err(|e| e.into_error())?;
        if self.fsync_on_close {
            file.sync_all()?;
        }

        info!(
            kind = self.kind.dir_name(),
            path = %chunk.path.display(),
            records = chunk.records,
            "Chunk closed"
        );
        Ok(chunk.path)
    }
}

// ── Chunk Store ─────────────────────────────────────────────────────

type StreamKey = (ChunkKind, AssetId, Timeframe);

/// All chunk streams under one storage root.
///
/// Uses BTreeMap so close order is deterministic.
pub struct ChunkStore {
    config: ChunkConfig,
    streams: BTreeMap<StreamKey, ChunkStream>,
}

impl ChunkStore {
    pub fn new(config: ChunkConfig) -> Result<Self, ChunkError> {
        config.validate()?;
        fs::create_dir_all(config.root.join(ChunkKind::Candles.dir_name()))?;
        fs::create_dir_all(config.root.join(ChunkKind::Ticks.dir_name()))?;
        Ok(Self {
            config,
            streams: BTreeMap::new(),
        })
    }

    pub fn append_candle(&mut self, candle: &Candle) -> Result<AppendReceipt, ChunkError> {
        let record = CandleRecord::from(candle);
        self.stream(ChunkKind::Candles, &candle.asset, candle.timeframe)?
            .append(&record)
    }

    /// Ticks are filed under the session timeframe they were streamed with.
    pub fn append_tick(
        &mut self,
        tick: &Tick,
        timeframe: Timeframe,
    ) -> Result<AppendReceipt, ChunkError> {
        let record = TickRecord::from(tick);
        self.stream(ChunkKind::Ticks, &tick.asset, timeframe)?
            .append(&record)
    }

    /// Drop the open handle of one stream (used before a retry).
    pub fn abandon(&mut self, kind: ChunkKind, asset: &AssetId, timeframe: Timeframe) {
        if let Some(stream) = self.streams.get_mut(&(kind, asset.clone(), timeframe)) {
            stream.abandon();
        }
    }

    /// Close every open chunk and forget all streams.
    ///
    /// Every stream is closed even if an earlier one fails; the first
    /// error is returned.
    pub fn close_all(&mut self) -> Result<usize, ChunkError> {
        let mut closed = 0;
        let mut first_error = None;

        for (_, mut stream) in std::mem::take(&mut self.streams) {
            match stream.close() {
                Ok(Some(_)) => closed += 1,
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "Failed to close chunk");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(closed),
        }
    }

    /// Make the next chunk close of one stream fail.
    #[cfg(test)]
    pub(crate) fn fail_next_close(
        &mut self,
        kind: ChunkKind,
        asset: &AssetId,
        timeframe: Timeframe,
    ) -> Result<(), ChunkError> {
        self.stream(kind, asset, timeframe)?.fail_next_close = true;
        Ok(())
    }

    /// Number of chunks currently holding an open file handle.
    pub fn open_chunks(&self) -> usize {
        self.streams.values().filter(|s| s.is_open()).count()
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    fn stream(
        &mut self,
        kind: ChunkKind,
        asset: &AssetId,
        timeframe: Timeframe,
    ) -> Result<&mut ChunkStream, ChunkError> {
        match self.streams.entry((kind, asset.clone(), timeframe)) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let stream = ChunkStream::open(&self.config, kind, asset.clone(), timeframe)?;
                Ok(entry.insert(stream))
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
