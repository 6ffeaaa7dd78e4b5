//! Chunk Reader: sequential reads over rotated chunk files
//!
//! Used by verification tooling and tests. Chunks are listed in index order,
//! so concatenating them yields records in the order they were written.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;
use types::ids::AssetId;
use types::market::Timeframe;

use crate::chunk::{parse_chunk_index, CandleRecord, ChunkKind, TickRecord};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Boundary not increasing: prev={prev}, current={current}")]
    NotMonotonic { prev: i64, current: i64 },
}

// ── Listing ─────────────────────────────────────────────────────────

/// A chunk file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub index: u64,
    pub path: PathBuf,
}

/// List the chunks of one stream, sorted by index.
///
/// A missing directory yields an empty list.
pub fn list_chunks(
    root: &Path,
    kind: ChunkKind,
    asset: &AssetId,
    timeframe: Timeframe,
) -> Result<Vec<ChunkInfo>, ReaderError> {
    let dir = root.join(kind.dir_name());
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut chunks: Vec<ChunkInfo> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            parse_chunk_index(&name, asset, timeframe).map(|index| ChunkInfo {
                index,
                path: e.path(),
            })
        })
        .collect();

    chunks.sort_by_key(|c| c.index);
    Ok(chunks)
}

// ── Reading ─────────────────────────────────────────────────────────

fn read_records<R: DeserializeOwned>(path: &Path) -> Result<Vec<R>, ReaderError> {
    let csv_err = |source| ReaderError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(csv_err)?;

    reader
        .deserialize()
        .collect::<Result<Vec<R>, csv::Error>>()
        .map_err(csv_err)
}

pub fn read_candle_chunk(path: &Path) -> Result<Vec<CandleRecord>, ReaderError> {
    read_records(path)
}

pub fn read_tick_chunk(path: &Path) -> Result<Vec<TickRecord>, ReaderError> {
    read_records(path)
}

/// Read every candle persisted for `(asset, timeframe)` across all chunks.
pub fn read_all_candles(
    root: &Path,
    asset: &AssetId,
    timeframe: Timeframe,
) -> Result<Vec<CandleRecord>, ReaderError> {
    let mut all = Vec::new();
    for chunk in list_chunks(root, ChunkKind::Candles, asset, timeframe)? {
        all.extend(read_candle_chunk(&chunk.path)?);
    }
    Ok(all)
}

/// Check that persisted candle boundaries strictly increase (no duplicates).
pub fn verify_candle_sequence(records: &[CandleRecord]) -> Result<(), ReaderError> {
    for pair in records.windows(2) {
        if pair[1].boundary <= pair[0].boundary {
            return Err(ReaderError::NotMonotonic {
                prev: pair[0].boundary,
                current: pair[1].boundary,
            });
        }
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────
