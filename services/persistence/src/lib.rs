//! Persistence service for the candle stream
//!
//! Provides append-only, record-count rotated CSV chunks for closed candles
//! and raw ticks, a reader for verification, and an asynchronous sink that
//! keeps disk I/O off the real-time ingestion path.
//!
//! # Layout
//! ```text
//! <root>/candles/{ASSET}_{TIMEFRAME}_{INDEX}.csv
//! <root>/ticks/{ASSET}_{TIMEFRAME}_{INDEX}.csv
//! ```
//! Each chunk holds one header row followed by one row per record.

pub mod chunk;
pub mod reader;
pub mod sink;
