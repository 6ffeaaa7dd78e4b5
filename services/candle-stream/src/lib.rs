//! Candle Stream Service
//!
//! Turns raw tick frames captured from a trading platform into OHLC candles
//! and delivers them to a rendering client, while persisting closed candles
//! and raw ticks to rotating CSV chunks.
//!
//! - Frame decoding with per-reason rejection counters
//! - Boundary-aligned candle aggregation with stale-tick rejection
//! - Session state machine (idle / ready / detecting / streaming / error)
//! - Bounded, latest-wins delivery buffer drained on a fixed cadence
//! - Reconnection handling that resets every stateful component
//! - Deterministic replay with candle checksums
//!
//! # Architecture
//!
//! ```text
//!  capture payloads          transport signals       operator actions
//!        │                          │                       │
//!   ┌────▼────┐             ┌───────▼───────┐       ┌───────▼───────┐
//!   │ Decoder │             │  Reconnection │──────▶│ Session state │
//!   └────┬────┘             └───────────────┘       └───────┬───────┘
//!        │ ticks                                            │
//!   ┌────▼───────┐    closed candles / ticks    ┌───────────▼─┐
//!   │ Aggregator │─────────────────────────────▶│ Persistence │
//!   └────┬───────┘                              └─────────────┘
//!        │ candles
//!   ┌────▼────────────┐   drain cadence   ┌──────────────┐
//!   │ Delivery buffer │──────────────────▶│  Event sink  │
//!   └─────────────────┘                   └──────────────┘
//! ```

pub mod candles;
pub mod config;
pub mod decoder;
pub mod delivery;
pub mod events;
pub mod metrics;
pub mod pipeline;
pub mod reconnect;
pub mod replay;
pub mod session;

// Library version
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
