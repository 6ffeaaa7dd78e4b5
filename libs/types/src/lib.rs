//! Types library for the tick-to-candle streaming pipeline
//!
//! This library provides the strongly-typed values shared by the stream
//! runtime and the persistence service. Everything downstream of the frame
//! decoder works on these types only.
//!
//! # Modules
//! - `ids`: Identifiers (AssetId, SessionId)
//! - `market`: Tick, Candle and Timeframe
//! - `errors`: Error taxonomy

// Public modules
pub mod ids;
pub mod market;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::market::*;
    pub use crate::errors::*;
}
