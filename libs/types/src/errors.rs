//! Error types for the streaming pipeline
//!
//! Per-frame and per-write faults are recovered locally by the component
//! that sees them; only session-level failures reach the operator.

use thiserror::Error;

/// Reasons a raw capture payload could not become a tick.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Payload is not valid UTF-8")]
    NotUtf8,

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Empty asset name")]
    EmptyAsset,

    #[error("Unsupported payload shape")]
    UnsupportedShape,
}

impl DecodeError {
    /// Stable label used as a counter key.
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::NotUtf8 => "not_utf8",
            DecodeError::InvalidJson(_) => "invalid_json",
            DecodeError::MissingField(_) => "missing_field",
            DecodeError::InvalidPrice(_) => "invalid_price",
            DecodeError::InvalidTimestamp(_) => "invalid_timestamp",
            DecodeError::EmptyAsset => "empty_asset",
            DecodeError::UnsupportedShape => "unsupported_shape",
        }
    }
}

/// Session lifecycle errors surfaced to the operator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Invalid transition: {action} not allowed in state {state}")]
    InvalidTransition { state: String, action: &'static str },

    #[error("Session already streaming {asset}; stop it before starting another")]
    AlreadyStreaming { asset: String },

    #[error("Asset detection failed: {reason}")]
    DetectionFailed { reason: String },

    #[error("Asset detection timed out after {timeout_ms}ms")]
    DetectionTimeout { timeout_ms: u64 },
}

/// Invalid configuration values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid timeframe: {0}s (must be > 0)")]
    InvalidTimeframe(u32),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
