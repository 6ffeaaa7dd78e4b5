//! Runtime configuration
//!
//! Defaults are usable as-is; every field can be overridden through a
//! `CANDLE_STREAM_*` environment variable.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use persistence::chunk::ChunkConfig;
use persistence::sink::SinkConfig;
use types::errors::ConfigError;
use types::market::Timeframe;

use crate::delivery::DeliveryConfig;

const ENV_PREFIX: &str = "CANDLE_STREAM_";

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Root for `candles/` and `ticks/` chunk directories.
    pub data_dir: PathBuf,
    /// Timeframe used when the operator does not pick one.
    pub default_timeframe: Timeframe,
    pub detection_timeout_ms: u64,
    /// Cadence of delivery buffer drains.
    pub drain_interval_ms: u64,
    pub buffer_capacity: usize,
    pub max_candles_per_chunk: usize,
    pub max_ticks_per_chunk: usize,
    /// Also persist raw ticks, not only closed candles.
    pub persist_ticks: bool,
    /// Ticks allowed to wait for the persistence writer.
    pub persistence_queue_capacity: usize,
    pub fsync_on_close: bool,
    /// Broadcast channel depth towards rendering clients.
    pub event_channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            default_timeframe: Timeframe::M1,
            detection_timeout_ms: 15_000,
            drain_interval_ms: 100,
            buffer_capacity: 1_000,
            max_candles_per_chunk: 100,
            max_ticks_per_chunk: 1_000,
            persist_ticks: true,
            persistence_queue_capacity: 4_096,
            fsync_on_close: true,
            event_channel_capacity: 1_024,
        }
    }
}

impl StreamConfig {
    /// Defaults overridden by `CANDLE_STREAM_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable source (keys include the prefix).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let d = Self::default();

        let timeframe_seconds = vars.parse("TIMEFRAME_SECONDS", d.default_timeframe.seconds())?;

        let config = Self {
            data_dir: vars
                .string("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.data_dir),
            default_timeframe: Timeframe::from_seconds(timeframe_seconds)?,
            detection_timeout_ms: vars.parse("DETECTION_TIMEOUT_MS", d.detection_timeout_ms)?,
            drain_interval_ms: vars.parse("DRAIN_INTERVAL_MS", d.drain_interval_ms)?,
            buffer_capacity: vars.parse("BUFFER_CAPACITY", d.buffer_capacity)?,
            max_candles_per_chunk: vars.parse("MAX_CANDLES_PER_CHUNK", d.max_candles_per_chunk)?,
            max_ticks_per_chunk: vars.parse("MAX_TICKS_PER_CHUNK", d.max_ticks_per_chunk)?,
            persist_ticks: vars.flag("PERSIST_TICKS", d.persist_ticks),
            persistence_queue_capacity: vars
                .parse("PERSISTENCE_QUEUE_CAPACITY", d.persistence_queue_capacity)?,
            fsync_on_close: vars.flag("FSYNC_ON_CLOSE", d.fsync_on_close),
            event_channel_capacity: vars.parse("EVENT_CHANNEL_CAPACITY", d.event_channel_capacity)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or unbound the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&'static str, u64); 7] = [
            ("detection_timeout_ms", self.detection_timeout_ms),
            ("drain_interval_ms", self.drain_interval_ms),
            ("buffer_capacity", self.buffer_capacity as u64),
            ("max_candles_per_chunk", self.max_candles_per_chunk as u64),
            ("max_ticks_per_chunk", self.max_ticks_per_chunk as u64),
            ("persistence_queue_capacity", self.persistence_queue_capacity as u64),
            ("event_channel_capacity", self.event_channel_capacity as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be > 0".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn detection_timeout(&self) -> Duration {
        Duration::from_millis(self.detection_timeout_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            capacity: self.buffer_capacity,
        }
    }

    pub fn sink_config(&self) -> SinkConfig {
        SinkConfig {
            chunk: ChunkConfig {
                root: self.data_dir.clone(),
                max_candles_per_chunk: self.max_candles_per_chunk,
                max_ticks_per_chunk: self.max_ticks_per_chunk,
                fsync_on_close: self.fsync_on_close,
            },
            queue_capacity: self.persistence_queue_capacity,
        }
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{}{}", ENV_PREFIX, name))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, name: &'static str, default: T) -> Result<T, ConfigError> {
        match self.string(name) {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                field: name,
                reason: format!("cannot parse {:?}", raw),
            }),
            None => Ok(default),
        }
    }

    fn flag(&self, name: &str, default: bool) -> bool {
        self.string(name)
            .map(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"))
            .unwrap_or(default)
    }
}
