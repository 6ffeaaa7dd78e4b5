//! Events delivered to the rendering client
//!
//! Three shapes: `candle_update` (in-progress, on the drain cadence),
//! `candle_closed` (once per finished boundary) and `stream_state` (on every
//! session transition). Payload fields are camelCase on the wire.
//!
//! Delivery is at-least-once, latest-wins; the [`EventSink`] seam lets the
//! surrounding application choose the push mechanism.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};
use types::ids::SessionId;
use types::market::Candle;

use crate::delivery::BufferEntry;
use crate::session::{StreamState, Transition};

/// Candle fields as seen by the rendering client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandlePayload {
    pub asset: String,
    pub timeframe_seconds: u32,
    pub boundary_timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl From<&Candle> for CandlePayload {
    fn from(candle: &Candle) -> Self {
        Self {
            asset: candle.asset.as_str().to_string(),
            timeframe_seconds: candle.timeframe.seconds(),
            boundary_timestamp: candle.boundary,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatePayload {
    pub state: StreamState,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub asset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub session_id: SessionId,
}

impl From<&Transition> for StreamStatePayload {
    fn from(t: &Transition) -> Self {
        Self {
            state: t.to,
            asset: t.asset.as_ref().map(|a| a.as_str().to_string()),
            error: t.error.clone(),
            session_id: t.session_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    CandleUpdate(CandlePayload),
    CandleClosed(CandlePayload),
    StreamState(StreamStatePayload),
}

impl StreamEvent {
    pub fn from_entry(entry: &BufferEntry) -> Self {
        let payload = CandlePayload::from(&entry.candle);
        if entry.is_closed {
            StreamEvent::CandleClosed(payload)
        } else {
            StreamEvent::CandleUpdate(payload)
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::CandleUpdate(_) => "candle_update",
            StreamEvent::CandleClosed(_) => "candle_closed",
            StreamEvent::StreamState(_) => "stream_state",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<&Transition> for StreamEvent {
    fn from(t: &Transition) -> Self {
        StreamEvent::StreamState(StreamStatePayload::from(t))
    }
}

/// Push seam towards the rendering client. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: StreamEvent);
}

/// Fan-out over a tokio broadcast channel; slow receivers lag and skip.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<StreamEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: StreamEvent) {
        if self.tx.send(event).is_err() {
            debug!("No rendering client subscribed; event dropped");
        }
    }
}

/// Writes every event to the log; used by headless tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: StreamEvent) {
        match &event {
            StreamEvent::StreamState(state) => {
                info!(state = %state.state, asset = ?state.asset, error = ?state.error, "stream_state");
            }
            StreamEvent::CandleUpdate(c) | StreamEvent::CandleClosed(c) => {
                debug!(
                    event = event.name(),
                    asset = %c.asset,
                    boundary = c.boundary_timestamp,
                    open = c.open,
                    high = c.high,
                    low = c.low,
                    close = c.close,
                    "candle"
                );
            }
        }
    }
}
