//! Session State Machine
//!
//! Governs when ingestion and aggregation are active:
//!
//! ```text
//!           connect            request_detection         resolve_detection
//!   idle ───────────▶ ready ───────────────────▶ detecting ─────────────────▶ asset_detected
//!    ▲                 ▲  │                      │  ▲                               │
//!    │                 │  │         fail/timeout ▼  │ retry_detection               │ start_stream
//!    │                 │  │                     error                             ▼
//!    │                 └──┼────────────────────────────────────────────────── streaming
//!    │                    │                          stop_stream
//!    └── disconnect (from any state) ──────────────────────────────────────────────────
//! ```
//!
//! Nothing advances automatically: detection and streaming each require an
//! explicit operator action, and a disconnect always lands in `idle`.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};
use types::errors::SessionError;
use types::ids::{AssetId, SessionId};
use types::market::Timeframe;

/// Lifecycle states of the streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Ready,
    Detecting,
    AssetDetected,
    Streaming,
    Error,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Ready => "ready",
            StreamState::Detecting => "detecting",
            StreamState::AssetDetected => "asset_detected",
            StreamState::Streaming => "streaming",
            StreamState::Error => "error",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single active streaming context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub asset: Option<AssetId>,
    pub timeframe: Timeframe,
    pub state: StreamState,
    /// Boundary of the newest candle seen while streaming.
    pub last_boundary: Option<i64>,
    pub last_error: Option<String>,
}

impl Session {
    fn new(timeframe: Timeframe) -> Self {
        Self {
            id: SessionId::new(),
            asset: None,
            timeframe,
            state: StreamState::Idle,
            last_boundary: None,
            last_error: None,
        }
    }
}

/// A state change, as reported to the operator-facing collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub session_id: SessionId,
    pub from: StreamState,
    pub to: StreamState,
    pub asset: Option<AssetId>,
    pub error: Option<String>,
}

/// Owns the [`Session`] and enforces the allowed transitions.
#[derive(Debug)]
pub struct SessionStateMachine {
    session: Session,
    detection_timeout: Duration,
    detection_deadline: Option<Instant>,
    transitions: u64,
}

impl SessionStateMachine {
    pub fn new(default_timeframe: Timeframe, detection_timeout: Duration) -> Self {
        Self {
            session: Session::new(default_timeframe),
            detection_timeout,
            detection_deadline: None,
            transitions: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.session.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_streaming(&self) -> bool {
        self.session.state == StreamState::Streaming
    }

    /// Deadline of the running detection, if any.
    pub fn detection_deadline(&self) -> Option<Instant> {
        self.detection_deadline
    }

    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    /// `idle → ready`. A new session id is minted.
    pub fn connect(&mut self) -> Result<Transition, SessionError> {
        self.expect_state(StreamState::Idle, "connect")?;
        let timeframe = self.session.timeframe;
        self.session = Session::new(timeframe);
        Ok(self.transition(StreamState::Ready))
    }

    /// `ready → detecting`, arming the detection timeout.
    pub fn request_detection(&mut self) -> Result<Transition, SessionError> {
        self.expect_state(StreamState::Ready, "request_detection")?;
        self.begin_detection()
    }

    /// `error → detecting`: the only way out of `error` besides a disconnect.
    pub fn retry_detection(&mut self) -> Result<Transition, SessionError> {
        self.expect_state(StreamState::Error, "retry_detection")?;
        self.session.last_error = None;
        self.begin_detection()
    }

    /// `detecting → asset_detected`.
    pub fn resolve_detection(&mut self, asset: AssetId) -> Result<Transition, SessionError> {
        self.expect_state(StreamState::Detecting, "resolve_detection")?;
        self.detection_deadline = None;
        self.session.asset = Some(asset);
        Ok(self.transition(StreamState::AssetDetected))
    }

    /// `detecting → error` with an operator-visible reason.
    pub fn fail_detection(&mut self, reason: impl Into<String>) -> Result<Transition, SessionError> {
        self.expect_state(StreamState::Detecting, "fail_detection")?;
        let err = SessionError::DetectionFailed {
            reason: reason.into(),
        };
        Ok(self.enter_error(err))
    }

    /// Move to `error` if detection has outlived its deadline.
    pub fn check_detection_timeout(&mut self, now: Instant) -> Option<Transition> {
        let deadline = self.detection_deadline?;
        if self.session.state != StreamState::Detecting || now < deadline {
            return None;
        }
        let err = SessionError::DetectionTimeout {
            timeout_ms: self.detection_timeout.as_millis() as u64,
        };
        Some(self.enter_error(err))
    }

    /// `asset_detected → streaming` for the given timeframe.
    ///
    /// Starting while already streaming is rejected; the current stream
    /// must be stopped explicitly first.
    pub fn start_stream(&mut self, timeframe: Timeframe) -> Result<Transition, SessionError> {
        if self.session.state == StreamState::Streaming {
            let asset = self
                .session
                .asset
                .as_ref()
                .map(|a| a.to_string())
                .unwrap_or_default();
            warn!(
                session_id = %self.session.id,
                asset = %asset,
                "Rejected start_stream: a session is already streaming"
            );
            return Err(SessionError::AlreadyStreaming { asset });
        }
        self.expect_state(StreamState::AssetDetected, "start_stream")?;
        self.session.timeframe = timeframe;
        self.session.last_boundary = None;
        Ok(self.transition(StreamState::Streaming))
    }

    /// `streaming → ready`. The detected asset is kept for reference only;
    /// streaming again requires a new detection.
    pub fn stop_stream(&mut self) -> Result<Transition, SessionError> {
        self.expect_state(StreamState::Streaming, "stop_stream")?;
        Ok(self.transition(StreamState::Ready))
    }

    /// Any state `→ idle`. Returns `None` when already idle.
    pub fn disconnect(&mut self) -> Option<Transition> {
        if self.session.state == StreamState::Idle {
            return None;
        }
        self.detection_deadline = None;
        self.session.asset = None;
        self.session.last_boundary = None;
        self.session.last_error = None;
        Some(self.transition(StreamState::Idle))
    }

    /// Record the boundary of the newest candle while streaming.
    pub fn record_boundary(&mut self, boundary: i64) {
        if self.is_streaming() {
            self.session.last_boundary = Some(boundary);
        }
    }

    fn begin_detection(&mut self) -> Result<Transition, SessionError> {
        self.session.asset = None;
        self.detection_deadline = Some(Instant::now() + self.detection_timeout);
        Ok(self.transition(StreamState::Detecting))
    }

    fn enter_error(&mut self, err: SessionError) -> Transition {
        self.detection_deadline = None;
        self.session.last_error = Some(err.to_string());
        self.transition(StreamState::Error)
    }

    fn expect_state(&self, expected: StreamState, action: &'static str) -> Result<(), SessionError> {
        if self.session.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                state: self.session.state.to_string(),
                action,
            })
        }
    }

    fn transition(&mut self, to: StreamState) -> Transition {
        let from = self.session.state;
        self.session.state = to;
        self.transitions += 1;

        let transition = Transition {
            session_id: self.session.id,
            from,
            to,
            asset: self.session.asset.clone(),
            error: if to == StreamState::Error {
                self.session.last_error.clone()
            } else {
                None
            },
        };

        info!(
            session_id = %transition.session_id,
            from = %from,
            to = %to,
            asset = ?transition.asset.as_ref().map(|a| a.as_str()),
            error = ?transition.error,
            "Session transition"
        );
        transition
    }
}
