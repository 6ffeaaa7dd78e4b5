//! Reconnection Coordinator
//!
//! Reacts to transport signals from the capture layer. A disconnect resets
//! every stateful component deterministically; a reconnect only makes the
//! session `ready` again. Detection and streaming are never resumed on the
//! operator's behalf.

use tracing::{error, info, warn};
use types::market::Candle;

use crate::candles::CandleAggregator;
use crate::delivery::DeliveryBuffer;
use crate::session::{SessionStateMachine, Transition};
use persistence::sink::PersistenceSink;

/// What a disconnect tore down.
#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectReport {
    pub transition: Transition,
    /// In-progress candle dropped because the gap makes it untrustworthy.
    pub discarded: Option<Candle>,
    pub buffer_cleared: usize,
    pub chunks_closed: usize,
}

#[derive(Debug, Default)]
pub struct ReconnectionCoordinator {
    disconnects: u64,
    reconnects: u64,
    ignored_signals: u64,
}

impl ReconnectionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport lost: drive the session to `idle`, discard the in-progress
    /// candle, clear the delivery buffer and close open chunks.
    ///
    /// Repeated signals while already idle are no-ops.
    pub async fn on_disconnect(
        &mut self,
        machine: &mut SessionStateMachine,
        aggregator: &mut Option<CandleAggregator>,
        buffer: &DeliveryBuffer,
        sink: Option<&PersistenceSink>,
    ) -> Option<DisconnectReport> {
        let Some(transition) = machine.disconnect() else {
            self.ignored_signals += 1;
            return None;
        };
        self.disconnects += 1;

        let discarded = aggregator.take().and_then(|mut agg| agg.discard_current());
        let buffer_cleared = buffer.clear();

        let chunks_closed = match sink {
            Some(sink) => match sink.close_session().await {
                Ok(report) => {
                    if let Some(err) = report.error {
                        error!(error = %err, "Chunk close failed during disconnect");
                    }
                    report.chunks_closed
                }
                Err(err) => {
                    error!(error = %err, "Persistence unavailable during disconnect");
                    0
                }
            },
            None => 0,
        };

        warn!(
            session_id = %transition.session_id,
            from = %transition.from,
            discarded_boundary = ?discarded.as_ref().map(|c| c.boundary),
            buffer_cleared,
            chunks_closed,
            "Transport lost: session reset"
        );

        Some(DisconnectReport {
            transition,
            discarded,
            buffer_cleared,
            chunks_closed,
        })
    }

    /// Transport restored: `idle → ready` only. Ignored unless idle.
    pub fn on_connect(&mut self, machine: &mut SessionStateMachine) -> Option<Transition> {
        match machine.connect() {
            Ok(transition) => {
                self.reconnects += 1;
                info!(session_id = %transition.session_id, "Transport connected: session ready");
                Some(transition)
            }
            Err(_) => {
                self.ignored_signals += 1;
                None
            }
        }
    }

    pub fn disconnects(&self) -> u64 {
        self.disconnects
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn ignored_signals(&self) -> u64 {
        self.ignored_signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{BufferEntry, DeliveryConfig};
    use crate::session::StreamState;
    use std::time::Duration;
    use types::ids::AssetId;
    use types::market::{Tick, Timeframe};

    fn streaming_machine() -> SessionStateMachine {
        let mut sm = SessionStateMachine::new(Timeframe::S30, Duration::from_secs(5));
        sm.connect().unwrap();
        sm.request_detection().unwrap();
        sm.resolve_detection(AssetId::new("EURUSD_otc")).unwrap();
        sm.start_stream(Timeframe::S30).unwrap();
        sm
    }

    #[tokio::test]
    async fn test_disconnect_resets_everything() {
        let mut sm = streaming_machine();
        let mut agg = CandleAggregator::new(AssetId::new("EURUSD_otc"), Timeframe::S30);
        agg.ingest(&Tick::new(AssetId::new("EURUSD_otc"), 1.0, 31));
        let mut aggregator = Some(agg);

        let buffer = DeliveryBuffer::new(DeliveryConfig::default());
        let current = aggregator.as_ref().unwrap().current().cloned().unwrap();
        buffer.push(BufferEntry::in_progress(current));

        let mut coordinator = ReconnectionCoordinator::new();
        let report = coordinator
            .on_disconnect(&mut sm, &mut aggregator, &buffer, None)
            .await
            .unwrap();

        assert_eq!(report.transition.to, StreamState::Idle);
        assert_eq!(report.discarded.unwrap().boundary, 30);
        assert_eq!(report.buffer_cleared, 1);
        assert!(aggregator.is_none());
        assert!(buffer.is_empty());
        assert_eq!(sm.state(), StreamState::Idle);
    }

    #[tokio::test]
    async fn test_repeated_disconnect_is_noop() {
        let mut sm = streaming_machine();
        let mut aggregator = None;
        let buffer = DeliveryBuffer::default();
        let mut coordinator = ReconnectionCoordinator::new();

        assert!(coordinator
            .on_disconnect(&mut sm, &mut aggregator, &buffer, None)
            .await
            .is_some());
        assert!(coordinator
            .on_disconnect(&mut sm, &mut aggregator, &buffer, None)
            .await
            .is_none());
        assert_eq!(coordinator.disconnects(), 1);
        assert_eq!(coordinator.ignored_signals(), 1);
    }

    #[test]
    fn test_reconnect_only_reaches_ready() {
        let mut sm = SessionStateMachine::new(Timeframe::S30, Duration::from_secs(5));
        let mut coordinator = ReconnectionCoordinator::new();

        let t = coordinator.on_connect(&mut sm).unwrap();
        assert_eq!(t.to, StreamState::Ready);
        assert!(coordinator.on_connect(&mut sm).is_none());
        assert_eq!(sm.state(), StreamState::Ready);
        assert_eq!(coordinator.reconnects(), 1);
    }
}
