//! Stream runtime
//!
//! [`StreamRuntime`] is the single producer: it decodes capture payloads,
//! drives the aggregator for the active session, pushes into the delivery
//! buffer and hands records to the persistence sink. Operator actions are
//! plain methods; [`run_stream`] multiplexes capture input, commands and the
//! detection deadline for a supervised deployment.
//!
//! ```text
//! capture ──▶ FrameDecoder ──▶ CandleAggregator ──┬──▶ DeliveryBuffer ──(drain task)──▶ EventSink
//!                                  ▲              └──▶ PersistenceSink ──(writer thread)──▶ chunks
//!                    SessionStateMachine ◀── ReconnectionCoordinator ◀── transport signals
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use persistence::sink::{PersistenceSink, SinkError, SinkStatsSnapshot};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use types::errors::{ConfigError, SessionError};
use types::ids::AssetId;
use types::market::{Candle, Tick, Timeframe};

use crate::candles::{CandleAggregator, IngestOutcome};
use crate::config::StreamConfig;
use crate::decoder::FrameDecoder;
use crate::delivery::{BufferEntry, DeliveryBuffer, PushOutcome};
use crate::events::{EventSink, StreamEvent};
use crate::metrics::PipelineMetrics;
use crate::reconnect::ReconnectionCoordinator;
use crate::session::{Session, SessionStateMachine, StreamState, Transition};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum StreamError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] SinkError),

    #[error("Stream runtime has stopped")]
    RuntimeStopped,
}

// ── Inputs ──────────────────────────────────────────────────────────

/// What the capture collaborator feeds the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureInput {
    Payload(Vec<u8>),
    Connected,
    Disconnected,
}

type Reply<T> = oneshot::Sender<Result<T, StreamError>>;

/// Operator actions sent to a running [`run_stream`] loop.
#[derive(Debug)]
pub enum StreamCommand {
    RequestDetection { reply: Reply<StreamState> },
    ResolveDetection { asset: AssetId, reply: Reply<StreamState> },
    FailDetection { reason: String, reply: Reply<StreamState> },
    RetryDetection { reply: Reply<StreamState> },
    StartStream { timeframe: Option<Timeframe>, reply: Reply<StreamState> },
    StopStream { reply: Reply<StreamState> },
    Status { reply: oneshot::Sender<StatusSnapshot> },
}

/// Point-in-time view of the runtime.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub session: Session,
    pub current_candle: Option<Candle>,
    pub buffered: usize,
    pub metrics: BTreeMap<String, u64>,
    pub persistence: Option<SinkStatsSnapshot>,
}

// ── Runtime ─────────────────────────────────────────────────────────

pub struct StreamRuntime {
    config: StreamConfig,
    machine: SessionStateMachine,
    /// Present only while streaming.
    aggregator: Option<CandleAggregator>,
    decoder: FrameDecoder,
    buffer: Arc<DeliveryBuffer>,
    sink: Option<PersistenceSink>,
    events: Arc<dyn EventSink>,
    metrics: Arc<PipelineMetrics>,
    coordinator: ReconnectionCoordinator,
}

impl StreamRuntime {
    /// `sink` is optional so the runtime can run purely in memory.
    pub fn new(
        config: StreamConfig,
        events: Arc<dyn EventSink>,
        sink: Option<PersistenceSink>,
    ) -> Result<Self, StreamError> {
        config.validate()?;

        info!(
            default_timeframe = %config.default_timeframe,
            drain_interval_ms = config.drain_interval_ms,
            buffer_capacity = config.buffer_capacity,
            persistence = sink.is_some(),
            "Stream runtime initialized"
        );

        Ok(Self {
            machine: SessionStateMachine::new(config.default_timeframe, config.detection_timeout()),
            aggregator: None,
            decoder: FrameDecoder::new(),
            buffer: Arc::new(DeliveryBuffer::new(config.delivery_config())),
            sink,
            events,
            metrics: Arc::new(PipelineMetrics::new()),
            coordinator: ReconnectionCoordinator::new(),
            config,
        })
    }

    /// Open the persistence sink described by `config` and build a runtime.
    pub fn with_persistence(
        config: StreamConfig,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, StreamError> {
        let sink = PersistenceSink::spawn(config.sink_config())?;
        Self::new(config, events, Some(sink))
    }

    pub fn state(&self) -> StreamState {
        self.machine.state()
    }

    pub fn session(&self) -> &Session {
        self.machine.session()
    }

    pub fn aggregator(&self) -> Option<&CandleAggregator> {
        self.aggregator.as_ref()
    }

    pub fn buffer(&self) -> Arc<DeliveryBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn events(&self) -> Arc<dyn EventSink> {
        Arc::clone(&self.events)
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn detection_deadline(&self) -> Option<Instant> {
        self.machine.detection_deadline()
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            session: self.machine.session().clone(),
            current_candle: self.aggregator.as_ref().and_then(|a| a.current().cloned()),
            buffered: self.buffer.len(),
            metrics: self.metrics.export(),
            persistence: self.sink.as_ref().map(|s| s.stats()),
        }
    }

    // ── Ingestion ───────────────────────────────────────────────────

    /// Decode one capture payload and fold its ticks. Returns ticks decoded.
    ///
    /// Never fails: malformed frames, stale and foreign ticks are counted.
    pub fn handle_payload(&mut self, raw: &[u8]) -> usize {
        let started = std::time::Instant::now();
        PipelineMetrics::incr(&self.metrics.frames_received);

        let rejected_before = self.decoder.rejected_total();
        let ticks = self.decoder.decode_all(raw);
        let rejected = self.decoder.rejected_total() - rejected_before;
        PipelineMetrics::add(&self.metrics.rejected_ticks, rejected);
        PipelineMetrics::add(&self.metrics.ticks_decoded, ticks.len() as u64);

        let decoded = ticks.len();
        for tick in ticks {
            self.ingest_tick(tick);
        }

        self.metrics.record_ingest(started.elapsed().as_nanos() as u64);
        decoded
    }

    /// Fold one decoded tick into the active session, if any.
    pub fn ingest_tick(&mut self, tick: Tick) {
        let outcome = match self.aggregator.as_mut() {
            Some(aggregator) if self.machine.is_streaming() => aggregator.ingest(&tick),
            _ => {
                PipelineMetrics::incr(&self.metrics.ticks_while_inactive);
                return;
            }
        };

        match outcome {
            IngestOutcome::Updated { candle, closed } => {
                if self.config.persist_ticks {
                    if let Some(sink) = &self.sink {
                        if !sink.write_tick(tick, candle.timeframe) {
                            PipelineMetrics::incr(&self.metrics.persistence_rejected);
                        }
                    }
                }

                // Closed first: the buffer rejects boundaries older than the newest seen.
                if let Some(closed) = closed {
                    self.emit_closed(closed);
                }

                self.machine.record_boundary(candle.boundary);
                self.push(BufferEntry::in_progress(candle));
            }
            IngestOutcome::Filtered => {
                PipelineMetrics::incr(&self.metrics.filtered_ticks);
            }
            IngestOutcome::Stale { .. } => {
                PipelineMetrics::incr(&self.metrics.stale_ticks);
            }
        }
    }

    fn emit_closed(&self, candle: Candle) {
        PipelineMetrics::incr(&self.metrics.candles_closed);
        debug!(
            asset = %candle.asset,
            boundary = candle.boundary,
            open = candle.open,
            high = candle.high,
            low = candle.low,
            close = candle.close,
            "Candle closed"
        );
        self.push(BufferEntry::closed(candle.clone()));
        if let Some(sink) = &self.sink {
            if !sink.write_candle(candle) {
                PipelineMetrics::incr(&self.metrics.persistence_rejected);
            }
        }
    }

    fn push(&self, entry: BufferEntry) {
        PipelineMetrics::incr(&self.metrics.buffer_pushes);
        match self.buffer.push(entry) {
            PushOutcome::Inserted { evicted } if evicted > 0 => {
                PipelineMetrics::add(&self.metrics.buffer_evictions, evicted as u64);
            }
            PushOutcome::RejectedStale | PushOutcome::RejectedClosed => {
                PipelineMetrics::incr(&self.metrics.buffer_rejections);
            }
            _ => {}
        }
    }

    // ── Transport ───────────────────────────────────────────────────

    pub fn transport_connected(&mut self) {
        if let Some(transition) = self.coordinator.on_connect(&mut self.machine) {
            self.publish(&transition);
        }
    }

    pub async fn transport_disconnected(&mut self) {
        let report = self
            .coordinator
            .on_disconnect(
                &mut self.machine,
                &mut self.aggregator,
                &self.buffer,
                self.sink.as_ref(),
            )
            .await;
        if let Some(report) = report {
            self.publish(&report.transition);
        }
    }

    // ── Operator actions ────────────────────────────────────────────

    pub fn request_detection(&mut self) -> Result<StreamState, StreamError> {
        let transition = self.machine.request_detection()?;
        Ok(self.publish(&transition))
    }

    pub fn resolve_detection(&mut self, asset: AssetId) -> Result<StreamState, StreamError> {
        let transition = self.machine.resolve_detection(asset)?;
        Ok(self.publish(&transition))
    }

    pub fn fail_detection(&mut self, reason: impl Into<String>) -> Result<StreamState, StreamError> {
        let transition = self.machine.fail_detection(reason)?;
        Ok(self.publish(&transition))
    }

    pub fn retry_detection(&mut self) -> Result<StreamState, StreamError> {
        let transition = self.machine.retry_detection()?;
        Ok(self.publish(&transition))
    }

    /// Move to `error` if detection outlived its deadline. Returns whether it did.
    pub fn poll_detection_timeout(&mut self, now: Instant) -> bool {
        match self.machine.check_detection_timeout(now) {
            Some(transition) => {
                self.publish(&transition);
                true
            }
            None => false,
        }
    }

    /// Start streaming the detected asset; `None` uses the configured timeframe.
    pub fn start_stream(&mut self, timeframe: Option<Timeframe>) -> Result<StreamState, StreamError> {
        let timeframe = timeframe.unwrap_or(self.config.default_timeframe);
        let transition = self.machine.start_stream(timeframe)?;

        self.buffer.clear();
        self.aggregator = transition
            .asset
            .clone()
            .map(|asset| CandleAggregator::new(asset, timeframe));

        Ok(self.publish(&transition))
    }

    /// Stop streaming. Returns only once the last candle has been delivered
    /// and every chunk is closed.
    pub async fn stop_stream(&mut self) -> Result<StreamState, StreamError> {
        if !self.machine.is_streaming() {
            return Err(SessionError::InvalidTransition {
                state: self.machine.state().to_string(),
                action: "stop_stream",
            }
            .into());
        }

        if let Some(last) = self.aggregator.take().and_then(|mut agg| agg.finalize()) {
            self.emit_closed(last);
        }

        let delivered = drain_once(&self.buffer, self.events.as_ref(), &self.metrics);

        if let Some(sink) = &self.sink {
            match sink.close_session().await {
                Ok(report) => {
                    if let Some(err) = report.error {
                        error!(error = %err, "Chunk close failed during stop");
                    }
                }
                Err(err) => error!(error = %err, "Persistence unavailable during stop"),
            }
        }

        let transition = self.machine.stop_stream()?;
        info!(
            session_id = %transition.session_id,
            delivered,
            "Stream stopped"
        );
        Ok(self.publish(&transition))
    }

    async fn handle_command(&mut self, command: StreamCommand) {
        match command {
            StreamCommand::RequestDetection { reply } => {
                let _ = reply.send(self.request_detection());
            }
            StreamCommand::ResolveDetection { asset, reply } => {
                let _ = reply.send(self.resolve_detection(asset));
            }
            StreamCommand::FailDetection { reason, reply } => {
                let _ = reply.send(self.fail_detection(reason));
            }
            StreamCommand::RetryDetection { reply } => {
                let _ = reply.send(self.retry_detection());
            }
            StreamCommand::StartStream { timeframe, reply } => {
                let _ = reply.send(self.start_stream(timeframe));
            }
            StreamCommand::StopStream { reply } => {
                let _ = reply.send(self.stop_stream().await);
            }
            StreamCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    /// Stop any active stream and close the persistence sink.
    pub async fn shutdown(mut self) -> Result<(), StreamError> {
        if self.machine.is_streaming() {
            self.stop_stream().await?;
        }
        if let Some(sink) = self.sink.take() {
            sink.shutdown().await?;
        }
        info!(metrics = ?self.metrics.export(), "Stream runtime shut down");
        Ok(())
    }

    fn publish(&self, transition: &Transition) -> StreamState {
        self.events.emit(StreamEvent::from(transition));
        PipelineMetrics::incr(&self.metrics.events_emitted);
        transition.to
    }
}

// ── Supervised loop ─────────────────────────────────────────────────

/// Drive the runtime until cancelled or the capture channel closes.
///
/// A closed capture channel is treated as a transport loss. The runtime is
/// returned so the caller can [`StreamRuntime::shutdown`] it.
pub async fn run_stream(
    mut runtime: StreamRuntime,
    mut capture: mpsc::Receiver<CaptureInput>,
    mut commands: mpsc::Receiver<StreamCommand>,
    cancel: CancellationToken,
) -> StreamRuntime {
    loop {
        let deadline = runtime.detection_deadline();

        // Capture input is always handled before queued operator commands.
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("Stream loop cancelled");
                break;
            }
            input = capture.recv() => match input {
                Some(CaptureInput::Payload(raw)) => {
                    runtime.handle_payload(&raw);
                }
                Some(CaptureInput::Connected) => runtime.transport_connected(),
                Some(CaptureInput::Disconnected) => runtime.transport_disconnected().await,
                None => {
                    info!("Capture channel closed");
                    runtime.transport_disconnected().await;
                    break;
                }
            },
            Some(command) = commands.recv() => {
                runtime.handle_command(command).await;
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                runtime.poll_detection_timeout(Instant::now());
            }
        }
    }
    runtime
}

/// Client handle for a [`run_stream`] loop.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    commands: mpsc::Sender<StreamCommand>,
}

impl StreamHandle {
    pub fn new(commands: mpsc::Sender<StreamCommand>) -> Self {
        Self { commands }
    }

    pub async fn request_detection(&self) -> Result<StreamState, StreamError> {
        self.call(|reply| StreamCommand::RequestDetection { reply }).await
    }

    pub async fn resolve_detection(&self, asset: AssetId) -> Result<StreamState, StreamError> {
        self.call(|reply| StreamCommand::ResolveDetection { asset, reply }).await
    }

    pub async fn fail_detection(&self, reason: impl Into<String>) -> Result<StreamState, StreamError> {
        let reason = reason.into();
        self.call(|reply| StreamCommand::FailDetection { reason, reply }).await
    }

    pub async fn retry_detection(&self) -> Result<StreamState, StreamError> {
        self.call(|reply| StreamCommand::RetryDetection { reply }).await
    }

    pub async fn start_stream(&self, timeframe: Option<Timeframe>) -> Result<StreamState, StreamError> {
        self.call(|reply| StreamCommand::StartStream { timeframe, reply }).await
    }

    pub async fn stop_stream(&self) -> Result<StreamState, StreamError> {
        self.call(|reply| StreamCommand::StopStream { reply }).await
    }

    pub async fn status(&self) -> Result<StatusSnapshot, StreamError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(StreamCommand::Status { reply })
            .await
            .map_err(|_| StreamError::RuntimeStopped)?;
        rx.await.map_err(|_| StreamError::RuntimeStopped)
    }

    async fn call<F>(&self, build: F) -> Result<StreamState, StreamError>
    where
        F: FnOnce(Reply<StreamState>) -> StreamCommand,
    {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| StreamError::RuntimeStopped)?;
        rx.await.map_err(|_| StreamError::RuntimeStopped)?
    }
}

// ── Drain cadence ───────────────────────────────────────────────────

/// Drain the buffer once and forward every entry. Returns entries delivered.
pub fn drain_once(buffer: &DeliveryBuffer, events: &dyn EventSink, metrics: &PipelineMetrics) -> usize {
    let entries = buffer.drain();
    PipelineMetrics::incr(&metrics.drains);
    for entry in &entries {
        events.emit(StreamEvent::from_entry(entry));
    }
    PipelineMetrics::add(&metrics.events_emitted, entries.len() as u64);
    entries.len()
}

/// Drain on a fixed cadence until cancelled, with one final drain on exit.
pub fn spawn_drain_task(
    buffer: Arc<DeliveryBuffer>,
    events: Arc<dyn EventSink>,
    metrics: Arc<PipelineMetrics>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    drain_once(&buffer, events.as_ref(), &metrics);
                    break;
                }
                _ = ticker.tick() => {
                    drain_once(&buffer, events.as_ref(), &metrics);
                }
            }
        }
        debug!("Drain task stopped");
    })
}
