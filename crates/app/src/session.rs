use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use talkwire_audio::{encoder, resampler, FrameBuffer, FrameSource};
use talkwire_foundation::{AppError, SessionState, SessionStateMachine};
use talkwire_telemetry::PipelineMetrics;
use talkwire_transport::{ChunkTransport, Endpoint, TransportEvent, TransportHandle};

/// Frames buffered between the capture callback and the session task.
const FRAME_QUEUE_DEPTH: usize = 64;

/// Commands into the session. Start/Stop come from the gesture controller;
/// Dispose only from host shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Start,
    Stop,
    Dispose,
}

/// Immutable per-session parameters, snapshotted when Start is handled.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub target_sample_rate: u32,
    pub endpoint: Endpoint,
}

/// The capture session: sole owner of the input stream, the transport
/// connection, and the state machine tying them together.
///
/// All mutation happens on the session task. Frames and transport
/// lifecycle events are serialized into it over channels, so per-frame
/// processing is a plain synchronous method and frames are handled in
/// strict arrival order.
pub struct CaptureSession {
    config: SessionConfig,
    state: SessionStateMachine,
    metrics: Arc<PipelineMetrics>,
    source: Box<dyn FrameSource>,
    transport: Option<TransportHandle>,
}

impl CaptureSession {
    pub fn new(
        config: SessionConfig,
        source: Box<dyn FrameSource>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        metrics.set_session_state(SessionState::Idle.as_u8());
        Self {
            config,
            state: SessionStateMachine::new(),
            metrics,
            source,
            transport: None,
        }
    }

    pub fn spawn(self, cmd_rx: mpsc::Receiver<SessionCommand>) -> JoinHandle<()> {
        tokio::spawn(self.run(cmd_rx))
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SessionCommand>) {
        let mut frame_rx: Option<mpsc::Receiver<FrameBuffer>> = None;
        let mut transport_rx: Option<mpsc::Receiver<TransportEvent>> = None;

        loop {
            tokio::select! {
                // Commands win over queued frames so a stop takes effect
                // before any backlog is flushed.
                biased;

                cmd = cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Start) => match self.handle_start() {
                        Ok(Some((frames, events))) => {
                            frame_rx = Some(frames);
                            transport_rx = Some(events);
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!("start command failed: {e}"),
                    },
                    Some(SessionCommand::Stop) => self.handle_stop(),
                    Some(SessionCommand::Dispose) | None => {
                        self.handle_dispose();
                        break;
                    }
                },
                event = recv_or_pending(&mut transport_rx) => {
                    self.on_transport_event(event);
                }
                frame = recv_or_pending(&mut frame_rx) => {
                    self.on_frame(&frame);
                }
            }
        }
    }

    /// Open the transport and acquire the device. Idempotent while a
    /// session is already underway: rapid repeated presses must never
    /// produce a second device/transport pair.
    fn handle_start(
        &mut self,
    ) -> Result<
        Option<(
            mpsc::Receiver<FrameBuffer>,
            mpsc::Receiver<TransportEvent>,
        )>,
        AppError,
    > {
        match self.state.current() {
            SessionState::Starting | SessionState::Recording | SessionState::Stopping => {
                tracing::debug!(state = ?self.state.current(), "start ignored: session active");
                return Ok(None);
            }
            SessionState::Closed => {
                return Err(AppError::State("session already disposed".to_string()));
            }
            SessionState::Idle => {}
        }

        self.transition(SessionState::Starting)?;
        tracing::info!(
            target_rate = self.config.target_sample_rate,
            endpoint = %self.config.endpoint,
            "session starting"
        );

        let (event_tx, event_rx) = mpsc::channel(16);
        let transport =
            ChunkTransport::open(self.config.endpoint.clone(), event_tx, Some(self.metrics.clone()));

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        match self.source.start(frame_tx) {
            Ok(device) => {
                tracing::info!(
                    device_rate = device.sample_rate,
                    channels = device.channels,
                    "input device acquired"
                );
            }
            Err(e) => {
                transport.close();
                self.transition(SessionState::Idle)?;
                return Err(e.into());
            }
        }

        self.transport = Some(transport);
        Ok(Some((frame_rx, event_rx)))
    }

    /// Tear down capture and request transport close. The close itself
    /// completes asynchronously; the session is back in Idle (and
    /// reusable) as soon as teardown is issued.
    fn handle_stop(&mut self) {
        match self.state.current() {
            SessionState::Starting | SessionState::Recording => {}
            other => {
                tracing::debug!(state = ?other, "stop ignored");
                return;
            }
        }

        if let Err(e) = self.transition(SessionState::Stopping) {
            tracing::warn!("stop command failed: {e}");
            return;
        }
        self.source.stop();
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        if let Err(e) = self.transition(SessionState::Idle) {
            tracing::warn!("stop teardown failed: {e}");
            return;
        }
        tracing::info!("session stopped");
    }

    fn handle_dispose(&mut self) {
        if self.state.current() == SessionState::Closed {
            return;
        }
        self.source.stop();
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        if let Err(e) = self.transition(SessionState::Closed) {
            tracing::warn!("dispose failed: {e}");
        }
        tracing::info!("session disposed");
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                if self.state.current() == SessionState::Starting {
                    match self.transition(SessionState::Recording) {
                        Ok(()) => tracing::info!("recording"),
                        Err(e) => tracing::warn!("could not enter recording: {e}"),
                    }
                }
            }
            TransportEvent::Failed(reason) => {
                // Fail soft: stay in Recording, let sends drop, and leave
                // recovery to the operator's next gesture.
                tracing::warn!(%reason, "transport failed; audio is being discarded until stop");
            }
            TransportEvent::Closed => {
                tracing::debug!("transport closed");
            }
        }
    }

    /// Per-frame pipeline step. Only a Recording session produces chunks;
    /// frames that race past a stop or arrive before the transport is
    /// ready are discarded, never buffered.
    fn on_frame(&mut self, frame: &FrameBuffer) {
        if self.state.current() != SessionState::Recording {
            return;
        }
        let resampled = resampler::resample(
            &frame.samples,
            frame.sample_rate,
            self.config.target_sample_rate,
        );
        let chunk = encoder::encode_chunk(&resampled);
        self.metrics.increment_chunks_encoded();
        if let Some(transport) = &self.transport {
            transport.send(chunk);
        }
    }

    fn transition(&mut self, to: SessionState) -> Result<(), AppError> {
        self.state.transition(to)?;
        self.metrics.set_session_state(to.as_u8());
        Ok(())
    }
}

/// Await the next message on an optional receiver; pend forever while the
/// slot is empty or the channel is drained so the other select branches
/// stay in charge.
async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> T {
    match rx {
        Some(inner) => match inner.recv().await {
            Some(value) => value,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}
