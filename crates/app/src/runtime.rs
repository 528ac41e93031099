use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use talkwire_audio::{CpalFrameSource, FrameSource};
use talkwire_telemetry::PipelineMetrics;

use crate::config::AppConfig;
use crate::gesture::{spawn_gesture_controller, GestureEvent, STOP_DELAY};
use crate::session::{CaptureSession, SessionCommand, SessionConfig};

/// Options for starting the Talkwire runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub config: AppConfig,
}

/// Handle to the running pipeline.
pub struct AppHandle {
    pub metrics: Arc<PipelineMetrics>,
    pub gesture_tx: mpsc::Sender<GestureEvent>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    session_handle: JoinHandle<()>,
    gesture_handle: JoinHandle<()>,
}

impl AppHandle {
    /// Dispose the session and wait for the pipeline to wind down.
    pub async fn shutdown(self) {
        info!("Shutting down Talkwire runtime...");
        let _ = self.cmd_tx.send(SessionCommand::Dispose).await;
        let _ = self.session_handle.await;
        self.gesture_handle.abort();
        let _ = self.gesture_handle.await;
        info!("Talkwire runtime shutdown complete");
    }
}

/// Wire the pipeline: gesture stream -> controller -> session, with the
/// cpal frame source behind the session. Nothing touches the microphone
/// or the network until the first press.
pub fn start(opts: RuntimeOptions) -> AppHandle {
    let metrics = Arc::new(PipelineMetrics::default());

    let session_config = SessionConfig {
        target_sample_rate: opts.config.target_sample_rate,
        endpoint: opts.config.endpoint.clone(),
    };
    let source: Box<dyn FrameSource> = Box::new(CpalFrameSource::new(
        opts.config.device.clone(),
        Some(metrics.clone()),
    ));

    let (cmd_tx, cmd_rx) = mpsc::channel::<SessionCommand>(16);
    let session = CaptureSession::new(session_config, source, metrics.clone());
    let session_handle = session.spawn(cmd_rx);

    let (gesture_tx, gesture_rx) = mpsc::channel::<GestureEvent>(16);
    let gesture_handle = spawn_gesture_controller(gesture_rx, cmd_tx.clone(), STOP_DELAY);

    info!(
        target_rate = opts.config.target_sample_rate,
        endpoint = %opts.config.endpoint,
        "Talkwire pipeline ready; hold to talk"
    );

    AppHandle {
        metrics,
        gesture_tx,
        cmd_tx,
        session_handle,
        gesture_handle,
    }
}
