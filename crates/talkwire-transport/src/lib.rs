//! Best-effort chunk delivery over a single WebSocket connection.
//!
//! One connection per recording session, owned by a spawned task. Sends
//! drop silently unless the connection is open: audio chunks are
//! perishable, and queuing stale audio across a reconnect would
//! desynchronize playback at the receiver. There is no reconnection
//! logic; a dropped connection stays dropped until the operator stops
//! and presses again.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use talkwire_foundation::PcmChunk;
use talkwire_telemetry::PipelineMetrics;

/// Application-level token offered during the WebSocket handshake.
pub const AUDIO_SUBPROTOCOL: &str = "audio-protocol";

/// Chunks admitted but not yet written when the writer is momentarily busy.
const CHUNK_QUEUE_DEPTH: usize = 32;

/// Where the audio stream is sent. `host` carries an optional port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    pub host: String,
    pub path: String,
    pub tls: bool,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: "192.168.2.1".to_string(),
            path: "/".to_string(),
            tls: true,
        }
    }
}

impl Endpoint {
    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{}://{}{}", scheme, self.host, self.path)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Connection lifecycle, reported to the session over a channel rather
/// than through return values: open is fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Failed(String),
    Closed,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid endpoint: {0}")]
    Endpoint(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

pub struct ChunkTransport;

impl ChunkTransport {
    /// Start connecting to `endpoint` and return immediately. Lifecycle
    /// outcomes arrive on `events`; the returned handle accepts sends as
    /// soon as the connection reports `Opened`.
    pub fn open(
        endpoint: Endpoint,
        events: mpsc::Sender<TransportEvent>,
        metrics: Option<Arc<PipelineMetrics>>,
    ) -> TransportHandle {
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
        let ready = Arc::new(AtomicBool::new(false));
        let closing = Arc::new(AtomicBool::new(false));
        let close_notify = Arc::new(Notify::new());

        let task = tokio::spawn(run_connection(
            endpoint,
            chunk_rx,
            events,
            ready.clone(),
            close_notify.clone(),
            metrics.clone(),
        ));

        TransportHandle {
            chunk_tx,
            ready,
            closing,
            close_notify,
            metrics,
            _task: task,
        }
    }
}

/// Owner-side view of one connection. Dropping the handle requests the
/// same graceful close as `close()`.
pub struct TransportHandle {
    chunk_tx: mpsc::Sender<PcmChunk>,
    ready: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
    metrics: Option<Arc<PipelineMetrics>>,
    _task: JoinHandle<()>,
}

impl TransportHandle {
    /// Hand a chunk to the connection. Never blocks and never errors:
    /// before open-completion, after close, or with a full queue the
    /// chunk is simply dropped.
    pub fn send(&self, chunk: PcmChunk) {
        if self.closing.load(Ordering::SeqCst) || !self.ready.load(Ordering::SeqCst) {
            tracing::trace!(bytes = chunk.len(), "chunk dropped: transport not ready");
            if let Some(m) = &self.metrics {
                m.increment_sends_dropped();
            }
            return;
        }
        if self.chunk_tx.try_send(chunk).is_err() {
            tracing::trace!("chunk dropped: transport queue full");
            if let Some(m) = &self.metrics {
                m.increment_sends_dropped();
            }
        }
    }

    /// Request graceful shutdown. Idempotent; chunks already admitted are
    /// flushed best-effort before the close frame.
    pub fn close(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            self.ready.store(false, Ordering::SeqCst);
            self.close_notify.notify_one();
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug)]
enum CloseReason {
    Requested,
    Remote,
    Errored,
}

async fn run_connection(
    endpoint: Endpoint,
    mut chunk_rx: mpsc::Receiver<PcmChunk>,
    events: mpsc::Sender<TransportEvent>,
    ready: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
    metrics: Option<Arc<PipelineMetrics>>,
) {
    // No timeout here: absence of an open confirmation leaves the session
    // waiting, and only a stop command resolves it.
    let ws = tokio::select! {
        // A close requested while still dialing always wins over the
        // dial outcome.
        biased;

        _ = close_notify.notified() => {
            tracing::debug!(%endpoint, "transport closed before the connection completed");
            let _ = events.send(TransportEvent::Closed).await;
            return;
        }
        conn = dial(&endpoint) => match conn {
            Ok(ws) => ws,
            Err(e) => {
                tracing::warn!(%endpoint, error = %e, "websocket connect failed");
                if let Some(m) = &metrics {
                    m.increment_transport_failures();
                }
                let _ = events.send(TransportEvent::Failed(e.to_string())).await;
                return;
            }
        },
    };

    tracing::info!(%endpoint, "websocket connection opened");
    ready.store(true, Ordering::SeqCst);
    let _ = events.send(TransportEvent::Opened).await;

    let (mut sink, mut stream) = ws.split();
    let reason = loop {
        tokio::select! {
            _ = close_notify.notified() => {
                ready.store(false, Ordering::SeqCst);
                // In-flight chunks were admitted before the close request;
                // flush them best-effort, then say goodbye.
                while let Ok(chunk) = chunk_rx.try_recv() {
                    if sink.send(Message::binary(chunk.into_bytes())).await.is_err() {
                        break;
                    }
                    if let Some(m) = &metrics {
                        m.increment_chunks_sent();
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                break CloseReason::Requested;
            }
            maybe_chunk = chunk_rx.recv() => match maybe_chunk {
                Some(chunk) => match sink.send(Message::binary(chunk.into_bytes())).await {
                    Ok(()) => {
                        if let Some(m) = &metrics {
                            m.increment_chunks_sent();
                        }
                    }
                    Err(e) => {
                        ready.store(false, Ordering::SeqCst);
                        tracing::warn!(error = %e, "websocket send failed");
                        if let Some(m) = &metrics {
                            m.increment_transport_failures();
                        }
                        let _ = events.send(TransportEvent::Failed(e.to_string())).await;
                        break CloseReason::Errored;
                    }
                },
                None => {
                    // Handle dropped without an explicit close.
                    ready.store(false, Ordering::SeqCst);
                    let _ = sink.send(Message::Close(None)).await;
                    break CloseReason::Requested;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(msg)) if msg.is_close() => {
                    ready.store(false, Ordering::SeqCst);
                    break CloseReason::Remote;
                }
                Some(Ok(_)) => {
                    // Send-only link: inbound payloads are ignored.
                }
                Some(Err(e)) => {
                    ready.store(false, Ordering::SeqCst);
                    tracing::warn!(error = %e, "websocket connection lost");
                    if let Some(m) = &metrics {
                        m.increment_transport_failures();
                    }
                    let _ = events.send(TransportEvent::Failed(e.to_string())).await;
                    break CloseReason::Errored;
                }
                None => {
                    ready.store(false, Ordering::SeqCst);
                    break CloseReason::Remote;
                }
            },
        }
    };

    ready.store(false, Ordering::SeqCst);
    tracing::debug!(%endpoint, ?reason, "websocket connection finished");
    if !matches!(reason, CloseReason::Errored) {
        let _ = events.send(TransportEvent::Closed).await;
    }
}

async fn dial(
    endpoint: &Endpoint,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, TransportError> {
    let mut request = endpoint
        .url()
        .into_client_request()
        .map_err(|e| TransportError::Endpoint(e.to_string()))?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(AUDIO_SUBPROTOCOL),
    );
    let (ws, response) = connect_async(request).await?;
    tracing::debug!(status = %response.status(), "websocket handshake complete");
    Ok(ws)
}
