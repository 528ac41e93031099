//! Session state machine and pipeline flow against a loopback receiver.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use talkwire_app::session::{CaptureSession, SessionCommand, SessionConfig};
use talkwire_audio::{DeviceConfig, FrameBuffer, FrameSource};
use talkwire_foundation::{AudioError, SessionState};
use talkwire_telemetry::PipelineMetrics;
use talkwire_transport::{Endpoint, AUDIO_SUBPROTOCOL};

/// Accept a handshake and echo back the subprotocol the client offered,
/// mirroring what a real receiver does during negotiation.
async fn accept_with_protocol(
    stream: tokio::net::TcpStream,
) -> Result<
    tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    tokio_tungstenite::tungstenite::Error,
> {
    tokio_tungstenite::accept_hdr_async(stream, |_req: &_, mut response: tokio_tungstenite::tungstenite::handshake::server::Response| {
        response.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            tokio_tungstenite::tungstenite::http::HeaderValue::from_static(AUDIO_SUBPROTOCOL),
        );
        Ok(response)
    })
    .await
}

/// Stand-in for the cpal capture thread: hands the frame sender back to
/// the test so it can play the role of the hardware callback.
struct ScriptedSource {
    sample_rate: u32,
    fail_start: bool,
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
    frame_tx: Arc<Mutex<Option<mpsc::Sender<FrameBuffer>>>>,
}

#[derive(Clone)]
struct SourceProbe {
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
    frame_tx: Arc<Mutex<Option<mpsc::Sender<FrameBuffer>>>>,
}

impl SourceProbe {
    fn sender(&self) -> mpsc::Sender<FrameBuffer> {
        self.frame_tx
            .lock()
            .unwrap()
            .clone()
            .expect("source not started")
    }
}

fn scripted_source(sample_rate: u32, fail_start: bool) -> (ScriptedSource, SourceProbe) {
    let starts = Arc::new(AtomicUsize::new(0));
    let stops = Arc::new(AtomicUsize::new(0));
    let frame_tx = Arc::new(Mutex::new(None));
    let probe = SourceProbe {
        starts: starts.clone(),
        stops: stops.clone(),
        frame_tx: frame_tx.clone(),
    };
    (
        ScriptedSource {
            sample_rate,
            fail_start,
            starts,
            stops,
            frame_tx,
        },
        probe,
    )
}

impl FrameSource for ScriptedSource {
    fn start(&mut self, frame_tx: mpsc::Sender<FrameBuffer>) -> Result<DeviceConfig, AudioError> {
        if self.fail_start {
            return Err(AudioError::DeviceNotFound { name: None });
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.frame_tx.lock().unwrap() = Some(frame_tx);
        Ok(DeviceConfig {
            sample_rate: self.sample_rate,
            channels: 1,
        })
    }

    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        *self.frame_tx.lock().unwrap() = None;
    }
}

struct LoopbackReceiver {
    port: u16,
    messages: Arc<Mutex<Vec<Vec<u8>>>>,
    connections: Arc<AtomicUsize>,
}

async fn spawn_receiver() -> LoopbackReceiver {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let messages = Arc::new(Mutex::new(Vec::new()));
    let connections = Arc::new(AtomicUsize::new(0));

    let sink = messages.clone();
    let counter = connections.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut ws = match accept_with_protocol(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_binary() {
                        sink.lock().unwrap().push(msg.into_data().to_vec());
                    } else if msg.is_close() {
                        break;
                    }
                }
            });
        }
    });

    LoopbackReceiver {
        port,
        messages,
        connections,
    }
}

fn session_config(port: u16, target_rate: u32) -> SessionConfig {
    SessionConfig {
        target_sample_rate: target_rate,
        endpoint: Endpoint {
            host: format!("127.0.0.1:{port}"),
            path: "/".to_string(),
            tls: false,
        },
    }
}

async fn wait_for(metrics: &PipelineMetrics, what: &str, check: impl Fn(&PipelineMetrics) -> bool) {
    for _ in 0..200 {
        if check(metrics) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}: {:?}", metrics.snapshot());
}

fn state_of(metrics: &PipelineMetrics) -> u8 {
    metrics.snapshot().session_state
}

fn zeros(len: usize, sample_rate: u32) -> FrameBuffer {
    FrameBuffer {
        samples: vec![0.0; len],
        sample_rate,
    }
}

#[tokio::test]
async fn press_to_talk_end_to_end() {
    let receiver = spawn_receiver().await;
    let (source, probe) = scripted_source(48_000, false);
    let metrics = Arc::new(PipelineMetrics::default());
    let session = CaptureSession::new(
        session_config(receiver.port, 16_000),
        Box::new(source),
        metrics.clone(),
    );
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let handle = session.spawn(cmd_rx);

    cmd_tx.send(SessionCommand::Start).await.unwrap();
    wait_for(&metrics, "recording", |m| {
        state_of(m) == SessionState::Recording.as_u8()
    })
    .await;

    // One 10 ms hardware callback at 48 kHz.
    probe.sender().send(zeros(480, 48_000)).await.unwrap();
    wait_for(&metrics, "chunk sent", |m| m.snapshot().chunks_sent == 1).await;

    cmd_tx.send(SessionCommand::Stop).await.unwrap();
    wait_for(&metrics, "idle", |m| {
        state_of(m) == SessionState::Idle.as_u8()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let messages = receiver.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].len(), 320, "160 samples at 2 bytes each");
    assert!(messages[0].iter().all(|&b| b == 0));
    drop(messages);

    assert_eq!(probe.starts.load(Ordering::SeqCst), 1);
    assert_eq!(probe.stops.load(Ordering::SeqCst), 1);

    cmd_tx.send(SessionCommand::Dispose).await.unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn repeated_start_commands_open_one_session() {
    let receiver = spawn_receiver().await;
    let (source, probe) = scripted_source(16_000, false);
    let metrics = Arc::new(PipelineMetrics::default());
    let session = CaptureSession::new(
        session_config(receiver.port, 16_000),
        Box::new(source),
        metrics.clone(),
    );
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let _handle = session.spawn(cmd_rx);

    cmd_tx.send(SessionCommand::Start).await.unwrap();
    cmd_tx.send(SessionCommand::Start).await.unwrap();
    cmd_tx.send(SessionCommand::Start).await.unwrap();
    wait_for(&metrics, "recording", |m| {
        state_of(m) == SessionState::Recording.as_u8()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(probe.starts.load(Ordering::SeqCst), 1, "one device stream");
    assert_eq!(
        receiver.connections.load(Ordering::SeqCst),
        1,
        "one transport connection"
    );
}

#[tokio::test]
async fn no_chunks_after_stop() {
    let receiver = spawn_receiver().await;
    let (source, probe) = scripted_source(16_000, false);
    let metrics = Arc::new(PipelineMetrics::default());
    let session = CaptureSession::new(
        session_config(receiver.port, 16_000),
        Box::new(source),
        metrics.clone(),
    );
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let _handle = session.spawn(cmd_rx);

    cmd_tx.send(SessionCommand::Start).await.unwrap();
    wait_for(&metrics, "recording", |m| {
        state_of(m) == SessionState::Recording.as_u8()
    })
    .await;

    let callback = probe.sender();
    callback.send(zeros(160, 16_000)).await.unwrap();
    wait_for(&metrics, "first chunk", |m| m.snapshot().chunks_sent == 1).await;

    cmd_tx.send(SessionCommand::Stop).await.unwrap();
    wait_for(&metrics, "idle", |m| {
        state_of(m) == SessionState::Idle.as_u8()
    })
    .await;

    // The device teardown races in-flight callbacks; late frames must be
    // discarded, not encoded.
    callback.send(zeros(160, 16_000)).await.unwrap();
    callback.send(zeros(160, 16_000)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(metrics.snapshot().chunks_encoded, 1);
    let messages = receiver.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn session_is_reusable_after_stop() {
    let receiver = spawn_receiver().await;
    let (source, probe) = scripted_source(16_000, false);
    let metrics = Arc::new(PipelineMetrics::default());
    let session = CaptureSession::new(
        session_config(receiver.port, 16_000),
        Box::new(source),
        metrics.clone(),
    );
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let _handle = session.spawn(cmd_rx);

    for round in 1..=2 {
        cmd_tx.send(SessionCommand::Start).await.unwrap();
        wait_for(&metrics, "recording", |m| {
            state_of(m) == SessionState::Recording.as_u8()
        })
        .await;
        cmd_tx.send(SessionCommand::Stop).await.unwrap();
        wait_for(&metrics, "idle", |m| {
            state_of(m) == SessionState::Idle.as_u8()
        })
        .await;
        assert_eq!(probe.starts.load(Ordering::SeqCst), round);
        assert_eq!(probe.stops.load(Ordering::SeqCst), round);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(receiver.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn device_failure_returns_to_idle() {
    let receiver = spawn_receiver().await;
    let (source, probe) = scripted_source(16_000, true);
    let metrics = Arc::new(PipelineMetrics::default());
    let session = CaptureSession::new(
        session_config(receiver.port, 16_000),
        Box::new(source),
        metrics.clone(),
    );
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let _handle = session.spawn(cmd_rx);

    cmd_tx.send(SessionCommand::Start).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(state_of(&metrics), SessionState::Idle.as_u8());
    assert_eq!(probe.starts.load(Ordering::SeqCst), 0);
    assert!(receiver.messages.lock().unwrap().is_empty());
}

#[tokio::test]
async fn frames_before_transport_ready_are_discarded() {
    // A receiver that accepts TCP but never completes the WebSocket
    // handshake keeps the session in Starting.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let (source, probe) = scripted_source(16_000, false);
    let metrics = Arc::new(PipelineMetrics::default());
    let session = CaptureSession::new(
        session_config(port, 16_000),
        Box::new(source),
        metrics.clone(),
    );
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let _handle = session.spawn(cmd_rx);

    cmd_tx.send(SessionCommand::Start).await.unwrap();
    wait_for(&metrics, "starting", |m| {
        state_of(m) == SessionState::Starting.as_u8()
    })
    .await;

    // Device is live before the transport: these frames fall on the floor.
    let callback = probe.sender();
    callback.send(zeros(160, 16_000)).await.unwrap();
    callback.send(zeros(160, 16_000)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(state_of(&metrics), SessionState::Starting.as_u8());
    assert_eq!(metrics.snapshot().chunks_encoded, 0);

    // A stop still gets the operator out of the stuck handshake.
    cmd_tx.send(SessionCommand::Stop).await.unwrap();
    wait_for(&metrics, "idle", |m| {
        state_of(m) == SessionState::Idle.as_u8()
    })
    .await;
}

#[tokio::test]
async fn dispose_is_terminal() {
    let receiver = spawn_receiver().await;
    let (source, _probe) = scripted_source(16_000, false);
    let metrics = Arc::new(PipelineMetrics::default());
    let session = CaptureSession::new(
        session_config(receiver.port, 16_000),
        Box::new(source),
        metrics.clone(),
    );
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let handle = session.spawn(cmd_rx);

    cmd_tx.send(SessionCommand::Dispose).await.unwrap();
    handle.await.unwrap();
    assert_eq!(state_of(&metrics), SessionState::Closed.as_u8());
}
