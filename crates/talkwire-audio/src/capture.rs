use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc;

use super::device::DeviceManager;
use talkwire_foundation::AudioError;
use talkwire_telemetry::PipelineMetrics;

/// One hardware callback's worth of mono samples, normalized to [-1.0, 1.0].
/// Produced on the capture thread and consumed exactly once by the session.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Negotiated input stream parameters, reported once at startup.
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Where the session gets its frames from. The production implementation
/// drives a cpal input stream on a dedicated thread; tests substitute a
/// scripted source.
pub trait FrameSource: Send {
    /// Acquire the device and start delivering frames into `frame_tx`.
    /// Returns once the stream is playing; acquisition failures surface
    /// here so the start command's caller sees them.
    fn start(&mut self, frame_tx: mpsc::Sender<FrameBuffer>) -> Result<DeviceConfig, AudioError>;

    /// Stop frame delivery and release the device. Idempotent.
    fn stop(&mut self);
}

pub struct CpalFrameSource {
    device_name: Option<String>,
    metrics: Option<Arc<PipelineMetrics>>,
    thread: Option<CaptureThread>,
}

impl CpalFrameSource {
    pub fn new(device_name: Option<String>, metrics: Option<Arc<PipelineMetrics>>) -> Self {
        Self {
            device_name,
            metrics,
            thread: None,
        }
    }
}

impl FrameSource for CpalFrameSource {
    fn start(&mut self, frame_tx: mpsc::Sender<FrameBuffer>) -> Result<DeviceConfig, AudioError> {
        if self.thread.is_some() {
            return Err(AudioError::Fatal("capture already running".to_string()));
        }
        let (thread, config) =
            CaptureThread::spawn(self.device_name.clone(), frame_tx, self.metrics.clone())?;
        self.thread = Some(thread);
        Ok(config)
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            thread.stop();
        }
    }
}

/// Handle to the dedicated audio thread. The cpal stream lives and dies on
/// that thread; stopping joins it, which drops the stream.
pub struct CaptureThread {
    handle: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

impl CaptureThread {
    pub fn spawn(
        device_name: Option<String>,
        frame_tx: mpsc::Sender<FrameBuffer>,
        metrics: Option<Arc<PipelineMetrics>>,
    ) -> Result<(Self, DeviceConfig), AudioError> {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<DeviceConfig, AudioError>>(1);

        let handle = thread::Builder::new()
            .name("talkwire-capture".to_string())
            .spawn(move || {
                match open_stream(
                    device_name.as_deref(),
                    frame_tx,
                    metrics,
                    thread_running.clone(),
                ) {
                    Ok((stream, config)) => {
                        let _ = ready_tx.send(Ok(config));
                        while thread_running.load(Ordering::SeqCst) {
                            thread::sleep(Duration::from_millis(50));
                        }
                        drop(stream);
                        tracing::debug!("Capture thread shutting down");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| AudioError::Fatal(format!("Failed to spawn capture thread: {e}")))?;

        match ready_rx.recv_timeout(Duration::from_secs(3)) {
            Ok(Ok(config)) => {
                tracing::info!(
                    sample_rate = config.sample_rate,
                    channels = config.channels,
                    "Audio input stream started"
                );
                Ok((
                    Self {
                        handle,
                        shutdown: running,
                    },
                    config,
                ))
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(AudioError::Fatal(
                    "Timed out waiting for the input device".to_string(),
                ))
            }
        }
    }

    pub fn stop(self) {
        self.shutdown.store(false, Ordering::SeqCst);
        let _ = self.handle.join();
    }
}

fn open_stream(
    device_name: Option<&str>,
    frame_tx: mpsc::Sender<FrameBuffer>,
    metrics: Option<Arc<PipelineMetrics>>,
    running: Arc<AtomicBool>,
) -> Result<(Stream, DeviceConfig), AudioError> {
    let manager = DeviceManager::new()?;
    let device = manager.open_device(device_name)?;
    if let Ok(name) = device.name() {
        tracing::info!("Selected input device: {}", name);
    }

    let default_config = device.default_input_config()?;
    let sample_format = default_config.sample_format();
    let config: StreamConfig = default_config.into();
    let sample_rate = config.sample_rate;
    let channels = usize::from(config.channels.max(1));
    let device_config = DeviceConfig {
        sample_rate,
        channels: config.channels,
    };

    let err_fn = |err: cpal::StreamError| {
        tracing::error!("Audio stream error: {}", err);
    };

    // Shared tail of every format arm: count the frame and hand it to the
    // session without ever blocking the device callback. A full channel
    // drops the frame; stale audio is worth less than a stalled callback.
    let forward = move |samples: Vec<f32>| {
        if !running.load(Ordering::SeqCst) {
            return;
        }
        if let Some(m) = &metrics {
            m.increment_capture_frames();
            m.mark_frame_time();
        }
        if frame_tx
            .try_send(FrameBuffer {
                samples,
                sample_rate,
            })
            .is_err()
        {
            if let Some(m) = &metrics {
                m.increment_capture_drops();
            }
        }
    };

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &_| {
                forward(downmix_to_mono(data, channels));
            },
            err_fn,
            None,
        )?,
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &_| {
                let converted: Vec<f32> =
                    data.iter().map(|&s| f32::from(s) / 32_768.0).collect();
                forward(downmix_to_mono(&converted, channels));
            },
            err_fn,
            None,
        )?,
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &_| {
                let converted: Vec<f32> = data
                    .iter()
                    .map(|&s| (f32::from(s) - 32_768.0) / 32_768.0)
                    .collect();
                forward(downmix_to_mono(&converted, channels));
            },
            err_fn,
            None,
        )?,
        other => {
            return Err(AudioError::FormatNotSupported {
                format: format!("{:?}", other),
            });
        }
    };

    stream.play()?;
    Ok((stream, device_config))
}

fn downmix_to_mono(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
