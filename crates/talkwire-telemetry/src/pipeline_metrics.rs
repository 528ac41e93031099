use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared counters for cross-thread pipeline monitoring.
///
/// Written from the capture callback thread, the session task, and the
/// transport task; read by the periodic status log line.
#[derive(Clone)]
pub struct PipelineMetrics {
    // Capture side
    pub capture_frames: Arc<AtomicU64>,
    pub capture_drops: Arc<AtomicU64>, // frame channel full
    pub last_frame_time: Arc<RwLock<Option<Instant>>>,

    // Pipeline output
    pub chunks_encoded: Arc<AtomicU64>,
    pub chunks_sent: Arc<AtomicU64>,
    pub sends_dropped: Arc<AtomicU64>, // transport not ready
    pub transport_failures: Arc<AtomicU64>,

    // Session state gauge (SessionState::as_u8 encoding)
    pub session_state: Arc<AtomicU8>,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self {
            capture_frames: Arc::new(AtomicU64::new(0)),
            capture_drops: Arc::new(AtomicU64::new(0)),
            last_frame_time: Arc::new(RwLock::new(None)),

            chunks_encoded: Arc::new(AtomicU64::new(0)),
            chunks_sent: Arc::new(AtomicU64::new(0)),
            sends_dropped: Arc::new(AtomicU64::new(0)),
            transport_failures: Arc::new(AtomicU64::new(0)),

            session_state: Arc::new(AtomicU8::new(0)),
        }
    }
}

impl PipelineMetrics {
    pub fn increment_capture_frames(&self) {
        self.capture_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_capture_drops(&self) {
        self.capture_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_frame_time(&self) {
        *self.last_frame_time.write() = Some(Instant::now());
    }

    pub fn increment_chunks_encoded(&self) {
        self.chunks_encoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_chunks_sent(&self) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_sends_dropped(&self) {
        self.sends_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_transport_failures(&self) {
        self.transport_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_session_state(&self, state: u8) {
        self.session_state.store(state, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            capture_frames: self.capture_frames.load(Ordering::Relaxed),
            capture_drops: self.capture_drops.load(Ordering::Relaxed),
            chunks_encoded: self.chunks_encoded.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            sends_dropped: self.sends_dropped.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            session_state: self.session_state.load(Ordering::Relaxed),
            millis_since_last_frame: self
                .last_frame_time
                .read()
                .map(|t| t.elapsed().as_millis() as u64),
        }
    }
}

/// Point-in-time copy of the counters, cheap to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSnapshot {
    pub capture_frames: u64,
    pub capture_drops: u64,
    pub chunks_encoded: u64,
    pub chunks_sent: u64,
    pub sends_dropped: u64,
    pub transport_failures: u64,
    pub session_state: u8,
    pub millis_since_last_frame: Option<u64>,
}
