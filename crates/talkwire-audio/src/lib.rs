pub mod capture;
pub mod device;
pub mod encoder;
pub mod resampler;

// Public API
pub use capture::{CaptureThread, CpalFrameSource, DeviceConfig, FrameBuffer, FrameSource};
pub use device::{DeviceInfo, DeviceManager};

/// Target rates the session configuration accepts, matching the rates the
/// receiving end is prepared to play back.
pub const SUPPORTED_TARGET_RATES: [u32; 7] =
    [8_000, 16_000, 24_000, 32_000, 44_100, 48_000, 96_000];
