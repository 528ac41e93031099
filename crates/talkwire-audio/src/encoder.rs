//! Fixed-point encoding of normalized float samples.

use talkwire_foundation::PcmChunk;

/// Convert normalized f32 samples to 16-bit signed PCM.
///
/// Only the positive side is clamped before scaling; negative overdrive is
/// caught by the saturating `as` cast instead, bottoming out at -32768.
/// This keeps the output bit-compatible with the receiver's expectations
/// for in-range audio while never wrapping on hot input.
pub fn encode(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.min(1.0) * 32767.0) as i16)
        .collect()
}

/// Encode straight to the wire representation.
pub fn encode_chunk(samples: &[f32]) -> PcmChunk {
    PcmChunk::from_samples(&encode(samples))
}
