//! Zero-order-hold resampling.
//!
//! Each output sample is the nearest input sample, with no filtering or
//! interpolation. This trades aliasing quality for minimal per-frame cost
//! and latency, which is the right call for a live push-to-talk link.
//! The function is stateless: no fractional phase carries over between
//! buffers, so consecutive buffers have a small timing discontinuity at
//! the boundary. That is an accepted fidelity trade-off, not a bug.

/// Convert `samples` from `source_rate` to `target_rate` by nearest-neighbor
/// selection. Output length is `round(len / ratio)` within one sample of the
/// truncation at the source boundary, where `ratio = source_rate / target_rate`.
///
/// Panics if either rate is zero; rates and sample values are a caller
/// contract, not a runtime input.
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    assert!(
        source_rate > 0 && target_rate > 0,
        "sample rates must be positive ({source_rate} -> {target_rate})"
    );
    debug_assert!(
        samples.iter().all(|s| s.is_finite()),
        "non-finite sample in resampler input"
    );

    if source_rate == target_rate {
        return samples.to_vec();
    }
    if samples.is_empty() {
        return Vec::new();
    }

    let ratio = f64::from(source_rate) / f64::from(target_rate);
    let mut output = Vec::with_capacity((samples.len() as f64 / ratio).round() as usize);

    // The cursor walks the source at `ratio` samples per output sample and
    // stops at the end of input: nothing past the buffer is ever emitted.
    let mut cursor = 0.0f64;
    let last = samples.len() - 1;
    while cursor < samples.len() as f64 {
        let index = (cursor.round() as usize).min(last);
        output.push(samples[index]);
        cursor += ratio;
    }

    output
}
