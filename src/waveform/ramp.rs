//! Ramp primitives and sample-count rounding.

use std::f64::consts::FRAC_PI_2;
use tracing::warn;

/// Fraction of a smooth ramp spent on the sine transition.
pub const DEFAULT_CURVE_FRACTION: f64 = 0.6;

/// Evenly spaced samples from `start` to `end`, both inclusive.
///
/// `n == 1` yields `[start]`; `n == 0` yields an empty vector.
pub fn compute_ramp(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            let mut ramp: Vec<f64> = (0..n).map(|i| start + i as f64 * step).collect();
            ramp[n - 1] = end;
            ramp
        }
    }
}

/// Sine-eased transition from `start` to `end` followed by a hold at `end`.
///
/// The first `floor(curve_fraction * n)` samples follow
/// `start + (end - start) * sin(arg)` with `arg` swept over `[0, π/2]`;
/// the rest hold at `end`. The result always has exactly `n` samples.
pub fn compute_smooth_ramp(start: f64, end: f64, n: usize, curve_fraction: f64) -> Vec<f64> {
    let curve_len = ((curve_fraction.clamp(0.0, 1.0) * n as f64).floor() as usize).min(n);
    let mut ramp: Vec<f64> = compute_ramp(0.0, FRAC_PI_2, curve_len)
        .into_iter()
        .map(|arg| start + (end - start) * arg.sin())
        .collect();
    ramp.resize(n, end);
    ramp
}

/// Number of samples covering `seconds` at `rate`, rounded up.
///
/// A non-integer product is logged as a deviation from the requested timing.
pub fn sample_count(seconds: f64, rate: f64, quantity: &str) -> usize {
    let exact = seconds * rate;
    if exact <= 0.0 {
        return 0;
    }
    let samples = exact.ceil();
    if exact.fract() != 0.0 {
        warn!(
            quantity,
            requested = exact,
            samples = samples as u64,
            "Non-integer number of samples, rounding up"
        );
    }
    samples as usize
}

/// Repeat `seq` back to back `times` times.
pub(crate) fn tile<T: Clone>(seq: &[T], times: usize) -> Vec<T> {
    let mut out = Vec::with_capacity(seq.len() * times);
    for _ in 0..times {
        out.extend_from_slice(seq);
    }
    out
}

/// Number of positions along an axis of `size` travelled in steps of `step`.
pub fn axis_positions(size: f64, step: f64) -> usize {
    1 + (size / step).ceil().max(0.0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_ramp_inclusive_endpoints() {
        let ramp = compute_ramp(0.0, 5.0, 6);
        assert_eq!(ramp, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(compute_ramp(2.0, 9.0, 1), vec![2.0]);
        assert!(compute_ramp(0.0, 1.0, 0).is_empty());
    }

    #[test]
    fn test_smooth_ramp_shape() {
        let ramp = compute_smooth_ramp(5.0, 0.0, 100, DEFAULT_CURVE_FRACTION);
        assert_eq!(ramp.len(), 100);
        assert_eq!(ramp[0], 5.0);
        // Curve ends exactly at the target, then holds
        assert!((ramp[59] - 0.0).abs() < 1e-12);
        assert!(ramp[60..].iter().all(|&v| v == 0.0));
        // Monotonic descent along the curve
        assert!(ramp[..60].windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn test_smooth_ramp_length_is_exact() {
        for n in 0..50 {
            assert_eq!(compute_smooth_ramp(0.0, 1.0, n, DEFAULT_CURVE_FRACTION).len(), n);
        }
    }

    #[test]
    fn test_integer_sample_counts() {
        assert_eq!(sample_count(0.005, 100_000.0, "sequence"), 500);
        assert_eq!(sample_count(0.001, 100_000.0, "return"), 100);
        assert_eq!(sample_count(0.0, 100_000.0, "return"), 0);
    }

    #[test]
    #[traced_test]
    fn test_non_integer_rounds_up_and_logs() {
        assert_eq!(sample_count(0.0051, 100_000.0, "sequence"), 511);
        assert!(logs_contain("rounding up"));
    }

    #[test]
    fn test_tile() {
        assert_eq!(tile(&[1, 2], 3), vec![1, 2, 1, 2, 1, 2]);
        assert!(tile(&[1, 2], 0).is_empty());
    }

    #[test]
    fn test_axis_positions() {
        assert_eq!(axis_positions(5.0, 1.0), 6);
        assert_eq!(axis_positions(5.0, 2.0), 4);
        assert_eq!(axis_positions(0.0, 1.0), 1);
    }
}
