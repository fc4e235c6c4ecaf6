//! Test pattern pixels for simulated frames.

/// LCG step for reproducible per-pixel noise.
#[inline]
fn lcg(seed: u64) -> u64 {
    seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407)
}

/// Fill a `width × height` frame with a recognizable, moving pattern.
///
/// Layers: diagonal gradient background, a bright bar across the first row
/// encoding `sequence` in binary, a Gaussian spot orbiting the centre and a
/// little noise. Equal inputs give equal output.
pub fn generate_test_pattern(width: u32, height: u32, sequence: u64) -> Vec<u16> {
    let w = width as usize;
    let h = height as usize;
    let mut pixels = vec![0u16; w * h];
    if w == 0 || h == 0 {
        return pixels;
    }

    let cx = w as f64 / 2.0;
    let cy = h as f64 / 2.0;
    let orbit = (w.min(h) as f64) / 4.0;
    let angle = sequence as f64 * 0.1;
    let spot_x = cx + orbit * angle.cos();
    let spot_y = cy + orbit * angle.sin();
    let sigma = (w.min(h) as f64 / 10.0).max(1.0);
    let seed = lcg(sequence ^ 0x9e37_79b9_7f4a_7c15);

    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            let gradient = ((x + y) * 32_768 / (w + h)) as f64;

            let dx = x as f64 - spot_x;
            let dy = y as f64 - spot_y;
            let spot = 30_000.0 * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();

            let noise = (lcg(seed ^ idx as u64) >> 52) as f64; // 0..4096
            pixels[idx] = (gradient + spot + noise).min(u16::MAX as f64) as u16;
        }
    }

    // Sequence stamp, one pixel per bit, LSB first
    for (bit, pixel) in pixels.iter_mut().take(w.min(64)).enumerate() {
        *pixel = if (sequence >> bit) & 1 == 1 { u16::MAX } else { 0 };
    }
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        assert_eq!(generate_test_pattern(16, 8, 3), generate_test_pattern(16, 8, 3));
        assert_ne!(generate_test_pattern(16, 8, 3), generate_test_pattern(16, 8, 4));
    }

    #[test]
    fn test_sequence_stamp() {
        let pixels = generate_test_pattern(16, 4, 0b101);
        assert_eq!(pixels.len(), 64);
        assert_eq!(&pixels[..3], &[u16::MAX, 0, u16::MAX]);
    }

    #[test]
    fn test_empty_geometry() {
        assert!(generate_test_pattern(0, 10, 1).is_empty());
    }
}
