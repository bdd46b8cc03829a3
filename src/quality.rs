//! Full-reference similarity metrics over I420 frames

use crate::capture::Frame;

/// PSNR reported for identical frames.
pub const MAX_PSNR: f64 = 128.0;

/// Score returned when two frames cannot be compared (size mismatch).
pub const INVALID_SCORE: f64 = -1.0;

const SSIM_WINDOW: usize = 8;
const SSIM_STEP: usize = 4;
const C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

/// Similarity between a reference and a processed frame. Implementations
/// must be pure; the analyzer calls them from several threads at once and
/// never while holding a lock.
pub trait FrameMetric: Send + Sync {
    /// Peak signal-to-noise ratio in dB, higher is better.
    fn psnr(&self, reference: &Frame, test: &Frame) -> f64;

    /// Structural similarity in [0, 1], higher is better.
    fn ssim(&self, reference: &Frame, test: &Frame) -> f64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct I420Metric;

impl FrameMetric for I420Metric {
    fn psnr(&self, reference: &Frame, test: &Frame) -> f64 {
        i420_psnr(reference, test)
    }

    fn ssim(&self, reference: &Frame, test: &Frame) -> f64 {
        i420_ssim(reference, test)
    }
}

fn sum_square_error(a: &[u8], b: &[u8]) -> u64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x as i64 - y as i64;
            (d * d) as u64
        })
        .sum()
}

pub fn sse_to_psnr(sse: u64, samples: usize) -> f64 {
    if sse == 0 || samples == 0 {
        return MAX_PSNR;
    }
    let mse = sse as f64 / samples as f64;
    (10.0 * (255.0 * 255.0 / mse).log10()).min(MAX_PSNR)
}

/// PSNR over all three planes together.
pub fn i420_psnr(reference: &Frame, test: &Frame) -> f64 {
    if !reference.same_size(test) {
        return INVALID_SCORE;
    }
    let sse = sum_square_error(&reference.data, &test.data);
    sse_to_psnr(sse, reference.data.len())
}

/// SSIM of an I420 frame: luma weighted 0.8, each chroma plane 0.1.
pub fn i420_ssim(reference: &Frame, test: &Frame) -> f64 {
    if !reference.same_size(test) {
        return INVALID_SCORE;
    }
    let (w, h) = (reference.width as usize, reference.height as usize);
    let (cw, ch) = (reference.chroma_width(), reference.chroma_height());

    let y = plane_ssim(reference.y(), test.y(), w, h);
    let u = plane_ssim(reference.u(), test.u(), cw, ch);
    let v = plane_ssim(reference.v(), test.v(), cw, ch);
    0.8 * y + 0.1 * (u + v)
}

/// Mean SSIM over 8x8 windows placed every 4 pixels. Planes smaller than a
/// window are scored as a single window.
pub fn plane_ssim(a: &[u8], b: &[u8], width: usize, height: usize) -> f64 {
    if width < SSIM_WINDOW || height < SSIM_WINDOW {
        return window_ssim(a, b, width, 0, 0, width, height);
    }

    let mut total = 0.0;
    let mut windows = 0usize;
    let mut y = 0;
    while y + SSIM_WINDOW <= height {
        let mut x = 0;
        while x + SSIM_WINDOW <= width {
            total += window_ssim(a, b, width, x, y, SSIM_WINDOW, SSIM_WINDOW);
            windows += 1;
            x += SSIM_STEP;
        }
        y += SSIM_STEP;
    }
    total / windows as f64
}

fn window_ssim(
    a: &[u8],
    b: &[u8],
    stride: usize,
    x0: usize,
    y0: usize,
    width: usize,
    height: usize,
) -> f64 {
    let (mut sum_a, mut sum_b, mut sum_aa, mut sum_bb, mut sum_ab) = (0u64, 0u64, 0u64, 0u64, 0u64);
    for y in y0..y0 + height {
        let row = y * stride;
        for x in x0..x0 + width {
            let (pa, pb) = (a[row + x] as u64, b[row + x] as u64);
            sum_a += pa;
            sum_b += pb;
            sum_aa += pa * pa;
            sum_bb += pb * pb;
            sum_ab += pa * pb;
        }
    }

    let n = (width * height) as f64;
    if n == 0.0 {
        return 1.0;
    }
    let mean_a = sum_a as f64 / n;
    let mean_b = sum_b as f64 / n;
    let var_a = sum_aa as f64 / n - mean_a * mean_a;
    let var_b = sum_bb as f64 / n - mean_b * mean_b;
    let cov = sum_ab as f64 / n - mean_a * mean_b;

    let numerator = (2.0 * mean_a * mean_b + C1) * (2.0 * cov + C2);
    let denominator = (mean_a * mean_a + mean_b * mean_b + C1) * (var_a + var_b + C2);
    numerator / denominator
}
