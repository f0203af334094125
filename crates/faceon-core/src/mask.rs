//! Compositing mask construction.
//!
//! All masks here are single-channel [`Raster`]s with 0 = transparent and
//! 255 = opaque. The pipeline is:
//!
//! ```text
//! silhouette → expand/erode → gaussian feather ─┐
//!                    │                          ├─ max → compositing mask
//!                    └────── core erosion ──────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::raster::Raster;

/// Minimum feather kernel; a 1-tap blur would leave a hard seam.
pub const MIN_FEATHER_KERNEL: usize = 3;

/// Mask-shaping tunables, all in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaskParams {
    /// > 0 dilates the silhouette, < 0 erodes it, 0 leaves it alone.
    pub expansion: i32,
    /// Gaussian kernel size for the soft edge.
    pub feather: i32,
    /// Erosion kernel for the always-opaque core. 0 keeps the adjusted mask.
    pub core_tightness: i32,
}

impl Default for MaskParams {
    fn default() -> Self {
        Self {
            expansion: -50,
            feather: 101,
            core_tightness: 41,
        }
    }
}

/// Clamp a kernel size to an odd value ≥ 1.
pub fn odd_kernel(size: i32) -> usize {
    let k = size.max(1) as usize;
    if k % 2 == 0 {
        k + 1
    } else {
        k
    }
}

/// Clamp a feather kernel to an odd value ≥ 3.
pub fn feather_kernel(size: i32) -> usize {
    odd_kernel(size).max(MIN_FEATHER_KERNEL)
}

/// Shape a warped silhouette into the final alpha mask.
pub fn build_compositing_mask(silhouette: &Raster, params: &MaskParams) -> Raster {
    debug_assert_eq!(silhouette.channels(), 1);

    let adjusted = match params.expansion {
        e if e > 0 => dilate(silhouette, odd_kernel(e)),
        e if e < 0 => erode(silhouette, odd_kernel(e.saturating_abs())),
        _ => silhouette.clone(),
    };

    let mut feathered = gaussian_blur(&adjusted, feather_kernel(params.feather));

    let core = if params.core_tightness > 0 {
        erode(&adjusted, odd_kernel(params.core_tightness))
    } else {
        adjusted
    };

    for (f, c) in feathered.data_mut().iter_mut().zip(core.data()) {
        *f = (*f).max(*c);
    }
    feathered
}

/// Grayscale dilation with a square `k`×`k` kernel. Out-of-bounds taps are ignored.
pub fn dilate(mask: &Raster, k: usize) -> Raster {
    morphology(mask, k, u8::max)
}

/// Grayscale erosion with a square `k`×`k` kernel. Out-of-bounds taps are ignored.
pub fn erode(mask: &Raster, k: usize) -> Raster {
    morphology(mask, k, u8::min)
}

/// A square window reduces to a row pass followed by a column pass.
fn morphology(mask: &Raster, k: usize, pick: fn(u8, u8) -> u8) -> Raster {
    if k <= 1 || mask.width() == 0 || mask.height() == 0 {
        return mask.clone();
    }
    let w = mask.width() as usize;
    let h = mask.height() as usize;
    let half = k / 2;
    let src = mask.data();

    let mut rows = vec![0u8; w * h];
    for y in 0..h {
        let line = &src[y * w..(y + 1) * w];
        for x in 0..w {
            let lo = x.saturating_sub(half);
            let hi = (x + half).min(w - 1);
            rows[y * w + x] = line[lo..=hi].iter().copied().fold(line[x], pick);
        }
    }

    let mut out = Raster::zeroed(mask.width(), mask.height(), 1);
    let dst = out.data_mut();
    for y in 0..h {
        let lo = y.saturating_sub(half);
        let hi = (y + half).min(h - 1);
        for x in 0..w {
            dst[y * w + x] = (lo..=hi).map(|yy| rows[yy * w + x]).fold(rows[y * w + x], pick);
        }
    }
    out
}

/// 1-D Gaussian taps for an odd `kernel_size`, normalized to sum 1.
///
/// Sigma follows OpenCV's `sigma = 0` rule: `0.3 * ((k - 1) / 2 - 1) + 0.8`.
pub fn gaussian_kernel_1d(kernel_size: usize) -> Vec<f32> {
    debug_assert!(kernel_size >= 1 && kernel_size % 2 == 1);
    let sigma = 0.3 * ((kernel_size as f64 - 1.0) * 0.5 - 1.0) + 0.8;
    let half = (kernel_size / 2) as f64;
    let taps: Vec<f64> = (0..kernel_size)
        .map(|i| {
            let x = i as f64 - half;
            (-x * x / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = taps.iter().sum();
    taps.iter().map(|&v| (v / sum) as f32).collect()
}

/// Separable Gaussian blur of a single-channel mask with reflect-101 borders.
pub fn gaussian_blur(mask: &Raster, kernel_size: usize) -> Raster {
    if kernel_size <= 1 || mask.width() == 0 || mask.height() == 0 {
        return mask.clone();
    }
    let kernel = gaussian_kernel_1d(kernel_size);
    let half = (kernel_size / 2) as isize;
    let w = mask.width() as usize;
    let h = mask.height() as usize;
    let src = mask.data();

    // Horizontal pass: src → temp
    let mut temp = vec![0.0f32; w * h];
    for y in 0..h {
        let line = &src[y * w..(y + 1) * w];
        for x in 0..w {
            let mut sum = 0.0f32;
            for (i, &tap) in kernel.iter().enumerate() {
                let sx = reflect_101(x as isize + i as isize - half, w);
                sum += line[sx] as f32 * tap;
            }
            temp[y * w + x] = sum;
        }
    }

    // Vertical pass: temp → out
    let mut out = Raster::zeroed(mask.width(), mask.height(), 1);
    let dst = out.data_mut();
    for y in 0..h {
        for x in 0..w {
            let mut sum = 0.0f32;
            for (i, &tap) in kernel.iter().enumerate() {
                let sy = reflect_101(y as isize + i as isize - half, h);
                sum += temp[sy * w + x] * tap;
            }
            dst[y * w + x] = sum.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Border index for `gfedcb|abcdefgh|gfedcba`.
fn reflect_101(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let n = n as isize;
    let period = 2 * (n - 1);
    let i = i.rem_euclid(period);
    (if i >= n { period - i } else { i }) as usize
}
