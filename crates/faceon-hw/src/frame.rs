//! Frame type and pixel conversion from camera formats to BGR.

use faceon_core::raster::RasterError;
use faceon_core::Raster;

/// A captured camera frame, always 3-channel BGR.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: Raster,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    /// Average sample value over all channels (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let data = self.image.data();
        if data.is_empty() {
            return 0.0;
        }
        data.iter().map(|&b| b as f32).sum::<f32>() / data.len() as f32
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("buffer too short: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("row stride {stride} is smaller than a {width}-pixel row")]
    InvalidStride { stride: usize, width: u32 },
    #[error(transparent)]
    Raster(#[from] RasterError),
}

fn check_layout(buf: &[u8], width: u32, height: u32, stride: usize, bpp: usize) -> Result<(), FrameError> {
    let row = width as usize * bpp;
    if stride < row || stride == 0 {
        return Err(FrameError::InvalidStride { stride, width });
    }
    let expected = if height == 0 { 0 } else { stride * (height as usize - 1) + row };
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// BT.601 limited-range YCbCr to BGR, integer fixed point.
#[inline]
fn ycbcr_to_bgr(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = 298 * (y as i32 - 16);
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(c + 516 * d),
        clamp(c - 100 * d - 208 * e),
        clamp(c + 409 * e),
    ]
}

/// Convert packed YUYV (4:2:2) to BGR.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share the
/// chroma pair. `stride` is the driver's bytes-per-line.
pub fn yuyv_to_bgr(yuyv: &[u8], width: u32, height: u32, stride: usize) -> Result<Raster, FrameError> {
    check_layout(yuyv, width, height, stride, 2)?;
    let w = width as usize;
    let mut out = Vec::with_capacity(w * height as usize * 3);

    for row in yuyv.chunks(stride).take(height as usize) {
        for x in 0..w {
            let pair = (x / 2) * 4;
            let y = row[x * 2];
            let (u, v) = (row[pair + 1], row[pair + 3]);
            out.extend_from_slice(&ycbcr_to_bgr(y, u, v));
        }
    }

    Ok(Raster::new(out, width, height, 3)?)
}

/// Convert 24-bit packed RGB (`RGB3`) or BGR (`BGR3`) rows to a BGR raster.
pub fn packed24_to_bgr(
    buf: &[u8],
    width: u32,
    height: u32,
    stride: usize,
    source_is_rgb: bool,
) -> Result<Raster, FrameError> {
    check_layout(buf, width, height, stride, 3)?;
    let row_len = width as usize * 3;
    let mut out = Vec::with_capacity(row_len * height as usize);
    for row in buf.chunks(stride).take(height as usize) {
        out.extend_from_slice(&row[..row_len]);
    }

    let mut image = Raster::new(out, width, height, 3)?;
    if source_is_rgb {
        image.swap_red_blue();
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_black_and_white() {
        // 2x1 image: Y0 = black, Y1 = white, neutral chroma
        let yuyv = vec![16, 128, 235, 128];
        let bgr = yuyv_to_bgr(&yuyv, 2, 1, 4).unwrap();
        assert_eq!(bgr.pixel(0, 0), &[0, 0, 0]);
        assert_eq!(bgr.pixel(1, 0), &[255, 255, 255]);
    }

    #[test]
    fn test_yuyv_neutral_chroma_is_grey() {
        let yuyv = vec![126, 128, 126, 128];
        let bgr = yuyv_to_bgr(&yuyv, 2, 1, 4).unwrap();
        let px = bgr.pixel(0, 0);
        assert_eq!(px[0], px[1]);
        assert_eq!(px[1], px[2]);
        assert_eq!(px[0], 128);
    }

    #[test]
    fn test_yuyv_red_chroma() {
        // High Cr pushes red up and blue stays near the luma level.
        let yuyv = vec![81, 90, 81, 240];
        let bgr = yuyv_to_bgr(&yuyv, 2, 1, 4).unwrap();
        let px = bgr.pixel(0, 0);
        assert!(px[2] > 200, "red = {}", px[2]);
        assert!(px[0] < 60, "blue = {}", px[0]);
    }

    #[test]
    fn test_yuyv_respects_stride() {
        // 2x2 with 4 bytes of row padding
        let mut yuyv = vec![16, 128, 16, 128, 0xAA, 0xAA, 0xAA, 0xAA];
        yuyv.extend_from_slice(&[235, 128, 235, 128, 0xAA, 0xAA, 0xAA, 0xAA]);
        let bgr = yuyv_to_bgr(&yuyv, 2, 2, 8).unwrap();
        assert_eq!(bgr.pixel(1, 0), &[0, 0, 0]);
        assert_eq!(bgr.pixel(0, 1), &[255, 255, 255]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128];
        assert!(matches!(
            yuyv_to_bgr(&yuyv, 2, 1, 4),
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_yuyv_invalid_stride() {
        let yuyv = vec![0u8; 16];
        assert!(matches!(
            yuyv_to_bgr(&yuyv, 4, 2, 6),
            Err(FrameError::InvalidStride { .. })
        ));
    }

    #[test]
    fn test_rgb3_swaps_to_bgr() {
        let rgb = vec![10, 20, 30, 40, 50, 60];
        let bgr = packed24_to_bgr(&rgb, 2, 1, 6, true).unwrap();
        assert_eq!(bgr.data(), &[30, 20, 10, 60, 50, 40]);
    }

    #[test]
    fn test_bgr3_copied_without_padding() {
        let bgr_in = vec![1, 2, 3, 0, 4, 5, 6, 0];
        let bgr = packed24_to_bgr(&bgr_in, 1, 2, 4, false).unwrap();
        assert_eq!(bgr.data(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_avg_brightness() {
        let frame = Frame {
            image: Raster::filled(4, 4, 3, 100),
            timestamp: std::time::Instant::now(),
            sequence: 0,
        };
        assert!((frame.avg_brightness() - 100.0).abs() < 1e-4);
    }
}
