//! Places a synthesized face back into the frame.
//!
//! Work is confined to a region of interest around the target bbox: the face
//! and its silhouette are warped straight into ROI coordinates, the mask is
//! shaped there, and only ROI pixels are blended.

use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

use crate::alignment::{warp_affine, AffineTransform};
use crate::mask::{build_compositing_mask, MaskParams};
use crate::raster::{Raster, Rect};
use crate::types::{BoundingBox, DetectedFace};

/// Side length of the mosaic grid used by pixelate mode.
pub const PIXELATE_GRID: u32 = 16;

/// User nudges applied to the crop → frame matrix before placement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineNudge {
    /// Multiplier on the linear part (scales about the frame origin).
    pub scale: f32,
    pub dx: f32,
    pub dy: f32,
}

impl Default for AffineNudge {
    fn default() -> Self {
        Self {
            scale: 1.0,
            dx: 0.0,
            dy: 0.0,
        }
    }
}

impl AffineNudge {
    pub fn apply(&self, inverse: &AffineTransform) -> AffineTransform {
        inverse.scaled_linear(self.scale).translated(self.dx, self.dy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompositeParams {
    /// Pixels added around the bbox on every side before clamping.
    pub roi_margin: i32,
    pub mask: MaskParams,
    pub nudge: AffineNudge,
}

impl Default for CompositeParams {
    fn default() -> Self {
        Self {
            roi_margin: 76,
            mask: MaskParams::default(),
            nudge: AffineNudge::default(),
        }
    }
}

/// Bbox grown by `margin` and clamped to the frame.
///
/// Bbox coordinates are truncated to integers first. Returns `None` when the
/// clamped region is empty, e.g. a bbox entirely outside the frame.
pub fn compute_roi(bbox: &BoundingBox, margin: i32, frame_width: u32, frame_height: u32) -> Option<Rect> {
    if ![bbox.x1, bbox.y1, bbox.x2, bbox.y2].iter().all(|v| v.is_finite()) {
        return None;
    }
    let margin = i64::from(margin.max(0));
    let x0 = (bbox.x1 as i64 - margin).max(0);
    let y0 = (bbox.y1 as i64 - margin).max(0);
    let x_end = (bbox.x2 as i64 + margin).min(i64::from(frame_width));
    let y_end = (bbox.y2 as i64 + margin).min(i64::from(frame_height));

    if x_end <= x0 || y_end <= y0 {
        return None;
    }
    Some(Rect {
        x: x0 as u32,
        y: y0 as u32,
        width: (x_end - x0) as u32,
        height: (y_end - y0) as u32,
    })
}

/// Blend `fake_face` into `frame` around `bbox`.
///
/// `inverse` maps fake-face coordinates to frame coordinates. Returns `false`
/// when nothing was composited (empty ROI or channel mismatch); the frame is
/// untouched in that case.
pub fn composite(
    frame: &mut Raster,
    fake_face: &Raster,
    inverse: &AffineTransform,
    bbox: &BoundingBox,
    params: &CompositeParams,
) -> bool {
    if fake_face.channels() != frame.channels() {
        tracing::debug!(
            frame = frame.channels(),
            face = fake_face.channels(),
            "channel mismatch; skipping composite"
        );
        return false;
    }
    let Some(roi) = compute_roi(bbox, params.roi_margin, frame.width(), frame.height()) else {
        tracing::debug!(?bbox, "empty ROI; skipping composite");
        return false;
    };

    let local = params
        .nudge
        .apply(inverse)
        .translated(-(roi.x as f32), -(roi.y as f32));

    let warped = warp_affine(fake_face, &local, roi.width, roi.height);
    let opaque = Raster::filled(fake_face.width(), fake_face.height(), 1, 255);
    let silhouette = warp_affine(&opaque, &local, roi.width, roi.height);
    let mask = build_compositing_mask(&silhouette, &params.mask);

    blend_into(frame, roi, &warped, &mask);
    true
}

/// `out = face * a + frame * (1 - a)` over the ROI, with `a = mask / 255`.
fn blend_into(frame: &mut Raster, roi: Rect, face: &Raster, mask: &Raster) {
    let c = frame.channels() as usize;
    let stride = frame.stride();
    let roi_w = roi.width as usize;
    let alpha = mask.data();
    let face = face.data();
    let data = frame.data_mut();

    for row in 0..roi.height as usize {
        let frame_row = (roi.y as usize + row) * stride + roi.x as usize * c;
        for col in 0..roi_w {
            let a = u32::from(alpha[row * roi_w + col]);
            if a == 0 {
                continue;
            }
            let src = (row * roi_w + col) * c;
            let dst = frame_row + col * c;
            for k in 0..c {
                let f = u32::from(face[src + k]);
                let b = u32::from(data[dst + k]);
                data[dst + k] = ((f * a + b * (255 - a) + 127) / 255) as u8;
            }
        }
    }
}

/// Mosaic every detected face region in place.
pub fn pixelate(frame: &mut Raster, faces: &[DetectedFace]) {
    for face in faces {
        let Some(rect) = compute_roi(&face.bbox, 0, frame.width(), frame.height()) else {
            continue;
        };
        let region = frame.crop(rect);
        let mosaic = region
            .resized(PIXELATE_GRID, PIXELATE_GRID, FilterType::Triangle)
            .and_then(|small| small.resized(rect.width, rect.height, FilterType::Nearest));
        match mosaic {
            Ok(mosaic) => frame.write_region(rect, &mosaic),
            Err(e) => tracing::debug!(error = %e, "pixelate skipped a region"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x1: f32, y1: f32, x2: f32, y2: f32) -> BoundingBox {
        BoundingBox { x1, y1, x2, y2 }
    }

    fn test_params(margin: i32) -> CompositeParams {
        CompositeParams {
            roi_margin: margin,
            mask: MaskParams {
                expansion: 0,
                feather: 15,
                core_tightness: 5,
            },
            nudge: AffineNudge::default(),
        }
    }

    #[test]
    fn test_roi_right_edge_clamps_to_frame_width() {
        let roi = compute_roi(&bbox(600.0, 100.0, 700.0, 200.0), 20, 640, 480).unwrap();
        assert_eq!(roi.x, 580);
        assert_eq!(roi.right(), 640);
        assert_eq!(roi.y, 80);
        assert_eq!(roi.bottom(), 220);
    }

    #[test]
    fn test_roi_left_edge_clamps_to_zero() {
        let roi = compute_roi(&bbox(5.5, 3.9, 50.2, 40.0), 10, 640, 480).unwrap();
        assert_eq!((roi.x, roi.y), (0, 0));
        assert_eq!((roi.width, roi.height), (60, 50));
    }

    #[test]
    fn test_roi_outside_frame_is_none() {
        assert!(compute_roi(&bbox(700.0, 10.0, 800.0, 50.0), 20, 640, 480).is_none());
        assert!(compute_roi(&bbox(f32::NAN, 0.0, 10.0, 10.0), 0, 640, 480).is_none());
    }

    #[test]
    fn test_nudge_scales_linear_part_then_translates() {
        let m = AffineTransform([2.0, 0.5, 10.0, -0.5, 2.0, 20.0]);
        let nudge = AffineNudge {
            scale: 0.5,
            dx: 3.0,
            dy: -4.0,
        };
        assert_eq!(nudge.apply(&m), AffineTransform([1.0, 0.25, 13.0, -0.25, 1.0, 16.0]));
    }

    #[test]
    fn test_composite_outside_frame_leaves_frame_unchanged() {
        let mut frame = Raster::filled(64, 48, 3, 77);
        let before = frame.clone();
        let fake = Raster::filled(16, 16, 3, 200);
        let done = composite(
            &mut frame,
            &fake,
            &AffineTransform::IDENTITY,
            &bbox(100.0, 100.0, 120.0, 120.0),
            &test_params(4),
        );
        assert!(!done);
        assert_eq!(frame, before);
    }

    #[test]
    fn test_composite_fills_center_and_spares_outside_roi() {
        let mut frame = Raster::filled(200, 200, 3, 10);
        let fake = Raster::filled(40, 40, 3, 250);
        // Fake face placed at (80, 80) in the frame.
        let inverse = AffineTransform::IDENTITY.translated(80.0, 80.0);
        let face_box = bbox(80.0, 80.0, 120.0, 120.0);
        assert!(composite(&mut frame, &fake, &inverse, &face_box, &test_params(10)));

        assert_eq!(frame.pixel(100, 100), &[250, 250, 250]);
        for (x, y) in [(69, 100), (131, 100), (100, 69), (100, 131), (0, 0), (199, 199)] {
            assert_eq!(frame.pixel(x, y), &[10, 10, 10], "({x}, {y}) changed");
        }
    }

    #[test]
    fn test_pixelate_flattens_region_only() {
        let mut frame = Raster::zeroed(64, 64, 3);
        for (i, v) in frame.data_mut().iter_mut().enumerate() {
            *v = (i % 251) as u8;
        }
        let before = frame.clone();
        let face = DetectedFace {
            bbox: bbox(16.0, 16.0, 48.0, 48.0),
            landmarks: [(0.0, 0.0); 5],
            score: 0.9,
        };
        pixelate(&mut frame, &[face]);

        assert_eq!(frame.pixel(0, 0), before.pixel(0, 0));
        assert_eq!(frame.pixel(63, 63), before.pixel(63, 63));
        let rect = Rect {
            x: 16,
            y: 16,
            width: 32,
            height: 32,
        };
        let region = frame.crop(rect);
        assert_ne!(region, before.crop(rect));
        let colours: std::collections::HashSet<&[u8]> = region.data().chunks_exact(3).collect();
        assert!(colours.len() <= (PIXELATE_GRID * PIXELATE_GRID) as usize, "{} colours", colours.len());
    }
}
