//! Face alignment via 4-DOF similarity transform.
//!
//! Maps detected five-point landmarks onto the canonical InsightFace template
//! (scaled to the consumer's crop size) by least squares, and warps images
//! with arbitrary 2×3 affine matrices. The same code serves the 112×112
//! recognition crop and the swap model's crop.

use crate::raster::Raster;
use crate::types::Landmarks;

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: Landmarks = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const REFERENCE_SIZE: u32 = 112;

/// Landmarks closer together than this (in pixels) cannot anchor a fit.
const MIN_LANDMARK_SPREAD: f32 = 1.0;

/// Row-major 2×3 affine matrix:
/// ```text
/// | m[0]  m[1]  m[2] |
/// | m[3]  m[4]  m[5] |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform(pub [f32; 6]);

impl AffineTransform {
    pub const IDENTITY: AffineTransform = AffineTransform([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        let m = &self.0;
        (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
    }

    /// Inverse mapping. Returns `None` for a singular linear part.
    pub fn invert(&self) -> Option<AffineTransform> {
        let [a, b, tx, c, d, ty] = self.0.map(f64::from);
        let det = a * d - b * c;
        if det.abs() < 1e-12 {
            return None;
        }
        let ia = d / det;
        let ib = -b / det;
        let ic = -c / det;
        let id = a / det;
        let itx = -(ia * tx + ib * ty);
        let ity = -(ic * tx + id * ty);
        Some(AffineTransform(
            [ia, ib, itx, ic, id, ity].map(|v| v as f32),
        ))
    }

    /// Shift the output by (dx, dy).
    pub fn translated(&self, dx: f32, dy: f32) -> AffineTransform {
        let mut m = self.0;
        m[2] += dx;
        m[5] += dy;
        AffineTransform(m)
    }

    /// Multiply the linear part by `factor`, leaving translation untouched.
    pub fn scaled_linear(&self, factor: f32) -> AffineTransform {
        let mut m = self.0;
        m[0] *= factor;
        m[1] *= factor;
        m[3] *= factor;
        m[4] *= factor;
        AffineTransform(m)
    }
}

/// True when the landmarks cannot support a similarity fit: non-finite
/// coordinates, or all points collapsed to (nearly) one location.
pub fn landmarks_are_degenerate(landmarks: &Landmarks) -> bool {
    if landmarks.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
        return true;
    }
    let (min_x, max_x, min_y, max_y) = landmarks.iter().fold(
        (f32::MAX, f32::MIN, f32::MAX, f32::MIN),
        |(a, b, c, d), &(x, y)| (a.min(x), b.max(x), c.min(y), d.max(y)),
    );
    (max_x - min_x).max(max_y - min_y) < MIN_LANDMARK_SPREAD
}

/// Similarity transform taking `landmarks` onto the reference template scaled
/// to `target_size / 112`.
///
/// `mouth_y_offset` shifts both mouth-corner targets vertically (in 112-space)
/// on a local copy of the template.
///
/// Precondition: landmarks are not degenerate (see [`landmarks_are_degenerate`]).
/// The fit is undefined otherwise.
pub fn estimate_norm(landmarks: &Landmarks, target_size: u32, mouth_y_offset: f32) -> AffineTransform {
    let mut template = REFERENCE_LANDMARKS_112;
    template[3].1 += mouth_y_offset;
    template[4].1 += mouth_y_offset;

    let ratio = target_size as f32 / REFERENCE_SIZE as f32;
    let dst = template.map(|(x, y)| (x * ratio, y * ratio));

    estimate_similarity_transform(landmarks, &dst)
}

/// Least-squares 4-DOF similarity transform from `src` to `dst`.
///
/// Returns the matrix
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
fn estimate_similarity_transform(src: &Landmarks, dst: &Landmarks) -> AffineTransform {
    // Build overdetermined system A * [a, b, tx, ty]^T = B
    // For each point pair (sx, sy) -> (dx, dy):
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [0.0f64; 16]; // 4x4, row-major
    let mut atb = [0.0f64; 4];

    for i in 0..5 {
        let (sx, sy) = (src[i].0 as f64, src[i].1 as f64);
        let (dx, dy) = (dst[i].0 as f64, dst[i].1 as f64);

        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j * 4 + k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let [a, b, tx, ty] = solve_4x4(&ata, &atb);
    AffineTransform([a, -b, tx, b, a, ty].map(|v| v as f32))
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: &[f64; 16], atb: &[f64; 4]) -> [f64; 4] {
    // Augmented matrix [A | b] as 4x5
    let mut m = [[0.0f64; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = ata[i * 4 + j];
        }
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut max_row = col;
        let mut max_val = m[col][col].abs();
        for row in (col + 1)..4 {
            if m[row][col].abs() > max_val {
                max_val = m[row][col].abs();
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0]; // degenerate input: identity-ish
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f64; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    x
}

/// Warp `image` through `matrix` into a `width`×`height` output.
///
/// `matrix` maps source coordinates to output coordinates; each output pixel
/// is sampled at the inverse-mapped source position with bilinear
/// interpolation. Samples outside the source read as 0 (black), and a
/// singular matrix yields an all-black output.
pub fn warp_affine(image: &Raster, matrix: &AffineTransform, width: u32, height: u32) -> Raster {
    let channels = image.channels() as usize;
    let mut output = Raster::zeroed(width, height, image.channels());

    let Some(inv) = matrix.invert() else {
        return output;
    };
    let [ia, ib, itx, ic, id, ity] = inv.0;

    let src = image.data();
    let src_w = image.width() as i32;
    let src_h = image.height() as i32;
    let stride = image.stride();
    let out_w = width as usize;
    let out = output.data_mut();

    let mut px = [0.0f32; 4];
    for oy in 0..height as usize {
        let fy = oy as f32;
        for ox in 0..out_w {
            let fx = ox as f32;
            let sx = ia * fx + ib * fy + itx;
            let sy = ic * fx + id * fy + ity;

            let x0 = sx.floor() as i32;
            let y0 = sy.floor() as i32;
            if x0 < -1 || y0 < -1 || x0 >= src_w || y0 >= src_h {
                continue;
            }
            let wx = sx - x0 as f32;
            let wy = sy - y0 as f32;

            px[..channels].fill(0.0);
            for (dx, dy, w) in [
                (0, 0, (1.0 - wx) * (1.0 - wy)),
                (1, 0, wx * (1.0 - wy)),
                (0, 1, (1.0 - wx) * wy),
                (1, 1, wx * wy),
            ] {
                let (x, y) = (x0 + dx, y0 + dy);
                if x < 0 || y < 0 || x >= src_w || y >= src_h || w == 0.0 {
                    continue;
                }
                let base = y as usize * stride + x as usize * channels;
                for c in 0..channels {
                    px[c] += src[base + c] as f32 * w;
                }
            }

            let base = (oy * out_w + ox) * channels;
            for c in 0..channels {
                out[base + c] = px[c].round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    output
}

/// Align a detected face to a canonical `size`×`size` crop.
///
/// Returns the crop together with the forward matrix (frame → crop) so the
/// caller can place results back into the frame.
pub fn norm_crop(
    frame: &Raster,
    landmarks: &Landmarks,
    size: u32,
    mouth_y_offset: f32,
) -> (Raster, AffineTransform) {
    let matrix = estimate_norm(landmarks, size, mouth_y_offset);
    let crop = warp_affine(frame, &matrix, size, size);
    (crop, matrix)
}
