use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::raster::Raster;

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Landmarks = [(f32, f32); 5];

/// Corner-form bounding box in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }
}

/// A face found by the detector in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub landmarks: Landmarks,
    pub score: f32,
}

/// Identity vector as produced by the recognizer.
///
/// The raw values are kept private so the normalized copy can never go stale:
/// it is computed on first use and dropped whenever the raw values change.
#[derive(Debug, Clone, Default)]
pub struct IdentityEmbedding {
    raw: Vec<f32>,
    normed: OnceLock<Vec<f32>>,
}

impl IdentityEmbedding {
    pub fn new(raw: Vec<f32>) -> Self {
        Self {
            raw,
            normed: OnceLock::new(),
        }
    }

    pub fn raw(&self) -> &[f32] {
        &self.raw
    }

    pub fn set_raw(&mut self, raw: Vec<f32>) {
        self.raw = raw;
        self.normed = OnceLock::new();
    }

    /// L2-normalized view of the raw vector. A zero vector is returned as-is.
    pub fn normalized(&self) -> &[f32] {
        self.normed.get_or_init(|| l2_normalize(&self.raw))
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

impl PartialEq for IdentityEmbedding {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

/// Divide by the Euclidean norm; zero-norm input comes back unchanged.
pub fn l2_normalize(values: &[f32]) -> Vec<f32> {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter().map(|x| x / norm).collect()
    } else {
        values.to_vec()
    }
}

/// Where a source identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Detected and embedded from a source photo.
    Photo,
    /// Linear blend of two sources.
    Blended,
    /// Intermediate state of a timed morph.
    Morphed,
    /// Row of the swap model's latent projection; already in projected space.
    Archetype,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Photo => "photo",
            SourceKind::Blended => "blended",
            SourceKind::Morphed => "morphed",
            SourceKind::Archetype => "archetype",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "photo" => Some(SourceKind::Photo),
            "blended" => Some(SourceKind::Blended),
            "morphed" => Some(SourceKind::Morphed),
            "archetype" => Some(SourceKind::Archetype),
            _ => None,
        }
    }
}

/// A selectable identity: the face it was taken from (if any), its embedding,
/// and display metadata.
#[derive(Debug, Clone)]
pub struct SourceFace {
    pub face: Option<DetectedFace>,
    pub embedding: IdentityEmbedding,
    /// BGR thumbnail for display.
    pub thumbnail: Option<Raster>,
    pub name: String,
    pub kind: SourceKind,
}

/// The identity that conditions synthesis for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveIdentity {
    pub embedding: IdentityEmbedding,
    pub kind: SourceKind,
}

impl ActiveIdentity {
    pub fn is_archetype(&self) -> bool {
        self.kind == SourceKind::Archetype
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x1: f32, y1: f32, x2: f32, y2: f32) -> BoundingBox {
        BoundingBox { x1, y1, x2, y2 }
    }

    #[test]
    fn test_normalized_has_unit_norm() {
        let e = IdentityEmbedding::new(vec![3.0, 4.0]);
        let n = e.normalized();
        assert!((n[0] - 0.6).abs() < 1e-6);
        assert!((n[1] - 0.8).abs() < 1e-6);
        assert_eq!(e.raw(), &[3.0, 4.0]);
    }

    #[test]
    fn test_set_raw_invalidates_normalized() {
        let mut e = IdentityEmbedding::new(vec![1.0, 0.0]);
        assert_eq!(e.normalized(), &[1.0, 0.0]);
        e.set_raw(vec![0.0, 2.0]);
        assert_eq!(e.normalized(), &[0.0, 1.0]);
    }

    #[test]
    fn test_zero_vector_normalizes_to_itself() {
        let e = IdentityEmbedding::new(vec![0.0, 0.0]);
        assert_eq!(e.normalized(), &[0.0, 0.0]);
    }

    #[test]
    fn test_iou_identical() {
        let a = bbox(0.0, 0.0, 100.0, 100.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(20.0, 20.0, 30.0, 30.0);
        assert!(a.iou(&b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(5.0, 0.0, 15.0, 10.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_source_kind_string_roundtrip() {
        for kind in [
            SourceKind::Photo,
            SourceKind::Blended,
            SourceKind::Morphed,
            SourceKind::Archetype,
        ] {
            assert_eq!(SourceKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SourceKind::parse("Emap Archetype"), None);
    }
}
