//! Test doubles for the model seams.

use ndarray::{Array2, Array4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::inference::{BoxError, FaceDetector, FaceEmbedder, SwapModel};
use crate::raster::Raster;
use crate::types::{BoundingBox, DetectedFace, IdentityEmbedding, Landmarks, SourceFace, SourceKind};

pub(crate) fn source_with_embedding(name: &str, raw: Vec<f32>) -> SourceFace {
    SourceFace {
        face: None,
        embedding: IdentityEmbedding::new(raw),
        thumbnail: None,
        name: name.to_string(),
        kind: SourceKind::Photo,
    }
}

/// A frontal face filling the given box, landmarks in typical proportions.
pub(crate) fn face_at(x1: f32, y1: f32, x2: f32, y2: f32) -> DetectedFace {
    let (w, h) = (x2 - x1, y2 - y1);
    let at = |fx: f32, fy: f32| (x1 + fx * w, y1 + fy * h);
    let landmarks: Landmarks = [
        at(0.3, 0.4),
        at(0.7, 0.4),
        at(0.5, 0.6),
        at(0.35, 0.8),
        at(0.65, 0.8),
    ];
    DetectedFace {
        bbox: BoundingBox { x1, y1, x2, y2 },
        landmarks,
        score: 0.9,
    }
}

/// Returns the same faces for every frame and counts calls.
pub(crate) struct FixedDetector {
    faces: Vec<DetectedFace>,
    pub calls: Arc<AtomicUsize>,
}

impl FixedDetector {
    pub fn new(faces: Vec<DetectedFace>) -> Self {
        Self {
            faces,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl FaceDetector for FixedDetector {
    fn detect(&mut self, _frame: &Raster) -> Result<Vec<DetectedFace>, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.faces.clone())
    }
}

/// Always returns the same vector.
pub(crate) struct ConstantEmbedder {
    vector: Vec<f32>,
    pub calls: Arc<AtomicUsize>,
}

impl ConstantEmbedder {
    pub fn new(vector: Vec<f32>) -> Self {
        Self {
            vector,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl FaceEmbedder for ConstantEmbedder {
    fn embed(&mut self, _image: &Raster, _landmarks: &Landmarks, _mouth_y_offset: f32) -> Result<Vec<f32>, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.vector.clone())
    }
}

/// Echoes the aligned crop back and records the latent it was given.
pub(crate) struct PassthroughSwapper {
    size: u32,
    projection: Array2<f32>,
    pub last_latent: Arc<Mutex<Option<Array2<f32>>>>,
}

impl PassthroughSwapper {
    pub fn new(size: u32, projection: Array2<f32>) -> Self {
        Self {
            size,
            projection,
            last_latent: Arc::new(Mutex::new(None)),
        }
    }
}

impl SwapModel for PassthroughSwapper {
    fn input_size(&self) -> u32 {
        self.size
    }

    fn latent_projection(&self) -> &Array2<f32> {
        &self.projection
    }

    fn forward(&mut self, crop: &Array4<f32>, latent: &Array2<f32>) -> Result<Array4<f32>, BoxError> {
        if let Ok(mut slot) = self.last_latent.lock() {
            *slot = Some(latent.clone());
        }
        Ok(crop.clone())
    }
}

/// Every forward pass fails.
pub(crate) struct FailingSwapper {
    projection: Array2<f32>,
}

impl FailingSwapper {
    pub fn new(projection: Array2<f32>) -> Self {
        Self { projection }
    }
}

impl SwapModel for FailingSwapper {
    fn input_size(&self) -> u32 {
        128
    }

    fn latent_projection(&self) -> &Array2<f32> {
        &self.projection
    }

    fn forward(&mut self, _crop: &Array4<f32>, _latent: &Array2<f32>) -> Result<Array4<f32>, BoxError> {
        Err("mock swap failure".into())
    }
}
