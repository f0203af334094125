//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional identity vectors from aligned face crops,
//! using the w600k_r50 ArcFace model.

use crate::alignment;
use crate::inference::{BoxError, FaceEmbedder};
use crate::raster::Raster;
use crate::types::Landmarks;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (different from SCRFD!) ---
pub const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // not 128.0: ArcFace normalizes symmetrically
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}; download w600k_r50.onnx from insightface and place in models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("landmarks are degenerate; cannot align face")]
    DegenerateLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face recognizer.
pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Extract the raw (unnormalized) embedding of the face at `landmarks`.
    ///
    /// The face is aligned to the canonical 112x112 crop first.
    pub fn extract(
        &mut self,
        image: &Raster,
        landmarks: &Landmarks,
        mouth_y_offset: f32,
    ) -> Result<Vec<f32>, RecognizerError> {
        if alignment::landmarks_are_degenerate(landmarks) {
            return Err(RecognizerError::DegenerateLandmarks);
        }

        let (aligned, _) = alignment::norm_crop(image, landmarks, ARCFACE_INPUT_SIZE as u32, mouth_y_offset);
        let input = Self::preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw_data.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw_data.len()
            )));
        }

        Ok(raw_data.to_vec())
    }

    /// Preprocess a 112x112 BGR aligned crop into a NCHW RGB float tensor.
    fn preprocess(aligned_face: &Raster) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        let pixels = aligned_face.data();

        for y in 0..size {
            for x in 0..size {
                let idx = (y * size + x) * 3;
                let Some(bgr) = pixels.get(idx..idx + 3) else {
                    continue;
                };
                tensor[[0, 0, y, x]] = (bgr[2] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
                tensor[[0, 1, y, x]] = (bgr[1] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
                tensor[[0, 2, y, x]] = (bgr[0] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }

        tensor
    }
}

impl FaceEmbedder for ArcFaceEmbedder {
    fn embed(&mut self, image: &Raster, landmarks: &Landmarks, mouth_y_offset: f32) -> Result<Vec<f32>, BoxError> {
        Ok(self.extract(image, landmarks, mouth_y_offset)?)
    }
}
