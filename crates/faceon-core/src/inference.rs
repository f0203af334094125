//! Model seams.
//!
//! The detector, recognizer and swap network are opaque callables. The
//! pipeline only talks to these traits, so the ONNX adapters can be replaced
//! by mocks in tests.

use ndarray::{Array2, Array4};
use std::error::Error;

use crate::raster::Raster;
use crate::types::{DetectedFace, Landmarks};

pub type BoxError = Box<dyn Error + Send + Sync>;

/// Finds faces in a BGR frame.
///
/// Implementations filter by their own score threshold and apply
/// non-maximum suppression before returning. Results are sorted by
/// descending score.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &Raster) -> Result<Vec<DetectedFace>, BoxError>;
}

/// Computes a raw identity vector for the face at `landmarks`.
///
/// Implementations align to their own canonical crop (112×112 for ArcFace)
/// before inference. The returned vector is not normalized.
pub trait FaceEmbedder: Send {
    fn embed(&mut self, image: &Raster, landmarks: &Landmarks, mouth_y_offset: f32) -> Result<Vec<f32>, BoxError>;
}

/// Embedding-conditioned face generator.
pub trait SwapModel: Send {
    /// Side length of the square aligned crop the model consumes.
    fn input_size(&self) -> u32;

    /// Read-only latent projection matrix (`rows × dim`). Rows are the
    /// addressable archetypes; the matrix also projects identity embeddings
    /// into the model's conditioning space.
    fn latent_projection(&self) -> &Array2<f32>;

    /// Run one forward pass.
    ///
    /// `crop` is NCHW RGB in [0, 1], `latent` is `1 × dim`. The output has the
    /// same layout and range as `crop`.
    fn forward(&mut self, crop: &Array4<f32>, latent: &Array2<f32>) -> Result<Array4<f32>, BoxError>;
}
