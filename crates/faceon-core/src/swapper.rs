//! Swap synthesizer: embedding-conditioned face generation via inswapper.
//!
//! [`Synthesizer`] owns the model-independent steps (alignment, latent
//! projection, tensor conversion) and drives any [`SwapModel`].
//! [`InswapperModel`] is the ONNX Runtime implementation.

use ndarray::{Array2, Array4, Axis};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

use crate::alignment::{self, AffineTransform};
use crate::cache;
use crate::inference::{BoxError, SwapModel};
use crate::onnx_graph::{self, OnnxGraphError};
use crate::raster::Raster;
use crate::types::{ActiveIdentity, DetectedFace};

pub const INSWAPPER_DEFAULT_INPUT_SIZE: u32 = 128;

#[derive(Error, Debug)]
pub enum SwapError {
    #[error("model file not found: {0}; download inswapper_128.onnx and place in models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("target landmarks are degenerate; refusing to synthesize")]
    DegenerateLandmarks,
    #[error("frame must be 3-channel BGR, got {0} channels")]
    UnsupportedFrame(u8),
    #[error("identity has {actual} dims, latent projection expects {expected}")]
    LatentDimension { expected: usize, actual: usize },
    #[error("latent projection: {0}")]
    LatentProjection(#[from] OnnxGraphError),
    #[error("swap model: {0}")]
    Model(#[source] BoxError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// inswapper_128 running on ONNX Runtime.
pub struct InswapperModel {
    session: Session,
    input_size: u32,
    emap: Array2<f32>,
}

impl InswapperModel {
    /// Load the swap model and its latent projection.
    ///
    /// The projection is read from `emap_cache` when possible; otherwise it
    /// is extracted from the model graph and the cache is refreshed
    /// best-effort.
    pub fn load(model_path: &str, emap_cache: Option<&Path>) -> Result<Self, SwapError> {
        if !Path::new(model_path).exists() {
            return Err(SwapError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        // NCHW: [1, 3, H, W]. Dynamic or unreadable shapes fall back to 128.
        let input_size = session
            .inputs()
            .first()
            .and_then(|input| match input.dtype() {
                ort::value::ValueType::Tensor { shape, .. } if shape.len() >= 4 && shape[2] > 0 => {
                    Some(shape[2] as u32)
                }
                _ => None,
            })
            .unwrap_or(INSWAPPER_DEFAULT_INPUT_SIZE);

        if session.inputs().len() < 2 {
            return Err(SwapError::InferenceFailed(format!(
                "swap model needs (target, source) inputs, got {}",
                session.inputs().len()
            )));
        }

        let emap = load_projection(Path::new(model_path), emap_cache)?;

        tracing::info!(
            path = model_path,
            input_size,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            emap = ?emap.shape(),
            "loaded inswapper model"
        );

        Ok(Self {
            session,
            input_size,
            emap,
        })
    }
}

fn load_projection(model_path: &Path, emap_cache: Option<&Path>) -> Result<Array2<f32>, SwapError> {
    if let Some(cache_path) = emap_cache {
        match cache::load_emap(cache_path) {
            Ok(emap) => {
                tracing::debug!(path = %cache_path.display(), "latent projection loaded from cache");
                return Ok(emap);
            }
            Err(e) if cache_path.exists() => {
                tracing::warn!(path = %cache_path.display(), error = %e, "latent projection cache unreadable; re-extracting");
            }
            Err(_) => {}
        }
    }

    let emap = onnx_graph::load_latent_projection(model_path)?;

    if let Some(cache_path) = emap_cache {
        if let Err(e) = cache::save_emap(cache_path, &emap) {
            tracing::warn!(path = %cache_path.display(), error = %e, "could not save latent projection cache");
        }
    }
    Ok(emap)
}

impl SwapModel for InswapperModel {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn latent_projection(&self) -> &Array2<f32> {
        &self.emap
    }

    fn forward(&mut self, crop: &Array4<f32>, latent: &Array2<f32>) -> Result<Array4<f32>, BoxError> {
        let outputs = self.session.run(ort::inputs![
            TensorRef::from_array_view(crop.view())?,
            TensorRef::from_array_view(latent.view())?
        ])?;

        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| SwapError::InferenceFailed(format!("swap output: {e}")))?;

        let dim = crop.raw_dim();
        Array4::from_shape_vec(dim, data.to_vec())
            .map_err(|e| SwapError::InferenceFailed(format!("swap output shape: {e}")).into())
    }
}

/// Model-independent half of face synthesis.
pub struct Synthesizer {
    model: Box<dyn SwapModel>,
}

impl Synthesizer {
    pub fn new(model: Box<dyn SwapModel>) -> Self {
        Self { model }
    }

    pub fn input_size(&self) -> u32 {
        self.model.input_size()
    }

    pub fn latent_projection(&self) -> &Array2<f32> {
        self.model.latent_projection()
    }

    /// Conditioning vector for the model, shaped `1 × D`.
    ///
    /// The identity is L2-normalized first. Non-archetype identities are then
    /// multiplied by the projection matrix and renormalized; archetypes are
    /// already in projected space.
    pub fn project_latent(&self, identity: &ActiveIdentity) -> Result<Array2<f32>, SwapError> {
        let normed = identity.embedding.normalized();
        let emap = self.model.latent_projection();

        let expected = if identity.is_archetype() {
            emap.ncols()
        } else {
            emap.nrows()
        };
        if normed.len() != expected {
            return Err(SwapError::LatentDimension {
                expected,
                actual: normed.len(),
            });
        }

        let latent = Array2::from_shape_vec((1, normed.len()), normed.to_vec())
            .map_err(|e| SwapError::InferenceFailed(format!("latent shape: {e}")))?;
        if identity.is_archetype() {
            return Ok(latent);
        }

        let mut projected = latent.dot(emap);
        let norm = projected.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            projected.mapv_inplace(|v| v / norm);
        }
        Ok(projected)
    }

    /// Generate the source identity on top of `target`.
    ///
    /// Returns the synthesized BGR crop and the forward matrix (frame → crop).
    pub fn synthesize(
        &mut self,
        frame: &Raster,
        target: &DetectedFace,
        identity: &ActiveIdentity,
        mouth_y_offset: f32,
    ) -> Result<(Raster, AffineTransform), SwapError> {
        if frame.channels() != 3 {
            return Err(SwapError::UnsupportedFrame(frame.channels()));
        }
        if alignment::landmarks_are_degenerate(&target.landmarks) {
            return Err(SwapError::DegenerateLandmarks);
        }

        let size = self.model.input_size();
        let (aligned, matrix) = alignment::norm_crop(frame, &target.landmarks, size, mouth_y_offset);
        let blob = to_blob(&aligned);
        let latent = self.project_latent(identity)?;

        let output = self.model.forward(&blob, &latent).map_err(SwapError::Model)?;
        let fake = from_blob(&output)?;
        Ok((fake, matrix))
    }
}

/// BGR crop → NCHW RGB in [0, 1].
fn to_blob(crop: &Raster) -> Array4<f32> {
    let (w, h) = (crop.width() as usize, crop.height() as usize);
    let mut blob = Array4::<f32>::zeros((1, 3, h, w));
    for (i, px) in crop.data().chunks_exact(3).enumerate() {
        let (y, x) = (i / w, i % w);
        blob[[0, 0, y, x]] = px[2] as f32 / 255.0;
        blob[[0, 1, y, x]] = px[1] as f32 / 255.0;
        blob[[0, 2, y, x]] = px[0] as f32 / 255.0;
    }
    blob
}

/// NCHW RGB in [0, 1] → BGR crop, clipped to 8 bits.
fn from_blob(output: &Array4<f32>) -> Result<Raster, SwapError> {
    let &[n, c, h, w] = output.shape() else {
        return Err(SwapError::InferenceFailed("swap output is not 4-D".into()));
    };
    if n < 1 || c != 3 {
        return Err(SwapError::InferenceFailed(format!(
            "swap output shape {:?}, expected [1, 3, H, W]",
            output.shape()
        )));
    }
    let image = output.index_axis(Axis(0), 0);
    let mut data = Vec::with_capacity(h * w * 3);
    for y in 0..h {
        for x in 0..w {
            for ch in [2, 1, 0] {
                data.push((image[[ch, y, x]] * 255.0).round().clamp(0.0, 255.0) as u8);
            }
        }
    }
    Raster::new(data, w as u32, h as u32, 3).map_err(|e| SwapError::InferenceFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{face_at, FailingSwapper, PassthroughSwapper};
    use crate::types::{IdentityEmbedding, SourceKind};

    fn identity(raw: Vec<f32>, kind: SourceKind) -> ActiveIdentity {
        ActiveIdentity {
            embedding: IdentityEmbedding::new(raw),
            kind,
        }
    }

    #[test]
    fn test_projection_is_renormalized() {
        let emap = Array2::from_shape_vec((2, 2), vec![2.0, 0.0, 0.0, 1.0]).unwrap();
        let synth = Synthesizer::new(Box::new(PassthroughSwapper::new(64, emap)));
        let latent = synth.project_latent(&identity(vec![1.0, 1.0], SourceKind::Photo)).unwrap();
        assert_eq!(latent.shape(), &[1, 2]);
        let expected = [2.0 / 5f32.sqrt(), 1.0 / 5f32.sqrt()];
        assert!((latent[[0, 0]] - expected[0]).abs() < 1e-5);
        assert!((latent[[0, 1]] - expected[1]).abs() < 1e-5);
    }

    #[test]
    fn test_archetype_skips_projection() {
        let emap = Array2::from_shape_vec((2, 2), vec![2.0, 0.0, 0.0, 1.0]).unwrap();
        let synth = Synthesizer::new(Box::new(PassthroughSwapper::new(64, emap)));
        let latent = synth.project_latent(&identity(vec![3.0, 4.0], SourceKind::Archetype)).unwrap();
        assert!((latent[[0, 0]] - 0.6).abs() < 1e-6);
        assert!((latent[[0, 1]] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_wrong_dimension_is_rejected() {
        let synth = Synthesizer::new(Box::new(PassthroughSwapper::new(64, Array2::eye(4))));
        let err = synth.project_latent(&identity(vec![1.0, 0.0], SourceKind::Photo)).unwrap_err();
        assert!(matches!(err, SwapError::LatentDimension { expected: 4, actual: 2 }));
    }

    #[test]
    fn test_blob_roundtrip_keeps_pixels() {
        let mut crop = Raster::zeroed(5, 4, 3);
        for (i, v) in crop.data_mut().iter_mut().enumerate() {
            *v = (i * 13 % 256) as u8;
        }
        let blob = to_blob(&crop);
        assert_eq!(blob.shape(), &[1, 3, 4, 5]);
        assert_eq!(from_blob(&blob).unwrap(), crop);
    }

    #[test]
    fn test_from_blob_clips() {
        let mut blob = Array4::<f32>::zeros((1, 3, 1, 2));
        blob[[0, 0, 0, 0]] = 1.7;
        blob[[0, 2, 0, 1]] = -0.3;
        let raster = from_blob(&blob).unwrap();
        assert_eq!(raster.pixel(0, 0), &[0, 0, 255]);
        assert_eq!(raster.pixel(1, 0), &[0, 0, 0]);
    }

    #[test]
    fn test_synthesize_passthrough_returns_aligned_crop() {
        let frame = Raster::filled(320, 240, 3, 90);
        let target = face_at(100.0, 60.0, 200.0, 180.0);
        let mut synth = Synthesizer::new(Box::new(PassthroughSwapper::new(128, Array2::eye(2))));
        let (fake, matrix) = synth
            .synthesize(&frame, &target, &identity(vec![1.0, 0.0], SourceKind::Photo), 0.0)
            .unwrap();
        assert_eq!((fake.width(), fake.height(), fake.channels()), (128, 128, 3));
        assert_eq!(fake.pixel(64, 64), &[90, 90, 90]);
        assert!(matrix.invert().is_some());
    }

    #[test]
    fn test_synthesize_rejects_degenerate_landmarks() {
        let frame = Raster::filled(64, 64, 3, 0);
        let mut target = face_at(10.0, 10.0, 50.0, 50.0);
        target.landmarks = [(20.0, 20.0); 5];
        let mut synth = Synthesizer::new(Box::new(PassthroughSwapper::new(128, Array2::eye(2))));
        let err = synth
            .synthesize(&frame, &target, &identity(vec![1.0, 0.0], SourceKind::Photo), 0.0)
            .unwrap_err();
        assert!(matches!(err, SwapError::DegenerateLandmarks));
    }

    #[test]
    fn test_model_failure_surfaces() {
        let frame = Raster::filled(320, 240, 3, 90);
        let mut synth = Synthesizer::new(Box::new(FailingSwapper::new(Array2::eye(2))));
        let err = synth
            .synthesize(
                &frame,
                &face_at(100.0, 60.0, 200.0, 180.0),
                &identity(vec![1.0, 0.0], SourceKind::Photo),
                0.0,
            )
            .unwrap_err();
        assert!(matches!(err, SwapError::Model(_)));
    }
}
