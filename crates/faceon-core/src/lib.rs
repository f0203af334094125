//! faceon-core: real-time face swap pipeline.
//!
//! SCRFD finds faces, ArcFace embeds source identities, inswapper
//! synthesizes the source identity onto each target, and the compositor
//! blends the result back with a feathered mask. All three models run on
//! ONNX Runtime behind the traits in [`inference`].

pub mod alignment;
pub mod cache;
pub mod compositor;
pub mod controls;
pub mod detector;
pub mod identity;
pub mod inference;
pub mod library;
pub mod mask;
pub mod onnx_graph;
pub mod pipeline;
pub mod raster;
pub mod recognizer;
pub mod swapper;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use controls::{RunMode, SharedControls, Slot, TunableSnapshot};
pub use pipeline::FaceSwapPipeline;
pub use raster::Raster;
pub use types::{ActiveIdentity, BoundingBox, DetectedFace, IdentityEmbedding, SourceFace, SourceKind};
