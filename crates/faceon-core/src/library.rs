//! Source face library: turning source photos into cached identities, and
//! saving blends as new sources.

use image::imageops::FilterType;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::cache::{self, CacheError, CACHE_EXTENSION};
use crate::compositor::compute_roi;
use crate::inference::{BoxError, FaceDetector, FaceEmbedder};
use crate::raster::Raster;
use crate::types::{ActiveIdentity, IdentityEmbedding, SourceFace, SourceKind};

pub const THUMBNAIL_SIZE: u32 = 128;
/// Grey level of the placeholder thumbnail given to saved blends.
pub const PLACEHOLDER_GREY: u8 = 60;

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("cannot read source image {path}: {source}")]
    Image {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("no face found in {0}")]
    NoFace(String),
    #[error("source path has no file name: {0}")]
    BadPath(String),
    #[error("detector: {0}")]
    Detector(#[source] BoxError),
    #[error("embedder: {0}")]
    Embedder(#[source] BoxError),
    #[error("cache: {0}")]
    Cache(#[from] CacheError),
}

/// Load a source face from its cache, or detect and embed it from the image.
///
/// The cache lives at `<embeddings_dir>/<image stem>.safetensors`. Any cache
/// read failure falls back to processing the image; a failed cache write is
/// logged and ignored.
pub fn load_or_process_source(
    image_path: &Path,
    embeddings_dir: &Path,
    detector: &mut dyn FaceDetector,
    embedder: &mut dyn FaceEmbedder,
    mouth_y_offset: f32,
) -> Result<SourceFace, LibraryError> {
    let cache_path = cache::cache_path_for(embeddings_dir, image_path)
        .ok_or_else(|| LibraryError::BadPath(image_path.display().to_string()))?;
    load_or_process(&cache_path, image_path, detector, embedder, mouth_y_offset)
}

fn load_or_process(
    cache_path: &Path,
    image_path: &Path,
    detector: &mut dyn FaceDetector,
    embedder: &mut dyn FaceEmbedder,
    mouth_y_offset: f32,
) -> Result<SourceFace, LibraryError> {
    if cache_path.exists() {
        match cache::load_source_face(cache_path) {
            Ok(face) => {
                tracing::debug!(path = %cache_path.display(), name = %face.name, "source loaded from cache");
                return Ok(face);
            }
            Err(e) => {
                tracing::warn!(path = %cache_path.display(), error = %e, "source cache unreadable; re-processing")
            }
        }
    }

    let source = process_image(image_path, detector, embedder, mouth_y_offset)?;

    if let Err(e) = cache::save_source_face(cache_path, &source) {
        tracing::warn!(path = %cache_path.display(), error = %e, "could not save source cache");
    }
    Ok(source)
}

/// Detect the highest-scoring face in `image_path` and embed it.
pub fn process_image(
    image_path: &Path,
    detector: &mut dyn FaceDetector,
    embedder: &mut dyn FaceEmbedder,
    mouth_y_offset: f32,
) -> Result<SourceFace, LibraryError> {
    let shown = image_path.display().to_string();
    let rgb = image::open(image_path)
        .map_err(|source| LibraryError::Image {
            path: shown.clone(),
            source,
        })?
        .to_rgb8();
    let frame = Raster::from_rgb_image(rgb);

    let faces = detector.detect(&frame).map_err(LibraryError::Detector)?;
    let face = faces
        .into_iter()
        .next()
        .ok_or_else(|| LibraryError::NoFace(shown.clone()))?;

    let raw = embedder
        .embed(&frame, &face.landmarks, mouth_y_offset)
        .map_err(LibraryError::Embedder)?;

    let thumbnail = compute_roi(&face.bbox, 0, frame.width(), frame.height())
        .and_then(|rect| {
            frame
                .crop(rect)
                .resized(THUMBNAIL_SIZE, THUMBNAIL_SIZE, FilterType::Triangle)
                .ok()
        });

    let name = image_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| LibraryError::BadPath(shown.clone()))?;

    tracing::info!(path = %shown, score = face.score, "processed source face");

    Ok(SourceFace {
        face: Some(face),
        embedding: IdentityEmbedding::new(raw),
        thumbnail,
        name,
        kind: SourceKind::Photo,
    })
}

/// Build the initial roster from a photo directory and the cache directory.
///
/// Every stem found in either directory becomes one source, in sorted order,
/// so saved blends (cache only) come back on restart. Entries that fail to
/// load are logged and skipped.
pub fn bootstrap_sources(
    sources_dir: &Path,
    embeddings_dir: &Path,
    detector: &mut dyn FaceDetector,
    embedder: &mut dyn FaceEmbedder,
    mouth_y_offset: f32,
) -> Vec<SourceFace> {
    let photos = photo_paths(sources_dir);
    let mut stems: BTreeSet<String> = photos.keys().cloned().collect();
    stems.extend(dir_files(embeddings_dir).into_iter().filter_map(|path| {
        if path.extension().is_some_and(|e| e == CACHE_EXTENSION) {
            file_stem(&path)
        } else {
            None
        }
    }));

    let mut sources = Vec::with_capacity(stems.len());
    for stem in stems {
        let cache_path = embeddings_dir.join(format!("{stem}.{CACHE_EXTENSION}"));
        let image_path = photos
            .get(&stem)
            .cloned()
            .unwrap_or_else(|| sources_dir.join(&stem));

        match load_or_process(&cache_path, &image_path, detector, embedder, mouth_y_offset) {
            Ok(source) => sources.push(source),
            Err(e) => tracing::warn!(stem = %stem, error = %e, "skipping source"),
        }
    }

    tracing::info!(count = sources.len(), "source roster ready");
    sources
}

/// Photos in `dir` keyed by stem. Extensions match case-insensitively.
fn photo_paths(dir: &Path) -> BTreeMap<String, PathBuf> {
    dir_files(dir)
        .into_iter()
        .filter(|path| is_image_path(path))
        .filter_map(|path| file_stem(&path).map(|stem| (stem, path)))
        .collect()
}

fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.iter().any(|ext| e.eq_ignore_ascii_case(ext)))
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

fn dir_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "cannot list directory");
            return Vec::new();
        }
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect()
}

/// Persist the current blend as a new source and return it.
///
/// The stored embedding is the blend as produced, before any normalization.
/// Unlike cache refreshes, a failed write is reported to the caller.
pub fn save_blend(
    embeddings_dir: &Path,
    source_a: &SourceFace,
    source_b: &SourceFace,
    active: &ActiveIdentity,
) -> Result<SourceFace, LibraryError> {
    let path_for = |name: &str| -> PathBuf { embeddings_dir.join(format!("{name}.{CACHE_EXTENSION}")) };
    let name = cache::blend_name(&source_a.name, &source_b.name, |candidate| path_for(candidate).exists());

    let blend = SourceFace {
        face: None,
        embedding: IdentityEmbedding::new(active.embedding.raw().to_vec()),
        thumbnail: Some(Raster::filled(THUMBNAIL_SIZE, THUMBNAIL_SIZE, 3, PLACEHOLDER_GREY)),
        name,
        kind: SourceKind::Blended,
    };

    let path = path_for(&blend.name);
    cache::save_source_face(&path, &blend)?;
    tracing::info!(path = %path.display(), name = %blend.name, "saved blend");
    Ok(blend)
}
