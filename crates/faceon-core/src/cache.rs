//! On-disk tensor container for source faces and the latent projection.
//!
//! Layout (safetensors-compatible):
//!
//! ```text
//! [u64 LE header length][JSON header, space padded to 8 bytes][tensor blob]
//! ```
//!
//! The header maps each tensor name to `{dtype, shape, data_offsets}` where
//! the offsets are `[start, end)` into the blob. The reserved
//! `__metadata__` key holds a flat string map.

use chrono::Utc;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::raster::Raster;
use crate::types::{BoundingBox, DetectedFace, IdentityEmbedding, Landmarks, SourceFace, SourceKind};

pub const METADATA_KEY: &str = "__metadata__";
pub const CACHE_EXTENSION: &str = "safetensors";

/// Refuse headers larger than this; a corrupt length prefix would otherwise
/// trigger a huge allocation.
const MAX_HEADER_LEN: u64 = 16 * 1024 * 1024;

const TENSOR_BBOX: &str = "bbox";
const TENSOR_KPS: &str = "kps";
const TENSOR_EMBEDDING: &str = "embedding";
const TENSOR_THUMBNAIL: &str = "thumbnail";
const TENSOR_EMAP: &str = "emap";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("header json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed container: {0}")]
    Format(String),
    #[error("missing tensor {0:?}")]
    MissingTensor(String),
    #[error("tensor {name:?} is {found:?}, expected {expected:?}")]
    DType { name: String, expected: DType, found: DType },
    #[error("tensor {name:?} has shape {shape:?}: {reason}")]
    Shape {
        name: String,
        shape: Vec<usize>,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    F32,
    U8,
}

impl DType {
    fn element_size(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::U8 => 1,
        }
    }
}

/// Element count of `shape`, or `None` if it overflows `usize`.
fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    U8(Vec<u8>),
}

impl TensorData {
    fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::U8(_) => DType::U8,
        }
    }

    fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::U8(v) => v.len(),
        }
    }

    fn append_le_bytes(&self, out: &mut Vec<u8>) {
        match self {
            TensorData::F32(v) => out.extend(v.iter().flat_map(|x| x.to_le_bytes())),
            TensorData::U8(v) => out.extend_from_slice(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: TensorData,
}

#[derive(Debug, Serialize, Deserialize)]
struct TensorHeader {
    dtype: DType,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

/// A set of named tensors plus string metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorFile {
    pub metadata: BTreeMap<String, String>,
    pub tensors: BTreeMap<String, Tensor>,
}

impl TensorFile {
    pub fn insert_f32(&mut self, name: &str, shape: Vec<usize>, values: Vec<f32>) {
        self.tensors.insert(
            name.to_string(),
            Tensor {
                shape,
                data: TensorData::F32(values),
            },
        );
    }

    pub fn insert_u8(&mut self, name: &str, shape: Vec<usize>, values: Vec<u8>) {
        self.tensors.insert(
            name.to_string(),
            Tensor {
                shape,
                data: TensorData::U8(values),
            },
        );
    }

    fn get(&self, name: &str) -> Result<&Tensor, CacheError> {
        self.tensors
            .get(name)
            .ok_or_else(|| CacheError::MissingTensor(name.to_string()))
    }

    pub fn f32(&self, name: &str) -> Result<(&[usize], &[f32]), CacheError> {
        let tensor = self.get(name)?;
        match &tensor.data {
            TensorData::F32(v) => Ok((&tensor.shape, v)),
            other => Err(CacheError::DType {
                name: name.to_string(),
                expected: DType::F32,
                found: other.dtype(),
            }),
        }
    }

    pub fn u8(&self, name: &str) -> Result<(&[usize], &[u8]), CacheError> {
        let tensor = self.get(name)?;
        match &tensor.data {
            TensorData::U8(v) => Ok((&tensor.shape, v)),
            other => Err(CacheError::DType {
                name: name.to_string(),
                expected: DType::U8,
                found: other.dtype(),
            }),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CacheError> {
        let mut header = serde_json::Map::new();
        if !self.metadata.is_empty() {
            header.insert(METADATA_KEY.to_string(), serde_json::to_value(&self.metadata)?);
        }

        let mut blob = Vec::new();
        for (name, tensor) in &self.tensors {
            if element_count(&tensor.shape) != Some(tensor.data.len()) {
                return Err(CacheError::Shape {
                    name: name.clone(),
                    shape: tensor.shape.clone(),
                    reason: format!("holds {} elements", tensor.data.len()),
                });
            }
            let start = blob.len();
            tensor.data.append_le_bytes(&mut blob);
            let entry = TensorHeader {
                dtype: tensor.data.dtype(),
                shape: tensor.shape.clone(),
                data_offsets: [start, blob.len()],
            };
            header.insert(name.clone(), serde_json::to_value(entry)?);
        }

        let mut header_bytes = serde_json::to_vec(&header)?;
        while header_bytes.len() % 8 != 0 {
            header_bytes.push(b' ');
        }

        let mut out = Vec::with_capacity(8 + header_bytes.len() + blob.len());
        out.extend_from_slice(&(header_bytes.len() as u64).to_le_bytes());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&blob);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CacheError> {
        let prefix: [u8; 8] = bytes
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| CacheError::Format("shorter than the length prefix".into()))?;
        let header_len = u64::from_le_bytes(prefix);
        if header_len > MAX_HEADER_LEN || header_len > (bytes.len() - 8) as u64 {
            return Err(CacheError::Format(format!("header length {header_len} out of range")));
        }
        let header_end = 8 + header_len as usize;
        let header: BTreeMap<String, serde_json::Value> = serde_json::from_slice(&bytes[8..header_end])?;
        let blob = &bytes[header_end..];

        let mut file = TensorFile::default();
        for (name, value) in header {
            if name == METADATA_KEY {
                file.metadata = serde_json::from_value(value)?;
                continue;
            }
            let entry: TensorHeader = serde_json::from_value(value)?;
            let [start, end] = entry.data_offsets;
            let Some(byte_len) = element_count(&entry.shape).and_then(|n| n.checked_mul(entry.dtype.element_size()))
            else {
                return Err(CacheError::Shape {
                    name,
                    shape: entry.shape,
                    reason: "element count overflows".into(),
                });
            };
            if start > end || end > blob.len() || end - start != byte_len {
                return Err(CacheError::Shape {
                    name,
                    shape: entry.shape,
                    reason: format!("offsets [{start}, {end}) do not fit a {}-byte blob", blob.len()),
                });
            }
            let raw = &blob[start..end];
            let data = match entry.dtype {
                DType::F32 => TensorData::F32(
                    raw.chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect(),
                ),
                DType::U8 => TensorData::U8(raw.to_vec()),
            };
            file.tensors.insert(
                name,
                Tensor {
                    shape: entry.shape,
                    data,
                },
            );
        }
        Ok(file)
    }

    /// Write via a sibling temp file and rename, so readers never see a
    /// half-written container.
    pub fn write(&self, path: &Path) -> Result<(), CacheError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, self.to_bytes()?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, CacheError> {
        Self::from_bytes(&fs::read(path)?)
    }
}

/// Persist a source face: bbox, landmarks, raw embedding, thumbnail and metadata.
///
/// Faces without a detection (blends) are stored with zero bbox/landmarks
/// and a score of 1.0.
pub fn save_source_face(path: &Path, source: &SourceFace) -> Result<(), CacheError> {
    let face = source.face.clone().unwrap_or(DetectedFace {
        bbox: BoundingBox::default(),
        landmarks: [(0.0, 0.0); 5],
        score: 1.0,
    });

    let mut file = TensorFile::default();
    file.insert_f32(
        TENSOR_BBOX,
        vec![4],
        vec![face.bbox.x1, face.bbox.y1, face.bbox.x2, face.bbox.y2],
    );
    file.insert_f32(
        TENSOR_KPS,
        vec![5, 2],
        face.landmarks.iter().flat_map(|&(x, y)| [x, y]).collect(),
    );
    file.insert_f32(
        TENSOR_EMBEDDING,
        vec![source.embedding.len()],
        source.embedding.raw().to_vec(),
    );
    if let Some(thumb) = &source.thumbnail {
        file.insert_u8(
            TENSOR_THUMBNAIL,
            vec![thumb.height() as usize, thumb.width() as usize, thumb.channels() as usize],
            thumb.data().to_vec(),
        );
    }

    file.metadata.insert("name".into(), source.name.clone());
    file.metadata.insert("det_score".into(), face.score.to_string());
    file.metadata.insert("kind".into(), source.kind.as_str().into());
    file.metadata.insert("created_at".into(), Utc::now().to_rfc3339());

    file.write(path)
}

/// Load a source face written by [`save_source_face`].
pub fn load_source_face(path: &Path) -> Result<SourceFace, CacheError> {
    let file = TensorFile::read(path)?;

    let (_, bbox) = file.f32(TENSOR_BBOX)?;
    let (_, kps) = file.f32(TENSOR_KPS)?;
    let (_, embedding) = file.f32(TENSOR_EMBEDDING)?;
    if bbox.len() != 4 || kps.len() != 10 || embedding.is_empty() {
        return Err(CacheError::Format(format!(
            "unexpected sizes: bbox {}, kps {}, embedding {}",
            bbox.len(),
            kps.len(),
            embedding.len()
        )));
    }

    let mut landmarks: Landmarks = [(0.0, 0.0); 5];
    for (slot, pair) in landmarks.iter_mut().zip(kps.chunks_exact(2)) {
        *slot = (pair[0], pair[1]);
    }

    let score = match file.metadata.get("det_score") {
        Some(s) => s
            .parse::<f32>()
            .map_err(|e| CacheError::Format(format!("det_score {s:?}: {e}")))?,
        None => 1.0,
    };
    let kind = file
        .metadata
        .get("kind")
        .and_then(|k| SourceKind::parse(k))
        .unwrap_or(SourceKind::Photo);
    let name = match file.metadata.get("name") {
        Some(name) => name.clone(),
        None => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };

    let thumbnail = match file.u8(TENSOR_THUMBNAIL) {
        Ok((&[h, w, c], data)) => Some(
            Raster::new(data.to_vec(), w as u32, h as u32, c as u8)
                .map_err(|e| CacheError::Format(format!("thumbnail: {e}")))?,
        ),
        Ok((shape, _)) => {
            return Err(CacheError::Shape {
                name: TENSOR_THUMBNAIL.into(),
                shape: shape.to_vec(),
                reason: "expected [height, width, channels]".into(),
            })
        }
        Err(CacheError::MissingTensor(_)) => None,
        Err(e) => return Err(e),
    };

    let face = (kind == SourceKind::Photo).then(|| DetectedFace {
        bbox: BoundingBox {
            x1: bbox[0],
            y1: bbox[1],
            x2: bbox[2],
            y2: bbox[3],
        },
        landmarks,
        score,
    });

    Ok(SourceFace {
        face,
        embedding: IdentityEmbedding::new(embedding.to_vec()),
        thumbnail,
        name,
        kind,
    })
}

pub fn save_emap(path: &Path, emap: &Array2<f32>) -> Result<(), CacheError> {
    let mut file = TensorFile::default();
    file.insert_f32(TENSOR_EMAP, emap.shape().to_vec(), emap.iter().copied().collect());
    file.metadata.insert("created_at".into(), Utc::now().to_rfc3339());
    file.write(path)
}

pub fn load_emap(path: &Path) -> Result<Array2<f32>, CacheError> {
    let file = TensorFile::read(path)?;
    let (shape, values) = file.f32(TENSOR_EMAP)?;
    let &[rows, cols] = shape else {
        return Err(CacheError::Shape {
            name: TENSOR_EMAP.into(),
            shape: shape.to_vec(),
            reason: "expected a 2-D matrix".into(),
        });
    };
    Array2::from_shape_vec((rows, cols), values.to_vec()).map_err(|e| CacheError::Shape {
        name: TENSOR_EMAP.into(),
        shape: shape.to_vec(),
        reason: e.to_string(),
    })
}

/// Cache path for a source image: `<dir>/<file stem>.safetensors`.
pub fn cache_path_for(embeddings_dir: &Path, source_path: &Path) -> Option<std::path::PathBuf> {
    let stem = source_path.file_stem()?.to_string_lossy();
    Some(embeddings_dir.join(format!("{stem}.{CACHE_EXTENSION}")))
}

/// Name for a saved blend: first word of A's stem, last word of B's stem.
///
/// `taken` reports whether a candidate is already used; `_1`, `_2`, … are
/// appended until it is not.
pub fn blend_name(name_a: &str, name_b: &str, taken: impl Fn(&str) -> bool) -> String {
    let stem = |name: &str| -> String {
        Path::new(name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string())
    };
    let stem_a = stem(name_a);
    let stem_b = stem(name_b);
    let first = stem_a.split(' ').next().unwrap_or_default();
    let last = stem_b.split(' ').next_back().unwrap_or_default();
    let base = format!("{first} {last}");

    if !taken(&base) {
        return base;
    }
    (1u32..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::source_with_embedding;

    #[test]
    fn test_container_layout() {
        let mut file = TensorFile::default();
        file.insert_f32("a", vec![2], vec![1.0, -1.0]);
        file.insert_u8("b", vec![3], vec![7, 8, 9]);
        file.metadata.insert("name".into(), "x".into());
        let bytes = file.to_bytes().unwrap();

        let header_len = u64::from_le_bytes(bytes[..8].try_into().unwrap()) as usize;
        assert_eq!(header_len % 8, 0);
        assert_eq!(bytes.len(), 8 + header_len + 8 + 3);
        let header: serde_json::Value = serde_json::from_slice(&bytes[8..8 + header_len]).unwrap();
        assert_eq!(header["a"]["dtype"], "F32");
        assert_eq!(header["a"]["data_offsets"], serde_json::json!([0, 8]));
        assert_eq!(header["b"]["data_offsets"], serde_json::json!([8, 11]));
        assert_eq!(header[METADATA_KEY]["name"], "x");

        assert_eq!(TensorFile::from_bytes(&bytes).unwrap(), file);
    }

    #[test]
    fn test_rejects_truncated_and_garbage() {
        assert!(matches!(TensorFile::from_bytes(&[1, 2, 3]), Err(CacheError::Format(_))));

        let mut bytes = (1_000_000u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        assert!(matches!(TensorFile::from_bytes(&bytes), Err(CacheError::Format(_))));

        let mut file = TensorFile::default();
        file.insert_f32("a", vec![4], vec![1.0; 4]);
        let bytes = file.to_bytes().unwrap();
        assert!(matches!(
            TensorFile::from_bytes(&bytes[..bytes.len() - 4]),
            Err(CacheError::Shape { .. })
        ));
    }

    #[test]
    fn test_rejects_overflowing_shape() {
        let header = br#"{"embedding":{"dtype":"F32","shape":[4294967296,4294967296,16],"data_offsets":[0,0]}}"#;
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(header);
        assert!(matches!(TensorFile::from_bytes(&bytes), Err(CacheError::Shape { .. })));
    }

    #[test]
    fn test_shape_mismatch_on_write() {
        let mut file = TensorFile::default();
        file.insert_f32("a", vec![3], vec![1.0; 2]);
        assert!(matches!(file.to_bytes(), Err(CacheError::Shape { .. })));
    }

    #[test]
    fn test_source_face_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("alice.safetensors");

        let mut src = source_with_embedding("alice.jpg", vec![0.5, -1.5, 2.0]);
        src.face = Some(DetectedFace {
            bbox: BoundingBox {
                x1: 10.0,
                y1: 20.0,
                x2: 110.0,
                y2: 140.0,
            },
            landmarks: [(1.0, 2.0), (3.0, 4.0), (5.0, 6.0), (7.0, 8.0), (9.0, 10.0)],
            score: 0.875,
        });
        src.thumbnail = Some(Raster::filled(4, 2, 3, 33));

        save_source_face(&path, &src).unwrap();
        let loaded = load_source_face(&path).unwrap();

        assert_eq!(loaded.name, "alice.jpg");
        assert_eq!(loaded.kind, SourceKind::Photo);
        assert_eq!(loaded.embedding.raw(), src.embedding.raw());
        assert_eq!(loaded.face, src.face);
        assert_eq!(loaded.thumbnail, src.thumbnail);
    }

    #[test]
    fn test_blend_without_face_loads_without_face() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mix.safetensors");
        let mut src = source_with_embedding("mix", vec![1.0, 2.0]);
        src.kind = SourceKind::Blended;
        save_source_face(&path, &src).unwrap();

        let file = TensorFile::read(&path).unwrap();
        assert_eq!(file.f32("bbox").unwrap().1, &[0.0; 4]);
        assert_eq!(file.metadata["det_score"], "1");

        let loaded = load_source_face(&path).unwrap();
        assert_eq!(loaded.kind, SourceKind::Blended);
        assert!(loaded.face.is_none());
        assert!(loaded.thumbnail.is_none());
    }

    #[test]
    fn test_missing_embedding_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.safetensors");
        let mut file = TensorFile::default();
        file.insert_f32("bbox", vec![4], vec![0.0; 4]);
        file.write(&path).unwrap();
        assert!(matches!(load_source_face(&path), Err(CacheError::MissingTensor(_))));
    }

    #[test]
    fn test_emap_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emap").join("emap_cache.safetensors");
        let emap = Array2::from_shape_fn((3, 4), |(r, c)| r as f32 - c as f32 * 0.5);
        save_emap(&path, &emap).unwrap();
        assert_eq!(load_emap(&path).unwrap(), emap);
    }

    #[test]
    fn test_cache_path_uses_stem() {
        let p = cache_path_for(Path::new("/tmp/emb"), Path::new("/photos/Jane Doe.jpg")).unwrap();
        assert_eq!(p, Path::new("/tmp/emb/Jane Doe.safetensors"));
    }

    #[test]
    fn test_blend_name_and_collisions() {
        assert_eq!(blend_name("Jane Q Doe.jpg", "John Smith.png", |_| false), "Jane Smith");

        let taken = ["Jane Smith", "Jane Smith_1"];
        assert_eq!(
            blend_name("Jane Doe.jpg", "John Smith.png", |c| taken.contains(&c)),
            "Jane Smith_2"
        );
    }
}
