//! Minimal ONNX protobuf walker.
//!
//! The inswapper model stores its latent projection matrix as the last graph
//! initializer. ONNX Runtime does not expose initializers, so this reads just
//! enough of the protobuf wire format to pull that tensor out:
//! `ModelProto.graph (7) → GraphProto.initializer (5) → TensorProto`.

use ndarray::Array2;
use std::path::Path;
use thiserror::Error;

const MODEL_GRAPH_FIELD: u64 = 7;
const GRAPH_INITIALIZER_FIELD: u64 = 5;
const TENSOR_DIMS_FIELD: u64 = 1;
const TENSOR_DATA_TYPE_FIELD: u64 = 2;
const TENSOR_FLOAT_DATA_FIELD: u64 = 4;
const TENSOR_NAME_FIELD: u64 = 8;
const TENSOR_RAW_DATA_FIELD: u64 = 9;

/// `TensorProto.DataType.FLOAT`
const DATA_TYPE_FLOAT: u64 = 1;

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

#[derive(Error, Debug)]
pub enum OnnxGraphError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("protobuf truncated at byte {0}")]
    Truncated(usize),
    #[error("unsupported protobuf wire type {0}")]
    UnsupportedWireType(u8),
    #[error("model has no graph")]
    MissingGraph,
    #[error("graph has no initializers")]
    NoInitializer,
    #[error("initializer {name:?} has data type {data_type}, expected FLOAT")]
    UnsupportedDataType { name: String, data_type: u64 },
    #[error("initializer {name:?}: {reason}")]
    Shape { name: String, reason: String },
}

/// A float initializer pulled out of an ONNX graph.
#[derive(Debug, Clone, PartialEq)]
pub struct InitializerTensor {
    pub name: String,
    pub dims: Vec<usize>,
    pub values: Vec<f32>,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn varint(&mut self) -> Result<u64, OnnxGraphError> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = *self.buf.get(self.pos).ok_or(OnnxGraphError::Truncated(self.pos))?;
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(OnnxGraphError::Truncated(self.pos))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], OnnxGraphError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len());
        let end = end.ok_or(OnnxGraphError::Truncated(self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn key(&mut self) -> Result<(u64, u8), OnnxGraphError> {
        let key = self.varint()?;
        Ok((key >> 3, (key & 0x7) as u8))
    }

    fn len_delimited(&mut self) -> Result<&'a [u8], OnnxGraphError> {
        let len = self.varint()? as usize;
        self.take(len)
    }

    fn skip(&mut self, wire_type: u8) -> Result<(), OnnxGraphError> {
        match wire_type {
            WIRE_VARINT => self.varint().map(|_| ()),
            WIRE_FIXED64 => self.take(8).map(|_| ()),
            WIRE_LEN => self.len_delimited().map(|_| ()),
            WIRE_FIXED32 => self.take(4).map(|_| ()),
            other => Err(OnnxGraphError::UnsupportedWireType(other)),
        }
    }

    /// Payload of the last occurrence of a length-delimited `field`.
    fn last_field(mut self, field: u64) -> Result<Option<&'a [u8]>, OnnxGraphError> {
        let mut found = None;
        while !self.is_done() {
            let (f, wire) = self.key()?;
            if f == field && wire == WIRE_LEN {
                found = Some(self.len_delimited()?);
            } else {
                self.skip(wire)?;
            }
        }
        Ok(found)
    }
}

/// Return the last initializer of the model graph as a float tensor.
pub fn last_float_initializer(model: &[u8]) -> Result<InitializerTensor, OnnxGraphError> {
    let graph = Reader::new(model)
        .last_field(MODEL_GRAPH_FIELD)?
        .ok_or(OnnxGraphError::MissingGraph)?;
    let tensor = Reader::new(graph)
        .last_field(GRAPH_INITIALIZER_FIELD)?
        .ok_or(OnnxGraphError::NoInitializer)?;
    parse_float_tensor(tensor)
}

fn parse_float_tensor(buf: &[u8]) -> Result<InitializerTensor, OnnxGraphError> {
    let mut r = Reader::new(buf);
    let mut name = String::new();
    let mut dims = Vec::new();
    let mut data_type = 0u64;
    let mut values: Vec<f32> = Vec::new();
    let mut raw: Option<&[u8]> = None;

    while !r.is_done() {
        let (field, wire) = r.key()?;
        match (field, wire) {
            (TENSOR_DIMS_FIELD, WIRE_VARINT) => dims.push(r.varint()? as usize),
            (TENSOR_DIMS_FIELD, WIRE_LEN) => {
                let mut packed = Reader::new(r.len_delimited()?);
                while !packed.is_done() {
                    dims.push(packed.varint()? as usize);
                }
            }
            (TENSOR_DATA_TYPE_FIELD, WIRE_VARINT) => data_type = r.varint()?,
            (TENSOR_FLOAT_DATA_FIELD, WIRE_LEN) => {
                values.extend(le_floats(r.len_delimited()?));
            }
            (TENSOR_FLOAT_DATA_FIELD, WIRE_FIXED32) => values.extend(le_floats(r.take(4)?)),
            (TENSOR_NAME_FIELD, WIRE_LEN) => {
                name = String::from_utf8_lossy(r.len_delimited()?).into_owned();
            }
            (TENSOR_RAW_DATA_FIELD, WIRE_LEN) => raw = Some(r.len_delimited()?),
            (_, wire) => r.skip(wire)?,
        }
    }

    if data_type != DATA_TYPE_FLOAT {
        return Err(OnnxGraphError::UnsupportedDataType { name, data_type });
    }
    if let Some(bytes) = raw {
        if bytes.len() % 4 != 0 {
            return Err(OnnxGraphError::Shape {
                name,
                reason: format!("raw_data length {} is not a multiple of 4", bytes.len()),
            });
        }
        values = le_floats(bytes).collect();
    }

    let expected: usize = dims.iter().product();
    if expected != values.len() {
        return Err(OnnxGraphError::Shape {
            name,
            reason: format!("dims {dims:?} need {expected} values, found {}", values.len()),
        });
    }

    Ok(InitializerTensor { name, dims, values })
}

fn le_floats(bytes: &[u8]) -> impl Iterator<Item = f32> + '_ {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
}

/// Load the latent projection matrix ("emap") of a swap model file.
pub fn load_latent_projection(model_path: &Path) -> Result<Array2<f32>, OnnxGraphError> {
    let bytes = std::fs::read(model_path)?;
    let tensor = last_float_initializer(&bytes)?;
    let InitializerTensor { name, dims, values } = tensor;
    let &[rows, cols] = dims.as_slice() else {
        return Err(OnnxGraphError::Shape {
            name,
            reason: format!("expected a 2-D matrix, got dims {dims:?}"),
        });
    };
    tracing::info!(path = %model_path.display(), tensor = %name, rows, cols, "extracted latent projection from model graph");
    Array2::from_shape_vec((rows, cols), values).map_err(|e| OnnxGraphError::Shape {
        name,
        reason: e.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn varint(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                return;
            }
            out.push(byte | 0x80);
        }
    }

    fn len_field(field: u64, payload: &[u8], out: &mut Vec<u8>) {
        varint(field << 3 | WIRE_LEN as u64, out);
        varint(payload.len() as u64, out);
        out.extend_from_slice(payload);
    }

    /// Serialize a FLOAT TensorProto with packed dims and raw_data.
    fn tensor_proto(name: &str, dims: &[u64], values: &[f32]) -> Vec<u8> {
        let mut packed_dims = Vec::new();
        for &d in dims {
            varint(d, &mut packed_dims);
        }
        let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();

        let mut t = Vec::new();
        len_field(TENSOR_DIMS_FIELD, &packed_dims, &mut t);
        varint(TENSOR_DATA_TYPE_FIELD << 3 | WIRE_VARINT as u64, &mut t);
        varint(DATA_TYPE_FLOAT, &mut t);
        len_field(TENSOR_NAME_FIELD, name.as_bytes(), &mut t);
        len_field(TENSOR_RAW_DATA_FIELD, &raw, &mut t);
        t
    }

    /// A ModelProto with an ir_version, one node-less graph and the given initializers.
    pub(crate) fn model_proto(initializers: &[Vec<u8>]) -> Vec<u8> {
        let mut graph = Vec::new();
        len_field(2, b"graph-name", &mut graph);
        for init in initializers {
            len_field(GRAPH_INITIALIZER_FIELD, init, &mut graph);
        }
        let mut model = Vec::new();
        varint(1 << 3 | WIRE_VARINT as u64, &mut model);
        varint(8, &mut model);
        len_field(MODEL_GRAPH_FIELD, &graph, &mut model);
        model
    }

    pub(crate) fn model_with_matrix(rows: usize, cols: usize, values: &[f32]) -> Vec<u8> {
        model_proto(&[
            tensor_proto("bias", &[2], &[0.5, 0.25]),
            tensor_proto("emap", &[rows as u64, cols as u64], values),
        ])
    }

    #[test]
    fn test_last_initializer_is_returned() {
        let model = model_with_matrix(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let t = last_float_initializer(&model).unwrap();
        assert_eq!(t.name, "emap");
        assert_eq!(t.dims, vec![2, 3]);
        assert_eq!(t.values, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_unpacked_float_data() {
        let mut t = Vec::new();
        varint(TENSOR_DIMS_FIELD << 3 | WIRE_VARINT as u64, &mut t);
        varint(2, &mut t);
        varint(TENSOR_DATA_TYPE_FIELD << 3 | WIRE_VARINT as u64, &mut t);
        varint(DATA_TYPE_FLOAT, &mut t);
        for v in [1.5f32, -2.0] {
            varint(TENSOR_FLOAT_DATA_FIELD << 3 | WIRE_FIXED32 as u64, &mut t);
            t.extend_from_slice(&v.to_le_bytes());
        }
        let parsed = last_float_initializer(&model_proto(&[t])).unwrap();
        assert_eq!(parsed.dims, vec![2]);
        assert_eq!(parsed.values, vec![1.5, -2.0]);
    }

    #[test]
    fn test_missing_graph() {
        let mut model = Vec::new();
        varint(1 << 3 | WIRE_VARINT as u64, &mut model);
        varint(8, &mut model);
        assert!(matches!(last_float_initializer(&model), Err(OnnxGraphError::MissingGraph)));
    }

    #[test]
    fn test_truncated_input() {
        let model = model_with_matrix(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let cut = &model[..model.len() - 3];
        assert!(matches!(last_float_initializer(cut), Err(OnnxGraphError::Truncated(_))));
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let model = model_proto(&[tensor_proto("emap", &[3, 3], &[1.0, 2.0])]);
        assert!(matches!(last_float_initializer(&model), Err(OnnxGraphError::Shape { .. })));
    }

    #[test]
    fn test_load_latent_projection_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swap.onnx");
        std::fs::write(&path, model_with_matrix(2, 2, &[1.0, 0.0, 0.0, 1.0])).unwrap();
        let emap = load_latent_projection(&path).unwrap();
        assert_eq!(emap.shape(), &[2, 2]);
        assert_eq!(emap[[1, 1]], 1.0);
    }
}
