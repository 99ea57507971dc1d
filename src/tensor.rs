//! Constant tensor buffers.

use crate::proto::{tensor_proto::DataType as ProtoDataType, TensorProto};
use crate::{Result, StreamlineError};

/// A constant tensor value: flat f32 container plus dims.
///
/// Quantized values are stored in the float container as-is; the
/// quantization `DataType` annotation lives on the tensor's `ValueInfo`,
/// not here.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorData {
    shape: Vec<i64>,
    data: Vec<f32>,
}

impl TensorData {
    pub fn new(shape: Vec<i64>, data: Vec<f32>) -> Result<Self> {
        let expected: i64 = shape.iter().product();
        if shape.iter().any(|&d| d < 0) || expected as usize != data.len() {
            return Err(StreamlineError::InvalidModel(format!(
                "tensor shape {:?} does not match buffer of {} elements",
                shape,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            shape: vec![1],
            data: vec![value],
        }
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn num_elements(&self) -> usize {
        self.data.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.data.len() == 1
    }

    /// Reinterpret the buffer under a new shape with the same element count.
    pub fn reshaped(&self, shape: Vec<i64>) -> Result<Self> {
        TensorData::new(shape, self.data.clone())
    }

    /// Apply `f` to every element, keeping the shape.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().copied().map(f).collect(),
        }
    }

    /// Row-major strides for this shape.
    pub fn strides(shape: &[i64]) -> Vec<usize> {
        let mut strides = vec![1usize; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1] as usize;
        }
        strides
    }

    pub fn from_proto(proto: &TensorProto) -> Result<Self> {
        let dtype = ProtoDataType::try_from(proto.data_type)
            .map_err(|_| StreamlineError::InvalidModel(format!(
                "tensor '{}' has unknown element type {}",
                proto.name, proto.data_type
            )))?;
        let data: Vec<f32> = match dtype {
            ProtoDataType::Float => {
                if !proto.float_data.is_empty() {
                    proto.float_data.clone()
                } else {
                    proto
                        .raw_data
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect()
                }
            }
            ProtoDataType::Double => proto.double_data.iter().map(|&x| x as f32).collect(),
            ProtoDataType::Int64 => {
                if !proto.int64_data.is_empty() {
                    proto.int64_data.iter().map(|&x| x as f32).collect()
                } else {
                    proto
                        .raw_data
                        .chunks_exact(8)
                        .map(|c| {
                            i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                                as f32
                        })
                        .collect()
                }
            }
            ProtoDataType::Int32 => proto.int32_data.iter().map(|&x| x as f32).collect(),
            ProtoDataType::Int8 | ProtoDataType::Uint8 => {
                proto.int32_data.iter().map(|&x| x as f32).collect()
            }
            other => {
                return Err(StreamlineError::InvalidModel(format!(
                    "tensor '{}' has unsupported element type {:?}",
                    proto.name, other
                )))
            }
        };
        TensorData::new(proto.dims.clone(), data)
    }

    pub fn to_proto(&self, name: &str) -> TensorProto {
        TensorProto {
            dims: self.shape.clone(),
            data_type: ProtoDataType::Float as i32,
            float_data: self.data.clone(),
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// Numpy-style broadcast of two shapes.
pub fn broadcast_shapes(a: &[i64], b: &[i64]) -> Result<Vec<i64>> {
    let rank = a.len().max(b.len());
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        if da == db || da == 1 || db == 1 {
            out.push(da.max(db));
        } else {
            return Err(StreamlineError::InvalidModel(format!(
                "shapes {:?} and {:?} are not broadcastable",
                a, b
            )));
        }
    }
    Ok(out)
}
