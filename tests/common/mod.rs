//! Safetensors fixtures shared by the integration tests.
#![allow(dead_code)]

use safetensors::{Dtype, SafeTensorError, serialize, tensor::TensorView};

/// Owned tensor ready for safetensors serialisation.
pub struct RawTensor {
    pub name: String,
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub bytes: Vec<u8>,
}

impl RawTensor {
    pub fn f32(name: &str, shape: &[usize], values: &[f32]) -> Self {
        Self {
            name: name.to_string(),
            dtype: Dtype::F32,
            shape: shape.to_vec(),
            bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    pub fn u8(name: &str, shape: &[usize], values: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            dtype: Dtype::U8,
            shape: shape.to_vec(),
            bytes: values.to_vec(),
        }
    }
}

pub fn to_safetensors(tensors: &[RawTensor]) -> Result<Vec<u8>, SafeTensorError> {
    let views = tensors
        .iter()
        .map(|t| TensorView::new(t.dtype, t.shape.clone(), &t.bytes).map(|view| (t.name.clone(), view)))
        .collect::<Result<Vec<_>, _>>()?;
    serialize(views, &None)
}
