use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::dtype::WithDType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

// Serialization boundary
//
// A tensor crosses process or file boundaries as
//
//   (requires_gradient, shape, data)
//
// where `data` is the row-major element buffer in little-endian bytes. The
// compute graph is not part of the record: a restored tensor is a leaf.

/// Plain-data form of a tensor, for any serde format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub requires_gradient: bool,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl<E: WithDType, B: Backend> Tensor<E, B> {
    pub fn to_record(&self) -> Result<TensorRecord> {
        let elements = self.elements()?;
        let mut data = Vec::with_capacity(elements.len() * E::DTYPE.size_in_bytes());
        for v in elements {
            v.write_le(&mut data);
        }
        Ok(TensorRecord {
            requires_gradient: self.requires_grad(),
            shape: self.shape().to_vec(),
            data,
        })
    }

    pub fn from_record(record: &TensorRecord, device: &B::Device) -> Result<Self> {
        let shape = Shape::from(record.shape.as_slice());
        let width = E::DTYPE.size_in_bytes();
        if record.data.len() != shape.elem_count() * width {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: record.data.len() / width,
                shape,
            });
        }
        let values: Vec<E> = record.data.chunks_exact(width).map(E::read_le).collect();
        Ok(Self::from_vec(values, shape, device)?.set_requires_grad(record.requires_gradient))
    }
}
