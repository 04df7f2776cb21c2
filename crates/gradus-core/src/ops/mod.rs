// Differentiable tensor operations
//
// Every operation follows the same steps:
//
//   1. derive the result shape (broadcast, axis removal, explicit target)
//      and validate the operands before touching any buffer
//   2. allocate the result and let the backend fill it
//   3. if any operand requires gradients, attach a context holding the
//      operands and one backward function per operand
//
// Backward functions are written with tensor operations themselves, so a
// gradient computed with `retain_graph` is again differentiable.
//
// The operations are split by family:
//
//   binary     add, sub, mul, div (broadcasting) and scalar forms
//   unary      exp, log, tanh, relu, sigmoid, softmax, ...
//   reduce     sum, mean, max, min along axes; variance, argmax
//   shape      view, reshape, squeeze, permute, reversed, band_matrix
//   subscript  index and range slices, reads and writes, padding
//   stack      cat, stack, unstacked, repeated
//   gather     gather, scatter, one_hot
//   matrix     matmul with transpose flags and broadcast batch axes
//   conv       img2col, col2img, convolutions and pooling built on them

mod binary;
mod conv;
mod gather;
mod matrix;
mod reduce;
mod shape;
mod stack;
mod subscript;
mod unary;

use crate::backend::Backend;
use crate::broadcast::reduced_axes;
use crate::context::{BackwardFn, ContributionFn};
use crate::dtype::WithDType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Box a contribution closure (`output gradient -> contribution`).
pub(crate) fn grad_fn<E, B, F>(f: F) -> ContributionFn<E, B>
where
    E: WithDType,
    B: Backend,
    F: Fn(&Tensor<E, B>) -> Result<Tensor<E, B>> + Send + Sync + 'static,
{
    Box::new(f)
}

/// Box an accumulating backward closure.
pub(crate) fn backward_fn<E, B, F>(f: F) -> BackwardFn<E, B>
where
    E: WithDType,
    B: Backend,
    F: Fn(&Tensor<E, B>, Option<&Tensor<E, B>>) -> Result<Tensor<E, B>> + Send + Sync + 'static,
{
    Box::new(f)
}

/// Resolve a possibly negative index against an axis of `size` elements.
pub(crate) fn resolve_index(index: isize, axis: usize, size: usize) -> Result<usize> {
    let resolved = if index < 0 {
        index + size as isize
    } else {
        index
    };
    if resolved < 0 || resolved as usize >= size {
        return Err(Error::IndexOutOfRange { index, axis, size });
    }
    Ok(resolved as usize)
}

impl<E: WithDType, B: Backend> Tensor<E, B> {
    /// Sum a broadcast gradient back down to `shape`: reduce every axis the
    /// forward pass broadcast, then reshape to drop padded leading axes.
    pub(crate) fn sum_to_shape(&self, shape: &Shape) -> Result<Self> {
        if self.shape() == shape {
            return Ok(self.clone());
        }
        let axes = reduced_axes(shape, self.shape());
        let summed = if axes.is_empty() {
            self.clone()
        } else {
            self.reduce_sum(&axes)?
        };
        summed.reshape(shape.clone())
    }

    /// `acc[region] += grad`, with `acc` defaulting to zeros of `shape`.
    /// The backward of every read that selects a region of its source.
    pub(crate) fn scatter_add_region(
        grad: &Self,
        acc: Option<&Self>,
        shape: &Shape,
        region: &Region,
    ) -> Result<Self> {
        let mut base = match acc {
            Some(acc) => acc.clone(),
            None => Self::zeros(shape.clone(), grad.device())?,
        };
        let current = region.read(&base)?;
        let updated = current.add(grad)?;
        region.write(&mut base, &updated)?;
        Ok(base)
    }
}

/// A selected region of a tensor, in either slice flavour.
#[derive(Debug, Clone)]
pub(crate) enum Region {
    Index(Vec<Option<usize>>),
    Range(Vec<Option<std::ops::Range<usize>>>),
}

impl Region {
    pub(crate) fn read<E: WithDType, B: Backend>(&self, t: &Tensor<E, B>) -> Result<Tensor<E, B>> {
        match self {
            Region::Index(index) => t.index_resolved(index),
            Region::Range(ranges) => t.slice(ranges),
        }
    }

    pub(crate) fn write<E: WithDType, B: Backend>(
        &self,
        t: &mut Tensor<E, B>,
        value: &Tensor<E, B>,
    ) -> Result<()> {
        match self {
            Region::Index(index) => t.set_index_resolved(index, value),
            Region::Range(ranges) => t.set_slice(ranges, value),
        }
    }
}
