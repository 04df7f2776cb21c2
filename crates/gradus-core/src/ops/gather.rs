use crate::backend::Backend;
use crate::dtype::WithDType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

use super::grad_fn;

// Index-driven selection along one axis
//
//   gather   [.., n, ..] -> [.., ..]      out[j] = x[ctx[j], j]      (axis 0)
//   scatter  [.., ..] -> [.., n, ..]      out[ctx[j], j] = x[j], 0 elsewhere
//
// The i32 context has the shape of the reduced side. Context entries equal
// to `ignore_index` select nothing: gather reads zero, scatter writes
// nothing. Each is the other's backward.

impl<E: WithDType, B: Backend> Tensor<E, B> {
    /// Pick one element along `axis` per position of `context`, removing the axis.
    pub fn gather(&self, context: &Tensor<i32, B>, axis: usize, ignore_index: i32) -> Result<Self> {
        let size = self.shape().dim(axis)?;
        let mut dims = self.shape().to_vec();
        dims.remove(axis);
        let out_shape = Shape::new(dims);
        if context.shape() != &out_shape {
            return Err(Error::ShapeMismatch {
                expected: out_shape,
                got: context.shape().clone(),
            });
        }
        let out = Self::alloc(out_shape, self.device())?;
        B::gather(
            self.buffer(),
            self.shape(),
            context.buffer(),
            out.buffer(),
            axis,
            ignore_index,
        )?;
        if !self.requires_grad() {
            return Ok(out);
        }
        let ctx = context.clone();
        Ok(out.with_context(
            format!("gather[{}]", axis),
            vec![self.clone()],
            vec![grad_fn(move |g| g.scatter(&ctx, size, axis, ignore_index))],
        ))
    }

    /// Place each element at position `context` of a new axis of `axis_size`
    /// entries inserted at `axis`; everything else is zero.
    pub fn scatter(
        &self,
        context: &Tensor<i32, B>,
        axis_size: usize,
        axis: usize,
        ignore_index: i32,
    ) -> Result<Self> {
        if context.shape() != self.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: context.shape().clone(),
            });
        }
        let out_shape = self.shape().inserted(axis, axis_size)?;
        let out = Self::alloc(out_shape.clone(), self.device())?;
        B::scatter(
            self.buffer(),
            context.buffer(),
            out.buffer(),
            &out_shape,
            axis,
            ignore_index,
        )?;
        if !self.requires_grad() {
            return Ok(out);
        }
        let ctx = context.clone();
        Ok(out.with_context(
            format!("scatter[{}]", axis),
            vec![self.clone()],
            vec![grad_fn(move |g| g.gather(&ctx, axis, ignore_index))],
        ))
    }
}

impl<B: Backend> Tensor<i32, B> {
    /// One-hot encoding of these labels along a new trailing axis of `depth`
    /// entries. A label of -1 encodes as all zeros.
    pub fn one_hot<T: WithDType>(&self, depth: usize) -> Result<Tensor<T, B>> {
        let ones = Tensor::<T, B>::ones(self.shape().clone(), self.device())?;
        ones.scatter(self, depth, self.rank(), -1)
    }
}
