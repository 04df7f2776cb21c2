use crate::backend::{Backend, ReduceOp};
use crate::broadcast::{keep_axes, normalize_axes, remove_axes};
use crate::context::TensorContext;
use crate::dtype::WithDType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

use super::backward_fn;

// Reductions along a set of axes
//
//   reduce_sum   g is reshaped to the keep-dim shape and broadcast back
//   reduce_mean  same, divided by the number of reduced elements
//   reduce_max   g is written back to the position of the extremum,
//   reduce_min   zero elsewhere
//
// Max and min record, per output element, the row-major offset of the
// selected element inside its reduced sub-block (an i32 "context" tensor).
// Ties go to the first occurrence. The backward pass hands that context to
// the backend's `expand_context`.
//
// Axis lists may come in any order and with repeats; they are sorted and
// deduplicated first. An empty list is the identity.

impl<E: WithDType, B: Backend> Tensor<E, B> {
    fn all_axes(&self) -> Vec<usize> {
        (0..self.rank()).collect()
    }

    fn reduce_forward(
        &self,
        op: ReduceOp,
        axes: &[usize],
        context: Option<&Tensor<i32, B>>,
    ) -> Result<Self> {
        let out = Self::alloc(remove_axes(self.shape(), axes)?, self.device())?;
        B::reduce_op(
            op,
            self.buffer(),
            self.shape(),
            axes,
            out.buffer(),
            context.map(|c| c.buffer()),
        )?;
        Ok(out)
    }

    /// Backward of sum/mean: broadcast `g * scale` back over the reduced axes.
    fn attach_broadcast_back(
        self,
        source: &Self,
        axes: &[usize],
        scale: Option<E>,
        tag: String,
    ) -> Result<Self> {
        let keep = keep_axes(source.shape(), axes)?;
        let source_shape = source.shape().clone();
        let backward = backward_fn(move |g: &Self, acc: Option<&Self>| {
            let mut g = g.reshape(keep.clone())?;
            if let Some(scale) = scale {
                g = g.mul_scalar(scale)?;
            }
            match acc {
                Some(acc) => acc.add(&g),
                None => Self::zeros(source_shape.clone(), g.device())?.add(&g),
            }
        });
        Ok(self.with_prepared_context(TensorContext::accumulating(
            tag,
            vec![source.clone()],
            vec![backward],
        )))
    }

    pub fn reduce_sum(&self, axes: &[usize]) -> Result<Self> {
        let sorted = normalize_axes(axes, self.rank())?;
        let axes = sorted.as_slice();
        if axes.is_empty() {
            return Ok(self.clone());
        }
        let out = self.reduce_forward(ReduceOp::Sum, axes, None)?;
        if !self.requires_grad() {
            return Ok(out);
        }
        out.attach_broadcast_back(self, axes, None, format!("sum{:?}", axes))
    }

    pub fn reduce_sum_all(&self) -> Result<Self> {
        self.reduce_sum(&self.all_axes())
    }

    pub fn reduce_mean(&self, axes: &[usize]) -> Result<Self> {
        let sorted = normalize_axes(axes, self.rank())?;
        let axes = sorted.as_slice();
        if axes.is_empty() {
            return Ok(self.clone());
        }
        let out = self.reduce_forward(ReduceOp::Mean, axes, None)?;
        if !self.requires_grad() {
            return Ok(out);
        }
        let count: usize = axes.iter().map(|&a| self.dims()[a]).product();
        let scale = E::from_f64(1.0 / count as f64);
        out.attach_broadcast_back(self, axes, Some(scale), format!("mean{:?}", axes))
    }

    pub fn reduce_mean_all(&self) -> Result<Self> {
        self.reduce_mean(&self.all_axes())
    }

    fn reduce_extremum(&self, op: ReduceOp, axes: &[usize]) -> Result<(Self, Tensor<i32, B>)> {
        let sorted = normalize_axes(axes, self.rank())?;
        let axes = sorted.as_slice();
        if let Some(&axis) = axes.iter().find(|&&a| self.dims()[a] == 0) {
            crate::bail!("cannot take {:?} along empty axis {} of {}", op, axis, self.shape());
        }
        let out_shape = remove_axes(self.shape(), axes)?;
        let context = Tensor::<i32, B>::alloc(out_shape, self.device())?;
        let out = self.reduce_forward(op, axes, Some(&context))?;
        if !self.requires_grad() {
            return Ok((out, context));
        }
        let source_shape = self.shape().clone();
        let axes_owned = axes.to_vec();
        let ctx = context.clone();
        let backward = backward_fn(move |g: &Self, acc: Option<&Self>| {
            let expanded = g.expand_context(&ctx, &source_shape, &axes_owned)?;
            match acc {
                Some(acc) => acc.add(&expanded),
                None => Ok(expanded),
            }
        });
        let tag = format!("{:?}{:?}", op, axes).to_lowercase();
        let out = out.with_prepared_context(TensorContext::accumulating(
            tag,
            vec![self.clone()],
            vec![backward],
        ));
        Ok((out, context))
    }

    pub fn reduce_max(&self, axes: &[usize]) -> Result<Self> {
        if axes.is_empty() {
            return Ok(self.clone());
        }
        Ok(self.reduce_extremum(ReduceOp::Max, axes)?.0)
    }

    pub fn reduce_max_all(&self) -> Result<Self> {
        self.reduce_max(&self.all_axes())
    }

    pub fn reduce_min(&self, axes: &[usize]) -> Result<Self> {
        if axes.is_empty() {
            return Ok(self.clone());
        }
        Ok(self.reduce_extremum(ReduceOp::Min, axes)?.0)
    }

    pub fn reduce_min_all(&self) -> Result<Self> {
        self.reduce_min(&self.all_axes())
    }

    /// Maximum along `axes` together with the offset of the maximum inside
    /// each reduced sub-block.
    pub fn reduce_max_with_context(&self, axes: &[usize]) -> Result<(Self, Tensor<i32, B>)> {
        self.reduce_extremum(ReduceOp::Max, axes)
    }

    /// Row-major position of the largest element (first one on ties).
    pub fn argmax(&self) -> Result<usize> {
        if self.elem_count() == 0 {
            crate::bail!("argmax of empty tensor with shape {}", self.shape());
        }
        let (_, context) = self.detached().reduce_extremum(ReduceOp::Max, &self.all_axes())?;
        let offset = B::get_value(context.buffer())?;
        Ok(offset as usize)
    }

    /// Population variance along `axes`.
    pub fn variance(&self, axes: &[usize]) -> Result<Self> {
        let mean = self
            .reduce_mean(axes)?
            .reshape(keep_axes(self.shape(), axes)?)?;
        self.sub(&mean)?.square()?.reduce_mean(axes)
    }

    /// Write each element of this reduced tensor to the position named by
    /// `context` inside the unreduced `shape`; zero elsewhere.
    pub(crate) fn expand_context(
        &self,
        context: &Tensor<i32, B>,
        shape: &Shape,
        axes: &[usize],
    ) -> Result<Self> {
        let reduced_shape = remove_axes(shape, axes)?;
        if self.shape() != &reduced_shape {
            return Err(Error::ShapeMismatch {
                expected: reduced_shape,
                got: self.shape().clone(),
            });
        }
        let out = Self::alloc(shape.clone(), self.device())?;
        B::expand_context(self.buffer(), context.buffer(), out.buffer(), shape, axes)?;
        if !self.requires_grad() {
            return Ok(out);
        }
        // d/d(reduced) = sum over the reduced axes of g at the recorded positions
        let ctx = context.clone();
        let full_shape = shape.clone();
        let axes_owned = axes.to_vec();
        let backward = backward_fn(move |g: &Self, acc: Option<&Self>| {
            let mask = Self::ones(reduced_shape.clone(), g.device())?.expand_context(
                &ctx,
                &full_shape,
                &axes_owned,
            )?;
            let picked = g.mul(&mask)?.reduce_sum(&axes_owned)?;
            match acc {
                Some(acc) => acc.add(&picked),
                None => Ok(picked),
            }
        });
        Ok(out.with_prepared_context(TensorContext::accumulating(
            "expand_context",
            vec![self.clone()],
            vec![backward],
        )))
    }
}
