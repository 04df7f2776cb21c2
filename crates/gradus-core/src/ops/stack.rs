use std::ops::Range;

use crate::backend::Backend;
use crate::context::TensorContext;
use crate::dtype::WithDType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

use super::{backward_fn, grad_fn, Region};

// Joining and splitting along an axis
//
//   cat([a, b], 0)        [2, 3] + [4, 3]  -> [6, 3]
//   stack([a, b], 0)      [2, 3] + [2, 3]  -> [2, 2, 3]
//   unstacked(0, [2, 4])  [6, 3]           -> [2, 3], [4, 3]
//
// The backward of cat hands each source its own range of the gradient; the
// backward of each unstacked part adds its gradient into that range.

/// Ranges along `axis` that select one part each, for parts of the given lengths.
fn part_ranges(rank: usize, axis: usize, lengths: &[usize]) -> Vec<Vec<Option<Range<usize>>>> {
    let mut offset = 0;
    lengths
        .iter()
        .map(|&len| {
            let mut ranges = vec![None; rank];
            ranges[axis] = Some(offset..offset + len);
            offset += len;
            ranges
        })
        .collect()
}

impl<E: WithDType, B: Backend> Tensor<E, B> {
    /// Concatenate along an existing axis. All other axes must agree.
    pub fn cat(tensors: &[&Self], axis: usize) -> Result<Self> {
        let first = match tensors.first() {
            Some(first) => *first,
            None => crate::bail!("cat needs at least one tensor"),
        };
        let rank = first.rank();
        if axis >= rank {
            return Err(Error::AxisOutOfRange { axis, rank });
        }
        let mut total = 0;
        for t in tensors {
            let compatible = t.rank() == rank
                && t.dims()
                    .iter()
                    .zip(first.dims())
                    .enumerate()
                    .all(|(a, (x, y))| a == axis || x == y);
            if !compatible {
                return Err(Error::ShapeMismatch {
                    expected: first.shape().clone(),
                    got: t.shape().clone(),
                });
            }
            total += t.dims()[axis];
        }

        let out = Self::alloc(first.shape().with_dim(axis, total)?, first.device())?;
        let parts: Vec<(&B::Buffer<E>, &Shape)> =
            tensors.iter().map(|t| (t.buffer(), t.shape())).collect();
        B::stack(&parts, axis, out.buffer())?;

        if !tensors.iter().any(|t| t.requires_grad()) {
            return Ok(out);
        }
        let lengths: Vec<usize> = tensors.iter().map(|t| t.dims()[axis]).collect();
        let backward = part_ranges(rank, axis, &lengths)
            .into_iter()
            .map(|ranges| grad_fn(move |g: &Self| g.slice(&ranges)))
            .collect();
        Ok(out.with_context(
            format!("cat[{}]", axis),
            tensors.iter().map(|t| (*t).clone()).collect(),
            backward,
        ))
    }

    /// Join equally shaped tensors along a new axis inserted at `axis`.
    pub fn stack(tensors: &[&Self], axis: usize) -> Result<Self> {
        let expanded = tensors
            .iter()
            .map(|t| t.unsqueeze(axis))
            .collect::<Result<Vec<_>>>()?;
        let refs: Vec<&Self> = expanded.iter().collect();
        Self::cat(&refs, axis)
    }

    /// Split along `axis` into consecutive parts of the given lengths, which
    /// must add up to the size of the axis.
    pub fn unstacked(&self, axis: usize, lengths: &[usize]) -> Result<Vec<Self>> {
        let size = self.shape().dim(axis)?;
        let sum: usize = lengths.iter().sum();
        if sum != size {
            crate::bail!(
                "cannot split axis {} of size {} into parts {:?}",
                axis,
                size,
                lengths
            );
        }
        let parts = lengths
            .iter()
            .map(|&len| Self::alloc(self.shape().with_dim(axis, len)?, self.device()))
            .collect::<Result<Vec<_>>>()?;
        let targets: Vec<(&B::Buffer<E>, &Shape)> =
            parts.iter().map(|p| (p.buffer(), p.shape())).collect();
        B::unstack(self.buffer(), self.shape(), axis, &targets)?;

        if !self.requires_grad() {
            return Ok(parts);
        }
        let regions = part_ranges(self.rank(), axis, lengths);
        Ok(parts
            .into_iter()
            .zip(regions)
            .map(|(part, ranges)| {
                let source_shape = self.shape().clone();
                let region = Region::Range(ranges);
                let backward = backward_fn(move |g: &Self, acc: Option<&Self>| {
                    Self::scatter_add_region(g, acc, &source_shape, &region)
                });
                part.with_prepared_context(TensorContext::accumulating(
                    format!("unstack[{}]", axis),
                    vec![self.clone()],
                    vec![backward],
                ))
            })
            .collect())
    }

    /// `times` copies of this tensor, concatenated along axis 0.
    pub fn repeated(&self, times: usize) -> Result<Self> {
        if self.rank() == 0 {
            return self.reshape(1)?.repeated(times);
        }
        if times == 0 {
            return Self::zeros(self.shape().with_dim(0, 0)?, self.device());
        }
        let copies = vec![self; times];
        Self::cat(&copies, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_ranges() {
        let ranges = part_ranges(2, 1, &[1, 3]);
        assert_eq!(ranges, vec![vec![None, Some(0..1)], vec![None, Some(1..4)]]);
    }
}
