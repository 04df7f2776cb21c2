use std::ops::Range;

use crate::backend::Backend;
use crate::context::TensorContext;
use crate::dtype::WithDType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::strided::{plan_index_slice, range_slice_shape};
use crate::tensor::Tensor;

use super::{backward_fn, grad_fn, resolve_index, Region};

// Subscripts: reading and writing regions
//
// Reads
//   index([Some(i), None, ..])  fixes some leading axes, drops them from the
//                               result; a view when the selection is one
//                               contiguous block, a copy otherwise
//   slice([Some(a..b), ..])     keeps the rank; always a copy
//
//   backward: acc[region] += g   (scatter-add, so overlapping reads sum)
//
// Writes
//   set_index / set_slice copy the buffer first if it is shared, then write.
//   The value's shape must equal the region's shape exactly. When tracked,
//   the written tensor becomes a new node with sources
//   [previous value, written value]:
//
//     previous  g with the region zeroed
//     written   g[region]

impl<E: WithDType, B: Backend> Tensor<E, B> {
    fn resolve_indices(&self, index: &[Option<isize>]) -> Result<Vec<Option<usize>>> {
        if index.len() > self.rank() {
            return Err(Error::SliceRankMismatch {
                got: index.len(),
                rank: self.rank(),
            });
        }
        index
            .iter()
            .enumerate()
            .map(|(axis, i)| {
                i.map(|i| resolve_index(i, axis, self.dims()[axis]))
                    .transpose()
            })
            .collect()
    }

    /// Read an index slice. `Some(i)` fixes a leading axis (negative values
    /// count from the end), `None` keeps it.
    pub fn index(&self, index: &[Option<isize>]) -> Result<Self> {
        let index = self.resolve_indices(index)?;
        self.index_resolved(&index)
    }

    pub(crate) fn index_resolved(&self, index: &[Option<usize>]) -> Result<Self> {
        // validates before the backend touches memory
        plan_index_slice(index, self.shape())?;
        let (buffer, is_copy, shape) = B::get_slice(index, self.buffer(), self.shape())?;
        let out = if is_copy {
            log::trace!("index {:?} of {} copied", index, self.shape());
            Self::from_buffer(buffer, shape, self.device())
        } else {
            self.view_buffer(buffer, shape)
        };
        self.attach_region_read(out, Region::Index(index.to_vec()), "index")
    }

    /// Read a range slice: one optional range per leading axis.
    pub fn slice(&self, ranges: &[Option<Range<usize>>]) -> Result<Self> {
        range_slice_shape(ranges, self.shape())?;
        let (buffer, is_copy, shape) = B::get_range_slice(ranges, self.buffer(), self.shape())?;
        let out = if is_copy {
            Self::from_buffer(buffer, shape, self.device())
        } else {
            self.view_buffer(buffer, shape)
        };
        self.attach_region_read(out, Region::Range(ranges.to_vec()), "slice")
    }

    fn attach_region_read(&self, out: Self, region: Region, tag: &str) -> Result<Self> {
        if !self.requires_grad() {
            return Ok(out);
        }
        let source_shape = self.shape().clone();
        let backward = backward_fn(move |g: &Self, acc: Option<&Self>| {
            Self::scatter_add_region(g, acc, &source_shape, &region)
        });
        Ok(out.with_prepared_context(TensorContext::accumulating(
            tag,
            vec![self.clone()],
            vec![backward],
        )))
    }

    /// Write `value` into an index slice of this tensor.
    pub fn set_index(&mut self, index: &[Option<isize>], value: &Self) -> Result<()> {
        let index = self.resolve_indices(index)?;
        self.set_index_resolved(&index, value)
    }

    pub(crate) fn set_index_resolved(
        &mut self,
        index: &[Option<usize>],
        value: &Self,
    ) -> Result<()> {
        let region_shape = plan_index_slice(index, self.shape())?.shape().clone();
        self.write_region(Region::Index(index.to_vec()), region_shape, value, "set_index")
    }

    /// Write `value` into a range slice of this tensor.
    pub fn set_slice(&mut self, ranges: &[Option<Range<usize>>], value: &Self) -> Result<()> {
        let region_shape = range_slice_shape(ranges, self.shape())?;
        self.write_region(Region::Range(ranges.to_vec()), region_shape, value, "set_slice")
    }

    fn write_region(
        &mut self,
        region: Region,
        region_shape: Shape,
        value: &Self,
        tag: &str,
    ) -> Result<()> {
        if value.shape() != &region_shape {
            return Err(Error::ShapeMismatch {
                expected: region_shape,
                got: value.shape().clone(),
            });
        }
        let tracked = self.requires_grad() || value.requires_grad();
        let previous = if tracked { Some(self.clone()) } else { None };

        self.ensure_ownership()?;
        match &region {
            Region::Index(index) => {
                B::set_slice(index, self.buffer(), self.shape(), value.buffer(), value.shape())?
            }
            Region::Range(ranges) => B::set_range_slice(
                ranges,
                self.buffer(),
                self.shape(),
                value.buffer(),
                value.shape(),
            )?,
        }

        let context = previous.map(|previous| {
            let zero_region = region.clone();
            let read_region = region;
            TensorContext::new(
                tag,
                vec![previous, value.clone()],
                vec![
                    grad_fn(move |g: &Self| {
                        let mut g = g.clone();
                        let zeros = Self::zeros(region_shape.clone(), g.device())?;
                        zero_region.write(&mut g, &zeros)?;
                        Ok(g)
                    }),
                    grad_fn(move |g: &Self| read_region.read(g)),
                ],
            )
        });
        self.replace_node(context);
        Ok(())
    }

    /// Surround this tensor with `value`: `padding[i] = (before, after)` for
    /// each leading axis `i`.
    pub fn padded(&self, value: E, padding: &[(usize, usize)]) -> Result<Self> {
        if padding.len() > self.rank() {
            return Err(Error::SliceRankMismatch {
                got: padding.len(),
                rank: self.rank(),
            });
        }
        let mut dims = self.shape().to_vec();
        let mut ranges = Vec::with_capacity(padding.len());
        for (axis, &(before, after)) in padding.iter().enumerate() {
            ranges.push(Some(before..before + dims[axis]));
            dims[axis] += before + after;
        }
        let mut out = Self::full(value, dims, self.device())?;
        out.set_slice(&ranges, self)?;
        Ok(out)
    }
}
