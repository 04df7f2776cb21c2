use std::ops::Range;

use crate::error::{Error, Result};
use crate::shape::Shape;

// Strided index engine: logical indices to flat buffer offsets
//
// Every buffer is row-major, so an n-dimensional position maps to
//
//   offset = sum(index[i] * stride[i]),   stride[i] = product(shape[i+1..])
//
// Slicing comes in two flavours:
//
// 1. Index slices: one `Option<usize>` per leading axis. `Some(i)` fixes the
//    axis (and drops it from the result), `None` keeps it free. Trailing
//    `None`s are trimmed first. If no free axis remains before the last fixed
//    one, the selection is a single contiguous block and can be served as a
//    view. Otherwise free and fixed axes interleave and the data has to be
//    gathered into a fresh buffer.
//
//      shape [4, 5, 6], slice [Some(2)]           → view, offset 60, shape [5, 6]
//      shape [4, 5, 6], slice [Some(2), None]     → same (trailing None trimmed)
//      shape [4, 5, 6], slice [None, Some(1)]     → copy, shape [4, 6]
//
// 2. Range slices: one `Option<Range>` per leading axis. These keep the rank
//    and are always materialised as copies.
//
// Both flavours reduce to a list of "runs": offsets into the big buffer at
// which `run_len` consecutive elements belong, in the order they appear in
// the compact slice. Reading copies runs out, writing copies runs back in.
// A run always covers the maximal contiguous trailing block, so the copy is a
// handful of `copy_from_slice` calls rather than one per element.

/// Row-major strides of a shape. `[]` for rank 0.
pub fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; shape.len()];
    let mut acc = 1usize;
    for i in (0..shape.len()).rev() {
        strides[i] = acc;
        acc *= shape[i];
    }
    strides
}

/// Flat offset of a full per-axis index.
pub fn linear_index(index: &[usize], shape: &[usize]) -> usize {
    index
        .iter()
        .zip(strides(shape))
        .map(|(&i, s)| i * s)
        .sum()
}

/// Per-axis index of a flat offset. Inverse of [`linear_index`].
pub fn unravel_index(mut linear: usize, shape: &[usize]) -> Vec<usize> {
    let mut index = vec![0usize; shape.len()];
    for axis in (0..shape.len()).rev() {
        let dim = shape[axis];
        if dim == 0 {
            continue;
        }
        index[axis] = linear % dim;
        linear /= dim;
    }
    index
}

/// Iterate over every index tuple of `shape` in row-major order.
pub fn iterate(shape: &[usize]) -> IndexIter {
    IndexIter {
        current: vec![0; shape.len()],
        dims: shape.to_vec(),
        remaining: shape.iter().product(),
        started: false,
    }
}

/// Iterator over multi-dimensional indices, rightmost axis advancing first.
pub struct IndexIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    remaining: usize,
    started: bool,
}

impl IndexIter {
    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.dims[i] {
                return;
            }
            self.current[i] = 0;
        }
    }
}

impl Iterator for IndexIter {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.current.clone())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for IndexIter {}

// Index slices

/// How an index slice is served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexSlice {
    /// One contiguous block starting at `offset`, no copy needed.
    View { offset: usize, shape: Shape },
    /// Fixed and free axes interleave; `index` is the trimmed slice to gather.
    Copy { index: Vec<Option<usize>>, shape: Shape },
}

impl IndexSlice {
    pub fn shape(&self) -> &Shape {
        match self {
            IndexSlice::View { shape, .. } | IndexSlice::Copy { shape, .. } => shape,
        }
    }

    pub fn is_copy(&self) -> bool {
        matches!(self, IndexSlice::Copy { .. })
    }
}

/// Validate an index slice against `shape` and decide between view and copy.
pub fn plan_index_slice(index: &[Option<usize>], shape: &Shape) -> Result<IndexSlice> {
    let dims = shape.dims();
    if index.len() > dims.len() {
        return Err(Error::SliceRankMismatch {
            got: index.len(),
            rank: dims.len(),
        });
    }
    for (axis, (i, &size)) in index.iter().zip(dims).enumerate() {
        if let Some(i) = *i {
            if i >= size {
                return Err(Error::IndexOutOfRange {
                    index: i as isize,
                    axis,
                    size,
                });
            }
        }
    }

    let trimmed = index.iter().rposition(Option::is_some).map_or(0, |p| p + 1);
    let index = &index[..trimmed];

    let mut result_dims: Vec<usize> = index
        .iter()
        .zip(dims)
        .filter(|(i, _)| i.is_none())
        .map(|(_, &d)| d)
        .collect();
    result_dims.extend_from_slice(&dims[trimmed..]);
    let result_shape = Shape::new(result_dims);

    if index.iter().all(Option::is_some) {
        let offset = index
            .iter()
            .zip(strides(dims))
            .filter_map(|(i, s)| i.map(|i| i * s))
            .sum();
        Ok(IndexSlice::View {
            offset,
            shape: result_shape,
        })
    } else {
        Ok(IndexSlice::Copy {
            index: index.to_vec(),
            shape: result_shape,
        })
    }
}

/// Contiguous runs making up a slice, in compact order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Runs {
    pub offsets: Vec<usize>,
    pub run_len: usize,
}

impl Runs {
    /// Number of elements covered by all runs.
    pub fn elem_count(&self) -> usize {
        self.offsets.len() * self.run_len
    }

    /// Gather the runs of `src` into the compact `dst`.
    pub fn read<E: Copy>(&self, src: &[E], dst: &mut [E]) {
        let n = self.run_len;
        for (k, &off) in self.offsets.iter().enumerate() {
            dst[k * n..(k + 1) * n].copy_from_slice(&src[off..off + n]);
        }
    }

    /// Scatter the compact `src` back into the runs of `dst`.
    pub fn write<E: Copy>(&self, dst: &mut [E], src: &[E]) {
        let n = self.run_len;
        for (k, &off) in self.offsets.iter().enumerate() {
            dst[off..off + n].copy_from_slice(&src[k * n..(k + 1) * n]);
        }
    }
}

/// Runs of a (validated, trimmed) index slice.
///
/// For every combination of free-axis positions the source offset is
/// `sum((fixed[i] or free[i]) * stride[i])`, followed by `stride[last fixed]`
/// contiguous elements.
pub fn index_runs(shape: &[usize], index: &[Option<usize>]) -> Runs {
    let st = strides(shape);
    let trimmed = index.iter().rposition(Option::is_some).map_or(0, |p| p + 1);
    let index = &index[..trimmed];
    let run_len = if trimmed == 0 {
        shape.iter().product()
    } else {
        st[trimmed - 1]
    };

    let base: usize = index
        .iter()
        .zip(&st)
        .filter_map(|(i, s)| i.map(|i| i * s))
        .sum();
    let free: Vec<usize> = (0..trimmed).filter(|&a| index[a].is_none()).collect();
    let free_dims: Vec<usize> = free.iter().map(|&a| shape[a]).collect();

    let offsets = iterate(&free_dims)
        .map(|pos| {
            base + pos
                .iter()
                .zip(&free)
                .map(|(&p, &axis)| p * st[axis])
                .sum::<usize>()
        })
        .collect();
    Runs { offsets, run_len }
}

// Range slices

/// Validate a range slice and compute the shape of the selected region.
pub fn range_slice_shape(ranges: &[Option<Range<usize>>], shape: &Shape) -> Result<Shape> {
    let dims = shape.dims();
    if ranges.len() > dims.len() {
        return Err(Error::SliceRankMismatch {
            got: ranges.len(),
            rank: dims.len(),
        });
    }
    let mut result = dims.to_vec();
    for (axis, r) in ranges.iter().enumerate() {
        if let Some(r) = r {
            if r.start > r.end || r.end > dims[axis] {
                return Err(Error::SliceOutOfBounds {
                    axis,
                    start: r.start,
                    end: r.end,
                    size: dims[axis],
                });
            }
            result[axis] = r.end - r.start;
        }
    }
    Ok(Shape::new(result))
}

/// Runs of a (validated) range slice.
///
/// Recurses axis by axis; once every remaining axis is unconstrained the
/// whole sub-block is one run.
pub fn range_runs(shape: &[usize], ranges: &[Option<Range<usize>>]) -> Runs {
    let st = strides(shape);
    let trimmed = ranges.iter().rposition(Option::is_some).map_or(0, |p| p + 1);
    let run_len = shape[trimmed..].iter().product();
    let mut offsets = Vec::new();
    collect_range_runs(shape, &st, &ranges[..trimmed], 0, 0, &mut offsets);
    Runs { offsets, run_len }
}

fn collect_range_runs(
    shape: &[usize],
    strides: &[usize],
    ranges: &[Option<Range<usize>>],
    axis: usize,
    base: usize,
    out: &mut Vec<usize>,
) {
    if axis == ranges.len() {
        out.push(base);
        return;
    }
    let range = ranges[axis].clone().unwrap_or(0..shape[axis]);
    for i in range {
        collect_range_runs(shape, strides, ranges, axis + 1, base + i * strides[axis], out);
    }
}
