use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::strided::{strides, unravel_index};

// Broadcasting resolver
//
// Shapes are right-aligned; the shorter one is padded with leading 1s. Two
// axis sizes are compatible iff they are equal or one of them is 1, and the
// output takes the larger one.
//
//   [3, 4] and [4]        → [3, 4]
//   [2, 1] and [1, 3]     → [2, 3]
//   [5, 3, 1] and [3, 4]  → [5, 3, 4]
//   [3] and [4]           → error
//
// Besides the output shape, a binary op needs a dispatch plan so that no
// operand is ever replicated in memory. The output is split into an outer
// loop over the leading axes and an inner, contiguous run of `slice_len`
// elements handled in one tight loop:
//
//   VectorVector  both operands have the same trailing block; the inner loop
//                 walks both in lock step.
//   ScalarVector  lhs is constant across the trailing block (all its trailing
//                 axes are 1); one lhs element against a run of rhs.
//   VectorScalar  the mirror image.
//
// Per outer position, an operand's offset clamps every axis index to
// `min(dim - 1, index)`, which pins broadcast (size 1) axes to 0.

/// Output shape of broadcasting `lhs` against `rhs`.
pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
    let l = lhs.dims();
    let r = rhs.dims();
    let rank = l.len().max(r.len());
    let mut result = Vec::with_capacity(rank);

    for i in 0..rank {
        // Index from the right; missing leading axes count as 1.
        let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
        let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };

        if ld == rd || rd == 1 {
            result.push(ld);
        } else if ld == 1 {
            result.push(rd);
        } else {
            return Err(Error::BroadcastMismatch {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
            });
        }
    }

    result.reverse();
    Ok(Shape::new(result))
}

/// Pad `shape` with leading 1s up to `rank`.
pub fn padded_dims(shape: &Shape, rank: usize) -> Vec<usize> {
    let mut dims = vec![1usize; rank.saturating_sub(shape.rank())];
    dims.extend_from_slice(shape.dims());
    dims
}

/// Inner-loop strategy of a broadcasting binary op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastMode {
    VectorVector,
    ScalarVector,
    VectorScalar,
}

/// Dispatch plan for one broadcasting binary op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastPlan {
    mode: BroadcastMode,
    lhs_dims: Vec<usize>,
    rhs_dims: Vec<usize>,
    lhs_strides: Vec<usize>,
    rhs_strides: Vec<usize>,
    out: Shape,
    outer_rank: usize,
    slice_len: usize,
}

impl BroadcastPlan {
    pub fn new(lhs: &Shape, rhs: &Shape) -> Result<Self> {
        let out = broadcast_shape(lhs, rhs)?;
        let rank = out.rank();
        let lhs_dims = padded_dims(lhs, rank);
        let rhs_dims = padded_dims(rhs, rank);

        // Longest trailing suffix where both operands agree exactly.
        let mut suffix_start = rank;
        while suffix_start > 0 && lhs_dims[suffix_start - 1] == rhs_dims[suffix_start - 1] {
            suffix_start -= 1;
        }
        let suffix_len: usize = lhs_dims[suffix_start..].iter().product();

        let (mode, outer_rank) = if suffix_len > 1 {
            (BroadcastMode::VectorVector, suffix_start)
        } else if let Some(axis) = (0..rank).rev().find(|&a| lhs_dims[a] != rhs_dims[a]) {
            let (mode, scalar_side) = if lhs_dims[axis] == 1 {
                (BroadcastMode::ScalarVector, &lhs_dims)
            } else {
                (BroadcastMode::VectorScalar, &rhs_dims)
            };
            let mut start = axis;
            while start > 0 && scalar_side[start - 1] == 1 {
                start -= 1;
            }
            (mode, start)
        } else {
            // Identical shapes of all-1 axes: plain elementwise.
            (BroadcastMode::VectorVector, suffix_start)
        };
        let slice_len = out.dims()[outer_rank..].iter().product();

        Ok(BroadcastPlan {
            mode,
            lhs_strides: strides(&lhs_dims),
            rhs_strides: strides(&rhs_dims),
            lhs_dims,
            rhs_dims,
            out,
            outer_rank,
            slice_len,
        })
    }

    pub fn mode(&self) -> BroadcastMode {
        self.mode
    }

    /// Broadcast output shape.
    pub fn out_shape(&self) -> &Shape {
        &self.out
    }

    /// Length of the contiguous inner run.
    pub fn slice_len(&self) -> usize {
        self.slice_len
    }

    /// Number of outer-loop iterations.
    pub fn outer_count(&self) -> usize {
        self.out.dims()[..self.outer_rank].iter().product()
    }

    /// Offsets of the lhs and rhs blocks for the `outer`-th outer iteration.
    /// The destination block always starts at `outer * slice_len`.
    pub fn operand_offsets(&self, outer: usize) -> (usize, usize) {
        let index = unravel_index(outer, &self.out.dims()[..self.outer_rank]);
        let mut lhs = 0;
        let mut rhs = 0;
        for (axis, &i) in index.iter().enumerate() {
            lhs += (self.lhs_dims[axis] - 1).min(i) * self.lhs_strides[axis];
            rhs += (self.rhs_dims[axis] - 1).min(i) * self.rhs_strides[axis];
        }
        (lhs, rhs)
    }
}

/// Axes along which a gradient of shape `grad` must be summed to get back to
/// `source`: every axis where the padded source has size 1 but `grad` does not.
pub fn reduced_axes(source: &Shape, grad: &Shape) -> Vec<usize> {
    let padded = padded_dims(source, grad.rank());
    padded
        .iter()
        .zip(grad.dims())
        .enumerate()
        .filter(|(_, (s, g))| **s == 1 && **g != 1)
        .map(|(axis, _)| axis)
        .collect()
}

/// Reduction axis list in canonical form: each axis checked against `rank`,
/// then sorted with duplicates dropped.
pub fn normalize_axes(axes: &[usize], rank: usize) -> Result<Vec<usize>> {
    if let Some(&axis) = axes.iter().find(|&&a| a >= rank) {
        return Err(Error::AxisOutOfRange { axis, rank });
    }
    let mut sorted = axes.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    Ok(sorted)
}

/// Shape with `axes` removed, as produced by a reduction along them.
pub fn remove_axes(shape: &Shape, axes: &[usize]) -> Result<Shape> {
    let axes = normalize_axes(axes, shape.rank())?;
    Ok(Shape::new(
        shape
            .dims()
            .iter()
            .enumerate()
            .filter(|(i, _)| !axes.contains(i))
            .map(|(_, &d)| d)
            .collect(),
    ))
}

/// Shape with `axes` set to 1, the keep-dim form of a reduction.
pub fn keep_axes(shape: &Shape, axes: &[usize]) -> Result<Shape> {
    let axes = normalize_axes(axes, shape.rank())?;
    let mut dims = shape.to_vec();
    for a in axes {
        dims[a] = 1;
    }
    Ok(Shape::new(dims))
}
