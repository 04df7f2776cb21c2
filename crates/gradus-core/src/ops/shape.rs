use crate::backend::Backend;
use crate::context::TensorContext;
use crate::dtype::WithDType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

use super::{backward_fn, grad_fn};

// Shape-changing operations
//
//   reshape / view   share the buffer under a new shape; g is reshaped back
//   permute          result axis i is source axis perm[i]; g is permuted by
//                    the inverse, added straight into the accumulator
//   reversed         reverses axis 0; its own backward
//   band_matrix      keeps a diagonal band; its own backward

/// Inverse of a permutation: `inv[perm[i]] = i`.
fn inverse_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inv[p] = i;
    }
    inv
}

fn check_permutation(perm: &[usize], rank: usize) -> Result<()> {
    let mut seen = vec![false; rank];
    let valid = perm.len() == rank
        && perm.iter().all(|&p| {
            if p >= rank || seen[p] {
                return false;
            }
            seen[p] = true;
            true
        });
    if !valid {
        return Err(Error::InvalidPermutation {
            perm: perm.to_vec(),
            rank,
        });
    }
    Ok(())
}

impl<E: WithDType, B: Backend> Tensor<E, B> {
    /// Reinterpret the elements under `shape`. Shares the buffer.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: shape.elem_count(),
                dst_shape: shape,
            });
        }
        let out = self.share_with_shape(shape);
        if !self.requires_grad() {
            return Ok(out);
        }
        let source_shape = self.shape().clone();
        Ok(out.with_context(
            "reshape",
            vec![self.clone()],
            vec![grad_fn(move |g| g.reshape(source_shape.clone()))],
        ))
    }

    /// Reshape where one entry may be `-1`, inferred from the element count.
    pub fn view(&self, dims: &[isize]) -> Result<Self> {
        let mut inferred = None;
        let mut known = 1usize;
        for (axis, &d) in dims.iter().enumerate() {
            match d {
                -1 if inferred.is_none() => inferred = Some(axis),
                d if d >= 0 => known *= d as usize,
                _ => crate::bail!("invalid view dimensions {:?}", dims),
            }
        }
        let mut shape: Vec<usize> = dims.iter().map(|&d| d.max(0) as usize).collect();
        if let Some(axis) = inferred {
            if known == 0 || self.elem_count() % known != 0 {
                crate::bail!("cannot view {} as {:?}", self.shape(), dims);
            }
            shape[axis] = self.elem_count() / known;
        }
        self.reshape(shape)
    }

    /// Remove `axis`, which must have size 1.
    pub fn squeeze(&self, axis: usize) -> Result<Self> {
        let size = self.shape().dim(axis)?;
        if size != 1 {
            crate::bail!("cannot squeeze axis {} of size {}", axis, size);
        }
        let mut dims = self.shape().to_vec();
        dims.remove(axis);
        self.reshape(dims)
    }

    /// Insert an axis of size 1 at `axis`.
    pub fn unsqueeze(&self, axis: usize) -> Result<Self> {
        self.reshape(self.shape().inserted(axis, 1)?)
    }

    /// Rank-1 reshape.
    pub fn flatten(&self) -> Result<Self> {
        self.reshape(self.elem_count())
    }

    /// Reorder axes: result axis `i` is this tensor's axis `perm[i]`.
    pub fn permute(&self, perm: &[usize]) -> Result<Self> {
        check_permutation(perm, self.rank())?;
        let dims: Vec<usize> = perm.iter().map(|&p| self.dims()[p]).collect();
        let out = Self::alloc(Shape::new(dims), self.device())?;
        B::permute_axes(self.buffer(), self.shape(), perm, out.buffer())?;
        if !self.requires_grad() {
            return Ok(out);
        }
        let inverse = inverse_permutation(perm);
        let backward = backward_fn(move |g: &Self, acc: Option<&Self>| match acc {
            Some(acc) => g.permuted_onto(&inverse, acc),
            None => g.permute(&inverse),
        });
        Ok(out.with_prepared_context(TensorContext::accumulating(
            format!("permute{:?}", perm),
            vec![self.clone()],
            vec![backward],
        )))
    }

    /// `add + permute(self, perm)` as a new tensor.
    fn permuted_onto(&self, perm: &[usize], add: &Self) -> Result<Self> {
        check_permutation(perm, self.rank())?;
        if self.requires_grad() || add.requires_grad() {
            return add.add(&self.permute(perm)?);
        }
        let dims: Vec<usize> = perm.iter().map(|&p| self.dims()[p]).collect();
        if add.dims() != dims.as_slice() {
            return Err(Error::ShapeMismatch {
                expected: Shape::new(dims),
                got: add.shape().clone(),
            });
        }
        let out = Self::alloc(add.shape().clone(), self.device())?;
        B::permute_axes_add(self.buffer(), self.shape(), perm, add.buffer(), out.buffer())?;
        Ok(out)
    }

    /// In place: `self += permute(other, perm)`.
    pub fn add_permuted(&mut self, other: &Self, perm: &[usize]) -> Result<()> {
        check_permutation(perm, other.rank())?;
        let dims: Vec<usize> = perm.iter().map(|&p| other.dims()[p]).collect();
        if self.dims() != dims.as_slice() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: Shape::new(dims),
            });
        }
        if self.requires_grad() || other.requires_grad() {
            *self = self.add(&other.permute(perm)?)?;
            return Ok(());
        }
        self.ensure_ownership()?;
        B::permute_axes_add(
            other.buffer(),
            other.shape(),
            perm,
            self.buffer(),
            self.buffer(),
        )?;
        self.replace_node(None);
        Ok(())
    }

    /// Swap the last two axes.
    pub fn transposed(&self) -> Result<Self> {
        let rank = self.rank();
        if rank < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: rank,
            });
        }
        let mut perm: Vec<usize> = (0..rank).collect();
        perm.swap(rank - 2, rank - 1);
        self.permute(&perm)
    }

    /// Reverse the order of the entries along axis 0.
    pub fn reversed(&self) -> Result<Self> {
        if self.rank() == 0 {
            return Ok(self.clone());
        }
        let out = Self::alloc(self.shape().clone(), self.device())?;
        B::reverse(self.buffer(), self.shape(), out.buffer())?;
        if !self.requires_grad() {
            return Ok(out);
        }
        Ok(out.with_context(
            "reversed",
            vec![self.clone()],
            vec![grad_fn(|g| g.reversed())],
        ))
    }

    /// Keep the band of a matrix from `below` diagonals under to `above`
    /// diagonals over the main one (`None` keeps everything on that side);
    /// zero the rest.
    pub fn band_matrix(&self, below: Option<usize>, above: Option<usize>) -> Result<Self> {
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        let out = Self::zeros(self.shape().clone(), self.device())?;
        B::band(self.buffer(), self.shape(), out.buffer(), below, above)?;
        if !self.requires_grad() {
            return Ok(out);
        }
        Ok(out.with_context(
            "band",
            vec![self.clone()],
            vec![grad_fn(move |g| g.band_matrix(below, above))],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverse_permutation() {
        assert_eq!(inverse_permutation(&[1, 2, 0]), vec![2, 0, 1]);
        assert_eq!(inverse_permutation(&[0, 1]), vec![0, 1]);
        let perm = [2, 0, 3, 1];
        let inv = inverse_permutation(&perm);
        for i in 0..perm.len() {
            assert_eq!(perm[inv[i]], i);
        }
    }

    #[test]
    fn test_check_permutation() {
        assert!(check_permutation(&[1, 0], 2).is_ok());
        assert!(check_permutation(&[0, 0], 2).is_err());
        assert!(check_permutation(&[0, 2], 2).is_err());
        assert!(check_permutation(&[0], 2).is_err());
    }
}
