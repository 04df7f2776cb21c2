use crate::backend::Backend;
use crate::broadcast::broadcast_shape;
use crate::dtype::WithDType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

use super::grad_fn;

// Matrix multiplication
//
//   C = op(A) @ op(B),  op(X) = Xᵀ when the transpose flag is set
//
// Operands have rank 2 or more; the transpose applies to the last two axes
// and the axes before them are batch axes. Batch axes broadcast like
// elementwise operands: a mismatched operand is first expanded by adding
// zeros of the full shape, so its gradient sums back through that add.
// With equal batch axes, gradients follow from
// dop(A) = dC @ op(B)ᵀ and dop(B) = op(A)ᵀ @ dC, rearranged so that every
// gradient comes out in the stored (untransposed) layout:
//
//   dA = !ta: dC @ op(B)ᵀ          ta: op(B) @ dCᵀ
//   dB = !tb: op(A)ᵀ @ dC          tb: dCᵀ @ op(A)

/// `(rows, cols)` of `op(X)` for a stored shape.
fn op_dims(shape: &Shape, transpose: bool) -> (usize, usize) {
    let d = shape.dims();
    let (r, c) = (d[d.len() - 2], d[d.len() - 1]);
    if transpose {
        (c, r)
    } else {
        (r, c)
    }
}

impl<E: WithDType, B: Backend> Tensor<E, B> {
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        self.matmul_with(rhs, false, false)
    }

    /// `op(self) @ op(rhs)` with per-operand transpose flags.
    pub fn matmul_with(
        &self,
        rhs: &Self,
        transpose_lhs: bool,
        transpose_rhs: bool,
    ) -> Result<Self> {
        for operand in [self, rhs] {
            if operand.rank() < 2 {
                return Err(Error::RankMismatch {
                    expected: 2,
                    got: operand.rank(),
                });
            }
        }
        let (m, k1) = op_dims(self.shape(), transpose_lhs);
        let (k2, n) = op_dims(rhs.shape(), transpose_rhs);
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }

        let lhs_batch = Shape::from(&self.dims()[..self.rank() - 2]);
        let rhs_batch = Shape::from(&rhs.dims()[..rhs.rank() - 2]);
        if lhs_batch != rhs_batch {
            let batch = broadcast_shape(&lhs_batch, &rhs_batch)?;
            log::trace!(
                "matmul broadcasts {} and {} to batch {}",
                self.shape(),
                rhs.shape(),
                batch
            );
            let lhs = self.broadcast_batch(&batch)?;
            let rhs = rhs.broadcast_batch(&batch)?;
            return lhs.matmul_with(&rhs, transpose_lhs, transpose_rhs);
        }

        let mut out_dims = lhs_batch.to_vec();
        out_dims.extend([m, n]);
        let out_shape = Shape::new(out_dims);
        let out = Self::alloc(out_shape, self.device())?;
        B::gemm(
            self.buffer(),
            self.shape(),
            rhs.buffer(),
            rhs.shape(),
            out.buffer(),
            E::one(),
            E::zero(),
            transpose_lhs,
            transpose_rhs,
        )?;

        if !(self.requires_grad() || rhs.requires_grad()) {
            return Ok(out);
        }
        let (ta, tb) = (transpose_lhs, transpose_rhs);
        let (a, b) = (self.clone(), rhs.clone());
        Ok(out.with_context(
            "matmul",
            vec![self.clone(), rhs.clone()],
            vec![
                grad_fn(move |g| {
                    if ta {
                        b.matmul_with(g, tb, true)
                    } else {
                        g.matmul_with(&b, false, !tb)
                    }
                }),
                grad_fn(move |g| {
                    if tb {
                        g.matmul_with(&a, true, ta)
                    } else {
                        a.matmul_with(g, !ta, false)
                    }
                }),
            ],
        ))
    }

    /// Expand the axes before the last two to `batch`.
    fn broadcast_batch(&self, batch: &Shape) -> Result<Self> {
        let mut dims = batch.to_vec();
        dims.extend_from_slice(&self.dims()[self.rank() - 2..]);
        let target = Shape::new(dims);
        if &target == self.shape() {
            return Ok(self.clone());
        }
        self.add(&Self::zeros(target, self.device())?)
    }
}
