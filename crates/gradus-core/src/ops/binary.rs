use crate::backend::{Backend, BinaryOp};
use crate::broadcast::broadcast_shape;
use crate::dtype::WithDType;
use crate::error::Result;
use crate::tensor::Tensor;

use super::grad_fn;

// Broadcasting binary operations
//
//   d(a + b) = ( g,        g)
//   d(a - b) = ( g,       -g)
//   d(a * b) = ( g * b,    g * a)
//   d(a / b) = ( g / b,   -(g * a) / b²)
//
// each summed back over the axes the operand was broadcast along.

impl<E: WithDType, B: Backend> Tensor<E, B> {
    fn binary_forward(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        let shape = broadcast_shape(self.shape(), rhs.shape())?;
        let out = Self::alloc(shape, self.device())?;
        B::binary_op(
            op,
            self.buffer(),
            self.shape(),
            rhs.buffer(),
            rhs.shape(),
            out.buffer(),
        )?;
        Ok(out)
    }

    fn tracks_with(&self, rhs: &Self) -> bool {
        self.requires_grad() || rhs.requires_grad()
    }

    pub fn add(&self, rhs: &Self) -> Result<Self> {
        let out = self.binary_forward(rhs, BinaryOp::Add)?;
        if !self.tracks_with(rhs) {
            return Ok(out);
        }
        let (ls, rs) = (self.shape().clone(), rhs.shape().clone());
        Ok(out.with_context(
            "add",
            vec![self.clone(), rhs.clone()],
            vec![
                grad_fn(move |g| g.sum_to_shape(&ls)),
                grad_fn(move |g| g.sum_to_shape(&rs)),
            ],
        ))
    }

    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        let out = self.binary_forward(rhs, BinaryOp::Sub)?;
        if !self.tracks_with(rhs) {
            return Ok(out);
        }
        let (ls, rs) = (self.shape().clone(), rhs.shape().clone());
        Ok(out.with_context(
            "sub",
            vec![self.clone(), rhs.clone()],
            vec![
                grad_fn(move |g| g.sum_to_shape(&ls)),
                grad_fn(move |g| g.neg()?.sum_to_shape(&rs)),
            ],
        ))
    }

    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        let out = self.binary_forward(rhs, BinaryOp::Mul)?;
        if !self.tracks_with(rhs) {
            return Ok(out);
        }
        let (a, b) = (self.clone(), rhs.clone());
        let (a2, b2) = (self.clone(), rhs.clone());
        Ok(out.with_context(
            "mul",
            vec![self.clone(), rhs.clone()],
            vec![
                grad_fn(move |g| g.mul(&b)?.sum_to_shape(a.shape())),
                grad_fn(move |g| g.mul(&a2)?.sum_to_shape(b2.shape())),
            ],
        ))
    }

    pub fn div(&self, rhs: &Self) -> Result<Self> {
        let out = self.binary_forward(rhs, BinaryOp::Div)?;
        if !self.tracks_with(rhs) {
            return Ok(out);
        }
        let (a, b) = (self.clone(), rhs.clone());
        let (a2, b2) = (self.clone(), rhs.clone());
        Ok(out.with_context(
            "div",
            vec![self.clone(), rhs.clone()],
            vec![
                grad_fn(move |g| g.div(&b)?.sum_to_shape(a.shape())),
                grad_fn(move |g| {
                    g.mul(&a2)?
                        .div(&b2.square()?)?
                        .neg()?
                        .sum_to_shape(b2.shape())
                }),
            ],
        ))
    }

    // Scalar forms: the scalar is a constant rank-0 operand.

    fn scalar_like(&self, value: E) -> Result<Self> {
        Self::scalar(value, self.device())
    }

    pub fn add_scalar(&self, value: E) -> Result<Self> {
        self.add(&self.scalar_like(value)?)
    }

    pub fn sub_scalar(&self, value: E) -> Result<Self> {
        self.sub(&self.scalar_like(value)?)
    }

    /// `value - self`
    pub fn rsub_scalar(&self, value: E) -> Result<Self> {
        self.scalar_like(value)?.sub(self)
    }

    pub fn mul_scalar(&self, value: E) -> Result<Self> {
        self.mul(&self.scalar_like(value)?)
    }

    pub fn div_scalar(&self, value: E) -> Result<Self> {
        self.div(&self.scalar_like(value)?)
    }
}
