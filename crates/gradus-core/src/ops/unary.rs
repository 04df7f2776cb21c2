use crate::backend::{Backend, UnaryOp};
use crate::dtype::WithDType;
use crate::error::Result;
use crate::tensor::Tensor;

use super::grad_fn;

// Element-wise unary operations
//
//   neg        -g
//   exp        g * exp(x)
//   log        g / x
//   sqrt       g / (2 * sqrt(x))
//   square     g * 2x
//   tanh       g * (1 - tanh²(x))
//   relu       g * heaviside(x)
//   heaviside  0
//   sigmoid    g * s * (1 - s),  s = sigmoid(x)
//   sin        g * cos(x)
//   cos        -g * sin(x)
//
// Derivatives recompute what they need from the source instead of holding
// on to the result, which would make the result reference itself.
// leaky_relu, raised_to and softmax are compositions of the above.

impl<E: WithDType, B: Backend> Tensor<E, B> {
    fn unary_forward(&self, op: UnaryOp) -> Result<Self> {
        let out = Self::alloc(self.shape().clone(), self.device())?;
        B::unary_op(op, self.buffer(), out.buffer(), self.elem_count())?;
        Ok(out)
    }

    /// Forward `op`, attaching `derivative(x, g)` when tracked.
    fn unary<F>(&self, op: UnaryOp, tag: &'static str, derivative: F) -> Result<Self>
    where
        F: Fn(&Self, &Self) -> Result<Self> + Send + Sync + 'static,
    {
        let out = self.unary_forward(op)?;
        if !self.requires_grad() {
            return Ok(out);
        }
        let x = self.clone();
        Ok(out.with_context(
            tag,
            vec![self.clone()],
            vec![grad_fn(move |g| derivative(&x, g))],
        ))
    }

    pub fn neg(&self) -> Result<Self> {
        self.unary(UnaryOp::Neg, "neg", |_, g| g.neg())
    }

    pub fn exp(&self) -> Result<Self> {
        self.unary(UnaryOp::Exp, "exp", |x, g| g.mul(&x.exp()?))
    }

    pub fn log(&self) -> Result<Self> {
        self.unary(UnaryOp::Log, "log", |x, g| g.div(x))
    }

    pub fn sqrt(&self) -> Result<Self> {
        self.unary(UnaryOp::Sqrt, "sqrt", |x, g| {
            g.div(&x.sqrt()?.mul_scalar(E::from_f64(2.0))?)
        })
    }

    pub fn square(&self) -> Result<Self> {
        self.unary(UnaryOp::Square, "square", |x, g| {
            g.mul(&x.mul_scalar(E::from_f64(2.0))?)
        })
    }

    pub fn tanh(&self) -> Result<Self> {
        self.unary(UnaryOp::Tanh, "tanh", |x, g| {
            g.mul(&x.tanh()?.square()?.rsub_scalar(E::one())?)
        })
    }

    pub fn relu(&self) -> Result<Self> {
        self.unary(UnaryOp::Relu, "relu", |x, g| g.mul(&x.heaviside()?))
    }

    /// Step function: 1 where `x > 0`, else 0.
    pub fn heaviside(&self) -> Result<Self> {
        self.unary(UnaryOp::Heaviside, "heaviside", |x, _| Self::zeros_like(x))
    }

    pub fn sigmoid(&self) -> Result<Self> {
        self.unary(UnaryOp::Sigmoid, "sigmoid", |x, g| {
            let s = x.sigmoid()?;
            g.mul(&s)?.mul(&s.rsub_scalar(E::one())?)
        })
    }

    pub fn sin(&self) -> Result<Self> {
        self.unary(UnaryOp::Sin, "sin", |x, g| g.mul(&x.cos()?))
    }

    pub fn cos(&self) -> Result<Self> {
        self.unary(UnaryOp::Cos, "cos", |x, g| g.mul(&x.sin()?)?.neg())
    }

    /// `x` for positive inputs, `leak * x` otherwise.
    pub fn leaky_relu(&self, leak: E) -> Result<Self> {
        self.relu()?.sub(&self.neg()?.relu()?.mul_scalar(leak)?)
    }

    /// Element-wise power `x^p`, computed as `exp(p * log(x))`; defined for
    /// positive `x`.
    pub fn raised_to(&self, power: E) -> Result<Self> {
        self.log()?.mul_scalar(power)?.exp()
    }

    /// Softmax along `axis`. The maximum along the axis is subtracted first
    /// for numerical stability; it is treated as a constant.
    pub fn softmax(&self, axis: usize) -> Result<Self> {
        let max = self.detached().reduce_max(&[axis])?.unsqueeze(axis)?;
        let e = self.sub(&max)?.exp()?;
        let total = e.reduce_sum(&[axis])?.unsqueeze(axis)?;
        e.div(&total)
    }
}
