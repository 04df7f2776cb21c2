use crate::backend::{Backend, Im2ColParams};
use crate::dtype::WithDType;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

use super::grad_fn;

/// Parameters for one row of `kernel` taps, used by the 1d operators.
fn line_params(kernel: usize, stride: usize) -> Im2ColParams {
    Im2ColParams {
        kernel_height: 1,
        kernel_width: kernel,
        padding: 0,
        stride,
    }
}

/// Filters must have the input's rank and its channel count on axis 1.
fn check_filters(input: &Shape, filters: &Shape) -> Result<()> {
    if filters.rank() != input.rank() {
        return Err(Error::RankMismatch {
            expected: input.rank(),
            got: filters.rank(),
        });
    }
    if filters.dims()[1] != input.dims()[1] {
        crate::bail!(
            "filters {} do not match the {} channels of input {}",
            filters,
            input.dims()[1],
            input
        );
    }
    Ok(())
}

fn check_rank(shape: &Shape, rank: usize) -> Result<()> {
    if shape.rank() != rank {
        return Err(Error::RankMismatch {
            expected: rank,
            got: shape.rank(),
        });
    }
    Ok(())
}

// Patch unfolding for convolutions
//
//   img2col  [batch, channels, h, w] -> [channels * kh * kw, batch * oh * ow]
//   col2img  the reverse, summing where patches overlap
//
// Column (b, y, x) of the matrix holds the kh x kw x channels patch whose
// top-left corner sits at (y * stride - padding, x * stride - padding);
// positions outside the image read as zero. A convolution is then a single
// matmul of the reshaped filters against this matrix.
//
//   img2col1d / col2img1d   the same on [batch, channels, n], as images of
//                           height 1 with the padding applied up front
//   convolved2d / 1d        filters [oc, c, kh, kw] or [oc, c, k]
//   transposed_convolved2d  adjoint of convolved2d: matmul, then col2img
//   max / average pooled    channels folded into the batch, one column per
//                           window, reduced along the window axis
//
// None of the composite operators carries its own context; gradients come
// from the primitives they are built on.

impl<E: WithDType, B: Backend> Tensor<E, B> {
    /// Unfold the patches of this NCHW image into matrix columns.
    pub fn img2col(&self, params: Im2ColParams) -> Result<Self> {
        let matrix_shape = params.matrix_shape(self.shape())?;
        let out = Self::alloc(matrix_shape, self.device())?;
        B::img2col(self.buffer(), self.shape(), out.buffer(), params)?;
        if !self.requires_grad() {
            return Ok(out);
        }
        let image_shape = self.shape().clone();
        Ok(out.with_context(
            "img2col",
            vec![self.clone()],
            vec![grad_fn(move |g| g.col2img(image_shape.clone(), params))],
        ))
    }

    /// Fold matrix columns back into an NCHW image of `image_shape`.
    pub fn col2img(&self, image_shape: impl Into<Shape>, params: Im2ColParams) -> Result<Self> {
        let image_shape = image_shape.into();
        let expected = params.matrix_shape(&image_shape)?;
        if self.shape() != &expected {
            return Err(Error::ShapeMismatch {
                expected,
                got: self.shape().clone(),
            });
        }
        let out = Self::alloc(image_shape.clone(), self.device())?;
        B::col2img(self.buffer(), out.buffer(), &image_shape, params)?;
        if !self.requires_grad() {
            return Ok(out);
        }
        Ok(out.with_context(
            "col2img",
            vec![self.clone()],
            vec![grad_fn(move |g| g.img2col(params))],
        ))
    }

    /// Unfold the windows of a `[batch, channels, n]` signal into columns
    /// of a `[channels * kernel, batch * out]` matrix.
    pub fn img2col1d(&self, kernel: usize, padding: usize, stride: usize) -> Result<Self> {
        check_rank(self.shape(), 3)?;
        let padded = if padding == 0 {
            self.clone()
        } else {
            self.padded(E::zero(), &[(0, 0), (0, 0), (padding, padding)])?
        };
        let d = padded.dims();
        padded
            .reshape((d[0], d[1], 1, d[2]))?
            .img2col(line_params(kernel, stride))
    }

    /// Fold columns back into a `[batch, channels, n]` signal of `shape`.
    pub fn col2img1d(
        &self,
        kernel: usize,
        padding: usize,
        stride: usize,
        shape: impl Into<Shape>,
    ) -> Result<Self> {
        let shape = shape.into();
        check_rank(&shape, 3)?;
        let (b, c, n) = (shape.dims()[0], shape.dims()[1], shape.dims()[2]);
        let line = self
            .col2img((b, c, 1, n + 2 * padding), line_params(kernel, stride))?
            .reshape((b, c, n + 2 * padding))?;
        if padding == 0 {
            return Ok(line);
        }
        line.slice(&[None, None, Some(padding..padding + n)])
    }

    /// 2d convolution of `[b, c, h, w]` with filters `[oc, c, kh, kw]`.
    /// `padding` defaults to `(kh - 1) / 2`.
    pub fn convolved2d(
        &self,
        filters: &Self,
        padding: Option<usize>,
        stride: usize,
    ) -> Result<Self> {
        check_rank(self.shape(), 4)?;
        check_filters(self.shape(), filters.shape())?;
        let f = filters.dims();
        let (oc, kh, kw) = (f[0], f[2], f[3]);
        let params = Im2ColParams {
            kernel_height: kh,
            kernel_width: kw,
            padding: padding.unwrap_or(kh.saturating_sub(1) / 2),
            stride,
        };
        let (oh, ow) = params.output_size(self.dims()[2], self.dims()[3])?;
        let cols = self.img2col(params)?;
        filters
            .reshape((oc, f[1] * kh * kw))?
            .matmul(&cols)?
            .reshape((oc, self.dims()[0], oh, ow))?
            .permute(&[1, 0, 2, 3])
    }

    /// 1d convolution of `[b, c, n]` with filters `[oc, c, k]`.
    /// `padding` defaults to `(k - 1) / 2`.
    pub fn convolved1d(
        &self,
        filters: &Self,
        padding: Option<usize>,
        stride: usize,
    ) -> Result<Self> {
        check_rank(self.shape(), 3)?;
        check_filters(self.shape(), filters.shape())?;
        let f = filters.dims();
        let (oc, k) = (f[0], f[2]);
        let padding = padding.unwrap_or(k.saturating_sub(1) / 2);
        let (_, out) = line_params(k, stride).output_size(1, self.dims()[2] + 2 * padding)?;
        let cols = self.img2col1d(k, padding, stride)?;
        filters
            .reshape((oc, f[1] * k))?
            .matmul(&cols)?
            .reshape((oc, self.dims()[0], out))?
            .permute(&[1, 0, 2])
    }

    /// Transposed 2d convolution of `[b, c, h, w]` with filters
    /// `[oc, c, kh, kw]`, producing `[b, oc, (h - 1) * stride - 2 * inset + kh, ..]`.
    /// `inset` defaults to `(kh - 1) / 2`.
    pub fn transposed_convolved2d(
        &self,
        filters: &Self,
        inset: Option<usize>,
        stride: usize,
    ) -> Result<Self> {
        check_rank(self.shape(), 4)?;
        check_filters(self.shape(), filters.shape())?;
        if stride == 0 {
            crate::bail!("transposed convolution needs a positive stride");
        }
        let f = filters.dims();
        let (oc, c, kh, kw) = (f[0], f[1], f[2], f[3]);
        let d = self.dims();
        let (b, h, w) = (d[0], d[2], d[3]);
        let inset = inset.unwrap_or(kh.saturating_sub(1) / 2);
        let full_h = h.saturating_sub(1) * stride + kh;
        let full_w = w.saturating_sub(1) * stride + kw;
        if h == 0 || w == 0 || full_h <= 2 * inset || full_w <= 2 * inset {
            crate::bail!(
                "inset {} leaves no output for input {} and filters {}",
                inset,
                self.shape(),
                filters.shape()
            );
        }
        let params = Im2ColParams {
            kernel_height: kh,
            kernel_width: kw,
            padding: inset,
            stride,
        };
        let columns = filters
            .permute(&[0, 2, 3, 1])?
            .reshape((oc * kh * kw, c))?
            .matmul(&self.permute(&[1, 0, 2, 3])?.reshape((c, b * h * w))?)?;
        columns.col2img((b, oc, full_h - 2 * inset, full_w - 2 * inset), params)
    }

    /// Largest value of every `window` x `window` patch, per channel.
    /// `padding` defaults to `(window - 1) / 2` and `stride` to `window`.
    pub fn max_pooled2d(
        &self,
        window: usize,
        padding: Option<usize>,
        stride: Option<usize>,
    ) -> Result<Self> {
        self.pooled2d(window, padding, stride, |cols| cols.reduce_max(&[0]))
    }

    /// Mean of every `window` x `window` patch, per channel.
    /// `padding` defaults to `(window - 1) / 2` and `stride` to `window`.
    pub fn average_pooled2d(
        &self,
        window: usize,
        padding: Option<usize>,
        stride: Option<usize>,
    ) -> Result<Self> {
        self.pooled2d(window, padding, stride, |cols| cols.reduce_mean(&[0]))
    }

    fn pooled2d(
        &self,
        window: usize,
        padding: Option<usize>,
        stride: Option<usize>,
        reduce: impl Fn(&Self) -> Result<Self>,
    ) -> Result<Self> {
        check_rank(self.shape(), 4)?;
        let params = Im2ColParams {
            kernel_height: window,
            kernel_width: window,
            padding: padding.unwrap_or(window.saturating_sub(1) / 2),
            stride: stride.unwrap_or(window),
        };
        let d = self.dims();
        let (b, c, h, w) = (d[0], d[1], d[2], d[3]);
        let (oh, ow) = params.output_size(h, w)?;
        let cols = self.reshape((b * c, 1, h, w))?.img2col(params)?;
        reduce(&cols)?.reshape((b, c, oh, ow))
    }
}
