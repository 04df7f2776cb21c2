use std::fmt;
use std::ops::Range;

use crate::dtype::WithDType;
use crate::error::{Error, Result};
use crate::shape::Shape;

// Backend: memory and compute abstraction over devices
//
// A backend supplies two capability sets, both as static functions on one
// trait so that `Tensor<E, B>` can dispatch without carrying a backend value:
//
//   Memory  allocate / free / copy / read / slice buffers of any element type
//   Engine  elementwise, broadcasting, reduction, gemm, permutation, stacking
//           and im2col kernels
//
// Engine functions never infer shapes. The tensor layer computes the result
// shape, allocates the output buffer and hands it in together with the input
// shapes; the backend only fills it.
//
// Buffers are typed by a generic associated type, so one backend serves f32
// values and i32 argmax contexts alike.

/// Identifies a compute device.
pub trait BackendDevice: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    /// A human-readable name for this device (e.g., "cpu").
    fn name(&self) -> String;
}

/// A typed region of device memory.
///
/// Cloning a buffer handle does not copy memory; the clone addresses the
/// same elements. Ownership (and therefore freeing) is tracked one level up
/// by the tensor handle.
pub trait BackendBuffer<E: WithDType>: Clone + fmt::Debug + Send + Sync + 'static {
    /// Number of elements addressable through this handle.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn apply<E: WithDType>(self, a: E, b: E) -> E {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Exp,
    Log,
    Sqrt,
    Square,
    Tanh,
    Relu,
    Heaviside,
    Sigmoid,
    Sin,
    Cos,
}

impl UnaryOp {
    pub fn apply<E: WithDType>(self, x: E) -> E {
        match self {
            UnaryOp::Neg => E::zero() - x,
            UnaryOp::Square => x * x,
            UnaryOp::Relu => {
                if x > E::zero() {
                    x
                } else {
                    E::zero()
                }
            }
            UnaryOp::Heaviside => {
                if x > E::zero() {
                    E::one()
                } else {
                    E::zero()
                }
            }
            UnaryOp::Exp => via_f64(x, f64::exp),
            UnaryOp::Log => via_f64(x, f64::ln),
            UnaryOp::Sqrt => via_f64(x, f64::sqrt),
            UnaryOp::Tanh => via_f64(x, f64::tanh),
            UnaryOp::Sigmoid => via_f64(x, |v| 1.0 / (1.0 + (-v).exp())),
            UnaryOp::Sin => via_f64(x, f64::sin),
            UnaryOp::Cos => via_f64(x, f64::cos),
        }
    }
}

fn via_f64<E: WithDType>(x: E, f: impl Fn(f64) -> f64) -> E {
    E::from_f64(f(x.to_f64()))
}

/// Reduction operations along a set of axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
}

/// Parameters of an im2col / col2img transform on an NCHW image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Im2ColParams {
    pub kernel_height: usize,
    pub kernel_width: usize,
    pub padding: usize,
    pub stride: usize,
}

impl Im2ColParams {
    /// Output spatial size (height, width) for an input of `height` x `width`.
    pub fn output_size(&self, height: usize, width: usize) -> Result<(usize, usize)> {
        let padded_h = height + 2 * self.padding;
        let padded_w = width + 2 * self.padding;
        if self.stride == 0 || padded_h < self.kernel_height || padded_w < self.kernel_width {
            return Err(Error::msg(format!(
                "kernel {}x{} with padding {} and stride {} does not fit a {}x{} image",
                self.kernel_height, self.kernel_width, self.padding, self.stride, height, width
            )));
        }
        Ok((
            (padded_h - self.kernel_height) / self.stride + 1,
            (padded_w - self.kernel_width) / self.stride + 1,
        ))
    }

    /// Column matrix shape for an NCHW `image` shape:
    /// `[channels * kh * kw, batch * out_h * out_w]`.
    pub fn matrix_shape(&self, image: &Shape) -> Result<Shape> {
        let dims = image.dims();
        if dims.len() != 4 {
            return Err(Error::RankMismatch {
                expected: 4,
                got: dims.len(),
            });
        }
        let (oh, ow) = self.output_size(dims[2], dims[3])?;
        Ok(Shape::from((
            dims[1] * self.kernel_height * self.kernel_width,
            dims[0] * oh * ow,
        )))
    }
}

/// Result of a slice read: the buffer, whether it is a fresh copy the caller
/// owns (`true`) or a view into the source (`false`), and its shape.
pub type SliceRead<B> = (B, bool, Shape);

/// The main Backend trait. Implementing it for a type makes that type a
/// complete device backend for gradus.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    /// The device type for this backend.
    type Device: BackendDevice;
    /// Buffer type for elements of type `E`.
    type Buffer<E: WithDType>: BackendBuffer<E>;

    /// Short name used in error messages.
    fn name() -> &'static str;

    //  Memory

    /// Allocate a buffer of `len` elements. Contents are unspecified.
    fn allocate<E: WithDType>(len: usize, device: &Self::Device) -> Result<Self::Buffer<E>>;

    /// Release the memory behind `buffer`. Called exactly once per owning
    /// handle; views are never freed.
    fn free<E: WithDType>(buffer: &Self::Buffer<E>);

    /// Copy host values into the start of `dst`.
    fn assign_from_slice<E: WithDType>(dst: &Self::Buffer<E>, src: &[E]) -> Result<()>;

    /// Copy `count` elements from `src` into `dst`.
    fn assign<E: WithDType>(dst: &Self::Buffer<E>, src: &Self::Buffer<E>, count: usize)
        -> Result<()>;

    /// Read the first `count` elements back to the host. Synchronises any
    /// pending device work first.
    fn read<E: WithDType>(buffer: &Self::Buffer<E>, count: usize) -> Result<Vec<E>>;

    /// Read the first element.
    fn get_value<E: WithDType>(buffer: &Self::Buffer<E>) -> Result<E>;

    /// A view starting `by` elements into `buffer`.
    fn advance<E: WithDType>(buffer: &Self::Buffer<E>, by: usize) -> Result<Self::Buffer<E>>;

    /// Index slice read (see `strided::plan_index_slice`): a view when the
    /// selection is contiguous, otherwise a gathered copy.
    fn get_slice<E: WithDType>(
        slice: &[Option<usize>],
        buffer: &Self::Buffer<E>,
        shape: &Shape,
    ) -> Result<SliceRead<Self::Buffer<E>>>;

    /// Range slice read. Always a copy.
    fn get_range_slice<E: WithDType>(
        slice: &[Option<Range<usize>>],
        buffer: &Self::Buffer<E>,
        shape: &Shape,
    ) -> Result<SliceRead<Self::Buffer<E>>>;

    /// Write `src` (shaped `src_shape`) into the index slice of `dst`.
    fn set_slice<E: WithDType>(
        slice: &[Option<usize>],
        dst: &Self::Buffer<E>,
        dst_shape: &Shape,
        src: &Self::Buffer<E>,
        src_shape: &Shape,
    ) -> Result<()>;

    /// Write `src` (shaped `src_shape`) into the range slice of `dst`.
    fn set_range_slice<E: WithDType>(
        slice: &[Option<Range<usize>>],
        dst: &Self::Buffer<E>,
        dst_shape: &Shape,
        src: &Self::Buffer<E>,
        src_shape: &Shape,
    ) -> Result<()>;

    //  Engine: elementwise

    /// Set the first `count` elements of `result` to `value`.
    fn fill<E: WithDType>(value: E, result: &Self::Buffer<E>, count: usize) -> Result<()>;

    /// `result[i] = op(values[i])` for `i < count`.
    fn unary_op<E: WithDType>(
        op: UnaryOp,
        values: &Self::Buffer<E>,
        result: &Self::Buffer<E>,
        count: usize,
    ) -> Result<()>;

    /// Broadcasting binary op; `result` is shaped like the broadcast of both inputs.
    fn binary_op<E: WithDType>(
        op: BinaryOp,
        lhs: &Self::Buffer<E>,
        lhs_shape: &Shape,
        rhs: &Self::Buffer<E>,
        rhs_shape: &Shape,
        result: &Self::Buffer<E>,
    ) -> Result<()>;

    //  Engine: reductions

    /// Reduce `values` along `axes` (strictly increasing) into `result`,
    /// shaped like `shape` without those axes. For Max/Min, `context`
    /// receives the row-major offset of the selected element inside the
    /// reduced sub-block; ties go to the first occurrence.
    fn reduce_op<E: WithDType>(
        op: ReduceOp,
        values: &Self::Buffer<E>,
        shape: &Shape,
        axes: &[usize],
        result: &Self::Buffer<E>,
        context: Option<&Self::Buffer<i32>>,
    ) -> Result<()>;

    /// Inverse of a Max/Min reduction: writes each reduced value back to the
    /// position named by `context` and zero elsewhere. `shape` is the full
    /// (unreduced) shape of `result`.
    fn expand_context<E: WithDType>(
        reduced: &Self::Buffer<E>,
        context: &Self::Buffer<i32>,
        result: &Self::Buffer<E>,
        shape: &Shape,
        axes: &[usize],
    ) -> Result<()>;

    /// `result[.., j, ..] = expanded[.., context[.., ..], ..]` along `axis`.
    /// Positions whose context equals `ignore_index` read as zero.
    fn gather<E: WithDType>(
        _expanded: &Self::Buffer<E>,
        _expanded_shape: &Shape,
        _context: &Self::Buffer<i32>,
        _result: &Self::Buffer<E>,
        _axis: usize,
        _ignore_index: i32,
    ) -> Result<()> {
        Err(Error::Unsupported {
            op: "gather",
            backend: Self::name().to_string(),
        })
    }

    /// Inverse of `gather`: `result` (shaped `result_shape`) is zero except at
    /// the positions named by `context` along `axis`.
    fn scatter<E: WithDType>(
        _reduced: &Self::Buffer<E>,
        _context: &Self::Buffer<i32>,
        _result: &Self::Buffer<E>,
        _result_shape: &Shape,
        _axis: usize,
        _ignore_index: i32,
    ) -> Result<()> {
        Err(Error::Unsupported {
            op: "scatter",
            backend: Self::name().to_string(),
        })
    }

    //  Engine: linear algebra and data movement

    /// `result = alpha * op(lhs) @ op(rhs) + beta * result`, where `op`
    /// transposes the last two axes when the flag is set. Shapes are the
    /// stored (untransposed) shapes of rank 2 or more, with equal leading
    /// (batch) axes.
    #[allow(clippy::too_many_arguments)]
    fn gemm<E: WithDType>(
        lhs: &Self::Buffer<E>,
        lhs_shape: &Shape,
        rhs: &Self::Buffer<E>,
        rhs_shape: &Shape,
        result: &Self::Buffer<E>,
        alpha: E,
        beta: E,
        transpose_lhs: bool,
        transpose_rhs: bool,
    ) -> Result<()>;

    /// `result` axis `i` is `values` axis `perm[i]`.
    fn permute_axes<E: WithDType>(
        values: &Self::Buffer<E>,
        shape: &Shape,
        perm: &[usize],
        result: &Self::Buffer<E>,
    ) -> Result<()>;

    /// `result = add + permute(values, perm)`. `add` and `result` may be the
    /// same buffer.
    fn permute_axes_add<E: WithDType>(
        values: &Self::Buffer<E>,
        shape: &Shape,
        perm: &[usize],
        add: &Self::Buffer<E>,
        result: &Self::Buffer<E>,
    ) -> Result<()>;

    /// Concatenate `buffers` along `axis` into `result`.
    fn stack<E: WithDType>(
        buffers: &[(&Self::Buffer<E>, &Shape)],
        axis: usize,
        result: &Self::Buffer<E>,
    ) -> Result<()>;

    /// Split `stacked` along `axis` into `results` (the inverse of `stack`).
    fn unstack<E: WithDType>(
        stacked: &Self::Buffer<E>,
        shape: &Shape,
        axis: usize,
        results: &[(&Self::Buffer<E>, &Shape)],
    ) -> Result<()>;

    /// `result[i] = start + i * step` for `i < count`.
    fn arange<E: WithDType>(start: E, step: E, result: &Self::Buffer<E>, count: usize)
        -> Result<()>;

    /// Reverse the order of the sub-blocks along axis 0.
    fn reverse<E: WithDType>(
        _values: &Self::Buffer<E>,
        _shape: &Shape,
        _result: &Self::Buffer<E>,
    ) -> Result<()> {
        Err(Error::Unsupported {
            op: "reverse",
            backend: Self::name().to_string(),
        })
    }

    /// Copy the band of a matrix (`below` diagonals under, `above` over the
    /// main diagonal, `None` meaning all); `result` must be zero-filled.
    fn band<E: WithDType>(
        _values: &Self::Buffer<E>,
        _shape: &Shape,
        _result: &Self::Buffer<E>,
        _below: Option<usize>,
        _above: Option<usize>,
    ) -> Result<()> {
        Err(Error::Unsupported {
            op: "band",
            backend: Self::name().to_string(),
        })
    }

    /// Unfold NCHW `image` patches into the columns of `result`.
    fn img2col<E: WithDType>(
        _image: &Self::Buffer<E>,
        _image_shape: &Shape,
        _result: &Self::Buffer<E>,
        _params: Im2ColParams,
    ) -> Result<()> {
        Err(Error::Unsupported {
            op: "img2col",
            backend: Self::name().to_string(),
        })
    }

    /// Fold columns back into an NCHW image, summing overlapping patches.
    fn col2img<E: WithDType>(
        _matrix: &Self::Buffer<E>,
        _result: &Self::Buffer<E>,
        _image_shape: &Shape,
        _params: Im2ColParams,
    ) -> Result<()> {
        Err(Error::Unsupported {
            op: "col2img",
            backend: Self::name().to_string(),
        })
    }
}
