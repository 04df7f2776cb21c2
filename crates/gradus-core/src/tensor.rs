use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use rand::Rng;

use crate::backend::{Backend, BackendBuffer};
use crate::context::{ContributionFn, TensorContext, TensorId};
use crate::dtype::WithDType;
use crate::error::{Error, Result};
use crate::shape::Shape;

// Tensor: value, handle and graph node
//
//   Tensor<E, B>
//     handle         Arc<TensorHandle>   buffer + optional parent (views)
//     shape          Shape               row-major, [] for scalars
//     requires_grad  bool                track this value and its descendants
//     context        Option<Arc<..>>     set iff produced by a tracked op
//     id             TensorId            graph identity of this value
//
// MEMORY MODEL:
//
//   A TensorHandle owns its buffer iff it has no parent. Owning handles free
//   the buffer on drop; views hold a strong reference to their parent so the
//   parent memory outlives them.
//
//   Tensors are values. Cloning shares the handle (and keeps the id), so two
//   tensors may alias one buffer. Nothing writes into a buffer that might be
//   observed elsewhere: in-place writes go through `ensure_ownership`, which
//   copies the buffer first unless the handle is unique and not a view.
//
// GRAPH:
//
//   An operation attaches a context only when one of its operands requires
//   gradients, so every tensor reachable through `context.sources()` from a
//   tracked tensor is itself tracked.

/// Owner of one device buffer, or a view into a parent's buffer.
pub struct TensorHandle<E: WithDType, B: Backend> {
    buffer: B::Buffer<E>,
    parent: Option<Arc<TensorHandle<E, B>>>,
    device: B::Device,
}

impl<E: WithDType, B: Backend> TensorHandle<E, B> {
    fn owned(buffer: B::Buffer<E>, device: B::Device) -> Self {
        TensorHandle {
            buffer,
            parent: None,
            device,
        }
    }

    fn view(buffer: B::Buffer<E>, parent: Arc<TensorHandle<E, B>>) -> Self {
        let device = parent.device.clone();
        TensorHandle {
            buffer,
            parent: Some(parent),
            device,
        }
    }

    pub fn buffer(&self) -> &B::Buffer<E> {
        &self.buffer
    }

    pub fn is_view(&self) -> bool {
        self.parent.is_some()
    }
}

impl<E: WithDType, B: Backend> Drop for TensorHandle<E, B> {
    fn drop(&mut self) {
        if self.parent.is_none() {
            B::free(&self.buffer);
        }
    }
}

impl<E: WithDType, B: Backend> fmt::Debug for TensorHandle<E, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorHandle")
            .field("len", &self.buffer.len())
            .field("view", &self.is_view())
            .field("device", &self.device)
            .finish()
    }
}

/// An n-dimensional array on a backend, optionally tracked for gradients.
///
/// # Example
/// ```ignore
/// use gradus_core::Tensor;
/// use gradus_cpu::{CpuBackend, CpuDevice};
///
/// let a = Tensor::<f32, CpuBackend>::from_vec(vec![1.0, 2.0, 3.0], 3, &CpuDevice)?
///     .set_requires_grad(true);
/// let loss = a.mul(&a)?.reduce_sum_all()?;
/// let grads = loss.gradients(&[&a], false)?;
/// ```
pub struct Tensor<E: WithDType, B: Backend> {
    handle: Arc<TensorHandle<E, B>>,
    shape: Shape,
    requires_grad: bool,
    context: Option<Arc<TensorContext<E, B>>>,
    id: TensorId,
}

// Clone shares the handle and keeps the id: it is the same graph node.
impl<E: WithDType, B: Backend> Clone for Tensor<E, B> {
    fn clone(&self) -> Self {
        Tensor {
            handle: Arc::clone(&self.handle),
            shape: self.shape.clone(),
            requires_grad: self.requires_grad,
            context: self.context.clone(),
            id: self.id,
        }
    }
}

impl<E: WithDType, B: Backend> fmt::Debug for Tensor<E, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, dtype={}, requires_grad={}, op={})",
            self.id,
            self.shape,
            E::DTYPE,
            self.requires_grad,
            self.context.as_ref().map_or("leaf", |c| c.tag()),
        )
    }
}

impl<E: WithDType, B: Backend> Tensor<E, B> {
    // Internal constructors

    /// Wrap a freshly filled buffer that this tensor will own.
    pub(crate) fn from_buffer(buffer: B::Buffer<E>, shape: Shape, device: &B::Device) -> Self {
        Tensor {
            handle: Arc::new(TensorHandle::owned(buffer, device.clone())),
            shape,
            requires_grad: false,
            context: None,
            id: TensorId::new(),
        }
    }

    /// Wrap a buffer that points into this tensor's memory.
    pub(crate) fn view_buffer(&self, buffer: B::Buffer<E>, shape: Shape) -> Self {
        Tensor {
            handle: Arc::new(TensorHandle::view(buffer, Arc::clone(&self.handle))),
            shape,
            requires_grad: false,
            context: None,
            id: TensorId::new(),
        }
    }

    /// Same handle under a different shape. The element count must match.
    pub(crate) fn share_with_shape(&self, shape: Shape) -> Self {
        Tensor {
            handle: Arc::clone(&self.handle),
            shape,
            requires_grad: false,
            context: None,
            id: TensorId::new(),
        }
    }

    /// Allocate an uninitialised tensor for a backend kernel to fill.
    pub(crate) fn alloc(shape: Shape, device: &B::Device) -> Result<Self> {
        let buffer = B::allocate::<E>(shape.elem_count(), device)?;
        Ok(Self::from_buffer(buffer, shape, device))
    }

    /// Attach a context built from plain contribution functions.
    pub(crate) fn with_context(
        mut self,
        tag: impl Into<String>,
        sources: Vec<Tensor<E, B>>,
        contributions: Vec<ContributionFn<E, B>>,
    ) -> Self {
        self.requires_grad = true;
        self.context = Some(Arc::new(TensorContext::new(tag, sources, contributions)));
        self
    }

    /// Turn this tensor into a new graph node after an in-place write.
    pub(crate) fn replace_node(&mut self, context: Option<TensorContext<E, B>>) {
        self.id = TensorId::new();
        if let Some(context) = context {
            self.requires_grad = true;
            self.context = Some(Arc::new(context));
        }
    }

    /// Attach a prebuilt context.
    pub(crate) fn with_prepared_context(mut self, context: TensorContext<E, B>) -> Self {
        self.requires_grad = true;
        self.context = Some(Arc::new(context));
        self
    }

    // Accessors

    /// Graph identity of this value.
    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Shortcut for `shape().dims()`.
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    pub fn device(&self) -> &B::Device {
        &self.handle.device
    }

    pub fn buffer(&self) -> &B::Buffer<E> {
        &self.handle.buffer
    }

    pub fn handle(&self) -> &Arc<TensorHandle<E, B>> {
        &self.handle
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// The operation that produced this tensor, if it was tracked.
    pub fn context(&self) -> Option<&TensorContext<E, B>> {
        self.context.as_deref()
    }

    /// Whether this tensor reads another tensor's memory.
    pub fn is_view(&self) -> bool {
        self.handle.is_view()
    }

    /// Mark this tensor as a graph leaf whose gradient is tracked (or not).
    pub fn set_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    // Creation

    /// Create a tensor from a flat row-major vector.
    pub fn from_vec(data: Vec<E>, shape: impl Into<Shape>, device: &B::Device) -> Result<Self> {
        Self::from_slice(&data, shape, device)
    }

    /// Create a tensor from a flat row-major slice.
    pub fn from_slice(data: &[E], shape: impl Into<Shape>, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let t = Self::alloc(shape, device)?;
        B::assign_from_slice(t.buffer(), data)?;
        Ok(t)
    }

    /// Create a tensor from nested arrays, e.g. `[[1.0, 2.0], [3.0, 4.0]]`.
    pub fn new(values: impl NestedArray<E>, device: &B::Device) -> Result<Self> {
        let shape = Shape::new(values.nested_shape());
        let mut data = Vec::with_capacity(shape.elem_count());
        values.flatten_into(&mut data);
        Self::from_vec(data, shape, device)
    }

    /// A rank-0 tensor.
    pub fn scalar(value: E, device: &B::Device) -> Result<Self> {
        Self::full(value, (), device)
    }

    pub fn full(value: E, shape: impl Into<Shape>, device: &B::Device) -> Result<Self> {
        let t = Self::alloc(shape.into(), device)?;
        B::fill(value, t.buffer(), t.elem_count())?;
        Ok(t)
    }

    pub fn zeros(shape: impl Into<Shape>, device: &B::Device) -> Result<Self> {
        Self::full(E::zero(), shape, device)
    }

    pub fn ones(shape: impl Into<Shape>, device: &B::Device) -> Result<Self> {
        Self::full(E::one(), shape, device)
    }

    pub fn zeros_like(other: &Self) -> Result<Self> {
        Self::zeros(other.shape.clone(), other.device())
    }

    pub fn ones_like(other: &Self) -> Result<Self> {
        Self::ones(other.shape.clone(), other.device())
    }

    /// `[start, start + step, ...]` with `count` elements.
    pub fn arange(start: E, step: E, count: usize, device: &B::Device) -> Result<Self> {
        let t = Self::alloc(Shape::from(count), device)?;
        B::arange(start, step, t.buffer(), count)?;
        Ok(t)
    }

    /// Uniform samples from `range`, drawn from `rng`.
    pub fn rand_uniform_with_rng<R: Rng + ?Sized>(
        shape: impl Into<Shape>,
        range: Range<f64>,
        rng: &mut R,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if range.is_empty() {
            crate::bail!("empty sampling range {:?}", range);
        }
        let data: Vec<E> = (0..shape.elem_count())
            .map(|_| E::from_f64(rng.gen_range(range.clone())))
            .collect();
        Self::from_vec(data, shape, device)
    }

    /// Uniform samples from `range` using the thread-local generator.
    pub fn rand_uniform(
        shape: impl Into<Shape>,
        range: Range<f64>,
        device: &B::Device,
    ) -> Result<Self> {
        Self::rand_uniform_with_rng(shape, range, &mut rand::thread_rng(), device)
    }

    /// Normally distributed samples, drawn from `rng`.
    pub fn randn_with_rng<R: Rng + ?Sized>(
        shape: impl Into<Shape>,
        mean: f64,
        std: f64,
        rng: &mut R,
        device: &B::Device,
    ) -> Result<Self> {
        use rand_distr::{Distribution, Normal};
        let shape = shape.into();
        let normal = Normal::new(mean, std).map_err(|e| Error::msg(e.to_string()))?;
        let data: Vec<E> = (0..shape.elem_count())
            .map(|_| E::from_f64(normal.sample(rng)))
            .collect();
        Self::from_vec(data, shape, device)
    }

    /// Normally distributed samples using the thread-local generator.
    pub fn randn(shape: impl Into<Shape>, mean: f64, std: f64, device: &B::Device) -> Result<Self> {
        Self::randn_with_rng(shape, mean, std, &mut rand::thread_rng(), device)
    }

    // Extraction

    /// The single value of a rank-0 tensor.
    pub fn item(&self) -> Result<E> {
        if !self.shape.is_scalar() {
            return Err(Error::NotAScalar {
                shape: self.shape.clone(),
            });
        }
        B::get_value(self.buffer())
    }

    /// All elements in row-major order.
    pub fn elements(&self) -> Result<Vec<E>> {
        B::read(self.buffer(), self.elem_count())
    }

    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        Ok(self.elements()?.into_iter().map(WithDType::to_f64).collect())
    }

    // Graph

    /// Same value, cut from the graph: fresh id, no context, not tracked.
    /// Shares the buffer.
    pub fn detached(&self) -> Self {
        Tensor {
            handle: Arc::clone(&self.handle),
            shape: self.shape.clone(),
            requires_grad: false,
            context: None,
            id: TensorId::new(),
        }
    }

    /// Drop the producing context but stay tracked: this value becomes a
    /// leaf, which releases the graph behind it.
    pub fn discard_context(&mut self) {
        self.context = None;
    }

    /// Make sure this tensor is the only owner of its memory, copying the
    /// buffer if the handle is shared or is a view. After a copy the tensor
    /// is a new graph node; when tracked, gradients pass through to the old one.
    pub fn ensure_ownership(&mut self) -> Result<()> {
        if Arc::strong_count(&self.handle) == 1 && !self.handle.is_view() {
            return Ok(());
        }
        log::trace!(
            "ensure_ownership: copying {} elements of shape {}",
            self.elem_count(),
            self.shape
        );
        let count = self.elem_count();
        let buffer = B::allocate::<E>(count, self.device())?;
        B::assign(&buffer, self.buffer(), count)?;
        let copy = Self::from_buffer(buffer, self.shape.clone(), self.device());
        let original = std::mem::replace(self, copy);
        if original.requires_grad {
            let identity: ContributionFn<E, B> = Box::new(|g: &Self| Ok(g.clone()));
            self.requires_grad = true;
            self.context = Some(Arc::new(TensorContext::new(
                "copy",
                vec![original],
                vec![identity],
            )));
        }
        Ok(())
    }
}

// NestedArray: literal construction from nested Rust arrays

/// Values that describe a (possibly nested) rectangular array of elements.
pub trait NestedArray<E> {
    /// Size of each nesting level, outermost first.
    fn nested_shape(&self) -> Vec<usize>;
    /// Append all elements in row-major order.
    fn flatten_into(&self, out: &mut Vec<E>);
}

macro_rules! scalar_nested {
    ($($t:ty),*) => {
        $(
            impl NestedArray<$t> for $t {
                fn nested_shape(&self) -> Vec<usize> {
                    Vec::new()
                }
                fn flatten_into(&self, out: &mut Vec<$t>) {
                    out.push(*self);
                }
            }
        )*
    };
}

scalar_nested!(f32, f64, half::f16, i32);

impl<E, T: NestedArray<E>, const N: usize> NestedArray<E> for [T; N] {
    fn nested_shape(&self) -> Vec<usize> {
        let mut shape = vec![N];
        if let Some(first) = self.first() {
            shape.extend(first.nested_shape());
        }
        shape
    }

    fn flatten_into(&self, out: &mut Vec<E>) {
        for item in self {
            item.flatten_into(out);
        }
    }
}

impl<E, T: NestedArray<E>> NestedArray<E> for Vec<T> {
    fn nested_shape(&self) -> Vec<usize> {
        let mut shape = vec![self.len()];
        if let Some(first) = self.first() {
            shape.extend(first.nested_shape());
        }
        shape
    }

    fn flatten_into(&self, out: &mut Vec<E>) {
        for item in self {
            item.flatten_into(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_shape() {
        let v = [[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]];
        assert_eq!(v.nested_shape(), vec![2, 3]);
        let mut flat = Vec::new();
        v.flatten_into(&mut flat);
        assert_eq!(flat, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(3i32.nested_shape(), Vec::<usize>::new());
    }

    #[test]
    fn test_ragged_vec_shape_follows_first_row() {
        let v = vec![vec![1.0f64, 2.0], vec![3.0]];
        assert_eq!(v.nested_shape(), vec![2, 2]);
        let mut flat = Vec::new();
        v.flatten_into(&mut flat);
        assert_eq!(flat.len(), 3);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = TensorId::new();
        let b = TensorId::new();
        assert_ne!(a, b);
    }
}
