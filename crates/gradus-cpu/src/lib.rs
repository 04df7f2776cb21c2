//! # gradus-cpu
//!
//! CPU backend for gradus: host memory buffers and rayon-parallel kernels.
//!
//! ```ignore
//! use gradus_cpu::{CpuDevice, CpuTensor};
//!
//! let dev = CpuDevice;
//! let x = CpuTensor::<f32>::new([1.0, 2.0, 3.0], &dev)?.set_requires_grad(true);
//! let grads = x.square()?.reduce_sum_all()?.backward()?;
//! ```

mod buffer;
mod ops;

use std::ops::Range;

use gradus_core::backend::{
    Backend, BackendBuffer, BackendDevice, BinaryOp, Im2ColParams, ReduceOp, SliceRead, UnaryOp,
};
use gradus_core::broadcast::{broadcast_shape, remove_axes};
use gradus_core::error::{Error, Result};
use gradus_core::shape::Shape;
use gradus_core::strided::{
    index_runs, plan_index_slice, range_runs, range_slice_shape, IndexSlice, Runs,
};
use gradus_core::{Tensor, WithDType};

use buffer::Input;

pub use buffer::CpuBuffer;
pub use ops::PAR_THRESHOLD;

/// The CPU device. There is only one host, so this is a unit struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuDevice;

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

/// Backend running every kernel on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

/// Convenience type alias for CPU tensors.
pub type CpuTensor<E> = Tensor<E, CpuBackend>;

fn check_count(available: usize, count: usize) -> Result<()> {
    if count > available {
        return Err(Error::msg(format!(
            "cpu: {} elements requested from a buffer of {}",
            count, available
        )));
    }
    Ok(())
}

/// Run `f` on the first `count` elements of `result`.
fn write_with<E: WithDType, R>(
    result: &CpuBuffer<E>,
    count: usize,
    f: impl FnOnce(&mut [E]) -> R,
) -> Result<R> {
    check_count(result.len(), count)?;
    result.with_mut(|d| f(&mut d[..count]))
}

/// Inputs of one element type for a kernel that locks `locked` for writing.
/// A window in a locked allocation, or in one already read by an earlier
/// input, is copied before any read lock is taken; the rest are read in place.
fn read_inputs<'a, E: WithDType>(
    inputs: &[(&'a CpuBuffer<E>, usize)],
    locked: &[usize],
) -> Result<Vec<Input<'a, E>>> {
    let ids: Vec<usize> = inputs.iter().map(|(b, _)| b.memory_id()).collect();
    let mut slots = Vec::with_capacity(inputs.len());
    for (i, &(buffer, count)) in inputs.iter().enumerate() {
        let shared = locked.contains(&ids[i]) || ids[..i].contains(&ids[i]);
        slots.push(if shared {
            Some(Input::Copied(buffer.prefix(count)?))
        } else {
            None
        });
    }
    slots
        .into_iter()
        .zip(inputs)
        .map(|(slot, &(buffer, count))| match slot {
            Some(copied) => Ok(copied),
            None => buffer.input(count, &[]),
        })
        .collect()
}

fn read_runs<E: WithDType>(runs: &Runs, buffer: &CpuBuffer<E>) -> Result<CpuBuffer<E>> {
    let mut out = vec![E::default(); runs.elem_count()];
    buffer.with_slice(|s| runs.read(s, &mut out))?;
    Ok(CpuBuffer::from_vec(out))
}

fn write_runs<E: WithDType>(
    runs: &Runs,
    dst: &CpuBuffer<E>,
    src: &CpuBuffer<E>,
    src_shape: &Shape,
) -> Result<()> {
    if runs.elem_count() != src_shape.elem_count() {
        return Err(Error::ElementCountMismatch {
            shape: src_shape.clone(),
            expected: runs.elem_count(),
            got: src_shape.elem_count(),
        });
    }
    let data = src.input(runs.elem_count(), &[dst.memory_id()])?;
    dst.with_mut(|d| runs.write(d, &data))
}

fn check_parts<E: WithDType>(parts: &[(&CpuBuffer<E>, &Shape)], total: usize) -> Result<()> {
    let sum: usize = parts.iter().map(|(_, s)| s.elem_count()).sum();
    if sum != total {
        return Err(Error::msg(format!(
            "cpu: parts hold {} elements, the stacked buffer {}",
            sum, total
        )));
    }
    Ok(())
}

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Buffer<E: WithDType> = CpuBuffer<E>;

    fn name() -> &'static str {
        "cpu"
    }

    // Memory

    fn allocate<E: WithDType>(len: usize, _device: &CpuDevice) -> Result<CpuBuffer<E>> {
        log::trace!("cpu: allocate {} elements of {}", len, E::DTYPE);
        Ok(CpuBuffer::new(len))
    }

    fn free<E: WithDType>(buffer: &CpuBuffer<E>) {
        buffer.release();
    }

    fn assign_from_slice<E: WithDType>(dst: &CpuBuffer<E>, src: &[E]) -> Result<()> {
        write_with(dst, src.len(), |d| d.copy_from_slice(src))
    }

    fn assign<E: WithDType>(dst: &CpuBuffer<E>, src: &CpuBuffer<E>, count: usize) -> Result<()> {
        let data = src.input(count, &[dst.memory_id()])?;
        Self::assign_from_slice(dst, &data)
    }

    fn read<E: WithDType>(buffer: &CpuBuffer<E>, count: usize) -> Result<Vec<E>> {
        buffer.prefix(count)
    }

    fn get_value<E: WithDType>(buffer: &CpuBuffer<E>) -> Result<E> {
        buffer
            .with_slice(|s| s.first().copied())?
            .ok_or_else(|| Error::msg("cpu: read from an empty buffer"))
    }

    fn advance<E: WithDType>(buffer: &CpuBuffer<E>, by: usize) -> Result<CpuBuffer<E>> {
        buffer.advanced(by)
    }

    fn get_slice<E: WithDType>(
        slice: &[Option<usize>],
        buffer: &CpuBuffer<E>,
        shape: &Shape,
    ) -> Result<SliceRead<CpuBuffer<E>>> {
        match plan_index_slice(slice, shape)? {
            IndexSlice::View {
                offset,
                shape: view_shape,
            } => {
                let view = buffer.window(offset, view_shape.elem_count())?;
                Ok((view, false, view_shape))
            }
            IndexSlice::Copy {
                index,
                shape: copy_shape,
            } => {
                let runs = index_runs(shape.dims(), &index);
                Ok((read_runs(&runs, buffer)?, true, copy_shape))
            }
        }
    }

    fn get_range_slice<E: WithDType>(
        slice: &[Option<Range<usize>>],
        buffer: &CpuBuffer<E>,
        shape: &Shape,
    ) -> Result<SliceRead<CpuBuffer<E>>> {
        let out_shape = range_slice_shape(slice, shape)?;
        let runs = range_runs(shape.dims(), slice);
        Ok((read_runs(&runs, buffer)?, true, out_shape))
    }

    fn set_slice<E: WithDType>(
        slice: &[Option<usize>],
        dst: &CpuBuffer<E>,
        dst_shape: &Shape,
        src: &CpuBuffer<E>,
        src_shape: &Shape,
    ) -> Result<()> {
        plan_index_slice(slice, dst_shape)?;
        write_runs(&index_runs(dst_shape.dims(), slice), dst, src, src_shape)
    }

    fn set_range_slice<E: WithDType>(
        slice: &[Option<Range<usize>>],
        dst: &CpuBuffer<E>,
        dst_shape: &Shape,
        src: &CpuBuffer<E>,
        src_shape: &Shape,
    ) -> Result<()> {
        range_slice_shape(slice, dst_shape)?;
        write_runs(&range_runs(dst_shape.dims(), slice), dst, src, src_shape)
    }

    // Element-wise

    fn fill<E: WithDType>(value: E, result: &CpuBuffer<E>, count: usize) -> Result<()> {
        write_with(result, count, |d| d.fill(value))
    }

    fn unary_op<E: WithDType>(
        op: UnaryOp,
        values: &CpuBuffer<E>,
        result: &CpuBuffer<E>,
        count: usize,
    ) -> Result<()> {
        let src = values.input(count, &[result.memory_id()])?;
        write_with(result, count, |d| ops::unary(op, &src, d))
    }

    fn binary_op<E: WithDType>(
        op: BinaryOp,
        lhs: &CpuBuffer<E>,
        lhs_shape: &Shape,
        rhs: &CpuBuffer<E>,
        rhs_shape: &Shape,
        result: &CpuBuffer<E>,
    ) -> Result<()> {
        let count = broadcast_shape(lhs_shape, rhs_shape)?.elem_count();
        let inputs = read_inputs(
            &[(lhs, lhs_shape.elem_count()), (rhs, rhs_shape.elem_count())],
            &[result.memory_id()],
        )?;
        write_with(result, count, |d| {
            ops::binary(op, &inputs[0], lhs_shape, &inputs[1], rhs_shape, d)
        })?
    }

    // Reductions

    fn reduce_op<E: WithDType>(
        op: ReduceOp,
        values: &CpuBuffer<E>,
        shape: &Shape,
        axes: &[usize],
        result: &CpuBuffer<E>,
        context: Option<&CpuBuffer<i32>>,
    ) -> Result<()> {
        let count = remove_axes(shape, axes)?.elem_count();
        let mut locked = vec![result.memory_id()];
        locked.extend(context.map(|c| c.memory_id()));
        let src = values.input(shape.elem_count(), &locked)?;
        let mut out = vec![E::default(); count];
        let mut positions = vec![0i32; count];
        ops::reduce(
            op,
            &src,
            shape,
            axes,
            &mut out,
            context.is_some().then_some(positions.as_mut_slice()),
        )?;
        Self::assign_from_slice(result, &out)?;
        if let Some(context) = context {
            Self::assign_from_slice(context, &positions)?;
        }
        Ok(())
    }

    fn expand_context<E: WithDType>(
        reduced: &CpuBuffer<E>,
        context: &CpuBuffer<i32>,
        result: &CpuBuffer<E>,
        shape: &Shape,
        axes: &[usize],
    ) -> Result<()> {
        let count = remove_axes(shape, axes)?.elem_count();
        let values = reduced.input(count, &[result.memory_id()])?;
        let positions = context.input(count, &[result.memory_id(), reduced.memory_id()])?;
        write_with(result, shape.elem_count(), |d| {
            ops::expand_context(&values, &positions, d, shape, axes)
        })?
    }

    fn gather<E: WithDType>(
        expanded: &CpuBuffer<E>,
        expanded_shape: &Shape,
        context: &CpuBuffer<i32>,
        result: &CpuBuffer<E>,
        axis: usize,
        ignore_index: i32,
    ) -> Result<()> {
        let count = remove_axes(expanded_shape, &[axis])?.elem_count();
        let src = expanded.input(expanded_shape.elem_count(), &[result.memory_id()])?;
        let positions = context.input(count, &[result.memory_id(), expanded.memory_id()])?;
        write_with(result, count, |d| {
            ops::gather(&src, expanded_shape, &positions, d, axis, ignore_index)
        })?
    }

    fn scatter<E: WithDType>(
        reduced: &CpuBuffer<E>,
        context: &CpuBuffer<i32>,
        result: &CpuBuffer<E>,
        result_shape: &Shape,
        axis: usize,
        ignore_index: i32,
    ) -> Result<()> {
        let count = remove_axes(result_shape, &[axis])?.elem_count();
        let values = reduced.input(count, &[result.memory_id()])?;
        let positions = context.input(count, &[result.memory_id(), reduced.memory_id()])?;
        write_with(result, result_shape.elem_count(), |d| {
            ops::scatter(&values, &positions, d, result_shape, axis, ignore_index)
        })?
    }

    // Linear algebra and data movement

    fn gemm<E: WithDType>(
        lhs: &CpuBuffer<E>,
        lhs_shape: &Shape,
        rhs: &CpuBuffer<E>,
        rhs_shape: &Shape,
        result: &CpuBuffer<E>,
        alpha: E,
        beta: E,
        transpose_lhs: bool,
        transpose_rhs: bool,
    ) -> Result<()> {
        let inputs = read_inputs(
            &[(lhs, lhs_shape.elem_count()), (rhs, rhs_shape.elem_count())],
            &[result.memory_id()],
        )?;
        result.with_mut(|d| {
            ops::gemm(
                &inputs[0],
                lhs_shape,
                &inputs[1],
                rhs_shape,
                d,
                alpha,
                beta,
                transpose_lhs,
                transpose_rhs,
            )
        })?
    }

    fn permute_axes<E: WithDType>(
        values: &CpuBuffer<E>,
        shape: &Shape,
        perm: &[usize],
        result: &CpuBuffer<E>,
    ) -> Result<()> {
        let count = shape.elem_count();
        let src = values.input(count, &[result.memory_id()])?;
        write_with(result, count, |d| ops::permute(&src, shape, perm, d))
    }

    fn permute_axes_add<E: WithDType>(
        values: &CpuBuffer<E>,
        shape: &Shape,
        perm: &[usize],
        add: &CpuBuffer<E>,
        result: &CpuBuffer<E>,
    ) -> Result<()> {
        let count = shape.elem_count();
        let inputs = read_inputs(&[(values, count), (add, count)], &[result.memory_id()])?;
        write_with(result, count, |d| {
            ops::permute_add(&inputs[0], shape, perm, &inputs[1], d)
        })
    }

    fn stack<E: WithDType>(
        buffers: &[(&CpuBuffer<E>, &Shape)],
        axis: usize,
        result: &CpuBuffer<E>,
    ) -> Result<()> {
        let counts: Vec<(&CpuBuffer<E>, usize)> =
            buffers.iter().map(|&(b, s)| (b, s.elem_count())).collect();
        let inputs = read_inputs(&counts, &[result.memory_id()])?;
        let parts: Vec<(&[E], &Shape)> = inputs
            .iter()
            .zip(buffers)
            .map(|(data, &(_, s))| (&data[..], s))
            .collect();
        let total = counts.iter().map(|&(_, n)| n).sum();
        write_with(result, total, |d| ops::stack(&parts, axis, d))
    }

    fn unstack<E: WithDType>(
        stacked: &CpuBuffer<E>,
        shape: &Shape,
        axis: usize,
        results: &[(&CpuBuffer<E>, &Shape)],
    ) -> Result<()> {
        check_parts(results, shape.elem_count())?;
        let locked: Vec<usize> = results.iter().map(|(b, _)| b.memory_id()).collect();
        let src = stacked.input(shape.elem_count(), &locked)?;
        let mut parts: Vec<(Vec<E>, &Shape)> = results
            .iter()
            .map(|&(_, s)| (vec![E::default(); s.elem_count()], s))
            .collect();
        ops::unstack(&src, shape, axis, &mut parts);
        for (&(buffer, _), (data, _)) in results.iter().zip(&parts) {
            Self::assign_from_slice(buffer, data)?;
        }
        Ok(())
    }

    fn arange<E: WithDType>(start: E, step: E, result: &CpuBuffer<E>, count: usize) -> Result<()> {
        write_with(result, count, |d| ops::arange(start, step, d))
    }

    fn reverse<E: WithDType>(
        values: &CpuBuffer<E>,
        shape: &Shape,
        result: &CpuBuffer<E>,
    ) -> Result<()> {
        let count = shape.elem_count();
        let src = values.input(count, &[result.memory_id()])?;
        write_with(result, count, |d| ops::reverse(&src, shape, d))
    }

    fn band<E: WithDType>(
        values: &CpuBuffer<E>,
        shape: &Shape,
        result: &CpuBuffer<E>,
        below: Option<usize>,
        above: Option<usize>,
    ) -> Result<()> {
        if shape.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: shape.rank(),
            });
        }
        let count = shape.elem_count();
        let src = values.input(count, &[result.memory_id()])?;
        write_with(result, count, |d| ops::band(&src, shape, d, below, above))
    }

    fn img2col<E: WithDType>(
        image: &CpuBuffer<E>,
        image_shape: &Shape,
        result: &CpuBuffer<E>,
        params: Im2ColParams,
    ) -> Result<()> {
        let count = params.matrix_shape(image_shape)?.elem_count();
        let src = image.input(image_shape.elem_count(), &[result.memory_id()])?;
        write_with(result, count, |d| ops::img2col(&src, image_shape, d, params))?
    }

    fn col2img<E: WithDType>(
        matrix: &CpuBuffer<E>,
        result: &CpuBuffer<E>,
        image_shape: &Shape,
        params: Im2ColParams,
    ) -> Result<()> {
        let count = params.matrix_shape(image_shape)?.elem_count();
        let src = matrix.input(count, &[result.memory_id()])?;
        write_with(result, image_shape.elem_count(), |d| {
            ops::col2img(&src, d, image_shape, params)
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type T = CpuTensor<f64>;

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
        assert_eq!(got.len(), expected.len(), "length mismatch");
        for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
            assert!(
                approx_eq(*g, *e, tol),
                "index {}: got {} expected {} (tol {})",
                i,
                g,
                e,
                tol
            );
        }
    }

    /// Central finite differences of a scalar function of `x`.
    fn numerical_grad<F>(f: F, x: &T, h: f64) -> Result<Vec<f64>>
    where
        F: Fn(&T) -> Result<T>,
    {
        let dev = CpuDevice;
        let values = x.elements()?;
        let mut grad = vec![0.0; values.len()];
        for i in 0..values.len() {
            let mut plus = values.clone();
            plus[i] += h;
            let mut minus = values.clone();
            minus[i] -= h;
            let f_plus = f(&T::from_vec(plus, x.shape().clone(), &dev)?)?.item()?;
            let f_minus = f(&T::from_vec(minus, x.shape().clone(), &dev)?)?.item()?;
            grad[i] = (f_plus - f_minus) / (2.0 * h);
        }
        Ok(grad)
    }

    fn check_gradient<F>(f: F, x: &T) -> Result<()>
    where
        F: Fn(&T) -> Result<T>,
    {
        let analytical = x.clone().set_requires_grad(true);
        let grads = f(&analytical)?.backward()?;
        let got = grads.get_or_zeros(&analytical)?.to_f64_vec()?;
        let expected = numerical_grad(&f, x, 1e-5)?;
        assert_vec_approx(&got, &expected, 1e-4);
        Ok(())
    }

    fn random(shape: impl Into<Shape>, seed: u64) -> Result<T> {
        let mut rng = StdRng::seed_from_u64(seed);
        T::rand_uniform_with_rng(shape, -1.0..1.0, &mut rng, &CpuDevice)
    }

    #[test]
    fn test_device_name() {
        assert_eq!(CpuDevice.name(), "cpu");
        assert_eq!(CpuBackend::name(), "cpu");
    }

    #[test]
    fn test_zeros_ones() -> Result<()> {
        let dev = CpuDevice;
        let z = CpuTensor::<f32>::zeros((2, 3), &dev)?;
        assert_eq!(z.to_f64_vec()?, vec![0.0; 6]);

        let o = CpuTensor::<f32>::ones((2, 3), &dev)?;
        assert_eq!(o.to_f64_vec()?, vec![1.0; 6]);
        Ok(())
    }

    #[test]
    fn test_half_precision_add() -> Result<()> {
        let dev = CpuDevice;
        let a = CpuTensor::from_slice(&[f16::from_f32(1.5), f16::from_f32(2.0)], 2, &dev)?;
        let b = CpuTensor::from_slice(&[f16::from_f32(0.5), f16::from_f32(-1.0)], 2, &dev)?;
        assert_eq!(a.add(&b)?.to_f64_vec()?, vec![2.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_arange_and_view_slice() -> Result<()> {
        let dev = CpuDevice;
        let t = CpuTensor::<i32>::arange(0, 1, 12, &dev)?.reshape((3, 4))?;
        let row = t.index(&[Some(1)])?;
        assert!(row.is_view());
        assert_eq!(row.elements()?, vec![4, 5, 6, 7]);

        let column = t.index(&[None, Some(2)])?;
        assert!(!column.is_view());
        assert_eq!(column.elements()?, vec![2, 6, 10]);
        Ok(())
    }

    #[test]
    fn test_parallel_reduce_matches_count() -> Result<()> {
        let dev = CpuDevice;
        let n = PAR_THRESHOLD * 2;
        let x = T::ones(n, &dev)?;
        assert!(approx_eq(x.reduce_sum_all()?.item()?, n as f64, 1e-6));
        let y = x.mul_scalar(2.0)?.exp()?;
        assert!(approx_eq(y.reduce_mean_all()?.item()?, 2f64.exp(), 1e-9));
        Ok(())
    }

    #[test]
    fn test_backward_mul() -> Result<()> {
        // f(a, b) = sum(a * b): grad_a = b, grad_b = a
        let dev = CpuDevice;
        let a = T::from_slice(&[2.0, 3.0], 2, &dev)?.set_requires_grad(true);
        let b = T::from_slice(&[4.0, 5.0], 2, &dev)?.set_requires_grad(true);
        let grads = a.mul(&b)?.reduce_sum_all()?.backward()?;

        assert_vec_approx(&grads.get_or_zeros(&a)?.to_f64_vec()?, &[4.0, 5.0], 1e-12);
        assert_vec_approx(&grads.get_or_zeros(&b)?.to_f64_vec()?, &[2.0, 3.0], 1e-12);
        Ok(())
    }

    #[test]
    fn test_backward_numerical_check() -> Result<()> {
        let x = T::from_slice(&[1.0, -0.5, 2.0], 3, &CpuDevice)?;
        check_gradient(
            |t| t.square()?.mul(&t.sigmoid()?)?.reduce_sum_all(),
            &x,
        )
    }

    #[test]
    fn test_unary_gradients() -> Result<()> {
        let x = random((2, 3), 1)?;
        check_gradient(|t| t.tanh()?.reduce_sum_all(), &x)?;
        check_gradient(|t| t.sin()?.mul(&t.cos()?)?.reduce_sum_all(), &x)?;
        check_gradient(|t| t.exp()?.reduce_mean_all(), &x)?;
        check_gradient(|t| t.leaky_relu(0.1)?.square()?.reduce_sum_all(), &x)?;
        // keep log and sqrt away from zero
        let positive = x.square()?.add_scalar(0.5)?;
        check_gradient(|t| t.log()?.add(&t.sqrt()?)?.reduce_sum_all(), &positive)?;
        check_gradient(|t| t.raised_to(3.0)?.reduce_sum_all(), &positive)
    }

    #[test]
    fn test_broadcast_div_gradient() -> Result<()> {
        let denominator = random((1, 4), 2)?.square()?.add_scalar(1.0)?;
        let x = random((3, 1), 3)?;
        check_gradient(|t| t.div(&denominator)?.reduce_sum_all(), &x)?;
        check_gradient(|t| x.div(t)?.reduce_sum_all(), &denominator)
    }

    #[test]
    fn test_matmul_gradients() -> Result<()> {
        let a = random((3, 4), 4)?;
        let w = random((4, 2), 5)?;
        check_gradient(|t| t.matmul(&w)?.square()?.reduce_sum_all(), &a)?;
        check_gradient(|t| a.matmul(t)?.square()?.reduce_sum_all(), &w)?;
        check_gradient(
            |t| t.matmul_with(&a, true, true)?.square()?.reduce_sum_all(),
            &w,
        )
    }

    #[test]
    fn test_batched_matmul_gradient() -> Result<()> {
        let a = random((2, 3, 4), 6)?;
        let b = random((2, 4, 2), 7)?;
        check_gradient(|t| t.matmul(&b)?.square()?.reduce_sum_all(), &a)
    }

    #[test]
    fn test_broadcast_matmul_gradient() -> Result<()> {
        let a = random((2, 1, 3, 4), 30)?;
        let b = random((3, 4, 2), 31)?;
        check_gradient(|t| t.matmul(&b)?.square()?.reduce_sum_all(), &a)?;
        check_gradient(|t| a.matmul(t)?.square()?.reduce_sum_all(), &b)?;
        check_gradient(
            |t| b.matmul_with(t, true, true)?.square()?.reduce_sum_all(),
            &random((2, 1, 5, 4), 32)?,
        )
    }

    #[test]
    fn test_convolution_gradients() -> Result<()> {
        let x = random((2, 2, 4, 4), 33)?;
        let filters = random((3, 2, 3, 3), 34)?;
        check_gradient(|t| t.convolved2d(&filters, None, 1)?.square()?.reduce_sum_all(), &x)?;
        check_gradient(|t| x.convolved2d(t, Some(1), 2)?.square()?.reduce_sum_all(), &filters)?;

        let signal = random((2, 2, 5), 35)?;
        let taps = random((3, 2, 3), 36)?;
        check_gradient(|t| t.convolved1d(&taps, None, 2)?.square()?.reduce_sum_all(), &signal)?;
        check_gradient(|t| signal.convolved1d(t, Some(0), 1)?.square()?.reduce_sum_all(), &taps)?;

        let small = random((1, 2, 3, 3), 37)?;
        let up = random((3, 2, 2, 2), 38)?;
        check_gradient(
            |t| t.transposed_convolved2d(&up, Some(0), 2)?.square()?.reduce_sum_all(),
            &small,
        )?;
        check_gradient(
            |t| small.transposed_convolved2d(t, Some(1), 2)?.square()?.reduce_sum_all(),
            &up,
        )
    }

    #[test]
    fn test_transposed_convolution_is_adjoint() -> Result<()> {
        let x = random((1, 2, 3, 3), 39)?;
        let filters = random((3, 2, 3, 3), 40)?;
        let up = x.transposed_convolved2d(&filters, Some(1), 2)?;
        assert_eq!(up.dims(), &[1, 3, 5, 5]);

        let y = random((1, 3, 5, 5), 41)?;
        let down = y.convolved2d(&filters.permute(&[1, 0, 2, 3])?, Some(1), 2)?;
        assert_eq!(down.dims(), &[1, 2, 3, 3]);
        let lhs = down.mul(&x)?.reduce_sum_all()?.item()?;
        let rhs = up.mul(&y)?.reduce_sum_all()?.item()?;
        assert!((lhs - rhs).abs() < 1e-9, "{} vs {}", lhs, rhs);
        Ok(())
    }

    #[test]
    fn test_pooling_and_line_gradients() -> Result<()> {
        let x = random((2, 2, 4, 4), 42)?;
        check_gradient(|t| t.max_pooled2d(2, Some(0), None)?.square()?.reduce_sum_all(), &x)?;
        check_gradient(|t| t.average_pooled2d(3, None, Some(1))?.square()?.reduce_sum_all(), &x)?;

        let signal = random((2, 3, 6), 43)?;
        check_gradient(|t| t.img2col1d(3, 1, 2)?.square()?.reduce_sum_all(), &signal)?;
        let columns = random((6, 8), 44)?;
        check_gradient(
            |t| t.col2img1d(2, 1, 1, (2, 3, 3))?.square()?.reduce_sum_all(),
            &columns,
        )
    }

    #[test]
    fn test_softmax_gradient() -> Result<()> {
        let x = random((2, 5), 8)?;
        let weights = random((2, 5), 9)?;
        check_gradient(|t| t.softmax(1)?.mul(&weights)?.reduce_sum_all(), &x)
    }

    #[test]
    fn test_reduction_gradients() -> Result<()> {
        let x = random((2, 3, 4), 10)?;
        check_gradient(|t| t.reduce_max(&[1])?.square()?.reduce_sum_all(), &x)?;
        check_gradient(|t| t.reduce_min(&[0, 2])?.square()?.reduce_sum_all(), &x)?;
        check_gradient(|t| t.reduce_mean(&[2])?.square()?.reduce_sum_all(), &x)?;
        check_gradient(|t| t.variance(&[1])?.reduce_sum_all(), &x)
    }

    #[test]
    fn test_shape_gradients() -> Result<()> {
        let x = random((2, 3, 4), 11)?;
        let weights = random((4, 2, 3), 12)?;
        check_gradient(
            |t| t.permute(&[2, 0, 1])?.mul(&weights)?.reduce_sum_all(),
            &x,
        )?;
        check_gradient(|t| t.transposed()?.square()?.reduce_sum_all(), &x)?;
        check_gradient(
            |t| t.slice(&[None, Some(1..3)])?.square()?.reduce_sum_all(),
            &x,
        )?;
        check_gradient(
            |t| t.padded(0.0, &[(1, 0), (0, 2), (1, 1)])?.exp()?.reduce_sum_all(),
            &x,
        )
    }

    #[test]
    fn test_stack_gradients() -> Result<()> {
        let x = random((2, 3), 13)?;
        let y = random((2, 2), 14)?;
        let weights = random((2, 5), 15)?;
        check_gradient(
            |t| T::cat(&[t, &y], 1)?.mul(&weights)?.reduce_sum_all(),
            &x,
        )?;
        check_gradient(
            |t| {
                let parts = t.unstacked(1, &[1, 2])?;
                parts[1].square()?.reduce_sum_all()
            },
            &x,
        )
    }

    #[test]
    fn test_conv_gradient() -> Result<()> {
        let params = Im2ColParams {
            kernel_height: 2,
            kernel_width: 2,
            padding: 1,
            stride: 2,
        };
        let image = random((2, 2, 3, 3), 16)?;
        check_gradient(|t| t.img2col(params)?.square()?.reduce_sum_all(), &image)
    }

    #[test]
    fn test_gather_gradient() -> Result<()> {
        let dev = CpuDevice;
        let x = random((3, 4), 17)?;
        let labels = CpuTensor::<i32>::from_slice(&[3, 0, -1], 3, &dev)?;
        check_gradient(|t| t.gather(&labels, 1, -1)?.square()?.reduce_sum_all(), &x)
    }

    #[test]
    fn test_data_movement_gradients() -> Result<()> {
        let x = random((3, 2), 18)?;
        let weights = random((3, 2), 19)?;
        check_gradient(|t| t.reversed()?.mul(&weights)?.reduce_sum_all(), &x)?;
        check_gradient(|t| t.repeated(3)?.exp()?.reduce_sum_all(), &x)?;

        let square = random((3, 3), 20)?;
        check_gradient(
            |t| t.band_matrix(Some(1), Some(0))?.exp()?.reduce_sum_all(),
            &square,
        )?;

        let y = random((3, 2), 21)?;
        let stacked_weights = random((3, 2, 2), 22)?;
        check_gradient(
            |t| T::stack(&[t, &y], 2)?.mul(&stacked_weights)?.reduce_sum_all(),
            &x,
        )
    }

    #[test]
    fn test_scatter_and_col2img_gradients() -> Result<()> {
        let dev = CpuDevice;
        let x = random(3, 23)?;
        let positions = CpuTensor::<i32>::from_slice(&[2, 0, -1], 3, &dev)?;
        let weights = random((3, 4), 24)?;
        check_gradient(
            |t| t.scatter(&positions, 4, 1, -1)?.mul(&weights)?.reduce_sum_all(),
            &x,
        )?;

        let params = Im2ColParams {
            kernel_height: 2,
            kernel_width: 2,
            padding: 1,
            stride: 1,
        };
        let image_shape = Shape::from((1, 2, 3, 3));
        let columns = random(params.matrix_shape(&image_shape)?, 25)?;
        check_gradient(
            |t| t.col2img(image_shape.clone(), params)?.square()?.reduce_sum_all(),
            &columns,
        )
    }

    #[test]
    fn test_subscript_gradients() -> Result<()> {
        let x = random((3, 4), 26)?;
        // strided copy and contiguous view
        check_gradient(|t| t.index(&[None, Some(1)])?.square()?.reduce_sum_all(), &x)?;
        check_gradient(|t| t.index(&[Some(-1)])?.exp()?.reduce_sum_all(), &x)?;

        // region writes: the base and the written value both carry gradient
        check_gradient(
            |t| {
                let mut base = t.mul_scalar(2.0)?;
                let value = t.slice(&[Some(0..1), None])?.square()?;
                base.set_slice(&[Some(2..3), None], &value)?;
                base.square()?.reduce_sum_all()
            },
            &x,
        )?;
        check_gradient(
            |t| {
                let mut base = t.exp()?;
                let value = t.index(&[Some(0), Some(3)])?.sin()?;
                base.set_index(&[Some(1), Some(2)], &value)?;
                base.square()?.reduce_sum_all()
            },
            &x,
        )
    }

    #[test]
    fn test_buffer_errors() -> Result<()> {
        let dev = CpuDevice;
        let empty = CpuBuffer::<f64>::new(0);
        assert!(CpuBackend::get_value(&empty).is_err());

        let x = T::from_slice(&[1.0, 2.0], 2, &dev)?;
        assert!(x.reshape((3, 1)).is_err());
        let short = CpuBackend::allocate::<f64>(1, &dev)?;
        assert!(CpuBackend::assign(&short, x.buffer(), 2).is_err());
        Ok(())
    }

    #[test]
    fn test_kernels_on_aliased_buffers() -> Result<()> {
        let s = Shape::from((2, 2));
        let buf = CpuBuffer::from_vec(vec![1.0f64, 2.0, 3.0, 4.0]);
        // both operands and the result are one allocation
        CpuBackend::binary_op(BinaryOp::Mul, &buf, &s, &buf, &s, &buf)?;
        assert_eq!(buf.to_vec()?, vec![1.0, 4.0, 9.0, 16.0]);

        // result += transpose(values), accumulating in place
        let acc = CpuBuffer::from_vec(vec![10.0f64, 20.0, 30.0, 40.0]);
        let values = CpuBuffer::from_vec(vec![1.0f64, 2.0, 3.0, 4.0]);
        CpuBackend::permute_axes_add(&values, &s, &[1, 0], &acc, &acc)?;
        assert_eq!(acc.to_vec()?, vec![11.0, 23.0, 32.0, 44.0]);

        // an input that is a view into the output's memory
        let whole = CpuBuffer::from_vec(vec![1.0f64, 2.0, 3.0, 4.0]);
        let tail = whole.advanced(2)?;
        CpuBackend::unary_op(UnaryOp::Neg, &tail, &whole, 2)?;
        assert_eq!(whole.to_vec()?, vec![-3.0, -4.0, 3.0, 4.0]);
        Ok(())
    }
}
