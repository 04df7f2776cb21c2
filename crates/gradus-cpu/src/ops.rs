// CPU kernels
//
// Every kernel works on plain row-major slices: the backend reads its
// inputs in place (or copies the ones that alias a locked allocation),
// takes the write lock on the output and hands both to a function in this
// module. Shapes have already been validated by the tensor layer;
// kernels still check the indices they read from i32 contexts.
//
// PERFORMANCE NOTE:
// Large outputs (PAR_THRESHOLD elements or more) are split across rayon
// workers along the outer loop: broadcast blocks for binary ops, output
// elements for reductions, batches for gemm.

use rayon::prelude::*;

use gradus_core::backend::{BinaryOp, Im2ColParams, ReduceOp, UnaryOp};
use gradus_core::broadcast::{remove_axes, BroadcastMode, BroadcastPlan};
use gradus_core::error::{Error, Result};
use gradus_core::shape::Shape;
use gradus_core::strided::{strides, unravel_index};
use gradus_core::WithDType;

/// Minimum number of output elements to trigger rayon parallel iteration.
pub const PAR_THRESHOLD: usize = 100_000;

// Element-wise

pub fn unary<E: WithDType>(op: UnaryOp, src: &[E], dst: &mut [E]) {
    if dst.len() >= PAR_THRESHOLD {
        dst.par_iter_mut()
            .zip(src.par_iter())
            .for_each(|(d, &s)| *d = op.apply(s));
    } else {
        for (d, &s) in dst.iter_mut().zip(src) {
            *d = op.apply(s);
        }
    }
}

/// Broadcasting binary op driven by a [`BroadcastPlan`]: one contiguous
/// block of `slice_len` outputs per outer index.
pub fn binary<E: WithDType>(
    op: BinaryOp,
    lhs: &[E],
    lhs_shape: &Shape,
    rhs: &[E],
    rhs_shape: &Shape,
    dst: &mut [E],
) -> Result<()> {
    let plan = BroadcastPlan::new(lhs_shape, rhs_shape)?;
    let n = plan.slice_len();
    if dst.is_empty() || n == 0 {
        return Ok(());
    }
    let block = |outer: usize, out: &mut [E]| {
        let (lo, ro) = plan.operand_offsets(outer);
        match plan.mode() {
            BroadcastMode::VectorVector => {
                for (i, d) in out.iter_mut().enumerate() {
                    *d = op.apply(lhs[lo + i], rhs[ro + i]);
                }
            }
            BroadcastMode::ScalarVector => {
                let a = lhs[lo];
                for (i, d) in out.iter_mut().enumerate() {
                    *d = op.apply(a, rhs[ro + i]);
                }
            }
            BroadcastMode::VectorScalar => {
                let b = rhs[ro];
                for (i, d) in out.iter_mut().enumerate() {
                    *d = op.apply(lhs[lo + i], b);
                }
            }
        }
    };
    if dst.len() >= PAR_THRESHOLD {
        dst.par_chunks_mut(n)
            .enumerate()
            .for_each(|(outer, out)| block(outer, out));
    } else {
        for (outer, out) in dst.chunks_mut(n).enumerate() {
            block(outer, out);
        }
    }
    Ok(())
}

// Reductions

/// Offsets shared by the reduction kernels: the start of each output's
/// sub-block, and the offsets of the reduced elements within any sub-block
/// in row-major order.
struct ReductionGeometry {
    bases: Vec<usize>,
    members: Vec<usize>,
}

impl ReductionGeometry {
    fn new(shape: &Shape, axes: &[usize]) -> Self {
        let dims = shape.dims();
        let st = strides(dims);
        let kept: Vec<usize> = (0..dims.len()).filter(|a| !axes.contains(a)).collect();
        let offsets = |axes: &[usize]| -> Vec<usize> {
            let sizes: Vec<usize> = axes.iter().map(|&a| dims[a]).collect();
            let count: usize = sizes.iter().product();
            (0..count)
                .map(|linear| {
                    unravel_index(linear, &sizes)
                        .iter()
                        .zip(axes)
                        .map(|(&i, &a)| i * st[a])
                        .sum()
                })
                .collect()
        };
        ReductionGeometry {
            bases: offsets(&kept),
            members: offsets(axes),
        }
    }
}

pub fn reduce<E: WithDType>(
    op: ReduceOp,
    src: &[E],
    shape: &Shape,
    axes: &[usize],
    dst: &mut [E],
    context: Option<&mut [i32]>,
) -> Result<()> {
    let geometry = ReductionGeometry::new(shape, axes);
    let members = &geometry.members;
    let count = E::from_f64(members.len() as f64);

    // (value, position of the selected member)
    let fold = |base: usize| -> (E, i32) {
        match op {
            ReduceOp::Sum | ReduceOp::Mean => {
                let mut acc = E::zero();
                for &m in members {
                    acc = acc + src[base + m];
                }
                if op == ReduceOp::Mean {
                    acc = acc / count;
                }
                (acc, 0)
            }
            ReduceOp::Max | ReduceOp::Min => {
                let mut best = src[base];
                let mut best_at = 0;
                for (k, &m) in members.iter().enumerate().skip(1) {
                    let v = src[base + m];
                    let better = if op == ReduceOp::Max { v > best } else { v < best };
                    if better {
                        best = v;
                        best_at = k;
                    }
                }
                (best, best_at as i32)
            }
        }
    };

    let results: Vec<(E, i32)> = if dst.len() >= PAR_THRESHOLD {
        geometry.bases.par_iter().map(|&b| fold(b)).collect()
    } else {
        geometry.bases.iter().map(|&b| fold(b)).collect()
    };
    for (d, (v, _)) in dst.iter_mut().zip(&results) {
        *d = *v;
    }
    if let Some(context) = context {
        for (c, (_, at)) in context.iter_mut().zip(&results) {
            *c = *at;
        }
    }
    Ok(())
}

fn checked_position(position: i32, size: usize, axis: usize) -> Result<usize> {
    if position < 0 || position as usize >= size {
        return Err(Error::IndexOutOfRange {
            index: position as isize,
            axis,
            size,
        });
    }
    Ok(position as usize)
}

/// Write `reduced[o]` to member `context[o]` of output `o`'s sub-block.
pub fn expand_context<E: WithDType>(
    reduced: &[E],
    context: &[i32],
    dst: &mut [E],
    shape: &Shape,
    axes: &[usize],
) -> Result<()> {
    let expected = remove_axes(shape, axes)?.elem_count();
    if reduced.len() != expected || context.len() != expected {
        return Err(Error::msg(format!(
            "expand_context: {} values and {} positions for {} outputs",
            reduced.len(),
            context.len(),
            expected
        )));
    }
    let geometry = ReductionGeometry::new(shape, axes);
    let first_axis = axes.first().copied().unwrap_or(0);
    dst.fill(E::zero());
    for ((&base, &v), &c) in geometry.bases.iter().zip(reduced).zip(context) {
        let member = checked_position(c, geometry.members.len(), first_axis)?;
        dst[base + geometry.members[member]] = v;
    }
    Ok(())
}

// Gather / scatter along one axis: the expanded side is viewed as
// [outer, size, inner], the reduced side as [outer, inner].

fn split_at_axis(dims: &[usize], axis: usize) -> (usize, usize, usize) {
    let outer = dims[..axis].iter().product();
    let inner = dims[axis + 1..].iter().product();
    (outer, dims[axis], inner)
}

pub fn gather<E: WithDType>(
    expanded: &[E],
    expanded_shape: &Shape,
    context: &[i32],
    dst: &mut [E],
    axis: usize,
    ignore_index: i32,
) -> Result<()> {
    let (outer, size, inner) = split_at_axis(expanded_shape.dims(), axis);
    for o in 0..outer {
        for i in 0..inner {
            let j = o * inner + i;
            let c = context[j];
            dst[j] = if c == ignore_index {
                E::zero()
            } else {
                let c = checked_position(c, size, axis)?;
                expanded[(o * size + c) * inner + i]
            };
        }
    }
    Ok(())
}

pub fn scatter<E: WithDType>(
    reduced: &[E],
    context: &[i32],
    dst: &mut [E],
    result_shape: &Shape,
    axis: usize,
    ignore_index: i32,
) -> Result<()> {
    let (outer, size, inner) = split_at_axis(result_shape.dims(), axis);
    dst.fill(E::zero());
    for o in 0..outer {
        for i in 0..inner {
            let j = o * inner + i;
            let c = context[j];
            if c == ignore_index {
                continue;
            }
            let c = checked_position(c, size, axis)?;
            dst[(o * size + c) * inner + i] = reduced[j];
        }
    }
    Ok(())
}

// Matrix multiplication
//
// Float element types go through the `gemm` crate, which picks
// AVX2/AVX-512/FMA kernels at runtime. Transposes are expressed as swapped
// row/column strides, so no operand is ever copied. Batches run in parallel
// with rayon. i32 has no gemm kernel and uses a plain loop.
//
// gemm computes dst = alpha * dst + beta * lhs @ rhs, i.e. the coefficient
// roles are the reverse of the Backend contract's alpha/beta.

/// Stored shape of one gemm operand: (batch, rows, cols). Every axis before
/// the last two is folded into the batch.
fn matrix_dims(shape: &Shape) -> Result<(usize, usize, usize)> {
    let d = shape.dims();
    if d.len() < 2 {
        return Err(Error::RankMismatch {
            expected: 2,
            got: d.len(),
        });
    }
    let batch = d[..d.len() - 2].iter().product();
    Ok((batch, d[d.len() - 2], d[d.len() - 1]))
}

/// One gemm problem: sizes plus (row, column) strides of `op(lhs)` and `op(rhs)`.
#[derive(Debug, Clone, Copy)]
struct GemmGeometry {
    m: usize,
    n: usize,
    k: usize,
    lhs_block: usize,
    rhs_block: usize,
    lhs_strides: (isize, isize),
    rhs_strides: (isize, isize),
}

impl GemmGeometry {
    fn new(
        lhs_shape: &Shape,
        rhs_shape: &Shape,
        transpose_lhs: bool,
        transpose_rhs: bool,
    ) -> Result<(usize, Self)> {
        let (batch, lr, lc) = matrix_dims(lhs_shape)?;
        let (rhs_batch, rr, rc) = matrix_dims(rhs_shape)?;
        let (m, k) = if transpose_lhs { (lc, lr) } else { (lr, lc) };
        let (k2, n) = if transpose_rhs { (rc, rr) } else { (rr, rc) };
        if k != k2 || batch != rhs_batch {
            return Err(Error::MatmulShapeMismatch { m, k1: k, k2, n });
        }
        // element (i, j) of op(X) sits at i * rs + j * cs
        let lhs_strides = if transpose_lhs {
            (1, lc as isize)
        } else {
            (lc as isize, 1)
        };
        let rhs_strides = if transpose_rhs {
            (1, rc as isize)
        } else {
            (rc as isize, 1)
        };
        Ok((
            batch,
            GemmGeometry {
                m,
                n,
                k,
                lhs_block: lr * lc,
                rhs_block: rr * rc,
                lhs_strides,
                rhs_strides,
            },
        ))
    }

    fn lhs_at<E: WithDType>(&self, lhs: &[E], i: usize, p: usize) -> E {
        lhs[i * self.lhs_strides.0 as usize + p * self.lhs_strides.1 as usize]
    }

    fn rhs_at<E: WithDType>(&self, rhs: &[E], p: usize, j: usize) -> E {
        rhs[p * self.rhs_strides.0 as usize + j * self.rhs_strides.1 as usize]
    }
}

/// `dst = alpha * op(lhs) @ op(rhs) + beta * dst`, batched over the leading axes.
#[allow(clippy::too_many_arguments)]
pub fn gemm<E: WithDType>(
    lhs: &[E],
    lhs_shape: &Shape,
    rhs: &[E],
    rhs_shape: &Shape,
    dst: &mut [E],
    alpha: E,
    beta: E,
    transpose_lhs: bool,
    transpose_rhs: bool,
) -> Result<()> {
    let (batch, geo) = GemmGeometry::new(lhs_shape, rhs_shape, transpose_lhs, transpose_rhs)?;
    let mn = geo.m * geo.n;
    if dst.len() != batch * mn {
        return Err(Error::msg(format!(
            "gemm output has {} elements, expected {}",
            dst.len(),
            batch * mn
        )));
    }
    if lhs.len() < batch * geo.lhs_block || rhs.len() < batch * geo.rhs_block {
        return Err(Error::msg(format!(
            "gemm operands hold {} and {} elements, shapes {} and {} need more",
            lhs.len(),
            rhs.len(),
            lhs_shape,
            rhs_shape
        )));
    }
    if mn == 0 {
        return Ok(());
    }

    let one_batch = |b: usize, out: &mut [E]| {
        let a = &lhs[b * geo.lhs_block..(b + 1) * geo.lhs_block];
        let r = &rhs[b * geo.rhs_block..(b + 1) * geo.rhs_block];
        if geo.k == 0 {
            for d in out.iter_mut() {
                *d = if beta == E::zero() {
                    E::zero()
                } else {
                    beta * *d
                };
            }
        } else if E::DTYPE.is_float() {
            gemm_float(&geo, a, r, out, alpha, beta);
        } else {
            gemm_loop(&geo, a, r, out, alpha, beta);
        }
    };

    if batch > 1 && batch * mn * geo.k.max(1) >= PAR_THRESHOLD {
        dst.par_chunks_mut(mn)
            .enumerate()
            .for_each(|(b, out)| one_batch(b, out));
    } else {
        for (b, out) in dst.chunks_mut(mn).enumerate() {
            one_batch(b, out);
        }
    }
    Ok(())
}

/// A single `[m, k] @ [k, n]` product through `gemm::gemm`. Only called for
/// f16/f32/f64, the element types the crate has kernels for.
fn gemm_float<E: WithDType>(
    geo: &GemmGeometry,
    lhs: &[E],
    rhs: &[E],
    dst: &mut [E],
    alpha: E,
    beta: E,
) {
    // SAFETY: the caller checked that `lhs` holds m*k, `rhs` k*n and `dst`
    // m*n elements, and the strides address exactly those row-major blocks.
    unsafe {
        gemm::gemm(
            geo.m,
            geo.n,
            geo.k,
            dst.as_mut_ptr(),
            1,
            geo.n as isize,
            beta != E::zero(),
            lhs.as_ptr(),
            geo.lhs_strides.1,
            geo.lhs_strides.0,
            rhs.as_ptr(),
            geo.rhs_strides.1,
            geo.rhs_strides.0,
            beta,
            alpha,
            false,
            false,
            false,
            gemm::Parallelism::None,
        );
    }
}

fn gemm_loop<E: WithDType>(
    geo: &GemmGeometry,
    lhs: &[E],
    rhs: &[E],
    dst: &mut [E],
    alpha: E,
    beta: E,
) {
    let overwrite = beta == E::zero();
    for (index, d) in dst.iter_mut().enumerate() {
        let (i, j) = (index / geo.n, index % geo.n);
        let mut acc = E::zero();
        for p in 0..geo.k {
            acc = acc + geo.lhs_at(lhs, i, p) * geo.rhs_at(rhs, p, j);
        }
        *d = if overwrite {
            alpha * acc
        } else {
            alpha * acc + beta * *d
        };
    }
}

// Data movement

/// Source offset of every destination element of a permutation, in
/// destination order. Destination axis `i` walks source axis `perm[i]`.
fn permuted_offsets(shape: &Shape, perm: &[usize]) -> Vec<usize> {
    let dims = shape.dims();
    let st = strides(dims);
    let out_dims: Vec<usize> = perm.iter().map(|&p| dims[p]).collect();
    let out_strides: Vec<usize> = perm.iter().map(|&p| st[p]).collect();
    let count: usize = out_dims.iter().product();
    let mut offsets = Vec::with_capacity(count);
    if count == 0 {
        return offsets;
    }
    let mut index = vec![0usize; out_dims.len()];
    let mut offset = 0usize;
    for _ in 0..count {
        offsets.push(offset);
        // odometer step, rightmost axis first
        for axis in (0..out_dims.len()).rev() {
            index[axis] += 1;
            offset += out_strides[axis];
            if index[axis] < out_dims[axis] {
                break;
            }
            offset -= out_strides[axis] * out_dims[axis];
            index[axis] = 0;
        }
    }
    offsets
}

pub fn permute<E: WithDType>(src: &[E], shape: &Shape, perm: &[usize], dst: &mut [E]) {
    for (d, o) in dst.iter_mut().zip(permuted_offsets(shape, perm)) {
        *d = src[o];
    }
}

pub fn permute_add<E: WithDType>(
    src: &[E],
    shape: &Shape,
    perm: &[usize],
    add: &[E],
    dst: &mut [E],
) {
    for ((d, &a), o) in dst.iter_mut().zip(add).zip(permuted_offsets(shape, perm)) {
        *d = a + src[o];
    }
}

/// Concatenate parts along `axis`: per outer index, each part contributes
/// one contiguous chunk of `size[axis] * inner` elements.
pub fn stack<E: WithDType>(parts: &[(&[E], &Shape)], axis: usize, dst: &mut [E]) {
    let outer: usize = parts
        .first()
        .map_or(0, |(_, s)| s.dims()[..axis].iter().product());
    let mut at = 0;
    for o in 0..outer {
        for (data, shape) in parts {
            let chunk: usize = shape.dims()[axis..].iter().product();
            dst[at..at + chunk].copy_from_slice(&data[o * chunk..(o + 1) * chunk]);
            at += chunk;
        }
    }
}

/// Inverse of [`stack`].
pub fn unstack<E: WithDType>(src: &[E], shape: &Shape, axis: usize, parts: &mut [(Vec<E>, &Shape)]) {
    let outer: usize = shape.dims()[..axis].iter().product();
    let mut at = 0;
    for o in 0..outer {
        for (data, part_shape) in parts.iter_mut() {
            let chunk: usize = part_shape.dims()[axis..].iter().product();
            data[o * chunk..(o + 1) * chunk].copy_from_slice(&src[at..at + chunk]);
            at += chunk;
        }
    }
}

pub fn arange<E: WithDType>(start: E, step: E, dst: &mut [E]) {
    let mut v = start;
    for d in dst.iter_mut() {
        *d = v;
        v = v + step;
    }
}

/// Reverse the blocks along axis 0.
pub fn reverse<E: WithDType>(src: &[E], shape: &Shape, dst: &mut [E]) {
    let rows = shape.dims().first().copied().unwrap_or(1);
    if rows == 0 {
        return;
    }
    let block = src.len() / rows;
    for r in 0..rows {
        let from = (rows - 1 - r) * block;
        dst[r * block..(r + 1) * block].copy_from_slice(&src[from..from + block]);
    }
}

pub fn band<E: WithDType>(
    src: &[E],
    shape: &Shape,
    dst: &mut [E],
    below: Option<usize>,
    above: Option<usize>,
) {
    let (rows, cols) = (shape.dims()[0], shape.dims()[1]);
    for i in 0..rows {
        for j in 0..cols {
            let keep = below.map_or(true, |b| i <= j + b) && above.map_or(true, |a| j <= i + a);
            dst[i * cols + j] = if keep { src[i * cols + j] } else { E::zero() };
        }
    }
}

// im2col / col2img
//
//   dst[k * (B * oh * ow) + b * (oh * ow) + y * ow + x]
//     = image[b, c, y * stride - pad + ky, x * stride - pad + kx]
//   with k = (c * kh + ky) * kw + kx, zero outside the image.

/// Calls `f(matrix offset, image offset)` for every in-bounds patch element.
fn for_each_patch_element(
    image_shape: &Shape,
    params: Im2ColParams,
    mut f: impl FnMut(usize, usize),
) -> Result<()> {
    let dims = image_shape.dims();
    if dims.len() != 4 {
        return Err(Error::RankMismatch {
            expected: 4,
            got: dims.len(),
        });
    }
    let (batch, channels, h, w) = (dims[0], dims[1], dims[2], dims[3]);
    let (oh, ow) = params.output_size(h, w)?;
    let (kh, kw) = (params.kernel_height, params.kernel_width);
    let columns = batch * oh * ow;
    for c in 0..channels {
        for ky in 0..kh {
            for kx in 0..kw {
                let k = (c * kh + ky) * kw + kx;
                for b in 0..batch {
                    for y in 0..oh {
                        let iy = (y * params.stride + ky) as isize - params.padding as isize;
                        if iy < 0 || iy as usize >= h {
                            continue;
                        }
                        for x in 0..ow {
                            let ix = (x * params.stride + kx) as isize - params.padding as isize;
                            if ix < 0 || ix as usize >= w {
                                continue;
                            }
                            let m = k * columns + b * oh * ow + y * ow + x;
                            let i = ((b * channels + c) * h + iy as usize) * w + ix as usize;
                            f(m, i);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

pub fn img2col<E: WithDType>(
    image: &[E],
    image_shape: &Shape,
    dst: &mut [E],
    params: Im2ColParams,
) -> Result<()> {
    dst.fill(E::zero());
    for_each_patch_element(image_shape, params, |m, i| dst[m] = image[i])
}

pub fn col2img<E: WithDType>(
    matrix: &[E],
    dst: &mut [E],
    image_shape: &Shape,
    params: Im2ColParams,
) -> Result<()> {
    dst.fill(E::zero());
    for_each_patch_element(image_shape, params, |m, i| dst[i] = dst[i] + matrix[m])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn test_binary_broadcast_outer() -> Result<()> {
        let lhs = [1.0f64, 2.0, 3.0];
        let rhs = [10.0f64, 20.0];
        let mut dst = [0.0; 6];
        binary(
            BinaryOp::Add,
            &lhs,
            &Shape::from((3, 1)),
            &rhs,
            &Shape::from((1, 2)),
            &mut dst,
        )?;
        assert_eq!(dst, [11.0, 21.0, 12.0, 22.0, 13.0, 23.0]);
        Ok(())
    }

    #[test]
    fn test_binary_scalar_rhs() -> Result<()> {
        let lhs = [1i32, 2, 3, 4];
        let mut dst = [0; 4];
        binary(
            BinaryOp::Mul,
            &lhs,
            &Shape::from((2, 2)),
            &[3],
            &Shape::scalar(),
            &mut dst,
        )?;
        assert_eq!(dst, [3, 6, 9, 12]);
        Ok(())
    }

    #[test]
    fn test_binary_parallel_matches_serial() -> Result<()> {
        let n = PAR_THRESHOLD + 7;
        let lhs: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let mut dst = vec![0.0; n];
        binary(
            BinaryOp::Sub,
            &lhs,
            &Shape::from(n),
            &[1.0],
            &Shape::from(1),
            &mut dst,
        )?;
        assert!(dst.iter().enumerate().all(|(i, &v)| v == i as f64 - 1.0));
        Ok(())
    }

    #[test]
    fn test_reduce_sum_middle_axis() -> Result<()> {
        let src: Vec<f64> = (0..24).map(|i| i as f64).collect();
        let mut dst = [0.0; 8];
        reduce(ReduceOp::Sum, &src, &Shape::from((2, 3, 4)), &[1], &mut dst, None)?;
        // dst[0] = 0 + 4 + 8
        assert_eq!(dst[0], 12.0);
        assert_eq!(dst[7], 19.0 + 15.0 + 23.0);
        Ok(())
    }

    #[test]
    fn test_reduce_max_context_first_tie() -> Result<()> {
        let src = [1.0f32, 5.0, 5.0, 2.0, 0.0, 3.0];
        let mut dst = [0.0; 2];
        let mut ctx = [0i32; 2];
        reduce(
            ReduceOp::Max,
            &src,
            &Shape::from((2, 3)),
            &[1],
            &mut dst,
            Some(&mut ctx),
        )?;
        assert_eq!(dst, [5.0, 3.0]);
        assert_eq!(ctx, [1, 2]);
        Ok(())
    }

    #[test]
    fn test_reduce_min_over_several_axes() -> Result<()> {
        // [2, 2, 2], reduce axes 0 and 2: members at offsets 0, 1, 4, 5 (+2 for column 1)
        let src = [4.0f64, 3.0, 9.0, 9.0, 2.0, 8.0, 9.0, 1.0];
        let mut dst = [0.0; 2];
        let mut ctx = [0i32; 2];
        reduce(
            ReduceOp::Min,
            &src,
            &Shape::from((2, 2, 2)),
            &[0, 2],
            &mut dst,
            Some(&mut ctx),
        )?;
        assert_eq!(dst, [2.0, 1.0]);
        assert_eq!(ctx, [2, 3]);

        let mut back = [7.0; 8];
        expand_context(&dst, &ctx, &mut back, &Shape::from((2, 2, 2)), &[0, 2])?;
        assert_eq!(back, [0.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_reduce_mean() -> Result<()> {
        let src = [1.0f64, 2.0, 3.0, 4.0];
        let mut dst = [0.0; 1];
        reduce(ReduceOp::Mean, &src, &Shape::from(4), &[0], &mut dst, None)?;
        assert!(approx_eq(dst[0], 2.5, 1e-12));
        Ok(())
    }

    #[test]
    fn test_gather_scatter() -> Result<()> {
        // [3, 2] gathered along axis 0
        let x = [1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut out = [0.0; 2];
        gather(&x, &Shape::from((3, 2)), &[2, -1], &mut out, 0, -1)?;
        assert_eq!(out, [5.0, 0.0]);

        let mut back = [9.0; 6];
        scatter(&out, &[2, 0], &mut back, &Shape::from((3, 2)), 0, -1)?;
        assert_eq!(back, [0.0, 0.0, 0.0, 0.0, 5.0, 0.0]);

        assert!(gather(&x, &Shape::from((3, 2)), &[3, 0], &mut out, 0, -1).is_err());
        Ok(())
    }

    #[test]
    fn test_gemm_transposes() -> Result<()> {
        // A = [[1, 2], [3, 4]], B = [[5, 6], [7, 8]]
        let a = [1.0f64, 2.0, 3.0, 4.0];
        let b = [5.0f64, 6.0, 7.0, 8.0];
        let s = Shape::from((2, 2));
        let mut c = [0.0; 4];
        gemm(&a, &s, &b, &s, &mut c, 1.0, 0.0, false, false)?;
        assert_eq!(c, [19.0, 22.0, 43.0, 50.0]);
        gemm(&a, &s, &b, &s, &mut c, 1.0, 0.0, true, false)?;
        assert_eq!(c, [26.0, 30.0, 38.0, 44.0]);
        gemm(&a, &s, &b, &s, &mut c, 1.0, 0.0, false, true)?;
        assert_eq!(c, [17.0, 23.0, 39.0, 53.0]);
        // beta accumulates into the previous result
        gemm(&a, &s, &b, &s, &mut c, 2.0, 1.0, false, true)?;
        assert_eq!(c, [51.0, 69.0, 117.0, 159.0]);
        Ok(())
    }

    #[test]
    fn test_gemm_batched() -> Result<()> {
        let a = [1.0f64, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 2.0];
        let b = [1.0f64, 2.0, 3.0, 4.0, 1.0, 2.0, 3.0, 4.0];
        let s = Shape::from((2, 2, 2));
        let mut c = [0.0; 8];
        gemm(&a, &s, &b, &s, &mut c, 1.0, 0.0, false, false)?;
        assert_eq!(c, [1.0, 2.0, 3.0, 4.0, 2.0, 4.0, 6.0, 8.0]);
        Ok(())
    }

    #[test]
    fn test_gemm_int_and_half() -> Result<()> {
        let s = Shape::from((2, 2));
        let mut c = [0i32; 4];
        gemm(&[1, 2, 3, 4], &s, &[5, 6, 7, 8], &s, &mut c, 1, 0, false, true)?;
        assert_eq!(c, [17, 23, 39, 53]);
        gemm(&[1, 2, 3, 4], &s, &[5, 6, 7, 8], &s, &mut c, 1, 1, true, false)?;
        assert_eq!(c, [43, 53, 77, 97]);

        let h = |v: f64| half::f16::from_f64(v);
        let a = [h(1.0), h(2.0), h(3.0), h(4.0)];
        let b = [h(5.0), h(6.0), h(7.0), h(8.0)];
        let mut c = [h(0.0); 4];
        gemm(&a, &s, &b, &s, &mut c, h(1.0), h(0.0), false, false)?;
        let got: Vec<f64> = c.iter().map(|v| v.to_f64()).collect();
        assert_eq!(got, vec![19.0, 22.0, 43.0, 50.0]);
        Ok(())
    }

    #[test]
    fn test_gemm_folds_leading_axes() -> Result<()> {
        // [2, 1, 2, 2] @ [2, 1, 2, 2]: two independent 2x2 products
        let s = Shape::from(vec![2, 1, 2, 2]);
        let a = [1.0f32, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0];
        let b = [1.0f32, 2.0, 3.0, 4.0, 1.0, 2.0, 3.0, 4.0];
        let mut c = [0.0f32; 8];
        gemm(&a, &s, &b, &s, &mut c, 1.0, 0.0, false, false)?;
        assert_eq!(c, [1.0, 2.0, 3.0, 4.0, 3.0, 4.0, 1.0, 2.0]);

        let mut short = [0.0f32; 4];
        assert!(gemm(&a, &s, &b, &s, &mut short, 1.0, 0.0, false, false).is_err());
        Ok(())
    }

    #[test]
    fn test_permute_and_add() {
        // [2, 3] -> [3, 2]
        let src = [0, 1, 2, 3, 4, 5];
        let mut dst = [0; 6];
        permute(&src, &Shape::from((2, 3)), &[1, 0], &mut dst);
        assert_eq!(dst, [0, 3, 1, 4, 2, 5]);

        let add = [10; 6];
        permute_add(&src, &Shape::from((2, 3)), &[1, 0], &add, &mut dst);
        assert_eq!(dst, [10, 13, 11, 14, 12, 15]);
    }

    #[test]
    fn test_permute_rank3_gather_semantics() {
        // result axis i is source axis perm[i]
        let shape = Shape::from((2, 3, 4));
        let src: Vec<i32> = (0..24).collect();
        let mut dst = vec![0; 24];
        permute(&src, &shape, &[2, 0, 1], &mut dst);
        // result shape [4, 2, 3]; result[k, i, j] = src[i, j, k]
        for k in 0..4 {
            for i in 0..2 {
                for j in 0..3 {
                    assert_eq!(dst[k * 6 + i * 3 + j], src[i * 12 + j * 4 + k]);
                }
            }
        }
    }

    #[test]
    fn test_stack_unstack() {
        let a = vec![1, 2, 3, 4];
        let b = vec![5, 6];
        let (sa, sb) = (Shape::from((2, 2)), Shape::from((2, 1)));
        let mut dst = [0; 6];
        stack(&[(&a[..], &sa), (&b[..], &sb)], 1, &mut dst);
        assert_eq!(dst, [1, 2, 5, 3, 4, 6]);

        let mut parts = [(vec![0; 4], &sa), (vec![0; 2], &sb)];
        unstack(&dst, &Shape::from((2, 3)), 1, &mut parts);
        assert_eq!(parts[0].0, a);
        assert_eq!(parts[1].0, b);
    }

    #[test]
    fn test_reverse_and_band() {
        let mut dst = [0; 6];
        reverse(&[1, 2, 3, 4, 5, 6], &Shape::from((3, 2)), &mut dst);
        assert_eq!(dst, [5, 6, 3, 4, 1, 2]);

        let m = [1, 2, 3, 4, 5, 6, 7, 8, 9];
        let mut lower = [0; 9];
        band(&m, &Shape::from((3, 3)), &mut lower, None, Some(0));
        assert_eq!(lower, [1, 0, 0, 4, 5, 0, 7, 8, 9]);
    }

    #[test]
    fn test_img2col_padding() -> Result<()> {
        // one 2x2 image, 2x2 kernel, padding 1 -> 3x3 output positions
        let params = Im2ColParams {
            kernel_height: 2,
            kernel_width: 2,
            padding: 1,
            stride: 1,
        };
        let image = [1.0f64, 2.0, 3.0, 4.0];
        let shape = Shape::from((1, 1, 2, 2));
        let mut cols = vec![0.0; 4 * 9];
        img2col(&image, &shape, &mut cols, params)?;
        // kernel element (0, 0) sees the image shifted down-right by one
        assert_eq!(&cols[..9], &[0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 0.0, 3.0, 4.0]);

        // folding back sums every pixel once per patch that contains it
        let mut back = [0.0; 4];
        col2img(&cols, &mut back, &shape, params)?;
        assert_eq!(back, [4.0, 8.0, 12.0, 16.0]);
        Ok(())
    }
}
