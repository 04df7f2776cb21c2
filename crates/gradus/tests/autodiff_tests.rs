// Integration tests for reverse-mode differentiation
//
// End-to-end graphs built through the public API on the CPU backend:
// gradient values, accumulation over shared nodes, graph order, detaching
// and second-order gradients.

use gradus::prelude::*;
use gradus::TensorId;

type T = CpuTensor<f64>;

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
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

// Scenarios

#[test]
fn test_cube_gradient() -> gradus::Result<()> {
    let dev = CpuDevice;
    let a = T::new([1.0, 2.0, 3.0, 4.0, 5.0], &dev)?.set_requires_grad(true);
    let result = a.mul(&a)?.mul(&a)?;
    assert_eq!(result.elements()?, vec![1.0, 8.0, 27.0, 64.0, 125.0]);

    let grads = result.reduce_sum_all()?.backward()?;
    let grad_a = grads.get(&a).expect("a was reached").to_f64_vec()?;
    assert_vec_approx(&grad_a, &[3.0, 12.0, 27.0, 48.0, 75.0], 1e-12);
    Ok(())
}

#[test]
fn test_axis_sum_gradient() -> gradus::Result<()> {
    let dev = CpuDevice;
    let x = T::arange(0.0, 1.0, 6, &dev)?
        .reshape((2, 3))?
        .set_requires_grad(true);
    let summed = x.reduce_sum(&[1])?;
    assert_eq!(summed.dims(), &[2]);
    assert_eq!(summed.elements()?, vec![3.0, 12.0]);

    let grads = summed.reduce_sum_all()?.backward()?;
    let grad_x = grads.get_or_zeros(&x)?;
    assert_eq!(grad_x.dims(), &[2, 3]);
    assert_eq!(grad_x.elements()?, vec![1.0; 6]);
    Ok(())
}

#[test]
fn test_broadcast_add_gradient() -> gradus::Result<()> {
    let dev = CpuDevice;
    let a = T::new([[1.0], [2.0], [3.0]], &dev)?.set_requires_grad(true);
    let b = T::new([[10.0, 20.0, 30.0, 40.0]], &dev)?.set_requires_grad(true);
    let c = a.add(&b)?;
    assert_eq!(c.dims(), &[3, 4]);
    assert_eq!(c.elements()?[5], 22.0);

    let grads = c.reduce_sum_all()?.backward()?;
    let grad_a = grads.get_or_zeros(&a)?;
    let grad_b = grads.get_or_zeros(&b)?;
    assert_eq!(grad_a.dims(), &[3, 1]);
    assert_eq!(grad_a.elements()?, vec![4.0; 3]);
    assert_eq!(grad_b.dims(), &[1, 4]);
    assert_eq!(grad_b.elements()?, vec![3.0; 4]);
    Ok(())
}

#[test]
fn test_region_write() -> gradus::Result<()> {
    let dev = CpuDevice;
    let mut x = T::zeros((4, 4), &dev)?;
    let patch = T::ones((2, 2), &dev)?;
    x.set_slice(&[Some(1..3), Some(1..3)], &patch)?;
    #[rustfmt::skip]
    let expected = vec![
        0.0, 0.0, 0.0, 0.0,
        0.0, 1.0, 1.0, 0.0,
        0.0, 1.0, 1.0, 0.0,
        0.0, 0.0, 0.0, 0.0,
    ];
    assert_eq!(x.elements()?, expected);
    Ok(())
}

#[test]
fn test_max_gradient_routes_to_argmax() -> gradus::Result<()> {
    let dev = CpuDevice;
    let x = T::new([3.0, 1.0, 4.0, 1.0, 5.0], &dev)?.set_requires_grad(true);
    let m = x.reduce_max_all()?;
    assert_eq!(m.item()?, 5.0);

    let grads = m.backward()?;
    assert_eq!(
        grads.get_or_zeros(&x)?.elements()?,
        vec![0.0, 0.0, 0.0, 0.0, 1.0]
    );
    Ok(())
}

// Graph structure

#[test]
fn test_shared_node_accumulates() -> gradus::Result<()> {
    let dev = CpuDevice;
    let x = T::new([1.5, -2.0], &dev)?.set_requires_grad(true);
    let y = x.add(&x)?;
    let order = y.operation_order();
    let ids: Vec<TensorId> = order.iter().map(|t| t.id()).collect();
    assert_eq!(ids, vec![x.id(), y.id()]);

    let grads = y.reduce_sum_all()?.backward()?;
    assert_eq!(grads.get_or_zeros(&x)?.elements()?, vec![2.0, 2.0]);
    Ok(())
}

#[test]
fn test_operation_order_diamond() -> gradus::Result<()> {
    let dev = CpuDevice;
    let x = T::new([1.0, 2.0], &dev)?.set_requires_grad(true);
    let left = x.exp()?;
    let right = x.square()?;
    let joined = left.mul(&right)?;
    let order = joined.operation_order();
    assert_eq!(order.len(), 4);
    let position = |id: TensorId| order.iter().position(|t| t.id() == id);
    assert_eq!(position(x.id()), Some(0));
    assert_eq!(position(joined.id()), Some(3));
    assert!(position(left.id()).is_some() && position(right.id()).is_some());

    // d/dx e^x * x² = e^x * (x² + 2x)
    let grads = joined.reduce_sum_all()?.backward()?;
    let got = grads.get_or_zeros(&x)?.to_f64_vec()?;
    let expected: Vec<f64> = [1.0f64, 2.0]
        .iter()
        .map(|v| v.exp() * (v * v + 2.0 * v))
        .collect();
    assert_vec_approx(&got, &expected, 1e-10);
    Ok(())
}

#[test]
fn test_untracked_operands_are_skipped() -> gradus::Result<()> {
    let dev = CpuDevice;
    let x = T::new([1.0, 2.0], &dev)?.set_requires_grad(true);
    let constant = T::new([5.0, 7.0], &dev)?;
    let y = x.mul(&constant)?.reduce_sum_all()?;
    let grads = y.backward()?;
    assert!(grads.get(&constant).is_none());
    assert_eq!(grads.get_or_zeros(&x)?.elements()?, vec![5.0, 7.0]);
    Ok(())
}

#[test]
fn test_unreached_target_gets_zeros() -> gradus::Result<()> {
    let dev = CpuDevice;
    let x = T::new([1.0, 2.0], &dev)?.set_requires_grad(true);
    let unused = T::ones((3, 2), &dev)?.set_requires_grad(true);
    let y = x.square()?.reduce_sum_all()?;
    let grads = y.gradients(&[&x, &unused], false)?;
    assert_eq!(grads[0].elements()?, vec![2.0, 4.0]);
    assert_eq!(grads[1].dims(), &[3, 2]);
    assert_eq!(grads[1].elements()?, vec![0.0; 6]);
    Ok(())
}

#[test]
fn test_detached_stops_flow() -> gradus::Result<()> {
    let dev = CpuDevice;
    let x = T::scalar(2.0, &dev)?.set_requires_grad(true);
    let y = x.mul(&x)?;
    let w = y.detached().mul(&x)?;
    let grads = w.backward()?;
    // w = 4 * x once y is cut from the graph
    assert!(approx_eq(grads.get_or_zeros(&x)?.item()?, 4.0, 1e-12));
    Ok(())
}

#[test]
fn test_discard_context_makes_a_leaf() -> gradus::Result<()> {
    let dev = CpuDevice;
    let x = T::new([1.0, 2.0], &dev)?.set_requires_grad(true);
    let mut y = x.square()?;
    y.discard_context();
    assert!(y.requires_grad());
    assert!(y.context().is_none());
    let grads = y.reduce_sum_all()?.backward()?;
    assert!(grads.get(&x).is_none());
    assert_eq!(grads.get_or_zeros(&y)?.elements()?, vec![1.0, 1.0]);
    Ok(())
}

#[test]
fn test_second_order_with_retained_graph() -> gradus::Result<()> {
    let dev = CpuDevice;
    let x = T::new([1.0, 2.0, 3.0], &dev)?.set_requires_grad(true);
    let y = x.raised_to(3.0)?.reduce_sum_all()?;

    let first = y.gradients(&[&x], true)?;
    assert_vec_approx(&first[0].to_f64_vec()?, &[3.0, 12.0, 27.0], 1e-9);
    assert!(first[0].requires_grad());

    // d/dx sum(3x²) = 6x
    let second = first[0].reduce_sum_all()?.gradients(&[&x], false)?;
    assert_vec_approx(&second[0].to_f64_vec()?, &[6.0, 12.0, 18.0], 1e-9);
    assert!(!second[0].requires_grad());
    Ok(())
}

#[test]
fn test_gradients_are_detached_by_default() -> gradus::Result<()> {
    let dev = CpuDevice;
    let x = T::new([1.0, 2.0], &dev)?.set_requires_grad(true);
    let grads = x.square()?.reduce_sum_all()?.gradients(&[&x], false)?;
    assert!(!grads[0].requires_grad());
    assert!(grads[0].context().is_none());
    Ok(())
}

// Composite graphs

#[test]
fn test_linear_layer_gradients() -> gradus::Result<()> {
    let dev = CpuDevice;
    // y = relu(x @ w + b), loss = sum(y)
    let x = T::new([[1.0, 2.0], [-1.0, 0.5]], &dev)?;
    let w = T::new([[0.5, -1.0, 2.0], [1.0, 1.0, -0.5]], &dev)?.set_requires_grad(true);
    let b = T::new([0.1, 0.2, 0.3], &dev)?.set_requires_grad(true);
    let y = x.matmul(&w)?.add(&b)?.relu()?;
    // pre-activations: [[2.6, 1.2, 1.3], [0.1, 1.7, -2.45]]
    let grads = y.reduce_sum_all()?.backward()?;

    let grad_b = grads.get_or_zeros(&b)?.to_f64_vec()?;
    assert_vec_approx(&grad_b, &[2.0, 2.0, 1.0], 1e-12);
    let grad_w = grads.get_or_zeros(&w)?.to_f64_vec()?;
    assert_vec_approx(&grad_w, &[0.0, 0.0, 1.0, 2.5, 2.5, 2.0], 1e-12);
    Ok(())
}

#[test]
fn test_write_gradients_split_between_sources() -> gradus::Result<()> {
    let dev = CpuDevice;
    let base = T::new([1.0, 2.0, 3.0, 4.0], &dev)?.set_requires_grad(true);
    let value = T::new([10.0, 20.0], &dev)?.set_requires_grad(true);
    let mut written = base.mul_scalar(1.0)?;
    written.set_slice(&[Some(1..3)], &value)?;
    assert_eq!(written.elements()?, vec![1.0, 10.0, 20.0, 4.0]);
    // the tensor written from is left untouched
    assert_eq!(base.elements()?, vec![1.0, 2.0, 3.0, 4.0]);

    let weights = T::new([1.0, 2.0, 3.0, 4.0], &dev)?;
    let grads = written.mul(&weights)?.reduce_sum_all()?.backward()?;
    assert_eq!(
        grads.get_or_zeros(&base)?.elements()?,
        vec![1.0, 0.0, 0.0, 4.0]
    );
    assert_eq!(grads.get_or_zeros(&value)?.elements()?, vec![2.0, 3.0]);
    Ok(())
}

#[test]
fn test_overlapping_reads_sum() -> gradus::Result<()> {
    let dev = CpuDevice;
    let x = T::arange(0.0, 1.0, 6, &dev)?
        .reshape((3, 2))?
        .set_requires_grad(true);
    let first = x.index(&[Some(0)])?;
    let again = x.index(&[Some(0)])?;
    let last = x.index(&[Some(-1)])?;
    let total = first.add(&again)?.add(&last)?.reduce_sum_all()?;
    let grads = total.backward()?;
    assert_eq!(
        grads.get_or_zeros(&x)?.elements()?,
        vec![2.0, 2.0, 0.0, 0.0, 1.0, 1.0]
    );
    Ok(())
}

#[test]
fn test_backward_shape_is_checked_for_every_source() -> gradus::Result<()> {
    let dev = CpuDevice;
    let x = T::ones((2, 3), &dev)?.set_requires_grad(true);
    let y = x.reshape((3, 2))?.transposed()?.mul(&x)?;
    let grads = y.reduce_sum_all()?.backward()?;
    assert_eq!(grads.get_or_zeros(&x)?.dims(), &[2, 3]);
    assert_eq!(grads.get_or_zeros(&x)?.elements()?, vec![2.0; 6]);
    Ok(())
}
