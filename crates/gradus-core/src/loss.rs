// Loss functions
//
// Built from differentiable tensor operations, so their gradients come from
// the operations they are made of.
//
//   binary_cross_entropy       -mean(e * log(a) + (1 - e) * log(1 - a))
//   categorical_cross_entropy  -mean(log(a[.., label])) over labelled positions
//   mean_squared_error         sum((e - a)²) / batch size
//   l1_loss                    c * mean(|x|)
//   l2_loss                    c * mean(x²)

use crate::backend::Backend;
use crate::dtype::WithDType;
use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// Binary cross entropy between targets `expected` in [0, 1] and predicted
/// probabilities `actual` of the same shape.
pub fn binary_cross_entropy<E: WithDType, B: Backend>(
    expected: &Tensor<E, B>,
    actual: &Tensor<E, B>,
) -> Result<Tensor<E, B>> {
    if expected.shape() != actual.shape() {
        return Err(Error::ShapeMismatch {
            expected: expected.shape().clone(),
            got: actual.shape().clone(),
        });
    }
    let positive = expected.mul(&actual.log()?)?;
    let negative = expected
        .rsub_scalar(E::one())?
        .mul(&actual.rsub_scalar(E::one())?.log()?)?;
    positive.add(&negative)?.reduce_mean_all()?.neg()
}

/// Label that contributes nothing to [`categorical_cross_entropy`], e.g. padding.
pub const IGNORE_LABEL: i32 = -1;

/// Categorical cross entropy of class probabilities `actual` against integer
/// labels `expected`. The classes are the last axis of `actual`, which has
/// one more axis than `expected`: `[batch, classes]` with `[batch]` labels,
/// `[batch, seq, classes]` with `[batch, seq]` labels, and so on.
///
/// Positions labelled [`IGNORE_LABEL`] are left out of both the sum and the
/// count. Any other label outside `0..classes` is an error.
pub fn categorical_cross_entropy<E: WithDType, B: Backend>(
    expected: &Tensor<i32, B>,
    actual: &Tensor<E, B>,
) -> Result<Tensor<E, B>> {
    if expected.rank() + 1 != actual.rank() {
        return Err(Error::RankMismatch {
            expected: expected.rank() + 1,
            got: actual.rank(),
        });
    }
    let axis = expected.rank();
    let labels = expected.elements()?;
    let valid: Vec<E> = labels
        .iter()
        .map(|&l| if l == IGNORE_LABEL { E::zero() } else { E::one() })
        .collect();
    let count = valid.iter().filter(|&&v| v != E::zero()).count();
    let mask = Tensor::from_vec(valid, expected.shape().clone(), actual.device())?;

    // ignored positions gather 0; lift them to 1 so their log is 0
    let picked = actual.gather(expected, axis, IGNORE_LABEL)?;
    let safe = picked.add(&mask.rsub_scalar(E::one())?)?;
    safe.log()?
        .reduce_sum_all()?
        .neg()?
        .div_scalar(E::from_f64(count.max(1) as f64))
}

/// Sum of squared differences, divided by the batch size (the size of the
/// first axis) for inputs of rank 2 or more.
pub fn mean_squared_error<E: WithDType, B: Backend>(
    expected: &Tensor<E, B>,
    actual: &Tensor<E, B>,
) -> Result<Tensor<E, B>> {
    let total = expected.sub(actual)?.square()?.reduce_sum_all()?;
    let batch = if expected.rank() > 1 { expected.dims()[0] } else { 1 };
    total.div_scalar(E::from_f64(batch as f64))
}

/// L1 regularisation: `c * mean(|x|)`, with `|x|` as `leaky_relu(x, -1)`.
pub fn l1_loss<E: WithDType, B: Backend>(x: &Tensor<E, B>, c: E) -> Result<Tensor<E, B>> {
    x.leaky_relu(E::from_f64(-1.0))?
        .reduce_mean_all()?
        .mul_scalar(c)
}

/// L2 regularisation: `c * mean(x²)`.
pub fn l2_loss<E: WithDType, B: Backend>(x: &Tensor<E, B>, c: E) -> Result<Tensor<E, B>> {
    x.square()?.reduce_mean_all()?.mul_scalar(c)
}
