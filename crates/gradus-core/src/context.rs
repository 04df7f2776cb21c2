// Compute graph nodes
//
// Every tensor produced by a differentiable operation while some operand
// requires gradients carries a TensorContext: the operands (`sources`) and,
// for each of them, a backward function.
//
//   c = a * b
//     c.context.sources   = [a, b]
//     c.context.backward  = [|g, acc| acc + g * b,  |g, acc| acc + g * a]
//
// A backward function receives the gradient flowing into the result and the
// gradient accumulated so far for its source (None on first contribution),
// and returns the new accumulated gradient. Doing the addition inside the
// function lets shape-changing ops (slice reads, permutations) add straight
// into the accumulator instead of materialising a full-size temporary first.
//
// Functions are pure: they hold clones of whatever forward values they need
// and no mutable state.

use std::fmt;

use crate::backend::Backend;
use crate::dtype::WithDType;
use crate::error::Result;
use crate::tensor::Tensor;

/// Identity of one tensor value in the compute graph. Used as the key of the
/// gradient accumulator. Clones of a tensor share the id; every newly
/// constructed tensor gets a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorId {
    /// Generate a new unique tensor ID (uses a global atomic counter).
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// `(output gradient, accumulated gradient of the source) -> new accumulated gradient`
pub type BackwardFn<E, B> =
    Box<dyn Fn(&Tensor<E, B>, Option<&Tensor<E, B>>) -> Result<Tensor<E, B>> + Send + Sync>;

/// `output gradient -> contribution`, to be added to the accumulator.
pub type ContributionFn<E, B> = Box<dyn Fn(&Tensor<E, B>) -> Result<Tensor<E, B>> + Send + Sync>;

/// The record of which operation produced a tensor, and how to push a
/// gradient back through it to each of its operands.
pub struct TensorContext<E: WithDType, B: Backend> {
    tag: String,
    sources: Vec<Tensor<E, B>>,
    backward: Vec<BackwardFn<E, B>>,
}

impl<E: WithDType, B: Backend> TensorContext<E, B> {
    /// Context whose backward functions do their own accumulation.
    pub fn accumulating(
        tag: impl Into<String>,
        sources: Vec<Tensor<E, B>>,
        backward: Vec<BackwardFn<E, B>>,
    ) -> Self {
        debug_assert_eq!(sources.len(), backward.len());
        TensorContext {
            tag: tag.into(),
            sources,
            backward,
        }
    }

    /// Context from plain contribution functions. Each is wrapped so that
    /// its result is added to the existing accumulator, if any.
    pub fn new(
        tag: impl Into<String>,
        sources: Vec<Tensor<E, B>>,
        contributions: Vec<ContributionFn<E, B>>,
    ) -> Self {
        let backward = contributions
            .into_iter()
            .map(|f| -> BackwardFn<E, B> {
                Box::new(move |grad, acc| {
                    let contribution = f(grad)?;
                    match acc {
                        Some(acc) => acc.add(&contribution),
                        None => Ok(contribution),
                    }
                })
            })
            .collect();
        Self::accumulating(tag, sources, backward)
    }

    /// Name of the operation, e.g. `"mul"` or `"sum[1]"`.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The operands of the operation, in a fixed order per operation.
    pub fn sources(&self) -> &[Tensor<E, B>] {
        &self.sources
    }

    /// Run the backward function of source `index`.
    pub fn backpropagate(
        &self,
        index: usize,
        grad: &Tensor<E, B>,
        acc: Option<&Tensor<E, B>>,
    ) -> Result<Tensor<E, B>> {
        (self.backward[index])(grad, acc)
    }
}

impl<E: WithDType, B: Backend> fmt::Debug for TensorContext<E, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorContext")
            .field("tag", &self.tag)
            .field(
                "sources",
                &self.sources.iter().map(|s| s.id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
