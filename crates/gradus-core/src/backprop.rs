// Backpropagation: reverse-mode automatic differentiation
//
// HOW IT WORKS:
//
//   1. Tracked operations build a DAG: each result's context lists its
//      operands and one backward function per operand.
//
//   2. operation_order() walks that DAG from the root with an explicit stack
//      (no recursion, so deep graphs cannot overflow the call stack) and
//      emits a post-order: every node after all of its sources. A visited set
//      keyed by TensorId makes shared nodes appear exactly once.
//
//   3. The accumulator is seeded with grad(root) = ones_like(root). Walking
//      the order in reverse, each node's gradient is pushed to its tracked
//      sources:
//
//        acc[source] = backward_i(acc[node], acc.get(source))
//
//      The backward function does the accumulation itself; the caller only
//      replaces the entry. Untracked sources are skipped entirely.
//
//   4. Without retain_graph every stored gradient is detached, so the graph
//      built while computing gradients is released immediately. With it,
//      gradients keep their contexts and can be differentiated again.
//
// ACCUMULATION: a tensor used in several places receives the sum of all
// contributions (multivariate chain rule):
//
//   y = x * x   ->   grad_x = g * x + g * x

use std::collections::{HashMap, HashSet};

use crate::backend::Backend;
use crate::context::TensorId;
use crate::dtype::WithDType;
use crate::error::{Error, Result};
use crate::tensor::Tensor;

/// Gradients of every tracked tensor in a graph, keyed by tensor id.
///
/// Returned by `Tensor::backward`. Use `grads.get(&tensor)` to look one up.
pub struct GradStore<E: WithDType, B: Backend> {
    grads: HashMap<TensorId, Tensor<E, B>>,
}

impl<E: WithDType, B: Backend> Clone for GradStore<E, B> {
    fn clone(&self) -> Self {
        GradStore {
            grads: self.grads.clone(),
        }
    }
}

impl<E: WithDType, B: Backend> Default for GradStore<E, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: WithDType, B: Backend> GradStore<E, B> {
    pub fn new() -> Self {
        GradStore {
            grads: HashMap::new(),
        }
    }

    /// Gradient of `tensor`, if it was reached.
    pub fn get(&self, tensor: &Tensor<E, B>) -> Option<&Tensor<E, B>> {
        self.grads.get(&tensor.id())
    }

    /// Gradient of `tensor`, or zeros of its shape if it was never reached.
    pub fn get_or_zeros(&self, tensor: &Tensor<E, B>) -> Result<Tensor<E, B>> {
        match self.get(tensor) {
            Some(g) => Ok(g.clone()),
            None => Tensor::zeros_like(tensor),
        }
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    pub fn tensor_ids(&self) -> Vec<TensorId> {
        self.grads.keys().copied().collect()
    }
}

impl<E: WithDType, B: Backend> Tensor<E, B> {
    /// Post-order of the tracked graph below this tensor: every node comes
    /// after all of its sources, each node exactly once, this tensor last.
    pub fn operation_order(&self) -> Vec<Tensor<E, B>> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(self.id());
        // (node, index of the next source to look at)
        let mut stack: Vec<(Tensor<E, B>, usize)> = vec![(self.clone(), 0)];

        while let Some((node, next)) = stack.pop() {
            let sources = node.context().map_or(&[][..], |c| c.sources());
            let unvisited = sources[next.min(sources.len())..]
                .iter()
                .position(|s| s.requires_grad() && !visited.contains(&s.id()));
            match unvisited {
                Some(offset) => {
                    let i = next + offset;
                    let source = sources[i].clone();
                    visited.insert(source.id());
                    stack.push((node.clone(), i + 1));
                    stack.push((source, 0));
                }
                None => order.push(node),
            }
        }
        order
    }

    /// Run the reverse pass and return the accumulator of every reached node.
    fn backpropagate(&self, retain_graph: bool) -> Result<HashMap<TensorId, Tensor<E, B>>> {
        let order = self.operation_order();
        log::debug!(
            "backprop: {} nodes from root {:?} (retain_graph={})",
            order.len(),
            self.id(),
            retain_graph
        );

        let mut grads: HashMap<TensorId, Tensor<E, B>> = HashMap::new();
        grads.insert(self.id(), Tensor::ones_like(self)?);

        for node in order.iter().rev() {
            let context = match node.context() {
                Some(context) => context,
                None => continue,
            };
            let grad = match grads.get(&node.id()) {
                Some(grad) => grad.clone(),
                None => continue,
            };
            log::trace!("backprop: {:?} via {}", node.id(), context.tag());

            for (i, source) in context.sources().iter().enumerate() {
                if !source.requires_grad() {
                    continue;
                }
                let contribution = context.backpropagate(i, &grad, grads.get(&source.id()))?;
                if contribution.shape() != source.shape() {
                    return Err(Error::ShapeMismatch {
                        expected: source.shape().clone(),
                        got: contribution.shape().clone(),
                    });
                }
                let contribution = if retain_graph {
                    contribution
                } else {
                    contribution.detached()
                };
                grads.insert(source.id(), contribution);
            }
        }
        log::debug!("backprop: done, {} gradients", grads.len());
        Ok(grads)
    }

    /// Gradients of this tensor with respect to each of `of`. A tensor that
    /// did not contribute to this one gets zeros of its shape.
    ///
    /// With `retain_graph`, the returned gradients are themselves tracked
    /// and can be differentiated again.
    pub fn gradients(
        &self,
        of: &[&Tensor<E, B>],
        retain_graph: bool,
    ) -> Result<Vec<Tensor<E, B>>> {
        let grads = self.backpropagate(retain_graph)?;
        of.iter()
            .map(|t| match grads.get(&t.id()) {
                Some(g) => Ok(g.clone()),
                None => Tensor::zeros_like(t),
            })
            .collect()
    }

    /// Gradients of this tensor with respect to every tracked tensor in its graph.
    pub fn backward(&self) -> Result<GradStore<E, B>> {
        Ok(GradStore {
            grads: self.backpropagate(false)?,
        })
    }
}
