//! # Gradus
//!
//! Reverse-mode automatic differentiation over strided n-dimensional tensors.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use gradus::prelude::*;
//!
//! # fn main() -> gradus::Result<()> {
//! let dev = CpuDevice;
//! let a = CpuTensor::<f32>::new([1.0, 2.0, 3.0], &dev)?.set_requires_grad(true);
//! let y = a.mul(&a)?.reduce_sum_all()?;
//! let grads = y.backward()?;
//! assert_eq!(grads.get_or_zeros(&a)?.elements()?, vec![2.0, 4.0, 6.0]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `gradus-core` | Tensor, Shape, DType, strided indexing, Backend trait, autograd, losses |
//! | `gradus-cpu` | CPU backend with rayon parallelism |

/// Re-export core types.
pub use gradus_core::{
    backend::{Backend, BackendBuffer, BackendDevice, BinaryOp, Im2ColParams, ReduceOp, UnaryOp},
    DType, Error, GradStore, NestedArray, Result, Shape, Tensor, TensorContext, TensorId,
    TensorRecord, WithDType,
};

/// Re-export the CPU backend.
pub use gradus_cpu::{CpuBackend, CpuBuffer, CpuDevice, CpuTensor};

/// Loss functions.
pub mod loss {
    pub use gradus_core::loss::*;
}

/// Index arithmetic and broadcasting helpers.
pub mod layout {
    pub use gradus_core::broadcast::{broadcast_shape, BroadcastMode, BroadcastPlan};
    pub use gradus_core::strided::{iterate, linear_index, strides, unravel_index};
}

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::loss::{
        binary_cross_entropy, categorical_cross_entropy, l1_loss, l2_loss, mean_squared_error,
    };
    pub use crate::{
        Backend, CpuBackend, CpuDevice, CpuTensor, DType, Error, GradStore, Im2ColParams, Result,
        Shape, Tensor, TensorRecord, WithDType,
    };
}
