//! # gradus-core
//!
//! Tensor values, strided indexing, broadcasting, backend traits and
//! reverse-mode automatic differentiation for gradus.
//!
//! This crate provides:
//! - [`Tensor`]: n-dimensional array with automatic differentiation
//! - [`Shape`] and the [`strided`] index engine: row-major offsets and slices
//! - [`broadcast`]: broadcast shapes and binary-op dispatch plans
//! - [`Backend`]: memory and compute contract implemented per device
//! - [`GradStore`]: gradients returned by `backward()`
//! - [`loss`]: loss functions composed from tensor operations
//! - [`TensorRecord`]: the serializable form of a tensor

pub mod backend;
pub mod backprop;
pub mod broadcast;
pub mod context;
pub mod dtype;
pub mod error;
pub mod loss;
mod ops;
pub mod record;
pub mod shape;
pub mod strided;
pub mod tensor;

pub use backend::{
    Backend, BackendBuffer, BackendDevice, BinaryOp, Im2ColParams, ReduceOp, UnaryOp,
};
pub use backprop::GradStore;
pub use context::{TensorContext, TensorId};
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use record::TensorRecord;
pub use shape::Shape;
pub use tensor::{NestedArray, Tensor, TensorHandle};
