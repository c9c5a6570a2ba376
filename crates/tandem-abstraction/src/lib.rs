//! Engine abstraction layer for Tandem.
//!
//! This crate defines the boundary between the training orchestrator and the
//! numeric engine that actually computes things. The orchestrator only ever
//! sees:
//! - [`Component`]: a trainable object exposing an ordered list of [`Parameter`]s,
//!   a train/eval switch and a state snapshot for persistence
//! - [`Loss`]: a scalar with a backward operation
//! - [`Device`] and [`Tensor`]: placement and plain data carried in batches
//!
//! A small reference CPU engine (dense `f32` tensors with explicitly supplied
//! gradients) lives alongside the traits so pipelines can be exercised end to
//! end without an external backend.

pub mod component;
pub mod device;
pub mod loss;
pub mod parameter;
pub mod tensor;

use thiserror::Error;

pub use component::{Component, ComponentState, SharedComponent, lock_component, share};
pub use device::Device;
pub use loss::{Loss, ScalarLoss, mse};
pub use parameter::Parameter;
pub use tensor::Tensor;

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Represents an error raised by the numeric engine boundary.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Tensor data and shape disagree, or two operands have different shapes.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// The expected shape.
        expected: Vec<usize>,
        /// The shape that was supplied.
        actual: Vec<usize>,
    },

    /// A row index was outside the tensor.
    #[error("Index {index} out of bounds for {len} rows")]
    IndexOutOfBounds {
        /// The offending index.
        index: usize,
        /// Number of rows available.
        len: usize,
    },

    /// A saved state does not fit the component it is loaded into.
    #[error("State mismatch: {0}")]
    StateMismatch(String),

    /// A device identifier could not be parsed.
    #[error("Invalid device: {0}")]
    InvalidDevice(String),

    /// `backward()` was called on a loss that was already consumed.
    #[error("Backward called twice on the same loss")]
    BackwardTwice,

    /// An error occurred during serialization or deserialization.
    #[error("Serialization Error: {0}")]
    Serialization(#[from] serde_json::Error),
}
