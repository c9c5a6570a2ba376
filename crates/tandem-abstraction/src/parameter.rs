//! Learnable parameters of the reference engine.

use crate::{Device, EngineError, EngineResult, Tensor};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct ParamState {
    name: String,
    value: Tensor,
    grad: Vec<f32>,
    requires_grad: bool,
}

/// A shared handle to one learnable tensor and its gradient accumulator.
///
/// Cloning the handle does not copy the tensor: every clone observes the same
/// value, which is how one component instance is shared by several tasks and
/// optimizers.
#[derive(Clone)]
pub struct Parameter {
    inner: Arc<Mutex<ParamState>>,
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Parameter")
            .field("name", &state.name)
            .field("shape", &state.value.shape())
            .field("requires_grad", &state.requires_grad)
            .finish_non_exhaustive()
    }
}

impl Parameter {
    /// Creates a trainable parameter.
    #[must_use]
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self::build(name.into(), value, true)
    }

    /// Creates a parameter that never receives gradients.
    #[must_use]
    pub fn frozen(name: impl Into<String>, value: Tensor) -> Self {
        Self::build(name.into(), value, false)
    }

    fn build(name: String, value: Tensor, requires_grad: bool) -> Self {
        let grad = vec![0.0; value.numel()];
        Self { inner: Arc::new(Mutex::new(ParamState { name, value, grad, requires_grad })) }
    }

    fn lock(&self) -> MutexGuard<'_, ParamState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    #[must_use]
    pub fn requires_grad(&self) -> bool {
        self.lock().requires_grad
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.lock().value.numel()
    }

    /// Snapshot of the current value.
    #[must_use]
    pub fn value(&self) -> Tensor {
        self.lock().value.clone()
    }

    /// Replaces the value; the shape must not change.
    pub fn set_value(&self, value: Tensor) -> EngineResult<()> {
        let mut state = self.lock();
        if state.value.shape() != value.shape() {
            return Err(EngineError::ShapeMismatch {
                expected: state.value.shape().to_vec(),
                actual: value.shape().to_vec(),
            });
        }
        let device = state.value.device();
        state.value = value.to(device);
        Ok(())
    }

    /// Snapshot of the accumulated gradient.
    #[must_use]
    pub fn grad(&self) -> Vec<f32> {
        self.lock().grad.clone()
    }

    /// Adds `grad` into the accumulator. Frozen parameters ignore it.
    pub fn accumulate_grad(&self, grad: &[f32]) -> EngineResult<()> {
        let mut state = self.lock();
        if !state.requires_grad {
            return Ok(());
        }
        if grad.len() != state.grad.len() {
            return Err(EngineError::ShapeMismatch {
                expected: vec![state.grad.len()],
                actual: vec![grad.len()],
            });
        }
        for (acc, g) in state.grad.iter_mut().zip(grad) {
            *acc += g;
        }
        Ok(())
    }

    pub fn zero_grad(&self) {
        self.lock().grad.fill(0.0);
    }

    /// Runs an in-place update with mutable access to the value and read
    /// access to the gradient.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut [f32], &[f32]),
    {
        let mut state = self.lock();
        let ParamState { value, grad, .. } = &mut *state;
        f(value.data_mut(), grad);
    }

    pub fn to_device(&self, device: Device) {
        let mut state = self.lock();
        let value = std::mem::replace(&mut state.value, Tensor::zeros(Vec::new()));
        state.value = value.to(device);
    }

    /// Whether both handles point at the same storage.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
