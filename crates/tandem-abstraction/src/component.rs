//! Trainable components.

use crate::{Device, EngineError, EngineResult, Parameter, Tensor};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A component instance shared by every task (and group) that depends on its type.
pub type SharedComponent = Arc<Mutex<Box<dyn Component>>>;

/// Wraps a component for sharing.
pub fn share<C: Component>(component: C) -> SharedComponent {
    Arc::new(Mutex::new(Box::new(component)))
}

/// Locks a shared component. A poisoned lock is recovered: a task that
/// panicked mid-step leaves parameters in whatever state it reached.
pub fn lock_component(component: &SharedComponent) -> MutexGuard<'_, Box<dyn Component>> {
    component.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serialized learnable state of a component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentState {
    pub parameters: Vec<NamedTensor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub value: Tensor,
}

/// A trainable object exposing an ordered collection of parameters.
///
/// The default persistence methods snapshot every parameter by name and
/// refuse to restore a state whose names or shapes differ.
pub trait Component: Any + Send {
    /// Learnable parameters, in a stable order.
    fn parameters(&self) -> Vec<Parameter>;

    /// Switches between training and evaluation behaviour.
    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    /// Relocates every parameter to `device`.
    fn to_device(&mut self, device: Device) -> EngineResult<()> {
        for parameter in self.parameters() {
            parameter.to_device(device);
        }
        Ok(())
    }

    /// Snapshot of the learnable state.
    fn state(&self) -> EngineResult<Vec<u8>> {
        let state = ComponentState {
            parameters: self
                .parameters()
                .iter()
                .map(|p| NamedTensor { name: p.name(), value: p.value() })
                .collect(),
        };
        Ok(serde_json::to_vec(&state)?)
    }

    /// Restores a snapshot produced by [`Component::state`].
    fn load_state(&mut self, bytes: &[u8]) -> EngineResult<()> {
        let state: ComponentState = serde_json::from_slice(bytes)
            .map_err(|e| EngineError::StateMismatch(format!("unreadable state: {e}")))?;
        let parameters = self.parameters();
        if state.parameters.len() != parameters.len() {
            return Err(EngineError::StateMismatch(format!(
                "expected {} parameters, found {}",
                parameters.len(),
                state.parameters.len()
            )));
        }
        for (parameter, saved) in parameters.iter().zip(&state.parameters) {
            if parameter.name() != saved.name {
                return Err(EngineError::StateMismatch(format!(
                    "parameter `{}` found where `{}` was expected",
                    saved.name,
                    parameter.name()
                )));
            }
            if parameter.value().shape() != saved.value.shape() {
                return Err(EngineError::StateMismatch(format!(
                    "parameter `{}` has shape {:?}, saved {:?}",
                    saved.name,
                    parameter.value().shape(),
                    saved.value.shape()
                )));
            }
        }
        for (parameter, saved) in parameters.iter().zip(state.parameters) {
            parameter.set_value(saved.value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Affine {
        weight: Parameter,
        bias: Parameter,
        training: bool,
    }

    impl Affine {
        fn new(width: usize) -> Self {
            Self {
                weight: Parameter::new("weight", Tensor::full(vec![width], 1.0)),
                bias: Parameter::new("bias", Tensor::zeros(vec![1])),
                training: true,
            }
        }
    }

    impl Component for Affine {
        fn parameters(&self) -> Vec<Parameter> {
            vec![self.weight.clone(), self.bias.clone()]
        }

        fn set_training(&mut self, training: bool) {
            self.training = training;
        }

        fn is_training(&self) -> bool {
            self.training
        }
    }

    #[test]
    fn test_state_restores_values() {
        let source = Affine::new(2);
        source.weight.update(|v, _| v.copy_from_slice(&[3.0, 4.0]));
        let bytes = source.state().unwrap();

        let mut target = Affine::new(2);
        target.load_state(&bytes).unwrap();
        assert_eq!(target.weight.value().data(), &[3.0, 4.0]);
    }

    #[test]
    fn test_state_rejects_other_shapes() {
        let bytes = Affine::new(3).state().unwrap();
        let mut target = Affine::new(2);
        assert!(matches!(target.load_state(&bytes), Err(EngineError::StateMismatch(_))));
        assert_eq!(target.weight.value().data(), &[1.0, 1.0]);
    }

    #[test]
    fn test_state_rejects_truncated_data() {
        let bytes = concat!(
            r#"{"parameters":[{"name":"weight","value":{"shape":[2],"data":[7.0]}},"#,
            r#"{"name":"bias","value":{"shape":[1],"data":[0.0]}}]}"#,
        )
        .as_bytes();
        let mut target = Affine::new(2);
        assert!(matches!(target.load_state(bytes), Err(EngineError::StateMismatch(_))));
        assert_eq!(target.weight.value().data(), &[1.0, 1.0]);
    }

    #[test]
    fn test_shared_component_downcasts() {
        let shared = share(Affine::new(1));
        let mut guard = lock_component(&shared);
        guard.set_training(false);
        let any: &dyn Any = &**guard;
        assert!(any.downcast_ref::<Affine>().is_some_and(|a| !a.training));
    }
}
