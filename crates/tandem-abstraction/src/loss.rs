//! Scalar losses.

use crate::{EngineError, EngineResult, Parameter, Tensor};

/// The result of a forward pass that can be differentiated.
pub trait Loss: Send {
    /// Scalar value of the loss.
    fn value(&self) -> f64;

    /// Propagates gradients into the parameters that produced the loss.
    fn backward(&mut self) -> EngineResult<()>;
}

/// A loss whose gradients were computed alongside its value.
///
/// The reference engine has no tape; callers attach the gradient of the loss
/// with respect to each parameter and `backward` accumulates them.
#[derive(Debug)]
pub struct ScalarLoss {
    value: f64,
    gradients: Vec<(Parameter, Vec<f32>)>,
    consumed: bool,
}

impl ScalarLoss {
    #[must_use]
    pub fn new(value: f64) -> Self {
        Self { value, gradients: Vec::new(), consumed: false }
    }

    #[must_use]
    pub fn with_gradient(mut self, parameter: &Parameter, gradient: Vec<f32>) -> Self {
        self.gradients.push((parameter.clone(), gradient));
        self
    }
}

impl Loss for ScalarLoss {
    fn value(&self) -> f64 {
        self.value
    }

    fn backward(&mut self) -> EngineResult<()> {
        if self.consumed {
            return Err(EngineError::BackwardTwice);
        }
        self.consumed = true;
        for (parameter, gradient) in &self.gradients {
            parameter.accumulate_grad(gradient)?;
        }
        Ok(())
    }
}

/// Mean squared error between a parameter and a target of the same size.
pub fn mse(prediction: &Parameter, target: &Tensor) -> EngineResult<ScalarLoss> {
    let value = prediction.value();
    if value.numel() != target.numel() {
        return Err(EngineError::ShapeMismatch {
            expected: value.shape().to_vec(),
            actual: target.shape().to_vec(),
        });
    }
    let n = value.numel().max(1) as f32;
    let mut total = 0.0_f64;
    let gradient = value
        .data()
        .iter()
        .zip(target.data())
        .map(|(p, t)| {
            let diff = p - t;
            total += f64::from(diff * diff);
            2.0 * diff / n
        })
        .collect();
    Ok(ScalarLoss::new(total / f64::from(n)).with_gradient(prediction, gradient))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mse_value_and_gradient() {
        let p = Parameter::new("x", Tensor::new(vec![2], vec![1.0, 3.0]).unwrap());
        let target = Tensor::new(vec![2], vec![0.0, 1.0]).unwrap();
        let mut loss = mse(&p, &target).unwrap();
        assert!((loss.value() - 2.5).abs() < 1e-9);

        loss.backward().unwrap();
        assert_eq!(p.grad(), vec![1.0, 2.0]);
        assert!(matches!(loss.backward(), Err(EngineError::BackwardTwice)));
    }

    #[test]
    fn test_mse_size_mismatch() {
        let p = Parameter::new("x", Tensor::zeros(vec![2]));
        assert!(mse(&p, &Tensor::zeros(vec![3])).is_err());
    }
}
