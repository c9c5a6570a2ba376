//! Optimizers over reference-engine parameters.

use crate::config::OptimizerKind;
use crate::error::{TrainingError, TrainingResult};
use tandem_abstraction::Parameter;

/// Applies gradient updates to a fixed set of parameters.
pub trait Optimizer: Send {
    fn name(&self) -> &'static str;

    /// Clears the gradient accumulators of every managed parameter.
    fn zero_grad(&mut self);

    /// Applies one update from the accumulated gradients.
    fn step(&mut self) -> TrainingResult<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, learning_rate: f64);

    /// Number of updates applied so far.
    fn steps(&self) -> u64;

    fn parameters(&self) -> &[Parameter];
}

/// Builds the optimizer named by `kind`.
pub fn build_optimizer(
    kind: OptimizerKind,
    parameters: Vec<Parameter>,
    learning_rate: f64,
) -> TrainingResult<Box<dyn Optimizer>> {
    if !learning_rate.is_finite() || learning_rate <= 0.0 {
        return Err(TrainingError::Optimizer(format!("invalid learning rate {learning_rate}")));
    }
    Ok(match kind {
        OptimizerKind::Sgd { momentum } => Box::new(Sgd::new(parameters, learning_rate, momentum)),
        OptimizerKind::Adam { beta1, beta2, eps } => {
            Box::new(Adam::new(parameters, learning_rate, beta1, beta2, eps))
        }
    })
}

/// Stochastic gradient descent with optional momentum.
#[derive(Debug)]
pub struct Sgd {
    parameters: Vec<Parameter>,
    learning_rate: f64,
    momentum: f64,
    velocity: Vec<Vec<f32>>,
    steps: u64,
}

impl Sgd {
    #[must_use]
    pub fn new(parameters: Vec<Parameter>, learning_rate: f64, momentum: f64) -> Self {
        let velocity = parameters.iter().map(|p| vec![0.0; p.numel()]).collect();
        Self { parameters, learning_rate, momentum, velocity, steps: 0 }
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &'static str {
        "sgd"
    }

    fn zero_grad(&mut self) {
        for parameter in &self.parameters {
            parameter.zero_grad();
        }
    }

    fn step(&mut self) -> TrainingResult<()> {
        let lr = self.learning_rate as f32;
        let momentum = self.momentum as f32;
        for (parameter, velocity) in self.parameters.iter().zip(&mut self.velocity) {
            parameter.update(|value, grad| {
                for ((v, g), vel) in value.iter_mut().zip(grad).zip(velocity.iter_mut()) {
                    *vel = momentum * *vel + g;
                    *v -= lr * *vel;
                }
            });
        }
        self.steps += 1;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    fn steps(&self) -> u64 {
        self.steps
    }

    fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }
}

/// Adam with bias correction.
#[derive(Debug)]
pub struct Adam {
    parameters: Vec<Parameter>,
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    first_moment: Vec<Vec<f32>>,
    second_moment: Vec<Vec<f32>>,
    steps: u64,
}

impl Adam {
    #[must_use]
    pub fn new(
        parameters: Vec<Parameter>,
        learning_rate: f64,
        beta1: f64,
        beta2: f64,
        eps: f64,
    ) -> Self {
        let zeros = || parameters.iter().map(|p| vec![0.0; p.numel()]).collect::<Vec<_>>();
        let first_moment = zeros();
        let second_moment = zeros();
        Self { parameters, learning_rate, beta1, beta2, eps, first_moment, second_moment, steps: 0 }
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &'static str {
        "adam"
    }

    fn zero_grad(&mut self) {
        for parameter in &self.parameters {
            parameter.zero_grad();
        }
    }

    fn step(&mut self) -> TrainingResult<()> {
        self.steps += 1;
        let t = i32::try_from(self.steps).unwrap_or(i32::MAX);
        let correction1 = 1.0 - self.beta1.powi(t);
        let correction2 = 1.0 - self.beta2.powi(t);
        let step_size = (self.learning_rate / correction1) as f32;
        let (beta1, beta2, eps) = (self.beta1 as f32, self.beta2 as f32, self.eps as f32);
        let correction2 = correction2 as f32;

        for ((parameter, m), v) in
            self.parameters.iter().zip(&mut self.first_moment).zip(&mut self.second_moment)
        {
            parameter.update(|value, grad| {
                for (i, g) in grad.iter().enumerate() {
                    m[i] = beta1 * m[i] + (1.0 - beta1) * g;
                    v[i] = beta2 * v[i] + (1.0 - beta2) * g * g;
                    let denom = (v[i] / correction2).sqrt() + eps;
                    value[i] -= step_size * m[i] / denom;
                }
            });
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    fn steps(&self) -> u64 {
        self.steps
    }

    fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }
}
