//! Learning-rate schedulers.

use crate::config::SchedulerKind;
use crate::optim::Optimizer;

pub trait LrScheduler: Send {
    /// Advances the schedule by one optimizer update.
    fn step(&mut self, optimizer: &mut dyn Optimizer);
}

#[must_use]
pub fn build_scheduler(kind: SchedulerKind, base_lr: f64) -> Box<dyn LrScheduler> {
    match kind {
        SchedulerKind::Step { step_size, gamma } => {
            Box::new(StepLr::new(base_lr, step_size, gamma))
        }
        SchedulerKind::Exponential { gamma } => Box::new(ExponentialLr::new(base_lr, gamma)),
    }
}

/// Decays by `gamma` every `step_size` updates.
#[derive(Debug, Clone)]
pub struct StepLr {
    base_lr: f64,
    step_size: u64,
    gamma: f64,
    updates: u64,
}

impl StepLr {
    #[must_use]
    pub fn new(base_lr: f64, step_size: u64, gamma: f64) -> Self {
        Self { base_lr, step_size: step_size.max(1), gamma, updates: 0 }
    }
}

impl LrScheduler for StepLr {
    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.updates += 1;
        let decays = i32::try_from(self.updates / self.step_size).unwrap_or(i32::MAX);
        optimizer.set_learning_rate(self.base_lr * self.gamma.powi(decays));
    }
}

/// Decays by `gamma` on every update.
#[derive(Debug, Clone)]
pub struct ExponentialLr {
    base_lr: f64,
    gamma: f64,
    updates: u64,
}

impl ExponentialLr {
    #[must_use]
    pub fn new(base_lr: f64, gamma: f64) -> Self {
        Self { base_lr, gamma, updates: 0 }
    }
}

impl LrScheduler for ExponentialLr {
    fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.updates += 1;
        let exponent = i32::try_from(self.updates).unwrap_or(i32::MAX);
        optimizer.set_learning_rate(self.base_lr * self.gamma.powi(exponent));
    }
}
