//! Per-task and per-component configuration records.
//!
//! Configuration lives in side-tables owned by the registry rather than on
//! the task functions or component types themselves. Both records are plain
//! serde structs so they can be written declaratively in task manifests.

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_EPOCHS: u32 = 1;
/// Iterations per epoch for a task whose training segment reports no length.
pub const DEFAULT_ITERATIONS: u64 = 100;
pub const DEFAULT_LEARNING_RATE: f64 = 1e-2;

/// Which phase of an epoch a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Training,
    Validation,
}

impl Mode {
    #[must_use]
    pub fn is_training(self) -> bool {
        self == Self::Training
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Training => f.write_str("training"),
            Self::Validation => f.write_str("validation"),
        }
    }
}

/// How batches are drawn from a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOrder {
    /// Uniform sampling with replacement.
    Random,
    /// Contiguous windows that wrap around the segment.
    Ordered,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd {
        #[serde(default)]
        momentum: f64,
    },
    Adam {
        #[serde(default = "default_beta1")]
        beta1: f64,
        #[serde(default = "default_beta2")]
        beta2: f64,
        #[serde(default = "default_eps")]
        eps: f64,
    },
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_eps() -> f64 {
    1e-8
}

impl Default for OptimizerKind {
    fn default() -> Self {
        Self::Adam { beta1: default_beta1(), beta2: default_beta2(), eps: default_eps() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Multiplies the learning rate by `gamma` every `step_size` updates.
    Step { step_size: u64, gamma: f64 },
    /// Multiplies the learning rate by `gamma` on every update.
    Exponential { gamma: f64 },
}

/// Settings attached to one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskConfig {
    /// Training steps per epoch. Derived from the dataset when unset.
    pub iterations: Option<u64>,
    pub epochs: Option<u32>,
    pub batch_size: Option<usize>,
    /// Batch order during training (random when unset).
    pub order: Option<IterationOrder>,
    /// Batch order during validation (ordered when unset).
    pub validation_order: Option<IterationOrder>,
    /// Training loss at or below which the task counts as converged.
    pub threshold: Option<f64>,
    pub learning_rate: Option<f64>,
    pub optimizer: Option<OptimizerKind>,
    pub scheduler: Option<SchedulerKind>,
}

impl TaskConfig {
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    #[must_use]
    pub fn epochs(&self) -> u32 {
        self.epochs.unwrap_or(DEFAULT_EPOCHS)
    }

    #[must_use]
    pub fn order_for(&self, mode: Mode) -> IterationOrder {
        match mode {
            Mode::Training => self.order.unwrap_or(IterationOrder::Random),
            Mode::Validation => self.validation_order.unwrap_or(IterationOrder::Ordered),
        }
    }

    /// Replaces every field that `overrides` sets.
    pub fn overlay(&mut self, overrides: &TaskConfig) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if overrides.$field.is_some() {
                    self.$field = overrides.$field;
                })*
            };
        }
        take!(
            iterations,
            epochs,
            batch_size,
            order,
            validation_order,
            threshold,
            learning_rate,
            optimizer,
            scheduler
        );
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.iterations == Some(0) {
            return Err(TrainingError::InvalidConfig("iterations must be >= 1".to_string()));
        }
        if self.epochs == Some(0) {
            return Err(TrainingError::InvalidConfig("epochs must be >= 1".to_string()));
        }
        if self.batch_size == Some(0) {
            return Err(TrainingError::InvalidConfig("batch_size must be >= 1".to_string()));
        }
        validate_learning_rate(self.learning_rate)?;
        validate_scheduler(self.scheduler.as_ref())?;
        Ok(())
    }
}

/// Settings attached to one component type, merged across every task that
/// depends on it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComponentConfig {
    pub iterations: Option<u64>,
    pub epochs: Option<u32>,
    pub threshold: Option<f64>,
    pub learning_rate: Option<f64>,
    pub optimizer: Option<OptimizerKind>,
    pub scheduler: Option<SchedulerKind>,
}

fn max_option<T: Ord + Copy>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

impl ComponentConfig {
    /// Folds a task's request in: limits take the maximum, the remaining
    /// settings keep the first explicit value.
    pub fn merge_task(&mut self, task: &TaskConfig) {
        self.merge(&ComponentConfig {
            iterations: task.iterations,
            epochs: task.epochs,
            threshold: task.threshold,
            learning_rate: task.learning_rate,
            optimizer: task.optimizer,
            scheduler: task.scheduler,
        });
    }

    pub fn merge(&mut self, other: &ComponentConfig) {
        self.iterations = max_option(self.iterations, other.iterations);
        self.epochs = max_option(self.epochs, other.epochs);
        self.threshold = self.threshold.or(other.threshold);
        self.learning_rate = self.learning_rate.or(other.learning_rate);
        self.optimizer = self.optimizer.or(other.optimizer);
        self.scheduler = self.scheduler.or(other.scheduler);
    }

    #[must_use]
    pub fn epochs(&self) -> u32 {
        self.epochs.unwrap_or(DEFAULT_EPOCHS)
    }

    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate.unwrap_or(DEFAULT_LEARNING_RATE)
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.epochs == Some(0) {
            return Err(TrainingError::InvalidConfig("epochs must be >= 1".to_string()));
        }
        validate_learning_rate(self.learning_rate)?;
        validate_scheduler(self.scheduler.as_ref())?;
        Ok(())
    }
}

fn validate_learning_rate(learning_rate: Option<f64>) -> TrainingResult<()> {
    match learning_rate {
        Some(lr) if !lr.is_finite() || lr <= 0.0 => {
            Err(TrainingError::InvalidConfig("learning_rate must be > 0".to_string()))
        }
        _ => Ok(()),
    }
}

fn validate_scheduler(scheduler: Option<&SchedulerKind>) -> TrainingResult<()> {
    match scheduler {
        Some(SchedulerKind::Step { step_size: 0, .. }) => {
            Err(TrainingError::InvalidConfig("scheduler step_size must be >= 1".to_string()))
        }
        Some(SchedulerKind::Step { gamma, .. } | SchedulerKind::Exponential { gamma })
            if !gamma.is_finite() || *gamma <= 0.0 =>
        {
            Err(TrainingError::InvalidConfig("scheduler gamma must be > 0".to_string()))
        }
        _ => Ok(()),
    }
}
