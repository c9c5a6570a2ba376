//! Per-group trainer.
//!
//! A [`Trainer`] owns the optimizer for one dependency group. It prepares
//! tasks for a phase, runs single training or validation steps and applies
//! the accumulated gradients.

use crate::error::{OrchestrationError, Result};
use crate::registry::{ComponentMap, DatasetMap};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tandem_abstraction::{Device, Parameter, SharedComponent, lock_component};
use tandem_training::config::DEFAULT_ITERATIONS;
use tandem_training::sampler::derive_seed;
use tandem_training::{
    Batch, BatchStream, CheckpointStore, ComponentConfig, ComponentKey, LrScheduler, Mode,
    Optimizer, StepOutcome, TaskArgs, TaskDescriptor, TrainingError, TrainingResult,
    build_optimizer, build_scheduler, checkpoint_filename,
};
use tracing::{debug, warn};

/// A task bound to its components and batch streams for one phase.
pub struct ExecutionContext {
    task: Arc<TaskDescriptor>,
    mode: Mode,
    components: Vec<(String, SharedComponent)>,
    streams: Vec<(String, BatchStream)>,
    length: u64,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("task", &self.task.name())
            .field("mode", &self.mode)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    #[must_use]
    pub fn task(&self) -> &Arc<TaskDescriptor> {
        &self.task
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Steps this task contributes to the phase.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    fn set_component_mode(&self) {
        for (_, component) in &self.components {
            lock_component(component).set_training(self.mode.is_training());
        }
    }

    fn next_batches(&mut self, device: Device) -> TrainingResult<BTreeMap<String, Batch>> {
        let mut batches = BTreeMap::new();
        for (name, stream) in &mut self.streams {
            let batch = stream
                .next()
                .ok_or_else(|| TrainingError::Dataset(format!("stream for '{name}' ended")))??;
            batches.insert(name.clone(), batch.to(device));
        }
        Ok(batches)
    }
}

/// Result of one task step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepResult {
    Loss(f64),
    /// The task asked to stop for the rest of the epoch.
    Halted,
}

/// Owns the optimizer and scheduler of one dependency group.
pub struct Trainer {
    label: String,
    device: Device,
    seed: u64,
    optimizer: Option<Box<dyn Optimizer>>,
    scheduler: Option<Box<dyn LrScheduler>>,
    /// Merged `iterations` of the group's components.
    iterations: Option<u64>,
    samples: u64,
    store: Arc<dyn CheckpointStore>,
}

impl fmt::Debug for Trainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trainer")
            .field("label", &self.label)
            .field("device", &self.device)
            .field("optimizer", &self.optimizer.as_ref().map(|o| o.name()))
            .field("samples", &self.samples)
            .finish_non_exhaustive()
    }
}

impl Trainer {
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        device: Device,
        seed: u64,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            label: label.into(),
            device,
            seed,
            optimizer: None,
            scheduler: None,
            iterations: None,
            samples: 0,
            store,
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Builds the group optimizer over the trainable parameters of
    /// `components`. Parameters shared between components are optimized once
    /// and components without trainable parameters are left out.
    ///
    /// The group's `iterations` also becomes the training length of every
    /// task that does not set its own.
    pub fn setup_components(
        &mut self,
        components: &[(ComponentKey, SharedComponent)],
        config: &ComponentConfig,
    ) -> Result<()> {
        self.iterations = config.iterations;
        let mut parameters: Vec<Parameter> = Vec::new();
        for (key, component) in components {
            let trainable: Vec<Parameter> = lock_component(component)
                .parameters()
                .into_iter()
                .filter(Parameter::requires_grad)
                .collect();
            if trainable.is_empty() {
                warn!(
                    group = %self.label,
                    component = %key,
                    "Component has no trainable parameters"
                );
            }
            for parameter in trainable {
                if !parameters.iter().any(|p| p.same_as(&parameter)) {
                    parameters.push(parameter);
                }
            }
        }

        if parameters.is_empty() {
            warn!(group = %self.label, "Group has nothing to optimize");
            self.optimizer = None;
            self.scheduler = None;
            return Ok(());
        }

        let learning_rate = config.learning_rate();
        let kind = config.optimizer.unwrap_or_default();
        let optimizer = build_optimizer(kind, parameters, learning_rate)?;
        debug!(
            group = %self.label,
            optimizer = optimizer.name(),
            parameters = optimizer.parameters().len(),
            learning_rate,
            "Optimizer ready"
        );
        self.optimizer = Some(optimizer);
        self.scheduler = config.scheduler.map(|kind| build_scheduler(kind, learning_rate));
        Ok(())
    }

    /// Binds `task` to its components and batch streams for a phase.
    ///
    /// Switches the bound components into the mode's behaviour. Returns
    /// `None` when the task has nothing to do in this phase: validation of a
    /// dataset without a validation segment, or of a batchless task.
    ///
    /// # Errors
    /// Fails when a dependency was never instantiated.
    pub fn setup_function(
        &self,
        task: &Arc<TaskDescriptor>,
        components: &ComponentMap,
        datasets: &DatasetMap,
        mode: Mode,
    ) -> Result<Option<ExecutionContext>> {
        let name = task.name();
        let setup_error =
            |source: TrainingError| OrchestrationError::Setup { task: name.clone(), source };

        let mut bound = Vec::new();
        for (param, factory) in task.component_params() {
            let component = components.get(factory.key()).ok_or_else(|| {
                let reason = format!("component {} was not created", factory.key());
                setup_error(TrainingError::Argument(reason))
            })?;
            bound.push((param.to_string(), Arc::clone(component)));
        }

        let config = task.config();
        let batch_size = config.batch_size();
        let mut streams = Vec::new();
        let mut segment_lengths = Vec::new();
        for (param, factory) in task.dataset_params() {
            let dataset = datasets.get(factory.key()).ok_or_else(|| {
                let reason = format!("dataset {} was not created", factory.key());
                setup_error(TrainingError::Argument(reason))
            })?;
            let segment = match mode {
                Mode::Training => Arc::clone(dataset.training()),
                Mode::Validation => match dataset.validation() {
                    Some(segment) => Arc::clone(segment),
                    None => {
                        debug!(
                            task = %name,
                            dataset = %factory.key(),
                            "No validation segment; skipping"
                        );
                        return Ok(None);
                    }
                },
            };
            segment_lengths.push(segment.len());
            let seed = derive_seed(self.seed, &format!("{name}:{param}:{mode}"));
            let stream = BatchStream::new(config.order_for(mode), segment, batch_size, seed);
            streams.push((param.to_string(), stream));
        }

        let iterations = config.iterations.or(self.iterations);
        let length = match mode {
            Mode::Training if streams.is_empty() => iterations.unwrap_or(DEFAULT_ITERATIONS),
            Mode::Training => iterations.unwrap_or_else(|| {
                let longest = segment_lengths.iter().copied().max().unwrap_or(0);
                if longest == 0 { DEFAULT_ITERATIONS } else { (longest / batch_size).max(1) as u64 }
            }),
            Mode::Validation if streams.is_empty() => return Ok(None),
            Mode::Validation => {
                let longest = segment_lengths.iter().copied().max().unwrap_or(0);
                longest.div_ceil(batch_size).max(1) as u64
            }
        };

        let context = ExecutionContext {
            task: Arc::clone(task),
            mode,
            components: bound,
            streams,
            length,
        };
        context.set_component_mode();
        Ok(Some(context))
    }

    /// Clears gradients and the sample counter before a round.
    pub fn prepare(&mut self) {
        if let Some(optimizer) = self.optimizer.as_mut() {
            optimizer.zero_grad();
        }
        self.samples = 0;
    }

    fn invoke(&self, context: &mut ExecutionContext) -> TrainingResult<(StepOutcome, u64)> {
        context.set_component_mode();
        let batches = context.next_batches(self.device)?;
        let samples = if batches.is_empty() {
            1
        } else {
            batches.values().map(|b| b.samples() as u64).sum()
        };
        let name = context.task.name();
        let mut args = TaskArgs::new(&name, context.mode, &context.components, batches);
        let outcome = context.task.call(&mut args)?;
        Ok((outcome, samples))
    }

    /// Runs one training step and backpropagates the loss.
    pub fn run_training(&mut self, context: &mut ExecutionContext) -> TrainingResult<StepResult> {
        let (outcome, samples) = self.invoke(context)?;
        let value = match outcome {
            StepOutcome::Halt => return Ok(StepResult::Halted),
            StepOutcome::Loss(mut loss) => {
                loss.backward()?;
                loss.value()
            }
            StepOutcome::Score(score) => score,
        };
        self.samples += samples;
        Ok(StepResult::Loss(value))
    }

    /// Runs one validation step; gradients are never touched.
    pub fn run_validation(&mut self, context: &mut ExecutionContext) -> TrainingResult<StepResult> {
        let (outcome, _) = self.invoke(context)?;
        Ok(match outcome {
            StepOutcome::Halt => StepResult::Halted,
            StepOutcome::Loss(loss) => StepResult::Loss(loss.value()),
            StepOutcome::Score(score) => StepResult::Loss(score),
        })
    }

    /// Applies the accumulated gradients. Does nothing when no training
    /// samples were seen since [`Self::prepare`].
    pub fn step(&mut self) -> TrainingResult<bool> {
        if self.samples == 0 {
            return Ok(false);
        }
        let Some(optimizer) = self.optimizer.as_mut() else {
            return Ok(false);
        };
        optimizer.step()?;
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.step(optimizer.as_mut());
        }
        Ok(true)
    }

    /// Runs an auxiliary task once on ordered batches from the training
    /// segments, with components in evaluation mode.
    pub fn run_once(
        &self,
        task: &Arc<TaskDescriptor>,
        components: &ComponentMap,
        datasets: &DatasetMap,
    ) -> Result<Option<f64>> {
        let name = task.name();
        let mut bound = Vec::new();
        for (param, factory) in task.component_params() {
            if let Some(component) = components.get(factory.key()) {
                lock_component(component).set_training(false);
                bound.push((param.to_string(), Arc::clone(component)));
            }
        }
        let mut batches = BTreeMap::new();
        for (param, factory) in task.dataset_params() {
            if let Some(dataset) = datasets.get(factory.key()) {
                let mut stream = BatchStream::new(
                    tandem_training::IterationOrder::Ordered,
                    Arc::clone(dataset.training()),
                    task.config().batch_size(),
                    self.seed,
                );
                if let Some(batch) = stream.next() {
                    batches.insert(param.to_string(), batch?.to(self.device));
                }
            }
        }
        let mut args = TaskArgs::new(&name, Mode::Validation, &bound, batches);
        let outcome = task.call(&mut args).map_err(TrainingError::from)?;
        Ok(match outcome {
            StepOutcome::Loss(loss) => Some(loss.value()),
            StepOutcome::Score(score) => Some(score),
            StepOutcome::Halt => None,
        })
    }

    /// Writes a checkpoint for every component with parameters.
    pub fn save(
        &self,
        components: &[(ComponentKey, SharedComponent)],
    ) -> TrainingResult<Vec<(ComponentKey, PathBuf)>> {
        let mut saved = Vec::new();
        for (key, component) in components {
            let bytes = {
                let guard = lock_component(component);
                if guard.parameters().is_empty() {
                    debug!(component = %key, "Nothing to checkpoint");
                    continue;
                }
                guard.state()?
            };
            let path = self.store.save(&checkpoint_filename(*key), &bytes)?;
            saved.push((*key, path));
        }
        Ok(saved)
    }

    #[must_use]
    pub fn optimizer_steps(&self) -> u64 {
        self.optimizer.as_ref().map_or(0, |o| o.steps())
    }

    /// Parameters the group optimizer updates.
    #[must_use]
    pub fn optimized_parameters(&self) -> usize {
        self.optimizer.as_ref().map_or(0, |o| o.parameters().len())
    }

    #[must_use]
    pub fn learning_rate(&self) -> Option<f64> {
        self.optimizer.as_ref().map(|o| o.learning_rate())
    }

    /// Samples seen since the last [`Self::prepare`].
    #[must_use]
    pub fn samples(&self) -> u64 {
        self.samples
    }
}
