//! State machine driving one dependency group through its epochs.
//!
//! Each epoch has a training phase followed by a validation phase. A phase
//! advances one unit of work at a time: a single batch step for every task
//! still active in the phase. Phase transitions happen eagerly after a
//! unit, so a group reports completion in the round that finished it.

use crate::error::Result;
use crate::grouping::Group;
use crate::registry::{ComponentMap, DatasetMap};
use crate::trainer::{ExecutionContext, StepResult, Trainer};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tandem_abstraction::SharedComponent;
use tandem_training::{
    ComponentConfig, ComponentKey, GroupMetrics, Mode, ProgressEvent, ProgressSink, TaskDescriptor,
};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Pending,
    Running { epoch: u32, mode: Mode },
    Completed,
    Cancelled,
}

/// What a call to [`GroupRun::advance`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// One unit ran; `steps` tasks produced a loss.
    Progressed { steps: usize },
    /// The group has no work left.
    Exhausted,
}

#[derive(Debug, Default, Clone, Copy)]
struct RunningMean {
    count: u64,
    mean: f64,
}

impl RunningMean {
    fn push(&mut self, value: f64) {
        self.count += 1;
        self.mean += (value - self.mean) / self.count as f64;
    }

    fn value(self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }
}

#[derive(Debug)]
struct ActiveTask {
    context: ExecutionContext,
    stats: RunningMean,
}

/// One dependency group and its progress through the run.
pub struct GroupRun {
    label: String,
    tasks: Vec<Arc<TaskDescriptor>>,
    components: Vec<(ComponentKey, SharedComponent)>,
    trainer: Trainer,
    epochs: u32,
    threshold: Option<f64>,
    state: GroupState,
    active: Vec<ActiveTask>,
    retired: Vec<(String, RunningMean)>,
    cursor: u64,
    budget: u64,
    halted: HashSet<String>,
    converged: HashSet<String>,
    rounds: u64,
    training_steps: u64,
    epochs_completed: u32,
    last_train_loss: Option<f64>,
    last_validation_loss: Option<f64>,
    saved: bool,
}

impl fmt::Debug for GroupRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupRun")
            .field("label", &self.label)
            .field("state", &self.state)
            .field("epochs", &self.epochs)
            .field("rounds", &self.rounds)
            .finish_non_exhaustive()
    }
}

impl GroupRun {
    /// Wraps a group whose trainer already has its optimizer set up.
    #[must_use]
    pub fn new(
        group: &Group,
        components: Vec<(ComponentKey, SharedComponent)>,
        trainer: Trainer,
        config: &ComponentConfig,
    ) -> Self {
        let epochs = group
            .tasks()
            .iter()
            .map(|t| t.config().epochs())
            .fold(config.epochs(), u32::max);
        Self {
            label: group.label(),
            tasks: group.tasks().to_vec(),
            components,
            trainer,
            epochs,
            threshold: config.threshold,
            state: GroupState::Pending,
            active: Vec::new(),
            retired: Vec::new(),
            cursor: 0,
            budget: 0,
            halted: HashSet::new(),
            converged: HashSet::new(),
            rounds: 0,
            training_steps: 0,
            epochs_completed: 0,
            last_train_loss: None,
            last_validation_loss: None,
            saved: false,
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn state(&self) -> GroupState {
        self.state
    }

    #[must_use]
    pub fn epochs(&self) -> u32 {
        self.epochs
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self.state, GroupState::Completed | GroupState::Cancelled)
    }

    #[must_use]
    pub fn components(&self) -> &[(ComponentKey, SharedComponent)] {
        &self.components
    }

    pub fn trainer_mut(&mut self) -> &mut Trainer {
        &mut self.trainer
    }

    #[must_use]
    pub fn trainer(&self) -> &Trainer {
        &self.trainer
    }

    /// Rounds this group took part in.
    #[must_use]
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    pub(crate) fn record_round(&mut self) {
        self.rounds += 1;
    }

    pub(crate) fn is_saved(&self) -> bool {
        self.saved
    }

    pub(crate) fn mark_saved(&mut self) {
        self.saved = true;
    }

    /// Stops the group where it is. A completed group stays completed.
    pub fn cancel(&mut self) {
        if self.state != GroupState::Completed {
            self.state = GroupState::Cancelled;
            self.active.clear();
        }
    }

    /// Runs the next unit of work.
    ///
    /// # Errors
    /// Only setup failures are returned; a failing task is dropped from the
    /// current phase and the group carries on.
    pub fn advance(
        &mut self,
        components: &ComponentMap,
        datasets: &DatasetMap,
        progress: &dyn ProgressSink,
    ) -> Result<Advance> {
        self.settle(components, datasets, progress)?;
        let GroupState::Running { epoch, mode } = self.state else {
            return Ok(Advance::Exhausted);
        };

        let steps = self.run_unit(epoch, mode, progress);
        self.cursor += 1;
        progress.on_event(ProgressEvent::Step {
            group: self.label.clone(),
            epoch,
            mode,
            step: self.cursor,
            total: Some(self.budget),
        });

        let cursor = self.cursor;
        let mut index = 0;
        while index < self.active.len() {
            if self.active[index].context.length() <= cursor {
                self.retire(index);
            } else {
                index += 1;
            }
        }

        self.settle(components, datasets, progress)?;
        Ok(Advance::Progressed { steps })
    }

    /// Moves through phase boundaries until there is work or the group is done.
    fn settle(
        &mut self,
        components: &ComponentMap,
        datasets: &DatasetMap,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        loop {
            let (epoch, mode) = match self.state {
                GroupState::Completed | GroupState::Cancelled => return Ok(()),
                GroupState::Pending => (0, Mode::Training),
                GroupState::Running { epoch, mode } => {
                    if !self.active.is_empty() && self.cursor < self.budget {
                        return Ok(());
                    }
                    self.finish_phase(epoch, mode, progress);
                    match mode {
                        Mode::Training => (epoch, Mode::Validation),
                        Mode::Validation => {
                            self.epochs_completed = epoch + 1;
                            self.halted.clear();
                            if epoch + 1 >= self.epochs {
                                info!(
                                    group = %self.label,
                                    epochs = self.epochs_completed,
                                    "Group completed"
                                );
                                self.state = GroupState::Completed;
                                return Ok(());
                            }
                            (epoch + 1, Mode::Training)
                        }
                    }
                }
            };
            self.enter_phase(epoch, mode, components, datasets, progress)?;
        }
    }

    fn enter_phase(
        &mut self,
        epoch: u32,
        mode: Mode,
        components: &ComponentMap,
        datasets: &DatasetMap,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        self.state = GroupState::Running { epoch, mode };
        self.cursor = 0;
        self.active.clear();
        self.retired.clear();

        for task in &self.tasks {
            let name = task.name();
            let converged = mode.is_training() && self.converged.contains(&name);
            if converged || self.halted.contains(&name) {
                continue;
            }
            if let Some(context) = self.trainer.setup_function(task, components, datasets, mode)? {
                self.active.push(ActiveTask { context, stats: RunningMean::default() });
            }
        }
        self.budget = self.active.iter().map(|t| t.context.length()).max().unwrap_or(0);

        debug!(
            group = %self.label,
            epoch,
            mode = %mode,
            tasks = self.active.len(),
            steps = self.budget,
            "Entering phase"
        );
        progress.on_event(ProgressEvent::PhaseStarted {
            group: self.label.clone(),
            epoch,
            mode,
            total: Some(self.budget),
        });
        Ok(())
    }

    fn run_unit(&mut self, epoch: u32, mode: Mode, progress: &dyn ProgressSink) -> usize {
        let mut steps = 0;
        let mut index = 0;
        while index < self.active.len() {
            let task = &mut self.active[index];
            let outcome = match mode {
                Mode::Training => self.trainer.run_training(&mut task.context),
                Mode::Validation => self.trainer.run_validation(&mut task.context),
            };
            let name = task.context.task().name();
            match outcome {
                Ok(StepResult::Loss(value)) => {
                    task.stats.push(value);
                    steps += 1;
                    if mode.is_training() {
                        self.training_steps += 1;
                        let threshold = task.context.task().config().threshold.or(self.threshold);
                        if threshold.is_some_and(|t| value <= t) {
                            info!(
                                group = %self.label,
                                task = %name,
                                loss = value,
                                "Task converged"
                            );
                            self.converged.insert(name);
                            self.retire(index);
                            continue;
                        }
                    }
                }
                Ok(StepResult::Halted) => {
                    debug!(group = %self.label, task = %name, epoch, "Task halted for the epoch");
                    self.halted.insert(name);
                    self.retire(index);
                    continue;
                }
                Err(e) => {
                    error!(
                        group = %self.label,
                        task = %name,
                        epoch,
                        mode = %mode,
                        error = %e,
                        "Task failed"
                    );
                    progress.on_event(ProgressEvent::TaskFailed {
                        group: self.label.clone(),
                        task: name,
                        error: e.to_string(),
                    });
                    self.retire(index);
                    continue;
                }
            }
            index += 1;
        }
        steps
    }

    fn retire(&mut self, index: usize) {
        let task = self.active.remove(index);
        self.retired.push((task.context.task().name(), task.stats));
    }

    fn finish_phase(&mut self, epoch: u32, mode: Mode, progress: &dyn ProgressSink) {
        let means: Vec<f64> = self
            .active
            .iter()
            .map(|t| t.stats)
            .chain(self.retired.iter().map(|(_, s)| *s))
            .filter_map(RunningMean::value)
            .collect();
        let mean_loss = (!means.is_empty()).then(|| means.iter().sum::<f64>() / means.len() as f64);

        if mean_loss.is_some() {
            match mode {
                Mode::Training => self.last_train_loss = mean_loss,
                Mode::Validation => self.last_validation_loss = mean_loss,
            }
        }
        progress.on_event(ProgressEvent::PhaseFinished {
            group: self.label.clone(),
            epoch,
            mode,
            mean_loss,
        });
        self.active.clear();
        self.retired.clear();
    }

    #[must_use]
    pub fn metrics(&self) -> GroupMetrics {
        GroupMetrics {
            group: self.label.clone(),
            tasks: self.tasks.iter().map(|t| t.name()).collect(),
            epochs_completed: self.epochs_completed,
            training_steps: self.training_steps,
            optimizer_steps: self.trainer.optimizer_steps(),
            last_train_loss: self.last_train_loss,
            last_validation_loss: self.last_validation_loss,
            cancelled: self.state == GroupState::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Registry;
    use crate::source::TaskModule;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tandem_abstraction::{Component, Device, Parameter, ScalarLoss, Tensor};
    use tandem_training::{
        MemoryCheckpointStore, StepOutcome, TaskConfig, TaskDefinition, TracingProgressSink,
    };

    struct Knob {
        value: Parameter,
    }

    impl Default for Knob {
        fn default() -> Self {
            Self { value: Parameter::new("value", Tensor::zeros(vec![1])) }
        }
    }

    impl Component for Knob {
        fn parameters(&self) -> Vec<Parameter> {
            vec![self.value.clone()]
        }
        fn set_training(&mut self, _training: bool) {}
        fn is_training(&self) -> bool {
            true
        }
    }

    fn build(definitions: Vec<TaskDefinition>) -> (GroupRun, ComponentMap, DatasetMap) {
        let mut module = TaskModule::new("m");
        for definition in definitions {
            module = module.with_task(definition);
        }
        let mut registry = Registry::new();
        registry.load_module(module).unwrap();
        let components = registry.create_components(Device::Cpu, None).unwrap();
        let datasets = registry.create_datasets(0.9).unwrap();
        let group = registry.groups().remove(0);
        let config = registry.group_config(group.dependencies());
        let bound = components.select(group.dependencies());
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut trainer = Trainer::new(group.label(), Device::Cpu, 1, store);
        trainer.setup_components(&bound, &config).unwrap();
        (GroupRun::new(&group, bound, trainer, &config), components, datasets)
    }

    fn drive(run: &mut GroupRun, components: &ComponentMap, datasets: &DatasetMap) -> u64 {
        let mut rounds = 0;
        while !run.is_finished() {
            run.trainer_mut().prepare();
            run.advance(components, datasets, &TracingProgressSink).unwrap();
            run.trainer_mut().step().unwrap();
            rounds += 1;
            assert!(rounds < 1_000);
        }
        rounds
    }

    fn loss_of(knob: &Knob, value: f64) -> StepOutcome {
        StepOutcome::loss(ScalarLoss::new(value).with_gradient(&knob.value, vec![1.0]))
    }

    #[test]
    fn test_epochs_and_iterations() {
        let definition = TaskDefinition::new("task_fit", |args| {
            let loss = args.with_component::<Knob, _, _>("knob", |k| loss_of(k, 0.5))?;
            Ok(loss)
        })
        .component::<Knob>("knob")
        .batchless()
        .config(TaskConfig { iterations: Some(3), epochs: Some(2), ..Default::default() });
        let (mut run, components, datasets) = build(vec![definition]);

        assert_eq!(drive(&mut run, &components, &datasets), 6);
        let metrics = run.metrics();
        assert_eq!(metrics.epochs_completed, 2);
        assert_eq!(metrics.training_steps, 6);
        assert_eq!(metrics.optimizer_steps, 6);
        assert_eq!(metrics.last_train_loss, Some(0.5));
        assert_eq!(run.state(), GroupState::Completed);
    }

    #[test]
    fn test_debug_shows_progress() {
        let definition = TaskDefinition::new("task_fit", |_| Ok(StepOutcome::Score(0.0)))
            .component::<Knob>("knob")
            .batchless();
        let (run, _, _) = build(vec![definition]);
        let rendered = format!("{run:?}");
        assert!(rendered.starts_with("GroupRun"));
        assert!(rendered.contains("\"Knob\""));
        assert!(rendered.contains("Pending"));
    }

    #[test]
    fn test_failing_task_is_dropped_from_phase_only() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let failing = TaskDefinition::new("task_flaky", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("boom")
        })
        .batchless()
        .config(TaskConfig { iterations: Some(4), epochs: Some(2), ..Default::default() });
        let steady = TaskDefinition::new("task_steady", |args| {
            Ok(args.with_component::<Knob, _, _>("knob", |k| loss_of(k, 1.0))?)
        })
        .component::<Knob>("knob")
        .batchless()
        .config(TaskConfig { iterations: Some(4), ..Default::default() });
        let (mut run, components, datasets) = build(vec![failing, steady]);

        drive(&mut run, &components, &datasets);
        // once per epoch
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(run.metrics().training_steps, 8);
    }

    #[test]
    fn test_halt_stops_task_for_the_epoch() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let definition = TaskDefinition::new("task_short", move |args| {
            if counter.fetch_add(1, Ordering::SeqCst) % 3 == 1 {
                return Ok(StepOutcome::Halt);
            }
            Ok(args.with_component::<Knob, _, _>("knob", |k| loss_of(k, 1.0))?)
        })
        .component::<Knob>("knob")
        .batchless()
        .config(TaskConfig { iterations: Some(10), epochs: Some(2), ..Default::default() });
        let (mut run, components, datasets) = build(vec![definition]);

        drive(&mut run, &components, &datasets);
        // epoch 0: calls 0 (loss) and 1 (halt); epoch 1: calls 2 (loss), 3 (loss), 4 (halt)
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(run.metrics().training_steps, 3);
    }

    #[test]
    fn test_threshold_marks_task_converged() {
        let definition = TaskDefinition::new("task_easy", |args| {
            Ok(args.with_component::<Knob, _, _>("knob", |k| loss_of(k, 0.01))?)
        })
        .component::<Knob>("knob")
        .batchless()
        .config(TaskConfig {
            iterations: Some(10),
            epochs: Some(3),
            threshold: Some(0.1),
            ..Default::default()
        });
        let (mut run, components, datasets) = build(vec![definition]);

        drive(&mut run, &components, &datasets);
        assert_eq!(run.metrics().training_steps, 1);
        assert_eq!(run.metrics().epochs_completed, 3);
    }

    #[test]
    fn test_cancel_keeps_completed() {
        let definition = TaskDefinition::new("task_fit", |_| Ok(StepOutcome::Score(1.0)))
            .batchless()
            .config(TaskConfig { iterations: Some(2), ..Default::default() });
        let (mut run, components, datasets) = build(vec![definition]);

        run.advance(&components, &datasets, &TracingProgressSink).unwrap();
        run.cancel();
        assert_eq!(run.state(), GroupState::Cancelled);
        let advance = run.advance(&components, &datasets, &TracingProgressSink).unwrap();
        assert_eq!(advance, Advance::Exhausted);
        assert!(run.metrics().cancelled);
    }
}
