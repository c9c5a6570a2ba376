//! Task functions and their declared dependencies.
//!
//! A task is an ordinary closure registered together with an explicit list
//! of the parameters it expects: components (shared trainable objects),
//! datasets (replaced by batch generators at run time) and locals (ignored
//! for dependency purposes).

use crate::batch::Batch;
use crate::config::{Mode, TaskConfig};
use crate::dataset::{DatasetInput, DatasetProvider};
use crate::error::{TrainingError, TrainingResult};
use std::any::{Any, type_name};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tandem_abstraction::{Component, Loss, SharedComponent, lock_component};

/// Function-name prefixes of tasks that are optimized.
pub const TRAINING_PREFIXES: &[&str] = &["task_", "train_"];
/// Function-name prefixes of reporting tasks.
pub const DISPLAY_PREFIXES: &[&str] = &["show_", "display_"];
/// Function-name prefixes of tasks run once before training.
pub const ENTRY_PREFIXES: &[&str] = &["main_"];
/// First name tokens that mark a parameter as a dataset.
pub const DATASET_TOKENS: &[&str] = &["batch", "data", "iterator"];

/// Whether a parameter name follows the dataset naming convention
/// (`batch_*`, `data_*`, `iterator_*` or the bare token).
#[must_use]
pub fn is_dataset_name(name: &str) -> bool {
    name.split('_').next().is_some_and(|token| DATASET_TOKENS.contains(&token))
}

fn short_type_name(qualified: &str) -> &str {
    let base = qualified.split('<').next().unwrap_or(qualified);
    base.rsplit("::").next().unwrap_or(base)
}

/// Identity of a component type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentKey(&'static str);

impl ComponentKey {
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self(type_name::<T>())
    }

    /// Fully qualified type path, e.g. `demo::models::Image`.
    #[must_use]
    pub fn qualified_name(&self) -> &'static str {
        self.0
    }

    /// Last path segment without generics, e.g. `Image`.
    #[must_use]
    pub fn short_name(&self) -> &'static str {
        short_type_name(self.0)
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Identity of a dataset type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetKey(&'static str);

impl DatasetKey {
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self(type_name::<T>())
    }

    #[must_use]
    pub fn qualified_name(&self) -> &'static str {
        self.0
    }

    #[must_use]
    pub fn short_name(&self) -> &'static str {
        short_type_name(self.0)
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

type BuildComponent = Arc<dyn Fn() -> TrainingResult<Box<dyn Component>> + Send + Sync>;
type BuildDataset = Arc<dyn Fn() -> TrainingResult<DatasetInput> + Send + Sync>;

/// Constructs instances of one component type.
#[derive(Clone)]
pub struct ComponentFactory {
    key: ComponentKey,
    build: BuildComponent,
}

impl fmt::Debug for ComponentFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ComponentFactory").field(&self.key).finish()
    }
}

impl ComponentFactory {
    /// Uses `T::default()` as the constructor.
    #[must_use]
    pub fn of<T: Component + Default>() -> Self {
        Self::from_fn(T::default)
    }

    pub fn from_fn<T, F>(constructor: F) -> Self
    where
        T: Component,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            key: ComponentKey::of::<T>(),
            build: Arc::new(move || Ok(Box::new(constructor()) as Box<dyn Component>)),
        }
    }

    #[must_use]
    pub fn key(&self) -> ComponentKey {
        self.key
    }

    pub fn create(&self) -> TrainingResult<Box<dyn Component>> {
        (self.build)()
    }
}

/// Constructs instances of one dataset type.
#[derive(Clone)]
pub struct DatasetFactory {
    key: DatasetKey,
    build: BuildDataset,
}

impl fmt::Debug for DatasetFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DatasetFactory").field(&self.key).finish()
    }
}

impl DatasetFactory {
    #[must_use]
    pub fn of<D: DatasetProvider + Default>() -> Self {
        Self::from_fn(D::default)
    }

    pub fn from_fn<D, F>(constructor: F) -> Self
    where
        D: DatasetProvider,
        F: Fn() -> D + Send + Sync + 'static,
    {
        Self { key: DatasetKey::of::<D>(), build: Arc::new(move || constructor().load()) }
    }

    #[must_use]
    pub fn key(&self) -> DatasetKey {
        self.key
    }

    pub fn create(&self) -> TrainingResult<DatasetInput> {
        (self.build)()
    }
}

/// What a declared parameter receives at run time.
#[derive(Debug, Clone)]
pub enum Injection {
    Component(ComponentFactory),
    Dataset(DatasetFactory),
    /// Nothing is injected; the parameter plays no part in grouping.
    Local,
}

#[derive(Debug, Clone)]
pub struct TaskParam {
    pub name: String,
    pub injection: Injection,
}

/// Discovered role of a task, decided by its function-name prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Training,
    Display,
    Entry,
}

impl TaskKind {
    #[must_use]
    pub fn from_function_name(name: &str) -> Option<Self> {
        let has = |prefixes: &[&str]| prefixes.iter().any(|p| name.starts_with(p));
        if has(TRAINING_PREFIXES) {
            Some(Self::Training)
        } else if has(DISPLAY_PREFIXES) {
            Some(Self::Display)
        } else if has(ENTRY_PREFIXES) {
            Some(Self::Entry)
        } else {
            None
        }
    }
}

/// What one invocation of a task produced.
pub enum StepOutcome {
    /// A differentiable loss.
    Loss(Box<dyn Loss>),
    /// A plain score (validation metrics, reporting tasks).
    Score(f64),
    /// Stop calling this task for the rest of the epoch.
    Halt,
}

impl StepOutcome {
    pub fn loss<L: Loss + 'static>(loss: L) -> Self {
        Self::Loss(Box::new(loss))
    }
}

impl fmt::Debug for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loss(loss) => f.debug_tuple("Loss").field(&loss.value()).finish(),
            Self::Score(score) => f.debug_tuple("Score").field(score).finish(),
            Self::Halt => f.write_str("Halt"),
        }
    }
}

/// The callable behind a task.
pub type TaskFn = Arc<dyn Fn(&mut TaskArgs<'_>) -> anyhow::Result<StepOutcome> + Send + Sync>;

/// Arguments prepared for one invocation of a task.
pub struct TaskArgs<'a> {
    task: &'a str,
    mode: Mode,
    components: &'a [(String, SharedComponent)],
    batches: BTreeMap<String, Batch>,
}

impl<'a> TaskArgs<'a> {
    #[must_use]
    pub fn new(
        task: &'a str,
        mode: Mode,
        components: &'a [(String, SharedComponent)],
        batches: BTreeMap<String, Batch>,
    ) -> Self {
        Self { task, mode, components, batches }
    }

    #[must_use]
    pub fn task_name(&self) -> &str {
        self.task
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[must_use]
    pub fn is_training(&self) -> bool {
        self.mode.is_training()
    }

    pub fn batch(&self, name: &str) -> TrainingResult<&Batch> {
        self.batches
            .get(name)
            .ok_or_else(|| TrainingError::Argument(format!("{}: no batch for `{name}`", self.task)))
    }

    pub fn component(&self, name: &str) -> TrainingResult<&SharedComponent> {
        self.components
            .iter()
            .find(|(param, _)| param == name)
            .map(|(_, component)| component)
            .ok_or_else(|| {
                TrainingError::Argument(format!("{}: no component for `{name}`", self.task))
            })
    }

    /// Locks the component bound to `name` and hands it to `f` as its
    /// concrete type.
    pub fn with_component<T, R, F>(&self, name: &str, f: F) -> TrainingResult<R>
    where
        T: Component,
        F: FnOnce(&mut T) -> R,
    {
        let mut guard = lock_component(self.component(name)?);
        let any: &mut dyn Any = &mut **guard;
        let component = any.downcast_mut::<T>().ok_or_else(|| {
            TrainingError::Argument(format!(
                "{}: component `{name}` is not a {}",
                self.task,
                type_name::<T>()
            ))
        })?;
        Ok(f(component))
    }
}

/// A task function as registered by user code, before classification.
#[derive(Clone)]
pub struct TaskDefinition {
    function_name: String,
    params: Vec<TaskParam>,
    config: TaskConfig,
    batchless: bool,
    function: TaskFn,
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("function_name", &self.function_name)
            .field("params", &self.params)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TaskDefinition {
    pub fn new<F>(function_name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&mut TaskArgs<'_>) -> anyhow::Result<StepOutcome> + Send + Sync + 'static,
    {
        Self {
            function_name: function_name.into(),
            params: Vec::new(),
            config: TaskConfig::default(),
            batchless: false,
            function: Arc::new(function),
        }
    }

    /// Declares a component parameter built with `T::default()`.
    #[must_use]
    pub fn component<T: Component + Default>(self, name: impl Into<String>) -> Self {
        self.param(name, Injection::Component(ComponentFactory::of::<T>()))
    }

    #[must_use]
    pub fn component_with(self, name: impl Into<String>, factory: ComponentFactory) -> Self {
        self.param(name, Injection::Component(factory))
    }

    /// Declares a dataset parameter built with `D::default()`.
    #[must_use]
    pub fn dataset<D: DatasetProvider + Default>(self, name: impl Into<String>) -> Self {
        self.param(name, Injection::Dataset(DatasetFactory::of::<D>()))
    }

    #[must_use]
    pub fn dataset_with(self, name: impl Into<String>, factory: DatasetFactory) -> Self {
        self.param(name, Injection::Dataset(factory))
    }

    #[must_use]
    pub fn local(self, name: impl Into<String>) -> Self {
        self.param(name, Injection::Local)
    }

    #[must_use]
    pub fn param(mut self, name: impl Into<String>, injection: Injection) -> Self {
        self.params.push(TaskParam { name: name.into(), injection });
        self
    }

    #[must_use]
    pub fn config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    /// Allows a training task without dataset parameters. Such a task runs
    /// `iterations` steps per epoch with no batches.
    #[must_use]
    pub fn batchless(mut self) -> Self {
        self.batchless = true;
        self
    }

    #[must_use]
    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    #[must_use]
    pub fn params(&self) -> &[TaskParam] {
        &self.params
    }

    #[must_use]
    pub fn task_config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn task_config_mut(&mut self) -> &mut TaskConfig {
        &mut self.config
    }

    #[must_use]
    pub fn is_batchless(&self) -> bool {
        self.batchless
    }
}

/// A classified task, immutable for the duration of a run.
pub struct TaskDescriptor {
    module: String,
    kind: TaskKind,
    definition: TaskDefinition,
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("name", &self.name())
            .field("kind", &self.kind)
            .field("config", self.config())
            .finish_non_exhaustive()
    }
}

impl TaskDescriptor {
    #[must_use]
    pub fn new(module: impl Into<String>, kind: TaskKind, definition: TaskDefinition) -> Self {
        Self { module: module.into(), kind, definition }
    }

    /// Qualified name, `module.function`.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}.{}", self.module, self.definition.function_name)
    }

    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    #[must_use]
    pub fn function_name(&self) -> &str {
        &self.definition.function_name
    }

    #[must_use]
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    #[must_use]
    pub fn params(&self) -> &[TaskParam] {
        &self.definition.params
    }

    #[must_use]
    pub fn config(&self) -> &TaskConfig {
        &self.definition.config
    }

    #[must_use]
    pub fn is_batchless(&self) -> bool {
        self.definition.batchless
    }

    /// Component types in declaration order, without repeats.
    #[must_use]
    pub fn component_keys(&self) -> Vec<ComponentKey> {
        let mut keys = Vec::new();
        for param in self.params() {
            if let Injection::Component(factory) = &param.injection {
                if !keys.contains(&factory.key()) {
                    keys.push(factory.key());
                }
            }
        }
        keys
    }

    pub fn dataset_params(&self) -> impl Iterator<Item = (&str, &DatasetFactory)> {
        self.params().iter().filter_map(|p| match &p.injection {
            Injection::Dataset(factory) => Some((p.name.as_str(), factory)),
            _ => None,
        })
    }

    pub fn component_params(&self) -> impl Iterator<Item = (&str, &ComponentFactory)> {
        self.params().iter().filter_map(|p| match &p.injection {
            Injection::Component(factory) => Some((p.name.as_str(), factory)),
            _ => None,
        })
    }

    pub fn call(&self, args: &mut TaskArgs<'_>) -> anyhow::Result<StepOutcome> {
        (self.definition.function)(args)
    }
}
