//! Task registry.
//!
//! Collects task descriptors from discovered modules, classifies their
//! parameters, accumulates per-component configuration and builds the
//! component and dataset instances a run works on.

use crate::error::{OrchestrationError, Result};
use crate::grouping::{Group, group_tasks};
use crate::source::{TaskModule, TaskSource};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tandem_abstraction::{Device, EngineError, SharedComponent};
use tandem_training::task::is_dataset_name;
use tandem_training::{
    CheckpointStore, ComponentConfig, ComponentFactory, ComponentKey, Dataset, DatasetFactory,
    DatasetKey, Injection, TaskConfig, TaskDescriptor, TaskKind, checkpoint_filename,
};
use tracing::{debug, info, warn};

/// Live component instances, in first-discovered order.
#[derive(Clone, Default)]
pub struct ComponentMap {
    entries: Vec<(ComponentKey, SharedComponent)>,
}

impl fmt::Debug for ComponentMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.iter().map(|(k, _)| k.short_name())).finish()
    }
}

impl ComponentMap {
    #[must_use]
    pub fn get(&self, key: ComponentKey) -> Option<&SharedComponent> {
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, c)| c)
    }

    /// The entries for `keys`, in the order given. Unknown keys are skipped.
    #[must_use]
    pub fn select(&self, keys: &[ComponentKey]) -> Vec<(ComponentKey, SharedComponent)> {
        keys.iter().filter_map(|k| self.get(*k).map(|c| (*k, Arc::clone(c)))).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ComponentKey, &SharedComponent)> {
        self.entries.iter().map(|(k, c)| (*k, c))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Materialized datasets keyed by provider type.
#[derive(Debug, Clone, Default)]
pub struct DatasetMap {
    entries: HashMap<DatasetKey, Arc<Dataset>>,
}

impl DatasetMap {
    #[must_use]
    pub fn get(&self, key: DatasetKey) -> Option<&Arc<Dataset>> {
        self.entries.get(&key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Registry of discovered tasks and the types they depend on.
#[derive(Default)]
pub struct Registry {
    tasks: Vec<Arc<TaskDescriptor>>,
    components: Vec<ComponentFactory>,
    component_configs: HashMap<ComponentKey, ComponentConfig>,
    datasets: Vec<DatasetFactory>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("tasks", &self.tasks.len())
            .field("components", &self.components.len())
            .field("datasets", &self.datasets.len())
            .finish_non_exhaustive()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every module a source discovers.
    ///
    /// # Errors
    /// Fails on the first module that cannot be loaded; see [`Self::load_module`].
    pub fn load(&mut self, source: &dyn TaskSource) -> Result<()> {
        for module in source.discover()? {
            self.load_module(module)?;
        }
        info!(
            tasks = self.tasks.len(),
            components = self.components.len(),
            datasets = self.datasets.len(),
            "Task registry loaded"
        );
        Ok(())
    }

    /// Registers the tasks of one module.
    ///
    /// Functions without a recognized prefix are ignored. Every dependency
    /// parameter must be named according to its role: datasets match
    /// `batch_*`, `data_*` or `iterator_*`, components match none of them.
    ///
    /// # Errors
    /// Returns [`OrchestrationError::Classification`] for a misnamed parameter,
    /// [`OrchestrationError::MissingDataset`] for a training task that iterates
    /// batches without a dataset, [`OrchestrationError::DuplicateTask`] for a
    /// repeated qualified name and [`OrchestrationError::Discovery`] for invalid
    /// settings or an unknown component override.
    pub fn load_module(&mut self, module: TaskModule) -> Result<()> {
        let (module_name, definitions, component_configs) = module.into_parts();

        for definition in definitions {
            let Some(kind) = TaskKind::from_function_name(definition.function_name()) else {
                debug!(
                    module = %module_name,
                    function = %definition.function_name(),
                    "Skipping non-task function"
                );
                continue;
            };
            let descriptor = TaskDescriptor::new(module_name.clone(), kind, definition);
            let name = descriptor.name();

            if self.tasks.iter().any(|t| t.name() == name) {
                return Err(OrchestrationError::DuplicateTask(name));
            }
            descriptor.config().validate().map_err(|e| OrchestrationError::Discovery {
                unit: name.clone(),
                reason: e.to_string(),
            })?;

            self.classify(&descriptor)?;

            let has_dataset = descriptor.dataset_params().next().is_some();
            if kind == TaskKind::Training && !has_dataset && !descriptor.is_batchless() {
                return Err(OrchestrationError::MissingDataset(name));
            }

            for param in descriptor.params() {
                match &param.injection {
                    Injection::Component(factory) => self.register_component(factory),
                    Injection::Dataset(factory) => self.register_dataset(factory),
                    Injection::Local => {}
                }
            }
            if kind == TaskKind::Training {
                for key in descriptor.component_keys() {
                    self.configure_component(key, descriptor.config());
                }
            }

            debug!(task = %name, kind = ?kind, "Registered task");
            self.tasks.push(Arc::new(descriptor));
        }

        for (component, config) in component_configs {
            let key = self.find_component(&component).ok_or_else(|| OrchestrationError::Discovery {
                unit: module_name.clone(),
                reason: format!("no task depends on component '{component}'"),
            })?;
            config.validate().map_err(|e| OrchestrationError::Discovery {
                unit: module_name.clone(),
                reason: e.to_string(),
            })?;
            self.configure_component_type(key, &config);
        }
        Ok(())
    }

    fn classify(&self, task: &TaskDescriptor) -> Result<()> {
        for param in task.params() {
            let dataset_name = is_dataset_name(&param.name);
            let reason = match (&param.injection, dataset_name) {
                (Injection::Dataset(_), false) => {
                    "dataset parameters must be named batch_*, data_* or iterator_*"
                }
                (Injection::Component(_), true) => {
                    "parameter is named like a dataset but injects a component"
                }
                _ => continue,
            };
            return Err(OrchestrationError::Classification {
                task: task.name(),
                param: param.name.clone(),
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    fn register_component(&mut self, factory: &ComponentFactory) {
        if !self.components.iter().any(|f| f.key() == factory.key()) {
            debug!(component = %factory.key(), "Registering component type");
            self.components.push(factory.clone());
        }
    }

    fn register_dataset(&mut self, factory: &DatasetFactory) {
        if !self.datasets.iter().any(|f| f.key() == factory.key()) {
            debug!(dataset = %factory.key(), "Registering dataset type");
            self.datasets.push(factory.clone());
        }
    }

    fn find_component(&self, name: &str) -> Option<ComponentKey> {
        self.components
            .iter()
            .map(ComponentFactory::key)
            .find(|k| k.short_name() == name || k.qualified_name() == name)
    }

    /// Folds a task's settings into the configuration of component `key`.
    pub fn configure_component(&mut self, key: ComponentKey, task: &TaskConfig) {
        self.component_configs.entry(key).or_default().merge_task(task);
    }

    /// Folds explicit component settings into the configuration of `key`.
    pub fn configure_component_type(&mut self, key: ComponentKey, config: &ComponentConfig) {
        self.component_configs.entry(key).or_default().merge(config);
    }

    #[must_use]
    pub fn component_config(&self, key: ComponentKey) -> ComponentConfig {
        self.component_configs.get(&key).cloned().unwrap_or_default()
    }

    /// Merged configuration for a dependency tuple; explicit settings are
    /// taken from the first component that has them.
    #[must_use]
    pub fn group_config(&self, dependencies: &[ComponentKey]) -> ComponentConfig {
        let mut config = ComponentConfig::default();
        for key in dependencies {
            config.merge(&self.component_config(*key));
        }
        config
    }

    #[must_use]
    pub fn tasks(&self) -> &[Arc<TaskDescriptor>] {
        &self.tasks
    }

    pub fn tasks_of_kind(&self, kind: TaskKind) -> impl Iterator<Item = &Arc<TaskDescriptor>> {
        self.tasks.iter().filter(move |t| t.kind() == kind)
    }

    #[must_use]
    pub fn training_tasks(&self) -> Vec<Arc<TaskDescriptor>> {
        self.tasks_of_kind(TaskKind::Training).cloned().collect()
    }

    pub fn component_keys(&self) -> impl Iterator<Item = ComponentKey> + '_ {
        self.components.iter().map(ComponentFactory::key)
    }

    pub fn dataset_keys(&self) -> impl Iterator<Item = DatasetKey> + '_ {
        self.datasets.iter().map(DatasetFactory::key)
    }

    /// Groups training tasks by component dependencies.
    #[must_use]
    pub fn groups(&self) -> Vec<Group> {
        group_tasks(&self.training_tasks())
    }

    /// Creates one instance of every registered component type on `device`.
    ///
    /// With a store, each component is restored from its checkpoint when one
    /// exists. A checkpoint that does not fit the current definition is
    /// logged and the freshly constructed instance is used instead.
    pub fn create_components(
        &self,
        device: Device,
        resume: Option<&dyn CheckpointStore>,
    ) -> Result<ComponentMap> {
        let mut entries = Vec::with_capacity(self.components.len());
        for factory in &self.components {
            let key = factory.key();
            let mut component = factory.create()?;

            if let Some(store) = resume {
                let filename = checkpoint_filename(key);
                if let Some(bytes) = store.load(&filename)? {
                    match component.load_state(&bytes) {
                        Ok(()) => {
                            info!(component = %key, checkpoint = %filename, "Resumed component");
                        }
                        Err(
                            e @ (EngineError::StateMismatch(_) | EngineError::Serialization(_)),
                        ) => {
                            warn!(
                                component = %key,
                                checkpoint = %filename,
                                error = %e,
                                "Checkpoint does not match component; starting fresh"
                            );
                            component = factory.create()?;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }

            component.to_device(device)?;
            entries.push((key, Arc::new(Mutex::new(component))));
        }
        Ok(ComponentMap { entries })
    }

    /// Materializes every registered dataset once.
    pub fn create_datasets(&self, train_split: f64) -> Result<DatasetMap> {
        let mut entries = HashMap::with_capacity(self.datasets.len());
        for factory in &self.datasets {
            let dataset = Dataset::from_data(factory.create()?, train_split)?;
            debug!(
                dataset = %factory.key(),
                training = dataset.training().len(),
                validation = dataset.validation().map(|s| s.len()),
                "Dataset ready"
            );
            entries.insert(factory.key(), Arc::new(dataset));
        }
        Ok(DatasetMap { entries })
    }
}
