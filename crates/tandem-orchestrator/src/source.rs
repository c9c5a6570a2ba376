//! Task discovery.
//!
//! Task code is compiled in and registered by name in a [`ModuleCatalog`].
//! A [`TaskSource`] decides which modules take part in a run: the catalog
//! itself yields every module, while [`FsTaskSource`] walks a directory for
//! `train_*.toml` manifests that select modules and override their settings.

use crate::error::{OrchestrationError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tandem_training::{ComponentConfig, TaskConfig, TaskDefinition};
use tracing::debug;
use walkdir::WalkDir;

/// Filename prefix of task manifests.
pub const MANIFEST_PREFIX: &str = "train_";
/// Filename extension of task manifests.
pub const MANIFEST_EXTENSION: &str = "toml";

/// A named unit of task definitions.
#[derive(Debug, Clone)]
pub struct TaskModule {
    name: String,
    tasks: Vec<TaskDefinition>,
    components: Vec<(String, ComponentConfig)>,
}

impl TaskModule {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), tasks: Vec::new(), components: Vec::new() }
    }

    /// Adds a task definition; declaration order is discovery order.
    #[must_use]
    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    /// Attaches settings to the component type named `component` (short or
    /// fully-qualified type name).
    #[must_use]
    pub fn with_component_config(
        mut self,
        component: impl Into<String>,
        config: ComponentConfig,
    ) -> Self {
        self.components.push((component.into(), config));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn tasks(&self) -> &[TaskDefinition] {
        &self.tasks
    }

    #[must_use]
    pub fn component_configs(&self) -> &[(String, ComponentConfig)] {
        &self.components
    }

    pub(crate) fn into_parts(
        self,
    ) -> (String, Vec<TaskDefinition>, Vec<(String, ComponentConfig)>) {
        (self.name, self.tasks, self.components)
    }

    fn task_mut(&mut self, function_name: &str) -> Option<&mut TaskDefinition> {
        self.tasks.iter_mut().find(|t| t.function_name() == function_name)
    }
}

/// Yields the task modules that take part in a run, in discovery order.
pub trait TaskSource {
    fn discover(&self) -> Result<Vec<TaskModule>>;
}

/// Every module compiled into the binary, by name.
#[derive(Debug, Clone, Default)]
pub struct ModuleCatalog {
    modules: Vec<TaskModule>,
}

impl ModuleCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a module; a later module with the same name replaces it.
    pub fn register(&mut self, module: TaskModule) {
        if let Some(existing) = self.modules.iter_mut().find(|m| m.name == module.name) {
            debug!(module = %module.name, "Replacing catalog module");
            *existing = module;
        } else {
            self.modules.push(module);
        }
    }

    #[must_use]
    pub fn with(mut self, module: TaskModule) -> Self {
        self.register(module);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TaskModule> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(|m| m.name.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl TaskSource for ModuleCatalog {
    fn discover(&self) -> Result<Vec<TaskModule>> {
        Ok(self.modules.clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskManifest {
    /// Catalog module to load; defaults to the file stem.
    module: Option<String>,
    #[serde(default)]
    tasks: BTreeMap<String, TaskConfig>,
    #[serde(default)]
    components: BTreeMap<String, ComponentConfig>,
}

/// Discovers modules through `train_*.toml` manifests under a root
/// directory.
///
/// ```toml
/// module = "train_image"
///
/// [tasks.task_fit]
/// iterations = 200
///
/// [components.Image]
/// learning_rate = 0.05
/// ```
pub struct FsTaskSource {
    root: PathBuf,
    filter: Option<String>,
    catalog: ModuleCatalog,
}

impl fmt::Debug for FsTaskSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsTaskSource")
            .field("root", &self.root)
            .field("filter", &self.filter)
            .field("modules", &self.catalog.len())
            .finish_non_exhaustive()
    }
}

impl FsTaskSource {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, catalog: ModuleCatalog) -> Self {
        Self { root: root.into(), filter: None, catalog }
    }

    /// Keeps only manifests whose path contains `filter` as a substring.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        let filter = filter.into();
        self.filter = (!filter.is_empty()).then_some(filter);
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_manifest(path: &Path) -> bool {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        name.starts_with(MANIFEST_PREFIX)
            && path.extension().and_then(|e| e.to_str()) == Some(MANIFEST_EXTENSION)
    }

    fn matches_filter(&self, path: &Path) -> bool {
        self.filter.as_deref().is_none_or(|f| path.to_string_lossy().contains(f))
    }

    fn load_manifest(&self, path: &Path) -> Result<TaskModule> {
        let unit = path.display().to_string();
        let discovery =
            |reason: String| OrchestrationError::Discovery { unit: unit.clone(), reason };

        let text = std::fs::read_to_string(path).map_err(|e| discovery(e.to_string()))?;
        let manifest: TaskManifest = toml::from_str(&text).map_err(|e| discovery(e.to_string()))?;

        let module_name = match manifest.module {
            Some(name) => name,
            None => path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
                .ok_or_else(|| discovery("manifest has no usable file stem".to_string()))?,
        };

        let mut module = self
            .catalog
            .get(&module_name)
            .cloned()
            .ok_or_else(|| discovery(format!("unknown task module '{module_name}'")))?;

        for (function, overrides) in &manifest.tasks {
            let task = module.task_mut(function).ok_or_else(|| {
                discovery(format!("module '{module_name}' has no task '{function}'"))
            })?;
            task.task_config_mut().overlay(overrides);
        }
        for (component, config) in manifest.components {
            module.components.push((component, config));
        }

        debug!(manifest = %unit, module = %module_name, "Loaded task manifest");
        Ok(module)
    }
}

impl TaskSource for FsTaskSource {
    fn discover(&self) -> Result<Vec<TaskModule>> {
        if !self.root.is_dir() {
            return Err(OrchestrationError::Discovery {
                unit: self.root.display().to_string(),
                reason: "root is not a directory".to_string(),
            });
        }

        let mut modules = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|e| OrchestrationError::Discovery {
                unit: self.root.display().to_string(),
                reason: e.to_string(),
            })?;
            let path = entry.path();
            let wanted = Self::is_manifest(path) && self.matches_filter(path);
            if !entry.file_type().is_file() || !wanted {
                continue;
            }
            modules.push(self.load_manifest(path)?);
        }

        debug!(root = %self.root.display(), modules = modules.len(), "Discovered task modules");
        Ok(modules)
    }
}
