//! Round-robin scheduler over dependency groups.
//!
//! Every round gives each unfinished group one unit of work, bracketed by
//! its trainer's `prepare` and `step`. Cancellation is observed between
//! rounds only, so a round in progress always completes.

use crate::error::{OrchestrationError, Result};
use crate::group_run::GroupRun;
use crate::registry::{ComponentMap, DatasetMap, Registry};
use crate::settings::RunSettings;
use crate::trainer::Trainer;
use chrono::Utc;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tandem_training::artifacts::make_artifact;
use tandem_training::sampler::derive_seed;
use tandem_training::{
    ArtifactKind, CheckpointStore, FsCheckpointStore, GroupMetrics, MemoryCheckpointStore,
    ProgressEvent, ProgressSink, RunId, RunManifest, TaskKind, TracingProgressSink,
    TrainingArtifact, TrainingLayout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of [`Application::run`].
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: RunId,
    pub cancelled: bool,
    /// Scheduler rounds completed.
    pub rounds: u64,
    pub groups: Vec<GroupMetrics>,
    pub checkpoints: Vec<PathBuf>,
    /// Path of the written run manifest, if any.
    pub manifest: Option<PathBuf>,
}

/// Drives every dependency group of a registry to completion.
pub struct Application {
    registry: Registry,
    settings: RunSettings,
    layout: TrainingLayout,
    store: Arc<dyn CheckpointStore>,
    persistent: bool,
    progress: Arc<dyn ProgressSink>,
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Application {
    /// Creates an application that checkpoints under `settings.output_dir`.
    #[must_use]
    pub fn new(registry: Registry, settings: RunSettings) -> Self {
        let layout = TrainingLayout::new(settings.output_dir.clone());
        Self {
            registry,
            store: Arc::new(FsCheckpointStore::new(layout.clone())),
            layout,
            settings,
            persistent: true,
            progress: Arc::new(TracingProgressSink),
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Replaces the checkpoint store. No run manifest is written for custom
    /// stores.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = store;
        self.persistent = false;
        self
    }

    /// Keeps checkpoints in memory only.
    #[must_use]
    pub fn in_memory(self) -> Self {
        self.with_store(Arc::new(MemoryCheckpointStore::new()))
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Trains every group until all are done or `cancel` fires.
    ///
    /// # Errors
    /// [`OrchestrationError::NoTasks`] when the registry holds no training
    /// task; nothing is created in that case. Setup, optimizer and checkpoint
    /// failures abort the run.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunSummary> {
        self.settings.validate()?;
        if self.registry.tasks_of_kind(TaskKind::Training).next().is_none() {
            error!("No training tasks found");
            return Err(OrchestrationError::NoTasks);
        }

        let run_id = RunId::new();
        let started_at = Utc::now();
        info!(
            run_id = %run_id,
            device = %self.settings.device,
            seed = self.settings.seed,
            "Starting run"
        );

        let resume = self.settings.resume.then_some(self.store.as_ref());
        let components = self.registry.create_components(self.settings.device, resume)?;
        let datasets = self.registry.create_datasets(self.settings.train_split)?;

        let groups = self.registry.groups();
        let mut runs = Vec::with_capacity(groups.len());
        for group in &groups {
            let config = self.registry.group_config(group.dependencies());
            let bound = components.select(group.dependencies());
            let label = group.label();
            let seed = derive_seed(self.settings.seed, &label);
            let store = Arc::clone(&self.store);
            let mut trainer = Trainer::new(label, self.settings.device, seed, store);
            trainer.setup_components(&bound, &config)?;
            runs.push(GroupRun::new(group, bound, trainer, &config));
        }

        self.progress.on_event(ProgressEvent::RunStarted {
            tasks: groups.iter().map(|g| g.tasks().len()).sum(),
            components: components.len(),
            groups: runs.len(),
        });

        self.run_auxiliary(TaskKind::Entry, &components, &datasets);

        let mut artifacts = Vec::new();
        let mut rounds = 0_u64;
        let mut cancelled = false;
        loop {
            if cancel.is_cancelled() {
                info!(rounds, "Cancellation requested; stopping");
                cancelled = true;
                break;
            }
            if runs.iter().all(GroupRun::is_finished) {
                break;
            }

            for run in runs.iter_mut().filter(|r| !r.is_finished()) {
                run.trainer_mut().prepare();
                run.advance(&components, &datasets, self.progress.as_ref())?;
                run.trainer_mut().step()?;
                run.record_round();

                if run.is_finished() && !run.is_saved() {
                    self.save_group(run, &mut artifacts)?;
                    self.progress.on_event(ProgressEvent::GroupFinished {
                        group: run.label().to_string(),
                        cancelled: false,
                    });
                }
            }
            rounds += 1;
            tokio::task::yield_now().await;
        }

        if cancelled {
            for run in runs.iter_mut().filter(|r| !r.is_finished()) {
                run.cancel();
                if run.rounds() > 0 {
                    if let Err(e) = self.save_group(run, &mut artifacts) {
                        warn!(
                            group = %run.label(),
                            error = %e,
                            "Could not checkpoint cancelled group"
                        );
                    }
                }
                self.progress.on_event(ProgressEvent::GroupFinished {
                    group: run.label().to_string(),
                    cancelled: true,
                });
            }
        }
        self.run_auxiliary(TaskKind::Display, &components, &datasets);

        let groups: Vec<GroupMetrics> = runs.iter().map(GroupRun::metrics).collect();
        let manifest = if self.persistent && self.settings.write_manifest && !artifacts.is_empty() {
            let path = self.layout.manifest_path();
            RunManifest {
                run_id: run_id.clone(),
                started_at,
                finished_at: Utc::now(),
                cancelled,
                groups: groups.clone(),
                artifacts: artifacts.clone(),
            }
            .write(&path)?;
            debug!(path = %path.display(), "Run manifest written");
            Some(path)
        } else {
            None
        };

        self.progress.on_event(ProgressEvent::RunFinished { cancelled });
        info!(run_id = %run_id, rounds, cancelled, "Run finished");

        Ok(RunSummary {
            run_id,
            cancelled,
            rounds,
            groups,
            checkpoints: artifacts.into_iter().map(|a| a.path).collect(),
            manifest,
        })
    }

    fn save_group(&self, run: &mut GroupRun, artifacts: &mut Vec<TrainingArtifact>) -> Result<()> {
        let saved = run.trainer().save(run.components())?;
        run.mark_saved();
        for (key, path) in saved {
            self.progress.on_event(ProgressEvent::CheckpointSaved {
                component: key.short_name().to_string(),
                path: path.display().to_string(),
            });
            let artifact = if self.persistent {
                make_artifact(ArtifactKind::ComponentCheckpoint, key.short_name(), path)?
            } else {
                TrainingArtifact {
                    kind: ArtifactKind::ComponentCheckpoint,
                    component: key.short_name().to_string(),
                    path,
                    sha256: String::new(),
                }
            };
            artifacts.retain(|a| a.path != artifact.path);
            artifacts.push(artifact);
        }
        Ok(())
    }

    /// Runs entry or display tasks once each. Failures are logged.
    fn run_auxiliary(&self, kind: TaskKind, components: &ComponentMap, datasets: &DatasetMap) {
        let store = Arc::clone(&self.store);
        let runner = Trainer::new("auxiliary", self.settings.device, self.settings.seed, store);
        for task in self.registry.tasks_of_kind(kind) {
            match runner.run_once(task, components, datasets) {
                Ok(Some(value)) => info!(task = %task.name(), value, "Task finished"),
                Ok(None) => info!(task = %task.name(), "Task finished"),
                Err(e) => warn!(task = %task.name(), error = %e, "Task failed"),
            }
        }
    }
}
