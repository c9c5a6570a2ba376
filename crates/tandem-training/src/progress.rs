use crate::config::Mode;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted { tasks: usize, components: usize, groups: usize },
    /// A group entered a phase; `total` is `None` for open-ended phases.
    PhaseStarted { group: String, epoch: u32, mode: Mode, total: Option<u64> },
    Step { group: String, epoch: u32, mode: Mode, step: u64, total: Option<u64> },
    PhaseFinished { group: String, epoch: u32, mode: Mode, mean_loss: Option<f64> },
    TaskFailed { group: String, task: String, error: String },
    CheckpointSaved { component: String, path: String },
    GroupFinished { group: String, cancelled: bool },
    RunFinished { cancelled: bool },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Reports progress through `tracing`. Per-step events are logged at trace level.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::RunStarted { tasks, components, groups } => {
                info!(tasks, components, groups, "run started");
            }
            ProgressEvent::PhaseStarted { group, epoch, mode, total } => {
                info!(group = %group, epoch, mode = %mode, total = ?total, "phase started");
            }
            ProgressEvent::Step { group, epoch, mode, step, total } => {
                tracing::trace!(group = %group, epoch, mode = %mode, step, total = ?total, "step");
            }
            ProgressEvent::PhaseFinished { group, epoch, mode, mean_loss } => {
                info!(
                    group = %group,
                    epoch,
                    mode = %mode,
                    mean_loss = ?mean_loss,
                    "phase finished"
                );
            }
            ProgressEvent::TaskFailed { group, task, error } => {
                warn!(group = %group, task = %task, error = %error, "task dropped from phase");
            }
            ProgressEvent::CheckpointSaved { component, path } => {
                info!(component = %component, path = %path, "checkpoint saved");
            }
            ProgressEvent::GroupFinished { group, cancelled } => {
                info!(group = %group, cancelled, "group finished");
            }
            ProgressEvent::RunFinished { cancelled } => info!(cancelled, "run finished"),
        }
    }
}

/// Line-oriented progress for terminals: a label plus a step count.
#[derive(Debug, Default)]
pub struct StdoutProgressSink;

impl ProgressSink for StdoutProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::RunStarted { tasks, components, groups } => println!(
                "Training {tasks} task(s) in {groups} group(s) over {components} component(s)."
            ),
            ProgressEvent::PhaseStarted { .. } | ProgressEvent::Step { .. } => {}
            ProgressEvent::PhaseFinished { group, epoch, mode, mean_loss } => match mean_loss {
                Some(loss) => println!("[{group}] epoch {} {mode}: mean loss {loss:.6}", epoch + 1),
                None => println!("[{group}] epoch {} {mode}: no steps", epoch + 1),
            },
            ProgressEvent::TaskFailed { group, task, error } => {
                println!("[{group}] {task} failed: {error}");
            }
            ProgressEvent::CheckpointSaved { component, path } => {
                println!("saved {component} -> {path}");
            }
            ProgressEvent::GroupFinished { group, cancelled } => {
                if cancelled {
                    println!("[{group}] cancelled");
                } else {
                    println!("[{group}] finished");
                }
            }
            ProgressEvent::RunFinished { cancelled } => {
                if cancelled {
                    println!("run cancelled");
                } else {
                    println!("run finished");
                }
            }
        }
    }
}
