// Error types for orchestration

use tandem_abstraction::EngineError;
use tandem_training::TrainingError;
use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// A task unit could not be resolved or read
    #[error("Discovery failed for '{unit}': {reason}")]
    Discovery {
        /// Manifest path or module name
        unit: String,
        /// Why the unit was rejected
        reason: String,
    },

    /// A declared parameter does not fit the naming convention of its role
    #[error("Cannot classify parameter '{param}' of '{task}': {reason}")]
    Classification {
        /// Qualified task name
        task: String,
        /// Parameter name
        param: String,
        /// Why classification failed
        reason: String,
    },

    /// A training task iterates batches but declares no dataset
    #[error(
        "Task '{0}' needs per-batch iteration but declares no dataset parameter \
         (batch_*, data_* or iterator_*)"
    )]
    MissingDataset(String),

    /// Two tasks share a qualified name
    #[error("Duplicate task '{0}'")]
    DuplicateTask(String),

    /// Nothing to train
    #[error("No training tasks found")]
    NoTasks,

    /// Preparing a task for a phase failed
    #[error("Setup failed for '{task}': {source}")]
    Setup {
        /// Qualified task name
        task: String,
        /// Underlying error
        #[source]
        source: TrainingError,
    },

    /// Invalid run settings
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    /// Training primitive error
    #[error("Training error: {0}")]
    Training(#[from] TrainingError),

    /// Engine error
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
