//! Tandem Training
//!
//! Engine-agnostic training primitives for:
//! - Batches, datasets and the batch strategies that sample them
//! - Task descriptors and their per-task / per-component configuration
//! - Optimizers and learning-rate schedulers
//! - Component checkpoints, output layout and run manifests
//! - Progress reporting

pub mod artifacts;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod layout;
pub mod optim;
pub mod progress;
pub mod sampler;
pub mod schedule;
pub mod task;

pub use artifacts::{ArtifactKind, GroupMetrics, RunId, RunManifest, TrainingArtifact};
pub use batch::Batch;
pub use checkpoint::{
    CheckpointStore, FsCheckpointStore, MemoryCheckpointStore, checkpoint_filename,
};
pub use config::{ComponentConfig, IterationOrder, Mode, OptimizerKind, SchedulerKind, TaskConfig};
pub use dataset::{Dataset, DatasetInput, DatasetProvider, Segment, StreamSegment, TensorSegment};
pub use error::{TrainingError, TrainingResult};
pub use layout::TrainingLayout;
pub use optim::{Optimizer, build_optimizer};
pub use progress::{ProgressEvent, ProgressSink, StdoutProgressSink, TracingProgressSink};
pub use sampler::BatchStream;
pub use schedule::{LrScheduler, build_scheduler};
pub use task::{
    ComponentFactory, ComponentKey, DatasetFactory, DatasetKey, Injection, StepOutcome, TaskArgs,
    TaskDefinition, TaskDescriptor, TaskFn, TaskKind, TaskParam,
};
