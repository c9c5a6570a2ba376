//! Tandem Orchestrator
//!
//! Discovers training tasks, groups them by the components they optimize and
//! trains all groups concurrently in round-robin fashion on a single thread.
//!
//! # Example
//!
//! ```rust,no_run
//! use tandem_orchestrator::{Application, ModuleCatalog, Registry, RunSettings};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(catalog: ModuleCatalog) -> tandem_orchestrator::Result<()> {
//! let mut registry = Registry::new();
//! registry.load(&catalog)?;
//!
//! let app = Application::new(registry, RunSettings::default());
//! let summary = app.run(CancellationToken::new()).await?;
//! println!("{} rounds", summary.rounds);
//! # Ok(())
//! # }
//! ```

mod application;
mod error;
mod group_run;
mod grouping;
mod registry;
mod settings;
mod source;
mod trainer;

pub use application::{Application, RunSummary};
pub use error::{OrchestrationError, Result};
pub use group_run::{Advance, GroupRun, GroupState};
pub use grouping::Group;
pub use registry::{ComponentMap, DatasetMap, Registry};
pub use settings::RunSettings;
pub use source::{
    FsTaskSource, MANIFEST_EXTENSION, MANIFEST_PREFIX, ModuleCatalog, TaskModule, TaskSource,
};
pub use trainer::{ExecutionContext, StepResult, Trainer};
