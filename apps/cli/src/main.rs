//! Tandem CLI - trains every discovered task group side by side.
//!
//! Provides the `tandem` command: it walks a directory for `train_*.toml`
//! task manifests, resolves them against the task modules compiled into the
//! binary and runs the scheduler until all groups finish or Ctrl-C is
//! pressed.

mod config;
mod demos;

use anyhow::Context;
use clap::Parser;
use config::CliConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tandem_orchestrator::{Application, FsTaskSource, OrchestrationError, Registry};
use tandem_training::StdoutProgressSink;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Tandem - concurrent multi-task training
#[derive(Parser, Debug)]
#[command(
    name = "tandem",
    author,
    version,
    about = "Tandem - train groups of tasks that share components, side by side"
)]
struct Args {
    /// Only load task manifests whose path contains this substring
    filter: Option<String>,

    /// Directory searched for train_*.toml manifests
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Restore components from existing checkpoints
    #[arg(long)]
    resume: bool,

    /// Device identifier (cpu, cuda, cuda:N, metal)
    #[arg(short, long)]
    device: Option<String>,

    /// Directory for checkpoints and the run manifest
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Base seed for batch sampling
    #[arg(long)]
    seed: Option<u64>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long)]
    log_level: Option<String>,

    /// Extra configuration file layered over tandem.toml
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Args {
    /// Command-line values as the topmost configuration layer.
    fn as_config(&self) -> CliConfig {
        CliConfig {
            root: self.root.clone(),
            filter: self.filter.clone(),
            output_dir: self.output.clone(),
            device: self.device.clone(),
            seed: self.seed,
            resume: self.resume.then_some(true),
            train_split: None,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = CliConfig::discover_and_load(args.config.as_deref())?;
    config.merge(&args.as_config());

    let level = config.log_level.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    tracing_subscriber::fmt().with_env_filter(filter).without_time().with_target(false).init();

    let settings = config.run_settings()?;
    let root = config.root.clone().unwrap_or_else(|| PathBuf::from("."));

    let mut source = FsTaskSource::new(&root, demos::catalog());
    if let Some(filter) = &config.filter {
        source = source.with_filter(filter.clone());
    }

    let mut registry = Registry::new();
    registry.load(&source).with_context(|| format!("loading tasks from {}", root.display()))?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing the current round");
            on_interrupt.cancel();
        }
    });

    let application =
        Application::new(registry, settings).with_progress(Arc::new(StdoutProgressSink));
    match application.run(cancel).await {
        Ok(summary) => {
            info!(rounds = summary.rounds, checkpoints = summary.checkpoints.len(), "Done");
            Ok(())
        }
        Err(OrchestrationError::NoTasks) => {
            eprintln!("ERROR: No tasks found.");
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
