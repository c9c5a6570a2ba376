use crate::error::TrainingResult;
use std::path::{Path, PathBuf};

/// Default output directory, relative to the working directory.
pub const DEFAULT_OUTPUT_DIR: &str = "models";

/// Filesystem layout for run outputs.
///
/// Checkpoints and the run manifest sit side by side under one directory:
/// `<root>/<Component>-<hash>.ckpt` and `<root>/run_manifest.json`.
#[derive(Debug, Clone)]
pub struct TrainingLayout {
    root: PathBuf,
}

impl TrainingLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Layout rooted at `models/` under `workspace_root`.
    #[must_use]
    pub fn for_workspace_root(workspace_root: &Path) -> Self {
        Self::new(workspace_root.join(DEFAULT_OUTPUT_DIR))
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn checkpoint_path(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("run_manifest.json")
    }

    /// Creates the output directory. Called lazily on first write so that a
    /// run which never saves leaves no trace.
    pub fn ensure_root(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}
