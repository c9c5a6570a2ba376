//! Run-level settings.

use crate::error::{OrchestrationError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tandem_abstraction::Device;
use tandem_training::dataset::DEFAULT_TRAIN_SPLIT;
use tandem_training::layout::DEFAULT_OUTPUT_DIR;

/// Settings that apply to a whole run rather than to one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Where checkpoints and the run manifest are written.
    pub output_dir: PathBuf,
    pub device: Device,
    /// Base seed for every random batch stream.
    pub seed: u64,
    /// Restore components from existing checkpoints before training.
    pub resume: bool,
    /// Fraction of a bulk dataset used for training.
    pub train_split: f64,
    /// Write `run_manifest.json` next to the checkpoints.
    pub write_manifest: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            device: Device::Cpu,
            seed: 42,
            resume: false,
            train_split: DEFAULT_TRAIN_SPLIT,
            write_manifest: true,
        }
    }
}

impl RunSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.train_split > 0.0 && self.train_split <= 1.0) {
            return Err(OrchestrationError::InvalidSettings(format!(
                "train_split must be in (0, 1], got {}",
                self.train_split
            )));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(OrchestrationError::InvalidSettings(
                "output_dir must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
