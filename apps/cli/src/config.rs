//! CLI configuration file support.
//!
//! Configuration precedence:
//! 1. CLI arguments
//! 2. File given with `--config`
//! 3. Local config file (`./tandem.toml`)
//! 4. Global config file (`~/.tandem/config.toml`)
//! 5. Defaults

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tandem_abstraction::Device;
use tandem_orchestrator::RunSettings;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum CliConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

pub type CliConfigResult<T> = std::result::Result<T, CliConfigError>;

/// Settings that may come from a config file. Unset fields fall through to
/// the next layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    /// Directory searched for task manifests.
    pub root: Option<PathBuf>,
    /// Substring a manifest path must contain.
    pub filter: Option<String>,
    pub output_dir: Option<PathBuf>,
    /// Device identifier, e.g. `cpu` or `cuda:0`.
    pub device: Option<String>,
    pub seed: Option<u64>,
    pub resume: Option<bool>,
    pub train_split: Option<f64>,
    pub log_level: Option<String>,
}

impl CliConfig {
    pub fn load_from_file(path: &Path) -> CliConfigResult<Self> {
        if !path.exists() {
            return Err(CliConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|source| CliConfigError::Read { path: path.display().to_string(), source })?;
        toml::from_str(&content)
            .map_err(|source| CliConfigError::Parse { path: path.display().to_string(), source })
    }

    pub fn default_global_path() -> PathBuf {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".tandem")
            .join("config.toml")
    }

    pub fn default_local_path() -> PathBuf {
        PathBuf::from("tandem.toml")
    }

    /// Loads the global and local files when present, then `explicit`, which
    /// must exist.
    ///
    /// A present but malformed file is an error rather than silently skipped.
    pub fn discover_and_load(explicit: Option<&Path>) -> CliConfigResult<Self> {
        let mut config = Self::default();
        for path in [Self::default_global_path(), Self::default_local_path()] {
            match Self::load_from_file(&path) {
                Ok(layer) => config.merge(&layer),
                Err(CliConfigError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if let Some(path) = explicit {
            config.merge(&Self::load_from_file(path)?);
        }
        Ok(config)
    }

    /// Values set in `other` override values in `self`.
    pub fn merge(&mut self, other: &Self) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field.clone_from(&other.$field);
                })*
            };
        }
        take!(root, filter, output_dir, device, seed, resume, train_split, log_level);
    }

    /// Builds run settings from the merged configuration.
    pub fn run_settings(&self) -> CliConfigResult<RunSettings> {
        let mut settings = RunSettings::default();
        if let Some(output_dir) = &self.output_dir {
            settings.output_dir.clone_from(output_dir);
        }
        if let Some(device) = &self.device {
            settings.device = device
                .parse::<Device>()
                .map_err(|e| CliConfigError::InvalidValue(format!("device '{device}': {e}")))?;
        }
        if let Some(seed) = self.seed {
            settings.seed = seed;
        }
        if let Some(resume) = self.resume {
            settings.resume = resume;
        }
        if let Some(split) = self.train_split {
            settings.train_split = split;
        }
        settings.validate().map_err(|e| CliConfigError::InvalidValue(e.to_string()))?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_merge_overrides_set_fields() {
        let mut base = CliConfig {
            seed: Some(1),
            device: Some("cpu".into()),
            ..Default::default()
        };
        base.merge(&CliConfig { seed: Some(9), ..Default::default() });
        assert_eq!(base.seed, Some(9));
        assert_eq!(base.device.as_deref(), Some("cpu"));
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tandem.toml");
        std::fs::write(&path, "seed = 3\ndevice = \"cuda:1\"\nresume = true\n").unwrap();

        let config = CliConfig::load_from_file(&path).unwrap();
        let settings = config.run_settings().unwrap();
        assert_eq!(settings.seed, 3);
        assert_eq!(settings.device, Device::Cuda(1));
        assert!(settings.resume);

        std::fs::write(&path, "sede = 3\n").unwrap();
        assert!(matches!(CliConfig::load_from_file(&path), Err(CliConfigError::Parse { .. })));
        assert!(matches!(
            CliConfig::load_from_file(&temp.path().join("absent.toml")),
            Err(CliConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_invalid_values() {
        let config = CliConfig { device: Some("tpu".into()), ..Default::default() };
        assert!(config.run_settings().is_err());
        let config = CliConfig { train_split: Some(1.5), ..Default::default() };
        assert!(config.run_settings().is_err());
    }
}
