use crate::error::{TrainingError, TrainingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Identifier for one orchestrator run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    ComponentCheckpoint,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingArtifact {
    pub kind: ArtifactKind,
    /// Short type name of the component the artifact belongs to.
    pub component: String,
    pub path: PathBuf,
    pub sha256: String,
}

/// Outcome of one group at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GroupMetrics {
    pub group: String,
    pub tasks: Vec<String>,
    pub epochs_completed: u32,
    pub training_steps: u64,
    pub optimizer_steps: u64,
    pub last_train_loss: Option<f64>,
    pub last_validation_loss: Option<f64>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    #[serde(default)]
    pub groups: Vec<GroupMetrics>,
    pub artifacts: Vec<TrainingArtifact>,
}

impl RunManifest {
    pub fn write(&self, path: &Path) -> TrainingResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn read(path: &Path) -> TrainingResult<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn make_artifact(
    kind: ArtifactKind,
    component: &str,
    path: PathBuf,
) -> TrainingResult<TrainingArtifact> {
    if !path.exists() {
        return Err(TrainingError::Checkpoint(format!(
            "artifact path does not exist: {}",
            path.display()
        )));
    }

    let hash = sha256_file(&path)?;
    Ok(TrainingArtifact { kind, component: component.to_string(), path, sha256: hash })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_make_artifact_hashes_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Image-00000000.ckpt");
        std::fs::write(&path, b"abc").unwrap();

        let artifact = make_artifact(ArtifactKind::ComponentCheckpoint, "Image", path).unwrap();
        assert_eq!(
            artifact.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(make_artifact(ArtifactKind::Other, "x", temp.path().join("missing")).is_err());
    }

    #[test]
    fn test_manifest_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run_manifest.json");
        let manifest = RunManifest {
            run_id: RunId::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            cancelled: true,
            groups: vec![GroupMetrics { group: "Image".to_string(), ..Default::default() }],
            artifacts: Vec::new(),
        };
        manifest.write(&path).unwrap();
        let read = RunManifest::read(&path).unwrap();
        assert_eq!(read.run_id, manifest.run_id);
        assert!(read.cancelled);
        assert_eq!(read.groups[0].group, "Image");
    }
}
