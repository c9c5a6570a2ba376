//! Component checkpoint naming and storage.
//!
//! A checkpoint's filename depends only on the component's fully-qualified
//! type name, so a later run finds the same file and can resume from it.

use crate::error::{TrainingError, TrainingResult};
use crate::layout::TrainingLayout;
use crate::task::ComponentKey;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

pub const CHECKPOINT_EXTENSION: &str = "ckpt";

/// First four bytes of SHA-256 over the UTF-8 name, as eight hex characters.
#[must_use]
pub fn name_digest(qualified_name: &str) -> String {
    let digest = Sha256::digest(qualified_name.as_bytes());
    hex::encode(&digest[..4])
}

/// `{ShortName}-{digest}.ckpt`
#[must_use]
pub fn checkpoint_filename(key: ComponentKey) -> String {
    format!(
        "{}-{}.{}",
        key.short_name(),
        name_digest(key.qualified_name()),
        CHECKPOINT_EXTENSION
    )
}

/// Persists named binary blobs.
pub trait CheckpointStore: Send + Sync {
    /// Writes `bytes` under `name`, replacing any previous blob, and returns
    /// where it went.
    fn save(&self, name: &str, bytes: &[u8]) -> TrainingResult<PathBuf>;

    /// Reads the blob saved under `name`, if any.
    fn load(&self, name: &str) -> TrainingResult<Option<Vec<u8>>>;
}

/// Stores checkpoints as files under a [`TrainingLayout`] root.
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    layout: TrainingLayout,
}

impl FsCheckpointStore {
    #[must_use]
    pub fn new(layout: TrainingLayout) -> Self {
        Self { layout }
    }

    #[must_use]
    pub fn layout(&self) -> &TrainingLayout {
        &self.layout
    }
}

impl CheckpointStore for FsCheckpointStore {
    fn save(&self, name: &str, bytes: &[u8]) -> TrainingResult<PathBuf> {
        if name.contains(['/', '\\']) {
            return Err(TrainingError::Checkpoint(format!("invalid checkpoint name: {name}")));
        }
        self.layout.ensure_root()?;
        let path = self.layout.checkpoint_path(name);
        let partial = path.with_extension("partial");
        std::fs::write(&partial, bytes)?;
        std::fs::rename(&partial, &path)?;
        Ok(path)
    }

    fn load(&self, name: &str) -> TrainingResult<Option<Vec<u8>>> {
        match std::fs::read(self.layout.checkpoint_path(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keeps checkpoints in memory.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of every stored blob, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, name: &str, bytes: &[u8]) -> TrainingResult<PathBuf> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), bytes.to_vec());
        Ok(PathBuf::from(name))
    }

    fn load(&self, name: &str) -> TrainingResult<Option<Vec<u8>>> {
        Ok(self.blobs.lock().unwrap_or_else(PoisonError::into_inner).get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Image;
    struct Mask;

    #[test]
    fn test_digest_is_stable_and_short() {
        let a = name_digest("demo::models::Image");
        assert_eq!(a, name_digest("demo::models::Image"));
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, name_digest("demo::models::Mask"));
    }

    #[test]
    fn test_digest_known_value() {
        // sha256("") = e3b0c442...
        assert_eq!(name_digest(""), "e3b0c442");
    }

    #[test]
    fn test_filename_shape() {
        let image = checkpoint_filename(ComponentKey::of::<Image>());
        assert!(image.starts_with("Image-"));
        assert!(image.ends_with(".ckpt"));
        assert_eq!(image.len(), "Image-".len() + 8 + ".ckpt".len());
        assert_ne!(image, checkpoint_filename(ComponentKey::of::<Mask>()));
    }

    #[test]
    fn test_fs_store_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = FsCheckpointStore::new(TrainingLayout::for_workspace_root(temp.path()));
        assert!(store.load("Image-00000000.ckpt").unwrap().is_none());

        let path = store.save("Image-00000000.ckpt", b"state").unwrap();
        assert!(path.exists());
        assert_eq!(store.load("Image-00000000.ckpt").unwrap().as_deref(), Some(&b"state"[..]));
        assert!(store.save("../escape", b"x").is_err());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryCheckpointStore::new();
        store.save("b", b"2").unwrap();
        store.save("a", b"1").unwrap();
        assert_eq!(store.names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.load("a").unwrap(), Some(b"1".to_vec()));
    }
}
