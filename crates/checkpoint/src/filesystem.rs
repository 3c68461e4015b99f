//! Filesystem-based checkpoint storage implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;

use crate::store::{CheckpointID, CheckpointStore, StoredCheckpoint};

/// Filesystem implementation of CheckpointStore trait.
///
/// Stores one JSON file per key, `checkpoint_{key}.json`. Each write goes to
/// a temporary file that is then renamed over the previous checkpoint.
pub struct FilesystemStore {
    dir: PathBuf,
}

impl FilesystemStore {
    /// Create a new FilesystemStore with the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Get the directory path.
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Path of the checkpoint file for `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("checkpoint_{}.json", sanitize_key(key)))
    }
}

/// Keep keys usable as file names.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl CheckpointStore for FilesystemStore {
    async fn store_checkpoint(&self, id: &CheckpointID, checkpoint_data: String) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let stored = StoredCheckpoint {
            checkpoint_data,
            database_type: id.database_type.clone(),
            key: id.key.clone(),
            created_at: Utc::now(),
        };

        let filename = self.path_for(&id.key);
        let tmp = filename.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&stored)?)?;
        std::fs::rename(&tmp, &filename)
            .with_context(|| format!("Failed to replace {}", filename.display()))?;
        tracing::debug!("Stored checkpoint to {}", filename.display());
        Ok(())
    }

    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<StoredCheckpoint>> {
        let path = self.path_for(&id.key);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let stored: StoredCheckpoint = serde_json::from_str(&content)
            .with_context(|| format!("Malformed checkpoint file {}", path.display()))?;
        if stored.database_type != id.database_type {
            anyhow::bail!(
                "Checkpoint type mismatch in {}: expected '{}', found '{}'",
                path.display(),
                id.database_type,
                stored.database_type
            );
        }
        Ok(Some(stored))
    }
}
