//! Typed checkpoint saving and loading on top of a [`CheckpointStore`].

use std::sync::Arc;

use crate::{store::CheckpointStore, Checkpoint, CheckpointFile, CheckpointID};

/// Saves and loads database-specific checkpoints through any store.
///
/// # Example
///
/// ```rust,ignore
/// use checkpoint::{CheckpointManager, FilesystemStore};
///
/// let manager = CheckpointManager::new(Arc::new(FilesystemStore::new("/tmp/checkpoints")));
/// manager.emit_checkpoint("orders", &checkpoint).await?;
/// let loaded: Option<BinlogCheckpoint> = manager.read_checkpoint("orders").await?;
/// ```
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Get a reference to the underlying store.
    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Persist `checkpoint` under `key`, replacing the previous one.
    pub async fn emit_checkpoint<C: Checkpoint>(
        &self,
        key: &str,
        checkpoint: &C,
    ) -> anyhow::Result<()> {
        let id = CheckpointID::new(C::DATABASE_TYPE, key);
        let checkpoint_data = serde_json::to_string(checkpoint)?;
        self.store.store_checkpoint(&id, checkpoint_data).await?;

        tracing::info!(
            "Emitted {} checkpoint for '{}': {}",
            C::DATABASE_TYPE,
            key,
            checkpoint.to_cli_string()
        );
        Ok(())
    }

    /// Load the checkpoint file stored under `key`, if any.
    pub async fn read_checkpoint_file<C: Checkpoint>(
        &self,
        key: &str,
    ) -> anyhow::Result<Option<CheckpointFile>> {
        let id = CheckpointID::new(C::DATABASE_TYPE, key);
        match self.store.read_checkpoint(&id).await? {
            Some(stored) => Ok(Some(CheckpointFile::from_stored(stored)?)),
            None => Ok(None),
        }
    }

    /// Load and parse the checkpoint stored under `key`.
    ///
    /// The checkpoint type `C` can be inferred from context:
    ///
    /// ```rust,ignore
    /// let checkpoint: Option<BinlogCheckpoint> = manager.read_checkpoint("orders").await?;
    /// ```
    pub async fn read_checkpoint<C: Checkpoint>(&self, key: &str) -> anyhow::Result<Option<C>> {
        match self.read_checkpoint_file::<C>(key).await? {
            Some(file) => Ok(Some(file.parse::<C>()?)),
            None => Ok(None),
        }
    }
}
