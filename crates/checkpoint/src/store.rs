//! Checkpoint storage trait and types
//!
//! This module defines the CheckpointStore trait for backend-agnostic
//! checkpoint storage operations, plus shared types.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Checkpoint identifier for storage
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointID {
    /// Database type (e.g., "mysql-binlog")
    pub database_type: String,
    /// Owner of the checkpoint, e.g. a pipeline or shard name
    pub key: String,
}

impl CheckpointID {
    pub fn new(database_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            database_type: database_type.into(),
            key: key.into(),
        }
    }
}

/// Checkpoint data stored in backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCheckpoint {
    /// Serialized checkpoint (e.g., binlog file and offset)
    pub checkpoint_data: String,
    /// Database type for validation
    pub database_type: String,
    /// Key the checkpoint was stored under
    pub key: String,
    /// Timestamp when checkpoint was created
    pub created_at: DateTime<Utc>,
}

/// Trait for checkpoint storage operations.
///
/// Writes for one key are last-writer-wins and must be atomic: a reader
/// sees either the previous checkpoint or the new one, never a partial
/// write. Different keys are independent.
///
/// Implementations:
/// - Filesystem storage (`FilesystemStore`)
/// - In-process storage (`MemoryStore`)
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Store a checkpoint in the storage backend.
    async fn store_checkpoint(&self, id: &CheckpointID, checkpoint_data: String) -> Result<()>;

    /// Read a checkpoint from the storage backend.
    ///
    /// Returns None if the checkpoint doesn't exist.
    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<StoredCheckpoint>>;
}
