//! Checkpoint file wrapper for storage-agnostic serialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Checkpoint, StoredCheckpoint};

/// Storage-agnostic checkpoint file wrapper.
///
/// This struct wraps database-specific checkpoints with metadata
/// for storage and retrieval. The format is designed to be:
/// - Self-describing (includes `database_type` field)
/// - Extensible (uses JSON Value for checkpoint data)
///
/// # File Format
///
/// ```json
/// {
///     "database_type": "mysql-binlog",
///     "key": "orders",
///     "checkpoint": {
///         "timestamp": 1548982800123,
///         "serverId": 1,
///         "globalTransactionId": null,
///         "position": { "segment": "mysql-bin.000003", "offset": 4 }
///     },
///     "created_at": "2024-01-01T00:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// Database type identifier (e.g., "mysql-binlog")
    pub database_type: String,
    /// Key the checkpoint belongs to
    pub key: String,
    /// Serialized checkpoint data as JSON Value
    pub checkpoint: serde_json::Value,
    /// Timestamp when this checkpoint file was created
    pub created_at: DateTime<Utc>,
}

impl CheckpointFile {
    /// Create new checkpoint file from database-specific checkpoint.
    pub fn new<C: Checkpoint>(checkpoint: &C, key: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            database_type: C::DATABASE_TYPE.to_string(),
            key: key.into(),
            checkpoint: serde_json::to_value(checkpoint)?,
            created_at: Utc::now(),
        })
    }

    /// Rebuild the wrapper from what a [`CheckpointStore`](crate::CheckpointStore)
    /// returned.
    pub fn from_stored(stored: StoredCheckpoint) -> anyhow::Result<Self> {
        Ok(Self {
            checkpoint: serde_json::from_str(&stored.checkpoint_data)?,
            database_type: stored.database_type,
            key: stored.key,
            created_at: stored.created_at,
        })
    }

    /// Parse checkpoint into database-specific type.
    ///
    /// Validates that the stored `database_type` matches the expected type `C`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The `database_type` doesn't match `C::DATABASE_TYPE`
    /// - The checkpoint data can't be deserialized into type `C`
    pub fn parse<C: Checkpoint>(&self) -> anyhow::Result<C> {
        if self.database_type != C::DATABASE_TYPE {
            anyhow::bail!(
                "Checkpoint type mismatch: expected '{}', found '{}'",
                C::DATABASE_TYPE,
                self.database_type
            );
        }
        Ok(serde_json::from_value(self.checkpoint.clone())?)
    }

    /// Get the database type of this checkpoint file.
    pub fn database_type(&self) -> &str {
        &self.database_type
    }

    /// Get the key this checkpoint was stored under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the timestamp when this checkpoint file was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
