//! Checkpoint management for binlog-replicator
//!
//! Provides storage-agnostic checkpoint file handling with support for
//! database-specific checkpoint types.
//!
//! # Architecture
//!
//! This crate provides a generic checkpoint system that:
//! - Defines the `Checkpoint` trait for database-specific checkpoint types
//! - Provides `CheckpointFile` wrapper for storage-agnostic serialization
//! - Saves and loads checkpoints via `CheckpointManager`
//! - Supports multiple storage backends via `CheckpointStore` trait
//!
//! ## Storage Backends
//!
//! - `FilesystemStore` - One JSON file per key, replaced atomically
//! - `MemoryStore` - In-process, keeps the write history
//!
//! Checkpoints are keyed: every pipeline (or shard) owns one key and writes
//! to different keys never interfere.

mod file;
mod filesystem;
mod manager;
mod memory;
pub mod store;


// Re-export file types
pub use file::CheckpointFile;

// Re-export manager types
pub use manager::CheckpointManager;

// Re-export store trait and types
pub use store::{CheckpointID, CheckpointStore, StoredCheckpoint};

// Re-export storage implementations
pub use filesystem::FilesystemStore;
pub use memory::MemoryStore;

/// Trait that database-specific checkpoints must implement.
///
/// This trait defines the interface for checkpoint types, enabling
/// storage-agnostic checkpoint file handling while preserving
/// database-specific data structures.
///
/// # Example
///
/// ```rust
/// use checkpoint::Checkpoint;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct LogCheckpoint {
///     pub file: String,
///     pub offset: u64,
/// }
///
/// impl Checkpoint for LogCheckpoint {
///     const DATABASE_TYPE: &'static str = "mylog";
///
///     fn to_cli_string(&self) -> String {
///         format!("{}:{}", self.file, self.offset)
///     }
///
///     fn from_cli_string(s: &str) -> anyhow::Result<Self> {
///         let (file, offset) = s
///             .rsplit_once(':')
///             .ok_or_else(|| anyhow::anyhow!("Invalid checkpoint format"))?;
///         Ok(Self {
///             file: file.to_string(),
///             offset: offset.parse()?,
///         })
///     }
/// }
/// ```
pub trait Checkpoint: serde::Serialize + for<'de> serde::Deserialize<'de> + Clone {
    /// Database type identifier (e.g., "mysql-binlog").
    ///
    /// This constant is used to:
    /// - Identify the checkpoint type in serialized files
    /// - Validate checkpoint type when loading from file
    const DATABASE_TYPE: &'static str;

    /// Convert to CLI-friendly string format.
    ///
    /// The returned string should be parseable by `from_cli_string()`.
    fn to_cli_string(&self) -> String;

    /// Parse from CLI string format.
    ///
    /// Should parse the format produced by `to_cli_string()`.
    fn from_cli_string(s: &str) -> anyhow::Result<Self>
    where
        Self: Sized;
}

/// Read the checkpoint file stored under `key` in a filesystem checkpoint
/// directory, whatever its database type.
///
/// Standalone function for CLI and test scenarios that only have a
/// directory path.
///
/// # Errors
/// * Returns error if no checkpoint exists for the key
/// * Returns error if the checkpoint file cannot be read or parsed
pub async fn get_checkpoint_from_dir<P: AsRef<std::path::Path>>(
    checkpoint_dir: P,
    key: &str,
) -> anyhow::Result<CheckpointFile> {
    let store = FilesystemStore::new(checkpoint_dir.as_ref());
    let path = store.path_for(key);
    if !path.exists() {
        return Err(anyhow::anyhow!("No checkpoint found for key: {key}"));
    }
    let content = std::fs::read_to_string(&path)?;
    let stored: StoredCheckpoint = serde_json::from_str(&content)?;
    CheckpointFile::from_stored(stored)
}
