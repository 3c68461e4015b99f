//! Checkpoint inspection utilities
//!
//! Helpers for reading the checkpoint files a replay leaves in its
//! checkpoint directory.

use std::path::Path;

use anyhow::{Context, Result};
use binlog_replicator_pipeline::BinlogCheckpoint;
use checkpoint::{get_checkpoint_from_dir, CheckpointFile, StoredCheckpoint};

/// Read the binlog checkpoint stored under `key`.
///
/// # Errors
/// * Returns error if no checkpoint exists for the key
/// * Returns error if the file holds a checkpoint of another database type
pub async fn read_binlog_checkpoint<P: AsRef<Path>>(
    checkpoint_dir: P,
    key: &str,
) -> Result<BinlogCheckpoint> {
    let file = get_checkpoint_from_dir(checkpoint_dir, key).await?;
    file.parse::<BinlogCheckpoint>()
        .with_context(|| format!("Checkpoint '{key}' is not a binlog checkpoint"))
}

/// Every checkpoint file in a directory, sorted by key.
pub fn list_checkpoints<P: AsRef<Path>>(checkpoint_dir: P) -> Result<Vec<CheckpointFile>> {
    let dir = checkpoint_dir.as_ref();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read checkpoint directory {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext == "json")
            .unwrap_or(false);
        if !is_json {
            continue;
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let stored: StoredCheckpoint = serde_json::from_str(&content)
            .with_context(|| format!("Malformed checkpoint file {}", path.display()))?;
        files.push(CheckpointFile::from_stored(stored)?);
    }
    files.sort_by(|a, b| a.key().cmp(b.key()));
    Ok(files)
}

/// One-line summary, e.g. `orders  mysql-bin.000003:812  gtid=...`.
pub fn describe(file: &CheckpointFile) -> String {
    match file.parse::<BinlogCheckpoint>() {
        Ok(checkpoint) => {
            let mut line = format!(
                "{}\t{}:{}",
                file.key(),
                checkpoint.position.segment,
                checkpoint.position.offset
            );
            if let Some(gtid) = &checkpoint.gtid {
                line.push_str(&format!("\tgtid={gtid}"));
            }
            line.push_str(&format!("\tsaved={}", file.created_at().to_rfc3339()));
            line
        }
        Err(_) => format!("{}\t({})", file.key(), file.database_type()),
    }
}
