//! In-process checkpoint storage.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::store::{CheckpointID, CheckpointStore, StoredCheckpoint};

/// CheckpointStore that keeps every write in memory.
///
/// Useful for tests and dry runs: besides the latest value per key it keeps
/// the full write history.
#[derive(Default)]
pub struct MemoryStore {
    writes: Mutex<HashMap<CheckpointID, Vec<StoredCheckpoint>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All checkpoints written for `id`, oldest first.
    pub fn history(&self, id: &CheckpointID) -> Vec<StoredCheckpoint> {
        self.writes
            .lock()
            .map(|w| w.get(id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn store_checkpoint(&self, id: &CheckpointID, checkpoint_data: String) -> Result<()> {
        let stored = StoredCheckpoint {
            checkpoint_data,
            database_type: id.database_type.clone(),
            key: id.key.clone(),
            created_at: Utc::now(),
        };
        let mut writes = self
            .writes
            .lock()
            .map_err(|_| anyhow::anyhow!("checkpoint store lock poisoned"))?;
        writes.entry(id.clone()).or_default().push(stored);
        Ok(())
    }

    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<StoredCheckpoint>> {
        let writes = self
            .writes
            .lock()
            .map_err(|_| anyhow::anyhow!("checkpoint store lock poisoned"))?;
        Ok(writes.get(id).and_then(|h| h.last().cloned()))
    }
}
