//! Applier boundary: where decoded events leave the pipeline.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::checkpoint::BinlogCheckpoint;
use crate::error::ApplyError;
use crate::event::{AppliedEvent, RowChangeEvent, TransactionContext};

/// Sink for decoded events.
///
/// Events of one shard arrive strictly in source order. Application must be
/// idempotent: after a restart the tail since the last persisted checkpoint
/// is delivered again.
#[async_trait]
pub trait Applier: Send + Sync {
    async fn apply(
        &self,
        event: &AppliedEvent,
        context: &TransactionContext,
    ) -> Result<(), ApplyError>;

    /// Push out anything buffered.
    async fn force_flush(&self) -> Result<(), ApplyError>;

    /// Checkpoint of the last commit that is durable downstream.
    fn last_durable_checkpoint(&self) -> Option<BinlogCheckpoint>;
}

#[derive(Default)]
struct MemoryState {
    applied: Vec<(AppliedEvent, TransactionContext)>,
    durable: Option<BinlogCheckpoint>,
    flushes: usize,
    fail_after: Option<(usize, bool)>,
}

/// Applier that records everything in memory. Every commit is durable
/// immediately.
#[derive(Default)]
pub struct MemoryApplier {
    state: Mutex<MemoryState>,
}

impl MemoryApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every apply once `count` events have been applied, with an I/O
    /// fault or, if `fatal`, an unrecoverable one.
    pub fn failing_after(self, count: usize, fatal: bool) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.fail_after = Some((count, fatal));
        }
        self
    }

    /// Stop injecting failures.
    pub fn heal(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_after = None;
        }
    }

    pub fn events(&self) -> Vec<AppliedEvent> {
        self.state
            .lock()
            .map(|s| s.applied.iter().map(|(e, _)| e.clone()).collect())
            .unwrap_or_default()
    }

    pub fn contexts(&self) -> Vec<TransactionContext> {
        self.state
            .lock()
            .map(|s| s.applied.iter().map(|(_, c)| c.clone()).collect())
            .unwrap_or_default()
    }

    pub fn rows(&self) -> Vec<RowChangeEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                AppliedEvent::Row(row) => Some(row),
                _ => None,
            })
            .collect()
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().map(|s| s.flushes).unwrap_or_default()
    }
}

#[async_trait]
impl Applier for MemoryApplier {
    async fn apply(
        &self,
        event: &AppliedEvent,
        context: &TransactionContext,
    ) -> Result<(), ApplyError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ApplyError::Fatal(anyhow::anyhow!("memory applier lock poisoned")))?;
        if let Some((count, fatal)) = state.fail_after {
            if state.applied.len() >= count {
                let err = anyhow::anyhow!("injected failure after {count} events");
                return Err(if fatal {
                    ApplyError::Fatal(err)
                } else {
                    ApplyError::Io(err)
                });
            }
        }
        if let AppliedEvent::Commit { checkpoint, .. } = event {
            state.durable = Some(checkpoint.clone());
        }
        state.applied.push((event.clone(), context.clone()));
        Ok(())
    }

    async fn force_flush(&self) -> Result<(), ApplyError> {
        if let Ok(mut state) = self.state.lock() {
            state.flushes += 1;
        }
        Ok(())
    }

    fn last_durable_checkpoint(&self) -> Option<BinlogCheckpoint> {
        self.state.lock().ok().and_then(|s| s.durable.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointPosition;
    use uuid::Uuid;

    fn commit(offset: u64) -> AppliedEvent {
        AppliedEvent::Commit {
            transaction_id: Uuid::new_v4(),
            xid: Some(1),
            gtid: None,
            timestamp_micros: 0,
            checkpoint: BinlogCheckpoint::new(CheckpointPosition::new("mysql-bin.000001", offset)),
        }
    }

    #[tokio::test]
    async fn test_commit_becomes_durable() {
        let applier = MemoryApplier::new();
        assert!(applier.last_durable_checkpoint().is_none());
        applier
            .apply(&commit(300), &TransactionContext::default())
            .await
            .unwrap();
        assert_eq!(
            applier.last_durable_checkpoint().unwrap().position.offset,
            300
        );
        assert_eq!(applier.events().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let applier = MemoryApplier::new().failing_after(1, false);
        let ctx = TransactionContext::default();
        applier.apply(&commit(1), &ctx).await.unwrap();
        assert!(matches!(
            applier.apply(&commit(2), &ctx).await,
            Err(ApplyError::Io(_))
        ));
        applier.heal();
        applier.apply(&commit(2), &ctx).await.unwrap();

        let fatal = MemoryApplier::new().failing_after(0, true);
        assert!(matches!(
            fatal.apply(&commit(1), &ctx).await,
            Err(ApplyError::Fatal(_))
        ));
    }
}
