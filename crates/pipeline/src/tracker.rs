//! Safe checkpoint computation across shards.
//!
//! Shards report the checkpoint of every transaction the applier made
//! durable. Periodically the tracker persists:
//! - each advanced shard's own checkpoint under `{key}.{shard_id}`
//! - the minimum over all registered shards under `{key}`
//!
//! The global value is only written once every shard has reported, and only
//! when it moves forward, so it never passes a shard's real progress and
//! never goes back.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use checkpoint::CheckpointManager;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::checkpoint::BinlogCheckpoint;

#[derive(Debug, Default)]
struct ShardProgress {
    latest: Option<BinlogCheckpoint>,
    advanced: bool,
}

#[derive(Debug, Default)]
struct TrackerState {
    shards: BTreeMap<String, ShardProgress>,
    last_persisted: Option<BinlogCheckpoint>,
}

pub struct CheckpointTracker {
    manager: CheckpointManager,
    key: String,
    by_gtid: bool,
    state: Mutex<TrackerState>,
}

impl CheckpointTracker {
    /// `by_gtid` orders checkpoints by GTID sequence (transactions tracked)
    /// instead of binlog position.
    pub fn new(manager: CheckpointManager, key: impl Into<String>, by_gtid: bool) -> Self {
        Self {
            manager,
            key: key.into(),
            by_gtid,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Like [`CheckpointTracker::new`], continuing from the checkpoint already
    /// persisted under `key`.
    pub async fn open(
        manager: CheckpointManager,
        key: impl Into<String>,
        by_gtid: bool,
    ) -> Result<Self> {
        let tracker = Self::new(manager, key, by_gtid);
        let persisted: Option<BinlogCheckpoint> =
            tracker.manager.read_checkpoint(&tracker.key).await?;
        if let Some(persisted) = persisted {
            info!("Resuming checkpoint tracking from {}", persisted.position.segment);
            tracker.lock()?.last_persisted = Some(persisted);
        }
        Ok(tracker)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn shard_key(&self, shard_id: &str) -> String {
        format!("{}.{shard_id}", self.key)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, TrackerState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("checkpoint tracker state poisoned"))
    }

    pub fn register(&self, shard_id: &str) {
        if let Ok(mut state) = self.lock() {
            state.shards.entry(shard_id.to_string()).or_default();
        }
    }

    /// Record durable progress of a shard. Reports that do not move the shard
    /// forward are ignored.
    pub fn report(&self, shard_id: &str, checkpoint: BinlogCheckpoint) {
        let by_gtid = self.by_gtid;
        let Ok(mut state) = self.lock() else {
            return;
        };
        let progress = state.shards.entry(shard_id.to_string()).or_default();
        if let Some(latest) = &progress.latest {
            if checkpoint.compare(latest, by_gtid) != Ordering::Greater {
                return;
            }
        }
        progress.latest = Some(checkpoint);
        progress.advanced = true;
    }

    /// Minimum checkpoint over all registered shards, `None` until every
    /// shard has reported.
    pub fn compute_safe(&self) -> Option<BinlogCheckpoint> {
        let state = self.lock().ok()?;
        safe_minimum(&state, self.by_gtid)
    }

    pub fn last_persisted(&self) -> Option<BinlogCheckpoint> {
        self.lock().ok().and_then(|s| s.last_persisted.clone())
    }

    /// One persistence round. Returns the newly persisted global checkpoint.
    pub async fn persist_once(&self) -> Result<Option<BinlogCheckpoint>> {
        let (advanced, safe) = {
            let state = self.lock()?;
            let advanced: Vec<(String, BinlogCheckpoint)> = state
                .shards
                .iter()
                .filter(|(_, p)| p.advanced)
                .filter_map(|(id, p)| p.latest.clone().map(|c| (id.clone(), c)))
                .collect();
            if advanced.is_empty() {
                return Ok(None);
            }
            let safe = safe_minimum(&state, self.by_gtid).filter(|safe| {
                state
                    .last_persisted
                    .as_ref()
                    .is_none_or(|last| safe.compare(last, self.by_gtid) == Ordering::Greater)
            });
            (advanced, safe)
        };

        for (shard_id, checkpoint) in &advanced {
            self.manager
                .emit_checkpoint(&self.shard_key(shard_id), checkpoint)
                .await?;
        }
        if let Some(safe) = &safe {
            self.manager.emit_checkpoint(&self.key, safe).await?;
        }

        let mut state = self.lock()?;
        for (shard_id, written) in advanced {
            if let Some(progress) = state.shards.get_mut(&shard_id) {
                if progress.latest.as_ref() == Some(&written) {
                    progress.advanced = false;
                }
            }
        }
        if let Some(safe) = &safe {
            state.last_persisted = Some(safe.clone());
        } else {
            debug!("no new safe checkpoint to persist");
        }
        Ok(safe)
    }

    /// Persist every `period` until cancelled, then once more.
    pub async fn run(&self, period: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.persist_once().await {
                        error!("Failed to persist checkpoint '{}': {e:#}", self.key);
                    }
                }
            }
        }

        if let Err(e) = self.persist_once().await {
            error!("Failed to persist final checkpoint '{}': {e:#}", self.key);
        }
        debug!("checkpoint tracker '{}' stopped", self.key);
    }

    /// Where `shard_id` should resume: its own checkpoint, else the global
    /// one.
    pub async fn resume_checkpoint(&self, shard_id: &str) -> Result<Option<BinlogCheckpoint>> {
        if let Some(own) = self
            .manager
            .read_checkpoint::<BinlogCheckpoint>(&self.shard_key(shard_id))
            .await?
        {
            return Ok(Some(own));
        }
        self.manager.read_checkpoint(&self.key).await
    }
}

fn safe_minimum(state: &TrackerState, by_gtid: bool) -> Option<BinlogCheckpoint> {
    let mut minimum: Option<&BinlogCheckpoint> = None;
    for progress in state.shards.values() {
        let latest = progress.latest.as_ref()?;
        minimum = match minimum {
            Some(current) if current.compare(latest, by_gtid) != Ordering::Greater => Some(current),
            _ => Some(latest),
        };
    }
    minimum.cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointPosition;
    use checkpoint::{Checkpoint, CheckpointID, FilesystemStore, MemoryStore};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn at(offset: u64) -> BinlogCheckpoint {
        BinlogCheckpoint::new(CheckpointPosition::new("mysql-bin.000001", offset))
    }

    fn memory_tracker() -> (Arc<MemoryStore>, CheckpointTracker) {
        let store = Arc::new(MemoryStore::new());
        let tracker = CheckpointTracker::new(CheckpointManager::new(store.clone()), "orders", false);
        (store, tracker)
    }

    #[test]
    fn test_safe_checkpoint_waits_for_every_shard() {
        let (_, tracker) = memory_tracker();
        tracker.register("a");
        tracker.register("b");
        tracker.report("a", at(500));
        assert_eq!(tracker.compute_safe(), None);
        tracker.report("b", at(300));
        assert_eq!(tracker.compute_safe(), Some(at(300)));
        tracker.report("b", at(900));
        assert_eq!(tracker.compute_safe(), Some(at(500)));
    }

    #[test]
    fn test_regressions_are_ignored() {
        let (_, tracker) = memory_tracker();
        tracker.report("a", at(500));
        tracker.report("a", at(400));
        assert_eq!(tracker.compute_safe(), Some(at(500)));
    }

    #[tokio::test]
    async fn test_persist_only_when_advanced() {
        let (store, tracker) = memory_tracker();
        tracker.register("a");
        assert_eq!(tracker.persist_once().await.unwrap(), None);

        tracker.report("a", at(100));
        assert_eq!(tracker.persist_once().await.unwrap(), Some(at(100)));
        // nothing advanced since
        assert_eq!(tracker.persist_once().await.unwrap(), None);

        let global = store.history(&CheckpointID::new(BinlogCheckpoint::DATABASE_TYPE, "orders"));
        assert_eq!(global.len(), 1);
        let own = store.history(&CheckpointID::new(BinlogCheckpoint::DATABASE_TYPE, "orders.a"));
        assert_eq!(own.len(), 1);
    }

    #[tokio::test]
    async fn test_global_checkpoint_is_monotonic() {
        let (_, tracker) = memory_tracker();
        tracker.report("a", at(100));
        tracker.persist_once().await.unwrap();

        // a late shard lowers the minimum; the persisted value must not go back
        tracker.register("b");
        tracker.report("b", at(50));
        assert_eq!(tracker.persist_once().await.unwrap(), None);
        assert_eq!(tracker.last_persisted(), Some(at(100)));

        tracker.report("b", at(150));
        tracker.report("a", at(200));
        assert_eq!(tracker.persist_once().await.unwrap(), Some(at(150)));
    }

    #[tokio::test]
    async fn test_resume_prefers_shard_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let manager = CheckpointManager::new(Arc::new(FilesystemStore::new(tmp.path())));
        let tracker = CheckpointTracker::new(manager.clone(), "orders", false);
        tracker.report("a", at(100));
        tracker.report("b", at(70));
        tracker.persist_once().await.unwrap();

        assert_eq!(tracker.resume_checkpoint("a").await.unwrap(), Some(at(100)));
        assert_eq!(tracker.resume_checkpoint("c").await.unwrap(), Some(at(70)));

        let reopened = CheckpointTracker::open(manager, "orders", false).await.unwrap();
        assert_eq!(reopened.last_persisted(), Some(at(70)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_persists_periodically_and_on_cancel() {
        let (store, tracker) = memory_tracker();
        let tracker = Arc::new(tracker);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let tracker = tracker.clone();
            let cancel = cancel.clone();
            async move { tracker.run(Duration::from_secs(5), cancel).await }
        });

        tracker.report("a", at(100));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(tracker.last_persisted(), Some(at(100)));

        tracker.report("a", at(200));
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(tracker.last_persisted(), Some(at(200)));
        let global = store.history(&CheckpointID::new(BinlogCheckpoint::DATABASE_TYPE, "orders"));
        assert_eq!(global.len(), 2);
    }
}
