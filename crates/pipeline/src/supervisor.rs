//! Runs several shards side by side.
//!
//! A fatal fault stops only the faulting shard and is logged for an
//! operator. A recoverable fault restarts the shard, which resumes from its
//! last persisted checkpoint, up to a restart limit.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ShardError;
use crate::shard::{PipelineShard, ShardReport};
use crate::tracker::CheckpointTracker;

/// Builds shards on demand.
#[async_trait]
pub trait ShardFactory: Send + Sync {
    /// Build shard `shard_id` for its `attempt`-th run, counting from 0.
    /// Restarted shards must resume from their persisted checkpoint.
    async fn build(&self, shard_id: &str, attempt: u32) -> Result<PipelineShard, ShardError>;
}

#[derive(Debug)]
pub enum ShardOutcome {
    Completed(ShardReport),
    Failed { error: String, attempts: u32 },
}

impl ShardOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ShardOutcome::Completed(_))
    }
}

pub struct Supervisor {
    factory: Arc<dyn ShardFactory>,
    shard_ids: Vec<String>,
    max_restarts: u32,
    restart_delay: Duration,
    tracker: Option<(Arc<CheckpointTracker>, Duration)>,
}

impl Supervisor {
    pub fn new(factory: Arc<dyn ShardFactory>, shard_ids: Vec<String>) -> Self {
        Self {
            factory,
            shard_ids,
            max_restarts: 3,
            restart_delay: Duration::from_secs(1),
            tracker: None,
        }
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Persist the safe checkpoint of `tracker` every `period` while shards
    /// run, and once more after they stop.
    pub fn with_tracker(mut self, tracker: Arc<CheckpointTracker>, period: Duration) -> Self {
        self.tracker = Some((tracker, period));
        self
    }

    pub async fn run(self, cancel: CancellationToken) -> BTreeMap<String, ShardOutcome> {
        let tracker_cancel = CancellationToken::new();
        let tracker_task = self.tracker.clone().map(|(tracker, period)| {
            let cancel = tracker_cancel.clone();
            tokio::spawn(async move { tracker.run(period, cancel).await })
        });

        let mut shards = JoinSet::new();
        for shard_id in &self.shard_ids {
            shards.spawn(supervise(
                self.factory.clone(),
                shard_id.clone(),
                self.max_restarts,
                self.restart_delay,
                cancel.clone(),
            ));
        }

        let mut outcomes = BTreeMap::new();
        while let Some(joined) = shards.join_next().await {
            match joined {
                Ok((shard_id, outcome)) => {
                    outcomes.insert(shard_id, outcome);
                }
                Err(e) => error!("Shard task panicked: {e}"),
            }
        }

        tracker_cancel.cancel();
        if let Some(task) = tracker_task {
            if let Err(e) = task.await {
                error!("Checkpoint tracker task panicked: {e}");
            }
        }

        let failed = outcomes.values().filter(|o| !o.is_completed()).count();
        info!(
            "All shards stopped: {} completed, {failed} failed",
            outcomes.len() - failed
        );
        outcomes
    }
}

async fn supervise(
    factory: Arc<dyn ShardFactory>,
    shard_id: String,
    max_restarts: u32,
    restart_delay: Duration,
    cancel: CancellationToken,
) -> (String, ShardOutcome) {
    let mut attempt = 0;
    loop {
        let result = match factory.build(&shard_id, attempt).await {
            Ok(shard) => shard.run(cancel.clone()).await,
            Err(e) => Err(e),
        };

        let err = match result {
            Ok(report) => return (shard_id, ShardOutcome::Completed(report)),
            Err(e) => e,
        };

        if err.is_recoverable() && attempt < max_restarts && !cancel.is_cancelled() {
            attempt += 1;
            warn!(
                shard = %shard_id,
                attempt,
                "Restarting shard after recoverable fault: {err}"
            );
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(restart_delay) => {}
            }
            continue;
        }

        error!(
            shard = %shard_id,
            position = ?err.position(),
            table = ?err.table().map(|t| t.to_string()),
            "Shard failed after {} attempt(s), operator intervention required: {err}",
            attempt + 1
        );
        return (
            shard_id,
            ShardOutcome::Failed {
                error: err.to_string(),
                attempts: attempt + 1,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::MemoryApplier;
    use crate::dispatcher::EventDispatcher;
    use crate::event::SourceEvent;
    use crate::registry::SchemaRegistry;
    use crate::schema::StaticSchemaSource;
    use crate::shard::ShardConfig;
    use crate::source::ReplaySource;
    use crate::testing::EventBuilder;
    use std::sync::Mutex;

    struct Factory {
        streams: BTreeMap<String, Vec<SourceEvent>>,
        appliers: Mutex<Vec<Arc<MemoryApplier>>>,
        flaky_attempts: u32,
    }

    #[async_trait]
    impl ShardFactory for Factory {
        async fn build(&self, shard_id: &str, attempt: u32) -> Result<PipelineShard, ShardError> {
            if attempt < self.flaky_attempts {
                return Err(ShardError::Source(anyhow::anyhow!("connection reset")));
            }
            let events = self.streams.get(shard_id).cloned().unwrap_or_default();
            let applier = Arc::new(MemoryApplier::new());
            self.appliers.lock().unwrap().push(applier.clone());
            let registry =
                SchemaRegistry::new(Arc::new(StaticSchemaSource::new()), Some("shop".into()));
            Ok(PipelineShard::new(
                shard_id,
                Box::new(ReplaySource::new(events)),
                EventDispatcher::new(registry, None),
                applier,
                ShardConfig::default(),
            ))
        }
    }

    fn healthy_stream() -> Vec<SourceEvent> {
        let mut b = EventBuilder::new("mysql-bin.000001");
        vec![b.begin("shop"), b.orders_table_map(), b.insert_orders(&[(1, "a")]), b.xid(1)]
    }

    fn broken_stream() -> Vec<SourceEvent> {
        let mut b = EventBuilder::new("mysql-bin.000001");
        vec![b.begin("shop"), b.insert_orders(&[(1, "a")])]
    }

    #[tokio::test]
    async fn test_fatal_fault_stops_only_that_shard() {
        let factory = Arc::new(Factory {
            streams: BTreeMap::from([
                ("good".to_string(), healthy_stream()),
                ("bad".to_string(), broken_stream()),
            ]),
            appliers: Mutex::new(Vec::new()),
            flaky_attempts: 0,
        });
        let outcomes = Supervisor::new(factory, vec!["good".into(), "bad".into()])
            .with_restart_delay(Duration::ZERO)
            .run(CancellationToken::new())
            .await;

        match &outcomes["good"] {
            ShardOutcome::Completed(report) => assert_eq!(report.rows_applied, 1),
            other => panic!("unexpected {other:?}"),
        }
        match &outcomes["bad"] {
            ShardOutcome::Failed { attempts, error } => {
                assert_eq!(*attempts, 1);
                assert!(error.contains("never announced"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recoverable_fault_restarts() {
        let factory = Arc::new(Factory {
            streams: BTreeMap::from([("flaky".to_string(), healthy_stream())]),
            appliers: Mutex::new(Vec::new()),
            flaky_attempts: 2,
        });
        let outcomes = Supervisor::new(factory.clone(), vec!["flaky".into()])
            .with_restart_delay(Duration::ZERO)
            .run(CancellationToken::new())
            .await;
        assert!(outcomes["flaky"].is_completed());
        assert_eq!(factory.appliers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restart_limit() {
        let factory = Arc::new(Factory {
            streams: BTreeMap::new(),
            appliers: Mutex::new(Vec::new()),
            flaky_attempts: 10,
        });
        let outcomes = Supervisor::new(factory, vec!["flaky".into()])
            .with_max_restarts(2)
            .with_restart_delay(Duration::ZERO)
            .run(CancellationToken::new())
            .await;
        match &outcomes["flaky"] {
            ShardOutcome::Failed { attempts, .. } => assert_eq!(*attempts, 3),
            other => panic!("unexpected {other:?}"),
        }
    }
}
