//! One replication pipeline: source, dispatcher and applier driven by a
//! single task.
//!
//! The loop polls the source, dispatches each event and carries out the
//! resulting actions in order. When the dispatcher asks for a rewind, the
//! shard reads ahead to the commit marker of the overflowed transaction,
//! seeks the source back to the transaction start and streams it again.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::applier::Applier;
use crate::checkpoint::{BinlogCheckpoint, CheckpointPosition};
use crate::dispatcher::{Action, EventDispatcher};
use crate::error::{Result, ShardError};
use crate::event::{AppliedEvent, SourceEvent, TransactionContext};
use crate::position::Position;
use crate::source::{BinlogSource, Polled};
use crate::tracker::CheckpointTracker;
use crate::transaction::TransactionState;

#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// How long one poll waits for an event.
    pub poll_timeout: Duration,
    /// Sleep after an empty poll.
    pub poll_backoff: Duration,
    /// Idle time after which the applier is flushed.
    pub force_flush_interval: Duration,
    /// When false, progress is reported after every applied event instead of
    /// after every commit.
    pub transactions_enabled: bool,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            poll_backoff: Duration::from_millis(500),
            force_flush_interval: Duration::from_secs(30),
            transactions_enabled: true,
        }
    }
}

/// Counters of a finished shard run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShardReport {
    pub events: u64,
    pub rows_applied: u64,
    pub transactions_committed: u64,
    pub transactions_dropped: u64,
    pub rewinds: u64,
    pub last_checkpoint: Option<BinlogCheckpoint>,
}

pub struct PipelineShard {
    id: String,
    source: Box<dyn BinlogSource>,
    dispatcher: EventDispatcher,
    applier: Arc<dyn Applier>,
    tracker: Option<Arc<CheckpointTracker>>,
    config: ShardConfig,
    report: ShardReport,
}

impl PipelineShard {
    pub fn new(
        id: impl Into<String>,
        source: Box<dyn BinlogSource>,
        dispatcher: EventDispatcher,
        applier: Arc<dyn Applier>,
        config: ShardConfig,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            dispatcher,
            applier,
            tracker: None,
            config,
            report: ShardReport::default(),
        }
    }

    /// Report durable progress to `tracker`.
    pub fn with_tracker(mut self, tracker: Arc<CheckpointTracker>) -> Self {
        tracker.register(&self.id);
        self.tracker = Some(tracker);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until the source closes, a fault occurs or `cancel` fires.
    ///
    /// On cancellation the open transaction is abandoned; a restarted shard
    /// replays it from the last persisted checkpoint.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<ShardReport> {
        info!(shard = %self.id, "Starting shard");
        match self.consume(&cancel).await {
            Ok(()) => {
                info!(
                    shard = %self.id,
                    "Shard stopped. Processed {} events, committed {} transactions",
                    self.report.events,
                    self.report.transactions_committed
                );
                Ok(self.report)
            }
            Err(e) => {
                error!(
                    shard = %self.id,
                    position = ?e.position(),
                    table = ?e.table().map(|t| t.to_string()),
                    "Shard stopped: {e}"
                );
                Err(e)
            }
        }
    }

    async fn consume(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut idle_since: Option<Instant> = None;

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(shard = %self.id, "Shard cancelled");
                    return Ok(());
                }
                polled = self.source.poll_event(self.config.poll_timeout) => {
                    polled.map_err(ShardError::Source)?
                }
            };

            match polled {
                Polled::Event(event) => {
                    idle_since = None;
                    if !self.handle(event, cancel).await? {
                        return Ok(());
                    }
                }
                Polled::Idle => {
                    let since = *idle_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= self.config.force_flush_interval {
                        debug!(shard = %self.id, "source idle, forcing a flush");
                        self.applier.force_flush().await?;
                        self.report_progress();
                        idle_since = Some(Instant::now());
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!(shard = %self.id, "Shard cancelled");
                            return Ok(());
                        }
                        _ = tokio::time::sleep(self.config.poll_backoff) => {}
                    }
                }
                Polled::Closed => {
                    info!(shard = %self.id, "Source closed");
                    self.applier.force_flush().await?;
                    self.report_progress();
                    return Ok(());
                }
            }
        }
    }

    /// Dispatch one event and carry out its actions. Returns false when
    /// cancelled mid-rewind.
    async fn handle(&mut self, event: SourceEvent, cancel: &CancellationToken) -> Result<bool> {
        self.report.events += 1;
        if self.report.events % 1000 == 0 {
            info!(shard = %self.id, "Processed {} events", self.report.events);
        }

        let rewinding = self.dispatcher.state() == TransactionState::Rewinding;
        let actions = self.dispatcher.dispatch(&event).await?;
        for action in actions {
            match action {
                Action::Apply(applied) => {
                    self.apply(&applied, rewinding).await?;
                    if !self.config.transactions_enabled {
                        self.applier.force_flush().await?;
                        self.record_progress(applied_checkpoint(&event));
                    }
                }
                Action::Commit(applied) => {
                    for event in &applied {
                        self.apply(event, rewinding).await?;
                    }
                    self.report.transactions_committed += 1;
                    self.report_progress();
                }
                Action::Dropped { transaction_id } => {
                    debug!(shard = %self.id, "transaction {transaction_id} dropped");
                    self.report.transactions_dropped += 1;
                }
                Action::Rewind { replay_from } => {
                    if !self.rewind(replay_from, cancel).await? {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    async fn apply(&mut self, event: &AppliedEvent, rewinding: bool) -> Result<()> {
        let context = TransactionContext {
            shard_id: self.id.clone(),
            transaction_id: event.transaction_id(),
            rewinding,
        };
        self.applier.apply(event, &context).await?;
        if matches!(event, AppliedEvent::Row(_)) {
            self.report.rows_applied += 1;
        }
        Ok(())
    }

    /// Read ahead to the commit marker, then restart the source at
    /// `replay_from`. Returns false when cancelled.
    async fn rewind(&mut self, replay_from: Position, cancel: &CancellationToken) -> Result<bool> {
        self.report.rewinds += 1;

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(false),
                polled = self.source.poll_event(self.config.poll_timeout) => {
                    polled.map_err(ShardError::Source)?
                }
            };
            match polled {
                Polled::Event(event) if EventDispatcher::is_commit_marker(&event) => {
                    debug!(
                        shard = %self.id,
                        position = %event.position,
                        "found commit of the overflowed transaction"
                    );
                    self.dispatcher.set_commit_target(&event);
                    break;
                }
                Polled::Event(event) if EventDispatcher::is_rollback_marker(&event) => {
                    // Nothing of a rolled back transaction reaches the
                    // applier; the source already stands past the ROLLBACK.
                    debug!(
                        shard = %self.id,
                        position = %event.position,
                        "overflowed transaction rolled back, skipping replay"
                    );
                    for action in self.dispatcher.dispatch(&event).await? {
                        if let Action::Dropped { transaction_id } = action {
                            debug!(shard = %self.id, "transaction {transaction_id} dropped");
                            self.report.transactions_dropped += 1;
                        }
                    }
                    return Ok(true);
                }
                Polled::Event(_) => {}
                Polled::Idle => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(false),
                        _ = tokio::time::sleep(self.config.poll_backoff) => {}
                    }
                }
                Polled::Closed => {
                    return Err(ShardError::Source(anyhow::anyhow!(
                        "source closed before the overflowed transaction from {replay_from} committed"
                    )));
                }
            }
        }

        self.source
            .seek(&replay_from)
            .await
            .map_err(ShardError::Source)?;
        if let Some(begin) = self.dispatcher.begin_replay() {
            self.apply(&begin, true).await?;
        }
        Ok(true)
    }

    fn report_progress(&mut self) {
        if let Some(checkpoint) = self.applier.last_durable_checkpoint() {
            self.record_progress(checkpoint);
        }
    }

    /// Checkpoints that do not move the shard forward are ignored.
    fn record_progress(&mut self, checkpoint: BinlogCheckpoint) {
        if let Some(last) = &self.report.last_checkpoint {
            if checkpoint.compare(last, self.config.transactions_enabled) != Ordering::Greater {
                return;
            }
        }
        if let Some(tracker) = &self.tracker {
            tracker.report(&self.id, checkpoint.clone());
        }
        self.report.last_checkpoint = Some(checkpoint);
    }
}

/// Checkpoint at an event whose output was applied outside a commit.
fn applied_checkpoint(event: &SourceEvent) -> BinlogCheckpoint {
    BinlogCheckpoint {
        timestamp: event.timestamp * 1000,
        server_id: event.server_id,
        gtid: None,
        position: CheckpointPosition::from(&event.position),
    }
}
