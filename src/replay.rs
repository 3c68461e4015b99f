//! Replays recorded binlog events from JSONL files through a pipeline shard.
//!
//! Each input line is one serialized [`SourceEvent`]. Several files may be
//! given; they are treated as alternative endpoints of the same stream and
//! tried in order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use binlog_replicator_pipeline::{
    connect_with_failover, spawn_replay_reader, BinlogSource, CheckpointTracker, EventDispatcher,
    MySqlSchemaSource, PipelineShard, Position, SchemaRegistry, SchemaSource, ShardError,
    ShardFactory, ShardOutcome, ShardReport, SourceConnector, SourceEvent, StaticSchemaSource,
    Supervisor,
};
use checkpoint::{CheckpointManager, FilesystemStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::PipelineConfig;
use crate::sink::{JsonlApplier, ValidationUris};

const QUEUE_CAPACITY: usize = 1024;

/// Read every event of a JSONL file. Blank lines are ignored.
pub fn load_events(path: &Path) -> anyhow::Result<Vec<SourceEvent>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read events file {}", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("Invalid event at {}:{}", path.display(), i + 1))
        })
        .collect()
}

/// Opens an events file as a bounded, seekable source.
pub struct FileConnector {
    pub queue_capacity: usize,
}

impl Default for FileConnector {
    fn default() -> Self {
        Self {
            queue_capacity: QUEUE_CAPACITY,
        }
    }
}

#[async_trait]
impl SourceConnector for FileConnector {
    async fn connect(
        &self,
        endpoint: &str,
        resume: Option<&Position>,
    ) -> anyhow::Result<Box<dyn BinlogSource>> {
        let events = load_events(Path::new(endpoint))?;
        let (mut source, _reader) = spawn_replay_reader(events, self.queue_capacity);
        if let Some(position) = resume {
            info!("Resuming {endpoint} at {position}");
            source.seek(position).await?;
        }
        Ok(Box::new(source))
    }
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub events: Vec<PathBuf>,
    pub output: PathBuf,
    /// Continue from the persisted checkpoint instead of the start.
    pub resume: bool,
    pub shard_id: String,
}

struct ReplayFactory {
    endpoints: Vec<String>,
    config: PipelineConfig,
    resume: bool,
    tracker: Arc<CheckpointTracker>,
    applier: Arc<JsonlApplier>,
    schema_source: Arc<dyn SchemaSource>,
}

#[async_trait]
impl ShardFactory for ReplayFactory {
    async fn build(&self, shard_id: &str, attempt: u32) -> Result<PipelineShard, ShardError> {
        let resume = if self.resume || attempt > 0 {
            self.tracker
                .resume_checkpoint(shard_id)
                .await
                .map_err(ShardError::Checkpoint)?
        } else {
            None
        };
        let resume_position: Option<Position> = resume.as_ref().map(|c| c.position.clone().into());

        let source = connect_with_failover(
            &FileConnector::default(),
            &self.endpoints,
            resume_position.as_ref(),
            |e| error!(shard = %shard_id, "No events source available: {e:#}"),
        )
        .await
        .map_err(ShardError::Source)?;

        let registry = SchemaRegistry::new(
            self.schema_source.clone(),
            self.config.replicated_namespace.clone(),
        );
        let dispatcher = EventDispatcher::new(registry, self.config.effective_transaction_limit())
            .resume_after(resume.as_ref());

        Ok(PipelineShard::new(
            shard_id,
            source,
            dispatcher,
            self.applier.clone(),
            self.config.shard_config(),
        )
        .with_tracker(self.tracker.clone()))
    }
}

fn schema_source(config: &PipelineConfig) -> anyhow::Result<Arc<dyn SchemaSource>> {
    let Some(uri) = config.schema_source_uri.as_deref() else {
        return Ok(Arc::new(StaticSchemaSource::new()));
    };
    let mut source = MySqlSchemaSource::from_url(uri)?;
    if let Some(database) = &config.shadow_database {
        source = source.with_shadow_database(database.clone());
    }
    Ok(Arc::new(source))
}

/// Run one shard over the events files until they are exhausted.
pub async fn run_replay(
    options: ReplayOptions,
    config: PipelineConfig,
    cancel: CancellationToken,
) -> anyhow::Result<ShardReport> {
    if options.events.is_empty() {
        anyhow::bail!("At least one events file is required");
    }
    info!(
        "Replaying {} into {}",
        options.events[0].display(),
        options.output.display()
    );

    let manager = CheckpointManager::new(Arc::new(FilesystemStore::new(&config.checkpoint_dir)));
    let tracker = Arc::new(
        CheckpointTracker::open(manager, &config.checkpoint_key, config.transactions_enabled)
            .await?,
    );
    let uris = ValidationUris {
        shard_name: config.shard_name.clone(),
        target_domain: config.validation_target_domain.clone(),
    };
    let applier = Arc::new(JsonlApplier::open(&options.output, uris).await?);

    let factory = Arc::new(ReplayFactory {
        endpoints: options
            .events
            .iter()
            .map(|p| p.display().to_string())
            .collect(),
        schema_source: schema_source(&config)?,
        resume: options.resume,
        tracker: tracker.clone(),
        applier,
        config: config.clone(),
    });

    let mut outcomes = Supervisor::new(factory, vec![options.shard_id.clone()])
        .with_max_restarts(config.max_restarts)
        .with_tracker(tracker.clone(), config.checkpoint_period)
        .run(cancel)
        .await;

    match outcomes.remove(&options.shard_id) {
        Some(ShardOutcome::Completed(report)) => {
            if let Some(persisted) = tracker.last_persisted() {
                info!(
                    "Checkpoint '{}' at {}:{}",
                    tracker.key(),
                    persisted.position.segment,
                    persisted.position.offset
                );
            }
            Ok(report)
        }
        Some(ShardOutcome::Failed { error, attempts }) => {
            anyhow::bail!("Shard {} failed after {attempts} attempt(s): {error}", options.shard_id)
        }
        None => anyhow::bail!("Shard {} did not report an outcome", options.shard_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binlog_replicator_pipeline::testing::EventBuilder;
    use binlog_replicator_pipeline::Polled;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_events(dir: &TempDir, events: &[SourceEvent]) -> PathBuf {
        let path = dir.path().join("events.jsonl");
        let mut file = std::fs::File::create(&path).unwrap();
        for event in events {
            writeln!(file, "{}", serde_json::to_string(event).unwrap()).unwrap();
        }
        writeln!(file).unwrap();
        path
    }

    #[test]
    fn test_load_events_reports_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "\n{\"not\": \"an event\"}\n").unwrap();
        let err = load_events(&path).unwrap_err();
        assert!(format!("{err:#}").contains("bad.jsonl:2"));
    }

    #[tokio::test]
    async fn test_connector_resumes_at_position() {
        let dir = TempDir::new().unwrap();
        let mut b = EventBuilder::new("mysql-bin.000001");
        let events = vec![b.begin("shop"), b.orders_table_map(), b.xid(1)];
        let path = write_events(&dir, &events);

        let mut source = FileConnector::default()
            .connect(&path.display().to_string(), Some(&events[2].position))
            .await
            .unwrap();
        match source.poll_event(Duration::from_millis(100)).await.unwrap() {
            Polled::Event(event) => assert_eq!(event, events[2]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            source.poll_event(Duration::from_millis(100)).await.unwrap(),
            Polled::Closed
        );
    }

    #[tokio::test]
    async fn test_connector_fails_for_missing_file() {
        let result = FileConnector::default()
            .connect("/nonexistent/events.jsonl", None)
            .await;
        assert!(result.is_err());
    }
}
