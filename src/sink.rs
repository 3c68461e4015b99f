//! JSONL applier: one JSON document per applied event.
//!
//! Output is buffered. A commit flushes the file, and only then does its
//! checkpoint count as durable.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use binlog_replicator_pipeline::{
    AppliedEvent, Applier, ApplyError, BinlogCheckpoint, RowChangeEvent, TransactionContext,
};
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;
use url::form_urlencoded;

/// Builds the validation URIs attached to applied rows.
#[derive(Debug, Clone, Default)]
pub struct ValidationUris {
    /// Replaces the lowercased schema name as source domain.
    pub shard_name: Option<String>,
    /// Without a target domain no target URI is produced.
    pub target_domain: Option<String>,
}

impl ValidationUris {
    /// `mysql://{domain}/{table}?{pk}={value}&...`, with after-image values
    /// for updates.
    pub fn source_uri(&self, row: &RowChangeEvent) -> String {
        let domain = match self.shard_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => row.table.namespace.to_lowercase(),
        };
        format!("mysql://{domain}/{}?{}", row.table.table, key_query(row))
    }

    pub fn target_uri(&self, row: &RowChangeEvent) -> Option<String> {
        let domain = self.target_domain.as_deref()?;
        Some(format!("jsonl://{domain}/{}?{}", row.table.table, key_query(row)))
    }
}

fn key_query(row: &RowChangeEvent) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(row.primary_key_values())
        .finish()
}

#[derive(Serialize)]
struct OutputRecord<'a> {
    shard: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    rewinding: bool,
    #[serde(flatten)]
    event: &'a AppliedEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_uri: Option<String>,
}

pub struct JsonlApplier {
    path: PathBuf,
    writer: tokio::sync::Mutex<BufWriter<File>>,
    durable: Mutex<Option<BinlogCheckpoint>>,
    uris: ValidationUris,
}

impl JsonlApplier {
    /// Append to `path`, creating it when missing.
    pub async fn open(path: impl AsRef<Path>, uris: ValidationUris) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open output file {}", path.display()))?;
        Ok(Self {
            path,
            writer: tokio::sync::Mutex::new(BufWriter::new(file)),
            durable: Mutex::new(None),
            uris,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, e: std::io::Error) -> ApplyError {
        ApplyError::Io(anyhow!(e).context(format!("Failed to write {}", self.path.display())))
    }
}

#[async_trait]
impl Applier for JsonlApplier {
    async fn apply(
        &self,
        event: &AppliedEvent,
        context: &TransactionContext,
    ) -> Result<(), ApplyError> {
        let row = event.as_row();
        let record = OutputRecord {
            shard: &context.shard_id,
            rewinding: context.rewinding,
            event,
            source_uri: row.map(|r| self.uris.source_uri(r)),
            target_uri: row.and_then(|r| self.uris.target_uri(r)),
        };
        let mut line = serde_json::to_vec(&record)
            .map_err(|e| ApplyError::Fatal(anyhow!(e).context("Failed to serialize event")))?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await.map_err(|e| self.io_error(e))?;

        if let AppliedEvent::Commit { checkpoint, .. } = event {
            writer.flush().await.map_err(|e| self.io_error(e))?;
            if let Ok(mut durable) = self.durable.lock() {
                *durable = Some(checkpoint.clone());
            }
            debug!("commit at {} flushed to {}", checkpoint.position.segment, self.path.display());
        }
        Ok(())
    }

    async fn force_flush(&self) -> Result<(), ApplyError> {
        let mut writer = self.writer.lock().await;
        writer.flush().await.map_err(|e| self.io_error(e))
    }

    fn last_durable_checkpoint(&self) -> Option<BinlogCheckpoint> {
        self.durable.lock().ok().and_then(|d| d.clone())
    }
}
