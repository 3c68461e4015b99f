//! Pipeline configuration, loaded from TOML.
//!
//! ```toml
//! replicated_namespace = "shop"
//! transaction_limit = 1000
//! poll_timeout = "100ms"
//! force_flush_interval = "30s"
//! checkpoint_dir = ".binlog-replicator-checkpoints"
//! ```

pub mod duration;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use binlog_replicator_pipeline::ShardConfig;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Only this schema is replicated. `None` replicates every schema.
    pub replicated_namespace: Option<String>,
    /// Rows a transaction may buffer before it is replayed from the source.
    /// 0 buffers without limit.
    pub transaction_limit: Option<usize>,
    /// Order checkpoints by GTID sequence rather than binlog position.
    pub transactions_enabled: bool,
    #[serde(deserialize_with = "duration::deserialize")]
    pub poll_timeout: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub poll_backoff: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub force_flush_interval: Duration,
    #[serde(deserialize_with = "duration::deserialize")]
    pub checkpoint_period: Duration,
    pub checkpoint_dir: PathBuf,
    pub checkpoint_key: String,
    pub max_restarts: u32,
    /// Source domain of validation URIs, instead of the lowercased schema.
    pub shard_name: Option<String>,
    /// Target domain of validation URIs. Without it no target URI is
    /// produced.
    pub validation_target_domain: Option<String>,
    /// MySQL URL queried for tables whose binlog metadata is incomplete.
    pub schema_source_uri: Option<String>,
    /// Database receiving shadow copies of replicated table definitions.
    pub shadow_database: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            replicated_namespace: None,
            transaction_limit: Some(1000),
            transactions_enabled: true,
            poll_timeout: Duration::from_millis(100),
            poll_backoff: Duration::from_millis(500),
            force_flush_interval: Duration::from_secs(30),
            checkpoint_period: Duration::from_secs(5),
            checkpoint_dir: PathBuf::from(".binlog-replicator-checkpoints"),
            checkpoint_key: "binlog-replicator".to_string(),
            max_restarts: 3,
            shard_name: None,
            validation_target_domain: None,
            schema_source_uri: None,
            shadow_database: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("Failed to parse pipeline configuration")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn effective_transaction_limit(&self) -> Option<usize> {
        self.transaction_limit.filter(|limit| *limit > 0)
    }

    pub fn shard_config(&self) -> ShardConfig {
        ShardConfig {
            poll_timeout: self.poll_timeout,
            poll_backoff: self.poll_backoff,
            force_flush_interval: self.force_flush_interval,
            transactions_enabled: self.transactions_enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.transaction_limit, Some(1000));
        assert_eq!(config.shard_config().poll_backoff, Duration::from_millis(500));
    }

    #[test]
    fn test_overrides() {
        let config = PipelineConfig::from_toml_str(
            r#"
            replicated_namespace = "shop"
            transaction_limit = 50
            transactions_enabled = false
            poll_timeout = "20ms"
            force_flush_interval = "2m"
            checkpoint_dir = "/var/lib/replicator"
            shard_name = "shop-eu-1"
            "#,
        )
        .unwrap();
        assert_eq!(config.replicated_namespace.as_deref(), Some("shop"));
        assert_eq!(config.transaction_limit, Some(50));
        assert!(!config.transactions_enabled);
        assert_eq!(config.poll_timeout, Duration::from_millis(20));
        assert_eq!(config.force_flush_interval, Duration::from_secs(120));
        assert_eq!(config.checkpoint_dir, PathBuf::from("/var/lib/replicator"));
        assert_eq!(config.shard_name.as_deref(), Some("shop-eu-1"));
        assert_eq!(config.max_restarts, 3);

        let unlimited = PipelineConfig::from_toml_str("transaction_limit = 0").unwrap();
        assert_eq!(unlimited.effective_transaction_limit(), None);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(PipelineConfig::from_toml_str(r#"poll_timeout = "soon""#).is_err());
        assert!(PipelineConfig::from_toml_str("unknown_field = 1").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "max_restarts = 7\n").unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap().max_restarts, 7);
        assert!(PipelineConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
