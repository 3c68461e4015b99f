//! Command-line interface for binlog-replicator
//!
//! # Usage Examples
//!
//! ## Replay
//! ```bash
//! # Replay a recorded binlog stream of the `shop` schema
//! binlog-replicator replay \
//!   --events events.jsonl \
//!   --output applied.jsonl \
//!   --namespace shop \
//!   --transaction-limit 500
//!
//! # Fall back to a second copy of the stream, resume from the last checkpoint
//! binlog-replicator replay \
//!   --events /mnt/a/events.jsonl --events /mnt/b/events.jsonl \
//!   --output applied.jsonl \
//!   --config pipeline.toml \
//!   --resume
//! ```
//!
//! ## Checkpoints
//! ```bash
//! binlog-replicator show-checkpoint --checkpoint-dir .binlog-replicator-checkpoints
//! binlog-replicator show-checkpoint --checkpoint-dir .binlog-replicator-checkpoints --key orders
//! ```
//!
//! Checkpoint CLI format: `mysql-bin.000003:812` (binlog segment and offset)

use std::path::PathBuf;

use anyhow::Context;
use binlog_replicator::checkpoint::{describe, list_checkpoints, read_binlog_checkpoint};
use binlog_replicator::{run_replay, PipelineConfig, ReplayOptions};
use checkpoint::Checkpoint;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "binlog-replicator")]
#[command(about = "Replicate MySQL binlog streams as ordered, decoded row changes")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay recorded binlog events through the pipeline
    Replay {
        /// JSONL file of source events; repeat to give fallback copies
        #[arg(long = "events", value_name = "PATH", required = true)]
        events: Vec<PathBuf>,

        /// JSONL file the applied events are appended to
        #[arg(long, value_name = "PATH")]
        output: PathBuf,

        /// Pipeline configuration file (TOML)
        #[arg(long, value_name = "PATH", env = "BINLOG_REPLICATOR_CONFIG")]
        config: Option<PathBuf>,

        /// Replicated schema; overrides the configuration
        #[arg(long)]
        namespace: Option<String>,

        /// Rows buffered per transaction before it is replayed, 0 for no
        /// limit; overrides the configuration
        #[arg(long)]
        transaction_limit: Option<usize>,

        /// Checkpoint directory; overrides the configuration
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Continue from the persisted checkpoint
        #[arg(long)]
        resume: bool,

        /// Shard identifier used for checkpoints and validation output
        #[arg(long, default_value = "shard-0")]
        shard_id: String,
    },

    /// Print persisted checkpoints
    ShowCheckpoint {
        /// Checkpoint directory
        #[arg(long, default_value = ".binlog-replicator-checkpoints")]
        checkpoint_dir: PathBuf,

        /// Only print the checkpoint stored under this key
        #[arg(long)]
        key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            events,
            output,
            config,
            namespace,
            transaction_limit,
            checkpoint_dir,
            resume,
            shard_id,
        } => {
            let mut pipeline_config = match &config {
                Some(path) => PipelineConfig::load(path)?,
                None => PipelineConfig::default(),
            };
            if namespace.is_some() {
                pipeline_config.replicated_namespace = namespace;
            }
            if let Some(limit) = transaction_limit {
                pipeline_config.transaction_limit = Some(limit);
            }
            if let Some(dir) = checkpoint_dir {
                pipeline_config.checkpoint_dir = dir;
            }

            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupted, stopping after the current event");
                        cancel.cancel();
                    }
                }
            });

            let options = ReplayOptions {
                events,
                output,
                resume,
                shard_id,
            };
            let report = run_replay(options, pipeline_config, cancel).await?;
            info!(
                "Replay completed: {} events, {} rows, {} transactions committed, {} dropped, {} rewinds",
                report.events,
                report.rows_applied,
                report.transactions_committed,
                report.transactions_dropped,
                report.rewinds
            );
            if let Some(checkpoint) = report.last_checkpoint {
                println!("{}", checkpoint.to_cli_string());
            }
        }
        Commands::ShowCheckpoint {
            checkpoint_dir,
            key,
        } => match key {
            Some(key) => {
                let checkpoint = read_binlog_checkpoint(&checkpoint_dir, &key)
                    .await
                    .with_context(|| format!("Failed to read checkpoint '{key}'"))?;
                println!("{}", serde_json::to_string_pretty(&checkpoint)?);
            }
            None => {
                let files = list_checkpoints(&checkpoint_dir)?;
                if files.is_empty() {
                    println!("No checkpoints in {}", checkpoint_dir.display());
                }
                for file in &files {
                    println!("{}", describe(file));
                }
            }
        },
    }

    Ok(())
}
