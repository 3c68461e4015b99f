//! binlog-replicator
//!
//! Replicates MySQL row-based binlog streams as ordered, decoded row changes.
//!
//! # Crates
//!
//! - `mysql_types` - column type model and binlog cell decoding
//! - `checkpoint` - persisted checkpoint plumbing
//! - `binlog_replicator_pipeline` - schema tracking, transaction buffering,
//!   shards and checkpoint tracking
//!
//! This crate adds the TOML configuration, the JSONL replay source and the
//! JSONL applier used by the `binlog-replicator` command.
//!
//! # CLI Usage
//!
//! ```bash
//! # Replay recorded events into a JSONL file
//! binlog-replicator replay --events events.jsonl --output applied.jsonl --namespace shop
//!
//! # Continue where the previous replay stopped
//! binlog-replicator replay --events events.jsonl --output applied.jsonl --resume
//!
//! # Inspect persisted checkpoints
//! binlog-replicator show-checkpoint --checkpoint-dir .binlog-replicator-checkpoints
//! ```

pub mod checkpoint;
pub mod config;
pub mod replay;
pub mod sink;

pub use config::PipelineConfig;
pub use replay::{run_replay, ReplayOptions};
pub use sink::{JsonlApplier, ValidationUris};
