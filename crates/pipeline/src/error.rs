//! Shard fault taxonomy.

use mysql_types::{DecodeError, FullTableName};
use thiserror::Error;

use crate::position::Position;

/// Errors raised by an [`crate::Applier`].
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Transient sink failure; the supervisor may restart the shard.
    #[error("applier I/O fault: {0:#}")]
    Io(anyhow::Error),
    /// The sink cannot continue; the shard is aborted.
    #[error("applier fatal fault: {0:#}")]
    Fatal(anyhow::Error),
}

/// Errors that stop a [`crate::PipelineShard`].
#[derive(Debug, Error)]
pub enum ShardError {
    #[error("row event at {position} references table id {table_id} that was never announced")]
    UnknownSchema { table_id: u64, position: Position },

    #[error("cannot parse DDL for namespace {namespace} at {position}: {statement}")]
    UnparseableDdl {
        namespace: String,
        statement: String,
        position: Position,
    },

    #[error("protocol violation at {position}{}: {reason}", table_suffix(.table))]
    ProtocolViolation {
        reason: String,
        position: Position,
        table: Option<FullTableName>,
    },

    #[error("{what} at {position} with no open transaction")]
    NoOpenTransaction {
        what: &'static str,
        position: Position,
        table: Option<FullTableName>,
    },

    #[error("cannot decode {table}.{column} at {position}: {source}")]
    Decode {
        #[source]
        source: DecodeError,
        table: FullTableName,
        column: String,
        position: Position,
    },

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("source fault: {0:#}")]
    Source(anyhow::Error),

    #[error("schema source fault: {0:#}")]
    Schema(anyhow::Error),

    #[error("checkpoint fault: {0:#}")]
    Checkpoint(anyhow::Error),
}

fn table_suffix(table: &Option<FullTableName>) -> String {
    match table {
        Some(t) => format!(" ({t})"),
        None => String::new(),
    }
}

impl ShardError {
    /// Whether an outer supervisor may restart the shard from its last
    /// persisted checkpoint.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ShardError::Apply(ApplyError::Io(_)) | ShardError::Source(_) | ShardError::Schema(_)
        )
    }

    /// Position of the offending event, when known.
    pub fn position(&self) -> Option<&Position> {
        match self {
            ShardError::UnknownSchema { position, .. }
            | ShardError::UnparseableDdl { position, .. }
            | ShardError::ProtocolViolation { position, .. }
            | ShardError::NoOpenTransaction { position, .. }
            | ShardError::Decode { position, .. } => Some(position),
            _ => None,
        }
    }

    /// Table of the offending event, when known.
    pub fn table(&self) -> Option<&FullTableName> {
        match self {
            ShardError::ProtocolViolation { table, .. }
            | ShardError::NoOpenTransaction { table, .. } => table.as_ref(),
            ShardError::Decode { table, .. } => Some(table),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ShardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(ShardError::Apply(ApplyError::Io(anyhow::anyhow!("broken pipe"))).is_recoverable());
        assert!(ShardError::Source(anyhow::anyhow!("reset")).is_recoverable());
        assert!(!ShardError::Apply(ApplyError::Fatal(anyhow::anyhow!("bad"))).is_recoverable());
        assert!(!ShardError::UnknownSchema {
            table_id: 7,
            position: Position::new("mysql-bin.000001", 4),
        }
        .is_recoverable());
    }

    #[test]
    fn test_diagnostic_names_position_and_table() {
        let err = ShardError::ProtocolViolation {
            reason: "rewind while rewinding".to_string(),
            position: Position::new("mysql-bin.000003", 812),
            table: Some(FullTableName::new("shop", "orders")),
        };
        assert_eq!(
            err.to_string(),
            "protocol violation at mysql-bin.000003:812 (shop.orders): rewind while rewinding"
        );
        assert_eq!(err.table(), Some(&FullTableName::new("shop", "orders")));
        assert_eq!(err.position(), Some(&Position::new("mysql-bin.000003", 812)));
    }
}
