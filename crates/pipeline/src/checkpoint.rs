//! Binlog checkpoint type
//!
//! The persisted resume record of a shard: where in the binlog the last fully
//! applied transaction ended, plus the GTID and wall clock of that commit.

use std::cmp::Ordering;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::position::{compare_segments, Position};

/// Segment and offset of a checkpoint, the format-stable part of [`Position`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointPosition {
    pub segment: String,
    pub offset: u64,
}

impl CheckpointPosition {
    pub fn new(segment: impl Into<String>, offset: u64) -> Self {
        Self {
            segment: segment.into(),
            offset,
        }
    }

    pub fn cmp_position(&self, other: &Self) -> Ordering {
        compare_segments(&self.segment, &other.segment).then(self.offset.cmp(&other.offset))
    }
}

impl From<&Position> for CheckpointPosition {
    fn from(position: &Position) -> Self {
        Self::new(position.segment.clone(), position.offset)
    }
}

impl From<CheckpointPosition> for Position {
    fn from(position: CheckpointPosition) -> Self {
        Position::new(position.segment, position.offset)
    }
}

/// Checkpoint of a binlog replication stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinlogCheckpoint {
    /// Commit wall clock in milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub server_id: u32,
    #[serde(rename = "globalTransactionId")]
    pub gtid: Option<String>,
    pub position: CheckpointPosition,
}

impl BinlogCheckpoint {
    pub fn new(position: CheckpointPosition) -> Self {
        Self {
            timestamp: 0,
            server_id: 0,
            gtid: None,
            position,
        }
    }

    pub fn with_gtid(mut self, gtid: impl Into<String>) -> Self {
        self.gtid = Some(gtid.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    /// Transaction sequence number of the GTID (`uuid:N`).
    pub fn gtid_sequence(&self) -> Option<u64> {
        self.gtid.as_deref().and_then(gtid_sequence)
    }

    /// Total order used for persistence.
    ///
    /// With `by_gtid` set and both checkpoints carrying a GTID from the same
    /// source server, the transaction sequence decides. Otherwise the binlog
    /// position does.
    pub fn compare(&self, other: &Self, by_gtid: bool) -> Ordering {
        if by_gtid {
            if let (Some(a), Some(b)) = (self.gtid.as_deref(), other.gtid.as_deref()) {
                if gtid_source(a) == gtid_source(b) {
                    if let (Some(x), Some(y)) = (gtid_sequence(a), gtid_sequence(b)) {
                        return x.cmp(&y);
                    }
                }
            }
        }
        self.position.cmp_position(&other.position)
    }
}

fn gtid_source(gtid: &str) -> &str {
    gtid.rsplit_once(':').map(|(uuid, _)| uuid).unwrap_or(gtid)
}

fn gtid_sequence(gtid: &str) -> Option<u64> {
    gtid.rsplit_once(':')?.1.trim().parse().ok()
}

impl checkpoint::Checkpoint for BinlogCheckpoint {
    const DATABASE_TYPE: &'static str = "mysql-binlog";

    fn to_cli_string(&self) -> String {
        format!("{}:{}", self.position.segment, self.position.offset)
    }

    fn from_cli_string(s: &str) -> Result<Self> {
        let (segment, offset) = s.rsplit_once(':').ok_or_else(|| {
            anyhow::anyhow!("Invalid binlog checkpoint: expected 'segment:offset', got '{s}'")
        })?;
        if segment.is_empty() {
            anyhow::bail!("Invalid binlog checkpoint: empty segment in '{s}'");
        }
        let offset = offset.parse::<u64>().map_err(|e| {
            anyhow::anyhow!("Invalid binlog checkpoint: bad offset in '{s}': {e}")
        })?;

        Ok(Self::new(CheckpointPosition::new(segment, offset)))
    }
}
