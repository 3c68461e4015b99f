//! Transaction buffering and the rewind state machine.
//!
//! ```text
//! NoTransaction --begin--> InTransaction --commit--> NoTransaction
//!                               |
//!                          overflow (rewind)
//!                               v
//!                           Rewinding --commit at/after target--> NoTransaction
//! ```
//!
//! Rows of an open transaction are buffered until its commit marker. Once the
//! buffer would exceed the configured limit the rows are discarded, the source
//! is repositioned to the transaction start and the transaction is replayed
//! row by row straight to the applier.

use uuid::Uuid;

use crate::error::{Result, ShardError};
use crate::event::RowChangeEvent;
use crate::position::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    NoTransaction,
    InTransaction,
    Rewinding,
}

/// Result of buffering one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum AppendOutcome {
    Appended,
    /// The row pushed the transaction over the limit and was not buffered.
    Overflowed,
}

/// Explicit `BEGIN` marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginMarker {
    pub namespace: String,
    pub position: Position,
}

/// Commit marker an overflowed transaction is replayed up to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitTarget {
    pub position: Position,
    /// Commit timestamp, seconds.
    pub timestamp: i64,
}

/// One in-flight transaction.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: Uuid,
    /// `None` for implicit transactions.
    pub begin: Option<BeginMarker>,
    /// Namespace reported on the begin artifact.
    pub namespace: String,
    pub rows: Vec<RowChangeEvent>,
    pub gtid: Option<String>,
    /// Rows seen so far, buffered or streamed.
    pub event_count: usize,
    pub rewinding: bool,
    /// Whether the begin marker belongs to the replicated namespace.
    pub begin_replicated: bool,
    /// Where the source must be repositioned to replay this transaction.
    pub replay_from: Position,
    pub commit_target: Option<CommitTarget>,
}

impl Transaction {
    fn new(
        begin: Option<BeginMarker>,
        namespace: String,
        gtid: Option<String>,
        begin_replicated: bool,
        replay_from: Position,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            begin,
            namespace,
            rows: Vec::new(),
            gtid,
            event_count: 0,
            rewinding: false,
            begin_replicated,
            replay_from,
            commit_target: None,
        }
    }

    /// A transaction without rows whose begin marker was not for the
    /// replicated namespace is dropped at commit.
    pub fn is_droppable(&self) -> bool {
        self.rows.is_empty() && !self.begin_replicated && !self.rewinding
    }
}

/// Holds at most one open transaction.
#[derive(Debug)]
pub struct TransactionBuffer {
    current: Option<Transaction>,
    limit: Option<usize>,
}

impl TransactionBuffer {
    /// `limit = None` buffers transactions of any size.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            current: None,
            limit,
        }
    }

    pub fn state(&self) -> TransactionState {
        match &self.current {
            None => TransactionState::NoTransaction,
            Some(t) if t.rewinding => TransactionState::Rewinding,
            Some(_) => TransactionState::InTransaction,
        }
    }

    pub fn is_rewinding(&self) -> bool {
        self.state() == TransactionState::Rewinding
    }

    pub fn current(&self) -> Option<&Transaction> {
        self.current.as_ref()
    }

    /// Open a transaction on an explicit begin marker. Returns the
    /// transaction it replaced, if one was still open.
    pub fn begin(
        &mut self,
        marker: BeginMarker,
        gtid: Option<String>,
        begin_replicated: bool,
        replay_from: Position,
    ) -> Option<Transaction> {
        let namespace = marker.namespace.clone();
        self.current.replace(Transaction::new(
            Some(marker),
            namespace,
            gtid,
            begin_replicated,
            replay_from,
        ))
    }

    /// Open a transaction for a source that wrote no begin marker.
    pub fn begin_implicit(
        &mut self,
        namespace: impl Into<String>,
        gtid: Option<String>,
        replay_from: Position,
    ) -> Option<Transaction> {
        self.current.replace(Transaction::new(
            None,
            namespace.into(),
            gtid,
            false,
            replay_from,
        ))
    }

    /// Buffer one row.
    pub fn append(&mut self, row: RowChangeEvent) -> Result<AppendOutcome> {
        let limit = self.limit;
        let Some(transaction) = self.current.as_mut() else {
            return Err(ShardError::NoOpenTransaction {
                what: "row event",
                position: row.position,
                table: Some(row.table),
            });
        };
        if transaction.rewinding {
            return Err(ShardError::ProtocolViolation {
                reason: "rows of a rewinding transaction must be streamed, not buffered".into(),
                position: row.position,
                table: Some(row.table),
            });
        }

        transaction.event_count += 1;
        if limit.is_some_and(|limit| transaction.event_count > limit) {
            return Ok(AppendOutcome::Overflowed);
        }
        transaction.rows.push(row);
        Ok(AppendOutcome::Appended)
    }

    /// Count a row streamed while rewinding.
    pub fn record_streamed(&mut self) {
        if let Some(transaction) = self.current.as_mut() {
            transaction.event_count += 1;
        }
    }

    /// Switch the open transaction to rewinding: buffered rows are dropped
    /// and the position to replay from is returned.
    pub fn start_rewind(&mut self, at: &Position) -> Result<Position> {
        let Some(transaction) = self.current.as_mut() else {
            return Err(ShardError::NoOpenTransaction {
                what: "rewind",
                position: at.clone(),
                table: None,
            });
        };
        if transaction.rewinding {
            return Err(ShardError::ProtocolViolation {
                reason: format!(
                    "rewind requested for transaction {} while it is already rewinding",
                    transaction.id
                ),
                position: at.clone(),
                table: transaction.rows.first().map(|r| r.table.clone()),
            });
        }

        transaction.rewinding = true;
        transaction.rows.clear();
        transaction.event_count = 0;
        Ok(transaction.replay_from.clone())
    }

    /// Record the commit marker a rewinding transaction ends at.
    pub fn set_commit_target(&mut self, target: CommitTarget) {
        if let Some(transaction) = self.current.as_mut() {
            transaction.commit_target = Some(target);
        }
    }

    /// Close the open transaction on a commit marker at `at`.
    ///
    /// A rewinding transaction may only be closed by a commit marker at or
    /// after its recorded commit target.
    pub fn finish(&mut self, at: &Position) -> Result<Transaction> {
        let Some(transaction) = self.current.as_ref() else {
            return Err(ShardError::NoOpenTransaction {
                what: "commit",
                position: at.clone(),
                table: None,
            });
        };
        if transaction.rewinding {
            if let Some(target) = &transaction.commit_target {
                if at.cmp_location(&target.position).is_lt() {
                    return Err(ShardError::ProtocolViolation {
                        reason: format!(
                            "commit marker before the commit position {} of rewinding transaction {}",
                            target.position, transaction.id
                        ),
                        position: at.clone(),
                        table: None,
                    });
                }
            }
        }
        self.take_for_commit().ok_or_else(|| ShardError::NoOpenTransaction {
            what: "commit",
            position: at.clone(),
            table: None,
        })
    }

    /// Remove the open transaction without any checks.
    pub fn take_for_commit(&mut self) -> Option<Transaction> {
        self.current.take()
    }
}
