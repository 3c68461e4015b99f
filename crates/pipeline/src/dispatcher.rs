//! Routing of source events through the schema registry and the
//! transaction buffer.
//!
//! [`EventDispatcher::dispatch`] is an exhaustive match over the event kinds.
//! It never talks to the applier itself; it returns the [`Action`]s the shard
//! must carry out, in order.

use std::sync::Arc;

use mysql_types::{decode, Cell, TableSchema};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoint::{BinlogCheckpoint, CheckpointPosition};
use crate::error::{Result, ShardError};
use crate::event::{AppliedEvent, EventPayload, RowChangeEvent, RowImage, RowKind, SourceEvent};
use crate::position::{timestamp_micros, Position, SequenceClock};
use crate::query::{classify, QueryKind, TableDdl};
use crate::registry::SchemaRegistry;
use crate::transaction::{
    AppendOutcome, BeginMarker, CommitTarget, Transaction, TransactionBuffer, TransactionState,
};

/// What the shard must do after dispatching one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Apply one event right away.
    Apply(AppliedEvent),
    /// Apply a whole transaction in order without interruption, then report
    /// progress.
    Commit(Vec<AppliedEvent>),
    /// A transaction was closed without reaching the applier.
    Dropped { transaction_id: Uuid },
    /// The open transaction overflowed; replay it from `replay_from`.
    Rewind { replay_from: Position },
}

pub struct EventDispatcher {
    registry: SchemaRegistry,
    buffer: TransactionBuffer,
    clock: SequenceClock,
    resume_after: Option<CheckpointPosition>,
    last_rotate: Option<String>,
    pending_gtid: Option<String>,
}

impl EventDispatcher {
    pub fn new(registry: SchemaRegistry, transaction_limit: Option<usize>) -> Self {
        Self {
            registry,
            buffer: TransactionBuffer::new(transaction_limit),
            clock: SequenceClock::new(),
            resume_after: None,
            last_rotate: None,
            pending_gtid: None,
        }
    }

    /// Skip everything at or before `checkpoint`; it was applied by a previous
    /// run.
    pub fn resume_after(mut self, checkpoint: Option<&BinlogCheckpoint>) -> Self {
        self.resume_after = checkpoint.map(|c| c.position.clone());
        self
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn state(&self) -> TransactionState {
        self.buffer.state()
    }

    pub fn current_transaction(&self) -> Option<&Transaction> {
        self.buffer.current()
    }

    /// Whether `event` closes a transaction.
    pub fn is_commit_marker(event: &SourceEvent) -> bool {
        match &event.payload {
            EventPayload::Xid { .. } => true,
            EventPayload::Query { sql, .. } => classify(sql) == QueryKind::Commit,
            _ => false,
        }
    }

    /// Whether `event` abandons the open transaction.
    pub fn is_rollback_marker(event: &SourceEvent) -> bool {
        match &event.payload {
            EventPayload::Query { sql, .. } => classify(sql) == QueryKind::Rollback,
            _ => false,
        }
    }

    /// Record where the rewinding transaction commits. Called by the shard
    /// after reading ahead to the commit marker.
    pub fn set_commit_target(&mut self, commit: &SourceEvent) {
        self.buffer.set_commit_target(CommitTarget {
            position: commit.position.clone(),
            timestamp: commit.timestamp,
        });
    }

    /// Begin artifact to apply before the replayed rows of a rewinding
    /// transaction.
    pub fn begin_replay(&self) -> Option<AppliedEvent> {
        self.buffer
            .current()
            .filter(|t| t.rewinding)
            .map(begin_event)
    }

    pub async fn dispatch(&mut self, event: &SourceEvent) -> Result<Vec<Action>> {
        let suppressed = self.is_already_applied(&event.position);

        match &event.payload {
            EventPayload::Query { namespace, sql } => {
                self.on_query(event, namespace, sql, suppressed).await
            }
            EventPayload::TableMap {
                table_id,
                namespace,
                table,
                metadata,
            } => {
                let schema = self
                    .registry
                    .on_table_announce(*table_id, namespace, table, metadata)
                    .await?;
                if schema.is_some()
                    && !suppressed
                    && self.buffer.state() == TransactionState::NoTransaction
                {
                    debug!(position = %event.position, "opening implicit transaction");
                    let _ = self.buffer.begin_implicit(
                        namespace.clone(),
                        self.pending_gtid.take(),
                        event.position.clone(),
                    );
                }
                Ok(Vec::new())
            }
            EventPayload::WriteRows { table_id, rows } => {
                let images = rows.iter().map(|r| (None, Some(r.as_slice())));
                self.on_rows(event, *table_id, RowKind::Insert, images, suppressed)
            }
            EventPayload::UpdateRows { table_id, rows } => {
                let images = rows
                    .iter()
                    .map(|r| (Some(r.before.as_slice()), Some(r.after.as_slice())));
                self.on_rows(event, *table_id, RowKind::Update, images, suppressed)
            }
            EventPayload::DeleteRows { table_id, rows } => {
                let images = rows.iter().map(|r| (Some(r.as_slice()), None));
                self.on_rows(event, *table_id, RowKind::Delete, images, suppressed)
            }
            EventPayload::Xid { xid } => self.on_commit(event, Some(*xid), None, suppressed),
            EventPayload::Gtid { gtid } => {
                self.pending_gtid = Some(gtid.clone());
                Ok(Vec::new())
            }
            EventPayload::Rotate { segment, offset } => {
                if self.last_rotate.as_deref() == Some(segment.as_str()) {
                    debug!("duplicate rotate to {segment}, skipping");
                } else {
                    info!("binlog rotated to {segment}:{offset}");
                    self.last_rotate = Some(segment.clone());
                }
                Ok(Vec::new())
            }
            EventPayload::FormatDescription { server_version } => {
                debug!(position = %event.position, "format description, server version {server_version}");
                Ok(Vec::new())
            }
            EventPayload::Stop => {
                info!(position = %event.position, "source server stopped");
                Ok(Vec::new())
            }
            EventPayload::Unknown { type_code } => {
                warn!(position = %event.position, "no handler for binlog event type {type_code}, skipping");
                Ok(Vec::new())
            }
        }
    }

    fn is_already_applied(&self, position: &Position) -> bool {
        self.resume_after
            .as_ref()
            .is_some_and(|resume| position.is_at_or_before(&resume.segment, resume.offset))
    }

    async fn on_query(
        &mut self,
        event: &SourceEvent,
        namespace: &str,
        sql: &str,
        suppressed: bool,
    ) -> Result<Vec<Action>> {
        match classify(sql) {
            QueryKind::Begin => {
                if self.buffer.is_rewinding() {
                    debug!(position = %event.position, "BEGIN of a replayed transaction");
                    return Ok(Vec::new());
                }
                let marker = BeginMarker {
                    namespace: namespace.to_string(),
                    position: event.position.clone(),
                };
                let replicated = self.registry.is_replicated(namespace);
                let replay_from = replay_start(event);
                if let Some(unfinished) =
                    self.buffer
                        .begin(marker, self.pending_gtid.take(), replicated, replay_from)
                {
                    warn!(
                        position = %event.position,
                        "discarding transaction {} that was never committed",
                        unfinished.id
                    );
                }
                Ok(Vec::new())
            }
            QueryKind::Commit => self.on_commit(event, None, Some(namespace), suppressed),
            QueryKind::Rollback => {
                if let Some(transaction) = self.buffer.take_for_commit() {
                    debug!(position = %event.position, "transaction {} rolled back", transaction.id);
                    return Ok(vec![Action::Dropped {
                        transaction_id: transaction.id,
                    }]);
                }
                Ok(Vec::new())
            }
            QueryKind::PseudoGtid | QueryKind::View | QueryKind::Analyze => {
                debug!(position = %event.position, "skipping statement: {sql}");
                Ok(Vec::new())
            }
            QueryKind::Other => {
                warn!(position = %event.position, "skipping unhandled statement: {sql}");
                Ok(Vec::new())
            }
            QueryKind::Unparseable => {
                if self.registry.is_replicated(namespace) && !suppressed {
                    return Err(ShardError::UnparseableDdl {
                        namespace: namespace.to_string(),
                        statement: sql.to_string(),
                        position: event.position.clone(),
                    });
                }
                warn!(position = %event.position, "skipping unparseable statement: {sql}");
                Ok(Vec::new())
            }
            QueryKind::Table(ddl) => self.on_table_ddl(event, namespace, sql, &ddl, suppressed).await,
        }
    }

    async fn on_table_ddl(
        &mut self,
        event: &SourceEvent,
        namespace: &str,
        sql: &str,
        ddl: &TableDdl,
        suppressed: bool,
    ) -> Result<Vec<Action>> {
        self.pending_gtid = None;
        let affected = self.registry.on_ddl(namespace, ddl).await?;
        if suppressed {
            return Ok(Vec::new());
        }
        Ok(affected
            .into_iter()
            .map(|table| {
                Action::Apply(AppliedEvent::SchemaChange {
                    namespace: table.namespace,
                    table: Some(table.table),
                    statement: sql.to_string(),
                    position: event.position.clone(),
                })
            })
            .collect())
    }

    fn on_rows<'a>(
        &mut self,
        event: &SourceEvent,
        table_id: u64,
        kind: RowKind,
        images: impl Iterator<Item = (Option<&'a [Cell]>, Option<&'a [Cell]>)>,
        suppressed: bool,
    ) -> Result<Vec<Action>> {
        if self.registry.is_ignored(table_id) {
            return Ok(Vec::new());
        }
        let schema = self.registry.resolve(table_id, &event.position)?;
        if suppressed {
            return Ok(Vec::new());
        }
        let (transaction_id, commit_timestamp) = match self.buffer.current() {
            Some(t) => (t.id, t.commit_target.as_ref().map(|c| c.timestamp)),
            None => {
                return Err(ShardError::NoOpenTransaction {
                    what: "row event",
                    position: event.position.clone(),
                    table: Some(schema.name.clone()),
                })
            }
        };

        let mut actions = Vec::new();
        for (before, after) in images {
            let mut row = RowChangeEvent {
                kind,
                table: schema.name.clone(),
                primary_key_columns: schema.primary_key_columns(),
                before: before
                    .map(|cells| decode_image(&schema, cells, &event.position))
                    .transpose()?,
                after: after
                    .map(|cells| decode_image(&schema, cells, &event.position))
                    .transpose()?,
                timestamp_micros: 0,
                transaction_id,
                xid: None,
                position: event.position.clone(),
            };

            if self.buffer.is_rewinding() {
                stamp(&mut self.clock, &mut row, commit_timestamp.unwrap_or(event.timestamp));
                self.buffer.record_streamed();
                actions.push(Action::Apply(AppliedEvent::Row(row)));
                continue;
            }

            match self.buffer.append(row)? {
                AppendOutcome::Appended => {}
                AppendOutcome::Overflowed => {
                    let replay_from = self.buffer.start_rewind(&event.position)?;
                    info!(
                        position = %event.position,
                        table = %schema.name,
                        "transaction {transaction_id} exceeded the buffer limit, replaying from {replay_from}"
                    );
                    return Ok(vec![Action::Rewind { replay_from }]);
                }
            }
        }
        Ok(actions)
    }

    fn on_commit(
        &mut self,
        event: &SourceEvent,
        xid: Option<u64>,
        query_namespace: Option<&str>,
        suppressed: bool,
    ) -> Result<Vec<Action>> {
        if suppressed {
            let _ = self.buffer.take_for_commit();
            return Ok(Vec::new());
        }
        if self.buffer.state() == TransactionState::NoTransaction {
            if let Some(namespace) = query_namespace {
                if self.registry.is_replicated(namespace) {
                    return Err(ShardError::NoOpenTransaction {
                        what: "COMMIT",
                        position: event.position.clone(),
                        table: None,
                    });
                }
            }
            warn!(position = %event.position, "commit marker without an open transaction, skipping");
            return Ok(Vec::new());
        }

        let transaction = self.buffer.finish(&event.position)?;
        if transaction.is_droppable() {
            debug!(position = %event.position, "dropping empty transaction {}", transaction.id);
            return Ok(vec![Action::Dropped {
                transaction_id: transaction.id,
            }]);
        }

        let mut applied = Vec::with_capacity(transaction.rows.len() + 2);
        if !transaction.rewinding {
            applied.push(begin_event(&transaction));
            for mut row in transaction.rows {
                row.xid = xid;
                stamp(&mut self.clock, &mut row, event.timestamp);
                applied.push(AppliedEvent::Row(row));
            }
        }

        let sequence = self.clock.tick(event.timestamp);
        let checkpoint = BinlogCheckpoint {
            timestamp: event.timestamp * 1000,
            server_id: event.server_id,
            gtid: transaction.gtid.clone(),
            position: CheckpointPosition::from(&event.position),
        };
        applied.push(AppliedEvent::Commit {
            transaction_id: transaction.id,
            xid,
            gtid: transaction.gtid,
            timestamp_micros: timestamp_micros(event.timestamp, sequence),
            checkpoint,
        });
        Ok(vec![Action::Commit(applied)])
    }
}

/// Position after an explicit `BEGIN`, or the `BEGIN` itself when the source
/// did not report where the next event starts.
fn replay_start(event: &SourceEvent) -> Position {
    if event.next_offset > event.position.offset {
        Position::new(event.position.segment.clone(), event.next_offset)
    } else {
        event.position.clone()
    }
}

fn begin_event(transaction: &Transaction) -> AppliedEvent {
    AppliedEvent::Begin {
        transaction_id: transaction.id,
        gtid: transaction.gtid.clone(),
        namespace: transaction.namespace.clone(),
        position: transaction
            .begin
            .as_ref()
            .map(|b| b.position.clone())
            .unwrap_or_else(|| transaction.replay_from.clone()),
    }
}

fn stamp(clock: &mut SequenceClock, row: &mut RowChangeEvent, timestamp: i64) {
    let sequence = clock.tick(timestamp);
    row.position.sequence = sequence;
    row.timestamp_micros = timestamp_micros(timestamp, sequence);
}

fn decode_image(schema: &Arc<TableSchema>, cells: &[Cell], position: &Position) -> Result<RowImage> {
    if cells.len() != schema.columns.len() {
        return Err(ShardError::ProtocolViolation {
            reason: format!(
                "row image has {} cells but the table has {} columns",
                cells.len(),
                schema.columns.len()
            ),
            position: position.clone(),
            table: Some(schema.name.clone()),
        });
    }

    let mut image = RowImage::new();
    for (column, cell) in schema.columns.iter().zip(cells) {
        let value = decode(cell, column, None).map_err(|source| ShardError::Decode {
            source,
            table: schema.name.clone(),
            column: column.name.clone(),
            position: position.clone(),
        })?;
        image.insert(column.name.clone(), value.map(Value::String).unwrap_or(Value::Null));
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::StaticSchemaSource;
    use crate::testing::EventBuilder;

    fn dispatcher(limit: Option<usize>) -> EventDispatcher {
        let registry = SchemaRegistry::new(Arc::new(StaticSchemaSource::new()), Some("shop".into()));
        EventDispatcher::new(registry, limit)
    }

    async fn run(dispatcher: &mut EventDispatcher, events: &[SourceEvent]) -> Vec<Action> {
        let mut actions = Vec::new();
        for event in events {
            actions.extend(dispatcher.dispatch(event).await.unwrap());
        }
        actions
    }

    fn committed(actions: &[Action]) -> Vec<&AppliedEvent> {
        actions
            .iter()
            .flat_map(|a| match a {
                Action::Commit(events) => events.iter().collect(),
                Action::Apply(event) => vec![event],
                _ => Vec::new(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_buffered_transaction_commits_in_order() {
        let mut b = EventBuilder::new("mysql-bin.000001");
        let events = vec![
            b.begin("shop"),
            b.orders_table_map(),
            b.insert_orders(&[(1, "a"), (2, "b")]),
            b.insert_orders(&[(3, "c")]),
            b.xid(10),
        ];
        let mut d = dispatcher(None);
        let actions = run(&mut d, &events).await;

        assert_eq!(actions.len(), 1);
        let applied = committed(&actions);
        let kinds: Vec<_> = applied.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, ["begin", "row", "row", "row", "commit"]);
        let ids: Vec<_> = applied
            .iter()
            .filter_map(|e| e.as_row())
            .map(|r| r.after.as_ref().unwrap()["id"].clone())
            .collect();
        assert_eq!(ids, ["1", "2", "3"]);

        let rows: Vec<_> = applied.iter().filter_map(|e| e.as_row()).collect();
        assert!(rows.windows(2).all(|w| w[0].timestamp_micros < w[1].timestamp_micros));
        assert!(rows.iter().all(|r| r.xid == Some(10)));
        assert_eq!(d.state(), TransactionState::NoTransaction);
    }

    #[tokio::test]
    async fn test_overflow_requests_rewind() {
        let mut b = EventBuilder::new("mysql-bin.000001");
        let begin = b.begin("shop");
        let events = vec![
            begin.clone(),
            b.orders_table_map(),
            b.insert_orders(&[(1, "a"), (2, "b"), (3, "c")]),
        ];
        let mut d = dispatcher(Some(2));
        let actions = run(&mut d, &events).await;

        assert_eq!(
            actions,
            vec![Action::Rewind {
                replay_from: Position::new("mysql-bin.000001", begin.next_offset)
            }]
        );
        assert_eq!(d.state(), TransactionState::Rewinding);
    }

    #[tokio::test]
    async fn test_empty_transaction_outside_namespace_is_dropped() {
        let mut b = EventBuilder::new("mysql-bin.000001");
        let events = vec![b.begin("audit"), b.xid(3)];
        let mut d = dispatcher(None);
        let actions = run(&mut d, &events).await;
        assert!(matches!(actions.as_slice(), [Action::Dropped { .. }]));
    }

    #[tokio::test]
    async fn test_empty_transaction_in_namespace_is_applied() {
        let mut b = EventBuilder::new("mysql-bin.000001");
        let events = vec![b.begin("shop"), b.xid(3)];
        let mut d = dispatcher(None);
        let actions = run(&mut d, &events).await;
        let kinds: Vec<_> = committed(&actions).iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, ["begin", "commit"]);
    }

    #[tokio::test]
    async fn test_row_without_table_map_is_unknown_schema() {
        let mut b = EventBuilder::new("mysql-bin.000001");
        let mut d = dispatcher(None);
        d.dispatch(&b.begin("shop")).await.unwrap();
        let err = d.dispatch(&b.insert_orders(&[(1, "a")])).await.unwrap_err();
        assert!(matches!(err, ShardError::UnknownSchema { table_id: 17, .. }));
    }

    #[tokio::test]
    async fn test_commit_query_without_transaction() {
        let mut b = EventBuilder::new("mysql-bin.000001");
        let mut d = dispatcher(None);
        let err = d.dispatch(&b.query("shop", "COMMIT")).await.unwrap_err();
        assert!(matches!(err, ShardError::NoOpenTransaction { what: "COMMIT", .. }));

        assert!(d.dispatch(&b.query("audit", "COMMIT")).await.unwrap().is_empty());
        assert!(d.dispatch(&b.xid(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rows_of_other_namespaces_are_skipped() {
        let mut b = EventBuilder::new("mysql-bin.000001");
        let events = vec![
            b.begin("audit"),
            b.table_map(40, "audit", "log", crate::testing::orders_metadata()),
            b.write_rows(40, vec![crate::testing::order_cells(1, "x")]),
            b.xid(2),
        ];
        let mut d = dispatcher(None);
        let actions = run(&mut d, &events).await;
        assert!(matches!(actions.as_slice(), [Action::Dropped { .. }]));
        assert!(d.registry().is_ignored(40));
    }

    #[tokio::test]
    async fn test_implicit_transaction_opens_on_table_map() {
        let mut b = EventBuilder::new("mysql-bin.000001");
        let table_map = b.orders_table_map();
        let events = vec![table_map.clone(), b.insert_orders(&[(1, "a")]), b.xid(5)];
        let mut d = dispatcher(None);
        let actions = run(&mut d, &events).await;
        let applied = committed(&actions);
        match applied[0] {
            AppliedEvent::Begin { position, namespace, .. } => {
                assert_eq!(position, &table_map.position);
                assert_eq!(namespace, "shop");
            }
            other => panic!("expected begin, got {other:?}"),
        }
        assert_eq!(applied.len(), 3);
    }

    #[tokio::test]
    async fn test_resume_skips_applied_events() {
        let mut b = EventBuilder::new("mysql-bin.000001");
        let first = vec![
            b.begin("shop"),
            b.orders_table_map(),
            b.insert_orders(&[(1, "a")]),
            b.xid(1),
        ];
        let second = vec![
            b.begin("shop"),
            b.orders_table_map(),
            b.insert_orders(&[(2, "b")]),
            b.xid(2),
        ];
        let checkpoint = BinlogCheckpoint::new(CheckpointPosition::from(&first[3].position));
        let mut d = dispatcher(None).resume_after(Some(&checkpoint));

        assert!(run(&mut d, &first).await.is_empty());
        let actions = run(&mut d, &second).await;
        let rows: Vec<_> = committed(&actions)
            .into_iter()
            .filter_map(|e| e.as_row())
            .collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].after.as_ref().unwrap()["id"], "2");
    }

    #[tokio::test]
    async fn test_unparseable_ddl_is_fatal_for_replicated_namespace() {
        let mut b = EventBuilder::new("mysql-bin.000001");
        let mut d = dispatcher(None);
        let err = d.dispatch(&b.query("shop", "ALTER TABLE")).await.unwrap_err();
        assert!(matches!(err, ShardError::UnparseableDdl { .. }));
        assert!(d.dispatch(&b.query("audit", "ALTER TABLE")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ddl_emits_schema_change_and_forces_reannounce() {
        let mut b = EventBuilder::new("mysql-bin.000001");
        let mut d = dispatcher(None);
        run(&mut d, &[b.orders_table_map()]).await;
        let _ = d.buffer.take_for_commit();

        let actions = d
            .dispatch(&b.query("shop", "TRUNCATE TABLE orders"))
            .await
            .unwrap();
        assert!(matches!(
            actions.as_slice(),
            [Action::Apply(AppliedEvent::SchemaChange { table: Some(t), .. })] if t == "orders"
        ));

        d.dispatch(&b.begin("shop")).await.unwrap();
        let err = d.dispatch(&b.insert_orders(&[(1, "a")])).await.unwrap_err();
        assert!(matches!(err, ShardError::UnknownSchema { .. }));
    }

    #[tokio::test]
    async fn test_rotate_and_control_events_produce_nothing() {
        let mut b = EventBuilder::new("mysql-bin.000001");
        let mut d = dispatcher(None);
        let events = vec![
            b.rotate("mysql-bin.000002"),
            b.rotate("mysql-bin.000002"),
            b.event(EventPayload::FormatDescription {
                server_version: "8.0.36".into(),
            }),
            b.event(EventPayload::Unknown { type_code: 35 }),
            b.event(EventPayload::Stop),
            b.query("shop", "ANALYZE TABLE orders"),
            b.query("shop", "CREATE VIEW v AS SELECT 1"),
            b.query("shop", "GRANT ALL ON *.* TO 'x'"),
        ];
        assert!(run(&mut d, &events).await.is_empty());
        assert_eq!(d.last_rotate.as_deref(), Some("mysql-bin.000002"));
    }

    #[tokio::test]
    async fn test_decode_failure_names_the_column() {
        let mut b = EventBuilder::new("mysql-bin.000001");
        let mut d = dispatcher(None);
        run(&mut d, &[b.begin("shop"), b.orders_table_map()]).await;
        let bad = b.write_rows(17, vec![vec![Cell::Bytes(vec![1]), Cell::Bytes(b"x".to_vec())]]);
        let err = d.dispatch(&bad).await.unwrap_err();
        match err {
            ShardError::Decode { column, .. } => assert_eq!(column, "id"),
            other => panic!("unexpected error {other}"),
        }
    }
}
