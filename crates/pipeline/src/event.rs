//! Source events consumed by a shard and the events it hands to the applier.

use mysql_types::{Cell, FullTableName};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::checkpoint::BinlogCheckpoint;
use crate::position::Position;

/// One primitive binlog event as yielded by a [`crate::BinlogSource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEvent {
    pub position: Position,
    /// Server clock, whole seconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub server_id: u32,
    /// Offset of the event following this one in the same segment.
    #[serde(default)]
    pub next_offset: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Closed set of binlog event kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// Statement event: `BEGIN`, `COMMIT`, DDL and everything else.
    Query {
        namespace: String,
        sql: String,
    },
    TableMap {
        table_id: u64,
        namespace: String,
        table: String,
        #[serde(default)]
        metadata: TableMapMetadata,
    },
    WriteRows {
        table_id: u64,
        rows: Vec<Vec<Cell>>,
    },
    UpdateRows {
        table_id: u64,
        rows: Vec<RowPair>,
    },
    DeleteRows {
        table_id: u64,
        rows: Vec<Vec<Cell>>,
    },
    Xid {
        xid: u64,
    },
    Gtid {
        gtid: String,
    },
    Rotate {
        segment: String,
        offset: u64,
    },
    FormatDescription {
        #[serde(default)]
        server_version: String,
    },
    Stop,
    Unknown {
        type_code: u8,
    },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::Query { .. } => "query",
            EventPayload::TableMap { .. } => "table_map",
            EventPayload::WriteRows { .. } => "write_rows",
            EventPayload::UpdateRows { .. } => "update_rows",
            EventPayload::DeleteRows { .. } => "delete_rows",
            EventPayload::Xid { .. } => "xid",
            EventPayload::Gtid { .. } => "gtid",
            EventPayload::Rotate { .. } => "rotate",
            EventPayload::FormatDescription { .. } => "format_description",
            EventPayload::Stop => "stop",
            EventPayload::Unknown { .. } => "unknown",
        }
    }

    /// Table id referenced by a row event.
    pub fn row_table_id(&self) -> Option<u64> {
        match self {
            EventPayload::WriteRows { table_id, .. }
            | EventPayload::UpdateRows { table_id, .. }
            | EventPayload::DeleteRows { table_id, .. } => Some(*table_id),
            _ => None,
        }
    }
}

/// Before and after images of one updated row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowPair {
    pub before: Vec<Cell>,
    pub after: Vec<Cell>,
}

/// Structural column metadata carried by a `TABLE_MAP` event.
///
/// The optional lists only exist when the server runs with
/// `binlog_row_metadata=FULL`. Charset lists hold one entry per column that
/// needs one, in column order: `column_charsets` for character columns,
/// `enum_set_column_charsets` for ENUM/SET columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableMapMetadata {
    pub column_types: Vec<u8>,
    pub column_meta: Vec<u16>,
    pub nullability: Vec<bool>,
    pub column_names: Option<Vec<String>>,
    /// One flag per numeric column, in column order.
    pub signedness: Option<Vec<bool>>,
    pub primary_key: Vec<usize>,
    pub column_charsets: Option<Vec<u32>>,
    pub enum_set_column_charsets: Option<Vec<u32>>,
    pub default_charset: Option<u32>,
    pub enum_set_default_charset: Option<u32>,
    /// Member lists of ENUM and SET columns, in column order.
    pub enum_and_set_values: Option<Vec<Vec<String>>>,
}

impl TableMapMetadata {
    /// Whether the metadata is complete enough to build a schema without the
    /// live source.
    pub fn has_full_metadata(&self) -> bool {
        self.column_names
            .as_ref()
            .is_some_and(|names| names.len() == self.column_types.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowKind {
    Insert,
    Update,
    Delete,
}

/// Decoded column values of one row, in physical column order.
pub type RowImage = Map<String, Value>;

/// One decoded row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChangeEvent {
    pub kind: RowKind,
    pub table: FullTableName,
    pub primary_key_columns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<RowImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<RowImage>,
    pub timestamp_micros: i64,
    pub transaction_id: Uuid,
    pub xid: Option<u64>,
    pub position: Position,
}

impl RowChangeEvent {
    /// Image that identifies the row after the change.
    pub fn key_image(&self) -> Option<&RowImage> {
        match self.kind {
            RowKind::Delete => self.before.as_ref(),
            RowKind::Insert | RowKind::Update => self.after.as_ref(),
        }
    }

    /// Primary key values, in key order. Missing or null values are skipped.
    pub fn primary_key_values(&self) -> Vec<(&str, &str)> {
        let Some(image) = self.key_image() else {
            return Vec::new();
        };
        self.primary_key_columns
            .iter()
            .filter_map(|column| {
                image
                    .get(column)
                    .and_then(Value::as_str)
                    .map(|value| (column.as_str(), value))
            })
            .collect()
    }
}

/// Event handed to the applier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AppliedEvent {
    Begin {
        transaction_id: Uuid,
        gtid: Option<String>,
        namespace: String,
        position: Position,
    },
    Row(RowChangeEvent),
    Commit {
        transaction_id: Uuid,
        xid: Option<u64>,
        gtid: Option<String>,
        timestamp_micros: i64,
        checkpoint: BinlogCheckpoint,
    },
    SchemaChange {
        namespace: String,
        table: Option<String>,
        statement: String,
        position: Position,
    },
}

impl AppliedEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AppliedEvent::Begin { .. } => "begin",
            AppliedEvent::Row(_) => "row",
            AppliedEvent::Commit { .. } => "commit",
            AppliedEvent::SchemaChange { .. } => "schema_change",
        }
    }

    pub fn as_row(&self) -> Option<&RowChangeEvent> {
        match self {
            AppliedEvent::Row(row) => Some(row),
            _ => None,
        }
    }

    pub fn transaction_id(&self) -> Option<Uuid> {
        match self {
            AppliedEvent::Begin { transaction_id, .. }
            | AppliedEvent::Commit { transaction_id, .. } => Some(*transaction_id),
            AppliedEvent::Row(row) => Some(row.transaction_id),
            AppliedEvent::SchemaChange { .. } => None,
        }
    }
}

/// Context passed alongside every applied event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionContext {
    pub shard_id: String,
    pub transaction_id: Option<Uuid>,
    /// Set while an overflowed transaction is being streamed.
    pub rewinding: bool,
}
