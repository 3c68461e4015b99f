//! Builders for synthetic binlog streams, shared by unit and integration
//! tests.

use mysql_types::{type_code, Cell};

use crate::event::{EventPayload, RowPair, SourceEvent, TableMapMetadata};
use crate::position::Position;

/// Table id used by [`EventBuilder::orders_table_map`].
pub const ORDERS_TABLE_ID: u64 = 17;

const FIRST_OFFSET: u64 = 4;
const EVENT_SIZE: u64 = 50;
const DEFAULT_TIMESTAMP: i64 = 1_548_982_800;

/// Produces consecutive events of one binlog segment.
///
/// Offsets start at 4, like a real segment after its magic header, and
/// advance by a fixed event size.
pub struct EventBuilder {
    segment: String,
    offset: u64,
    timestamp: i64,
    server_id: u32,
}

impl EventBuilder {
    pub fn new(segment: impl Into<String>) -> Self {
        Self {
            segment: segment.into(),
            offset: FIRST_OFFSET,
            timestamp: DEFAULT_TIMESTAMP,
            server_id: 1,
        }
    }

    /// Server clock for the following events.
    pub fn at_timestamp(&mut self, timestamp: i64) -> &mut Self {
        self.timestamp = timestamp;
        self
    }

    /// Position the next event will get.
    pub fn next_position(&self) -> Position {
        Position::new(self.segment.clone(), self.offset)
    }

    pub fn event(&mut self, payload: EventPayload) -> SourceEvent {
        let position = self.next_position();
        self.offset += EVENT_SIZE;
        SourceEvent {
            position,
            timestamp: self.timestamp,
            server_id: self.server_id,
            next_offset: self.offset,
            payload,
        }
    }

    pub fn query(&mut self, namespace: &str, sql: &str) -> SourceEvent {
        self.event(EventPayload::Query {
            namespace: namespace.to_string(),
            sql: sql.to_string(),
        })
    }

    pub fn begin(&mut self, namespace: &str) -> SourceEvent {
        self.query(namespace, "BEGIN")
    }

    pub fn table_map(
        &mut self,
        table_id: u64,
        namespace: &str,
        table: &str,
        metadata: TableMapMetadata,
    ) -> SourceEvent {
        self.event(EventPayload::TableMap {
            table_id,
            namespace: namespace.to_string(),
            table: table.to_string(),
            metadata,
        })
    }

    /// `shop.orders` under [`ORDERS_TABLE_ID`], see [`orders_metadata`].
    pub fn orders_table_map(&mut self) -> SourceEvent {
        self.table_map(ORDERS_TABLE_ID, "shop", "orders", orders_metadata())
    }

    pub fn write_rows(&mut self, table_id: u64, rows: Vec<Vec<Cell>>) -> SourceEvent {
        self.event(EventPayload::WriteRows { table_id, rows })
    }

    pub fn update_rows(&mut self, table_id: u64, rows: Vec<RowPair>) -> SourceEvent {
        self.event(EventPayload::UpdateRows { table_id, rows })
    }

    pub fn delete_rows(&mut self, table_id: u64, rows: Vec<Vec<Cell>>) -> SourceEvent {
        self.event(EventPayload::DeleteRows { table_id, rows })
    }

    pub fn insert_orders(&mut self, rows: &[(i64, &str)]) -> SourceEvent {
        let rows = rows.iter().map(|(id, name)| order_cells(*id, name)).collect();
        self.write_rows(ORDERS_TABLE_ID, rows)
    }

    /// Rename order `id` from `before` to `after`.
    pub fn update_order(&mut self, id: i64, before: &str, after: &str) -> SourceEvent {
        self.update_rows(
            ORDERS_TABLE_ID,
            vec![RowPair {
                before: order_cells(id, before),
                after: order_cells(id, after),
            }],
        )
    }

    pub fn delete_orders(&mut self, rows: &[(i64, &str)]) -> SourceEvent {
        let rows = rows.iter().map(|(id, name)| order_cells(*id, name)).collect();
        self.delete_rows(ORDERS_TABLE_ID, rows)
    }

    pub fn xid(&mut self, xid: u64) -> SourceEvent {
        self.event(EventPayload::Xid { xid })
    }

    pub fn gtid(&mut self, gtid: &str) -> SourceEvent {
        self.event(EventPayload::Gtid {
            gtid: gtid.to_string(),
        })
    }

    /// Rotate event announcing `segment`. The builder continues in that
    /// segment.
    pub fn rotate(&mut self, segment: &str) -> SourceEvent {
        let event = self.event(EventPayload::Rotate {
            segment: segment.to_string(),
            offset: FIRST_OFFSET,
        });
        if self.segment != segment {
            self.segment = segment.to_string();
            self.offset = FIRST_OFFSET;
        }
        event
    }
}

/// `(id INT PRIMARY KEY, name VARCHAR(40) utf8mb4)` with full metadata.
pub fn orders_metadata() -> TableMapMetadata {
    TableMapMetadata {
        column_types: vec![type_code::LONG, type_code::VARCHAR],
        column_meta: vec![0, 40],
        nullability: vec![false, true],
        column_names: Some(vec!["id".to_string(), "name".to_string()]),
        signedness: Some(vec![false]),
        primary_key: vec![0],
        column_charsets: Some(vec![45]),
        ..Default::default()
    }
}

pub fn order_cells(id: i64, name: &str) -> Vec<Cell> {
    vec![Cell::Int(id), Cell::Bytes(name.as_bytes().to_vec())]
}
