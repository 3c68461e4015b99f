//! Per-shard table schema registry.
//!
//! Row events only carry a numeric table id; the layout behind that id is
//! announced by the preceding `TABLE_MAP` event. The registry keeps the
//! layouts for the current session and drops them as soon as DDL touches the
//! table, so a row event can never be decoded with a stale layout.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use mysql_types::{
    collation_label, BinlogColumnType, CharsetCategory, ColumnSchema, DataType, FullTableName,
    TableSchema, BINARY_COLLATION_ID,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, ShardError};
use crate::event::TableMapMetadata;
use crate::position::Position;
use crate::query::TableDdl;
use crate::schema::SchemaSource;

/// Registry contents, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistrySnapshot {
    pub tables: BTreeMap<u64, FullTableName>,
    pub ignored: BTreeSet<u64>,
    pub live_cached: BTreeSet<FullTableName>,
}

pub struct SchemaRegistry {
    source: Arc<dyn SchemaSource>,
    replicated_namespace: Option<String>,
    by_id: HashMap<u64, Arc<TableSchema>>,
    live: HashMap<FullTableName, Arc<TableSchema>>,
    ignored: BTreeSet<u64>,
}

impl SchemaRegistry {
    /// `replicated_namespace = None` replicates every namespace.
    pub fn new(source: Arc<dyn SchemaSource>, replicated_namespace: Option<String>) -> Self {
        Self {
            source,
            replicated_namespace,
            by_id: HashMap::new(),
            live: HashMap::new(),
            ignored: BTreeSet::new(),
        }
    }

    pub fn is_replicated(&self, namespace: &str) -> bool {
        self.replicated_namespace
            .as_deref()
            .is_none_or(|replicated| replicated == namespace)
    }

    pub fn is_ignored(&self, table_id: u64) -> bool {
        self.ignored.contains(&table_id)
    }

    /// Layout announced for `table_id`.
    ///
    /// An id that was never announced, or whose table has since been touched
    /// by DDL without a new announcement, is a fatal fault.
    pub fn resolve(&self, table_id: u64, position: &Position) -> Result<Arc<TableSchema>> {
        self.by_id
            .get(&table_id)
            .cloned()
            .ok_or_else(|| ShardError::UnknownSchema {
                table_id,
                position: position.clone(),
            })
    }

    /// Record a `TABLE_MAP` announcement.
    ///
    /// Returns `None` for tables outside the replicated namespace; their id is
    /// remembered so row events for it can be skipped.
    pub async fn on_table_announce(
        &mut self,
        table_id: u64,
        namespace: &str,
        table: &str,
        metadata: &TableMapMetadata,
    ) -> Result<Option<Arc<TableSchema>>> {
        if !self.is_replicated(namespace) {
            self.by_id.remove(&table_id);
            self.ignored.insert(table_id);
            return Ok(None);
        }
        self.ignored.remove(&table_id);

        let schema = if metadata.has_full_metadata() {
            Arc::new(schema_from_metadata(namespace, table, metadata))
        } else {
            let schema = self
                .resolve_from_live_source(namespace, table)
                .await?
                .ok_or_else(|| {
                    ShardError::Schema(anyhow::anyhow!(
                        "table {namespace}.{table} not found in live schema source"
                    ))
                })?;
            let announced = metadata.column_types.len();
            if announced > 0 && announced != schema.columns.len() {
                return Err(ShardError::Schema(anyhow::anyhow!(
                    "live schema of {namespace}.{table} has {} columns but the binlog announces {announced}",
                    schema.columns.len()
                )));
            }
            schema
        };

        debug!(
            table_id,
            table = %schema.name,
            columns = schema.columns.len(),
            "table announced"
        );
        self.by_id.insert(table_id, Arc::clone(&schema));
        Ok(Some(schema))
    }

    /// Apply a table DDL statement seen in `namespace` (the statement's
    /// default namespace).
    ///
    /// Every affected table in the replicated namespace loses its announced
    /// layout; CREATE, ALTER and RENAME targets are re-read from the live
    /// source. Returns the affected replicated tables.
    pub async fn on_ddl(&mut self, namespace: &str, ddl: &TableDdl) -> Result<Vec<FullTableName>> {
        let mut affected = Vec::new();
        for table in ddl.tables() {
            let name = table.resolve(namespace);
            if self.is_replicated(&name.namespace) {
                self.invalidate(&name);
                affected.push(name);
            }
        }

        let refresh: Vec<FullTableName> = match ddl {
            TableDdl::Create(t) | TableDdl::Alter(t) => vec![t.resolve(namespace)],
            TableDdl::Rename(pairs) => pairs.iter().map(|(_, to)| to.resolve(namespace)).collect(),
            TableDdl::Drop(_) | TableDdl::Truncate(_) => Vec::new(),
        };
        for name in refresh {
            if !self.is_replicated(&name.namespace) {
                continue;
            }
            match self.resolve_from_live_source(&name.namespace, &name.table).await? {
                Some(schema) => info!(
                    table = %name,
                    columns = schema.columns.len(),
                    "schema refreshed after {} statement",
                    ddl.verb()
                ),
                None => warn!(table = %name, "table vanished from the live source after {} statement", ddl.verb()),
            }
        }
        Ok(affected)
    }

    /// Current layout of a table from the live source, cached until the next
    /// DDL on that table. A shadow copy is created from the table's creation
    /// statement when the source reports one.
    pub async fn resolve_from_live_source(
        &mut self,
        namespace: &str,
        table: &str,
    ) -> Result<Option<Arc<TableSchema>>> {
        let name = FullTableName::new(namespace, table);
        if let Some(schema) = self.live.get(&name) {
            return Ok(Some(Arc::clone(schema)));
        }

        let Some(schema) = self
            .source
            .lookup_live_schema(namespace, table)
            .await
            .map_err(ShardError::Schema)?
        else {
            return Ok(None);
        };
        if let Some(ddl) = &schema.create_statement {
            self.source
                .ensure_shadow_table(namespace, table, ddl)
                .await
                .map_err(ShardError::Schema)?;
        }

        let schema = Arc::new(schema);
        self.live.insert(name, Arc::clone(&schema));
        Ok(Some(schema))
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            tables: self
                .by_id
                .iter()
                .map(|(id, schema)| (*id, schema.name.clone()))
                .collect(),
            ignored: self.ignored.clone(),
            live_cached: self.live.keys().cloned().collect(),
        }
    }

    fn invalidate(&mut self, name: &FullTableName) {
        self.live.remove(name);
        self.by_id.retain(|table_id, schema| {
            let stale = &schema.name == name;
            if stale {
                debug!(table_id, table = %name, "schema invalidated");
            }
            !stale
        });
    }
}

/// Cursor into one of the per-category charset lists of `TABLE_MAP`
/// metadata. Each list only has entries for columns of its category, so each
/// category advances its own cursor.
struct CharsetCursor<'a> {
    list: Option<&'a [u32]>,
    default: Option<u32>,
    next: usize,
}

impl<'a> CharsetCursor<'a> {
    fn new(list: Option<&'a [u32]>, default: Option<u32>) -> Self {
        Self {
            list,
            default,
            next: 0,
        }
    }

    fn advance(&mut self) -> Option<u32> {
        let Some(list) = self.list else {
            return self.default;
        };
        let id = list
            .get(self.next)
            .copied()
            .or(self.default)
            .unwrap_or(BINARY_COLLATION_ID);
        self.next += 1;
        Some(id)
    }
}

/// Build a table layout from full `TABLE_MAP` metadata alone.
pub fn schema_from_metadata(
    namespace: &str,
    table: &str,
    metadata: &TableMapMetadata,
) -> TableSchema {
    let mut charsets = CharsetCursor::new(
        metadata.column_charsets.as_deref(),
        metadata.default_charset,
    );
    let mut enum_set_charsets = CharsetCursor::new(
        metadata.enum_set_column_charsets.as_deref(),
        metadata.enum_set_default_charset,
    );
    let mut numeric_index = 0;
    let mut enum_set_index = 0;
    let names = metadata.column_names.as_deref().unwrap_or_default();

    let columns = metadata
        .column_types
        .iter()
        .enumerate()
        .map(|(i, &code)| {
            let meta = metadata.column_meta.get(i).copied().unwrap_or_default();
            let binlog_type = BinlogColumnType::from_code(code, meta);

            let collation_id = match binlog_type.data_type.charset_category() {
                CharsetCategory::Character => charsets.advance(),
                CharsetCategory::EnumOrSet => enum_set_charsets.advance(),
                CharsetCategory::None => None,
            };
            let binlog_type = binlog_type.with_collation(collation_id);
            let data_type = binlog_type.data_type;

            let unsigned = if is_numeric(data_type) {
                let flag = metadata
                    .signedness
                    .as_ref()
                    .and_then(|flags| flags.get(numeric_index))
                    .copied()
                    .unwrap_or(false);
                numeric_index += 1;
                flag
            } else {
                false
            };

            let members = if matches!(data_type, DataType::Enum | DataType::Set) {
                let members = metadata
                    .enum_and_set_values
                    .as_ref()
                    .and_then(|values| values.get(enum_set_index))
                    .cloned()
                    .unwrap_or_default();
                enum_set_index += 1;
                members
            } else {
                Vec::new()
            };

            let name = names
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("col_{i}"));
            let declaration = declaration(&binlog_type, unsigned, &members);
            let mut column = ColumnSchema::new(
                name,
                data_type,
                declaration,
                metadata.nullability.get(i).copied().unwrap_or(true),
                metadata.primary_key.contains(&i),
            );
            column.collation = collation_id.map(collation_label);
            column.max_length = binlog_type.length.map(u64::from);
            column
        })
        .collect();

    TableSchema::new(FullTableName::new(namespace, table), columns)
}

fn is_numeric(data_type: DataType) -> bool {
    data_type.is_integer()
        || matches!(
            data_type,
            DataType::Decimal | DataType::Float | DataType::Double
        )
}

/// Column declaration in `COLUMN_TYPE` form, e.g. `binary(10)`,
/// `int unsigned` or `set('a','b')`.
fn declaration(binlog_type: &BinlogColumnType, unsigned: bool, members: &[String]) -> String {
    let data_type = binlog_type.data_type;
    let mut declaration = data_type.keyword().to_string();
    match data_type {
        DataType::Decimal => {
            if let Some((precision, scale)) = binlog_type.precision_scale {
                declaration.push_str(&format!("({precision},{scale})"));
            }
        }
        DataType::Char
        | DataType::VarChar
        | DataType::Binary
        | DataType::VarBinary
        | DataType::Bit => {
            if let Some(length) = binlog_type.length {
                declaration.push_str(&format!("({length})"));
            }
        }
        DataType::Enum | DataType::Set => {
            let quoted: Vec<String> = members
                .iter()
                .map(|m| format!("'{}'", m.replace('\'', "''")))
                .collect();
            declaration.push_str(&format!("({})", quoted.join(",")));
        }
        _ => {}
    }
    if unsigned {
        declaration.push_str(" unsigned");
    }
    declaration
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::TableRef;
    use crate::schema::StaticSchemaSource;
    use mysql_types::type_code;

    fn full_metadata() -> TableMapMetadata {
        TableMapMetadata {
            column_types: vec![
                type_code::LONG,
                type_code::VARCHAR,
                type_code::STRING,
                type_code::STRING,
                type_code::BLOB,
                type_code::STRING,
            ],
            // STRING meta packs the real type in the high byte
            column_meta: vec![0, 40, (0xfe << 8) | 10, (0xf8 << 8) | 1, 2, (0xf7 << 8) | 1],
            nullability: vec![false, true, true, true, true, true],
            column_names: Some(
                ["id", "name", "code", "tags", "body", "size"]
                    .map(String::from)
                    .to_vec(),
            ),
            signedness: Some(vec![true]),
            primary_key: vec![0],
            column_charsets: Some(vec![8, 63, 45]),
            enum_set_column_charsets: Some(vec![33]),
            default_charset: None,
            enum_set_default_charset: Some(45),
            enum_and_set_values: Some(vec![
                vec!["red".into(), "green".into()],
                vec!["s".into(), "m".into(), "l".into()],
            ]),
        }
    }

    #[test]
    fn test_collation_cursors_advance_per_category() {
        let schema = schema_from_metadata("shop", "items", &full_metadata());
        let columns = &schema.columns;

        assert_eq!(columns[0].column_type, "int unsigned");
        assert!(columns[0].primary);
        assert!(!columns[0].nullable);
        assert_eq!(columns[0].collation, None);

        assert_eq!(columns[1].data_type, DataType::VarChar);
        assert_eq!(columns[1].collation.as_deref(), Some("latin1_swedish_ci"));

        // second character column takes the second entry: binary
        assert_eq!(columns[2].data_type, DataType::Binary);
        assert_eq!(columns[2].column_type, "binary(10)");

        // the SET column draws from the enum/set list, not the character list
        assert_eq!(columns[3].data_type, DataType::Set);
        assert_eq!(columns[3].column_type, "set('red','green')");
        assert_eq!(columns[3].collation.as_deref(), Some("utf8_general_ci"));

        assert_eq!(columns[4].data_type, DataType::Text);
        assert_eq!(columns[4].collation.as_deref(), Some("utf8mb4_general_ci"));

        // enum/set list exhausted: default enum/set charset
        assert_eq!(columns[5].data_type, DataType::Enum);
        assert_eq!(columns[5].column_type, "enum('s','m','l')");
        assert_eq!(columns[5].collation.as_deref(), Some("utf8mb4_general_ci"));
    }

    #[test]
    fn test_exhausted_list_without_default_is_binary() {
        let mut metadata = full_metadata();
        metadata.column_charsets = Some(vec![8]);
        let schema = schema_from_metadata("shop", "items", &metadata);
        assert_eq!(schema.columns[2].data_type, DataType::Binary);
        assert_eq!(schema.columns[4].data_type, DataType::Blob);
        assert_eq!(schema.columns[4].collation.as_deref(), Some("binary"));
    }

    #[test]
    fn test_missing_list_uses_default_or_nothing() {
        let mut metadata = full_metadata();
        metadata.column_charsets = None;
        metadata.default_charset = Some(255);
        metadata.enum_set_column_charsets = None;
        metadata.enum_set_default_charset = None;
        let schema = schema_from_metadata("shop", "items", &metadata);
        assert_eq!(
            schema.columns[1].collation.as_deref(),
            Some("utf8mb4_0900_ai_ci")
        );
        assert_eq!(schema.columns[2].data_type, DataType::Char);
        assert_eq!(schema.columns[3].collation, None);
    }

    #[test]
    fn test_bit_and_decimal_declarations() {
        let metadata = TableMapMetadata {
            column_types: vec![type_code::BIT, type_code::NEWDECIMAL],
            column_meta: vec![5, (10 << 8) | 2],
            column_names: Some(vec!["flags".into(), "price".into()]),
            signedness: Some(vec![false]),
            ..Default::default()
        };
        let schema = schema_from_metadata("shop", "t", &metadata);
        assert_eq!(schema.columns[0].column_type, "bit(5)");
        assert_eq!(schema.columns[1].column_type, "decimal(10,2)");
        assert_eq!(schema.columns[1].declared_scale(), Some(2));
    }

    fn live_orders() -> TableSchema {
        let mut schema = TableSchema::new(
            FullTableName::new("shop", "orders"),
            vec![
                ColumnSchema::new("id", DataType::Int, "int(11)", false, true),
                ColumnSchema::new("note", DataType::VarChar, "varchar(20)", true, false)
                    .with_collation("utf8mb4_general_ci"),
            ],
        );
        schema.create_statement = Some("CREATE TABLE `orders` (`id` int, `note` varchar(20))".into());
        schema
    }

    #[tokio::test]
    async fn test_unknown_table_id_is_fatal() {
        let registry = SchemaRegistry::new(Arc::new(StaticSchemaSource::new()), None);
        let err = registry
            .resolve(99, &Position::new("mysql-bin.000001", 400))
            .unwrap_err();
        assert!(matches!(err, ShardError::UnknownSchema { table_id: 99, .. }));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_announce_falls_back_to_live_source_and_shadows() {
        let source = Arc::new(StaticSchemaSource::new().with_table(live_orders()));
        let mut registry = SchemaRegistry::new(source.clone(), Some("shop".into()));

        let metadata = TableMapMetadata {
            column_types: vec![type_code::LONG, type_code::VARCHAR],
            ..Default::default()
        };
        let schema = registry
            .on_table_announce(7, "shop", "orders", &metadata)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(schema.columns.len(), 2);
        assert!(registry.resolve(7, &Position::default()).is_ok());
        assert!(source
            .shadow_tables()
            .contains_key(&FullTableName::new("shop", "orders")));

        // second announcement is served from the cache
        registry
            .on_table_announce(8, "shop", "orders", &metadata)
            .await
            .unwrap();
        assert_eq!(source.lookups().len(), 1);
    }

    #[tokio::test]
    async fn test_announce_column_count_mismatch_is_an_error() {
        let source = Arc::new(StaticSchemaSource::new().with_table(live_orders()));
        let mut registry = SchemaRegistry::new(source, None);
        let metadata = TableMapMetadata {
            column_types: vec![type_code::LONG],
            ..Default::default()
        };
        let err = registry
            .on_table_announce(7, "shop", "orders", &metadata)
            .await
            .unwrap_err();
        assert!(matches!(err, ShardError::Schema(_)));
    }

    #[tokio::test]
    async fn test_other_namespaces_are_ignored() {
        let mut registry = SchemaRegistry::new(Arc::new(StaticSchemaSource::new()), Some("shop".into()));
        let result = registry
            .on_table_announce(3, "audit", "log", &full_metadata())
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(registry.is_ignored(3));

        registry
            .on_table_announce(3, "shop", "items", &full_metadata())
            .await
            .unwrap();
        assert!(!registry.is_ignored(3));
        assert_eq!(registry.snapshot().tables[&3], FullTableName::new("shop", "items"));
    }

    #[tokio::test]
    async fn test_ddl_invalidates_and_refreshes() {
        let source = Arc::new(StaticSchemaSource::new().with_table(live_orders()));
        let mut registry = SchemaRegistry::new(source.clone(), Some("shop".into()));
        registry
            .on_table_announce(7, "shop", "orders", &TableMapMetadata::default())
            .await
            .unwrap();

        let mut altered = live_orders();
        altered
            .columns
            .push(ColumnSchema::new("total", DataType::Decimal, "decimal(10,2)", true, false));
        source.insert(altered);

        let orders = TableRef {
            namespace: None,
            table: "orders".into(),
        };
        let affected = registry
            .on_ddl("shop", &TableDdl::Alter(orders.clone()))
            .await
            .unwrap();
        assert_eq!(affected, vec![FullTableName::new("shop", "orders")]);
        assert!(registry.resolve(7, &Position::default()).is_err());
        let refreshed = registry
            .resolve_from_live_source("shop", "orders")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.columns.len(), 3);

        registry.on_ddl("shop", &TableDdl::Drop(vec![orders])).await.unwrap();
        assert!(registry.snapshot().live_cached.is_empty());
    }

    #[tokio::test]
    async fn test_ddl_outside_replicated_namespace_is_ignored() {
        let source = Arc::new(StaticSchemaSource::new());
        let mut registry = SchemaRegistry::new(source.clone(), Some("shop".into()));
        let ddl = TableDdl::Create(TableRef {
            namespace: Some("audit".into()),
            table: "log".into(),
        });
        assert!(registry.on_ddl("shop", &ddl).await.unwrap().is_empty());
        assert!(source.lookups().is_empty());
    }
}
