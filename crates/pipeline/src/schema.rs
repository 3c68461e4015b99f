//! Live schema sources
//!
//! The registry falls back to a live source when binlog metadata is not
//! enough to describe a table, and after CREATE/ALTER statements. A source
//! can also keep a shadow copy of each table definition by replaying its
//! creation statement, so that later lookups survive the original table being
//! altered or dropped upstream.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use mysql_async::{prelude::*, Pool, Row};
use mysql_types::{ColumnSchema, DataType, FullTableName, TableSchema};
use tracing::{debug, info};

/// External metadata store consulted by the schema registry.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// Current layout of `namespace.table`, `None` if the table does not exist.
    async fn lookup_live_schema(&self, namespace: &str, table: &str)
        -> Result<Option<TableSchema>>;

    /// Materialize a shadow definition of the table from `ddl` unless one
    /// already exists.
    async fn ensure_shadow_table(&self, namespace: &str, table: &str, ddl: &str) -> Result<()>;
}

/// Schema source backed by a MySQL server's `INFORMATION_SCHEMA`.
pub struct MySqlSchemaSource {
    pool: Pool,
    shadow_database: Option<String>,
}

impl MySqlSchemaSource {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            shadow_database: None,
        }
    }

    pub fn from_url(url: &str) -> Result<Self> {
        let pool = Pool::from_url(url).context("Failed to create MySQL pool")?;
        Ok(Self::new(pool))
    }

    /// Replay creation statements into `database` (created on demand).
    pub fn with_shadow_database(mut self, database: impl Into<String>) -> Self {
        self.shadow_database = Some(database.into());
        self
    }
}

#[async_trait]
impl SchemaSource for MySqlSchemaSource {
    async fn lookup_live_schema(
        &self,
        namespace: &str,
        table: &str,
    ) -> Result<Option<TableSchema>> {
        let mut conn = self.pool.get_conn().await?;

        let columns_query = "
            SELECT COLUMN_NAME, DATA_TYPE, COLUMN_TYPE, IS_NULLABLE, COLUMN_KEY,
                   COLLATION_NAME, CHARACTER_MAXIMUM_LENGTH, COLUMN_DEFAULT
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION";

        let rows: Vec<Row> = conn.exec(columns_query, (namespace, table)).await?;
        if rows.is_empty() {
            debug!("No live schema for {namespace}.{table}");
            return Ok(None);
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            columns.push(column_from_row(&row)?);
        }

        let create: Option<(String, String)> = conn
            .query_first(format!(
                "SHOW CREATE TABLE {}.{}",
                quote_identifier(namespace),
                quote_identifier(table)
            ))
            .await
            .with_context(|| format!("SHOW CREATE TABLE failed for {namespace}.{table}"))?;

        let mut schema = TableSchema::new(FullTableName::new(namespace, table), columns);
        schema.create_statement = create.map(|(_, ddl)| ddl);
        Ok(Some(schema))
    }

    async fn ensure_shadow_table(&self, namespace: &str, table: &str, ddl: &str) -> Result<()> {
        let Some(shadow) = &self.shadow_database else {
            return Ok(());
        };
        let mut conn = self.pool.get_conn().await?;

        conn.query_drop(format!(
            "CREATE DATABASE IF NOT EXISTS {}",
            quote_identifier(shadow)
        ))
        .await?;

        let shadow_table = shadow_table_name(namespace, table);
        let existing: Vec<String> = conn
            .exec(
                "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
                (shadow.as_str(), shadow_table.as_str()),
            )
            .await?;
        if !existing.is_empty() {
            return Ok(());
        }

        let statement = rename_created_table(ddl, &shadow_table).with_context(|| {
            format!("Cannot rewrite creation statement of {namespace}.{table} for shadowing")
        })?;
        conn.query_drop(format!("USE {}", quote_identifier(shadow)))
            .await?;
        conn.query_drop(statement)
            .await
            .with_context(|| format!("Failed to create shadow table {shadow}.{shadow_table}"))?;

        info!("Created shadow table {shadow}.{shadow_table} for {namespace}.{table}");
        Ok(())
    }
}

fn column_from_row(row: &Row) -> Result<ColumnSchema> {
    let name: String = row
        .get(0)
        .ok_or_else(|| anyhow::anyhow!("Missing column name"))?;
    let data_type: String = row
        .get(1)
        .ok_or_else(|| anyhow::anyhow!("Missing data type"))?;
    let column_type: String = row
        .get(2)
        .ok_or_else(|| anyhow::anyhow!("Missing column type"))?;
    let is_nullable: String = row
        .get(3)
        .ok_or_else(|| anyhow::anyhow!("Missing nullability"))?;
    let column_key: String = row.get::<Option<String>, _>(4).unwrap_or(None).unwrap_or_default();
    let collation: Option<String> = row.get::<Option<String>, _>(5).unwrap_or(None);
    let max_length: Option<u64> = row.get::<Option<u64>, _>(6).unwrap_or(None);
    let default_value: Option<String> = row.get::<Option<String>, _>(7).unwrap_or(None);

    let mut column = ColumnSchema::new(
        name,
        DataType::from_mysql_name(&data_type),
        column_type,
        is_nullable.eq_ignore_ascii_case("YES"),
        column_key == "PRI",
    );
    column.collation = collation;
    column.max_length = max_length;
    column.default_value = default_value;
    Ok(column)
}

fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Name of the shadow copy of `namespace.table`.
pub fn shadow_table_name(namespace: &str, table: &str) -> String {
    format!("{namespace}__{table}")
}

/// Rewrite the table name of a `CREATE TABLE` statement.
fn rename_created_table(ddl: &str, new_name: &str) -> Option<String> {
    let lower = ddl.to_ascii_lowercase();
    let table_kw = lower.find("table")?;
    let mut rest = table_kw + "table".len();
    let after = lower[rest..].trim_start();
    rest += lower[rest..].len() - after.len();
    if after.starts_with("if not exists") {
        rest += "if not exists".len();
        rest += lower[rest..].len() - lower[rest..].trim_start().len();
    }
    let name_end = ddl[rest..]
        .find(|c: char| c == '(' || c.is_whitespace())
        .map(|i| rest + i)?;
    Some(format!(
        "{}{}{}",
        &ddl[..rest],
        quote_identifier(new_name),
        &ddl[name_end..]
    ))
}

/// In-memory schema source for replay runs and tests.
#[derive(Default)]
pub struct StaticSchemaSource {
    tables: Mutex<HashMap<FullTableName, TableSchema>>,
    shadows: Mutex<HashMap<FullTableName, String>>,
    lookups: Mutex<Vec<FullTableName>>,
}

impl StaticSchemaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, schema: TableSchema) -> Self {
        self.insert(schema);
        self
    }

    /// Add or replace a table, as a DDL statement upstream would.
    pub fn insert(&self, schema: TableSchema) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.insert(schema.name.clone(), schema);
        }
    }

    pub fn remove(&self, name: &FullTableName) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.remove(name);
        }
    }

    /// Creation statements replayed as shadow tables, by table.
    pub fn shadow_tables(&self) -> HashMap<FullTableName, String> {
        self.shadows.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Every live lookup made so far, oldest first.
    pub fn lookups(&self) -> Vec<FullTableName> {
        self.lookups.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SchemaSource for StaticSchemaSource {
    async fn lookup_live_schema(
        &self,
        namespace: &str,
        table: &str,
    ) -> Result<Option<TableSchema>> {
        let name = FullTableName::new(namespace, table);
        if let Ok(mut lookups) = self.lookups.lock() {
            lookups.push(name.clone());
        }
        let tables = self
            .tables
            .lock()
            .map_err(|_| anyhow::anyhow!("schema table lock poisoned"))?;
        Ok(tables.get(&name).cloned())
    }

    async fn ensure_shadow_table(&self, namespace: &str, table: &str, ddl: &str) -> Result<()> {
        let mut shadows = self
            .shadows
            .lock()
            .map_err(|_| anyhow::anyhow!("shadow table lock poisoned"))?;
        shadows
            .entry(FullTableName::new(namespace, table))
            .or_insert_with(|| ddl.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_created_table() {
        assert_eq!(
            rename_created_table("CREATE TABLE `orders` (\n  `id` int\n)", "shop__orders")
                .unwrap(),
            "CREATE TABLE `shop__orders` (\n  `id` int\n)"
        );
        assert_eq!(
            rename_created_table("create table if not exists orders(id int)", "x").unwrap(),
            "create table if not exists `x`(id int)"
        );
        assert!(rename_created_table("SELECT 1", "x").is_none());
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("a`b"), "`a``b`");
        assert_eq!(shadow_table_name("shop", "orders"), "shop__orders");
    }

    #[tokio::test]
    async fn test_static_source_lookup_and_shadow() {
        let schema = TableSchema::new(
            FullTableName::new("shop", "orders"),
            vec![ColumnSchema::new("id", DataType::Int, "int(11)", false, true)],
        );
        let source = StaticSchemaSource::new().with_table(schema.clone());

        assert_eq!(
            source.lookup_live_schema("shop", "orders").await.unwrap(),
            Some(schema)
        );
        assert_eq!(source.lookup_live_schema("shop", "gone").await.unwrap(), None);
        assert_eq!(source.lookups().len(), 2);

        source
            .ensure_shadow_table("shop", "orders", "CREATE TABLE orders (id int)")
            .await
            .unwrap();
        source
            .ensure_shadow_table("shop", "orders", "CREATE TABLE orders (id bigint)")
            .await
            .unwrap();
        assert_eq!(
            source.shadow_tables()[&FullTableName::new("shop", "orders")],
            "CREATE TABLE orders (id int)"
        );
    }
}
