//! MySQL column and table schema model.
//!
//! Columns come from two places: the binlog `TABLE_MAP` event (type codes plus
//! optional metadata) and `INFORMATION_SCHEMA.COLUMNS` of a live server. Both
//! paths end up as a [`ColumnSchema`] carrying a [`DataType`] and a lowercase
//! raw declaration such as `int(10) unsigned` or `enum('a','b')`, which is
//! what the decoder inspects for width, signedness and enum/set members.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Collation id MySQL uses for the `binary` character set.
pub const BINARY_COLLATION_ID: u32 = 63;

/// Logical MySQL column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    TinyInt,
    SmallInt,
    MediumInt,
    Int,
    BigInt,
    Decimal,
    Float,
    Double,
    Char,
    VarChar,
    TinyText,
    Text,
    MediumText,
    LongText,
    Binary,
    VarBinary,
    TinyBlob,
    Blob,
    MediumBlob,
    LongBlob,
    Date,
    Time,
    DateTime,
    Timestamp,
    Year,
    Enum,
    Set,
    Bit,
    Json,
    Geometry,
    Unknown,
}

/// Which collation list a column draws its charset from in `TABLE_MAP`
/// metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharsetCategory {
    /// CHAR/VARCHAR/TEXT/BINARY/BLOB family: the column-charset list.
    Character,
    /// ENUM/SET: the enum-and-set column-charset list.
    EnumOrSet,
    /// Columns without a character set.
    None,
}

impl DataType {
    /// Map an `INFORMATION_SCHEMA.COLUMNS.DATA_TYPE` value.
    pub fn from_mysql_name(data_type: &str) -> Self {
        match data_type.to_uppercase().as_str() {
            "TINYINT" | "BOOL" | "BOOLEAN" => DataType::TinyInt,
            "SMALLINT" => DataType::SmallInt,
            "MEDIUMINT" => DataType::MediumInt,
            "INT" | "INTEGER" => DataType::Int,
            "BIGINT" => DataType::BigInt,
            "DECIMAL" | "NUMERIC" | "NEWDECIMAL" => DataType::Decimal,
            "FLOAT" => DataType::Float,
            "DOUBLE" | "REAL" => DataType::Double,
            "CHAR" => DataType::Char,
            "VARCHAR" => DataType::VarChar,
            "TINYTEXT" => DataType::TinyText,
            "TEXT" => DataType::Text,
            "MEDIUMTEXT" => DataType::MediumText,
            "LONGTEXT" => DataType::LongText,
            "BINARY" => DataType::Binary,
            "VARBINARY" => DataType::VarBinary,
            "TINYBLOB" => DataType::TinyBlob,
            "BLOB" => DataType::Blob,
            "MEDIUMBLOB" => DataType::MediumBlob,
            "LONGBLOB" => DataType::LongBlob,
            "DATE" | "NEWDATE" => DataType::Date,
            "TIME" | "TIME_V2" => DataType::Time,
            "DATETIME" | "DATETIME_V2" => DataType::DateTime,
            "TIMESTAMP" | "TIMESTAMP_V2" => DataType::Timestamp,
            "YEAR" => DataType::Year,
            "ENUM" => DataType::Enum,
            "SET" => DataType::Set,
            "BIT" => DataType::Bit,
            "JSON" => DataType::Json,
            "GEOMETRY" | "POINT" | "LINESTRING" | "POLYGON" | "MULTIPOINT" | "MULTILINESTRING"
            | "MULTIPOLYGON" | "GEOMETRYCOLLECTION" => DataType::Geometry,
            _ => DataType::Unknown,
        }
    }

    /// Lowercase MySQL keyword for this type.
    pub fn keyword(&self) -> &'static str {
        match self {
            DataType::TinyInt => "tinyint",
            DataType::SmallInt => "smallint",
            DataType::MediumInt => "mediumint",
            DataType::Int => "int",
            DataType::BigInt => "bigint",
            DataType::Decimal => "decimal",
            DataType::Float => "float",
            DataType::Double => "double",
            DataType::Char => "char",
            DataType::VarChar => "varchar",
            DataType::TinyText => "tinytext",
            DataType::Text => "text",
            DataType::MediumText => "mediumtext",
            DataType::LongText => "longtext",
            DataType::Binary => "binary",
            DataType::VarBinary => "varbinary",
            DataType::TinyBlob => "tinyblob",
            DataType::Blob => "blob",
            DataType::MediumBlob => "mediumblob",
            DataType::LongBlob => "longblob",
            DataType::Date => "date",
            DataType::Time => "time",
            DataType::DateTime => "datetime",
            DataType::Timestamp => "timestamp",
            DataType::Year => "year",
            DataType::Enum => "enum",
            DataType::Set => "set",
            DataType::Bit => "bit",
            DataType::Json => "json",
            DataType::Geometry => "geometry",
            DataType::Unknown => "unknown",
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DataType::TinyInt
                | DataType::SmallInt
                | DataType::MediumInt
                | DataType::Int
                | DataType::BigInt
        )
    }

    pub fn is_text(&self) -> bool {
        matches!(
            self,
            DataType::Char
                | DataType::VarChar
                | DataType::TinyText
                | DataType::Text
                | DataType::MediumText
                | DataType::LongText
        )
    }

    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            DataType::Binary
                | DataType::VarBinary
                | DataType::TinyBlob
                | DataType::Blob
                | DataType::MediumBlob
                | DataType::LongBlob
        )
    }

    pub fn charset_category(&self) -> CharsetCategory {
        if self.is_text() || self.is_binary() {
            CharsetCategory::Character
        } else if matches!(self, DataType::Enum | DataType::Set) {
            CharsetCategory::EnumOrSet
        } else {
            CharsetCategory::None
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.keyword().to_uppercase())
    }
}

/// Binlog column type codes (`enum_field_types`).
pub mod type_code {
    pub const DECIMAL: u8 = 0;
    pub const TINY: u8 = 1;
    pub const SHORT: u8 = 2;
    pub const LONG: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const NULL: u8 = 6;
    pub const TIMESTAMP: u8 = 7;
    pub const LONGLONG: u8 = 8;
    pub const INT24: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const DATETIME: u8 = 12;
    pub const YEAR: u8 = 13;
    pub const NEWDATE: u8 = 14;
    pub const VARCHAR: u8 = 15;
    pub const BIT: u8 = 16;
    pub const TIMESTAMP2: u8 = 17;
    pub const DATETIME2: u8 = 18;
    pub const TIME2: u8 = 19;
    pub const JSON: u8 = 245;
    pub const NEWDECIMAL: u8 = 246;
    pub const ENUM: u8 = 247;
    pub const SET: u8 = 248;
    pub const TINY_BLOB: u8 = 249;
    pub const MEDIUM_BLOB: u8 = 250;
    pub const LONG_BLOB: u8 = 251;
    pub const BLOB: u8 = 252;
    pub const VAR_STRING: u8 = 253;
    pub const STRING: u8 = 254;
    pub const GEOMETRY: u8 = 255;
}

/// Column type as announced by a `TABLE_MAP` event, before collation is known.
///
/// `STRING` columns carry their real type (`ENUM`/`SET`) and length packed in
/// the metadata word, so both the type code and the metadata are needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogColumnType {
    pub data_type: DataType,
    /// Declared length/width where the metadata carries one.
    pub length: Option<u32>,
    /// Decimal precision and scale.
    pub precision_scale: Option<(u32, u32)>,
}

impl BinlogColumnType {
    pub fn from_code(code: u8, meta: u16) -> Self {
        use type_code::*;

        let plain = |data_type| BinlogColumnType {
            data_type,
            length: None,
            precision_scale: None,
        };

        match code {
            DECIMAL | NEWDECIMAL => BinlogColumnType {
                data_type: DataType::Decimal,
                length: None,
                precision_scale: Some(((meta >> 8) as u32, (meta & 0xff) as u32)),
            },
            TINY => plain(DataType::TinyInt),
            SHORT => plain(DataType::SmallInt),
            INT24 => plain(DataType::MediumInt),
            LONG => plain(DataType::Int),
            LONGLONG => plain(DataType::BigInt),
            FLOAT => plain(DataType::Float),
            DOUBLE => plain(DataType::Double),
            TIMESTAMP | TIMESTAMP2 => plain(DataType::Timestamp),
            DATE | NEWDATE => plain(DataType::Date),
            TIME | TIME2 => plain(DataType::Time),
            DATETIME | DATETIME2 => plain(DataType::DateTime),
            YEAR => plain(DataType::Year),
            BIT => BinlogColumnType {
                data_type: DataType::Bit,
                length: Some((meta >> 8) as u32 * 8 + (meta & 0xff) as u32),
                precision_scale: None,
            },
            JSON => plain(DataType::Json),
            ENUM => plain(DataType::Enum),
            SET => plain(DataType::Set),
            TINY_BLOB => plain(DataType::TinyBlob),
            MEDIUM_BLOB => plain(DataType::MediumBlob),
            LONG_BLOB => plain(DataType::LongBlob),
            BLOB => plain(DataType::Blob),
            VARCHAR | VAR_STRING => BinlogColumnType {
                data_type: DataType::VarChar,
                length: Some(meta as u32),
                precision_scale: None,
            },
            STRING => {
                let (real_type, length) = unpack_string_meta(meta);
                let data_type = match real_type {
                    ENUM => DataType::Enum,
                    SET => DataType::Set,
                    _ => DataType::Char,
                };
                BinlogColumnType {
                    data_type,
                    length: Some(length),
                    precision_scale: None,
                }
            }
            GEOMETRY => plain(DataType::Geometry),
            _ => plain(DataType::Unknown),
        }
    }

    /// Refine character/blob types once the column collation is known:
    /// the binary collation turns CHAR into BINARY and VARCHAR into VARBINARY,
    /// and a BLOB with a character collation is really a TEXT column.
    pub fn with_collation(mut self, collation_id: Option<u32>) -> Self {
        let Some(id) = collation_id else {
            return self;
        };
        let binary = id == BINARY_COLLATION_ID;
        self.data_type = match (self.data_type, binary) {
            (DataType::Char, true) => DataType::Binary,
            (DataType::VarChar, true) => DataType::VarBinary,
            (DataType::TinyBlob, false) => DataType::TinyText,
            (DataType::Blob, false) => DataType::Text,
            (DataType::MediumBlob, false) => DataType::MediumText,
            (DataType::LongBlob, false) => DataType::LongText,
            (other, _) => other,
        };
        self
    }
}

/// Split the metadata word of a `STRING` column into its real type and length.
fn unpack_string_meta(meta: u16) -> (u8, u32) {
    let byte0 = (meta >> 8) as u8;
    let byte1 = (meta & 0xff) as u32;
    if byte0 & 0x30 != 0x30 {
        let real_type = byte0 | 0x30;
        let length = byte1 | ((((byte0 & 0x30) ^ 0x30) as u32) << 4);
        (real_type, length)
    } else {
        (byte0, byte1)
    }
}

/// Namespace-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FullTableName {
    pub namespace: String,
    pub table: String,
}

impl FullTableName {
    pub fn new(namespace: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for FullTableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.table)
    }
}

/// One column of a table, in physical order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: DataType,
    /// Raw declaration, e.g. `varchar(255)` or `int(10) unsigned`.
    pub column_type: String,
    pub nullable: bool,
    pub primary: bool,
    pub collation: Option<String>,
    pub max_length: Option<u64>,
    pub default_value: Option<String>,
}

impl ColumnSchema {
    pub fn new(
        name: impl Into<String>,
        data_type: DataType,
        column_type: impl Into<String>,
        nullable: bool,
        primary: bool,
    ) -> Self {
        Self {
            name: name.into(),
            data_type,
            column_type: column_type.into(),
            nullable,
            primary,
            collation: None,
            max_length: None,
            default_value: None,
        }
    }

    /// Build a column from a declaration alone, e.g. `("id", "bigint unsigned")`.
    pub fn from_declaration(name: impl Into<String>, column_type: &str) -> Self {
        let keyword = column_type
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or_default();
        Self::new(
            name,
            DataType::from_mysql_name(keyword),
            column_type,
            true,
            false,
        )
    }

    pub fn with_collation(mut self, collation: impl Into<String>) -> Self {
        self.collation = Some(collation.into());
        self
    }

    pub fn with_max_length(mut self, max_length: u64) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn is_unsigned(&self) -> bool {
        self.column_type.to_ascii_lowercase().contains("unsigned")
    }

    /// First number inside the declaration's parentheses.
    pub fn declared_width(&self) -> Option<u32> {
        extract_length_from_column_type(&self.column_type)
    }

    /// Scale of a `decimal(p,s)` declaration.
    pub fn declared_scale(&self) -> Option<u32> {
        let start = self.column_type.find('(')?;
        let end = self.column_type[start..].find(')')? + start;
        let mut parts = self.column_type[start + 1..end].split(',');
        parts.next()?;
        parts.next()?.trim().parse().ok()
    }

    /// Members of an `enum(...)`/`set(...)` declaration, in declaration order.
    pub fn members(&self) -> Vec<String> {
        extract_set_or_enum_values(&self.column_type)
    }
}

/// Column layout of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: FullTableName,
    pub columns: Vec<ColumnSchema>,
    /// `CREATE TABLE` text when known.
    pub create_statement: Option<String>,
}

impl TableSchema {
    pub fn new(name: FullTableName, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name,
            columns,
            create_statement: None,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn primary_key_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.primary)
            .map(|c| c.name.clone())
            .collect()
    }
}

/// Extract length from a MySQL column type string.
///
/// E.g., "varchar(255)" -> Some(255), "int(11)" -> Some(11)
pub fn extract_length_from_column_type(column_type: &str) -> Option<u32> {
    let column_type_lower = column_type.to_lowercase();
    if column_type_lower.starts_with("enum") || column_type_lower.starts_with("set") {
        return None;
    }
    if let Some(start) = column_type_lower.find('(') {
        if let Some(end) = column_type_lower.find(')') {
            if start < end {
                let len_str = &column_type_lower[start + 1..end];
                // DECIMAL(10,2) -> 10
                let first_part = len_str.split(',').next().unwrap_or(len_str);
                return first_part.trim().parse().ok();
            }
        }
    }
    None
}

/// Extract values from a MySQL SET or ENUM column type string.
///
/// E.g., "set('a','b','c')" -> vec!["a", "b", "c"]. Commas inside quotes and
/// doubled quotes (`'it''s'`) are handled.
pub fn extract_set_or_enum_values(column_type: &str) -> Vec<String> {
    let mut values = Vec::new();
    let (Some(start), Some(end)) = (column_type.find('('), column_type.rfind(')')) else {
        return values;
    };
    if start >= end {
        return values;
    }

    let mut chars = column_type[start + 1..end].chars().peekable();
    let mut current = String::new();
    let mut in_quotes = false;
    while let Some(c) = chars.next() {
        match c {
            '\'' if in_quotes => {
                if chars.peek() == Some(&'\'') {
                    current.push('\'');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '\'' => in_quotes = true,
            ',' if !in_quotes => {
                values.push(std::mem::take(&mut current));
            }
            c if in_quotes => current.push(c),
            _ => {}
        }
    }
    if !current.is_empty() || !values.is_empty() {
        values.push(current);
    }
    values
}
