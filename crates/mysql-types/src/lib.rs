//! MySQL column types and binlog cell decoding.
//!
//! This crate turns raw row-image cells into the exact text the MySQL server
//! would print for them, given the column's schema.
//!
//! # Structure
//!
//! - `schema`: column/table model and `TABLE_MAP` type-code mapping
//! - `cell`: raw cell values
//! - `decode`: per-type rendering rules
//! - `json`: MySQL binary JSON decoding
//! - `collation`: collation id lookup
//!
//! # Example
//!
//! ```
//! use mysql_types::{decode, Cell, ColumnSchema};
//!
//! let column = ColumnSchema::from_declaration("n", "tinyint(3) unsigned");
//! assert_eq!(decode(&Cell::Int(-1), &column, None).unwrap().as_deref(), Some("255"));
//! ```

pub mod cell;
pub mod collation;
pub mod decode;
pub mod error;
pub mod json;
pub mod schema;

pub use cell::Cell;
pub use collation::{collation_label, collation_name, is_latin1};
pub use decode::decode;
pub use error::{DecodeError, Result};
pub use json::{binary_json_to_string, decode_binary_json};
pub use schema::{
    extract_length_from_column_type, extract_set_or_enum_values, type_code, BinlogColumnType,
    CharsetCategory, ColumnSchema, DataType, FullTableName, TableSchema, BINARY_COLLATION_ID,
};
