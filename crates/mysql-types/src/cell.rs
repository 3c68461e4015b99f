//! Raw cell values as they come out of a binlog row image.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One column value from a row image, before schema-aware rendering.
///
/// Integer columns of every width arrive as the stored signed bit pattern;
/// the decoder reinterprets them for unsigned declarations. ENUM cells hold
/// the 1-based member index and SET cells the member bitmask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Cell {
    Null,
    Int(i64),
    Float(f32),
    Double(f64),
    Decimal(Decimal),
    /// Character, binary, blob and binary JSON payloads.
    Bytes(Vec<u8>),
    /// BIT value; bit `i` of the mask is bit `i` of the column.
    Bits(u64),
    /// DATE/TIME/DATETIME/TIMESTAMP as milliseconds since the Unix epoch (UTC).
    EpochMillis(i64),
    /// Already-rendered text, passed through unchanged.
    Text(String),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Cell::Null => "null",
            Cell::Int(_) => "int",
            Cell::Float(_) => "float",
            Cell::Double(_) => "double",
            Cell::Decimal(_) => "decimal",
            Cell::Bytes(_) => "bytes",
            Cell::Bits(_) => "bits",
            Cell::EpochMillis(_) => "epoch_millis",
            Cell::Text(_) => "text",
        }
    }
}

/// Generic rendering used for types without a dedicated rule.
impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => f.write_str("null"),
            Cell::Int(v) => write!(f, "{v}"),
            Cell::Float(v) => write!(f, "{v}"),
            Cell::Double(v) => write!(f, "{v}"),
            Cell::Decimal(v) => write!(f, "{v}"),
            Cell::Bytes(v) => f.write_str(&String::from_utf8_lossy(v)),
            Cell::Bits(v) => write!(f, "{v:b}"),
            Cell::EpochMillis(v) => write!(f, "{v}"),
            Cell::Text(v) => f.write_str(v),
        }
    }
}
