//! Error types for cell decoding.

use thiserror::Error;

use crate::schema::DataType;

/// Errors raised while turning a raw binlog cell into its canonical text.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Column '{column}' of type {data_type} cannot hold a {found} cell")]
    TypeMismatch {
        column: String,
        data_type: DataType,
        found: &'static str,
    },

    #[error("Invalid binary JSON: {0}")]
    InvalidJson(String),

    #[error("Epoch milliseconds {0} are out of range")]
    TimestampOutOfRange(i64),
}

/// Result type for decoding operations.
pub type Result<T> = std::result::Result<T, DecodeError>;
