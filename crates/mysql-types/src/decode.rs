//! Schema-aware rendering of binlog cells to MySQL's canonical text.
//!
//! The output must match what the server itself prints for the value, so
//! each rule below follows server semantics rather than Rust defaults:
//!
//! | Type | Rendering |
//! |---|---|
//! | integer, signed | signed decimal |
//! | integer, unsigned | stored bit pattern reinterpreted at the column width |
//! | DECIMAL | plain decimal at the declared scale |
//! | BINARY(n) | zero-padded to n bytes, lowercase hex |
//! | VARBINARY/BLOB | lowercase hex |
//! | CHAR/VARCHAR/TEXT | Latin-1 for `latin1*` collations, UTF-8 otherwise |
//! | BIT | binary digits, most significant first, `"0"` when empty |
//! | DATE / TIME / DATETIME / TIMESTAMP | UTC, from epoch milliseconds |
//! | ENUM | 1-based member lookup, `None` for index 0 |
//! | SET | set members in declaration order joined by `,`, `None` for 0 |
//! | JSON | binary JSON decoded to compact text |
//! | FLOAT / DOUBLE | shortest round-trip decimal |

use chrono::DateTime;
use rust_decimal::Decimal;

use crate::cell::Cell;
use crate::collation::is_latin1;
use crate::error::{DecodeError, Result};
use crate::json::binary_json_to_string;
use crate::schema::{ColumnSchema, DataType};

/// Render `cell` for `column`.
///
/// `members` overrides the ENUM/SET member list parsed from the column
/// declaration. A null cell is always `Ok(None)`.
pub fn decode(
    cell: &Cell,
    column: &ColumnSchema,
    members: Option<&[String]>,
) -> Result<Option<String>> {
    if let Cell::Null = cell {
        return Ok(None);
    }
    if let Cell::Text(text) = cell {
        return Ok(Some(text.clone()));
    }

    let mismatch = || DecodeError::TypeMismatch {
        column: column.name.clone(),
        data_type: column.data_type,
        found: cell.kind(),
    };

    let rendered = match column.data_type {
        DataType::TinyInt
        | DataType::SmallInt
        | DataType::MediumInt
        | DataType::Int
        | DataType::BigInt => match cell {
            Cell::Int(v) => render_integer(*v, column),
            _ => return Err(mismatch()),
        },

        DataType::Decimal => match cell {
            Cell::Decimal(d) => render_decimal(*d, column),
            Cell::Int(v) => render_decimal(Decimal::from(*v), column),
            _ => return Err(mismatch()),
        },

        DataType::Float => match cell {
            Cell::Float(v) => v.to_string(),
            Cell::Double(v) => (*v as f32).to_string(),
            _ => return Err(mismatch()),
        },
        DataType::Double => match cell {
            Cell::Double(v) => v.to_string(),
            Cell::Float(v) => v.to_string(),
            _ => return Err(mismatch()),
        },

        DataType::Binary => match cell {
            Cell::Bytes(bytes) => {
                let width = column.declared_width().unwrap_or(0) as usize;
                if bytes.len() < width {
                    let mut padded = bytes.clone();
                    padded.resize(width, 0);
                    hex::encode(padded)
                } else {
                    hex::encode(bytes)
                }
            }
            _ => return Err(mismatch()),
        },
        DataType::VarBinary
        | DataType::TinyBlob
        | DataType::Blob
        | DataType::MediumBlob
        | DataType::LongBlob => match cell {
            Cell::Bytes(bytes) => hex::encode(bytes),
            _ => return Err(mismatch()),
        },

        DataType::Char
        | DataType::VarChar
        | DataType::TinyText
        | DataType::Text
        | DataType::MediumText
        | DataType::LongText => match cell {
            Cell::Bytes(bytes) => decode_text(bytes, column.collation.as_deref()),
            _ => return Err(mismatch()),
        },

        DataType::Bit => match cell {
            Cell::Bits(mask) => render_bits(*mask),
            Cell::Int(v) => render_bits(*v as u64),
            _ => return Err(mismatch()),
        },

        DataType::Date => match cell {
            Cell::EpochMillis(ms) => utc(*ms)?.format("%Y-%m-%d").to_string(),
            _ => return Err(mismatch()),
        },
        DataType::Time => match cell {
            Cell::EpochMillis(ms) => utc(*ms)?.format("%H:%M:%S").to_string(),
            _ => return Err(mismatch()),
        },
        DataType::DateTime | DataType::Timestamp => match cell {
            Cell::EpochMillis(ms) => utc(*ms)?.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            _ => return Err(mismatch()),
        },

        DataType::Enum => match cell {
            Cell::Int(index) => {
                return Ok(render_enum(*index, &resolve_members(members, column)))
            }
            _ => return Err(mismatch()),
        },
        DataType::Set => match cell {
            Cell::Int(mask) => {
                return Ok(render_set(*mask as u64, &resolve_members(members, column)))
            }
            _ => return Err(mismatch()),
        },

        DataType::Json => match cell {
            Cell::Bytes(bytes) => binary_json_to_string(bytes)?,
            _ => return Err(mismatch()),
        },

        DataType::Year | DataType::Geometry | DataType::Unknown => cell.to_string(),
    };

    Ok(Some(rendered))
}

fn render_decimal(mut d: Decimal, column: &ColumnSchema) -> String {
    if let Some(scale) = column.declared_scale() {
        if d.scale() != scale {
            d.rescale(scale);
        }
    }
    d.to_string()
}

fn render_integer(v: i64, column: &ColumnSchema) -> String {
    if !column.is_unsigned() {
        return v.to_string();
    }
    match column.data_type {
        DataType::TinyInt => (v as u8).to_string(),
        DataType::SmallInt => (v as u16).to_string(),
        DataType::MediumInt => (v & 0xff_ffff).to_string(),
        DataType::Int => (v as u32).to_string(),
        _ => (v as u64).to_string(),
    }
}

fn decode_text(bytes: &[u8], collation: Option<&str>) -> String {
    match collation {
        // Latin-1 maps each byte to the code point of the same value
        Some(c) if is_latin1(c) => bytes.iter().map(|&b| b as char).collect(),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn render_bits(mask: u64) -> String {
    if mask == 0 {
        return "0".to_string();
    }
    format!("{mask:b}")
}

fn render_enum(index: i64, members: &[String]) -> Option<String> {
    if index <= 0 {
        return None;
    }
    members.get(index as usize - 1).cloned()
}

fn render_set(mask: u64, members: &[String]) -> Option<String> {
    if mask == 0 {
        return None;
    }
    let selected: Vec<&str> = members
        .iter()
        .enumerate()
        .filter(|(i, _)| *i < 64 && (mask >> i) & 1 == 1)
        .map(|(_, m)| m.as_str())
        .collect();
    Some(selected.join(","))
}

fn resolve_members(members: Option<&[String]>, column: &ColumnSchema) -> Vec<String> {
    match members {
        Some(m) => m.to_vec(),
        None => column.members(),
    }
}

fn utc(ms: i64) -> Result<chrono::DateTime<chrono::Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(DecodeError::TimestampOutOfRange(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn col(data_type: DataType, decl: &str) -> ColumnSchema {
        ColumnSchema::new("c", data_type, decl, true, false)
    }

    fn fruit() -> Vec<String> {
        vec!["apple".into(), "banana".into(), "orange".into()]
    }

    fn render(cell: Cell, column: &ColumnSchema) -> Option<String> {
        decode(&cell, column, None).unwrap()
    }

    #[test]
    fn test_null_is_null_for_every_type() {
        for (ty, decl) in [
            (DataType::Int, "int(11)"),
            (DataType::Binary, "binary(10)"),
            (DataType::Json, "json"),
            (DataType::Enum, "enum('a')"),
        ] {
            assert_eq!(render(Cell::Null, &col(ty, decl)), None);
        }
    }

    #[test]
    fn test_signed_integers() {
        assert_eq!(
            render(Cell::Int(-128), &col(DataType::TinyInt, "tinyint(4)")),
            Some("-128".into())
        );
        assert_eq!(
            render(Cell::Int(i64::MIN), &col(DataType::BigInt, "bigint(20)")),
            Some("-9223372036854775808".into())
        );
    }

    #[test]
    fn test_unsigned_integers_reinterpret_stored_bits() {
        let cases = [
            (DataType::TinyInt, "tinyint(3) unsigned", -1, "255"),
            (DataType::SmallInt, "smallint(5) unsigned", -1, "65535"),
            (DataType::MediumInt, "mediumint(9) unsigned", -1, "16777215"),
            (DataType::MediumInt, "mediumint(9) unsigned", -8388608, "8388608"),
            (DataType::Int, "int(10) unsigned", -1, "4294967295"),
            (DataType::BigInt, "bigint(20) unsigned", -1, "18446744073709551615"),
        ];
        for (ty, decl, stored, expected) in cases {
            assert_eq!(
                render(Cell::Int(stored), &col(ty, decl)),
                Some(expected.to_string()),
                "{decl}"
            );
        }
    }

    #[test]
    fn test_decimal_is_plain_at_declared_scale() {
        let column = col(DataType::Decimal, "decimal(5,3)");
        let d = Decimal::from_str("99.122").unwrap();
        assert_eq!(render(Cell::Decimal(d), &column), Some("99.122".into()));
        let d = Decimal::from_str("1.5").unwrap();
        assert_eq!(render(Cell::Decimal(d), &column), Some("1.500".into()));
    }

    #[test]
    fn test_integral_decimal_cell_uses_declared_scale() {
        let column = col(DataType::Decimal, "decimal(5,2)");
        assert_eq!(render(Cell::Int(3), &column), Some("3.00".into()));
        assert_eq!(render(Cell::Int(-12), &column), Some("-12.00".into()));
        let integral = col(DataType::Decimal, "decimal(10)");
        assert_eq!(render(Cell::Int(42), &integral), Some("42".into()));
    }

    #[test]
    fn test_floating_point_shortest_form() {
        assert_eq!(
            render(Cell::Float(99.122), &col(DataType::Float, "float(5,3)")),
            Some("99.122".into())
        );
        assert_eq!(
            render(Cell::Double(99.122), &col(DataType::Double, "double(5,3)")),
            Some("99.122".into())
        );
    }

    #[test]
    fn test_binary_is_zero_padded_lowercase_hex() {
        let column = col(DataType::Binary, "binary(10)");
        assert_eq!(
            render(Cell::Bytes(b"orange".to_vec()), &column),
            Some("6f72616e676500000000".into())
        );
        assert_eq!(
            render(Cell::Bytes(b"Orange".to_vec()), &column),
            Some("4f72616e676500000000".into())
        );
    }

    #[test]
    fn test_varbinary_is_not_padded() {
        let column = col(DataType::VarBinary, "varbinary(10)");
        assert_eq!(
            render(Cell::Bytes(b"orange".to_vec()), &column),
            Some("6f72616e6765".into())
        );
    }

    #[test]
    fn test_text_latin1_collation() {
        let column = col(DataType::Char, "char(30)").with_collation("latin1_swedish_ci");
        let bytes = vec![66, 117, 101, 110, 111, 115, 32, 100, 0xed, 97, 115];
        assert_eq!(render(Cell::Bytes(bytes), &column), Some("Buenos días".into()));
        let bytes = vec![98, 111, 110, 110, 101, 32, 106, 111, 117, 114, 110, 0xe9, 101];
        assert_eq!(render(Cell::Bytes(bytes), &column), Some("bonne journée".into()));
    }

    #[test]
    fn test_text_utf8_collation() {
        let column = col(DataType::VarChar, "varchar(30)").with_collation("utf8_general_ci");
        let bytes = "Buenos días".as_bytes().to_vec();
        assert_eq!(render(Cell::Bytes(bytes), &column), Some("Buenos días".into()));

        let no_collation = col(DataType::MediumText, "mediumtext");
        let bytes = "bonne journée".as_bytes().to_vec();
        assert_eq!(render(Cell::Bytes(bytes), &no_collation), Some("bonne journée".into()));
    }

    #[test]
    fn test_bit_most_significant_first() {
        let column = col(DataType::Bit, "bit(5)");
        let mask = (1 << 0) | (1 << 3) | (1 << 4);
        assert_eq!(render(Cell::Bits(mask), &column), Some("11001".into()));
        assert_eq!(render(Cell::Bits(0), &column), Some("0".into()));
    }

    #[test]
    fn test_date_and_time_types() {
        assert_eq!(
            render(Cell::EpochMillis(1548979200000), &col(DataType::Date, "date")),
            Some("2019-02-01".into())
        );
        for (ty, decl) in [
            (DataType::DateTime, "datetime"),
            (DataType::Timestamp, "timestamp"),
        ] {
            assert_eq!(
                render(Cell::EpochMillis(1548982800123), &col(ty, decl)),
                Some("2019-02-01 01:00:00.123".into())
            );
        }
        assert_eq!(
            render(Cell::EpochMillis(3_723_000), &col(DataType::Time, "time")),
            Some("01:02:03".into())
        );
    }

    #[test]
    fn test_enum_members() {
        let column = col(DataType::Enum, "enum('apple','banana','orange')");
        let members = fruit();
        for (index, expected) in [(1, "apple"), (2, "banana"), (3, "orange")] {
            assert_eq!(
                decode(&Cell::Int(index), &column, Some(&members)).unwrap(),
                Some(expected.to_string())
            );
        }
        assert_eq!(decode(&Cell::Int(0), &column, Some(&members)).unwrap(), None);
        // falls back to the declaration when no member list is supplied
        assert_eq!(render(Cell::Int(2), &column), Some("banana".into()));
    }

    #[test]
    fn test_set_bitmask_in_declaration_order() {
        let column = col(DataType::Set, "set('apple','banana','orange')");
        let members = fruit();
        let expected = [
            (1, "apple"),
            (2, "banana"),
            (3, "apple,banana"),
            (4, "orange"),
            (5, "apple,orange"),
            (6, "banana,orange"),
            (7, "apple,banana,orange"),
        ];
        for (mask, value) in expected {
            assert_eq!(
                decode(&Cell::Int(mask), &column, Some(&members)).unwrap(),
                Some(value.to_string())
            );
        }
        assert_eq!(decode(&Cell::Int(0), &column, Some(&members)).unwrap(), None);
    }

    #[test]
    fn test_json_column() {
        let column = col(DataType::Json, "json");
        let data = vec![0x04, 0x01];
        assert_eq!(render(Cell::Bytes(data), &column), Some("true".into()));
    }

    #[test]
    fn test_generic_fallback_and_text_passthrough() {
        assert_eq!(
            render(Cell::Int(2019), &col(DataType::Year, "year(4)")),
            Some("2019".into())
        );
        assert_eq!(
            render(Cell::Text("already".into()), &col(DataType::Int, "int")),
            Some("already".into())
        );
    }

    #[test]
    fn test_type_mismatch_is_an_error() {
        let err = decode(&Cell::Bytes(vec![1]), &col(DataType::Date, "date"), None).unwrap_err();
        assert!(err.to_string().contains("DATE"));
    }
}
