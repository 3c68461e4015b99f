//! MySQL binary JSON (`JSON` column storage format) to textual JSON.
//!
//! Layout reference: `json_binary.h` in the MySQL server. Every value is a
//! type byte followed by its payload. Objects and arrays come in a small
//! (16-bit offsets) and a large (32-bit offsets) flavour; offsets inside them
//! are relative to the first byte after the container's type byte. Object
//! keys are emitted in storage order, which requires `serde_json`'s
//! `preserve_order` feature.

use base64::Engine;
use serde_json::{Map, Number, Value};

use crate::error::{DecodeError, Result};

const SMALL_OBJECT: u8 = 0x00;
const LARGE_OBJECT: u8 = 0x01;
const SMALL_ARRAY: u8 = 0x02;
const LARGE_ARRAY: u8 = 0x03;
const LITERAL: u8 = 0x04;
const INT16: u8 = 0x05;
const UINT16: u8 = 0x06;
const INT32: u8 = 0x07;
const UINT32: u8 = 0x08;
const INT64: u8 = 0x09;
const UINT64: u8 = 0x0a;
const DOUBLE: u8 = 0x0b;
const STRING: u8 = 0x0c;
const OPAQUE: u8 = 0x0f;

const LITERAL_NULL: u8 = 0x00;
const LITERAL_TRUE: u8 = 0x01;
const LITERAL_FALSE: u8 = 0x02;

/// Decode a binary JSON document into a [`Value`].
pub fn decode_binary_json(data: &[u8]) -> Result<Value> {
    match data.split_first() {
        None => Ok(Value::Null),
        Some((&type_byte, payload)) => parse_value(type_byte, payload),
    }
}

/// Decode a binary JSON document straight to compact text.
pub fn binary_json_to_string(data: &[u8]) -> Result<String> {
    let value = decode_binary_json(data)?;
    serde_json::to_string(&value).map_err(|e| DecodeError::InvalidJson(e.to_string()))
}

fn parse_value(type_byte: u8, data: &[u8]) -> Result<Value> {
    match type_byte {
        SMALL_OBJECT => parse_object(data, false),
        LARGE_OBJECT => parse_object(data, true),
        SMALL_ARRAY => parse_array(data, false),
        LARGE_ARRAY => parse_array(data, true),
        LITERAL => Ok(literal(*data.first().ok_or_else(|| truncated("literal"))?)),
        INT16 => Ok(Value::from(read_u16(data, 0)? as i16)),
        UINT16 => Ok(Value::from(read_u16(data, 0)?)),
        INT32 => Ok(Value::from(read_u32(data, 0)? as i32)),
        UINT32 => Ok(Value::from(read_u32(data, 0)?)),
        INT64 => Ok(Value::from(read_u64(data, 0)? as i64)),
        UINT64 => Ok(Value::from(read_u64(data, 0)?)),
        DOUBLE => {
            let v = f64::from_bits(read_u64(data, 0)?);
            Ok(Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null))
        }
        STRING => {
            let (len, prefix) = read_variable_length(data)?;
            let bytes = slice(data, prefix, len, "string")?;
            Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
        }
        OPAQUE => {
            // column type byte, then a length-prefixed blob
            let rest = data.get(1..).ok_or_else(|| truncated("opaque"))?;
            let (len, prefix) = read_variable_length(rest)?;
            let bytes = slice(rest, prefix, len, "opaque")?;
            let text = match std::str::from_utf8(bytes) {
                Ok(s) => s.to_string(),
                Err(_) => base64::engine::general_purpose::STANDARD.encode(bytes),
            };
            Ok(Value::String(text))
        }
        other => Err(DecodeError::InvalidJson(format!(
            "unknown value type 0x{other:02x}"
        ))),
    }
}

fn literal(byte: u8) -> Value {
    match byte {
        LITERAL_TRUE => Value::Bool(true),
        LITERAL_FALSE => Value::Bool(false),
        LITERAL_NULL => Value::Null,
        _ => Value::Null,
    }
}

fn parse_object(data: &[u8], large: bool) -> Result<Value> {
    let offset_size = if large { 4 } else { 2 };
    let count = read_offset(data, 0, large)?;
    let key_entries = offset_size * 2;
    let key_entry_size = offset_size + 2;
    check_entries(data, key_entries, count, key_entry_size + offset_size + 1, "object")?;
    let value_entries = key_entries + count * key_entry_size;

    let mut map = Map::with_capacity(count);
    for i in 0..count {
        let entry = key_entries + i * key_entry_size;
        let key_offset = read_offset(data, entry, large)?;
        let key_len = read_u16(data, entry + offset_size)? as usize;
        let key = slice(data, key_offset, key_len, "object key")?;
        let value = parse_entry(data, value_entries + i * (offset_size + 1), large)?;
        map.insert(String::from_utf8_lossy(key).into_owned(), value);
    }
    Ok(Value::Object(map))
}

fn parse_array(data: &[u8], large: bool) -> Result<Value> {
    let offset_size = if large { 4 } else { 2 };
    let count = read_offset(data, 0, large)?;
    let value_entries = offset_size * 2;
    check_entries(data, value_entries, count, offset_size + 1, "array")?;

    let mut items = Vec::with_capacity(count);
    for i in 0..count {
        items.push(parse_entry(data, value_entries + i * (offset_size + 1), large)?);
    }
    Ok(Value::Array(items))
}

/// The header claims `count` entries of `entry_size` bytes after `start`;
/// they must all lie inside the container.
fn check_entries(
    data: &[u8],
    start: usize,
    count: usize,
    entry_size: usize,
    what: &str,
) -> Result<()> {
    count
        .checked_mul(entry_size)
        .and_then(|len| len.checked_add(start))
        .filter(|end| *end <= data.len())
        .map(|_| ())
        .ok_or_else(|| truncated(what))
}

/// Resolve one value entry of a container: small scalars are stored inline
/// in the offset slot, everything else lives at the offset.
fn parse_entry(container: &[u8], entry: usize, large: bool) -> Result<Value> {
    let type_byte = *container
        .get(entry)
        .ok_or_else(|| truncated("value entry"))?;
    let slot = entry + 1;
    match type_byte {
        LITERAL => Ok(literal(read_u16(container, slot)? as u8)),
        INT16 => Ok(Value::from(read_u16(container, slot)? as i16)),
        UINT16 => Ok(Value::from(read_u16(container, slot)?)),
        INT32 if large => Ok(Value::from(read_u32(container, slot)? as i32)),
        UINT32 if large => Ok(Value::from(read_u32(container, slot)?)),
        _ => {
            let offset = read_offset(container, slot, large)?;
            let payload = container
                .get(offset..)
                .ok_or_else(|| truncated("value offset"))?;
            parse_value(type_byte, payload)
        }
    }
}

/// 7 bits per byte, high bit set while more bytes follow. At most 5 bytes.
fn read_variable_length(data: &[u8]) -> Result<(usize, usize)> {
    let mut len: usize = 0;
    for (i, byte) in data.iter().take(5).enumerate() {
        len |= ((byte & 0x7f) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((len, i + 1));
        }
    }
    Err(truncated("variable length"))
}

fn read_offset(data: &[u8], pos: usize, large: bool) -> Result<usize> {
    if large {
        Ok(read_u32(data, pos)? as usize)
    } else {
        Ok(read_u16(data, pos)? as usize)
    }
}

fn read_u16(data: &[u8], pos: usize) -> Result<u16> {
    let bytes = slice(data, pos, 2, "u16")?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32> {
    let bytes = slice(data, pos, 4, "u32")?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(data: &[u8], pos: usize) -> Result<u64> {
    let bytes = slice(data, pos, 8, "u64")?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}

fn slice<'a>(data: &'a [u8], pos: usize, len: usize, what: &str) -> Result<&'a [u8]> {
    pos.checked_add(len)
        .and_then(|end| data.get(pos..end))
        .ok_or_else(|| truncated(what))
}

fn truncated(what: &str) -> DecodeError {
    DecodeError::InvalidJson(format!("truncated {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_object_keeps_storage_order() {
        let data: Vec<u8> = vec![
            0, 3, 0, 77, 0, 25, 0, 2, 0, 27, 0, 4, 0, 31, 0, 10, 0, 12, 41, 0, 12, 49, 0, 0, 57,
            0, 111, 115, 110, 97, 109, 101, 114, 101, 115, 111, 108, 117, 116, 105, 111, 110, 7,
            87, 105, 110, 100, 111, 119, 115, 7, 70, 105, 114, 101, 102, 111, 120, 2, 0, 20, 0,
            18, 0, 1, 0, 19, 0, 1, 0, 5, 0, 10, 5, 64, 6, 120, 121,
        ];
        assert_eq!(
            binary_json_to_string(&data).unwrap(),
            r#"{"os":"Windows","name":"Firefox","resolution":{"x":2560,"y":1600}}"#
        );
    }

    #[test]
    fn test_small_array_with_inline_and_offset_values() {
        // [true, 7, "ab"]
        let data: Vec<u8> = vec![
            SMALL_ARRAY,
            3, 0, 16, 0, // count, size
            LITERAL, LITERAL_TRUE, 0,
            INT16, 7, 0,
            STRING, 13, 0,
            2, b'a', b'b',
        ];
        assert_eq!(binary_json_to_string(&data).unwrap(), r#"[true,7,"ab"]"#);
    }

    #[test]
    fn test_top_level_scalars() {
        assert_eq!(decode_binary_json(&[]).unwrap(), Value::Null);
        assert_eq!(
            decode_binary_json(&[LITERAL, LITERAL_FALSE]).unwrap(),
            Value::Bool(false)
        );
        let mut double = vec![DOUBLE];
        double.extend_from_slice(&1.5f64.to_le_bytes());
        assert_eq!(binary_json_to_string(&double).unwrap(), "1.5");
        let mut big = vec![UINT64];
        big.extend_from_slice(&u64::MAX.to_le_bytes());
        assert_eq!(binary_json_to_string(&big).unwrap(), "18446744073709551615");
    }

    #[test]
    fn test_variable_length_prefix() {
        assert_eq!(read_variable_length(&[0x05]).unwrap(), (5, 1));
        assert_eq!(read_variable_length(&[0x81, 0x01]).unwrap(), (129, 2));
        assert!(read_variable_length(&[0x80]).is_err());
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        assert!(decode_binary_json(&[SMALL_OBJECT, 1, 0]).is_err());
        assert!(decode_binary_json(&[0x42]).is_err());
    }

    #[test]
    fn test_oversized_container_header_is_an_error() {
        let array = [LARGE_ARRAY, 0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0];
        assert!(matches!(
            binary_json_to_string(&array),
            Err(DecodeError::InvalidJson(_))
        ));
        let object = [LARGE_OBJECT, 0xff, 0xff, 0xff, 0x7f, 9, 0, 0, 0];
        assert!(decode_binary_json(&object).is_err());
        let small = [SMALL_ARRAY, 0xff, 0xff, 4, 0];
        assert!(decode_binary_json(&small).is_err());
    }
}
