//! Conversions between PostgreSQL wire values and JSON row images.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::Value;

use crate::{Error, Result};

// Type OIDs from pg_type.dat
pub const BOOL: u32 = 16;
pub const BYTEA: u32 = 17;
pub const INT8: u32 = 20;
pub const INT2: u32 = 21;
pub const INT4: u32 = 23;
pub const OID: u32 = 26;
pub const JSON: u32 = 114;
pub const FLOAT4: u32 = 700;
pub const FLOAT8: u32 = 701;
pub const BOOL_ARRAY: u32 = 1000;
pub const INT2_ARRAY: u32 = 1005;
pub const INT4_ARRAY: u32 = 1007;
pub const TEXT_ARRAY: u32 = 1009;
pub const VARCHAR_ARRAY: u32 = 1015;
pub const INT8_ARRAY: u32 = 1016;
pub const FLOAT4_ARRAY: u32 = 1021;
pub const FLOAT8_ARRAY: u32 = 1022;
pub const UUID: u32 = 2950;
pub const JSONB: u32 = 3802;

/// Converts a value in PostgreSQL text format to JSON.
///
/// Numbers and booleans become JSON scalars, json/jsonb are parsed, simple
/// one-dimensional arrays become JSON arrays. Everything else, including
/// `numeric`, stays a string so no precision is lost.
pub fn parse_text_value(text: &str, type_id: u32) -> Value {
    match type_id {
        BOOL => match text {
            "t" => Value::Bool(true),
            "f" => Value::Bool(false),
            _ => Value::String(text.to_string()),
        },
        INT2 | INT4 | INT8 | OID => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        FLOAT4 | FLOAT8 => text
            .parse::<f64>()
            .ok()
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or_else(|| Value::String(text.to_string())),
        JSON | JSONB => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
        BYTEA => Value::String(text.to_string()),
        BOOL_ARRAY | INT2_ARRAY | INT4_ARRAY | INT8_ARRAY | FLOAT4_ARRAY | FLOAT8_ARRAY
        | TEXT_ARRAY | VARCHAR_ARRAY => parse_array(text, element_type(type_id))
            .unwrap_or_else(|| Value::String(text.to_string())),
        _ => Value::String(text.to_string()),
    }
}

fn element_type(array_type: u32) -> u32 {
    match array_type {
        BOOL_ARRAY => BOOL,
        INT2_ARRAY => INT2,
        INT4_ARRAY => INT4,
        INT8_ARRAY => INT8,
        FLOAT4_ARRAY => FLOAT4,
        FLOAT8_ARRAY => FLOAT8,
        _ => 0,
    }
}

/// Parses a one-dimensional array literal like `{1,2,NULL}` or
/// `{"a b",c}`. Returns `None` for nested arrays.
fn parse_array(text: &str, element: u32) -> Option<Value> {
    let inner = text.strip_prefix('{')?.strip_suffix('}')?;
    if inner.is_empty() {
        return Some(Value::Array(Vec::new()));
    }

    let mut items = Vec::new();
    let mut chars = inner.chars().peekable();
    loop {
        let mut item = String::new();
        let quoted = chars.peek() == Some(&'"');
        if quoted {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => item.push(chars.next()?),
                    '"' => break,
                    _ => item.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                if c == '{' {
                    return None;
                }
                item.push(c);
                chars.next();
            }
        }

        items.push(if !quoted && item == "NULL" {
            Value::Null
        } else {
            parse_text_value(&item, element)
        });

        match chars.next() {
            Some(',') => continue,
            None => break,
            Some(_) => return None,
        }
    }
    Some(Value::Array(items))
}

/// Converts a value in PostgreSQL binary format to JSON.
///
/// Types without a JSON counterpart are carried as `base64:`-prefixed
/// strings.
pub fn parse_binary_value(data: &[u8], type_id: u32) -> Value {
    match (type_id, data.len()) {
        (_, 0) if type_id != BYTEA => Value::Null,
        (BOOL, 1) => Value::Bool(data[0] != 0),
        (INT2, 2) => Value::from(i16::from_be_bytes([data[0], data[1]])),
        (INT4, 4) => Value::from(i32::from_be_bytes([data[0], data[1], data[2], data[3]])),
        (INT8, 8) => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(data);
            Value::from(i64::from_be_bytes(bytes))
        }
        (FLOAT4, 4) => {
            let value = f32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            serde_json::Number::from_f64(f64::from(value))
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        (FLOAT8, 8) => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(data);
            serde_json::Number::from_f64(f64::from_be_bytes(bytes))
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        (UUID, 16) => {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(data);
            Value::String(uuid::Uuid::from_bytes(bytes).to_string())
        }
        _ => Value::String(format!("base64:{}", STANDARD.encode(data))),
    }
}

/// Formats an LSN the way PostgreSQL prints `pg_lsn`.
pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

/// Parses a `pg_lsn` text value such as `16/B374D848`.
pub fn parse_lsn(text: &str) -> Result<u64> {
    let invalid = || Error::InvalidMessage {
        message: format!("invalid LSN '{}'", text),
    };
    let (high, low) = text.split_once('/').ok_or_else(invalid)?;
    let high = u64::from_str_radix(high, 16).map_err(|_| invalid())?;
    let low = u64::from_str_radix(low, 16).map_err(|_| invalid())?;
    if high > u64::from(u32::MAX) || low > u64::from(u32::MAX) {
        return Err(invalid());
    }
    Ok((high << 32) | low)
}

/// Quotes an identifier for interpolation into SQL.
pub fn escape_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a string literal for interpolation into SQL.
pub fn escape_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
