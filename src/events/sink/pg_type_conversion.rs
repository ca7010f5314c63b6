//! PostgreSQL type conversion utilities
//!
//! Turns text-format column values into typed JSON using the column type OID.

use crate::protocol::messages::ColumnValue;
use crate::utils::binary::{Oid, to_hex};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::{Number, Value};
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgType {
    Bool = 16,
    Bytea = 17,
    Char = 18,
    Name = 19,
    Int8 = 20,
    Int2 = 21,
    Int4 = 23,
    Text = 25,
    Json = 114,
    Float4 = 700,
    Float8 = 701,
    BoolArray = 1000,
    CharArray = 1002,
    Int2Array = 1005,
    Int4Array = 1007,
    TextArray = 1009,
    VarcharArray = 1015,
    Int8Array = 1016,
    Float4Array = 1021,
    Float8Array = 1022,
    NumericArray = 1231,
    Bpchar = 1042,
    Varchar = 1043,
    Date = 1082,
    Timestamp = 1114,
    Timestamptz = 1184,
    Bit = 1560,
    BitArray = 1561,
    Numeric = 1700,
    Uuid = 2950,
    UuidArray = 2951,
    Jsonb = 3802,
}

impl TryFrom<Oid> for PgType {
    type Error = ();

    fn try_from(value: Oid) -> Result<Self, Self::Error> {
        match value {
            16 => Ok(PgType::Bool),
            17 => Ok(PgType::Bytea),
            18 => Ok(PgType::Char),
            19 => Ok(PgType::Name),
            20 => Ok(PgType::Int8),
            21 => Ok(PgType::Int2),
            23 => Ok(PgType::Int4),
            25 => Ok(PgType::Text),
            114 => Ok(PgType::Json),
            700 => Ok(PgType::Float4),
            701 => Ok(PgType::Float8),
            1000 => Ok(PgType::BoolArray),
            1002 => Ok(PgType::CharArray),
            1005 => Ok(PgType::Int2Array),
            1007 => Ok(PgType::Int4Array),
            1009 => Ok(PgType::TextArray),
            1015 => Ok(PgType::VarcharArray),
            1016 => Ok(PgType::Int8Array),
            1021 => Ok(PgType::Float4Array),
            1022 => Ok(PgType::Float8Array),
            1231 => Ok(PgType::NumericArray),
            1042 => Ok(PgType::Bpchar),
            1043 => Ok(PgType::Varchar),
            1082 => Ok(PgType::Date),
            1114 => Ok(PgType::Timestamp),
            1184 => Ok(PgType::Timestamptz),
            1560 => Ok(PgType::Bit),
            1561 => Ok(PgType::BitArray),
            1700 => Ok(PgType::Numeric),
            2950 => Ok(PgType::Uuid),
            2951 => Ok(PgType::UuidArray),
            3802 => Ok(PgType::Jsonb),
            _ => Err(()),
        }
    }
}

impl PgType {
    /// Element type of an array type
    pub fn element(self) -> Option<PgType> {
        Some(match self {
            PgType::BoolArray => PgType::Bool,
            PgType::CharArray => PgType::Char,
            PgType::Int2Array => PgType::Int2,
            PgType::Int4Array => PgType::Int4,
            PgType::TextArray => PgType::Text,
            PgType::VarcharArray => PgType::Varchar,
            PgType::Int8Array => PgType::Int8,
            PgType::Float4Array => PgType::Float4,
            PgType::Float8Array => PgType::Float8,
            PgType::NumericArray => PgType::Numeric,
            PgType::BitArray => PgType::Bit,
            PgType::UuidArray => PgType::Uuid,
            _ => return None,
        })
    }
}

/// Convert a decoded column to JSON. `None` for an unchanged TOAST value,
/// which has no value to report.
pub fn column_to_json(type_oid: Oid, value: &ColumnValue) -> Option<Value> {
    match value {
        ColumnValue::Null => Some(Value::Null),
        ColumnValue::Unchanged => None,
        ColumnValue::Text(bytes) => Some(text_to_json(type_oid, &String::from_utf8_lossy(bytes))),
        ColumnValue::Binary(bytes) => Some(Value::String(to_hex(bytes))),
    }
}

/// Convert a text-format value to JSON by type OID; unknown types stay strings
pub fn text_to_json(type_oid: Oid, text: &str) -> Value {
    match PgType::try_from(type_oid) {
        Ok(pg_type) => match pg_type.element() {
            Some(element) => match parse_array(text, element) {
                Some(value) => value,
                None => {
                    warn!(type_oid, "Array literal parsing failed");
                    Value::String(text.to_string())
                }
            },
            None => scalar_to_json(pg_type, text),
        },
        Err(()) => Value::String(text.to_string()),
    }
}

fn scalar_to_json(pg_type: PgType, text: &str) -> Value {
    let parsed = match pg_type {
        PgType::Bool => parse_bool(text).map(Value::Bool),
        PgType::Int2 | PgType::Int4 | PgType::Int8 => {
            i64::from_str(text).ok().map(|v| Value::Number(v.into()))
        }
        PgType::Float4 | PgType::Float8 => f64::from_str(text)
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        PgType::Numeric => parse_numeric(text),
        PgType::Bit => match text {
            "1" => Some(Value::Bool(true)),
            "0" => Some(Value::Bool(false)),
            _ => None,
        },
        PgType::Json | PgType::Jsonb => Value::from_str(text).ok(),
        PgType::Uuid => Uuid::try_parse(text).ok().map(|u| Value::String(u.to_string())),
        PgType::Date => NaiveDate::from_str(text)
            .ok()
            .map(|d| Value::String(d.to_string())),
        PgType::Timestamp => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .map(|t| Value::String(t.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        PgType::Timestamptz => DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
            .ok()
            .map(|t| Value::String(t.to_utc().to_rfc3339())),
        _ => return Value::String(text.to_string()),
    };

    parsed.unwrap_or_else(|| {
        warn!(pg_type = ?pg_type, value = text, "Column parsing failed, keeping text");
        Value::String(text.to_string())
    })
}

fn parse_bool(text: &str) -> Option<bool> {
    match text {
        "t" | "true" => Some(true),
        "f" | "false" => Some(false),
        _ => None,
    }
}

/// Numbers JSON can carry exactly; anything an `f64` would round stays text.
/// NaN and infinities are not numbers.
fn parse_numeric(text: &str) -> Option<Value> {
    if let Ok(int) = i64::from_str(text) {
        return Some(Value::Number(int.into()));
    }
    let float = f64::from_str(text).ok().filter(|f| f.is_finite())?;
    if float.to_string() != trim_fraction_zeros(text) {
        return Some(Value::String(text.to_string()));
    }
    Number::from_f64(float).map(Value::Number)
}

/// `1.50` -> `1.5`, `100.000` -> `100`
fn trim_fraction_zeros(text: &str) -> &str {
    if !text.contains('.') {
        return text;
    }
    text.trim_end_matches('0').trim_end_matches('.')
}

/// Parse a `{a,b,"c d",NULL}` array literal, nested arrays included
fn parse_array(text: &str, element: PgType) -> Option<Value> {
    let mut chars = text.trim().chars().peekable();
    if chars.next()? != '{' {
        return None;
    }
    let value = parse_array_items(&mut chars, element)?;
    if chars.next().is_some() {
        return None;
    }
    Some(value)
}

fn parse_array_items(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    element: PgType,
) -> Option<Value> {
    let mut items = Vec::new();

    loop {
        match chars.peek()? {
            '}' => {
                chars.next();
                return Some(Value::Array(items));
            }
            '{' => {
                chars.next();
                items.push(parse_array_items(chars, element)?);
            }
            '"' => {
                chars.next();
                let mut item = String::new();
                loop {
                    match chars.next()? {
                        '\\' => item.push(chars.next()?),
                        '"' => break,
                        c => item.push(c),
                    }
                }
                items.push(scalar_to_json(element, &item));
            }
            _ => {
                let mut item = String::new();
                while let Some(&c) = chars.peek() {
                    if c == ',' || c == '}' {
                        break;
                    }
                    item.push(c);
                    chars.next();
                }
                let item = item.trim();
                if item.eq_ignore_ascii_case("NULL") {
                    items.push(Value::Null);
                } else {
                    items.push(scalar_to_json(element, item));
                }
            }
        }

        if chars.peek() == Some(&',') {
            chars.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_types() {
        assert_eq!(text_to_json(16, "t"), json!(true));
        assert_eq!(text_to_json(16, "f"), json!(false));
        assert_eq!(text_to_json(21, "-3"), json!(-3));
        assert_eq!(text_to_json(23, "1"), json!(1));
        assert_eq!(text_to_json(20, "9007199254740993"), json!(9007199254740993i64));
        assert_eq!(text_to_json(701, "1.5"), json!(1.5));
        assert_eq!(text_to_json(25, "John"), json!("John"));
        assert_eq!(text_to_json(1043, "x"), json!("x"));
        assert_eq!(text_to_json(1560, "1"), json!(true));
        assert_eq!(text_to_json(1560, "0"), json!(false));
        assert_eq!(text_to_json(3802, r#"{"a":1}"#), json!({"a": 1}));
    }

    #[test]
    fn test_numeric_falls_back_to_string() {
        assert_eq!(text_to_json(1700, "12.25"), json!(12.25));
        assert_eq!(text_to_json(1700, "42"), json!(42));
        assert_eq!(text_to_json(1700, "NaN"), json!("NaN"));
        assert_eq!(text_to_json(23, "abc"), json!("abc"));
    }

    #[test]
    fn test_numeric_keeps_precision() {
        assert_eq!(text_to_json(1700, "1.50"), json!(1.5));
        assert_eq!(text_to_json(1700, "-0.125"), json!(-0.125));
        assert_eq!(
            text_to_json(1700, "12345678901234567890.123"),
            json!("12345678901234567890.123")
        );
        assert_eq!(text_to_json(1700, "0.1000000000000000055511"), json!("0.1000000000000000055511"));
    }

    #[test]
    fn test_unknown_type_is_string() {
        assert_eq!(text_to_json(600, "(1,2)"), json!("(1,2)"));
    }

    #[test]
    fn test_arrays() {
        assert_eq!(text_to_json(1007, "{1,2,3}"), json!([1, 2, 3]));
        assert_eq!(text_to_json(1007, "{}"), json!([]));
        assert_eq!(text_to_json(1000, "{t,f,NULL}"), json!([true, false, null]));
        assert_eq!(
            text_to_json(1009, r#"{plain,"with, comma","say \"hi\"",NULL}"#),
            json!(["plain", "with, comma", "say \"hi\"", null])
        );
        assert_eq!(text_to_json(1005, "{{1,2},{3,4}}"), json!([[1, 2], [3, 4]]));
        assert_eq!(text_to_json(1022, "{1.5,NULL}"), json!([1.5, null]));
    }

    #[test]
    fn test_malformed_array_kept_as_text() {
        assert_eq!(text_to_json(1007, "{1,2"), json!("{1,2"));
        assert_eq!(text_to_json(1007, "1,2}"), json!("1,2}"));
    }

    #[test]
    fn test_column_values() {
        assert_eq!(column_to_json(23, &ColumnValue::Null), Some(Value::Null));
        assert_eq!(column_to_json(23, &ColumnValue::Unchanged), None);
        assert_eq!(
            column_to_json(17, &ColumnValue::Binary(vec![0xDE, 0xAD])),
            Some(json!("dead"))
        );
    }
}
