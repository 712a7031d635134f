//! Type affinity
//!
//! Maps loosely typed input values onto a column's canonical representation,
//! following SQLite's storage classes:
//!
//! | column  | stored as                                              |
//! |---------|--------------------------------------------------------|
//! | text    | TEXT (numbers and booleans rendered, null -> "")       |
//! | number  | INTEGER when whole, REAL otherwise                     |
//! | bool    | INTEGER 0 or 1                                         |
//! | date    | TEXT, RFC 3339 UTC with millisecond precision          |
//! | blob    | TEXT blob reference, shape-checked only                |
//! | jsonb   | nested value, shape-checked only                       |
//!
//! See <https://www.sqlite.org/datatype3.html>.

use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use std::collections::BTreeMap;

use super::blob::BlobRef;
use super::error::{Result, StoreError};
use super::schema::{ColumnType, Schema};
use super::value::Value;

/// Coerce one field value to the canonical form for `column_type`.
///
/// Pure: the same input always produces the same output. Fails only when
/// the input cannot represent a value of the column's type.
pub fn coerce(field: &str, value: Value, column_type: ColumnType) -> Result<Value> {
    let fail = |reason: String| StoreError::Coercion {
        field: field.to_string(),
        column_type,
        reason,
    };

    match column_type {
        ColumnType::Text => Ok(Value::Text(to_text(value))),
        ColumnType::Number => to_number(value).map_err(fail),
        ColumnType::Bool => to_bool(value).map_err(fail),
        ColumnType::Date => to_date(value).map_err(fail),
        ColumnType::Blob => to_blob(value).map_err(fail),
        ColumnType::Jsonb => to_jsonb(value).map_err(fail),
    }
}

/// Coerce every field that has a declared column; other fields pass through.
pub fn coerce_fields(fields: BTreeMap<String, Value>, schema: &Schema) -> Result<BTreeMap<String, Value>> {
    fields
        .into_iter()
        .map(|(name, value)| {
            let value = match schema.column(&name) {
                Some(col) => coerce(&name, value, col.column_type)?,
                None => value,
            };
            Ok((name, value))
        })
        .collect()
}

fn to_text(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Text(s) => s,
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => match whole_real(f) {
            Some(i) => i.to_string(),
            None => f.to_string(),
        },
        Value::Bool(b) => (if b { "1" } else { "0" }).to_string(),
        nested @ (Value::Array(_) | Value::Object(_)) => nested.to_json_string(),
    }
}

fn to_number(value: Value) -> std::result::Result<Value, String> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Integer(i) => Ok(Value::Integer(i)),
        Value::Real(f) => real_to_number(f),
        Value::Bool(b) => Ok(Value::Integer(i64::from(b))),
        Value::Text(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(Value::Null);
            }
            if let Ok(i) = s.parse::<i64>() {
                return Ok(Value::Integer(i));
            }
            match s.parse::<f64>() {
                Ok(f) => real_to_number(f),
                Err(_) => Err(format!("{:?} is not numeric", s)),
            }
        }
        other => Err(format!("{} is not numeric", other.type_name())),
    }
}

fn real_to_number(f: f64) -> std::result::Result<Value, String> {
    if !f.is_finite() {
        return Err(format!("{} is not a finite number", f));
    }
    Ok(match whole_real(f) {
        Some(i) => Value::Integer(i),
        None => Value::Real(f),
    })
}

/// The integer equal to `f`, if there is one in i64 range.
fn whole_real(f: f64) -> Option<i64> {
    if f.is_finite() && f.trunc() == f && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn to_bool(value: Value) -> std::result::Result<Value, String> {
    let truth = match &value {
        Value::Null => return Ok(Value::Null),
        Value::Bool(b) => *b,
        Value::Integer(0) => false,
        Value::Integer(1) => true,
        Value::Real(f) if *f == 0.0 => false,
        Value::Real(f) if *f == 1.0 => true,
        Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "" => return Ok(Value::Null),
            "true" | "1" => true,
            "false" | "0" => false,
            _ => return Err(format!("{:?} is not a boolean", s)),
        },
        other => return Err(format!("{} {} is not a boolean", other.type_name(), other.to_json_string())),
    };
    Ok(Value::Integer(i64::from(truth)))
}

fn to_date(value: Value) -> std::result::Result<Value, String> {
    let parsed: DateTime<Utc> = match value {
        Value::Null => return Ok(Value::Null),
        Value::Integer(ms) => millis_to_date(ms)?,
        Value::Real(f) => match whole_real(f) {
            Some(ms) => millis_to_date(ms)?,
            None => return Err(format!("{} is not a whole millisecond timestamp", f)),
        },
        Value::Text(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(Value::Null);
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                dt.with_timezone(&Utc)
            } else if let Ok(day) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                let midnight = day
                    .and_hms_opt(0, 0, 0)
                    .ok_or_else(|| format!("{:?} has no midnight", s))?;
                Utc.from_utc_datetime(&midnight)
            } else {
                return Err(format!("{:?} is not an RFC 3339 timestamp or YYYY-MM-DD date", s));
            }
        }
        other => return Err(format!("{} is not a date", other.type_name())),
    };
    Ok(Value::Text(parsed.to_rfc3339_opts(SecondsFormat::Millis, true)))
}

fn millis_to_date(ms: i64) -> std::result::Result<DateTime<Utc>, String> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| format!("{} is out of range for a timestamp", ms))
}

fn to_blob(value: Value) -> std::result::Result<Value, String> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Text(s) if s.is_empty() => Ok(Value::Null),
        Value::Text(s) => match BlobRef::parse(&s) {
            Ok(_) => Ok(Value::Text(s)),
            Err(_) => Err(format!("{:?} is not a blob reference", s)),
        },
        other => Err(format!("{} is not a blob reference", other.type_name())),
    }
}

fn to_jsonb(value: Value) -> std::result::Result<Value, String> {
    match value {
        Value::Text(s) => serde_json::from_str::<serde_json::Value>(&s)
            .map(Value::from)
            .map_err(|e| format!("invalid JSON text: {}", e)),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::jsonl::schema::Column;
    use serde_json::json;

    fn c(value: serde_json::Value, ty: ColumnType) -> Result<Value> {
        coerce("f", Value::from(value), ty)
    }

    #[test]
    fn test_number_affinity() {
        assert_eq!(c(json!("42"), ColumnType::Number).unwrap(), Value::Integer(42));
        assert_eq!(c(json!(19.99), ColumnType::Number).unwrap(), Value::Real(19.99));
        assert_eq!(c(json!(42.0), ColumnType::Number).unwrap(), Value::Integer(42));
        assert_eq!(c(json!(" 2.50 "), ColumnType::Number).unwrap(), Value::Real(2.5));
        assert_eq!(c(json!("1e3"), ColumnType::Number).unwrap(), Value::Integer(1000));
        assert_eq!(c(json!(true), ColumnType::Number).unwrap(), Value::Integer(1));
        assert_eq!(c(json!(""), ColumnType::Number).unwrap(), Value::Null);
        assert_eq!(c(json!(null), ColumnType::Number).unwrap(), Value::Null);
        assert_eq!(c(json!(1e300), ColumnType::Number).unwrap(), Value::Real(1e300));

        assert!(c(json!("forty-two"), ColumnType::Number).is_err());
        assert!(c(json!("NaN"), ColumnType::Number).is_err());
        assert!(c(json!([1]), ColumnType::Number).is_err());
    }

    #[test]
    fn test_bool_affinity() {
        assert_eq!(c(json!(true), ColumnType::Bool).unwrap(), Value::Integer(1));
        assert_eq!(c(json!(false), ColumnType::Bool).unwrap(), Value::Integer(0));
        assert_eq!(c(json!(1), ColumnType::Bool).unwrap(), Value::Integer(1));
        assert_eq!(c(json!(0.0), ColumnType::Bool).unwrap(), Value::Integer(0));
        assert_eq!(c(json!("TRUE"), ColumnType::Bool).unwrap(), Value::Integer(1));
        assert_eq!(c(json!("0"), ColumnType::Bool).unwrap(), Value::Integer(0));

        assert!(c(json!(2), ColumnType::Bool).is_err());
        assert!(c(json!("yes"), ColumnType::Bool).is_err());
    }

    #[test]
    fn test_text_affinity() {
        assert_eq!(c(json!(42), ColumnType::Text).unwrap(), Value::from("42"));
        assert_eq!(c(json!(3.0), ColumnType::Text).unwrap(), Value::from("3"));
        assert_eq!(c(json!(19.99), ColumnType::Text).unwrap(), Value::from("19.99"));
        assert_eq!(c(json!(true), ColumnType::Text).unwrap(), Value::from("1"));
        assert_eq!(c(json!(null), ColumnType::Text).unwrap(), Value::from(""));
        assert_eq!(c(json!(["a", 1]), ColumnType::Text).unwrap(), Value::from(r#"["a",1]"#));
    }

    #[test]
    fn test_date_affinity() {
        assert_eq!(
            c(json!("2024-03-05T10:00:00+02:00"), ColumnType::Date).unwrap(),
            Value::from("2024-03-05T08:00:00.000Z")
        );
        assert_eq!(
            c(json!("2024-03-05"), ColumnType::Date).unwrap(),
            Value::from("2024-03-05T00:00:00.000Z")
        );
        assert_eq!(
            c(json!(1_704_067_200_000i64), ColumnType::Date).unwrap(),
            Value::from("2024-01-01T00:00:00.000Z")
        );
        assert!(c(json!("yesterday"), ColumnType::Date).is_err());
        assert!(c(json!(true), ColumnType::Date).is_err());
    }

    #[test]
    fn test_blob_and_jsonb_affinity() {
        let blob_ref = format!("sha256:{}-12", "A".repeat(52));
        assert_eq!(c(json!(blob_ref.clone()), ColumnType::Blob).unwrap(), Value::Text(blob_ref));
        assert!(c(json!("sha256:short-1"), ColumnType::Blob).is_err());
        assert!(c(json!(12), ColumnType::Blob).is_err());

        assert_eq!(
            c(json!(r#"{"a":1}"#), ColumnType::Jsonb).unwrap(),
            Value::from(json!({"a": 1}))
        );
        assert_eq!(c(json!([1, 2]), ColumnType::Jsonb).unwrap(), Value::from(json!([1, 2])));
        assert!(c(json!("{oops"), ColumnType::Jsonb).is_err());
    }

    #[test]
    fn test_error_names_field_and_column() {
        let err = coerce("price", Value::from("cheap"), ColumnType::Number).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("price"));
        assert!(msg.contains("number"));
    }

    #[test]
    fn test_coerce_fields() {
        let schema = Schema::new(vec![
            Column::new("price", ColumnType::Number),
            Column::new("done", ColumnType::Bool),
        ])
        .unwrap();

        let mut fields = BTreeMap::new();
        fields.insert("price".to_string(), Value::from("10"));
        fields.insert("done".to_string(), Value::Bool(true));
        fields.insert("extra".to_string(), Value::Real(0.5));

        let out = coerce_fields(fields, &schema).unwrap();
        assert_eq!(out["price"], Value::Integer(10));
        assert_eq!(out["done"], Value::Integer(1));
        assert_eq!(out["extra"], Value::Real(0.5));
    }
}
