//! Dynamically typed field values
//!
//! Row payloads arrive as loosely typed JSON. [`Value`] is the closed set of
//! shapes they can take; the coercion engine maps it onto column types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A tagged JSON value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Real(f) => Some(*f),
            _ => None,
        }
    }

    /// Compact JSON text of this value.
    pub fn to_json_string(&self) -> String {
        serde_json::Value::from(self.clone()).to_string()
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Real(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Integer(i) => serde_json::Value::from(i),
            // JSON has no representation for NaN or infinities.
            Value::Real(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s),
            Value::Array(items) => serde_json::Value::Array(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                serde_json::Value::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Real(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json() {
        assert_eq!(Value::from(json!(42)), Value::Integer(42));
        assert_eq!(Value::from(json!(19.99)), Value::Real(19.99));
        assert_eq!(Value::from(json!(u64::MAX)), Value::Real(u64::MAX as f64));
        assert_eq!(Value::from(json!(null)), Value::Null);

        let nested = Value::from(json!({"tags": ["a", 1], "ok": true}));
        match nested {
            Value::Object(map) => {
                assert_eq!(map["ok"], Value::Bool(true));
                assert_eq!(map["tags"], Value::Array(vec![Value::from("a"), Value::Integer(1)]));
            }
            other => panic!("expected object, got {:?}", other),
        }
    }

    #[test]
    fn test_non_finite_real_serializes_as_null() {
        assert_eq!(serde_json::to_string(&Value::Real(f64::NAN)).unwrap(), "null");
        assert_eq!(serde_json::to_string(&Value::Real(1.5)).unwrap(), "1.5");
    }

    #[test]
    fn test_deserialize() {
        let v: Value = serde_json::from_str(r#"{"a":[1,2.5,"x"]}"#).unwrap();
        assert_eq!(v.to_json_string(), r#"{"a":[1,2.5,"x"]}"#);
    }
}
