//! Schema-driven dynamic rows
//!
//! A [`Record`] is an identifier plus an ordered map of field values. On disk
//! the fields sit flat next to `id`:
//!
//! ```text
//! {"id":"0Ahxk3s-Gb1","name":"Ada","age":36}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::affinity::coerce_fields;
use super::error::{Result, StoreError};
use super::id::Id;
use super::schema::Schema;
use super::table::Row;
use super::value::Value;

const ID_FIELD: &str = "id";

/// A row whose shape comes from the table schema rather than a Rust type
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub id: Id,

    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(id: Id) -> Self {
        Self {
            id,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Set a field, returning the previous value.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(name.to_string(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Coerce every declared field to its column type and check required
    /// columns are present and non-null.
    pub fn conform(self, schema: &Schema) -> Result<Record> {
        let fields = coerce_fields(self.fields, schema)?;

        for col in schema.required_columns() {
            match fields.get(&col.name) {
                None | Some(Value::Null) => return Err(StoreError::MissingRequired(col.name.clone())),
                Some(_) => {}
            }
        }

        Ok(Record { id: self.id, fields })
    }
}

impl Row for Record {
    fn id(&self) -> Id {
        self.id
    }

    fn validate(&self) -> Result<()> {
        if self.fields.contains_key(ID_FIELD) {
            return Err(StoreError::invalid("field name 'id' is reserved"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::jsonl::schema::{Column, ColumnType};

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("name", ColumnType::Text).required(),
            Column::new("age", ColumnType::Number),
            Column::new("active", ColumnType::Bool),
        ])
        .unwrap()
    }

    #[test]
    fn test_flat_json_layout() {
        let record = Record::new(Id::from_raw(1 << 20))
            .with("name", "Ada")
            .with("age", 36i64);
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, format!(r#"{{"id":"{}","age":36,"name":"Ada"}}"#, record.id));

        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_conform_coerces() {
        let record = Record::new(Id::from_raw(16))
            .with("name", "Ada")
            .with("age", "42")
            .with("active", true)
            .with("extra", 1.5);
        let conformed = record.conform(&schema()).unwrap();

        assert_eq!(conformed.get("age"), Some(&Value::Integer(42)));
        assert_eq!(conformed.get("active"), Some(&Value::Integer(1)));
        assert_eq!(conformed.get("extra"), Some(&Value::Real(1.5)));
    }

    #[test]
    fn test_conform_missing_required() {
        let err = Record::new(Id::from_raw(16)).with("age", 3i64).conform(&schema()).unwrap_err();
        assert!(matches!(err, StoreError::MissingRequired(ref c) if c == "name"));

        let err = Record::new(Id::from_raw(16))
            .with("name", Value::Null)
            .conform(&schema())
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingRequired(_)));
    }

    #[test]
    fn test_reserved_field() {
        let mut record = Record::new(Id::from_raw(16));
        assert!(record.validate().is_ok());
        record.set("id", "shadow");
        assert!(record.validate().is_err());
    }
}
