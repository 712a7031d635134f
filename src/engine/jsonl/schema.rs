//! Schema header for JSONL tables
//!
//! The schema is the first line of every table file. It is versioned so the
//! file format can evolve, and it lists the table's columns in order.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use super::error::{Result, StoreError};
use super::id::Id;

/// Current version of the JSONL table format.
pub const CURRENT_VERSION: &str = "1.0";

/// Logical column types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Number,
    #[serde(alias = "boolean", alias = "checkbox")]
    Bool,
    Date,
    #[serde(alias = "blob_ref")]
    Blob,
    #[serde(alias = "json")]
    Jsonb,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Number => "number",
            ColumnType::Bool => "bool",
            ColumnType::Date => "date",
            ColumnType::Blob => "blob",
            ColumnType::Jsonb => "jsonb",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ColumnType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_ascii_lowercase()))
            .map_err(|_| StoreError::InvalidSchema(format!("unknown column type: {}", s)))
    }
}

/// A column declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,

    #[serde(rename = "type")]
    pub column_type: ColumnType,

    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "is_unset")]
    pub id: Id,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Column {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            required: false,
            id: Id::ZERO,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_id(mut self, id: Id) -> Self {
        self.id = id;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

fn is_unset(id: &Id) -> bool {
    id.is_zero()
}

/// Outcome of comparing a schema with a proposed replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    /// Same columns with the same types.
    Identical,
    /// Only new columns; existing rows simply lack them.
    Additive { added: Vec<String> },
    /// Columns were dropped or retyped. Existing payloads are not migrated.
    Breaking {
        removed: Vec<String>,
        retyped: Vec<String>,
    },
}

/// The schema header line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub version: String,
    pub columns: Vec<Column>,
}

impl Schema {
    /// Build a schema at the current format version.
    ///
    /// Fails if two columns share a name or a name is empty.
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let schema = Self {
            version: CURRENT_VERSION.to_string(),
            columns,
        };
        schema.validate()?;
        Ok(schema)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version.is_empty() {
            return Err(StoreError::InvalidSchema("schema version is required".to_string()));
        }

        let mut seen = HashSet::with_capacity(self.columns.len());
        for (i, col) in self.columns.iter().enumerate() {
            if col.name.is_empty() {
                return Err(StoreError::InvalidSchema(format!("column {}: name is required", i)));
            }
            if !seen.insert(col.name.as_str()) {
                return Err(StoreError::DuplicateColumn(col.name.clone()));
            }
        }
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn required_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.required)
    }

    /// Classify the move from `self` to `next`.
    pub fn compare(&self, next: &Schema) -> SchemaChange {
        let mut removed = Vec::new();
        let mut retyped = Vec::new();
        for col in &self.columns {
            match next.column(&col.name) {
                None => removed.push(col.name.clone()),
                Some(n) if n.column_type != col.column_type => retyped.push(col.name.clone()),
                Some(_) => {}
            }
        }
        if !removed.is_empty() || !retyped.is_empty() {
            return SchemaChange::Breaking { removed, retyped };
        }

        let added: Vec<String> = next
            .columns
            .iter()
            .filter(|c| self.column(&c.name).is_none())
            .map(|c| c.name.clone())
            .collect();
        if added.is_empty() {
            SchemaChange::Identical
        } else {
            SchemaChange::Additive { added }
        }
    }

    pub fn is_compatible_with(&self, next: &Schema) -> bool {
        !matches!(self.compare(next), SchemaChange::Breaking { .. })
    }

    /// Encode as the first line of a table file, without the newline.
    pub fn to_header_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_header_line(line: &str) -> Result<Self> {
        let schema: Schema = serde_json::from_str(line)?;
        schema.validate()?;
        Ok(schema)
    }
}
