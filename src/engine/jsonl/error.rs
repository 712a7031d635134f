//! Table Engine Error Types

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use super::blob::BlobRef;
use super::id::Id;
use super::schema::ColumnType;

/// Broad category of a [`StoreError`], for callers that only need to decide
/// between "bad input", "missing" and "retry/report".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Format,
    Validation,
    NotFound,
    Io,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error during {op} on {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Malformed schema header in {}: {reason}", path.display())]
    MalformedHeader { path: PathBuf, reason: String },

    #[error("Malformed row in {} line {line}: {reason}", path.display())]
    MalformedRow {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Invalid ID: {0}")]
    InvalidId(String),

    #[error("Invalid blob ref: {0}")]
    InvalidBlobRef(String),

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("Row has zero ID")]
    ZeroId,

    #[error("Duplicate ID {0}")]
    DuplicateId(Id),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Duplicate column name: {0}")]
    DuplicateColumn(String),

    #[error("Duplicate index key: {0}")]
    DuplicateKey(String),

    #[error("Cannot coerce field '{field}' to {column_type} column: {reason}")]
    Coercion {
        field: String,
        column_type: ColumnType,
        reason: String,
    },

    #[error("Missing required field: {0}")]
    MissingRequired(String),

    #[error("Row not found: {0}")]
    RowNotFound(Id),

    #[error("Blob not found: {0}")]
    BlobNotFound(BlobRef),
}

impl StoreError {
    /// Wrap an I/O failure with the operation and path it happened on.
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Shorthand for row validation failures.
    pub fn invalid(reason: impl Into<String>) -> Self {
        StoreError::InvalidRow(reason.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Io { .. } => ErrorKind::Io,
            StoreError::Serialize(_)
            | StoreError::MalformedHeader { .. }
            | StoreError::MalformedRow { .. }
            | StoreError::InvalidId(_)
            | StoreError::InvalidBlobRef(_) => ErrorKind::Format,
            StoreError::InvalidRow(_)
            | StoreError::ZeroId
            | StoreError::DuplicateId(_)
            | StoreError::InvalidSchema(_)
            | StoreError::DuplicateColumn(_)
            | StoreError::DuplicateKey(_)
            | StoreError::Coercion { .. }
            | StoreError::MissingRequired(_) => ErrorKind::Validation,
            StoreError::RowNotFound(_) | StoreError::BlobNotFound(_) => ErrorKind::NotFound,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
