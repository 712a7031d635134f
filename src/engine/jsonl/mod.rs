//! mddb JSONL Table Engine
//!
//! A local-first, file-backed record store:
//! - One JSONL file per table, schema header on line 1
//! - Sortable 64-bit row IDs
//! - SQLite-style type affinity for dynamic rows
//! - Secondary indexes kept in step through change notifications
//! - Content-addressed blobs beside each table

pub mod affinity;
pub mod blob;
pub mod error;
pub mod id;
pub mod index;
pub mod record;
pub mod schema;
pub mod table;
pub mod value;

pub use affinity::{coerce, coerce_fields};
pub use blob::{BlobRef, BlobStore, BlobWriter};
pub use error::{ErrorKind, Result, StoreError};
pub use id::{Id, IdGenerator};
pub use index::{Index, UniqueIndex};
pub use record::Record;
pub use schema::{Column, ColumnType, Schema, SchemaChange};
pub use table::{Change, Row, Snapshot, SnapshotIter, Table, TableObserver, TableOptions};
pub use value::Value;
