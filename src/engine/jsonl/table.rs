//! JSONL table engine
//!
//! A table is one file: a schema header line followed by one JSON row per
//! line, in append order. The whole file is loaded once; reads are served
//! from an in-memory mirror and writes go to disk before the mirror changes.
//!
//! Appends add a single line. Every other mutation rewrites the file through
//! a temp file and an atomic rename, so a crash leaves either the old or the
//! new content on disk, never a mix.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use super::blob::BlobStore;
use super::error::{Result, StoreError};
use super::id::Id;
use super::record::Record;
use super::schema::{Column, Schema, SchemaChange};

/// A type that can be stored in a [`Table`].
pub trait Row: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique, non-zero identifier.
    fn id(&self) -> Id;

    /// Integrity check run on load and before every write.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Columns written to the header of a fresh table.
    fn columns() -> Vec<Column> {
        Vec::new()
    }
}

/// Per-table write behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableOptions {
    /// fsync data files (and the directory after a rename) on every write.
    pub sync_writes: bool,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self { sync_writes: true }
    }
}

impl TableOptions {
    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }
}

/// A committed or pending table mutation, as seen by observers.
#[derive(Debug)]
pub enum Change<'a, T> {
    Appended(&'a T),
    Replaced { previous: &'a [T], current: &'a [T] },
}

/// Receives table mutations synchronously, under the table's write lock.
///
/// Implementations must not call back into the table.
pub trait TableObserver<T: Row>: Send + Sync {
    /// Build state from the rows present when the observer is attached.
    fn on_attach(&self, rows: &[T]) -> Result<()>;

    /// Veto a mutation before anything is written.
    fn check(&self, _change: &Change<'_, T>) -> Result<()> {
        Ok(())
    }

    /// Apply a mutation that has been persisted.
    fn on_change(&self, change: &Change<'_, T>);
}

/// Point-in-time view of a table's rows
///
/// Iterating yields clones; the snapshot can be iterated any number of times
/// and is unaffected by later writes.
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
    rows: Arc<Vec<T>>,
}

impl<T: Clone> Snapshot<T> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::iter::Cloned<std::slice::Iter<'_, T>> {
        self.rows.iter().cloned()
    }
}

impl<'a, T: Clone> IntoIterator for &'a Snapshot<T> {
    type Item = T;
    type IntoIter = std::iter::Cloned<std::slice::Iter<'a, T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: Clone> IntoIterator for Snapshot<T> {
    type Item = T;
    type IntoIter = SnapshotIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        SnapshotIter { rows: self.rows, pos: 0 }
    }
}

/// Owning iterator over a [`Snapshot`].
pub struct SnapshotIter<T> {
    rows: Arc<Vec<T>>,
    pos: usize,
}

impl<T: Clone> Iterator for SnapshotIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let row = self.rows.get(self.pos)?.clone();
        self.pos += 1;
        Some(row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.rows.len() - self.pos;
        (left, Some(left))
    }
}

struct State<T: Row> {
    schema: Option<Schema>,
    rows: Arc<Vec<T>>,
    by_id: HashMap<Id, usize>,
    /// The file ends without a newline (hand edit or foreign writer).
    needs_newline: bool,
    observers: Vec<Weak<dyn TableObserver<T>>>,
}

impl<T: Row> State<T> {
    fn live_observers(&mut self) -> Vec<Arc<dyn TableObserver<T>>> {
        self.observers.retain(|o| o.strong_count() > 0);
        self.observers.iter().filter_map(Weak::upgrade).collect()
    }
}

/// A concurrent, file-backed table of `T` rows
pub struct Table<T: Row> {
    path: PathBuf,
    options: TableOptions,
    blobs: BlobStore,
    state: RwLock<State<T>>,
    #[cfg(test)]
    fail_before_rename: AtomicBool,
}

impl<T: Row> Table<T> {
    /// Load the table at `path`. A missing file is an empty, uninitialized
    /// table; nothing is created until the first write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with(path, TableOptions::default())
    }

    pub fn open_with(path: impl Into<PathBuf>, options: TableOptions) -> Result<Self> {
        let path = path.into();
        let loaded = load::<T>(&path)?;
        let blobs = BlobStore::for_table(&path);
        if let Err(e) = blobs.cleanup_tmp() {
            tracing::warn!(dir = %blobs.dir().display(), error = %e, "could not clean blob temp files");
        }

        tracing::debug!(
            path = %path.display(),
            rows = loaded.rows.len(),
            initialized = loaded.schema.is_some(),
            "loaded table"
        );

        Ok(Self {
            blobs,
            path,
            options,
            state: RwLock::new(State {
                schema: loaded.schema,
                rows: Arc::new(loaded.rows),
                by_id: loaded.by_id,
                needs_newline: loaded.needs_newline,
                observers: Vec::new(),
            }),
            #[cfg(test)]
            fail_before_rename: AtomicBool::new(false),
        })
    }

    /// Open the table, writing a header with `columns` if it has none.
    pub fn open_or_init(path: impl Into<PathBuf>, columns: Vec<Column>) -> Result<Self> {
        let table = Self::open(path)?;
        if !table.is_initialized() {
            table.update_schema(columns)?;
        }
        Ok(table)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> TableOptions {
        self.options
    }

    /// The content-addressed store beside this table's file.
    pub fn blob_store(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn schema(&self) -> Option<Schema> {
        self.state.read().schema.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().schema.is_some()
    }

    /// Rewrite the header with `columns`. Row lines are copied unchanged;
    /// existing payloads are not migrated.
    pub fn update_schema(&self, columns: Vec<Column>) -> Result<SchemaChange> {
        let next = Schema::new(columns)?;
        let mut state = self.state.write();

        let change = match &state.schema {
            Some(current) => current.compare(&next),
            None => SchemaChange::Additive {
                added: next.columns.iter().map(|c| c.name.clone()).collect(),
            },
        };

        let mut contents = next.to_header_line()?.into_bytes();
        contents.push(b'\n');
        if state.schema.is_some() {
            let existing = match fs::read(&self.path) {
                Ok(data) => data,
                Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(StoreError::io("read table", &self.path, e)),
            };
            if let Some(pos) = existing.iter().position(|&b| b == b'\n') {
                let body = &existing[pos + 1..];
                contents.extend_from_slice(body);
                if !body.is_empty() && !body.ends_with(b"\n") {
                    contents.push(b'\n');
                }
            }
        }

        self.write_atomic(&contents)?;
        state.schema = Some(next);
        state.needs_newline = false;

        tracing::info!(path = %self.path.display(), change = ?change, "updated table schema");
        Ok(change)
    }

    /// Append one row.
    ///
    /// Validation, id checks and observer vetoes all happen before the file
    /// is touched. A fresh table is written whole, header from
    /// [`Row::columns`] plus the row, so a failure leaves it uninitialized.
    pub fn append(&self, row: T) -> Result<()> {
        row.validate()?;
        let id = row.id();
        if id.is_zero() {
            return Err(StoreError::ZeroId);
        }

        let mut state = self.state.write();
        if state.by_id.contains_key(&id) {
            return Err(StoreError::DuplicateId(id));
        }

        let observers = state.live_observers();
        let pending = Change::Appended(&row);
        for observer in &observers {
            observer.check(&pending)?;
        }

        if state.schema.is_none() {
            // Header and first row land in one rename.
            let schema = Schema::new(T::columns())?;
            let mut contents = schema.to_header_line()?.into_bytes();
            contents.push(b'\n');
            serde_json::to_writer(&mut contents, &row)?;
            contents.push(b'\n');
            self.write_atomic(&contents)?;
            state.schema = Some(schema);
        } else {
            let mut line = Vec::with_capacity(128);
            if state.needs_newline {
                line.push(b'\n');
            }
            serde_json::to_writer(&mut line, &row)?;
            line.push(b'\n');
            self.append_line(&line)?;
        }

        let pos = state.rows.len();
        Arc::make_mut(&mut state.rows).push(row);
        state.by_id.insert(id, pos);
        state.needs_newline = false;

        let committed = Change::Appended(&state.rows[pos]);
        for observer in &observers {
            observer.on_change(&committed);
        }

        tracing::debug!(path = %self.path.display(), id = %id, "appended row");
        Ok(())
    }

    pub fn get(&self, id: Id) -> Option<T> {
        let state = self.state.read();
        state.by_id.get(&id).map(|&i| state.rows[i].clone())
    }

    pub fn contains(&self, id: Id) -> bool {
        self.state.read().by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.state.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The most recently appended row.
    pub fn last(&self) -> Option<T> {
        self.state.read().rows.last().cloned()
    }

    /// Snapshot of every row in append order.
    pub fn all(&self) -> Snapshot<T> {
        Snapshot {
            rows: Arc::clone(&self.state.read().rows),
        }
    }

    /// Rows appended after `start`, in append order. [`Id::ZERO`] starts at
    /// the first row. An id that is not in the table yields nothing.
    pub fn iter_after(&self, start: Id) -> SnapshotIter<T> {
        let state = self.state.read();
        let pos = if start.is_zero() {
            0
        } else {
            state.by_id.get(&start).map_or(state.rows.len(), |&i| i + 1)
        };
        SnapshotIter {
            rows: Arc::clone(&state.rows),
            pos,
        }
    }

    /// Up to `limit` rows starting at position `offset`.
    pub fn read_page(&self, offset: usize, limit: usize) -> Vec<T> {
        let state = self.state.read();
        state.rows.iter().skip(offset).take(limit).cloned().collect()
    }

    /// Replace the whole table content.
    pub fn replace(&self, rows: Vec<T>) -> Result<()> {
        let mut state = self.state.write();
        self.replace_locked(&mut state, rows)
    }

    /// Replace the row with the same id, returning the previous version.
    pub fn update(&self, row: T) -> Result<T> {
        let id = row.id();
        let mut state = self.state.write();
        let pos = *state.by_id.get(&id).ok_or(StoreError::RowNotFound(id))?;

        let mut rows = state.rows.to_vec();
        let previous = std::mem::replace(&mut rows[pos], row);
        self.replace_locked(&mut state, rows)?;
        Ok(previous)
    }

    /// Remove a row, returning it.
    pub fn delete(&self, id: Id) -> Result<T> {
        let mut state = self.state.write();
        let pos = *state.by_id.get(&id).ok_or(StoreError::RowNotFound(id))?;

        let mut rows = state.rows.to_vec();
        let removed = rows.remove(pos);
        self.replace_locked(&mut state, rows)?;
        Ok(removed)
    }

    /// Read-modify-write one row under a single exclusive lock.
    ///
    /// `f` receives a copy; nothing changes if it fails or the result does
    /// not validate. Returns the stored row.
    pub fn modify<F>(&self, id: Id, f: F) -> Result<T>
    where
        F: FnOnce(&mut T) -> Result<()>,
    {
        let mut state = self.state.write();
        let pos = *state.by_id.get(&id).ok_or(StoreError::RowNotFound(id))?;

        let mut row = state.rows[pos].clone();
        f(&mut row)?;
        if row.id() != id {
            return Err(StoreError::invalid(format!("modify changed row id {} to {}", id, row.id())));
        }

        let mut rows = state.rows.to_vec();
        rows[pos] = row.clone();
        self.replace_locked(&mut state, rows)?;
        Ok(row)
    }

    /// Register an observer. It sees the current rows immediately and every
    /// later mutation until it is dropped.
    pub fn observe(&self, observer: Arc<dyn TableObserver<T>>) -> Result<()> {
        let mut state = self.state.write();
        observer.on_attach(state.rows.as_slice())?;
        state.observers.push(Arc::downgrade(&observer));
        Ok(())
    }

    fn replace_locked(&self, state: &mut State<T>, rows: Vec<T>) -> Result<()> {
        let by_id = index_rows(&rows)?;

        let observers = state.live_observers();
        let pending = Change::Replaced {
            previous: state.rows.as_slice(),
            current: rows.as_slice(),
        };
        for observer in &observers {
            observer.check(&pending)?;
        }

        let schema = match &state.schema {
            Some(schema) => schema.clone(),
            None => Schema::new(T::columns())?,
        };

        let mut contents = schema.to_header_line()?.into_bytes();
        contents.push(b'\n');
        for row in &rows {
            serde_json::to_writer(&mut contents, row)?;
            contents.push(b'\n');
        }
        self.write_atomic(&contents)?;

        let previous = std::mem::replace(&mut state.rows, Arc::new(rows));
        state.by_id = by_id;
        state.schema = Some(schema);
        state.needs_newline = false;

        let committed = Change::Replaced {
            previous: previous.as_slice(),
            current: state.rows.as_slice(),
        };
        for observer in &observers {
            observer.on_change(&committed);
        }

        tracing::info!(
            path = %self.path.display(),
            before = previous.len(),
            after = state.rows.len(),
            "replaced table content"
        );
        Ok(())
    }

    fn append_line(&self, line: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| StoreError::io("open table", &self.path, e))?;
        let len = file
            .metadata()
            .map_err(|e| StoreError::io("stat table", &self.path, e))?
            .len();

        let written = file.write_all(line).and_then(|_| {
            if self.options.sync_writes {
                file.sync_data()
            } else {
                Ok(())
            }
        });

        if let Err(e) = written {
            tracing::warn!(path = %self.path.display(), error = %e, "append failed, truncating");
            if let Err(te) = file.set_len(len) {
                tracing::warn!(path = %self.path.display(), error = %te, "could not truncate table");
            }
            return Err(StoreError::io("append row", &self.path, e));
        }
        Ok(())
    }

    /// Write `contents` to a temp file beside the table and rename it over
    /// the table. The temp file is removed on any failure.
    fn write_atomic(&self, contents: &[u8]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| StoreError::io("create table dir", &dir, e))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dir.join(format!(".{}.{:016x}.tmp", file_name, rand::random::<u64>()));

        let result = self.write_and_rename(&tmp, contents);
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
            return result;
        }

        if self.options.sync_writes {
            if let Err(e) = File::open(&dir).and_then(|d| d.sync_all()) {
                tracing::warn!(dir = %dir.display(), error = %e, "could not sync table directory");
            }
        }
        Ok(())
    }

    fn write_and_rename(&self, tmp: &Path, contents: &[u8]) -> Result<()> {
        let mut file = File::create(tmp).map_err(|e| StoreError::io("create temp file", tmp, e))?;
        file.write_all(contents)
            .map_err(|e| StoreError::io("write temp file", tmp, e))?;
        if self.options.sync_writes {
            file.sync_all().map_err(|e| StoreError::io("sync temp file", tmp, e))?;
        }
        drop(file);

        #[cfg(test)]
        if self.fail_before_rename.load(Ordering::SeqCst) {
            return Err(StoreError::io(
                "rename table",
                &self.path,
                io::Error::new(io::ErrorKind::Other, "injected failure"),
            ));
        }

        fs::rename(tmp, &self.path).map_err(|e| StoreError::io("rename table", &self.path, e))
    }
}

impl Table<Record> {
    /// Coerce `record` against the table schema, check required columns and
    /// append it. Returns the stored record.
    pub fn insert(&self, record: Record) -> Result<Record> {
        let schema = self
            .schema()
            .ok_or_else(|| StoreError::InvalidSchema(format!("{} has no schema", self.path.display())))?;
        let record = record.conform(&schema)?;
        self.append(record.clone())?;
        Ok(record)
    }
}

fn index_rows<T: Row>(rows: &[T]) -> Result<HashMap<Id, usize>> {
    let mut by_id = HashMap::with_capacity(rows.len());
    for (pos, row) in rows.iter().enumerate() {
        row.validate()?;
        let id = row.id();
        if id.is_zero() {
            return Err(StoreError::ZeroId);
        }
        if by_id.insert(id, pos).is_some() {
            return Err(StoreError::DuplicateId(id));
        }
    }
    Ok(by_id)
}

struct Loaded<T> {
    schema: Option<Schema>,
    rows: Vec<T>,
    by_id: HashMap<Id, usize>,
    needs_newline: bool,
}

fn load<T: Row>(path: &Path) -> Result<Loaded<T>> {
    let mut loaded = Loaded {
        schema: None,
        rows: Vec::new(),
        by_id: HashMap::new(),
        needs_newline: false,
    };

    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(loaded),
        Err(e) => return Err(StoreError::io("read table", path, e)),
    };
    if data.is_empty() {
        return Ok(loaded);
    }

    let body = data.strip_suffix(b"\n").unwrap_or(&data[..]);
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(loaded);
    }
    loaded.needs_newline = !data.ends_with(b"\n");
    let mut lines = body.split(|&b| b == b'\n').map(|l| l.strip_suffix(b"\r").unwrap_or(l));

    let header = lines.next().unwrap_or_default();
    let schema: Schema = serde_json::from_slice(header).map_err(|e| StoreError::MalformedHeader {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    schema.validate().map_err(|e| StoreError::MalformedHeader {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    loaded.schema = Some(schema);

    let malformed = |line: usize, reason: String| StoreError::MalformedRow {
        path: path.to_path_buf(),
        line,
        reason,
    };

    for (i, line) in lines.enumerate() {
        let line_no = i + 2;
        if line.is_empty() {
            return Err(malformed(line_no, "blank line".to_string()));
        }

        let row: T = serde_json::from_slice(line).map_err(|e| malformed(line_no, e.to_string()))?;
        row.validate().map_err(|e| malformed(line_no, e.to_string()))?;

        let id = row.id();
        if id.is_zero() {
            return Err(malformed(line_no, "zero id".to_string()));
        }
        if loaded.by_id.insert(id, loaded.rows.len()).is_some() {
            return Err(malformed(line_no, format!("duplicate id {}", id)));
        }
        loaded.rows.push(row);
    }

    Ok(loaded)
}
