//! Secondary indexes over a table
//!
//! Indexes register themselves as [`TableObserver`]s and are kept in step
//! with every append and replace before the write call returns. The table
//! only holds them weakly: dropping an index detaches it.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use super::error::{Result, StoreError};
use super::id::Id;
use super::table::{Change, Row, Table, TableObserver};

type KeyFn<K, T> = Box<dyn Fn(&T) -> K + Send + Sync>;

struct Multi<K, T> {
    key_fn: KeyFn<K, T>,
    map: RwLock<HashMap<K, Vec<Id>>>,
}

impl<K, T> Multi<K, T>
where
    K: Eq + Hash,
    T: Row,
{
    fn build(&self, rows: &[T]) -> HashMap<K, Vec<Id>> {
        let mut map: HashMap<K, Vec<Id>> = HashMap::new();
        for row in rows {
            map.entry((self.key_fn)(row)).or_default().push(row.id());
        }
        map
    }
}

impl<K, T> TableObserver<T> for Multi<K, T>
where
    K: Eq + Hash + Send + Sync,
    T: Row,
{
    fn on_attach(&self, rows: &[T]) -> Result<()> {
        *self.map.write() = self.build(rows);
        Ok(())
    }

    fn on_change(&self, change: &Change<'_, T>) {
        match change {
            Change::Appended(row) => {
                self.map
                    .write()
                    .entry((self.key_fn)(*row))
                    .or_default()
                    .push(row.id());
            }
            Change::Replaced { current, .. } => {
                *self.map.write() = self.build(current);
            }
        }
    }
}

/// Non-unique index: key -> rows in append order
pub struct Index<K, T: Row> {
    table: Arc<Table<T>>,
    inner: Arc<Multi<K, T>>,
}

impl<K, T> Index<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Row,
{
    pub fn new<F>(table: &Arc<Table<T>>, key_fn: F) -> Result<Self>
    where
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        let inner = Arc::new(Multi {
            key_fn: Box::new(key_fn),
            map: RwLock::new(HashMap::new()),
        });
        table.observe(inner.clone())?;
        Ok(Self {
            table: Arc::clone(table),
            inner,
        })
    }

    /// Rows currently stored under `key`, fetched lazily.
    pub fn iter(&self, key: &K) -> impl Iterator<Item = T> + '_ {
        let ids = self.inner.map.read().get(key).cloned().unwrap_or_default();
        let key = key.clone();
        ids.into_iter()
            .filter_map(move |id| self.table.get(id))
            .filter(move |row| (self.inner.key_fn)(row) == key)
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.inner.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Unique<K, T> {
    key_fn: KeyFn<K, T>,
    map: RwLock<HashMap<K, Id>>,
}

impl<K, T> Unique<K, T>
where
    K: Eq + Hash + Debug,
    T: Row,
{
    fn build(&self, rows: &[T]) -> Result<HashMap<K, Id>> {
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let key = (self.key_fn)(row);
            if map.contains_key(&key) {
                return Err(StoreError::DuplicateKey(format!("{:?}", key)));
            }
            map.insert(key, row.id());
        }
        Ok(map)
    }
}

impl<K, T> TableObserver<T> for Unique<K, T>
where
    K: Eq + Hash + Debug + Send + Sync,
    T: Row,
{
    fn on_attach(&self, rows: &[T]) -> Result<()> {
        let map = self.build(rows)?;
        *self.map.write() = map;
        Ok(())
    }

    fn check(&self, change: &Change<'_, T>) -> Result<()> {
        match change {
            Change::Appended(row) => {
                let key = (self.key_fn)(*row);
                if self.map.read().contains_key(&key) {
                    return Err(StoreError::DuplicateKey(format!("{:?}", key)));
                }
            }
            Change::Replaced { current, .. } => {
                let mut seen = HashSet::with_capacity(current.len());
                for row in current.iter() {
                    let key = (self.key_fn)(row);
                    if seen.contains(&key) {
                        return Err(StoreError::DuplicateKey(format!("{:?}", key)));
                    }
                    seen.insert(key);
                }
            }
        }
        Ok(())
    }

    fn on_change(&self, change: &Change<'_, T>) {
        match change {
            Change::Appended(row) => {
                self.map.write().insert((self.key_fn)(*row), row.id());
            }
            Change::Replaced { current, .. } => {
                // check() already rejected duplicates
                if let Ok(map) = self.build(current) {
                    *self.map.write() = map;
                }
            }
        }
    }
}

/// Unique index: key -> at most one row
///
/// Construction fails if existing rows share a key. Afterwards any append or
/// replace that would introduce a duplicate is rejected before the table
/// file is touched.
pub struct UniqueIndex<K, T: Row> {
    table: Arc<Table<T>>,
    inner: Arc<Unique<K, T>>,
}

impl<K, T> UniqueIndex<K, T>
where
    K: Eq + Hash + Debug + Send + Sync + 'static,
    T: Row,
{
    pub fn new<F>(table: &Arc<Table<T>>, key_fn: F) -> Result<Self>
    where
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        let inner = Arc::new(Unique {
            key_fn: Box::new(key_fn),
            map: RwLock::new(HashMap::new()),
        });
        table.observe(inner.clone())?;
        Ok(Self {
            table: Arc::clone(table),
            inner,
        })
    }

    pub fn get(&self, key: &K) -> Option<T> {
        let id = *self.inner.map.read().get(key)?;
        self.table
            .get(id)
            .filter(|row| (self.inner.key_fn)(row) == *key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.map.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::jsonl::id::IdGenerator;
    use serde::{Deserialize, Serialize};
    use std::fs;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Member {
        id: Id,
        org: String,
        email: String,
    }

    impl Row for Member {
        fn id(&self) -> Id {
            self.id
        }
    }

    fn member(gen: &IdGenerator, org: &str, email: &str) -> Member {
        Member {
            id: gen.next(),
            org: org.to_string(),
            email: email.to_string(),
        }
    }

    #[test]
    fn test_index_follows_appends_and_replaces() {
        let dir = tempdir().unwrap();
        let gen = IdGenerator::new();
        let table = Arc::new(Table::<Member>::open(dir.path().join("members.jsonl")).unwrap());

        let a = member(&gen, "acme", "a@acme.io");
        table.append(a.clone()).unwrap();

        let by_org = Index::new(&table, |m: &Member| m.org.clone()).unwrap();
        let b = member(&gen, "acme", "b@acme.io");
        let c = member(&gen, "initech", "c@initech.io");
        table.append(b.clone()).unwrap();
        table.append(c.clone()).unwrap();

        assert_eq!(by_org.iter(&"acme".to_string()).collect::<Vec<_>>(), vec![a.clone(), b.clone()]);
        assert_eq!(by_org.len(), 2);

        let mut moved = b.clone();
        moved.org = "initech".to_string();
        table.update(moved.clone()).unwrap();
        assert_eq!(by_org.iter(&"acme".to_string()).collect::<Vec<_>>(), vec![a]);
        assert_eq!(by_org.iter(&"initech".to_string()).collect::<Vec<_>>(), vec![moved, c]);
        assert_eq!(by_org.iter(&"nobody".to_string()).count(), 0);
    }

    #[test]
    fn test_unique_index_rejects_existing_duplicates() {
        let dir = tempdir().unwrap();
        let gen = IdGenerator::new();
        let table = Arc::new(Table::<Member>::open(dir.path().join("members.jsonl")).unwrap());
        table.append(member(&gen, "acme", "same@acme.io")).unwrap();
        table.append(member(&gen, "initech", "same@acme.io")).unwrap();

        let result = UniqueIndex::new(&table, |m: &Member| m.email.clone());
        assert!(matches!(result, Err(StoreError::DuplicateKey(_))));

        // The failed index is not attached.
        table.append(member(&gen, "x", "same@acme.io")).unwrap();
    }

    #[test]
    fn test_unique_index_vetoes_before_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("members.jsonl");
        let gen = IdGenerator::new();
        let table = Arc::new(Table::<Member>::open(&path).unwrap());
        let by_email = UniqueIndex::new(&table, |m: &Member| m.email.clone()).unwrap();

        let a = member(&gen, "acme", "a@acme.io");
        table.append(a.clone()).unwrap();
        assert_eq!(by_email.get(&"a@acme.io".to_string()), Some(a.clone()));

        let before = fs::read(&path).unwrap();
        let err = table.append(member(&gen, "acme", "a@acme.io")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(_)));
        assert_eq!(fs::read(&path).unwrap(), before);
        assert_eq!(table.len(), 1);

        let dup = vec![a.clone(), member(&gen, "x", "a@acme.io")];
        assert!(matches!(table.replace(dup), Err(StoreError::DuplicateKey(_))));
        assert_eq!(fs::read(&path).unwrap(), before);

        // Changing a row's own key is fine.
        let mut renamed = a.clone();
        renamed.email = "new@acme.io".to_string();
        table.update(renamed.clone()).unwrap();
        assert!(by_email.get(&"a@acme.io".to_string()).is_none());
        assert_eq!(by_email.get(&"new@acme.io".to_string()), Some(renamed));
        assert_eq!(by_email.len(), 1);
    }

    #[test]
    fn test_dropped_index_detaches() {
        let dir = tempdir().unwrap();
        let gen = IdGenerator::new();
        let table = Arc::new(Table::<Member>::open(dir.path().join("members.jsonl")).unwrap());
        table.append(member(&gen, "acme", "a@acme.io")).unwrap();

        let by_email = UniqueIndex::new(&table, |m: &Member| m.email.clone()).unwrap();
        assert!(table.append(member(&gen, "acme", "a@acme.io")).is_err());

        drop(by_email);
        table.append(member(&gen, "acme", "a@acme.io")).unwrap();
        assert_eq!(table.len(), 2);
    }
}
