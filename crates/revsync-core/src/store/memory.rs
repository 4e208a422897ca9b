//! In-memory row store with table-change listeners and JSON persistence.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

use tracing::debug;

use super::{RowStore, RowWrite, StoreError};
use crate::model::Row;

/// All tables of a store, keyed by table name then row id.
pub type Tables = BTreeMap<String, BTreeMap<String, Row>>;

/// Notification delivered to listeners after a write or a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    /// Monotonic store revision after the change.
    pub revision: u64,
    /// Tables touched by the change.
    pub tables: BTreeSet<String>,
}

/// Handle returned by [`MemoryStore::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn Fn(&StoreChange) + Send + Sync>;

#[derive(Default)]
pub struct MemoryStore {
    tables: Tables,
    revision: u64,
    next_listener: u64,
    listeners: Vec<(ListenerId, Listener)>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("tables", &self.tables)
            .field("revision", &self.revision)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `tables`.
    #[must_use]
    pub fn from_tables(tables: Tables) -> Self {
        Self {
            tables,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Register a listener called after every committed change.
    pub fn add_listener<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&StoreChange) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` when it was not registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    /// Write every table to `path` as JSON (write to a sibling temp file, then rename).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the file cannot be written.
    pub fn save_json(&self, path: &Path) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let body = serde_json::to_vec_pretty(&self.tables).map_err(|source| StoreError::Codec {
            table: "*".to_string(),
            id: "*".to_string(),
            source,
        })?;
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&body).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        debug!(path = %path.display(), tables = self.tables.len(), "saved local store");
        Ok(())
    }

    /// Load a store written by [`MemoryStore::save_json`]. A missing file
    /// yields an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] or [`StoreError::Codec`] for unreadable files.
    pub fn load_json(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let body = fs::read(path).map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let tables: Tables = serde_json::from_slice(&body).map_err(|source| StoreError::Codec {
            table: "*".to_string(),
            id: path.display().to_string(),
            source,
        })?;
        Ok(Self::from_tables(tables))
    }

    fn write_one(&mut self, write: RowWrite) {
        match write {
            RowWrite::Set { table, id, row } => {
                self.tables.entry(table).or_default().insert(id, row);
            }
            RowWrite::Delete { table, id } => {
                if let Some(rows) = self.tables.get_mut(&table) {
                    rows.remove(&id);
                    if rows.is_empty() {
                        self.tables.remove(&table);
                    }
                }
            }
        }
    }

    fn notify(&mut self, tables: BTreeSet<String>) {
        self.revision += 1;
        let change = StoreChange {
            revision: self.revision,
            tables,
        };
        for (_, listener) in &self.listeners {
            listener(&change);
        }
    }
}

impl RowStore for MemoryStore {
    fn get_row(&self, table: &str, id: &str) -> Result<Option<Row>, StoreError> {
        Ok(self.tables.get(table).and_then(|rows| rows.get(id)).cloned())
    }

    fn set_row(&mut self, table: &str, id: &str, row: Row) -> Result<(), StoreError> {
        self.apply(vec![RowWrite::set(table, id, row)])
    }

    fn del_row(&mut self, table: &str, id: &str) -> Result<(), StoreError> {
        self.apply(vec![RowWrite::delete(table, id)])
    }

    fn get_table(&self, table: &str) -> Result<BTreeMap<String, Row>, StoreError> {
        Ok(self.tables.get(table).cloned().unwrap_or_default())
    }

    fn apply(&mut self, writes: Vec<RowWrite>) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }
        let touched: BTreeSet<String> = writes.iter().map(|w| w.table().to_string()).collect();
        for write in writes {
            self.write_one(write);
        }
        self.notify(touched);
        Ok(())
    }
}
