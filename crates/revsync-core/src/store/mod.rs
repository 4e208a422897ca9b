//! Local row store: the canonical client-side state.
//!
//! The store is a table-oriented key/value map addressed by
//! `(table, row id)`. The queue engine only needs the five operations of
//! [`RowStore`]; everything else (persistence, observers) belongs to the
//! implementations.

pub mod memory;
pub mod shared;
pub mod sqlite;

pub use memory::{ListenerId, MemoryStore, StoreChange};
pub use shared::SharedStore;
pub use sqlite::SqliteStore;

use std::collections::BTreeMap;

use crate::error::ErrorCode;
use crate::model::Row;

/// Failure reading or writing the local store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("row {table}/{id} could not be decoded: {source}")]
    Codec {
        table: String,
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("store file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("store lock poisoned by a panicked writer")]
    Poisoned,
}

impl StoreError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Codec { .. } => ErrorCode::StoreCorrupt,
            Self::Sqlite(_) | Self::Io { .. } => ErrorCode::StoreWriteFailed,
            Self::Poisoned => ErrorCode::InternalUnexpected,
        }
    }
}

/// One write of a batch passed to [`RowStore::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum RowWrite {
    Set { table: String, id: String, row: Row },
    Delete { table: String, id: String },
}

impl RowWrite {
    #[must_use]
    pub fn set(table: &str, id: &str, row: Row) -> Self {
        Self::Set {
            table: table.to_string(),
            id: id.to_string(),
            row,
        }
    }

    #[must_use]
    pub fn delete(table: &str, id: &str) -> Self {
        Self::Delete {
            table: table.to_string(),
            id: id.to_string(),
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::Set { table, .. } | Self::Delete { table, .. } => table,
        }
    }
}

/// Table/row store abstraction used by the queue, reconciler and rollback.
pub trait RowStore {
    /// Fetch one row, `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the backing storage fails.
    fn get_row(&self, table: &str, id: &str) -> Result<Option<Row>, StoreError>;

    /// Insert or replace one row.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the backing storage fails.
    fn set_row(&mut self, table: &str, id: &str, row: Row) -> Result<(), StoreError>;

    /// Delete one row. Deleting an absent row is not an error.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the backing storage fails.
    fn del_row(&mut self, table: &str, id: &str) -> Result<(), StoreError>;

    /// Every row of a table, keyed by row id.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the backing storage fails.
    fn get_table(&self, table: &str) -> Result<BTreeMap<String, Row>, StoreError>;

    /// Apply a batch of writes in order, as one unit.
    ///
    /// Implementations with observers must notify them only after the whole
    /// batch has been applied.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the backing storage fails.
    fn apply(&mut self, writes: Vec<RowWrite>) -> Result<(), StoreError> {
        for write in writes {
            match write {
                RowWrite::Set { table, id, row } => self.set_row(&table, &id, row)?,
                RowWrite::Delete { table, id } => self.del_row(&table, &id)?,
            }
        }
        Ok(())
    }

    /// Run `f` so that no other writer can land between its reads and its
    /// writes. Stores without other writers simply call `f`.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns, or a [`StoreError`] when exclusive
    /// access cannot be obtained.
    fn atomically<R, F>(&mut self, f: F) -> Result<R, StoreError>
    where
        Self: Sized,
        F: FnOnce(&mut dyn RowStore) -> Result<R, StoreError>,
    {
        f(self)
    }
}

impl<S: RowStore + ?Sized> RowStore for &mut S {
    fn get_row(&self, table: &str, id: &str) -> Result<Option<Row>, StoreError> {
        (**self).get_row(table, id)
    }

    fn set_row(&mut self, table: &str, id: &str, row: Row) -> Result<(), StoreError> {
        (**self).set_row(table, id, row)
    }

    fn del_row(&mut self, table: &str, id: &str) -> Result<(), StoreError> {
        (**self).del_row(table, id)
    }

    fn get_table(&self, table: &str) -> Result<BTreeMap<String, Row>, StoreError> {
        (**self).get_table(table)
    }

    fn apply(&mut self, writes: Vec<RowWrite>) -> Result<(), StoreError> {
        (**self).apply(writes)
    }
}
