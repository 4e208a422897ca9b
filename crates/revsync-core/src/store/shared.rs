use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{RowStore, RowWrite, StoreError};
use crate::model::Row;

/// A store shared between the UI thread and the sync worker.
///
/// Every call takes the lock once, so a batch passed to [`RowStore::apply`]
/// is never interleaved with another writer. [`RowStore::atomically`] holds
/// it for a whole read-then-write sequence. The lock is never held across
/// an `.await`.
#[derive(Debug)]
pub struct SharedStore<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for SharedStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: RowStore> SharedStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Run `f` with exclusive access to the underlying store.
    ///
    /// Used for optimistic writes: capture the snapshot and write the rows
    /// under one lock so the worker never sees a half-applied action.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Poisoned`] when a previous holder panicked.
    pub fn with<R>(&self, f: impl FnOnce(&mut S) -> R) -> Result<R, StoreError> {
        let mut guard = self.lock()?;
        Ok(f(&mut guard))
    }

    fn lock(&self) -> Result<MutexGuard<'_, S>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl<S: RowStore> RowStore for SharedStore<S> {
    fn get_row(&self, table: &str, id: &str) -> Result<Option<Row>, StoreError> {
        self.lock()?.get_row(table, id)
    }

    fn set_row(&mut self, table: &str, id: &str, row: Row) -> Result<(), StoreError> {
        self.lock()?.set_row(table, id, row)
    }

    fn del_row(&mut self, table: &str, id: &str) -> Result<(), StoreError> {
        self.lock()?.del_row(table, id)
    }

    fn get_table(&self, table: &str) -> Result<BTreeMap<String, Row>, StoreError> {
        self.lock()?.get_table(table)
    }

    fn apply(&mut self, writes: Vec<RowWrite>) -> Result<(), StoreError> {
        self.lock()?.apply(writes)
    }

    fn atomically<R, F>(&mut self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut dyn RowStore) -> Result<R, StoreError>,
    {
        let mut guard = self.lock()?;
        f(&mut *guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[test]
    fn clones_share_one_store() {
        let mut writer = SharedStore::new(MemoryStore::new());
        let reader = writer.clone();
        let row = json!({ "id": "p1" }).as_object().cloned().unwrap_or_default();
        writer.set_row("projects", "p1", row.clone()).expect("set");
        assert_eq!(reader.get_row("projects", "p1").expect("get"), Some(row));
    }

    #[test]
    fn with_exposes_the_inner_store() {
        let shared = SharedStore::new(MemoryStore::new());
        let revision = shared
            .with(|store| {
                store.set_row("reviews", "r1", Row::new())?;
                Ok::<_, StoreError>(store.revision())
            })
            .expect("lock")
            .expect("write");
        assert_eq!(revision, 1);
    }

    #[test]
    fn atomically_keeps_other_writers_out() {
        use std::sync::mpsc;
        use std::thread;
        use std::time::Duration;

        let mut worker = SharedStore::new(MemoryStore::new());
        let ui = worker.clone();
        let (started, wait_started) = mpsc::channel();

        let writer = thread::spawn(move || {
            wait_started.recv().expect("started");
            ui.with(|store| store.set_row("reviews", "r-late", Row::new()))
                .expect("lock")
                .expect("write");
        });

        let seen = worker
            .atomically(|store| {
                started.send(()).expect("signal");
                thread::sleep(Duration::from_millis(30));
                let before = store.get_table("reviews")?.len();
                store.set_row("projects", "p1", Row::new())?;
                Ok(before)
            })
            .expect("atomically");
        writer.join().expect("writer");

        assert_eq!(seen, 0, "the late write waited for the lock");
        assert_eq!(worker.get_table("reviews").expect("reviews").len(), 1);
    }
}
