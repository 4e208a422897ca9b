//! Pre-mutation snapshots and their restoration.
//!
//! A [`Snapshot`] is an owned deep copy of the rows an optimistic write is
//! about to touch. Rows that did not exist are captured as `prior: None` so
//! that restoring deletes them instead of leaving an empty object behind.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{CompositeKey, EntityKind, Keying, Row, row};
use crate::store::{RowStore, RowWrite, StoreError};

/// Rows to capture, as `(kind, row key)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotScope {
    rows: Vec<(EntityKind, String)>,
}

impl SnapshotScope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a row to the scope. Adding the same row twice has no effect.
    #[must_use]
    pub fn row(mut self, kind: EntityKind, key: impl Into<String>) -> Self {
        self.push(kind, key);
        self
    }

    pub fn push(&mut self, kind: EntityKind, key: impl Into<String>) {
        let key = key.into();
        if !self.contains(kind, &key) {
            self.rows.push((kind, key));
        }
    }

    #[must_use]
    pub fn contains(&self, kind: EntityKind, key: &str) -> bool {
        self.rows.iter().any(|(k, existing)| *k == kind && existing == key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One captured row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedRow {
    pub kind: EntityKind,
    pub key: String,
    /// Content before the mutation; `None` means the row did not exist.
    pub prior: Option<Row>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    rows: Vec<CapturedRow>,
}

/// Copy every row in `scope` out of `store`.
///
/// # Errors
///
/// Returns a [`StoreError`] if a row cannot be read.
pub fn capture<S: RowStore + ?Sized>(
    store: &S,
    scope: &SnapshotScope,
) -> Result<Snapshot, StoreError> {
    let rows = scope
        .rows
        .iter()
        .map(|(kind, key)| {
            Ok(CapturedRow {
                kind: *kind,
                key: key.clone(),
                prior: store.get_row(kind.table(), key)?,
            })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;
    Ok(Snapshot { rows })
}

/// Restore several snapshots in one batch, newest first.
///
/// `snapshots` is given in enqueue order. Because later writes of a batch
/// win, the oldest snapshot's prior content is what remains for rows that
/// several snapshots captured.
///
/// # Errors
///
/// Returns a [`StoreError`] if the batch cannot be applied.
pub fn restore_all<S: RowStore + ?Sized>(
    store: &mut S,
    snapshots: &[&Snapshot],
) -> Result<usize, StoreError> {
    let writes: Vec<RowWrite> = snapshots
        .iter()
        .rev()
        .flat_map(|snapshot| snapshot.writes())
        .collect();
    let count = writes.len();
    store.apply(writes)?;
    debug!(snapshots = snapshots.len(), rows = count, "restored snapshots");
    Ok(count)
}

impl Snapshot {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn rows(&self) -> &[CapturedRow] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Prior content of one captured row; the outer `None` means the row
    /// was not captured.
    #[must_use]
    pub fn prior(&self, kind: EntityKind, key: &str) -> Option<Option<&Row>> {
        self.rows
            .iter()
            .find(|row| row.kind == kind && row.key == key)
            .map(|row| row.prior.as_ref())
    }

    /// The batch that puts every captured row back.
    #[must_use]
    pub fn writes(&self) -> Vec<RowWrite> {
        self.rows
            .iter()
            .map(|captured| match &captured.prior {
                Some(prior) => RowWrite::set(captured.kind.table(), &captured.key, prior.clone()),
                None => RowWrite::delete(captured.kind.table(), &captured.key),
            })
            .collect()
    }

    /// Put every captured row back as one batch.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the batch cannot be applied.
    pub fn restore<S: RowStore + ?Sized>(&self, store: &mut S) -> Result<usize, StoreError> {
        restore_all(store, &[self])
    }

    #[must_use]
    pub fn references(&self, id: &str) -> bool {
        self.rows.iter().any(|captured| {
            key_references(captured.kind, &captured.key, id)
                || captured
                    .prior
                    .as_ref()
                    .is_some_and(|prior| row::row_references(prior, id))
        })
    }

    /// Replace identifier `from` with `to` in row keys and captured content.
    /// Returns the number of replacements.
    pub fn rewrite_id(&mut self, from: &str, to: &str) -> usize {
        let mut changed = 0;
        for captured in &mut self.rows {
            if let Some(key) = rewrite_key(captured.kind, &captured.key, from, to) {
                captured.key = key;
                changed += 1;
            }
            if let Some(prior) = captured.prior.as_mut() {
                changed += row::rewrite_row(prior, from, to);
            }
        }
        changed
    }
}

fn key_references(kind: EntityKind, key: &str, id: &str) -> bool {
    match kind.keying() {
        Keying::Own => key == id,
        Keying::Composite { .. } => CompositeKey::parse(key).is_some_and(|k| k.references(id)),
    }
}

fn rewrite_key(kind: EntityKind, key: &str, from: &str, to: &str) -> Option<String> {
    match kind.keying() {
        Keying::Own => (key == from).then(|| to.to_string()),
        Keying::Composite { .. } => {
            let mut composite = CompositeKey::parse(key)?;
            composite.rewrite(from, to).then(|| composite.to_string())
        }
    }
}
