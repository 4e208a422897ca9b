//! On-disk journal of pending operations, so queued work survives reloads.
//!
//! The journal is a single JSON document rewritten atomically (temp file,
//! fsync, rename) after every queue change. The owning session holds an
//! exclusive advisory lock next to it for as long as the journal is open.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::Operation;
use super::lock::{JournalLock, LockError};
use crate::error::ErrorCode;

/// Current journal document version.
pub const JOURNAL_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("journal {path} could not be decoded: {source}")]
    Codec {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("journal {path} has unsupported version {found}")]
    UnsupportedVersion { path: String, found: u32 },
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl JournalError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Io { .. } => ErrorCode::JournalWriteFailed,
            Self::Codec { .. } | Self::UnsupportedVersion { .. } => ErrorCode::JournalCorrupt,
            Self::Lock(err) => err.code(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalDocument {
    version: u32,
    operations: Vec<Operation>,
}

/// The persisted queue of one session.
#[derive(Debug)]
pub struct QueueJournal {
    path: PathBuf,
    _lock: JournalLock,
}

impl QueueJournal {
    /// Open the journal at `path`, taking the session lock.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Lock`] when another session holds the journal.
    pub fn open(path: &Path, lock_timeout: Duration) -> Result<Self, JournalError> {
        let lock = JournalLock::acquire(&path.with_extension("lock"), lock_timeout)?;
        debug!(path = %path.display(), "opened queue journal");
        Ok(Self {
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Operations recorded by the last [`QueueJournal::save`], in queue order.
    ///
    /// A missing journal is an empty queue. Every operation comes back
    /// pending; one that was in flight when the session died is sent again.
    ///
    /// # Errors
    ///
    /// Returns an error when the file is unreadable, malformed or from a
    /// newer version.
    pub fn load(&self) -> Result<Vec<Operation>, JournalError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let body = fs::read(&self.path).map_err(|source| self.io_err(source))?;
        let document: JournalDocument =
            serde_json::from_slice(&body).map_err(|source| JournalError::Codec {
                path: self.path.display().to_string(),
                source,
            })?;
        if document.version != JOURNAL_VERSION {
            return Err(JournalError::UnsupportedVersion {
                path: self.path.display().to_string(),
                found: document.version,
            });
        }
        info!(
            path = %self.path.display(),
            operations = document.operations.len(),
            "loaded queued operations from journal"
        );
        Ok(document.operations)
    }

    /// Replace the journal contents with `operations`.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Io`] when the file cannot be written.
    pub fn save<'a>(
        &self,
        operations: impl IntoIterator<Item = &'a Operation>,
    ) -> Result<(), JournalError> {
        let document = JournalDocument {
            version: JOURNAL_VERSION,
            operations: operations.into_iter().cloned().collect(),
        };
        let body = serde_json::to_vec_pretty(&document).map_err(|source| JournalError::Codec {
            path: self.path.display().to_string(),
            source,
        })?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| self.io_err(source))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp).map_err(|source| self.io_err(source))?;
        file.write_all(&body).map_err(|source| self.io_err(source))?;
        file.sync_all().map_err(|source| self.io_err(source))?;
        fs::rename(&tmp, &self.path).map_err(|source| self.io_err(source))?;
        debug!(operations = document.operations.len(), "saved queue journal");
        Ok(())
    }

    fn io_err(&self, source: std::io::Error) -> JournalError {
        JournalError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKey, EntityKind, Row};
    use crate::queue::{OperationStatus, OperationType};
    use crate::snapshot::{SnapshotScope, capture};
    use crate::store::MemoryStore;

    fn op(seq: u64, id: &str) -> Operation {
        let snapshot = capture(
            &MemoryStore::new(),
            &SnapshotScope::new().row(EntityKind::Project, id),
        )
        .expect("capture");
        Operation::new(
            seq,
            OperationType::create(EntityKind::Project),
            EntityKey::id(id).expect("id"),
            Row::new(),
            Some(snapshot),
        )
    }

    #[test]
    fn missing_journal_loads_empty() {
        let dir = tempfile::tempdir().expect("temp dir");
        let journal =
            QueueJournal::open(&dir.path().join("queue.json"), Duration::from_millis(50))
                .expect("open");
        assert!(journal.load().expect("load").is_empty());
    }

    #[test]
    fn saved_operations_reload_in_order() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join(".revsync/queue.json");
        let ops = vec![op(1, "tmp-a"), op(2, "tmp-b")];
        {
            let journal = QueueJournal::open(&path, Duration::from_millis(50)).expect("open");
            journal.save(&ops).expect("save");
        }
        let journal = QueueJournal::open(&path, Duration::from_millis(50)).expect("reopen");
        let loaded = journal.load().expect("load");
        assert_eq!(loaded, ops);
        assert!(loaded.iter().all(|op| op.status == OperationStatus::Pending));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn second_session_cannot_open_a_held_journal() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("queue.json");
        let _first = QueueJournal::open(&path, Duration::from_millis(50)).expect("open");
        let err = QueueJournal::open(&path, Duration::from_millis(20)).expect_err("locked");
        assert_eq!(err.code(), ErrorCode::LockContention);
    }

    #[test]
    fn corrupt_and_future_journals_are_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("queue.json");
        let journal = QueueJournal::open(&path, Duration::from_millis(50)).expect("open");

        fs::write(&path, b"{ not json").expect("write");
        assert_eq!(journal.load().expect_err("corrupt").code(), ErrorCode::JournalCorrupt);

        fs::write(&path, br#"{"version": 99, "operations": []}"#).expect("write");
        assert!(matches!(
            journal.load(),
            Err(JournalError::UnsupportedVersion { found: 99, .. })
        ));
    }
}
