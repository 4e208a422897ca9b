//! Single-session guard for the queue journal.
//!
//! Two sessions replaying the same journal would send every operation
//! twice, so whoever opens the journal first takes an exclusive `fs2`
//! advisory lock on a sibling `.lock` file and writes its process id into
//! it. The lock is released when the guard drops or the process exits.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::ErrorCode;

const FIRST_POLL: Duration = Duration::from_millis(5);
const MAX_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("{}: journal lock {} still held by pid {} after {waited:?}", ErrorCode::LockContention, .path.display(), holder_label(*.holder))]
    Timeout {
        path: PathBuf,
        waited: Duration,
        holder: Option<u32>,
    },
    #[error("{}: journal lock {}: {source}", ErrorCode::JournalWriteFailed, .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::LockContention,
            Self::Io { .. } => ErrorCode::JournalWriteFailed,
        }
    }

    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

/// Exclusive hold on a journal lock file. Released on drop.
#[derive(Debug)]
pub struct JournalLock {
    file: File,
    path: PathBuf,
}

impl JournalLock {
    /// Take the lock, polling with growing intervals until `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] when another session keeps the lock,
    /// or [`LockError::Io`] when the lock file cannot be opened.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        let start = Instant::now();
        let mut poll = FIRST_POLL;
        while file.try_lock_exclusive().is_err() {
            let waited = start.elapsed();
            if waited >= timeout {
                let holder = read_holder(&mut file);
                warn!(path = %path.display(), ?holder, "journal lock contended");
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited,
                    holder,
                });
            }
            thread::sleep(poll.min(timeout.saturating_sub(waited)));
            poll = (poll * 2).min(MAX_POLL);
        }

        record_holder(&mut file).map_err(io_err)?;
        debug!(path = %path.display(), "journal lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for JournalLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

fn holder_label(holder: Option<u32>) -> String {
    holder.map_or_else(|| "?".to_string(), |pid| pid.to_string())
}

fn record_holder(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{}", std::process::id())?;
    file.flush()
}

fn read_holder(file: &mut File) -> Option<u32> {
    let mut raw = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut raw).ok()?;
    raw.trim().parse().ok()
}
