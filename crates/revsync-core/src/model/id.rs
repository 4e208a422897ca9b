//! Entity identifiers: temporary ids, composite keys and operation targets.
//!
//! Temporary ids look like `tmp-3fa9c01e-7`: a recognizable prefix, a random
//! per-session nonce and a monotonic sequence. Composite keys render as
//! `parent::child` and are always rebuilt from their parts; nothing in this
//! crate rewrites an identifier by substring replacement.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ErrorCode;

/// Default prefix for client-generated identifiers.
pub const DEFAULT_TEMP_PREFIX: &str = "tmp-";

/// Separator between the two halves of a composite row key.
pub const COMPOSITE_SEPARATOR: &str = "::";

/// Invalid identifier input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("entity identifier must not be empty")]
    Empty,
}

impl KeyError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::EmptyIdentifier
    }
}

/// Returns `true` when `id` carries the default temporary prefix.
#[must_use]
pub fn is_temporary(id: &str) -> bool {
    id.starts_with(DEFAULT_TEMP_PREFIX)
}

/// Session-scoped generator of temporary identifiers.
#[derive(Debug)]
pub struct TempIdGenerator {
    prefix: String,
    session: u32,
    next: AtomicU64,
}

impl TempIdGenerator {
    /// Generator with the default prefix and a random session nonce.
    #[must_use]
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_TEMP_PREFIX)
    }

    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self::seeded(prefix, rand::random::<u32>())
    }

    /// Generator with a fixed session nonce, for reproducible runs.
    #[must_use]
    pub fn seeded(prefix: impl Into<String>, session: u32) -> Self {
        Self {
            prefix: prefix.into(),
            session,
            next: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether `id` was produced by a generator using this prefix.
    #[must_use]
    pub fn is_temporary(&self, id: &str) -> bool {
        id.starts_with(&self.prefix)
    }

    /// Produce the next identifier. Never repeats within one generator.
    #[must_use]
    pub fn generate(&self) -> String {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}{:08x}-{seq}", self.prefix, self.session)
    }
}

impl Default for TempIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Two-part row key used by membership and assignment rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeKey {
    pub parent: String,
    pub child: String,
}

impl CompositeKey {
    /// Build a key from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Empty`] when either part is empty.
    pub fn new(parent: impl Into<String>, child: impl Into<String>) -> Result<Self, KeyError> {
        let parent = parent.into();
        let child = child.into();
        if parent.is_empty() || child.is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self { parent, child })
    }

    /// Parse a rendered `parent::child` key.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let (parent, child) = raw.split_once(COMPOSITE_SEPARATOR)?;
        Self::new(parent, child).ok()
    }

    /// Same key under a different parent.
    #[must_use]
    pub fn with_parent(&self, parent: &str) -> Self {
        Self {
            parent: parent.to_string(),
            child: self.child.clone(),
        }
    }

    #[must_use]
    pub fn references(&self, id: &str) -> bool {
        self.parent == id || self.child == id
    }

    /// Replace whichever half equals `from`. Returns whether anything changed.
    pub fn rewrite(&mut self, from: &str, to: &str) -> bool {
        let mut changed = false;
        if self.parent == from {
            self.parent = to.to_string();
            changed = true;
        }
        if self.child == from {
            self.child = to.to_string();
            changed = true;
        }
        changed
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{COMPOSITE_SEPARATOR}{}", self.parent, self.child)
    }
}

/// The entity an operation targets: its identifier at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "form", content = "value", rename_all = "lowercase")]
pub enum EntityKey {
    Id(String),
    Composite(CompositeKey),
}

impl EntityKey {
    /// Target an entity keyed by its own identifier.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Empty`] for an empty identifier.
    pub fn id(id: impl Into<String>) -> Result<Self, KeyError> {
        let id = id.into();
        if id.is_empty() {
            return Err(KeyError::Empty);
        }
        Ok(Self::Id(id))
    }

    /// Target a composite-keyed entity.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Empty`] when either part is empty.
    pub fn composite(parent: impl Into<String>, child: impl Into<String>) -> Result<Self, KeyError> {
        CompositeKey::new(parent, child).map(Self::Composite)
    }

    /// The row key this target occupies in its table.
    #[must_use]
    pub fn row_key(&self) -> String {
        match self {
            Self::Id(id) => id.clone(),
            Self::Composite(key) => key.to_string(),
        }
    }

    #[must_use]
    pub fn references(&self, id: &str) -> bool {
        match self {
            Self::Id(own) => own == id,
            Self::Composite(key) => key.references(id),
        }
    }

    pub fn rewrite(&mut self, from: &str, to: &str) -> bool {
        match self {
            Self::Id(own) if own == from => {
                *own = to.to_string();
                true
            }
            Self::Id(_) => false,
            Self::Composite(key) => key.rewrite(from, to),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => f.write_str(id),
            Self::Composite(key) => write!(f, "{key}"),
        }
    }
}
