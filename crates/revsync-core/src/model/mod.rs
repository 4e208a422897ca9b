//! Entity kinds, identifiers and row values shared by every module.

pub mod entity;
pub mod id;
pub mod row;

pub use entity::{EntityKind, Keying, UnknownEntityKind};
pub use id::{CompositeKey, EntityKey, KeyError, TempIdGenerator, is_temporary};
pub use row::{ID_FIELD, Row, str_field};
