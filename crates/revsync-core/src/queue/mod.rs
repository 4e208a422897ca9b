//! The mutation queue: strictly ordered, strictly serial outgoing writes.
//!
//! Only the head of the queue is ever dispatched, and only one dispatch can
//! be outstanding. Every operation leaves the live queue once it reaches a
//! terminal status.

pub mod journal;
pub mod lock;

pub use journal::{JournalError, QueueJournal};

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{EntityKey, EntityKind, Row, row};
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// The tagged operation variant, e.g. `create-project`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationType {
    pub action: Action,
    pub kind: EntityKind,
}

impl OperationType {
    #[must_use]
    pub const fn new(action: Action, kind: EntityKind) -> Self {
        Self { action, kind }
    }

    #[must_use]
    pub const fn create(kind: EntityKind) -> Self {
        Self::new(Action::Create, kind)
    }

    #[must_use]
    pub const fn update(kind: EntityKind) -> Self {
        Self::new(Action::Update, kind)
    }

    #[must_use]
    pub const fn delete(kind: EntityKind) -> Self {
        Self::new(Action::Delete, kind)
    }

    /// Whether a successful call hands back a server-assigned identifier.
    #[must_use]
    pub const fn assigns_id(self) -> bool {
        matches!(self.action, Action::Create) && self.kind.has_own_id()
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.action.as_str(), self.kind)
    }
}

/// Error returned when parsing an unknown operation type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown operation type '{0}'")]
pub struct UnknownOperationType(pub String);

impl FromStr for OperationType {
    type Err = UnknownOperationType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || UnknownOperationType(s.to_string());
        let (action, kind) = s.split_once('-').ok_or_else(unknown)?;
        let action = match action {
            "create" => Action::Create,
            "update" => Action::Update,
            "delete" => Action::Delete,
            _ => return Err(unknown()),
        };
        let kind = kind.parse::<EntityKind>().map_err(|_| unknown())?;
        Ok(Self::new(action, kind))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
    Removed,
}

impl OperationStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Queue-assigned handle, increasing in enqueue order.
    pub seq: u64,
    /// The affected entity, as identified at enqueue time.
    pub target: EntityKey,
    pub op_type: OperationType,
    pub payload: Row,
    pub status: OperationStatus,
    pub rollback: Option<Snapshot>,
    pub enqueued_at: DateTime<Utc>,
    /// Gateway attempts consumed so far.
    #[serde(default)]
    pub attempts: u32,
}

impl Operation {
    #[must_use]
    pub fn new(
        seq: u64,
        op_type: OperationType,
        target: EntityKey,
        payload: Row,
        rollback: Option<Snapshot>,
    ) -> Self {
        Self {
            seq,
            target,
            op_type,
            payload,
            status: OperationStatus::Pending,
            rollback,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }

    /// Whether the target or payload mentions identifier `id`.
    #[must_use]
    pub fn references(&self, id: &str) -> bool {
        self.target.references(id) || row::row_references(&self.payload, id)
    }

    /// Rewrite `from` to `to` in target, payload and rollback snapshot.
    /// Returns `true` when anything changed.
    pub fn rewrite_id(&mut self, from: &str, to: &str) -> bool {
        let target = self.target.rewrite(from, to);
        let payload = row::rewrite_row(&mut self.payload, from, to);
        let snapshot = self
            .rollback
            .as_mut()
            .map_or(0, |snapshot| snapshot.rewrite_id(from, to));
        target || payload > 0 || snapshot > 0
    }
}

/// FIFO queue of pending operations with a single-dispatch guard.
#[derive(Debug, Default)]
pub struct MutationQueue {
    ops: VecDeque<Operation>,
    in_flight: bool,
    next_seq: Arc<AtomicU64>,
}

impl MutationQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue drawing sequence numbers from a counter shared with handles
    /// that build operations on other tasks.
    #[must_use]
    pub fn with_sequence(next_seq: Arc<AtomicU64>) -> Self {
        Self {
            next_seq,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn sequence(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.next_seq)
    }

    /// Append a pending operation at the tail.
    pub fn enqueue(
        &mut self,
        op_type: OperationType,
        payload: Row,
        target: EntityKey,
        rollback: Option<Snapshot>,
    ) -> Operation {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let op = Operation::new(seq, op_type, target, payload, rollback);
        self.ops.push_back(op.clone());
        op
    }

    /// Append an operation built elsewhere. It is reset to pending.
    pub fn push(&mut self, mut op: Operation) {
        op.status = OperationStatus::Pending;
        self.next_seq.fetch_max(op.seq + 1, Ordering::Relaxed);
        self.ops.push_back(op);
    }

    /// Claim the head for dispatch.
    ///
    /// Returns `None` when the queue is empty or a dispatch is already
    /// outstanding.
    pub fn begin_dispatch(&mut self) -> Option<Operation> {
        if self.in_flight {
            return None;
        }
        let head = self.ops.front()?.clone();
        self.in_flight = true;
        Some(head)
    }

    /// The operation currently being dispatched.
    #[must_use]
    pub fn in_flight(&self) -> Option<&Operation> {
        if self.in_flight { self.ops.front() } else { None }
    }

    #[must_use]
    pub const fn is_dispatching(&self) -> bool {
        self.in_flight
    }

    /// Record gateway attempts spent on the in-flight operation.
    pub fn record_attempts(&mut self, attempts: u32) {
        if self.in_flight {
            if let Some(head) = self.ops.front_mut() {
                head.attempts += attempts;
            }
        }
    }

    /// Pop the in-flight operation as completed.
    pub fn complete_in_flight(&mut self) -> Option<Operation> {
        self.finish_in_flight(OperationStatus::Completed)
    }

    /// Pop the in-flight operation as failed.
    pub fn fail_in_flight(&mut self) -> Option<Operation> {
        self.finish_in_flight(OperationStatus::Failed)
    }

    fn finish_in_flight(&mut self, status: OperationStatus) -> Option<Operation> {
        if !self.in_flight {
            return None;
        }
        self.in_flight = false;
        let mut op = self.ops.pop_front()?;
        op.status = status;
        Some(op)
    }

    /// Drop every waiting operation that references `id`, marked removed.
    ///
    /// Only direct references are considered; the in-flight head is never
    /// touched.
    pub fn remove_referencing(&mut self, id: &str) -> Vec<Operation> {
        let skip = usize::from(self.in_flight);
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.ops.len());
        for (index, mut op) in self.ops.drain(..).enumerate() {
            if index >= skip && op.references(id) {
                op.status = OperationStatus::Removed;
                removed.push(op);
            } else {
                kept.push_back(op);
            }
        }
        self.ops = kept;
        removed
    }

    /// Rewrite `from` to `to` in every waiting operation. Returns the number
    /// of operations changed.
    pub fn rewrite_pending(&mut self, from: &str, to: &str) -> usize {
        let skip = usize::from(self.in_flight);
        self.ops
            .iter_mut()
            .skip(skip)
            .map(|op| op.rewrite_id(from, to))
            .filter(|changed| *changed)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Whether any queued operation still references `id`.
    #[must_use]
    pub fn references(&self, id: &str) -> bool {
        self.ops.iter().any(|op| op.references(id))
    }
}
