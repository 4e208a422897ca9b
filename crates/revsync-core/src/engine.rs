//! Dispatch engine: drives the queue head through the gateway and applies
//! the outcome to the store.
//!
//! A dispatch is split in three steps so the gateway call can run without
//! holding the engine:
//!
//! 1. [`SyncEngine::begin_dispatch`] claims the head and returns a ticket.
//! 2. [`DispatchTicket::execute`] performs the call (with retries) and owns
//!    everything it needs.
//! 3. [`SyncEngine::settle`] applies the outcome: reconciliation on success,
//!    rollback and dependent removal on failure.
//!
//! [`SyncEngine::dispatch_next`] and [`SyncEngine::drain`] chain the three
//! steps for callers that do not need to interleave enqueues.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::actions::Mutation;
use crate::config::RevsyncConfig;
use crate::error::ErrorCode;
use crate::gateway::{EntityGateway, GatewayError, GatewayRequest};
use crate::graph::ReferenceGraph;
use crate::model::{EntityKey, EntityKind, ID_FIELD, Row, str_field};
use crate::queue::{JournalError, MutationQueue, Operation, OperationType, QueueJournal};
use crate::reconcile::{ReconcileReport, reconcile};
use crate::retry::{RetryPolicy, submit};
use crate::snapshot::{Snapshot, restore_all};
use crate::store::{RowStore, StoreError};

const EVENT_CAPACITY: usize = 256;

/// Per-operation notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Enqueued {
        seq: u64,
        op_type: OperationType,
        target: String,
    },
    Completed {
        seq: u64,
        op_type: OperationType,
        target: String,
    },
    Reconciled {
        kind: EntityKind,
        temp: String,
        server: String,
        report: ReconcileReport,
    },
    Failed {
        seq: u64,
        op_type: OperationType,
        target: String,
        error: GatewayError,
    },
    Removed {
        seq: u64,
        op_type: OperationType,
        target: String,
        /// The failed operation that invalidated this one.
        cause: u64,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error("operation {seq} is not the one in flight")]
    NotInFlight { seq: u64 },
}

impl EngineError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Store(err) => err.code(),
            Self::Journal(err) => err.code(),
            Self::NotInFlight { .. } => ErrorCode::InternalUnexpected,
        }
    }
}

/// The result of executing a [`DispatchTicket`].
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub seq: u64,
    pub result: Result<Option<Row>, GatewayError>,
    pub attempts: u32,
}

/// A claimed queue head, ready to be sent.
#[derive(Debug)]
pub struct DispatchTicket<G> {
    op: Operation,
    request: GatewayRequest,
    gateway: Arc<G>,
    policy: RetryPolicy,
}

impl<G: EntityGateway + 'static> DispatchTicket<G> {
    #[must_use]
    pub fn operation(&self) -> &Operation {
        &self.op
    }

    /// Perform the gateway call. The future borrows nothing from the engine.
    pub fn execute(self) -> impl Future<Output = DispatchOutcome> + Send + 'static {
        async move {
            let attempted = submit(self.gateway.as_ref(), &self.request, &self.policy).await;
            DispatchOutcome {
                seq: self.op.seq,
                result: attempted.result,
                attempts: attempted.attempts,
            }
        }
    }
}

/// What [`SyncEngine::settle`] did with an outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Settled {
    Completed {
        op: Operation,
        server_id: Option<String>,
        reconciled: Option<ReconcileReport>,
    },
    Failed {
        op: Operation,
        error: GatewayError,
        removed: Vec<Operation>,
        restored_rows: usize,
    },
}

/// Totals for one [`SyncEngine::drain`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub completed: usize,
    pub failed: usize,
    pub removed: usize,
    /// `(temporary, server)` pairs in the order they were reconciled.
    pub reconciled: Vec<(String, String)>,
}

impl DrainReport {
    pub fn record(&mut self, settled: &Settled) {
        match settled {
            Settled::Completed { op, server_id, .. } => {
                self.completed += 1;
                if let Some(server) = server_id {
                    let temp = op.target.row_key();
                    if temp != *server {
                        self.reconciled.push((temp, server.clone()));
                    }
                }
            }
            Settled::Failed { removed, .. } => {
                self.failed += 1;
                self.removed += removed.len();
            }
        }
    }
}

/// Owns the queue and applies dispatch outcomes to the store.
#[derive(Debug)]
pub struct SyncEngine<S, G> {
    store: S,
    gateway: Arc<G>,
    queue: MutationQueue,
    graph: ReferenceGraph,
    policy: RetryPolicy,
    journal: Option<QueueJournal>,
    events: broadcast::Sender<QueueEvent>,
    /// Temporary id to server id for every create settled this session.
    aliases: BTreeMap<String, String>,
}

impl<S: RowStore, G: EntityGateway + 'static> SyncEngine<S, G> {
    pub fn new(store: S, gateway: Arc<G>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            gateway,
            queue: MutationQueue::new(),
            graph: ReferenceGraph::standard(),
            policy: RetryPolicy::default(),
            journal: None,
            events,
            aliases: BTreeMap::new(),
        }
    }

    /// Build an engine from resolved settings: retry policy from `[retry]`
    /// and, when enabled, the journal under `project_root`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Journal`] when the journal cannot be locked
    /// or read.
    pub fn from_config(
        store: S,
        gateway: Arc<G>,
        config: &RevsyncConfig,
        project_root: &Path,
    ) -> Result<Self, EngineError> {
        let engine = Self::new(store, gateway).with_policy(config.to_policy());
        match config.journal_path(project_root) {
            Some(path) => engine.with_journal(QueueJournal::open(&path, config.lock_timeout())?),
            None => Ok(engine),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_graph(mut self, graph: ReferenceGraph) -> Self {
        self.graph = graph;
        self
    }

    /// Persist the queue to `journal` and resume whatever it holds.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Journal`] when the journal cannot be read.
    pub fn with_journal(mut self, journal: QueueJournal) -> Result<Self, EngineError> {
        let restored = journal.load()?;
        if !restored.is_empty() {
            debug!(operations = restored.len(), "resuming journaled operations");
        }
        for op in restored {
            self.queue.push(op);
        }
        self.journal = Some(journal);
        Ok(self)
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    #[must_use]
    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    #[must_use]
    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Counter the queue draws sequence numbers from.
    #[must_use]
    pub fn sequence(&self) -> Arc<AtomicU64> {
        self.queue.sequence()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Sender side of the event channel, for front ends that subscribe later.
    #[must_use]
    pub fn event_sender(&self) -> broadcast::Sender<QueueEvent> {
        self.events.clone()
    }

    /// Append an operation. Never fails; a journal write error is logged.
    pub fn enqueue(
        &mut self,
        op_type: OperationType,
        payload: Row,
        target: EntityKey,
        rollback: Option<Snapshot>,
    ) -> Operation {
        let mut op = Operation::new(0, op_type, target, payload, rollback);
        self.resolve_aliases(&mut op);
        let op = self.queue.enqueue(op.op_type, op.payload, op.target, op.rollback);
        self.after_enqueue(&op);
        op
    }

    pub fn enqueue_mutation(&mut self, mutation: Mutation) -> Operation {
        self.enqueue(
            mutation.op_type,
            mutation.payload,
            mutation.target,
            Some(mutation.snapshot),
        )
    }

    /// Append an operation whose sequence number was drawn elsewhere.
    ///
    /// Temporary ids whose create already settled are swapped for their
    /// server ids first, so a late arrival never carries a stale id.
    pub fn push(&mut self, mut op: Operation) {
        self.resolve_aliases(&mut op);
        self.queue.push(op.clone());
        self.after_enqueue(&op);
    }

    /// Server id recorded for `temp` this session, if its create settled.
    #[must_use]
    pub fn server_id_for(&self, temp: &str) -> Option<&str> {
        self.aliases.get(temp).map(String::as_str)
    }

    fn resolve_aliases(&self, op: &mut Operation) {
        for (temp, server) in &self.aliases {
            if op.rewrite_id(temp, server) {
                debug!(op = %op.op_type, temp, server, "late operation rewritten to server id");
            }
        }
    }

    fn after_enqueue(&self, op: &Operation) {
        debug!(seq = op.seq, op = %op.op_type, target = %op.target, queued = self.queue.len(), "enqueued");
        self.persist();
        self.emit(QueueEvent::Enqueued {
            seq: op.seq,
            op_type: op.op_type,
            target: op.target.to_string(),
        });
    }

    /// Claim the queue head. `None` when the queue is empty or a dispatch
    /// is already outstanding.
    pub fn begin_dispatch(&mut self) -> Option<DispatchTicket<G>> {
        let op = self.queue.begin_dispatch()?;
        debug!(seq = op.seq, op = %op.op_type, target = %op.target, "dispatching");
        Some(DispatchTicket {
            request: GatewayRequest::from_operation(&op),
            op,
            gateway: Arc::clone(&self.gateway),
            policy: self.policy,
        })
    }

    /// Apply the outcome of the in-flight operation.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotInFlight`] for an outcome that does not
    /// belong to the current dispatch, or a store error from reconciliation
    /// or rollback.
    pub fn settle(&mut self, outcome: DispatchOutcome) -> Result<Settled, EngineError> {
        let Some(op) = self.queue.in_flight().filter(|op| op.seq == outcome.seq).cloned() else {
            return Err(EngineError::NotInFlight { seq: outcome.seq });
        };
        self.queue.record_attempts(outcome.attempts);

        let response = match outcome.result {
            Ok(response) => response,
            Err(error) => return self.fail_in_flight(error),
        };

        let server_id = if op.op_type.assigns_id() {
            match response.as_ref().and_then(|row| str_field(row, ID_FIELD)) {
                Some(id) => Some(id.to_string()),
                None => return self.fail_in_flight(GatewayError::MissingId),
            }
        } else {
            None
        };

        // reconcile while the queue still holds every dependent
        let mut reconciled = Ok(None);
        if let Some(server) = &server_id {
            let temp = op.target.row_key();
            if temp != *server {
                let kind = op.op_type.kind;
                let (queue, graph) = (&mut self.queue, &self.graph);
                let result = self
                    .store
                    .atomically(|store| reconcile(store, queue, graph, &temp, server, kind));
                self.aliases.insert(temp.clone(), server.clone());
                reconciled = result.map(|report| {
                    self.emit(QueueEvent::Reconciled {
                        kind,
                        temp,
                        server: server.clone(),
                        report,
                    });
                    Some(report)
                });
            }
        }

        let completed = self
            .queue
            .complete_in_flight()
            .ok_or(EngineError::NotInFlight { seq: op.seq })?;
        debug!(seq = completed.seq, op = %completed.op_type, attempts = completed.attempts, "completed");
        self.persist();
        // the server accepted the change, so the operation leaves the queue
        // even when the local rewrite failed
        let reconciled = reconciled.inspect_err(|err| {
            error!(code = %err.code(), seq = completed.seq, error = %err, "reconciliation failed");
        })?;
        self.emit(QueueEvent::Completed {
            seq: completed.seq,
            op_type: completed.op_type,
            target: completed.target.to_string(),
        });
        Ok(Settled::Completed {
            op: completed,
            server_id,
            reconciled,
        })
    }

    fn fail_in_flight(&mut self, error: GatewayError) -> Result<Settled, EngineError> {
        let failed = self
            .queue
            .fail_in_flight()
            .ok_or(EngineError::NotInFlight { seq: 0 })?;
        let removed = self.queue.remove_referencing(&failed.target.row_key());

        let snapshots: Vec<&Snapshot> = std::iter::once(&failed)
            .chain(removed.iter())
            .filter_map(|op| op.rollback.as_ref())
            .collect();
        let restored = self.store.atomically(|store| restore_all(store, &snapshots));

        // both operations have left the queue whether or not the rollback
        // landed, so the journal and subscribers hear about it first
        self.persist();
        self.emit(QueueEvent::Failed {
            seq: failed.seq,
            op_type: failed.op_type,
            target: failed.target.to_string(),
            error: error.clone(),
        });
        for op in &removed {
            self.emit(QueueEvent::Removed {
                seq: op.seq,
                op_type: op.op_type,
                target: op.target.to_string(),
                cause: failed.seq,
            });
        }
        let restored_rows = restored.inspect_err(|err| {
            error!(code = %err.code(), seq = failed.seq, error = %err, "rollback failed");
        })?;

        warn!(
            code = %error.code(),
            seq = failed.seq,
            op = %failed.op_type,
            target = %failed.target,
            attempts = failed.attempts,
            removed = removed.len(),
            restored_rows,
            error = %error,
            "operation failed, local change rolled back"
        );
        for op in &removed {
            warn!(seq = op.seq, op = %op.op_type, target = %op.target, cause = failed.seq, "removed dependent operation");
        }
        Ok(Settled::Failed {
            op: failed,
            error,
            removed,
            restored_rows,
        })
    }

    /// Dispatch the head and settle it. `None` when there was nothing to do.
    ///
    /// # Errors
    ///
    /// Propagates [`SyncEngine::settle`] errors.
    pub async fn dispatch_next(&mut self) -> Result<Option<Settled>, EngineError> {
        let Some(ticket) = self.begin_dispatch() else {
            return Ok(None);
        };
        let outcome = ticket.execute().await;
        self.settle(outcome).map(Some)
    }

    /// Dispatch until the queue is empty.
    ///
    /// # Errors
    ///
    /// Stops at the first [`SyncEngine::settle`] error.
    pub async fn drain(&mut self) -> Result<DrainReport, EngineError> {
        let mut report = DrainReport::default();
        while let Some(settled) = self.dispatch_next().await? {
            report.record(&settled);
        }
        Ok(report)
    }

    fn persist(&self) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.save(self.queue.iter()) {
                error!(code = %err.code(), error = %err, "failed to persist queue journal");
            }
        }
    }

    fn emit(&self, event: QueueEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}
