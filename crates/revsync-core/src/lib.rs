//! revsync-core library.
//!
//! Offline-first write path for the review-checklist data model: local
//! actions write optimistically to a row store and enqueue an operation;
//! the engine replays the queue serially against the server, swaps
//! temporary identifiers for server ones and rolls back rejected writes.
//!
//! # Conventions
//!
//! - **Errors**: typed `thiserror` enums carrying an [`error::ErrorCode`];
//!   `anyhow::Result` only for configuration loading.
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `error!`, `debug!`).

pub mod actions;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod graph;
pub mod model;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod snapshot;
pub mod store;
pub mod worker;

pub use actions::{ActionError, LocalActions, Mutation};
pub use config::{RevsyncConfig, resolve_config};
pub use connectivity::{AlwaysOnline, ConnectivityOracle, NetworkStatus, NetworkStatusSetter, network_status};
pub use engine::{DrainReport, EngineError, QueueEvent, Settled, SyncEngine};
pub use error::ErrorCode;
pub use gateway::{EntityGateway, GatewayError, GatewayRequest, InMemoryGateway};
pub use graph::ReferenceGraph;
pub use model::{EntityKey, EntityKind, Row, TempIdGenerator};
pub use queue::{MutationQueue, Operation, OperationStatus, OperationType};
pub use reconcile::{ReconcileReport, reconcile};
pub use retry::RetryPolicy;
pub use snapshot::{Snapshot, SnapshotScope};
pub use store::{MemoryStore, RowStore, SharedStore, SqliteStore, StoreError};
pub use worker::{SyncHandle, SyncWorker, WorkerError};
