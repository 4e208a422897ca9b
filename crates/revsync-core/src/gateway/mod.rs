//! Contract for the server of record.
//!
//! The queue needs only an operation type, a payload and, for creates, the
//! identifier the server assigned. How the calls travel is up to the
//! implementation.

pub mod memory;

pub use memory::InMemoryGateway;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ErrorCode;
use crate::model::{EntityKind, Row};
use crate::queue::{Action, Operation};

/// Failure of one gateway call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server rejected the request ({status}): {detail}")]
    Rejected { status: u16, detail: String },
    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),
    #[error("create response carried no identifier")]
    MissingId,
}

impl GatewayError {
    /// Convenience constructor for a rejection.
    #[must_use]
    pub fn rejected(status: u16, detail: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            detail: detail.into(),
        }
    }

    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Rejected { status, .. } => *status >= 500 || *status == 429,
            Self::MissingId => false,
        }
    }

    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Network(_) => ErrorCode::GatewayUnreachable,
            Self::Rejected { .. } => ErrorCode::GatewayRejected,
            Self::Timeout(_) => ErrorCode::GatewayTimeout,
            Self::MissingId => ErrorCode::GatewayMissingId,
        }
    }
}

/// Per-entity create/update/delete calls against the server.
#[async_trait]
pub trait EntityGateway: Send + Sync {
    /// Create an entity; the returned row carries the server-assigned `id`
    /// for kinds that have one.
    async fn create(&self, kind: EntityKind, payload: &Row) -> Result<Row, GatewayError>;

    async fn update(&self, kind: EntityKind, id: &str, payload: &Row) -> Result<(), GatewayError>;

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), GatewayError>;
}

/// The call an operation turns into.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayRequest {
    Create { kind: EntityKind, payload: Row },
    Update { kind: EntityKind, id: String, payload: Row },
    Delete { kind: EntityKind, id: String },
}

impl GatewayRequest {
    #[must_use]
    pub fn from_operation(op: &Operation) -> Self {
        let kind = op.op_type.kind;
        match op.op_type.action {
            Action::Create => Self::Create {
                kind,
                payload: op.payload.clone(),
            },
            Action::Update => Self::Update {
                kind,
                id: op.target.row_key(),
                payload: op.payload.clone(),
            },
            Action::Delete => Self::Delete {
                kind,
                id: op.target.row_key(),
            },
        }
    }

    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Create { kind, .. } | Self::Update { kind, .. } | Self::Delete { kind, .. } => {
                *kind
            }
        }
    }

    /// Send the request. Creates return the server's row; the other calls
    /// return `None`.
    ///
    /// # Errors
    ///
    /// Propagates the gateway's error.
    pub async fn send<G: EntityGateway + ?Sized>(
        &self,
        gateway: &G,
    ) -> Result<Option<Row>, GatewayError> {
        match self {
            Self::Create { kind, payload } => gateway.create(*kind, payload).await.map(Some),
            Self::Update { kind, id, payload } => {
                gateway.update(*kind, id, payload).await.map(|()| None)
            }
            Self::Delete { kind, id } => gateway.delete(*kind, id).await.map(|()| None),
        }
    }
}
