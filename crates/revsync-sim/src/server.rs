//! Fault-injecting server of record.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use revsync_core::gateway::{EntityGateway, GatewayError, InMemoryGateway};
use revsync_core::model::{EntityKind, Row};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::rng::DeterministicRng;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Chance that a call fails with a network error before reaching the
    /// server (percent, 0-100).
    pub transient_percent: u8,
    /// Transient faults in a row never exceed this, so a retry budget larger
    /// than it always gets through.
    pub max_consecutive_transient: u32,
    /// Chance that a create of a kind in `reject_kinds` is refused (percent).
    pub reject_percent: u8,
    pub reject_kinds: BTreeSet<EntityKind>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            transient_percent: 15,
            max_consecutive_transient: 2,
            reject_percent: 5,
            reject_kinds: EntityKind::ALL
                .into_iter()
                .filter(|kind| kind.has_own_id())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultCounts {
    pub transient: u64,
    pub rejected: u64,
}

#[derive(Debug)]
struct FaultState {
    rng: DeterministicRng,
    consecutive_transient: u32,
    counts: FaultCounts,
}

/// [`InMemoryGateway`] behind a seeded fault injector.
#[derive(Debug)]
pub struct FaultyServer {
    inner: InMemoryGateway,
    faults: FaultConfig,
    state: Mutex<FaultState>,
}

impl FaultyServer {
    #[must_use]
    pub fn new(seed: u64, faults: FaultConfig) -> Self {
        Self {
            inner: InMemoryGateway::new(),
            faults,
            state: Mutex::new(FaultState {
                rng: DeterministicRng::new(seed),
                consecutive_transient: 0,
                counts: FaultCounts::default(),
            }),
        }
    }

    /// The underlying server, for inspecting what it accepted.
    #[must_use]
    pub fn inner(&self) -> &InMemoryGateway {
        &self.inner
    }

    #[must_use]
    pub fn counts(&self) -> FaultCounts {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).counts
    }

    fn inject(&self, kind: EntityKind, creating: bool) -> Result<(), GatewayError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.consecutive_transient < self.faults.max_consecutive_transient
            && state.rng.percent(self.faults.transient_percent)
        {
            state.consecutive_transient += 1;
            state.counts.transient += 1;
            trace!(%kind, "injected transient fault");
            return Err(GatewayError::Network("injected connection reset".to_string()));
        }
        state.consecutive_transient = 0;

        if creating
            && self.faults.reject_kinds.contains(&kind)
            && state.rng.percent(self.faults.reject_percent)
        {
            state.counts.rejected += 1;
            trace!(%kind, "injected rejection");
            return Err(GatewayError::rejected(422, format!("{kind} refused by fault injector")));
        }
        Ok(())
    }
}

#[async_trait]
impl EntityGateway for FaultyServer {
    async fn create(&self, kind: EntityKind, payload: &Row) -> Result<Row, GatewayError> {
        self.inject(kind, true)?;
        self.inner.create(kind, payload).await
    }

    async fn update(&self, kind: EntityKind, id: &str, payload: &Row) -> Result<(), GatewayError> {
        self.inject(kind, false)?;
        self.inner.update(kind, id, payload).await
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), GatewayError> {
        self.inject(kind, false)?;
        self.inner.delete(kind, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Row {
        let mut row = Row::new();
        row.insert("name".to_string(), "P".into());
        row
    }

    #[tokio::test]
    async fn transient_faults_never_exceed_the_streak_limit() {
        let server = FaultyServer::new(
            11,
            FaultConfig {
                transient_percent: 100,
                max_consecutive_transient: 2,
                reject_percent: 0,
                reject_kinds: BTreeSet::new(),
            },
        );
        assert!(server.create(EntityKind::Project, &payload()).await.is_err());
        assert!(server.create(EntityKind::Project, &payload()).await.is_err());
        let created = server.create(EntityKind::Project, &payload()).await.expect("third try");
        assert_eq!(created["id"], "srv-1");
        assert_eq!(server.counts().transient, 2);
        assert_eq!(server.inner().calls().len(), 1);
    }

    #[tokio::test]
    async fn rejections_only_hit_creates_of_listed_kinds() {
        let server = FaultyServer::new(
            5,
            FaultConfig {
                transient_percent: 0,
                max_consecutive_transient: 0,
                reject_percent: 100,
                reject_kinds: BTreeSet::from([EntityKind::Review]),
            },
        );
        let project = server.create(EntityKind::Project, &payload()).await.expect("project");
        let id = project["id"].as_str().expect("id").to_string();
        server.update(EntityKind::Project, &id, &payload()).await.expect("update");

        let mut review = payload();
        review.insert("project_id".to_string(), id.into());
        let err = server.create(EntityKind::Review, &review).await.expect_err("refused");
        assert_eq!(err, GatewayError::rejected(422, "review refused by fault injector"));
        assert_eq!(server.counts().rejected, 1);
    }
}
