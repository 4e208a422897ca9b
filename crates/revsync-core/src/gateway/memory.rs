//! In-process server of record used by tests and the simulator.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Semaphore, watch};

use super::{EntityGateway, GatewayError};
use crate::graph::ReferenceGraph;
use crate::model::{CompositeKey, EntityKind, ID_FIELD, Keying, Row, str_field};
use crate::queue::Action;

/// One call as the server saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayCall {
    pub action: Action,
    pub kind: EntityKind,
    /// Target id for updates and deletes.
    pub id: Option<String>,
    pub payload: Option<Row>,
}

#[derive(Debug, Default)]
struct ServerState {
    next_id: u64,
    entities: BTreeMap<EntityKind, BTreeMap<String, Row>>,
    calls: Vec<GatewayCall>,
    scripted: VecDeque<GatewayError>,
    rejected_kinds: HashMap<EntityKind, GatewayError>,
    unreachable: bool,
    in_flight: usize,
    max_in_flight: usize,
}

/// Reference server: assigns `srv-N` identifiers and checks that every
/// reference field of a created entity points at an entity it knows.
#[derive(Debug)]
pub struct InMemoryGateway {
    state: Mutex<ServerState>,
    graph: ReferenceGraph,
    latency: Option<Duration>,
    gate: Option<Semaphore>,
    entered: watch::Sender<usize>,
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGateway {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            graph: ReferenceGraph::standard(),
            latency: None,
            gate: None,
            entered: watch::Sender::new(0),
        }
    }

    /// Every call sleeps for `latency` before answering.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Every call waits for a permit from [`InMemoryGateway::release`].
    #[must_use]
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    /// Let `calls` held calls through the gate.
    pub fn release(&self, calls: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(calls);
        }
    }

    /// Resolve once at least `count` calls have reached the server.
    pub async fn wait_for_calls(&self, count: usize) {
        let mut entered = self.entered.subscribe();
        // the sender lives as long as self
        let _ = entered.wait_for(|n| *n >= count).await;
    }

    /// Fail the next call with `error`, before any other check.
    pub fn reject_next(&self, error: GatewayError) {
        self.lock().scripted.push_back(error);
    }

    /// Fail every call for `kind` with `error`.
    pub fn reject_kind(&self, kind: EntityKind, error: GatewayError) {
        self.lock().rejected_kinds.insert(kind, error);
    }

    pub fn clear_rejections(&self) {
        let mut state = self.lock();
        state.scripted.clear();
        state.rejected_kinds.clear();
    }

    /// While unreachable, every call fails with a network error.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    #[must_use]
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.lock().calls.clone()
    }

    /// Highest number of calls that were ever being served at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    #[must_use]
    pub fn entity(&self, kind: EntityKind, id: &str) -> Option<Row> {
        self.lock()
            .entities
            .get(&kind)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    #[must_use]
    pub fn entities(&self, kind: EntityKind) -> BTreeMap<String, Row> {
        self.lock().entities.get(&kind).cloned().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        // a panicking test thread must not hide the call log from the others
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self, call: GatewayCall) -> Result<InFlight<'_>, GatewayError> {
        let scripted = {
            let mut state = self.lock();
            state.calls.push(call.clone());
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.scripted.pop_front()
        };
        let guard = InFlight { server: self };
        self.entered.send_modify(|n| *n += 1);

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = scripted {
            return Err(error);
        }
        let state = self.lock();
        if state.unreachable {
            return Err(GatewayError::Network("server unreachable".to_string()));
        }
        if let Some(error) = state.rejected_kinds.get(&call.kind) {
            return Err(error.clone());
        }
        Ok(guard)
    }

    fn missing_reference(&self, state: &ServerState, kind: EntityKind, payload: &Row) -> Option<String> {
        let edge = self.graph.parent_of(kind)?;
        let parent = str_field(payload, edge.field)?;
        let known = state
            .entities
            .get(&edge.parent)
            .is_some_and(|rows| rows.contains_key(parent));
        (!known).then(|| format!("{} {parent} does not exist", edge.parent))
    }
}

struct InFlight<'a> {
    server: &'a InMemoryGateway,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.server.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

#[async_trait]
impl EntityGateway for InMemoryGateway {
    async fn create(&self, kind: EntityKind, payload: &Row) -> Result<Row, GatewayError> {
        let _guard = self
            .enter(GatewayCall {
                action: Action::Create,
                kind,
                id: None,
                payload: Some(payload.clone()),
            })
            .await?;

        let mut state = self.lock();
        if let Some(detail) = self.missing_reference(&state, kind, payload) {
            return Err(GatewayError::rejected(422, detail));
        }
        let mut row = payload.clone();
        let key = match kind.keying() {
            Keying::Own => {
                state.next_id += 1;
                let id = format!("srv-{}", state.next_id);
                row.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                id
            }
            Keying::Composite {
                parent_field,
                child_field,
            } => {
                let parent = str_field(payload, parent_field).unwrap_or_default();
                let child = str_field(payload, child_field).unwrap_or_default();
                CompositeKey::new(parent, child)
                    .map_err(|err| GatewayError::rejected(422, err.to_string()))?
                    .to_string()
            }
        };
        state.entities.entry(kind).or_default().insert(key, row.clone());
        Ok(row)
    }

    async fn update(&self, kind: EntityKind, id: &str, payload: &Row) -> Result<(), GatewayError> {
        let _guard = self
            .enter(GatewayCall {
                action: Action::Update,
                kind,
                id: Some(id.to_string()),
                payload: Some(payload.clone()),
            })
            .await?;

        let mut state = self.lock();
        let row = state
            .entities
            .get_mut(&kind)
            .and_then(|rows| rows.get_mut(id))
            .ok_or_else(|| GatewayError::rejected(404, format!("{kind} {id} not found")))?;
        for (field, value) in payload {
            if field != ID_FIELD {
                row.insert(field.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), GatewayError> {
        let _guard = self
            .enter(GatewayCall {
                action: Action::Delete,
                kind,
                id: Some(id.to_string()),
                payload: None,
            })
            .await?;

        let mut state = self.lock();
        state
            .entities
            .get_mut(&kind)
            .and_then(|rows| rows.remove(id))
            .map(|_| ())
            .ok_or_else(|| GatewayError::rejected(404, format!("{kind} {id} not found")))
    }
}
