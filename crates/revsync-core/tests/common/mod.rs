//! Shared helpers for the revsync-core integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use revsync_core::gateway::{EntityGateway, GatewayError};
use revsync_core::model::{EntityKind, Row};
use revsync_core::queue::Action;
use revsync_core::store::{MemoryStore, RowStore};
use serde_json::Value;

pub fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap_or_default()
}

/// Every `(table, key)` pair and every serialized row that mentions `needle`.
pub fn mentions(store: &MemoryStore, needle: &str) -> Vec<String> {
    let mut hits = Vec::new();
    for (table, rows) in store.tables() {
        for (key, body) in rows {
            let text = serde_json::to_string(body).unwrap_or_default();
            if key.contains(needle) || text.contains(needle) {
                hits.push(format!("{table}/{key}"));
            }
        }
    }
    hits
}

pub fn table_keys<S: RowStore>(store: &S, table: &str) -> Vec<String> {
    store
        .get_table(table)
        .expect("read table")
        .into_keys()
        .collect()
}

/// Gateway that answers creates from a script and records every call.
#[derive(Default)]
pub struct ScriptedGateway {
    responses: Mutex<VecDeque<Result<Row, GatewayError>>>,
    calls: Mutex<Vec<(Action, EntityKind, Row)>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, response: Result<Row, GatewayError>) {
        self.responses.lock().expect("script lock").push_back(response);
    }

    pub fn calls(&self) -> Vec<(Action, EntityKind, Row)> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, action: Action, kind: EntityKind, payload: &Row) {
        self.calls
            .lock()
            .expect("calls lock")
            .push((action, kind, payload.clone()));
    }
}

#[async_trait]
impl EntityGateway for ScriptedGateway {
    async fn create(&self, kind: EntityKind, payload: &Row) -> Result<Row, GatewayError> {
        self.record(Action::Create, kind, payload);
        self.responses
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| Ok(payload.clone()))
    }

    async fn update(&self, kind: EntityKind, _id: &str, payload: &Row) -> Result<(), GatewayError> {
        self.record(Action::Update, kind, payload);
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, _id: &str) -> Result<(), GatewayError> {
        self.record(Action::Delete, kind, &Row::new());
        Ok(())
    }
}
