//! Invariants checked once a simulated session has drained its queue.

use std::collections::BTreeSet;
use std::fmt;

use revsync_core::gateway::InMemoryGateway;
use revsync_core::graph::ReferenceGraph;
use revsync_core::model::{EntityKind, TempIdGenerator, str_field};
use revsync_core::store::{MemoryStore, RowStore, StoreError};
use serde_json::Value;

/// What the driver observed while running one seed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRecord {
    /// Sequence numbers in enqueue order.
    pub enqueued: Vec<u64>,
    /// Sequence numbers in the order they were handed to the gateway.
    pub dispatched: Vec<u64>,
    /// Operations dropped because an operation they depended on failed.
    pub removed: BTreeSet<u64>,
    /// Operations left in the queue after the final drain.
    pub remaining: usize,
}

// ── Violations ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    QueueNotDrained {
        remaining: usize,
    },
    ConcurrentDispatch {
        max_in_flight: usize,
    },
    /// `next` went to the gateway after `previous` although it was queued
    /// earlier, or was never queued at all.
    OutOfOrderDispatch {
        previous: Option<u64>,
        next: u64,
    },
    RemovedOperationSent {
        seq: u64,
    },
    TemporaryIdLeaked {
        table: String,
        key: String,
    },
    DanglingReference {
        table: String,
        key: String,
        field: &'static str,
        parent: String,
    },
    /// A local row the server never accepted, or accepted with other content.
    RowDiverged {
        table: String,
        key: String,
        server: Option<String>,
    },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueNotDrained { remaining } => {
                write!(f, "QueueNotDrained: {remaining} operations left after drain")
            }
            Self::ConcurrentDispatch { max_in_flight } => {
                write!(f, "ConcurrentDispatch: {max_in_flight} calls were in flight at once")
            }
            Self::OutOfOrderDispatch { previous, next } => match previous {
                Some(previous) => write!(f, "OutOfOrderDispatch: op {next} sent after op {previous}"),
                None => write!(f, "OutOfOrderDispatch: op {next} sent but never queued"),
            },
            Self::RemovedOperationSent { seq } => {
                write!(f, "RemovedOperationSent: removed op {seq} reached the gateway")
            }
            Self::TemporaryIdLeaked { table, key } => {
                write!(f, "TemporaryIdLeaked: {table}/{key} still holds a temporary id")
            }
            Self::DanglingReference {
                table,
                key,
                field,
                parent,
            } => write!(f, "DanglingReference: {table}/{key}.{field} points at missing {parent}"),
            Self::RowDiverged { table, key, server } => match server {
                Some(server) => write!(f, "RowDiverged: {table}/{key} differs from server copy {server}"),
                None => write!(f, "RowDiverged: {table}/{key} is unknown to the server"),
            },
        }
    }
}

// ── Oracle ───────────────────────────────────────────────────────────────────

pub struct QueueOracle<'a> {
    graph: &'a ReferenceGraph,
    ids: &'a TempIdGenerator,
}

impl<'a> QueueOracle<'a> {
    #[must_use]
    pub fn new(graph: &'a ReferenceGraph, ids: &'a TempIdGenerator) -> Self {
        Self { graph, ids }
    }

    /// Run every check and collect all violations.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the local store cannot be read.
    pub fn check_all(
        &self,
        record: &RunRecord,
        store: &MemoryStore,
        server: &InMemoryGateway,
    ) -> Result<Vec<InvariantViolation>, StoreError> {
        let mut violations = Vec::new();
        violations.extend(check_drained(record));
        violations.extend(check_serial(record, server.max_in_flight()));
        violations.extend(check_removed_not_sent(record));
        violations.extend(self.check_no_temporary_ids(store));
        violations.extend(self.check_references(store)?);
        violations.extend(check_matches_server(store, server));
        Ok(violations)
    }

    fn check_no_temporary_ids(&self, store: &MemoryStore) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        for (table, rows) in store.tables() {
            for (key, row) in rows {
                let leaked = key.contains(self.ids.prefix())
                    || row.values().any(|value| self.mentions_temporary(value));
                if leaked {
                    violations.push(InvariantViolation::TemporaryIdLeaked {
                        table: table.clone(),
                        key: key.clone(),
                    });
                }
            }
        }
        violations
    }

    fn mentions_temporary(&self, value: &Value) -> bool {
        match value {
            Value::String(s) => self.ids.is_temporary(s),
            Value::Array(items) => items.iter().any(|v| self.mentions_temporary(v)),
            Value::Object(map) => map.values().any(|v| self.mentions_temporary(v)),
            _ => false,
        }
    }

    fn check_references(&self, store: &MemoryStore) -> Result<Vec<InvariantViolation>, StoreError> {
        let mut violations = Vec::new();
        for edge in self.graph.edges() {
            let table = edge.child.table();
            for (key, row) in store.get_table(table)? {
                let Some(parent) = str_field(&row, edge.field) else {
                    continue;
                };
                if store.get_row(edge.parent.table(), parent)?.is_none() {
                    violations.push(InvariantViolation::DanglingReference {
                        table: table.to_string(),
                        key,
                        field: edge.field,
                        parent: parent.to_string(),
                    });
                }
            }
        }
        Ok(violations)
    }
}

fn check_drained(record: &RunRecord) -> Option<InvariantViolation> {
    (record.remaining > 0).then_some(InvariantViolation::QueueNotDrained {
        remaining: record.remaining,
    })
}

fn check_serial(record: &RunRecord, max_in_flight: usize) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    if max_in_flight > 1 {
        violations.push(InvariantViolation::ConcurrentDispatch { max_in_flight });
    }
    let queued: BTreeSet<u64> = record.enqueued.iter().copied().collect();
    let mut previous: Option<u64> = None;
    for &next in &record.dispatched {
        if !queued.contains(&next) {
            violations.push(InvariantViolation::OutOfOrderDispatch { previous: None, next });
        } else if previous.is_some_and(|p| next <= p) {
            violations.push(InvariantViolation::OutOfOrderDispatch { previous, next });
        }
        previous = Some(next);
    }
    violations
}

fn check_removed_not_sent(record: &RunRecord) -> Vec<InvariantViolation> {
    record
        .dispatched
        .iter()
        .filter(|seq| record.removed.contains(seq))
        .map(|&seq| InvariantViolation::RemovedOperationSent { seq })
        .collect()
}

fn check_matches_server(store: &MemoryStore, server: &InMemoryGateway) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for (table, rows) in store.tables() {
        let Some(kind) = EntityKind::from_table(table) else {
            continue;
        };
        let accepted = server.entities(kind);
        for (key, row) in rows {
            match accepted.get(key) {
                Some(remote) if remote == row => {}
                remote => violations.push(InvariantViolation::RowDiverged {
                    table: table.clone(),
                    key: key.clone(),
                    server: remote.map(|r| Value::Object(r.clone()).to_string()),
                }),
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> revsync_core::model::Row {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn dispatch_must_follow_enqueue_order() {
        let record = RunRecord {
            enqueued: vec![1, 2, 3],
            dispatched: vec![1, 3, 2, 9],
            ..RunRecord::default()
        };
        let violations = check_serial(&record, 1);
        assert_eq!(
            violations,
            vec![
                InvariantViolation::OutOfOrderDispatch { previous: Some(3), next: 2 },
                InvariantViolation::OutOfOrderDispatch { previous: None, next: 9 },
            ]
        );
        assert_eq!(check_serial(&record, 2).len(), 3);
    }

    #[test]
    fn removed_operations_must_not_be_sent() {
        let record = RunRecord {
            enqueued: vec![1, 2],
            dispatched: vec![1, 2],
            removed: BTreeSet::from([2]),
            remaining: 0,
        };
        assert_eq!(
            check_removed_not_sent(&record),
            vec![InvariantViolation::RemovedOperationSent { seq: 2 }]
        );
    }

    #[test]
    fn leaks_and_dangling_rows_are_reported() {
        let graph = ReferenceGraph::standard();
        let ids = TempIdGenerator::seeded("tmp-", 1);
        let oracle = QueueOracle::new(&graph, &ids);
        let mut store = MemoryStore::new();
        store
            .set_row("reviews", "srv-2", row(json!({ "id": "srv-2", "project_id": "tmp-0000-1" })))
            .expect("seed");

        let violations = oracle.check_all(&RunRecord::default(), &store, &InMemoryGateway::new()).expect("check");
        let names: Vec<String> = violations.iter().map(ToString::to_string).collect();
        assert!(names.iter().any(|v| v.starts_with("TemporaryIdLeaked")));
        assert!(names.iter().any(|v| v.starts_with("DanglingReference")));
        assert!(names.iter().any(|v| v.starts_with("RowDiverged")));
    }

    #[test]
    fn clean_state_passes() {
        let graph = ReferenceGraph::standard();
        let ids = TempIdGenerator::seeded("tmp-", 1);
        let oracle = QueueOracle::new(&graph, &ids);
        let violations = oracle
            .check_all(&RunRecord::default(), &MemoryStore::new(), &InMemoryGateway::new())
            .expect("check");
        assert!(violations.is_empty());
    }
}
