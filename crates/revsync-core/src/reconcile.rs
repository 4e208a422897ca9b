//! Identifier reconciliation: replace a temporary id with its server id in
//! the queue and in every row the reference graph says can hold it.

use std::collections::VecDeque;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::graph::ReferenceGraph;
use crate::model::{CompositeKey, EntityKind, ID_FIELD, str_field};
use crate::queue::MutationQueue;
use crate::store::{RowStore, RowWrite, StoreError};

/// What one reconciliation changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Queued operations whose target, payload or snapshot was rewritten.
    pub ops_rewritten: usize,
    /// Rows moved to a new row key.
    pub rows_rekeyed: usize,
    /// Rows whose reference field was patched in place.
    pub rows_patched: usize,
}

impl ReconcileReport {
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.ops_rewritten == 0 && self.rows_rekeyed == 0 && self.rows_patched == 0
    }
}

/// Rewrite `temp` to `server` for an entity of `kind`.
///
/// Order matters: waiting queue entries are rewritten first, then the
/// entity's own row is moved, then every descendant table reachable through
/// `graph` is swept. Rows whose key is built from a rewritten id are
/// re-keyed and swept in turn. Writes of one level land as one batch.
///
/// Calling it again once nothing references `temp` changes nothing.
///
/// # Errors
///
/// Returns a [`StoreError`] if the store cannot be read or written.
pub fn reconcile<S: RowStore + ?Sized>(
    store: &mut S,
    queue: &mut MutationQueue,
    graph: &ReferenceGraph,
    temp: &str,
    server: &str,
    kind: EntityKind,
) -> Result<ReconcileReport, StoreError> {
    let mut report = ReconcileReport::default();
    if temp == server {
        return Ok(report);
    }

    report.ops_rewritten = queue.rewrite_pending(temp, server);

    let mut own_row = Vec::new();
    if kind.has_own_id() {
        if let Some(mut row) = store.get_row(kind.table(), temp)? {
            if row.contains_key(ID_FIELD) {
                row.insert(ID_FIELD.to_string(), Value::String(server.to_string()));
            }
            own_row.push(RowWrite::delete(kind.table(), temp));
            own_row.push(RowWrite::set(kind.table(), server, row));
            report.rows_rekeyed += 1;
        } else {
            debug!(%kind, temp, "no local row to move during reconciliation");
        }
    }

    let mut worklist = VecDeque::from([(kind, temp.to_string(), server.to_string())]);
    let mut writes = own_row;
    while let Some((parent, old, new)) = worklist.pop_front() {
        for edge in graph.children_of(parent) {
            let table = edge.child.table();
            for (key, row) in store.get_table(table)? {
                if str_field(&row, edge.field) != Some(old.as_str()) {
                    continue;
                }
                let mut row = row;
                row.insert(edge.field.to_string(), Value::String(new.clone()));

                let rekeyed = edge
                    .rekeys_child()
                    .then(|| CompositeKey::parse(&key))
                    .flatten()
                    .filter(|composite| composite.parent == old)
                    .map(|composite| composite.with_parent(&new).to_string());

                match rekeyed {
                    Some(new_key) => {
                        writes.push(RowWrite::delete(table, &key));
                        writes.push(RowWrite::set(table, &new_key, row));
                        report.rows_rekeyed += 1;
                        worklist.push_back((edge.child, key, new_key));
                    }
                    None => {
                        writes.push(RowWrite::set(table, &key, row));
                        report.rows_patched += 1;
                    }
                }
            }
        }
        if !writes.is_empty() {
            store.apply(std::mem::take(&mut writes))?;
        }
    }

    if report.is_noop() {
        debug!(%kind, temp, server, "reconciliation found nothing to rewrite");
    } else {
        info!(
            %kind,
            temp,
            server,
            ops = report.ops_rewritten,
            rekeyed = report.rows_rekeyed,
            patched = report.rows_patched,
            "reconciled temporary identifier"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKey, Row};
    use crate::queue::OperationType;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap_or_default()
    }

    fn seeded() -> MemoryStore {
        let mut store = MemoryStore::new();
        store
            .apply(vec![
                RowWrite::set("projects", "tmp-p", row(json!({ "id": "tmp-p", "name": "Trial" }))),
                RowWrite::set(
                    "project_members",
                    "tmp-p::u1",
                    row(json!({ "project_id": "tmp-p", "user_id": "u1" })),
                ),
                RowWrite::set(
                    "reviews",
                    "tmp-r",
                    row(json!({ "id": "tmp-r", "project_id": "tmp-p" })),
                ),
                RowWrite::set(
                    "reviews",
                    "srv-other",
                    row(json!({ "id": "srv-other", "project_id": "srv-x" })),
                ),
            ])
            .expect("seed");
        store
    }

    #[test]
    fn moves_own_row_and_patches_children() {
        let mut store = seeded();
        let mut queue = MutationQueue::new();
        let report = reconcile(
            &mut store,
            &mut queue,
            &ReferenceGraph::standard(),
            "tmp-p",
            "srv-1",
            EntityKind::Project,
        )
        .expect("reconcile");

        assert_eq!(
            report,
            ReconcileReport {
                ops_rewritten: 0,
                rows_rekeyed: 2,
                rows_patched: 1,
            }
        );
        assert_eq!(store.get_row("projects", "tmp-p").expect("get"), None);
        assert_eq!(
            store.get_row("projects", "srv-1").expect("get"),
            Some(row(json!({ "id": "srv-1", "name": "Trial" })))
        );
        assert_eq!(store.get_row("project_members", "tmp-p::u1").expect("get"), None);
        assert_eq!(
            store.get_row("project_members", "srv-1::u1").expect("get"),
            Some(row(json!({ "project_id": "srv-1", "user_id": "u1" })))
        );
        assert_eq!(
            store.get_row("reviews", "tmp-r").expect("get"),
            Some(row(json!({ "id": "tmp-r", "project_id": "srv-1" })))
        );
        assert_eq!(
            store.get_row("reviews", "srv-other").expect("get"),
            Some(row(json!({ "id": "srv-other", "project_id": "srv-x" })))
        );
    }

    #[test]
    fn review_rekeys_assignments_and_patches_checklists() {
        let mut store = MemoryStore::new();
        store
            .apply(vec![
                RowWrite::set("reviews", "tmp-r", row(json!({ "id": "tmp-r", "project_id": "srv-1" }))),
                RowWrite::set(
                    "review_assignments",
                    "tmp-r::u2",
                    row(json!({ "review_id": "tmp-r", "user_id": "u2" })),
                ),
                RowWrite::set(
                    "checklists",
                    "tmp-c",
                    row(json!({ "id": "tmp-c", "review_id": "tmp-r", "type": "amstar2" })),
                ),
                RowWrite::set(
                    "checklists",
                    "srv-7",
                    row(json!({ "id": "srv-7", "review_id": "srv-3" })),
                ),
            ])
            .expect("seed");
        let mut queue = MutationQueue::new();
        queue.enqueue(
            OperationType::create(EntityKind::Checklist),
            row(json!({ "review_id": "tmp-r" })),
            EntityKey::id("tmp-c").expect("id"),
            None,
        );
        let revision = store.revision();

        let report = reconcile(
            &mut store,
            &mut queue,
            &ReferenceGraph::standard(),
            "tmp-r",
            "srv-2",
            EntityKind::Review,
        )
        .expect("reconcile");

        assert_eq!(
            report,
            ReconcileReport {
                ops_rewritten: 1,
                rows_rekeyed: 2,
                rows_patched: 1,
            }
        );
        assert_eq!(store.get_row("reviews", "tmp-r").expect("get"), None);
        assert_eq!(
            store.get_row("reviews", "srv-2").expect("get"),
            Some(row(json!({ "id": "srv-2", "project_id": "srv-1" })))
        );
        assert_eq!(store.get_row("review_assignments", "tmp-r::u2").expect("get"), None);
        assert_eq!(
            store.get_row("review_assignments", "srv-2::u2").expect("get"),
            Some(row(json!({ "review_id": "srv-2", "user_id": "u2" })))
        );
        assert_eq!(
            store.get_row("checklists", "tmp-c").expect("get"),
            Some(row(json!({ "id": "tmp-c", "review_id": "srv-2", "type": "amstar2" })))
        );
        assert_eq!(
            store.get_row("checklists", "srv-7").expect("get"),
            Some(row(json!({ "id": "srv-7", "review_id": "srv-3" })))
        );
        assert_eq!(queue.iter().next().map(|op| op.payload["review_id"].clone()), Some(json!("srv-2")));
        assert_eq!(store.revision(), revision + 1);
    }

    #[test]
    fn checklist_patches_its_answers() {
        let mut store = MemoryStore::new();
        store
            .apply(vec![
                RowWrite::set(
                    "checklists",
                    "tmp-c",
                    row(json!({ "id": "tmp-c", "review_id": "srv-2" })),
                ),
                RowWrite::set(
                    "checklist_answers",
                    "tmp-a",
                    row(json!({ "id": "tmp-a", "checklist_id": "tmp-c", "question": "q1" })),
                ),
                RowWrite::set(
                    "checklist_answers",
                    "srv-9",
                    row(json!({ "id": "srv-9", "checklist_id": "srv-8", "question": "q1" })),
                ),
            ])
            .expect("seed");

        let report = reconcile(
            &mut store,
            &mut MutationQueue::new(),
            &ReferenceGraph::standard(),
            "tmp-c",
            "srv-4",
            EntityKind::Checklist,
        )
        .expect("reconcile");

        assert_eq!(
            report,
            ReconcileReport {
                ops_rewritten: 0,
                rows_rekeyed: 1,
                rows_patched: 1,
            }
        );
        assert_eq!(store.get_row("checklists", "tmp-c").expect("get"), None);
        assert_eq!(
            store.get_row("checklists", "srv-4").expect("get"),
            Some(row(json!({ "id": "srv-4", "review_id": "srv-2" })))
        );
        assert_eq!(
            store.get_row("checklist_answers", "tmp-a").expect("get"),
            Some(row(json!({ "id": "tmp-a", "checklist_id": "srv-4", "question": "q1" })))
        );
        assert_eq!(
            store.get_row("checklist_answers", "srv-9").expect("get"),
            Some(row(json!({ "id": "srv-9", "checklist_id": "srv-8", "question": "q1" })))
        );
    }

    #[test]
    fn rewrites_waiting_operations_first() {
        let mut store = seeded();
        let mut queue = MutationQueue::new();
        queue.enqueue(
            OperationType::create(EntityKind::Project),
            Row::new(),
            EntityKey::id("tmp-p").expect("id"),
            None,
        );
        queue.enqueue(
            OperationType::create(EntityKind::Review),
            row(json!({ "project_id": "tmp-p" })),
            EntityKey::id("tmp-r").expect("id"),
            None,
        );
        queue.begin_dispatch();

        let report = reconcile(
            &mut store,
            &mut queue,
            &ReferenceGraph::standard(),
            "tmp-p",
            "srv-1",
            EntityKind::Project,
        )
        .expect("reconcile");
        assert_eq!(report.ops_rewritten, 1);
        let review = queue.iter().nth(1).expect("review op");
        assert_eq!(review.payload["project_id"], "srv-1");
        // the in-flight create keeps its original target
        assert_eq!(queue.iter().next().map(|op| op.target.to_string()), Some("tmp-p".into()));
    }

    #[test]
    fn second_call_is_a_no_op() {
        let mut store = seeded();
        let mut queue = MutationQueue::new();
        let graph = ReferenceGraph::standard();
        reconcile(&mut store, &mut queue, &graph, "tmp-p", "srv-1", EntityKind::Project)
            .expect("first");
        let revision = store.revision();
        let again = reconcile(&mut store, &mut queue, &graph, "tmp-p", "srv-1", EntityKind::Project)
            .expect("second");
        assert!(again.is_noop());
        assert_eq!(store.revision(), revision, "no writes, no notifications");
    }

    #[test]
    fn identical_ids_are_a_no_op() {
        let mut store = seeded();
        let revision = store.revision();
        let report = reconcile(
            &mut store,
            &mut MutationQueue::new(),
            &ReferenceGraph::standard(),
            "tmp-p",
            "tmp-p",
            EntityKind::Project,
        )
        .expect("reconcile");
        assert!(report.is_noop());
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn own_row_move_and_first_level_land_in_one_batch() {
        let mut store = seeded();
        let revision = store.revision();
        reconcile(
            &mut store,
            &mut MutationQueue::new(),
            &ReferenceGraph::standard(),
            "tmp-p",
            "srv-1",
            EntityKind::Project,
        )
        .expect("reconcile");
        // one batch for the project level; re-keyed members have no children
        assert_eq!(store.revision(), revision + 1);
    }
}
