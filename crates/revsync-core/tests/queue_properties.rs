//! End-to-end behaviour of the queue: ordering, reconciliation, rollback
//! and dependent cancellation.

mod common;

use std::sync::Arc;

use common::{ScriptedGateway, mentions, row, table_keys};
use revsync_core::engine::{Settled, SyncEngine};
use revsync_core::gateway::{GatewayError, InMemoryGateway};
use revsync_core::graph::ReferenceGraph;
use revsync_core::model::{EntityKey, EntityKind};
use revsync_core::queue::{Action, MutationQueue, OperationStatus, OperationType};
use revsync_core::reconcile::reconcile;
use revsync_core::retry::RetryPolicy;
use revsync_core::snapshot::{SnapshotScope, capture};
use revsync_core::store::{MemoryStore, RowStore};
use serde_json::json;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn project_tree(project: &str) -> MemoryStore {
    let mut store = MemoryStore::new();
    store
        .set_row("projects", project, row(json!({ "id": project, "name": "Trial Review" })))
        .expect("project");
    store
        .set_row(
            "project_members",
            &format!("{project}::u1"),
            row(json!({ "project_id": project, "user_id": "u1", "role": "owner" })),
        )
        .expect("member");
    store
        .set_row("reviews", "R1", row(json!({ "id": "R1", "project_id": project, "name": "Review" })))
        .expect("review");
    store
        .set_row("checklists", "C1", row(json!({ "id": "C1", "review_id": "R1", "type": "amstar" })))
        .expect("checklist");
    store
}

/// Optimistically write a project and queue its creation.
fn queue_project<G: revsync_core::gateway::EntityGateway + 'static>(
    engine: &mut SyncEngine<MemoryStore, G>,
    id: &str,
    name: &str,
) {
    let scope = SnapshotScope::new().row(EntityKind::Project, id);
    let snapshot = capture(engine.store(), &scope).expect("capture");
    let project = row(json!({ "id": id, "name": name }));
    engine
        .store_mut()
        .set_row("projects", id, project.clone())
        .expect("optimistic write");
    engine.enqueue(
        OperationType::create(EntityKind::Project),
        project,
        EntityKey::id(id).expect("id"),
        Some(snapshot),
    );
}

fn queue_review<G: revsync_core::gateway::EntityGateway + 'static>(
    engine: &mut SyncEngine<MemoryStore, G>,
    id: &str,
    project: &str,
) {
    let scope = SnapshotScope::new().row(EntityKind::Review, id);
    let snapshot = capture(engine.store(), &scope).expect("capture");
    let review = row(json!({ "id": id, "project_id": project, "name": "R" }));
    engine
        .store_mut()
        .set_row("reviews", id, review.clone())
        .expect("optimistic write");
    engine.enqueue(
        OperationType::create(EntityKind::Review),
        review,
        EntityKey::id(id).expect("id"),
        Some(snapshot),
    );
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gateway_sees_every_operation_once_in_enqueue_order() {
    let server = Arc::new(InMemoryGateway::new().with_latency(std::time::Duration::from_millis(2)));
    let mut engine = SyncEngine::new(MemoryStore::new(), Arc::clone(&server));
    let names: Vec<String> = (0..8).map(|i| format!("project-{i}")).collect();
    for (i, name) in names.iter().enumerate() {
        queue_project(&mut engine, &format!("tmp-{i}"), name);
    }

    let report = engine.drain().await.expect("drain");
    assert_eq!(report.completed, names.len());

    let seen: Vec<String> = server
        .calls()
        .into_iter()
        .map(|call| {
            call.payload
                .and_then(|p| p.get("name").and_then(|n| n.as_str()).map(str::to_string))
                .unwrap_or_default()
        })
        .collect();
    assert_eq!(seen, names);
    assert_eq!(server.max_in_flight(), 1);
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[test]
fn reconciliation_leaves_no_trace_of_the_temporary_id() {
    let mut store = project_tree("P-temp");
    let mut queue = MutationQueue::new();

    let report = reconcile(
        &mut store,
        &mut queue,
        &ReferenceGraph::standard(),
        "P-temp",
        "P-server",
        EntityKind::Project,
    )
    .expect("reconcile");

    assert!(mentions(&store, "P-temp").is_empty(), "left: {:?}", mentions(&store, "P-temp"));
    let review = store.get_row("reviews", "R1").expect("get").expect("review");
    assert_eq!(review["project_id"], "P-server");
    assert_eq!(table_keys(&store, "project_members"), vec!["P-server::u1".to_string()]);
    assert_eq!(table_keys(&store, "projects"), vec!["P-server".to_string()]);
    // checklist only references the review, which kept its id
    let checklist = store.get_row("checklists", "C1").expect("get").expect("checklist");
    assert_eq!(checklist["review_id"], "R1");
    assert_eq!(report.rows_rekeyed, 2);
    assert_eq!(report.rows_patched, 1);
}

#[test]
fn reconciling_twice_changes_nothing_the_second_time() {
    let mut store = project_tree("P-temp");
    let mut queue = MutationQueue::new();
    let graph = ReferenceGraph::standard();

    reconcile(&mut store, &mut queue, &graph, "P-temp", "P-server", EntityKind::Project)
        .expect("first");
    let revision = store.revision();
    let tables = store.tables().clone();

    let second = reconcile(&mut store, &mut queue, &graph, "P-temp", "P-server", EntityKind::Project)
        .expect("second");
    assert!(second.is_noop());
    assert_eq!(store.revision(), revision);
    assert_eq!(store.tables(), &tables);
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

#[test]
fn restore_brings_back_the_exact_prior_row() {
    let mut store = MemoryStore::new();
    let draft = row(json!({ "id": "temp-1", "name": "Draft" }));
    store.set_row("projects", "temp-1", draft.clone()).expect("seed");

    let snapshot = capture(&store, &SnapshotScope::new().row(EntityKind::Project, "temp-1"))
        .expect("capture");
    store
        .set_row("projects", "temp-1", row(json!({ "id": "temp-1", "name": "Draft-edited" })))
        .expect("edit");
    snapshot.restore(&mut store).expect("restore");

    assert_eq!(store.get_row("projects", "temp-1").expect("get"), Some(draft));
}

#[test]
fn restoring_a_creation_deletes_the_row() {
    let mut store = MemoryStore::new();
    let snapshot = capture(&store, &SnapshotScope::new().row(EntityKind::Project, "temp-1"))
        .expect("capture");
    store
        .set_row("projects", "temp-1", row(json!({ "id": "temp-1", "name": "Draft" })))
        .expect("create");
    snapshot.restore(&mut store).expect("restore");

    assert_eq!(store.get_row("projects", "temp-1").expect("get"), None);
    assert!(store.get_table("projects").expect("table").is_empty());
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_parent_removes_its_queued_dependent() {
    let server = Arc::new(InMemoryGateway::new());
    let mut engine = SyncEngine::new(MemoryStore::new(), Arc::clone(&server))
        .with_policy(RetryPolicy::no_retry());
    queue_project(&mut engine, "temp-1", "Doomed");
    queue_review(&mut engine, "temp-r", "temp-1");
    server.reject_next(GatewayError::rejected(400, "invalid project"));

    let settled = engine.dispatch_next().await.expect("dispatch").expect("settled");
    let Settled::Failed { op, removed, .. } = settled else {
        panic!("expected the project create to fail");
    };
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].status, OperationStatus::Removed);
    assert_eq!(removed[0].op_type, OperationType::create(EntityKind::Review));

    assert!(engine.queue().is_empty());
    assert!(engine.dispatch_next().await.expect("nothing left").is_none());
    assert!(
        server
            .calls()
            .iter()
            .all(|call| !(call.kind == EntityKind::Review && call.action == Action::Create))
    );
    // both optimistic writes are undone
    assert!(engine.store().tables().is_empty());
}

#[tokio::test]
async fn transient_failures_are_retried_before_rolling_back() {
    let server = Arc::new(InMemoryGateway::new());
    let policy = RetryPolicy {
        max_attempts: 2,
        initial_backoff: std::time::Duration::from_millis(1),
        max_backoff: std::time::Duration::from_millis(1),
        call_timeout: std::time::Duration::from_secs(5),
    };
    let mut engine = SyncEngine::new(MemoryStore::new(), Arc::clone(&server)).with_policy(policy);
    queue_project(&mut engine, "temp-1", "Flaky");
    server.reject_next(GatewayError::Network("connection reset".into()));

    let report = engine.drain().await.expect("drain");
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(server.calls().len(), 2);
    assert_eq!(table_keys(engine.store(), "projects"), vec!["srv-1".to_string()]);
}

// ---------------------------------------------------------------------------
// Full scenario
// ---------------------------------------------------------------------------

#[tokio::test]
async fn temporary_project_becomes_server_project_and_dependents_follow() {
    let server = Arc::new(ScriptedGateway::new());
    server.respond(Ok(row(json!({ "id": "srv-9", "name": "Trial Review" }))));
    server.respond(Ok(row(json!({ "id": "srv-10", "project_id": "srv-9", "name": "R" }))));
    let mut engine = SyncEngine::new(MemoryStore::new(), Arc::clone(&server))
        .with_policy(RetryPolicy::no_retry());

    let project = row(json!({ "name": "Trial Review" }));
    engine
        .store_mut()
        .set_row("projects", "tmp-42", project.clone())
        .expect("optimistic write");
    engine.enqueue(
        OperationType::create(EntityKind::Project),
        project,
        EntityKey::id("tmp-42").expect("id"),
        None,
    );

    let ticket = engine.begin_dispatch().expect("ticket");
    // enqueued while the create is on the wire
    queue_review(&mut engine, "tmp-43", "tmp-42");
    engine.enqueue(
        OperationType::update(EntityKind::Project),
        row(json!({ "name": "Renamed" })),
        EntityKey::id("tmp-42").expect("id"),
        None,
    );
    let outcome = ticket.execute().await;
    let settled = engine.settle(outcome).expect("settle");
    assert!(matches!(settled, Settled::Completed { ref server_id, .. } if server_id.as_deref() == Some("srv-9")));

    assert_eq!(table_keys(engine.store(), "projects"), vec!["srv-9".to_string()]);
    assert!(!engine.queue().references("tmp-42"));
    let waiting: Vec<_> = engine.queue().iter().cloned().collect();
    assert_eq!(waiting[0].payload["project_id"], "srv-9");
    assert_eq!(waiting[1].target, EntityKey::id("srv-9").expect("id"));

    let report = engine.drain().await.expect("drain");
    assert_eq!(report.completed, 2);
    assert!(engine.queue().is_empty());
    assert_eq!(table_keys(engine.store(), "reviews"), vec!["srv-10".to_string()]);
    assert!(mentions(engine.store(), "tmp-4").is_empty());

    let calls = server.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[1].2["project_id"], "srv-9");
    assert_eq!(calls[2].0, Action::Update);
}
