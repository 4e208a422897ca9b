//! Optimistic local actions.
//!
//! Each action captures a snapshot of the rows it is about to touch, writes
//! the change to the store in one batch and returns the [`Mutation`] to
//! enqueue. New entities get temporary identifiers.
//!
//! To keep the snapshot and the write atomic with respect to other writers
//! on a [`SharedStore`](crate::store::SharedStore), call actions inside
//! [`SharedStore::with`](crate::store::SharedStore::with).

use chrono::Utc;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::ErrorCode;
use crate::graph::ReferenceGraph;
use crate::model::{EntityKey, EntityKind, KeyError, Row, TempIdGenerator, str_field};
use crate::queue::OperationType;
use crate::snapshot::{Snapshot, SnapshotScope, capture};
use crate::store::{RowStore, RowWrite, StoreError};

/// An applied optimistic change, ready to be queued.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub op_type: OperationType,
    pub target: EntityKey,
    pub payload: Row,
    pub snapshot: Snapshot,
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("{kind} {id} does not exist locally")]
    MissingParent { kind: EntityKind, id: String },
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ActionError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::MissingParent { .. } => ErrorCode::MissingParent,
            Self::NotFound { .. } => ErrorCode::RowNotFound,
            Self::Key(err) => err.code(),
            Self::Store(err) => err.code(),
        }
    }
}

fn object(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Applies UI actions to a store with temporary identifiers.
#[derive(Debug, Default)]
pub struct LocalActions {
    ids: TempIdGenerator,
    graph: ReferenceGraph,
}

impl LocalActions {
    #[must_use]
    pub fn new(ids: TempIdGenerator) -> Self {
        Self {
            ids,
            graph: ReferenceGraph::standard(),
        }
    }

    #[must_use]
    pub fn ids(&self) -> &TempIdGenerator {
        &self.ids
    }

    // ------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------

    /// # Errors
    ///
    /// Returns a store error if the write fails.
    pub fn create_project<S: RowStore + ?Sized>(
        &self,
        store: &mut S,
        name: &str,
    ) -> Result<Mutation, ActionError> {
        let id = self.ids.generate();
        let row = object(json!({
            "id": id,
            "name": name,
            "updated_at": Utc::now().to_rfc3339(),
        }));
        self.create(store, EntityKind::Project, EntityKey::id(id)?, row)
    }

    /// # Errors
    ///
    /// Returns [`ActionError::NotFound`] for an unknown project.
    pub fn rename_project<S: RowStore + ?Sized>(
        &self,
        store: &mut S,
        project_id: &str,
        name: &str,
    ) -> Result<Mutation, ActionError> {
        let changes = object(json!({
            "name": name,
            "updated_at": Utc::now().to_rfc3339(),
        }));
        self.update(store, EntityKind::Project, EntityKey::id(project_id)?, changes)
    }

    /// Delete a project with its members, reviews and everything below them.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::NotFound`] for an unknown project.
    pub fn delete_project<S: RowStore + ?Sized>(
        &self,
        store: &mut S,
        project_id: &str,
    ) -> Result<Mutation, ActionError> {
        self.delete(store, EntityKind::Project, EntityKey::id(project_id)?)
    }

    /// # Errors
    ///
    /// Returns [`ActionError::MissingParent`] for an unknown project.
    pub fn add_member<S: RowStore + ?Sized>(
        &self,
        store: &mut S,
        project_id: &str,
        user_id: &str,
        role: &str,
    ) -> Result<Mutation, ActionError> {
        let target = EntityKey::composite(project_id, user_id)?;
        let row = object(json!({
            "project_id": project_id,
            "user_id": user_id,
            "role": role,
        }));
        self.create(store, EntityKind::Membership, target, row)
    }

    /// # Errors
    ///
    /// Returns [`ActionError::NotFound`] when the user is not a member.
    pub fn remove_member<S: RowStore + ?Sized>(
        &self,
        store: &mut S,
        project_id: &str,
        user_id: &str,
    ) -> Result<Mutation, ActionError> {
        self.delete(
            store,
            EntityKind::Membership,
            EntityKey::composite(project_id, user_id)?,
        )
    }

    // ------------------------------------------------------------------
    // Reviews
    // ------------------------------------------------------------------

    /// # Errors
    ///
    /// Returns [`ActionError::MissingParent`] for an unknown project.
    pub fn create_review<S: RowStore + ?Sized>(
        &self,
        store: &mut S,
        project_id: &str,
        name: &str,
    ) -> Result<Mutation, ActionError> {
        let id = self.ids.generate();
        let row = object(json!({
            "id": id,
            "project_id": project_id,
            "name": name,
            "created_at": now_ms(),
        }));
        self.create(store, EntityKind::Review, EntityKey::id(id)?, row)
    }

    /// # Errors
    ///
    /// Returns [`ActionError::NotFound`] for an unknown review.
    pub fn delete_review<S: RowStore + ?Sized>(
        &self,
        store: &mut S,
        review_id: &str,
    ) -> Result<Mutation, ActionError> {
        self.delete(store, EntityKind::Review, EntityKey::id(review_id)?)
    }

    /// # Errors
    ///
    /// Returns [`ActionError::MissingParent`] for an unknown review.
    pub fn assign_reviewer<S: RowStore + ?Sized>(
        &self,
        store: &mut S,
        review_id: &str,
        user_id: &str,
    ) -> Result<Mutation, ActionError> {
        let target = EntityKey::composite(review_id, user_id)?;
        let row = object(json!({ "review_id": review_id, "user_id": user_id }));
        self.create(store, EntityKind::Assignment, target, row)
    }

    // ------------------------------------------------------------------
    // Checklists and answers
    // ------------------------------------------------------------------

    /// # Errors
    ///
    /// Returns [`ActionError::MissingParent`] for an unknown review.
    pub fn create_checklist<S: RowStore + ?Sized>(
        &self,
        store: &mut S,
        review_id: &str,
        reviewer_id: Option<&str>,
        checklist_type: &str,
    ) -> Result<Mutation, ActionError> {
        let id = self.ids.generate();
        let mut row = object(json!({
            "id": id,
            "review_id": review_id,
            "type": checklist_type,
            "updated_at": now_ms(),
        }));
        if let Some(reviewer) = reviewer_id {
            row.insert("reviewer_id".to_string(), Value::String(reviewer.to_string()));
        }
        self.create(store, EntityKind::Checklist, EntityKey::id(id)?, row)
    }

    /// # Errors
    ///
    /// Returns [`ActionError::NotFound`] for an unknown checklist.
    pub fn complete_checklist<S: RowStore + ?Sized>(
        &self,
        store: &mut S,
        checklist_id: &str,
    ) -> Result<Mutation, ActionError> {
        let now = now_ms();
        let changes = object(json!({ "completed_at": now, "updated_at": now }));
        self.update(store, EntityKind::Checklist, EntityKey::id(checklist_id)?, changes)
    }

    /// # Errors
    ///
    /// Returns [`ActionError::NotFound`] for an unknown checklist.
    pub fn delete_checklist<S: RowStore + ?Sized>(
        &self,
        store: &mut S,
        checklist_id: &str,
    ) -> Result<Mutation, ActionError> {
        self.delete(store, EntityKind::Checklist, EntityKey::id(checklist_id)?)
    }

    /// Save the answer to one question. The first save for a question
    /// creates the answer row; later saves update it.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::MissingParent`] for an unknown checklist.
    pub fn save_answer<S: RowStore + ?Sized>(
        &self,
        store: &mut S,
        checklist_id: &str,
        question_key: &str,
        answers: Value,
        critical: bool,
    ) -> Result<Mutation, ActionError> {
        Self::require_parent(store, EntityKind::Checklist, checklist_id)?;
        let existing = store
            .get_table(EntityKind::Answer.table())?
            .into_iter()
            .find(|(_, row)| {
                str_field(row, "checklist_id") == Some(checklist_id)
                    && str_field(row, "question_key") == Some(question_key)
            })
            .map(|(id, _)| id);

        match existing {
            Some(id) => {
                let changes = object(json!({
                    "answers": answers,
                    "critical": critical,
                    "updated_at": now_ms(),
                }));
                self.update(store, EntityKind::Answer, EntityKey::id(id)?, changes)
            }
            None => {
                let id = self.ids.generate();
                let row = object(json!({
                    "id": id,
                    "checklist_id": checklist_id,
                    "question_key": question_key,
                    "answers": answers,
                    "critical": critical,
                    "updated_at": now_ms(),
                }));
                self.create(store, EntityKind::Answer, EntityKey::id(id)?, row)
            }
        }
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    fn require_parent<S: RowStore + ?Sized>(
        store: &S,
        kind: EntityKind,
        id: &str,
    ) -> Result<(), ActionError> {
        if store.get_row(kind.table(), id)?.is_none() {
            return Err(ActionError::MissingParent {
                kind,
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn create<S: RowStore + ?Sized>(
        &self,
        store: &mut S,
        kind: EntityKind,
        target: EntityKey,
        row: Row,
    ) -> Result<Mutation, ActionError> {
        if let Some(edge) = self.graph.parent_of(kind) {
            let parent = str_field(&row, edge.field).unwrap_or_default().to_string();
            if store.get_row(edge.parent.table(), &parent)?.is_none() {
                return Err(ActionError::MissingParent {
                    kind: edge.parent,
                    id: parent,
                });
            }
        }
        let key = target.row_key();
        let scope = SnapshotScope::new().row(kind, key.clone());
        let writes = vec![RowWrite::set(kind.table(), &key, row.clone())];
        let snapshot = apply_captured(store, &scope, writes)?;
        debug!(%kind, id = %key, "optimistic create");
        Ok(Mutation {
            op_type: OperationType::create(kind),
            target,
            payload: row,
            snapshot,
        })
    }

    fn update<S: RowStore + ?Sized>(
        &self,
        store: &mut S,
        kind: EntityKind,
        target: EntityKey,
        changes: Row,
    ) -> Result<Mutation, ActionError> {
        let key = target.row_key();
        let Some(mut row) = store.get_row(kind.table(), &key)? else {
            return Err(ActionError::NotFound { kind, id: key });
        };
        for (field, value) in &changes {
            row.insert(field.clone(), value.clone());
        }
        let scope = SnapshotScope::new().row(kind, key.clone());
        let snapshot = apply_captured(store, &scope, vec![RowWrite::set(kind.table(), &key, row)])?;
        debug!(%kind, id = %key, "optimistic update");
        Ok(Mutation {
            op_type: OperationType::update(kind),
            target,
            payload: changes,
            snapshot,
        })
    }

    fn delete<S: RowStore + ?Sized>(
        &self,
        store: &mut S,
        kind: EntityKind,
        target: EntityKey,
    ) -> Result<Mutation, ActionError> {
        let key = target.row_key();
        if store.get_row(kind.table(), &key)?.is_none() {
            return Err(ActionError::NotFound { kind, id: key });
        }
        let mut rows = vec![(kind, key.clone())];
        self.collect_descendants(store, kind, &key, &mut rows)?;

        let mut scope = SnapshotScope::new();
        for (kind, key) in &rows {
            scope.push(*kind, key.clone());
        }
        // children first so no observer sees an orphan
        let writes = rows
            .iter()
            .rev()
            .map(|(kind, key)| RowWrite::delete(kind.table(), key))
            .collect();
        let snapshot = apply_captured(store, &scope, writes)?;
        debug!(%kind, id = %key, cascaded = rows.len() - 1, "optimistic delete");
        Ok(Mutation {
            op_type: OperationType::delete(kind),
            target,
            payload: Row::new(),
            snapshot,
        })
    }

    fn collect_descendants<S: RowStore + ?Sized>(
        &self,
        store: &S,
        kind: EntityKind,
        id: &str,
        out: &mut Vec<(EntityKind, String)>,
    ) -> Result<(), StoreError> {
        for edge in self.graph.children_of(kind) {
            for (key, row) in store.get_table(edge.child.table())? {
                if str_field(&row, edge.field) == Some(id) {
                    out.push((edge.child, key.clone()));
                    self.collect_descendants(store, edge.child, &key, out)?;
                }
            }
        }
        Ok(())
    }
}

fn apply_captured<S: RowStore + ?Sized>(
    store: &mut S,
    scope: &SnapshotScope,
    writes: Vec<RowWrite>,
) -> Result<Snapshot, StoreError> {
    let snapshot = capture(store, scope)?;
    store.apply(writes)?;
    Ok(snapshot)
}
