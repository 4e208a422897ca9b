//! Declarative reference graph consulted by the reconciler and by cascades.
//!
//! Each edge says "rows of `child` point at a `parent` entity through
//! `field`". The reconciler walks these edges generically; adding an entity
//! kind means adding its edge here and nowhere else.

use crate::model::{EntityKind, Keying};

/// One `(parent kind, child kind, reference field)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub parent: EntityKind,
    pub child: EntityKind,
    pub field: &'static str,
}

impl Edge {
    /// Whether the child's row key is built from this reference field.
    #[must_use]
    pub fn rekeys_child(&self) -> bool {
        matches!(
            self.child.keying(),
            Keying::Composite { parent_field, .. } if parent_field == self.field
        )
    }
}

const STANDARD_EDGES: [Edge; 5] = [
    Edge {
        parent: EntityKind::Project,
        child: EntityKind::Membership,
        field: "project_id",
    },
    Edge {
        parent: EntityKind::Project,
        child: EntityKind::Review,
        field: "project_id",
    },
    Edge {
        parent: EntityKind::Review,
        child: EntityKind::Assignment,
        field: "review_id",
    },
    Edge {
        parent: EntityKind::Review,
        child: EntityKind::Checklist,
        field: "review_id",
    },
    Edge {
        parent: EntityKind::Checklist,
        child: EntityKind::Answer,
        field: "checklist_id",
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceGraph {
    edges: Vec<Edge>,
}

impl ReferenceGraph {
    /// The graph for the review-checklist data model.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            edges: STANDARD_EDGES.to_vec(),
        }
    }

    #[must_use]
    pub fn from_edges(edges: Vec<Edge>) -> Self {
        Self { edges }
    }

    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Edges whose parent is `kind`, in declaration order.
    pub fn children_of(&self, kind: EntityKind) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |edge| edge.parent == kind)
    }

    /// The edge that points `kind` at its parent, if it has one.
    #[must_use]
    pub fn parent_of(&self, kind: EntityKind) -> Option<&Edge> {
        self.edges.iter().find(|edge| edge.child == kind)
    }

    /// Number of levels from a root kind down to `kind` (roots are level 1).
    ///
    /// Returns `None` when following parents loops.
    #[must_use]
    pub fn level(&self, kind: EntityKind) -> Option<usize> {
        let mut level = 1;
        let mut current = kind;
        while let Some(edge) = self.parent_of(current) {
            level += 1;
            if level > self.edges.len() + 1 {
                return None;
            }
            current = edge.parent;
        }
        Some(level)
    }

    /// Deepest level over all kinds, `None` if the graph has a cycle.
    #[must_use]
    pub fn depth(&self) -> Option<usize> {
        EntityKind::ALL
            .into_iter()
            .map(|kind| self.level(kind))
            .try_fold(0, |deepest, level| level.map(|l| deepest.max(l)))
    }
}

impl Default for ReferenceGraph {
    fn default() -> Self {
        Self::standard()
    }
}
