use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The entity kinds held in the local row store, one table each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Project,
    Membership,
    Review,
    Assignment,
    Checklist,
    Answer,
}

/// How rows of a kind are keyed in their table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keying {
    /// The row key is the entity's own identifier (temporary or server-assigned).
    Own,
    /// The row key is `parent::child`, built from two reference fields.
    Composite {
        parent_field: &'static str,
        child_field: &'static str,
    },
}

impl EntityKind {
    pub const ALL: [Self; 6] = [
        Self::Project,
        Self::Membership,
        Self::Review,
        Self::Assignment,
        Self::Checklist,
        Self::Answer,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Membership => "membership",
            Self::Review => "review",
            Self::Assignment => "assignment",
            Self::Checklist => "checklist",
            Self::Answer => "answer",
        }
    }

    /// Name of the local table holding rows of this kind.
    #[must_use]
    pub const fn table(self) -> &'static str {
        match self {
            Self::Project => "projects",
            Self::Membership => "project_members",
            Self::Review => "reviews",
            Self::Assignment => "review_assignments",
            Self::Checklist => "checklists",
            Self::Answer => "checklist_answers",
        }
    }

    #[must_use]
    pub const fn keying(self) -> Keying {
        match self {
            Self::Membership => Keying::Composite {
                parent_field: "project_id",
                child_field: "user_id",
            },
            Self::Assignment => Keying::Composite {
                parent_field: "review_id",
                child_field: "user_id",
            },
            Self::Project | Self::Review | Self::Checklist | Self::Answer => Keying::Own,
        }
    }

    /// Whether the server assigns this kind its own identifier on create.
    #[must_use]
    pub const fn has_own_id(self) -> bool {
        matches!(self.keying(), Keying::Own)
    }

    #[must_use]
    pub fn from_table(table: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.table() == table)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown entity kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown entity kind '{0}'")]
pub struct UnknownEntityKind(pub String);

impl FromStr for EntityKind {
    type Err = UnknownEntityKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEntityKind(s.to_string()))
    }
}
