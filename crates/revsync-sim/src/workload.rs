//! Seeded stream of UI actions against the local store.

use anyhow::{Context, Result};
use revsync_core::actions::{LocalActions, Mutation};
use revsync_core::model::id::DEFAULT_TEMP_PREFIX;
use revsync_core::model::{EntityKind, TempIdGenerator, str_field};
use revsync_core::store::RowStore;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::rng::DeterministicRng;

const USERS: [&str; 4] = ["u-alice", "u-bob", "u-carol", "u-dan"];
const CHECKLIST_TYPES: [&str; 3] = ["amstar2", "robins-i", "rob2"];
const QUESTIONS: [&str; 5] = ["q1", "q2", "q3", "q4", "q5"];

/// The UI actions the workload can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CreateProject,
    RenameProject,
    DeleteProject,
    AddMember,
    RemoveMember,
    CreateReview,
    DeleteReview,
    AssignReviewer,
    CreateChecklist,
    CompleteChecklist,
    DeleteChecklist,
    SaveAnswer,
}

impl ActionKind {
    const ALL: [Self; 12] = [
        Self::CreateProject,
        Self::RenameProject,
        Self::DeleteProject,
        Self::AddMember,
        Self::RemoveMember,
        Self::CreateReview,
        Self::DeleteReview,
        Self::AssignReviewer,
        Self::CreateChecklist,
        Self::CompleteChecklist,
        Self::DeleteChecklist,
        Self::SaveAnswer,
    ];

    /// Relative frequency; creates and answers dominate, deletes are rare.
    const fn weight(self) -> u32 {
        match self {
            Self::CreateProject => 12,
            Self::CreateReview | Self::CreateChecklist => 10,
            Self::SaveAnswer => 18,
            Self::AddMember | Self::AssignReviewer | Self::RenameProject => 7,
            Self::CompleteChecklist => 5,
            Self::RemoveMember => 3,
            Self::DeleteProject | Self::DeleteReview | Self::DeleteChecklist => 2,
        }
    }
}

/// A performed action and the mutation it produced.
#[derive(Debug, Clone)]
pub struct Step {
    pub action: ActionKind,
    pub mutation: Mutation,
}

pub struct Workload {
    rng: DeterministicRng,
    actions: LocalActions,
}

impl Workload {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_prefix(seed, DEFAULT_TEMP_PREFIX)
    }

    /// Workload whose temporary ids start with `prefix`.
    #[must_use]
    pub fn with_prefix(seed: u64, prefix: &str) -> Self {
        let session = u32::try_from(seed & u64::from(u32::MAX)).unwrap_or_default();
        Self {
            rng: DeterministicRng::new(seed),
            actions: LocalActions::new(TempIdGenerator::seeded(prefix, session)),
        }
    }

    #[must_use]
    pub fn ids(&self) -> &TempIdGenerator {
        self.actions.ids()
    }

    /// Perform one randomly chosen action. Actions whose target does not
    /// exist yet fall back to creating a project.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails.
    pub fn step<S: RowStore + ?Sized>(&mut self, store: &mut S) -> Result<Step> {
        let weights: Vec<u32> = ActionKind::ALL.iter().map(|a| a.weight()).collect();
        let chosen = ActionKind::ALL[self.rng.weighted(&weights)];
        let action = if self.has_target(store, chosen)? {
            chosen
        } else {
            ActionKind::CreateProject
        };
        let mutation = self
            .perform(store, action)
            .with_context(|| format!("workload action {action:?} failed"))?;
        Ok(Step { action, mutation })
    }

    fn has_target<S: RowStore + ?Sized>(&self, store: &S, action: ActionKind) -> Result<bool> {
        let table = match action {
            ActionKind::CreateProject => return Ok(true),
            ActionKind::RenameProject
            | ActionKind::DeleteProject
            | ActionKind::AddMember
            | ActionKind::CreateReview => EntityKind::Project,
            ActionKind::RemoveMember => EntityKind::Membership,
            ActionKind::DeleteReview | ActionKind::AssignReviewer | ActionKind::CreateChecklist => {
                EntityKind::Review
            }
            ActionKind::CompleteChecklist | ActionKind::DeleteChecklist | ActionKind::SaveAnswer => {
                EntityKind::Checklist
            }
        }
        .table();
        Ok(!store.get_table(table)?.is_empty())
    }

    fn pick_key<S: RowStore + ?Sized>(&mut self, store: &S, kind: EntityKind) -> Result<String> {
        let keys: Vec<String> = store.get_table(kind.table())?.into_keys().collect();
        self.rng
            .pick(&keys)
            .cloned()
            .with_context(|| format!("no {kind} to act on"))
    }

    fn pick<T: Copy>(&mut self, items: &[T]) -> Result<T> {
        self.rng.pick(items).copied().context("empty choice list")
    }

    fn perform<S: RowStore + ?Sized>(&mut self, store: &mut S, action: ActionKind) -> Result<Mutation> {
        let n = self.rng.below(1000);
        let mutation = match action {
            ActionKind::CreateProject => self.actions.create_project(store, &format!("Project {n}"))?,
            ActionKind::RenameProject => {
                let project = self.pick_key(store, EntityKind::Project)?;
                self.actions.rename_project(store, &project, &format!("Renamed {n}"))?
            }
            ActionKind::DeleteProject => {
                let project = self.pick_key(store, EntityKind::Project)?;
                self.actions.delete_project(store, &project)?
            }
            ActionKind::AddMember => {
                let project = self.pick_key(store, EntityKind::Project)?;
                let user = self.pick(&USERS)?;
                let role = if n % 3 == 0 { "owner" } else { "member" };
                self.actions.add_member(store, &project, user, role)?
            }
            ActionKind::RemoveMember => {
                let key = self.pick_key(store, EntityKind::Membership)?;
                let row = store
                    .get_row(EntityKind::Membership.table(), &key)?
                    .context("membership vanished")?;
                let project = str_field(&row, "project_id").unwrap_or_default().to_string();
                let user = str_field(&row, "user_id").unwrap_or_default().to_string();
                self.actions.remove_member(store, &project, &user)?
            }
            ActionKind::CreateReview => {
                let project = self.pick_key(store, EntityKind::Project)?;
                self.actions.create_review(store, &project, &format!("Review {n}"))?
            }
            ActionKind::DeleteReview => {
                let review = self.pick_key(store, EntityKind::Review)?;
                self.actions.delete_review(store, &review)?
            }
            ActionKind::AssignReviewer => {
                let review = self.pick_key(store, EntityKind::Review)?;
                let user = self.pick(&USERS)?;
                self.actions.assign_reviewer(store, &review, user)?
            }
            ActionKind::CreateChecklist => {
                let review = self.pick_key(store, EntityKind::Review)?;
                let reviewer = self.pick(&USERS)?;
                let checklist_type = self.pick(&CHECKLIST_TYPES)?;
                self.actions
                    .create_checklist(store, &review, Some(reviewer), checklist_type)?
            }
            ActionKind::CompleteChecklist => {
                let checklist = self.pick_key(store, EntityKind::Checklist)?;
                self.actions.complete_checklist(store, &checklist)?
            }
            ActionKind::DeleteChecklist => {
                let checklist = self.pick_key(store, EntityKind::Checklist)?;
                self.actions.delete_checklist(store, &checklist)?
            }
            ActionKind::SaveAnswer => {
                let checklist = self.pick_key(store, EntityKind::Checklist)?;
                let question = self.pick(&QUESTIONS)?;
                let answers = json!([[n % 2 == 0, n % 3 == 0], [n % 5 == 0]]);
                self.actions
                    .save_answer(store, &checklist, question, answers, n % 7 == 0)?
            }
        };
        Ok(mutation)
    }
}
