//! Mergeflow: Work Item Model
//!
//! A work item (PR) is the atomic unit of planned change. It carries a
//! durable cold state (persisted to the repository, the source of truth)
//! and an ephemeral hot state that exists only while an agent is actively
//! working on it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Durable state of a work item, persisted to the plan file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColdState {
    New,
    Planned,
    Ready,
    Blocked,
    InProgress,
    UnderReview,
    Completed,
    Approved,
    Broken,
}

impl ColdState {
    /// Whether a transition to `to` is legal. Re-asserting the current
    /// state is always a no-op and therefore allowed.
    pub fn can_transition(self, to: ColdState) -> bool {
        use ColdState::*;
        if self == to {
            return true;
        }
        matches!(
            (self, to),
            (New, Planned)
                | (New, Ready)
                | (New, Blocked)
                | (Planned, Ready)
                | (Planned, Blocked)
                | (Ready, InProgress)
                | (Ready, Blocked)
                | (Blocked, Ready)
                | (InProgress, UnderReview)
                | (InProgress, Ready)
                | (InProgress, Broken)
                | (UnderReview, Completed)
                | (UnderReview, Broken)
                | (Completed, Approved)
                | (Completed, Broken)
                | (Broken, InProgress)
        )
    }

    /// Both `completed` and `approved` satisfy a dependent item.
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, ColdState::Completed | ColdState::Approved)
    }

    /// Terminal-for-work states: no hot state, no agent, no leases.
    pub fn is_done(self) -> bool {
        self.satisfies_dependency()
    }

    /// States from which the scheduler may pick an item up.
    pub fn is_schedulable(self) -> bool {
        matches!(self, ColdState::Ready | ColdState::Broken)
    }
}

impl fmt::Display for ColdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ColdState::New => "new",
            ColdState::Planned => "planned",
            ColdState::Ready => "ready",
            ColdState::Blocked => "blocked",
            ColdState::InProgress => "in_progress",
            ColdState::UnderReview => "under_review",
            ColdState::Completed => "completed",
            ColdState::Approved => "approved",
            ColdState::Broken => "broken",
        };
        f.write_str(s)
    }
}

impl FromStr for ColdState {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "new" => Ok(ColdState::New),
            "planned" => Ok(ColdState::Planned),
            "ready" => Ok(ColdState::Ready),
            "blocked" => Ok(ColdState::Blocked),
            "in_progress" => Ok(ColdState::InProgress),
            "under_review" => Ok(ColdState::UnderReview),
            "completed" => Ok(ColdState::Completed),
            "approved" => Ok(ColdState::Approved),
            "broken" => Ok(ColdState::Broken),
            other => Err(TransitionError::UnknownState {
                state: other.to_string(),
            }),
        }
    }
}

/// Ephemeral state of a work item, held in the coordination store only.
/// Absence means the item is not currently being worked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotState {
    Investigating,
    Planning,
    InProgress,
    UnderReview,
}

impl fmt::Display for HotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HotState::Investigating => "investigating",
            HotState::Planning => "planning",
            HotState::InProgress => "in_progress",
            HotState::UnderReview => "under_review",
        };
        f.write_str(s)
    }
}

impl FromStr for HotState {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "investigating" => Ok(HotState::Investigating),
            "planning" => Ok(HotState::Planning),
            "in_progress" => Ok(HotState::InProgress),
            "under_review" => Ok(HotState::UnderReview),
            other => Err(TransitionError::UnknownState {
                state: other.to_string(),
            }),
        }
    }
}

/// Scheduling priority class. `Critical` outranks everything but broken work.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl FromStr for Priority {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(TransitionError::UnknownState {
                state: other.to_string(),
            }),
        }
    }
}

/// Capability tier an item wants and an agent offers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Low,
    Mid,
    High,
}

impl Default for Tier {
    fn default() -> Self {
        Tier::Low
    }
}

impl FromStr for Tier {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "low" => Ok(Tier::Low),
            "mid" => Ok(Tier::Mid),
            "high" => Ok(Tier::High),
            other => Err(TransitionError::UnknownState {
                state: other.to_string(),
            }),
        }
    }
}

/// Complexity estimate attached to a work item by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Complexity {
    /// Score in 1..=10.
    pub score: u8,
    /// Planner's estimate of implementation time.
    pub estimated_minutes: u32,
    /// Tier of agent the item should go to.
    pub suggested_tier: Tier,
    /// Free-form rationale from the planner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl Default for Complexity {
    fn default() -> Self {
        Self {
            score: 1,
            estimated_minutes: 10,
            suggested_tier: Tier::Low,
            rationale: None,
        }
    }
}

/// What the item will do to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    Modify,
    Delete,
}

impl FromStr for FileAction {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "create" => Ok(FileAction::Create),
            "modify" => Ok(FileAction::Modify),
            "delete" => Ok(FileAction::Delete),
            other => Err(TransitionError::UnknownState {
                state: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileAction::Create => "create",
            FileAction::Modify => "modify",
            FileAction::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// A file the item expects to touch (or actually touched).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedFile {
    pub path: String,
    pub action: FileAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PlannedFile {
    pub fn new(path: impl Into<String>, action: FileAction) -> Self {
        Self {
            path: path.into(),
            action,
            description: None,
        }
    }
}

/// Token/cost accumulators attributed to an item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub tokens: u64,
    pub cost_usd: f64,
}

/// A planned code-change unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Stable identifier (e.g. "PR-012").
    pub id: String,
    pub title: String,
    pub cold_state: ColdState,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub complexity: Complexity,
    /// Ids of items that must complete before this one may start.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub estimated_files: Vec<PlannedFile>,
    /// Files actually touched, recorded post-implementation.
    #[serde(default)]
    pub actual_files: Vec<PlannedFile>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            cold_state: ColdState::New,
            priority: Priority::default(),
            complexity: Complexity::default(),
            dependencies: Vec::new(),
            estimated_files: Vec::new(),
            actual_files: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: ColdState) -> Self {
        self.cold_state = state;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_files(mut self, files: Vec<PlannedFile>) -> Self {
        self.estimated_files = files;
        self
    }

    /// Deduplicated set of estimated file paths.
    pub fn estimated_paths(&self) -> BTreeSet<&str> {
        self.estimated_files
            .iter()
            .map(|f| f.path.as_str())
            .collect()
    }

    /// Validate and apply a cold-state transition.
    pub fn transition(&mut self, to: ColdState) -> Result<(), TransitionError> {
        if !self.cold_state.can_transition(to) {
            return Err(TransitionError::Illegal {
                item: self.id.clone(),
                from: self.cold_state,
                to,
            });
        }
        self.cold_state = to;
        Ok(())
    }
}

/// State-machine violations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransitionError {
    #[error("illegal cold-state transition for {item}: {from} -> {to}")]
    Illegal {
        item: String,
        from: ColdState,
        to: ColdState,
    },

    #[error("unknown state '{state}'")]
    UnknownState { state: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_forward_path() {
        let mut item = WorkItem::new("PR-001", "demo");
        for next in [
            ColdState::Planned,
            ColdState::Ready,
            ColdState::InProgress,
            ColdState::UnderReview,
            ColdState::Completed,
            ColdState::Approved,
        ] {
            item.transition(next).unwrap();
        }
        assert_eq!(item.cold_state, ColdState::Approved);
    }

    #[test]
    fn test_transition_is_idempotent() {
        let mut item = WorkItem::new("PR-001", "demo").with_state(ColdState::Ready);
        item.transition(ColdState::Ready).unwrap();
        assert_eq!(item.cold_state, ColdState::Ready);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut item = WorkItem::new("PR-001", "demo");
        let err = item.transition(ColdState::Completed).unwrap_err();
        assert!(matches!(err, TransitionError::Illegal { .. }));
        assert_eq!(item.cold_state, ColdState::New);
    }

    #[test]
    fn test_broken_reaches_in_progress_only() {
        assert!(ColdState::Broken.can_transition(ColdState::InProgress));
        assert!(!ColdState::Broken.can_transition(ColdState::Ready));
        assert!(!ColdState::Broken.can_transition(ColdState::Completed));
        assert!(!ColdState::Approved.can_transition(ColdState::Ready));
    }

    #[test]
    fn test_completed_and_approved_satisfy_dependencies() {
        assert!(ColdState::Completed.satisfies_dependency());
        assert!(ColdState::Approved.satisfies_dependency());
        assert!(!ColdState::UnderReview.satisfies_dependency());
    }

    #[test]
    fn test_estimated_paths_dedup() {
        let item = WorkItem::new("PR-001", "demo").with_files(vec![
            PlannedFile::new("src/a.rs", FileAction::Modify),
            PlannedFile::new("src/a.rs", FileAction::Create),
            PlannedFile::new("src/b.rs", FileAction::Modify),
        ]);
        assert_eq!(item.estimated_paths().len(), 2);
    }

    #[test]
    fn test_cold_state_round_trip() {
        for s in [
            "new",
            "planned",
            "ready",
            "blocked",
            "in_progress",
            "under_review",
            "completed",
            "approved",
            "broken",
        ] {
            let parsed: ColdState = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
    }
}
