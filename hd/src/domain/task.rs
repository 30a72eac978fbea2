//! Task domain type and its state machine
//!
//! The task graph is the single source of truth for all scheduling. Status
//! changes are only legal along [`TaskStatus::can_transition`]; the state
//! manager rejects anything else.

use std::collections::HashMap;

use hivestore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

use super::id::generate_id;

/// Closed set of task categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Feature,
    Bug,
    Infrastructure,
    Refactor,
    Test,
    Doc,
}

impl TaskCategory {
    /// Whether this category must declare level-1 test commands before
    /// leaving draft
    pub fn requires_tests(&self) -> bool {
        !matches!(self, Self::Doc)
    }
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Feature => "feature",
            Self::Bug => "bug",
            Self::Infrastructure => "infrastructure",
            Self::Refactor => "refactor",
            Self::Test => "test",
            Self::Doc => "doc",
        };
        write!(f, "{s}")
    }
}

/// Risk classification used by the scheduler's approval gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Being authored, not yet validated
    #[default]
    Draft,
    /// Validated, eligible for scheduling
    Pending,
    /// Needs a human decision before it can move again
    Blocked,
    /// A run is actively working on it
    InProgress,
    /// Agent claimed done; verification gate is re-checking
    Validating,
    /// Gate rejected the claim
    Failed,
    /// Prior completion invalidated by later changes
    Stale,
    /// Verified done
    Completed,
    /// Explicitly abandoned
    Cancelled,
}

impl TaskStatus {
    /// Legal transitions of the task state machine
    pub fn can_transition(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Draft, Pending)
                | (Draft, Cancelled)
                | (Pending, InProgress)
                | (Pending, Blocked)
                | (Pending, Cancelled)
                | (Pending, Stale)
                | (InProgress, Validating)
                | (InProgress, Pending)   // crash recovery requeue
                | (InProgress, Blocked)
                | (InProgress, Stale)
                | (Validating, Completed)
                | (Validating, Failed)
                | (Validating, Stale)
                | (Failed, Pending)
                | (Failed, Blocked)
                | (Blocked, Pending)
                | (Blocked, Cancelled)
                | (Stale, Pending)
                | (Stale, Cancelled)
                | (Completed, Stale)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Active statuses hold resources (a run, locks, a checkpoint)
    pub fn is_active(self) -> bool {
        matches!(self, Self::InProgress | Self::Validating)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Blocked => "blocked",
            Self::InProgress => "in_progress",
            Self::Validating => "validating",
            Self::Failed => "failed",
            Self::Stale => "stale",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Why a draft task cannot become pending
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftRejection {
    MissingTitle,
    MissingDescription,
    MissingAcceptanceCriteria,
    MissingRequiredTests,
}

impl std::fmt::Display for DraftRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MissingTitle => "title is empty",
            Self::MissingDescription => "description is empty",
            Self::MissingAcceptanceCriteria => "no acceptance criteria",
            Self::MissingRequiredTests => "category requires level-1 test commands",
        };
        write!(f, "{s}")
    }
}

/// A unit of work in the task graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,

    /// Monotone version; bumped when a task is superseded in place
    pub version: u32,

    pub category: TaskCategory,
    pub risk_level: RiskLevel,

    pub title: String,
    pub description: String,

    /// Ordered statements the verification gate must account for
    pub acceptance_criteria: Vec<String>,

    /// Advisory list of files this task expects to touch
    pub affected_files: Vec<String>,

    /// Level 1: compile/typecheck commands
    pub codebase_tests: Vec<String>,
    /// Level 2: unit/API test commands
    pub api_tests: Vec<String>,
    /// Level 3: integration/E2E commands
    pub ui_tests: Vec<String>,

    pub status: TaskStatus,

    /// Composite priority input, higher runs first
    pub priority_score: i64,
    /// Derived: number of tasks this one blocks
    pub blocks_count: u32,
    pub is_quick_win: bool,
    /// Optional deadline (unix ms)
    pub deadline: Option<i64>,

    pub parent_task_id: Option<String>,
    pub supersedes_task_id: Option<String>,

    /// Attempts consumed (failed or crashed runs)
    pub attempts: u32,
    /// Consecutive waves in which this task was runnable but not admitted
    pub waves_skipped: u32,

    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl Task {
    pub fn new(category: TaskCategory, title: impl Into<String>) -> Self {
        let title = title.into();
        let now = now_ms();
        Self {
            id: generate_id("task", &title),
            version: 1,
            category,
            risk_level: RiskLevel::default(),
            title,
            description: String::new(),
            acceptance_criteria: Vec::new(),
            affected_files: Vec::new(),
            codebase_tests: Vec::new(),
            api_tests: Vec::new(),
            ui_tests: Vec::new(),
            status: TaskStatus::Draft,
            priority_score: 0,
            blocks_count: 0,
            is_quick_win: false,
            deadline: None,
            parent_task_id: None,
            supersedes_task_id: None,
            attempts: 0,
            waves_skipped: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_criteria(mut self, criteria: Vec<String>) -> Self {
        self.acceptance_criteria = criteria;
        self
    }

    pub fn with_affected_files(mut self, files: Vec<String>) -> Self {
        self.affected_files = files;
        self
    }

    pub fn with_codebase_tests(mut self, commands: Vec<String>) -> Self {
        self.codebase_tests = commands;
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk_level = risk;
        self
    }

    pub fn with_priority(mut self, score: i64) -> Self {
        self.priority_score = score;
        self
    }

    /// Check the requirements for leaving draft. Empty means valid.
    pub fn draft_rejections(&self) -> Vec<DraftRejection> {
        let mut rejections = Vec::new();
        if self.title.trim().is_empty() {
            rejections.push(DraftRejection::MissingTitle);
        }
        if self.description.trim().is_empty() {
            rejections.push(DraftRejection::MissingDescription);
        }
        if self.acceptance_criteria.is_empty() {
            rejections.push(DraftRejection::MissingAcceptanceCriteria);
        }
        if self.category.requires_tests() && self.codebase_tests.is_empty() {
            rejections.push(DraftRejection::MissingRequiredTests);
        }
        rejections
    }

    /// Apply a status change, maintaining timestamps. Returns false and
    /// leaves the task untouched when the transition is illegal.
    pub fn set_status(&mut self, to: TaskStatus) -> bool {
        if !self.status.can_transition(to) {
            return false;
        }
        let now = now_ms();
        match to {
            TaskStatus::InProgress if self.started_at.is_none() => self.started_at = Some(now),
            TaskStatus::Completed => self.completed_at = Some(now),
            _ => {}
        }
        self.status = to;
        self.updated_at = now;
        true
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
        self.updated_at = now_ms();
    }

    /// Effective priority used for wave ranking: base score plus a
    /// starvation boost for every skipped wave beyond the threshold.
    pub fn effective_priority(&self, skip_threshold: u32, boost_per_skip: i64) -> i64 {
        self.priority_score + self.waves_skipped.saturating_sub(skip_threshold) as i64 * boost_per_skip
    }
}

impl Record for Task {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "tasks"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("category".to_string(), IndexValue::String(self.category.to_string()));
        fields.insert("priority".to_string(), IndexValue::Integer(self.priority_score));
        if let Some(ref parent) = self.parent_task_id {
            fields.insert("parent".to_string(), IndexValue::String(parent.clone()));
        }
        fields
    }
}
