//! Execution runs - one spawned agent process working on one task

use std::collections::HashMap;

use hivestore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

use super::id::generate_id;

/// Closed set of agent roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Planner,
    #[default]
    Builder,
    Verifier,
    Monitor,
    Pm,
    Human,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planner => "planner",
            Self::Builder => "builder",
            Self::Verifier => "verifier",
            Self::Monitor => "monitor",
            Self::Pm => "pm",
            Self::Human => "human",
        };
        write!(f, "{s}")
    }
}

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Process launch in flight
    #[default]
    Spawning,
    Running,
    Paused,
    Crashed,
    /// Agent claimed done; gate has not ruled yet
    Completed,
    /// Gate accepted the claim
    Verified,
    /// Gate rejected the claim
    Rejected,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Crashed | Self::Verified | Self::Rejected)
    }

    /// Statuses allowed to hold locks
    pub fn may_hold_locks(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Crashed => "crashed",
            Self::Completed => "completed",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

/// One agent process attempt at one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRun {
    pub id: String,
    pub task_id: String,
    pub agent_role: AgentRole,
    /// 1-based attempt counter for the task
    pub attempt_no: u32,

    pub status: RunStatus,

    /// Per-run branch name in the workspace
    pub branch: Option<String>,
    /// Checkpoint created before the run modified anything
    pub checkpoint_id: Option<String>,
    /// Commit the run started from
    pub start_commit: Option<String>,

    /// Worker process id while alive
    pub pid: Option<u32>,

    pub last_heartbeat: i64,
    pub tokens_used: u64,
    pub duration_ms: u64,

    pub created_at: i64,
    pub updated_at: i64,
}

impl ExecutionRun {
    pub fn new(task_id: impl Into<String>, agent_role: AgentRole, attempt_no: u32) -> Self {
        let task_id = task_id.into();
        let now = now_ms();
        Self {
            id: generate_id("run", &task_id),
            task_id,
            agent_role,
            attempt_no,
            status: RunStatus::Spawning,
            branch: None,
            checkpoint_id: None,
            start_commit: None,
            pid: None,
            last_heartbeat: now,
            tokens_used: 0,
            duration_ms: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.updated_at = now_ms();
    }

    pub fn heartbeat(&mut self) {
        let now = now_ms();
        self.last_heartbeat = now;
        self.updated_at = now;
    }

    pub fn add_usage(&mut self, tokens: u64, duration_ms: u64) {
        self.tokens_used += tokens;
        self.duration_ms += duration_ms;
        self.updated_at = now_ms();
    }

    /// Milliseconds since the last heartbeat
    pub fn heartbeat_age_ms(&self, now: i64) -> i64 {
        (now - self.last_heartbeat).max(0)
    }
}

impl Record for ExecutionRun {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "execution_runs"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("task".to_string(), IndexValue::String(self.task_id.clone()));
        fields.insert("role".to_string(), IndexValue::String(self.agent_role.to_string()));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run() {
        let run = ExecutionRun::new("task-1", AgentRole::Builder, 1);
        assert_eq!(run.status, RunStatus::Spawning);
        assert_eq!(run.attempt_no, 1);
        assert!(run.id.starts_with("run-task-1-"));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Crashed.is_terminal());
        assert!(RunStatus::Verified.is_terminal());
        assert!(RunStatus::Rejected.is_terminal());
        assert!(!RunStatus::Completed.is_terminal()); // gate has not ruled
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_lock_holding_statuses() {
        assert!(RunStatus::Running.may_hold_locks());
        assert!(RunStatus::Paused.may_hold_locks());
        assert!(!RunStatus::Crashed.may_hold_locks());
        assert!(!RunStatus::Verified.may_hold_locks());
    }

    #[test]
    fn test_heartbeat_age() {
        let mut run = ExecutionRun::new("task-1", AgentRole::Builder, 1);
        run.last_heartbeat = 1_000;
        assert_eq!(run.heartbeat_age_ms(5_000), 4_000);
        assert_eq!(run.heartbeat_age_ms(500), 0); // clock skew clamps to zero
    }

    #[test]
    fn test_usage_accumulates() {
        let mut run = ExecutionRun::new("task-1", AgentRole::Builder, 1);
        run.add_usage(100, 2_000);
        run.add_usage(50, 1_000);
        assert_eq!(run.tokens_used, 150);
        assert_eq!(run.duration_ms, 3_000);
    }
}
