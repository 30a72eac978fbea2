//! Task lists - ordered groups of tasks executed together

use std::collections::HashMap;

use hivestore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

use super::id::generate_id;

/// Task list status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListStatus {
    #[default]
    Draft,
    Ready,
    InProgress,
    Paused,
    Completed,
    Failed,
    Archived,
}

impl std::fmt::Display for ListStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Archived => "archived",
        };
        write!(f, "{s}")
    }
}

/// Per-membership status, independent of the task's global status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    Active,
    Done,
    Failed,
    Skipped,
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// An ordered collection of tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskList {
    pub id: String,
    pub title: String,
    pub status: ListStatus,

    /// High-risk tasks wait for explicit approval before scheduling
    pub user_approval_required: bool,
    /// When false, low-risk tasks also wait for approval
    pub auto_execute_low_risk: bool,

    // Progress counters, derived from membership statuses
    pub total: u32,
    pub completed: u32,
    pub failed: u32,

    pub created_at: i64,
    pub updated_at: i64,
}

impl TaskList {
    pub fn new(title: impl Into<String>) -> Self {
        let title = title.into();
        let now = now_ms();
        Self {
            id: generate_id("list", &title),
            title,
            status: ListStatus::Draft,
            user_approval_required: true,
            auto_execute_low_risk: true,
            total: 0,
            completed: 0,
            failed: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: ListStatus) {
        self.status = status;
        self.updated_at = now_ms();
    }

    /// True once every member is in a settled item status
    pub fn is_finished(&self) -> bool {
        self.total > 0 && self.completed + self.failed >= self.total
    }
}

impl Record for TaskList {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "task_lists"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields
    }
}

/// Membership row binding a task into a list at a position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListMember {
    pub id: String,
    pub list_id: String,
    pub task_id: String,
    pub position: u32,
    pub item_status: ItemStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ListMember {
    pub fn new(list_id: impl Into<String>, task_id: impl Into<String>, position: u32) -> Self {
        let list_id = list_id.into();
        let task_id = task_id.into();
        let now = now_ms();
        Self {
            id: format!("{list_id}:{task_id}"),
            list_id,
            task_id,
            position,
            item_status: ItemStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_item_status(&mut self, status: ItemStatus) {
        self.item_status = status;
        self.updated_at = now_ms();
    }
}

impl Record for ListMember {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "list_members"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("list".to_string(), IndexValue::String(self.list_id.clone()));
        fields.insert("task".to_string(), IndexValue::String(self.task_id.clone()));
        fields.insert(
            "item_status".to_string(),
            IndexValue::String(self.item_status.to_string()),
        );
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_list_defaults() {
        let list = TaskList::new("Sprint 12");
        assert_eq!(list.status, ListStatus::Draft);
        assert!(list.user_approval_required);
        assert!(list.auto_execute_low_risk);
        assert!(!list.is_finished());
    }

    #[test]
    fn test_is_finished() {
        let mut list = TaskList::new("test");
        list.total = 2;
        list.completed = 1;
        assert!(!list.is_finished());
        list.failed = 1;
        assert!(list.is_finished());
    }

    #[test]
    fn test_member_id_is_composite() {
        let member = ListMember::new("list-1", "task-1", 0);
        assert_eq!(member.id, "list-1:task-1");
        assert_eq!(member.item_status, ItemStatus::Pending);
    }
}
