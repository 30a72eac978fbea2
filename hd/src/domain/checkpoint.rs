//! Checkpoints - rollback anchors bound to a run

use std::collections::HashMap;

use hivestore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

use super::id::generate_id;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub run_id: String,
    pub task_id: String,
    /// Opaque token into the version-control substrate (stash ref or branch)
    pub git_ref: String,
    /// Set once the owning run verified; starts the retention clock
    pub released_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Checkpoint {
    pub fn new(run_id: impl Into<String>, task_id: impl Into<String>, git_ref: impl Into<String>) -> Self {
        let run_id = run_id.into();
        let now = now_ms();
        Self {
            id: generate_id("ckpt", &run_id),
            run_id,
            task_id: task_id.into(),
            git_ref: git_ref.into(),
            released_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn release(&mut self) {
        let now = now_ms();
        self.released_at = Some(now);
        self.updated_at = now;
    }

    /// Eligible for deletion once released and past the retention window
    pub fn is_deletable(&self, now: i64, retention_ms: i64) -> bool {
        match self.released_at {
            Some(released) => now - released >= retention_ms,
            None => false,
        }
    }
}

impl Record for Checkpoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "checkpoints"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("run".to_string(), IndexValue::String(self.run_id.clone()));
        fields.insert("task".to_string(), IndexValue::String(self.task_id.clone()));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_window() {
        let mut ckpt = Checkpoint::new("run-1", "task-1", "stash@{0}");
        assert!(!ckpt.is_deletable(now_ms() + 1_000_000, 60_000));

        ckpt.release();
        let released = ckpt.released_at.unwrap();
        assert!(!ckpt.is_deletable(released + 59_999, 60_000));
        assert!(ckpt.is_deletable(released + 60_000, 60_000));
    }
}
