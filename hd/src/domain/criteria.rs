//! Per-criterion verification records

use std::collections::HashMap;

use hivestore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

use super::id::generate_id;

/// Who established the result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifiedBy {
    Agent,
    System,
    User,
}

impl std::fmt::Display for VerifiedBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Agent => "agent",
            Self::System => "system",
            Self::User => "user",
        };
        write!(f, "{s}")
    }
}

/// Which layer the criterion speaks about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CriterionScope {
    #[default]
    Codebase,
    Api,
    Ui,
    Database,
    Integration,
}

impl std::fmt::Display for CriterionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Codebase => "codebase",
            Self::Api => "api",
            Self::Ui => "ui",
            Self::Database => "database",
            Self::Integration => "integration",
        };
        write!(f, "{s}")
    }
}

/// The recorded outcome for one acceptance-criterion statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub id: String,
    pub task_id: String,
    pub run_id: String,
    /// The criterion statement, verbatim from the task
    pub criterion: String,
    pub met: bool,
    pub verified_by: VerifiedBy,
    pub verified_at: i64,
    pub notes: String,
    pub scope: CriterionScope,
    pub updated_at: i64,
}

impl CriterionResult {
    pub fn new(
        task_id: impl Into<String>,
        run_id: impl Into<String>,
        criterion: impl Into<String>,
        met: bool,
        verified_by: VerifiedBy,
    ) -> Self {
        let task_id = task_id.into();
        let now = now_ms();
        Self {
            id: generate_id("crit", &task_id),
            task_id,
            run_id: run_id.into(),
            criterion: criterion.into(),
            met,
            verified_by,
            verified_at: now,
            notes: String::new(),
            scope: CriterionScope::default(),
            updated_at: now,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn with_scope(mut self, scope: CriterionScope) -> Self {
        self.scope = scope;
        self
    }
}

impl Record for CriterionResult {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "criterion_results"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("task".to_string(), IndexValue::String(self.task_id.clone()));
        fields.insert("run".to_string(), IndexValue::String(self.run_id.clone()));
        fields.insert("met".to_string(), IndexValue::Boolean(self.met));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_criterion_result() {
        let result = CriterionResult::new("task-1", "run-1", "Login succeeds", true, VerifiedBy::System)
            .with_scope(CriterionScope::Api)
            .with_notes("mapped to tests::login_roundtrip");
        assert!(result.met);
        assert_eq!(result.scope, CriterionScope::Api);
        assert_eq!(result.verified_by.to_string(), "system");
    }
}
