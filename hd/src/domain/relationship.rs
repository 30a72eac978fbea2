//! Typed edges between tasks
//!
//! Only `depends_on` and `conflicts_with` participate in scheduling; the
//! rest carry planning semantics. The `depends_on` subgraph must stay
//! acyclic — enforced at insertion by the state manager.

use std::collections::HashMap;

use hivestore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

use super::id::generate_id;

/// The closed set of relationship kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    DependsOn,
    Blocks,
    RelatedTo,
    DuplicateOf,
    SubtaskOf,
    Supersedes,
    Implements,
    ConflictsWith,
    Enables,
    InspiredBy,
    Tests,
}

impl RelationKind {
    /// Kinds the wave scheduler consults
    pub fn affects_scheduling(&self) -> bool {
        matches!(self, Self::DependsOn | Self::ConflictsWith)
    }
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DependsOn => "depends_on",
            Self::Blocks => "blocks",
            Self::RelatedTo => "related_to",
            Self::DuplicateOf => "duplicate_of",
            Self::SubtaskOf => "subtask_of",
            Self::Supersedes => "supersedes",
            Self::Implements => "implements",
            Self::ConflictsWith => "conflicts_with",
            Self::Enables => "enables",
            Self::InspiredBy => "inspired_by",
            Self::Tests => "tests",
        };
        write!(f, "{s}")
    }
}

/// A directed, typed edge `from_task -> to_task`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub from_task: String,
    pub to_task: String,
    pub kind: RelationKind,
    /// Optional weight in [0, 1]
    pub strength: Option<f64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Relationship {
    /// Create an edge. Self-edges are forbidden.
    pub fn new(from_task: impl Into<String>, to_task: impl Into<String>, kind: RelationKind) -> Result<Self, SelfEdge> {
        let from_task = from_task.into();
        let to_task = to_task.into();
        if from_task == to_task {
            return Err(SelfEdge(from_task));
        }
        let now = now_ms();
        Ok(Self {
            id: generate_id("rel", &format!("{kind}")),
            from_task,
            to_task,
            kind,
            strength: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = Some(strength.clamp(0.0, 1.0));
        self
    }
}

/// A task may not relate to itself
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("self-edge rejected for task {0}")]
pub struct SelfEdge(pub String);

impl Record for Relationship {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "relationships"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("from".to_string(), IndexValue::String(self.from_task.clone()));
        fields.insert("to".to_string(), IndexValue::String(self.to_task.clone()));
        fields.insert("kind".to_string(), IndexValue::String(self.kind.to_string()));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_edge_rejected() {
        let err = Relationship::new("task-a", "task-a", RelationKind::DependsOn).unwrap_err();
        assert_eq!(err, SelfEdge("task-a".to_string()));
    }

    #[test]
    fn test_edge_created() {
        let rel = Relationship::new("task-a", "task-b", RelationKind::DependsOn).unwrap();
        assert_eq!(rel.from_task, "task-a");
        assert_eq!(rel.to_task, "task-b");
        assert!(rel.strength.is_none());
    }

    #[test]
    fn test_strength_clamped() {
        let rel = Relationship::new("a", "b", RelationKind::RelatedTo)
            .unwrap()
            .with_strength(1.7);
        assert_eq!(rel.strength, Some(1.0));
    }

    #[test]
    fn test_scheduling_kinds() {
        assert!(RelationKind::DependsOn.affects_scheduling());
        assert!(RelationKind::ConflictsWith.affects_scheduling());
        assert!(!RelationKind::RelatedTo.affects_scheduling());
        assert!(!RelationKind::InspiredBy.affects_scheduling());
    }

    #[test]
    fn test_kind_display_names() {
        assert_eq!(RelationKind::DependsOn.to_string(), "depends_on");
        assert_eq!(RelationKind::ConflictsWith.to_string(), "conflicts_with");
        assert_eq!(RelationKind::DuplicateOf.to_string(), "duplicate_of");
    }
}
