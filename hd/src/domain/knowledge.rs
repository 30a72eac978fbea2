//! Knowledge items - durable cross-agent facts, decisions, patterns, warnings

use std::collections::HashMap;

use hivestore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

use super::id::generate_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeKind {
    Fact,
    Decision,
    Pattern,
    Warning,
}

impl std::fmt::Display for KnowledgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Fact => "fact",
            Self::Decision => "decision",
            Self::Pattern => "pattern",
            Self::Warning => "warning",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub id: String,
    pub kind: KnowledgeKind,
    pub content: String,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Where this came from (run id, transcript window, command output)
    pub evidence: String,
    /// Paths or area labels this item speaks about
    pub affected_areas: Vec<String>,
    /// Bumped when a duplicate submission is merged into this item
    pub occurrences: u32,
    pub superseded_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl KnowledgeItem {
    pub fn new(kind: KnowledgeKind, content: impl Into<String>) -> Self {
        let content = content.into();
        let now = now_ms();
        Self {
            id: generate_id("know", &content),
            kind,
            content,
            confidence: 0.5,
            evidence: String::new(),
            affected_areas: Vec::new(),
            occurrences: 1,
            superseded_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = evidence.into();
        self
    }

    pub fn with_areas(mut self, areas: Vec<String>) -> Self {
        self.affected_areas = areas;
        self
    }

    pub fn is_live(&self) -> bool {
        self.superseded_by.is_none()
    }

    pub fn supersede(&mut self, by: impl Into<String>) {
        self.superseded_by = Some(by.into());
        self.updated_at = now_ms();
    }

    /// Merge a duplicate submission: count it and nudge confidence up
    pub fn absorb_duplicate(&mut self, duplicate_confidence: f64) {
        self.occurrences += 1;
        self.confidence = (self.confidence.max(duplicate_confidence) + 0.05).min(1.0);
        self.updated_at = now_ms();
    }
}

impl Record for KnowledgeItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "knowledge_items"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("kind".to_string(), IndexValue::String(self.kind.to_string()));
        fields.insert("live".to_string(), IndexValue::Boolean(self.is_live()));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_item_is_live() {
        let item = KnowledgeItem::new(KnowledgeKind::Fact, "The API uses cursor pagination");
        assert!(item.is_live());
        assert_eq!(item.occurrences, 1);
    }

    #[test]
    fn test_supersession() {
        let mut item = KnowledgeItem::new(KnowledgeKind::Decision, "Use sqlite");
        item.supersede("know-use-postgres-abc");
        assert!(!item.is_live());
    }

    #[test]
    fn test_absorb_duplicate_bumps_confidence() {
        let mut item = KnowledgeItem::new(KnowledgeKind::Pattern, "Retry 429s with backoff").with_confidence(0.6);
        item.absorb_duplicate(0.8);
        assert_eq!(item.occurrences, 2);
        assert!((item.confidence - 0.85).abs() < 1e-9);

        // Confidence saturates at 1.0
        for _ in 0..10 {
            item.absorb_duplicate(0.9);
        }
        assert!(item.confidence <= 1.0);
    }
}
