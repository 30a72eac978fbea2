//! Observability rows - transcript, tool-use, assertion, and skill traces
//!
//! All four are append-only and keyed by `(run_id, seq)`; sequence numbers
//! are contiguous starting at 1 within a run. The recorders own sequence
//! assignment; these types are the persisted shapes.

use std::collections::HashMap;

use hivestore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

/// What a transcript entry contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentClass {
    Reasoning,
    ToolRequest,
    AgentOutput,
}

impl std::fmt::Display for ContentClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Reasoning => "reasoning",
            Self::ToolRequest => "tool_request",
            Self::AgentOutput => "agent_output",
        };
        write!(f, "{s}")
    }
}

/// One line of agent conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: String,
    pub run_id: String,
    pub seq: u64,
    /// Speaker: "agent", "system", "tool", ...
    pub role: String,
    pub content: String,
    pub content_class: ContentClass,
    pub created_at: i64,
}

impl TranscriptEntry {
    pub fn new(run_id: &str, seq: u64, role: &str, content: impl Into<String>, class: ContentClass) -> Self {
        Self {
            id: format!("{run_id}:t:{seq}"),
            run_id: run_id.to_string(),
            seq,
            role: role.to_string(),
            content: content.into(),
            content_class: class,
            created_at: now_ms(),
        }
    }
}

impl Record for TranscriptEntry {
    fn id(&self) -> &str {
        &self.id
    }
    fn updated_at(&self) -> i64 {
        self.created_at
    }
    fn collection_name() -> &'static str {
        "transcripts"
    }
    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        run_seq_fields(&self.run_id, self.seq)
    }
}

/// Tool invocation outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Error,
    TimedOut,
    Cancelled,
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One tool call made by an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUseEntry {
    pub id: String,
    pub run_id: String,
    pub seq: u64,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub started_at: i64,
    pub ended_at: i64,
    pub status: ToolStatus,
    pub result_summary: String,
}

impl ToolUseEntry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: &str,
        seq: u64,
        tool_name: &str,
        arguments: serde_json::Value,
        started_at: i64,
        ended_at: i64,
        status: ToolStatus,
        result_summary: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("{run_id}:u:{seq}"),
            run_id: run_id.to_string(),
            seq,
            tool_name: tool_name.to_string(),
            arguments,
            started_at,
            ended_at,
            status,
            result_summary: result_summary.into(),
        }
    }
}

impl Record for ToolUseEntry {
    fn id(&self) -> &str {
        &self.id
    }
    fn updated_at(&self) -> i64 {
        self.ended_at
    }
    fn collection_name() -> &'static str {
        "tool_uses"
    }
    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = run_seq_fields(&self.run_id, self.seq);
        fields.insert("tool".to_string(), IndexValue::String(self.tool_name.clone()));
        fields
    }
}

/// One step of an assertion chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionStep {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

/// An ordered group of assertions with a computed verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionChain {
    pub id: String,
    pub run_id: String,
    pub seq: u64,
    pub chain_name: String,
    pub steps: Vec<AssertionStep>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl AssertionChain {
    pub fn new(run_id: &str, seq: u64, chain_name: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: format!("{run_id}:a:{seq}"),
            run_id: run_id.to_string(),
            seq,
            chain_name: chain_name.into(),
            steps: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push_step(&mut self, name: impl Into<String>, passed: bool, detail: impl Into<String>) {
        self.steps.push(AssertionStep {
            name: name.into(),
            passed,
            detail: detail.into(),
        });
        self.updated_at = now_ms();
    }

    /// The chain passes only when every member step passed; an empty chain
    /// has no verdict and counts as failed.
    pub fn verdict(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.passed)
    }
}

impl Record for AssertionChain {
    fn id(&self) -> &str {
        &self.id
    }
    fn updated_at(&self) -> i64 {
        self.updated_at
    }
    fn collection_name() -> &'static str {
        "assertion_chains"
    }
    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = run_seq_fields(&self.run_id, self.seq);
        fields.insert("verdict".to_string(), IndexValue::Boolean(self.verdict()));
        fields
    }
}

/// A named skill invocation wrapping nested tool uses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillTrace {
    pub id: String,
    pub run_id: String,
    pub seq: u64,
    pub skill_name: String,
    /// Sequence numbers of the tool uses made inside this skill
    pub tool_use_seqs: Vec<u64>,
    pub status: ToolStatus,
    pub started_at: i64,
    pub ended_at: i64,
}

impl SkillTrace {
    pub fn new(run_id: &str, seq: u64, skill_name: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: format!("{run_id}:s:{seq}"),
            run_id: run_id.to_string(),
            seq,
            skill_name: skill_name.into(),
            tool_use_seqs: Vec::new(),
            status: ToolStatus::Ok,
            started_at: now,
            ended_at: now,
        }
    }
}

impl Record for SkillTrace {
    fn id(&self) -> &str {
        &self.id
    }
    fn updated_at(&self) -> i64 {
        self.ended_at
    }
    fn collection_name() -> &'static str {
        "skill_traces"
    }
    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = run_seq_fields(&self.run_id, self.seq);
        fields.insert("skill".to_string(), IndexValue::String(self.skill_name.clone()));
        fields
    }
}

fn run_seq_fields(run_id: &str, seq: u64) -> HashMap<String, IndexValue> {
    let mut fields = HashMap::new();
    fields.insert("run".to_string(), IndexValue::String(run_id.to_string()));
    fields.insert("seq".to_string(), IndexValue::Integer(seq as i64));
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assertion_chain_verdict() {
        let mut chain = AssertionChain::new("run-1", 1, "login flow");
        assert!(!chain.verdict()); // empty chain fails

        chain.push_step("status 200", true, "");
        chain.push_step("body has token", true, "");
        assert!(chain.verdict());

        chain.push_step("cookie set", false, "missing Set-Cookie");
        assert!(!chain.verdict());
    }

    #[test]
    fn test_ids_embed_run_and_seq() {
        let entry = TranscriptEntry::new("run-9", 3, "agent", "hello", ContentClass::AgentOutput);
        assert_eq!(entry.id, "run-9:t:3");
        let tool = ToolUseEntry::new(
            "run-9",
            4,
            "edit_file",
            serde_json::json!({"path": "a.rs"}),
            0,
            10,
            ToolStatus::Ok,
            "ok",
        );
        assert_eq!(tool.id, "run-9:u:4");
    }
}
