//! IPC message types
//!
//! JSON-over-newline on a unix socket: one request per line, one response
//! per line. The same protocol carries human queries/controls and the
//! worker channel (heartbeats and terminal claims).

use serde::{Deserialize, Serialize};

use crate::domain::{CriterionResult, EventRecord, LockRecord, TranscriptEntry};

/// Requests to the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum IpcRequest {
    // === Liveness ===
    Ping,
    Shutdown,

    // === Queries ===
    Status,
    ListStatus { list_id: String },
    TaskStatus { task_id: String },
    Timeline {
        since: Option<i64>,
        event_types: Vec<String>,
        limit: usize,
    },
    LockTable,
    PendingDecisions,
    Transcript { run_id: String },
    RunDiff { run_id: String },
    Criteria { task_id: String },

    // === Task and list authoring ===
    CreateTask {
        title: String,
        description: String,
        category: String,
        criteria: Vec<String>,
        affected_files: Vec<String>,
        codebase_tests: Vec<String>,
        priority: i64,
    },
    SubmitTask { task_id: String },
    CreateList { title: String },
    AddToList { list_id: String, task_id: String },
    RunList { list_id: String },

    // === Control ===
    PauseList { list_id: String },
    ResumeList { list_id: String },
    PauseTask { task_id: String },
    SkipTask { task_id: String },
    ResetTask { task_id: String },
    CancelTask { task_id: String },
    ForceUnlock { path: String },
    RollbackRun { run_id: String },
    Decide { decision_id: String, choice: String },

    // === Worker channel ===
    WorkerHeartbeat { run_id: String },
    WorkerClaim { run_id: String },
}

/// A compact status snapshot for the human interface
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusView {
    pub lists_total: usize,
    pub lists_active: usize,
    pub tasks_by_status: Vec<(String, usize)>,
    pub live_runs: usize,
    pub held_locks: usize,
    pub pending_decisions: usize,
}

/// A pending decision, rendered for the operator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionView {
    pub decision_id: String,
    pub question: String,
    pub options: Vec<String>,
    pub default_choice: String,
    pub expires_in_ms: i64,
}

/// Responses from the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum IpcResponse {
    Ok,
    Pong { version: String },
    Error { message: String },
    Created { id: String },
    Status(StatusView),
    Events(Vec<EventRecord>),
    Locks(Vec<LockRecord>),
    Decisions(Vec<DecisionView>),
    Transcript(Vec<TranscriptEntry>),
    Paths(Vec<String>),
    CriteriaResults(Vec<CriterionResult>),
    Text(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let requests = vec![
            IpcRequest::Ping,
            IpcRequest::Status,
            IpcRequest::WorkerHeartbeat {
                run_id: "run-1".to_string(),
            },
            IpcRequest::Decide {
                decision_id: "dec-1".to_string(),
                choice: "rollback".to_string(),
            },
            IpcRequest::Timeline {
                since: Some(1_000),
                event_types: vec!["run_crashed".to_string()],
                limit: 50,
            },
        ];
        for request in requests {
            let json = serde_json::to_string(&request).unwrap();
            let parsed: IpcRequest = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, request);
        }
    }

    #[test]
    fn test_response_roundtrip() {
        let responses = vec![
            IpcResponse::Ok,
            IpcResponse::Pong {
                version: "0.1.0".to_string(),
            },
            IpcResponse::Error {
                message: "nope".to_string(),
            },
            IpcResponse::Created {
                id: "task-1".to_string(),
            },
            IpcResponse::Status(StatusView::default()),
        ];
        for response in responses {
            let json = serde_json::to_string(&response).unwrap();
            let parsed: IpcResponse = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, response);
        }
    }

    #[test]
    fn test_wire_shape_is_tagged() {
        let json = serde_json::to_string(&IpcRequest::Ping).unwrap();
        assert_eq!(json, r#"{"type":"Ping"}"#);
    }
}
