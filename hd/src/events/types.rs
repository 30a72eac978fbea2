//! The event catalog
//!
//! Every coordination signal in the system is one of these variants. The
//! serialized tag is the wire name; payload fields ride alongside it in the
//! durable record. Components that poll the bus deserialize back into
//! [`BusEvent`] to get typed payloads.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// The closed vocabulary of bus events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    // === Run lifecycle ===
    RunStarted { run_id: String, task_id: String, attempt_no: u32 },
    RunHeartbeat { run_id: String },
    RunCompleted { run_id: String, task_id: String },
    RunCrashed { run_id: String, task_id: String, reason: String },
    /// The agent claimed done; the gate is about to re-validate
    ClaimVerifying { run_id: String, task_id: String },

    // === Verification ===
    VerificationSucceeded { run_id: String, task_id: String },
    VerificationFailed {
        run_id: String,
        task_id: String,
        reason: String,
        failing_checks: Vec<String>,
    },

    // === Locks and conflicts ===
    FileLocked { path: String, holder: String },
    FileUnlocked { path: String, holder: String },
    FileConflict { path: String, holder: String, contender: String },
    WaitRegistered { waiter: String, holder: String, path: String },
    DeadlockResolved { victim_run: String, cycle: Vec<String> },

    // === Supervision ===
    RegressionDetected { task_id: String, blamed_run: String, failing_command: String },
    DigressionDetected { run_id: String, task_id: String, detail: String },
    BudgetWarning { scope: String, used_pct: u8 },
    BudgetExhausted { scope: String, detail: String },

    // === Decisions ===
    DecisionNeeded {
        decision_id: String,
        question: String,
        options: Vec<String>,
        default_choice: String,
        timeout_ms: i64,
    },
    DecisionResolved { decision_id: String, choice: String, by: String },

    // === Control ===
    PauseRequested { target: String },
    ResumeRequested { target: String },
    RollbackTriggered { run_id: String, checkpoint_id: String },
    ForceRelease { run_id: String, reason: String },

    // === Knowledge ===
    KnowledgeAdded { item_id: String, kind: String },
    KnowledgeSuperseded { old_item: String, new_item: String },

    // === Waves ===
    WaveCreated { wave_id: String, list_id: String, sequence_no: u32, task_ids: Vec<String> },
    WaveClosed { wave_id: String, list_id: String, truncated: bool },

    // === Errors ===
    /// A terminal error was classified; everything terminal writes an event
    ErrorRaised { source: String, kind: ErrorKind, message: String },
}

impl BusEvent {
    /// The catalog name, identical to the serialized tag
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::RunHeartbeat { .. } => "run_heartbeat",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunCrashed { .. } => "run_crashed",
            Self::ClaimVerifying { .. } => "claim_verifying",
            Self::VerificationSucceeded { .. } => "verification_succeeded",
            Self::VerificationFailed { .. } => "verification_failed",
            Self::FileLocked { .. } => "file_locked",
            Self::FileUnlocked { .. } => "file_unlocked",
            Self::FileConflict { .. } => "file_conflict",
            Self::WaitRegistered { .. } => "wait_registered",
            Self::DeadlockResolved { .. } => "deadlock_resolved",
            Self::RegressionDetected { .. } => "regression_detected",
            Self::DigressionDetected { .. } => "digression_detected",
            Self::BudgetWarning { .. } => "budget_warning",
            Self::BudgetExhausted { .. } => "budget_exhausted",
            Self::DecisionNeeded { .. } => "decision_needed",
            Self::DecisionResolved { .. } => "decision_resolved",
            Self::PauseRequested { .. } => "pause_requested",
            Self::ResumeRequested { .. } => "resume_requested",
            Self::RollbackTriggered { .. } => "rollback_triggered",
            Self::ForceRelease { .. } => "force_release",
            Self::KnowledgeAdded { .. } => "knowledge_added",
            Self::KnowledgeSuperseded { .. } => "knowledge_superseded",
            Self::WaveCreated { .. } => "wave_created",
            Self::WaveClosed { .. } => "wave_closed",
            Self::ErrorRaised { .. } => "error_raised",
        }
    }

    /// Serialize to the payload stored on the durable record
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Recover a typed event from a durable record payload
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_matches_event_type() {
        let event = BusEvent::WaveCreated {
            wave_id: "wave-1".to_string(),
            list_id: "list-1".to_string(),
            sequence_no: 1,
            task_ids: vec!["task-a".to_string()],
        };
        let payload = event.to_payload();
        assert_eq!(payload["event"], event.event_type());
    }

    #[test]
    fn test_payload_roundtrip() {
        let event = BusEvent::VerificationFailed {
            run_id: "run-1".to_string(),
            task_id: "task-1".to_string(),
            reason: "typecheck failed".to_string(),
            failing_checks: vec!["cargo check".to_string()],
        };
        let payload = event.to_payload();
        let back = BusEvent::from_payload(&payload).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_catalog_names_are_snake_case() {
        let samples = [
            BusEvent::RunHeartbeat { run_id: "r".to_string() },
            BusEvent::ClaimVerifying { run_id: "r".to_string(), task_id: "t".to_string() },
            BusEvent::DeadlockResolved { victim_run: "r".to_string(), cycle: vec![] },
            BusEvent::ForceRelease { run_id: "r".to_string(), reason: String::new() },
        ];
        for event in samples {
            let name = event.event_type();
            assert!(name.chars().all(|c| c.is_ascii_lowercase() || c == '_'), "{name}");
        }
    }
}
