//! Error taxonomy
//!
//! Every failure crossing a component boundary is classified into one of a
//! closed set of kinds. The kind decides who acts: transient errors retry,
//! verification failures consume attempt budget, integrity errors halt new
//! waves and page the operator. Classification is primary; attempt counts
//! only bound retries.

use serde::{Deserialize, Serialize};

/// The closed set of error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// LLM timeouts, lock contention, bounded I/O errors
    Transient,
    /// The verification gate rejected a claim
    Verification,
    /// Budget exhausted, context overflow, lock TTL misuse
    Resource,
    /// Deadlock, semantic conflict, ownership violation
    Coordination,
    /// Store corruption, missing checkpoint, broken invariant
    Integrity,
    /// Conflicting requirements; needs a human decision
    Ambiguity,
}

impl ErrorKind {
    /// Whether the lifecycle manager may retry a run that failed with this kind
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Verification)
    }

    /// Short operator guidance rendered in status views
    pub fn suggested_action(&self) -> &'static str {
        match self {
            Self::Transient => "wait for the automatic retry; investigate only if it recurs",
            Self::Verification => "review the failing checks in the run transcript, then let the retry proceed",
            Self::Resource => "raise the budget or reduce concurrency, then resume the paused run",
            Self::Coordination => "check pending decisions and the lock table; a resolution may be waiting on you",
            Self::Integrity => "stop the daemon and follow the recovery runbook before doing anything else",
            Self::Ambiguity => "answer the open decision request; the system will not guess",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Verification => "verification",
            Self::Resource => "resource",
            Self::Coordination => "coordination",
            Self::Integrity => "integrity",
            Self::Ambiguity => "ambiguity",
        };
        write!(f, "{s}")
    }
}

/// A classified failure with evidence and operator guidance
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HarnessError {
    pub kind: ErrorKind,
    pub message: String,
    /// What produced the classification: exit codes, event ids, log excerpts
    pub evidence: String,
}

impl HarnessError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            evidence: String::new(),
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = evidence.into();
        self
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn verification(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Verification, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn coordination(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Coordination, message)
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Integrity, message)
    }

    pub fn ambiguity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Ambiguity, message)
    }

    pub fn suggested_action(&self) -> &'static str {
        self.kind.suggested_action()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::Verification.is_retryable());
        assert!(!ErrorKind::Resource.is_retryable());
        assert!(!ErrorKind::Coordination.is_retryable());
        assert!(!ErrorKind::Integrity.is_retryable());
        assert!(!ErrorKind::Ambiguity.is_retryable());
    }

    #[test]
    fn test_display_and_action() {
        let err = HarnessError::verification("typecheck failed").with_evidence("exit code 2");
        assert_eq!(err.to_string(), "verification: typecheck failed");
        assert!(err.suggested_action().contains("failing checks"));
    }

    #[test]
    fn test_serializes_for_events() {
        let err = HarnessError::coordination("deadlock between run-a and run-b");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "coordination");
    }
}
