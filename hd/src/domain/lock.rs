//! Advisory file locks
//!
//! A lock is an exclusive, TTL-bounded claim on a workspace path. The
//! resource path is the primary key; only one live claim per path can exist.

use std::collections::HashMap;

use hivestore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Workspace-relative path; doubles as the record id
    pub resource_path: String,
    /// Run holding the claim
    pub held_by: String,
    pub acquired_at: i64,
    pub expires_at: i64,
    pub reason: String,
    pub updated_at: i64,
}

impl LockRecord {
    pub fn new(resource_path: impl Into<String>, held_by: impl Into<String>, reason: impl Into<String>, ttl_ms: i64) -> Self {
        let now = now_ms();
        Self {
            resource_path: resource_path.into(),
            held_by: held_by.into(),
            acquired_at: now,
            expires_at: now + ttl_ms,
            reason: reason.into(),
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

impl Record for LockRecord {
    fn id(&self) -> &str {
        &self.resource_path
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "locks"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("holder".to_string(), IndexValue::String(self.held_by.clone()));
        fields.insert("expires_at".to_string(), IndexValue::Integer(self.expires_at));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_expiry() {
        let lock = LockRecord::new("src/api.rs", "run-1", "editing", 5_000);
        assert!(!lock.is_expired(lock.acquired_at + 4_999));
        assert!(lock.is_expired(lock.acquired_at + 5_000));
    }

    #[test]
    fn test_path_is_id() {
        let lock = LockRecord::new("src/api.rs", "run-1", "editing", 1_000);
        assert_eq!(lock.id(), "src/api.rs");
    }
}
