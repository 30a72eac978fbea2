//! Persisted events and subscriptions
//!
//! Events are the durable messages of the coordination bus. Within one
//! source they carry a monotone `source_seq`, which gives per-source total
//! order; no global causal order is promised across sources.

use std::collections::HashMap;

use hivestore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

use super::id::generate_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for EventPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// One durable message on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub timestamp: i64,
    /// Component or run that published this event
    pub source: String,
    /// Name from the event catalog, e.g. `run_started`
    pub event_type: String,
    pub payload: serde_json::Value,
    pub priority: EventPriority,
    pub correlation_id: Option<String>,
    /// Monotone per-source publish counter
    pub source_seq: u64,
    /// Subscribers that have acknowledged this event
    pub acknowledged_by: Vec<String>,
    pub updated_at: i64,
}

impl EventRecord {
    pub fn new(
        source: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        priority: EventPriority,
        correlation_id: Option<String>,
        source_seq: u64,
    ) -> Self {
        let source = source.into();
        let event_type = event_type.into();
        let now = now_ms();
        Self {
            id: generate_id("evt", &event_type),
            timestamp: now,
            source,
            event_type,
            payload,
            priority,
            correlation_id,
            source_seq,
            acknowledged_by: Vec::new(),
            updated_at: now,
        }
    }

    pub fn acknowledged(&self) -> bool {
        !self.acknowledged_by.is_empty()
    }

    pub fn is_acked_by(&self, subscriber: &str) -> bool {
        self.acknowledged_by.iter().any(|s| s == subscriber)
    }

    /// Record an acknowledgement. Idempotent.
    pub fn ack(&mut self, subscriber: &str) {
        if !self.is_acked_by(subscriber) {
            self.acknowledged_by.push(subscriber.to_string());
            self.updated_at = now_ms();
        }
    }
}

impl Record for EventRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "events"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("type".to_string(), IndexValue::String(self.event_type.clone()));
        fields.insert("source".to_string(), IndexValue::String(self.source.clone()));
        fields.insert("timestamp".to_string(), IndexValue::Integer(self.timestamp));
        fields
    }
}

/// A persistent subscription filter; survives daemon restart
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub subscriber: String,
    /// Event type names this subscriber wants; empty means all
    pub event_types: Vec<String>,
    /// Optional source filter
    pub source_filter: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Subscription {
    pub fn new(subscriber: impl Into<String>, event_types: Vec<String>, source_filter: Option<String>) -> Self {
        let subscriber = subscriber.into();
        let now = now_ms();
        Self {
            id: generate_id("sub", &subscriber),
            subscriber,
            event_types,
            source_filter,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn matches(&self, event: &EventRecord) -> bool {
        let type_ok = self.event_types.is_empty() || self.event_types.iter().any(|t| t == &event.event_type);
        let source_ok = self.source_filter.as_ref().is_none_or(|s| s == &event.source);
        type_ok && source_ok
    }
}

impl Record for Subscription {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "subscriptions"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("subscriber".to_string(), IndexValue::String(self.subscriber.clone()));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ack_is_idempotent() {
        let mut event = EventRecord::new("scheduler", "wave_created", json!({}), EventPriority::Normal, None, 1);
        assert!(!event.acknowledged());

        event.ack("monitor");
        event.ack("monitor");
        assert_eq!(event.acknowledged_by, vec!["monitor".to_string()]);
        assert!(event.is_acked_by("monitor"));
        assert!(!event.is_acked_by("pm"));
    }

    #[test]
    fn test_subscription_matching() {
        let event = EventRecord::new("run-1", "run_started", json!({}), EventPriority::Normal, None, 1);

        let all = Subscription::new("monitor", vec![], None);
        assert!(all.matches(&event));

        let typed = Subscription::new("pm", vec!["run_started".to_string()], None);
        assert!(typed.matches(&event));

        let wrong_type = Subscription::new("pm", vec!["run_crashed".to_string()], None);
        assert!(!wrong_type.matches(&event));

        let wrong_source = Subscription::new("pm", vec![], Some("run-2".to_string()));
        assert!(!wrong_source.matches(&event));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(EventPriority::Critical > EventPriority::High);
        assert!(EventPriority::High > EventPriority::Normal);
        assert!(EventPriority::Normal > EventPriority::Low);
    }
}
