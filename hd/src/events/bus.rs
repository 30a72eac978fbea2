//! Event bus - the durable pub/sub facade
//!
//! Publish is append-only and returns after the durable write. Subscribers
//! are persistent and idempotent: they `poll` unacknowledged events and
//! `ack` to make progress. A tokio broadcast channel carries the same
//! events live for in-process consumers that do not need durability.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::{EventPriority, EventRecord, Subscription};
use crate::state::{EventDraft, StateManager, StateResult, TimelineQuery};

use super::types::BusEvent;

/// Live-channel capacity; laggards fall back to `poll`
const LIVE_CHANNEL_CAPACITY: usize = 4096;

/// Clone-able bus handle
#[derive(Clone)]
pub struct EventBus {
    state: StateManager,
    live_tx: broadcast::Sender<EventRecord>,
}

impl EventBus {
    pub fn new(state: StateManager) -> Self {
        let (live_tx, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self { state, live_tx }
    }

    /// Publish an event from `source`. Returns the durable event id.
    pub async fn publish(&self, source: &str, event: BusEvent) -> StateResult<String> {
        self.publish_with(source, event, EventPriority::Normal, None).await
    }

    /// Publish with explicit priority and correlation id
    pub async fn publish_with(
        &self,
        source: &str,
        event: BusEvent,
        priority: EventPriority,
        correlation_id: Option<String>,
    ) -> StateResult<String> {
        let draft = EventDraft {
            source: source.to_string(),
            event_type: event.event_type().to_string(),
            payload: event.to_payload(),
            priority,
            correlation_id,
        };
        let id = self.state.publish_event(draft).await?;
        debug!(source, event_type = event.event_type(), %id, "Published");

        // Best-effort live fan-out; durable polling is the real contract
        if let Ok(Some(record)) = self.state.get_event(&id).await {
            let _ = self.live_tx.send(record);
        }
        Ok(id)
    }

    /// Register (or replace) a persistent subscription filter
    pub async fn subscribe(
        &self,
        subscriber: &str,
        event_types: Vec<String>,
        source_filter: Option<String>,
    ) -> StateResult<String> {
        self.state
            .subscribe_events(Subscription::new(subscriber, event_types, source_filter))
            .await
    }

    /// Unacknowledged matching events in timestamp order
    pub async fn poll(&self, subscriber: &str, max: usize) -> StateResult<Vec<EventRecord>> {
        self.state.poll_events(subscriber, max).await
    }

    /// Acknowledge an event. Idempotent.
    pub async fn ack(&self, subscriber: &str, event_id: &str) -> StateResult<()> {
        self.state.ack_event(subscriber, event_id).await
    }

    /// Read-only history query
    pub async fn timeline(&self, query: TimelineQuery) -> StateResult<Vec<EventRecord>> {
        self.state.timeline(query).await
    }

    /// Live stream of events published through this bus instance
    pub fn subscribe_live(&self) -> broadcast::Receiver<EventRecord> {
        self.live_tx.subscribe()
    }

    /// Underlying state handle, for components that combine bus traffic
    /// with record access
    pub fn state(&self) -> &StateManager {
        &self.state
    }
}

/// Create a bus wrapped in an Arc for shared ownership
pub fn create_event_bus(state: StateManager) -> Arc<EventBus> {
    Arc::new(EventBus::new(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn bus() -> (TempDir, EventBus) {
        let temp = TempDir::new().unwrap();
        let state = StateManager::spawn(temp.path().join("store")).unwrap();
        (temp, EventBus::new(state))
    }

    #[tokio::test]
    async fn test_publish_poll_ack_cycle() {
        let (_temp, bus) = bus().await;

        bus.subscribe("monitor", vec!["run_crashed".to_string()], None)
            .await
            .unwrap();

        let id = bus
            .publish(
                "lifecycle",
                BusEvent::RunCrashed {
                    run_id: "run-1".to_string(),
                    task_id: "task-1".to_string(),
                    reason: "heartbeat lost".to_string(),
                },
            )
            .await
            .unwrap();

        let events = bus.poll("monitor", 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "run_crashed");

        // Typed payload survives the durable roundtrip
        let typed = BusEvent::from_payload(&events[0].payload).unwrap();
        assert!(matches!(typed, BusEvent::RunCrashed { .. }));

        bus.ack("monitor", &id).await.unwrap();
        assert!(bus.poll("monitor", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_filters_apply() {
        let (_temp, bus) = bus().await;

        bus.subscribe("pm", vec!["file_conflict".to_string()], None)
            .await
            .unwrap();

        bus.publish(
            "locks",
            BusEvent::FileLocked {
                path: "a.rs".to_string(),
                holder: "run-1".to_string(),
            },
        )
        .await
        .unwrap();

        assert!(bus.poll("pm", 10).await.unwrap().is_empty());

        bus.publish(
            "locks",
            BusEvent::FileConflict {
                path: "a.rs".to_string(),
                holder: "run-1".to_string(),
                contender: "run-2".to_string(),
            },
        )
        .await
        .unwrap();

        assert_eq!(bus.poll("pm", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_live_stream_receives_published() {
        let (_temp, bus) = bus().await;
        let mut live = bus.subscribe_live();

        bus.publish("x", BusEvent::RunHeartbeat { run_id: "run-1".to_string() })
            .await
            .unwrap();

        let record = live.recv().await.unwrap();
        assert_eq!(record.event_type, "run_heartbeat");
    }

    #[tokio::test]
    async fn test_poll_respects_max() {
        let (_temp, bus) = bus().await;
        bus.subscribe("mon", vec![], None).await.unwrap();

        for i in 0..5 {
            bus.publish("s", BusEvent::RunHeartbeat { run_id: format!("run-{i}") })
                .await
                .unwrap();
        }

        assert_eq!(bus.poll("mon", 3).await.unwrap().len(), 3);
    }
}
