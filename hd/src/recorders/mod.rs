//! Observability recorders
//!
//! Append-only writers keyed by run. Each recorder owns a monotone sequence
//! starting at 1; sequence state is shared behind a mutex so concurrent
//! writers within a process cannot produce gaps or duplicates. On close a
//! single consolidated event summarizes what was written.

mod assertion;
mod skill;
mod tool_use;
mod transcript;

pub use assertion::AssertionRecorder;
pub use skill::SkillRecorder;
pub use tool_use::ToolUseRecorder;
pub use transcript::TranscriptRecorder;

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::state::{StateManager, StateResult};

/// Shared per-run sequence counter. Lazily seeded from the store so a
/// resumed run continues its sequence instead of restarting at 1.
#[derive(Clone)]
pub(crate) struct SeqCounter {
    inner: Arc<Mutex<Option<u64>>>,
}

impl SeqCounter {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    /// Take the next sequence number, seeding from `existing_max` on first use
    pub(crate) async fn next<F, Fut>(&self, seed: F) -> StateResult<u64>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = StateResult<u64>>,
    {
        let mut guard = self.inner.lock().await;
        let current = match *guard {
            Some(v) => v,
            None => seed().await?,
        };
        let next = current + 1;
        *guard = Some(next);
        Ok(next)
    }
}

/// Publish the consolidated close event for a recorder
pub(crate) async fn publish_close(
    state: &StateManager,
    run_id: &str,
    recorder_kind: &str,
    entries: u64,
) -> StateResult<()> {
    state
        .publish_event(crate::state::EventDraft::new(
            run_id,
            "recorder_closed",
            serde_json::json!({
                "run_id": run_id,
                "recorder": recorder_kind,
                "entries": entries,
            }),
        ))
        .await?;
    Ok(())
}
