//! Tool-use recorder - every tool an agent invokes

use crate::domain::{ToolStatus, ToolUseEntry, now_ms};
use crate::state::{StateManager, StateResult};

use super::SeqCounter;

/// Handle returned when a tool call starts; finish it to record the row
pub struct OpenToolUse {
    run_id: String,
    seq: u64,
    tool_name: String,
    arguments: serde_json::Value,
    started_at: i64,
}

#[derive(Clone)]
pub struct ToolUseRecorder {
    state: StateManager,
    run_id: String,
    seq: SeqCounter,
}

impl ToolUseRecorder {
    pub fn new(state: StateManager, run_id: &str) -> Self {
        Self {
            state,
            run_id: run_id.to_string(),
            seq: SeqCounter::new(),
        }
    }

    /// Mark the start of a tool call; the sequence slot is taken now so
    /// interleaved calls keep their start order.
    pub async fn begin(&self, tool_name: &str, arguments: serde_json::Value) -> StateResult<OpenToolUse> {
        let state = self.state.clone();
        let run_id = self.run_id.clone();
        let seq = self
            .seq
            .next(|| async move {
                let existing = state.list_tool_uses(&run_id).await?;
                Ok(existing.iter().map(|e| e.seq).max().unwrap_or(0))
            })
            .await?;

        Ok(OpenToolUse {
            run_id: self.run_id.clone(),
            seq,
            tool_name: tool_name.to_string(),
            arguments,
            started_at: now_ms(),
        })
    }

    /// Record the completed call
    pub async fn finish(&self, open: OpenToolUse, status: ToolStatus, result_summary: &str) -> StateResult<u64> {
        let entry = ToolUseEntry::new(
            &open.run_id,
            open.seq,
            &open.tool_name,
            open.arguments,
            open.started_at,
            now_ms(),
            status,
            result_summary,
        );
        self.state.append_tool_use(entry).await?;
        Ok(open.seq)
    }

    pub async fn read(&self) -> StateResult<Vec<ToolUseEntry>> {
        self.state.list_tool_uses(&self.run_id).await
    }

    pub async fn close(&self) -> StateResult<()> {
        let entries = self.read().await?.len() as u64;
        super::publish_close(&self.state, &self.run_id, "tool_use", entries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn recorder() -> (TempDir, ToolUseRecorder) {
        let temp = TempDir::new().unwrap();
        let state = StateManager::spawn(temp.path().join("store")).unwrap();
        (temp, ToolUseRecorder::new(state, "run-1"))
    }

    #[tokio::test]
    async fn test_begin_finish_records_timing_and_seq() {
        let (_temp, recorder) = recorder().await;

        let open = recorder.begin("edit_file", json!({"path": "a.rs"})).await.unwrap();
        let seq = recorder.finish(open, ToolStatus::Ok, "wrote 10 lines").await.unwrap();
        assert_eq!(seq, 1);

        let entries = recorder.read().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tool_name, "edit_file");
        assert!(entries[0].ended_at >= entries[0].started_at);
    }

    #[tokio::test]
    async fn test_interleaved_calls_keep_start_order() {
        let (_temp, recorder) = recorder().await;

        let first = recorder.begin("read_file", json!({})).await.unwrap();
        let second = recorder.begin("run_command", json!({})).await.unwrap();

        // Finish out of order
        recorder.finish(second, ToolStatus::Error, "exit 1").await.unwrap();
        recorder.finish(first, ToolStatus::Ok, "ok").await.unwrap();

        let entries = recorder.read().await.unwrap();
        assert_eq!(entries[0].tool_name, "read_file");
        assert_eq!(entries[1].tool_name, "run_command");
    }
}
