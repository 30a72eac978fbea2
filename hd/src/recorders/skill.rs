//! Skill-trace recorder - named skill invocations wrapping tool uses

use crate::domain::{SkillTrace, ToolStatus, now_ms};
use crate::state::{StateManager, StateResult};

use super::SeqCounter;

#[derive(Clone)]
pub struct SkillRecorder {
    state: StateManager,
    run_id: String,
    seq: SeqCounter,
}

impl SkillRecorder {
    pub fn new(state: StateManager, run_id: &str) -> Self {
        Self {
            state,
            run_id: run_id.to_string(),
            seq: SeqCounter::new(),
        }
    }

    /// Open a skill invocation; nest tool-use sequence numbers into it as
    /// they happen, then finish with the final status.
    pub async fn begin(&self, skill_name: &str) -> StateResult<SkillTrace> {
        let state = self.state.clone();
        let run_id = self.run_id.clone();
        let seq = self
            .seq
            .next(|| async move {
                let existing = state.list_skill_traces(&run_id).await?;
                Ok(existing.iter().map(|t| t.seq).max().unwrap_or(0))
            })
            .await?;
        Ok(SkillTrace::new(&self.run_id, seq, skill_name))
    }

    pub async fn finish(&self, mut trace: SkillTrace, status: ToolStatus) -> StateResult<u64> {
        trace.status = status;
        trace.ended_at = now_ms();
        let seq = trace.seq;
        self.state.append_skill_trace(trace).await?;
        Ok(seq)
    }

    pub async fn read(&self) -> StateResult<Vec<SkillTrace>> {
        self.state.list_skill_traces(&self.run_id).await
    }

    pub async fn close(&self) -> StateResult<()> {
        let entries = self.read().await?.len() as u64;
        super::publish_close(&self.state, &self.run_id, "skill", entries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_skill_with_nested_tool_uses() {
        let temp = TempDir::new().unwrap();
        let state = StateManager::spawn(temp.path().join("store")).unwrap();
        let recorder = SkillRecorder::new(state, "run-1");

        let mut trace = recorder.begin("apply-migration").await.unwrap();
        trace.tool_use_seqs.push(4);
        trace.tool_use_seqs.push(5);
        recorder.finish(trace, ToolStatus::Ok).await.unwrap();

        let traces = recorder.read().await.unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].skill_name, "apply-migration");
        assert_eq!(traces[0].tool_use_seqs, vec![4, 5]);
        assert_eq!(traces[0].status, ToolStatus::Ok);
        let _ = temp;
    }
}
