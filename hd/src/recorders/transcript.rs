//! Transcript recorder - everything an agent says

use crate::domain::{ContentClass, TranscriptEntry};
use crate::state::{StateManager, StateResult};

use super::SeqCounter;

#[derive(Clone)]
pub struct TranscriptRecorder {
    state: StateManager,
    run_id: String,
    seq: SeqCounter,
}

impl TranscriptRecorder {
    pub fn new(state: StateManager, run_id: &str) -> Self {
        Self {
            state,
            run_id: run_id.to_string(),
            seq: SeqCounter::new(),
        }
    }

    /// Append one transcript line
    pub async fn record(&self, role: &str, content: &str, class: ContentClass) -> StateResult<u64> {
        let state = self.state.clone();
        let run_id = self.run_id.clone();
        let seq = self
            .seq
            .next(|| async move {
                let existing = state.list_transcript(&run_id).await?;
                Ok(existing.iter().map(|e| e.seq).max().unwrap_or(0))
            })
            .await?;

        let entry = TranscriptEntry::new(&self.run_id, seq, role, content, class);
        self.state.append_transcript(entry).await?;
        Ok(seq)
    }

    /// Full transcript in sequence order
    pub async fn read(&self) -> StateResult<Vec<TranscriptEntry>> {
        self.state.list_transcript(&self.run_id).await
    }

    /// Close the transcript, appending a terminal marker and emitting the
    /// consolidated event.
    pub async fn close(&self, outcome: &str) -> StateResult<()> {
        let seq = self
            .record("system", &format!("--- transcript closed: {outcome} ---"), ContentClass::AgentOutput)
            .await?;
        super::publish_close(&self.state, &self.run_id, "transcript", seq).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn recorder() -> (TempDir, TranscriptRecorder) {
        let temp = TempDir::new().unwrap();
        let state = StateManager::spawn(temp.path().join("store")).unwrap();
        (temp, TranscriptRecorder::new(state, "run-1"))
    }

    #[tokio::test]
    async fn test_sequences_are_contiguous_from_one() {
        let (_temp, recorder) = recorder().await;

        for i in 0..5 {
            let seq = recorder
                .record("agent", &format!("line {i}"), ContentClass::AgentOutput)
                .await
                .unwrap();
            assert_eq!(seq, i + 1);
        }

        let entries = recorder.read().await.unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_concurrent_writers_no_gaps() {
        let (_temp, recorder) = recorder().await;

        let mut handles = Vec::new();
        for i in 0..10 {
            let r = recorder.clone();
            handles.push(tokio::spawn(async move {
                r.record("agent", &format!("concurrent {i}"), ContentClass::Reasoning).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let entries = recorder.read().await.unwrap();
        let mut seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_fresh_recorder_continues_sequence() {
        let temp = TempDir::new().unwrap();
        let state = StateManager::spawn(temp.path().join("store")).unwrap();

        let first = TranscriptRecorder::new(state.clone(), "run-1");
        first.record("agent", "one", ContentClass::AgentOutput).await.unwrap();
        first.record("agent", "two", ContentClass::AgentOutput).await.unwrap();

        // Simulates a daemon restart mid-run
        let second = TranscriptRecorder::new(state, "run-1");
        let seq = second.record("agent", "three", ContentClass::AgentOutput).await.unwrap();
        assert_eq!(seq, 3);
    }

    #[tokio::test]
    async fn test_close_appends_terminal_marker() {
        let (_temp, recorder) = recorder().await;
        recorder.record("agent", "work", ContentClass::AgentOutput).await.unwrap();
        recorder.close("crashed").await.unwrap();

        let entries = recorder.read().await.unwrap();
        assert!(entries.last().unwrap().content.contains("transcript closed: crashed"));
    }
}
