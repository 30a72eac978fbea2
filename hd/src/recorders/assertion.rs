//! Assertion recorder - ordered check chains with computed verdicts

use crate::domain::AssertionChain;
use crate::state::{StateManager, StateResult};

use super::SeqCounter;

#[derive(Clone)]
pub struct AssertionRecorder {
    state: StateManager,
    run_id: String,
    seq: SeqCounter,
}

impl AssertionRecorder {
    pub fn new(state: StateManager, run_id: &str) -> Self {
        Self {
            state,
            run_id: run_id.to_string(),
            seq: SeqCounter::new(),
        }
    }

    /// Open a new chain. Steps are pushed onto it and the whole chain is
    /// persisted once with [`AssertionRecorder::commit`].
    pub async fn open_chain(&self, chain_name: &str) -> StateResult<AssertionChain> {
        let state = self.state.clone();
        let run_id = self.run_id.clone();
        let seq = self
            .seq
            .next(|| async move {
                let existing = state.list_assertions(&run_id).await?;
                Ok(existing.iter().map(|c| c.seq).max().unwrap_or(0))
            })
            .await?;
        Ok(AssertionChain::new(&self.run_id, seq, chain_name))
    }

    /// Persist a finished chain; the verdict is derived from its steps
    pub async fn commit(&self, chain: AssertionChain) -> StateResult<bool> {
        let verdict = chain.verdict();
        self.state.append_assertion(chain).await?;
        Ok(verdict)
    }

    pub async fn read(&self) -> StateResult<Vec<AssertionChain>> {
        self.state.list_assertions(&self.run_id).await
    }

    pub async fn close(&self) -> StateResult<()> {
        let entries = self.read().await?.len() as u64;
        super::publish_close(&self.state, &self.run_id, "assertion", entries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn recorder() -> (TempDir, AssertionRecorder) {
        let temp = TempDir::new().unwrap();
        let state = StateManager::spawn(temp.path().join("store")).unwrap();
        (temp, AssertionRecorder::new(state, "run-1"))
    }

    #[tokio::test]
    async fn test_chain_verdict_from_members() {
        let (_temp, recorder) = recorder().await;

        let mut chain = recorder.open_chain("login flow").await.unwrap();
        chain.push_step("returns 200", true, "");
        chain.push_step("token present", true, "");
        assert!(recorder.commit(chain).await.unwrap());

        let mut failing = recorder.open_chain("logout flow").await.unwrap();
        failing.push_step("returns 200", true, "");
        failing.push_step("session cleared", false, "cookie still set");
        assert!(!recorder.commit(failing).await.unwrap());

        let chains = recorder.read().await.unwrap();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0].seq, 1);
        assert_eq!(chains[1].seq, 2);
    }
}
