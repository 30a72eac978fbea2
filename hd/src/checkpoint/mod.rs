//! Checkpoint manager - workspace snapshots with rollback
//!
//! A checkpoint is taken before a run modifies anything: the run worktree's
//! HEAD commit is recorded as the rollback anchor. Rollback hard-resets the
//! worktree to that commit. After a verified success the checkpoint is
//! released and survives a retention window for post-hoc rollback.

use std::sync::Arc;

use tracing::{info, warn};

use crate::domain::{Checkpoint, now_ms};
use crate::events::{BusEvent, EventBus};
use crate::state::{StateError, StateResult};
use crate::worktree::{WorktreeError, WorktreeManager};

/// Errors from checkpoint operations
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint missing: {0}")]
    CheckpointMissing(String),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),
}

#[derive(Clone)]
pub struct CheckpointManager {
    bus: Arc<EventBus>,
    worktrees: WorktreeManager,
    retention_ms: i64,
}

impl CheckpointManager {
    pub fn new(bus: Arc<EventBus>, worktrees: WorktreeManager, retention_ms: i64) -> Self {
        Self {
            bus,
            worktrees,
            retention_ms,
        }
    }

    /// Snapshot the run's worktree before any writes. The anchor is the
    /// current HEAD of the run branch.
    pub async fn create(&self, run_id: &str, task_id: &str) -> Result<Checkpoint, CheckpointError> {
        let path = self.worktrees.worktree_path(run_id);
        let head = self.worktrees.rev_parse(&path, "HEAD").await?;

        let checkpoint = Checkpoint::new(run_id, task_id, &head);
        self.bus.state().create_checkpoint(checkpoint.clone()).await?;
        info!(run_id, checkpoint = %checkpoint.id, anchor = %head, "Checkpoint created");
        Ok(checkpoint)
    }

    /// Restore the owning run's worktree to the snapshot. The caller is
    /// responsible for cleaning derived artifacts (locks, in-flight events).
    pub async fn rollback(&self, checkpoint_id: &str) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = self
            .bus
            .state()
            .get_checkpoint(checkpoint_id)
            .await?
            .ok_or_else(|| CheckpointError::CheckpointMissing(checkpoint_id.to_string()))?;

        let path = self.worktrees.worktree_path(&checkpoint.run_id);
        if !path.exists() || !self.worktrees.ref_exists(&checkpoint.git_ref).await {
            warn!(checkpoint_id, git_ref = %checkpoint.git_ref, "Checkpoint ref lost");
            return Err(CheckpointError::CheckpointMissing(checkpoint_id.to_string()));
        }

        self.worktrees.reset_hard(&path, &checkpoint.git_ref).await?;

        self.bus
            .publish(
                "checkpoint",
                BusEvent::RollbackTriggered {
                    run_id: checkpoint.run_id.clone(),
                    checkpoint_id: checkpoint.id.clone(),
                },
            )
            .await?;

        info!(checkpoint_id, run_id = %checkpoint.run_id, "Rolled back");
        Ok(checkpoint)
    }

    /// Mark the checkpoint released after a verified success. It becomes
    /// deletable once the retention window passes.
    pub async fn release(&self, checkpoint_id: &str) -> Result<(), CheckpointError> {
        let mut checkpoint = self
            .bus
            .state()
            .get_checkpoint(checkpoint_id)
            .await?
            .ok_or_else(|| CheckpointError::CheckpointMissing(checkpoint_id.to_string()))?;
        checkpoint.release();
        self.bus.state().update_checkpoint(checkpoint).await?;
        Ok(())
    }

    /// Delete a checkpoint record outright
    pub async fn delete(&self, checkpoint_id: &str) -> StateResult<()> {
        self.bus.state().delete_checkpoint(checkpoint_id).await
    }

    /// All checkpoints, for the orphan sweep
    pub async fn list(&self) -> StateResult<Vec<Checkpoint>> {
        self.bus.state().list_checkpoints().await
    }

    /// Checkpoints past their retention window
    pub async fn deletable(&self) -> StateResult<Vec<Checkpoint>> {
        let now = now_ms();
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|c| c.is_deletable(now, self.retention_ms))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateManager;
    use crate::worktree::WorktreeConfig;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, CheckpointManager, WorktreeManager) {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        tokio::fs::create_dir_all(&repo).await.unwrap();
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "hd@test"],
            vec!["config", "user.name", "hd"],
        ] {
            let out = tokio::process::Command::new("git")
                .args(&args)
                .current_dir(&repo)
                .output()
                .await
                .unwrap();
            assert!(out.status.success());
        }
        tokio::fs::write(repo.join("a.txt"), "one\n").await.unwrap();
        for args in [vec!["add", "-A"], vec!["commit", "-m", "init"]] {
            let out = tokio::process::Command::new("git")
                .args(&args)
                .current_dir(&repo)
                .output()
                .await
                .unwrap();
            assert!(out.status.success());
        }

        let worktrees = WorktreeManager::new(WorktreeConfig {
            base_dir: temp.path().join("worktrees"),
            repo_root: repo,
            branch_prefix: "hive".to_string(),
            trunk: "main".to_string(),
        });
        let state = StateManager::spawn(temp.path().join("store")).unwrap();
        let bus = Arc::new(EventBus::new(state));
        let manager = CheckpointManager::new(bus, worktrees.clone(), 60_000);
        (temp, manager, worktrees)
    }

    #[tokio::test]
    async fn test_rollback_restores_start_commit() {
        let (_temp, checkpoints, worktrees) = setup().await;
        let info = worktrees.create("run-1").await.unwrap();

        let checkpoint = checkpoints.create("run-1", "task-1").await.unwrap();
        assert_eq!(checkpoint.git_ref, info.start_commit);

        // The run does some damage
        tokio::fs::write(info.path.join("a.txt"), "mangled\n").await.unwrap();
        worktrees.commit_all(&info.path, "mangle").await.unwrap();

        checkpoints.rollback(&checkpoint.id).await.unwrap();

        let head = worktrees.rev_parse(&info.path, "HEAD").await.unwrap();
        assert_eq!(head, info.start_commit);
        let content = tokio::fs::read_to_string(info.path.join("a.txt")).await.unwrap();
        assert_eq!(content, "one\n");
    }

    #[tokio::test]
    async fn test_missing_checkpoint_errors() {
        let (_temp, checkpoints, _worktrees) = setup().await;
        let err = checkpoints.rollback("ckpt-nope").await.unwrap_err();
        assert!(matches!(err, CheckpointError::CheckpointMissing(_)));
    }

    #[tokio::test]
    async fn test_release_then_retention_gc() {
        let (_temp, checkpoints, worktrees) = setup().await;
        worktrees.create("run-1").await.unwrap();

        let checkpoint = checkpoints.create("run-1", "task-1").await.unwrap();
        assert!(checkpoints.deletable().await.unwrap().is_empty());

        checkpoints.release(&checkpoint.id).await.unwrap();
        // Retention window (60s) has not passed yet
        assert!(checkpoints.deletable().await.unwrap().is_empty());
    }
}
