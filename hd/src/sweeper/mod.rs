//! Orphan sweeper - periodic cleanup of leaked coordination state
//!
//! Releases locks whose holder is no longer alive, deletes checkpoints past
//! retention, closes transcripts of crashed runs, and requeues tasks left
//! in_progress by a crashed run.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::domain::{ContentClass, Filter, RunStatus, TaskStatus, TranscriptEntry};
use crate::events::{BusEvent, EventBus};
use crate::locks::LockRegistry;
use crate::state::StateResult;

/// Sweeper tunables
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub max_attempts_per_task: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_attempts_per_task: 3,
        }
    }
}

/// What one sweep cleaned up
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub locks_released: usize,
    pub checkpoints_deleted: usize,
    pub transcripts_closed: usize,
    pub tasks_requeued: usize,
}

#[derive(Clone)]
pub struct OrphanSweeper {
    bus: Arc<EventBus>,
    locks: LockRegistry,
    checkpoints: CheckpointManager,
    config: SweeperConfig,
}

impl OrphanSweeper {
    pub fn new(bus: Arc<EventBus>, locks: LockRegistry, checkpoints: CheckpointManager, config: SweeperConfig) -> Self {
        Self {
            bus,
            locks,
            checkpoints,
            config,
        }
    }

    /// Run until shutdown
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!("Orphan sweeper started");
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) => debug!(?report, "Sweep complete"),
                        Err(e) => warn!(error = %e, "Sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Orphan sweeper stopped");
    }

    /// One full sweep pass
    pub async fn sweep_once(&self) -> StateResult<SweepReport> {
        let mut report = SweepReport::default();
        report.locks_released = self.release_dead_holders().await?;
        report.locks_released += self.locks.expire_stale().await?.len();
        report.checkpoints_deleted = self.collect_checkpoints().await?;
        let (closed, requeued) = self.settle_crashed_runs().await?;
        report.transcripts_closed = closed;
        report.tasks_requeued = requeued;
        Ok(report)
    }

    /// Locks whose holder is not in a lock-eligible status
    async fn release_dead_holders(&self) -> StateResult<usize> {
        let state = self.bus.state();
        let mut released = 0;
        for lock in self.locks.table().await? {
            let alive = match state.get_run(&lock.held_by).await? {
                Some(run) => run.status.may_hold_locks(),
                None => false,
            };
            if !alive {
                warn!(path = %lock.resource_path, holder = %lock.held_by, "Releasing orphan lock");
                if self.locks.unlock(&lock.resource_path, &lock.held_by).await? {
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    /// Released checkpoints past retention, plus checkpoints whose run is gone
    async fn collect_checkpoints(&self) -> StateResult<usize> {
        let state = self.bus.state();
        let mut deleted = 0;

        for checkpoint in self.checkpoints.deletable().await? {
            self.checkpoints.delete(&checkpoint.id).await?;
            deleted += 1;
        }

        for checkpoint in self.checkpoints.list().await? {
            if state.get_run(&checkpoint.run_id).await?.is_none() {
                debug!(checkpoint = %checkpoint.id, "Checkpoint has no owning run");
                self.checkpoints.delete(&checkpoint.id).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Crashed runs: close their transcripts, and requeue (or block) tasks
    /// they left in_progress.
    async fn settle_crashed_runs(&self) -> StateResult<(usize, usize)> {
        let state = self.bus.state();
        let mut closed = 0;
        let mut requeued = 0;

        for run in state.list_runs(vec![Filter::eq("status", "crashed")]).await? {
            // Terminal transcript marker, once
            let transcript = state.list_transcript(&run.id).await?;
            let already_closed = transcript
                .last()
                .is_some_and(|e| e.content.contains("transcript closed"));
            if !already_closed {
                let seq = transcript.iter().map(|e| e.seq).max().unwrap_or(0) + 1;
                state
                    .append_transcript(TranscriptEntry::new(
                        &run.id,
                        seq,
                        "system",
                        "--- transcript closed: crashed ---",
                        ContentClass::AgentOutput,
                    ))
                    .await?;
                closed += 1;
            }

            // The task may still think it is being worked on
            let Some(task) = state.get_task(&run.task_id).await? else {
                continue;
            };
            if task.status == TaskStatus::InProgress {
                let target = if task.attempts + 1 < self.config.max_attempts_per_task {
                    TaskStatus::Pending
                } else {
                    TaskStatus::Blocked
                };
                info!(task_id = %task.id, target = %target, "Requeueing task of crashed run");
                if let Some(ref checkpoint_id) = run.checkpoint_id
                    && let Err(e) = self.checkpoints.rollback(checkpoint_id).await
                {
                    warn!(checkpoint_id, error = %e, "Rollback during sweep failed");
                }
                state.transition_task(&task.id, target, None).await?;

                let mut task = state.get_task_required(&task.id).await?;
                task.record_attempt();
                state.update_task(task).await?;

                self.locks.release_holder(&run.id).await?;
                requeued += 1;
            }
        }
        Ok((closed, requeued))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadlock::WaitGraph;
    use crate::domain::{AgentRole, Checkpoint, ExecutionRun, Task, TaskCategory};
    use crate::state::StateManager;
    use crate::worktree::{WorktreeConfig, WorktreeManager};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        bus: Arc<EventBus>,
        sweeper: OrphanSweeper,
    }

    async fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let state = StateManager::spawn(temp.path().join("store")).unwrap();
        let bus = Arc::new(EventBus::new(state));
        let locks = LockRegistry::new(bus.clone(), Arc::new(Mutex::new(WaitGraph::new())), 60_000);
        let worktrees = WorktreeManager::new(WorktreeConfig {
            base_dir: temp.path().join("worktrees"),
            repo_root: temp.path().join("repo"),
            ..Default::default()
        });
        let checkpoints = CheckpointManager::new(bus.clone(), worktrees, 0);
        let sweeper = OrphanSweeper::new(bus.clone(), locks, checkpoints, SweeperConfig::default());
        Fixture {
            _temp: temp,
            bus,
            sweeper,
        }
    }

    #[tokio::test]
    async fn test_orphan_locks_released() {
        let f = fixture().await;
        let state = f.bus.state();

        // A lock held by a crashed run and one held by a live run
        let mut dead = ExecutionRun::new("t1", AgentRole::Builder, 1);
        dead.set_status(RunStatus::Crashed);
        let dead_id = state.create_run(dead).await.unwrap();

        let mut live = ExecutionRun::new("t2", AgentRole::Builder, 1);
        live.set_status(RunStatus::Running);
        let live_id = state.create_run(live).await.unwrap();

        state.try_lock("a.rs", &dead_id, "edit", 600_000).await.unwrap();
        state.try_lock("b.rs", &live_id, "edit", 600_000).await.unwrap();

        let report = f.sweeper.sweep_once().await.unwrap();
        assert_eq!(report.locks_released, 1);
        assert!(state.check_lock("a.rs").await.unwrap().is_none());
        assert!(state.check_lock("b.rs").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_checkpoint_without_run_deleted() {
        let f = fixture().await;
        let state = f.bus.state();

        let checkpoint = Checkpoint::new("ghost-run", "ghost-task", "deadbeef");
        let id = checkpoint.id.clone();
        state.create_checkpoint(checkpoint).await.unwrap();

        let report = f.sweeper.sweep_once().await.unwrap();
        assert_eq!(report.checkpoints_deleted, 1);
        assert!(state.get_checkpoint(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_crashed_run_requeues_task_and_closes_transcript() {
        let f = fixture().await;
        let state = f.bus.state();

        let task = Task::new(TaskCategory::Feature, "t")
            .with_description("d")
            .with_criteria(vec!["x".to_string()])
            .with_codebase_tests(vec!["true".to_string()]);
        let task_id = state.create_task(task).await.unwrap();
        state.submit_task(&task_id).await.unwrap();

        let run_id = state
            .start_run(
                ExecutionRun::new(&task_id, AgentRole::Builder, 1),
                crate::state::EventDraft::new("test", "run_started", serde_json::json!({})),
            )
            .await
            .unwrap();

        // The run dies without cleanup
        let mut run = state.get_run_required(&run_id).await.unwrap();
        run.set_status(RunStatus::Crashed);
        state.update_run(run).await.unwrap();

        let report = f.sweeper.sweep_once().await.unwrap();
        assert_eq!(report.tasks_requeued, 1);
        assert_eq!(report.transcripts_closed, 1);

        let task = state.get_task_required(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);

        let transcript = state.list_transcript(&run_id).await.unwrap();
        assert!(transcript.last().unwrap().content.contains("transcript closed"));

        // Second sweep is a no-op
        let report = f.sweeper.sweep_once().await.unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn test_attempt_exhaustion_blocks_instead() {
        let f = fixture().await;
        let state = f.bus.state();

        let mut task = Task::new(TaskCategory::Feature, "t")
            .with_description("d")
            .with_criteria(vec!["x".to_string()])
            .with_codebase_tests(vec!["true".to_string()]);
        task.attempts = 2; // one short of the default cap of 3
        let task_id = state.create_task(task).await.unwrap();
        state.submit_task(&task_id).await.unwrap();

        let run_id = state
            .start_run(
                ExecutionRun::new(&task_id, AgentRole::Builder, 1),
                crate::state::EventDraft::new("test", "run_started", serde_json::json!({})),
            )
            .await
            .unwrap();
        let mut run = state.get_run_required(&run_id).await.unwrap();
        run.set_status(RunStatus::Crashed);
        state.update_run(run).await.unwrap();

        f.sweeper.sweep_once().await.unwrap();
        let task = state.get_task_required(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
    }
}
