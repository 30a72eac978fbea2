//! Agent lifecycle manager
//!
//! Owns the whole life of an execution run: branch + checkpoint before the
//! agent starts, worker subprocess spawn, heartbeat watching, pause/kill,
//! crash handling, and retry classification when an attempt fails.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::domain::{AgentRole, ContentClass, ExecutionRun, Filter, RunStatus, Task, TaskStatus, now_ms};
use crate::error::{ErrorKind, HarnessError};
use crate::events::{BusEvent, EventBus};
use crate::knowledge::KnowledgeBase;
use crate::locks::LockRegistry;
use crate::prompts::ContextPack;
use crate::recorders::TranscriptRecorder;
use crate::registry::ResourceRegistry;
use crate::state::{EventDraft, StateError, StateResult};
use crate::worktree::WorktreeManager;

use super::health::{AgentHealth, HealthThresholds};

/// Lifecycle tunables
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub heartbeat: HealthThresholds,
    pub max_attempts_per_task: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,
    /// Grace window between a pause request and a compulsory kill
    pub pause_grace: Duration,
    /// Per-run wall-clock budget
    pub wallclock_per_task: Duration,
    /// Binary spawned as the agent worker; defaults to the current exe
    pub worker_binary: Option<PathBuf>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            heartbeat: HealthThresholds::default(),
            max_attempts_per_task: 3,
            retry_backoff_base: Duration::from_secs(5),
            retry_backoff_max: Duration::from_secs(300),
            pause_grace: Duration::from_secs(15),
            wallclock_per_task: Duration::from_secs(3_600),
            worker_binary: None,
        }
    }
}

#[derive(Clone)]
pub struct LifecycleManager {
    bus: Arc<EventBus>,
    locks: LockRegistry,
    checkpoints: CheckpointManager,
    worktrees: WorktreeManager,
    knowledge: KnowledgeBase,
    registry: ResourceRegistry,
    config: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(
        bus: Arc<EventBus>,
        locks: LockRegistry,
        checkpoints: CheckpointManager,
        worktrees: WorktreeManager,
        knowledge: KnowledgeBase,
        registry: ResourceRegistry,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            bus,
            locks,
            checkpoints,
            worktrees,
            knowledge,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Launch an agent for a scheduled task: branch, checkpoint, context
    /// pack, worker subprocess, transcript routing.
    pub async fn launch(&self, task_id: &str) -> StateResult<String> {
        let state = self.bus.state();
        let task = state.get_task_required(task_id).await?;
        let attempt_no = task.attempts + 1;

        let mut run = ExecutionRun::new(task_id, AgentRole::Builder, attempt_no);
        let run_id = run.id.clone();

        // Workspace first: branch and start commit exist before the run row
        let info = self
            .worktrees
            .create(&run_id)
            .await
            .map_err(|e| StateError::Store(e.to_string()))?;
        run.branch = Some(info.branch.clone());
        run.start_commit = Some(info.start_commit.clone());

        let started = BusEvent::RunStarted {
            run_id: run_id.clone(),
            task_id: task_id.to_string(),
            attempt_no,
        };
        state
            .start_run(
                run.clone(),
                EventDraft::new("lifecycle", started.event_type(), started.to_payload()),
            )
            .await?;

        // Pre-write snapshot
        let checkpoint = self
            .checkpoints
            .create(&run_id, task_id)
            .await
            .map_err(|e| StateError::Store(e.to_string()))?;
        run.checkpoint_id = Some(checkpoint.id.clone());

        // Context pack: task record, knowledge, prior-attempt hints
        let knowledge_context = self.knowledge.context_for_task(&task).await?;
        let pack = ContextPack::build(&task, attempt_no, &knowledge_context);
        let pack_path = info.path.join(".hive-context.json");
        tokio::fs::write(&pack_path, pack.to_json())
            .await
            .map_err(|e| StateError::Store(e.to_string()))?;

        // Spawn the worker subprocess
        let binary = self
            .config
            .worker_binary
            .clone()
            .or_else(|| std::env::current_exe().ok())
            .unwrap_or_else(|| PathBuf::from("hd"));

        let mut child = Command::new(&binary)
            .args(["worker", "--run-id", &run_id])
            .current_dir(&info.path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StateError::Store(format!("worker spawn failed: {e}")))?;

        run.pid = child.id();
        run.set_status(RunStatus::Running);
        state.update_run(run).await?;

        // Route worker output into the transcript
        let transcripts = TranscriptRecorder::new(state.clone(), &run_id);
        if let Some(stdout) = child.stdout.take() {
            let recorder = transcripts.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = recorder.record("agent", &line, ContentClass::AgentOutput).await;
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let recorder = transcripts;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = recorder.record("agent", &line, ContentClass::Reasoning).await;
                }
            });
        }

        // Detach: termination is observed via heartbeats and claims
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        info!(run_id = %run_id, task_id, attempt_no, "Agent launched");
        Ok(run_id)
    }

    /// One heartbeat-watch pass over live runs. Returns the runs found
    /// crashed so the caller can clean them up.
    pub async fn check_heartbeats(&self) -> StateResult<Vec<String>> {
        let state = self.bus.state();
        let now = now_ms();
        let mut crashed = Vec::new();

        for run in state.list_runs(vec![Filter::eq("status", "running")]).await? {
            let age = run.heartbeat_age_ms(now);
            match self.config.heartbeat.classify(age) {
                AgentHealth::Healthy | AgentHealth::Stale => {}
                AgentHealth::Stuck => {
                    warn!(run_id = %run.id, age_ms = age, "Run is stuck");
                    self.bus
                        .publish(
                            "lifecycle",
                            BusEvent::ErrorRaised {
                                source: run.id.clone(),
                                kind: ErrorKind::Transient,
                                message: format!("no heartbeat for {age}ms"),
                            },
                        )
                        .await?;
                }
                AgentHealth::Crashed => {
                    warn!(run_id = %run.id, age_ms = age, "Run declared crashed");
                    crashed.push(run.id.clone());
                }
            }
        }
        Ok(crashed)
    }

    /// After the gate accepts a run: merge its branch into trunk through
    /// the controlled rebase path, release the checkpoint into its
    /// retention window, and drop the worktree. A rebase conflict leaves
    /// everything in place and escalates to a human decision.
    pub async fn finalize_verified(&self, run_id: &str) -> StateResult<()> {
        let state = self.bus.state();
        let run = state.get_run_required(run_id).await?;

        match crate::worktree::merge_to_trunk(&self.worktrees, run_id).await {
            Ok(crate::worktree::MergeResult::Merged { commit }) => {
                info!(run_id, commit, "Run branch merged into trunk");
                if let Some(ref checkpoint_id) = run.checkpoint_id
                    && let Err(e) = self.checkpoints.release(checkpoint_id).await
                {
                    warn!(run_id, error = %e, "Checkpoint release failed");
                }
                let _ = self.worktrees.remove(run_id).await;
            }
            Ok(crate::worktree::MergeResult::Conflicted { paths }) => {
                warn!(run_id, ?paths, "Merge conflicts with trunk; escalating");
                self.bus
                    .publish(
                        "lifecycle",
                        BusEvent::DecisionNeeded {
                            decision_id: crate::domain::generate_id("dec", run_id),
                            question: format!(
                                "Verified run {run_id} conflicts with trunk on {paths:?}. Rebase by hand or discard?"
                            ),
                            options: vec!["rebase-manually".to_string(), "discard-run".to_string()],
                            default_choice: "rebase-manually".to_string(),
                            timeout_ms: 600_000,
                        },
                    )
                    .await?;
            }
            Err(e) => {
                warn!(run_id, error = %e, "Merge attempt errored");
            }
        }
        Ok(())
    }

    /// Record a heartbeat from a worker
    pub async fn heartbeat(&self, run_id: &str) -> StateResult<()> {
        let state = self.bus.state();
        let mut run = state.get_run_required(run_id).await?;
        run.heartbeat();
        state.update_run(run).await?;
        Ok(())
    }

    /// Clean up a crashed run: kill leftovers, roll back, release claims,
    /// and requeue or block the task.
    pub async fn handle_crash(&self, run_id: &str, reason: &str) -> StateResult<()> {
        let state = self.bus.state();
        let run = state.get_run_required(run_id).await?;
        let task = state.get_task_required(&run.task_id).await?;

        if let Some(pid) = run.pid {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }

        if let Some(ref checkpoint_id) = run.checkpoint_id
            && let Err(e) = self.checkpoints.rollback(checkpoint_id).await
        {
            warn!(run_id, error = %e, "Rollback during crash cleanup failed");
        }

        let error = HarnessError::transient(format!("agent crashed: {reason}"));
        // A crash mid-validation counts as a rejected claim; anything else
        // is classified for retry.
        let task_to = match task.status {
            TaskStatus::Validating => TaskStatus::Failed,
            _ => self.requeue_target(&task, &error),
        };

        let crashed = BusEvent::RunCrashed {
            run_id: run_id.to_string(),
            task_id: run.task_id.clone(),
            reason: reason.to_string(),
        };
        state
            .finish_run(
                run_id,
                RunStatus::Crashed,
                Some(task_to),
                EventDraft::new("lifecycle", crashed.event_type(), crashed.to_payload()),
            )
            .await?;

        // Wait edges and resource claims do not survive the run
        self.locks.release_holder(run_id).await?;
        self.registry.release_run(run_id).await?;
        let _ = self.worktrees.remove(run_id).await;

        info!(run_id, task_to = %task_to, "Crash cleanup done");
        Ok(())
    }

    /// Where a failed attempt sends the task
    pub fn requeue_target(&self, task: &Task, error: &HarnessError) -> TaskStatus {
        requeue_target(&self.config, task, error)
    }

    /// Exponential backoff for a retry attempt (1-based), bounded
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        backoff_delay(&self.config, attempt)
    }

    /// Schedule a failed task back to pending after backoff. The failure
    /// summary is stored as knowledge so the next attempt sees it.
    pub async fn requeue_after_failure(&self, task_id: &str, failure_summary: &str) -> StateResult<()> {
        let state = self.bus.state();
        let task = state.get_task_required(task_id).await?;

        self.knowledge.record_failure_hint(&task, failure_summary).await?;

        let error = HarnessError::verification(failure_summary.to_string());
        let target = self.requeue_target(&task, &error);

        if target == TaskStatus::Pending {
            let delay = self.backoff_delay(task.attempts);
            debug!(task_id, ?delay, attempts = task.attempts, "Retry scheduled");
            let state = state.clone();
            let task_id = task_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = state.transition_task(&task_id, TaskStatus::Pending, None).await {
                    warn!(task_id, error = %e, "Retry transition failed");
                }
            });
        } else {
            state.transition_task(task_id, TaskStatus::Blocked, None).await?;
            info!(task_id, "Attempts exhausted or permanent failure; task blocked");
        }
        Ok(())
    }

    /// Deliver a graceful stop; kill after the grace window. The checkpoint
    /// is rolled back on compulsory kill.
    pub async fn pause(&self, run_id: &str) -> StateResult<()> {
        self.bus
            .publish("lifecycle", BusEvent::PauseRequested { target: run_id.to_string() })
            .await?;
        self.enact_pause(run_id).await
    }

    /// The enforcement half of a pause: signal, then kill after grace
    async fn enact_pause(&self, run_id: &str) -> StateResult<()> {
        let run = self.bus.state().get_run_required(run_id).await?;
        if let Some(pid) = run.pid {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        let grace = self.config.pause_grace;
        let this = self.clone();
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(e) = this.finish_pause(&run_id).await {
                warn!(run_id = %run_id, error = %e, "Pause completion failed");
            }
        });
        Ok(())
    }

    /// React to control events and watch heartbeats until shutdown
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let subscribed = self
            .bus
            .subscribe(
                "lifecycle",
                vec![
                    "pause_requested".to_string(),
                    "resume_requested".to_string(),
                    "force_release".to_string(),
                    "verification_failed".to_string(),
                    "verification_succeeded".to_string(),
                ],
                None,
            )
            .await;
        if let Err(e) = subscribed {
            warn!(error = %e, "Lifecycle subscription failed");
        }

        let mut ticker = tokio::time::interval(Duration::from_millis(
            (self.config.heartbeat.interval_ms as u64).max(1_000),
        ));

        info!("Lifecycle control loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.check_heartbeats().await {
                        Ok(crashed) => {
                            for run_id in crashed {
                                if let Err(e) = self.handle_crash(&run_id, "heartbeat lost").await {
                                    warn!(run_id, error = %e, "Crash cleanup failed");
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "Heartbeat check failed"),
                    }
                    if let Err(e) = self.drain_control_events().await {
                        warn!(error = %e, "Control event drain failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Lifecycle control loop stopped");
    }

    async fn drain_control_events(&self) -> StateResult<()> {
        for record in self.bus.poll("lifecycle", 32).await? {
            // Events this component published itself were already enacted
            if record.source != "lifecycle"
                && let Some(event) = BusEvent::from_payload(&record.payload)
            {
                match event {
                    BusEvent::PauseRequested { target } => {
                        if let Err(e) = self.enact_pause(&target).await {
                            warn!(target, error = %e, "Pause enactment failed");
                        }
                    }
                    BusEvent::ResumeRequested { target } => {
                        if let Err(e) = self.resume(&target).await {
                            warn!(target, error = %e, "Resume failed");
                        }
                    }
                    BusEvent::ForceRelease { run_id, reason } => {
                        if let Err(e) = self.handle_crash(&run_id, &reason).await {
                            warn!(run_id, error = %e, "Force release failed");
                        }
                    }
                    BusEvent::VerificationFailed { task_id, failing_checks, .. } => {
                        let summary = failing_checks.join(", ");
                        if let Err(e) = self.requeue_after_failure(&task_id, &summary).await {
                            warn!(task_id, error = %e, "Requeue after failure failed");
                        }
                    }
                    BusEvent::VerificationSucceeded { run_id, .. } => {
                        if let Err(e) = self.finalize_verified(&run_id).await {
                            warn!(run_id, error = %e, "Post-verification merge failed");
                        }
                    }
                    _ => {}
                }
            }
            self.bus.ack("lifecycle", &record.id).await?;
        }
        Ok(())
    }

    async fn finish_pause(&self, run_id: &str) -> StateResult<()> {
        let state = self.bus.state();
        let mut run = state.get_run_required(run_id).await?;
        if run.status != RunStatus::Running {
            return Ok(()); // already acknowledged or terminal
        }

        // Did not stop inside the grace window: compulsory kill + rollback
        if let Some(pid) = run.pid {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
        if let Some(ref checkpoint_id) = run.checkpoint_id {
            let _ = self.checkpoints.rollback(checkpoint_id).await;
        }
        run.set_status(RunStatus::Paused);
        state.update_run(run).await?;
        Ok(())
    }

    /// Resume a paused run if its branch and checkpoint still exist;
    /// otherwise the task goes back to pending for a fresh attempt.
    pub async fn resume(&self, run_id: &str) -> StateResult<bool> {
        let state = self.bus.state();
        let mut run = state.get_run_required(run_id).await?;
        if run.status != RunStatus::Paused {
            return Err(StateError::Invariant(format!("run {run_id} is not paused")));
        }

        let worktree_ok = self.worktrees.worktree_path(run_id).exists();
        let checkpoint_ok = match run.checkpoint_id {
            Some(ref id) => state.get_checkpoint(id).await?.is_some(),
            None => false,
        };

        self.bus
            .publish("lifecycle", BusEvent::ResumeRequested { target: run_id.to_string() })
            .await?;

        if worktree_ok && checkpoint_ok {
            run.set_status(RunStatus::Running);
            run.heartbeat();
            state.update_run(run).await?;
            Ok(true)
        } else {
            warn!(run_id, "Cannot resume: branch or checkpoint gone; requeueing task");
            let crashed = BusEvent::RunCrashed {
                run_id: run_id.to_string(),
                task_id: run.task_id.clone(),
                reason: "resume impossible".to_string(),
            };
            state
                .finish_run(
                    run_id,
                    RunStatus::Crashed,
                    Some(TaskStatus::Pending),
                    EventDraft::new("lifecycle", crashed.event_type(), crashed.to_payload()),
                )
                .await?;
            Ok(false)
        }
    }
}

/// Where a failed attempt sends the task: retry when the error kind is
/// retryable and attempts remain, blocked otherwise. Error category is
/// primary; the attempt count only bounds it.
pub fn requeue_target(config: &LifecycleConfig, task: &Task, error: &HarnessError) -> TaskStatus {
    if error.kind.is_retryable() && task.attempts + 1 < config.max_attempts_per_task {
        TaskStatus::Pending
    } else {
        TaskStatus::Blocked
    }
}

/// Exponential backoff for a retry attempt (1-based), bounded
pub fn backoff_delay(config: &LifecycleConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = config.retry_backoff_base.saturating_mul(2u32.saturating_pow(exp));
    delay.min(config.retry_backoff_max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskCategory;

    fn config() -> LifecycleConfig {
        LifecycleConfig {
            max_attempts_per_task: 3,
            retry_backoff_base: Duration::from_secs(5),
            retry_backoff_max: Duration::from_secs(60),
            ..Default::default()
        }
    }

    fn task_with_attempts(attempts: u32) -> Task {
        let mut task = Task::new(TaskCategory::Feature, "t");
        task.attempts = attempts;
        task
    }

    #[test]
    fn test_retryable_error_with_attempts_left_requeues() {
        let target = requeue_target(&config(), &task_with_attempts(0), &HarnessError::transient("llm timeout"));
        assert_eq!(target, TaskStatus::Pending);
    }

    #[test]
    fn test_attempt_exhaustion_blocks() {
        let target = requeue_target(&config(), &task_with_attempts(2), &HarnessError::transient("llm timeout"));
        assert_eq!(target, TaskStatus::Blocked);
    }

    #[test]
    fn test_permanent_error_blocks_regardless_of_attempts() {
        let target = requeue_target(&config(), &task_with_attempts(0), &HarnessError::ambiguity("two readings"));
        assert_eq!(target, TaskStatus::Blocked);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let c = config();
        assert_eq!(backoff_delay(&c, 1), Duration::from_secs(5));
        assert_eq!(backoff_delay(&c, 2), Duration::from_secs(10));
        assert_eq!(backoff_delay(&c, 3), Duration::from_secs(20));
        assert_eq!(backoff_delay(&c, 10), Duration::from_secs(60)); // capped
    }
}
