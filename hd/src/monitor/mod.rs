//! Monitor - anomaly detection over live runs and the task graph
//!
//! The monitor only observes: heartbeat health, list progress, digression,
//! scheduled regression probes, and budget consumption. It publishes alerts
//! for the PM or the human; it never mutates task state directly, with one
//! deliberate exception: a failed regression probe marks the invalidated
//! task stale so it cannot keep counting as done.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::domain::{Filter, TaskStatus};
use crate::error::ErrorKind;
use crate::events::{BusEvent, EventBus};
use crate::state::StateResult;

/// Monitor tunables
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub regression_probe_interval: Duration,
    /// Total token budget across all runs; zero disables budget checks
    pub budget_total_tokens: u64,
    pub budget_warning_pct: u8,
    pub budget_hard_pct: u8,
    /// Identical transcript signatures in a row before digression fires
    pub digression_repeat_threshold: usize,
    /// Changed files beyond `multiplier * declared` is digression
    pub digression_file_multiplier: usize,
    /// Where regression probe commands run (the trunk checkout)
    pub probe_workdir: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            regression_probe_interval: Duration::from_secs(1_800),
            budget_total_tokens: 0,
            budget_warning_pct: 80,
            budget_hard_pct: 95,
            digression_repeat_threshold: 3,
            digression_file_multiplier: 3,
            probe_workdir: PathBuf::from("."),
        }
    }
}

#[derive(Clone)]
pub struct Monitor {
    bus: Arc<EventBus>,
    config: MonitorConfig,
}

impl Monitor {
    pub fn new(bus: Arc<EventBus>, config: MonitorConfig) -> Self {
        Self { bus, config }
    }

    /// Run the periodic loop until shutdown
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!("Monitor started");
        let mut poll = tokio::time::interval(self.config.poll_interval);
        let mut probe = tokio::time::interval(self.config.regression_probe_interval);
        let mut progress_snapshot: HashMap<String, u32> = HashMap::new();

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.poll_once(&mut progress_snapshot).await {
                        warn!(error = %e, "Monitor poll failed");
                    }
                }
                _ = probe.tick() => {
                    if let Err(e) = self.run_regression_probe().await {
                        warn!(error = %e, "Regression probe failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Monitor stopped");
    }

    /// One observation pass: progress, digression, budget
    pub async fn poll_once(&self, progress_snapshot: &mut HashMap<String, u32>) -> StateResult<()> {
        self.check_progress(progress_snapshot).await?;
        self.check_digression().await?;
        self.check_budget().await?;
        Ok(())
    }

    /// Flag executing lists whose completed counter did not move since the
    /// previous pass.
    async fn check_progress(&self, snapshot: &mut HashMap<String, u32>) -> StateResult<()> {
        let lists = self
            .bus
            .state()
            .list_lists(vec![Filter::eq("status", "in_progress")])
            .await?;
        for list in lists {
            if let Some(&previous) = snapshot.get(&list.id)
                && previous == list.completed
            {
                debug!(list_id = %list.id, "List made no progress this interval");
                self.bus
                    .publish(
                        "monitor",
                        BusEvent::ErrorRaised {
                            source: list.id.clone(),
                            kind: ErrorKind::Coordination,
                            message: "no completed tasks this interval".to_string(),
                        },
                    )
                    .await?;
            }
            snapshot.insert(list.id, list.completed);
        }
        Ok(())
    }

    /// Repeated transcript signatures indicate an agent looping on the
    /// same failed approach.
    pub async fn check_digression(&self) -> StateResult<()> {
        let state = self.bus.state();
        for run in state.list_runs(vec![Filter::eq("status", "running")]).await? {
            let transcript = state.list_transcript(&run.id).await?;
            if transcript.len() < self.config.digression_repeat_threshold {
                continue;
            }

            let signatures: Vec<u64> = transcript
                .iter()
                .rev()
                .take(self.config.digression_repeat_threshold)
                .map(|e| signature(&e.content))
                .collect();

            if signatures.windows(2).all(|w| w[0] == w[1]) {
                warn!(run_id = %run.id, "Repeated transcript signature");
                self.bus
                    .publish(
                        "monitor",
                        BusEvent::DigressionDetected {
                            run_id: run.id.clone(),
                            task_id: run.task_id.clone(),
                            detail: format!(
                                "last {} transcript entries identical",
                                self.config.digression_repeat_threshold
                            ),
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Token budget thresholds across every run
    pub async fn check_budget(&self) -> StateResult<()> {
        if self.config.budget_total_tokens == 0 {
            return Ok(());
        }
        let runs = self.bus.state().list_runs(vec![]).await?;
        let used: u64 = runs.iter().map(|r| r.tokens_used).sum();
        let used_pct = (used * 100 / self.config.budget_total_tokens).min(u8::MAX as u64) as u8;

        if used_pct >= self.config.budget_hard_pct {
            self.bus
                .publish(
                    "monitor",
                    BusEvent::BudgetExhausted {
                        scope: "tokens".to_string(),
                        detail: format!("{used} of {} tokens used", self.config.budget_total_tokens),
                    },
                )
                .await?;
        } else if used_pct >= self.config.budget_warning_pct {
            self.bus
                .publish(
                    "monitor",
                    BusEvent::BudgetWarning {
                        scope: "tokens".to_string(),
                        used_pct,
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Scheduled regression probe: re-run the recorded level-1 commands of
    /// completed tasks against the current trunk. A failing probe marks the
    /// task stale and blames the most recent overlapping verified run.
    pub async fn run_regression_probe(&self) -> StateResult<usize> {
        let state = self.bus.state();
        let completed = state.list_tasks(vec![Filter::eq("status", "completed")]).await?;
        let mut invalidated = 0;

        for task in &completed {
            let mut failing_command = None;
            for command in &task.codebase_tests {
                if !self.probe_passes(command).await {
                    failing_command = Some(command.clone());
                    break;
                }
            }
            let Some(failing_command) = failing_command else {
                continue;
            };

            let blamed_run = self.blame_run(task).await?;
            warn!(task_id = %task.id, failing_command, blamed_run, "Regression detected");

            state.transition_task(&task.id, TaskStatus::Stale, None).await?;
            self.bus
                .publish(
                    "monitor",
                    BusEvent::RegressionDetected {
                        task_id: task.id.clone(),
                        blamed_run,
                        failing_command,
                    },
                )
                .await?;
            invalidated += 1;
        }
        Ok(invalidated)
    }

    /// The most recently verified run of another task whose declared files
    /// overlap this task's. Empty when nothing overlaps.
    async fn blame_run(&self, task: &crate::domain::Task) -> StateResult<String> {
        let state = self.bus.state();
        let runs = state.list_runs(vec![Filter::eq("status", "verified")]).await?;

        let mut best: Option<(i64, String)> = None;
        for run in runs {
            if run.task_id == task.id {
                continue;
            }
            let Some(other) = state.get_task(&run.task_id).await? else {
                continue;
            };
            let overlaps = other
                .affected_files
                .iter()
                .any(|f| task.affected_files.contains(f));
            if overlaps && best.as_ref().is_none_or(|(t, _)| run.updated_at > *t) {
                best = Some((run.updated_at, run.id.clone()));
            }
        }
        Ok(best.map(|(_, id)| id).unwrap_or_default())
    }

    async fn probe_passes(&self, command: &str) -> bool {
        Command::new("sh")
            .args(["-c", command])
            .current_dir(&self.config.probe_workdir)
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

fn signature(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.trim().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgentRole, ContentClass, ExecutionRun, RunStatus, Task, TaskCategory, TranscriptEntry};
    use crate::state::StateManager;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        bus: Arc<EventBus>,
        monitor: Monitor,
    }

    async fn fixture(config: MonitorConfig) -> Fixture {
        let temp = TempDir::new().unwrap();
        let state = StateManager::spawn(temp.path().join("store")).unwrap();
        let bus = Arc::new(EventBus::new(state));
        let monitor = Monitor::new(bus.clone(), config);
        Fixture {
            _temp: temp,
            bus,
            monitor,
        }
    }

    fn completed_task(title: &str, tests: Vec<String>, files: Vec<String>) -> Task {
        let mut task = Task::new(TaskCategory::Feature, title)
            .with_description("d")
            .with_criteria(vec!["done".to_string()])
            .with_codebase_tests(tests)
            .with_affected_files(files);
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Validating,
            TaskStatus::Completed,
        ] {
            task.set_status(status);
        }
        task
    }

    #[tokio::test]
    async fn test_regression_probe_marks_stale_and_blames() {
        let f = fixture(MonitorConfig::default()).await;
        let state = f.bus.state();

        // A completed task whose recorded check now fails
        let broken = completed_task("broken", vec!["false".to_string()], vec!["src/a.rs".to_string()]);
        let broken_id = state.create_task(broken).await.unwrap();

        // An overlapping task whose verified run gets the blame
        let other = completed_task("other", vec!["true".to_string()], vec!["src/a.rs".to_string()]);
        let other_id = state.create_task(other).await.unwrap();
        let mut blamed = ExecutionRun::new(&other_id, AgentRole::Builder, 1);
        blamed.set_status(RunStatus::Verified);
        let blamed_id = state.create_run(blamed).await.unwrap();

        f.bus
            .subscribe("pm", vec!["regression_detected".to_string()], None)
            .await
            .unwrap();

        let invalidated = f.monitor.run_regression_probe().await.unwrap();
        assert_eq!(invalidated, 1);

        let stale = state.get_task_required(&broken_id).await.unwrap();
        assert_eq!(stale.status, TaskStatus::Stale);

        let events = f.bus.poll("pm", 10).await.unwrap();
        assert_eq!(events.len(), 1);
        match BusEvent::from_payload(&events[0].payload).unwrap() {
            BusEvent::RegressionDetected { blamed_run, .. } => assert_eq!(blamed_run, blamed_id),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_passing_probe_leaves_tasks_alone() {
        let f = fixture(MonitorConfig::default()).await;
        let state = f.bus.state();

        let ok = completed_task("fine", vec!["true".to_string()], vec![]);
        let id = state.create_task(ok).await.unwrap();

        let invalidated = f.monitor.run_regression_probe().await.unwrap();
        assert_eq!(invalidated, 0);
        assert_eq!(state.get_task_required(&id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_budget_warning_then_exhausted() {
        let config = MonitorConfig {
            budget_total_tokens: 1_000,
            budget_warning_pct: 80,
            budget_hard_pct: 95,
            ..Default::default()
        };
        let f = fixture(config).await;
        let state = f.bus.state();
        f.bus
            .subscribe("pm", vec!["budget_warning".to_string(), "budget_exhausted".to_string()], None)
            .await
            .unwrap();

        // 85% of the budget consumed: warning, not exhaustion
        let mut run = ExecutionRun::new("task-x", AgentRole::Builder, 1);
        run.tokens_used = 850;
        state.create_run(run).await.unwrap();

        f.monitor.check_budget().await.unwrap();
        let events = f.bus.poll("pm", 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "budget_warning");
        f.bus.ack("pm", &events[0].id).await.unwrap();

        // Push past the hard threshold
        let mut run2 = ExecutionRun::new("task-y", AgentRole::Builder, 1);
        run2.tokens_used = 200;
        state.create_run(run2).await.unwrap();

        f.monitor.check_budget().await.unwrap();
        let events = f.bus.poll("pm", 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "budget_exhausted");
    }

    #[tokio::test]
    async fn test_digression_on_repeated_transcript() {
        let config = MonitorConfig {
            digression_repeat_threshold: 3,
            ..Default::default()
        };
        let f = fixture(config).await;
        let state = f.bus.state();

        let task = Task::new(TaskCategory::Feature, "loops")
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
        let mut run = state.get_run_required(&run_id).await.unwrap();
        run.set_status(RunStatus::Running);
        state.update_run(run).await.unwrap();

        for seq in 1..=3 {
            state
                .append_transcript(TranscriptEntry::new(
                    &run_id,
                    seq,
                    "agent",
                    "let me try the same fix again",
                    ContentClass::Reasoning,
                ))
                .await
                .unwrap();
        }

        f.bus
            .subscribe("pm", vec!["digression_detected".to_string()], None)
            .await
            .unwrap();
        f.monitor.check_digression().await.unwrap();

        let events = f.bus.poll("pm", 10).await.unwrap();
        assert_eq!(events.len(), 1);
    }
}
