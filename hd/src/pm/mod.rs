//! PM coordinator - conflict resolution and human escalation
//!
//! Subscribes to conflict, regression, digression, budget, and decision
//! events. Applies automatic policy where one exists (the lower-priority
//! side of a conflict is paused and rolled back); everything else becomes a
//! structured decision request with options, a default, and a timeout. The
//! default is applied when no human answers in time - the system never
//! guesses silently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::domain::{EventRecord, Filter, RelationKind, TaskCategory, now_ms};
use crate::events::{BusEvent, EventBus};
use crate::state::StateResult;

/// PM tunables
#[derive(Debug, Clone)]
pub struct PmConfig {
    /// Default timeout on decision requests
    pub decision_timeout: Duration,
    /// Priority added to dependents when their dependency completes
    pub promote_boost: i64,
    /// Poll cadence for the subscription
    pub poll_interval: Duration,
}

impl Default for PmConfig {
    fn default() -> Self {
        Self {
            decision_timeout: Duration::from_secs(60),
            promote_boost: 5,
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// A decision waiting on a human (or its timeout)
#[derive(Debug, Clone)]
pub struct PendingDecision {
    pub decision_id: String,
    pub question: String,
    pub options: Vec<String>,
    pub default_choice: String,
    pub requested_at: i64,
    pub timeout_ms: i64,
}

#[derive(Clone)]
pub struct PmCoordinator {
    bus: Arc<EventBus>,
    config: PmConfig,
    pending: Arc<Mutex<HashMap<String, PendingDecision>>>,
}

impl PmCoordinator {
    pub fn new(bus: Arc<EventBus>, config: PmConfig) -> Self {
        Self {
            bus,
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The subscription this coordinator drains
    pub async fn subscribe(&self) -> StateResult<()> {
        self.bus
            .subscribe(
                "pm",
                vec![
                    "file_conflict".to_string(),
                    "regression_detected".to_string(),
                    "digression_detected".to_string(),
                    "budget_exhausted".to_string(),
                    "decision_needed".to_string(),
                    "verification_succeeded".to_string(),
                ],
                None,
            )
            .await?;
        Ok(())
    }

    /// Drain and handle everything currently queued
    pub async fn drain(&self) -> StateResult<usize> {
        let records = self.bus.poll("pm", 32).await?;
        let handled = records.len();
        for record in records {
            if let Err(e) = self.handle(&record).await {
                warn!(event = %record.event_type, error = %e, "PM handler failed");
            }
            self.bus.ack("pm", &record.id).await?;
        }
        Ok(handled)
    }

    /// Run until shutdown
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        if let Err(e) = self.subscribe().await {
            warn!(error = %e, "PM subscription failed");
        }
        info!("PM coordinator started");
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.drain().await {
                        warn!(error = %e, "PM drain failed");
                    }
                    if let Err(e) = self.expire_decisions().await {
                        warn!(error = %e, "Decision expiry failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("PM coordinator stopped");
    }

    async fn handle(&self, record: &EventRecord) -> StateResult<()> {
        let Some(event) = BusEvent::from_payload(&record.payload) else {
            debug!(event = %record.event_type, "Unparseable payload, skipping");
            return Ok(());
        };

        match event {
            BusEvent::FileConflict { path, holder, contender } => {
                self.resolve_file_conflict(&path, &holder, &contender).await
            }
            BusEvent::RegressionDetected { task_id, blamed_run, .. } => {
                self.handle_regression(&task_id, &blamed_run).await
            }
            BusEvent::DigressionDetected { run_id, task_id, detail } => {
                self.request_decision(
                    format!("Run {run_id} digressed on task {task_id}: {detail}. Pause it?"),
                    vec!["pause".to_string(), "continue".to_string()],
                    "pause",
                )
                .await
                .map(|_| ())
            }
            BusEvent::BudgetExhausted { scope, detail } => {
                warn!(scope, detail, "Budget exhausted; pausing live runs");
                for run in self
                    .bus
                    .state()
                    .list_runs(vec![Filter::eq("status", "running")])
                    .await?
                {
                    self.bus
                        .publish("pm", BusEvent::PauseRequested { target: run.id })
                        .await?;
                }
                Ok(())
            }
            BusEvent::DecisionNeeded {
                decision_id,
                question,
                options,
                default_choice,
                timeout_ms,
            } => {
                // Track somebody else's escalation so the timeout default
                // still applies
                self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(
                    decision_id.clone(),
                    PendingDecision {
                        decision_id,
                        question,
                        options,
                        default_choice,
                        requested_at: now_ms(),
                        timeout_ms,
                    },
                );
                Ok(())
            }
            BusEvent::VerificationSucceeded { task_id, .. } => self.promote_dependents(&task_id).await,
            _ => Ok(()),
        }
    }

    /// Conflict policy: the lower-priority participant is paused; a tie
    /// escalates to a human.
    async fn resolve_file_conflict(&self, path: &str, holder: &str, contender: &str) -> StateResult<()> {
        let state = self.bus.state();

        let priority_of = |run_id: String| async move {
            let state = state.clone();
            let Some(run) = state.get_run(&run_id).await? else {
                return Ok::<Option<i64>, crate::state::StateError>(None);
            };
            Ok(state.get_task(&run.task_id).await?.map(|t| t.priority_score))
        };

        let holder_priority = priority_of(holder.to_string()).await?;
        let contender_priority = priority_of(contender.to_string()).await?;

        match (holder_priority, contender_priority) {
            (Some(h), Some(c)) if h != c => {
                let loser = if h < c { holder } else { contender };
                info!(path, loser, "Auto-resolving file conflict by priority");
                self.bus
                    .publish("pm", BusEvent::PauseRequested { target: loser.to_string() })
                    .await?;
                Ok(())
            }
            _ => {
                self.request_decision(
                    format!("Conflict on {path}: {holder} holds, {contender} waits, equal stakes. Who yields?"),
                    vec![holder.to_string(), contender.to_string()],
                    contender,
                )
                .await
                .map(|_| ())
            }
        }
    }

    /// Regression policy: an invalidated dependency invalidates its
    /// completed dependents too, then a human decides between rolling back
    /// the blamed run and repairing forward. The default repairs forward,
    /// the non-destructive path.
    async fn handle_regression(&self, task_id: &str, blamed_run: &str) -> StateResult<()> {
        let state = self.bus.state();
        let relationships = state.list_relationships(Some(task_id.to_string())).await?;
        for rel in relationships {
            if rel.kind == RelationKind::DependsOn
                && rel.to_task == task_id
                && let Some(dependent) = state.get_task(&rel.from_task).await?
                && dependent.status == crate::domain::TaskStatus::Completed
            {
                info!(dependent = %dependent.id, "Marking dependent stale after regression");
                state
                    .transition_task(&dependent.id, crate::domain::TaskStatus::Stale, None)
                    .await?;
            }
        }

        self.request_decision(
            format!("Task {task_id} regressed (blamed run {blamed_run}). Roll back or repair forward?"),
            vec!["rollback".to_string(), "repair".to_string()],
            "repair",
        )
        .await
        .map(|_| ())
    }

    /// When a dependency completes, its dependents get a priority bump so
    /// the unblocked work is scheduled sooner.
    async fn promote_dependents(&self, task_id: &str) -> StateResult<()> {
        let state = self.bus.state();
        let relationships = state.list_relationships(Some(task_id.to_string())).await?;
        for rel in relationships {
            if rel.kind == RelationKind::DependsOn && rel.to_task == task_id {
                if let Some(mut dependent) = state.get_task(&rel.from_task).await? {
                    dependent.priority_score += self.config.promote_boost;
                    dependent.updated_at = now_ms();
                    state.update_task(dependent).await?;
                    debug!(dependent = %rel.from_task, "Promoted after dependency completion");
                }
            }
        }
        Ok(())
    }

    /// Publish a decision request and start its timeout clock
    pub async fn request_decision(
        &self,
        question: String,
        options: Vec<String>,
        default_choice: &str,
    ) -> StateResult<String> {
        let decision_id = crate::domain::generate_id("dec", &question);
        let timeout_ms = self.config.decision_timeout.as_millis() as i64;

        self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(
            decision_id.clone(),
            PendingDecision {
                decision_id: decision_id.clone(),
                question: question.clone(),
                options: options.clone(),
                default_choice: default_choice.to_string(),
                requested_at: now_ms(),
                timeout_ms,
            },
        );

        self.bus
            .publish(
                "pm",
                BusEvent::DecisionNeeded {
                    decision_id: decision_id.clone(),
                    question,
                    options,
                    default_choice: default_choice.to_string(),
                    timeout_ms,
                },
            )
            .await?;
        Ok(decision_id)
    }

    /// Record a human answer. Returns false when the decision is unknown
    /// or already resolved.
    pub async fn resolve_decision(&self, decision_id: &str, choice: &str, by: &str) -> StateResult<bool> {
        let removed = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(decision_id);
        if removed.is_none() {
            return Ok(false);
        }

        self.bus
            .publish(
                "pm",
                BusEvent::DecisionResolved {
                    decision_id: decision_id.to_string(),
                    choice: choice.to_string(),
                    by: by.to_string(),
                },
            )
            .await?;
        info!(decision_id, choice, by, "Decision resolved");
        Ok(true)
    }

    /// Apply defaults to decisions whose timeout expired
    pub async fn expire_decisions(&self) -> StateResult<usize> {
        let now = now_ms();
        let expired: Vec<PendingDecision> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<String> = pending
                .values()
                .filter(|d| now - d.requested_at >= d.timeout_ms)
                .map(|d| d.decision_id.clone())
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };

        let count = expired.len();
        for decision in expired {
            info!(decision_id = %decision.decision_id, default = %decision.default_choice, "Decision timed out, applying default");
            self.bus
                .publish(
                    "pm",
                    BusEvent::DecisionResolved {
                        decision_id: decision.decision_id,
                        choice: decision.default_choice,
                        by: "default".to_string(),
                    },
                )
                .await?;
        }
        Ok(count)
    }

    /// Decisions still waiting on an answer
    pub fn pending_decisions(&self) -> Vec<PendingDecision> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Open a draft repair task for a regression (the "repair" policy arm)
    pub async fn open_repair_task(&self, regressed_task_id: &str) -> StateResult<String> {
        let state = self.bus.state();
        let regressed = state.get_task_required(regressed_task_id).await?;

        let repair = crate::domain::Task::new(
            TaskCategory::Bug,
            format!("Repair regression in '{}'", regressed.title),
        )
        .with_description(format!(
            "Task {} went stale: its recorded checks fail against current trunk. Restore them.",
            regressed.id
        ))
        .with_criteria(regressed.acceptance_criteria.clone())
        .with_affected_files(regressed.affected_files.clone())
        .with_codebase_tests(regressed.codebase_tests.clone())
        .with_priority(regressed.priority_score + self.config.promote_boost);

        let repair_id = state.create_task(repair).await?;
        state
            .add_relationship(
                crate::domain::Relationship::new(&repair_id, regressed_task_id, RelationKind::Supersedes)
                    .map_err(|e| crate::state::StateError::BadRelationship(e.to_string()))?,
            )
            .await?;
        Ok(repair_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgentRole, ExecutionRun, Relationship, Task, TaskCategory};
    use crate::state::StateManager;
    use tempfile::TempDir;

    async fn pm(config: PmConfig) -> (TempDir, Arc<EventBus>, PmCoordinator) {
        let temp = TempDir::new().unwrap();
        let state = StateManager::spawn(temp.path().join("store")).unwrap();
        let bus = Arc::new(EventBus::new(state));
        let pm = PmCoordinator::new(bus.clone(), config);
        pm.subscribe().await.unwrap();
        (temp, bus, pm)
    }

    fn quick_config() -> PmConfig {
        PmConfig {
            decision_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_decision_timeout_applies_default() {
        let (_temp, bus, pm) = pm(quick_config()).await;
        bus.subscribe("human", vec!["decision_resolved".to_string()], None)
            .await
            .unwrap();

        let id = pm
            .request_decision("proceed?".to_string(), vec!["a".to_string(), "b".to_string()], "a")
            .await
            .unwrap();
        assert_eq!(pm.pending_decisions().len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let expired = pm.expire_decisions().await.unwrap();
        assert_eq!(expired, 1);
        assert!(pm.pending_decisions().is_empty());

        let events = bus.poll("human", 10).await.unwrap();
        assert_eq!(events.len(), 1);
        match BusEvent::from_payload(&events[0].payload).unwrap() {
            BusEvent::DecisionResolved { decision_id, choice, by } => {
                assert_eq!(decision_id, id);
                assert_eq!(choice, "a");
                assert_eq!(by, "default");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_human_answer_beats_timeout() {
        let (_temp, bus, pm) = pm(quick_config()).await;
        let id = pm
            .request_decision("q".to_string(), vec!["a".to_string(), "b".to_string()], "a")
            .await
            .unwrap();

        assert!(pm.resolve_decision(&id, "b", "operator").await.unwrap());
        // Second resolution is a no-op
        assert!(!pm.resolve_decision(&id, "a", "operator").await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pm.expire_decisions().await.unwrap(), 0);
        let _ = bus;
    }

    #[tokio::test]
    async fn test_conflict_pauses_lower_priority() {
        let (_temp, bus, pm) = pm(quick_config()).await;
        let state = bus.state();

        let make = |title: &str, priority: i64| {
            Task::new(TaskCategory::Feature, title)
                .with_description("d")
                .with_criteria(vec!["x".to_string()])
                .with_codebase_tests(vec!["true".to_string()])
                .with_priority(priority)
        };

        let important = state.create_task(make("important", 90)).await.unwrap();
        let minor = state.create_task(make("minor", 10)).await.unwrap();

        let mut holder = ExecutionRun::new(&important, AgentRole::Builder, 1);
        holder.set_status(crate::domain::RunStatus::Running);
        let holder_id = state.create_run(holder).await.unwrap();

        let mut contender = ExecutionRun::new(&minor, AgentRole::Builder, 1);
        contender.set_status(crate::domain::RunStatus::Running);
        let contender_id = state.create_run(contender).await.unwrap();

        bus.subscribe("watch", vec!["pause_requested".to_string()], None)
            .await
            .unwrap();

        bus.publish(
            "locks",
            BusEvent::FileConflict {
                path: "srv/api.md".to_string(),
                holder: holder_id.clone(),
                contender: contender_id.clone(),
            },
        )
        .await
        .unwrap();

        pm.drain().await.unwrap();

        let events = bus.poll("watch", 10).await.unwrap();
        assert_eq!(events.len(), 1);
        match BusEvent::from_payload(&events[0].payload).unwrap() {
            BusEvent::PauseRequested { target } => assert_eq!(target, contender_id),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dependency_completion_promotes_dependents() {
        let (_temp, bus, pm) = pm(quick_config()).await;
        let state = bus.state();

        let make = |title: &str| {
            Task::new(TaskCategory::Feature, title)
                .with_description("d")
                .with_criteria(vec!["x".to_string()])
                .with_codebase_tests(vec!["true".to_string()])
        };
        let dep = state.create_task(make("dep")).await.unwrap();
        let dependent = state.create_task(make("dependent").with_priority(10)).await.unwrap();
        state
            .add_relationship(Relationship::new(&dependent, &dep, RelationKind::DependsOn).unwrap())
            .await
            .unwrap();

        bus.publish(
            "gate",
            BusEvent::VerificationSucceeded {
                run_id: "run-x".to_string(),
                task_id: dep.clone(),
            },
        )
        .await
        .unwrap();
        pm.drain().await.unwrap();

        let promoted = state.get_task_required(&dependent).await.unwrap();
        assert_eq!(promoted.priority_score, 10 + pm.config.promote_boost);
    }

    #[tokio::test]
    async fn test_open_repair_task() {
        let (_temp, bus, pm) = pm(quick_config()).await;
        let state = bus.state();

        let regressed = Task::new(TaskCategory::Feature, "search endpoint")
            .with_description("d")
            .with_criteria(vec!["ranked hits".to_string()])
            .with_codebase_tests(vec!["cargo test search".to_string()])
            .with_affected_files(vec!["src/search.rs".to_string()]);
        let regressed_id = state.create_task(regressed).await.unwrap();

        let repair_id = pm.open_repair_task(&regressed_id).await.unwrap();
        let repair = state.get_task_required(&repair_id).await.unwrap();
        assert_eq!(repair.category, TaskCategory::Bug);
        assert!(repair.title.contains("search endpoint"));
        assert_eq!(repair.affected_files, vec!["src/search.rs".to_string()]);
    }
}
