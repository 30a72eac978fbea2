//! IPC listener - the daemon side of the unix socket
//!
//! One JSON request per line, one JSON response per line. Connections are
//! handled concurrently; each request is dispatched against the control
//! plane, which owns handles to every component.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::domain::{
    Filter, ItemStatus, ListMember, ListStatus, RunStatus, Task, TaskCategory, TaskStatus, now_ms,
};
use crate::error::ErrorKind;
use crate::events::{BusEvent, EventBus};
use crate::gate::VerificationGate;
use crate::lifecycle::LifecycleManager;
use crate::locks::LockRegistry;
use crate::pm::PmCoordinator;
use crate::state::TimelineQuery;
use crate::worktree::WorktreeManager;

use super::messages::{DecisionView, IpcRequest, IpcResponse, StatusView};

/// Everything the IPC surface can reach
#[derive(Clone)]
pub struct ControlPlane {
    pub bus: Arc<EventBus>,
    pub locks: LockRegistry,
    pub checkpoints: CheckpointManager,
    pub lifecycle: LifecycleManager,
    pub pm: PmCoordinator,
    pub worktrees: WorktreeManager,
    pub gate: VerificationGate,
    pub shutdown_tx: tokio::sync::watch::Sender<bool>,
}

impl ControlPlane {
    /// Dispatch one request. Errors become `IpcResponse::Error`; the
    /// connection stays usable.
    pub async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => IpcResponse::Error { message: e.to_string() },
        }
    }

    async fn dispatch(&self, request: IpcRequest) -> eyre::Result<IpcResponse> {
        let state = self.bus.state();
        match request {
            IpcRequest::Ping => Ok(IpcResponse::Pong {
                version: env!("CARGO_PKG_VERSION").to_string(),
            }),
            IpcRequest::Shutdown => {
                info!("Shutdown requested over IPC");
                let _ = self.shutdown_tx.send(true);
                Ok(IpcResponse::Ok)
            }

            IpcRequest::Status => {
                let tasks = state.list_tasks(vec![]).await?;
                let mut by_status: HashMap<String, usize> = HashMap::new();
                for task in &tasks {
                    *by_status.entry(task.status.to_string()).or_default() += 1;
                }
                let mut tasks_by_status: Vec<(String, usize)> = by_status.into_iter().collect();
                tasks_by_status.sort();

                let lists = state.list_lists(vec![]).await?;
                let runs = state.list_runs(vec![]).await?;
                Ok(IpcResponse::Status(StatusView {
                    lists_total: lists.len(),
                    lists_active: lists.iter().filter(|l| l.status == ListStatus::InProgress).count(),
                    tasks_by_status,
                    live_runs: runs.iter().filter(|r| !r.status.is_terminal()).count(),
                    held_locks: self.locks.table().await?.len(),
                    pending_decisions: self.pm.pending_decisions().len(),
                }))
            }

            IpcRequest::ListStatus { list_id } => {
                let Some(list) = state.get_list(&list_id).await? else {
                    return Ok(IpcResponse::Error {
                        message: format!("list {list_id} not found"),
                    });
                };
                Ok(IpcResponse::Text(format!(
                    "{} [{}] {}/{} completed, {} failed",
                    list.title, list.status, list.completed, list.total, list.failed
                )))
            }

            IpcRequest::TaskStatus { task_id } => {
                let Some(task) = state.get_task(&task_id).await? else {
                    return Ok(IpcResponse::Error {
                        message: format!("task {task_id} not found"),
                    });
                };
                Ok(IpcResponse::Text(render_task_status(&task)))
            }

            IpcRequest::Timeline { since, event_types, limit } => {
                let events = self
                    .bus
                    .timeline(TimelineQuery {
                        since,
                        until: None,
                        sources: vec![],
                        event_types,
                        limit,
                    })
                    .await?;
                Ok(IpcResponse::Events(events))
            }

            IpcRequest::LockTable => Ok(IpcResponse::Locks(self.locks.table().await?)),

            IpcRequest::PendingDecisions => {
                let now = now_ms();
                let decisions = self
                    .pm
                    .pending_decisions()
                    .into_iter()
                    .map(|d| DecisionView {
                        expires_in_ms: (d.requested_at + d.timeout_ms - now).max(0),
                        decision_id: d.decision_id,
                        question: d.question,
                        options: d.options,
                        default_choice: d.default_choice,
                    })
                    .collect();
                Ok(IpcResponse::Decisions(decisions))
            }

            IpcRequest::Transcript { run_id } => {
                Ok(IpcResponse::Transcript(state.list_transcript(&run_id).await?))
            }

            IpcRequest::RunDiff { run_id } => {
                let run = state.get_run_required(&run_id).await?;
                let workdir = self.worktrees.worktree_path(&run_id);
                let paths = match run.start_commit {
                    Some(ref start) if workdir.exists() => {
                        self.worktrees.diff_paths(&workdir, start, "HEAD").await.unwrap_or_default()
                    }
                    _ => Vec::new(),
                };
                Ok(IpcResponse::Paths(paths))
            }

            IpcRequest::Criteria { task_id } => {
                Ok(IpcResponse::CriteriaResults(state.list_criteria(&task_id).await?))
            }

            IpcRequest::CreateTask {
                title,
                description,
                category,
                criteria,
                affected_files,
                codebase_tests,
                priority,
            } => {
                let category = parse_category(&category)?;
                let task = Task::new(category, title)
                    .with_description(description)
                    .with_criteria(criteria)
                    .with_affected_files(affected_files)
                    .with_codebase_tests(codebase_tests)
                    .with_priority(priority);
                let id = state.create_task(task).await?;
                Ok(IpcResponse::Created { id })
            }

            IpcRequest::SubmitTask { task_id } => {
                state.submit_task(&task_id).await?;
                Ok(IpcResponse::Ok)
            }

            IpcRequest::CreateList { title } => {
                let list = crate::domain::TaskList::new(title);
                let id = state.create_list(list).await?;
                Ok(IpcResponse::Created { id })
            }

            IpcRequest::AddToList { list_id, task_id } => {
                let position = state.list_members(&list_id).await?.len() as u32;
                state
                    .add_list_member(ListMember::new(&list_id, &task_id, position))
                    .await?;
                Ok(IpcResponse::Ok)
            }

            IpcRequest::RunList { list_id } => {
                let mut list = state
                    .get_list(&list_id)
                    .await?
                    .ok_or_else(|| eyre::eyre!("list {list_id} not found"))?;
                list.set_status(ListStatus::InProgress);
                state.update_list(list).await?;
                Ok(IpcResponse::Ok)
            }

            IpcRequest::PauseList { list_id } => {
                let mut list = state
                    .get_list(&list_id)
                    .await?
                    .ok_or_else(|| eyre::eyre!("list {list_id} not found"))?;
                list.set_status(ListStatus::Paused);
                state.update_list(list).await?;

                for run in self.live_runs_of_list(&list_id).await? {
                    self.bus
                        .publish("human", BusEvent::PauseRequested { target: run })
                        .await?;
                }
                Ok(IpcResponse::Ok)
            }

            IpcRequest::ResumeList { list_id } => {
                let mut list = state
                    .get_list(&list_id)
                    .await?
                    .ok_or_else(|| eyre::eyre!("list {list_id} not found"))?;
                list.set_status(ListStatus::InProgress);
                state.update_list(list).await?;

                let members = state.list_members(&list_id).await?;
                for member in members {
                    for run in state.list_runs(vec![Filter::eq("task", member.task_id.clone())]).await? {
                        if run.status == RunStatus::Paused {
                            self.bus
                                .publish("human", BusEvent::ResumeRequested { target: run.id })
                                .await?;
                        }
                    }
                }
                Ok(IpcResponse::Ok)
            }

            IpcRequest::PauseTask { task_id } => {
                for run in state.list_runs(vec![Filter::eq("task", task_id.clone())]).await? {
                    if run.status == RunStatus::Running {
                        self.lifecycle.pause(&run.id).await?;
                    }
                }
                Ok(IpcResponse::Ok)
            }

            IpcRequest::SkipTask { task_id } => {
                state.transition_task(&task_id, TaskStatus::Cancelled, None).await?;
                // Mark memberships skipped so list progress accounts for it
                for list in state.list_lists(vec![]).await? {
                    for mut member in state.list_members(&list.id).await? {
                        if member.task_id == task_id {
                            member.set_item_status(ItemStatus::Skipped);
                            state.update_list_member(member).await?;
                        }
                    }
                }
                Ok(IpcResponse::Ok)
            }

            IpcRequest::ResetTask { task_id } => {
                state.transition_task(&task_id, TaskStatus::Pending, None).await?;
                Ok(IpcResponse::Ok)
            }

            IpcRequest::CancelTask { task_id } => {
                state.transition_task(&task_id, TaskStatus::Cancelled, None).await?;
                Ok(IpcResponse::Ok)
            }

            IpcRequest::ForceUnlock { path } => {
                match self.locks.check(&path).await? {
                    Some(lock) => {
                        self.locks.unlock(&path, &lock.held_by).await?;
                        Ok(IpcResponse::Ok)
                    }
                    None => Ok(IpcResponse::Error {
                        message: format!("no lock on {path}"),
                    }),
                }
            }

            IpcRequest::RollbackRun { run_id } => {
                let run = state.get_run_required(&run_id).await?;
                if let Some(ref checkpoint_id) = run.checkpoint_id {
                    self.checkpoints.rollback(checkpoint_id).await?;
                }
                self.locks.release_holder(&run_id).await?;
                let crashed = BusEvent::RunCrashed {
                    run_id: run_id.clone(),
                    task_id: run.task_id.clone(),
                    reason: "manual rollback".to_string(),
                };
                state
                    .finish_run(
                        &run_id,
                        RunStatus::Crashed,
                        Some(TaskStatus::Pending),
                        crate::state::EventDraft::new("human", crashed.event_type(), crashed.to_payload()),
                    )
                    .await?;
                Ok(IpcResponse::Ok)
            }

            IpcRequest::Decide { decision_id, choice } => {
                if self.pm.resolve_decision(&decision_id, &choice, "human").await? {
                    Ok(IpcResponse::Ok)
                } else {
                    Ok(IpcResponse::Error {
                        message: format!("decision {decision_id} unknown or already resolved"),
                    })
                }
            }

            IpcRequest::WorkerHeartbeat { run_id } => {
                self.lifecycle.heartbeat(&run_id).await?;
                Ok(IpcResponse::Ok)
            }

            IpcRequest::WorkerClaim { run_id } => {
                // Verification can take minutes; never block the socket
                let gate = self.gate.clone();
                tokio::spawn(async move {
                    if let Err(e) = gate.process_claim(&run_id).await {
                        warn!(run_id, error = %e, "Claim processing failed");
                    }
                });
                Ok(IpcResponse::Ok)
            }
        }
    }

    async fn live_runs_of_list(&self, list_id: &str) -> eyre::Result<Vec<String>> {
        let state = self.bus.state();
        let members = state.list_members(list_id).await?;
        let mut runs = Vec::new();
        for member in members {
            for run in state.list_runs(vec![Filter::eq("task", member.task_id.clone())]).await? {
                if run.status == RunStatus::Running {
                    runs.push(run.id);
                }
            }
        }
        Ok(runs)
    }
}

/// Render a task's status line with operator guidance for stuck states
fn render_task_status(task: &Task) -> String {
    let mut out = format!(
        "{} [{}] priority {} attempts {} risk {:?}",
        task.title, task.status, task.priority_score, task.attempts, task.risk_level
    );
    let kind = match task.status {
        TaskStatus::Failed => Some(ErrorKind::Verification),
        TaskStatus::Blocked => Some(ErrorKind::Coordination),
        TaskStatus::Stale => Some(ErrorKind::Verification),
        _ => None,
    };
    if let Some(kind) = kind {
        out.push_str(&format!("\n  {kind}: {}", kind.suggested_action()));
    }
    out
}

fn parse_category(name: &str) -> eyre::Result<TaskCategory> {
    match name {
        "feature" => Ok(TaskCategory::Feature),
        "bug" => Ok(TaskCategory::Bug),
        "infrastructure" => Ok(TaskCategory::Infrastructure),
        "refactor" => Ok(TaskCategory::Refactor),
        "test" => Ok(TaskCategory::Test),
        "doc" => Ok(TaskCategory::Doc),
        other => Err(eyre::eyre!("unknown category: {other}")),
    }
}

/// Accept connections until shutdown
pub async fn serve(
    socket_path: PathBuf,
    plane: ControlPlane,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> eyre::Result<()> {
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let _ = tokio::fs::remove_file(&socket_path).await;

    let listener = UnixListener::bind(&socket_path)?;
    info!(path = %socket_path.display(), "IPC listener bound");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let plane = plane.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, plane).await {
                                debug!(error = %e, "Connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    let _ = tokio::fs::remove_file(&socket_path).await;
    info!("IPC listener stopped");
    Ok(())
}

async fn serve_connection(stream: UnixStream, plane: ControlPlane) -> eyre::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => plane.handle(request).await,
            Err(e) => IpcResponse::Error {
                message: format!("bad request: {e}"),
            },
        };
        let mut payload = serde_json::to_string(&response)?;
        payload.push('\n');
        writer.write_all(payload.as_bytes()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_category() {
        assert_eq!(parse_category("bug").unwrap(), TaskCategory::Bug);
        assert!(parse_category("misc").is_err());
    }

    #[test]
    fn test_render_task_status_includes_guidance() {
        let mut task = Task::new(TaskCategory::Feature, "t");
        task.status = TaskStatus::Failed;
        let rendered = render_task_status(&task);
        assert!(rendered.contains("verification:"));
        assert!(rendered.contains("failing checks"));

        task.status = TaskStatus::Pending;
        assert!(!render_task_status(&task).contains("\n"));
    }
}
