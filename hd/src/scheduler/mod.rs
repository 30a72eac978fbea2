//! Wave scheduler
//!
//! Emits closed waves: the next batch of runnable tasks for a list, honoring
//! dependencies, conflicts, file ownership, risk gating, and the concurrency
//! cap. A new wave is only emitted once the previous wave has gone
//! all-terminal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info};

use crate::domain::{
    EventPriority, Filter, ListStatus, RelationKind, Relationship, RiskLevel, Task, TaskStatus, Wave,
    WaveStatus,
};
use crate::events::{BusEvent, EventBus};
use crate::state::{EventDraft, StateResult};

/// Scheduler tunables
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum runs per wave
    pub concurrency_cap: usize,
    /// Waves a runnable task may be skipped before boosting
    pub starvation_threshold: u32,
    /// Priority added per skipped wave beyond the threshold
    pub starvation_boost: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency_cap: 4,
            starvation_threshold: 3,
            starvation_boost: 10,
        }
    }
}

/// Why the scheduler declined to emit a wave
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaveDecision {
    /// A wave was emitted
    Emitted(String),
    /// The previous wave has not closed yet
    PreviousWaveOpen,
    /// Nothing is runnable right now
    NothingRunnable,
    /// The list is not executing
    ListNotActive,
}

#[derive(Clone)]
pub struct WaveScheduler {
    bus: Arc<EventBus>,
    config: SchedulerConfig,
}

impl WaveScheduler {
    pub fn new(bus: Arc<EventBus>, config: SchedulerConfig) -> Self {
        Self { bus, config }
    }

    /// Try to emit the next wave for a list.
    pub async fn next_wave(&self, list_id: &str) -> StateResult<WaveDecision> {
        let state = self.bus.state();

        let Some(list) = state.get_list(list_id).await? else {
            return Ok(WaveDecision::ListNotActive);
        };
        if list.status != ListStatus::InProgress {
            debug!(list_id, status = %list.status, "List not executing");
            return Ok(WaveDecision::ListNotActive);
        }

        // Waves are closed: never overlap with an open wave
        let waves = state
            .list_waves(vec![Filter::eq("list", list_id)])
            .await?;
        if waves.iter().any(|w| w.status == WaveStatus::Open) {
            return Ok(WaveDecision::PreviousWaveOpen);
        }

        let members = state.list_members(list_id).await?;
        let mut tasks: Vec<Task> = Vec::new();
        for member in &members {
            if let Some(task) = state.get_task(&member.task_id).await? {
                tasks.push(task);
            }
        }

        let relationships = state.list_relationships(None).await?;

        // Files already owned by live work anywhere in the system
        let mut owned_files: HashSet<String> = HashSet::new();
        let all_tasks = state.list_tasks(vec![]).await?;
        for task in &all_tasks {
            if task.status.is_active() {
                owned_files.extend(task.affected_files.iter().cloned());
            }
        }
        let statuses: HashMap<&str, TaskStatus> = all_tasks.iter().map(|t| (t.id.as_str(), t.status)).collect();

        let mut runnable: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| deps_satisfied(t, &relationships, &statuses))
            .filter(|t| !conflicts_active(t, &relationships, &statuses))
            .filter(|t| risk_admitted(t, list.user_approval_required, list.auto_execute_low_risk))
            .collect();

        if runnable.is_empty() {
            return Ok(WaveDecision::NothingRunnable);
        }

        // Composite ranking with a random final tiebreak
        let mut rng = rand::rng();
        let mut nonce: HashMap<&str, u64> = HashMap::new();
        for task in &runnable {
            nonce.insert(task.id.as_str(), rng.random());
        }
        let boost = self.config.starvation_boost;
        let threshold = self.config.starvation_threshold;
        runnable.sort_by_key(|t| {
            (
                -t.effective_priority(threshold, boost),
                -(t.blocks_count as i64),
                !t.is_quick_win,
                t.created_at,
                nonce[t.id.as_str()],
            )
        });

        // Greedy admission under the cap and ownership compatibility
        let mut admitted: Vec<&Task> = Vec::new();
        let mut wave_files = owned_files;
        for candidate in &runnable {
            if admitted.len() >= self.config.concurrency_cap {
                break;
            }
            let file_clash = candidate.affected_files.iter().any(|f| wave_files.contains(f));
            let conflict_clash = admitted.iter().any(|a| {
                relationships.iter().any(|r| {
                    r.kind == RelationKind::ConflictsWith
                        && ((r.from_task == candidate.id && r.to_task == a.id)
                            || (r.from_task == a.id && r.to_task == candidate.id))
                })
            });
            if file_clash || conflict_clash {
                continue;
            }
            wave_files.extend(candidate.affected_files.iter().cloned());
            admitted.push(candidate);
        }

        if admitted.is_empty() {
            return Ok(WaveDecision::NothingRunnable);
        }

        // Starvation accounting: runnable-but-skipped tasks age
        let admitted_ids: HashSet<&str> = admitted.iter().map(|t| t.id.as_str()).collect();
        for task in &runnable {
            let mut updated = (*task).clone();
            if admitted_ids.contains(task.id.as_str()) {
                updated.waves_skipped = 0;
            } else {
                updated.waves_skipped += 1;
            }
            state.update_task(updated).await?;
        }

        let sequence_no = waves.len() as u32 + 1;
        let task_ids: Vec<String> = admitted.iter().map(|t| t.id.clone()).collect();
        let wave = Wave::new(list_id, sequence_no, task_ids.clone());
        let wave_id = wave.id.clone();

        let event = BusEvent::WaveCreated {
            wave_id: wave_id.clone(),
            list_id: list_id.to_string(),
            sequence_no,
            task_ids: task_ids.clone(),
        };
        state
            .create_wave(
                wave,
                EventDraft {
                    source: "scheduler".to_string(),
                    event_type: event.event_type().to_string(),
                    payload: event.to_payload(),
                    priority: EventPriority::Normal,
                    correlation_id: Some(wave_id.clone()),
                },
            )
            .await?;

        info!(list_id, %wave_id, sequence_no, count = task_ids.len(), "Wave emitted");
        Ok(WaveDecision::Emitted(wave_id))
    }

    /// Close the open wave of a list once every member task has left the
    /// active statuses. Returns true if a wave was closed.
    pub async fn close_wave_if_done(&self, list_id: &str, truncated: bool) -> StateResult<bool> {
        let state = self.bus.state();
        let waves = state.list_waves(vec![Filter::eq("list", list_id)]).await?;
        let Some(mut wave) = waves.into_iter().find(|w| w.status == WaveStatus::Open) else {
            return Ok(false);
        };

        if !truncated {
            for task_id in &wave.task_ids {
                if let Some(task) = state.get_task(task_id).await?
                    && task.status.is_active()
                {
                    return Ok(false);
                }
            }
        }

        wave.close(truncated);
        let wave_id = wave.id.clone();
        state.update_wave(wave).await?;
        self.bus
            .publish(
                "scheduler",
                BusEvent::WaveClosed {
                    wave_id,
                    list_id: list_id.to_string(),
                    truncated,
                },
            )
            .await?;
        Ok(true)
    }
}

/// Every depends_on target must be completed
fn deps_satisfied(task: &Task, relationships: &[Relationship], statuses: &HashMap<&str, TaskStatus>) -> bool {
    relationships
        .iter()
        .filter(|r| r.kind == RelationKind::DependsOn && r.from_task == task.id)
        .all(|r| statuses.get(r.to_task.as_str()) == Some(&TaskStatus::Completed))
}

/// No conflicts_with target may be active
fn conflicts_active(task: &Task, relationships: &[Relationship], statuses: &HashMap<&str, TaskStatus>) -> bool {
    relationships
        .iter()
        .filter(|r| r.kind == RelationKind::ConflictsWith)
        .filter_map(|r| {
            if r.from_task == task.id {
                Some(r.to_task.as_str())
            } else if r.to_task == task.id {
                Some(r.from_task.as_str())
            } else {
                None
            }
        })
        .any(|other| statuses.get(other).is_some_and(|s| s.is_active()))
}

/// Risk gate: low-risk tasks may auto-execute; everything else needs the
/// list to be pre-approved.
fn risk_admitted(task: &Task, user_approval_required: bool, auto_execute_low_risk: bool) -> bool {
    if !user_approval_required {
        return true;
    }
    task.risk_level == RiskLevel::Low && auto_execute_low_risk
}
