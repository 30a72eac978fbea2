//! Deadlock detection over the lock wait-graph
//!
//! Failed lock acquisitions record wait edges `waiter -> holder`. A detector
//! task runs cycle detection at a bounded frequency; when a cycle closes, a
//! victim is selected and force-released so the rest of the cycle can make
//! progress.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::events::{BusEvent, EventBus};
use crate::state::StateResult;

/// The in-memory wait graph. Edges are keyed by waiting run; a run can wait
/// on at most one path at a time but a path's holder may be waited on by
/// many runs.
#[derive(Debug, Default)]
pub struct WaitGraph {
    /// waiter -> (holder, contended path)
    edges: HashMap<String, (String, String)>,
}

impl WaitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `waiter` is blocked on `holder` for `path`
    pub fn add_wait(&mut self, waiter: &str, holder: &str, path: &str) {
        debug!(waiter, holder, path, "Wait edge recorded");
        self.edges.insert(waiter.to_string(), (holder.to_string(), path.to_string()));
    }

    /// The waiter acquired its lock or gave up
    pub fn clear_waiter(&mut self, waiter: &str) {
        self.edges.remove(waiter);
    }

    /// Remove every edge involving `run` (it terminated or rolled back)
    pub fn remove_run(&mut self, run: &str) {
        self.edges.remove(run);
        self.edges.retain(|_, (holder, _)| holder != run);
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Find a cycle, returned as the list of run ids along it.
    /// The graph has out-degree <= 1, so following edges from each node
    /// either terminates or loops.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        for start in self.edges.keys() {
            let mut seen: HashSet<&str> = HashSet::new();
            let mut node: &str = start;
            while let Some((holder, _)) = self.edges.get(node) {
                if holder == start {
                    let mut cycle: Vec<String> = vec![start.clone()];
                    let mut cur: &str = start;
                    while let Some((next, _)) = self.edges.get(cur) {
                        if next == start {
                            break;
                        }
                        cycle.push(next.clone());
                        cur = next;
                    }
                    return Some(cycle);
                }
                if !seen.insert(node) {
                    break; // hit a loop that does not include `start`
                }
                node = holder;
            }
        }
        None
    }
}

/// Scoring inputs for victim selection
#[derive(Debug, Clone, Default)]
pub struct VictimScore {
    pub priority: i64,
    /// Work already sunk into the run (tokens, duration)
    pub progress: u64,
    /// How much there is to undo (held locks, commits)
    pub rollback_cost: u64,
}

/// Pick the cheapest run to kill: lowest priority first, then least
/// progress, then cheapest rollback.
pub fn select_victim<'a>(cycle: &'a [String], scores: &HashMap<String, VictimScore>) -> &'a str {
    cycle
        .iter()
        .min_by_key(|run| {
            let s = scores.get(run.as_str()).cloned().unwrap_or_default();
            (s.priority, s.progress, s.rollback_cost)
        })
        .map(|s| s.as_str())
        .unwrap_or(&cycle[0])
}

/// Periodic detector task
pub struct DeadlockDetector {
    graph: Arc<Mutex<WaitGraph>>,
    bus: Arc<EventBus>,
    interval: Duration,
}

impl DeadlockDetector {
    pub fn new(graph: Arc<Mutex<WaitGraph>>, bus: Arc<EventBus>, interval: Duration) -> Self {
        Self { graph, bus, interval }
    }

    /// Run detection until the daemon shuts down
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "Deadlock detector started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.detect_once().await {
                        warn!(error = %e, "Deadlock detection pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Deadlock detector stopped");
    }

    /// One detection pass. Public so tests and the daemon can drive it
    /// directly.
    pub async fn detect_once(&self) -> StateResult<()> {
        let cycle = {
            let graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
            graph.find_cycle()
        };

        let Some(cycle) = cycle else {
            return Ok(());
        };

        let scores = self.collect_scores(&cycle).await?;
        let victim = select_victim(&cycle, &scores).to_string();
        warn!(?cycle, %victim, "Deadlock detected");

        // Drop the victim's edges immediately so the next pass does not
        // re-detect the same cycle while the rollback is in flight.
        {
            let mut graph = self.graph.lock().unwrap_or_else(|e| e.into_inner());
            graph.remove_run(&victim);
        }

        self.bus
            .publish(
                "deadlock",
                BusEvent::ForceRelease {
                    run_id: victim.clone(),
                    reason: "deadlock victim".to_string(),
                },
            )
            .await?;
        self.bus
            .publish(
                "deadlock",
                BusEvent::DeadlockResolved {
                    victim_run: victim,
                    cycle,
                },
            )
            .await?;
        Ok(())
    }

    async fn collect_scores(&self, cycle: &[String]) -> StateResult<HashMap<String, VictimScore>> {
        let state = self.bus.state();
        let locks = state.list_locks().await?;

        let mut scores = HashMap::new();
        for run_id in cycle {
            let mut score = VictimScore::default();
            if let Some(run) = state.get_run(run_id).await? {
                score.progress = run.tokens_used + run.duration_ms / 1_000;
                if let Some(task) = state.get_task(&run.task_id).await? {
                    score.priority = task.priority_score;
                }
            }
            score.rollback_cost = locks.iter().filter(|l| &l.held_by == run_id).count() as u64;
            scores.insert(run_id.clone(), score);
        }
        Ok(scores)
    }
}
