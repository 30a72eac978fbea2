//! Lock registry - advisory exclusive claims on workspace paths
//!
//! Locks are non-blocking: a failed acquisition returns false, records a
//! wait edge for the deadlock detector, and the caller retries with backoff.
//! TTLs bound orphaned claims; renewal is an explicit re-lock by the holder.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::deadlock::WaitGraph;
use crate::domain::{LockRecord, now_ms};
use crate::events::{BusEvent, EventBus};
use crate::state::StateResult;

/// Clone-able registry handle
#[derive(Clone)]
pub struct LockRegistry {
    bus: Arc<EventBus>,
    wait_graph: Arc<Mutex<WaitGraph>>,
    default_ttl_ms: i64,
}

impl LockRegistry {
    pub fn new(bus: Arc<EventBus>, wait_graph: Arc<Mutex<WaitGraph>>, default_ttl_ms: i64) -> Self {
        Self {
            bus,
            wait_graph,
            default_ttl_ms,
        }
    }

    pub fn wait_graph(&self) -> Arc<Mutex<WaitGraph>> {
        self.wait_graph.clone()
    }

    /// Try to acquire `path` for `holder`. Returns false when contended;
    /// the wait edge and conflict events are already recorded by then.
    pub async fn lock(&self, path: &str, holder: &str, reason: &str, ttl: Option<Duration>) -> StateResult<bool> {
        let ttl_ms = ttl.map(|d| d.as_millis() as i64).unwrap_or(self.default_ttl_ms);
        let granted = self.bus.state().try_lock(path, holder, reason, ttl_ms).await?;

        if granted {
            {
                let mut graph = self.wait_graph.lock().unwrap_or_else(|e| e.into_inner());
                graph.clear_waiter(holder);
            }
            self.bus
                .publish(
                    "locks",
                    BusEvent::FileLocked {
                        path: path.to_string(),
                        holder: holder.to_string(),
                    },
                )
                .await?;
            return Ok(true);
        }

        // Contended: record the wait edge and surface the conflict
        let current = self.bus.state().check_lock(path).await?;
        let current_holder = current.map(|l| l.held_by).unwrap_or_default();
        if !current_holder.is_empty() && current_holder != holder {
            {
                let mut graph = self.wait_graph.lock().unwrap_or_else(|e| e.into_inner());
                graph.add_wait(holder, &current_holder, path);
            }
            self.bus
                .publish(
                    "locks",
                    BusEvent::WaitRegistered {
                        waiter: holder.to_string(),
                        holder: current_holder.clone(),
                        path: path.to_string(),
                    },
                )
                .await?;
            self.bus
                .publish(
                    "locks",
                    BusEvent::FileConflict {
                        path: path.to_string(),
                        holder: current_holder,
                        contender: holder.to_string(),
                    },
                )
                .await?;
        }
        Ok(false)
    }

    /// Acquire with bounded retries and linear backoff. Gives up after
    /// `attempts` tries, leaving the wait edge in place for the detector.
    pub async fn lock_with_retry(
        &self,
        path: &str,
        holder: &str,
        reason: &str,
        attempts: u32,
        backoff: Duration,
    ) -> StateResult<bool> {
        for attempt in 0..attempts {
            if self.lock(path, holder, reason, None).await? {
                return Ok(true);
            }
            debug!(path, holder, attempt, "Lock contended, backing off");
            tokio::time::sleep(backoff * (attempt + 1)).await;
        }
        Ok(false)
    }

    /// Release a lock held by `holder`
    pub async fn unlock(&self, path: &str, holder: &str) -> StateResult<bool> {
        let released = self.bus.state().unlock(path, holder).await?;
        if released {
            self.bus
                .publish(
                    "locks",
                    BusEvent::FileUnlocked {
                        path: path.to_string(),
                        holder: holder.to_string(),
                    },
                )
                .await?;
        }
        Ok(released)
    }

    /// Current claim on a path, if any
    pub async fn check(&self, path: &str) -> StateResult<Option<LockRecord>> {
        self.bus.state().check_lock(path).await
    }

    /// The full lock table
    pub async fn table(&self) -> StateResult<Vec<LockRecord>> {
        self.bus.state().list_locks().await
    }

    /// Drop every lock held by a run and clear its wait edges. Used on
    /// rollback, crash cleanup, and force-release.
    pub async fn release_holder(&self, holder: &str) -> StateResult<usize> {
        let held: Vec<LockRecord> = self
            .table()
            .await?
            .into_iter()
            .filter(|l| l.held_by == holder)
            .collect();

        let released = self.bus.state().release_holder(holder).await?;
        {
            let mut graph = self.wait_graph.lock().unwrap_or_else(|e| e.into_inner());
            graph.remove_run(holder);
        }
        for lock in held {
            self.bus
                .publish(
                    "locks",
                    BusEvent::FileUnlocked {
                        path: lock.resource_path,
                        holder: holder.to_string(),
                    },
                )
                .await?;
        }
        Ok(released)
    }

    /// Sweep expired locks. Returns the released paths.
    pub async fn expire_stale(&self) -> StateResult<Vec<String>> {
        let now = now_ms();
        let mut expired = Vec::new();
        for lock in self.table().await? {
            if lock.is_expired(now) {
                warn!(path = %lock.resource_path, holder = %lock.held_by, "Lock TTL expired");
                if self.bus.state().unlock(&lock.resource_path, &lock.held_by).await? {
                    self.bus
                        .publish(
                            "locks",
                            BusEvent::FileUnlocked {
                                path: lock.resource_path.clone(),
                                holder: lock.held_by.clone(),
                            },
                        )
                        .await?;
                    expired.push(lock.resource_path);
                }
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateManager;
    use tempfile::TempDir;

    async fn registry() -> (TempDir, LockRegistry) {
        let temp = TempDir::new().unwrap();
        let state = StateManager::spawn(temp.path().join("store")).unwrap();
        let bus = Arc::new(EventBus::new(state));
        let graph = Arc::new(Mutex::new(WaitGraph::new()));
        (temp, LockRegistry::new(bus, graph, 60_000))
    }

    #[tokio::test]
    async fn test_exclusive_acquisition() {
        let (_temp, locks) = registry().await;

        assert!(locks.lock("src/api.rs", "run-1", "edit", None).await.unwrap());
        assert!(!locks.lock("src/api.rs", "run-2", "edit", None).await.unwrap());

        // The loser's wait edge is recorded
        let graph = locks.wait_graph();
        assert_eq!(graph.lock().unwrap().edge_count(), 1);
    }

    #[tokio::test]
    async fn test_lock_unlock_relock_law() {
        let (_temp, locks) = registry().await;

        assert!(locks.lock("p", "h", "r", None).await.unwrap());
        assert!(locks.unlock("p", "h").await.unwrap());
        assert!(locks.lock("p", "h", "r", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquisition_clears_wait_edge() {
        let (_temp, locks) = registry().await;

        locks.lock("p", "run-1", "r", None).await.unwrap();
        locks.lock("p", "run-2", "r", None).await.unwrap(); // contended
        assert_eq!(locks.wait_graph().lock().unwrap().edge_count(), 1);

        locks.unlock("p", "run-1").await.unwrap();
        assert!(locks.lock("p", "run-2", "r", None).await.unwrap());
        assert_eq!(locks.wait_graph().lock().unwrap().edge_count(), 0);
    }

    #[tokio::test]
    async fn test_release_holder_drops_all() {
        let (_temp, locks) = registry().await;

        locks.lock("a", "run-1", "r", None).await.unwrap();
        locks.lock("b", "run-1", "r", None).await.unwrap();
        locks.lock("c", "run-2", "r", None).await.unwrap();

        let released = locks.release_holder("run-1").await.unwrap();
        assert_eq!(released, 2);
        assert!(locks.check("a").await.unwrap().is_none());
        assert!(locks.check("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expire_stale() {
        let (_temp, locks) = registry().await;

        locks
            .lock("old", "run-1", "r", Some(Duration::from_millis(0)))
            .await
            .unwrap();
        locks.lock("fresh", "run-2", "r", None).await.unwrap();

        let expired = locks.expire_stale().await.unwrap();
        assert_eq!(expired, vec!["old".to_string()]);
        assert!(locks.check("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_conflict_events_published() {
        let (_temp, locks) = registry().await;
        locks.bus.subscribe("pm", vec!["file_conflict".to_string()], None).await.unwrap();

        locks.lock("p", "run-1", "r", None).await.unwrap();
        locks.lock("p", "run-2", "r", None).await.unwrap();

        let events = locks.bus.poll("pm", 10).await.unwrap();
        assert_eq!(events.len(), 1);
    }
}
