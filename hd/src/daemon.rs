//! Daemon process management and component wiring
//!
//! `run_daemon` builds the whole component graph over one store and drives
//! the scheduling loop: close finished waves, emit the next wave, launch an
//! agent per admitted task. Supervision loops (lifecycle, monitor, PM,
//! sweeper, deadlock detector) run as sibling tasks until shutdown.

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eyre::{Context, Result};
use tracing::{info, warn};

use crate::checkpoint::CheckpointManager;
use crate::config::Config;
use crate::deadlock::{DeadlockDetector, WaitGraph};
use crate::domain::{Filter, ListStatus};
use crate::events::EventBus;
use crate::gate::VerificationGate;
use crate::ipc::{self, ControlPlane};
use crate::knowledge::KnowledgeBase;
use crate::lifecycle::LifecycleManager;
use crate::locks::LockRegistry;
use crate::monitor::Monitor;
use crate::pm::{PmConfig, PmCoordinator};
use crate::registry::ResourceRegistry;
use crate::scheduler::{WaveDecision, WaveScheduler};
use crate::state::StateManager;
use crate::sweeper::OrphanSweeper;
use crate::worktree::WorktreeManager;

/// Default PID file location
fn default_pid_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("hivedaemon")
        .join("hivedaemon.pid")
}

/// PID-file based single-instance management
#[derive(Debug)]
pub struct DaemonManager {
    pid_file: PathBuf,
}

impl Default for DaemonManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonManager {
    pub fn new() -> Self {
        Self {
            pid_file: default_pid_path(),
        }
    }

    pub fn with_pid_file(pid_file: PathBuf) -> Self {
        Self { pid_file }
    }

    pub fn is_running(&self) -> bool {
        self.read_pid().is_some_and(is_process_running)
    }

    pub fn running_pid(&self) -> Option<u32> {
        self.read_pid().filter(|&pid| is_process_running(pid))
    }

    fn read_pid(&self) -> Option<u32> {
        if !self.pid_file.exists() {
            return None;
        }
        let mut contents = String::new();
        fs::File::open(&self.pid_file).ok()?.read_to_string(&mut contents).ok()?;
        contents.trim().parse().ok()
    }

    /// Record this process as the running daemon
    pub fn register(&self) -> Result<()> {
        if let Some(pid) = self.running_pid() {
            eyre::bail!("daemon already running with pid {pid}");
        }
        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent).context("Failed to create PID file directory")?;
        }
        let mut file = fs::File::create(&self.pid_file).context("Failed to create PID file")?;
        write!(file, "{}", std::process::id()).context("Failed to write PID")?;
        Ok(())
    }

    pub fn unregister(&self) -> Result<()> {
        if self.pid_file.exists() {
            fs::remove_file(&self.pid_file).context("Failed to remove PID file")?;
        }
        Ok(())
    }
}

fn is_process_running(pid: u32) -> bool {
    // Signal 0 probes existence without sending anything
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

/// Build every component and run until shutdown
pub async fn run_daemon(config: Config) -> Result<()> {
    let manager = DaemonManager::new();
    manager.register()?;
    info!(pid = std::process::id(), "Daemon starting");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Persistence and the bus
    let state = StateManager::spawn(&config.storage.store_dir)?;
    let bus = Arc::new(EventBus::new(state.clone()));

    // Coordination primitives
    let wait_graph = Arc::new(Mutex::new(WaitGraph::new()));
    let locks = LockRegistry::new(bus.clone(), wait_graph.clone(), config.lock_ttl_ms());
    let worktrees = WorktreeManager::new(config.worktree_config());
    let checkpoints = CheckpointManager::new(bus.clone(), worktrees.clone(), config.checkpoint_retention_ms());
    let knowledge = KnowledgeBase::new(
        bus.clone(),
        config.knowledge.similarity_threshold,
        config.knowledge.max_items_per_prompt,
    );
    let registry = ResourceRegistry::new(bus.clone());
    let gate = VerificationGate::new(bus.clone(), worktrees.clone(), config.gate_config());

    // Scheduling and supervision
    let scheduler = WaveScheduler::new(bus.clone(), config.scheduler_config());
    let lifecycle = LifecycleManager::new(
        bus.clone(),
        locks.clone(),
        checkpoints.clone(),
        worktrees.clone(),
        knowledge.clone(),
        registry.clone(),
        config.lifecycle_config(),
    );
    let monitor = Monitor::new(bus.clone(), config.monitor_config());
    let pm = PmCoordinator::new(bus.clone(), PmConfig::default());
    let sweeper = OrphanSweeper::new(bus.clone(), locks.clone(), checkpoints.clone(), config.sweeper_config());
    let detector = DeadlockDetector::new(wait_graph, bus.clone(), Duration::from_secs(5));

    // Supervision loops
    tokio::spawn(lifecycle.clone().run(shutdown_rx.clone()));
    tokio::spawn(monitor.run(shutdown_rx.clone()));
    tokio::spawn(pm.clone().run(shutdown_rx.clone()));
    tokio::spawn(sweeper.run(shutdown_rx.clone()));
    tokio::spawn(detector.run(shutdown_rx.clone()));

    // Human interface and worker channel
    let plane = ControlPlane {
        bus: bus.clone(),
        locks,
        checkpoints,
        lifecycle: lifecycle.clone(),
        pm,
        worktrees,
        gate,
        shutdown_tx: shutdown_tx.clone(),
    };
    tokio::spawn(ipc::serve(config.ipc.socket_path.clone(), plane, shutdown_rx.clone()));

    // Scheduling loop
    let result = scheduling_loop(state, scheduler, lifecycle, shutdown_rx, shutdown_tx).await;

    manager.unregister()?;
    info!("Daemon stopped");
    result
}

/// Drive waves for every executing list until shutdown
async fn scheduling_loop(
    state: StateManager,
    scheduler: WaveScheduler,
    lifecycle: LifecycleManager,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = schedule_pass(&state, &scheduler, &lifecycle).await {
                    warn!(error = %e, "Scheduling pass failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                let _ = shutdown_tx.send(true);
                break;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn schedule_pass(
    state: &StateManager,
    scheduler: &WaveScheduler,
    lifecycle: &LifecycleManager,
) -> Result<()> {
    let lists = state.list_lists(vec![Filter::eq("status", "in_progress")]).await?;
    for list in lists {
        scheduler.close_wave_if_done(&list.id, false).await?;

        match scheduler.next_wave(&list.id).await? {
            WaveDecision::Emitted(wave_id) => {
                let waves = state.list_waves(vec![Filter::eq("list", list.id.clone())]).await?;
                let Some(wave) = waves.into_iter().find(|w| w.id == wave_id) else {
                    continue;
                };
                for task_id in &wave.task_ids {
                    if let Err(e) = lifecycle.launch(task_id).await {
                        warn!(task_id, error = %e, "Agent launch failed");
                    }
                }
            }
            WaveDecision::PreviousWaveOpen | WaveDecision::NothingRunnable | WaveDecision::ListNotActive => {}
        }

        // Finished lists settle their status
        let list = state.get_list(&list.id).await?;
        if let Some(mut list) = list
            && list.status == ListStatus::InProgress
            && list.is_finished()
        {
            let status = if list.failed == 0 { ListStatus::Completed } else { ListStatus::Failed };
            list.set_status(status);
            state.update_list(list).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pid_file_roundtrip() {
        let temp = TempDir::new().unwrap();
        let manager = DaemonManager::with_pid_file(temp.path().join("hd.pid"));

        assert!(!manager.is_running());
        manager.register().unwrap();
        assert!(manager.is_running());
        assert_eq!(manager.running_pid(), Some(std::process::id()));

        // Registering twice is refused
        assert!(manager.register().is_err());

        manager.unregister().unwrap();
        assert!(!manager.is_running());
    }

    #[test]
    fn test_stale_pid_ignored() {
        let temp = TempDir::new().unwrap();
        let pid_file = temp.path().join("hd.pid");
        // A pid that cannot exist
        fs::write(&pid_file, "4194304").unwrap();

        let manager = DaemonManager::with_pid_file(pid_file);
        assert!(!manager.is_running());
        manager.register().unwrap();
        assert!(manager.is_running());
    }
}
