//! Configuration types and loading
//!
//! Fallback chain: explicit path, then `.hivedaemon.yml` in the working
//! directory, then `~/.config/hivedaemon/hivedaemon.yml`, then defaults.
//! Every knob the components consume is here; components receive typed
//! sub-configs, never the whole struct.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::gate::GateConfig;
use crate::lifecycle::{HealthThresholds, LifecycleConfig};
use crate::monitor::MonitorConfig;
use crate::scheduler::SchedulerConfig;
use crate::sweeper::SweeperConfig;
use crate::worktree::WorktreeConfig;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub scheduler: SchedulerSection,
    pub heartbeat: HeartbeatSection,
    pub retry: RetrySection,
    pub locks: LockSection,
    pub budget: BudgetSection,
    pub approvals: ApprovalSection,
    pub knowledge: KnowledgeSection,
    pub gate: GateSection,
    pub monitor: MonitorSection,
    pub git: GitSection,
    pub storage: StorageSection,
    pub ipc: IpcSection,
}

impl Config {
    /// Load configuration with the fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local = PathBuf::from(".hivedaemon.yml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => return Ok(config),
                Err(e) => tracing::warn!("Failed to load config from {}: {}", local.display(), e),
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user = config_dir.join("hivedaemon").join("hivedaemon.yml");
            if user.exists() {
                match Self::load_from_file(&user) {
                    Ok(config) => return Ok(config),
                    Err(e) => tracing::warn!("Failed to load config from {}: {}", user.display(), e),
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    // === Typed views for the components ===

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            concurrency_cap: self.scheduler.concurrency_cap as usize,
            starvation_threshold: self.scheduler.starvation_threshold,
            starvation_boost: self.scheduler.starvation_boost,
        }
    }

    pub fn health_thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            interval_ms: self.heartbeat.interval_s as i64 * 1_000,
            stuck_multiplier: self.heartbeat.stuck_multiplier as i64,
            crashed_multiplier: self.heartbeat.crashed_multiplier as i64,
        }
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            heartbeat: self.health_thresholds(),
            max_attempts_per_task: self.retry.max_attempts_per_task,
            retry_backoff_base: Duration::from_secs(self.retry.backoff_base_s),
            retry_backoff_max: Duration::from_secs(self.retry.backoff_max_s),
            pause_grace: Duration::from_secs(self.locks.pause_grace_s),
            wallclock_per_task: Duration::from_secs(self.budget.wallclock_per_task_s),
            worker_binary: None,
        }
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            check_timeout: Duration::from_secs(self.gate.check_timeout_s),
            flaky_reruns: self.gate.flaky_reruns,
            known_flaky: self.gate.known_flaky.iter().cloned().collect::<HashSet<_>>(),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_secs(self.monitor.poll_interval_s),
            regression_probe_interval: Duration::from_secs(self.monitor.regression_probe_interval_s),
            budget_total_tokens: self.budget.total_tokens,
            budget_warning_pct: self.budget.tokens_warning_pct,
            budget_hard_pct: self.budget.tokens_hard_pct,
            digression_repeat_threshold: self.monitor.digression_repeat_threshold,
            digression_file_multiplier: self.monitor.digression_file_multiplier,
            probe_workdir: self.git.repo_root.clone(),
        }
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            interval: Duration::from_secs(self.monitor.sweep_interval_s),
            max_attempts_per_task: self.retry.max_attempts_per_task,
        }
    }

    pub fn worktree_config(&self) -> WorktreeConfig {
        WorktreeConfig {
            base_dir: self.git.worktree_dir.clone(),
            repo_root: self.git.repo_root.clone(),
            branch_prefix: self.git.branch_prefix.clone(),
            trunk: self.git.trunk.clone(),
        }
    }

    pub fn lock_ttl_ms(&self) -> i64 {
        self.locks.ttl_s as i64 * 1_000
    }

    pub fn checkpoint_retention_ms(&self) -> i64 {
        self.storage.checkpoint_retention_s as i64 * 1_000
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,
    #[serde(rename = "base-url")]
    pub base_url: String,
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 16384,
            timeout_ms: 300_000,
        }
    }
}

/// Wave scheduling limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    #[serde(rename = "concurrency-cap")]
    pub concurrency_cap: u32,
    #[serde(rename = "starvation-threshold")]
    pub starvation_threshold: u32,
    #[serde(rename = "starvation-boost")]
    pub starvation_boost: i64,
    /// Grace before an open wave is truncated on pause
    #[serde(rename = "wave-grace-s")]
    pub wave_grace_s: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            concurrency_cap: 4,
            starvation_threshold: 3,
            starvation_boost: 10,
            wave_grace_s: 30,
        }
    }
}

/// Heartbeat classification thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    #[serde(rename = "interval-s")]
    pub interval_s: u64,
    #[serde(rename = "stuck-multiplier")]
    pub stuck_multiplier: u32,
    #[serde(rename = "crashed-multiplier")]
    pub crashed_multiplier: u32,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_s: 30,
            stuck_multiplier: 5,
            crashed_multiplier: 5,
        }
    }
}

/// Retry bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    #[serde(rename = "max-attempts-per-task")]
    pub max_attempts_per_task: u32,
    #[serde(rename = "backoff-base-s")]
    pub backoff_base_s: u64,
    #[serde(rename = "backoff-max-s")]
    pub backoff_max_s: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts_per_task: 3,
            backoff_base_s: 5,
            backoff_max_s: 300,
        }
    }
}

/// Lock and cancellation windows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSection {
    #[serde(rename = "ttl-s")]
    pub ttl_s: u64,
    #[serde(rename = "pause-grace-s")]
    pub pause_grace_s: u64,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            ttl_s: 600,
            pause_grace_s: 15,
        }
    }
}

/// Budget thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    #[serde(rename = "total-tokens")]
    pub total_tokens: u64,
    #[serde(rename = "tokens-warning-pct")]
    pub tokens_warning_pct: u8,
    #[serde(rename = "tokens-hard-pct")]
    pub tokens_hard_pct: u8,
    #[serde(rename = "wallclock-per-task-s")]
    pub wallclock_per_task_s: u64,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            total_tokens: 0,
            tokens_warning_pct: 80,
            tokens_hard_pct: 95,
            wallclock_per_task_s: 3_600,
        }
    }
}

/// Human approval gates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalSection {
    #[serde(rename = "require-human-approval")]
    pub require_human_approval: bool,
    #[serde(rename = "auto-execute-low-risk")]
    pub auto_execute_low_risk: bool,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            require_human_approval: true,
            auto_execute_low_risk: true,
        }
    }
}

/// Knowledge base tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeSection {
    #[serde(rename = "similarity-threshold")]
    pub similarity_threshold: f64,
    #[serde(rename = "max-items-per-prompt")]
    pub max_items_per_prompt: usize,
}

impl Default for KnowledgeSection {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.8,
            max_items_per_prompt: 8,
        }
    }
}

/// Verification gate tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSection {
    #[serde(rename = "check-timeout-s")]
    pub check_timeout_s: u64,
    #[serde(rename = "flaky-reruns")]
    pub flaky_reruns: u32,
    #[serde(rename = "known-flaky")]
    pub known_flaky: Vec<String>,
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            check_timeout_s: 600,
            flaky_reruns: 2,
            known_flaky: Vec::new(),
        }
    }
}

/// Monitor cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    #[serde(rename = "poll-interval-s")]
    pub poll_interval_s: u64,
    #[serde(rename = "regression-probe-interval-s")]
    pub regression_probe_interval_s: u64,
    #[serde(rename = "sweep-interval-s")]
    pub sweep_interval_s: u64,
    #[serde(rename = "digression-repeat-threshold")]
    pub digression_repeat_threshold: usize,
    #[serde(rename = "digression-file-multiplier")]
    pub digression_file_multiplier: usize,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            poll_interval_s: 30,
            regression_probe_interval_s: 1_800,
            sweep_interval_s: 60,
            digression_repeat_threshold: 3,
            digression_file_multiplier: 3,
        }
    }
}

/// Git workspace configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSection {
    #[serde(rename = "repo-root")]
    pub repo_root: PathBuf,
    #[serde(rename = "worktree-dir")]
    pub worktree_dir: PathBuf,
    #[serde(rename = "branch-prefix")]
    pub branch_prefix: String,
    pub trunk: String,
}

impl Default for GitSection {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            worktree_dir: PathBuf::from("/tmp/hivedaemon/worktrees"),
            branch_prefix: "hive".to_string(),
            trunk: "main".to_string(),
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    #[serde(rename = "store-dir")]
    pub store_dir: PathBuf,
    #[serde(rename = "checkpoint-retention-s")]
    pub checkpoint_retention_s: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(".hivestore"),
            checkpoint_retention_s: 3_600,
        }
    }
}

/// IPC socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcSection {
    #[serde(rename = "socket-path")]
    pub socket_path: PathBuf,
}

impl Default for IpcSection {
    fn default() -> Self {
        let dir = dirs::runtime_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        Self {
            socket_path: dir.join("hivedaemon").join("hd.sock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.scheduler.concurrency_cap, 4);
        assert_eq!(config.heartbeat.interval_s, 30);
        assert_eq!(config.retry.max_attempts_per_task, 3);
        assert_eq!(config.locks.ttl_s, 600);
        assert!((config.knowledge.similarity_threshold - 0.8).abs() < 1e-9);
        assert!(config.approvals.require_human_approval);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
scheduler:
  concurrency-cap: 8
retry:
  max-attempts-per-task: 5
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.scheduler.concurrency_cap, 8);
        assert_eq!(config.retry.max_attempts_per_task, 5);
        // Untouched sections keep defaults
        assert_eq!(config.heartbeat.stuck_multiplier, 5);
        assert_eq!(config.budget.tokens_warning_pct, 80);
    }

    #[test]
    fn test_typed_views() {
        let yaml = r#"
heartbeat:
  interval-s: 10
  stuck-multiplier: 4
  crashed-multiplier: 6
gate:
  known-flaky:
    - "cargo test flaky_suite"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        let health = config.health_thresholds();
        assert_eq!(health.interval_ms, 10_000);
        assert_eq!(health.stuck_multiplier, 4);
        assert_eq!(health.crashed_multiplier, 6);

        let gate = config.gate_config();
        assert!(gate.known_flaky.contains("cargo test flaky_suite"));
    }

    #[test]
    fn test_llm_section() {
        let yaml = r#"
llm:
  model: claude-opus-4
  api-key-env: MY_KEY
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.llm.model, "claude-opus-4");
        assert_eq!(config.llm.api_key_env, "MY_KEY");
        assert_eq!(config.llm.provider, "anthropic");
    }
}
