//! Agent execution lifecycle: spawn, heartbeat, health, pause, retry

pub mod health;
pub mod manager;

pub use health::{AgentHealth, HealthThresholds};
pub use manager::{LifecycleConfig, LifecycleManager, backoff_delay, requeue_target};
