//! Hivedaemon - multi-agent coding orchestrator
//!
//! Drives autonomous code-generation agents through a coordinated pipeline:
//! a persistent task graph schedules closed waves of parallel work, each
//! run is isolated in its own git worktree behind a checkpoint, and an
//! independent verification gate re-derives every completion claim from
//! exit codes before the graph advances.
//!
//! # Architecture
//!
//! - **State**: one actor owns the SQLite-backed store; all writes are
//!   serialized and compound steps are transactional ([`state`]).
//! - **Coordination**: durable event bus with persistent subscriptions
//!   ([`events`]), advisory TTL locks with a wait-graph ([`locks`],
//!   [`deadlock`]), checkpoints over git ([`checkpoint`], [`worktree`]),
//!   shared knowledge ([`knowledge`]), and single-owner hot artifacts
//!   ([`registry`]).
//! - **Scheduling**: wave emission under dependency/conflict/ownership
//!   constraints ([`scheduler`]) and the agent lifecycle ([`lifecycle`],
//!   [`agent`]).
//! - **Supervision**: the verification gate ([`gate`]), anomaly monitor
//!   ([`monitor`]), PM coordinator ([`pm`]), and orphan sweeper
//!   ([`sweeper`]).
//! - **Observability**: transcript, tool-use, assertion, and skill
//!   recorders with per-run monotone sequences ([`recorders`]).

pub mod agent;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod deadlock;
pub mod domain;
pub mod error;
pub mod events;
pub mod gate;
pub mod ipc;
pub mod knowledge;
pub mod lifecycle;
pub mod llm;
pub mod locks;
pub mod monitor;
pub mod pm;
pub mod prompts;
pub mod recorders;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod sweeper;
pub mod worktree;

// Re-export the commonly assembled surface
pub use config::Config;
pub use domain::{
    AgentRole, ExecutionRun, RelationKind, Relationship, RiskLevel, RunStatus, Task, TaskCategory,
    TaskList, TaskStatus, Wave, WaveStatus,
};
pub use error::{ErrorKind, HarnessError};
pub use events::{BusEvent, EventBus, create_event_bus};
pub use state::{EventDraft, StateError, StateManager};
