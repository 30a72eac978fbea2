//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;

use crate::ipc::{IpcResponse, StatusView};

#[derive(Debug, Parser)]
#[command(name = "hd", version, about = "Multi-agent coding orchestrator")]
pub struct Cli {
    /// Explicit config file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the daemon in the foreground
    Start,
    /// Stop a running daemon
    Stop,
    /// Overall status
    Status,
    /// Task operations
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Task-list operations
    List {
        #[command(subcommand)]
        command: ListCommands,
    },
    /// Event timeline
    Timeline {
        /// Only events at or after this unix-ms timestamp
        #[arg(long)]
        since: Option<i64>,
        /// Filter by event type; repeatable
        #[arg(long = "type")]
        event_types: Vec<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// The lock table
    Locks,
    /// Force-release a lock
    Unlock { path: String },
    /// Decisions waiting on a human
    Decisions,
    /// Answer a decision
    Decide { decision_id: String, choice: String },
    /// Roll a run back to its checkpoint
    Rollback { run_id: String },
    /// A run's transcript
    Transcript { run_id: String },
    /// Paths a run changed
    Diff { run_id: String },
    /// Agent worker entry point (spawned by the daemon)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        run_id: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum TaskCommands {
    /// Create a draft task
    Add {
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "feature")]
        category: String,
        /// Acceptance criterion; repeatable
        #[arg(long = "criterion")]
        criteria: Vec<String>,
        /// Expected file; repeatable
        #[arg(long = "file")]
        affected_files: Vec<String>,
        /// Level-1 check command; repeatable
        #[arg(long = "check")]
        codebase_tests: Vec<String>,
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },
    /// Validate a draft and make it schedulable
    Submit { task_id: String },
    /// Show one task
    Show { task_id: String },
    /// Recorded acceptance-criterion results
    Criteria { task_id: String },
    /// Skip a task (cancels it, marks memberships skipped)
    Skip { task_id: String },
    /// Reset a blocked/failed/stale task to pending
    Reset { task_id: String },
    /// Cancel a task
    Cancel { task_id: String },
    /// Pause a task's live run
    Pause { task_id: String },
}

#[derive(Debug, Subcommand)]
pub enum ListCommands {
    /// Create a task list
    Create { title: String },
    /// Append a task to a list
    Add { list_id: String, task_id: String },
    /// Start executing a list
    Run { list_id: String },
    /// Pause a list and its live runs
    Pause { list_id: String },
    /// Resume a paused list
    Resume { list_id: String },
    /// Show list progress
    Show { list_id: String },
}

/// Print a response in human terms. Returns a process exit code.
pub fn render_response(response: &IpcResponse) -> i32 {
    match response {
        IpcResponse::Ok => {
            println!("{}", "ok".green());
            0
        }
        IpcResponse::Pong { version } => {
            println!("daemon alive (v{version})");
            0
        }
        IpcResponse::Error { message } => {
            eprintln!("{} {message}", "error:".red());
            1
        }
        IpcResponse::Created { id } => {
            println!("{id}");
            0
        }
        IpcResponse::Status(status) => {
            render_status(status);
            0
        }
        IpcResponse::Events(events) => {
            for event in events {
                println!(
                    "{} {} {} {}",
                    iso_time(event.timestamp),
                    event.source.cyan(),
                    event.event_type.bold(),
                    event.payload
                );
            }
            0
        }
        IpcResponse::Locks(locks) => {
            for lock in locks {
                println!(
                    "{}  held by {} until {} ({})",
                    lock.resource_path.bold(),
                    lock.held_by,
                    iso_time(lock.expires_at),
                    lock.reason
                );
            }
            if locks.is_empty() {
                println!("no locks held");
            }
            0
        }
        IpcResponse::Decisions(decisions) => {
            for decision in decisions {
                println!(
                    "{}  {}\n  options: {:?}  default: {}  expires in {}s",
                    decision.decision_id.bold(),
                    decision.question,
                    decision.options,
                    decision.default_choice,
                    decision.expires_in_ms / 1_000
                );
            }
            if decisions.is_empty() {
                println!("no pending decisions");
            }
            0
        }
        IpcResponse::Transcript(entries) => {
            for entry in entries {
                println!("{:>5} {:<10} {}", entry.seq, entry.role.cyan(), entry.content);
            }
            0
        }
        IpcResponse::Paths(paths) => {
            for path in paths {
                println!("{path}");
            }
            0
        }
        IpcResponse::CriteriaResults(results) => {
            for result in results {
                let mark = if result.met { "✓".green() } else { "✗".red() };
                println!("{mark} {} ({}, {})", result.criterion, result.verified_by, result.scope);
            }
            0
        }
        IpcResponse::Text(text) => {
            println!("{text}");
            0
        }
    }
}

/// Unix-ms timestamp as ISO-8601 UTC
fn iso_time(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| timestamp_ms.to_string())
}

fn render_status(status: &StatusView) {
    println!("{}", "hivedaemon status".bold());
    println!(
        "  lists: {} total, {} executing",
        status.lists_total, status.lists_active
    );
    for (name, count) in &status.tasks_by_status {
        println!("  tasks/{name}: {count}");
    }
    println!("  live runs: {}", status.live_runs);
    println!("  held locks: {}", status.held_locks);
    if status.pending_decisions > 0 {
        let pending = format!("pending decisions: {}", status.pending_decisions);
        println!("  {} {}", pending.as_str().yellow(), "(run `hd decisions`)".dimmed());
    }
}
