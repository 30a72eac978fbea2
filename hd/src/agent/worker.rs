//! The agent worker loop
//!
//! Spawned by the lifecycle manager as `hd worker --run-id <id>` with the
//! run's worktree as working directory. The worker owns the untrusted half
//! of the contract: it heartbeats, consults the model, runs the declared
//! level-1 checks locally, and claims completion. Everything it prints on
//! stdout/stderr lands in the transcript; the verification gate re-derives
//! the real verdict.

use std::path::PathBuf;
use std::time::Duration;

use eyre::{Context, Result};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::Config;
use crate::ipc::{IpcClient, IpcRequest, IpcResponse};
use crate::llm::{CancelHandle, ChatMessage, CompletionRequest, create_client};
use crate::prompts::{ContextPack, PromptLoader};

/// Worker invocation parameters
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub run_id: String,
    pub socket_path: PathBuf,
    pub heartbeat_interval: Duration,
}

/// Worker entry point. Exit code 0 means a claim was filed; nonzero means
/// the attempt is abandoned and the daemon's crash handling takes over.
pub async fn run_worker(args: WorkerArgs, config: &Config) -> Result<()> {
    let pack = load_context_pack().await?;
    info!(run_id = %args.run_id, task = %pack.task_id, attempt = pack.attempt_no, "Worker starting");

    // Heartbeats on their own connection so a long check cannot starve them
    let heartbeat_handle = spawn_heartbeats(&args).await?;

    // Consult the model when a provider is configured; its narrative goes
    // to stdout, which the daemon routes into the transcript.
    if std::env::var(&config.llm.api_key_env).is_ok() {
        match consult_model(config, &pack).await {
            Ok(note) => println!("{note}"),
            Err(e) => warn!(error = %e, "Model consult failed; continuing with checks"),
        }
    }

    // Level-1 checks locally; only a passing worker claims
    let mut all_passed = true;
    for command in &pack.codebase_tests {
        println!("running check: {command}");
        let passed = run_check(command).await;
        println!("check {}: {}", command, if passed { "passed" } else { "FAILED" });
        all_passed &= passed;
    }

    heartbeat_handle.abort();

    if !all_passed {
        eyre::bail!("level-1 checks failed; not claiming");
    }

    // File the terminal claim; the gate takes it from here
    let mut client = IpcClient::connect(&args.socket_path).await?;
    match client
        .request(IpcRequest::WorkerClaim {
            run_id: args.run_id.clone(),
        })
        .await?
    {
        IpcResponse::Ok => {
            info!(run_id = %args.run_id, "Claim filed");
            Ok(())
        }
        IpcResponse::Error { message } => Err(eyre::eyre!("claim rejected: {message}")),
        other => Err(eyre::eyre!("unexpected response to claim: {other:?}")),
    }
}

async fn load_context_pack() -> Result<ContextPack> {
    let raw = tokio::fs::read_to_string(".hive-context.json")
        .await
        .context("context pack missing; was this worker spawned by the daemon?")?;
    ContextPack::from_json(&raw).ok_or_else(|| eyre::eyre!("context pack unparseable"))
}

async fn spawn_heartbeats(args: &WorkerArgs) -> Result<tokio::task::JoinHandle<()>> {
    let mut client = IpcClient::connect(&args.socket_path).await?;
    let run_id = args.run_id.clone();
    let interval = args.heartbeat_interval;

    Ok(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let request = IpcRequest::WorkerHeartbeat { run_id: run_id.clone() };
            if client.request(request).await.is_err() {
                // Daemon is gone; nothing useful left to do
                break;
            }
        }
    }))
}

async fn consult_model(config: &Config, pack: &ContextPack) -> Result<String> {
    let client = create_client(&config.llm)?;
    let loader = PromptLoader::new()?;
    let prompt = pack.render(&loader)?;

    let request = CompletionRequest::new("You are a build agent working on one task in an isolated git worktree.")
        .with_message(ChatMessage::user(prompt))
        .with_max_tokens(config.llm.max_tokens);

    let cancel = CancelHandle::new();
    let response = client.complete(request, &cancel, None).await?;
    Ok(response.content)
}

async fn run_check(command: &str) -> bool {
    Command::new("sh")
        .args(["-c", command])
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_check_exit_codes() {
        assert!(run_check("true").await);
        assert!(!run_check("false").await);
        assert!(!run_check("exit 42").await);
    }
}
