//! hd - the hivedaemon binary

use std::time::Duration;

use clap::Parser;
use eyre::Result;
use tracing_subscriber::EnvFilter;

use hivedaemon::agent::{WorkerArgs, run_worker};
use hivedaemon::cli::{Cli, Commands, ListCommands, TaskCommands, render_response};
use hivedaemon::config::Config;
use hivedaemon::daemon;
use hivedaemon::ipc::{IpcClient, IpcRequest};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref())?;

    match cli.command {
        Commands::Start => daemon::run_daemon(config).await,
        Commands::Worker { run_id } => {
            let args = WorkerArgs {
                run_id,
                socket_path: config.ipc.socket_path.clone(),
                heartbeat_interval: Duration::from_secs(config.heartbeat.interval_s.max(2) / 2),
            };
            run_worker(args, &config).await
        }
        command => {
            let request = to_request(command);
            let mut client = IpcClient::connect(&config.ipc.socket_path).await?;
            let response = client.request(request).await?;
            let code = render_response(&response);
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
    }
}

/// Map CLI commands onto the IPC protocol
fn to_request(command: Commands) -> IpcRequest {
    match command {
        Commands::Start | Commands::Worker { .. } => unreachable!("handled in main"),
        Commands::Stop => IpcRequest::Shutdown,
        Commands::Status => IpcRequest::Status,
        Commands::Timeline { since, event_types, limit } => IpcRequest::Timeline { since, event_types, limit },
        Commands::Locks => IpcRequest::LockTable,
        Commands::Unlock { path } => IpcRequest::ForceUnlock { path },
        Commands::Decisions => IpcRequest::PendingDecisions,
        Commands::Decide { decision_id, choice } => IpcRequest::Decide { decision_id, choice },
        Commands::Rollback { run_id } => IpcRequest::RollbackRun { run_id },
        Commands::Transcript { run_id } => IpcRequest::Transcript { run_id },
        Commands::Diff { run_id } => IpcRequest::RunDiff { run_id },
        Commands::Task { command } => match command {
            TaskCommands::Add {
                title,
                description,
                category,
                criteria,
                affected_files,
                codebase_tests,
                priority,
            } => IpcRequest::CreateTask {
                title,
                description,
                category,
                criteria,
                affected_files,
                codebase_tests,
                priority,
            },
            TaskCommands::Submit { task_id } => IpcRequest::SubmitTask { task_id },
            TaskCommands::Show { task_id } => IpcRequest::TaskStatus { task_id },
            TaskCommands::Criteria { task_id } => IpcRequest::Criteria { task_id },
            TaskCommands::Skip { task_id } => IpcRequest::SkipTask { task_id },
            TaskCommands::Reset { task_id } => IpcRequest::ResetTask { task_id },
            TaskCommands::Cancel { task_id } => IpcRequest::CancelTask { task_id },
            TaskCommands::Pause { task_id } => IpcRequest::PauseTask { task_id },
        },
        Commands::List { command } => match command {
            ListCommands::Create { title } => IpcRequest::CreateList { title },
            ListCommands::Add { list_id, task_id } => IpcRequest::AddToList { list_id, task_id },
            ListCommands::Run { list_id } => IpcRequest::RunList { list_id },
            ListCommands::Pause { list_id } => IpcRequest::PauseList { list_id },
            ListCommands::Resume { list_id } => IpcRequest::ResumeList { list_id },
            ListCommands::Show { list_id } => IpcRequest::ListStatus { list_id },
        },
    }
}
