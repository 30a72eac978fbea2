//! Git worktree manager - the version-control substrate
//!
//! One worktree and branch per run. The daemon only consumes a narrow git
//! interface: branch create/checkout/delete, commit, diff between refs,
//! stash-style snapshots, and rebase from trunk with conflict enumeration.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info, warn};

/// Error types for worktree operations
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("failed to create worktree: {0}")]
    CreateFailed(String),

    #[error("failed to remove worktree: {0}")]
    RemoveFailed(String),

    #[error("rebase conflict: {0:?}")]
    RebaseConflict(Vec<String>),

    #[error("merge conflict: {0:?}")]
    MergeConflict(Vec<String>),

    #[error("worktree not found: {0}")]
    NotFound(String),

    #[error("unknown ref: {0}")]
    UnknownRef(String),

    #[error("git command failed: {0}")]
    GitError(String),
}

/// Configuration for the worktree manager
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Base directory for per-run worktrees
    pub base_dir: PathBuf,
    /// Path to the main repository
    pub repo_root: PathBuf,
    /// Branch prefix for run branches
    pub branch_prefix: String,
    /// Trunk branch runs rebase from and merge into
    pub trunk: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/tmp/hivedaemon/worktrees"),
            repo_root: PathBuf::from("."),
            branch_prefix: "hive".to_string(),
            trunk: "main".to_string(),
        }
    }
}

/// Information about a created worktree
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub run_id: String,
    pub path: PathBuf,
    pub branch: String,
    /// Commit the branch was cut from
    pub start_commit: String,
}

/// Manager for per-run git worktrees
#[derive(Clone)]
pub struct WorktreeManager {
    config: WorktreeConfig,
}

impl WorktreeManager {
    pub fn new(config: WorktreeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WorktreeConfig {
        &self.config
    }

    pub fn worktree_path(&self, run_id: &str) -> PathBuf {
        self.config.base_dir.join(run_id)
    }

    pub fn branch_name(&self, run_id: &str) -> String {
        format!("{}/{}", self.config.branch_prefix, run_id)
    }

    /// Create a worktree and branch for a run, capturing the start commit
    pub async fn create(&self, run_id: &str) -> Result<WorktreeInfo, WorktreeError> {
        tokio::fs::create_dir_all(&self.config.base_dir)
            .await
            .map_err(|e| WorktreeError::CreateFailed(format!("base dir: {e}")))?;

        let path = self.worktree_path(run_id);
        let branch = self.branch_name(run_id);

        let start_commit = self.rev_parse(&self.config.repo_root, "HEAD").await?;

        let output = git(&self.config.repo_root)
            .args(["worktree", "add", &path.to_string_lossy(), "-b", &branch, "HEAD"])
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;

        if !output.status.success() {
            return Err(WorktreeError::CreateFailed(stderr_of(&output)));
        }

        info!(run_id, branch, path = %path.display(), "Created worktree");
        Ok(WorktreeInfo {
            run_id: run_id.to_string(),
            path,
            branch,
            start_commit,
        })
    }

    /// Remove a run's worktree and branch
    pub async fn remove(&self, run_id: &str) -> Result<(), WorktreeError> {
        let path = self.worktree_path(run_id);
        if !path.exists() {
            warn!(run_id, "Worktree already gone, skipping removal");
            return Ok(());
        }

        let output = git(&self.config.repo_root)
            .args(["worktree", "remove", &path.to_string_lossy(), "--force"])
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;

        if !output.status.success() {
            let stderr = stderr_of(&output);
            if !stderr.contains("is not a working tree") {
                return Err(WorktreeError::RemoveFailed(stderr));
            }
        }

        let branch = self.branch_name(run_id);
        let _ = git(&self.config.repo_root).args(["branch", "-D", &branch]).output().await;

        info!(run_id, "Removed worktree");
        Ok(())
    }

    /// Resolve a ref to a commit hash
    pub async fn rev_parse(&self, dir: &Path, spec: &str) -> Result<String, WorktreeError> {
        let output = git(dir)
            .args(["rev-parse", spec])
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;
        if !output.status.success() {
            return Err(WorktreeError::UnknownRef(spec.to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Whether a commit exists in the repository
    pub async fn ref_exists(&self, spec: &str) -> bool {
        git(&self.config.repo_root)
            .args(["cat-file", "-e", &format!("{spec}^{{commit}}")])
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Stage everything and commit in the given worktree. Returns the new
    /// commit hash, or None when the tree is clean.
    pub async fn commit_all(&self, dir: &Path, message: &str) -> Result<Option<String>, WorktreeError> {
        let status = git(dir)
            .args(["status", "--porcelain"])
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;
        if status.stdout.is_empty() {
            debug!(dir = %dir.display(), "Nothing to commit");
            return Ok(None);
        }

        run_git(dir, &["add", "-A"]).await?;
        run_git(dir, &["commit", "-m", message]).await?;
        let commit = self.rev_parse(dir, "HEAD").await?;
        Ok(Some(commit))
    }

    /// Paths changed between two refs
    pub async fn diff_paths(&self, dir: &Path, from: &str, to: &str) -> Result<Vec<String>, WorktreeError> {
        let output = git(dir)
            .args(["diff", "--name-only", &format!("{from}..{to}")])
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;
        if !output.status.success() {
            return Err(WorktreeError::GitError(stderr_of(&output)));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Hard-reset a worktree to a commit and drop untracked files
    pub async fn reset_hard(&self, dir: &Path, commit: &str) -> Result<(), WorktreeError> {
        if !self.ref_exists(commit).await {
            return Err(WorktreeError::UnknownRef(commit.to_string()));
        }
        run_git(dir, &["reset", "--hard", commit]).await?;
        run_git(dir, &["clean", "-fd"]).await?;
        info!(dir = %dir.display(), commit, "Reset worktree");
        Ok(())
    }

    /// Rebase a worktree onto trunk. On conflict the rebase is aborted and
    /// the conflicting paths are returned in the error.
    pub async fn rebase_on_trunk(&self, dir: &Path) -> Result<(), WorktreeError> {
        let output = git(dir)
            .args(["rebase", &self.config.trunk])
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;

        if output.status.success() {
            return Ok(());
        }

        let conflicts = self.conflicted_paths(dir).await.unwrap_or_default();
        let _ = git(dir).args(["rebase", "--abort"]).output().await;
        warn!(dir = %dir.display(), ?conflicts, "Rebase conflict, aborted");
        Err(WorktreeError::RebaseConflict(conflicts))
    }

    async fn conflicted_paths(&self, dir: &Path) -> Result<Vec<String>, WorktreeError> {
        let output = git(dir)
            .args(["diff", "--name-only", "--diff-filter=U"])
            .output()
            .await
            .map_err(|e| WorktreeError::GitError(e.to_string()))?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .filter(|l| !l.is_empty())
            .collect())
    }
}

fn git(dir: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.current_dir(dir);
    cmd
}

async fn run_git(dir: &Path, args: &[&str]) -> Result<(), WorktreeError> {
    let output = git(dir)
        .args(args)
        .output()
        .await
        .map_err(|e| WorktreeError::GitError(e.to_string()))?;
    if !output.status.success() {
        return Err(WorktreeError::GitError(format!(
            "git {}: {}",
            args.join(" "),
            stderr_of(&output)
        )));
    }
    Ok(())
}

fn stderr_of(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}
