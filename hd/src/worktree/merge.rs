//! Controlled merge of a verified run branch into trunk
//!
//! Merges happen only after the verification gate accepts a run. The branch
//! is first rebased onto trunk; conflicts abort the merge and escalate to a
//! human rather than being auto-resolved.

use tracing::{info, warn};

use super::manager::{WorktreeError, WorktreeManager};

/// Outcome of a merge attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    /// Fast-forwarded trunk to the run branch head
    Merged { commit: String },
    /// Rebase hit conflicts; nothing was changed on trunk
    Conflicted { paths: Vec<String> },
}

/// Rebase the run's branch onto trunk, then fast-forward trunk to it.
pub async fn merge_to_trunk(manager: &WorktreeManager, run_id: &str) -> Result<MergeResult, WorktreeError> {
    let path = manager.worktree_path(run_id);
    if !path.exists() {
        return Err(WorktreeError::NotFound(run_id.to_string()));
    }

    match manager.rebase_on_trunk(&path).await {
        Ok(()) => {}
        Err(WorktreeError::RebaseConflict(paths)) => {
            warn!(run_id, ?paths, "Merge blocked by rebase conflicts");
            return Ok(MergeResult::Conflicted { paths });
        }
        Err(e) => return Err(e),
    }

    let branch = manager.branch_name(run_id);
    let trunk = manager.config().trunk.clone();
    let repo_root = manager.config().repo_root.clone();

    // Fast-forward trunk; the rebase guarantees this cannot conflict
    let output = tokio::process::Command::new("git")
        .args(["fetch", ".", &format!("{branch}:{trunk}")])
        .current_dir(&repo_root)
        .output()
        .await
        .map_err(|e| WorktreeError::GitError(e.to_string()))?;

    if !output.status.success() {
        return Err(WorktreeError::GitError(
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }

    let commit = manager.rev_parse(&repo_root, &trunk).await?;
    info!(run_id, commit, "Merged run branch into trunk");
    Ok(MergeResult::Merged { commit })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worktree::manager::WorktreeConfig;
    use tempfile::TempDir;

    async fn sh_git(dir: &std::path::Path, args: &[&str]) {
        let status = tokio::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .unwrap();
        assert!(status.status.success(), "git {args:?} failed");
    }

    async fn scratch() -> (TempDir, WorktreeManager) {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        tokio::fs::create_dir_all(&repo).await.unwrap();
        sh_git(&repo, &["init", "-b", "main"]).await;
        sh_git(&repo, &["config", "user.email", "hd@test"]).await;
        sh_git(&repo, &["config", "user.name", "hd"]).await;
        tokio::fs::write(repo.join("base.txt"), "base\n").await.unwrap();
        sh_git(&repo, &["add", "-A"]).await;
        sh_git(&repo, &["commit", "-m", "init"]).await;

        let manager = WorktreeManager::new(WorktreeConfig {
            base_dir: temp.path().join("worktrees"),
            repo_root: repo,
            branch_prefix: "hive".to_string(),
            trunk: "main".to_string(),
        });
        (temp, manager)
    }

    #[tokio::test]
    async fn test_clean_merge_fast_forwards_trunk() {
        let (_temp, manager) = scratch().await;
        let info = manager.create("run-1").await.unwrap();

        tokio::fs::write(info.path.join("feature.txt"), "done\n").await.unwrap();
        manager.commit_all(&info.path, "feature").await.unwrap();

        let result = merge_to_trunk(&manager, "run-1").await.unwrap();
        assert!(matches!(result, MergeResult::Merged { .. }));

        let trunk_head = manager
            .rev_parse(&manager.config().repo_root, "main")
            .await
            .unwrap();
        let branch_head = manager.rev_parse(&info.path, "HEAD").await.unwrap();
        assert_eq!(trunk_head, branch_head);
    }

    #[tokio::test]
    async fn test_conflicting_merge_reports_paths() {
        let (_temp, manager) = scratch().await;
        let info = manager.create("run-1").await.unwrap();

        // Diverge: trunk and branch both edit base.txt
        let repo = manager.config().repo_root.clone();
        tokio::fs::write(repo.join("base.txt"), "trunk change\n").await.unwrap();
        sh_git(&repo, &["add", "-A"]).await;
        sh_git(&repo, &["commit", "-m", "trunk edit"]).await;

        tokio::fs::write(info.path.join("base.txt"), "branch change\n").await.unwrap();
        manager.commit_all(&info.path, "branch edit").await.unwrap();

        let result = merge_to_trunk(&manager, "run-1").await.unwrap();
        match result {
            MergeResult::Conflicted { paths } => assert_eq!(paths, vec!["base.txt".to_string()]),
            other => panic!("expected conflict, got {other:?}"),
        }
    }
}
