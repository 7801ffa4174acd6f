//! Git operations for the hub.
//!
//! All repository mutation funnels through one `GitRepo`, which holds an
//! internal writer lock so commits and branch operations never
//! interleave. Git itself is driven through the `git` binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::RepoError;

const HUB_AUTHOR: &str = "mergeflow-hub <hub@mergeflow.local>";

/// Result of attempting to merge one agent branch.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged { branch: String },
    /// Merge aborted; the branch is left intact for the operator.
    Conflicted {
        branch: String,
        conflicting_paths: Vec<String>,
    },
}

/// Serialized interface to the working repository.
#[derive(Clone)]
pub struct GitRepo {
    workdir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl GitRepo {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Branch naming for degraded-mode agent work.
    pub fn agent_branch(agent_id: &str, pr_id: &str) -> String {
        format!("agent-{agent_id}-{pr_id}")
    }

    async fn run(&self, args: &[&str]) -> Result<String, RepoError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.workdir)
            .args(args)
            .output()
            .await
            .map_err(|e| RepoError::git(args.first().copied().unwrap_or("git"), e.to_string()))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(RepoError::git(
                args.first().copied().unwrap_or("git"),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    /// Run git and return only whether it exited zero.
    async fn run_ok(&self, args: &[&str]) -> Result<bool, RepoError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.workdir)
            .args(args)
            .output()
            .await
            .map_err(|e| RepoError::git(args.first().copied().unwrap_or("git"), e.to_string()))?;
        Ok(output.status.success())
    }

    pub async fn is_repo(&self) -> bool {
        self.run_ok(&["rev-parse", "--is-inside-work-tree"])
            .await
            .unwrap_or(false)
    }

    /// Stage `paths` and commit as the hub. A clean index is a no-op.
    pub async fn commit_paths(&self, paths: &[&str], message: &str) -> Result<bool, RepoError> {
        let _guard = self.write_lock.lock().await;

        let mut add_args = vec!["add", "--"];
        add_args.extend_from_slice(paths);
        self.run(&add_args).await?;

        // Exit 0 means nothing staged.
        if self.run_ok(&["diff", "--cached", "--quiet"]).await? {
            return Ok(false);
        }

        self.run(&["commit", "--author", HUB_AUTHOR, "-m", message])
            .await?;
        tracing::info!(%message, "committed cold state");
        Ok(true)
    }

    pub async fn current_branch(&self) -> Result<String, RepoError> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    /// Create a branch at HEAD; an existing branch of that name is fine.
    pub async fn create_branch(&self, name: &str) -> Result<(), RepoError> {
        let _guard = self.write_lock.lock().await;
        match self.run(&["branch", name]).await {
            Ok(_) => Ok(()),
            Err(RepoError::Git { detail, .. }) if detail.contains("already exists") => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn checkout(&self, name: &str) -> Result<(), RepoError> {
        let _guard = self.write_lock.lock().await;
        self.run(&["checkout", name]).await?;
        Ok(())
    }

    /// Branches created by degraded-mode agents.
    pub async fn list_agent_branches(&self) -> Result<Vec<String>, RepoError> {
        let raw = self
            .run(&[
                "branch",
                "--list",
                "agent-*",
                "--format",
                "%(refname:short)",
            ])
            .await?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Attempt a merge; on conflict, collect the conflicting paths and
    /// abort, leaving the branch for the operator.
    pub async fn merge_branch(&self, branch: &str) -> Result<MergeOutcome, RepoError> {
        let _guard = self.write_lock.lock().await;

        if self
            .run_ok(&["merge", "--no-ff", "--no-edit", branch])
            .await?
        {
            return Ok(MergeOutcome::Merged {
                branch: branch.to_string(),
            });
        }

        let conflicting = self
            .run(&["diff", "--name-only", "--diff-filter=U"])
            .await
            .map(|raw| {
                raw.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        if !self.run_ok(&["merge", "--abort"]).await? {
            tracing::warn!(%branch, "merge --abort failed after conflict");
        }

        Ok(MergeOutcome::Conflicted {
            branch: branch.to_string(),
            conflicting_paths: conflicting,
        })
    }

    pub async fn delete_branch(&self, name: &str) -> Result<(), RepoError> {
        let _guard = self.write_lock.lock().await;
        self.run(&["branch", "-D", name]).await?;
        Ok(())
    }

    /// Paths with uncommitted changes (staged or not).
    pub async fn dirty_paths(&self) -> Result<Vec<String>, RepoError> {
        let raw = self.run(&["status", "--porcelain"]).await?;
        Ok(raw
            .lines()
            .filter_map(|line| {
                if line.len() > 3 {
                    Some(line[3..].trim().to_string())
                } else {
                    None
                }
            })
            .collect())
    }

    /// Whether any of `expected` paths carries uncommitted changes.
    /// Drives the broken-vs-ready decision when reclaiming crashed work.
    pub async fn has_partial_changes(&self, expected: &[String]) -> Result<bool, RepoError> {
        let dirty = self.dirty_paths().await?;
        Ok(dirty.iter().any(|p| expected.iter().any(|e| e == p)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo(dir: &Path) -> GitRepo {
        let repo = GitRepo::new(dir);
        repo.run(&["init", "-q", "-b", "main"]).await.unwrap();
        repo.run(&["config", "user.email", "test@test"]).await.unwrap();
        repo.run(&["config", "user.name", "test"]).await.unwrap();
        repo
    }

    async fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_agent_branch_naming() {
        assert_eq!(
            GitRepo::agent_branch("worker-agent-2", "PR-007"),
            "agent-worker-agent-2-PR-007"
        );
    }

    #[tokio::test]
    async fn test_commit_paths_and_noop() {
        if !git_available().await {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path()).await;

        std::fs::write(dir.path().join("plan.md"), "pr_id: PR-001\ncold_state: new\n").unwrap();
        assert!(repo.commit_paths(&["plan.md"], "seed plan").await.unwrap());

        // Unchanged file: commit is a no-op.
        assert!(!repo.commit_paths(&["plan.md"], "again").await.unwrap());
    }

    #[tokio::test]
    async fn test_branch_merge_conflict_reported() {
        if !git_available().await {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path()).await;

        std::fs::write(dir.path().join("x.txt"), "base\n").unwrap();
        repo.commit_paths(&["x.txt"], "base").await.unwrap();

        let branch = GitRepo::agent_branch("worker-agent-1", "PR-001");
        repo.create_branch(&branch).await.unwrap();
        repo.checkout(&branch).await.unwrap();
        std::fs::write(dir.path().join("x.txt"), "agent\n").unwrap();
        repo.commit_paths(&["x.txt"], "agent change").await.unwrap();

        repo.checkout("main").await.unwrap();
        std::fs::write(dir.path().join("x.txt"), "hub\n").unwrap();
        repo.commit_paths(&["x.txt"], "hub change").await.unwrap();

        match repo.merge_branch(&branch).await.unwrap() {
            MergeOutcome::Conflicted {
                conflicting_paths, ..
            } => {
                assert_eq!(conflicting_paths, vec!["x.txt".to_string()]);
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        // Branch survives for the operator.
        assert!(repo
            .list_agent_branches()
            .await
            .unwrap()
            .contains(&branch));
    }

    #[tokio::test]
    async fn test_clean_merge() {
        if !git_available().await {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path()).await;

        std::fs::write(dir.path().join("x.txt"), "base\n").unwrap();
        repo.commit_paths(&["x.txt"], "base").await.unwrap();

        let branch = GitRepo::agent_branch("worker-agent-1", "PR-001");
        repo.create_branch(&branch).await.unwrap();
        repo.checkout(&branch).await.unwrap();
        std::fs::write(dir.path().join("y.txt"), "new\n").unwrap();
        repo.commit_paths(&["y.txt"], "agent work").await.unwrap();

        repo.checkout("main").await.unwrap();
        assert_eq!(
            repo.merge_branch(&branch).await.unwrap(),
            MergeOutcome::Merged { branch }
        );
    }

    #[tokio::test]
    async fn test_partial_change_detection() {
        if !git_available().await {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path()).await;

        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        repo.commit_paths(&["a.txt"], "base").await.unwrap();

        std::fs::write(dir.path().join("a.txt"), "two\n").unwrap();
        assert!(repo
            .has_partial_changes(&["a.txt".to_string()])
            .await
            .unwrap());
        assert!(!repo
            .has_partial_changes(&["other.txt".to_string()])
            .await
            .unwrap());
    }
}
