use std::path::Path;

use git2::Repository;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum GitError {
    #[error(transparent)]
    Git2(#[from] git2::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Not a git repository: {0}")]
    InvalidRepository(String),
    #[error("Branch not found: {0}")]
    BranchNotFound(String),
    #[error("git {args} failed: {stderr}")]
    CommandFailed { args: String, stderr: String },
}

/// Repository introspection via libgit2. Mutating worktree commands go
/// through [`GitCli`]; libgit2's worktree support does not cover prune
/// semantics the same way the CLI does.
pub struct GitService;

impl GitService {
    pub fn new() -> Self {
        Self
    }

    pub fn open_repo(&self, repo_path: &Path) -> Result<Repository, GitError> {
        Repository::open(repo_path)
            .map_err(|_| GitError::InvalidRepository(repo_path.display().to_string()))
    }

    /// Validates that `repo_path` is a repository with `branch` present.
    pub fn ensure_branch_exists(&self, repo_path: &Path, branch: &str) -> Result<(), GitError> {
        let repo = self.open_repo(repo_path)?;
        repo.find_branch(branch, git2::BranchType::Local)
            .map_err(|_| GitError::BranchNotFound(branch.to_string()))?;
        Ok(())
    }

    pub fn branch_exists(&self, repo_path: &Path, branch: &str) -> Result<bool, GitError> {
        let repo = self.open_repo(repo_path)?;
        Ok(repo.find_branch(branch, git2::BranchType::Local).is_ok())
    }
}

impl Default for GitService {
    fn default() -> Self {
        Self::new()
    }
}

/// Thin async wrapper over the `git` binary for worktree lifecycle.
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&self, repo_path: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(repo_path)
            .output()
            .await?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// `git worktree add -b <branch> <path> <base>`: new branch off `base`,
    /// checked out at `path`.
    pub async fn worktree_add(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        branch: &str,
        base_branch: &str,
    ) -> Result<(), GitError> {
        let path = worktree_path.display().to_string();
        self.run(
            repo_path,
            &["worktree", "add", "-b", branch, &path, base_branch],
        )
        .await?;
        Ok(())
    }

    /// Remove the worktree directory and prune its administrative entry.
    /// Already-gone trees are not an error; the prune covers them.
    pub async fn worktree_remove(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
    ) -> Result<(), GitError> {
        let path = worktree_path.display().to_string();
        if let Err(e) = self
            .run(repo_path, &["worktree", "remove", "--force", &path])
            .await
        {
            tracing::debug!("worktree remove failed ({e}), falling back to prune");
        }
        self.run(repo_path, &["worktree", "prune"]).await?;
        Ok(())
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}
