//! Worktree management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::commands::{
    branch_exists, current_head, delete_branch, git_command, git_command_checked,
    has_staged_changes, is_git_repository, path_arg, ref_exists,
};
use crate::error::{Result, WorktreeError};

/// Status of a worktree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    /// Worktree is active and usable
    Active,
    /// Worktree is locked
    Locked,
    /// Worktree is prunable (orphaned)
    Prunable,
}

/// Represents a Git worktree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    /// Absolute path to the worktree
    pub path: PathBuf,
    /// Branch name associated with this worktree
    pub branch: String,
    /// Commit hash at the HEAD of this worktree
    pub head: String,
    /// Status of the worktree
    pub status: WorktreeStatus,
    /// Whether this is the main worktree
    pub is_main: bool,
}

/// Configuration for WorktreeManager
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Directory where worktrees will be created, relative to the repository
    pub worktree_dir: PathBuf,
    /// Ref new branches start from
    pub base_ref: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            worktree_dir: PathBuf::from(".worktrees"),
            base_ref: "main".to_string(),
        }
    }
}

/// Manages Git worktrees for task isolation
#[derive(Debug)]
pub struct WorktreeManager {
    /// Path to the main repository
    repo_path: PathBuf,
    /// Configuration
    config: WorktreeConfig,
}

impl WorktreeManager {
    /// Create a new WorktreeManager for the given repository
    pub async fn new(repo_path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_config(repo_path, WorktreeConfig::default()).await
    }

    /// Create a new WorktreeManager with custom configuration
    pub async fn with_config(
        repo_path: impl Into<PathBuf>,
        config: WorktreeConfig,
    ) -> Result<Self> {
        let repo_path = repo_path.into();

        if !is_git_repository(&repo_path).await? {
            return Err(WorktreeError::NotAGitRepository {
                path: repo_path.clone(),
            });
        }

        Ok(Self { repo_path, config })
    }

    /// Get the repository path
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Get the worktree directory
    pub fn worktree_dir(&self) -> PathBuf {
        self.repo_path.join(&self.config.worktree_dir)
    }

    /// Ref new worktree branches start from
    pub fn base_ref(&self) -> &str {
        &self.config.base_ref
    }

    /// Create a worktree at `path` on a new branch cut from the configured base ref
    pub async fn create_at(&self, branch: &str, path: &Path) -> Result<Worktree> {
        if branch_exists(&self.repo_path, branch).await? {
            return Err(WorktreeError::BranchExists {
                branch: branch.to_string(),
            });
        }

        let base_ref = self.config.base_ref.as_str();
        if !ref_exists(&self.repo_path, base_ref).await? {
            return Err(WorktreeError::BranchNotFound {
                branch: base_ref.to_string(),
            });
        }

        let worktree_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.repo_path.join(path)
        };

        if worktree_path.exists() {
            return Err(WorktreeError::WorktreeExists {
                path: worktree_path,
            });
        }

        if let Some(parent) = worktree_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!(
            "Creating worktree at {:?} on branch {} from {}",
            worktree_path, branch, base_ref
        );

        git_command_checked(
            &self.repo_path,
            &[
                "worktree",
                "add",
                "-b",
                branch,
                path_arg(&worktree_path)?,
                base_ref,
            ],
        )
        .await?;

        let head = current_head(&worktree_path).await?;

        Ok(Worktree {
            path: worktree_path,
            branch: branch.to_string(),
            head,
            status: WorktreeStatus::Active,
            is_main: false,
        })
    }

    /// Create a worktree named `name` inside the worktree directory
    pub async fn create(&self, name: &str, branch: &str) -> Result<Worktree> {
        let path = self.worktree_dir().join(name);
        self.create_at(branch, &path).await
    }

    /// List all worktrees
    pub async fn list(&self) -> Result<Vec<Worktree>> {
        let output =
            git_command_checked(&self.repo_path, &["worktree", "list", "--porcelain"]).await?;

        let mut worktrees = Vec::new();
        let mut current_worktree: Option<Worktree> = None;

        for line in output.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                if let Some(wt) = current_worktree.take() {
                    worktrees.push(wt);
                }

                current_worktree = Some(Worktree {
                    path: PathBuf::from(path),
                    branch: String::new(),
                    head: String::new(),
                    status: WorktreeStatus::Active,
                    is_main: false,
                });
            } else if let Some(ref mut wt) = current_worktree {
                if let Some(head) = line.strip_prefix("HEAD ") {
                    wt.head = head.to_string();
                } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
                    wt.branch = branch.to_string();
                } else if line == "bare" {
                    wt.is_main = true;
                } else if line.starts_with("locked") {
                    wt.status = WorktreeStatus::Locked;
                } else if line.starts_with("prunable") {
                    wt.status = WorktreeStatus::Prunable;
                }
            }
        }

        if let Some(wt) = current_worktree {
            worktrees.push(wt);
        }

        // The first entry is always the primary working directory
        if let Some(first) = worktrees.first_mut() {
            first.is_main = true;
        }

        Ok(worktrees)
    }

    /// Get a specific worktree by path
    pub async fn get(&self, path: &Path) -> Result<Option<Worktree>> {
        let wanted = canonical(path).await;
        let worktrees = self.list().await?;
        for wt in worktrees {
            if canonical(&wt.path).await == wanted {
                return Ok(Some(wt));
            }
        }
        Ok(None)
    }

    /// Remove a worktree
    ///
    /// # Arguments
    /// * `path` - Path to the worktree to remove
    /// * `force` - Force removal even if there are uncommitted changes
    /// * `delete_branch` - Also delete the associated branch
    pub async fn remove(&self, path: &Path, force: bool, delete_branch_flag: bool) -> Result<()> {
        let worktree = self
            .get(path)
            .await?
            .ok_or_else(|| WorktreeError::WorktreeNotFound {
                path: path.to_path_buf(),
            })?;

        if worktree.is_main {
            return Err(WorktreeError::git_failed("Cannot remove the main worktree"));
        }

        info!("Removing worktree at {:?}", path);

        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path_arg(&worktree.path)?);

        git_command_checked(&self.repo_path, &args).await?;

        if delete_branch_flag && !worktree.branch.is_empty() {
            debug!("Deleting branch {}", worktree.branch);
            if let Err(e) = delete_branch(&self.repo_path, &worktree.branch, force).await {
                warn!("Failed to delete branch {}: {}", worktree.branch, e);
            }
        }

        Ok(())
    }

    /// Check if there are uncommitted changes in a worktree
    pub async fn has_uncommitted_changes(&self, worktree_path: &Path) -> Result<bool> {
        let output = git_command(worktree_path, &["status", "--porcelain"]).await?;
        Ok(!output.stdout.trim().is_empty())
    }

    /// Stage and commit everything in a worktree.
    ///
    /// Returns the new commit hash, or `None` when there was nothing to commit.
    pub async fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<Option<String>> {
        git_command_checked(worktree_path, &["add", "-A"]).await?;

        if !has_staged_changes(worktree_path).await? {
            debug!("Nothing to commit in {:?}", worktree_path);
            return Ok(None);
        }

        git_command_checked(worktree_path, &["commit", "--no-verify", "-m", message]).await?;

        let sha = current_head(worktree_path).await?;
        info!("Committed {} in {:?}", sha, worktree_path);
        Ok(Some(sha))
    }
}

/// Resolve symlinks (e.g. /tmp on macOS) so paths from git compare equal
async fn canonical(path: &Path) -> PathBuf {
    tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf())
}
