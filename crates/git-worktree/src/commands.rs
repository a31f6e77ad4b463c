//! Git command execution utilities

use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{Result, WorktreeError};

/// Output from a git command
#[derive(Debug)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Execute a git command in the specified directory
pub async fn git_command(repo_path: &Path, args: &[&str]) -> Result<GitOutput> {
    debug!("Running git {:?} in {:?}", args, repo_path);

    let output = Command::new("git")
        .args(args)
        .current_dir(repo_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| WorktreeError::git_failed_with_source("Failed to execute git command", e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    trace!("git stdout: {}", stdout);
    if !stderr.is_empty() {
        trace!("git stderr: {}", stderr);
    }

    Ok(GitOutput {
        stdout,
        stderr,
        success: output.status.success(),
    })
}

/// Execute a git command and return error if it fails
pub async fn git_command_checked(repo_path: &Path, args: &[&str]) -> Result<String> {
    let output = git_command(repo_path, args).await?;

    if !output.success {
        return Err(WorktreeError::git_failed(format!(
            "git {} failed: {}",
            args.join(" "),
            output.stderr.trim()
        )));
    }

    Ok(output.stdout)
}

/// Borrow a path as a git argument
pub(crate) fn path_arg(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| WorktreeError::InvalidPath {
        path: path.to_path_buf(),
    })
}

/// Check if a path is inside a git repository
pub async fn is_git_repository(path: &Path) -> Result<bool> {
    let output = git_command(path, &["rev-parse", "--git-dir"]).await?;
    Ok(output.success)
}

/// Check if a branch exists
pub async fn branch_exists(repo_path: &Path, branch: &str) -> Result<bool> {
    let output = git_command(
        repo_path,
        &["rev-parse", "--verify", &format!("refs/heads/{}", branch)],
    )
    .await?;
    Ok(output.success)
}

/// Check if a ref (branch, tag or commit) resolves
pub async fn ref_exists(repo_path: &Path, reference: &str) -> Result<bool> {
    let output = git_command(
        repo_path,
        &["rev-parse", "--verify", "--quiet", &format!("{}^{{commit}}", reference)],
    )
    .await?;
    Ok(output.success)
}

/// Get the commit hash at HEAD of a checkout
pub async fn current_head(path: &Path) -> Result<String> {
    let output = git_command_checked(path, &["rev-parse", "HEAD"]).await?;
    Ok(output.trim().to_string())
}

/// Whether the index holds staged changes
pub async fn has_staged_changes(path: &Path) -> Result<bool> {
    // `diff --cached --quiet` exits 1 when there are differences
    let output = git_command(path, &["diff", "--cached", "--quiet"]).await?;
    Ok(!output.success)
}

/// Delete a branch
pub async fn delete_branch(repo_path: &Path, branch: &str, force: bool) -> Result<()> {
    let flag = if force { "-D" } else { "-d" };
    git_command_checked(repo_path, &["branch", flag, branch]).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) async fn init_test_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        git_command_checked(dir.path(), &["init"]).await.unwrap();
        git_command_checked(dir.path(), &["config", "user.email", "test@test.com"])
            .await
            .unwrap();
        git_command_checked(dir.path(), &["config", "user.name", "Test"])
            .await
            .unwrap();

        // Create initial commit on main branch
        git_command_checked(dir.path(), &["checkout", "-b", "main"])
            .await
            .ok(); // Ignore error if already on main

        let test_file = dir.path().join("test.txt");
        tokio::fs::write(&test_file, "test content").await.unwrap();
        git_command_checked(dir.path(), &["add", "."])
            .await
            .unwrap();
        git_command_checked(dir.path(), &["commit", "-m", "Initial commit"])
            .await
            .unwrap();

        dir
    }

    #[tokio::test]
    async fn test_is_git_repository() {
        let dir = init_test_repo().await;
        assert!(is_git_repository(dir.path()).await.unwrap());

        let non_git = TempDir::new().unwrap();
        assert!(!is_git_repository(non_git.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_branch_and_ref_exists() {
        let dir = init_test_repo().await;

        assert!(branch_exists(dir.path(), "main").await.unwrap());
        assert!(ref_exists(dir.path(), "HEAD").await.unwrap());
        assert!(!branch_exists(dir.path(), "nonexistent").await.unwrap());
        assert!(!ref_exists(dir.path(), "nonexistent").await.unwrap());
    }

    #[tokio::test]
    async fn test_staged_changes() {
        let dir = init_test_repo().await;
        assert!(!has_staged_changes(dir.path()).await.unwrap());

        tokio::fs::write(dir.path().join("new.txt"), "x").await.unwrap();
        git_command_checked(dir.path(), &["add", "-A"]).await.unwrap();
        assert!(has_staged_changes(dir.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_current_head_is_sha() {
        let dir = init_test_repo().await;
        let head = current_head(dir.path()).await.unwrap();
        assert_eq!(head.len(), 40);
        assert!(head.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
