//! Git Worktree management library
//!
//! This crate provides functionality for managing Git worktrees,
//! giving every worker its own checkout and branch.

mod commands;
mod error;
mod worktree;

pub use error::{Result, WorktreeError};
pub use worktree::{Worktree, WorktreeConfig, WorktreeManager, WorktreeStatus};
