//! Task tracker trait
//!
//! The narrow interface the orchestrator uses to read the backlog and
//! move tasks between states. Storage format is up to the implementation.

use async_trait::async_trait;

use super::model::Task;
use crate::Result;

/// Tracker interface for claiming and completing tasks
#[async_trait]
pub trait TaskTracker: Send + Sync {
    /// Add a task to the backlog
    async fn create(&self, task: Task) -> Result<Task>;

    /// Get a task by ID
    async fn get(&self, id: &str) -> Result<Option<Task>>;

    /// List open tasks in a stable order (most urgent first)
    async fn list_open(&self) -> Result<Vec<Task>>;

    /// Take an exclusive hold on an open task.
    ///
    /// Returns `false` when the task is no longer open. Implementations must
    /// make this atomic: two concurrent claims never both succeed.
    async fn claim(&self, id: &str) -> Result<bool>;

    /// Mark a claimed task as done
    async fn complete(&self, id: &str) -> Result<Task>;

    /// Return a claimed task to the backlog
    async fn reopen(&self, id: &str) -> Result<Task>;
}
