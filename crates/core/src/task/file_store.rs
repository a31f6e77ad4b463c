//! File-based task tracker implementation
//!
//! Stores tasks as JSON in a file on disk.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

use super::model::{Task, TaskStatus};
use super::tracker::TaskTracker;
use crate::{Error, Result};

/// File-based task tracker using JSON
pub struct FileTaskTracker {
    /// Path to the JSON file
    path: PathBuf,
    /// In-memory cache of tasks
    cache: RwLock<HashMap<String, Task>>,
}

impl FileTaskTracker {
    /// Create a new FileTaskTracker
    ///
    /// If the file doesn't exist, it will be created on first write.
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cache = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            let tasks: Vec<Task> = serde_json::from_str(&content)?;
            tasks.into_iter().map(|t| (t.id.clone(), t)).collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            cache: RwLock::new(cache),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a snapshot of the cache to disk
    async fn persist(&self, cache: &HashMap<String, Task>) -> Result<()> {
        let mut tasks: Vec<&Task> = cache.values().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let content = serde_json::to_string_pretty(&tasks)?;

        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }

    /// Persist the cache with `task` applied, then swap it in
    ///
    /// The cache is left untouched when the write fails.
    async fn commit(&self, cache: &mut HashMap<String, Task>, task: Task) -> Result<()> {
        let mut next = cache.clone();
        next.insert(task.id.clone(), task);
        self.persist(&next).await?;
        *cache = next;
        Ok(())
    }

    /// Move a task from one status to another under the write lock
    async fn transition(&self, id: &str, from: &[TaskStatus], to: TaskStatus) -> Result<Task> {
        let mut cache = self.cache.write().await;
        let task = cache
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;

        if !from.contains(&task.status) {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from: task.status.to_string(),
                to: to.to_string(),
            });
        }

        let mut updated = task.clone();
        updated.status = to;
        updated.updated_at = Utc::now();
        self.commit(&mut cache, updated.clone()).await?;
        debug!("Task {} -> {}", id, to);
        Ok(updated)
    }
}

#[async_trait]
impl TaskTracker for FileTaskTracker {
    async fn create(&self, task: Task) -> Result<Task> {
        let mut cache = self.cache.write().await;
        if cache.contains_key(&task.id) {
            return Err(Error::InvalidInput(format!(
                "Task with ID {} already exists",
                task.id
            )));
        }
        self.commit(&mut cache, task.clone()).await?;
        Ok(task)
    }

    async fn get(&self, id: &str) -> Result<Option<Task>> {
        let cache = self.cache.read().await;
        Ok(cache.get(id).cloned())
    }

    async fn list_open(&self) -> Result<Vec<Task>> {
        let cache = self.cache.read().await;
        let mut tasks: Vec<Task> = cache
            .values()
            .filter(|t| t.status == TaskStatus::Open)
            .cloned()
            .collect();
        // Most urgent first, then oldest first, then id for a total order
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(tasks)
    }

    async fn claim(&self, id: &str) -> Result<bool> {
        // The whole check-and-set happens under one write guard
        let mut cache = self.cache.write().await;
        let Some(task) = cache.get(id) else {
            return Err(Error::TaskNotFound(id.to_string()));
        };
        if task.status != TaskStatus::Open {
            return Ok(false);
        }
        let mut claimed = task.clone();
        claimed.status = TaskStatus::InProgress;
        claimed.updated_at = Utc::now();
        self.commit(&mut cache, claimed).await?;
        debug!("Claimed task {}", id);
        Ok(true)
    }

    async fn complete(&self, id: &str) -> Result<Task> {
        self.transition(id, &[TaskStatus::InProgress, TaskStatus::Open], TaskStatus::Done)
            .await
    }

    async fn reopen(&self, id: &str) -> Result<Task> {
        self.transition(id, &[TaskStatus::InProgress, TaskStatus::Blocked], TaskStatus::Open)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPriority;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn create_test_tracker() -> (FileTaskTracker, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tasks.json");
        let tracker = FileTaskTracker::new(&path).await.unwrap();
        (tracker, temp_dir)
    }

    #[tokio::test]
    async fn test_create_and_get_task() {
        let (tracker, _temp) = create_test_tracker().await;

        let task = Task::new("Test task").with_description("A test description");
        let id = task.id.clone();
        tracker.create(task).await.unwrap();

        let retrieved = tracker.get(&id).await.unwrap().unwrap();
        assert_eq!(retrieved.title, "Test task");
        assert_eq!(retrieved.description, Some("A test description".to_string()));

        assert!(tracker.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_open_orders_by_priority_then_age() {
        let (tracker, _temp) = create_test_tracker().await;

        tracker.create(Task::new("low").with_id("a").with_priority(TaskPriority::Low)).await.unwrap();
        tracker.create(Task::new("high").with_id("b").with_priority(TaskPriority::High)).await.unwrap();
        tracker.create(Task::new("medium").with_id("c")).await.unwrap();
        tracker
            .create(Task::new("done").with_id("d").with_status(TaskStatus::Done))
            .await
            .unwrap();
        tracker
            .create(Task::new("blocked").with_id("e").with_status(TaskStatus::Blocked))
            .await
            .unwrap();

        let ids: Vec<String> = tracker.list_open().await.unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (tracker, _temp) = create_test_tracker().await;
        tracker.create(Task::new("only").with_id("t1")).await.unwrap();

        assert!(tracker.claim("t1").await.unwrap());
        assert!(!tracker.claim("t1").await.unwrap());

        let task = tracker.get("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(tracker.list_open().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let (tracker, _temp) = create_test_tracker().await;
        tracker.create(Task::new("contended").with_id("t1")).await.unwrap();
        let tracker = Arc::new(tracker);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move { tracker.claim("t1").await.unwrap() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_complete_and_reopen() {
        let (tracker, _temp) = create_test_tracker().await;
        tracker.create(Task::new("a").with_id("a")).await.unwrap();
        tracker.create(Task::new("b").with_id("b")).await.unwrap();

        tracker.claim("a").await.unwrap();
        tracker.claim("b").await.unwrap();

        let done = tracker.complete("a").await.unwrap();
        assert_eq!(done.status, TaskStatus::Done);

        let reopened = tracker.reopen("b").await.unwrap();
        assert_eq!(reopened.status, TaskStatus::Open);

        // Done tasks cannot be reopened
        let result = tracker.reopen("a").await;
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_claim_missing_task() {
        let (tracker, _temp) = create_test_tracker().await;
        let result = tracker.claim("nope").await;
        assert!(matches!(result, Err(Error::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_persistence_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tasks.json");

        {
            let tracker = FileTaskTracker::new(&path).await.unwrap();
            let task = Task::new("Persistent task")
                .with_id("p1")
                .with_priority(TaskPriority::High);
            tracker.create(task).await.unwrap();
            tracker.claim("p1").await.unwrap();
        }

        {
            let tracker = FileTaskTracker::new(&path).await.unwrap();
            let task = tracker.get("p1").await.unwrap().unwrap();
            assert_eq!(task.title, "Persistent task");
            assert_eq!(task.priority, TaskPriority::High);
            assert_eq!(task.status, TaskStatus::InProgress);
        }
    }

    #[tokio::test]
    async fn test_failed_write_leaves_cache_unchanged() {
        let (tracker, _temp) = create_test_tracker().await;
        tracker.create(Task::new("a").with_id("a")).await.unwrap();

        // A directory in place of the task file makes every write fail
        tokio::fs::remove_file(tracker.path()).await.unwrap();
        tokio::fs::create_dir(tracker.path()).await.unwrap();

        assert!(tracker.claim("a").await.is_err());
        let task = tracker.get("a").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Open);
        assert_eq!(tracker.list_open().await.unwrap().len(), 1);

        assert!(tracker.create(Task::new("b").with_id("b")).await.is_err());
        assert!(tracker.get("b").await.unwrap().is_none());

        // Once the file is writable again the claim goes through
        tokio::fs::remove_dir(tracker.path()).await.unwrap();
        assert!(tracker.claim("a").await.unwrap());
        assert!(tracker.complete("a").await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_task_error() {
        let (tracker, _temp) = create_test_tracker().await;

        let task = Task::new("Test task");
        tracker.create(task.clone()).await.unwrap();

        match tracker.create(task).await.unwrap_err() {
            Error::InvalidInput(msg) => assert!(msg.contains("already exists")),
            e => panic!("Expected InvalidInput error, got: {:?}", e),
        }
    }
}
