//! Bounded pool of workers draining the task backlog

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use git_worktree::WorktreeManager;
use parking_lot::Mutex;
use swarm_core::task::{Task, TaskTracker};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::Stream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, ParallelConfig};
use crate::engine::{CommitHook, EngineBinding, ExecutionEngine, TaskEngine};
use crate::error::{AgentRunnerError, Result};
use crate::event::{
    ParallelEvent, ParallelSummary, TaskResult, WorkerDisplayState, WorkerResult,
};
use crate::listener::{ListenerRegistry, Subscription};
use crate::plugin::AgentPlugin;
use crate::sandbox::SandboxMode;
use crate::worker::{Worker, WorkerConfig};

/// Creates and removes isolated workspaces
#[async_trait]
pub trait WorkspaceAllocator: Send + Sync {
    /// Check out a new branch at `base_path`, returning the workspace path
    async fn create_worktree(&self, branch: &str, base_path: &Path) -> Result<PathBuf>;

    async fn remove_worktree(&self, path: &Path) -> Result<()>;
}

#[async_trait]
impl WorkspaceAllocator for WorktreeManager {
    async fn create_worktree(&self, branch: &str, base_path: &Path) -> Result<PathBuf> {
        Ok(self.create_at(branch, base_path).await?.path)
    }

    /// Branches are kept so finished work can still be merged
    async fn remove_worktree(&self, path: &Path) -> Result<()> {
        Ok(self.remove(path, true, false).await?)
    }
}

/// Builds a bound engine for one task in one workspace
pub trait EngineFactory: Send + Sync {
    fn create(&self, task: &Task, workspace: &Path) -> Result<Arc<dyn TaskEngine>>;
}

/// Engines driving one agent plugin
pub struct PluginEngineFactory {
    plugin: Arc<dyn AgentPlugin>,
    config: EngineConfig,
    sandbox: SandboxMode,
    committer: Option<Arc<dyn CommitHook>>,
}

impl PluginEngineFactory {
    pub fn new(plugin: Arc<dyn AgentPlugin>, config: EngineConfig) -> Self {
        Self {
            plugin,
            config,
            sandbox: SandboxMode::Off,
            committer: None,
        }
    }

    pub fn with_sandbox(mut self, sandbox: SandboxMode) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_committer(mut self, committer: Arc<dyn CommitHook>) -> Self {
        self.committer = Some(committer);
        self
    }
}

impl EngineFactory for PluginEngineFactory {
    fn create(&self, task: &Task, workspace: &Path) -> Result<Arc<dyn TaskEngine>> {
        let mut binding = EngineBinding::new(Arc::clone(&self.plugin), task.clone(), workspace)
            .with_sandbox(self.sandbox);
        if let Some(committer) = &self.committer {
            binding = binding.with_committer(Arc::clone(committer));
        }
        let engine = ExecutionEngine::new(self.config.clone());
        engine.initialize(binding)?;
        Ok(Arc::new(engine))
    }
}

/// What a finished worker future hands back to the pool
struct Finished {
    worker_id: String,
    task: Task,
    branch_name: String,
    workspace: PathBuf,
    result: Result<WorkerResult>,
}

/// Runs up to `max_workers` tasks at once, each in its own worktree
pub struct ParallelOrchestrator {
    config: ParallelConfig,
    tracker: Arc<dyn TaskTracker>,
    allocator: Arc<dyn WorkspaceAllocator>,
    factory: Arc<dyn EngineFactory>,
    workers: Mutex<HashMap<String, Arc<Worker>>>,
    completed_workspaces: Mutex<Vec<PathBuf>>,
    cancelled: AtomicBool,
    running: AtomicBool,
    next_worker: AtomicU64,
    listeners: ListenerRegistry<ParallelEvent>,
}

impl ParallelOrchestrator {
    pub fn new(
        config: ParallelConfig,
        tracker: Arc<dyn TaskTracker>,
        allocator: Arc<dyn WorkspaceAllocator>,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        Self {
            config,
            tracker,
            allocator,
            factory,
            workers: Mutex::new(HashMap::new()),
            completed_workspaces: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            next_worker: AtomicU64::new(1),
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn config(&self) -> &ParallelConfig {
        &self.config
    }

    pub fn subscribe(&self, listener: impl Fn(&ParallelEvent) + Send + Sync + 'static) -> Subscription {
        self.listeners.subscribe(listener)
    }

    /// Merged events of every worker, in arrival order
    pub fn event_stream(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.listeners.subscribe(move |event: &ParallelEvent| {
            let _ = tx.send(event.clone());
        });
        EventStream {
            inner: UnboundedReceiverStream::new(rx),
            subscription,
        }
    }

    /// Drain the backlog; resolves once no task is left and every worker is done
    pub async fn run(&self) -> Result<ParallelSummary> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(AgentRunnerError::AlreadyRunning {
                component: "orchestrator",
            });
        }
        self.cancelled.store(false, Ordering::Release);

        let started = Instant::now();
        let max_workers = self.config.max_workers.max(1);
        let mut attempted = HashSet::new();
        let mut in_flight: JoinSet<Finished> = JoinSet::new();
        let mut summary = ParallelSummary::default();

        info!("Starting parallel run with up to {} workers", max_workers);

        loop {
            while !self.is_cancelled() && in_flight.len() < max_workers {
                let Some(task) = self.next_task(&attempted).await else {
                    break;
                };
                attempted.insert(task.id.clone());
                self.launch(task, &mut in_flight, &mut summary).await;
            }

            match in_flight.join_next().await {
                Some(Ok(finished)) => self.finish(finished, &mut summary).await,
                Some(Err(e)) => {
                    // Only reachable if the runtime aborts the task; panics
                    // are caught inside it
                    warn!("Worker task ended abnormally: {}", e);
                    summary.failed += 1;
                }
                None => break,
            }
        }

        summary.total_tasks = summary.results.len();
        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Parallel run finished: {} completed, {} failed, {} cancelled, {} commits",
            summary.completed, summary.failed, summary.cancelled, summary.total_commits
        );
        self.listeners.emit(&ParallelEvent::AllComplete {
            summary: summary.clone(),
        });
        self.running.store(false, Ordering::Release);
        Ok(summary)
    }

    /// First open task not yet tried in this run
    async fn next_task(&self, attempted: &HashSet<String>) -> Option<Task> {
        match self.tracker.list_open().await {
            Ok(tasks) => tasks.into_iter().find(|task| !attempted.contains(&task.id)),
            Err(e) => {
                warn!("Failed to list open tasks: {}", e);
                None
            }
        }
    }

    async fn launch(&self, task: Task, in_flight: &mut JoinSet<Finished>, summary: &mut ParallelSummary) {
        match self.tracker.claim(&task.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Task {} was claimed elsewhere", task.id);
                return;
            }
            Err(e) => {
                warn!("Failed to claim task {}: {}", task.id, e);
                return;
            }
        }

        let worker_id = format!("worker-{}", self.next_worker.fetch_add(1, Ordering::Relaxed));
        let suffix = Uuid::new_v4().simple().to_string();
        let dir_name = format!("{}-{}", task.slug(), &suffix[..8]);
        let branch_name = format!("{}{}", self.config.branch_prefix, dir_name);
        self.listeners.emit(&ParallelEvent::TaskClaimed {
            worker_id: worker_id.clone(),
            task_id: task.id.clone(),
        });

        let base_path = self.config.worktree_dir.join(&dir_name);
        let (workspace, worker) = match self.prepare(&worker_id, &task, &branch_name, &base_path).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("Could not prepare task {}: {}", task.id, e);
                let result = WorkerResult::failed(e.to_string());
                self.listeners.emit(&ParallelEvent::WorkerFailed {
                    worker_id: worker_id.clone(),
                    task_id: task.id.clone(),
                    result: result.clone(),
                });
                self.finish(
                    Finished {
                        worker_id,
                        task,
                        branch_name,
                        workspace: base_path,
                        result: Ok(result),
                    },
                    summary,
                )
                .await;
                return;
            }
        };

        // Registered before the cancel check so a concurrent stop() either
        // reaches this worker or is seen here
        self.workers.lock().insert(worker_id.clone(), Arc::clone(&worker));
        if self.is_cancelled() {
            info!("Run stopped while preparing task {}", task.id);
            self.workers.lock().remove(&worker_id);
            let result = WorkerResult::cancelled();
            self.listeners.emit(&ParallelEvent::WorkerFailed {
                worker_id: worker_id.clone(),
                task_id: task.id.clone(),
                result: result.clone(),
            });
            self.finish(
                Finished {
                    worker_id,
                    task,
                    branch_name,
                    workspace,
                    result: Ok(result),
                },
                summary,
            )
            .await;
            return;
        }

        let listeners = self.listeners.clone();
        let (wid, tid) = (worker_id.clone(), task.id.clone());
        let forward = worker.on(move |event| listeners.emit(&ParallelEvent::from_worker(&wid, &tid, event)));
        info!("{} took task {} on {}", worker_id, task.id, branch_name);

        let listeners = self.listeners.clone();
        in_flight.spawn(async move {
            let result = match AssertUnwindSafe(worker.start()).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let result = WorkerResult::failed(format!("worker panicked: {}", panic_message(&*panic)));
                    warn!("{} on task {}: {:?}", worker_id, task.id, result.error);
                    listeners.emit(&ParallelEvent::WorkerFailed {
                        worker_id: worker_id.clone(),
                        task_id: task.id.clone(),
                        result: result.clone(),
                    });
                    Ok(result)
                }
            };
            forward.unsubscribe();
            Finished {
                worker_id,
                task,
                branch_name,
                workspace,
                result,
            }
        });
    }

    /// Allocate the workspace and bind a fresh engine to a new worker
    async fn prepare(
        &self,
        worker_id: &str,
        task: &Task,
        branch_name: &str,
        base_path: &Path,
    ) -> Result<(PathBuf, Arc<Worker>)> {
        let workspace = self.allocator.create_worktree(branch_name, base_path).await?;
        let engine = self.factory.create(task, &workspace)?;
        let worker = Arc::new(Worker::new(WorkerConfig::new(
            worker_id,
            task.clone(),
            workspace.clone(),
            branch_name,
        )));
        worker.initialize(engine)?;
        Ok((workspace, worker))
    }

    async fn finish(&self, finished: Finished, summary: &mut ParallelSummary) {
        let Finished {
            worker_id,
            task,
            branch_name,
            workspace,
            result,
        } = finished;
        self.workers.lock().remove(&worker_id);

        let result = result.unwrap_or_else(|e| WorkerResult::failed(e.to_string()));
        if result.task_completed {
            if let Err(e) = self.tracker.complete(&task.id).await {
                warn!("Failed to complete task {}: {}", task.id, e);
            }
            self.completed_workspaces.lock().push(workspace);
        } else if let Err(e) = self.tracker.reopen(&task.id).await {
            warn!("Failed to reopen task {}: {}", task.id, e);
        }

        if result.is_cancelled() {
            summary.cancelled += 1;
        } else if result.task_completed {
            summary.completed += 1;
        } else {
            summary.failed += 1;
        }
        summary.total_commits += result.commit_count;
        summary.results.push(TaskResult {
            task_id: task.id,
            worker_id,
            branch_name,
            result,
        });
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn live_workers(&self) -> Vec<Arc<Worker>> {
        self.workers.lock().values().cloned().collect()
    }

    /// Stop claiming tasks and stop every live worker, waiting for all of them
    pub async fn stop(&self) {
        self.cancelled.store(true, Ordering::Release);
        let workers = self.live_workers();
        info!("Stopping {} workers", workers.len());
        join_all(workers.iter().map(|worker| worker.stop())).await;
    }

    pub fn pause_all(&self) {
        for worker in self.live_workers() {
            worker.pause();
        }
    }

    pub fn resume_all(&self) {
        for worker in self.live_workers() {
            worker.resume();
        }
    }

    /// Snapshots of the live workers, ordered by id
    pub fn display_states(&self) -> Vec<WorkerDisplayState> {
        let mut states: Vec<_> = self
            .live_workers()
            .iter()
            .map(|worker| worker.display_state())
            .collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    /// Remove the worktrees of completed tasks, returning how many went away
    pub async fn cleanup_worktrees(&self) -> usize {
        let workspaces = std::mem::take(&mut *self.completed_workspaces.lock());
        let mut removed = 0;
        for workspace in workspaces {
            match self.allocator.remove_worktree(&workspace).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove worktree {:?}: {}", workspace, e),
            }
        }
        removed
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

/// Stream of [`ParallelEvent`]s; dropping it unsubscribes
pub struct EventStream {
    inner: UnboundedReceiverStream<ParallelEvent>,
    subscription: Subscription,
}

impl Stream for EventStream {
    type Item = ParallelEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}
