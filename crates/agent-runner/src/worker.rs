//! A worker owns one engine bound to one worktree and turns its events
//! into display snapshots and a terminal result

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use swarm_core::task::Task;
use tracing::{debug, info, warn};

use crate::engine::TaskEngine;
use crate::error::{AgentRunnerError, Result};
use crate::event::{
    DisplayEvent, EngineEvent, StopReason, WorkerDisplayState, WorkerEvent, WorkerResult,
    WorkerStatus,
};
use crate::listener::{ListenerRegistry, Subscription};

/// Immutable identity of a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    pub task: Task,
    pub worktree_path: PathBuf,
    pub branch_name: String,
    pub cwd: PathBuf,
}

impl WorkerConfig {
    /// Config whose working directory is the worktree itself
    pub fn new(
        id: impl Into<String>,
        task: Task,
        worktree_path: impl Into<PathBuf>,
        branch_name: impl Into<String>,
    ) -> Self {
        let worktree_path = worktree_path.into();
        Self {
            id: id.into(),
            task,
            cwd: worktree_path.clone(),
            worktree_path,
            branch_name: branch_name.into(),
        }
    }
}

/// Per-run accumulators, reset by every `start()`
#[derive(Debug, Default)]
struct RunState {
    commit_count: u32,
    commit_sha: Option<String>,
    current_iteration: u32,
    last_output: String,
    started_at: Option<Instant>,
    elapsed_ms: Option<u64>,
}

struct Shared {
    config: WorkerConfig,
    status: Mutex<WorkerStatus>,
    run: Mutex<RunState>,
    engine: Mutex<Option<Arc<dyn TaskEngine>>>,
    cancel_requested: AtomicBool,
    listeners: ListenerRegistry<WorkerEvent>,
    engine_listeners: ListenerRegistry<EngineEvent>,
}

impl Shared {
    fn set_status(&self, status: WorkerStatus) {
        *self.status.lock() = status;
    }

    fn display_state(&self) -> WorkerDisplayState {
        let status = *self.status.lock();
        let max_iterations = self
            .engine
            .lock()
            .as_ref()
            .map(|engine| engine.max_iterations())
            .unwrap_or_default();
        let run = self.run.lock();
        let elapsed_ms = run.elapsed_ms.unwrap_or_else(|| {
            run.started_at
                .map(|started| started.elapsed().as_millis() as u64)
                .unwrap_or_default()
        });

        WorkerDisplayState {
            id: self.config.id.clone(),
            status,
            task: self.config.task.clone(),
            current_iteration: run.current_iteration,
            max_iterations,
            last_output: run.last_output.clone(),
            elapsed_ms,
            commit_sha: run.commit_sha.clone(),
            worktree_path: self.config.worktree_path.clone(),
            branch_name: self.config.branch_name.clone(),
        }
    }

    /// Fold one engine event into the run state
    fn observe(&self, event: &EngineEvent) {
        self.engine_listeners.emit(event);

        {
            let mut run = self.run.lock();
            match event {
                EngineEvent::IterationStarted { iteration } => run.current_iteration = *iteration,
                EngineEvent::AgentOutput { event, .. } => {
                    if !matches!(event, DisplayEvent::ToolResult { .. }) {
                        run.last_output = event.summary();
                    }
                }
                EngineEvent::AutoCommitted { sha, .. } => {
                    run.commit_count += 1;
                    run.commit_sha = Some(sha.clone());
                }
                _ => {}
            }
        }

        match event {
            EngineEvent::Started { .. } if self.cancel_requested.load(Ordering::Acquire) => {
                // A stop that raced the engine's start
                if let Some(engine) = self.engine.lock().clone() {
                    engine.cancel();
                }
            }
            EngineEvent::Paused { .. } => self.set_status(WorkerStatus::Paused),
            EngineEvent::Resumed { .. } => self.set_status(WorkerStatus::Running),
            _ => {}
        }

        self.listeners.emit(&WorkerEvent::Progress {
            state: self.display_state(),
        });
    }
}

/// Runs one task in one worktree
pub struct Worker {
    shared: Arc<Shared>,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                status: Mutex::new(WorkerStatus::Idle),
                run: Mutex::new(RunState::default()),
                engine: Mutex::new(None),
                cancel_requested: AtomicBool::new(false),
                listeners: ListenerRegistry::new(),
                engine_listeners: ListenerRegistry::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.config.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.shared.config
    }

    pub fn status(&self) -> WorkerStatus {
        *self.shared.status.lock()
    }

    /// Bind the engine that `start()` will drive
    pub fn initialize(&self, engine: Arc<dyn TaskEngine>) -> Result<()> {
        if self.status().is_active() {
            return Err(AgentRunnerError::AlreadyRunning { component: "Worker" });
        }
        *self.shared.engine.lock() = Some(engine);
        Ok(())
    }

    /// Run the bound engine to completion.
    ///
    /// Only fails when no engine is bound or a run is already active;
    /// engine failures and cancellation come back as a [`WorkerResult`].
    /// A worker stopped before this call returns a cancelled result
    /// without starting the engine.
    pub async fn start(&self) -> Result<WorkerResult> {
        let shared = &self.shared;
        let engine = shared
            .engine
            .lock()
            .clone()
            .ok_or_else(|| AgentRunnerError::not_initialized("Worker"))?;

        let stopped_early = {
            let mut status = shared.status.lock();
            if status.is_active() {
                return Err(AgentRunnerError::AlreadyRunning { component: "Worker" });
            }
            let stopped = shared.cancel_requested.swap(false, Ordering::AcqRel);
            *status = if stopped {
                WorkerStatus::Cancelled
            } else {
                WorkerStatus::Running
            };
            stopped
        };
        *shared.run.lock() = RunState {
            started_at: Some(Instant::now()),
            elapsed_ms: stopped_early.then_some(0),
            ..RunState::default()
        };

        if stopped_early {
            info!("Worker {} was stopped before task {} began", self.id(), shared.config.task.id);
            let result = WorkerResult::cancelled();
            shared.listeners.emit(&WorkerEvent::Failed {
                result: result.clone(),
            });
            return Ok(result);
        }

        let observer = Arc::clone(shared);
        let subscription = engine.subscribe(Arc::new(move |event: &EngineEvent| observer.observe(event)));

        info!("Worker {} starting task {}", self.id(), shared.config.task.id);
        shared.listeners.emit(&WorkerEvent::Started {
            state: shared.display_state(),
        });

        let outcome = engine.start().await;
        subscription.unsubscribe();

        // The flag is read and cleared together with the final status so a
        // concurrent stop either lands in this run or sees it finished
        let mut result = {
            let mut status = shared.status.lock();
            let cancelled = shared.cancel_requested.swap(false, Ordering::AcqRel)
                || matches!(&outcome, Ok(summary) if summary.reason == StopReason::Cancelled);

            let (result, next) = match outcome {
                _ if cancelled => (WorkerResult::cancelled(), WorkerStatus::Cancelled),
                Ok(summary) => (
                    WorkerResult::completed(summary.task_completed, summary.iterations),
                    WorkerStatus::Completed,
                ),
                Err(e) => {
                    warn!("Worker {} failed: {}", self.id(), e);
                    (WorkerResult::failed(e.to_string()), WorkerStatus::Error)
                }
            };
            *status = next;
            result
        };

        {
            let mut run = shared.run.lock();
            result.commit_count = run.commit_count;
            result.commit_sha = run.commit_sha.clone();
            if result.iterations == 0 {
                result.iterations = run.current_iteration;
            }
            run.elapsed_ms = run
                .started_at
                .map(|started| started.elapsed().as_millis() as u64);
        }

        info!(
            "Worker {} finished: {:?} ({} commits)",
            self.id(),
            result.outcome,
            result.commit_count
        );
        let event = if result.success {
            WorkerEvent::Completed {
                result: result.clone(),
            }
        } else {
            WorkerEvent::Failed {
                result: result.clone(),
            }
        };
        shared.listeners.emit(&event);

        Ok(result)
    }

    /// Cancel the run.
    ///
    /// An idle worker is marked cancelled and its next `start()` returns
    /// without running. A worker that already finished keeps its status.
    pub async fn stop(&self) {
        let active = {
            let mut status = self.shared.status.lock();
            match *status {
                WorkerStatus::Idle => {
                    debug!("Worker {} stopped before it started", self.id());
                    self.shared.cancel_requested.store(true, Ordering::Release);
                    *status = WorkerStatus::Cancelled;
                    false
                }
                current if current.is_active() => {
                    self.shared.cancel_requested.store(true, Ordering::Release);
                    true
                }
                _ => false,
            }
        };
        if !active {
            return;
        }

        let engine = self.shared.engine.lock().clone();
        if let Some(engine) = engine {
            engine.stop().await;
        }
    }

    pub fn pause(&self) {
        let Some(engine) = self.shared.engine.lock().clone() else {
            return;
        };
        engine.pause();
        let mut status = self.shared.status.lock();
        if *status == WorkerStatus::Running {
            *status = WorkerStatus::Paused;
        }
    }

    pub fn resume(&self) {
        let Some(engine) = self.shared.engine.lock().clone() else {
            return;
        };
        engine.resume();
        let mut status = self.shared.status.lock();
        if *status == WorkerStatus::Paused {
            *status = WorkerStatus::Running;
        }
    }

    /// Listen for worker-level events
    pub fn on(&self, listener: impl Fn(&WorkerEvent) + Send + Sync + 'static) -> Subscription {
        self.shared.listeners.subscribe(listener)
    }

    /// Listen for the raw events of whichever engine is running
    pub fn on_engine_event(
        &self,
        listener: impl Fn(&EngineEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.engine_listeners.subscribe(listener)
    }

    pub fn display_state(&self) -> WorkerDisplayState {
        self.shared.display_state()
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}
