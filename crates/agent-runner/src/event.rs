//! Event types shared by adapters, engines, workers and the orchestrator

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use swarm_core::task::Task;

/// Normalized unit of agent output, independent of the agent's native protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisplayEvent {
    /// Assistant prose
    Text { text: String },

    /// Agent invoked a tool
    ToolUse {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default)]
        input: serde_json::Value,
    },

    /// Output of a tool invocation
    ToolResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        output: String,
        #[serde(default)]
        is_error: bool,
    },

    /// Agent or process error
    Error { message: String },
}

impl DisplayEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn tool_use(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self::ToolUse {
            name: name.into(),
            id: None,
            input,
        }
    }

    pub fn tool_result(output: impl Into<String>, is_error: bool) -> Self {
        Self::ToolResult {
            id: None,
            output: output.into(),
            is_error,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// One-line rendering for status displays
    pub fn summary(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::ToolUse { name, .. } => format!("[tool] {}", name),
            Self::ToolResult { output, is_error, .. } => {
                let tag = if *is_error { "[tool error]" } else { "[tool result]" };
                format!("{} {}", tag, output)
            }
            Self::Error { message } => format!("[error] {}", message),
        }
    }
}

/// Join the text segments of a run of events, one segment per line
pub fn join_text(events: &[DisplayEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            DisplayEvent::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Why an engine run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The agent reported the task as done
    TaskCompleted,
    /// The iteration cap was reached first
    MaxIterations,
    /// `stop()` was requested
    Cancelled,
    /// Too many failed iterations
    Failed,
}

/// Events emitted by an execution engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Started {
        task_id: String,
        max_iterations: u32,
    },
    IterationStarted {
        iteration: u32,
    },
    AgentOutput {
        iteration: u32,
        event: DisplayEvent,
    },
    IterationCompleted {
        iteration: u32,
        success: bool,
        exit_code: Option<i32>,
        duration_ms: u64,
        task_completed: bool,
    },
    AutoCommitted {
        iteration: u32,
        sha: String,
    },
    Paused {
        iteration: u32,
    },
    Resumed {
        iteration: u32,
    },
    TaskCompleted {
        iterations: u32,
    },
    Finished {
        reason: StopReason,
        iterations: u32,
    },
    Error {
        iteration: u32,
        message: String,
    },
}

/// Worker lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Cancelled,
    Error,
}

impl WorkerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

/// Snapshot of a worker for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDisplayState {
    pub id: String,
    pub status: WorkerStatus,
    pub task: Task,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub last_output: String,
    pub elapsed_ms: u64,
    pub commit_sha: Option<String>,
    pub worktree_path: PathBuf,
    pub branch_name: String,
}

/// How a worker run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Message carried by a cancelled result
pub const CANCELLED_MESSAGE: &str = "Worker was cancelled";

/// Terminal result of one `Worker::start` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub outcome: WorkerOutcome,
    pub success: bool,
    pub task_completed: bool,
    pub commit_count: u32,
    pub commit_sha: Option<String>,
    pub iterations: u32,
    pub error: Option<String>,
}

impl WorkerResult {
    pub fn completed(task_completed: bool, iterations: u32) -> Self {
        Self {
            outcome: WorkerOutcome::Completed,
            success: true,
            task_completed,
            commit_count: 0,
            commit_sha: None,
            iterations,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            outcome: WorkerOutcome::Failed,
            success: false,
            task_completed: false,
            commit_count: 0,
            commit_sha: None,
            iterations: 0,
            error: Some(error.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            outcome: WorkerOutcome::Cancelled,
            ..Self::failed(CANCELLED_MESSAGE)
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.outcome == WorkerOutcome::Cancelled
    }
}

/// Events emitted by a worker to its own listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Started { state: WorkerDisplayState },
    Progress { state: WorkerDisplayState },
    Completed { result: WorkerResult },
    Failed { result: WorkerResult },
}

/// Aggregate outcome of a parallel run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParallelSummary {
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_commits: u32,
    pub duration_ms: u64,
    pub results: Vec<TaskResult>,
}

/// Result of one task within a parallel run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub worker_id: String,
    pub branch_name: String,
    pub result: WorkerResult,
}

/// Merged event stream of the parallel orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParallelEvent {
    #[serde(rename = "task:claimed")]
    TaskClaimed { worker_id: String, task_id: String },

    #[serde(rename = "worker:started")]
    WorkerStarted {
        worker_id: String,
        task_id: String,
        state: WorkerDisplayState,
    },

    #[serde(rename = "worker:progress")]
    WorkerProgress {
        worker_id: String,
        task_id: String,
        state: WorkerDisplayState,
    },

    #[serde(rename = "worker:completed")]
    WorkerCompleted {
        worker_id: String,
        task_id: String,
        result: WorkerResult,
    },

    #[serde(rename = "worker:failed")]
    WorkerFailed {
        worker_id: String,
        task_id: String,
        result: WorkerResult,
    },

    #[serde(rename = "all:complete")]
    AllComplete { summary: ParallelSummary },
}

impl ParallelEvent {
    /// Wrap a worker event with the worker's identity
    pub fn from_worker(worker_id: &str, task_id: &str, event: &WorkerEvent) -> Self {
        let worker_id = worker_id.to_string();
        let task_id = task_id.to_string();
        match event {
            WorkerEvent::Started { state } => Self::WorkerStarted {
                worker_id,
                task_id,
                state: state.clone(),
            },
            WorkerEvent::Progress { state } => Self::WorkerProgress {
                worker_id,
                task_id,
                state: state.clone(),
            },
            WorkerEvent::Completed { result } => Self::WorkerCompleted {
                worker_id,
                task_id,
                result: result.clone(),
            },
            WorkerEvent::Failed { result } => Self::WorkerFailed {
                worker_id,
                task_id,
                result: result.clone(),
            },
        }
    }

    pub fn worker_id(&self) -> Option<&str> {
        match self {
            Self::TaskClaimed { worker_id, .. }
            | Self::WorkerStarted { worker_id, .. }
            | Self::WorkerProgress { worker_id, .. }
            | Self::WorkerCompleted { worker_id, .. }
            | Self::WorkerFailed { worker_id, .. } => Some(worker_id),
            Self::AllComplete { .. } => None,
        }
    }
}
