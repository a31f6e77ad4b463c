//! Agent Runner - parallel execution of coding agents in isolated worktrees
//!
//! Agent CLIs (Claude Code, Codex, OpenCode, Gemini) are normalized behind
//! [`AgentPlugin`]. An [`ExecutionEngine`] loops one agent over one task,
//! a [`Worker`] wraps an engine with display state, and the
//! [`ParallelOrchestrator`] runs a bounded pool of workers over the task
//! backlog, one git worktree per task.

pub mod color;
mod config;
mod engine;
mod error;
mod event;
mod listener;
mod orchestrator;
pub mod plugin;
mod process;
mod sandbox;
mod worker;

pub use config::{AgentConfig, EngineConfig, ExecuteOptions, ParallelConfig, DEFAULT_COMPLETION_MARKER};
pub use engine::{
    build_prompt, CommitHook, EngineBinding, EngineCommand, EngineState, EngineStatus,
    EngineSummary, ExecutionEngine, GitCommitter, TaskEngine,
};
pub use error::{AgentRunnerError, Result};
pub use event::{
    join_text, DisplayEvent, EngineEvent, ParallelEvent, ParallelSummary, StopReason, TaskResult,
    WorkerDisplayState, WorkerEvent, WorkerOutcome, WorkerResult, WorkerStatus, CANCELLED_MESSAGE,
};
pub use listener::{Listener, ListenerRegistry, Subscription};
pub use orchestrator::{
    EngineFactory, EventStream, ParallelOrchestrator, PluginEngineFactory, WorkspaceAllocator,
};
pub use plugin::{AgentKind, AgentPlugin, AgentRegistry, ExecutionHandle, ExecutionResult};
pub use process::{
    command_exists, OutputChunk, OutputStream, ProcessResult, ProcessRunner, RunOptions,
    StreamingProcess,
};
pub use sandbox::{HostOs, SandboxDetector, SandboxMode, SandboxRequest};
pub use worker::{Worker, WorkerConfig};
