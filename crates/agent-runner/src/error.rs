//! Error types for agent-runner

use thiserror::Error;

/// Result type alias for agent-runner operations
pub type Result<T> = std::result::Result<T, AgentRunnerError>;

/// Errors that can occur while driving agents
#[derive(Debug, Error)]
pub enum AgentRunnerError {
    /// Bad or missing agent configuration, reported before anything spawns
    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    /// No adapter registered under this id
    #[error("Unknown agent: {agent_id}")]
    UnknownAgent { agent_id: String },

    /// Agent CLI could not be found or did not answer its version probe
    #[error("Agent {agent_id} is unavailable: {reason}")]
    UnavailableAgent { agent_id: String, reason: String },

    /// Failed to spawn a child process
    #[error("Failed to spawn process: {message}")]
    SpawnFailed {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// An operation exceeded its bound
    #[error("Timed out after {millis} ms")]
    Timeout { millis: u64 },

    /// A component was used before being bound to its collaborators
    #[error("{component} not initialized")]
    NotInitialized { component: &'static str },

    /// A run is already in progress
    #[error("{component} is already running")]
    AlreadyRunning { component: &'static str },

    /// Too many agent invocations failed back to back
    #[error("{failures} consecutive iterations failed: {last_error}")]
    IterationsFailed { failures: u32, last_error: String },

    /// Task tracker error
    #[error("Tracker error: {0}")]
    Tracker(#[from] swarm_core::Error),

    /// Worktree operation failed
    #[error("Worktree error: {0}")]
    Worktree(#[from] git_worktree::WorktreeError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentRunnerError {
    /// Create a Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a SpawnFailed error
    pub fn spawn_failed(message: impl Into<String>) -> Self {
        Self::SpawnFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a SpawnFailed error with source
    pub fn spawn_failed_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::SpawnFailed {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a NotInitialized error
    pub fn not_initialized(component: &'static str) -> Self {
        Self::NotInitialized { component }
    }
}
