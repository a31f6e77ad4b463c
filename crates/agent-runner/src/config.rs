//! Configuration for agents, engines and the parallel pool

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sandbox::{SandboxMode, SandboxRequest};

/// Marker an agent prints once the task is fully done
pub const DEFAULT_COMPLETION_MARKER: &str = "<promise>COMPLETE</promise>";

/// Per-agent configuration bound by `AgentPlugin::initialize`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Executable override (defaults to the adapter's command)
    pub command: Option<String>,
    /// Model to request, if the CLI supports choosing one
    pub model: Option<String>,
    /// Let the agent edit files and run commands without asking
    pub auto_approve: bool,
    /// Extra arguments appended after the adapter's own
    pub extra_args: Vec<String>,
    /// Additional environment variables
    pub env: BTreeMap<String, String>,
    /// Process timeout in milliseconds (None = no timeout)
    pub timeout_ms: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: None,
            model: None,
            auto_approve: true,
            extra_args: Vec::new(),
            env: BTreeMap::new(),
            timeout_ms: None,
        }
    }
}

impl AgentConfig {
    /// Set the model
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the executable
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Set the process timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// Options for a single agent invocation
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Working directory (the worker's worktree)
    pub cwd: PathBuf,
    /// Concrete isolation mode to run under
    pub sandbox: SandboxMode,
    /// Overrides the agent's configured timeout
    pub timeout: Option<Duration>,
    /// Environment added on top of the agent's
    pub env: BTreeMap<String, String>,
}

impl ExecuteOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    pub fn with_sandbox(mut self, sandbox: SandboxMode) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Configuration for the iterate-until-done loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on agent invocations per task attempt
    pub max_iterations: u32,
    /// Commit the worktree after every iteration
    pub auto_commit: bool,
    /// Pause between iterations in milliseconds
    pub iteration_delay_ms: u64,
    /// Bound on a single invocation; expiry terminates the agent
    pub iteration_timeout_ms: Option<u64>,
    /// Failed iterations in a row before the run errors out
    pub max_consecutive_failures: u32,
    /// Text the agent prints when the task is finished
    pub completion_marker: String,
    /// How much of the previous iteration's output is fed back
    pub output_context_chars: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            auto_commit: true,
            iteration_delay_ms: 0,
            iteration_timeout_ms: None,
            max_consecutive_failures: 3,
            completion_marker: DEFAULT_COMPLETION_MARKER.to_string(),
            output_context_chars: 2000,
        }
    }
}

impl EngineConfig {
    pub fn iteration_delay(&self) -> Duration {
        Duration::from_millis(self.iteration_delay_ms)
    }

    pub fn iteration_timeout(&self) -> Option<Duration> {
        self.iteration_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Configuration for the worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Maximum number of concurrent workers
    pub max_workers: usize,
    /// Prefix for worker branch names
    pub branch_prefix: String,
    /// Directory (relative to the repository) holding worktrees
    pub worktree_dir: PathBuf,
    /// Ref every worker branch starts from
    pub base_branch: String,
    pub sandbox: SandboxRequest,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            branch_prefix: "swarm/".to_string(),
            worktree_dir: PathBuf::from(".worktrees"),
            base_branch: "main".to_string(),
            sandbox: SandboxRequest::Auto,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.max_iterations, 10);
        assert!(config.auto_commit);
        assert_eq!(config.iteration_timeout(), None);
        assert_eq!(config.completion_marker, DEFAULT_COMPLETION_MARKER);
    }

    #[test]
    fn test_zero_iteration_timeout_means_none() {
        let config = EngineConfig {
            iteration_timeout_ms: Some(0),
            ..EngineConfig::default()
        };
        assert_eq!(config.iteration_timeout(), None);
    }

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let config: ParallelConfig = serde_json::from_str(r#"{"max_workers": 5}"#).unwrap();
        assert_eq!(config.max_workers, 5);
        assert_eq!(config.branch_prefix, "swarm/");
        assert_eq!(config.base_branch, "main");
        assert_eq!(config.sandbox, SandboxRequest::Auto);

        let config: ParallelConfig = serde_json::from_str(r#"{"sandbox": "off"}"#).unwrap();
        assert_eq!(config.sandbox, SandboxRequest::Mode(SandboxMode::Off));

        let agent: AgentConfig = serde_json::from_str(r#"{"model": "opus"}"#).unwrap();
        assert_eq!(agent.model.as_deref(), Some("opus"));
        assert!(agent.auto_approve);
    }
}
