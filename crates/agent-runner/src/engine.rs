//! Iterate-until-done loop for a single task attempt

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use git_worktree::WorktreeManager;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use swarm_core::task::Task;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, ExecuteOptions};
use crate::error::{AgentRunnerError, Result};
use crate::event::{DisplayEvent, EngineEvent, StopReason};
use crate::listener::{Listener, ListenerRegistry, Subscription};
use crate::plugin::AgentPlugin;
use crate::sandbox::SandboxMode;

/// Lifecycle of an engine run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Cancelled,
    Errored,
}

/// Inputs to the engine state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    Start,
    Pause,
    Resume,
    Complete,
    Cancel,
    Fail,
}

impl EngineStatus {
    /// Next status for `command`, or `None` if the transition is not allowed
    pub fn apply(self, command: EngineCommand) -> Option<EngineStatus> {
        use EngineCommand as C;
        use EngineStatus as S;

        match (self, command) {
            (S::Idle | S::Completed | S::Cancelled | S::Errored, C::Start) => Some(S::Running),
            (S::Running, C::Pause) => Some(S::Paused),
            (S::Paused, C::Resume) => Some(S::Running),
            (S::Running | S::Paused, C::Complete) => Some(S::Completed),
            (S::Running | S::Paused, C::Cancel) => Some(S::Cancelled),
            (S::Running | S::Paused, C::Fail) => Some(S::Errored),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Errored)
    }
}

/// Read-only progress snapshot, safe to take while the loop runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineState {
    pub tasks_completed: u32,
    pub current_iteration: u32,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSummary {
    pub reason: StopReason,
    pub iterations: u32,
    pub task_completed: bool,
}

/// Commits a workspace after an iteration
#[async_trait]
pub trait CommitHook: Send + Sync {
    /// Commit everything; `None` when there was nothing to commit
    async fn commit(&self, workspace: &Path, message: &str) -> Result<Option<String>>;
}

/// Commits through git, staging everything in the worktree
pub struct GitCommitter {
    manager: Arc<WorktreeManager>,
}

impl GitCommitter {
    pub fn new(manager: Arc<WorktreeManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl CommitHook for GitCommitter {
    async fn commit(&self, workspace: &Path, message: &str) -> Result<Option<String>> {
        Ok(self.manager.commit_all(workspace, message).await?)
    }
}

/// Everything an engine needs to run one task
#[derive(Clone)]
pub struct EngineBinding {
    pub plugin: Arc<dyn AgentPlugin>,
    pub task: Task,
    pub options: ExecuteOptions,
    pub files: Vec<PathBuf>,
    pub committer: Option<Arc<dyn CommitHook>>,
}

impl EngineBinding {
    pub fn new(plugin: Arc<dyn AgentPlugin>, task: Task, workspace: impl Into<PathBuf>) -> Self {
        Self {
            plugin,
            task,
            options: ExecuteOptions::new(workspace),
            files: Vec::new(),
            committer: None,
        }
    }

    pub fn with_sandbox(mut self, sandbox: SandboxMode) -> Self {
        self.options.sandbox = sandbox;
        self
    }

    pub fn with_committer(mut self, committer: Arc<dyn CommitHook>) -> Self {
        self.committer = Some(committer);
        self
    }

    pub fn with_files(mut self, files: Vec<PathBuf>) -> Self {
        self.files = files;
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.options.cwd
    }
}

/// What a [`Worker`](crate::worker::Worker) needs from an engine
#[async_trait]
pub trait TaskEngine: Send + Sync {
    /// Run to a terminal state
    async fn start(&self) -> Result<EngineSummary>;

    /// Request a graceful halt and wait for the run to end
    async fn stop(&self);

    /// Request a graceful halt without waiting; a no-op unless running or paused
    fn cancel(&self);

    fn pause(&self);

    fn resume(&self);

    fn state(&self) -> EngineState;

    fn max_iterations(&self) -> u32;

    fn subscribe(&self, listener: Listener<EngineEvent>) -> Subscription;
}

struct IterationOutcome {
    success: bool,
    exit_code: Option<i32>,
    duration_ms: u64,
    task_completed: bool,
    text: String,
    error: Option<String>,
}

/// Drives one agent against one task until it reports completion,
/// runs out of iterations, fails repeatedly or is stopped
pub struct ExecutionEngine {
    config: EngineConfig,
    binding: Mutex<Option<EngineBinding>>,
    status: watch::Sender<EngineStatus>,
    stop_requested: AtomicBool,
    current_iteration: AtomicU32,
    tasks_completed: AtomicU32,
    listeners: ListenerRegistry<EngineEvent>,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig) -> Self {
        let (status, _) = watch::channel(EngineStatus::Idle);
        Self {
            config,
            binding: Mutex::new(None),
            status,
            stop_requested: AtomicBool::new(false),
            current_iteration: AtomicU32::new(0),
            tasks_completed: AtomicU32::new(0),
            listeners: ListenerRegistry::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bind the plugin, task and workspace; rejected while a run is active
    pub fn initialize(&self, binding: EngineBinding) -> Result<()> {
        if self.status().is_active() {
            return Err(AgentRunnerError::AlreadyRunning { component: "engine" });
        }
        *self.binding.lock() = Some(binding);
        Ok(())
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.borrow()
    }

    fn transition(&self, command: EngineCommand) -> bool {
        self.status.send_if_modified(|status| match status.apply(command) {
            Some(next) => {
                debug!("Engine {:?} -> {:?}", status, next);
                *status = next;
                true
            }
            None => false,
        })
    }

    fn emit(&self, event: EngineEvent) {
        self.listeners.emit(&event);
    }

    fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Block between iterations while paused; false if a stop arrived meanwhile
    async fn wait_while_paused(&self, iteration: u32) -> bool {
        if self.status() != EngineStatus::Paused {
            return !self.is_stop_requested();
        }

        self.emit(EngineEvent::Paused { iteration });
        let mut rx = self.status.subscribe();
        let _ = rx
            .wait_for(|status| *status != EngineStatus::Paused || self.is_stop_requested())
            .await;

        if self.is_stop_requested() {
            return false;
        }
        self.emit(EngineEvent::Resumed { iteration });
        true
    }

    async fn run(&self, binding: &EngineBinding) -> Result<EngineSummary> {
        let max_iterations = self.config.max_iterations;
        let mut previous_output = String::new();
        let mut failures = 0u32;
        let mut iteration = 0u32;

        let reason = loop {
            if !self.wait_while_paused(iteration).await {
                break StopReason::Cancelled;
            }
            if iteration >= max_iterations {
                break StopReason::MaxIterations;
            }

            iteration += 1;
            self.current_iteration.store(iteration, Ordering::Release);
            self.emit(EngineEvent::IterationStarted { iteration });

            let outcome = self.run_iteration(binding, iteration, &previous_output).await;
            self.emit(EngineEvent::IterationCompleted {
                iteration,
                success: outcome.success,
                exit_code: outcome.exit_code,
                duration_ms: outcome.duration_ms,
                task_completed: outcome.task_completed,
            });

            if self.config.auto_commit {
                self.auto_commit(binding, iteration).await;
            }

            if outcome.task_completed {
                self.tasks_completed.fetch_add(1, Ordering::AcqRel);
                self.emit(EngineEvent::TaskCompleted { iterations: iteration });
                break StopReason::TaskCompleted;
            }

            if outcome.success {
                failures = 0;
            } else {
                failures += 1;
                let message = outcome
                    .error
                    .unwrap_or_else(|| "agent invocation failed".to_string());
                self.emit(EngineEvent::Error {
                    iteration,
                    message: message.clone(),
                });
                let limit = self.config.max_consecutive_failures;
                if limit > 0 && failures >= limit {
                    warn!("Giving up on task {} after {} failed iterations", binding.task.id, failures);
                    self.transition(EngineCommand::Fail);
                    self.emit(EngineEvent::Finished {
                        reason: StopReason::Failed,
                        iterations: iteration,
                    });
                    return Err(AgentRunnerError::IterationsFailed {
                        failures,
                        last_error: message,
                    });
                }
            }
            previous_output = tail(&outcome.text, self.config.output_context_chars);

            if self.is_stop_requested() {
                break StopReason::Cancelled;
            }
            let delay = self.config.iteration_delay();
            if !delay.is_zero() && iteration < max_iterations {
                tokio::time::sleep(delay).await;
            }
        };

        let command = if reason == StopReason::Cancelled {
            EngineCommand::Cancel
        } else {
            EngineCommand::Complete
        };
        self.transition(command);
        info!(
            "Task {} finished after {} iterations: {:?}",
            binding.task.id, iteration, reason
        );
        self.emit(EngineEvent::Finished {
            reason,
            iterations: iteration,
        });

        Ok(EngineSummary {
            reason,
            iterations: iteration,
            task_completed: reason == StopReason::TaskCompleted,
        })
    }

    async fn run_iteration(
        &self,
        binding: &EngineBinding,
        iteration: u32,
        previous_output: &str,
    ) -> IterationOutcome {
        let prompt = build_prompt(
            &binding.task,
            iteration,
            self.config.max_iterations,
            previous_output,
            &self.config.completion_marker,
        );
        let started = Instant::now();
        let mut handle = binding
            .plugin
            .execute(&prompt, &binding.files, &binding.options);

        let timeout = self.config.iteration_timeout();
        let deadline = async move {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);
        let mut timed_out = false;

        loop {
            tokio::select! {
                event = handle.next_event() => match event {
                    Some(event) => self.emit(EngineEvent::AgentOutput { iteration, event }),
                    None => break,
                },
                _ = &mut deadline, if !timed_out => {
                    warn!("Iteration {} of task {} timed out", iteration, binding.task.id);
                    timed_out = true;
                    handle.terminate();
                }
            }
        }

        let result = handle.wait().await;
        let text = result.text();
        let error = if timed_out {
            Some(format!(
                "iteration timed out after {} ms",
                timeout.map(|t| t.as_millis()).unwrap_or_default()
            ))
        } else {
            result.process.error.clone().or_else(|| {
                result.events.iter().rev().find_map(|event| match event {
                    DisplayEvent::Error { message } => Some(message.clone()),
                    _ => None,
                })
            })
        };

        IterationOutcome {
            success: result.success() && !timed_out,
            exit_code: result.process.exit_code,
            duration_ms: started.elapsed().as_millis() as u64,
            task_completed: text.contains(&self.config.completion_marker),
            text,
            error,
        }
    }

    async fn auto_commit(&self, binding: &EngineBinding, iteration: u32) {
        let Some(committer) = &binding.committer else {
            return;
        };
        let message = format!(
            "{} (iteration {})\n\nTask: {}",
            binding.task.title, iteration, binding.task.id
        );
        match committer.commit(binding.workspace(), &message).await {
            Ok(Some(sha)) => self.emit(EngineEvent::AutoCommitted { iteration, sha }),
            Ok(None) => debug!("Nothing to commit after iteration {}", iteration),
            Err(e) => warn!("Auto-commit failed after iteration {}: {}", iteration, e),
        }
    }
}

#[async_trait]
impl TaskEngine for ExecutionEngine {
    async fn start(&self) -> Result<EngineSummary> {
        let binding = self
            .binding
            .lock()
            .clone()
            .ok_or_else(|| AgentRunnerError::not_initialized("engine"))?;

        // Cleared before going active so a cancel issued from a Started
        // listener is not wiped out
        let was_requested = self.stop_requested.swap(false, Ordering::AcqRel);
        if !self.transition(EngineCommand::Start) {
            if was_requested {
                self.stop_requested.store(true, Ordering::Release);
            }
            return Err(AgentRunnerError::AlreadyRunning { component: "engine" });
        }
        self.current_iteration.store(0, Ordering::Release);
        self.tasks_completed.store(0, Ordering::Release);

        info!(
            "Starting {} on task {} in {:?}",
            binding.plugin.meta().id,
            binding.task.id,
            binding.workspace()
        );
        self.emit(EngineEvent::Started {
            task_id: binding.task.id.clone(),
            max_iterations: self.config.max_iterations,
        });

        self.run(&binding).await
    }

    async fn stop(&self) {
        if !self.status().is_active() {
            return;
        }
        self.cancel();

        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(|status| !status.is_active()).await;
    }

    fn cancel(&self) {
        if !self.status().is_active() {
            return;
        }
        info!("Stopping engine");
        self.stop_requested.store(true, Ordering::Release);
        // Wake a paused loop so it can observe the request
        self.status.send_modify(|_| {});
    }

    fn pause(&self) {
        self.transition(EngineCommand::Pause);
    }

    fn resume(&self) {
        self.transition(EngineCommand::Resume);
    }

    fn state(&self) -> EngineState {
        EngineState {
            tasks_completed: self.tasks_completed.load(Ordering::Acquire),
            current_iteration: self.current_iteration.load(Ordering::Acquire),
        }
    }

    fn max_iterations(&self) -> u32 {
        self.config.max_iterations
    }

    fn subscribe(&self, listener: Listener<EngineEvent>) -> Subscription {
        self.listeners.subscribe_arc(listener)
    }
}

/// Prompt for one iteration
pub fn build_prompt(
    task: &Task,
    iteration: u32,
    max_iterations: u32,
    previous_output: &str,
    completion_marker: &str,
) -> String {
    let mut prompt = format!("# Task: {}\n\nTask ID: {}\n", task.title, task.id);
    if let Some(description) = task.description.as_deref().filter(|d| !d.trim().is_empty()) {
        prompt.push_str(&format!("\n{}\n", description.trim()));
    }

    prompt.push_str(&format!("\nThis is iteration {} of {}.\n", iteration, max_iterations));
    if !previous_output.trim().is_empty() {
        prompt.push_str(&format!(
            "\n## Output from the previous iteration\n\n{}\n",
            previous_output.trim()
        ));
    }

    prompt.push_str(&format!(
        "\n## Instructions\n\n\
         Work in the current directory only. Make focused changes, run the relevant \
         checks, and leave the tree in a working state; changes are committed for you \
         after each iteration.\n\n\
         When the task is fully complete and verified, print exactly:\n{}\n",
        completion_marker
    ));
    prompt
}

/// Last `max_chars` characters of `text`
fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("status", &self.status())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::plugin::{AgentMeta, AgentCapabilities, Invocation, OutputFormat, ProtocolParser};
    use std::collections::VecDeque;
    use std::time::Duration;

    #[test]
    fn test_status_transitions() {
        use EngineCommand as C;
        use EngineStatus as S;

        assert_eq!(S::Idle.apply(C::Start), Some(S::Running));
        assert_eq!(S::Running.apply(C::Pause), Some(S::Paused));
        assert_eq!(S::Paused.apply(C::Resume), Some(S::Running));
        assert_eq!(S::Paused.apply(C::Cancel), Some(S::Cancelled));
        assert_eq!(S::Running.apply(C::Complete), Some(S::Completed));
        assert_eq!(S::Running.apply(C::Fail), Some(S::Errored));
        assert_eq!(S::Completed.apply(C::Start), Some(S::Running));

        assert_eq!(S::Idle.apply(C::Pause), None);
        assert_eq!(S::Idle.apply(C::Resume), None);
        assert_eq!(S::Running.apply(C::Start), None);
        assert_eq!(S::Running.apply(C::Resume), None);
        assert_eq!(S::Paused.apply(C::Pause), None);
        assert_eq!(S::Cancelled.apply(C::Cancel), None);
    }

    #[test]
    fn test_build_prompt() {
        let task = Task::new("Add login").with_description("Use OAuth");
        let prompt = build_prompt(&task, 2, 5, "tests failed", "<done/>");
        assert!(prompt.contains("# Task: Add login"));
        assert!(prompt.contains("Use OAuth"));
        assert!(prompt.contains("iteration 2 of 5"));
        assert!(prompt.contains("tests failed"));
        assert!(prompt.trim_end().ends_with("<done/>"));

        let first = build_prompt(&task, 1, 5, "", "<done/>");
        assert!(!first.contains("previous iteration"));
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
        assert_eq!(tail("ééé", 2), "éé");
    }

    #[tokio::test]
    async fn test_start_unbound() {
        let engine = ExecutionEngine::new(EngineConfig::default());
        let err = engine.start().await.unwrap_err();
        assert!(err.to_string().contains("not initialized"));
        assert_eq!(engine.status(), EngineStatus::Idle);
    }

    #[tokio::test]
    async fn test_pause_and_stop_without_run_are_noops() {
        let engine = ExecutionEngine::new(EngineConfig::default());
        engine.pause();
        engine.resume();
        engine.stop().await;
        assert_eq!(engine.status(), EngineStatus::Idle);
    }

    /// Runs one shell script per iteration and turns each output line into text
    struct ScriptPlugin {
        meta: AgentMeta,
        config: AgentConfig,
        scripts: Mutex<VecDeque<String>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptPlugin {
        fn new(scripts: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                meta: AgentMeta {
                    id: "script",
                    name: "Script",
                    description: "test agent",
                    default_command: "sh",
                    capabilities: AgentCapabilities {
                        supports_streaming: true,
                        supports_interrupt: true,
                        output_format: OutputFormat::Jsonl,
                        skill_paths: &[],
                    },
                    state_dirs: &[],
                },
                config: AgentConfig::default(),
                scripts: Mutex::new(scripts.iter().map(|s| s.to_string()).collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    struct Lines;

    impl ProtocolParser for Lines {
        fn parse_line(&mut self, line: &str) -> Vec<DisplayEvent> {
            if line.trim().is_empty() {
                Vec::new()
            } else {
                vec![DisplayEvent::text(line)]
            }
        }
    }

    impl AgentPlugin for ScriptPlugin {
        fn meta(&self) -> &AgentMeta {
            &self.meta
        }

        fn config(&self) -> &AgentConfig {
            &self.config
        }

        fn initialize(&mut self, config: AgentConfig) -> Result<()> {
            self.config = config;
            Ok(())
        }

        fn build_args(&self, prompt: &str, _files: &[PathBuf], _options: &ExecuteOptions) -> Invocation {
            self.prompts.lock().push(prompt.to_string());
            let script = self
                .scripts
                .lock()
                .pop_front()
                .unwrap_or_else(|| "echo idle".to_string());
            Invocation {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), script],
                stdin: None,
            }
        }

        fn parser(&self) -> Box<dyn ProtocolParser> {
            Box::new(Lines)
        }
    }

    /// Hands out a fresh sha on every call
    #[derive(Default)]
    struct CountingCommitter {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CommitHook for CountingCommitter {
        async fn commit(&self, _workspace: &Path, _message: &str) -> Result<Option<String>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Some(format!("sha{}", n)))
        }
    }

    fn record(engine: &ExecutionEngine) -> (Arc<Mutex<Vec<EngineEvent>>>, Subscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let sub = engine.subscribe(Arc::new(move |e: &EngineEvent| sink.lock().push(e.clone())));
        (events, sub)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_until_completion_marker() {
        let plugin = ScriptPlugin::new(&[
            "echo 'working on it'",
            "echo 'done'; echo '<promise>COMPLETE</promise>'",
        ]);
        let engine = ExecutionEngine::new(EngineConfig::default());
        let committer = Arc::new(CountingCommitter::default());
        engine
            .initialize(
                EngineBinding::new(plugin.clone(), Task::new("t"), std::env::temp_dir())
                    .with_committer(committer.clone()),
            )
            .unwrap();
        let (events, _sub) = record(&engine);

        let summary = engine.start().await.unwrap();
        assert_eq!(summary.reason, StopReason::TaskCompleted);
        assert_eq!(summary.iterations, 2);
        assert!(summary.task_completed);
        assert_eq!(engine.status(), EngineStatus::Completed);
        assert_eq!(
            engine.state(),
            EngineState {
                tasks_completed: 1,
                current_iteration: 2
            }
        );

        let events = events.lock();
        let shas: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::AutoCommitted { sha, .. } => Some(sha.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(shas, vec!["sha1", "sha2"]);
        assert!(events.contains(&EngineEvent::AgentOutput {
            iteration: 1,
            event: DisplayEvent::text("working on it"),
        }));
        assert!(matches!(events.first(), Some(EngineEvent::Started { .. })));
        assert!(matches!(
            events.last(),
            Some(EngineEvent::Finished {
                reason: StopReason::TaskCompleted,
                iterations: 2
            })
        ));

        // Second prompt carries the first iteration's output
        assert!(plugin.prompts.lock()[1].contains("working on it"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stops_at_iteration_cap() {
        let plugin = ScriptPlugin::new(&[]);
        let config = EngineConfig {
            max_iterations: 3,
            auto_commit: false,
            ..EngineConfig::default()
        };
        let engine = ExecutionEngine::new(config);
        engine
            .initialize(EngineBinding::new(plugin, Task::new("t"), std::env::temp_dir()))
            .unwrap();

        let summary = engine.start().await.unwrap();
        assert_eq!(summary.reason, StopReason::MaxIterations);
        assert_eq!(summary.iterations, 3);
        assert!(!summary.task_completed);
        assert_eq!(engine.state().tasks_completed, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_consecutive_failures_error_out() {
        let plugin = ScriptPlugin::new(&["exit 1", "exit 1", "exit 1", "echo never"]);
        let config = EngineConfig {
            max_consecutive_failures: 3,
            auto_commit: false,
            ..EngineConfig::default()
        };
        let engine = ExecutionEngine::new(config);
        engine
            .initialize(EngineBinding::new(plugin, Task::new("t"), std::env::temp_dir()))
            .unwrap();

        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, AgentRunnerError::IterationsFailed { failures: 3, .. }));
        assert_eq!(engine.status(), EngineStatus::Errored);
        assert_eq!(engine.state().current_iteration, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_iteration_timeout_counts_as_failure() {
        let plugin = ScriptPlugin::new(&["exec sleep 5", "echo '<promise>COMPLETE</promise>'"]);
        let config = EngineConfig {
            iteration_timeout_ms: Some(200),
            auto_commit: false,
            ..EngineConfig::default()
        };
        let engine = ExecutionEngine::new(config);
        engine
            .initialize(EngineBinding::new(plugin, Task::new("t"), std::env::temp_dir()))
            .unwrap();
        let (events, _sub) = record(&engine);

        let summary = engine.start().await.unwrap();
        assert_eq!(summary.reason, StopReason::TaskCompleted);
        assert_eq!(summary.iterations, 2);
        assert!(events.lock().iter().any(|e| matches!(
            e,
            EngineEvent::IterationCompleted { iteration: 1, success: false, .. }
        )));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_lets_in_flight_iteration_finish() {
        let plugin = ScriptPlugin::new(&["sleep 0.3; echo first"]);
        let engine = Arc::new(ExecutionEngine::new(EngineConfig {
            auto_commit: false,
            ..EngineConfig::default()
        }));
        engine
            .initialize(EngineBinding::new(plugin, Task::new("t"), std::env::temp_dir()))
            .unwrap();
        let (events, _sub) = record(&engine);

        let runner = Arc::clone(&engine);
        let run = tokio::spawn(async move { runner.start().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.stop().await;

        assert_eq!(engine.status(), EngineStatus::Cancelled);
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.reason, StopReason::Cancelled);
        assert_eq!(summary.iterations, 1);
        assert!(events.lock().contains(&EngineEvent::AgentOutput {
            iteration: 1,
            event: DisplayEvent::text("first"),
        }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pause_holds_between_iterations() {
        let plugin = ScriptPlugin::new(&["sleep 0.2; echo one", "echo '<promise>COMPLETE</promise>'"]);
        let engine = Arc::new(ExecutionEngine::new(EngineConfig {
            auto_commit: false,
            ..EngineConfig::default()
        }));
        engine
            .initialize(EngineBinding::new(plugin, Task::new("t"), std::env::temp_dir()))
            .unwrap();
        let (events, _sub) = record(&engine);

        let runner = Arc::clone(&engine);
        let run = tokio::spawn(async move { runner.start().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.pause();
        assert_eq!(engine.status(), EngineStatus::Paused);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(engine.state().current_iteration, 1);
        assert!(events.lock().contains(&EngineEvent::Paused { iteration: 1 }));

        engine.resume();
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.reason, StopReason::TaskCompleted);
        assert!(events.lock().contains(&EngineEvent::Resumed { iteration: 1 }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_while_paused() {
        let plugin = ScriptPlugin::new(&["sleep 0.1"]);
        let engine = Arc::new(ExecutionEngine::new(EngineConfig::default()));
        engine
            .initialize(EngineBinding::new(plugin, Task::new("t"), std::env::temp_dir()))
            .unwrap();

        let runner = Arc::clone(&engine);
        let run = tokio::spawn(async move { runner.start().await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        engine.pause();
        tokio::time::sleep(Duration::from_millis(300)).await;

        engine.stop().await;
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.reason, StopReason::Cancelled);
        assert_eq!(engine.status(), EngineStatus::Cancelled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_from_started_listener_skips_iterations() {
        let plugin = ScriptPlugin::new(&["echo '<promise>COMPLETE</promise>'"]);
        let engine = Arc::new(ExecutionEngine::new(EngineConfig {
            auto_commit: false,
            ..EngineConfig::default()
        }));
        engine
            .initialize(EngineBinding::new(plugin.clone(), Task::new("t"), std::env::temp_dir()))
            .unwrap();

        let weak = Arc::downgrade(&engine);
        let _sub = engine.subscribe(Arc::new(move |e: &EngineEvent| {
            if matches!(e, EngineEvent::Started { .. }) {
                if let Some(engine) = weak.upgrade() {
                    engine.cancel();
                }
            }
        }));

        let summary = engine.start().await.unwrap();
        assert_eq!(summary.reason, StopReason::Cancelled);
        assert_eq!(summary.iterations, 0);
        assert_eq!(engine.status(), EngineStatus::Cancelled);
        assert!(plugin.prompts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_when_idle_is_noop() {
        let engine = ExecutionEngine::new(EngineConfig::default());
        engine.cancel();
        assert!(!engine.is_stop_requested());
        assert_eq!(engine.status(), EngineStatus::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restart_resets_counters() {
        let plugin = ScriptPlugin::new(&[
            "echo '<promise>COMPLETE</promise>'",
            "echo '<promise>COMPLETE</promise>'",
        ]);
        let engine = ExecutionEngine::new(EngineConfig {
            auto_commit: false,
            ..EngineConfig::default()
        });
        engine
            .initialize(EngineBinding::new(plugin, Task::new("t"), std::env::temp_dir()))
            .unwrap();

        engine.start().await.unwrap();
        let summary = engine.start().await.unwrap();
        assert_eq!(summary.iterations, 1);
        assert_eq!(engine.state().tasks_completed, 1);
    }
}
