//! Agent adapters
//!
//! Each supported coding-agent CLI gets one adapter implementing
//! [`AgentPlugin`]. All protocol-specific parsing lives in the adapter's
//! [`ProtocolParser`]; everything above this module only sees
//! [`DisplayEvent`]s.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::{AgentConfig, ExecuteOptions};
use crate::error::{AgentRunnerError, Result};
use crate::event::DisplayEvent;
use crate::process::{command_exists, ProcessRunner, RunOptions};

pub mod claude;
pub mod codex;
pub mod gemini;
pub mod opencode;
mod registry;
mod stream;

pub use registry::AgentRegistry;
pub use stream::{ExecutionHandle, ExecutionResult, LineBuffer};

/// Hard bound on `<agent> --version`
pub const DETECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on the PATH lookup that precedes the version probe
const PATH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Structured output protocol spoken by an agent CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    StreamJson,
    Jsonl,
}

/// What the orchestration layer may rely on when driving an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentCapabilities {
    pub supports_streaming: bool,
    pub supports_interrupt: bool,
    pub output_format: OutputFormat,
    /// Where the agent looks for skills, relative to the project or `~`
    pub skill_paths: &'static [&'static str],
}

/// Static description of an adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentMeta {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub default_command: &'static str,
    pub capabilities: AgentCapabilities,
    /// Directories under `~` the agent writes its own state to
    pub state_dirs: &'static [&'static str],
}

/// Outcome of probing for an agent CLI
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetectResult {
    pub available: bool,
    pub version: Option<String>,
    pub executable_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl DetectResult {
    pub fn unavailable(error: impl Into<String>) -> Self {
        Self {
            available: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Outcome of checking that an agent is ready to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupValidation {
    pub ready: bool,
    pub issues: Vec<String>,
    pub detect: DetectResult,
}

/// A fully derived command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: String,
    pub args: Vec<String>,
    /// Prompt delivered over stdin instead of argv
    pub stdin: Option<String>,
}

/// Turns one complete output line into zero or more display events
pub trait ProtocolParser: Send {
    fn parse_line(&mut self, line: &str) -> Vec<DisplayEvent>;

    /// Flush anything held back once the output ends
    fn finish(&mut self) -> Vec<DisplayEvent> {
        Vec::new()
    }
}

/// Uniform interface over agent CLIs
#[async_trait]
pub trait AgentPlugin: Send + Sync {
    fn meta(&self) -> &AgentMeta;

    fn config(&self) -> &AgentConfig;

    /// Bind configuration; rejects invalid settings before anything spawns
    fn initialize(&mut self, config: AgentConfig) -> Result<()>;

    /// Derive the command line; must not touch the system
    fn build_args(&self, prompt: &str, files: &[PathBuf], options: &ExecuteOptions) -> Invocation;

    /// Fresh parser for one invocation's output
    fn parser(&self) -> Box<dyn ProtocolParser>;

    /// Executable to run, honoring the configured override
    fn command(&self) -> &str {
        self.config()
            .command
            .as_deref()
            .unwrap_or(self.meta().default_command)
    }

    /// Locate the CLI and read its version
    async fn detect(&self) -> DetectResult {
        detect_cli(self.command()).await
    }

    async fn validate_setup(&self) -> SetupValidation {
        let detect = self.detect().await;
        let mut issues = Vec::new();
        if !detect.available {
            issues.push(format!(
                "{} is not available: {}",
                self.meta().name,
                detect.error.as_deref().unwrap_or("unknown error")
            ));
        }
        if let Err(e) = validate_config(self.config()) {
            issues.push(e.to_string());
        }
        SetupValidation {
            ready: issues.is_empty(),
            issues,
            detect,
        }
    }

    /// Spawn the agent and stream its parsed output.
    ///
    /// Never fails: spawn errors and bad exits surface as an error event
    /// and in the handle's result.
    fn execute(&self, prompt: &str, files: &[PathBuf], options: &ExecuteOptions) -> ExecutionHandle {
        let invocation = self.build_args(prompt, files, options);
        let writable = home_state_dirs(self.meta().state_dirs);
        let (command, args) =
            options
                .sandbox
                .wrap(&invocation.command, &invocation.args, &options.cwd, &writable);

        let mut env = self.config().env.clone();
        env.extend(options.env.clone());
        let run_options = RunOptions {
            cwd: Some(options.cwd.clone()),
            env,
            timeout: options
                .timeout
                .or(self.config().timeout_ms.map(Duration::from_millis)),
            stdin: invocation.stdin,
        };

        debug!(
            "Executing {} in {:?} (sandbox: {})",
            self.meta().id,
            options.cwd,
            options.sandbox
        );

        match ProcessRunner::spawn(&command, &args, run_options) {
            Ok(process) => ExecutionHandle::launch(process, self.parser()),
            Err(e) => ExecutionHandle::failed(e.to_string()),
        }
    }
}

/// Reject configuration that can never work
pub fn validate_config(config: &AgentConfig) -> Result<()> {
    if let Some(command) = &config.command {
        if command.trim().is_empty() {
            return Err(AgentRunnerError::configuration("agent command is empty"));
        }
    }
    if let Some(model) = &config.model {
        if model.trim().is_empty() {
            return Err(AgentRunnerError::configuration("model name is empty"));
        }
    }
    Ok(())
}

/// Probe PATH for `command`, then ask it for its version under [`DETECT_TIMEOUT`]
pub async fn detect_cli(command: &str) -> DetectResult {
    let Some(path) = command_exists(command, PATH_PROBE_TIMEOUT).await else {
        return DetectResult::unavailable(format!("{} not found on PATH", command));
    };

    let result = ProcessRunner::run(
        command,
        &["--version".to_string()],
        RunOptions::default().with_timeout(DETECT_TIMEOUT),
    )
    .await;

    if result.timed_out {
        return DetectResult {
            executable_path: Some(path),
            ..DetectResult::unavailable(format!(
                "{} --version timed out after {}s",
                command,
                DETECT_TIMEOUT.as_secs()
            ))
        };
    }
    if !result.success {
        return DetectResult {
            executable_path: Some(path),
            ..DetectResult::unavailable(
                result
                    .error
                    .unwrap_or_else(|| format!("{} --version failed", command)),
            )
        };
    }

    let version = extract_version(&result.stdout).or_else(|| extract_version(&result.stderr));
    debug!("Detected {} {:?} at {:?}", command, version, path);

    DetectResult {
        available: true,
        version,
        executable_path: Some(path),
        error: None,
    }
}

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+\.\d+(?:\.\d+)?(?:-[0-9A-Za-z][0-9A-Za-z.]*)?").expect("version pattern is valid")
});

/// First semantic version found in freeform text
pub fn extract_version(text: &str) -> Option<String> {
    VERSION_RE.find(text).map(|m| m.as_str().to_string())
}

/// Collapse a third-party error payload into one display string
pub fn extract_error_message(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            if let Some(message) = map.get("message").and_then(Value::as_str) {
                return message.to_string();
            }
            for key in ["error", "data"] {
                if let Some(inner) = map.get(key).filter(|inner| !inner.is_null()) {
                    return extract_error_message(inner);
                }
            }
            value.to_string()
        }
        Value::Null => "unknown error".to_string(),
        other => other.to_string(),
    }
}

/// Parse a protocol line as a JSON object; anything else is dropped
pub(crate) fn parse_json_line(line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        if !trimmed.is_empty() {
            trace!("Skipping non-JSON line: {}", trimmed);
        }
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) => None,
        Err(e) => {
            trace!("Skipping malformed line ({}): {}", e, trimmed);
            None
        }
    }
}

/// Render tool output that may be a string, an array of text blocks, or anything else
pub(crate) fn content_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => content_to_string(item),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Append context file references to a prompt
pub fn prompt_with_files(prompt: &str, files: &[PathBuf]) -> String {
    if files.is_empty() {
        return prompt.to_string();
    }
    let mut out = String::from(prompt);
    out.push_str("\n\nRelevant files:\n");
    for file in files {
        out.push_str(&format!("- {}\n", file.display()));
    }
    out
}

/// Windows `.cmd` shims mangle quoting, so prompts go through stdin there
pub(crate) fn prompt_via_stdin() -> bool {
    cfg!(target_os = "windows")
}

fn home_state_dirs(dirs: &[&str]) -> Vec<PathBuf> {
    let Some(home) = std::env::var_os("HOME").map(PathBuf::from) else {
        return Vec::new();
    };
    dirs.iter().map(|dir| home.join(dir)).collect()
}

/// Closed set of supported agent CLIs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Claude,
    Codex,
    OpenCode,
    Gemini,
}

impl AgentKind {
    pub const ALL: [AgentKind; 4] = [Self::Claude, Self::Codex, Self::OpenCode, Self::Gemini];

    /// Parse agent kind from string
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "claude" | "claude-code" | "claudecode" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            "opencode" => Ok(Self::OpenCode),
            "gemini" | "gemini-cli" | "geminicli" => Ok(Self::Gemini),
            _ => Err(AgentRunnerError::UnknownAgent {
                agent_id: s.to_string(),
            }),
        }
    }

    /// Registry identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::OpenCode => "opencode",
            Self::Gemini => "gemini",
        }
    }

    /// A fresh, uninitialized adapter
    pub fn create_plugin(&self) -> Box<dyn AgentPlugin> {
        match self {
            Self::Claude => Box::new(claude::ClaudePlugin::new()),
            Self::Codex => Box::new(codex::CodexPlugin::new()),
            Self::OpenCode => Box::new(opencode::OpenCodePlugin::new()),
            Self::Gemini => Box::new(gemini::GeminiPlugin::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agent_kind_parse() {
        assert_eq!(AgentKind::parse("claude-code").unwrap(), AgentKind::Claude);
        assert_eq!(AgentKind::parse("Codex").unwrap(), AgentKind::Codex);
        assert_eq!(AgentKind::parse("opencode").unwrap(), AgentKind::OpenCode);
        assert_eq!(AgentKind::parse("gemini-cli").unwrap(), AgentKind::Gemini);
        assert!(matches!(
            AgentKind::parse("unknown"),
            Err(AgentRunnerError::UnknownAgent { .. })
        ));
    }

    #[test]
    fn test_extract_version() {
        assert_eq!(extract_version("1.0.33 (Claude Code)").as_deref(), Some("1.0.33"));
        assert_eq!(extract_version("codex-cli 0.46.0").as_deref(), Some("0.46.0"));
        assert_eq!(extract_version("v2.1").as_deref(), Some("2.1"));
        assert_eq!(
            extract_version("opencode 0.15.2-beta.1\n").as_deref(),
            Some("0.15.2-beta.1")
        );
        assert_eq!(extract_version("no version here"), None);
    }

    #[test]
    fn test_extract_error_message() {
        assert_eq!(extract_error_message(&json!("plain")), "plain");
        assert_eq!(extract_error_message(&json!({"message": "msg"})), "msg");
        assert_eq!(
            extract_error_message(&json!({"error": {"message": "nested"}})),
            "nested"
        );
        assert_eq!(extract_error_message(&json!({"error": "flat"})), "flat");
        assert_eq!(
            extract_error_message(&json!({"name": "AuthError", "data": {"message": "no key"}})),
            "no key"
        );
        assert_eq!(extract_error_message(&json!({"code": 42})), r#"{"code":42}"#);
        assert_eq!(extract_error_message(&json!(null)), "unknown error");
        assert_eq!(extract_error_message(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn test_parse_json_line() {
        assert!(parse_json_line(r#"{"type":"x"}"#).is_some());
        assert!(parse_json_line("  {\"type\":\"x\"}\r").is_some());
        assert!(parse_json_line("plain text").is_none());
        assert!(parse_json_line("{broken").is_none());
        assert!(parse_json_line("").is_none());
    }

    #[test]
    fn test_content_to_string() {
        assert_eq!(content_to_string(&json!("out")), "out");
        assert_eq!(
            content_to_string(&json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}])),
            "a\nb"
        );
        assert_eq!(content_to_string(&json!(null)), "");
    }

    #[test]
    fn test_prompt_with_files() {
        assert_eq!(prompt_with_files("do it", &[]), "do it");
        let prompt = prompt_with_files("do it", &[PathBuf::from("src/lib.rs")]);
        assert!(prompt.starts_with("do it\n\nRelevant files:\n"));
        assert!(prompt.contains("- src/lib.rs"));
    }

    #[test]
    fn test_validate_config() {
        assert!(validate_config(&AgentConfig::default()).is_ok());
        assert!(validate_config(&AgentConfig::default().with_command("  ")).is_err());
        assert!(validate_config(&AgentConfig::default().with_model("")).is_err());
    }

    #[tokio::test]
    async fn test_detect_missing_cli() {
        let result = detect_cli("definitely-not-an-agent-4242").await;
        assert!(!result.available);
        assert!(result.error.unwrap().contains("not found"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_detect_reads_version() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-agent");
        std::fs::write(&script, "#!/bin/sh\necho \"fake-agent version 3.4.5\"\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let result = detect_cli(script.to_str().unwrap()).await;
        assert!(result.available);
        assert_eq!(result.version.as_deref(), Some("3.4.5"));
        assert_eq!(result.executable_path.as_deref(), Some(script.as_path()));
    }
}
