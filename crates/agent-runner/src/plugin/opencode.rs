//! OpenCode adapter (`opencode run --format json`)

use std::path::PathBuf;

use serde_json::Value;

use super::{
    extract_error_message, parse_json_line, prompt_via_stdin, prompt_with_files, validate_config,
    AgentCapabilities, AgentMeta, AgentPlugin, Invocation, OutputFormat, ProtocolParser,
};
use crate::config::{AgentConfig, ExecuteOptions};
use crate::error::Result;
use crate::event::DisplayEvent;

const COMMAND: &str = if cfg!(target_os = "windows") {
    "opencode.cmd"
} else {
    "opencode"
};

pub struct OpenCodePlugin {
    meta: AgentMeta,
    config: AgentConfig,
}

impl Default for OpenCodePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenCodePlugin {
    pub fn new() -> Self {
        Self {
            meta: AgentMeta {
                id: "opencode",
                name: "OpenCode",
                description: "Provider-agnostic open source coding agent",
                default_command: COMMAND,
                capabilities: AgentCapabilities {
                    supports_streaming: true,
                    supports_interrupt: true,
                    output_format: OutputFormat::Jsonl,
                    skill_paths: &["~/.config/opencode/skill", ".opencode/skill"],
                },
                state_dirs: &[".config/opencode", ".local/share/opencode", ".cache/opencode"],
            },
            config: AgentConfig::default(),
        }
    }
}

impl AgentPlugin for OpenCodePlugin {
    fn meta(&self) -> &AgentMeta {
        &self.meta
    }

    fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn initialize(&mut self, config: AgentConfig) -> Result<()> {
        validate_config(&config)?;
        self.config = config;
        Ok(())
    }

    /// OpenCode has no approval prompts in `run` mode, so `auto_approve` is moot
    fn build_args(&self, prompt: &str, files: &[PathBuf], _options: &ExecuteOptions) -> Invocation {
        let mut args = vec!["run".to_string(), "--format".to_string(), "json".to_string()];
        if let Some(model) = &self.config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.extend(self.config.extra_args.iter().cloned());

        let prompt = prompt_with_files(prompt, files);
        let stdin = if prompt_via_stdin() {
            Some(prompt)
        } else {
            args.push(prompt);
            None
        };

        Invocation {
            command: self.command().to_string(),
            args,
            stdin,
        }
    }

    fn parser(&self) -> Box<dyn ProtocolParser> {
        Box::new(OpenCodeParser)
    }
}

/// Parser for OpenCode's JSON event lines
pub struct OpenCodeParser;

impl ProtocolParser for OpenCodeParser {
    fn parse_line(&mut self, line: &str) -> Vec<DisplayEvent> {
        let Some(value) = parse_json_line(line) else {
            return Vec::new();
        };
        let part = &value["part"];

        match value["type"].as_str() {
            Some("text") => part["text"]
                .as_str()
                .filter(|t| !t.trim().is_empty())
                .map(DisplayEvent::text)
                .into_iter()
                .collect(),
            Some("tool_use") => tool_events(part),
            Some("error") => {
                let payload = value.get("error").unwrap_or(&value);
                vec![DisplayEvent::error(extract_error_message(payload))]
            }
            _ => Vec::new(),
        }
    }
}

/// OpenCode reports a tool call once it has finished, so a single line
/// yields both the call and its result
fn tool_events(part: &Value) -> Vec<DisplayEvent> {
    let id = part["callID"].as_str().map(String::from);
    let state = &part["state"];
    let mut events = vec![DisplayEvent::ToolUse {
        name: part["tool"].as_str().unwrap_or("unknown").to_string(),
        id: id.clone(),
        input: state["input"].clone(),
    }];

    match state["status"].as_str() {
        Some("completed") => events.push(DisplayEvent::ToolResult {
            id,
            output: state["output"].as_str().unwrap_or_default().to_string(),
            is_error: false,
        }),
        Some("error") => events.push(DisplayEvent::ToolResult {
            id,
            output: state["error"]
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| extract_error_message(&state["error"])),
            is_error: true,
        }),
        _ => {}
    }
    events
}
