//! Codex adapter (`codex exec --json`)

use std::path::PathBuf;

use serde_json::{json, Value};

use super::{
    content_to_string, extract_error_message, parse_json_line, prompt_via_stdin, prompt_with_files,
    validate_config, AgentCapabilities, AgentMeta, AgentPlugin, Invocation, OutputFormat,
    ProtocolParser,
};
use crate::config::{AgentConfig, ExecuteOptions};
use crate::error::Result;
use crate::event::DisplayEvent;
use crate::sandbox::SandboxMode;

const COMMAND: &str = if cfg!(target_os = "windows") {
    "codex.cmd"
} else {
    "codex"
};

pub struct CodexPlugin {
    meta: AgentMeta,
    config: AgentConfig,
}

impl Default for CodexPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl CodexPlugin {
    pub fn new() -> Self {
        Self {
            meta: AgentMeta {
                id: "codex",
                name: "Codex",
                description: "OpenAI's Codex CLI",
                default_command: COMMAND,
                capabilities: AgentCapabilities {
                    supports_streaming: true,
                    supports_interrupt: true,
                    output_format: OutputFormat::Jsonl,
                    skill_paths: &["~/.codex/skills", ".codex/skills"],
                },
                state_dirs: &[".codex"],
            },
            config: AgentConfig::default(),
        }
    }
}

impl AgentPlugin for CodexPlugin {
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

    fn build_args(&self, prompt: &str, files: &[PathBuf], options: &ExecuteOptions) -> Invocation {
        let mut args: Vec<String> = ["exec", "--json", "--skip-git-repo-check"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(model) = &self.config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if self.config.auto_approve {
            // Codex's own sandbox cannot nest inside ours
            if options.sandbox == SandboxMode::Off {
                args.push("--full-auto".to_string());
            } else {
                args.push("--dangerously-bypass-approvals-and-sandbox".to_string());
            }
        }
        args.extend(self.config.extra_args.iter().cloned());

        let prompt = prompt_with_files(prompt, files);
        let stdin = if prompt_via_stdin() {
            args.push("-".to_string());
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
        Box::new(CodexParser)
    }
}

/// Parser for `codex exec --json` records
pub struct CodexParser;

impl ProtocolParser for CodexParser {
    fn parse_line(&mut self, line: &str) -> Vec<DisplayEvent> {
        let Some(value) = parse_json_line(line) else {
            return Vec::new();
        };

        match value["type"].as_str() {
            Some("item.started") => item_started(&value["item"]).into_iter().collect(),
            Some("item.completed") => item_completed(&value["item"]).into_iter().collect(),
            Some("turn.failed") => vec![DisplayEvent::error(extract_error_message(&value["error"]))],
            Some("error") => vec![DisplayEvent::error(extract_error_message(&value))],
            _ => Vec::new(),
        }
    }
}

fn item_started(item: &Value) -> Option<DisplayEvent> {
    let id = item["id"].as_str().map(String::from);
    match item["type"].as_str()? {
        "command_execution" => Some(DisplayEvent::ToolUse {
            name: "command".to_string(),
            id,
            input: json!({ "command": item["command"] }),
        }),
        "mcp_tool_call" => Some(DisplayEvent::ToolUse {
            name: item["tool"].as_str().unwrap_or("mcp").to_string(),
            id,
            input: item["arguments"].clone(),
        }),
        _ => None,
    }
}

fn item_completed(item: &Value) -> Option<DisplayEvent> {
    let id = item["id"].as_str().map(String::from);
    match item["type"].as_str()? {
        "agent_message" => item["text"]
            .as_str()
            .filter(|t| !t.trim().is_empty())
            .map(DisplayEvent::text),
        "command_execution" => Some(DisplayEvent::ToolResult {
            id,
            output: item["aggregated_output"].as_str().unwrap_or_default().to_string(),
            is_error: item["exit_code"].as_i64().is_some_and(|code| code != 0)
                || item["status"] == "failed",
        }),
        "file_change" => Some(DisplayEvent::ToolUse {
            name: "file_change".to_string(),
            id,
            input: item["changes"].clone(),
        }),
        "mcp_tool_call" => Some(DisplayEvent::ToolResult {
            id,
            output: content_to_string(&item["result"]),
            is_error: item["status"] == "failed",
        }),
        "error" => Some(DisplayEvent::error(extract_error_message(item))),
        _ => None,
    }
}
