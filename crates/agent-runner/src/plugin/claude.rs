//! Claude Code adapter (`claude --print --output-format stream-json`)

use std::path::PathBuf;

use serde_json::Value;

use super::{
    content_to_string, extract_error_message, parse_json_line, prompt_with_files, validate_config,
    AgentCapabilities, AgentMeta, AgentPlugin, Invocation, OutputFormat, ProtocolParser,
};
use crate::config::{AgentConfig, ExecuteOptions};
use crate::error::Result;
use crate::event::DisplayEvent;

const COMMAND: &str = if cfg!(target_os = "windows") {
    "claude.cmd"
} else {
    "claude"
};

pub struct ClaudePlugin {
    meta: AgentMeta,
    config: AgentConfig,
}

impl Default for ClaudePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaudePlugin {
    pub fn new() -> Self {
        Self {
            meta: AgentMeta {
                id: "claude",
                name: "Claude Code",
                description: "Anthropic's agentic coding CLI",
                default_command: COMMAND,
                capabilities: AgentCapabilities {
                    supports_streaming: true,
                    supports_interrupt: true,
                    output_format: OutputFormat::StreamJson,
                    skill_paths: &["~/.claude/skills", ".claude/skills"],
                },
                state_dirs: &[".claude"],
            },
            config: AgentConfig::default(),
        }
    }
}

impl AgentPlugin for ClaudePlugin {
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

    fn build_args(&self, prompt: &str, files: &[PathBuf], _options: &ExecuteOptions) -> Invocation {
        let mut args: Vec<String> = ["--print", "--verbose", "--output-format", "stream-json"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(model) = &self.config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if self.config.auto_approve {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args.extend(self.config.extra_args.iter().cloned());

        // `--print` reads the prompt from stdin on every platform
        Invocation {
            command: self.command().to_string(),
            args,
            stdin: Some(prompt_with_files(prompt, files)),
        }
    }

    fn parser(&self) -> Box<dyn ProtocolParser> {
        Box::new(ClaudeParser)
    }
}

/// Parser for Claude's stream-json records
pub struct ClaudeParser;

impl ProtocolParser for ClaudeParser {
    fn parse_line(&mut self, line: &str) -> Vec<DisplayEvent> {
        let Some(value) = parse_json_line(line) else {
            return Vec::new();
        };

        match value["type"].as_str() {
            Some("assistant") => content_blocks(&value)
                .filter_map(|block| match block["type"].as_str() {
                    Some("text") => block["text"]
                        .as_str()
                        .filter(|t| !t.trim().is_empty())
                        .map(DisplayEvent::text),
                    Some("tool_use") => Some(DisplayEvent::ToolUse {
                        name: block["name"].as_str().unwrap_or("unknown").to_string(),
                        id: block["id"].as_str().map(String::from),
                        input: block["input"].clone(),
                    }),
                    _ => None,
                })
                .collect(),
            Some("user") => content_blocks(&value)
                .filter(|block| block["type"] == "tool_result")
                .map(|block| DisplayEvent::ToolResult {
                    id: block["tool_use_id"].as_str().map(String::from),
                    output: content_to_string(&block["content"]),
                    is_error: block["is_error"].as_bool().unwrap_or(false),
                })
                .collect(),
            // The success result repeats the last assistant message
            Some("result") if is_error_result(&value) => {
                let message = value["result"]
                    .as_str()
                    .filter(|s| !s.is_empty())
                    .or_else(|| value["subtype"].as_str())
                    .unwrap_or("agent reported an error");
                vec![DisplayEvent::error(message)]
            }
            Some("error") => {
                let payload = value.get("error").unwrap_or(&value);
                vec![DisplayEvent::error(extract_error_message(payload))]
            }
            _ => Vec::new(),
        }
    }
}

fn content_blocks(value: &Value) -> impl Iterator<Item = &Value> {
    value["message"]["content"]
        .as_array()
        .into_iter()
        .flatten()
}

fn is_error_result(value: &Value) -> bool {
    value["is_error"].as_bool().unwrap_or(false)
        || value["subtype"]
            .as_str()
            .is_some_and(|s| s.starts_with("error"))
}
