//! Gemini CLI adapter (`gemini --output-format stream-json`)

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
    "gemini.cmd"
} else {
    "gemini"
};

pub struct GeminiPlugin {
    meta: AgentMeta,
    config: AgentConfig,
}

impl Default for GeminiPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiPlugin {
    pub fn new() -> Self {
        Self {
            meta: AgentMeta {
                id: "gemini",
                name: "Gemini CLI",
                description: "Google's Gemini command-line agent",
                default_command: COMMAND,
                capabilities: AgentCapabilities {
                    supports_streaming: true,
                    supports_interrupt: true,
                    output_format: OutputFormat::StreamJson,
                    skill_paths: &["~/.gemini/extensions", ".gemini/extensions"],
                },
                state_dirs: &[".gemini"],
            },
            config: AgentConfig::default(),
        }
    }
}

impl AgentPlugin for GeminiPlugin {
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
        let mut args = vec!["--output-format".to_string(), "stream-json".to_string()];
        if let Some(model) = &self.config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if self.config.auto_approve {
            args.push("--yolo".to_string());
        }
        args.extend(self.config.extra_args.iter().cloned());

        let prompt = prompt_with_files(prompt, files);
        let stdin = if prompt_via_stdin() {
            Some(prompt)
        } else {
            args.push("--prompt".to_string());
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
        Box::new(GeminiParser::default())
    }
}

/// Parser for Gemini's stream-json records.
///
/// Assistant text arrives as deltas. Completed lines are released as soon
/// as a delta ends them; the unfinished last line waits for the next
/// newline, another record type or the end of output. Joining the emitted
/// text events with newlines reproduces the streamed text.
#[derive(Debug, Default)]
pub struct GeminiParser {
    pending_text: String,
}

impl GeminiParser {
    fn flush(&mut self) -> Option<DisplayEvent> {
        if self.pending_text.trim().is_empty() {
            self.pending_text.clear();
            return None;
        }
        Some(DisplayEvent::text(std::mem::take(&mut self.pending_text)))
    }

    /// Emit everything before the last newline of the pending text
    fn release_lines(&mut self) -> Option<DisplayEvent> {
        let cut = self.pending_text.rfind('\n')?;
        let rest = self.pending_text.split_off(cut + 1);
        let mut done = std::mem::replace(&mut self.pending_text, rest);
        done.pop();
        (!done.trim().is_empty()).then(|| DisplayEvent::text(done))
    }
}

impl ProtocolParser for GeminiParser {
    fn parse_line(&mut self, line: &str) -> Vec<DisplayEvent> {
        let Some(value) = parse_json_line(line) else {
            return Vec::new();
        };

        if value["type"] == "message" {
            if value["role"] != "assistant" {
                return Vec::new();
            }
            let content = value["content"].as_str().unwrap_or_default();
            if value["delta"].as_bool().unwrap_or(false) {
                self.pending_text.push_str(content);
                return self.release_lines().into_iter().collect();
            }
            let mut events: Vec<DisplayEvent> = self.flush().into_iter().collect();
            if !content.trim().is_empty() {
                events.push(DisplayEvent::text(content));
            }
            return events;
        }

        let mut events: Vec<DisplayEvent> = self.flush().into_iter().collect();
        events.extend(record_event(&value));
        events
    }

    fn finish(&mut self) -> Vec<DisplayEvent> {
        self.flush().into_iter().collect()
    }
}

fn record_event(value: &Value) -> Option<DisplayEvent> {
    match value["type"].as_str()? {
        "tool_use" => Some(DisplayEvent::ToolUse {
            name: value["tool_name"].as_str().unwrap_or("unknown").to_string(),
            id: value["tool_id"].as_str().map(String::from),
            input: value["parameters"].clone(),
        }),
        "tool_result" => {
            let is_error = value["status"] == "error";
            let output = if is_error {
                extract_error_message(&value["error"])
            } else {
                value["output"].as_str().unwrap_or_default().to_string()
            };
            Some(DisplayEvent::ToolResult {
                id: value["tool_id"].as_str().map(String::from),
                output,
                is_error,
            })
        }
        "error" => Some(DisplayEvent::error(extract_error_message(value))),
        "result" if value["status"] == "error" => {
            Some(DisplayEvent::error(extract_error_message(&value["error"])))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_args() {
        let plugin = GeminiPlugin::new();
        let invocation = plugin.build_args("write docs", &[], &ExecuteOptions::new("/work"));
        assert_eq!(&invocation.args[..2], &["--output-format", "stream-json"]);
        assert!(invocation.args.contains(&"--yolo".to_string()));
        if !prompt_via_stdin() {
            assert!(invocation.args.ends_with(&["--prompt".to_string(), "write docs".to_string()]));
        }
    }

    #[test]
    fn test_deltas_join_into_one_text_event() {
        let mut parser = GeminiParser::default();
        let delta = |text: &str| {
            json!({"type": "message", "role": "assistant", "content": text, "delta": true}).to_string()
        };
        assert!(parser.parse_line(&delta("I'll start ")).is_empty());
        assert!(parser.parse_line(&delta("by reading the file.")).is_empty());

        let events = parser.parse_line(
            &json!({"type": "tool_use", "tool_name": "read_file", "tool_id": "t1", "parameters": {"path": "a.rs"}})
                .to_string(),
        );
        assert_eq!(
            events,
            vec![
                DisplayEvent::text("I'll start by reading the file."),
                DisplayEvent::ToolUse {
                    name: "read_file".into(),
                    id: Some("t1".into()),
                    input: json!({"path": "a.rs"}),
                },
            ]
        );
    }

    #[test]
    fn test_completed_lines_are_released_early() {
        let mut parser = GeminiParser::default();
        let delta = |text: &str| {
            json!({"type": "message", "role": "assistant", "content": text, "delta": true}).to_string()
        };
        assert!(parser.parse_line(&delta("Plan:")).is_empty());
        assert_eq!(
            parser.parse_line(&delta(" fix auth\n1. read")),
            vec![DisplayEvent::text("Plan: fix auth")]
        );
        assert!(parser.parse_line(&delta(" the code")).is_empty());
        assert_eq!(
            parser.parse_line(&delta("\n2. patch\n")),
            vec![DisplayEvent::text("1. read the code\n2. patch")]
        );
        assert!(parser.finish().is_empty());

        let mut parser = GeminiParser::default();
        let mut events = parser.parse_line(&delta("one\ntw"));
        events.extend(parser.parse_line(&delta("o")));
        events.extend(parser.finish());
        assert_eq!(crate::event::join_text(&events), "one\ntwo");
    }

    #[test]
    fn test_finish_flushes_pending_text() {
        let mut parser = GeminiParser::default();
        parser.parse_line(
            &json!({"type": "message", "role": "assistant", "content": "done", "delta": true}).to_string(),
        );
        assert_eq!(parser.finish(), vec![DisplayEvent::text("done")]);
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn test_user_messages_ignored() {
        let mut parser = GeminiParser::default();
        let line = json!({"type": "message", "role": "user", "content": "the prompt"}).to_string();
        assert!(parser.parse_line(&line).is_empty());
    }

    #[test]
    fn test_tool_results() {
        let mut parser = GeminiParser::default();
        let ok = json!({"type": "tool_result", "tool_id": "t1", "status": "success", "output": "contents"});
        assert_eq!(
            parser.parse_line(&ok.to_string()),
            vec![DisplayEvent::ToolResult {
                id: Some("t1".into()),
                output: "contents".into(),
                is_error: false,
            }]
        );

        let failed = json!({"type": "tool_result", "tool_id": "t2", "status": "error",
                            "error": {"type": "invalid_tool_params", "message": "path required"}});
        assert_eq!(
            parser.parse_line(&failed.to_string()),
            vec![DisplayEvent::ToolResult {
                id: Some("t2".into()),
                output: "path required".into(),
                is_error: true,
            }]
        );
    }

    #[test]
    fn test_errors_and_results() {
        let mut parser = GeminiParser::default();
        assert_eq!(
            parser.parse_line(&json!({"type": "error", "severity": "error", "message": "quota"}).to_string()),
            vec![DisplayEvent::error("quota")]
        );
        assert!(parser
            .parse_line(&json!({"type": "result", "status": "success", "stats": {}}).to_string())
            .is_empty());
        assert_eq!(
            parser.parse_line(
                &json!({"type": "result", "status": "error", "error": {"message": "aborted"}}).to_string()
            ),
            vec![DisplayEvent::error("aborted")]
        );
        assert!(parser.parse_line(&json!({"type": "init", "session_id": "s"}).to_string()).is_empty());
        assert!(parser.parse_line("Loaded cached credentials.").is_empty());
    }
}
