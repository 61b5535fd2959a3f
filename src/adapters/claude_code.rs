//! Claude Code engine - line-stream JSON schema with a usage record.
//!
//! Response text accumulates from `assistant` records; the terminal
//! `result` record carries the final text and token usage. Permission
//! prompts are bypassed with a flag.

use super::engine::{Engine, EngineConfig, ParsedStream, StreamError};
use std::path::PathBuf;
use std::time::Duration;

/// Claude Code engine configuration.
#[derive(Debug, Clone)]
pub struct ClaudeCodeConfig {
    /// Shared engine config.
    pub base: EngineConfig,
    /// Optional model identifier.
    pub model: Option<String>,
}

impl ClaudeCodeConfig {
    /// Creates a config for the given binary.
    pub fn new(binary_path: PathBuf) -> Self {
        Self {
            base: EngineConfig::new("claude-code", binary_path)
                .with_arg("-p")
                .with_arg("--output-format")
                .with_arg("stream-json")
                .with_arg("--verbose")
                .with_arg("--dangerously-skip-permissions")
                .with_timeout(Duration::from_secs(1800)),
            model: None,
        }
    }

    /// Sets the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

impl Default for ClaudeCodeConfig {
    fn default() -> Self {
        Self::new(PathBuf::from("claude"))
    }
}

/// Claude Code engine.
#[derive(Debug)]
pub struct ClaudeCodeEngine {
    config: EngineConfig,
}

impl ClaudeCodeEngine {
    /// Creates an engine from the config.
    #[must_use]
    pub fn new(config: ClaudeCodeConfig) -> Self {
        let mut base = config.base;
        if let Some(model) = config.model {
            base = base.with_arg("--model").with_arg(model);
        }
        Self { config: base }
    }

    /// Creates an engine with defaults.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(ClaudeCodeConfig::default())
    }
}

impl Engine for ClaudeCodeEngine {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn parse(&self, raw: &str) -> ParsedStream {
        let mut parsed = ParsedStream::default();
        let mut assistant_text = String::new();
        let mut result_text: Option<String> = None;

        for line in raw.lines() {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            match value["type"].as_str() {
                Some("result") => {
                    if let Some(text) = value["result"].as_str() {
                        result_text = Some(text.to_string());
                    }
                    parsed.input_tokens = value["usage"]["input_tokens"].as_u64();
                    parsed.output_tokens = value["usage"]["output_tokens"].as_u64();
                    if value["is_error"].as_bool() == Some(true) {
                        let subtype = value["subtype"].as_str().unwrap_or("error");
                        parsed.error = Some(StreamError::new(
                            subtype,
                            value["result"].as_str().unwrap_or("unspecified engine error"),
                        ));
                    }
                }
                Some("assistant") => {
                    if let Some(blocks) = value["message"]["content"].as_array() {
                        for block in blocks {
                            if block["type"].as_str() == Some("text") {
                                if let Some(text) = block["text"].as_str() {
                                    assistant_text.push_str(text);
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        // The terminal record supersedes accumulated assistant text.
        parsed.response_text = result_text.unwrap_or(assistant_text);
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_has_skip_permissions_flag() {
        let config = ClaudeCodeConfig::default();
        assert!(config
            .base
            .args
            .contains(&"--dangerously-skip-permissions".to_string()));
        assert!(config.base.args.contains(&"stream-json".to_string()));
    }

    #[test]
    fn model_becomes_an_argument() {
        let engine = ClaudeCodeEngine::new(ClaudeCodeConfig::default().with_model("opus"));
        assert!(engine.config.args.contains(&"--model".to_string()));
    }

    #[test]
    fn result_record_wins_and_carries_usage() {
        let engine = ClaudeCodeEngine::with_defaults();
        let raw = concat!(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"working..."}]}}"#,
            "\n",
            r#"{"type":"result","subtype":"success","is_error":false,"result":"Added the tests.","usage":{"input_tokens":900,"output_tokens":120}}"#,
        );

        let parsed = engine.parse(raw);
        assert_eq!(parsed.response_text, "Added the tests.");
        assert_eq!(parsed.input_tokens, Some(900));
        assert_eq!(parsed.output_tokens, Some(120));
        assert!(parsed.error.is_none());
        assert_eq!(parsed.metric, None);
    }

    #[test]
    fn error_result_is_an_error_payload() {
        let engine = ClaudeCodeEngine::with_defaults();
        let raw = r#"{"type":"result","subtype":"error_during_execution","is_error":true,"result":"credit exhausted"}"#;

        let parsed = engine.parse(raw);
        let error = parsed.error.expect("error payload");
        assert_eq!(error.code, "error_during_execution");
        assert_eq!(error.message, "credit exhausted");
    }

    #[test]
    fn assistant_text_used_without_result_record() {
        let engine = ClaudeCodeEngine::with_defaults();
        let raw = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"partial"}]}}"#;
        assert_eq!(engine.parse(raw).response_text, "partial");
    }
}
