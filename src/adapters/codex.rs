//! Codex engine - line-stream JSON schema with duration reporting.
//!
//! Response text arrives in `agent_message` records; the terminal
//! `task_complete` record carries the wall-clock duration instead of
//! token counts. Permission prompts are bypassed with a flag.

use super::engine::{Engine, EngineConfig, Metric, ParsedStream, StreamError};
use std::path::PathBuf;
use std::time::Duration;

/// Codex engine configuration.
#[derive(Debug, Clone)]
pub struct CodexConfig {
    /// Shared engine config.
    pub base: EngineConfig,
    /// Optional model identifier.
    pub model: Option<String>,
}

impl CodexConfig {
    /// Creates a config for the given binary.
    pub fn new(binary_path: PathBuf) -> Self {
        Self {
            base: EngineConfig::new("codex", binary_path)
                .with_arg("exec")
                .with_arg("--json")
                .with_arg("--skip-git-repo-check")
                .with_arg("--dangerously-bypass-approvals-and-sandbox")
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

impl Default for CodexConfig {
    fn default() -> Self {
        Self::new(PathBuf::from("codex"))
    }
}

/// Codex engine.
#[derive(Debug)]
pub struct CodexEngine {
    config: EngineConfig,
}

impl CodexEngine {
    /// Creates an engine from the config.
    #[must_use]
    pub fn new(config: CodexConfig) -> Self {
        let mut base = config.base;
        if let Some(model) = config.model {
            base = base.with_arg("--model").with_arg(model);
        }
        Self { config: base }
    }

    /// Creates an engine with defaults.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(CodexConfig::default())
    }
}

impl Engine for CodexEngine {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn parse(&self, raw: &str) -> ParsedStream {
        let mut parsed = ParsedStream::default();

        for line in raw.lines() {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            let msg = &value["msg"];
            match msg["type"].as_str() {
                Some("agent_message") => {
                    if let Some(text) = msg["message"].as_str() {
                        if !parsed.response_text.is_empty() {
                            parsed.response_text.push('\n');
                        }
                        parsed.response_text.push_str(text);
                    }
                }
                Some("task_complete") => {
                    if let Some(ms) = msg["duration_ms"].as_u64() {
                        parsed.metric = Some(Metric::DurationMs(ms));
                    }
                }
                Some("error") => {
                    let message = msg["message"].as_str().unwrap_or("unspecified engine error");
                    parsed.error = Some(StreamError::new("codex_error", message));
                }
                _ => {}
            }
        }

        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_has_bypass_flag() {
        let config = CodexConfig::default();
        assert!(config
            .base
            .args
            .contains(&"--dangerously-bypass-approvals-and-sandbox".to_string()));
    }

    #[test]
    fn parses_messages_and_duration() {
        let engine = CodexEngine::with_defaults();
        let raw = concat!(
            r#"{"id":"1","msg":{"type":"agent_message","message":"Done with the route."}}"#,
            "\n",
            r#"{"id":"2","msg":{"type":"task_complete","duration_ms":5120}}"#,
        );

        let parsed = engine.parse(raw);
        assert_eq!(parsed.response_text, "Done with the route.");
        assert_eq!(parsed.metric, Some(Metric::DurationMs(5120)));
        assert_eq!(parsed.input_tokens, None);
        assert_eq!(parsed.output_tokens, None);
    }

    #[test]
    fn parses_error_record() {
        let engine = CodexEngine::with_defaults();
        let raw = r#"{"id":"1","msg":{"type":"error","message":"sandbox exploded"}}"#;

        let parsed = engine.parse(raw);
        assert_eq!(parsed.error.unwrap().message, "sandbox exploded");
    }

    #[test]
    fn multiple_messages_join_with_newline() {
        let engine = CodexEngine::with_defaults();
        let raw = concat!(
            r#"{"msg":{"type":"agent_message","message":"first"}}"#,
            "\n",
            r#"{"msg":{"type":"agent_message","message":"second"}}"#,
        );
        assert_eq!(engine.parse(raw).response_text, "first\nsecond");
    }
}
