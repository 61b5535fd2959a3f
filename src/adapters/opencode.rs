//! `OpenCode` engine - JSON-per-line streaming schema.
//!
//! Response text arrives as `text` records; a terminal `step_finish`
//! record carries token counts and the per-step actual cost. Permission
//! prompts are bypassed through an environment variable.

use super::engine::{Engine, EngineConfig, Metric, ParsedStream, StreamError};
use std::path::PathBuf;
use std::time::Duration;

/// `OpenCode` engine configuration.
#[derive(Debug, Clone)]
pub struct OpenCodeConfig {
    /// Shared engine config.
    pub base: EngineConfig,
    /// Optional model identifier.
    pub model: Option<String>,
}

impl OpenCodeConfig {
    /// Creates a config for the given binary.
    pub fn new(binary_path: PathBuf) -> Self {
        Self {
            base: EngineConfig::new("opencode", binary_path)
                .with_arg("run")
                .with_arg("--print-logs")
                .with_arg("--format")
                .with_arg("json")
                .with_env("OPENCODE_PERMISSION", r#"{"*":"allow"}"#)
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

impl Default for OpenCodeConfig {
    fn default() -> Self {
        Self::new(PathBuf::from("opencode"))
    }
}

/// `OpenCode` engine.
#[derive(Debug)]
pub struct OpenCodeEngine {
    config: EngineConfig,
}

impl OpenCodeEngine {
    /// Creates an engine from the config.
    #[must_use]
    pub fn new(config: OpenCodeConfig) -> Self {
        let mut base = config.base;
        if let Some(model) = config.model {
            base = base.with_arg("--model").with_arg(model);
        }
        Self { config: base }
    }

    /// Creates an engine with defaults.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(OpenCodeConfig::default())
    }
}

impl Engine for OpenCodeEngine {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn parse(&self, raw: &str) -> ParsedStream {
        let mut parsed = ParsedStream::default();
        let mut input_tokens: u64 = 0;
        let mut output_tokens: u64 = 0;
        let mut cost: f64 = 0.0;
        let mut saw_step_finish = false;

        for line in raw.lines() {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            match value["type"].as_str() {
                Some("text") => {
                    if let Some(text) = value["text"].as_str() {
                        parsed.response_text.push_str(text);
                    }
                }
                Some("step_finish") => {
                    saw_step_finish = true;
                    input_tokens += value["tokens"]["input"].as_u64().unwrap_or(0);
                    output_tokens += value["tokens"]["output"].as_u64().unwrap_or(0);
                    cost += value["cost"].as_f64().unwrap_or(0.0);
                }
                Some("error") => {
                    let name = value["error"]["name"].as_str().unwrap_or("error");
                    let message = value["error"]["message"]
                        .as_str()
                        .unwrap_or("unspecified engine error");
                    parsed.error = Some(StreamError::new(name, message));
                }
                _ => {}
            }
        }

        if saw_step_finish {
            parsed.input_tokens = Some(input_tokens);
            parsed.output_tokens = Some(output_tokens);
            parsed.metric = Some(Metric::CostUsd(cost));
        }
        parsed
    }
}
