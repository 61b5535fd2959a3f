//! Kilo engine - single full-auto JSON document schema.
//!
//! The runtime runs fully autonomous and prints one JSON document on
//! exit; there is no token or cost reporting. No bypass flag exists
//! because full-auto mode never prompts.

use super::engine::{Engine, EngineConfig, ParsedStream, StreamError};
use std::path::PathBuf;
use std::time::Duration;

/// Kilo engine configuration.
#[derive(Debug, Clone)]
pub struct KiloConfig {
    /// Shared engine config.
    pub base: EngineConfig,
}

impl KiloConfig {
    /// Creates a config for the given binary.
    pub fn new(binary_path: PathBuf) -> Self {
        Self {
            base: EngineConfig::new("kilo", binary_path)
                .with_arg("--auto")
                .with_arg("--output")
                .with_arg("json")
                .with_timeout(Duration::from_secs(1800)),
        }
    }
}

impl Default for KiloConfig {
    fn default() -> Self {
        Self::new(PathBuf::from("kilo"))
    }
}

/// Kilo engine.
#[derive(Debug)]
pub struct KiloEngine {
    config: EngineConfig,
}

impl KiloEngine {
    /// Creates an engine from the config.
    #[must_use]
    pub fn new(config: KiloConfig) -> Self {
        Self { config: config.base }
    }

    /// Creates an engine with defaults.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(KiloConfig::default())
    }
}

impl Engine for KiloEngine {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn parse(&self, raw: &str) -> ParsedStream {
        let mut parsed = ParsedStream::default();

        let Ok(value) = serde_json::from_str::<serde_json::Value>(raw.trim()) else {
            return parsed;
        };

        if let Some(text) = value["response"].as_str() {
            parsed.response_text = text.to_string();
        }
        if value["status"].as_str() == Some("error") {
            let message = value["error"].as_str().unwrap_or("unspecified engine error");
            parsed.error = Some(StreamError::new("kilo_error", message));
        }

        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_is_full_auto() {
        let config = KiloConfig::default();
        assert!(config.base.args.contains(&"--auto".to_string()));
    }

    #[test]
    fn parses_single_document() {
        let engine = KiloEngine::with_defaults();
        let parsed = engine.parse(r#"{"status":"ok","response":"Wrote the migration."}"#);

        assert_eq!(parsed.response_text, "Wrote the migration.");
        assert!(parsed.error.is_none());
        assert_eq!(parsed.input_tokens, None);
        assert_eq!(parsed.metric, None);
    }

    #[test]
    fn parses_error_status() {
        let engine = KiloEngine::with_defaults();
        let parsed = engine.parse(r#"{"status":"error","error":"model refused"}"#);

        assert_eq!(parsed.error.unwrap().message, "model refused");
    }

    #[test]
    fn non_json_output_is_empty() {
        let engine = KiloEngine::with_defaults();
        assert!(engine.parse("segfault").is_empty());
    }
}
