//! Agent engines.
//!
//! Engines are the bridge between the orchestration layer and the actual
//! agent runtimes. Every engine answers the same uniform call (prompt in,
//! parsed stream out) but maps to a distinct command line and a distinct
//! response-stream schema.
//!
//! | Engine | Stream format | Tokens | Cost/duration | Bypass |
//! |--------|---------------|--------|---------------|--------|
//! | `opencode` | JSON per line | `step_finish` record | per-step cost | env var |
//! | `codex` | line-stream JSON | none | duration (ms) | flag |
//! | `kilo` | full-auto JSON doc | none | none | implicit |
//! | `claude-code` | line-stream JSON | `result` record | none | flag |

pub mod claude_code;
pub mod codex;
pub mod engine;
pub mod kilo;
pub mod opencode;

use crate::core::error::{ConductorError, Result};
use engine::Engine;
use std::sync::Arc;

/// Supported engine names.
pub const SUPPORTED_ENGINES: [&str; 4] = ["opencode", "codex", "claude-code", "kilo"];

/// Built-in engine descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineDescriptor {
    pub engine_name: &'static str,
    pub default_binary: &'static str,
    pub reports_tokens: bool,
}

/// Returns descriptors for the built-in engines.
#[must_use]
pub fn engine_descriptors() -> [EngineDescriptor; 4] {
    [
        EngineDescriptor {
            engine_name: "opencode",
            default_binary: "opencode",
            reports_tokens: true,
        },
        EngineDescriptor {
            engine_name: "codex",
            default_binary: "codex",
            reports_tokens: false,
        },
        EngineDescriptor {
            engine_name: "claude-code",
            default_binary: "claude",
            reports_tokens: true,
        },
        EngineDescriptor {
            engine_name: "kilo",
            default_binary: "kilo",
            reports_tokens: false,
        },
    ]
}

/// Constructs an engine by name with default configuration.
pub fn create_engine(name: &str) -> Result<Arc<dyn Engine>> {
    match name {
        "opencode" => Ok(Arc::new(opencode::OpenCodeEngine::with_defaults())),
        "codex" => Ok(Arc::new(codex::CodexEngine::with_defaults())),
        "claude-code" => Ok(Arc::new(claude_code::ClaudeCodeEngine::with_defaults())),
        "kilo" => Ok(Arc::new(kilo::KiloEngine::with_defaults())),
        other => Err(ConductorError::environment(
            "unknown_engine",
            format!("Unknown engine `{other}`"),
            "adapters:registry",
        )
        .with_hint(format!("Supported engines: {}", SUPPORTED_ENGINES.join(", ")))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_supported_engines_construct() {
        for name in SUPPORTED_ENGINES {
            let engine = create_engine(name).expect("engine constructs");
            assert_eq!(engine.name(), name);
        }
    }

    #[test]
    fn unknown_engine_is_rejected() {
        let err = create_engine("gpt-cli").unwrap_err();
        assert_eq!(err.code, "unknown_engine");
    }

    #[test]
    fn descriptors_cover_supported_engines() {
        let descriptors = engine_descriptors();
        for name in SUPPORTED_ENGINES {
            assert!(descriptors.iter().any(|d| d.engine_name == name));
        }
    }
}
