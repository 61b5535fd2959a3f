//! Structured error types.
//!
//! Errors must be classifiable, attributable, and actionable.
//! Every error answers: What failed? Why? What can be done next?

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Error category for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Task-graph specification errors (bad version, duplicate ids, cycles).
    Spec,
    /// Environment errors (missing tools, unwritable run dir, bad base branch).
    Environment,
    /// Agent execution errors (empty output, error payloads).
    Agent,
    /// Gating errors (zero-commit outcomes, undeclared modifications).
    Gating,
    /// External/infrastructure failures that latch the run.
    External,
    /// Integration pipeline errors (unresolved merges, base merge failure).
    Integration,
    /// Review errors (malformed review report).
    Review,
    /// Git operation errors.
    Git,
    /// System-level errors (IO, threading).
    System,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spec => write!(f, "spec"),
            Self::Environment => write!(f, "environment"),
            Self::Agent => write!(f, "agent"),
            Self::Gating => write!(f, "gating"),
            Self::External => write!(f, "external"),
            Self::Integration => write!(f, "integration"),
            Self::Review => write!(f, "review"),
            Self::Git => write!(f, "git"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Structured error with full context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConductorError {
    /// Error category for classification.
    pub category: ErrorCategory,
    /// Unique error code within category.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Component and identifier that originated the error.
    pub origin: String,
    /// Whether this error is potentially recoverable.
    pub recoverable: bool,
    /// Hint for recovery action.
    pub recovery_hint: Option<String>,
    /// Additional context key-value pairs.
    pub context: HashMap<String, String>,
}

impl ConductorError {
    /// Creates a new error with the given parameters.
    #[must_use]
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            origin: origin.into(),
            recoverable: false,
            recovery_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets whether the error is recoverable.
    #[must_use]
    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    /// Sets the recovery hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.recovery_hint = Some(hint.into());
        self
    }

    /// Adds context to the error.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Creates a specification error.
    #[must_use]
    pub fn spec(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Spec, code, message, origin)
    }

    /// Creates an environment error.
    #[must_use]
    pub fn environment(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Environment, code, message, origin)
    }

    /// Creates an agent execution error.
    #[must_use]
    pub fn agent(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Agent, code, message, origin).recoverable(true)
    }

    /// Creates a gating error.
    #[must_use]
    pub fn gating(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Gating, code, message, origin)
    }

    /// Creates an external/infrastructure error.
    #[must_use]
    pub fn external(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::External, code, message, origin)
    }

    /// Creates an integration error.
    #[must_use]
    pub fn integration(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Integration, code, message, origin)
    }

    /// Creates a review error.
    #[must_use]
    pub fn review(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Review, code, message, origin)
    }

    /// Creates a git error.
    #[must_use]
    pub fn git(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::Git, code, message, origin)
    }

    /// Creates a system error.
    #[must_use]
    pub fn system(
        code: impl Into<String>,
        message: impl Into<String>,
        origin: impl Into<String>,
    ) -> Self {
        Self::new(ErrorCategory::System, code, message, origin)
    }
}

impl std::fmt::Display for ConductorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.category, self.code, self.message)
    }
}

impl std::error::Error for ConductorError {}

impl From<std::io::Error> for ConductorError {
    fn from(e: std::io::Error) -> Self {
        Self::system("io_error", e.to_string(), "io")
    }
}

/// Result type using `ConductorError`.
pub type Result<T> = std::result::Result<T, ConductorError>;

/// Exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    ExternalFailure = 2,
    Deadlock = 3,
    Interrupted = 130,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as Self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ConductorError::system("io_error", "Failed to read file", "artifacts:reports");
        assert!(err.to_string().contains("system"));
        assert!(err.to_string().contains("io_error"));
    }

    #[test]
    fn error_with_context() {
        let err = ConductorError::spec("duplicate_id", "Task id declared twice", "graph:load")
            .with_context("id", "T-001")
            .with_hint("Remove the duplicate task entry");

        assert_eq!(err.context.get("id"), Some(&"T-001".to_string()));
        assert!(err.recovery_hint.is_some());
        assert!(!err.recoverable);
    }

    #[test]
    fn agent_errors_are_recoverable() {
        let err = ConductorError::agent("empty_output", "Agent produced no output", "supervisor");
        assert!(err.recoverable);
    }

    #[test]
    fn error_serialization() {
        let err = ConductorError::git("merge_failed", "Merge produced conflicts", "git:merge")
            .with_context("branch", "agent-01-t1");

        let json = serde_json::to_string(&err).expect("serialize");
        let restored: ConductorError = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(restored.category, ErrorCategory::Git);
        assert_eq!(restored.code, "merge_failed");
    }

    #[test]
    fn exit_code_values() {
        assert_eq!(i32::from(ExitCode::Success), 0);
        assert_eq!(i32::from(ExitCode::Interrupted), 130);
        assert_eq!(i32::from(ExitCode::Deadlock), 3);
    }
}
