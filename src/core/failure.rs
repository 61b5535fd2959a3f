//! External-failure classification and run-wide latching.
//!
//! Failures whose message matches a known infrastructure token are
//! external: the task did not fail on its own logic, the environment did.
//! The first external failure latches the controller; the coordinator
//! stops admitting new tasks, waits out a deadline for running agents,
//! then escalates to stop-and-kill.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureType {
    /// Attributable to infrastructure; latches the run.
    External,
    /// Attributable to the task itself.
    Internal,
    /// Could not be determined.
    Unknown,
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::External => write!(f, "external"),
            Self::Internal => write!(f, "internal"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Canonical infrastructure tokens, matched case-insensitively as
/// substrings of the failure message.
pub const EXTERNAL_TOKENS: &[&str] = &[
    "installation failed",
    "command not found",
    "no such file or directory",
    "permission denied",
    "network",
    "timeout",
    "tls",
    "connection reset",
    "certificate",
    "ssl",
    "lock file",
];

/// Classifies a failure message.
///
/// A message with no content at all carries no classifiable signal and
/// is `Unknown`. Otherwise a token match is `External`, and anything
/// else is attributed to the task's own logic.
#[must_use]
pub fn classify(message: &str) -> FailureType {
    if message.trim().is_empty() {
        return FailureType::Unknown;
    }
    let haystack = message.to_ascii_lowercase();
    if EXTERNAL_TOKENS.iter().any(|t| haystack.contains(t)) {
        FailureType::External
    } else {
        FailureType::Internal
    }
}

/// The first external failure observed in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalFailure {
    /// Task whose failure latched the run.
    pub task_id: String,
    /// The offending failure message.
    pub message: String,
}

/// Run-wide external-failure latch. Owned by the coordinator; once
/// latched it never resets for the lifetime of the run.
#[derive(Debug, Default)]
pub struct FailureController {
    latched: Option<ExternalFailure>,
    /// How long to wait for running agents after the latch.
    stop_deadline: Duration,
}

impl FailureController {
    /// Creates a controller with the given graceful-stop deadline.
    #[must_use]
    pub fn new(stop_deadline: Duration) -> Self {
        Self {
            latched: None,
            stop_deadline,
        }
    }

    /// Classifies a failure and latches on the first external one.
    /// Returns the classification either way.
    pub fn record(&mut self, task_id: &str, message: &str) -> FailureType {
        let failure_type = classify(message);
        if failure_type == FailureType::External && self.latched.is_none() {
            self.latched = Some(ExternalFailure {
                task_id: task_id.to_string(),
                message: message.to_string(),
            });
        }
        failure_type
    }

    /// True once an external failure has been recorded.
    #[must_use]
    pub fn is_latched(&self) -> bool {
        self.latched.is_some()
    }

    /// The failure that latched the run, if any.
    #[must_use]
    pub fn latched(&self) -> Option<&ExternalFailure> {
        self.latched.as_ref()
    }

    /// Graceful-stop deadline for surviving agents.
    #[must_use]
    pub fn stop_deadline(&self) -> Duration {
        self.stop_deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_tokens_classify_external() {
        assert_eq!(classify("bash: bun: command not found"), FailureType::External);
        assert_eq!(classify("ETIMEDOUT: network unreachable"), FailureType::External);
        assert_eq!(classify("npm ERR! Installation failed"), FailureType::External);
        assert_eq!(classify("TLS handshake error"), FailureType::External);
        assert_eq!(classify("could not acquire lock file"), FailureType::External);
    }

    #[test]
    fn classification_is_case_insensitive() {
        assert_eq!(classify("Permission Denied (publickey)"), FailureType::External);
        assert_eq!(classify("CONNECTION RESET by peer"), FailureType::External);
    }

    #[test]
    fn task_logic_failures_classify_internal() {
        assert_eq!(classify("assertion failed in cart.test.ts"), FailureType::Internal);
        assert_eq!(classify("agent produced no commits"), FailureType::Internal);
    }

    #[test]
    fn contentless_message_classifies_unknown() {
        assert_eq!(classify(""), FailureType::Unknown);
        assert_eq!(classify("  \n\t"), FailureType::Unknown);
    }

    #[test]
    fn unknown_failures_do_not_latch() {
        let mut controller = FailureController::new(Duration::from_secs(60));
        assert_eq!(controller.record("A", ""), FailureType::Unknown);
        assert!(!controller.is_latched());
    }

    #[test]
    fn first_external_failure_latches() {
        let mut controller = FailureController::new(Duration::from_secs(60));
        assert!(!controller.is_latched());

        assert_eq!(
            controller.record("K", "internal assertion error"),
            FailureType::Internal
        );
        assert!(!controller.is_latched());

        assert_eq!(
            controller.record("K", "sh: tsc: command not found"),
            FailureType::External
        );
        assert!(controller.is_latched());
        assert_eq!(controller.latched().unwrap().task_id, "K");
    }

    #[test]
    fn latch_keeps_first_record() {
        let mut controller = FailureController::new(Duration::from_secs(60));
        controller.record("A", "network down");
        controller.record("B", "certificate expired");

        assert_eq!(controller.latched().unwrap().task_id, "A");
    }

    #[test]
    fn deadline_is_stored() {
        let controller = FailureController::new(Duration::from_secs(120));
        assert_eq!(controller.stop_deadline(), Duration::from_secs(120));
    }
}
