//! Progress aggregation - deriving an agent's current step from its
//! output stream.
//!
//! The supervisor tees each agent's stdout into a streaming file; the
//! coordinator periodically reads a bounded tail of that file and
//! classifies what the agent is doing right now. Classification is a
//! pure, total function over an ordered rule table: first match wins,
//! and every input maps to exactly one step.

use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// The step an agent is currently performing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    Committing,
    Staging,
    Logging,
    UpdatingPrd,
    Linting,
    Testing,
    WritingTests,
    Implementing,
    ReadingCode,
    RunningCmd,
    Thinking,
}

impl Step {
    /// Display label for the UI layer.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Committing => "Committing",
            Self::Staging => "Staging",
            Self::Logging => "Logging",
            Self::UpdatingPrd => "Updating PRD",
            Self::Linting => "Linting",
            Self::Testing => "Testing",
            Self::WritingTests => "Writing tests",
            Self::Implementing => "Implementing",
            Self::ReadingCode => "Reading code",
            Self::RunningCmd => "Running cmd",
            Self::Thinking => "Thinking",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One classification rule: any of the tokens present selects the step.
struct StepRule {
    step: Step,
    tokens: &'static [&'static str],
}

/// Ordered rule table. Earlier rules take precedence.
const RULES: &[StepRule] = &[
    StepRule {
        step: Step::Committing,
        tokens: &["git commit"],
    },
    StepRule {
        step: Step::Staging,
        tokens: &["git add"],
    },
    StepRule {
        step: Step::Logging,
        tokens: &["progress.md", "progress file"],
    },
    StepRule {
        step: Step::UpdatingPrd,
        tokens: &["tasks.json", "task-graph", "prd.md"],
    },
    StepRule {
        step: Step::Linting,
        tokens: &["lint", "eslint", "biome", "prettier"],
    },
    StepRule {
        step: Step::Testing,
        tokens: &["vitest", "jest", "bun test", "npm test", "pytest", "go test"],
    },
    StepRule {
        step: Step::WritingTests,
        tokens: &[".test.", ".spec.", "__tests__", "_test."],
    },
    StepRule {
        step: Step::Implementing,
        tokens: &["\"write\"", "\"edit\"", "tool: write", "tool: edit"],
    },
    StepRule {
        step: Step::ReadingCode,
        tokens: &["\"read\"", "\"glob\"", "\"grep\"", "tool: read", "tool: glob", "tool: grep"],
    },
    StepRule {
        step: Step::RunningCmd,
        tokens: &["\"bash\"", "\"shell\"", "\"terminal\"", "tool: bash", "tool: shell"],
    },
    StepRule {
        step: Step::Thinking,
        tokens: &["\"thinking\"", "\"reasoning\""],
    },
];

/// Classifies the current step from a bounded tail of agent output.
///
/// Pure and total: the same input always yields the same step, and
/// anything unrecognized is `Thinking`.
#[must_use]
pub fn classify(tail: &str) -> Step {
    let haystack = tail.to_ascii_lowercase();
    for rule in RULES {
        if rule.tokens.iter().any(|token| haystack.contains(token)) {
            return rule.step;
        }
    }
    Step::Thinking
}

/// Default tail window in bytes read from the streaming file.
pub const TAIL_WINDOW_BYTES: u64 = 4096;

/// Reads the final `window` bytes of a streaming file, lossily decoded.
/// A missing file reads as empty.
#[must_use]
pub fn read_tail(path: &Path, window: u64) -> String {
    let Ok(mut file) = std::fs::File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(window);
    if file.seek(SeekFrom::Start(start)).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}
