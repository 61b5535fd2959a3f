//! Run-directory artifacts: per-task reports, logs, review output.
//!
//! Layout, one directory per PRD identifier:
//!
//! ```text
//! <artifacts-root>/prd/<prd-id>/
//!   PRD.md              - copy of the source spec
//!   tasks.json          - the task-graph
//!   reports/<ID>.json   - one report per terminal task
//!   reports/<ID>.log    - agent stderr + supervisor records
//!   review-report.json  - if the reviewer ran
//! ```
//!
//! Report files are serialized to a full buffer and written with a single
//! `fs::write`, so a report file is valid JSON the moment it exists.
//! Distinct tasks write distinct files and may do so concurrently.

use crate::core::error::{ConductorError, Result};
use crate::core::failure::FailureType;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

/// Terminal status of a task in its report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Done,
    Failed,
}

/// Per-task report persisted as `reports/<TASK_ID>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub task_id: String,
    pub title: String,
    pub branch: String,
    pub status: ReportStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<FailureType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub commits: u64,
    /// Comma-joined list of changed paths.
    pub changed_files: String,
    /// Tail of the agent's own progress log, newline-stripped.
    pub progress_notes: String,
    /// UTC, ISO-8601.
    pub timestamp: DateTime<Utc>,
}

impl TaskReport {
    /// Creates a success report.
    #[must_use]
    pub fn done(
        task_id: impl Into<String>,
        title: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            title: title.into(),
            branch: branch.into(),
            status: ReportStatus::Done,
            failure_type: None,
            error_message: None,
            commits: 0,
            changed_files: String::new(),
            progress_notes: String::new(),
            timestamp: Utc::now(),
        }
    }

    /// Creates a failure report.
    #[must_use]
    pub fn failed(
        task_id: impl Into<String>,
        title: impl Into<String>,
        branch: impl Into<String>,
        failure_type: FailureType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            title: title.into(),
            branch: branch.into(),
            status: ReportStatus::Failed,
            failure_type: Some(failure_type),
            error_message: Some(message.into()),
            commits: 0,
            changed_files: String::new(),
            progress_notes: String::new(),
            timestamp: Utc::now(),
        }
    }

    /// Sets the commit count.
    #[must_use]
    pub fn with_commits(mut self, commits: u64) -> Self {
        self.commits = commits;
        self
    }

    /// Sets the changed-files list, comma-joined.
    #[must_use]
    pub fn with_changed_files(mut self, files: &[String]) -> Self {
        self.changed_files = files.join(",");
        self
    }

    /// Sets the progress notes.
    #[must_use]
    pub fn with_progress_notes(mut self, notes: impl Into<String>) -> Self {
        self.progress_notes = notes.into();
        self
    }
}

/// Strips carriage returns and newlines from a string destined for a
/// single-line JSON field. Deterministic; all remaining escaping is the
/// serializer's job.
#[must_use]
pub fn strip_line_breaks(s: &str) -> String {
    s.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

/// A PRD's run directory.
pub struct RunDirectory {
    root: PathBuf,
    prd_id: String,
    /// Held for the lifetime of the run; released on drop.
    lock_file: Option<File>,
}

impl RunDirectory {
    /// Creates a handle for `<artifacts_root>/prd/<prd_id>` without
    /// touching the filesystem.
    #[must_use]
    pub fn new(artifacts_root: &Path, prd_id: impl Into<String>) -> Self {
        let prd_id = prd_id.into();
        Self {
            root: artifacts_root.join("prd").join(&prd_id),
            prd_id,
            lock_file: None,
        }
    }

    /// The PRD identifier.
    #[must_use]
    pub fn prd_id(&self) -> &str {
        &self.prd_id
    }

    /// Run directory root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the PRD copy.
    #[must_use]
    pub fn prd_path(&self) -> PathBuf {
        self.root.join("PRD.md")
    }

    /// Path of the task-graph.
    #[must_use]
    pub fn tasks_path(&self) -> PathBuf {
        self.root.join("tasks.json")
    }

    /// Reports subdirectory.
    #[must_use]
    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    /// Report file for a task.
    #[must_use]
    pub fn report_path(&self, task_id: &str) -> PathBuf {
        self.reports_dir().join(format!("{task_id}.json"))
    }

    /// Log file for a task.
    #[must_use]
    pub fn log_path(&self, task_id: &str) -> PathBuf {
        self.reports_dir().join(format!("{task_id}.log"))
    }

    /// Streaming (tee) file for a task, consumed by the progress
    /// aggregator. Not part of the persistent report contract.
    #[must_use]
    pub fn stream_path(&self, task_id: &str) -> PathBuf {
        self.reports_dir().join(format!("{task_id}.stream"))
    }

    /// Review report path.
    #[must_use]
    pub fn review_report_path(&self) -> PathBuf {
        self.root.join("review-report.json")
    }

    /// Creates the directory tree and takes the exclusive run lock.
    pub fn ensure(&mut self) -> Result<()> {
        std::fs::create_dir_all(self.reports_dir())?;

        let lock_path = self.root.join(".run-lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        file.try_lock_exclusive().map_err(|_| {
            ConductorError::environment(
                "run_in_progress",
                format!("Run directory {} is locked by another run", self.root.display()),
                "artifacts:run_dir",
            )
            .with_hint("Wait for the other run to finish or remove .run-lock")
        })?;
        self.lock_file = Some(file);
        Ok(())
    }

    /// Copies the PRD source into the run directory.
    pub fn copy_prd(&self, source: &Path) -> Result<()> {
        std::fs::copy(source, self.prd_path()).map_err(|e| {
            ConductorError::environment(
                "prd_copy_failed",
                format!("Cannot copy {}: {e}", source.display()),
                "artifacts:run_dir",
            )
        })?;
        Ok(())
    }

    /// Writes a task report as one full-buffer write, sanitizing every
    /// log-derived field to a single line.
    pub fn write_report(&self, report: &TaskReport) -> Result<()> {
        let mut sanitized = report.clone();
        sanitized.changed_files = strip_line_breaks(&report.changed_files);
        sanitized.progress_notes = strip_line_breaks(&report.progress_notes);
        if let Some(msg) = &report.error_message {
            sanitized.error_message = Some(strip_line_breaks(msg));
        }

        let json = serde_json::to_string_pretty(&sanitized).map_err(|e| {
            ConductorError::system("serialize_failed", e.to_string(), "artifacts:report")
        })?;
        std::fs::write(self.report_path(&report.task_id), json)?;
        Ok(())
    }

    /// Reads a task report back.
    pub fn read_report(&self, task_id: &str) -> Result<TaskReport> {
        let json = std::fs::read_to_string(self.report_path(task_id))?;
        serde_json::from_str(&json).map_err(|e| {
            ConductorError::system("deserialize_failed", e.to_string(), "artifacts:report")
        })
    }

    /// Appends a line-oriented chunk to a task's log.
    pub fn append_log(&self, task_id: &str, chunk: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(task_id))?;
        file.write_all(chunk.as_bytes())?;
        if !chunk.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Writes the raw review report.
    pub fn write_review_report(&self, json: &str) -> Result<()> {
        std::fs::write(self.review_report_path(), json)?;
        Ok(())
    }
}
