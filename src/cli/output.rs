//! CLI output formatting (table, JSON).
//!
//! All CLI output supports a structured format for machine consumption.

use crate::artifacts::{ReportStatus, TaskReport};
use crate::core::error::{ConductorError, ExitCode};
use crate::core::orchestrator::{RunOutcome, RunSummary};
use comfy_table::{Cell, Table};
use serde::Serialize;

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// Machine-readable JSON format.
    Json,
}

/// Structured CLI response.
#[derive(Debug, Serialize)]
pub struct CliResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorOutput>,
}

/// Structured error output.
#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub category: String,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl From<&ConductorError> for ErrorOutput {
    fn from(err: &ConductorError) -> Self {
        Self {
            category: err.category.to_string(),
            code: err.code.clone(),
            message: err.message.clone(),
            hint: err.recovery_hint.clone(),
        }
    }
}

impl<T: Serialize> CliResponse<T> {
    /// Creates a successful response with data.
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Prints an error in the requested format and maps it to an exit code.
pub fn output_error(err: &ConductorError, format: OutputFormat) -> ExitCode {
    match format {
        OutputFormat::Json => {
            let response: CliResponse<()> = CliResponse {
                success: false,
                data: None,
                error: Some(ErrorOutput::from(err)),
            };
            if let Ok(json) = serde_json::to_string_pretty(&response) {
                eprintln!("{json}");
            }
        }
        OutputFormat::Table => {
            eprintln!("error: {err}");
            if let Some(hint) = &err.recovery_hint {
                eprintln!("hint: {hint}");
            }
        }
    }
    ExitCode::Error
}

/// Serializable view of a run summary.
#[derive(Debug, Serialize)]
struct SummaryOutput<'a> {
    outcome: String,
    done: &'a [String],
    failed: &'a [String],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    blocked: Vec<String>,
    reports: &'a [TaskReport],
}

fn outcome_label(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Completed(None) => "completed".to_string(),
        RunOutcome::Completed(Some(i)) => format!("completed ({i:?})"),
        RunOutcome::Deadlocked(_) => "deadlocked".to_string(),
        RunOutcome::ExternalFailure(f) => format!("external failure ({})", f.task_id),
        RunOutcome::Interrupted => "interrupted".to_string(),
    }
}

/// Prints the run summary.
pub fn output_summary(summary: &RunSummary, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let blocked = match &summary.outcome {
                RunOutcome::Deadlocked(diagnostics) => {
                    diagnostics.iter().map(ToString::to_string).collect()
                }
                _ => Vec::new(),
            };
            let response = CliResponse::success(SummaryOutput {
                outcome: outcome_label(&summary.outcome),
                done: &summary.done,
                failed: &summary.failed,
                blocked,
                reports: &summary.reports,
            });
            if let Ok(json) = serde_json::to_string_pretty(&response) {
                println!("{json}");
            }
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table.set_header(["Task", "Status", "Branch", "Commits", "Failure"]);
            for report in &summary.reports {
                let status = match report.status {
                    ReportStatus::Done => "done",
                    ReportStatus::Failed => "failed",
                };
                let failure = report
                    .failure_type
                    .map(|f| f.to_string())
                    .unwrap_or_default();
                table.add_row([
                    Cell::new(&report.task_id),
                    Cell::new(status),
                    Cell::new(&report.branch),
                    Cell::new(report.commits),
                    Cell::new(failure),
                ]);
            }
            println!("{table}");
            println!("outcome: {}", outcome_label(&summary.outcome));

            if let RunOutcome::Deadlocked(diagnostics) = &summary.outcome {
                println!("\nblocked tasks:");
                for reason in diagnostics {
                    println!("  - {reason}");
                }
            }
        }
    }
}
