//! Integration pipeline - dependency-ordered merge, conflict resolution,
//! review, finalization.
//!
//! Runs after the graph drains, when at least one task reached done and
//! push mode is disabled. Completed branches merge into an ephemeral
//! integration branch in an order consistent with the DAG. Conflicts get
//! one shot at an AI resolver; branches it cannot fix are aborted and
//! recorded. A clean integration is reviewed; blockers turn into appended
//! fix tasks instead of a base merge.

use crate::adapters::engine::{Engine, InvokeRequest};
use crate::artifacts::{RunDirectory, TaskReport};
use crate::core::error::{ConductorError, Result};
use crate::core::git::{Git, MergeOutcome};
use crate::core::graph::TaskGraph;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Review issue severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Blocker,
    Critical,
    Warning,
    Info,
}

/// A single issue found by the reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewIssue {
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// The reviewer's report (`review-report.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewReport {
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
}

impl ReviewReport {
    /// Issues with blocker severity.
    #[must_use]
    pub fn blockers(&self) -> Vec<&ReviewIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Blocker)
            .collect()
    }
}

/// How the pipeline ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationOutcome {
    /// Everything merged and review passed; the base branch advanced and
    /// the integration branch is gone.
    MergedToBase,
    /// Review found blockers; fix tasks were appended and the integration
    /// branch is preserved for inspection.
    FixTasksAppended(Vec<String>),
    /// At least one branch could not be merged even with the resolver;
    /// the integration branch is preserved.
    Unresolved(Vec<String>),
    /// Review passed but the integration branch conflicted with base
    /// during finalization; the named branch is preserved for manual
    /// inspection.
    BaseMergeConflict(String),
    /// No completed branch existed to merge.
    NothingToMerge,
}

/// Integration pipeline configuration.
#[derive(Debug, Clone)]
pub struct IntegrationConfig {
    /// Base branch to finalize into.
    pub base_branch: String,
    /// Repository root, used as the resolver/reviewer working directory.
    pub repo_root: PathBuf,
    /// Timeout for resolver and reviewer invocations.
    pub agent_timeout: Duration,
}

/// The integration pipeline.
pub struct IntegrationPipeline {
    git: Arc<dyn Git>,
    engine: Arc<dyn Engine>,
    run_dir: Arc<RunDirectory>,
    config: IntegrationConfig,
    cancel: Arc<AtomicBool>,
}

impl IntegrationPipeline {
    /// Creates a pipeline.
    #[must_use]
    pub fn new(
        git: Arc<dyn Git>,
        engine: Arc<dyn Engine>,
        run_dir: Arc<RunDirectory>,
        config: IntegrationConfig,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            git,
            engine,
            run_dir,
            config,
            cancel,
        }
    }

    /// Integration branch name for this run.
    #[must_use]
    pub fn integration_branch(&self) -> String {
        format!("integration/{}", self.run_dir.prd_id())
    }

    /// Runs the pipeline over completed tasks.
    ///
    /// `ordered` pairs `(task_id, branch)` in dependency order; `reports`
    /// are the terminal reports accumulated during execution.
    pub fn run(
        &self,
        graph: &mut TaskGraph,
        ordered: &[(String, String)],
        reports: &[TaskReport],
    ) -> Result<IntegrationOutcome> {
        if ordered.is_empty() {
            return Ok(IntegrationOutcome::NothingToMerge);
        }

        let integration = self.integration_branch();
        if self.git.branch_exists(&integration)? {
            self.git.delete_branch(&integration)?;
        }
        self.git.create_branch(&integration, &self.config.base_branch)?;
        self.git.checkout(&integration)?;

        let mut unresolved = Vec::new();
        for (task_id, branch) in ordered {
            match self.merge_branch(graph, task_id, branch)? {
                true => self.git.delete_branch(branch)?,
                false => unresolved.push(branch.clone()),
            }
        }

        if !unresolved.is_empty() {
            tracing::warn!(
                branches = unresolved.join(", "),
                "integration incomplete; branch preserved"
            );
            return Ok(IntegrationOutcome::Unresolved(unresolved));
        }

        let review = self.review(&integration, reports)?;
        let blockers = review.blockers();
        if blockers.is_empty() {
            return self.finalize(&integration);
        }

        let descriptions: Vec<String> =
            blockers.iter().map(|i| i.description.clone()).collect();
        let appended = graph.append_fix_tasks(&descriptions);
        graph.save(&self.run_dir.tasks_path()).map_err(ConductorError::from)?;
        tracing::warn!(
            blockers = blockers.len(),
            fix_tasks = appended.join(", "),
            "review blockers found; integration branch preserved"
        );
        Ok(IntegrationOutcome::FixTasksAppended(appended))
    }

    /// Attempts to merge one branch; returns whether it ended up merged.
    fn merge_branch(&self, graph: &TaskGraph, task_id: &str, branch: &str) -> Result<bool> {
        match self.git.merge(branch)? {
            MergeOutcome::Merged => Ok(true),
            MergeOutcome::Conflicted(paths) => {
                tracing::info!(branch, paths = paths.join(", "), "merge conflict; invoking resolver");
                self.invoke_resolver(graph, task_id, branch, &paths)?;

                let remaining = self.git.conflicted_paths()?;
                if remaining.is_empty() {
                    Ok(true)
                } else {
                    self.git.merge_abort()?;
                    Ok(false)
                }
            }
        }
    }

    /// One resolver invocation per conflicted branch.
    fn invoke_resolver(
        &self,
        graph: &TaskGraph,
        task_id: &str,
        branch: &str,
        paths: &[String],
    ) -> Result<()> {
        let merge_notes = graph
            .task(task_id)
            .map(|t| t.merge_notes.clone())
            .unwrap_or_default();

        let mut prompt = String::from(
            "A merge stopped on conflicts. Resolve every conflicted file, \
             keeping the intent of both sides, then stage and commit the \
             resolution. Do not touch unrelated files.\n\n",
        );
        let _ = writeln!(prompt, "Branch: {branch}");
        let _ = writeln!(prompt, "Conflicted paths: {}", paths.join(", "));
        if !merge_notes.is_empty() {
            let _ = writeln!(prompt, "Merge notes from the task author: {merge_notes}");
        }

        let request = InvokeRequest::new(
            prompt,
            self.run_dir.root().join("resolver-output.json"),
        )
        .in_dir(self.config.repo_root.clone())
        .with_log(self.run_dir.log_path("integration"))
        .with_timeout(self.config.agent_timeout);

        self.engine.execute(&request, &self.cancel).map(|_| ())
    }

    /// Invokes the reviewer and parses `review-report.json`.
    fn review(&self, integration: &str, reports: &[TaskReport]) -> Result<ReviewReport> {
        let range = format!("{}..{integration}", self.config.base_branch);
        let summary = self.git.diff_summary(&range)?;

        let mut prompt = String::from(
            "Review the integrated changes for semantic conflicts and \
             regressions across tasks. Write your findings to \
             review-report.json in the current directory as JSON: \
             {\"issues\": [{\"severity\": \"blocker|critical|warning|info\", \
             \"description\": \"...\", \"file\": \"...\"}]}.\n\n",
        );
        let _ = writeln!(prompt, "Diff summary ({range}):\n{summary}");
        prompt.push_str("\nPer-task reports:\n");
        for report in reports {
            let _ = writeln!(
                prompt,
                "- {} [{:?}] branch {} ({} commits): {}",
                report.task_id, report.status, report.branch, report.commits, report.changed_files
            );
        }

        let request = InvokeRequest::new(
            prompt,
            self.run_dir.root().join("reviewer-output.json"),
        )
        .in_dir(self.config.repo_root.clone())
        .with_log(self.run_dir.log_path("integration"))
        .with_timeout(self.config.agent_timeout);

        let parsed = self.engine.execute(&request, &self.cancel)?;

        // The reviewer is expected to write the file itself; fall back to
        // its response text so a well-formed answer is never lost.
        let review_path = self.run_dir.review_report_path();
        let raw = if review_path.exists() {
            std::fs::read_to_string(&review_path)?
        } else {
            self.run_dir.write_review_report(&parsed.response_text)?;
            parsed.response_text
        };

        serde_json::from_str(&raw).map_err(|e| {
            ConductorError::review(
                "malformed_review_report",
                format!("review-report.json did not parse: {e}"),
                "integrate:review",
            )
        })
    }

    /// Merges the integration branch into base. A clean merge deletes
    /// the integration branch; a conflicting one is aborted and the
    /// branch is preserved.
    fn finalize(&self, integration: &str) -> Result<IntegrationOutcome> {
        self.git.checkout(&self.config.base_branch)?;
        match self.git.merge(integration)? {
            MergeOutcome::Merged => {
                self.git.delete_branch(integration)?;
                Ok(IntegrationOutcome::MergedToBase)
            }
            MergeOutcome::Conflicted(paths) => {
                self.git.merge_abort()?;
                tracing::warn!(
                    branch = integration,
                    base = %self.config.base_branch,
                    paths = paths.join(", "),
                    "integration branch conflicts with base; branch preserved"
                );
                Ok(IntegrationOutcome::BaseMergeConflict(integration.to_string()))
            }
        }
    }
}
