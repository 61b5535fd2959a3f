//! Agent supervision - one supervisor per admitted task.
//!
//! A supervisor stages the task specification into the worktree, assembles
//! the prompt, invokes the opaque agent through the engine seam, retries
//! transient agent errors, applies the success gates, and produces the
//! task report. Report and log persistence happen before the outcome is
//! reported back to the coordinator. A failing task never aborts sibling
//! tasks; each supervisor is its own bulkhead.

use crate::adapters::engine::{Engine, InvokeRequest};
use crate::artifacts::{RunDirectory, TaskReport};
use crate::core::failure::{classify, FailureType};
use crate::core::git::Git;
use crate::core::graph::Task;
use crate::core::worktree::Worktree;
use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Name of the progress file the agent appends to inside its worktree.
pub const PROGRESS_FILE: &str = "PROGRESS.md";

/// Worktree-local directory staging the task spec and agent output.
const STAGING_DIR: &str = ".conductor";

/// How many trailing progress lines flow into the report.
const PROGRESS_NOTE_LINES: usize = 5;

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Retries after the first attempt for empty output / error payloads.
    pub max_retries: u32,
    /// Delay between retries.
    pub retry_delay: Duration,
    /// Per-invocation timeout handed to the engine.
    pub agent_timeout: Duration,
    /// Push the branch and open a change request on success.
    pub push_mode: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay: Duration::from_secs(5),
            agent_timeout: Duration::from_secs(1800),
            push_mode: false,
        }
    }
}

/// One attempt at running the agent.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// Unique attempt id.
    pub id: Uuid,
    /// 1-indexed attempt number.
    pub number: u32,
    /// Start timestamp.
    pub started_at: DateTime<Utc>,
    /// Why the attempt did not stick, if it failed.
    pub failure: Option<String>,
}

impl Attempt {
    fn new(number: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            number,
            started_at: Utc::now(),
            failure: None,
        }
    }
}

/// Supervises one agent process per task.
pub struct AgentSupervisor {
    engine: Arc<dyn Engine>,
    git: Arc<dyn Git>,
    run_dir: Arc<RunDirectory>,
    base_branch: String,
    config: SupervisorConfig,
    cancel: Arc<AtomicBool>,
}

impl AgentSupervisor {
    /// Creates a supervisor.
    #[must_use]
    pub fn new(
        engine: Arc<dyn Engine>,
        git: Arc<dyn Git>,
        run_dir: Arc<RunDirectory>,
        base_branch: impl Into<String>,
        config: SupervisorConfig,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            engine,
            git,
            run_dir,
            base_branch: base_branch.into(),
            config,
            cancel,
        }
    }

    /// Runs the task's agent to a terminal report. The report and log are
    /// persisted before this returns.
    pub fn run_task(&self, task: &Task, inferred_locks: &[String], worktree: &Worktree) -> TaskReport {
        let report = self.run_task_inner(task, inferred_locks, worktree);
        if let Err(e) = self.run_dir.write_report(&report) {
            tracing::error!(task = %task.id, error = %e, "failed to persist report");
        }
        report
    }

    fn run_task_inner(
        &self,
        task: &Task,
        inferred_locks: &[String],
        worktree: &Worktree,
    ) -> TaskReport {
        if let Err(e) = self.stage_worktree(task, worktree) {
            return TaskReport::failed(
                &task.id,
                &task.title,
                &worktree.branch,
                classify(&e.to_string()),
                e.to_string(),
            );
        }

        let prompt = self.build_prompt(task, inferred_locks);
        let request = InvokeRequest::new(prompt, self.output_path(worktree))
            .in_dir(worktree.path.clone())
            .with_log(self.run_dir.log_path(&task.id))
            .with_tee(self.run_dir.stream_path(&task.id))
            .with_timeout(self.config.agent_timeout);

        let max_attempts = self.config.max_retries + 1;
        let mut last_failure = String::from("agent produced no usable output");

        for number in 1..=max_attempts {
            let mut attempt = Attempt::new(number);
            self.log(&task.id, &format!(
                "[supervisor] attempt {number}/{max_attempts} ({})",
                attempt.id
            ));

            match self.engine.execute(&request, &self.cancel) {
                Ok(parsed) => {
                    if let Some(error) = &parsed.error {
                        // A payload with no content at all stays empty so
                        // classification can report it as unknown.
                        let detail = [error.code.trim(), error.message.trim()]
                            .into_iter()
                            .filter(|part| !part.is_empty())
                            .collect::<Vec<_>>()
                            .join(": ");
                        attempt.failure = Some(detail);
                    } else if parsed.is_empty() {
                        attempt.failure = Some("agent produced empty output".to_string());
                    } else {
                        return self.gate_and_finish(task, worktree);
                    }
                }
                Err(e) if e.code == "canceled" => {
                    // Graceful stop reached this agent past the deadline.
                    self.log(&task.id, "[supervisor] agent terminated by graceful stop");
                    return TaskReport::failed(
                        &task.id,
                        &task.title,
                        &worktree.branch,
                        FailureType::External,
                        "graceful-stop timeout exceeded; agent terminated",
                    );
                }
                Err(e) => {
                    // Spawn failures and timeouts are not retried; the
                    // message speaks for the failure class.
                    self.log(&task.id, &format!("[supervisor] attempt failed: {e}"));
                    return TaskReport::failed(
                        &task.id,
                        &task.title,
                        &worktree.branch,
                        classify(&e.message),
                        e.message,
                    );
                }
            }

            if let Some(failure) = &attempt.failure {
                last_failure.clone_from(failure);
                self.log(
                    &task.id,
                    &format!("[supervisor] attempt {number} rejected: {failure}"),
                );
            }
            if number < max_attempts {
                std::thread::sleep(self.config.retry_delay);
            }
        }

        TaskReport::failed(
            &task.id,
            &task.title,
            &worktree.branch,
            classify(&last_failure),
            format!("retries exhausted: {last_failure}"),
        )
    }

    /// Applies the success gates and builds the final report.
    fn gate_and_finish(&self, task: &Task, worktree: &Worktree) -> TaskReport {
        let range = format!("{}..HEAD", self.base_branch);

        let commits = match self.git.commit_count(&worktree.path, &range) {
            Ok(count) => count,
            Err(e) => {
                return TaskReport::failed(
                    &task.id,
                    &task.title,
                    &worktree.branch,
                    classify(&e.message),
                    e.message,
                );
            }
        };

        // Commit gate: a zero-commit outcome is a failure regardless of
        // what the agent claimed on stdout.
        if commits == 0 {
            self.log(&task.id, "[supervisor] commit gate: no commits on branch");
            return TaskReport::failed(
                &task.id,
                &task.title,
                &worktree.branch,
                FailureType::Internal,
                "agent reported success but produced no commits",
            );
        }

        let changed = self
            .git
            .changed_files(&worktree.path, &range)
            .unwrap_or_default();
        let undeclared = undeclared_paths(task, &changed);
        if !undeclared.is_empty() {
            // Informational: touching outside the declared patterns is
            // reported, not enforced.
            self.log(
                &task.id,
                &format!("[supervisor] undeclared paths modified: {}", undeclared.join(", ")),
            );
        }

        if self.config.push_mode {
            if let Err(e) = self
                .git
                .push_branch(&worktree.branch)
                .and_then(|()| {
                    self.git.open_change_request(
                        &worktree.branch,
                        &task.title,
                        &format!("Automated change for task {}", task.id),
                    )
                })
            {
                return TaskReport::failed(
                    &task.id,
                    &task.title,
                    &worktree.branch,
                    classify(&e.message),
                    e.message,
                );
            }
        }

        TaskReport::done(&task.id, &task.title, &worktree.branch)
            .with_commits(commits)
            .with_changed_files(&changed)
            .with_progress_notes(self.progress_notes(worktree))
    }

    /// Copies the task specification into the worktree and ensures the
    /// progress file exists.
    fn stage_worktree(&self, task: &Task, worktree: &Worktree) -> crate::core::error::Result<()> {
        let staging = worktree.path.join(STAGING_DIR);
        std::fs::create_dir_all(&staging)?;

        let spec = serde_json::to_string_pretty(task).map_err(|e| {
            crate::core::error::ConductorError::system(
                "serialize_failed",
                e.to_string(),
                "supervisor:stage",
            )
        })?;
        std::fs::write(staging.join("task.json"), spec)?;

        let progress = worktree.path.join(PROGRESS_FILE);
        if !progress.exists() {
            std::fs::write(&progress, format!("# Progress: {}\n", task.id))?;
        }
        Ok(())
    }

    fn output_path(&self, worktree: &Worktree) -> PathBuf {
        worktree.path.join(STAGING_DIR).join("output.json")
    }

    /// Base instructions plus the task metadata.
    fn build_prompt(&self, task: &Task, inferred_locks: &[String]) -> String {
        let mut prompt = String::new();
        prompt.push_str(
            "You are a coding agent working inside an isolated git worktree.\n\
             Implement exactly one task, then stage and commit your work.\n\
             Only modify files matching the declared path patterns.\n\
             Append a one-line progress note to PROGRESS.md after each step.\n\
             The task specification is staged at .conductor/task.json.\n\n",
        );
        let _ = writeln!(prompt, "Task ID: {}", task.id);
        let _ = writeln!(prompt, "Title: {}", task.title);
        if !task.touches.is_empty() {
            let _ = writeln!(prompt, "Declared touches: {}", task.touches.join(", "));
        }
        if !task.locks.is_empty() {
            let _ = writeln!(prompt, "Explicit locks: {}", task.locks.join(", "));
        }
        if !inferred_locks.is_empty() {
            let _ = writeln!(prompt, "Inferred locks: {}", inferred_locks.join(", "));
        }
        if !task.verify.is_empty() {
            let _ = writeln!(prompt, "Verification checks: {}", task.verify.join(", "));
        }
        prompt
    }

    /// Tail of the agent's own progress log.
    fn progress_notes(&self, worktree: &Worktree) -> String {
        let Ok(content) = std::fs::read_to_string(worktree.path.join(PROGRESS_FILE)) else {
            return String::new();
        };
        let lines: Vec<&str> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();
        let start = lines.len().saturating_sub(PROGRESS_NOTE_LINES);
        lines[start..].join(" | ")
    }

    fn log(&self, task_id: &str, line: &str) {
        if let Err(e) = self.run_dir.append_log(task_id, line) {
            tracing::debug!(task = task_id, error = %e, "log append failed");
        }
    }
}

/// Changed paths that match none of the task's declared patterns.
fn undeclared_paths(task: &Task, changed: &[String]) -> Vec<String> {
    if task.touches.is_empty() {
        return Vec::new();
    }
    changed
        .iter()
        .filter(|path| !task.touches.iter().any(|pattern| pattern_matches(pattern, path)))
        .cloned()
        .collect()
}

/// Loose glob-ish matching: `**`/`*` segments match anything, a pattern
/// without globs matches itself and any path underneath it.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    let pattern = pattern.trim_start_matches("./");
    let path = path.trim_start_matches("./");

    if pattern == "*" || pattern == "**" || pattern == "**/*" {
        return true;
    }
    if let Some(prefix) = pattern.split(['*', '?']).next() {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return true;
        }
        return path == prefix || path.starts_with(&format!("{prefix}/")) || path.starts_with(prefix);
    }
    path == pattern
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::engine::{MockEngine, ParsedStream, StreamError};
    use crate::artifacts::ReportStatus;
    use crate::core::git::MockGit;
    use crate::core::worktree::WorktreeManager;

    struct Rig {
        engine: Arc<MockEngine>,
        git: Arc<MockGit>,
        run_dir: Arc<RunDirectory>,
        manager: WorktreeManager,
        _tmp: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let tmp = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(MockEngine::new());
        let git = Arc::new(MockGit::new());
        let mut run_dir = RunDirectory::new(&tmp.path().join("artifacts"), "demo");
        run_dir.ensure().expect("run dir");
        let manager = WorktreeManager::new(
            git.clone(),
            tmp.path().join("worktrees"),
            "main",
            "demo",
        );
        Rig {
            engine,
            git,
            run_dir: Arc::new(run_dir),
            manager,
            _tmp: tmp,
        }
    }

    fn supervisor(rig: &Rig, config: SupervisorConfig) -> AgentSupervisor {
        AgentSupervisor::new(
            rig.engine.clone(),
            rig.git.clone(),
            rig.run_dir.clone(),
            "main",
            config,
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            max_retries: 1,
            retry_delay: Duration::from_millis(1),
            agent_timeout: Duration::from_secs(5),
            push_mode: false,
        }
    }

    #[test]
    fn successful_run_produces_done_report() {
        let rig = rig();
        let task = Task::new("T-1", "Add cart").with_touch("src/**");
        let worktree = rig.manager.provision(&task.id, 1).unwrap();
        rig.git.set_changed_files(&worktree.branch, &["src/cart.ts"]);

        let report = supervisor(&rig, fast_config()).run_task(&task, &["src".to_string()], &worktree);

        assert_eq!(report.status, ReportStatus::Done);
        assert_eq!(report.commits, 1);
        assert_eq!(report.changed_files, "src/cart.ts");
        assert!(rig.run_dir.report_path("T-1").exists());
    }

    #[test]
    fn prompt_carries_task_metadata() {
        let rig = rig();
        let task = Task::new("T-1", "Add cart")
            .with_touch("src/api/**")
            .with_lock("lockfile");
        let worktree = rig.manager.provision(&task.id, 1).unwrap();

        supervisor(&rig, fast_config()).run_task(&task, &["src".to_string()], &worktree);

        let prompts = rig.engine.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Task ID: T-1"));
        assert!(prompts[0].contains("src/api/**"));
        assert!(prompts[0].contains("Explicit locks: lockfile"));
        assert!(prompts[0].contains("Inferred locks: src"));
    }

    #[test]
    fn task_spec_and_progress_file_are_staged() {
        let rig = rig();
        let task = Task::new("T-1", "Add cart");
        let worktree = rig.manager.provision(&task.id, 1).unwrap();

        supervisor(&rig, fast_config()).run_task(&task, &[], &worktree);

        assert!(worktree.path.join(".conductor/task.json").exists());
        assert!(worktree.path.join(PROGRESS_FILE).exists());
    }

    #[test]
    fn empty_output_retries_then_fails_internal() {
        let rig = rig();
        rig.engine.push_response(ParsedStream::default());
        rig.engine.push_response(ParsedStream::default());

        let task = Task::new("T-1", "Add cart");
        let worktree = rig.manager.provision(&task.id, 1).unwrap();

        let report = supervisor(&rig, fast_config()).run_task(&task, &[], &worktree);

        assert_eq!(report.status, ReportStatus::Failed);
        assert_eq!(report.failure_type, Some(FailureType::Internal));
        assert!(report.error_message.unwrap().contains("retries exhausted"));
        assert_eq!(rig.engine.prompts().len(), 2);
    }

    #[test]
    fn error_payload_retries_then_succeeds() {
        let rig = rig();
        rig.engine.push_response(ParsedStream {
            error: Some(StreamError::new("transient", "hiccup")),
            ..ParsedStream::default()
        });
        rig.engine.push_response(ParsedStream {
            response_text: "done".to_string(),
            ..ParsedStream::default()
        });

        let task = Task::new("T-1", "Add cart");
        let worktree = rig.manager.provision(&task.id, 1).unwrap();

        let report = supervisor(&rig, fast_config()).run_task(&task, &[], &worktree);
        assert_eq!(report.status, ReportStatus::Done);
    }

    #[test]
    fn zero_commits_fails_despite_agent_claim() {
        let rig = rig();
        let task = Task::new("T-1", "Add cart");
        let worktree = rig.manager.provision(&task.id, 1).unwrap();
        rig.git.set_commit_count(&worktree.branch, 0);

        let report = supervisor(&rig, fast_config()).run_task(&task, &[], &worktree);

        assert_eq!(report.status, ReportStatus::Failed);
        assert_eq!(report.failure_type, Some(FailureType::Internal));
        assert!(report.error_message.unwrap().contains("no commits"));
    }

    #[test]
    fn contentless_error_payload_classifies_unknown() {
        let rig = rig();
        for _ in 0..2 {
            rig.engine.push_response(ParsedStream {
                error: Some(StreamError::new("", "")),
                ..ParsedStream::default()
            });
        }

        let task = Task::new("T-1", "Add cart");
        let worktree = rig.manager.provision(&task.id, 1).unwrap();

        let report = supervisor(&rig, fast_config()).run_task(&task, &[], &worktree);

        assert_eq!(report.status, ReportStatus::Failed);
        assert_eq!(report.failure_type, Some(FailureType::Unknown));
    }

    #[test]
    fn external_failure_message_classifies_external() {
        let rig = rig();
        rig.engine.push_response(ParsedStream {
            error: Some(StreamError::new("env", "sh: bun: command not found")),
            ..ParsedStream::default()
        });
        rig.engine.push_response(ParsedStream {
            error: Some(StreamError::new("env", "sh: bun: command not found")),
            ..ParsedStream::default()
        });

        let task = Task::new("T-1", "Add cart");
        let worktree = rig.manager.provision(&task.id, 1).unwrap();

        let report = supervisor(&rig, fast_config()).run_task(&task, &[], &worktree);
        assert_eq!(report.failure_type, Some(FailureType::External));
    }

    #[test]
    fn progress_notes_capture_tail() {
        let rig = rig();
        let task = Task::new("T-1", "Add cart");
        let worktree = rig.manager.provision(&task.id, 1).unwrap();
        std::fs::write(
            worktree.path.join(PROGRESS_FILE),
            "# Progress\nstep one\nstep two\nstep three\n",
        )
        .unwrap();

        let report = supervisor(&rig, fast_config()).run_task(&task, &[], &worktree);
        assert!(report.progress_notes.contains("step three"));
        assert!(report.progress_notes.contains(" | "));
    }

    #[test]
    fn push_mode_pushes_and_opens_change_request() {
        let rig = rig();
        let task = Task::new("T-1", "Add cart");
        let worktree = rig.manager.provision(&task.id, 1).unwrap();

        let mut config = fast_config();
        config.push_mode = true;
        supervisor(&rig, config).run_task(&task, &[], &worktree);

        let ops = rig.git.ops();
        assert!(ops.iter().any(|o| o.starts_with("push:")));
        assert!(ops.iter().any(|o| o.starts_with("change-request:")));
    }

    #[test]
    fn undeclared_paths_detection() {
        let task = Task::new("T-1", "t").with_touch("src/api/**");
        let changed = vec!["src/api/cart.ts".to_string(), "docs/README.md".to_string()];
        assert_eq!(undeclared_paths(&task, &changed), vec!["docs/README.md"]);

        let unconstrained = Task::new("T-2", "t");
        assert!(undeclared_paths(&unconstrained, &changed).is_empty());
    }

    #[test]
    fn pattern_matching_prefixes_and_globs() {
        assert!(pattern_matches("src/**", "src/a/b.ts"));
        assert!(pattern_matches("package.json", "package.json"));
        assert!(pattern_matches("*", "anything/at/all"));
        assert!(!pattern_matches("src/**", "docs/x.md"));
    }
}
