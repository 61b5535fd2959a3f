//! The coordinator - one loop driving admission, supervision outcomes,
//! failure latching, and the integration hand-off.
//!
//! All scheduler state lives here and is mutated only on this thread.
//! Supervisors run on their own threads and communicate terminal outcomes
//! back over a channel; nothing else crosses the boundary. Run phases:
//! prepare, execute, integrate, finalize. An external failure or an
//! interrupt during execute skips integration entirely.

use crate::adapters::engine::Engine;
use crate::artifacts::{ReportStatus, RunDirectory, TaskReport};
use crate::core::error::{ConductorError, Result};
use crate::core::failure::{ExternalFailure, FailureController, FailureType};
use crate::core::git::Git;
use crate::core::graph::TaskGraph;
use crate::core::integrate::{IntegrationConfig, IntegrationOutcome, IntegrationPipeline};
use crate::core::locks::{effective_locks, infer_locks};
use crate::core::progress;
use crate::core::scheduler::{BlockReason, Scheduler, TaskState};
use crate::core::supervisor::{AgentSupervisor, SupervisorConfig};
use crate::core::validate::ensure_valid;
use crate::core::worktree::{Worktree, WorktreeManager};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

/// Default branch prefix when the graph does not name one.
const DEFAULT_BRANCH_PREFIX: &str = "conductor";

/// Grace window applied after an interrupt before escalation.
const INTERRUPT_GRACE: Duration = Duration::from_secs(30);

/// Run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Maximum concurrently running agents.
    pub concurrency: usize,
    /// Supervisor behavior (retries, delays, push mode).
    pub supervisor: SupervisorConfig,
    /// How long to wait for running agents after an external failure.
    pub external_failure_timeout: Duration,
    /// Base branch tasks start from and integration finalizes into.
    pub base_branch: String,
    /// Repository root.
    pub repo_root: PathBuf,
    /// Scratch directory for worktrees.
    pub worktree_dir: PathBuf,
    /// Compute admission waves without running anything.
    pub dry_run: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            supervisor: SupervisorConfig::default(),
            external_failure_timeout: Duration::from_secs(120),
            base_branch: "main".to_string(),
            repo_root: PathBuf::from("."),
            worktree_dir: PathBuf::from(".conductor/worktrees"),
            dry_run: false,
        }
    }
}

/// How the run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The graph drained; integration ran unless push mode skipped it.
    Completed(Option<IntegrationOutcome>),
    /// Pending tasks could never start. Diagnostics per stuck task.
    Deadlocked(Vec<BlockReason>),
    /// An external failure latched the run.
    ExternalFailure(ExternalFailure),
    /// The operator interrupted the run.
    Interrupted,
}

/// Aggregate result of a run.
#[derive(Debug)]
pub struct RunSummary {
    /// Task ids that reached done, in admission order.
    pub done: Vec<String>,
    /// Task ids that failed.
    pub failed: Vec<String>,
    /// Terminal reports collected this run.
    pub reports: Vec<TaskReport>,
    /// The run outcome.
    pub outcome: RunOutcome,
}

/// One admission wave of a dry run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedWave {
    /// `(task id, title, effective locks)` per admitted task.
    pub tasks: Vec<(String, String, Vec<String>)>,
}

/// A supervisor's terminal message to the coordinator.
struct Outcome {
    report: TaskReport,
    worktree: Worktree,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

/// The coordinator.
pub struct Orchestrator {
    graph: TaskGraph,
    scheduler: Scheduler,
    git: Arc<dyn Git>,
    engine: Arc<dyn Engine>,
    run_dir: Arc<RunDirectory>,
    worktrees: WorktreeManager,
    failure: FailureController,
    config: RunConfig,
    /// Cancellation token observed by every engine invocation.
    cancel: Arc<AtomicBool>,
    /// Set by the signal handler.
    interrupt: Arc<AtomicBool>,
    /// Branch assigned per task this run.
    branches: HashMap<String, String>,
}

impl Orchestrator {
    /// Creates a coordinator over a validated graph.
    pub fn new(
        graph: TaskGraph,
        git: Arc<dyn Git>,
        engine: Arc<dyn Engine>,
        run_dir: Arc<RunDirectory>,
        config: RunConfig,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Self> {
        ensure_valid(&graph)?;

        let prefix = graph
            .branch_name
            .clone()
            .unwrap_or_else(|| DEFAULT_BRANCH_PREFIX.to_string());
        let scheduler = Scheduler::from_graph(&graph);
        let worktrees = WorktreeManager::new(
            git.clone(),
            config.worktree_dir.clone(),
            config.base_branch.clone(),
            prefix,
        );
        let failure = FailureController::new(config.external_failure_timeout);

        Ok(Self {
            graph,
            scheduler,
            git,
            engine,
            run_dir,
            worktrees,
            failure,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            interrupt,
            branches: HashMap::new(),
        })
    }

    /// Verifies the environment before anything runs: the engine binary
    /// answers, and the base branch resolves.
    pub fn preflight(&self) -> Result<()> {
        self.engine.health_check()?;
        self.git.rev_parse(&self.config.base_branch).map_err(|e| {
            ConductorError::environment(
                "base_branch_unresolvable",
                format!(
                    "Base branch `{}` does not resolve: {}",
                    self.config.base_branch, e.message
                ),
                "orchestrator:preflight",
            )
        })?;
        Ok(())
    }

    /// Computes admission waves without provisioning or spawning.
    pub fn plan(&self) -> Vec<PlannedWave> {
        let mut scheduler = self.scheduler.clone();
        let mut waves = Vec::new();

        loop {
            let admitted = scheduler.admit(self.config.concurrency);
            if admitted.is_empty() {
                break;
            }
            let tasks = admitted
                .iter()
                .map(|id| {
                    let task = self.graph.task(id).expect("admitted task exists");
                    (id.clone(), task.title.clone(), effective_locks(task))
                })
                .collect();
            waves.push(PlannedWave { tasks });
            for id in &admitted {
                // Completing in-wave order keeps the simulation moving.
                let _ = scheduler.complete(id);
            }
        }

        waves
    }

    /// Drives the run to completion and returns the summary.
    pub fn run(&mut self) -> Result<RunSummary> {
        if self.config.dry_run {
            let waves = self.plan();
            for (i, wave) in waves.iter().enumerate() {
                for (id, title, locks) in &wave.tasks {
                    tracing::info!(wave = i + 1, id = %id, title = %title, locks = locks.join(","), "planned");
                }
            }
            return Ok(RunSummary {
                done: Vec::new(),
                failed: Vec::new(),
                reports: Vec::new(),
                outcome: RunOutcome::Completed(None),
            });
        }

        let summary = self.execute()?;
        Ok(summary)
    }

    /// The execute phase plus the integration hand-off.
    #[allow(clippy::too_many_lines)]
    fn execute(&mut self) -> Result<RunSummary> {
        let (tx, rx) = mpsc::channel::<Outcome>();
        let supervisor = Arc::new(AgentSupervisor::new(
            self.engine.clone(),
            self.git.clone(),
            self.run_dir.clone(),
            self.config.base_branch.clone(),
            self.config.supervisor.clone(),
            self.cancel.clone(),
        ));

        let mut handles = Vec::new();
        let mut admission_order: Vec<String> = Vec::new();
        let mut reports: Vec<TaskReport> = Vec::new();
        let mut next_ordinal: u32 = 0;
        let mut active: usize = 0;
        let mut halted = false;
        let mut halt_deadline: Option<Instant> = None;
        let mut interrupted = false;

        loop {
            if !halted {
                for id in self.scheduler.admit(self.config.concurrency) {
                    next_ordinal += 1;
                    admission_order.push(id.clone());

                    match self.launch(&id, next_ordinal, &supervisor, &tx) {
                        Ok(handle) => {
                            active += 1;
                            handles.push(handle);
                        }
                        Err(e) => {
                            // Provisioning failed before any agent ran.
                            let report = self.provisioning_failure(&id, &e);
                            if report.failure_type == Some(FailureType::External) {
                                self.latch(&report);
                                halted = true;
                                halt_deadline =
                                    Some(Instant::now() + self.failure.stop_deadline());
                            }
                            reports.push(report);
                        }
                    }
                }
            }

            if active == 0 {
                if self.scheduler.is_drained() || halted {
                    break;
                }
                if self.scheduler.is_deadlocked() {
                    let diagnostics = self.deadlock_diagnostics();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Ok(self.summarize(
                        admission_order,
                        reports,
                        RunOutcome::Deadlocked(diagnostics),
                    ));
                }
            }

            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(outcome) => {
                    active -= 1;
                    self.absorb(&outcome);
                    if outcome.report.status == ReportStatus::Failed
                        && outcome.report.failure_type == Some(FailureType::External)
                        && !halted
                    {
                        self.latch(&outcome.report);
                        halted = true;
                        halt_deadline = Some(Instant::now() + self.failure.stop_deadline());
                    }
                    reports.push(outcome.report);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    for id in self.scheduler.in_state(TaskState::Running) {
                        let tail = progress::read_tail(
                            &self.run_dir.stream_path(&id),
                            progress::TAIL_WINDOW_BYTES,
                        );
                        tracing::debug!(
                            task = %id,
                            step = %progress::classify(&tail),
                            "agent progress"
                        );
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }

            if self.interrupt.load(Ordering::SeqCst) && !interrupted {
                tracing::warn!("interrupt received; stopping admission");
                interrupted = true;
                halted = true;
                halt_deadline = Some(Instant::now() + INTERRUPT_GRACE);
            }

            if let Some(deadline) = halt_deadline {
                if Instant::now() >= deadline {
                    // Past the deadline: escalate stop-then-kill through
                    // the cancellation token.
                    self.cancel.store(true, Ordering::SeqCst);
                }
            }
        }

        for handle in handles {
            let _ = handle.join();
        }

        let outcome = if interrupted {
            RunOutcome::Interrupted
        } else if let Some(latched) = self.failure.latched() {
            RunOutcome::ExternalFailure(latched.clone())
        } else {
            RunOutcome::Completed(self.integrate(&admission_order, &reports)?)
        };

        Ok(self.summarize(admission_order, reports, outcome))
    }

    /// Provisions a worktree and spawns the supervisor thread.
    fn launch(
        &mut self,
        id: &str,
        ordinal: u32,
        supervisor: &Arc<AgentSupervisor>,
        tx: &mpsc::Sender<Outcome>,
    ) -> Result<std::thread::JoinHandle<()>> {
        let task = self
            .graph
            .task(id)
            .ok_or_else(|| {
                ConductorError::system("task_missing", format!("Task {id} vanished"), "orchestrator")
            })?
            .clone();

        let worktree = self.worktrees.provision(id, ordinal)?;
        self.branches.insert(id.to_string(), worktree.branch.clone());
        tracing::info!(task = %id, branch = %worktree.branch, "agent launched");

        let supervisor = supervisor.clone();
        let tx = tx.clone();
        let inferred = infer_locks(&task.touches);
        Ok(std::thread::spawn(move || {
            let report = supervisor.run_task(&task, &inferred, &worktree);
            let _ = tx.send(Outcome { report, worktree });
        }))
    }

    /// Applies a supervisor outcome to the scheduler and the store.
    fn absorb(&mut self, outcome: &Outcome) {
        let id = &outcome.report.task_id;

        if let Err(e) = self
            .worktrees
            .teardown(&outcome.worktree, &self.run_dir.log_path(id))
        {
            tracing::warn!(task = %id, error = %e, "worktree teardown failed");
        }

        match outcome.report.status {
            ReportStatus::Done => {
                if let Err(e) = self.scheduler.complete(id) {
                    tracing::error!(task = %id, error = %e, "complete transition rejected");
                    return;
                }
                if self.graph.mark_completed(id).is_ok() {
                    if let Err(e) = self.graph.save(&self.run_dir.tasks_path()) {
                        tracing::warn!(task = %id, error = %e, "graph persistence failed");
                    }
                }
                tracing::info!(task = %id, "task done");
            }
            ReportStatus::Failed => {
                if let Err(e) = self.scheduler.fail(id) {
                    tracing::error!(task = %id, error = %e, "fail transition rejected");
                }
                tracing::warn!(
                    task = %id,
                    failure = ?outcome.report.failure_type,
                    "task failed"
                );
            }
        }
    }

    /// Records the latching failure with the controller.
    fn latch(&mut self, report: &TaskReport) {
        let message = report.error_message.clone().unwrap_or_default();
        self.failure.record(&report.task_id, &message);
        tracing::error!(
            task = %report.task_id,
            message = %message,
            "external failure latched; admission stopped"
        );
    }

    /// Builds a failed report for a task whose worktree never came up.
    fn provisioning_failure(&mut self, id: &str, error: &ConductorError) -> TaskReport {
        // The task was started by admit; release it.
        let _ = self.scheduler.fail(id);

        let title = self
            .graph
            .task(id)
            .map(|t| t.title.clone())
            .unwrap_or_default();
        let failure_type = crate::core::failure::classify(&error.message);
        let report = TaskReport::failed(id, title, "", failure_type, error.to_string());
        if let Err(e) = self.run_dir.write_report(&report) {
            tracing::error!(task = %id, error = %e, "failed to persist report");
        }
        report
    }

    /// Block diagnostics for every still-pending task.
    fn deadlock_diagnostics(&self) -> Vec<BlockReason> {
        self.scheduler
            .in_state(TaskState::Pending)
            .iter()
            .filter_map(|id| self.scheduler.explain_block(id))
            .collect()
    }

    /// Integration hand-off: runs only when something completed this run
    /// and push mode is disabled.
    fn integrate(
        &mut self,
        admission_order: &[String],
        reports: &[TaskReport],
    ) -> Result<Option<IntegrationOutcome>> {
        if self.config.supervisor.push_mode {
            return Ok(None);
        }

        // Only tasks that ran this run have a branch to merge; tasks that
        // loaded as completed were merged by an earlier run.
        let ordered: Vec<(String, String)> = self
            .scheduler
            .done_in_dependency_order(admission_order)
            .into_iter()
            .filter_map(|id| self.branches.get(&id).map(|b| (id, b.clone())))
            .collect();

        if ordered.is_empty() {
            return Ok(None);
        }

        let pipeline = IntegrationPipeline::new(
            self.git.clone(),
            self.engine.clone(),
            self.run_dir.clone(),
            IntegrationConfig {
                base_branch: self.config.base_branch.clone(),
                repo_root: self.config.repo_root.clone(),
                agent_timeout: self.config.supervisor.agent_timeout,
            },
            self.cancel.clone(),
        );

        let outcome = pipeline.run(&mut self.graph, &ordered, reports)?;
        if let IntegrationOutcome::FixTasksAppended(ids) = &outcome {
            for id in ids {
                if let Err(e) = self.scheduler.register_appended(&self.graph, id) {
                    tracing::warn!(task = %id, error = %e, "fix task registration failed");
                }
            }
        }
        Ok(Some(outcome))
    }

    fn summarize(
        &self,
        admission_order: Vec<String>,
        reports: Vec<TaskReport>,
        outcome: RunOutcome,
    ) -> RunSummary {
        let done = admission_order
            .iter()
            .filter(|id| {
                self.scheduler.state_of(id) == Some(TaskState::Done)
            })
            .cloned()
            .collect();
        let failed = self.scheduler.in_state(TaskState::Failed);

        RunSummary {
            done,
            failed,
            reports,
            outcome,
        }
    }

    /// The graph as it stands (including appended fix tasks).
    #[must_use]
    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }
}
