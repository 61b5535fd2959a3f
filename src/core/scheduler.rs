//! DAG scheduler - readiness, lock-aware admission, deadlock detection.
//!
//! The scheduler tracks one state per task and one holder per resource
//! lock. A task is admissible when it is pending, every dependency is
//! done, and no lock in its effective lock set is held. The scheduler has
//! exactly one writer, the coordinator; supervisors report outcomes back
//! through a channel and never touch this state.

use crate::core::graph::TaskGraph;
use crate::core::locks::effective_locks;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Execution state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Not yet admitted.
    Pending,
    /// Currently executing under an agent.
    Running,
    /// Terminal success.
    Done,
    /// Terminal failure. Never re-admitted.
    Failed,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Why a pending task cannot currently start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReason {
    /// The blocked task.
    pub task_id: String,
    /// Dependencies that are not done, with their current state.
    pub unsatisfied_deps: Vec<(String, TaskState)>,
    /// Locks the task needs that are currently held, with their holder.
    pub held_locks: Vec<(String, String)>,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} blocked", self.task_id)?;
        if !self.unsatisfied_deps.is_empty() {
            let deps: Vec<String> = self
                .unsatisfied_deps
                .iter()
                .map(|(id, state)| format!("{id} ({state})"))
                .collect();
            write!(f, "; waiting on deps: {}", deps.join(", "))?;
        }
        if !self.held_locks.is_empty() {
            let locks: Vec<String> = self
                .held_locks
                .iter()
                .map(|(lock, holder)| format!("{lock} held by {holder}"))
                .collect();
            write!(f, "; waiting on locks: {}", locks.join(", "))?;
        }
        Ok(())
    }
}

/// Errors from scheduler operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Task not found.
    TaskNotFound(String),
    /// The requested transition is not valid from the current state.
    InvalidTransition {
        id: String,
        from: TaskState,
        to: TaskState,
    },
    /// Start preconditions not met (deps unsatisfied or lock held).
    NotAdmissible(Box<BlockReason>),
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TaskNotFound(id) => write!(f, "Task not found: {id}"),
            Self::InvalidTransition { id, from, to } => {
                write!(f, "Invalid transition for {id}: {from} -> {to}")
            }
            Self::NotAdmissible(reason) => write!(f, "Not admissible: {reason}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

/// Counts of tasks per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
}

/// The DAG + resource-lock scheduler.
#[derive(Debug, Clone)]
pub struct Scheduler {
    /// Task ids in declaration order; the deterministic tie-break.
    order: Vec<String>,
    /// Dependency edges, snapshot from the graph.
    deps: HashMap<String, Vec<String>>,
    /// Effective lock set per task (explicit first, then inferred).
    locks: HashMap<String, Vec<String>>,
    /// Current state per task.
    state: HashMap<String, TaskState>,
    /// Lock name -> id of the running task holding it.
    holder: HashMap<String, String>,
}

impl Scheduler {
    /// Builds a scheduler from a validated graph. Tasks already completed
    /// at load time start in `done`, everything else in `pending`.
    #[must_use]
    pub fn from_graph(graph: &TaskGraph) -> Self {
        let mut order = Vec::new();
        let mut deps = HashMap::new();
        let mut locks = HashMap::new();
        let mut state = HashMap::new();

        for task in &graph.tasks {
            order.push(task.id.clone());
            deps.insert(task.id.clone(), task.depends_on.clone());
            locks.insert(task.id.clone(), effective_locks(task));
            let initial = if task.completed {
                TaskState::Done
            } else {
                TaskState::Pending
            };
            state.insert(task.id.clone(), initial);
        }

        Self {
            order,
            deps,
            locks,
            state,
            holder: HashMap::new(),
        }
    }

    /// Registers a task appended to the graph after construction
    /// (fix tasks). It starts `pending`.
    pub fn register_appended(&mut self, graph: &TaskGraph, id: &str) -> Result<(), SchedulerError> {
        let task = graph
            .task(id)
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;
        self.order.push(task.id.clone());
        self.deps.insert(task.id.clone(), task.depends_on.clone());
        self.locks.insert(task.id.clone(), effective_locks(task));
        self.state.insert(task.id.clone(), TaskState::Pending);
        Ok(())
    }

    /// Current state of a task.
    #[must_use]
    pub fn state_of(&self, id: &str) -> Option<TaskState> {
        self.state.get(id).copied()
    }

    /// Effective lock set of a task, as snapshotted at construction.
    #[must_use]
    pub fn locks_of(&self, id: &str) -> &[String] {
        self.locks.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Holder of a lock, if any.
    #[must_use]
    pub fn holder_of(&self, lock: &str) -> Option<&str> {
        self.holder.get(lock).map(String::as_str)
    }

    fn deps_done(&self, id: &str) -> bool {
        self.deps
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .all(|dep| self.state.get(dep.as_str()) == Some(&TaskState::Done))
    }

    fn locks_free(&self, id: &str) -> bool {
        self.locks_of(id)
            .iter()
            .all(|lock| !self.holder.contains_key(lock))
    }

    /// Every pending task whose deps are all done and whose entire
    /// effective lock set is unheld, in declaration order.
    #[must_use]
    pub fn ready(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.state.get(id.as_str()) == Some(&TaskState::Pending))
            .filter(|id| self.deps_done(id))
            .filter(|id| self.locks_free(id))
            .cloned()
            .collect()
    }

    /// Transitions a task to running and installs it as holder of every
    /// lock in its effective set, atomically.
    pub fn start(&mut self, id: &str) -> Result<(), SchedulerError> {
        let current = self
            .state_of(id)
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;

        if current != TaskState::Pending {
            return Err(SchedulerError::InvalidTransition {
                id: id.to_string(),
                from: current,
                to: TaskState::Running,
            });
        }
        if !self.deps_done(id) || !self.locks_free(id) {
            return Err(SchedulerError::NotAdmissible(Box::new(
                self.explain_block(id)
                    .unwrap_or_else(|| BlockReason {
                        task_id: id.to_string(),
                        unsatisfied_deps: Vec::new(),
                        held_locks: Vec::new(),
                    }),
            )));
        }

        self.state.insert(id.to_string(), TaskState::Running);
        for lock in self.locks.get(id).cloned().unwrap_or_default() {
            self.holder.insert(lock, id.to_string());
        }
        Ok(())
    }

    /// Transitions a running task to done and releases its locks. The
    /// coordinator persists `completed = true` through the store
    /// immediately after.
    pub fn complete(&mut self, id: &str) -> Result<(), SchedulerError> {
        self.finish(id, TaskState::Done)
    }

    /// Transitions a running task to failed and releases its locks.
    /// Failed tasks are never re-admitted; their dependents stay pending
    /// and surface through the blocked diagnostics.
    pub fn fail(&mut self, id: &str) -> Result<(), SchedulerError> {
        self.finish(id, TaskState::Failed)
    }

    fn finish(&mut self, id: &str, terminal: TaskState) -> Result<(), SchedulerError> {
        let current = self
            .state_of(id)
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;

        if current != TaskState::Running {
            return Err(SchedulerError::InvalidTransition {
                id: id.to_string(),
                from: current,
                to: terminal,
            });
        }

        self.state.insert(id.to_string(), terminal);
        self.holder.retain(|_, h| h.as_str() != id);
        Ok(())
    }

    /// Admits up to `max_concurrent - running` ready tasks, applying
    /// `start` to each. Readiness is recomputed after every start so the
    /// admitted batch always has pairwise disjoint lock sets.
    pub fn admit(&mut self, max_concurrent: usize) -> Vec<String> {
        let mut admitted = Vec::new();

        loop {
            if self.counts().running >= max_concurrent {
                break;
            }
            let Some(next) = self.ready().into_iter().next() else {
                break;
            };
            if self.start(&next).is_err() {
                break;
            }
            admitted.push(next);
        }

        admitted
    }

    /// Structured explanation of why a pending task cannot start.
    #[must_use]
    pub fn explain_block(&self, id: &str) -> Option<BlockReason> {
        self.state_of(id)?;

        let unsatisfied_deps = self
            .deps
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
            .iter()
            .filter_map(|dep| {
                let state = self.state.get(dep.as_str()).copied()?;
                (state != TaskState::Done).then(|| (dep.clone(), state))
            })
            .collect();

        let held_locks = self
            .locks_of(id)
            .iter()
            .filter_map(|lock| {
                self.holder
                    .get(lock)
                    .map(|holder| (lock.clone(), holder.clone()))
            })
            .collect();

        Some(BlockReason {
            task_id: id.to_string(),
            unsatisfied_deps,
            held_locks,
        })
    }

    /// Tasks per state.
    #[must_use]
    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for state in self.state.values() {
            match state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Done => counts.done += 1,
                TaskState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Ids currently in the given state, in declaration order.
    #[must_use]
    pub fn in_state(&self, wanted: TaskState) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.state.get(id.as_str()) == Some(&wanted))
            .cloned()
            .collect()
    }

    /// True iff pending tasks exist, nothing is running, and nothing is
    /// ready: the graph cannot make progress without intervention.
    #[must_use]
    pub fn is_deadlocked(&self) -> bool {
        let counts = self.counts();
        counts.pending > 0 && counts.running == 0 && self.ready().is_empty()
    }

    /// True when no task is pending or running.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        let counts = self.counts();
        counts.pending == 0 && counts.running == 0
    }

    /// Completed task ids in an order consistent with the DAG: a task
    /// never precedes one of its dependencies. Ties follow the given
    /// admission order, then declaration order.
    #[must_use]
    pub fn done_in_dependency_order(&self, admission_order: &[String]) -> Vec<String> {
        let done: Vec<String> = self
            .order
            .iter()
            .filter(|id| self.state.get(id.as_str()) == Some(&TaskState::Done))
            .cloned()
            .collect();

        let rank = |id: &str| -> usize {
            admission_order
                .iter()
                .position(|a| a.as_str() == id)
                .unwrap_or(usize::MAX)
        };
        let declared = |id: &str| -> usize {
            self.order
                .iter()
                .position(|o| o.as_str() == id)
                .unwrap_or(usize::MAX)
        };

        // Kahn's algorithm over the done subset, smallest admission rank
        // first so the output is deterministic.
        let mut in_degree: HashMap<&str, usize> = done.iter().map(|id| (id.as_str(), 0)).collect();
        for id in &done {
            for dep in self.deps.get(id.as_str()).map(Vec::as_slice).unwrap_or(&[]) {
                if in_degree.contains_key(dep.as_str()) {
                    *in_degree.get_mut(id.as_str()).unwrap() += 1;
                }
            }
        }

        let mut result = Vec::with_capacity(done.len());
        let mut frontier: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();

        while !frontier.is_empty() {
            frontier.sort_by_key(|id| (rank(id), declared(id)));
            let next = frontier.remove(0);
            result.push(next.to_string());
            in_degree.remove(next);

            for id in &done {
                if in_degree.contains_key(id.as_str())
                    && self
                        .deps
                        .get(id.as_str())
                        .map(Vec::as_slice)
                        .unwrap_or(&[])
                        .iter()
                        .any(|dep| dep.as_str() == next)
                {
                    let d = in_degree.get_mut(id.as_str()).unwrap();
                    *d = d.saturating_sub(1);
                    if *d == 0 && !frontier.contains(&id.as_str()) {
                        frontier.push(id.as_str());
                    }
                }
            }
        }

        result
    }

    /// Debug invariant: every running task holds all of its locks and no
    /// lock has more than one holder.
    #[must_use]
    pub fn holders_consistent(&self) -> bool {
        for (id, state) in &self.state {
            if *state == TaskState::Running {
                let all_held = self
                    .locks_of(id)
                    .iter()
                    .all(|lock| self.holder.get(lock).map(String::as_str) == Some(id.as_str()));
                if !all_held {
                    return false;
                }
            }
        }
        self.holder
            .values()
            .all(|h| self.state.get(h.as_str()) == Some(&TaskState::Running))
    }
}
