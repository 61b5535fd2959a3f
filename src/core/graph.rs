//! Task-graph store - the single source of truth for task identity.
//!
//! The task-graph is a versioned JSON document produced by the planning
//! agent. The store parses it, answers lookups by task id, and exposes
//! exactly two mutators: marking a task completed and appending fix tasks
//! generated by the integration pipeline. Declaration order is preserved
//! and used as the deterministic tie-break everywhere downstream.

use crate::core::error::ConductorError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// The only recognized task-graph schema version.
pub const SCHEMA_VERSION: u64 = 1;

/// Prefix for fix tasks synthesized from review blockers.
pub const FIX_TASK_PREFIX: &str = "FIX-";

/// A single unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique, stable task id.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Whether the task has already been completed.
    #[serde(default)]
    pub completed: bool,
    /// Ids of tasks that must be done before this one is admissible.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Path patterns the task is permitted to modify.
    #[serde(default)]
    pub touches: Vec<String>,
    /// Explicit resource locks. The legacy field name `mutex` is accepted
    /// on read and treated as equivalent; new writes use `locks`.
    #[serde(default, alias = "mutex")]
    pub locks: Vec<String>,
    /// Free-form hint consumed by the merge conflict resolver.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub merge_notes: String,
    /// Shell-level check identifiers. Informational only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verify: Vec<String>,
}

impl Task {
    /// Creates a minimal task with the given id and title.
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            completed: false,
            depends_on: Vec::new(),
            touches: Vec::new(),
            locks: Vec::new(),
            merge_notes: String::new(),
            verify: Vec::new(),
        }
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dep(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    /// Adds a touched path pattern.
    #[must_use]
    pub fn with_touch(mut self, pattern: impl Into<String>) -> Self {
        self.touches.push(pattern.into());
        self
    }

    /// Adds an explicit lock.
    #[must_use]
    pub fn with_lock(mut self, lock: impl Into<String>) -> Self {
        self.locks.push(lock.into());
        self
    }

    /// Sets the merge notes.
    #[must_use]
    pub fn with_merge_notes(mut self, notes: impl Into<String>) -> Self {
        self.merge_notes = notes.into();
        self
    }
}

/// The versioned task-graph document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskGraph {
    /// Schema version tag. Must equal [`SCHEMA_VERSION`].
    pub version: u64,
    /// Optional kebab-case feature name used as the branch prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    /// Tasks in declaration order.
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl TaskGraph {
    /// Creates an empty graph at the current schema version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: SCHEMA_VERSION,
            branch_name: None,
            tasks: Vec::new(),
        }
    }

    /// Parses a graph from its JSON form.
    ///
    /// Only the version tag is checked here; full validation (duplicate
    /// ids, dangling deps, cycles) is the validator's job so that all
    /// issues can be reported batched.
    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        let graph: Self =
            serde_json::from_str(json).map_err(|e| GraphError::Malformed(e.to_string()))?;
        if graph.version != SCHEMA_VERSION {
            return Err(GraphError::UnknownVersion(graph.version));
        }
        Ok(graph)
    }

    /// Serializes the graph to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, GraphError> {
        serde_json::to_string_pretty(self).map_err(|e| GraphError::Malformed(e.to_string()))
    }

    /// Loads a graph from a file.
    pub fn load(path: &Path) -> Result<Self, GraphError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| GraphError::Io(path.display().to_string(), e.to_string()))?;
        Self::from_json(&json)
    }

    /// Saves the graph to a file with a single full-buffer write.
    pub fn save(&self, path: &Path) -> Result<(), GraphError> {
        let json = self.to_json()?;
        std::fs::write(path, json)
            .map_err(|e| GraphError::Io(path.display().to_string(), e.to_string()))
    }

    /// Returns task ids in declaration order.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    /// Fetches a task by id.
    #[must_use]
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Returns true if the graph contains the given id.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.task(id).is_some()
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True if the graph has no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Marks a task completed. Idempotent; the flag is never cleared.
    pub fn mark_completed(&mut self, id: &str) -> Result<(), GraphError> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| GraphError::TaskNotFound(id.to_string()))?;
        task.completed = true;
        Ok(())
    }

    /// Appends one fix task per issue description, with deterministic ids
    /// `FIX-001`, `FIX-002`, ... continuing after any existing fix tasks.
    /// Fix tasks have no dependencies and no locks.
    ///
    /// Returns the ids of the appended tasks.
    pub fn append_fix_tasks(&mut self, descriptions: &[String]) -> Vec<String> {
        let mut next = self.next_fix_ordinal();
        let mut appended = Vec::new();

        for description in descriptions {
            let id = format!("{FIX_TASK_PREFIX}{next:03}");
            next += 1;
            let title = fix_task_title(description);
            self.tasks.push(Task::new(id.clone(), title));
            appended.push(id);
        }

        appended
    }

    /// Next free ordinal in the `FIX-NNN` id space.
    fn next_fix_ordinal(&self) -> u32 {
        self.tasks
            .iter()
            .filter_map(|t| t.id.strip_prefix(FIX_TASK_PREFIX))
            .filter_map(|suffix| suffix.parse::<u32>().ok())
            .max()
            .map_or(1, |max| max + 1)
    }

    /// Builds a lookup table from task id to declaration index.
    #[must_use]
    pub fn index(&self) -> HashMap<String, usize> {
        self.tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect()
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Derives a fix-task title from a review issue description.
fn fix_task_title(description: &str) -> String {
    let flat = description.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut title = format!("Fix: {flat}");
    if title.len() > 100 {
        let mut cut = 97;
        while !title.is_char_boundary(cut) {
            cut -= 1;
        }
        title.truncate(cut);
        title.push_str("...");
    }
    title
}

/// Errors from task-graph store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The document did not parse as a task-graph.
    Malformed(String),
    /// The schema version tag is not recognized.
    UnknownVersion(u64),
    /// Task not found.
    TaskNotFound(String),
    /// File IO failure (path, cause).
    Io(String, String),
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "Malformed task-graph: {msg}"),
            Self::UnknownVersion(v) => {
                write!(f, "Unknown task-graph version {v} (expected {SCHEMA_VERSION})")
            }
            Self::TaskNotFound(id) => write!(f, "Task not found: {id}"),
            Self::Io(path, cause) => write!(f, "Task-graph IO error for {path}: {cause}"),
        }
    }
}

impl std::error::Error for GraphError {}

impl From<GraphError> for ConductorError {
    fn from(e: GraphError) -> Self {
        let code = match &e {
            GraphError::Malformed(_) => "malformed",
            GraphError::UnknownVersion(_) => "unknown_version",
            GraphError::TaskNotFound(_) => "task_not_found",
            GraphError::Io(_, _) => "io_error",
        };
        Self::spec(code, e.to_string(), "graph:store")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "version": 1,
            "branchName": "checkout-flow",
            "tasks": [
                {
                    "id": "T-001",
                    "title": "Add cart API",
                    "completed": false,
                    "dependsOn": [],
                    "touches": ["src/api/cart.ts", "package.json"],
                    "locks": ["lockfile"],
                    "mergeNotes": "Keep both exports"
                },
                {
                    "id": "T-002",
                    "title": "Wire cart UI",
                    "completed": false,
                    "dependsOn": ["T-001"],
                    "touches": ["src/web/cart.tsx"]
                }
            ]
        }"#
    }

    #[test]
    fn parse_valid_graph() {
        let graph = TaskGraph::from_json(sample_json()).unwrap();
        assert_eq!(graph.version, 1);
        assert_eq!(graph.branch_name.as_deref(), Some("checkout-flow"));
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.task("T-002").unwrap().depends_on, vec!["T-001"]);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let json = r#"{"version": 2, "tasks": []}"#;
        let err = TaskGraph::from_json(json).unwrap_err();
        assert_eq!(err, GraphError::UnknownVersion(2));
    }

    #[test]
    fn legacy_mutex_alias_is_accepted() {
        let json = r#"{
            "version": 1,
            "tasks": [{"id": "A", "title": "a", "mutex": ["lockfile"]}]
        }"#;
        let graph = TaskGraph::from_json(json).unwrap();
        assert_eq!(graph.task("A").unwrap().locks, vec!["lockfile"]);
    }

    #[test]
    fn new_writes_use_locks_field() {
        let json = r#"{
            "version": 1,
            "tasks": [{"id": "A", "title": "a", "mutex": ["lockfile"]}]
        }"#;
        let graph = TaskGraph::from_json(json).unwrap();
        let out = graph.to_json().unwrap();
        assert!(out.contains("\"locks\""));
        assert!(!out.contains("\"mutex\""));
    }

    #[test]
    fn round_trip_preserves_graph() {
        let graph = TaskGraph::from_json(sample_json()).unwrap();
        let json = graph.to_json().unwrap();
        let restored = TaskGraph::from_json(&json).unwrap();

        assert_eq!(graph.ids(), restored.ids());
        for id in graph.ids() {
            let a = graph.task(&id).unwrap();
            let b = restored.task(&id).unwrap();
            assert_eq!(a.depends_on, b.depends_on);
            assert_eq!(a.touches, b.touches);
        }
    }

    #[test]
    fn empty_graph_loads() {
        let graph = TaskGraph::from_json(r#"{"version": 1, "tasks": []}"#).unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn mark_completed_is_idempotent() {
        let mut graph = TaskGraph::from_json(sample_json()).unwrap();
        graph.mark_completed("T-001").unwrap();
        assert!(graph.task("T-001").unwrap().completed);

        // Marking again is a no-op.
        graph.mark_completed("T-001").unwrap();
        assert!(graph.task("T-001").unwrap().completed);
    }

    #[test]
    fn mark_completed_unknown_task_fails() {
        let mut graph = TaskGraph::new();
        let err = graph.mark_completed("nope").unwrap_err();
        assert_eq!(err, GraphError::TaskNotFound("nope".to_string()));
    }

    #[test]
    fn append_fix_tasks_assigns_sequential_ids() {
        let mut graph = TaskGraph::from_json(sample_json()).unwrap();
        let ids = graph.append_fix_tasks(&[
            "Cart total ignores discounts".to_string(),
            "Missing auth check on /cart".to_string(),
        ]);

        assert_eq!(ids, vec!["FIX-001", "FIX-002"]);
        let fix = graph.task("FIX-001").unwrap();
        assert!(fix.depends_on.is_empty());
        assert!(fix.locks.is_empty());
        assert!(fix.title.contains("Cart total"));
    }

    #[test]
    fn append_fix_tasks_continues_numbering() {
        let mut graph = TaskGraph::new();
        graph.tasks.push(Task::new("FIX-004", "Fix: earlier"));

        let ids = graph.append_fix_tasks(&["another".to_string()]);
        assert_eq!(ids, vec!["FIX-005"]);
    }

    #[test]
    fn fix_title_is_single_line_and_bounded() {
        let long = "a ".repeat(200);
        let title = fix_task_title(&long);
        assert!(title.len() <= 100);
        assert!(!title.contains('\n'));
        assert!(title.starts_with("Fix: "));
    }

    #[test]
    fn save_and_load_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("tasks.json");

        let graph = TaskGraph::from_json(sample_json()).unwrap();
        graph.save(&path).unwrap();

        let restored = TaskGraph::load(&path).unwrap();
        assert_eq!(graph, restored);
    }
}
