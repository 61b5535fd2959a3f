//! Task-graph validation and cycle detection.
//!
//! Validation covers referential integrity (unique ids, required fields,
//! existing dependency targets) and acyclicity of the `dependsOn`
//! relation. All issues found are reported together rather than failing
//! on the first one, so a bad planning run surfaces everything at once.
//!
//! Cycle detection is an iterative depth-first traversal with three node
//! colors. On a back-edge it produces a witness path: the sequence of ids
//! forming the cycle, ending at the revisited node.

use crate::core::error::ConductorError;
use crate::core::graph::TaskGraph;
use std::collections::HashMap;
use std::fmt::Write as _;

/// A single validation issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    /// Task id declared more than once.
    DuplicateId(String),
    /// Required field missing or empty (task id, field name).
    MissingField(String, &'static str),
    /// A dependency references an id that does not exist (task, dep).
    DanglingDep(String, String),
    /// The dependency relation contains a cycle; the witness lists the ids
    /// forming it, ending at the revisited node.
    Cycle(Vec<String>),
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateId(id) => write!(f, "duplicate task id: {id}"),
            Self::MissingField(id, field) => {
                write!(f, "task {id}: required field `{field}` is missing or empty")
            }
            Self::DanglingDep(id, dep) => {
                write!(f, "task {id}: dependency `{dep}` does not exist")
            }
            Self::Cycle(witness) => write!(f, "dependency cycle: {}", witness.join(" -> ")),
        }
    }
}

/// Validates a graph, returning every issue found.
#[must_use]
pub fn validate(graph: &TaskGraph) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let mut seen: HashMap<&str, usize> = HashMap::new();

    for task in &graph.tasks {
        if task.id.trim().is_empty() {
            issues.push(ValidationIssue::MissingField(task.id.clone(), "id"));
        }
        if task.title.trim().is_empty() {
            issues.push(ValidationIssue::MissingField(task.id.clone(), "title"));
        }
        *seen.entry(task.id.as_str()).or_insert(0) += 1;
    }

    for task in &graph.tasks {
        if seen.get(task.id.as_str()).copied().unwrap_or(0) > 1 {
            // Report each duplicated id once.
            if !issues
                .iter()
                .any(|i| matches!(i, ValidationIssue::DuplicateId(id) if *id == task.id))
            {
                issues.push(ValidationIssue::DuplicateId(task.id.clone()));
            }
        }
        for dep in &task.depends_on {
            if !graph.contains(dep) {
                issues.push(ValidationIssue::DanglingDep(task.id.clone(), dep.clone()));
            }
        }
    }

    if let Some(witness) = find_cycle(graph) {
        issues.push(ValidationIssue::Cycle(witness));
    }

    issues
}

/// Validates a graph, converting any issues into one batched error.
pub fn ensure_valid(graph: &TaskGraph) -> Result<(), ConductorError> {
    let issues = validate(graph);
    if issues.is_empty() {
        return Ok(());
    }

    let mut message = format!("task-graph validation failed with {} issue(s):", issues.len());
    for issue in &issues {
        let _ = write!(message, "\n  - {issue}");
    }

    Err(ConductorError::spec("invalid_graph", message, "graph:validate")
        .with_context("issues", issues.len().to_string()))
}

/// Node color during traversal.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Unvisited,
    OnStack,
    Done,
}

/// Searches for a dependency cycle.
///
/// Returns `None` for an acyclic graph; otherwise the witness path whose
/// first and last element coincide. Traversal order follows declaration
/// order so the witness is deterministic for a given input.
#[must_use]
pub fn find_cycle(graph: &TaskGraph) -> Option<Vec<String>> {
    let mut colors: HashMap<&str, Color> = graph
        .tasks
        .iter()
        .map(|t| (t.id.as_str(), Color::Unvisited))
        .collect();

    for root in &graph.tasks {
        if colors.get(root.id.as_str()) != Some(&Color::Unvisited) {
            continue;
        }

        // Explicit stack of (task id, next dependency index to visit).
        let mut stack: Vec<(&str, usize)> = vec![(root.id.as_str(), 0)];
        let mut path: Vec<&str> = vec![root.id.as_str()];
        colors.insert(root.id.as_str(), Color::OnStack);

        while let Some((id, dep_index)) = stack.pop() {
            let deps = graph.task(id).map(|t| t.depends_on.as_slice()).unwrap_or(&[]);

            // Skip dependencies that do not exist; they are reported as
            // dangling separately and cannot participate in a cycle.
            let mut next = dep_index;
            while next < deps.len() && !colors.contains_key(deps[next].as_str()) {
                next += 1;
            }

            if next >= deps.len() {
                colors.insert(id, Color::Done);
                path.pop();
                continue;
            }

            let dep = deps[next].as_str();
            stack.push((id, next + 1));

            match colors.get(dep).copied() {
                Some(Color::Unvisited) => {
                    colors.insert(dep, Color::OnStack);
                    stack.push((dep, 0));
                    path.push(dep);
                }
                Some(Color::OnStack) => {
                    // Back-edge: the cycle runs from the earlier occurrence
                    // of `dep` on the path through `id`, back to `dep`.
                    let start = path.iter().position(|p| *p == dep).unwrap_or(0);
                    let mut witness: Vec<String> =
                        path[start..].iter().map(|s| (*s).to_string()).collect();
                    witness.push(dep.to_string());
                    return Some(witness);
                }
                Some(Color::Done) | None => {}
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::{Task, TaskGraph};

    fn graph_of(tasks: Vec<Task>) -> TaskGraph {
        let mut graph = TaskGraph::new();
        graph.tasks = tasks;
        graph
    }

    #[test]
    fn valid_graph_has_no_issues() {
        let graph = graph_of(vec![
            Task::new("A", "a"),
            Task::new("B", "b").with_dep("A"),
            Task::new("C", "c").with_dep("B"),
        ]);
        assert!(validate(&graph).is_empty());
        assert!(ensure_valid(&graph).is_ok());
    }

    #[test]
    fn empty_graph_is_valid() {
        assert!(validate(&TaskGraph::new()).is_empty());
    }

    #[test]
    fn duplicate_ids_reported_once_each() {
        let graph = graph_of(vec![
            Task::new("A", "first"),
            Task::new("A", "second"),
            Task::new("B", "b"),
        ]);
        let issues = validate(&graph);
        let dupes: Vec<_> = issues
            .iter()
            .filter(|i| matches!(i, ValidationIssue::DuplicateId(_)))
            .collect();
        assert_eq!(dupes.len(), 1);
    }

    #[test]
    fn missing_title_reported() {
        let graph = graph_of(vec![Task::new("A", "  ")]);
        let issues = validate(&graph);
        assert!(issues
            .iter()
            .any(|i| matches!(i, ValidationIssue::MissingField(id, "title") if id == "A")));
    }

    #[test]
    fn dangling_dep_reported() {
        let graph = graph_of(vec![Task::new("A", "a").with_dep("GHOST")]);
        let issues = validate(&graph);
        assert!(issues.iter().any(
            |i| matches!(i, ValidationIssue::DanglingDep(id, dep) if id == "A" && dep == "GHOST")
        ));
    }

    #[test]
    fn all_issues_are_batched() {
        let graph = graph_of(vec![
            Task::new("A", ""),
            Task::new("A", "dup"),
            Task::new("B", "b").with_dep("GHOST"),
        ]);
        let err = ensure_valid(&graph).unwrap_err();
        assert!(err.message.contains("duplicate task id: A"));
        assert!(err.message.contains("`title`"));
        assert!(err.message.contains("GHOST"));
    }

    #[test]
    fn acyclic_graph_returns_empty_witness() {
        let graph = graph_of(vec![
            Task::new("A", "a"),
            Task::new("B", "b").with_dep("A"),
        ]);
        assert_eq!(find_cycle(&graph), None);
    }

    #[test]
    fn three_cycle_witness_ends_at_revisited_node() {
        // P -> Q -> R -> P
        let graph = graph_of(vec![
            Task::new("P", "p").with_dep("Q"),
            Task::new("Q", "q").with_dep("R"),
            Task::new("R", "r").with_dep("P"),
        ]);

        let witness = find_cycle(&graph).expect("cycle expected");
        assert_eq!(witness.first(), witness.last());
        assert_eq!(witness.len(), 4);
        assert!(witness.contains(&"P".to_string()));
        assert!(witness.contains(&"Q".to_string()));
        assert!(witness.contains(&"R".to_string()));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let graph = graph_of(vec![Task::new("A", "a").with_dep("A")]);
        let witness = find_cycle(&graph).expect("cycle expected");
        assert_eq!(witness, vec!["A".to_string(), "A".to_string()]);
    }

    #[test]
    fn closing_edge_creates_witness() {
        let mut graph = graph_of(vec![
            Task::new("A", "a"),
            Task::new("B", "b").with_dep("A"),
            Task::new("C", "c").with_dep("B"),
        ]);
        assert_eq!(find_cycle(&graph), None);

        // Close the loop: A now depends on C.
        graph.tasks[0].depends_on.push("C".to_string());
        let witness = find_cycle(&graph).expect("cycle expected");
        assert_eq!(witness.first(), witness.last());
    }

    #[test]
    fn cycle_detection_is_deterministic() {
        let build = || {
            graph_of(vec![
                Task::new("P", "p").with_dep("Q"),
                Task::new("Q", "q").with_dep("R"),
                Task::new("R", "r").with_dep("P"),
            ])
        };
        assert_eq!(find_cycle(&build()), find_cycle(&build()));
    }

    #[test]
    fn dangling_deps_do_not_break_cycle_search() {
        let graph = graph_of(vec![
            Task::new("A", "a").with_dep("GHOST").with_dep("B"),
            Task::new("B", "b").with_dep("A"),
        ]);
        assert!(find_cycle(&graph).is_some());
    }
}
