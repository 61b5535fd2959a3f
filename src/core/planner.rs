//! Planning step - turning a PRD into a task-graph.
//!
//! The planning agent is opaque, like every other agent: it gets the PRD
//! text and the task-graph schema in its prompt and must answer with the
//! versioned JSON document. The answer is validated before anything runs.

use crate::adapters::engine::{Engine, InvokeRequest};
use crate::artifacts::RunDirectory;
use crate::core::error::{ConductorError, Result};
use crate::core::graph::TaskGraph;
use crate::core::validate::ensure_valid;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// Generates, validates and persists a task-graph from a PRD file.
pub fn plan_tasks(
    engine: &dyn Engine,
    prd_path: &Path,
    run_dir: &RunDirectory,
    timeout: Duration,
    cancel: &AtomicBool,
) -> Result<TaskGraph> {
    let prd = std::fs::read_to_string(prd_path).map_err(|e| {
        ConductorError::environment(
            "prd_unreadable",
            format!("Cannot read {}: {e}", prd_path.display()),
            "planner",
        )
    })?;

    let mut prompt = String::from(
        "Decompose the following product-requirements document into \
         independent coding tasks. Answer with nothing but a JSON document \
         of the form:\n\
         {\"version\": 1, \"branchName\": \"kebab-case-feature\", \"tasks\": [\
         {\"id\": \"T-001\", \"title\": \"...\", \"completed\": false, \
         \"dependsOn\": [], \"touches\": [\"path/pattern\"], \"locks\": [], \
         \"mergeNotes\": \"\"}]}\n\
         Declare every file pattern a task will modify in `touches`, and \
         use `dependsOn` only for hard ordering requirements.\n\n",
    );
    let _ = writeln!(prompt, "PRD:\n{prd}");

    let request = InvokeRequest::new(prompt, run_dir.root().join("planner-output.json"))
        .with_log(run_dir.log_path("planner"))
        .with_timeout(timeout);

    let parsed = engine.execute(&request, cancel)?;
    if let Some(error) = parsed.error {
        return Err(ConductorError::agent(
            "planner_failed",
            format!("{}: {}", error.code, error.message),
            "planner",
        ));
    }

    let json = extract_json(&parsed.response_text).ok_or_else(|| {
        ConductorError::agent(
            "planner_no_graph",
            "Planning agent answered without a task-graph document",
            "planner",
        )
    })?;

    let graph = TaskGraph::from_json(json)?;
    ensure_valid(&graph)?;
    graph.save(&run_dir.tasks_path())?;
    Ok(graph)
}

/// Pulls the outermost JSON object out of an answer that may carry prose
/// around it.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::engine::{MockEngine, ParsedStream};

    fn run_dir(tmp: &Path) -> RunDirectory {
        let mut dir = RunDirectory::new(tmp, "plan-test");
        dir.ensure().expect("run dir");
        dir
    }

    fn prd_file(tmp: &Path) -> std::path::PathBuf {
        let path = tmp.join("PRD.md");
        std::fs::write(&path, "# Checkout flow\nBuild a cart.").unwrap();
        path
    }

    #[test]
    fn plan_parses_and_persists_graph() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = run_dir(tmp.path());
        let prd = prd_file(tmp.path());

        let engine = MockEngine::new();
        engine.push_response(ParsedStream {
            response_text: r#"Here you go:
{"version": 1, "branchName": "checkout", "tasks": [
  {"id": "T-001", "title": "Cart API", "dependsOn": [], "touches": ["src/api/**"]}
]}"#
            .to_string(),
            ..ParsedStream::default()
        });

        let cancel = AtomicBool::new(false);
        let graph =
            plan_tasks(&engine, &prd, &dir, Duration::from_secs(5), &cancel).unwrap();

        assert_eq!(graph.ids(), vec!["T-001"]);
        assert!(dir.tasks_path().exists());

        // The prompt carried the PRD content.
        assert!(engine.prompts()[0].contains("Build a cart."));
    }

    #[test]
    fn invalid_planned_graph_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = run_dir(tmp.path());
        let prd = prd_file(tmp.path());

        let engine = MockEngine::new();
        engine.push_response(ParsedStream {
            response_text:
                r#"{"version": 1, "tasks": [{"id": "A", "title": "a", "dependsOn": ["GHOST"]}]}"#
                    .to_string(),
            ..ParsedStream::default()
        });

        let cancel = AtomicBool::new(false);
        let err = plan_tasks(&engine, &prd, &dir, Duration::from_secs(5), &cancel).unwrap_err();
        assert_eq!(err.code, "invalid_graph");
    }

    #[test]
    fn prose_only_answer_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = run_dir(tmp.path());
        let prd = prd_file(tmp.path());

        let engine = MockEngine::new();
        engine.push_response(ParsedStream {
            response_text: "I could not produce tasks, sorry.".to_string(),
            ..ParsedStream::default()
        });

        let cancel = AtomicBool::new(false);
        let err = plan_tasks(&engine, &prd, &dir, Duration::from_secs(5), &cancel).unwrap_err();
        assert_eq!(err.code, "planner_no_graph");
    }

    #[test]
    fn extract_json_finds_braced_document() {
        assert_eq!(extract_json(r#"x {"a": 1} y"#), Some(r#"{"a": 1}"#));
        assert_eq!(extract_json("no braces"), None);
    }
}
