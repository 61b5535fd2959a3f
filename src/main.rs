//! Conductor CLI entrypoint.

use clap::Parser;
use conductor::adapters::create_engine;
use conductor::artifacts::RunDirectory;
use conductor::cli::commands::{Cli, Commands, RunArgs, ValidateArgs};
use conductor::cli::output::{output_error, output_summary, CliResponse, OutputFormat};
use conductor::core::error::{ConductorError, ExitCode};
use conductor::core::git::{CliGit, Git};
use conductor::core::graph::TaskGraph;
use conductor::core::orchestrator::{Orchestrator, RunConfig, RunOutcome};
use conductor::core::planner::plan_tasks;
use conductor::core::supervisor::SupervisorConfig;
use conductor::core::validate::validate;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn main() {
    conductor::logging::init();
    let cli = Cli::parse();
    let exit_code = match cli.command {
        Commands::Run(args) => handle_run(args, cli.format),
        Commands::Validate(args) => handle_validate(&args, cli.format),
    };
    process::exit(i32::from(exit_code));
}

fn handle_run(args: RunArgs, format: OutputFormat) -> ExitCode {
    let Some(prd_id) = resolve_prd_id(&args) else {
        return output_error(
            &ConductorError::environment(
                "missing_input",
                "Provide --prd, --tasks, or --resume",
                "cli:run",
            ),
            format,
        );
    };

    let mut run_dir = RunDirectory::new(&args.artifacts_root, &prd_id);
    if let Err(e) = run_dir.ensure() {
        return output_error(&e, format);
    }
    let run_dir = Arc::new(run_dir);

    let git: Arc<dyn Git> = match CliGit::new(args.repo.clone()) {
        Ok(git) => Arc::new(git),
        Err(e) => return output_error(&e, format),
    };
    let engine = match create_engine(&args.engine) {
        Ok(engine) => engine,
        Err(e) => return output_error(&e, format),
    };

    let interrupt = Arc::new(AtomicBool::new(false));
    {
        let flag = interrupt.clone();
        if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
            tracing::warn!(error = %e, "signal handler not installed");
        }
    }

    let graph = match load_or_plan(&args, engine.as_ref(), &run_dir, &interrupt) {
        Ok(graph) => graph,
        Err(e) => return output_error(&e, format),
    };

    let config = RunConfig {
        concurrency: args.concurrency.max(1),
        supervisor: SupervisorConfig {
            max_retries: args.retries,
            retry_delay: Duration::from_secs(args.retry_delay),
            agent_timeout: Duration::from_secs(args.agent_timeout),
            push_mode: args.create_change_request,
        },
        external_failure_timeout: Duration::from_secs(args.external_failure_timeout),
        base_branch: args.base_branch.clone(),
        repo_root: args.repo.clone(),
        worktree_dir: args.repo.join(".conductor").join("worktrees"),
        dry_run: args.dry_run,
    };

    let mut orchestrator =
        match Orchestrator::new(graph, git, engine, run_dir, config, interrupt) {
            Ok(orchestrator) => orchestrator,
            Err(e) => return output_error(&e, format),
        };

    if !args.dry_run {
        if let Err(e) = orchestrator.preflight() {
            return output_error(&e, format);
        }
    }

    match orchestrator.run() {
        Ok(summary) => {
            output_summary(&summary, format);
            match summary.outcome {
                RunOutcome::Completed(_) => ExitCode::Success,
                RunOutcome::Deadlocked(_) => ExitCode::Deadlock,
                RunOutcome::ExternalFailure(_) => ExitCode::ExternalFailure,
                RunOutcome::Interrupted => ExitCode::Interrupted,
            }
        }
        Err(e) => output_error(&e, format),
    }
}

/// PRD identifier: explicit resume id, else the input file's stem.
fn resolve_prd_id(args: &RunArgs) -> Option<String> {
    if let Some(id) = &args.resume {
        return Some(id.clone());
    }
    let source = args.prd.as_ref().or(args.tasks.as_ref())?;
    source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
}

/// Obtains the task-graph: resume from the run directory, load a given
/// file, or plan from the PRD.
fn load_or_plan(
    args: &RunArgs,
    engine: &dyn conductor::adapters::engine::Engine,
    run_dir: &RunDirectory,
    interrupt: &AtomicBool,
) -> Result<TaskGraph, ConductorError> {
    if args.resume.is_some() {
        let graph = TaskGraph::load(&run_dir.tasks_path())?;
        return Ok(graph);
    }

    if let Some(tasks_path) = &args.tasks {
        let graph = TaskGraph::load(tasks_path)?;
        graph.save(&run_dir.tasks_path())?;
        if let Some(prd) = &args.prd {
            run_dir.copy_prd(prd)?;
        }
        return Ok(graph);
    }

    let prd = args.prd.as_ref().ok_or_else(|| {
        ConductorError::environment(
            "missing_input",
            "Provide --prd, --tasks, or --resume",
            "cli:run",
        )
    })?;
    run_dir.copy_prd(prd)?;
    plan_tasks(
        engine,
        prd,
        run_dir,
        Duration::from_secs(args.agent_timeout),
        interrupt,
    )
}

fn handle_validate(args: &ValidateArgs, format: OutputFormat) -> ExitCode {
    let graph = match TaskGraph::load(&args.tasks) {
        Ok(graph) => graph,
        Err(e) => return output_error(&ConductorError::from(e), format),
    };

    let issues = validate(&graph);
    match format {
        OutputFormat::Json => {
            let listed: Vec<String> = issues.iter().map(ToString::to_string).collect();
            let response = CliResponse::success(serde_json::json!({
                "valid": listed.is_empty(),
                "issues": listed,
            }));
            if let Ok(json) = serde_json::to_string_pretty(&response) {
                println!("{json}");
            }
        }
        OutputFormat::Table => {
            if issues.is_empty() {
                println!("task-graph valid: {} task(s)", graph.len());
            } else {
                println!("task-graph invalid:");
                for issue in &issues {
                    println!("  - {issue}");
                }
            }
        }
    }

    if issues.is_empty() {
        ExitCode::Success
    } else {
        ExitCode::Error
    }
}
