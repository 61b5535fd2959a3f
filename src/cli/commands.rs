//! CLI argument definitions.

use crate::cli::output::OutputFormat;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Conductor - parallel task orchestration for autonomous coding agents.
#[derive(Debug, Parser)]
#[command(name = "conductor", version, about)]
pub struct Cli {
    /// Output format.
    #[arg(long, global = true, value_enum, default_value = "table")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Execute a PRD: plan (if needed), run agents, integrate.
    Run(RunArgs),
    /// Validate a task-graph file and report every issue.
    Validate(ValidateArgs),
}

/// Arguments for `conductor run`.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Product-requirements document. Required unless --tasks or --resume
    /// provides a task-graph.
    #[arg(long)]
    pub prd: Option<PathBuf>,

    /// Pre-generated task-graph file.
    #[arg(long)]
    pub tasks: Option<PathBuf>,

    /// Resume an existing run directory by PRD id.
    #[arg(long)]
    pub resume: Option<String>,

    /// Agent engine.
    #[arg(long, default_value = "opencode")]
    pub engine: String,

    /// Maximum concurrently running agents.
    #[arg(long, default_value_t = 3)]
    pub concurrency: usize,

    /// Retries per task for transient agent errors.
    #[arg(long, default_value_t = 2)]
    pub retries: u32,

    /// Seconds between retries.
    #[arg(long, default_value_t = 5)]
    pub retry_delay: u64,

    /// Seconds to wait for running agents after an external failure.
    #[arg(long, default_value_t = 120)]
    pub external_failure_timeout: u64,

    /// Seconds before a single agent invocation is stopped.
    #[arg(long, default_value_t = 1800)]
    pub agent_timeout: u64,

    /// Print the admission plan without running anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Base branch override.
    #[arg(long, default_value = "main")]
    pub base_branch: String,

    /// Push each successful branch and open a change request instead of
    /// merging locally.
    #[arg(long)]
    pub create_change_request: bool,

    /// Repository to operate on.
    #[arg(long, default_value = ".")]
    pub repo: PathBuf,

    /// Root directory for run artifacts.
    #[arg(long, default_value = "artifacts")]
    pub artifacts_root: PathBuf,
}

/// Arguments for `conductor validate`.
#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Task-graph file to validate.
    #[arg(long)]
    pub tasks: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_defaults() {
        let cli = Cli::parse_from(["conductor", "run", "--prd", "spec.md"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.concurrency, 3);
        assert_eq!(args.retries, 2);
        assert_eq!(args.engine, "opencode");
        assert!(!args.dry_run);
        assert_eq!(args.base_branch, "main");
    }

    #[test]
    fn parses_overrides() {
        let cli = Cli::parse_from([
            "conductor",
            "run",
            "--tasks",
            "tasks.json",
            "--engine",
            "claude-code",
            "--concurrency",
            "8",
            "--dry-run",
            "--create-change-request",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.engine, "claude-code");
        assert_eq!(args.concurrency, 8);
        assert!(args.dry_run);
        assert!(args.create_change_request);
    }

    #[test]
    fn parses_validate() {
        let cli = Cli::parse_from(["conductor", "validate", "--tasks", "tasks.json"]);
        assert!(matches!(cli.command, Commands::Validate(_)));
    }
}
