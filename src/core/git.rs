//! Version-control capability set.
//!
//! Everything the orchestrator needs from version control is behind the
//! [`Git`] trait: worktree provisioning, branch lifecycle, commit
//! counting, merging. [`CliGit`] shells out to `git(1)` the way the rest
//! of the toolchain expects; [`MockGit`] simulates branches, commits and
//! conflicts in memory so scheduler and pipeline tests never touch a real
//! repository.

use crate::core::error::{ConductorError, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

/// Result of attempting a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The merge committed cleanly.
    Merged,
    /// The merge stopped on conflicts in the listed paths.
    Conflicted(Vec<String>),
}

/// Version-control operations used by the worktree manager, the
/// supervisor gates, and the integration pipeline.
pub trait Git: Send + Sync {
    /// Garbage-collects stale worktree registrations.
    fn prune_stale(&self) -> Result<()>;

    /// Removes a worktree registration and its directory.
    fn remove_worktree(&self, path: &Path) -> Result<()>;

    /// True if the branch exists.
    fn branch_exists(&self, branch: &str) -> Result<bool>;

    /// Deletes a branch.
    fn delete_branch(&self, branch: &str) -> Result<()>;

    /// Creates a branch pointing at `base`.
    fn create_branch(&self, branch: &str, base: &str) -> Result<()>;

    /// Adds a worktree at `path` checked out on `branch`.
    fn add_worktree(&self, path: &Path, branch: &str) -> Result<()>;

    /// Number of commits in `range`, evaluated inside `workdir`.
    fn commit_count(&self, workdir: &Path, range: &str) -> Result<u64>;

    /// Paths changed in `range`, evaluated inside `workdir`.
    fn changed_files(&self, workdir: &Path, range: &str) -> Result<Vec<String>>;

    /// True if the working copy at `path` has no uncommitted changes.
    fn is_clean(&self, path: &Path) -> Result<bool>;

    /// Checks out a branch in the base repository.
    fn checkout(&self, branch: &str) -> Result<()>;

    /// Merges `branch` into the current branch (never fast-forward).
    fn merge(&self, branch: &str) -> Result<MergeOutcome>;

    /// Aborts an in-progress merge.
    fn merge_abort(&self) -> Result<()>;

    /// Paths still in conflict in the base repository.
    fn conflicted_paths(&self) -> Result<Vec<String>>;

    /// Resolves a reference to a commit hash.
    fn rev_parse(&self, reference: &str) -> Result<String>;

    /// Short stat summary of the diff for `range`.
    fn diff_summary(&self, range: &str) -> Result<String>;

    /// Pushes a branch to the default remote.
    fn push_branch(&self, branch: &str) -> Result<()>;

    /// Opens a change request for a pushed branch.
    fn open_change_request(&self, branch: &str, title: &str, body: &str) -> Result<()>;
}

/// `git(1)`-backed implementation rooted at a repository path.
pub struct CliGit {
    repo_path: PathBuf,
}

impl CliGit {
    /// Creates a backend for the repository at `repo_path`, verifying it
    /// is inside a git work tree.
    pub fn new(repo_path: PathBuf) -> Result<Self> {
        let ok = Command::new("git")
            .current_dir(&repo_path)
            .args(["rev-parse", "--git-dir"])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !ok {
            return Err(ConductorError::environment(
                "not_a_repository",
                format!("{} is not a git repository", repo_path.display()),
                "git:cli",
            ));
        }
        Ok(Self { repo_path })
    }

    /// Repository root path.
    #[must_use]
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn run_in(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .current_dir(dir)
            .args(args)
            .output()
            .map_err(|e| {
                ConductorError::git("spawn_failed", format!("Failed to run git: {e}"), "git:cli")
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ConductorError::git(
                "command_failed",
                stderr.trim().to_string(),
                "git:cli",
            )
            .with_context("args", args.join(" ")))
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        self.run_in(&self.repo_path, args)
    }
}

impl Git for CliGit {
    fn prune_stale(&self) -> Result<()> {
        self.run(&["worktree", "prune"]).map(|_| ())
    }

    fn remove_worktree(&self, path: &Path) -> Result<()> {
        let path_str = path.to_str().ok_or_else(|| {
            ConductorError::git("bad_path", "Worktree path is not valid UTF-8", "git:cli")
        })?;
        self.run(&["worktree", "remove", "--force", path_str])
            .map(|_| ())
    }

    fn branch_exists(&self, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{branch}");
        let output = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["rev-parse", "--verify", "--quiet", reference.as_str()])
            .output()
            .map_err(|e| {
                ConductorError::git("spawn_failed", format!("Failed to run git: {e}"), "git:cli")
            })?;
        Ok(output.status.success())
    }

    fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run(&["branch", "-D", branch]).map(|_| ())
    }

    fn create_branch(&self, branch: &str, base: &str) -> Result<()> {
        self.run(&["branch", branch, base]).map(|_| ())
    }

    fn add_worktree(&self, path: &Path, branch: &str) -> Result<()> {
        let path_str = path.to_str().ok_or_else(|| {
            ConductorError::git("bad_path", "Worktree path is not valid UTF-8", "git:cli")
        })?;
        self.run(&["worktree", "add", path_str, branch]).map(|_| ())
    }

    fn commit_count(&self, workdir: &Path, range: &str) -> Result<u64> {
        let out = self.run_in(workdir, &["rev-list", "--count", range])?;
        out.trim().parse::<u64>().map_err(|e| {
            ConductorError::git(
                "bad_count",
                format!("Unparseable commit count `{}`: {e}", out.trim()),
                "git:cli",
            )
        })
    }

    fn changed_files(&self, workdir: &Path, range: &str) -> Result<Vec<String>> {
        let out = self.run_in(workdir, &["diff", "--name-only", range])?;
        Ok(out.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
    }

    fn is_clean(&self, path: &Path) -> Result<bool> {
        let out = self.run_in(path, &["status", "--porcelain"])?;
        Ok(out.trim().is_empty())
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        self.run(&["checkout", branch]).map(|_| ())
    }

    fn merge(&self, branch: &str) -> Result<MergeOutcome> {
        let output = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["merge", "--no-ff", "--no-edit", branch])
            .output()
            .map_err(|e| {
                ConductorError::git("spawn_failed", format!("Failed to run git: {e}"), "git:cli")
            })?;

        if output.status.success() {
            return Ok(MergeOutcome::Merged);
        }

        let conflicts = self.conflicted_paths()?;
        if conflicts.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConductorError::git(
                "merge_failed",
                stderr.trim().to_string(),
                "git:cli",
            )
            .with_context("branch", branch));
        }
        Ok(MergeOutcome::Conflicted(conflicts))
    }

    fn merge_abort(&self) -> Result<()> {
        self.run(&["merge", "--abort"]).map(|_| ())
    }

    fn conflicted_paths(&self) -> Result<Vec<String>> {
        let out = self.run(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(out.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
    }

    fn rev_parse(&self, reference: &str) -> Result<String> {
        let out = self.run(&["rev-parse", reference])?;
        Ok(out.trim().to_string())
    }

    fn diff_summary(&self, range: &str) -> Result<String> {
        self.run(&["diff", "--stat", range])
    }

    fn push_branch(&self, branch: &str) -> Result<()> {
        self.run(&["push", "--set-upstream", "origin", branch])
            .map(|_| ())
    }

    fn open_change_request(&self, branch: &str, title: &str, body: &str) -> Result<()> {
        // Delegated to the forge CLI; absence of `gh` is an environment
        // problem for push-mode runs only.
        let output = Command::new("gh")
            .current_dir(&self.repo_path)
            .args(["pr", "create", "--head", branch, "--title", title, "--body", body])
            .output()
            .map_err(|e| {
                ConductorError::environment(
                    "gh_unavailable",
                    format!("Failed to run gh: {e}"),
                    "git:cli",
                )
            })?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ConductorError::git(
                "change_request_failed",
                stderr.trim().to_string(),
                "git:cli",
            )
            .with_context("branch", branch))
        }
    }
}

/// In-memory git simulation for tests.
///
/// Branches, worktrees, per-branch commit counts and scripted merge
/// conflicts live behind a mutex so the mock can be shared across the
/// coordinator and supervisor threads like the real backend.
#[derive(Debug, Default)]
pub struct MockGit {
    state: Mutex<MockGitState>,
}

#[derive(Debug, Default)]
struct MockGitState {
    branches: HashSet<String>,
    /// Worktree path -> branch checked out there.
    worktrees: HashMap<PathBuf, String>,
    /// Branch -> commit count reported for its worktree.
    commit_counts: HashMap<String, u64>,
    default_commit_count: u64,
    /// Branch -> files reported changed.
    changed_files: HashMap<String, Vec<String>>,
    /// Worktree paths reported dirty.
    dirty_paths: HashSet<PathBuf>,
    /// Branch -> conflicted paths on merge.
    conflict_branches: HashMap<String, Vec<String>>,
    /// Branches whose conflicts survive the resolver.
    sticky_conflicts: HashSet<String>,
    /// Conflict currently blocking the base repository.
    current_conflict: Option<(String, Vec<String>)>,
    /// Branch currently checked out.
    current_branch: String,
    /// Successful merges, in order.
    merged: Vec<String>,
    /// Every operation performed, for assertions.
    ops: Vec<String>,
}

impl MockGit {
    /// Creates a mock with one commit per branch by default.
    #[must_use]
    pub fn new() -> Self {
        let mock = Self::default();
        {
            let mut state = mock.state.lock().expect("mock git lock");
            state.default_commit_count = 1;
            state.current_branch = "main".to_string();
            state.branches.insert("main".to_string());
        }
        mock
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockGitState> {
        self.state.lock().expect("mock git lock")
    }

    /// Scripts the commit count for a branch's worktree.
    pub fn set_commit_count(&self, branch: &str, count: u64) {
        self.lock().commit_counts.insert(branch.to_string(), count);
    }

    /// Scripts the changed-files listing for a branch's worktree.
    pub fn set_changed_files(&self, branch: &str, files: &[&str]) {
        self.lock()
            .changed_files
            .insert(branch.to_string(), files.iter().map(|s| (*s).to_string()).collect());
    }

    /// Marks a worktree path dirty so teardown preserves it.
    pub fn set_dirty(&self, path: &Path) {
        self.lock().dirty_paths.insert(path.to_path_buf());
    }

    /// Scripts a merge conflict for a branch. With `sticky` set the
    /// conflict survives the resolver agent.
    pub fn set_conflict(&self, branch: &str, paths: &[&str], sticky: bool) {
        let mut state = self.lock();
        state.conflict_branches.insert(
            branch.to_string(),
            paths.iter().map(|s| (*s).to_string()).collect(),
        );
        if sticky {
            state.sticky_conflicts.insert(branch.to_string());
        }
    }

    /// Branches merged successfully, in order.
    #[must_use]
    pub fn merged_branches(&self) -> Vec<String> {
        self.lock().merged.clone()
    }

    /// True if the branch currently exists.
    #[must_use]
    pub fn has_branch(&self, branch: &str) -> bool {
        self.lock().branches.contains(branch)
    }

    /// Recorded operations, for assertions.
    #[must_use]
    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }
}

impl Git for MockGit {
    fn prune_stale(&self) -> Result<()> {
        self.lock().ops.push("prune".to_string());
        Ok(())
    }

    fn remove_worktree(&self, path: &Path) -> Result<()> {
        let mut state = self.lock();
        state.worktrees.remove(path);
        state.ops.push(format!("remove-worktree:{}", path.display()));
        drop(state);
        let _ = std::fs::remove_dir_all(path);
        Ok(())
    }

    fn branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self.lock().branches.contains(branch))
    }

    fn delete_branch(&self, branch: &str) -> Result<()> {
        let mut state = self.lock();
        state.branches.remove(branch);
        state.ops.push(format!("delete-branch:{branch}"));
        Ok(())
    }

    fn create_branch(&self, branch: &str, base: &str) -> Result<()> {
        let mut state = self.lock();
        state.branches.insert(branch.to_string());
        state.ops.push(format!("create-branch:{branch}@{base}"));
        Ok(())
    }

    fn add_worktree(&self, path: &Path, branch: &str) -> Result<()> {
        std::fs::create_dir_all(path).map_err(|e| {
            ConductorError::git("worktree_add_failed", e.to_string(), "git:mock")
        })?;
        let mut state = self.lock();
        state.worktrees.insert(path.to_path_buf(), branch.to_string());
        state.ops.push(format!("add-worktree:{branch}"));
        Ok(())
    }

    fn commit_count(&self, workdir: &Path, _range: &str) -> Result<u64> {
        let state = self.lock();
        let branch = state.worktrees.get(workdir);
        Ok(branch
            .and_then(|b| state.commit_counts.get(b))
            .copied()
            .unwrap_or(state.default_commit_count))
    }

    fn changed_files(&self, workdir: &Path, _range: &str) -> Result<Vec<String>> {
        let state = self.lock();
        let branch = state.worktrees.get(workdir);
        Ok(branch
            .and_then(|b| state.changed_files.get(b))
            .cloned()
            .unwrap_or_default())
    }

    fn is_clean(&self, path: &Path) -> Result<bool> {
        Ok(!self.lock().dirty_paths.contains(path))
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        let mut state = self.lock();
        state.current_branch = branch.to_string();
        state.ops.push(format!("checkout:{branch}"));
        Ok(())
    }

    fn merge(&self, branch: &str) -> Result<MergeOutcome> {
        let mut state = self.lock();
        state.ops.push(format!("merge:{branch}"));
        if let Some(paths) = state.conflict_branches.get(branch).cloned() {
            state.current_conflict = Some((branch.to_string(), paths.clone()));
            return Ok(MergeOutcome::Conflicted(paths));
        }
        state.merged.push(branch.to_string());
        Ok(MergeOutcome::Merged)
    }

    fn merge_abort(&self) -> Result<()> {
        let mut state = self.lock();
        state.current_conflict = None;
        state.ops.push("merge-abort".to_string());
        Ok(())
    }

    fn conflicted_paths(&self) -> Result<Vec<String>> {
        let mut state = self.lock();
        match state.current_conflict.clone() {
            Some((branch, paths)) if state.sticky_conflicts.contains(&branch) => Ok(paths),
            Some((branch, _)) => {
                // The resolver "fixed" the conflict: record the merge.
                state.merged.push(branch.clone());
                state.current_conflict = None;
                Ok(Vec::new())
            }
            None => Ok(Vec::new()),
        }
    }

    fn rev_parse(&self, reference: &str) -> Result<String> {
        Ok(format!("{reference}-sha"))
    }

    fn diff_summary(&self, range: &str) -> Result<String> {
        Ok(format!("diff {range}: {} branches merged", self.lock().merged.len()))
    }

    fn push_branch(&self, branch: &str) -> Result<()> {
        self.lock().ops.push(format!("push:{branch}"));
        Ok(())
    }

    fn open_change_request(&self, branch: &str, title: &str, _body: &str) -> Result<()> {
        self.lock()
            .ops
            .push(format!("change-request:{branch}:{title}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_branch_lifecycle() {
        let git = MockGit::new();
        git.create_branch("feature/x", "main").unwrap();
        assert!(git.branch_exists("feature/x").unwrap());

        git.delete_branch("feature/x").unwrap();
        assert!(!git.branch_exists("feature/x").unwrap());
    }

    #[test]
    fn mock_commit_counts_default_and_override() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let wt = tmp.path().join("wt");

        let git = MockGit::new();
        git.create_branch("b1", "main").unwrap();
        git.add_worktree(&wt, "b1").unwrap();

        assert_eq!(git.commit_count(&wt, "main..HEAD").unwrap(), 1);
        git.set_commit_count("b1", 0);
        assert_eq!(git.commit_count(&wt, "main..HEAD").unwrap(), 0);
    }

    #[test]
    fn mock_merge_conflict_and_resolution() {
        let git = MockGit::new();
        git.create_branch("b1", "main").unwrap();
        git.set_conflict("b1", &["routes/app.ts"], false);

        let outcome = git.merge("b1").unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Conflicted(vec!["routes/app.ts".to_string()])
        );

        // Non-sticky conflict resolves on the post-resolver check.
        assert!(git.conflicted_paths().unwrap().is_empty());
        assert_eq!(git.merged_branches(), vec!["b1"]);
    }

    #[test]
    fn mock_sticky_conflict_survives_resolver() {
        let git = MockGit::new();
        git.create_branch("b1", "main").unwrap();
        git.set_conflict("b1", &["routes/app.ts"], true);

        git.merge("b1").unwrap();
        assert_eq!(git.conflicted_paths().unwrap(), vec!["routes/app.ts"]);

        git.merge_abort().unwrap();
        assert!(git.conflicted_paths().unwrap().is_empty());
        assert!(git.merged_branches().is_empty());
    }

    #[test]
    fn mock_worktree_dirs_are_real() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let wt = tmp.path().join("wt");

        let git = MockGit::new();
        git.create_branch("b1", "main").unwrap();
        git.add_worktree(&wt, "b1").unwrap();
        assert!(wt.exists());

        git.remove_worktree(&wt).unwrap();
        assert!(!wt.exists());
    }

    #[test]
    fn mock_is_clean_honours_dirty_marks() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let wt = tmp.path().join("wt");

        let git = MockGit::new();
        git.add_worktree(&wt, "b1").unwrap();
        assert!(git.is_clean(&wt).unwrap());

        git.set_dirty(&wt);
        assert!(!git.is_clean(&wt).unwrap());
    }

    #[test]
    fn mock_records_push_and_change_request() {
        let git = MockGit::new();
        git.push_branch("b1").unwrap();
        git.open_change_request("b1", "Add cart", "body").unwrap();

        let ops = git.ops();
        assert!(ops.iter().any(|o| o == "push:b1"));
        assert!(ops.iter().any(|o| o.starts_with("change-request:b1")));
    }
}
