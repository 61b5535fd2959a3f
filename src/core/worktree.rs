//! Worktree management for isolated task execution.
//!
//! Every admitted task gets a fresh branch and a fresh working copy at a
//! scratch path, so parallel agents never share a filesystem. Teardown
//! removes the working copy only when it is clean; a dirty worktree is
//! preserved on disk with a record in the agent's log. Branch deletion is
//! never done here: once a task finishes, branch ownership passes to the
//! integration pipeline.

use crate::core::error::Result;
use crate::core::git::Git;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An isolated working copy bound to one branch and one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worktree {
    /// Scratch directory holding the working copy.
    pub path: PathBuf,
    /// Branch checked out in the working copy.
    pub branch: String,
    /// Task the worktree belongs to.
    pub task_id: String,
}

/// What teardown did with the working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// Clean working copy removed.
    Removed,
    /// Dirty working copy preserved on disk.
    PreservedDirty,
}

/// Provisions and reclaims per-task worktrees.
pub struct WorktreeManager {
    git: Arc<dyn Git>,
    base_dir: PathBuf,
    base_branch: String,
    branch_prefix: String,
}

impl WorktreeManager {
    /// Creates a manager.
    ///
    /// `branch_prefix` is the graph's feature name when present, so branch
    /// names read `feature/agent-03-task-id`.
    #[must_use]
    pub fn new(
        git: Arc<dyn Git>,
        base_dir: PathBuf,
        base_branch: impl Into<String>,
        branch_prefix: impl Into<String>,
    ) -> Self {
        Self {
            git,
            base_dir,
            base_branch: base_branch.into(),
            branch_prefix: branch_prefix.into(),
        }
    }

    /// Deterministic branch name for a task and agent ordinal.
    #[must_use]
    pub fn branch_for(&self, task_id: &str, ordinal: u32) -> String {
        format!(
            "{}/agent-{ordinal:02}-{}",
            self.branch_prefix,
            slugify(task_id)
        )
    }

    /// Scratch path for a branch's working copy.
    #[must_use]
    pub fn path_for(&self, branch: &str) -> PathBuf {
        self.base_dir.join(branch.replace('/', "--"))
    }

    /// Provisions a fresh worktree for a task.
    ///
    /// Reclaims any stale registration under the proposed branch first:
    /// prune, remove a leftover working copy, delete the branch, then
    /// recreate the branch from the configured base and instantiate the
    /// working copy.
    pub fn provision(&self, task_id: &str, ordinal: u32) -> Result<Worktree> {
        let branch = self.branch_for(task_id, ordinal);
        let path = self.path_for(&branch);

        self.git.prune_stale()?;
        if path.exists() {
            // Leftover from an earlier run; registration may or may not
            // still exist, so tolerate removal failure and clear the dir.
            let _ = self.git.remove_worktree(&path);
            if path.exists() {
                std::fs::remove_dir_all(&path)?;
            }
        }
        if self.git.branch_exists(&branch)? {
            self.git.delete_branch(&branch)?;
        }

        self.git.create_branch(&branch, &self.base_branch)?;
        self.git.add_worktree(&path, &branch)?;

        Ok(Worktree {
            path,
            branch,
            task_id: task_id.to_string(),
        })
    }

    /// Tears down a worktree after its agent terminated.
    ///
    /// A clean working copy is removed; a dirty one is preserved and a
    /// record is appended to the agent's log. The branch survives either
    /// way.
    pub fn teardown(&self, worktree: &Worktree, log_path: &Path) -> Result<TeardownOutcome> {
        if self.git.is_clean(&worktree.path)? {
            self.git.remove_worktree(&worktree.path)?;
            return Ok(TeardownOutcome::Removed);
        }

        let record = format!(
            "[worktree] preserved dirty working copy for {} at {}\n",
            worktree.task_id,
            worktree.path.display()
        );
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(log_path) {
            let _ = file.write_all(record.as_bytes());
        }
        tracing::warn!(
            task = %worktree.task_id,
            path = %worktree.path.display(),
            "preserving dirty worktree"
        );
        Ok(TeardownOutcome::PreservedDirty)
    }

    /// Base branch the worktrees start from.
    #[must_use]
    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }
}

/// Lowercases and collapses a task id into a branch-safe slug.
fn slugify(id: &str) -> String {
    let mut slug = String::with_capacity(id.len());
    let mut last_dash = false;
    for c in id.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !slug.is_empty() {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("task");
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::git::MockGit;

    fn manager(tmp: &Path) -> (Arc<MockGit>, WorktreeManager) {
        let git = Arc::new(MockGit::new());
        let manager = WorktreeManager::new(
            git.clone(),
            tmp.join("worktrees"),
            "main",
            "checkout-flow",
        );
        (git, manager)
    }

    #[test]
    fn branch_names_are_deterministic() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (_git, manager) = manager(tmp.path());

        let a = manager.branch_for("T-001", 3);
        let b = manager.branch_for("T-001", 3);
        assert_eq!(a, b);
        assert_eq!(a, "checkout-flow/agent-03-t-001");
    }

    #[test]
    fn slugify_handles_odd_ids() {
        assert_eq!(slugify("T 001/beta"), "t-001-beta");
        assert_eq!(slugify("***"), "task");
        assert_eq!(slugify("FIX-002"), "fix-002");
    }

    #[test]
    fn provision_creates_branch_and_worktree() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (git, manager) = manager(tmp.path());

        let worktree = manager.provision("T-001", 1).unwrap();
        assert!(worktree.path.exists());
        assert!(git.has_branch(&worktree.branch));
        assert_eq!(worktree.task_id, "T-001");
    }

    #[test]
    fn provision_reclaims_stale_branch() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (git, manager) = manager(tmp.path());

        let first = manager.provision("T-001", 1).unwrap();
        // Simulate a stale leftover: branch and dir still exist.
        let second = manager.provision("T-001", 1).unwrap();
        assert_eq!(first.branch, second.branch);

        let ops = git.ops();
        assert!(ops.iter().any(|o| o == &format!("delete-branch:{}", first.branch)));
        assert!(ops.iter().filter(|o| o.starts_with("create-branch:")).count() >= 2);
    }

    #[test]
    fn teardown_removes_clean_worktree() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (_git, manager) = manager(tmp.path());

        let worktree = manager.provision("T-001", 1).unwrap();
        let log = tmp.path().join("t001.log");
        let outcome = manager.teardown(&worktree, &log).unwrap();

        assert_eq!(outcome, TeardownOutcome::Removed);
        assert!(!worktree.path.exists());
    }

    #[test]
    fn teardown_preserves_dirty_worktree_and_logs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (git, manager) = manager(tmp.path());

        let worktree = manager.provision("T-001", 1).unwrap();
        git.set_dirty(&worktree.path);

        let log = tmp.path().join("t001.log");
        let outcome = manager.teardown(&worktree, &log).unwrap();

        assert_eq!(outcome, TeardownOutcome::PreservedDirty);
        assert!(worktree.path.exists());
        let logged = std::fs::read_to_string(&log).unwrap();
        assert!(logged.contains("preserved dirty working copy"));
    }

    #[test]
    fn teardown_never_deletes_the_branch() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (git, manager) = manager(tmp.path());

        let worktree = manager.provision("T-001", 1).unwrap();
        let log = tmp.path().join("t001.log");
        manager.teardown(&worktree, &log).unwrap();

        assert!(git.has_branch(&worktree.branch));
    }
}
