//! Resource-lock inference from declared path patterns.
//!
//! Every task declares the path patterns it intends to modify (`touches`).
//! Hotspot paths (package manifests, migrations, routing tables) map to
//! shared named locks so that textually independent tasks cannot collide
//! on them at runtime. The mapping is total and deterministic: the first
//! matching rule wins, and any pattern that matches no rule falls back to
//! its top-level path segment (or `root` for bare wildcards).

use crate::core::graph::Task;

/// Lock name for package manifests and lock files.
pub const LOCK_LOCKFILE: &str = "lockfile";
/// Lock name for database migration directories.
pub const LOCK_DB_MIGRATIONS: &str = "db-migrations";
/// Lock name for schema definitions.
pub const LOCK_DB_SCHEMA: &str = "db-schema";
/// Lock name for router/routes directories.
pub const LOCK_ROUTER: &str = "router";
/// Lock name for configuration directories and env files.
pub const LOCK_GLOBAL_CONFIG: &str = "global-config";
/// Fallback lock name for patterns with no usable path segment.
pub const LOCK_ROOT: &str = "root";

/// A single inference rule: predicate over a normalized pattern, lock name.
struct LockRule {
    name: &'static str,
    matches: fn(&NormalizedPattern) -> bool,
}

/// Ordered rule table. First match wins.
const RULES: &[LockRule] = &[
    LockRule {
        name: LOCK_LOCKFILE,
        matches: is_package_manifest,
    },
    LockRule {
        name: LOCK_DB_MIGRATIONS,
        matches: is_migrations_path,
    },
    LockRule {
        name: LOCK_DB_SCHEMA,
        matches: is_schema_path,
    },
    LockRule {
        name: LOCK_ROUTER,
        matches: is_router_path,
    },
    LockRule {
        name: LOCK_GLOBAL_CONFIG,
        matches: is_config_path,
    },
];

/// A `touches` pattern broken into comparable pieces.
struct NormalizedPattern {
    /// Path segments with leading `./` stripped, empty segments removed.
    segments: Vec<String>,
    /// Final segment (the file or directory name), lowercased.
    basename: String,
}

impl NormalizedPattern {
    fn parse(pattern: &str) -> Self {
        let trimmed = pattern.trim().trim_start_matches("./");
        let segments: Vec<String> = trimmed
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_ascii_lowercase)
            .collect();
        let basename = segments.last().cloned().unwrap_or_default();
        Self { segments, basename }
    }

    /// True if any directory-level segment equals one of the given names.
    fn has_dir_segment(&self, names: &[&str]) -> bool {
        self.segments
            .iter()
            .any(|seg| names.iter().any(|n| seg == n))
    }

    /// First segment that is not a glob, if any.
    fn first_concrete_segment(&self) -> Option<&str> {
        self.segments
            .iter()
            .map(String::as_str)
            .find(|seg| !is_glob_segment(seg))
    }
}

fn is_glob_segment(segment: &str) -> bool {
    segment.chars().all(|c| c == '*') && !segment.is_empty()
}

fn is_package_manifest(p: &NormalizedPattern) -> bool {
    p.basename == "package.json"
        || p.basename == "pnpm-lock.yaml"
        || p.basename == "yarn.lock"
        || p.basename.ends_with("-lock.json")
}

fn is_migrations_path(p: &NormalizedPattern) -> bool {
    p.has_dir_segment(&["migrations"])
}

fn is_schema_path(p: &NormalizedPattern) -> bool {
    p.has_dir_segment(&["schema", "schemas"]) || p.basename.starts_with("schema.")
}

fn is_router_path(p: &NormalizedPattern) -> bool {
    p.has_dir_segment(&["routes", "router", "routers"])
}

fn is_config_path(p: &NormalizedPattern) -> bool {
    p.has_dir_segment(&["config", "settings"])
        || p.basename.starts_with(".env")
        || p.basename == "settings.json"
}

/// Maps one `touches` pattern to its canonical lock name.
///
/// Total and deterministic: every pattern maps to exactly one lock.
#[must_use]
pub fn infer_lock(pattern: &str) -> String {
    let normalized = NormalizedPattern::parse(pattern);

    for rule in RULES {
        if (rule.matches)(&normalized) {
            return rule.name.to_string();
        }
    }

    match normalized.first_concrete_segment() {
        Some(segment) => segment.to_string(),
        None => LOCK_ROOT.to_string(),
    }
}

/// Infers the deduplicated lock set for a list of `touches` patterns,
/// preserving first-seen order.
#[must_use]
pub fn infer_locks(touches: &[String]) -> Vec<String> {
    let mut locks = Vec::new();
    for pattern in touches {
        let lock = infer_lock(pattern);
        if !locks.contains(&lock) {
            locks.push(lock);
        }
    }
    locks
}

/// Computes the effective lock set for a task: explicit locks first, then
/// inferred locks, duplicates skipped. Output order is stable for a given
/// task definition.
#[must_use]
pub fn effective_locks(task: &Task) -> Vec<String> {
    let mut locks: Vec<String> = Vec::new();
    for lock in &task.locks {
        if !locks.contains(lock) {
            locks.push(lock.clone());
        }
    }
    for lock in infer_locks(&task.touches) {
        if !locks.contains(&lock) {
            locks.push(lock);
        }
    }
    locks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::Task;

    fn task_with(touches: &[&str], locks: &[&str]) -> Task {
        let mut task = Task::new("T-1", "Test task");
        task.touches = touches.iter().map(|s| (*s).to_string()).collect();
        task.locks = locks.iter().map(|s| (*s).to_string()).collect();
        task
    }

    #[test]
    fn package_manifests_map_to_lockfile() {
        assert_eq!(infer_lock("package.json"), LOCK_LOCKFILE);
        assert_eq!(infer_lock("package-lock.json"), LOCK_LOCKFILE);
        assert_eq!(infer_lock("pnpm-lock.yaml"), LOCK_LOCKFILE);
        assert_eq!(infer_lock("yarn.lock"), LOCK_LOCKFILE);
        assert_eq!(infer_lock("apps/web/package.json"), LOCK_LOCKFILE);
    }

    #[test]
    fn migrations_map_to_db_migrations() {
        assert_eq!(infer_lock("db/migrations/0001_init.sql"), LOCK_DB_MIGRATIONS);
        assert_eq!(infer_lock("migrations/**"), LOCK_DB_MIGRATIONS);
    }

    #[test]
    fn schema_paths_map_to_db_schema() {
        assert_eq!(infer_lock("prisma/schema.prisma"), LOCK_DB_SCHEMA);
        assert_eq!(infer_lock("db/schema/users.sql"), LOCK_DB_SCHEMA);
    }

    #[test]
    fn router_paths_map_to_router() {
        assert_eq!(infer_lock("src/routes/index.ts"), LOCK_ROUTER);
        assert_eq!(infer_lock("app/router/mod.rs"), LOCK_ROUTER);
    }

    #[test]
    fn config_paths_map_to_global_config() {
        assert_eq!(infer_lock("config/app.yaml"), LOCK_GLOBAL_CONFIG);
        assert_eq!(infer_lock(".env.production"), LOCK_GLOBAL_CONFIG);
        assert_eq!(infer_lock("src/settings/defaults.rs"), LOCK_GLOBAL_CONFIG);
    }

    #[test]
    fn fallback_is_top_level_segment() {
        assert_eq!(infer_lock("src/web/index.ts"), "src");
        assert_eq!(infer_lock("docs/README.md"), "docs");
        assert_eq!(infer_lock("./lib/util.rs"), "lib");
    }

    #[test]
    fn bare_wildcard_maps_to_root() {
        assert_eq!(infer_lock("*"), LOCK_ROOT);
        assert_eq!(infer_lock("**"), LOCK_ROOT);
        assert_eq!(infer_lock("**/*"), LOCK_ROOT);
    }

    #[test]
    fn leading_glob_falls_through_to_concrete_segment() {
        assert_eq!(infer_lock("**/src/lib.rs"), "src");
    }

    #[test]
    fn rule_order_is_first_match_wins() {
        // A manifest inside a config directory is still the lockfile lock.
        assert_eq!(infer_lock("config/package.json"), LOCK_LOCKFILE);
    }

    #[test]
    fn inference_deduplicates() {
        let locks = infer_locks(&[
            "package.json".to_string(),
            "yarn.lock".to_string(),
            "src/a.rs".to_string(),
            "src/b.rs".to_string(),
        ]);
        assert_eq!(locks, vec![LOCK_LOCKFILE.to_string(), "src".to_string()]);
    }

    #[test]
    fn effective_locks_union_explicit_first() {
        let task = task_with(&["package.json", "src/api.ts"], &["custom", "src"]);
        let locks = effective_locks(&task);
        assert_eq!(
            locks,
            vec![
                "custom".to_string(),
                "src".to_string(),
                LOCK_LOCKFILE.to_string(),
            ]
        );
    }

    #[test]
    fn empty_touches_yields_only_explicit_locks() {
        let task = task_with(&[], &["lockfile"]);
        assert_eq!(effective_locks(&task), vec!["lockfile".to_string()]);

        let bare = task_with(&[], &[]);
        assert!(effective_locks(&bare).is_empty());
    }

    #[test]
    fn effective_locks_idempotent_and_order_insensitive_output() {
        let task = task_with(&["src/a.rs", "package.json"], &[]);
        let first = effective_locks(&task);
        let second = effective_locks(&task);
        assert_eq!(first, second);

        let reversed = task_with(&["package.json", "src/a.rs"], &[]);
        let mut a = effective_locks(&task);
        let mut b = effective_locks(&reversed);
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }
}
