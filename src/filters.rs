//! Path filters applied to every sync candidate: what never syncs, and
//! what rides the priority channel.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

/// Name of the optional user-provided ignore file at the datasites root.
const USER_IGNORE_FILE: &str = "syftignore";

/// Paths that never take part in sync, in gitignore syntax. Markers and
/// staging temp files must stay local or every conflict would replicate
/// its own debris.
const BUILTIN_IGNORES: &[&str] = &[
    USER_IGNORE_FILE,
    "**/syft.sub.yaml",
    ".syftkeep",
    // conflict / rejected markers, current and legacy spellings
    "**/*.conflict",
    "**/*.conflict.*",
    "**/*.rejected",
    "**/*.rejected.*",
    "**/*syftconflict*",
    "**/*syftrejected*",
    // staging temp files from both implementations of atomic writes
    "**/.*.tmp-*",
    "**/*.tmp-*",
    "*.syft.tmp.*",
    "*.tmp",
    // hotlink ipc markers
    "**/stream.sock",
    "**/stream.tcp",
    "**/stream.pipe",
    "**/stream.accept",
    // tooling and runtime litter
    ".data/",
    ".git",
    ".vscode",
    ".idea",
    "logs/",
    "*.log",
    ".DS_Store",
    "Thumbds.db",
    "Icon",
    // python projects dropped into datasites
    "__pycache__/",
    ".ipynb_checkpoints/",
    "*.py[cod]",
    ".venv/",
    "venv/",
    "dist/",
];

/// Paths that go over the priority channel instead of waiting for the next
/// bulk pass: RPC traffic and ACL files (which gate everything else).
const PRIORITY_PATTERNS: &[&str] = &[
    "**/*.request",
    "**/*.response",
    "**/syft.pub.yaml",
];

/// A compiled gitignore-style matcher anchored at the datasites root.
struct PatternSet {
    matcher: Gitignore,
}

impl PatternSet {
    fn compile<'a>(base: &Path, lines: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(base);
        for line in lines {
            builder
                .add_line(None, line)
                .with_context(|| format!("bad filter pattern: {line}"))?;
        }
        Ok(Self {
            matcher: builder.build().context("compile filter patterns")?,
        })
    }

    fn matches(&self, rel: &Path, is_dir: bool) -> bool {
        self.matcher
            .matched_path_or_any_parents(rel, is_dir)
            .is_ignore()
    }
}

pub struct SyncIgnoreList(PatternSet);

impl SyncIgnoreList {
    /// Builtin ignores plus whatever a `syftignore` file at the root adds.
    pub fn load(datasites_root: &Path) -> Result<Self> {
        let user_lines = read_user_ignores(&datasites_root.join(USER_IGNORE_FILE));
        let lines = BUILTIN_IGNORES
            .iter()
            .copied()
            .chain(user_lines.iter().map(String::as_str));
        Ok(Self(PatternSet::compile(datasites_root, lines)?))
    }

    pub fn should_ignore_rel(&self, rel: &Path, is_dir: bool) -> bool {
        self.0.matches(rel, is_dir)
    }
}

pub struct SyncPriorityList(PatternSet);

impl SyncPriorityList {
    pub fn load(datasites_root: &Path) -> Result<Self> {
        Ok(Self(PatternSet::compile(
            datasites_root,
            PRIORITY_PATTERNS.iter().copied(),
        )?))
    }

    pub fn should_prioritize_rel(&self, rel: &Path, is_dir: bool) -> bool {
        self.0.matches(rel, is_dir)
    }
}

pub struct SyncFilters {
    pub ignore: SyncIgnoreList,
    pub priority: SyncPriorityList,
}

impl SyncFilters {
    pub fn load(datasites_root: &Path) -> Result<Self> {
        fs::create_dir_all(datasites_root)
            .with_context(|| format!("create {}", datasites_root.display()))?;
        Ok(Self {
            ignore: SyncIgnoreList::load(datasites_root)?,
            priority: SyncPriorityList::load(datasites_root)?,
        })
    }

    /// Conflict/rejected markers are recognized by name alone so they can
    /// be excluded even before any matcher is built (and so marking a file
    /// can never loop on its own output).
    pub fn is_marked_rel_path(rel: &str) -> bool {
        const MARKER_TOKENS: [&str; 4] =
            [".conflict", ".rejected", "syftconflict", "syftrejected"];
        MARKER_TOKENS.iter().any(|token| rel.contains(token))
    }
}

fn read_user_ignores(path: &Path) -> Vec<String> {
    let Ok(raw) = fs::read_to_string(path) else {
        return Vec::new();
    };
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.contains('\0'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::SystemTime;

    fn make_temp_dir(name: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("datasite-sync-filters-test-{name}-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn builtin_ignores_cover_markers_and_staging_files() {
        let root = make_temp_dir("builtin");
        let filters = SyncFilters::load(&root).unwrap();

        for rel in [
            "alice@example.com/public/x.conflict.txt",
            "alice@example.com/public/x.rejected.txt",
            "alice@example.com/public/.x.bin.tmp-8cd89f7b",
            "alice@example.com/public/x.bin.tmp-8cd89f7b",
            "alice@example.com/public/x.syft.tmp.123456",
            "alice@example.com/app_data/demo/rpc/ep/stream.sock",
            "alice@example.com/syft.sub.yaml",
        ] {
            assert!(
                filters.ignore.should_ignore_rel(Path::new(rel), false),
                "{rel} should be ignored"
            );
        }

        for rel in [
            "alice@example.com/public/data.txt",
            "alice@example.com/public/syft.pub.yaml",
            "alice@example.com/app_data/demo/rpc/ep/x.request",
        ] {
            assert!(
                !filters.ignore.should_ignore_rel(Path::new(rel), false),
                "{rel} should sync"
            );
        }
    }

    #[test]
    fn dot_data_subtree_is_ignored_as_a_directory() {
        let root = make_temp_dir("dotdata");
        let filters = SyncFilters::load(&root).unwrap();
        assert!(filters
            .ignore
            .should_ignore_rel(Path::new(".data/sync.db"), false));
    }

    #[test]
    fn user_syftignore_extends_the_builtin_set() {
        let root = make_temp_dir("user");
        fs::write(
            root.join(USER_IGNORE_FILE),
            "# local policy\n*.scratch\n\n   \n",
        )
        .unwrap();

        let filters = SyncFilters::load(&root).unwrap();
        assert!(filters
            .ignore
            .should_ignore_rel(Path::new("alice@example.com/notes.scratch"), false));
        assert!(!filters
            .ignore
            .should_ignore_rel(Path::new("alice@example.com/notes.txt"), false));
    }

    #[test]
    fn priority_covers_rpc_traffic_and_acl_files() {
        let root = make_temp_dir("priority");
        let prio = SyncPriorityList::load(&root).unwrap();

        assert!(prio.should_prioritize_rel(
            Path::new("alice@example.com/app_data/demo/rpc/ep/call.request"),
            false
        ));
        assert!(prio.should_prioritize_rel(
            Path::new("alice@example.com/app_data/demo/rpc/ep/call.response"),
            false
        ));
        assert!(prio.should_prioritize_rel(
            Path::new("alice@example.com/public/syft.pub.yaml"),
            false
        ));
        assert!(!prio.should_prioritize_rel(
            Path::new("alice@example.com/public/big.bin"),
            false
        ));
    }

    #[test]
    fn marker_names_are_recognized_without_a_matcher() {
        assert!(SyncFilters::is_marked_rel_path("a/b/file.conflict.txt"));
        assert!(SyncFilters::is_marked_rel_path(
            "a/b/file.rejected.20260101120000.txt"
        ));
        assert!(SyncFilters::is_marked_rel_path("a/b/old.syftrejected.txt"));
        assert!(!SyncFilters::is_marked_rel_path("a/b/file.txt"));
    }
}
