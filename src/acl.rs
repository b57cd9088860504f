use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use globset::Glob;
use serde::{Deserialize, Serialize};

pub const ACL_FILE_NAME: &str = "syft.pub.yaml";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Permission {
    Read,
    Write,
    Admin,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Access {
    #[serde(default)]
    admin: Vec<String>,
    #[serde(default)]
    write: Vec<String>,
    #[serde(default)]
    read: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct AclRule {
    pattern: String,
    #[serde(default)]
    access: Access,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct AclFile {
    #[serde(default)]
    terminal: bool,
    #[serde(default)]
    rules: Vec<AclRule>,
}

/// One ruleset parsed from a single `syft.pub.yaml`, anchored at the
/// directory it was found in.
#[derive(Clone, Debug)]
struct Ruleset {
    dir: PathBuf,
    terminal: bool,
    rules: Vec<AclRule>,
}

/// Tree of parsed rulesets for one datasite owner, keyed by the directory
/// (relative to the datasite root) that contains each `syft.pub.yaml`.
///
/// Evaluating a path walks from the path's directory up toward the root,
/// stopping at the first terminal ruleset (or the root). Within a ruleset,
/// the last matching rule wins per permission.
pub struct AclStore {
    datasites_root: PathBuf,
    trees: RwLock<HashMap<String, Vec<Ruleset>>>,
}

/// Non-fatal parse failure: the store keeps the last known-good ruleset for
/// that directory (or treats it as absent) and logs the problem.
#[derive(Debug)]
pub struct AclInvalid {
    pub path: PathBuf,
    pub reason: String,
}

impl std::fmt::Display for AclInvalid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid acl file {}: {}", self.path.display(), self.reason)
    }
}

impl std::error::Error for AclInvalid {}

impl AclStore {
    pub fn new(datasites_root: &Path) -> Self {
        AclStore {
            datasites_root: datasites_root.to_path_buf(),
            trees: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the ruleset tree for `owner` by walking its datasite directory.
    /// Individual malformed files are skipped and reported, not fatal to the scan.
    pub fn reload(&self, owner: &str) -> Vec<AclInvalid> {
        let owner_root = self.datasites_root.join(owner);
        let mut rulesets = Vec::new();
        let mut errors = Vec::new();

        for entry in walkdir::WalkDir::new(&owner_root)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_name() != ACL_FILE_NAME {
                continue;
            }
            let dir = entry.path().parent().unwrap_or(&owner_root).to_path_buf();
            match std::fs::read_to_string(entry.path()) {
                Ok(raw) => match serde_yaml::from_str::<AclFile>(&raw) {
                    Ok(parsed) => rulesets.push(Ruleset {
                        dir,
                        terminal: parsed.terminal,
                        rules: parsed.rules,
                    }),
                    Err(e) => errors.push(AclInvalid {
                        path: entry.path().to_path_buf(),
                        reason: e.to_string(),
                    }),
                },
                Err(e) => errors.push(AclInvalid {
                    path: entry.path().to_path_buf(),
                    reason: e.to_string(),
                }),
            }
        }

        rulesets.sort_by(|a, b| depth(&a.dir).cmp(&depth(&b.dir)));
        self.trees
            .write()
            .unwrap()
            .insert(owner.to_string(), rulesets);

        for err in &errors {
            crate::logging::error(format!("{err}"));
        }
        errors
    }

    /// Evaluate whether `principal` holds `perm` on `rel_path` (relative to
    /// the owner's datasite root, e.g. `public/data.csv`).
    pub fn check(&self, owner: &str, principal: &str, rel_path: &str, perm: Permission) -> bool {
        if principal.eq_ignore_ascii_case(owner) {
            return true;
        }

        let trees = self.trees.read().unwrap();
        let Some(rulesets) = trees.get(owner) else {
            return false;
        };

        let target_dir = self.datasites_root.join(owner).join(
            Path::new(rel_path)
                .parent()
                .unwrap_or_else(|| Path::new("")),
        );
        let full_path = self.datasites_root.join(owner).join(rel_path);

        // rulesets is sorted shallowest-first (root to leaf). Walk in that
        // order so a deeper, more specific ruleset's decision is applied
        // after (and overrides) a shallower ancestor's, then stop at the
        // first terminal ruleset reached from the leaf side.
        let mut terminal_dir: Option<&Path> = None;
        for ruleset in rulesets.iter() {
            if !is_ancestor_or_self(&ruleset.dir, &target_dir) {
                continue;
            }
            if ruleset.terminal && (terminal_dir.is_none() || depth(&ruleset.dir) > depth(terminal_dir.unwrap())) {
                terminal_dir = Some(&ruleset.dir);
            }
        }

        let mut decision: Option<bool> = None;
        for ruleset in rulesets.iter() {
            if !is_ancestor_or_self(&ruleset.dir, &target_dir) {
                continue;
            }
            if let Some(terminal) = terminal_dir {
                // A terminal ruleset shadows any ancestor shallower than it.
                if depth(&ruleset.dir) < depth(terminal) {
                    continue;
                }
            }
            if let Some(found) = evaluate_ruleset(ruleset, &full_path, principal, perm) {
                decision = Some(found);
            }
        }
        decision.unwrap_or(false)
    }
}

fn depth(p: &Path) -> usize {
    p.components().count()
}

fn is_ancestor_or_self(dir: &Path, target_dir: &Path) -> bool {
    target_dir.starts_with(dir)
}

fn evaluate_ruleset(
    ruleset: &Ruleset,
    full_path: &Path,
    principal: &str,
    perm: Permission,
) -> Option<bool> {
    let rel = full_path.strip_prefix(&ruleset.dir).ok()?;
    let rel_str = rel.to_string_lossy().replace('\\', "/");

    let mut decision = None;
    for rule in &ruleset.rules {
        if !matches_pattern(&rule.pattern, &rel_str) {
            continue;
        }
        let principals = match perm {
            Permission::Read => &rule.access.read,
            Permission::Write => &rule.access.write,
            Permission::Admin => &rule.access.admin,
        };
        // admin implies write and read; write implies read.
        let granted = principal_matches_any(principals, principal)
            || (perm != Permission::Admin
                && principal_matches_any(&rule.access.admin, principal))
            || (perm == Permission::Read
                && principal_matches_any(&rule.access.write, principal));
        decision = Some(granted);
    }
    decision
}

fn principal_matches_any(entries: &[String], principal: &str) -> bool {
    entries.iter().any(|e| principal_matches(e, principal))
}

fn principal_matches(pattern: &str, principal: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(domain) = pattern.strip_prefix("*@") {
        return principal
            .rsplit_once('@')
            .is_some_and(|(_, d)| d.eq_ignore_ascii_case(domain));
    }
    pattern.eq_ignore_ascii_case(principal)
}

fn matches_pattern(pattern: &str, rel_path: &str) -> bool {
    if pattern == "**" {
        return true;
    }
    match Glob::new(pattern) {
        Ok(g) => g.compile_matcher().is_match(rel_path),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_temp_dir(name: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("datasite-sync-acl-test-{name}-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn owner_always_has_full_access() {
        let root = make_temp_dir("owner");
        fs::create_dir_all(root.join("alice@example.com")).unwrap();
        let store = AclStore::new(&root);
        store.reload("alice@example.com");
        assert!(store.check("alice@example.com", "alice@example.com", "x.txt", Permission::Admin));
    }

    #[test]
    fn public_rule_grants_read_to_wildcard() {
        let root = make_temp_dir("public");
        let public_dir = root.join("alice@example.com/public");
        fs::create_dir_all(&public_dir).unwrap();
        fs::write(
            public_dir.join(ACL_FILE_NAME),
            "terminal: false\nrules:\n  - pattern: '**'\n    access:\n      admin: []\n      write: []\n      read: ['*']\n",
        )
        .unwrap();

        let store = AclStore::new(&root);
        let errors = store.reload("alice@example.com");
        assert!(errors.is_empty());
        assert!(store.check(
            "alice@example.com",
            "bob@example.com",
            "public/data.csv",
            Permission::Read
        ));
        assert!(!store.check(
            "alice@example.com",
            "bob@example.com",
            "public/data.csv",
            Permission::Write
        ));
    }

    #[test]
    fn last_match_wins_within_a_ruleset() {
        let root = make_temp_dir("lastmatch");
        let dir = root.join("alice@example.com");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(ACL_FILE_NAME),
            "terminal: false\nrules:\n  - pattern: '**'\n    access:\n      read: ['*']\n  - pattern: 'secret/**'\n    access:\n      read: []\n",
        )
        .unwrap();

        let store = AclStore::new(&root);
        store.reload("alice@example.com");
        assert!(store.check("alice@example.com", "bob@example.com", "notes.txt", Permission::Read));
        assert!(!store.check(
            "alice@example.com",
            "bob@example.com",
            "secret/key.txt",
            Permission::Read
        ));
    }

    #[test]
    fn terminal_ruleset_stops_ancestor_walk() {
        let root = make_temp_dir("terminal");
        let owner_dir = root.join("alice@example.com");
        let sub_dir = owner_dir.join("locked");
        fs::create_dir_all(&sub_dir).unwrap();
        fs::write(
            owner_dir.join(ACL_FILE_NAME),
            "terminal: false\nrules:\n  - pattern: '**'\n    access:\n      read: ['*']\n",
        )
        .unwrap();
        fs::write(
            sub_dir.join(ACL_FILE_NAME),
            "terminal: true\nrules:\n  - pattern: '**'\n    access:\n      read: []\n",
        )
        .unwrap();

        let store = AclStore::new(&root);
        let errors = store.reload("alice@example.com");
        assert!(errors.is_empty());
        assert!(!store.check(
            "alice@example.com",
            "bob@example.com",
            "locked/file.txt",
            Permission::Read
        ));
    }

    #[test]
    fn malformed_yaml_is_reported_not_fatal() {
        let root = make_temp_dir("malformed");
        let dir = root.join("alice@example.com");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(ACL_FILE_NAME), "not: [valid yaml for AclFile").unwrap();

        let store = AclStore::new(&root);
        let errors = store.reload("alice@example.com");
        assert_eq!(errors.len(), 1);
        // No crash; absent ruleset simply denies non-owner access.
        assert!(!store.check(
            "alice@example.com",
            "bob@example.com",
            "file.txt",
            Permission::Read
        ));
    }

    #[test]
    fn deeper_non_terminal_ruleset_overrides_shallower_grant() {
        let root = make_temp_dir("depth-override");
        let owner_dir = root.join("alice@example.com");
        let private_dir = owner_dir.join("private");
        fs::create_dir_all(&private_dir).unwrap();
        fs::write(
            owner_dir.join(ACL_FILE_NAME),
            "terminal: false\nrules:\n  - pattern: '**'\n    access:\n      read: ['*']\n",
        )
        .unwrap();
        fs::write(
            private_dir.join(ACL_FILE_NAME),
            "terminal: false\nrules:\n  - pattern: '**'\n    access:\n      read: []\n",
        )
        .unwrap();

        let store = AclStore::new(&root);
        let errors = store.reload("alice@example.com");
        assert!(errors.is_empty());
        // The deeper, more specific ruleset under private/ must win over the
        // shallower root grant, even though neither ruleset is terminal.
        assert!(!store.check(
            "alice@example.com",
            "bob@example.com",
            "private/secret.txt",
            Permission::Read
        ));
        // The root grant still applies outside private/.
        assert!(store.check(
            "alice@example.com",
            "bob@example.com",
            "public.txt",
            Permission::Read
        ));
    }

    #[test]
    fn domain_wildcard_principal_matches() {
        let root = make_temp_dir("domain");
        let dir = root.join("alice@example.com");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(ACL_FILE_NAME),
            "terminal: false\nrules:\n  - pattern: '**'\n    access:\n      read: ['*@example.com']\n",
        )
        .unwrap();

        let store = AclStore::new(&root);
        store.reload("alice@example.com");
        assert!(store.check("alice@example.com", "bob@example.com", "f.txt", Permission::Read));
        assert!(!store.check("alice@example.com", "bob@other.org", "f.txt", Permission::Read));
    }
}
