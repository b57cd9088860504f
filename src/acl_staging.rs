//! Ordered application of ACL updates announced by the relay.
//!
//! A manifest lists the rulesets about to be pushed for one datasite, in
//! root-to-leaf order. Each incoming ruleset is parked until the whole set
//! has arrived; the batch is then handed to the apply callback in manifest
//! order, so no observer ever sees a child grant without the parent
//! narrowing that precedes it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::wsproto::ACLManifest;

#[derive(Debug, Clone)]
pub struct StagedRuleset {
    pub path: String,
    pub content: Vec<u8>,
    pub etag: String,
}

type ApplyFn = Arc<dyn Fn(String, Vec<StagedRuleset>) + Send + Sync>;

pub struct AclStaging {
    sets: Mutex<HashMap<String, StagingSet>>,
    apply: ApplyFn,
}

struct StagingSet {
    /// Directory keys in manifest order.
    order: Vec<String>,
    parked: HashMap<String, StagedRuleset>,
}

impl StagingSet {
    fn announced(&self, path: &str) -> bool {
        self.order.iter().any(|p| p == path)
    }

    fn missing(&self) -> usize {
        self.order
            .iter()
            .filter(|p| !self.parked.contains_key(*p))
            .count()
    }

    fn drain_in_order(mut self) -> Vec<StagedRuleset> {
        self.order
            .iter()
            .filter_map(|p| self.parked.remove(p))
            .collect()
    }
}

impl AclStaging {
    pub fn new<F>(apply: F) -> Self
    where
        F: Fn(String, Vec<StagedRuleset>) + Send + Sync + 'static,
    {
        Self {
            sets: Mutex::new(HashMap::new()),
            apply: Arc::new(apply),
        }
    }

    /// Open (or replace) the staging set for a datasite. A manifest
    /// arriving while an earlier one is still incomplete supersedes it;
    /// the relay re-sends whatever the new ordering needs.
    pub fn announce(&self, manifest: ACLManifest) {
        let datasite = manifest.datasite.clone();
        let order: Vec<String> = manifest.acl_order.into_iter().map(|e| e.path).collect();
        let expected = order.len();

        let mut sets = self.sets.lock().unwrap();
        let replaced = sets.insert(
            datasite.clone(),
            StagingSet {
                order,
                parked: HashMap::new(),
            },
        );
        if let Some(prev) = replaced {
            crate::logging::info(format!(
                "acl staging superseded datasite={datasite} outstanding={}",
                prev.missing()
            ));
        }
        crate::logging::info(format!(
            "acl staging open datasite={datasite} expected={expected}"
        ));
    }

    pub fn is_staging(&self, datasite: &str) -> bool {
        self.sets.lock().unwrap().contains_key(datasite)
    }

    /// Park one incoming ruleset. Returns false when no set is open for
    /// this datasite or the path was never announced; the caller then
    /// applies the file directly instead of holding it.
    pub fn accept(&self, datasite: &str, path: &str, content: Vec<u8>, etag: String) -> bool {
        let complete = {
            let mut sets = self.sets.lock().unwrap();
            let Some(set) = sets.get_mut(datasite) else {
                return false;
            };
            if !set.announced(path) {
                crate::logging::info(format!(
                    "acl staging unannounced path datasite={datasite} path={path}"
                ));
                return false;
            }

            set.parked.insert(
                path.to_string(),
                StagedRuleset {
                    path: path.to_string(),
                    content,
                    etag,
                },
            );

            let missing = set.missing();
            crate::logging::info(format!(
                "acl staging parked datasite={datasite} path={path} missing={missing}"
            ));
            if missing > 0 {
                return true;
            }
            sets.remove(datasite)
        };

        // The lock is released before the apply callback runs: it writes
        // files and reloads the ACL store, neither of which should happen
        // under the staging mutex.
        if let Some(set) = complete {
            crate::logging::info(format!(
                "acl staging complete datasite={datasite} count={}",
                set.order.len()
            ));
            (self.apply)(datasite.to_string(), set.drain_in_order());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wsproto::ACLEntry;
    use std::sync::Mutex as StdMutex;

    fn manifest_for(datasite: &str, dirs: &[&str]) -> ACLManifest {
        ACLManifest {
            version: 1,
            datasite: datasite.to_string(),
            for_user: "observer@example.com".to_string(),
            for_hash: "fh".to_string(),
            generated: "2026-08-01T00:00:00Z".to_string(),
            acl_order: dirs
                .iter()
                .map(|d| ACLEntry {
                    path: d.to_string(),
                    hash: format!("h-{d}"),
                })
                .collect(),
        }
    }

    #[test]
    fn applies_in_manifest_order_even_when_received_out_of_order() {
        let applied: Arc<StdMutex<Vec<(String, Vec<String>)>>> =
            Arc::new(StdMutex::new(Vec::new()));
        let sink = applied.clone();
        let staging = AclStaging::new(move |datasite, sets| {
            sink.lock()
                .unwrap()
                .push((datasite, sets.into_iter().map(|s| s.path).collect()));
        });

        let root = "alice@example.com";
        let child = "alice@example.com/public";
        staging.announce(manifest_for(root, &[root, child]));
        assert!(staging.is_staging(root));

        // Child arrives first; nothing applies until the root lands too.
        assert!(staging.accept(root, child, b"child".to_vec(), "e2".to_string()));
        assert!(applied.lock().unwrap().is_empty());

        assert!(staging.accept(root, root, b"root".to_vec(), "e1".to_string()));
        let got = applied.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, root);
        assert_eq!(got[0].1, vec![root.to_string(), child.to_string()]);
        drop(got);

        // The completed set is gone; later strays apply directly.
        assert!(!staging.is_staging(root));
        assert!(!staging.accept(root, root, b"late".to_vec(), "e3".to_string()));
    }

    #[test]
    fn unannounced_paths_are_refused() {
        let staging = AclStaging::new(|_, _| {});
        staging.announce(manifest_for("alice@example.com", &["alice@example.com"]));
        assert!(!staging.accept(
            "alice@example.com",
            "alice@example.com/sneaky",
            b"x".to_vec(),
            "e".to_string(),
        ));
    }

    #[test]
    fn accept_without_any_announcement_falls_through() {
        let staging = AclStaging::new(|_, _| {});
        assert!(!staging.accept(
            "alice@example.com",
            "alice@example.com",
            b"x".to_vec(),
            "e".to_string(),
        ));
    }

    #[test]
    fn a_new_manifest_supersedes_an_incomplete_one() {
        let applied: Arc<StdMutex<Vec<Vec<String>>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = applied.clone();
        let staging = AclStaging::new(move |_, sets| {
            sink.lock()
                .unwrap()
                .push(sets.into_iter().map(|s| s.path).collect());
        });

        let ds = "alice@example.com";
        staging.announce(manifest_for(ds, &[ds, "alice@example.com/a"]));
        assert!(staging.accept(ds, ds, b"v1".to_vec(), "e1".to_string()));

        // Replacement drops the half-finished set, including the parked root.
        staging.announce(manifest_for(ds, &[ds]));
        assert!(applied.lock().unwrap().is_empty());

        assert!(staging.accept(ds, ds, b"v2".to_vec(), "e2".to_string()));
        assert_eq!(*applied.lock().unwrap(), vec![vec![ds.to_string()]]);
    }
}
