use std::{
    collections::{HashMap, HashSet},
    fs,
    io::Read,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest::StatusCode;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use walkdir::WalkDir;

use crate::acl::{AclStore, Permission};
use crate::config::TuningConfig;
use crate::control::ControlPlane;
use crate::filters::SyncFilters;
use crate::http::{ApiClient, BlobInfo, HttpStatusError, PresignedParams};
use crate::subscriptions::{Action, CachedSubscriptions};
use crate::uploader::upload_blob_smart;

static OWNER_MISMATCH_LOGGED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone)]
pub(crate) struct LocalFile {
    key: String,
    path: std::path::PathBuf,
    etag: String,
    size: i64,
    last_modified: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub etag: String,
    #[serde(default)]
    pub local_etag: String,
    pub size: i64,
    pub last_modified: i64,
    #[serde(default)]
    pub version: String,
    /// Epoch seconds when this key last completed a sync operation.
    #[serde(default)]
    pub completed_at: i64,
    /// Epoch seconds when this path was observed deleted; 0 for live rows.
    /// A non-zero value makes the row a tombstone (`size` is forced to -1).
    /// Tombstones are retained until the remote absence is confirmed and the
    /// grace window has elapsed, so a concurrent re-upload on the other side
    /// is recognized as a resurrection instead of being deleted again.
    #[serde(default)]
    pub deleted_at: i64,
}

impl FileMetadata {
    pub fn is_tombstone(&self) -> bool {
        self.deleted_at > 0
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JournalState {
    files: HashMap<String, FileMetadata>,
}

const SYNC_JOURNAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_journal (
    path TEXT PRIMARY KEY,
    etag TEXT NOT NULL,
    local_etag TEXT NOT NULL DEFAULT '',
    version TEXT NOT NULL,
    size INTEGER NOT NULL,
    last_modified TEXT NOT NULL,
    deleted_at INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_journal_path ON sync_journal(path);
CREATE INDEX IF NOT EXISTS idx_journal_etag ON sync_journal(etag);
CREATE INDEX IF NOT EXISTS idx_journal_last_modified ON sync_journal(last_modified);
"#;

pub(crate) struct SyncJournal {
    db_path: PathBuf,
    state: JournalState,
    dirty: HashSet<String>,
    deleted: HashSet<String>,
}

impl SyncJournal {
    pub(crate) fn load(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join(".data").join("sync.db");
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = rusqlite::Connection::open(&db_path)
            .with_context(|| format!("open journal {}", db_path.display()))?;
        conn.execute_batch(SYNC_JOURNAL_SCHEMA)
            .context("init sync journal schema")?;
        ensure_local_etag_column(&conn).context("migrate sync journal")?;

        let mut state = JournalState::default();
        let mut stmt = conn.prepare(
            "SELECT path, size, etag, local_etag, version, last_modified, deleted_at FROM sync_journal",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let path: String = row.get(0)?;
            let size: i64 = row.get(1)?;
            let etag: String = row.get(2)?;
            let local_etag: String = row.get(3)?;
            let version: String = row.get(4)?;
            let last_modified: String = row.get(5)?;
            let deleted_at: i64 = row.get(6)?;

            let lm_epoch = parse_rfc3339_epoch(&last_modified).unwrap_or(0);
            state.files.insert(
                path,
                FileMetadata {
                    etag,
                    local_etag,
                    size,
                    last_modified: lm_epoch,
                    version,
                    completed_at: 0,
                    deleted_at,
                },
            );
        }

        Ok(SyncJournal {
            db_path,
            state,
            dirty: HashSet::new(),
            deleted: HashSet::new(),
        })
    }

    fn refresh_from_disk(&mut self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = rusqlite::Connection::open(&self.db_path)
            .with_context(|| format!("open journal {}", self.db_path.display()))?;
        conn.execute_batch(SYNC_JOURNAL_SCHEMA)
            .context("init sync journal schema")?;
        ensure_local_etag_column(&conn).context("migrate sync journal")?;

        let mut next = HashMap::new();
        let mut stmt = conn.prepare(
            "SELECT path, size, etag, local_etag, version, last_modified, deleted_at FROM sync_journal",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let path: String = row.get(0)?;
            let size: i64 = row.get(1)?;
            let etag: String = row.get(2)?;
            let local_etag: String = row.get(3)?;
            let version: String = row.get(4)?;
            let last_modified: String = row.get(5)?;
            let deleted_at: i64 = row.get(6)?;

            let lm_epoch = parse_rfc3339_epoch(&last_modified).unwrap_or(0);
            let completed_at = self
                .state
                .files
                .get(&path)
                .map(|m| m.completed_at)
                .unwrap_or(0);
            next.insert(
                path,
                FileMetadata {
                    etag,
                    local_etag,
                    size,
                    last_modified: lm_epoch,
                    version,
                    completed_at,
                    deleted_at,
                },
            );
        }

        self.state.files = next;
        self.dirty.clear();
        self.deleted.clear();
        Ok(())
    }

    fn save(&mut self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut conn = rusqlite::Connection::open(&self.db_path)
            .with_context(|| format!("open journal {}", self.db_path.display()))?;
        conn.execute_batch(SYNC_JOURNAL_SCHEMA)
            .context("init sync journal schema")?;
        ensure_local_etag_column(&conn).context("migrate sync journal")?;

        let tx = conn.transaction().context("begin sync journal tx")?;
        {
            let mut delete_stmt = tx.prepare("DELETE FROM sync_journal WHERE path = ?1")?;
            for key in &self.deleted {
                delete_stmt.execute(params![key])?;
            }
        }

        {
            let mut upsert_stmt = tx.prepare(
                "INSERT OR REPLACE INTO sync_journal (path, size, etag, local_etag, version, last_modified, deleted_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for key in &self.dirty {
                if let Some(meta) = self.state.files.get(key) {
                    let last_modified = epoch_to_rfc3339(meta.last_modified);
                    upsert_stmt.execute(params![
                        key,
                        meta.size,
                        meta.etag,
                        meta.local_etag,
                        meta.version,
                        last_modified,
                        meta.deleted_at
                    ])?;
                }
            }
        }

        tx.commit().context("commit sync journal tx")?;
        self.dirty.clear();
        self.deleted.clear();
        Ok(())
    }

    fn get(&self, key: &str) -> Option<&FileMetadata> {
        self.state.files.get(key)
    }

    fn set(&mut self, key: String, meta: FileMetadata) {
        if std::env::var("SYFTBOX_DEBUG_JOURNAL").is_ok() && key.contains("jg-file-") {
            crate::logging::info(format!(
                "debug journal set key={} etag={} size={}",
                key, meta.etag, meta.size
            ));
        }
        self.state.files.insert(key.clone(), meta);
        self.deleted.remove(&key);
        self.dirty.insert(key);
    }

    fn delete(&mut self, key: &str) {
        self.state.files.remove(key);
        self.dirty.remove(key);
        self.deleted.insert(key.to_string());
    }

    /// Turn a live row into a tombstone for a deletion observed locally.
    /// The etag is kept as the claim still pending against the relay, so a
    /// listing that keeps showing those exact bytes re-issues the delete.
    fn tombstone(&mut self, key: &str, deleted_at: i64) {
        if let Some(meta) = self.state.files.get_mut(key) {
            if meta.deleted_at == 0 {
                meta.deleted_at = deleted_at;
                meta.size = -1;
                self.dirty.insert(key.to_string());
            }
        }
    }

    /// Turn a live row into a tombstone for a deletion that originated on
    /// the remote side. Nothing is pending against the relay, so the etag
    /// is cleared: any content reappearing under this path during the grace
    /// window reads as a resurrection, never as a delete to re-issue.
    fn tombstone_remote(&mut self, key: &str, deleted_at: i64) {
        if let Some(meta) = self.state.files.get_mut(key) {
            if meta.deleted_at == 0 {
                meta.deleted_at = deleted_at;
                meta.size = -1;
                meta.etag.clear();
                meta.local_etag.clear();
                self.dirty.insert(key.to_string());
            }
        }
    }

    fn count(&self) -> usize {
        self.state.files.len()
    }

    fn rebuild_if_empty(
        &mut self,
        local: &HashMap<String, LocalFile>,
        remote: &HashMap<String, BlobInfo>,
    ) {
        if self.count() > 0 {
            return;
        }
        for (key, l) in local {
            if let Some(r) = remote.get(key) {
                if l.etag == r.etag {
                    self.set(
                        key.clone(),
                        FileMetadata {
                            etag: l.etag.clone(),
                            local_etag: l.etag.clone(),
                            size: l.size,
                            last_modified: l.last_modified,
                            version: String::new(),
                            completed_at: 0,
                            deleted_at: 0,
                        },
                    );
                }
            }
        }
    }
}

pub(crate) fn journal_upsert_direct(
    data_dir: &Path,
    key: &str,
    etag: &str,
    local_etag: &str,
    size: i64,
    last_modified_epoch: i64,
) -> Result<()> {
    if std::env::var("SYFTBOX_DEBUG_JOURNAL").is_ok() && key.contains("jg-file-") {
        crate::logging::info(format!(
            "debug journal upsert key={key} etag={} size={size}",
            etag
        ));
    }
    let db_path = data_dir.join(".data").join("sync.db");
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let conn = rusqlite::Connection::open(&db_path)
        .with_context(|| format!("open journal {}", db_path.display()))?;
    conn.execute_batch(SYNC_JOURNAL_SCHEMA)
        .context("init sync journal schema")?;
    ensure_local_etag_column(&conn).context("migrate sync journal")?;

    let last_modified = epoch_to_rfc3339(last_modified_epoch);
    conn.execute(
        "INSERT OR REPLACE INTO sync_journal (path, size, etag, local_etag, version, last_modified, deleted_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
        params![key, size, etag, local_etag, "", last_modified],
    )
    .context("upsert sync journal row")?;

    Ok(())
}

/// Remove a journal row outside a reconciliation pass (priority-channel
/// deletes). The in-memory journal picks the change up on its next
/// `refresh_from_disk`.
pub(crate) fn journal_delete_direct(data_dir: &Path, key: &str) -> Result<()> {
    let db_path = data_dir.join(".data").join("sync.db");
    if !db_path.exists() {
        return Ok(());
    }
    let conn = rusqlite::Connection::open(&db_path)
        .with_context(|| format!("open journal {}", db_path.display()))?;
    conn.execute_batch(SYNC_JOURNAL_SCHEMA)
        .context("init sync journal schema")?;
    conn.execute("DELETE FROM sync_journal WHERE path = ?1", params![key])
        .context("delete sync journal row")?;
    Ok(())
}

fn epoch_to_rfc3339(epoch_seconds: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(epoch_seconds, 0)
        .unwrap_or_else(chrono::Utc::now)
        .to_rfc3339()
}

fn parse_rfc3339_epoch(raw: &str) -> Option<i64> {
    let parsed = chrono::DateTime::parse_from_rfc3339(raw).ok()?;
    Some(parsed.with_timezone(&chrono::Utc).timestamp())
}

fn ensure_local_etag_column(conn: &rusqlite::Connection) -> Result<()> {
    ensure_column(conn, "local_etag", "TEXT NOT NULL DEFAULT ''")?;
    ensure_column(conn, "deleted_at", "INTEGER NOT NULL DEFAULT 0")
}

fn ensure_column(conn: &rusqlite::Connection, name: &str, decl: &str) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(sync_journal)")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let col: String = row.get(1)?;
        if col == name {
            return Ok(());
        }
    }
    conn.execute(
        &format!("ALTER TABLE sync_journal ADD COLUMN {name} {decl}"),
        [],
    )?;
    Ok(())
}

/// Per-path reconciliation decision. `classify` is a pure function of the
/// observed `(local, journal, remote)` triple so every row of the decision
/// table stays unit-testable without touching disk or network; transfer
/// dispatch happens separately in `sync_once_with_control`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncAction {
    Noop,
    /// Local bytes already match remote; synthesize or advance the journal
    /// row without any transfer.
    HealJournal,
    Upload,
    Download,
    /// Propagate a locally observed deletion to the relay.
    DeleteRemote,
    /// Propagate a remote deletion to the local tree.
    DeleteLocal,
    Conflict,
    /// Record a remote-side deletion as a tombstone; nothing transfers yet.
    TombstoneLocal,
    /// The row has no remaining purpose; drop it.
    ForgetJournal,
}

pub(crate) struct PathFacts<'a> {
    pub is_owner: bool,
    pub local: Option<&'a LocalFile>,
    pub journal: Option<&'a FileMetadata>,
    pub remote: Option<&'a BlobInfo>,
    /// Wall-clock epoch seconds, used only for tombstone grace evaluation.
    pub now: i64,
    pub tombstone_grace_secs: i64,
}

pub(crate) fn classify(f: &PathFacts<'_>) -> SyncAction {
    if let Some(j) = f.journal {
        if j.is_tombstone() {
            return classify_tombstone(f, j);
        }
    }

    match (f.local, f.journal, f.remote) {
        (None, None, None) => SyncAction::Noop,
        (Some(_), None, None) => SyncAction::Upload,
        (None, None, Some(_)) => SyncAction::Download,
        // Both sides exist with no common ancestor: identical content heals
        // the journal, anything else is a divergence without history.
        (Some(l), None, Some(r)) => {
            if !content_differs_for_key(
                f.is_owner,
                &l.etag,
                l.size,
                &r.etag,
                r.size,
                l.last_modified,
                r.last_modified.timestamp(),
            ) {
                SyncAction::HealJournal
            } else {
                SyncAction::Conflict
            }
        }
        (Some(l), Some(j), Some(r)) => {
            let local_mod = has_modified_local(f.is_owner, l, Some(j));
            let remote_mod = has_modified_remote(f.is_owner, Some(j), r);
            match (local_mod, remote_mod) {
                (false, false) => SyncAction::Noop,
                (true, false) => SyncAction::Upload,
                (false, true) => SyncAction::Download,
                (true, true) => {
                    // Both diverged but converged to the same bytes: only the
                    // journal is behind.
                    if !l.etag.is_empty() && normalize_etag(&l.etag) == normalize_etag(&r.etag) {
                        SyncAction::HealJournal
                    } else {
                        SyncAction::Conflict
                    }
                }
            }
        }
        (Some(l), Some(j), None) => {
            // Remote deletion. A local edit made after the common ancestor
            // wins over the delete and re-publishes the file.
            if has_modified_local(f.is_owner, l, Some(j)) {
                SyncAction::Upload
            } else {
                SyncAction::DeleteLocal
            }
        }
        // Live journal with the local file missing and no observed deletion
        // event: indistinguishable from data loss, so restore from the relay.
        (None, Some(_), Some(_)) => SyncAction::Download,
        // Both copies gone with the row still live: the remote deletion is
        // recorded as a tombstone first, and only dropped once the grace
        // window has passed without the path coming back.
        (None, Some(_), None) => SyncAction::TombstoneLocal,
    }
}

fn classify_tombstone(f: &PathFacts<'_>, t: &FileMetadata) -> SyncAction {
    match (f.local, f.remote) {
        // Recreated locally while the tombstone was pending: the new file
        // has no usable history, same as the journal-less rows above.
        (Some(_), None) => SyncAction::Upload,
        (Some(l), Some(r)) => {
            if !content_differs_for_key(
                f.is_owner,
                &l.etag,
                l.size,
                &r.etag,
                r.size,
                l.last_modified,
                r.last_modified.timestamp(),
            ) {
                SyncAction::HealJournal
            } else {
                SyncAction::Conflict
            }
        }
        (None, Some(r)) => {
            // A tombstone from an observed local deletion keeps its etag as
            // the claim still pending against the relay: matching remote
            // bytes mean our delete has not landed, so re-issue it. Anything
            // else (different bytes, or a tombstone that never had a pending
            // delete because the removal started remotely) is a
            // resurrection, and the resurrection wins.
            if !t.etag.is_empty() && normalize_etag(&r.etag) == normalize_etag(&t.etag) {
                SyncAction::DeleteRemote
            } else {
                SyncAction::Download
            }
        }
        (None, None) => {
            if f.now - t.deleted_at >= f.tombstone_grace_secs {
                SyncAction::ForgetJournal
            } else {
                SyncAction::Noop
            }
        }
    }
}

fn is_acl_key(key: &str) -> bool {
    key == crate::acl::ACL_FILE_NAME
        || key.ends_with(&format!("/{}", crate::acl::ACL_FILE_NAME))
}

#[allow(clippy::too_many_arguments)]
pub async fn sync_once_with_control(
    api: &ApiClient,
    data_dir: &Path,
    owner_email: &str,
    control: Option<ControlPlane>,
    filters: &SyncFilters,
    local_scanner: &mut LocalScanner,
    journal: &mut SyncJournal,
    acl: Option<&AclStore>,
    subscriptions: Option<&CachedSubscriptions>,
    tuning: &TuningConfig,
) -> Result<()> {
    journal
        .refresh_from_disk()
        .context("refresh sync journal")?;

    let token_subject = api
        .current_access_token()
        .await
        .and_then(|t| crate::auth::token_subject(&t));
    let owner_mismatch = token_subject
        .as_deref()
        .is_some_and(|sub| sub != owner_email);
    if owner_mismatch && !OWNER_MISMATCH_LOGGED.swap(true, Ordering::SeqCst) {
        crate::logging::error(format!(
            "sync identity mismatch: config email={} token subject={}",
            owner_email,
            token_subject.as_deref().unwrap_or("")
        ));
    }

    let datasites_root = data_dir.join("datasites");
    let (local, disappeared) = local_scanner.scan(&datasites_root, filters, tuning)?;
    let remote = scan_remote(api, filters).await?;

    if let Some(store) = acl {
        let mut owners: HashSet<&str> = HashSet::new();
        for key in local.keys().chain(remote.keys()) {
            if let Some((owner, _rel)) = split_sync_key(key) {
                owners.insert(owner);
            }
        }
        for owner in owners {
            for err in store.reload(owner) {
                crate::logging::error(format!("{err}"));
            }
        }
    }

    journal.rebuild_if_empty(&local, &remote);

    let now = chrono::Utc::now().timestamp();
    let tombstone_grace_secs = ((tuning.tombstone_grace_ms + 999) / 1000) as i64;

    // A file present in the previous scan and gone in this one is an
    // observed local deletion; a missing file with no such observation is
    // indistinguishable from data loss and gets restored instead.
    for key in &disappeared {
        if !local.contains_key(key) {
            journal.tombstone(key, now);
        }
    }

    let mut all_keys: HashSet<String> = HashSet::new();
    all_keys.extend(local.keys().cloned());
    all_keys.extend(remote.keys().cloned());
    all_keys.extend(journal.state.files.keys().cloned());

    // ACL files reconcile before anything else so permission changes take
    // effect ahead of the transfers they gate; deletes run after uploads
    // further down.
    let mut ordered: Vec<String> = all_keys.into_iter().collect();
    ordered.sort_by(|a, b| {
        is_acl_key(b)
            .cmp(&is_acl_key(a))
            .then_with(|| a.cmp(b))
    });

    let mut upload_keys = Vec::new();
    let mut download_keys_list = Vec::new();
    let mut remote_deletes = Vec::new();
    let mut local_deletes = Vec::new();
    let mut blocked_deletes = Vec::new();
    let mut conflicts = Vec::new();
    let mut heals = Vec::new();

    for key in ordered {
        if !is_synced_key(&key) {
            continue;
        }
        if filters.ignore.should_ignore_rel(Path::new(&key), false) {
            continue;
        }
        if SyncFilters::is_marked_rel_path(&key) {
            continue;
        }
        let local_meta = local.get(&key);
        let remote_meta = remote.get(&key);
        let journal_meta = journal.get(&key);
        let is_owner = is_owner_sync_key(owner_email, &key);

        // Subscription gate for mirrored paths. Block removes any copy we
        // previously synced; pause freezes the local copy by suppressing
        // remote-originated actions while still allowing local edits out.
        let mut paused = false;
        if !is_owner {
            if let Some(subs) = subscriptions {
                match subs.action_for(owner_email, &key) {
                    Action::Allow => {}
                    Action::Pause => paused = true,
                    _ => {
                        if local_meta.is_some() {
                            blocked_deletes.push(key.clone());
                        } else if journal_meta.is_some() {
                            journal.delete(&key);
                        }
                        continue;
                    }
                }
            }
        }

        // Recent-complete grace window to avoid spurious conflicts on rapid overwrites.
        if let Some(jm) = journal_meta {
            if !jm.is_tombstone() && jm.completed_at > 0 && now - jm.completed_at < 5 {
                let remote_changed =
                    remote_meta.is_some_and(|r| has_modified_remote(is_owner, Some(jm), r));
                if !remote_changed {
                    continue;
                }
            }
        }

        let action = classify(&PathFacts {
            is_owner,
            local: local_meta,
            journal: journal_meta,
            remote: remote_meta,
            now,
            tombstone_grace_secs,
        });

        match action {
            SyncAction::Noop => {}
            SyncAction::ForgetJournal => journal.delete(&key),
            SyncAction::HealJournal => {
                if tuning.heal_journal_gaps {
                    heals.push(key);
                }
            }
            SyncAction::Upload => {
                if is_owner || acl_permits(acl, owner_email, &key, Permission::Write) {
                    upload_keys.push(key);
                } else {
                    crate::logging::error(format!("acl denied write, skipping upload: {key}"));
                }
            }
            SyncAction::Download => {
                if paused {
                    continue;
                }
                if is_owner || acl_permits(acl, owner_email, &key, Permission::Read) {
                    download_keys_list.push(key);
                } else {
                    crate::logging::error(format!("acl denied read, skipping download: {key}"));
                }
            }
            SyncAction::DeleteRemote => {
                journal.tombstone(&key, now);
                remote_deletes.push(key);
            }
            SyncAction::DeleteLocal => {
                if paused {
                    continue;
                }
                local_deletes.push(key);
            }
            SyncAction::TombstoneLocal => journal.tombstone_remote(&key, now),
            SyncAction::Conflict => conflicts.push(key),
        }
    }

    // Journal heals need no transfer at all.
    for key in heals {
        if let (Some(l), Some(r)) = (local.get(&key), remote.get(&key)) {
            journal.set(
                key.clone(),
                FileMetadata {
                    etag: r.etag.clone(),
                    local_etag: l.etag.clone(),
                    size: r.size,
                    last_modified: r.last_modified.timestamp(),
                    version: String::new(),
                    completed_at: now,
                    deleted_at: 0,
                },
            );
        }
    }

    // Conflicts: preserve the local bytes as a sibling, then pull the remote
    // winner; the download path records the remote etag as the new baseline.
    for key in conflicts {
        if let Some(l) = local.get(&key) {
            let abs = datasites_root.join(&l.key);
            let _ = mark_conflict(&abs);
            if let Some(cp) = control.as_ref() {
                cp.set_sync_conflicted(&l.key);
            }
        }
        journal.delete(&key);
        download_keys_list.push(key);
    }

    // Remote writes (uploads)
    for key in upload_keys {
        if let Some(l) = local.get(&key) {
            // The journal's last-synced etag becomes the If-Match
            // precondition for simple PUTs; a 412 means the remote moved
            // under us and the next pass re-reconciles instead of retrying.
            let precondition = journal
                .get(&key)
                .filter(|j| !j.is_tombstone())
                .map(|j| j.etag.clone());

            if rejected_marker_exists(&l.path) {
                // Once a rejected marker exists for this base path, stop
                // retrying uploads until it is resolved; drop the journal so
                // the remote winner can be pulled if present.
                if let Some(cp) = control.as_ref() {
                    cp.set_sync_rejected(&l.key);
                }
                journal.delete(&key);
                continue;
            }

            if let Err(err) = upload_blob_smart(
                api,
                control.as_ref(),
                data_dir,
                &l.key,
                &l.path,
                precondition.as_deref(),
                tuning,
            )
            .await
            {
                // A user-initiated cancel is final and silent.
                if matches!(
                    crate::errors::classify(&err),
                    Some(crate::errors::SyncErrorKind::Cancelled)
                ) {
                    continue;
                }
                let forbidden = err
                    .downcast_ref::<HttpStatusError>()
                    .is_some_and(|e| e.status == StatusCode::FORBIDDEN);
                if forbidden {
                    let _ = mark_rejected(&l.path);
                    if let Some(cp) = control.as_ref() {
                        cp.set_sync_rejected(&l.key);
                    }
                    journal.delete(&key);
                }

                crate::logging::error(format!("sync upload error for {}: {err:?}", l.key));
                if let Some(cp) = control.as_ref() {
                    cp.set_sync_error(&l.key, &err.to_string());
                }
                continue;
            }
            journal.set(
                l.key.clone(),
                FileMetadata {
                    etag: l.etag.clone(),
                    local_etag: l.etag.clone(),
                    size: l.size,
                    last_modified: l.last_modified,
                    version: String::new(),
                    completed_at: chrono::Utc::now().timestamp(),
                    deleted_at: 0,
                },
            );
        }
    }

    // Local writes (downloads). Journal rows are persisted before any staged
    // file is renamed into place, so an observer never sees bytes the
    // journal does not yet account for.
    if !download_keys_list.is_empty() {
        download_keys_list.sort();
        download_keys_list.dedup();

        if let Some(cp) = control.as_ref() {
            for key in &download_keys_list {
                cp.set_sync_syncing(key, 0.0);
            }
        }

        let staged = stage_downloads(api, &datasites_root, &download_keys_list).await?;

        for item in &staged {
            if let Some(r) = remote.get(&item.key) {
                let size = fs::metadata(&item.tmp).map(|m| m.len() as i64).unwrap_or(r.size);
                let local_etag = match compute_local_etag(&item.tmp, size, tuning) {
                    Ok(etag) => etag,
                    Err(err) => {
                        crate::logging::error(format!(
                            "sync download hash error for {}: {err:?}",
                            item.key
                        ));
                        String::new()
                    }
                };
                journal.set(
                    item.key.clone(),
                    FileMetadata {
                        etag: r.etag.clone(),
                        local_etag,
                        size: r.size,
                        last_modified: r.last_modified.timestamp(),
                        version: String::new(),
                        completed_at: chrono::Utc::now().timestamp(),
                        deleted_at: 0,
                    },
                );
            }
        }
        journal.save()?;

        commit_staged_downloads(staged).await?;
        if let Some(cp) = control.as_ref() {
            for key in &download_keys_list {
                cp.set_sync_completed(key);
            }
        }
    }

    // Remote deletes. The tombstones stay in the journal; a later pass
    // confirms the remote absence and forgets them once the grace window
    // has elapsed.
    if !remote_deletes.is_empty() {
        if let Err(err) = api.delete_blobs(&remote_deletes).await {
            crate::logging::error(format!("sync remote delete error: {err:?}"));
        }
    }

    // Local deletes (remote deletions propagating inward).
    for key in local_deletes {
        let abs = datasites_root.join(&key);
        if abs.exists() {
            let meta = fs::metadata(&abs)?;
            if meta.is_dir() {
                let _ = fs::remove_dir_all(&abs);
            } else {
                let _ = fs::remove_file(&abs);
            }
        }
        journal.tombstone_remote(&key, now);
    }

    // Subscription-blocked copies are removed outright; re-allowing the
    // path later re-downloads it as a new remote file.
    for key in blocked_deletes {
        let abs = datasites_root.join(&key);
        if abs.exists() {
            let meta = fs::metadata(&abs)?;
            if meta.is_dir() {
                let _ = fs::remove_dir_all(&abs);
            } else {
                let _ = fs::remove_file(&abs);
            }
        }
        journal.delete(&key);
    }

    journal.save()?;

    Ok(())
}

fn is_owner_sync_key(owner_email: &str, key: &str) -> bool {
    key.strip_prefix(owner_email)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Splits a sync key `<owner>/<relpath>` into its owner and relative-path parts.
fn split_sync_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('/')
}

fn acl_permits(acl: Option<&AclStore>, principal: &str, key: &str, perm: Permission) -> bool {
    let Some(store) = acl else {
        // No ACL store wired up (e.g. tests, or a mirror with nothing staged yet):
        // fail open so existing non-owner sync behavior is unaffected.
        return true;
    };
    let Some((remote_owner, rel)) = split_sync_key(key) else {
        return true;
    };
    store.check(remote_owner, principal, rel, perm)
}

fn content_differs_for_key(
    is_owner: bool,
    etag_a: &str,
    size_a: i64,
    etag_b: &str,
    size_b: i64,
    lm_a: i64,
    lm_b: i64,
) -> bool {
    if size_a != size_b {
        return true;
    }

    let a = normalize_etag(etag_a);
    let b = normalize_etag(etag_b);
    if !a.is_empty() && !b.is_empty() {
        if a == b {
            return false;
        }
        if !is_owner && is_mixed_multipart_etag_pair(&a, &b) {
            // For mirrored paths, tolerate mixed multipart-vs-plain ETags when sizes match to
            // avoid reupload/download loops.
            return false;
        }
        return true;
    }

    // Fallback: if ETags aren't usable, compare last-modified timestamps.
    lm_a != lm_b
}

fn normalize_etag(raw: &str) -> String {
    raw.trim().trim_matches('"').to_ascii_lowercase()
}

fn is_mixed_multipart_etag_pair(a: &str, b: &str) -> bool {
    (is_plain_md5_etag(a) && is_multipart_etag(b)) || (is_multipart_etag(a) && is_plain_md5_etag(b))
}

fn is_plain_md5_etag(etag: &str) -> bool {
    etag.len() == 32 && etag.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_multipart_etag(etag: &str) -> bool {
    let Some((left, right)) = etag.split_once('-') else {
        return false;
    };
    is_plain_md5_etag(left) && !right.is_empty() && right.chars().all(|c| c.is_ascii_digit())
}

struct CompareMeta<'a> {
    etag: &'a str,
    local_etag: &'a str,
    size: i64,
    last_modified: i64,
}

fn has_modified_local(is_owner: bool, local: &LocalFile, journal: Option<&FileMetadata>) -> bool {
    has_modified(
        journal.map(|j| CompareMeta {
            etag: j.etag.as_str(),
            local_etag: j.local_etag.as_str(),
            size: j.size,
            last_modified: j.last_modified,
        }),
        Some(CompareMeta {
            etag: local.etag.as_str(),
            local_etag: local.etag.as_str(),
            size: local.size,
            last_modified: local.last_modified,
        }),
        is_owner,
    )
}

fn has_modified_remote(is_owner: bool, journal: Option<&FileMetadata>, remote: &BlobInfo) -> bool {
    has_modified(
        journal.map(|j| CompareMeta {
            etag: j.etag.as_str(),
            local_etag: j.local_etag.as_str(),
            size: j.size,
            last_modified: j.last_modified,
        }),
        Some(CompareMeta {
            etag: remote.etag.as_str(),
            local_etag: "",
            size: remote.size,
            last_modified: remote.last_modified.timestamp(),
        }),
        is_owner,
    )
}

fn has_modified(a: Option<CompareMeta<'_>>, b: Option<CompareMeta<'_>>, is_owner: bool) -> bool {
    match (a, b) {
        (None, None) => false,
        (None, Some(_)) | (Some(_), None) => true,
        (Some(a), Some(b)) => {
            if !a.local_etag.is_empty() && !b.local_etag.is_empty() {
                return normalize_etag(a.local_etag) != normalize_etag(b.local_etag);
            }

            if !a.etag.is_empty() && !b.etag.is_empty() {
                let ea = normalize_etag(a.etag);
                let eb = normalize_etag(b.etag);
                if ea == eb {
                    return false;
                }
                if !is_owner && is_mixed_multipart_etag_pair(&ea, &eb) && a.size == b.size {
                    // Mirror Go: tolerate mixed multipart-vs-plain ETags for non-owner paths.
                    return false;
                }
                return true;
            }

            if a.size != b.size {
                return true;
            }

            a.last_modified != b.last_modified
        }
    }
}

struct StagedDownload {
    key: String,
    tmp: PathBuf,
    target: PathBuf,
}

async fn stage_downloads(
    api: &ApiClient,
    datasites_root: &Path,
    keys: &[String],
) -> Result<Vec<StagedDownload>> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    let presigned = api
        .get_blob_presigned(&PresignedParams {
            keys: keys.to_vec(),
        })
        .await?;

    let mut out = Vec::with_capacity(presigned.urls.len());
    for blob in presigned.urls {
        let target = datasites_root.join(&blob.key);
        ensure_parent_dirs(&target)?;
        let tmp = download_to_tmp(api, &blob.url, &target).await?;
        out.push(StagedDownload {
            key: blob.key,
            tmp,
            target,
        });
    }
    Ok(out)
}

async fn commit_staged_downloads(staged: Vec<StagedDownload>) -> Result<()> {
    for item in staged {
        if item.target.exists() {
            let meta = fs::metadata(&item.target)?;
            if meta.is_dir() {
                fs::remove_dir_all(&item.target)?;
            } else {
                let _ = fs::remove_file(&item.target);
            }
        }
        tokio::fs::rename(&item.tmp, &item.target)
            .await
            .with_context(|| {
                format!("rename {} -> {}", item.tmp.display(), item.target.display())
            })?;
    }
    Ok(())
}

const DOWNLOAD_RANGE_RETRIES: usize = 3;

/// Stream a blob into a hidden sibling temp file. An interrupted transfer is
/// resumed with a ranged request picking up at the bytes already staged; if
/// the remote vanishes mid-download (or retries run out) the staging file is
/// garbage-collected before the error propagates.
async fn download_to_tmp(api: &ApiClient, url: &str, target: &Path) -> Result<PathBuf> {
    let Some(parent) = target.parent() else {
        anyhow::bail!("target has no parent: {}", target.display());
    };
    let fname = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download");
    let tmp = parent.join(format!(".{}.tmp-{}", fname, uuid::Uuid::new_v4()));

    if tmp.exists() {
        let _ = fs::remove_file(&tmp);
    }

    let mut written: u64 = 0;
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 0..=DOWNLOAD_RANGE_RETRIES {
        let mut req = api.http().get(url);
        if written > 0 {
            req = req.header(reqwest::header::RANGE, format!("bytes={written}-"));
        }
        let resp = match req.send().await {
            Ok(r) => r,
            Err(err) => {
                last_err = Some(err.into());
                continue;
            }
        };
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let _ = fs::remove_file(&tmp);
            anyhow::bail!("download failed: {status} {text}");
        }
        // A server ignoring the Range header restarts the body from zero.
        if written > 0 && status != StatusCode::PARTIAL_CONTENT {
            written = 0;
        }

        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        f.set_len(written).await?;
        f.seek(std::io::SeekFrom::Start(written)).await?;

        let mut stream = resp.bytes_stream();
        let mut interrupted = None;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    api.stats().on_recv(bytes.len() as i64);
                    f.write_all(&bytes).await?;
                    written += bytes.len() as u64;
                }
                Err(err) => {
                    interrupted = Some(err);
                    break;
                }
            }
        }
        f.flush().await?;
        drop(f);

        match interrupted {
            None => return Ok(tmp),
            Some(err) => {
                crate::logging::error(format!(
                    "download interrupted at {written} bytes (attempt {}): {err}",
                    attempt + 1
                ));
                last_err = Some(err.into());
            }
        }
    }

    let _ = fs::remove_file(&tmp);
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("download failed")))
}

/// Ensure parent directories exist for `target`. If a parent path exists as a file,
/// remove it so that remote directory structure can be created.
pub(crate) fn ensure_parent_dirs(target: &std::path::Path) -> Result<()> {
    let Some(parent) = target.parent() else {
        return Ok(());
    };

    match fs::create_dir_all(parent) {
        Ok(_) => Ok(()),
        Err(_err) => {
            // Find the nearest existing ancestor that is not a directory and remove it.
            let mut cur = parent.to_path_buf();
            loop {
                if cur.exists() {
                    let meta = fs::metadata(&cur)?;
                    if !meta.is_dir() {
                        fs::remove_file(&cur)?;
                    }
                    break;
                }
                if let Some(up) = cur.parent() {
                    cur = up.to_path_buf();
                } else {
                    break;
                }
            }
            fs::create_dir_all(parent)?;
            Ok(())
        }
    }
}

/// Write `bytes` to `target`, removing any conflicting directory first.
pub(crate) fn write_file_resolving_conflicts(target: &std::path::Path, bytes: &[u8]) -> Result<()> {
    match fs::write(target, bytes) {
        Ok(_) => Ok(()),
        Err(err) => {
            if target.exists() {
                let meta = fs::metadata(target)?;
                if meta.is_dir() {
                    fs::remove_dir_all(target)?;
                    fs::write(target, bytes)?;
                    return Ok(());
                }
            }
            Err(err).with_context(|| format!("write {}", target.display()))
        }
    }
}

fn is_marked_key(key: &str) -> bool {
    // Equivalent to Go IsMarkedPath checks on filenames.
    key.contains(".conflict")
        || key.contains(".rejected")
        || key.contains("syftrejected")
        || key.contains("syftconflict")
}

fn is_synced_key(key: &str) -> bool {
    // Full datasites sync: keep everything that is under a datasite root directory.
    //
    // In the on-disk datasites layout, the first path segment is the email identity
    // (e.g. `client1@sandbox.local/...`). Restricting to that shape avoids syncing
    // any non-datasites server-side objects that may share the same bucket.
    let key = key.trim_start_matches('/');
    let Some((root, _rest)) = key.split_once('/') else {
        return false;
    };
    root.contains('@')
}

fn should_ignore_key(filters: &SyncFilters, key: &str) -> bool {
    filters.ignore.should_ignore_rel(Path::new(key), false) || SyncFilters::is_marked_rel_path(key)
}

#[derive(Clone, Debug)]
struct LocalScanCacheEntry {
    size: i64,
    mtime_nanos: u128,
    etag: String,
}

#[derive(Default)]
pub(crate) struct LocalScanner {
    last_state: HashMap<String, LocalScanCacheEntry>,
}

impl LocalScanner {
    /// Walk the datasite tree. Returns the current file set plus the keys
    /// that were present in the previous scan and are gone now; those are
    /// the deletions this process actually observed, as opposed to files
    /// that were already missing when it started.
    fn scan(
        &mut self,
        datasites_root: &Path,
        filters: &SyncFilters,
        tuning: &TuningConfig,
    ) -> Result<(HashMap<String, LocalFile>, HashSet<String>)> {
        let mut out = HashMap::new();
        let mut next_state: HashMap<String, LocalScanCacheEntry> = HashMap::new();

        if !datasites_root.exists() {
            let disappeared: HashSet<String> = self.last_state.keys().cloned().collect();
            self.last_state.clear();
            return Ok((out, disappeared));
        }

        for entry in WalkDir::new(datasites_root)
            .into_iter()
            .filter_entry(|e| e.file_name() != ".data")
            .filter_map(|e| e.ok())
        {
            let ftype = entry.file_type();
            if ftype.is_dir() || ftype.is_symlink() {
                continue;
            }
            let path = entry.path();
            let rel = path
                .strip_prefix(datasites_root)
                .with_context(|| format!("strip prefix {}", path.display()))?;
            if filters.ignore.should_ignore_rel(rel, false) {
                continue;
            }
            let key = rel.to_string_lossy().to_string();
            if !is_synced_key(&key) {
                continue;
            }
            if is_marked_key(&key) {
                continue;
            }

            let meta = entry.metadata()?;
            let size = meta.len() as i64;
            let (mtime_nanos, last_modified_secs) = match meta.modified() {
                Ok(st) => {
                    let d = st.duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
                    (d.as_nanos(), d.as_secs() as i64)
                }
                Err(_) => (0, 0),
            };

            let etag = match self.last_state.get(&key) {
                Some(prev) if prev.size == size && prev.mtime_nanos == mtime_nanos => {
                    prev.etag.clone()
                }
                _ => compute_local_etag(path, size, tuning)?,
            };

            next_state.insert(
                key.clone(),
                LocalScanCacheEntry {
                    size,
                    mtime_nanos,
                    etag: etag.clone(),
                },
            );

            out.insert(
                key.clone(),
                LocalFile {
                    key,
                    path: path.to_path_buf(),
                    etag,
                    size,
                    last_modified: last_modified_secs,
                },
            );
        }

        let disappeared: HashSet<String> = self
            .last_state
            .keys()
            .filter(|k| !next_state.contains_key(*k))
            .cloned()
            .collect();
        self.last_state = next_state;
        Ok((out, disappeared))
    }
}

async fn scan_remote(api: &ApiClient, filters: &SyncFilters) -> Result<HashMap<String, BlobInfo>> {
    let mut out = HashMap::new();
    let listing = api.list_blobs().await?;
    for file in listing.items {
        if should_ignore_key(filters, &file.key) {
            continue;
        }
        if is_synced_key(&file.key) && !is_marked_key(&file.key) {
            out.insert(file.key.clone(), file);
        }
    }
    Ok(out)
}

const DEFAULT_MULTIPART_PART_SIZE: i64 = 64 * 1024 * 1024; // match uploader
const MIN_MULTIPART_PART_SIZE: i64 = 5 * 1024 * 1024; // S3 minimum
const MAX_MULTIPART_PARTS: i64 = 10000;

/// Compute the etag the relay would assign these bytes: plain MD5 below the
/// multipart threshold, the S3-style `{md5-of-part-md5s}-{count}` composite
/// above it. Part sizing must mirror the uploader's selection or the
/// composite etags will never compare equal.
pub(crate) fn compute_local_etag(path: &Path, size: i64, tuning: &TuningConfig) -> Result<String> {
    if size > tuning.multipart_threshold_bytes as i64 {
        let (part_size, part_count) =
            select_part_size(size, tuning.part_size_bytes.map(|v| v as i64));
        return compute_multipart_etag(path, size, part_size, part_count);
    }
    compute_md5_hex_streaming(path)
}

fn compute_md5_hex_streaming(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

fn compute_multipart_etag(
    path: &Path,
    size: i64,
    part_size: i64,
    part_count: i64,
) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut buf = vec![0u8; 1024 * 1024];
    let mut remaining = size;
    let mut part_digests = Vec::with_capacity(part_count.max(0) as usize);

    for _ in 0..part_count {
        let mut ctx = md5::Context::new();
        let mut to_read = remaining.min(part_size);
        while to_read > 0 {
            let cap = std::cmp::min(buf.len() as i64, to_read) as usize;
            let n = file.read(&mut buf[..cap])?;
            if n == 0 {
                break;
            }
            ctx.consume(&buf[..n]);
            to_read -= n as i64;
            remaining -= n as i64;
        }
        part_digests.push(ctx.compute());
    }

    let mut concat = Vec::with_capacity(part_digests.len() * 16);
    for d in &part_digests {
        concat.extend_from_slice(&d.0);
    }
    let final_digest = md5::compute(&concat);
    Ok(format!("{:x}-{part_count}", final_digest))
}

fn select_part_size(size: i64, override_part_size: Option<i64>) -> (i64, i64) {
    let mut part_size = override_part_size.unwrap_or(DEFAULT_MULTIPART_PART_SIZE);
    if part_size < MIN_MULTIPART_PART_SIZE {
        part_size = MIN_MULTIPART_PART_SIZE;
    }
    let mut part_count = divide_and_ceil(size, part_size);
    while part_count > MAX_MULTIPART_PARTS {
        part_size *= 2;
        part_count = divide_and_ceil(size, part_size);
    }
    (part_size, part_count)
}

fn divide_and_ceil(n: i64, d: i64) -> i64 {
    if d <= 0 {
        return 0;
    }
    let mut q = n / d;
    if n % d != 0 {
        q += 1;
    }
    q
}

fn mark_conflict(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if is_marked_path(path, ".conflict") {
        return Ok(());
    }
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let base = if ext.is_empty() {
        path.to_path_buf()
    } else {
        PathBuf::from(path.to_string_lossy().trim_end_matches(&format!(".{ext}")))
    };
    let marked = if ext.is_empty() {
        PathBuf::from(format!("{}.conflict", base.to_string_lossy()))
    } else {
        PathBuf::from(format!("{}.conflict.{ext}", base.to_string_lossy()))
    };

    if marked.exists() {
        let ts = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let rotated = if ext.is_empty() {
            PathBuf::from(format!("{}.conflict.{ts}", base.to_string_lossy()))
        } else {
            PathBuf::from(format!("{}.conflict.{ts}.{ext}", base.to_string_lossy()))
        };
        let _ = fs::rename(&marked, rotated);
    }

    fs::rename(path, marked)?;
    Ok(())
}

fn mark_rejected(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if is_marked_path(path, ".rejected") {
        return Ok(());
    }
    if find_existing_marker(path, ".rejected").is_some() {
        // Mirror Go behavior: avoid unbounded dedupe/rotation loops.
        // If any rejected marker already exists for this base path, keep the existing one and
        // delete the new offending file without rotating.
        let _ = fs::remove_file(path);
        return Ok(());
    }

    let marked = as_marked_path(path, ".rejected");
    fs::rename(path, marked)?;
    Ok(())
}

fn rejected_marker_exists(path: &Path) -> bool {
    find_existing_marker(path, ".rejected").is_some()
}

fn is_marked_path(path: &Path, marker: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| name.contains(marker))
}

fn as_marked_path(path: &Path, marker: &str) -> PathBuf {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let base = if ext.is_empty() {
        path.to_path_buf()
    } else {
        PathBuf::from(path.to_string_lossy().trim_end_matches(&format!(".{ext}")))
    };
    if ext.is_empty() {
        PathBuf::from(format!("{}{}", base.to_string_lossy(), marker))
    } else {
        PathBuf::from(format!("{}{}.{ext}", base.to_string_lossy(), marker))
    }
}

fn find_existing_marker(path: &Path, marker: &str) -> Option<PathBuf> {
    let dir = path.parent()?;
    let file_name = path.file_name()?.to_str()?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let base = if ext.is_empty() {
        file_name.to_string()
    } else {
        file_name
            .strip_suffix(&format!(".{ext}"))
            .unwrap_or(file_name)
            .to_string()
    };

    let unrotated = if ext.is_empty() {
        format!("{base}{marker}")
    } else {
        format!("{base}{marker}.{ext}")
    };
    let unrotated_path = dir.join(&unrotated);
    if unrotated_path.exists() {
        return Some(unrotated_path);
    }

    let prefix = format!("{base}{marker}.");
    let suffix = if ext.is_empty() {
        String::new()
    } else {
        format!(".{ext}")
    };

    let mut matches: Vec<PathBuf> = Vec::new();
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_str().unwrap_or("");
        if !name.starts_with(&prefix) || !name.ends_with(&suffix) {
            continue;
        }
        let ts = &name[prefix.len()..name.len().saturating_sub(suffix.len())];
        if ts.len() == 14 && ts.chars().all(|c| c.is_ascii_digit()) {
            matches.push(entry.path());
        }
    }
    matches.sort_by(|a, b| a.to_string_lossy().cmp(&b.to_string_lossy()));
    matches.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::SyncFilters;
    use std::io::Write;
    use std::time::SystemTime;

    #[test]
    fn scan_local_empty_dir() {
        let root = make_temp_dir();
        let filters = SyncFilters::load(&root).unwrap();
        let tuning = TuningConfig::default();
        let mut scanner = LocalScanner::default();
        let (state, disappeared) = scanner.scan(&root, &filters, &tuning).unwrap();
        assert!(state.is_empty());
        assert!(disappeared.is_empty());
    }

    #[test]
    fn scan_local_collects_files_and_md5() {
        let root = make_temp_dir();
        let f1 = root.join("alice@example.com/public/a.txt");
        fs::create_dir_all(f1.parent().unwrap()).unwrap();
        let mut file = fs::File::create(&f1).unwrap();
        writeln!(file, "hello").unwrap();

        let filters = SyncFilters::load(&root).unwrap();
        let tuning = TuningConfig::default();
        let mut scanner = LocalScanner::default();
        let (state, _) = scanner.scan(&root, &filters, &tuning).unwrap();
        let key = "alice@example.com/public/a.txt".to_string();
        assert!(state.contains_key(&key));
        let meta = state.get(&key).unwrap();
        assert_eq!(meta.key, key);
        assert!(!meta.etag.is_empty());

        let computed = compute_md5_hex_streaming(&f1).unwrap();
        assert_eq!(computed, meta.etag);
    }

    #[test]
    fn scan_reports_disappeared_keys_between_passes() {
        let root = make_temp_dir();
        let f1 = root.join("alice@example.com/public/gone.txt");
        fs::create_dir_all(f1.parent().unwrap()).unwrap();
        fs::write(&f1, b"bytes").unwrap();

        let filters = SyncFilters::load(&root).unwrap();
        let tuning = TuningConfig::default();
        let mut scanner = LocalScanner::default();
        let (state, disappeared) = scanner.scan(&root, &filters, &tuning).unwrap();
        assert_eq!(state.len(), 1);
        assert!(disappeared.is_empty());

        fs::remove_file(&f1).unwrap();
        let (state, disappeared) = scanner.scan(&root, &filters, &tuning).unwrap();
        assert!(state.is_empty());
        assert!(disappeared.contains("alice@example.com/public/gone.txt"));

        // A fresh scanner (daemon restart) has no previous state, so the
        // missing file is not reported as an observed deletion.
        let mut fresh = LocalScanner::default();
        let (_, disappeared) = fresh.scan(&root, &filters, &tuning).unwrap();
        assert!(disappeared.is_empty());
    }

    #[test]
    fn content_differs_ignores_last_modified_when_etag_matches() {
        let etag = "0123456789abcdef0123456789abcdef";
        assert!(!content_differs_for_key(
            false, etag, 10, etag, 10, 111, 222
        ));
    }

    #[test]
    fn content_differs_tolerates_mixed_multipart_for_mirror_paths() {
        let plain = "0123456789abcdef0123456789abcdef";
        let multipart = "0123456789abcdef0123456789abcdef-2";
        assert!(!content_differs_for_key(
            false, plain, 10, multipart, 10, 0, 0
        ));
    }

    #[test]
    fn content_differs_flags_different_etags() {
        assert!(content_differs_for_key(
            false,
            "0123456789abcdef0123456789abcdef",
            10,
            "fedcba9876543210fedcba9876543210",
            10,
            0,
            0
        ));
    }

    #[test]
    fn mark_conflict_does_not_double_mark() {
        let root = make_temp_dir();
        let dir = root.join("alice@example.com/public");
        fs::create_dir_all(&dir).unwrap();
        let orig = dir.join("file.txt");
        fs::write(&orig, b"v1").unwrap();

        mark_conflict(&orig).unwrap();
        let marked = dir.join("file.conflict.txt");
        assert!(marked.exists());

        // Marking an already-marked file should be a no-op (avoid `.conflict.conflict.*` loops).
        mark_conflict(&marked).unwrap();
        assert!(marked.exists());
        assert!(!dir.join("file.conflict.conflict.txt").exists());
    }

    #[test]
    fn mark_conflict_rotates_existing_marker() {
        let root = make_temp_dir();
        let dir = root.join("alice@example.com/public");
        fs::create_dir_all(&dir).unwrap();
        let orig = dir.join("file.txt");
        fs::write(&orig, b"v1").unwrap();
        mark_conflict(&orig).unwrap();

        // Create another file at the original path and mark again to force rotation.
        fs::write(&orig, b"v2").unwrap();
        mark_conflict(&orig).unwrap();

        let marked = dir.join("file.conflict.txt");
        assert!(marked.exists());

        // Expect a rotated prior marker with a timestamp.
        let mut found_rotated = false;
        for entry in fs::read_dir(&dir).unwrap().flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("file.conflict.") && name.ends_with(".txt") {
                let ts = name
                    .trim_start_matches("file.conflict.")
                    .trim_end_matches(".txt");
                if ts.len() == 14 && ts.chars().all(|c| c.is_ascii_digit()) {
                    found_rotated = true;
                    break;
                }
            }
        }
        assert!(found_rotated);
    }

    #[test]
    fn mark_rejected_dedupes_without_rotation() {
        let root = make_temp_dir();
        let dir = root.join("alice@example.com/public");
        fs::create_dir_all(&dir).unwrap();
        let orig = dir.join("file.txt");
        fs::write(&orig, b"v1").unwrap();

        mark_rejected(&orig).unwrap();
        let marked = dir.join("file.rejected.txt");
        assert!(marked.exists());

        // Create another file at the original path; marking should delete it and keep the marker.
        fs::write(&orig, b"v2").unwrap();
        mark_rejected(&orig).unwrap();
        assert!(!orig.exists());
        assert!(marked.exists());

        // No rotation should have occurred for rejected markers.
        let mut rejected_count = 0;
        for entry in fs::read_dir(&dir).unwrap().flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.contains(".rejected") {
                rejected_count += 1;
                assert!(!name.starts_with("file.rejected.") || name == "file.rejected.txt");
            }
        }
        assert_eq!(rejected_count, 1);
    }

    fn make_temp_dir() -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("datasite-sync-sync-test-{nanos}"));
        fs::create_dir_all(&root).unwrap();
        root
    }

    const ETAG_A: &str = "0123456789abcdef0123456789abcdef";
    const ETAG_B: &str = "fedcba9876543210fedcba9876543210";
    const ETAG_C: &str = "00112233445566778899aabbccddeeff";

    fn local_file(etag: &str) -> LocalFile {
        LocalFile {
            key: "alice@example.com/public/f.txt".to_string(),
            path: PathBuf::from("/tmp/f.txt"),
            etag: etag.to_string(),
            size: 10,
            last_modified: 1_000,
        }
    }

    fn journal_entry(etag: &str, local_etag: &str) -> FileMetadata {
        FileMetadata {
            etag: etag.to_string(),
            local_etag: local_etag.to_string(),
            size: 10,
            last_modified: 1_000,
            version: String::new(),
            completed_at: 0,
            deleted_at: 0,
        }
    }

    fn tombstone_entry(etag: &str, deleted_at: i64) -> FileMetadata {
        let mut meta = journal_entry(etag, etag);
        meta.deleted_at = deleted_at;
        meta.size = -1;
        meta
    }

    fn remote_entry(etag: &str) -> BlobInfo {
        BlobInfo {
            key: "alice@example.com/public/f.txt".to_string(),
            etag: etag.to_string(),
            size: 10,
            last_modified: chrono::DateTime::<chrono::Utc>::from_timestamp(1_000, 0).unwrap(),
        }
    }

    fn facts<'a>(
        local: Option<&'a LocalFile>,
        journal: Option<&'a FileMetadata>,
        remote: Option<&'a BlobInfo>,
    ) -> PathFacts<'a> {
        PathFacts {
            is_owner: true,
            local,
            journal,
            remote,
            now: 10_000,
            tombstone_grace_secs: 30,
        }
    }

    #[test]
    fn classify_new_local_uploads() {
        let l = local_file(ETAG_A);
        assert_eq!(classify(&facts(Some(&l), None, None)), SyncAction::Upload);
    }

    #[test]
    fn classify_matching_sides_without_journal_heals() {
        let l = local_file(ETAG_A);
        let r = remote_entry(ETAG_A);
        assert_eq!(
            classify(&facts(Some(&l), None, Some(&r))),
            SyncAction::HealJournal
        );
    }

    #[test]
    fn classify_divergence_without_history_conflicts() {
        let l = local_file(ETAG_A);
        let r = remote_entry(ETAG_B);
        assert_eq!(
            classify(&facts(Some(&l), None, Some(&r))),
            SyncAction::Conflict
        );
    }

    #[test]
    fn classify_all_sides_equal_is_noop() {
        let l = local_file(ETAG_A);
        let j = journal_entry(ETAG_A, ETAG_A);
        let r = remote_entry(ETAG_A);
        assert_eq!(
            classify(&facts(Some(&l), Some(&j), Some(&r))),
            SyncAction::Noop
        );
    }

    #[test]
    fn classify_local_edit_uploads() {
        let l = local_file(ETAG_B);
        let j = journal_entry(ETAG_A, ETAG_A);
        let r = remote_entry(ETAG_A);
        assert_eq!(
            classify(&facts(Some(&l), Some(&j), Some(&r))),
            SyncAction::Upload
        );
    }

    #[test]
    fn classify_remote_edit_downloads() {
        let l = local_file(ETAG_A);
        let j = journal_entry(ETAG_A, ETAG_A);
        let r = remote_entry(ETAG_B);
        assert_eq!(
            classify(&facts(Some(&l), Some(&j), Some(&r))),
            SyncAction::Download
        );
    }

    #[test]
    fn classify_double_edit_conflicts() {
        let l = local_file(ETAG_B);
        let j = journal_entry(ETAG_A, ETAG_A);
        let r = remote_entry(ETAG_C);
        assert_eq!(
            classify(&facts(Some(&l), Some(&j), Some(&r))),
            SyncAction::Conflict
        );
    }

    #[test]
    fn classify_double_edit_to_same_bytes_heals() {
        let l = local_file(ETAG_B);
        let j = journal_entry(ETAG_A, ETAG_A);
        let r = remote_entry(ETAG_B);
        assert_eq!(
            classify(&facts(Some(&l), Some(&j), Some(&r))),
            SyncAction::HealJournal
        );
    }

    #[test]
    fn classify_missing_local_without_observed_delete_downloads() {
        let j = journal_entry(ETAG_A, ETAG_A);
        let r = remote_entry(ETAG_A);
        assert_eq!(
            classify(&facts(None, Some(&j), Some(&r))),
            SyncAction::Download
        );
    }

    #[test]
    fn classify_remote_deletion_removes_unmodified_local() {
        let l = local_file(ETAG_A);
        let j = journal_entry(ETAG_A, ETAG_A);
        assert_eq!(
            classify(&facts(Some(&l), Some(&j), None)),
            SyncAction::DeleteLocal
        );
    }

    #[test]
    fn classify_local_edit_survives_remote_deletion() {
        let l = local_file(ETAG_B);
        let j = journal_entry(ETAG_A, ETAG_A);
        assert_eq!(
            classify(&facts(Some(&l), Some(&j), None)),
            SyncAction::Upload
        );
    }

    #[test]
    fn classify_new_remote_downloads() {
        let r = remote_entry(ETAG_A);
        assert_eq!(classify(&facts(None, None, Some(&r))), SyncAction::Download);
    }

    #[test]
    fn classify_tombstone_with_unchanged_remote_reissues_delete() {
        let t = tombstone_entry(ETAG_A, 9_990);
        let r = remote_entry(ETAG_A);
        assert_eq!(
            classify(&facts(None, Some(&t), Some(&r))),
            SyncAction::DeleteRemote
        );
    }

    #[test]
    fn classify_tombstone_with_new_remote_content_resurrects() {
        let t = tombstone_entry(ETAG_A, 9_990);
        let r = remote_entry(ETAG_B);
        assert_eq!(
            classify(&facts(None, Some(&t), Some(&r))),
            SyncAction::Download
        );
    }

    #[test]
    fn classify_tombstone_forgotten_only_after_grace() {
        let recent = tombstone_entry(ETAG_A, 9_990);
        assert_eq!(classify(&facts(None, Some(&recent), None)), SyncAction::Noop);

        let old = tombstone_entry(ETAG_A, 9_000);
        assert_eq!(
            classify(&facts(None, Some(&old), None)),
            SyncAction::ForgetJournal
        );
    }

    #[test]
    fn classify_local_recreate_over_tombstone_uploads() {
        let t = tombstone_entry(ETAG_A, 9_990);
        let l = local_file(ETAG_B);
        assert_eq!(classify(&facts(Some(&l), Some(&t), None)), SyncAction::Upload);
    }

    #[test]
    fn classify_both_sides_gone_tombstones_before_forgetting() {
        let j = journal_entry(ETAG_A, ETAG_A);
        assert_eq!(
            classify(&facts(None, Some(&j), None)),
            SyncAction::TombstoneLocal
        );
    }

    #[test]
    fn classify_remote_origin_tombstone_redownloads_any_reappearance() {
        // A remote-side deletion leaves a tombstone with no pending delete
        // claim (empty etag). Content reappearing during the grace window,
        // identical bytes included, must come back down rather than be
        // deleted again.
        let mut t = tombstone_entry(ETAG_A, 9_990);
        t.etag.clear();
        t.local_etag.clear();
        let r = remote_entry(ETAG_A);
        assert_eq!(
            classify(&facts(None, Some(&t), Some(&r))),
            SyncAction::Download
        );
    }

    #[test]
    fn acl_keys_sort_ahead_of_regular_keys() {
        let mut keys = vec![
            "alice@example.com/public/z.txt".to_string(),
            "alice@example.com/public/syft.pub.yaml".to_string(),
            "alice@example.com/a.txt".to_string(),
        ];
        keys.sort_by(|a, b| is_acl_key(b).cmp(&is_acl_key(a)).then_with(|| a.cmp(b)));
        assert_eq!(keys[0], "alice@example.com/public/syft.pub.yaml");
    }
}
