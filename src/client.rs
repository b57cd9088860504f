use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Notify};

use crate::acl::AclStore;
use crate::config::Config;
use crate::control::ControlPlane;
use crate::errors::SyncErrorKind;
use crate::filters::SyncFilters;
use crate::http::ApiClient;
use crate::priority::{PriorityChannel, PRIORITY_INLINE_LIMIT};
use crate::scheduler::Scheduler;
use crate::subscriptions::CachedSubscriptions;
use crate::sync::{sync_once_with_control, LocalScanner, SyncJournal};
use crate::watcher::{DatasiteWatcher, WatchEvent};

/// Consecutive failed passes tolerated while the watcher is also dead
/// before the daemon gives up (exit code 2 territory: neither events nor
/// listing work, so there is no way left to observe anything).
const MAX_BLIND_FAILED_PASSES: usize = 10;

pub struct ClientStartOptions {
    pub healthz_max_attempts: Option<usize>,
}

impl Default for ClientStartOptions {
    fn default() -> Self {
        Self {
            healthz_max_attempts: Some(60),
        }
    }
}

pub struct Client {
    cfg: Config,
    api: ApiClient,
    filters: Arc<SyncFilters>,
    control: Option<ControlPlane>,
    acl: Arc<AclStore>,
    subscriptions: Arc<CachedSubscriptions>,
    priority: Option<Arc<PriorityChannel>>,
}

enum Wakeup {
    Shutdown,
    Timer,
    Watch(Option<WatchEvent>),
    ControlRequest,
    PriorityDelivery,
}

impl Client {
    pub(crate) fn new(
        cfg: Config,
        api: ApiClient,
        filters: Arc<SyncFilters>,
        control: Option<ControlPlane>,
        acl: Arc<AclStore>,
        subscriptions: Arc<CachedSubscriptions>,
        priority: Option<Arc<PriorityChannel>>,
    ) -> Self {
        Self {
            cfg,
            api,
            filters,
            control,
            acl,
            subscriptions,
            priority,
        }
    }

    /// Run forever, driving reconciliation passes on an adaptive schedule
    /// with event-driven wakeups, until `shutdown` is notified.
    pub async fn start_with_shutdown(
        &mut self,
        shutdown: Arc<Notify>,
        opts: ClientStartOptions,
    ) -> Result<()> {
        tokio::select! {
            _ = shutdown.notified() => return Ok(()),
            res = self.wait_for_healthz(opts.healthz_max_attempts) => res?,
        }

        let datasites_root = self.cfg.data_dir.join("datasites");
        let mut journal = SyncJournal::load(&self.cfg.data_dir).context("load sync journal")?;
        let mut local_scanner = LocalScanner::default();
        let mut scheduler = Scheduler::default_tuning();

        // Debounced fan-out of small-file changes over the priority channel.
        let (prio_tx, prio_rx) = mpsc::channel::<String>(256);
        if let Some(channel) = self.priority.clone() {
            tokio::spawn(run_priority_sender(
                prio_rx,
                channel,
                self.cfg.data_dir.clone(),
                Duration::from_millis(self.cfg.tuning.priority_debounce_ms),
            ));
        }

        let mut watcher = match DatasiteWatcher::start(&datasites_root) {
            Ok(w) => Some(w),
            Err(err) => {
                crate::logging::error(format!("fs watcher failed to start: {err:#}"));
                None
            }
        };
        let mut blind_failed_passes = 0usize;

        loop {
            let pass = sync_once_with_control(
                &self.api,
                &self.cfg.data_dir,
                &self.cfg.email,
                self.control.clone(),
                &self.filters,
                &mut local_scanner,
                &mut journal,
                Some(&self.acl),
                Some(&self.subscriptions),
                &self.cfg.tuning,
            )
            .await;

            match pass {
                Ok(()) => {
                    blind_failed_passes = 0;
                    scheduler.note_idle_pass();
                }
                Err(e) => {
                    crate::logging::error(format!("sync pass failed: {e}"));
                    scheduler.note_activity();
                    if watcher.is_none() {
                        blind_failed_passes += 1;
                        if blind_failed_passes >= MAX_BLIND_FAILED_PASSES {
                            return Err(SyncErrorKind::lost(
                                "fs watcher dead and relay listing unreachable",
                            ));
                        }
                    }
                }
            }

            // A dead watcher is re-armed after the full scan each pass makes
            // anyway; until that succeeds the daemon keeps scanning blind.
            if watcher.is_none() {
                match DatasiteWatcher::start(&datasites_root) {
                    Ok(w) => {
                        crate::logging::info("fs watcher re-armed");
                        watcher = Some(w);
                    }
                    Err(err) => {
                        crate::logging::error(format!("fs watcher re-arm failed: {err:#}"));
                    }
                }
            }

            match self
                .next_wakeup(&shutdown, &mut watcher, scheduler.next_delay())
                .await
            {
                Wakeup::Shutdown => return Ok(()),
                Wakeup::Timer => {}
                Wakeup::ControlRequest | Wakeup::PriorityDelivery => scheduler.note_activity(),
                Wakeup::Watch(event) => {
                    scheduler.note_activity();
                    match event {
                        Some(WatchEvent::Changed(batch)) => {
                            self.queue_priority_sends(&batch.keys, &prio_tx);
                        }
                        Some(WatchEvent::Lost(reason)) => {
                            crate::logging::error(format!("fs watcher lost: {reason}"));
                            watcher = None;
                        }
                        None => {
                            crate::logging::error("fs watcher stopped unexpectedly");
                            watcher = None;
                        }
                    }
                }
            }
        }
    }

    async fn next_wakeup(
        &self,
        shutdown: &Arc<Notify>,
        watcher: &mut Option<DatasiteWatcher>,
        delay: Duration,
    ) -> Wakeup {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        tokio::select! {
            _ = shutdown.notified() => Wakeup::Shutdown,
            _ = &mut sleep => Wakeup::Timer,
            ev = watch_next(watcher) => Wakeup::Watch(ev),
            _ = control_wait(self.control.as_ref()) => Wakeup::ControlRequest,
            _ = delivery_wait(self.priority.as_deref()) => Wakeup::PriorityDelivery,
        }
    }

    fn queue_priority_sends(&self, keys: &BTreeSet<String>, prio_tx: &mpsc::Sender<String>) {
        if self.priority.is_none() {
            return;
        }
        for key in keys {
            let rel = Path::new(key);
            if !self.filters.priority.should_prioritize_rel(rel, false) {
                continue;
            }
            if self.filters.ignore.should_ignore_rel(rel, false)
                || SyncFilters::is_marked_rel_path(key)
            {
                continue;
            }
            // try_send: under a flood the bulk path picks the stragglers up.
            let _ = prio_tx.try_send(key.clone());
        }
    }

    async fn wait_for_healthz(&self, max_attempts: Option<usize>) -> Result<()> {
        let max_attempts = max_attempts.unwrap_or(60).max(1);
        let mut last_err = None;
        for attempt in 0..max_attempts {
            match self.api.healthz().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap()).context("server did not become healthy")
    }
}

async fn watch_next(watcher: &mut Option<DatasiteWatcher>) -> Option<WatchEvent> {
    match watcher {
        Some(w) => w.next().await,
        None => std::future::pending().await,
    }
}

async fn control_wait(control: Option<&ControlPlane>) {
    match control {
        Some(cp) => cp.wait_sync_now().await,
        None => std::future::pending().await,
    }
}

async fn delivery_wait(priority: Option<&PriorityChannel>) {
    match priority {
        Some(channel) => channel.wait_delivery().await,
        None => std::future::pending().await,
    }
}

/// Coalesce priority-eligible keys over the configured debounce window and
/// push each one over the event socket. An acked write advances the journal
/// so the next reconciliation pass does not upload the same bytes again; a
/// failed send is left for the bulk path.
async fn run_priority_sender(
    mut rx: mpsc::Receiver<String>,
    channel: Arc<PriorityChannel>,
    data_dir: PathBuf,
    debounce: Duration,
) {
    let datasites_root = data_dir.join("datasites");
    loop {
        let Some(first) = rx.recv().await else {
            return;
        };
        let mut keys = BTreeSet::new();
        keys.insert(first);
        if !debounce.is_zero() {
            tokio::time::sleep(debounce).await;
        }
        while let Ok(key) = rx.try_recv() {
            keys.insert(key);
        }

        for key in keys {
            send_priority_key(&channel, &data_dir, &datasites_root, &key).await;
        }
    }
}

async fn send_priority_key(
    channel: &PriorityChannel,
    data_dir: &Path,
    datasites_root: &Path,
    key: &str,
) {
    let abs = datasites_root.join(key);
    match std::fs::metadata(&abs) {
        Ok(meta) if meta.is_file() => {
            if meta.len() as usize > PRIORITY_INLINE_LIMIT {
                return;
            }
            let bytes = match std::fs::read(&abs) {
                Ok(b) => b,
                Err(err) => {
                    crate::logging::error(format!("priority read failed for {key}: {err}"));
                    return;
                }
            };
            let etag = format!("{:x}", md5::compute(&bytes));
            let size = bytes.len() as i64;
            match channel.send_file_write(key, &etag, bytes).await {
                Ok(()) => {
                    let now = chrono::Utc::now().timestamp();
                    if let Err(err) = crate::sync::journal_upsert_direct(
                        data_dir, key, &etag, &etag, size, now,
                    ) {
                        crate::logging::error(format!(
                            "priority journal update failed for {key}: {err:#}"
                        ));
                    }
                }
                Err(err) => {
                    crate::logging::info(format!(
                        "priority send deferred to bulk path for {key}: {err:#}"
                    ));
                }
            }
        }
        Ok(_) => {}
        Err(_) => {
            // Path disappeared: a best-effort delete notification. The
            // reconciler's tombstone flow owns the authoritative delete.
            if let Err(err) = channel.send_file_delete(key).await {
                crate::logging::info(format!(
                    "priority delete deferred to bulk path for {key}: {err:#}"
                ));
            }
        }
    }
}
