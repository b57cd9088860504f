use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::acl::ACL_FILE_NAME;

const SUB_FILE_NAME: &str = "syft.sub.yaml";

/// Debounce bounds. The window adapts inside this range: a large batch means
/// a writer is mid-burst and the next window shrinks so deliveries stay
/// low-latency; a trickle widens the window back out for better coalescing.
const DEBOUNCE_MIN: Duration = Duration::from_millis(20);
const DEBOUNCE_MAX: Duration = Duration::from_millis(200);
const DEBOUNCE_START: Duration = Duration::from_millis(50);

/// Raw event queue depth between the notify callback thread and the
/// debounce task. Overflow is not fatal: the batch is flagged and the
/// consumer falls back to a full scan.
const RAW_QUEUE_DEPTH: usize = 1024;

/// One debounced set of filesystem changes under the datasites root.
#[derive(Debug, Default)]
pub struct WatchBatch {
    /// Changed paths as sync keys (`<owner>/<relpath>`, `/`-separated).
    /// Renames appear as two entries: the old name (now absent on disk)
    /// and the new one.
    pub keys: BTreeSet<String>,
    /// At least one `syft.pub.yaml` or `syft.sub.yaml` changed; the consumer
    /// must reload ACL/subscription state before reconciling.
    pub policy_changed: bool,
    /// The raw queue overflowed and some events were dropped; the consumer
    /// should treat this batch as "anything may have changed".
    pub overflowed: bool,
}

#[derive(Debug)]
pub enum WatchEvent {
    Changed(WatchBatch),
    /// The OS watch handle died. The consumer performs a full scan and
    /// re-arms a fresh watcher.
    Lost(String),
}

/// Recursive watcher over the datasites root producing debounced
/// [`WatchBatch`]es. Must be started from within a tokio runtime.
pub struct DatasiteWatcher {
    rx: mpsc::Receiver<WatchEvent>,
    // Dropping the notify handle unregisters the OS watches.
    _watcher: RecommendedWatcher,
}

enum RawEvent {
    Fs(Event),
    Error(String),
    Overflow,
}

impl DatasiteWatcher {
    pub fn start(datasites_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(datasites_root)
            .with_context(|| format!("create {}", datasites_root.display()))?;

        let (callback_tx, raw_rx) = mpsc::channel::<RawEvent>(RAW_QUEUE_DEPTH);
        let (batch_tx, batch_rx) = mpsc::channel::<WatchEvent>(64);

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let raw = match res {
                    Ok(ev) => RawEvent::Fs(ev),
                    Err(err) => RawEvent::Error(err.to_string()),
                };
                if let Err(mpsc::error::TrySendError::Full(_)) = callback_tx.try_send(raw) {
                    // Queue full: drop the event but record that we did.
                    let _ = callback_tx.try_send(RawEvent::Overflow);
                }
            },
            notify::Config::default(),
        )
        .context("create fs watcher")?;

        watcher
            .watch(datasites_root, RecursiveMode::Recursive)
            .with_context(|| format!("watch {}", datasites_root.display()))?;

        let root = datasites_root.to_path_buf();
        tokio::spawn(debounce_loop(root, raw_rx, batch_tx));

        Ok(Self {
            rx: batch_rx,
            _watcher: watcher,
        })
    }

    /// Next debounced batch, or `None` once the watcher task has stopped.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

async fn debounce_loop(
    root: PathBuf,
    mut raw_rx: mpsc::Receiver<RawEvent>,
    batch_tx: mpsc::Sender<WatchEvent>,
) {
    let mut window = DEBOUNCE_START;

    loop {
        // Block for the first event of a batch.
        let first = match raw_rx.recv().await {
            Some(ev) => ev,
            None => return,
        };

        let mut batch = WatchBatch::default();
        let mut lost: Option<String> = None;
        absorb(&root, first, &mut batch, &mut lost);

        // Collect everything that lands inside the debounce window.
        if lost.is_none() {
            let deadline = tokio::time::Instant::now() + window;
            loop {
                let ev = tokio::select! {
                    ev = raw_rx.recv() => ev,
                    _ = tokio::time::sleep_until(deadline) => break,
                };
                match ev {
                    Some(ev) => {
                        absorb(&root, ev, &mut batch, &mut lost);
                        if lost.is_some() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }

        if let Some(reason) = lost {
            let _ = batch_tx.send(WatchEvent::Lost(reason)).await;
            return;
        }

        window = next_window(window, batch.keys.len());

        if !batch.keys.is_empty() || batch.policy_changed || batch.overflowed {
            if batch_tx.send(WatchEvent::Changed(batch)).await.is_err() {
                return;
            }
        }
    }
}

fn absorb(root: &Path, ev: RawEvent, batch: &mut WatchBatch, lost: &mut Option<String>) {
    match ev {
        RawEvent::Fs(ev) => {
            for path in &ev.paths {
                if let Some(key) = key_for(root, path) {
                    if is_policy_file(path) {
                        batch.policy_changed = true;
                    }
                    batch.keys.insert(key);
                }
            }
        }
        RawEvent::Error(reason) => *lost = Some(reason),
        RawEvent::Overflow => batch.overflowed = true,
    }
}

fn next_window(current: Duration, batch_size: usize) -> Duration {
    let next = if batch_size >= 16 {
        current / 2
    } else if batch_size <= 2 {
        current * 2
    } else {
        current
    };
    next.clamp(DEBOUNCE_MIN, DEBOUNCE_MAX)
}

fn key_for(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let key = rel.to_string_lossy().replace('\\', "/");
    if key.is_empty() {
        return None;
    }
    Some(key)
}

fn is_policy_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n == ACL_FILE_NAME || n == SUB_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn make_temp_dir(name: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("datasite-sync-watch-test-{name}-{nanos}"));
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    async fn collect_keys_until(
        watcher: &mut DatasiteWatcher,
        want: &[&str],
        timeout: Duration,
    ) -> (BTreeSet<String>, bool) {
        let mut seen = BTreeSet::new();
        let mut policy = false;
        let deadline = tokio::time::Instant::now() + timeout;
        while !want.iter().all(|w| seen.contains(*w)) {
            let ev = tokio::select! {
                ev = watcher.next() => ev,
                _ = tokio::time::sleep_until(deadline) => break,
            };
            match ev {
                Some(WatchEvent::Changed(batch)) => {
                    policy |= batch.policy_changed;
                    seen.extend(batch.keys);
                }
                Some(WatchEvent::Lost(reason)) => panic!("watcher lost: {reason}"),
                None => break,
            }
        }
        (seen, policy)
    }

    #[tokio::test]
    async fn reports_changed_keys_relative_to_root() {
        let root = make_temp_dir("keys");
        let dir = root.join("alice@example.com/public");
        std::fs::create_dir_all(&dir).unwrap();

        let mut watcher = DatasiteWatcher::start(&root).unwrap();
        std::fs::write(dir.join("a.txt"), b"hello").unwrap();

        let (seen, policy) = collect_keys_until(
            &mut watcher,
            &["alice@example.com/public/a.txt"],
            Duration::from_secs(3),
        )
        .await;
        assert!(seen.contains("alice@example.com/public/a.txt"), "saw {seen:?}");
        assert!(!policy);
    }

    #[tokio::test]
    async fn policy_file_change_sets_policy_flag() {
        let root = make_temp_dir("policy");
        let dir = root.join("alice@example.com");
        std::fs::create_dir_all(&dir).unwrap();

        let mut watcher = DatasiteWatcher::start(&root).unwrap();
        std::fs::write(dir.join(ACL_FILE_NAME), b"rules: []").unwrap();

        let (seen, policy) = collect_keys_until(
            &mut watcher,
            &["alice@example.com/syft.pub.yaml"],
            Duration::from_secs(3),
        )
        .await;
        assert!(seen.contains("alice@example.com/syft.pub.yaml"), "saw {seen:?}");
        assert!(policy);
    }

    #[tokio::test]
    async fn rapid_writes_coalesce_into_few_batches() {
        let root = make_temp_dir("coalesce");
        let dir = root.join("alice@example.com/public");
        std::fs::create_dir_all(&dir).unwrap();

        let mut watcher = DatasiteWatcher::start(&root).unwrap();
        for i in 0..10 {
            std::fs::write(dir.join(format!("f{i}.txt")), b"x").unwrap();
        }

        let want: Vec<String> = (0..10)
            .map(|i| format!("alice@example.com/public/f{i}.txt"))
            .collect();
        let want_refs: Vec<&str> = want.iter().map(String::as_str).collect();
        let (seen, _) = collect_keys_until(&mut watcher, &want_refs, Duration::from_secs(5)).await;
        for key in &want {
            assert!(seen.contains(key), "missing {key} in {seen:?}");
        }
    }

    #[test]
    fn window_adapts_within_bounds() {
        // Bursts shrink the window, trickles widen it, both stay clamped.
        assert_eq!(
            next_window(Duration::from_millis(50), 20),
            Duration::from_millis(25)
        );
        assert_eq!(next_window(DEBOUNCE_MIN, 100), DEBOUNCE_MIN);
        assert_eq!(
            next_window(Duration::from_millis(50), 1),
            Duration::from_millis(100)
        );
        assert_eq!(next_window(DEBOUNCE_MAX, 0), DEBOUNCE_MAX);
    }
}
