//! In-process counters the control plane reports. Writers are the transfer
//! paths; the only reader is the local HTTP surface, which takes
//! point-in-time snapshots.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Running totals for relay traffic plus the most recent transport error.
#[derive(Default)]
pub struct HttpStats {
    sent_total: AtomicI64,
    recv_total: AtomicI64,
    last_error: Mutex<Option<String>>,
}

impl HttpStats {
    pub fn on_send(&self, bytes: i64) {
        if bytes > 0 {
            self.sent_total.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn on_recv(&self, bytes: i64) {
        if bytes > 0 {
            self.recv_total.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn set_last_error(&self, err: impl ToString) {
        *self.last_error.lock().unwrap() = Some(err.to_string());
    }

    pub fn snapshot(&self) -> HttpStatsSnapshot {
        HttpStatsSnapshot {
            bytes_sent_total: self.sent_total.load(Ordering::Relaxed),
            bytes_recv_total: self.recv_total.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_default(),
        }
    }
}

#[derive(Clone)]
pub struct HttpStatsSnapshot {
    pub bytes_sent_total: i64,
    pub bytes_recv_total: i64,
    pub last_error: String,
}

/// Rolling window of relay round-trip samples. Old samples fall off the
/// back once the window is full, so the snapshot always reflects recent
/// behavior rather than the lifetime average.
pub struct LatencyStats {
    server_url: String,
    window: Mutex<RttWindow>,
}

struct RttWindow {
    samples: VecDeque<u64>,
    last_recorded_unix_ms: u64,
}

const RTT_WINDOW: usize = 60;

impl LatencyStats {
    pub fn new(server_url: String) -> Self {
        Self {
            server_url,
            window: Mutex::new(RttWindow {
                samples: VecDeque::with_capacity(RTT_WINDOW),
                last_recorded_unix_ms: 0,
            }),
        }
    }

    pub fn record(&self, rtt_ms: u64) {
        let mut window = self.window.lock().unwrap();
        while window.samples.len() >= RTT_WINDOW {
            window.samples.pop_front();
        }
        window.samples.push_back(rtt_ms);
        window.last_recorded_unix_ms = unix_millis();
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let window = self.window.lock().unwrap();
        let samples: Vec<u64> = window.samples.iter().copied().collect();
        let (min_ms, avg_ms, max_ms) = summarize(&samples);
        LatencySnapshot {
            server_url: self.server_url.clone(),
            samples,
            avg_ms,
            min_ms,
            max_ms,
            last_ping_ms: window.last_recorded_unix_ms,
        }
    }
}

fn summarize(samples: &[u64]) -> (u64, u64, u64) {
    if samples.is_empty() {
        return (0, 0, 0);
    }
    let mut min = u64::MAX;
    let mut max = 0u64;
    let mut sum = 0u64;
    for &s in samples {
        min = min.min(s);
        max = max.max(s);
        sum += s;
    }
    (min, sum / samples.len() as u64, max)
}

fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySnapshot {
    pub server_url: String,
    pub samples: Vec<u64>,
    pub avg_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub last_ping_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_stats_ignore_non_positive_byte_counts() {
        let stats = HttpStats::default();
        stats.on_send(100);
        stats.on_send(0);
        stats.on_send(-5);
        stats.on_recv(-1);
        stats.on_recv(40);

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_sent_total, 100);
        assert_eq!(snap.bytes_recv_total, 40);
        assert!(snap.last_error.is_empty());
    }

    #[test]
    fn last_error_keeps_only_the_most_recent() {
        let stats = HttpStats::default();
        stats.set_last_error("first");
        stats.set_last_error("second");
        assert_eq!(stats.snapshot().last_error, "second");
    }

    #[test]
    fn empty_latency_window_snapshots_to_zeros() {
        let stats = LatencyStats::new("https://relay.example.com".to_string());
        let snap = stats.snapshot();
        assert_eq!(snap.server_url, "https://relay.example.com");
        assert!(snap.samples.is_empty());
        assert_eq!((snap.min_ms, snap.avg_ms, snap.max_ms), (0, 0, 0));
        assert_eq!(snap.last_ping_ms, 0);
    }

    #[test]
    fn latency_window_evicts_oldest_samples() {
        let stats = LatencyStats::new("https://relay.example.com".to_string());
        for rtt in 0..(RTT_WINDOW as u64 + 10) {
            stats.record(rtt);
        }
        let snap = stats.snapshot();
        assert_eq!(snap.samples.len(), RTT_WINDOW);
        // The ten oldest samples must have been evicted.
        assert_eq!(snap.min_ms, 10);
        assert_eq!(snap.max_ms, RTT_WINDOW as u64 + 9);
        assert!(snap.last_ping_ms > 0);
    }

    #[test]
    fn summarize_handles_single_sample() {
        assert_eq!(summarize(&[42]), (42, 42, 42));
    }
}
