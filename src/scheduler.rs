use std::time::Duration;

use rand::Rng;

/// Adaptive wakeup interval for the reconciliation loop.
///
/// Runs hot (`burst`) right after a change is observed and relaxes toward
/// `idle` the longer the datasite stays quiet, jittered so that many
/// daemons don't all wake up in lockstep.
pub struct Scheduler {
    burst: Duration,
    idle: Duration,
    current: Duration,
}

impl Scheduler {
    pub fn new(burst: Duration, idle: Duration) -> Self {
        Scheduler {
            burst,
            idle,
            current: burst,
        }
    }

    pub fn default_tuning() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10))
    }

    /// A wakeup happened for a real reason (FS event, priority-channel
    /// message, control-plane request, reconnect): drop straight back to
    /// the burst interval.
    pub fn note_activity(&mut self) {
        self.current = self.burst;
    }

    /// A pass completed and found nothing to do: back off toward idle.
    pub fn note_idle_pass(&mut self) {
        let doubled = self.current.saturating_mul(2);
        self.current = doubled.min(self.idle);
    }

    /// The jittered delay to sleep before the next pass (±25%).
    pub fn next_delay(&self) -> Duration {
        let base = self.current.as_millis().max(1) as i64;
        let jitter_range = base / 4;
        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        let millis = (base + jitter).max(1) as u64;
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backs_off_toward_idle_and_resets_on_activity() {
        let mut sched = Scheduler::new(Duration::from_millis(100), Duration::from_secs(10));
        assert_eq!(sched.current, Duration::from_millis(100));
        sched.note_idle_pass();
        assert_eq!(sched.current, Duration::from_millis(200));
        sched.note_idle_pass();
        assert_eq!(sched.current, Duration::from_millis(400));
        sched.note_activity();
        assert_eq!(sched.current, Duration::from_millis(100));
    }

    #[test]
    fn idle_backoff_caps_at_idle_ceiling() {
        let mut sched = Scheduler::new(Duration::from_millis(100), Duration::from_millis(300));
        for _ in 0..10 {
            sched.note_idle_pass();
        }
        assert_eq!(sched.current, Duration::from_millis(300));
    }

    #[test]
    fn jittered_delay_stays_within_twenty_five_percent() {
        let sched = Scheduler::new(Duration::from_millis(1000), Duration::from_secs(10));
        for _ in 0..50 {
            let d = sched.next_delay().as_millis() as i64;
            assert!((750..=1250).contains(&d), "delay {d} out of jitter band");
        }
    }
}
