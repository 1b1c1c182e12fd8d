use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Global counters for the agent.
///
/// Updated from the drain loop and the output hook, so all fields are
/// atomic. Surfaced to the daemon in periodic `sampling_stats` events
/// rather than as errors.
pub struct Metrics {
    pub events_emitted: AtomicU64,
    pub entries_drained: AtomicU64,
    pub entries_lost: AtomicU64,
    pub rate_dropped: AtomicU64,
    pub removed_func_skips: AtomicU64,
    pub output_bytes: AtomicU64,
    pub expr_watch_errors: AtomicU64,
    pub start_time: SystemTime,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_emitted: AtomicU64::new(0),
            entries_drained: AtomicU64::new(0),
            entries_lost: AtomicU64::new(0),
            rate_dropped: AtomicU64::new(0),
            removed_func_skips: AtomicU64::new(0),
            output_bytes: AtomicU64::new(0),
            expr_watch_errors: AtomicU64::new(0),
            start_time: SystemTime::now(),
        }
    }

    pub fn add_emitted(&self, n: u64) {
        self.events_emitted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_drained(&self, n: u64) {
        self.entries_drained.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_lost(&self, n: u64) {
        self.entries_lost.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_rate_dropped(&self) {
        self.rate_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_removed_func_skip(&self) {
        self.removed_func_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_output_bytes(&self, n: u64) -> u64 {
        self.output_bytes.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn inc_expr_watch_error(&self) {
        self.expr_watch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            entries_drained: self.entries_drained.load(Ordering::Relaxed),
            entries_lost: self.entries_lost.load(Ordering::Relaxed),
            rate_dropped: self.rate_dropped.load(Ordering::Relaxed),
            removed_func_skips: self.removed_func_skips.load(Ordering::Relaxed),
            output_bytes: self.output_bytes.load(Ordering::Relaxed),
            expr_watch_errors: self.expr_watch_errors.load(Ordering::Relaxed),
            uptime_seconds: self.uptime_seconds(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub events_emitted: u64,
    pub entries_drained: u64,
    pub entries_lost: u64,
    pub rate_dropped: u64,
    pub removed_func_skips: u64,
    pub output_bytes: u64,
    pub expr_watch_errors: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        m.add_emitted(5);
        m.add_drained(7);
        m.add_lost(2);
        m.inc_rate_dropped();
        let snap = m.snapshot();
        assert_eq!(snap.events_emitted, 5);
        assert_eq!(snap.entries_drained, 7);
        assert_eq!(snap.entries_lost, 2);
        assert_eq!(snap.rate_dropped, 1);
    }

    #[test]
    fn output_bytes_reports_running_total() {
        let m = Metrics::new();
        assert_eq!(m.add_output_bytes(10), 10);
        assert_eq!(m.add_output_bytes(5), 15);
    }
}
