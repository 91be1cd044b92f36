use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Process-wide upstream request counters.
pub struct RequestStats {
    req_count: AtomicU64,
    req_nanos: AtomicU64,
}

impl RequestStats {
    pub const fn new() -> Self {
        Self {
            req_count: AtomicU64::new(0),
            req_nanos: AtomicU64::new(0),
        }
    }

    pub fn record(&self, elapsed: Duration) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
        self.req_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, Duration) {
        let count = self.req_count.load(Ordering::Relaxed);
        let total = Duration::from_nanos(self.req_nanos.load(Ordering::Relaxed));
        (count, total)
    }

    pub fn reset(&self) {
        self.req_count.store(0, Ordering::Relaxed);
        self.req_nanos.store(0, Ordering::Relaxed);
    }
}

impl Default for RequestStats {
    fn default() -> Self {
        Self::new()
    }
}

pub static UPSTREAM_STATS: RequestStats = RequestStats::new();

pub fn record_upstream_request(elapsed: Duration) {
    UPSTREAM_STATS.record(elapsed);
}

pub fn snapshot() -> (u64, Duration) {
    UPSTREAM_STATS.snapshot()
}
