use std::sync::atomic::{AtomicI64, Ordering};

/// Lightweight in-process counters and gauges for the consensus core.
#[derive(Debug, Default)]
pub struct ConsensusMetrics {
    pub current_term: AtomicI64,
    pub failed_elections_since_stable_leader: AtomicI64,
    pub raft_log_truncations: AtomicI64,
    pub follower_memory_pressure_rejections: AtomicI64,
    pub proxy_requests_received: AtomicI64,
    pub proxy_requests_success: AtomicI64,
    pub proxy_requests_unknown_dest: AtomicI64,
    pub proxy_requests_log_read_timeout: AtomicI64,
    pub proxy_requests_hops_exhausted: AtomicI64,
}

impl ConsensusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_term(&self, term: i64) {
        self.current_term.store(term, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicI64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicI64) -> i64 {
        counter.load(Ordering::Relaxed)
    }
}
