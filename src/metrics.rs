// src/metrics.rs
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-pool counters, updated with relaxed atomics on the hot path.
#[derive(Default)]
pub struct PoolStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    active: AtomicU64,
    closed: AtomicU64,
    errored: AtomicU64,
    timed_out: AtomicU64,
    bytes_received: AtomicU64,
}

impl PoolStats {
    #[inline]
    pub(crate) fn inc_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn dec_active(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_errored(&self) {
        self.errored.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn inc_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub active: u64,
    pub closed: u64,
    pub errored: u64,
    pub timed_out: u64,
    pub bytes_received: u64,
}
