// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

#[repr(C, align(64))]
pub struct ServerMetrics {
    pub live_conns: AtomicUsize,
    pub accepted: AtomicUsize,
    pub rejected_busy: AtomicUsize,
    pub req_count: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    /// Times a worker found another task already servicing its connection.
    /// Stays zero as long as one-shot re-arming holds.
    pub overlapping_tasks: AtomicUsize,
}

/// Point-in-time copy of [`ServerMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub live_conns: usize,
    pub accepted: usize,
    pub rejected_busy: usize,
    pub req_count: usize,
    pub bytes_sent: usize,
    pub overlapping_tasks: usize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            live_conns: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
            rejected_busy: AtomicUsize::new(0),
            req_count: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            overlapping_tasks: AtomicUsize::new(0),
        }
    }

    pub fn live(&self) -> usize {
        self.live_conns.load(Ordering::Acquire)
    }

    pub fn inc_conn(&self) {
        self.live_conns.fetch_add(1, Ordering::AcqRel);
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.live_conns.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn inc_busy(&self) {
        self.rejected_busy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_overlap(&self) {
        self.overlapping_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            live_conns: self.live_conns.load(Ordering::Acquire),
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected_busy: self.rejected_busy.load(Ordering::Relaxed),
            req_count: self.req_count.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            overlapping_tasks: self.overlapping_tasks.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
