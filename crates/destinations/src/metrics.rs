//! Queue metrics for a queued destination

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct DestMetrics {
    queue_len: AtomicUsize,
    /// Patch sets written by the sink
    write_count: AtomicU64,
    failure_count: AtomicU64,
    /// Patch sets dropped on a full queue
    dropped_count: AtomicU64,
    pixels_written: AtomicU64,
}

impl DestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_len(&self) -> usize {
        self.queue_len.load(Ordering::Relaxed)
    }

    pub fn set_queue_len(&self, len: usize) {
        self.queue_len.store(len, Ordering::Relaxed);
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    pub fn inc_write_count(&self, pixels: usize) {
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.pixels_written.fetch_add(pixels as u64, Ordering::Relaxed);
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn inc_failure_count(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    pub fn inc_dropped_count(&self) {
        self.dropped_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pixels_written(&self) -> u64 {
        self.pixels_written.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queue_len: self.queue_len(),
            write_count: self.write_count(),
            failure_count: self.failure_count(),
            dropped_count: self.dropped_count(),
            pixels_written: self.pixels_written(),
        }
    }
}

/// Point-in-time copy for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub queue_len: usize,
    pub write_count: u64,
    pub failure_count: u64,
    pub dropped_count: u64,
    pub pixels_written: u64,
}
