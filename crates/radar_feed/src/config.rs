//! Backpressure configuration and metrics

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// What to discard when the feed queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropPolicy {
    /// Keep the queue, discard the incoming batch
    DropNewest,
    /// Discard the oldest queued batch to make room
    #[default]
    DropOldest,
}

#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    pub channel_capacity: usize,
    pub drop_policy: DropPolicy,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            drop_policy: DropPolicy::DropOldest,
        }
    }
}

impl BackpressureConfig {
    pub fn new(channel_capacity: usize, drop_policy: DropPolicy) -> Self {
        Self {
            channel_capacity: channel_capacity.max(1),
            drop_policy,
        }
    }
}

/// Feed counters, shared by every registered source
#[derive(Debug, Default)]
pub struct FeedMetrics {
    pub batches_received: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub returns_received: AtomicU64,
    pub queue_len: AtomicUsize,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self, returns: usize) {
        self.batches_received.fetch_add(1, Ordering::Relaxed);
        self.returns_received
            .fetch_add(returns as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("scconv_feed_batches_dropped_total").increment(1);
    }

    pub fn update_queue_len(&self, len: usize) {
        self.queue_len.store(len, Ordering::Relaxed);
        observability::record_queue_depth("feed", len);
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            batches_received: self.batches_received.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            returns_received: self.returns_received.load(Ordering::Relaxed),
            queue_len: self.queue_len.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedSnapshot {
    pub batches_received: u64,
    pub batches_dropped: u64,
    pub returns_received: u64,
    pub queue_len: usize,
}
