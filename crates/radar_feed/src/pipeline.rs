//! Feed pipeline: sources into one bounded queue

use std::collections::HashMap;
use std::sync::Arc;

use async_channel::{bounded, Receiver, Sender, TrySendError};
use contracts::{Return, ReturnCallback, ReturnSource};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{BackpressureConfig, DropPolicy, FeedMetrics};

pub type Batch = Vec<Return>;

/// Collects return batches from registered sources into one bounded
/// channel. A full channel drops according to the `DropPolicy`.
pub struct FeedPipeline {
    sources: HashMap<String, Box<dyn ReturnSource>>,
    metrics: Arc<FeedMetrics>,
    tx: Sender<Batch>,
    rx: Option<Receiver<Batch>>,
    // kept to pop the oldest batch under DropOldest
    spare_rx: Receiver<Batch>,
    config: BackpressureConfig,
}

impl FeedPipeline {
    pub fn new(channel_capacity: usize) -> Self {
        Self::with_config(BackpressureConfig::new(channel_capacity, DropPolicy::default()))
    }

    pub fn with_config(config: BackpressureConfig) -> Self {
        let (tx, rx) = bounded(config.channel_capacity.max(1));
        Self {
            sources: HashMap::new(),
            metrics: Arc::new(FeedMetrics::new()),
            tx,
            spare_rx: rx.clone(),
            rx: Some(rx),
            config,
        }
    }

    #[instrument(name = "feed_register_source", skip(self, source), fields(source_id = %source.source_id()))]
    pub fn register_source(&mut self, source: Box<dyn ReturnSource>) {
        let id = source.source_id().to_string();
        debug!("registered return source");
        if let Some(old) = self.sources.insert(id, source) {
            old.stop();
        }
    }

    #[instrument(name = "feed_start_all", skip(self))]
    pub fn start_all(&self) {
        info!(count = self.sources.len(), "starting return sources");
        for (id, source) in &self.sources {
            if source.is_listening() {
                continue;
            }
            let tx = self.tx.clone();
            let spare = self.spare_rx.clone();
            let metrics = Arc::clone(&self.metrics);
            let policy = self.config.drop_policy;
            let source_id = id.clone();
            let callback: ReturnCallback = Arc::new(move |batch| {
                send_batch(&tx, &spare, batch, &metrics, &source_id, policy);
            });
            source.listen(callback);
        }
    }

    #[instrument(name = "feed_stop_all", skip(self))]
    pub fn stop_all(&self) {
        for (id, source) in &self.sources {
            if source.is_listening() {
                debug!(source_id = %id, "stopping source");
                source.stop();
            }
        }
    }

    /// Stop sources and close the queue; receivers drain what is left
    pub fn close(&self) {
        self.stop_all();
        self.tx.close();
    }

    /// Only the first call returns the receiver
    pub fn take_receiver(&mut self) -> Option<Receiver<Batch>> {
        self.rx.take()
    }

    pub fn metrics(&self) -> Arc<FeedMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn is_source_listening(&self, source_id: &str) -> bool {
        self.sources
            .get(source_id)
            .is_some_and(|s| s.is_listening())
    }
}

impl Drop for FeedPipeline {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Hand queued batches to `sink` until the queue closes
pub async fn forward(rx: Receiver<Batch>, metrics: Arc<FeedMetrics>, sink: ReturnCallback) -> u64 {
    let mut delivered = 0u64;
    while let Ok(batch) = rx.recv().await {
        metrics.update_queue_len(rx.len());
        sink(batch);
        delivered += 1;
    }
    debug!(delivered, "feed queue closed");
    delivered
}

pub(crate) fn send_batch(
    tx: &Sender<Batch>,
    spare: &Receiver<Batch>,
    batch: Batch,
    metrics: &FeedMetrics,
    source_id: &str,
    policy: DropPolicy,
) {
    metrics.record_received(batch.len());
    let batch = match tx.try_send(batch) {
        Ok(()) => {
            metrics.update_queue_len(tx.len());
            trace!(source_id, "batch queued");
            return;
        }
        Err(TrySendError::Closed(_)) => {
            debug!(source_id, "feed queue closed, batch discarded");
            return;
        }
        Err(TrySendError::Full(batch)) => batch,
    };
    metrics.record_dropped();
    match policy {
        DropPolicy::DropNewest => trace!(source_id, "queue full, newest batch dropped"),
        DropPolicy::DropOldest => {
            if spare.try_recv().is_ok() {
                trace!(source_id, "queue full, oldest batch dropped");
            }
            if tx.try_send(batch).is_err() {
                // a concurrent producer took the slot
                metrics.record_dropped();
                warn!(source_id, "batch dropped after evicting oldest");
            }
        }
    }
}
