//! DestHandle - a patch sink behind a bounded queue and worker task
//!
//! The converter calls `patch_set` from its own thread; the handle never
//! blocks it. A full queue drops the set and counts it.

use std::sync::{Arc, Mutex, PoisonError};

use contracts::{
    FadeType, Patch, PatchFormat, PatchSet, PatchSink, Rgb, ScControl, ScDest, ScError, ScResult,
    ScState, View, WinGeom,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::metrics::DestMetrics;

pub struct DestHandle {
    name: String,
    max_size: (u16, u16),
    win: Mutex<WinGeom>,
    tx: Mutex<Option<mpsc::Sender<PatchSet>>>,
    metrics: Arc<DestMetrics>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DestHandle {
    /// Spawn the worker on the current tokio runtime
    pub fn spawn<S: PatchSink + Send + 'static>(
        sink: S,
        queue_capacity: usize,
        max_size: (u16, u16),
    ) -> Self {
        let name = sink.name().to_string();
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let metrics = Arc::new(DestMetrics::new());

        let worker_metrics = Arc::clone(&metrics);
        let worker_name = name.clone();
        let worker_handle = tokio::spawn(async move {
            sink_worker(sink, rx, worker_metrics, worker_name).await;
        });

        Self {
            name,
            max_size,
            win: Mutex::new(WinGeom::new(0, 0, max_size.0, max_size.1)),
            tx: Mutex::new(Some(tx)),
            metrics,
            worker_handle: Mutex::new(Some(worker_handle)),
        }
    }

    pub fn metrics(&self) -> &Arc<DestMetrics> {
        &self.metrics
    }

    /// Queue a set without waiting; false when dropped
    pub fn try_send(&self, patches: PatchSet) -> bool {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = tx.as_ref() else {
            return false;
        };
        match tx.try_send(patches) {
            Ok(()) => {
                let depth = tx.max_capacity() - tx.capacity();
                self.metrics.set_queue_len(depth);
                observability::record_queue_depth(&self.name, depth);
                true
            }
            Err(mpsc::error::TrySendError::Full(set)) => {
                self.metrics.inc_dropped_count();
                warn!(dest = %self.name, patches = set.len(), "queue full, patch set dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(dest = %self.name, "sink worker closed unexpectedly");
                false
            }
        }
    }

    /// Close the queue and wait for the worker to drain it
    #[instrument(name = "dest_handle_shutdown", skip(self), fields(dest = %self.name))]
    pub async fn shutdown(&self) {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let worker = self
            .worker_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(dest = %self.name, error = ?e, "worker task panicked");
            }
        }
        debug!(dest = %self.name, "DestHandle shutdown complete");
    }
}

#[instrument(name = "dest_worker_loop", skip(sink, rx, metrics), fields(dest = %name))]
async fn sink_worker<S: PatchSink>(
    mut sink: S,
    mut rx: mpsc::Receiver<PatchSet>,
    metrics: Arc<DestMetrics>,
    name: String,
) {
    debug!("sink worker started");
    while let Some(patches) = rx.recv().await {
        metrics.set_queue_len(rx.len());
        match sink.write(&patches).await {
            Ok(()) => metrics.inc_write_count(patches.pixel_count()),
            Err(e) => {
                metrics.inc_failure_count();
                error!(dest = %name, error = %e, "patch write failed");
            }
        }
    }
    if let Err(e) = sink.flush().await {
        error!(dest = %name, error = %e, "flush failed on shutdown");
    }
    if let Err(e) = sink.close().await {
        error!(dest = %name, error = %e, "close failed on shutdown");
    }
    debug!("sink worker stopped");
}

impl ScControl for DestHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_win_pos(&self, x: i16, y: i16) -> ScResult<()> {
        let mut win = self.win.lock().unwrap_or_else(PoisonError::into_inner);
        win.x = x;
        win.y = y;
        Ok(())
    }

    fn set_win_geom(&self, geom: WinGeom) -> ScResult<()> {
        geom.validate(self.max_size.0, self.max_size.1)?;
        *self.win.lock().unwrap_or_else(PoisonError::into_inner) = geom;
        Ok(())
    }

    fn set_fade(&self, _rid: u8, _fade_type: FadeType, _rate: u16) -> ScResult<()> {
        // sinks record converter output as is
        Ok(())
    }

    fn set_view(&self, view: View) -> ScResult<()> {
        view.validate()
    }

    fn pan_view(&self, _x: f32, _y: f32, _clear_trails: bool) -> ScResult<()> {
        Ok(())
    }

    fn set_radar_colour(&self, _rid: u8, _colour: Rgb) -> ScResult<()> {
        Err(ScError::not_supported("set_radar_colour", self.name.clone()))
    }

    fn set_radar_bright(&self, _rid: u8, _bright: u8) -> ScResult<()> {
        Err(ScError::not_supported("set_radar_bright", self.name.clone()))
    }

    fn set_radar_lut(&self, _rid: u8, _lut: &[u8; 256]) -> ScResult<()> {
        Err(ScError::not_supported("set_radar_lut", self.name.clone()))
    }

    fn show_radar(&self, _rid: u8, _state: ScState) -> ScResult<()> {
        Ok(())
    }

    fn patch_set(&self, patches: &PatchSet) -> ScResult<()> {
        if self.try_send(patches.clone()) {
            Ok(())
        } else {
            Err(ScError::not_ready(format!("{} queue full or closed", self.name)))
        }
    }

    fn set_source(&self, _source_id: u32, _arg1: u32, _arg2: u32) -> ScResult<()> {
        Ok(())
    }

    fn set_radar_position(&self, _x: f32, _y: f32, _clear_trails: bool) -> ScResult<()> {
        Ok(())
    }
}

impl ScDest for DestHandle {
    fn max_size(&self) -> (u16, u16) {
        self.max_size
    }

    /// Queued as one filled patch over the window
    fn clear(&self, value: u8) -> ScResult<()> {
        let win = *self.win.lock().unwrap_or_else(PoisonError::into_inner);
        let mut set = PatchSet::new(PatchFormat::Rle8);
        set.push(Patch::filled(0, 0, win.w, win.h, value)?);
        self.try_send(set);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::time::{sleep, Duration};

    struct MockSink {
        name: String,
        write_count: Arc<AtomicU64>,
        should_fail: bool,
        delay_ms: u64,
    }

    impl PatchSink for MockSink {
        fn name(&self) -> &str {
            &self.name
        }

        async fn write(&mut self, _patches: &PatchSet) -> ScResult<()> {
            if self.delay_ms > 0 {
                sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.should_fail {
                return Err(ScError::Other("mock failure".into()));
            }
            self.write_count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn flush(&mut self) -> ScResult<()> {
            Ok(())
        }

        async fn close(&mut self) -> ScResult<()> {
            Ok(())
        }
    }

    fn mock(name: &str, delay_ms: u64, should_fail: bool) -> (MockSink, Arc<AtomicU64>) {
        let write_count = Arc::new(AtomicU64::new(0));
        let sink = MockSink {
            name: name.to_string(),
            write_count: Arc::clone(&write_count),
            should_fail,
            delay_ms,
        };
        (sink, write_count)
    }

    fn one_patch() -> PatchSet {
        PatchSet {
            format: PatchFormat::Raw8,
            patches: vec![Patch::filled(0, 0, 4, 4, 1).unwrap()],
        }
    }

    #[tokio::test]
    async fn writes_reach_sink() {
        let (sink, writes) = mock("ok", 0, false);
        let handle = DestHandle::spawn(sink, 10, (64, 64));
        for _ in 0..5 {
            handle.patch_set(&one_patch()).unwrap();
        }
        handle.shutdown().await;
        assert_eq!(writes.load(Ordering::Relaxed), 5);
        assert_eq!(handle.metrics().pixels_written(), 80);
    }

    #[tokio::test]
    async fn full_queue_drops() {
        let (sink, _writes) = mock("slow", 100, false);
        let handle = DestHandle::spawn(sink, 2, (64, 64));
        for _ in 0..10 {
            handle.try_send(one_patch());
        }
        assert!(handle.metrics().dropped_count() > 0);
        handle.shutdown().await;
        assert!(!handle.try_send(one_patch()));
    }

    #[tokio::test]
    async fn failures_are_isolated() {
        let (sink, _writes) = mock("failing", 0, true);
        let handle = DestHandle::spawn(sink, 10, (64, 64));
        for _ in 0..3 {
            handle.try_send(one_patch());
        }
        sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.metrics().failure_count(), 3);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn colour_calls_not_supported() {
        let (sink, _writes) = mock("plain", 0, false);
        let handle = DestHandle::spawn(sink, 4, (32, 32));
        assert!(handle
            .set_radar_colour(0, Rgb::default())
            .unwrap_err()
            .is_not_supported());
        assert!(handle.set_win_geom(WinGeom::new(0, 0, 33, 8)).is_err());
        handle.shutdown().await;
    }
}
