//! Radar return sources and patch sinks
//!
//! `ReturnSource` decouples the converter from where returns come from
//! (simulated antenna, recorded file, network). `PatchSink` is the async
//! output side used by queued destinations.

use std::sync::Arc;

use crate::{PatchSet, Return, ScResult};

/// Return batch callback type
///
/// A batch is a run of consecutive azimuths, delivered in antenna order.
pub type ReturnCallback = Arc<dyn Fn(Vec<Return>) + Send + Sync>;

/// Radar return source
pub trait ReturnSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Register the callback and start producing; repeated calls are idempotent
    fn listen(&self, callback: ReturnCallback);

    fn stop(&self);

    fn is_listening(&self) -> bool;
}

/// Async patch output
#[trait_variant::make(PatchSink: Send)]
pub trait LocalPatchSink {
    /// Sink name (used for logging/metrics)
    fn name(&self) -> &str;

    /// Write one patch set
    async fn write(&mut self, patches: &PatchSet) -> ScResult<()>;

    async fn flush(&mut self) -> ScResult<()>;

    async fn close(&mut self) -> ScResult<()>;
}
