//! Per output cycle bookkeeping, consumed by observability

use serde::{Deserialize, Serialize};

use crate::DirtyBox;

/// Summary of one converter output cycle (zones flushed to destinations)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputReport {
    /// Returns accepted since the previous cycle
    pub returns_ingested: u32,
    /// Returns dropped (stopped, tables invalid, out of range)
    pub returns_dropped: u32,
    /// Patches handed to destinations
    pub patches: u32,
    pub pixels: u64,
    /// Union of flushed zones
    pub dirty: Option<DirtyBox>,
    /// Wall time spent producing the patches
    pub elapsed_ms: f64,
}
