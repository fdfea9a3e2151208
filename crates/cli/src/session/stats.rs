//! Run statistics.

use std::time::Duration;

use contracts::OutputReport;
use observability::ScanMetricsAggregator;

/// Statistics from one run of a long running command
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    /// Return batches handed to converters
    pub batches_fed: u64,

    /// Batches lost to feed backpressure
    pub batches_dropped: u64,

    /// Patch sets the local display applied
    pub sets_applied: u64,

    pub duration: Duration,

    pub scan: ScanMetricsAggregator,
}

impl RunStats {
    pub fn record(&mut self, report: &OutputReport) {
        self.scan.update(report);
    }

    /// Returns converted per second
    pub fn returns_per_sec(&self) -> f64 {
        if self.duration.as_secs_f64() > 0.0 {
            self.scan.total_returns as f64 / self.duration.as_secs_f64()
        } else {
            0.0
        }
    }

    pub fn print_summary(&self) {
        println!("\n╔══════════════════════════════════════════════════════════════╗");
        println!("║                    Scan Conversion Run                       ║");
        println!("╚══════════════════════════════════════════════════════════════╝\n");

        println!("📊 Overview");
        println!("   ├─ Duration: {:.2}s", self.duration.as_secs_f64());
        println!("   ├─ Batches fed: {}", self.batches_fed);
        println!("   ├─ Batches dropped: {}", self.batches_dropped);
        println!("   ├─ Patch sets applied: {}", self.sets_applied);
        println!("   └─ Returns/s: {:.1}", self.returns_per_sec());

        let summary = self.scan.summary();
        println!("\n📈 Converter Output");
        println!("   ├─ Output cycles: {}", summary.total_cycles);
        println!(
            "   ├─ Returns: {} (dropped {}, {:.2}%)",
            summary.total_returns, summary.total_dropped, summary.drop_rate
        );
        println!(
            "   ├─ Patches: {} ({} pixels)",
            summary.total_patches, summary.total_pixels
        );
        println!("   ├─ Output time (ms): {}", summary.output_ms);
        println!("   └─ Dirty density (%): {}", summary.density);
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_from_recorded_reports() {
        let mut stats = RunStats::default();
        assert_eq!(stats.returns_per_sec(), 0.0);
        stats.record(&OutputReport {
            returns_ingested: 300,
            returns_dropped: 0,
            patches: 4,
            pixels: 1200,
            dirty: None,
            elapsed_ms: 0.5,
        });
        stats.duration = Duration::from_secs(3);
        assert_eq!(stats.scan.total_patches, 4);
        assert!((stats.returns_per_sec() - 100.0).abs() < 1e-9);
    }
}
