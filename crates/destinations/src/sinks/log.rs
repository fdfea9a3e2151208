//! LogSink - logs a summary of every patch set

use contracts::{PatchSet, PatchSink, ScResult};
use tracing::{info, instrument};

pub struct LogSink {
    name: String,
    sets: u64,
}

impl LogSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sets: 0,
        }
    }

    fn log_summary(&self, patches: &PatchSet) {
        let (mut x0, mut y0, mut x1, mut y1) = (u16::MAX, u16::MAX, 0u16, 0u16);
        for patch in &patches.patches {
            x0 = x0.min(patch.x);
            y0 = y0.min(patch.y);
            x1 = x1.max(patch.x + patch.w);
            y1 = y1.max(patch.y + patch.h);
        }
        info!(
            sink = %self.name,
            seq = self.sets,
            format = ?patches.format,
            patches = patches.len(),
            pixels = patches.pixel_count(),
            bounds = ?(x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0)),
            "patch set"
        );
    }
}

impl PatchSink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(name = "log_sink_write", skip(self, patches), fields(sink = %self.name))]
    async fn write(&mut self, patches: &PatchSet) -> ScResult<()> {
        self.sets += 1;
        self.log_summary(patches);
        Ok(())
    }

    async fn flush(&mut self) -> ScResult<()> {
        Ok(())
    }

    #[instrument(name = "log_sink_close", skip(self))]
    async fn close(&mut self) -> ScResult<()> {
        info!(sink = %self.name, sets = self.sets, "LogSink closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{Patch, PatchFormat};

    #[tokio::test]
    async fn counts_sets() {
        let mut sink = LogSink::new("log");
        let set = PatchSet {
            format: PatchFormat::Rle8,
            patches: vec![Patch::filled(1, 2, 3, 4, 9).unwrap()],
        };
        sink.write(&set).await.unwrap();
        sink.write(&set).await.unwrap();
        assert_eq!(sink.sets, 2);
        assert_eq!(sink.name(), "log");
    }
}
