//! Simulated radar wired to a converter callback.

use contracts::{FeedConfig, ReturnCallback};
use radar_feed::{forward, BackpressureConfig, DropPolicy, FeedPipeline, SimulatedRadar};
use tokio::task::JoinHandle;
use tracing::info;

/// Running feed; `finish` stops it and returns (fed, dropped) batch counts
pub struct LocalFeed {
    pipeline: FeedPipeline,
    task: JoinHandle<u64>,
}

impl LocalFeed {
    pub fn start(config: &FeedConfig, seed: u64, sink: ReturnCallback) -> anyhow::Result<Self> {
        let mut pipeline = FeedPipeline::with_config(BackpressureConfig::new(
            config.queue_capacity,
            DropPolicy::DropOldest,
        ));
        pipeline.register_source(Box::new(
            SimulatedRadar::new("simulated", config.clone()).with_seed(seed),
        ));
        let rx = pipeline
            .take_receiver()
            .ok_or_else(|| anyhow::anyhow!("feed receiver already taken"))?;
        let task = tokio::spawn(forward(rx, pipeline.metrics(), sink));
        pipeline.start_all();
        info!(
            rpm = config.rpm,
            azimuths = config.azimuths_per_rev,
            targets = config.targets.len(),
            "Simulated feed started"
        );
        Ok(Self { pipeline, task })
    }

    pub fn batches_dropped(&self) -> u64 {
        self.pipeline.metrics().snapshot().batches_dropped
    }

    pub async fn finish(self) -> anyhow::Result<(u64, u64)> {
        let Self { pipeline, task } = self;
        pipeline.close();
        let fed = task.await?;
        Ok((fed, pipeline.metrics().snapshot().batches_dropped))
    }
}
