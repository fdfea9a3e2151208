//! # Radar Feed
//!
//! 雷达回波输入。
//!
//! - `SimulatedRadar`: 按转速产生回波的模拟天线（噪声 + 运动目标）
//! - `FeedPipeline`: 多个 `ReturnSource` 汇入一个有界队列，满时按 `DropPolicy` 丢弃
//! - `forward`: 把队列中的批次交给扫描转换回调
//!
//! ```ignore
//! let mut pipeline = FeedPipeline::with_config(BackpressureConfig::new(64, DropPolicy::DropOldest));
//! pipeline.register_source(Box::new(SimulatedRadar::new("sim", blueprint.feed.clone())));
//! let rx = pipeline.take_receiver().unwrap();
//! pipeline.start_all();
//! tokio::spawn(forward(rx, pipeline.metrics(), server.feeder()));
//! ```

mod config;
mod pipeline;
mod simulated;

pub use config::{BackpressureConfig, DropPolicy, FeedMetrics, FeedSnapshot};
pub use pipeline::{forward, Batch, FeedPipeline};
pub use simulated::{SimulatedRadar, SweepModel};
