//! # Destinations
//!
//! 扫描转换结果的目的地。
//!
//! - `BitmapDest`: 可加锁的位图，带脏区与淡出
//! - `DestHandle`: 有界队列 + worker，慢 sink 不阻塞转换线程
//! - `FanoutDest`: 主目的地 + 配置中的附加 sinks
//! - `TraceDest`: 调试日志

pub mod bitmap;
pub mod fanout;
pub mod handle;
pub mod metrics;
pub mod sinks;
pub mod trace;

pub use bitmap::{set_global_update_callback, BitmapDest, BitmapGuard};
pub use fanout::{create_dest_handle, FanoutDest};
pub use handle::DestHandle;
pub use metrics::{DestMetrics, MetricsSnapshot};
pub use sinks::{read_recording, LogSink, PatchRecorder, RecordedPatchSet};
pub use trace::TraceDest;
