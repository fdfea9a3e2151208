//! 扫描变换指标收集模块
//!
//! 基于 OutputReport 收集和统计扫描变换、目标与网络传输的运行指标。

use contracts::OutputReport;
use metrics::{counter, gauge, histogram};

/// 从 OutputReport 记录指标
///
/// 每个输出周期调用一次。
///
/// # Example
///
/// ```ignore
/// use observability::metrics::record_output_metrics;
///
/// let report = converter.flush()?;
/// record_output_metrics("live", &report);
/// ```
pub fn record_output_metrics(converter: &str, report: &OutputReport) {
    // 输出周期计数
    counter!("scconv_output_cycles_total", "converter" => converter.to_string()).increment(1);

    counter!("scconv_returns_total", "converter" => converter.to_string())
        .increment(report.returns_ingested as u64);

    if report.returns_dropped > 0 {
        counter!("scconv_returns_dropped_total", "converter" => converter.to_string())
            .increment(report.returns_dropped as u64);
    }

    counter!("scconv_patches_total", "converter" => converter.to_string())
        .increment(report.patches as u64);
    counter!("scconv_pixels_total", "converter" => converter.to_string()).increment(report.pixels);

    histogram!("scconv_output_ms", "converter" => converter.to_string()).record(report.elapsed_ms);

    // 脏区密度
    if let Some(dirty) = report.dirty {
        gauge!("scconv_dirty_density", "converter" => converter.to_string())
            .set(dirty.density as f64);
    }
}

/// 记录一次位图衰减步进
pub fn record_fade_step(dest: &str) {
    counter!("scconv_fade_steps_total", "dest" => dest.to_string()).increment(1);
}

/// 记录补丁发送结果
pub fn record_patch_dispatched(dest: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "scconv_patch_sets_dispatched_total",
        "dest" => dest.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// 记录网络补丁包重传
pub fn record_retransmit(window_id: u16) {
    counter!("scconv_retransmits_total", "window" => window_id.to_string()).increment(1);
}

/// 记录补丁确认往返时间
pub fn record_ack_rtt_ms(window_id: u16, rtt_ms: f64) {
    histogram!("scconv_ack_rtt_ms", "window" => window_id.to_string()).record(rtt_ms);
}

/// 记录被丢弃的畸形输入 (命令或补丁)
pub fn record_malformed(kind: &str) {
    counter!("scconv_malformed_total", "kind" => kind.to_string()).increment(1);
}

/// 记录心跳
pub fn record_heartbeat(direction: &str, app_id: u16) {
    counter!(
        "scconv_heartbeats_total",
        "direction" => direction.to_string(),
        "app_id" => format!("{app_id:#06x}")
    )
    .increment(1);
}

/// 记录队列深度
pub fn record_queue_depth(name: &str, depth: usize) {
    gauge!("scconv_queue_depth", "name" => name.to_string()).set(depth as f64);
}

/// 扫描变换指标聚合器
///
/// 在内存中聚合指标，便于统计和输出摘要。
#[derive(Debug, Clone, Default)]
pub struct ScanMetricsAggregator {
    /// 输出周期数
    pub total_cycles: u64,

    /// 回波总数
    pub total_returns: u64,

    /// 丢弃回波总数
    pub total_dropped: u64,

    /// 补丁总数
    pub total_patches: u64,

    /// 像素总数
    pub total_pixels: u64,

    /// 输出耗时统计
    pub output_ms: RunningStats,

    /// 脏区密度统计
    pub density: RunningStats,
}

impl ScanMetricsAggregator {
    /// 创建新的聚合器
    pub fn new() -> Self {
        Self::default()
    }

    /// 更新聚合统计
    pub fn update(&mut self, report: &OutputReport) {
        self.total_cycles += 1;
        self.total_returns += report.returns_ingested as u64;
        self.total_dropped += report.returns_dropped as u64;
        self.total_patches += report.patches as u64;
        self.total_pixels += report.pixels;
        self.output_ms.push(report.elapsed_ms);
        if let Some(dirty) = report.dirty {
            self.density.push(dirty.density as f64);
        }
    }

    /// 生成摘要报告
    pub fn summary(&self) -> MetricsSummary {
        let offered = self.total_returns + self.total_dropped;
        MetricsSummary {
            total_cycles: self.total_cycles,
            total_returns: self.total_returns,
            total_dropped: self.total_dropped,
            total_patches: self.total_patches,
            total_pixels: self.total_pixels,
            drop_rate: if offered > 0 {
                self.total_dropped as f64 / offered as f64 * 100.0
            } else {
                0.0
            },
            output_ms: StatsSummary::from(&self.output_ms),
            density: StatsSummary::from(&self.density),
        }
    }

    /// 重置统计
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// 指标摘要
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub total_cycles: u64,
    pub total_returns: u64,
    pub total_dropped: u64,
    pub total_patches: u64,
    pub total_pixels: u64,
    pub drop_rate: f64,
    pub output_ms: StatsSummary,
    pub density: StatsSummary,
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Scan Conversion Summary ===")?;
        writeln!(f, "Output cycles: {}", self.total_cycles)?;
        writeln!(
            f,
            "Returns: {} (dropped {}, {:.2}%)",
            self.total_returns, self.total_dropped, self.drop_rate
        )?;
        writeln!(f, "Patches: {} ({} pixels)", self.total_patches, self.total_pixels)?;
        writeln!(f, "Output time (ms): {}", self.output_ms)?;
        writeln!(f, "Dirty density (%): {}", self.density)?;
        Ok(())
    }
}

/// 统计摘要
#[derive(Debug, Clone, Default)]
pub struct StatsSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl From<&RunningStats> for StatsSummary {
    fn from(stats: &RunningStats) -> Self {
        Self {
            count: stats.count,
            min: stats.min,
            max: stats.max,
            mean: stats.mean(),
            std_dev: stats.std_dev(),
        }
    }
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "min={:.3}, max={:.3}, mean={:.3}, std={:.3} (n={})",
                self.min, self.max, self.mean, self.std_dev, self.count
            )
        }
    }
}

/// 在线统计计算器 (Welford's algorithm)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    /// 添加新值
    pub fn push(&mut self, value: f64) {
        self.count += 1;

        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);

            let delta = value - self.mean;
            self.mean += delta / self.count as f64;
            self.m2 += delta * (value - self.mean);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// 样本方差
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}
