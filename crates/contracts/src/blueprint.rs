//! ScBlueprint - Config Loader 输出
//!
//! 描述完整的扫描变换配置：显示目标、扫描变换参数、网络、组播、模拟雷达源、输出路由。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

use crate::{FadeType, ScType, SweepLine, View, WinGeom, DEFAULT_FADING_INTERVAL_MS};

/// 配置版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConfigVersion {
    #[default]
    V1,
}

/// 完整的扫描变换配置蓝图
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ScBlueprint {
    /// 配置版本
    #[serde(default)]
    pub version: ConfigVersion,

    /// 位图显示目标
    #[validate(nested)]
    pub display: DisplayConfig,

    /// 扫描变换参数
    #[validate(nested)]
    pub scan: ScanConfig,

    /// 点对点网络设置
    #[serde(default)]
    #[validate(nested)]
    pub net: NetConfig,

    /// 组播设置 (可选)
    #[serde(default)]
    pub mcast: Option<McastConfig>,

    /// 模拟雷达源
    #[serde(default)]
    #[validate(nested)]
    pub feed: FeedConfig,

    /// 额外输出路由
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
}

/// 位图类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitmapType {
    /// 8 位颜色索引
    #[default]
    Index8,
    /// 32 位 RGBA
    Rgba32,
}

impl BitmapType {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Index8 => 1,
            Self::Rgba32 => 4,
        }
    }
}

/// 显示目标配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DisplayConfig {
    /// 最大宽度 (像素)
    #[validate(range(min = 1))]
    pub max_width: u16,

    /// 最大高度 (像素)
    #[validate(range(min = 1))]
    pub max_height: u16,

    #[serde(default)]
    pub bitmap_type: BitmapType,

    /// 衰减步进间隔 (毫秒)
    #[serde(default = "default_fade_interval_ms")]
    #[validate(range(min = 1))]
    pub fade_interval_ms: u64,

    /// 退出时写出的 PNG 快照路径
    #[serde(default)]
    pub snapshot_path: Option<String>,
}

fn default_fade_interval_ms() -> u64 {
    DEFAULT_FADING_INTERVAL_MS
}

/// 衰减设置
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
pub struct FadeSettings {
    #[serde(default)]
    pub fade_type: FadeType,

    /// 实时模式: 完全衰减所需圈数; 扫描模式: 每次扫过衰减百分比
    #[serde(default = "default_fade_rate")]
    #[validate(range(min = 1))]
    pub rate: u16,
}

fn default_fade_rate() -> u16 {
    4
}

impl Default for FadeSettings {
    fn default() -> Self {
        Self {
            fade_type: FadeType::RealTime,
            rate: default_fade_rate(),
        }
    }
}

/// 扫描变换参数
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ScanConfig {
    #[serde(default = "default_sc_type")]
    pub sc_type: ScType,

    /// PIM 方位单元数 (2 的幂)
    #[serde(default = "default_pim_azimuths")]
    #[validate(range(min = 64, max = 16384))]
    pub pim_azimuths: u16,

    /// PIM 距离单元数
    #[serde(default = "default_pim_samples")]
    #[validate(range(min = 16, max = 8192))]
    pub pim_samples: u16,

    /// 区域输出间隔 (毫秒)
    #[serde(default = "default_output_interval_ms")]
    #[validate(range(min = 1))]
    pub output_interval_ms: u64,

    /// 区域边长 (像素)
    #[serde(default = "default_zone_size")]
    #[validate(range(min = 4, max = 256))]
    pub zone_size: u16,

    /// 后台线程重算映射表
    #[serde(default)]
    pub defer_calcs: bool,

    #[serde(default)]
    pub clear_value: u8,

    #[serde(default = "default_scale_factor")]
    #[validate(range(min = 1, max = 4))]
    pub scale_factor: u8,

    pub window: WinGeom,

    #[serde(default)]
    pub view: View,

    /// 雷达世界坐标 (米)
    #[serde(default)]
    pub radar_position: [f32; 2],

    #[serde(default)]
    #[validate(nested)]
    pub fade: FadeSettings,

    /// 尾迹目标的衰减设置；存在时启用第二个目标
    #[serde(default)]
    pub trails: Option<FadeSettings>,

    #[serde(default)]
    pub sweep_line: SweepLine,

    #[serde(default)]
    #[validate(nested)]
    pub ssc: SscConfig,

    #[serde(default)]
    #[validate(nested)]
    pub true_trails: TrueTrailsConfig,

    /// 斜距修正高度 (米)
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub slant_height_m: f32,

    #[serde(default)]
    pub anticlockwise: bool,
}

fn default_sc_type() -> ScType {
    ScType::Ppi
}

fn default_pim_azimuths() -> u16 {
    2048
}

fn default_pim_samples() -> u16 {
    1024
}

fn default_output_interval_ms() -> u64 {
    40
}

fn default_zone_size() -> u16 {
    32
}

fn default_scale_factor() -> u8 {
    1
}

/// 扫描间相关 (SSC) 参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct SscConfig {
    #[serde(default)]
    pub enabled: bool,

    /// 参与相关的扫描数
    #[serde(default = "default_ssc_window")]
    #[validate(range(min = 1, max = 8))]
    pub window_length: u8,

    /// 窗口内命中数阈值
    #[serde(default = "default_ssc_threshold")]
    #[validate(range(min = 1, max = 8))]
    pub window_threshold: u8,

    /// 瞬时电平阈值
    #[serde(default = "default_ssc_instant")]
    pub instant_threshold: u8,

    /// 量化增益 (16 = 1.0)
    #[serde(default = "default_ssc_gain")]
    pub quantisation_gain: u8,

    /// 相关输出增益 (16 = 1.0)
    #[serde(default = "default_ssc_gain")]
    pub correlation_gain: u8,
}

fn default_ssc_window() -> u8 {
    4
}

fn default_ssc_threshold() -> u8 {
    2
}

fn default_ssc_instant() -> u8 {
    255
}

fn default_ssc_gain() -> u8 {
    16
}

impl Default for SscConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_length: default_ssc_window(),
            window_threshold: default_ssc_threshold(),
            instant_threshold: default_ssc_instant(),
            quantisation_gain: default_ssc_gain(),
            correlation_gain: default_ssc_gain(),
        }
    }
}

/// 真尾迹配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TrueTrailsConfig {
    /// 位图边长 (像素)
    #[serde(default = "default_trail_dimension")]
    #[validate(range(min = 16, max = 4096))]
    pub dimension: u16,

    /// 每个位图覆盖的半径 (米), 最多 4 个
    #[serde(default)]
    #[validate(length(max = 4))]
    pub ranges: Vec<f32>,
}

fn default_trail_dimension() -> u16 {
    512
}

impl Default for TrueTrailsConfig {
    fn default() -> Self {
        Self {
            dimension: default_trail_dimension(),
            ranges: Vec::new(),
        }
    }
}

/// 点对点网络配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NetConfig {
    /// 服务器地址
    #[serde(default = "default_server_host")]
    pub server_host: String,

    /// TCP 命令端口
    #[serde(default = "default_command_port")]
    pub command_port: u16,

    /// 客户端 UDP 补丁端口
    #[serde(default = "default_display_port")]
    pub display_port: u16,

    /// 心跳组播地址
    #[serde(default = "default_heartbeat_group")]
    pub heartbeat_group: String,

    #[serde(default = "default_heartbeat_port")]
    pub heartbeat_port: u16,

    #[serde(default = "default_heartbeat_interval_ms")]
    #[validate(range(min = 10))]
    pub heartbeat_interval_ms: u64,

    /// 补丁确认超时
    #[serde(default = "default_ack_timeout_ms")]
    #[validate(range(min = 1))]
    pub ack_timeout_ms: u64,

    #[serde(default = "default_max_retransmits")]
    pub max_retransmits: u8,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_command_timeout_ms")]
    #[validate(range(min = 1))]
    pub command_timeout_ms: u64,

    /// 命令循环 select 超时
    #[serde(default = "default_loop_timeout_ms")]
    #[validate(range(min = 1))]
    pub loop_timeout_ms: u64,

    /// 服务器最大窗口数
    #[serde(default = "default_max_windows")]
    #[validate(range(min = 1, max = 12))]
    pub max_windows: usize,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_command_port() -> u16 {
    4377
}

fn default_display_port() -> u16 {
    4378
}

fn default_heartbeat_group() -> String {
    "239.192.43.77".to_string()
}

fn default_heartbeat_port() -> u16 {
    4377
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_ack_timeout_ms() -> u64 {
    200
}

fn default_max_retransmits() -> u8 {
    3
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_command_timeout_ms() -> u64 {
    1000
}

fn default_loop_timeout_ms() -> u64 {
    100
}

fn default_max_windows() -> usize {
    12
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            server_host: default_server_host(),
            command_port: default_command_port(),
            display_port: default_display_port(),
            heartbeat_group: default_heartbeat_group(),
            heartbeat_port: default_heartbeat_port(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_retransmits: default_max_retransmits(),
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            loop_timeout_ms: default_loop_timeout_ms(),
            max_windows: default_max_windows(),
        }
    }
}

/// 组播配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McastConfig {
    #[serde(default = "default_mcast_group")]
    pub group: String,

    #[serde(default = "default_display_port")]
    pub port: u16,

    /// 本地接口地址
    #[serde(default = "default_mcast_interface")]
    pub interface: String,

    /// 窗口 ID，0 表示接受全部
    #[serde(default = "default_window_id")]
    pub window_id: u16,

    /// 配置重播间隔 (毫秒)
    #[serde(default = "default_config_interval_ms")]
    pub config_interval_ms: u64,
}

fn default_mcast_group() -> String {
    "239.192.43.78".to_string()
}

fn default_mcast_interface() -> String {
    "0.0.0.0".to_string()
}

fn default_window_id() -> u16 {
    1
}

fn default_config_interval_ms() -> u64 {
    1000
}

/// 模拟目标
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TargetConfig {
    pub range_m: f32,
    pub bearing_deg: f32,
    /// 径向/切向尺寸 (米)
    #[serde(default = "default_target_extent")]
    pub extent_m: f32,
    #[serde(default = "default_target_level")]
    pub level: u8,
    /// 航速 (米/秒) 和航向 (度)
    #[serde(default)]
    pub speed_mps: f32,
    #[serde(default)]
    pub course_deg: f32,
}

fn default_target_extent() -> f32 {
    150.0
}

fn default_target_level() -> u8 {
    220
}

/// 模拟雷达源配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FeedConfig {
    /// 天线转速 (转/分)
    #[serde(default = "default_rpm")]
    #[validate(range(min = 0.1, max = 240.0))]
    pub rpm: f32,

    /// 每圈回波数
    #[serde(default = "default_pim_azimuths")]
    #[validate(range(min = 16))]
    pub azimuths_per_rev: u16,

    /// 每个回波的采样数
    #[serde(default = "default_pim_samples")]
    #[validate(range(min = 1))]
    pub samples: u16,

    #[serde(default = "default_end_range")]
    #[validate(range(min = 1.0))]
    pub end_range_m: f32,

    /// 噪声上限
    #[serde(default)]
    pub noise_level: u8,

    #[serde(default)]
    pub targets: Vec<TargetConfig>,

    /// 每批回波数
    #[serde(default = "default_batch_azimuths")]
    #[validate(range(min = 1))]
    pub batch_azimuths: u16,

    /// 队列容量
    #[serde(default = "default_queue_capacity")]
    #[validate(range(min = 1))]
    pub queue_capacity: usize,
}

fn default_rpm() -> f32 {
    24.0
}

fn default_end_range() -> f32 {
    10_000.0
}

fn default_batch_azimuths() -> u16 {
    16
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            rpm: default_rpm(),
            azimuths_per_rev: default_pim_azimuths(),
            samples: default_pim_samples(),
            end_range_m: default_end_range(),
            noise_level: 0,
            targets: Vec::new(),
            batch_azimuths: default_batch_azimuths(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Sink 输出配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Sink 名称
    pub name: String,

    /// Sink 类型
    pub sink_type: SinkType,

    /// 队列容量
    #[serde(default = "default_sink_queue_capacity")]
    pub queue_capacity: usize,

    /// 类型特定参数
    #[serde(default)]
    pub params: HashMap<String, String>,
}

fn default_sink_queue_capacity() -> usize {
    100
}

/// Sink 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkType {
    /// 日志输出
    Log,
    /// 文件输出 (补丁记录)
    File,
}

impl ScBlueprint {
    /// Minimal in-memory blueprint, used by tests and `scconv simulate`
    pub fn with_window(max_width: u16, max_height: u16, window: WinGeom) -> Self {
        Self {
            version: ConfigVersion::V1,
            display: DisplayConfig {
                max_width,
                max_height,
                bitmap_type: BitmapType::Index8,
                fade_interval_ms: default_fade_interval_ms(),
                snapshot_path: None,
            },
            scan: ScanConfig {
                sc_type: default_sc_type(),
                pim_azimuths: default_pim_azimuths(),
                pim_samples: default_pim_samples(),
                output_interval_ms: default_output_interval_ms(),
                zone_size: default_zone_size(),
                defer_calcs: false,
                clear_value: 0,
                scale_factor: default_scale_factor(),
                window,
                view: View::default(),
                radar_position: [0.0, 0.0],
                fade: FadeSettings::default(),
                trails: None,
                sweep_line: SweepLine::default(),
                ssc: SscConfig::default(),
                true_trails: TrueTrailsConfig::default(),
                slant_height_m: 0.0,
                anticlockwise: false,
            },
            net: NetConfig::default(),
            mcast: None,
            feed: FeedConfig::default(),
            sinks: Vec::new(),
        }
    }
}
