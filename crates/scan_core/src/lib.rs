//! # Scan Core
//!
//! 极坐标雷达回波到笛卡尔像素平面的扫描转换核心。
//!
//! - `ScanConverter`: PIM、像素表、每个目的地的视频平面
//! - 真尾迹、扫描相关 (SSC)、淡出与扫描线
//!
//! ```ignore
//! use scan_core::ScanConverter;
//!
//! let sc = ScanConverter::new("live", &blueprint.scan, (1024, 1024))?;
//! sc.add_dest(RID_LIVE, bitmap.clone(), (FadeType::RealTime, 4))?;
//! sc.new_data(true, &returns, 0, returns.len())?;
//! let report = sc.flush();
//! ```

mod converter;
mod fade;
mod pim;
mod pixel_map;
mod ssc;
mod true_trails;
mod zones;

#[cfg(test)]
mod test_support;

pub use converter::{PointInfo, ScanConverter};
pub use fade::{FadeEngine, WIN_PARAM_REVOLUTION_MS};
pub use pim::Pim;
pub use pixel_map::{fp_index, CellBox, Geometry, PixelEntry, PixelTables, FP_SHIFT};
pub use ssc::Ssc;
pub use true_trails::{TrailSnapshot, TrueTrails};
pub use zones::{Zone, ZoneTable};
