//! Scan-converter control vocabulary
//!
//! Enumerations and small value types shared by the converter core,
//! destinations and the network transport.

use serde::{Deserialize, Serialize};

use crate::{ScError, ScResult};

/// Default fade step interval in milliseconds
pub const DEFAULT_FADING_INTERVAL_MS: u64 = 100;

/// Maximum number of true-trails bitmaps per converter
pub const MAX_TRUE_TRAILS: usize = 4;

/// Maximum destinations per converter (live + trails)
pub const MAX_DESTINATIONS: usize = 2;

/// Radar id of the live video destination
pub const RID_LIVE: u8 = 0;

/// Radar id of the trails destination
pub const RID_TRAILS: u8 = 1;

/// Argument of `show_radar`
///
/// `Hidden`/`Visible` are an overlay on top of the run state machine and
/// never change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScState {
    StopAndClear,
    Run,
    StopAndFade,
    Hidden,
    Visible,
}

impl ScState {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::StopAndClear => 0,
            Self::Run => 1,
            Self::StopAndFade => 2,
            Self::Hidden => 0xfe,
            Self::Visible => 0xff,
        }
    }

    pub fn from_u8(value: u8) -> ScResult<Self> {
        match value {
            0 => Ok(Self::StopAndClear),
            1 => Ok(Self::Run),
            2 => Ok(Self::StopAndFade),
            0xfe => Ok(Self::Hidden),
            0xff => Ok(Self::Visible),
            other => Err(ScError::invalid("state", format!("unknown state {other}"))),
        }
    }
}

/// Run state per destination/radar id, driven only by `show_radar`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    StoppedCleared,
    Running,
    StoppedFading,
}

impl RunState {
    /// Next run state for an incoming `ScState`; overlay states keep it
    pub fn apply(self, state: ScState) -> Self {
        match state {
            ScState::Run => Self::Running,
            ScState::StopAndFade => match self {
                Self::StoppedCleared => Self::StoppedCleared,
                _ => Self::StoppedFading,
            },
            ScState::StopAndClear => Self::StoppedCleared,
            ScState::Hidden | ScState::Visible => self,
        }
    }
}

/// Fade mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FadeType {
    #[default]
    RealTime,
    Sweep,
    Replace,
}

impl FadeType {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::RealTime => 0,
            Self::Sweep => 1,
            Self::Replace => 2,
        }
    }

    pub fn from_u8(value: u8) -> ScResult<Self> {
        match value {
            0 => Ok(Self::RealTime),
            1 => Ok(Self::Sweep),
            2 => Ok(Self::Replace),
            other => Err(ScError::invalid("fade_type", format!("unknown fade type {other}"))),
        }
    }

    /// Rate bounds: real-time needs >= 1 revolution, sweep is 1..=100 percent
    pub fn check_rate(self, rate: u16) -> ScResult<()> {
        match self {
            Self::RealTime if rate == 0 => {
                Err(ScError::invalid("fade.rate", "real-time rate must be >= 1"))
            }
            Self::Sweep if rate == 0 || rate > 100 => {
                Err(ScError::invalid("fade.rate", "sweep rate must be 1..=100 percent"))
            }
            _ => Ok(()),
        }
    }
}

/// Argument checks shared by every `ScControl` implementation
pub mod check {
    use crate::{ScError, ScResult, MAX_DESTINATIONS};

    pub fn rid(rid: u8) -> ScResult<()> {
        if (rid as usize) < MAX_DESTINATIONS {
            Ok(())
        } else {
            Err(ScError::invalid("rid", format!("radar id {rid} >= {MAX_DESTINATIONS}")))
        }
    }

    pub fn scale_factor(factor: u8) -> ScResult<()> {
        if (1..=4).contains(&factor) {
            Ok(())
        } else {
            Err(ScError::invalid("scale_factor", "must be 1..=4"))
        }
    }

    pub fn finite(field: &str, values: &[f64]) -> ScResult<()> {
        if values.iter().all(|v| v.is_finite()) {
            Ok(())
        } else {
            Err(ScError::invalid(field, "must be finite"))
        }
    }
}

/// Scan-conversion projection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScType {
    #[default]
    Unknown,
    Ppi,
    BScan,
}

impl ScType {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Unknown => -1,
            Self::Ppi => 0,
            Self::BScan => 1,
        }
    }
}

/// Moving platform reference mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MpRefMode {
    #[default]
    Normal,
    AdjustFromNorth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepLineKind {
    #[default]
    Off,
    Auto,
}

/// How the sweep line colour combines with the video under it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepColourMode {
    /// Line value is added to the video value
    Offset,
    /// Larger of line and video wins
    #[default]
    Highest,
    /// Line value replaces the video
    Replace,
}

/// Sweep line configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepLine {
    #[serde(default)]
    pub kind: SweepLineKind,
    #[serde(default)]
    pub colour_mode: SweepColourMode,
    /// 0xRRGGBB; the converter uses the green byte as the 8-bit level
    #[serde(default = "default_sweep_rgb")]
    pub rgb: u32,
}

fn default_sweep_rgb() -> u32 {
    0x00ff00
}

impl Default for SweepLine {
    fn default() -> Self {
        Self {
            kind: SweepLineKind::Off,
            colour_mode: SweepColourMode::Highest,
            rgb: default_sweep_rgb(),
        }
    }
}

impl SweepLine {
    pub fn auto(colour_mode: SweepColourMode, rgb: u32) -> Self {
        Self {
            kind: SweepLineKind::Auto,
            colour_mode,
            rgb,
        }
    }

    pub fn is_on(&self) -> bool {
        self.kind == SweepLineKind::Auto
    }

    /// 8-bit intensity drawn into index buffers
    pub fn level(&self) -> u8 {
        ((self.rgb >> 8) & 0xff) as u8
    }

    /// Combine line level with an existing pixel value
    pub fn combine(&self, video: u8) -> u8 {
        let level = self.level();
        match self.colour_mode {
            SweepColourMode::Offset => video.saturating_add(level),
            SweepColourMode::Highest => video.max(level),
            SweepColourMode::Replace => level,
        }
    }
}

/// World-space view: centre and extent in metres
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct View {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl View {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// Rejects zero, negative or non-finite extents
    pub fn validate(&self) -> ScResult<()> {
        if !(self.w.is_finite() && self.w > 0.0) {
            return Err(ScError::invalid("view.w", "view width must be > 0"));
        }
        if !(self.h.is_finite() && self.h > 0.0) {
            return Err(ScError::invalid("view.h", "view height must be > 0"));
        }
        if !self.x.is_finite() || !self.y.is_finite() {
            return Err(ScError::invalid("view", "view centre must be finite"));
        }
        Ok(())
    }
}

impl Default for View {
    fn default() -> Self {
        Self::new(0.0, 0.0, 20_000.0, 20_000.0)
    }
}

/// Window geometry in screen pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WinGeom {
    pub x: i16,
    pub y: i16,
    pub w: u16,
    pub h: u16,
}

impl WinGeom {
    pub fn new(x: i16, y: i16, w: u16, h: u16) -> Self {
        Self { x, y, w, h }
    }

    /// `0 < w <= max_w` and `0 < h <= max_h`
    pub fn validate(&self, max_w: u16, max_h: u16) -> ScResult<()> {
        if self.w == 0 || self.w > max_w {
            return Err(ScError::invalid(
                "win.w",
                format!("width {} outside 1..={max_w}", self.w),
            ));
        }
        if self.h == 0 || self.h > max_h {
            return Err(ScError::invalid(
                "win.h",
                format!("height {} outside 1..={max_h}", self.h),
            ));
        }
        Ok(())
    }

    pub fn area(&self) -> usize {
        self.w as usize * self.h as usize
    }
}

/// 24-bit colour used by `set_radar_colour`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn from_u32(rgb: u32) -> Self {
        Self {
            r: ((rgb >> 16) & 0xff) as u8,
            g: ((rgb >> 8) & 0xff) as u8,
            b: (rgb & 0xff) as u8,
        }
    }

    pub fn as_u32(self) -> u32 {
        (self.r as u32) << 16 | (self.g as u32) << 8 | self.b as u32
    }
}

/// 16-bit azimuth (0..=65535 covers 0..360 degrees) to degrees
pub fn azimuth_to_degs(azimuth: u16) -> f64 {
    azimuth as f64 * 360.0 / 65536.0
}

pub fn degs_to_azimuth(degs: f64) -> u16 {
    let wrapped = degs.rem_euclid(360.0);
    ((wrapped * 65536.0 / 360.0).round() as u32 & 0xffff) as u16
}
