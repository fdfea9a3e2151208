//! ScControl trait - the scan-conversion control surface
//!
//! Implemented identically by the local converter, bitmap destinations and
//! the network proxies, so a caller never needs to know whether the object
//! on the other side is local or remote. Optional capabilities default to
//! `ScError::NotSupported`.

use std::sync::Arc;

use crate::{
    DirtyBox, FadeType, MpRefMode, PatchSet, Rgb, ScError, ScResult, ScState, ScType, SweepLine,
    View, WinGeom,
};

/// Control surface shared by sources, destinations and network proxies
pub trait ScControl: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    fn set_win_pos(&self, x: i16, y: i16) -> ScResult<()>;

    fn set_win_geom(&self, geom: WinGeom) -> ScResult<()>;

    /// Window-specific parameter pass-through
    fn set_win_param(&self, _param: u16, _arg1: u32, _arg2: u32) -> ScResult<()> {
        Err(ScError::not_supported("set_win_param", self.name()))
    }

    fn set_fade(&self, rid: u8, fade_type: FadeType, rate: u16) -> ScResult<()>;

    fn set_view(&self, view: View) -> ScResult<()>;

    /// Move the view centre, keeping its size
    fn pan_view(&self, x: f32, y: f32, clear_trails: bool) -> ScResult<()>;

    fn set_radar_colour(&self, rid: u8, colour: Rgb) -> ScResult<()>;

    fn set_radar_bright(&self, rid: u8, bright: u8) -> ScResult<()>;

    fn set_radar_lut(&self, rid: u8, lut: &[u8; 256]) -> ScResult<()>;

    fn show_radar(&self, rid: u8, state: ScState) -> ScResult<()>;

    fn patch_set(&self, patches: &PatchSet) -> ScResult<()>;

    fn set_source(&self, source_id: u32, arg1: u32, arg2: u32) -> ScResult<()>;

    fn set_radar_position(&self, x: f32, y: f32, clear_trails: bool) -> ScResult<()>;

    fn set_rotation_degs(&self, _degs: f64) -> ScResult<()> {
        Err(ScError::not_supported("set_rotation_degs", self.name()))
    }

    fn set_scale_factor(&self, _factor: u8) -> ScResult<()> {
        Err(ScError::not_supported("set_scale_factor", self.name()))
    }

    fn set_moving_platform_ref_mode(&self, _mode: MpRefMode) -> ScResult<()> {
        Err(ScError::not_supported("set_moving_platform_ref_mode", self.name()))
    }

    fn set_sweep_line(&self, _sweep: SweepLine) -> ScResult<()> {
        Err(ScError::not_supported("set_sweep_line", self.name()))
    }

    fn sc_type(&self) -> ScType {
        ScType::Unknown
    }
}

/// Destination side of the surface: something that stores pixels
pub trait ScDest: ScControl {
    /// Largest window the destination can hold
    fn max_size(&self) -> (u16, u16);

    /// Destinations that draw their own sweep line get the azimuth instead
    /// of sweep pixels baked into patches
    fn draws_sweep_line(&self) -> bool {
        false
    }

    fn sweep_azimuth(&self, _azimuth: u16) {}

    /// Fill the whole plane with `value`
    fn clear(&self, value: u8) -> ScResult<()>;
}

/// Shared handle to a destination
pub type DestRef = Arc<dyn ScDest>;

/// Called after a bitmap changed, with the dirty box of the change
pub type BitmapUpdateCallback = Arc<dyn Fn(&str, DirtyBox) + Send + Sync>;
