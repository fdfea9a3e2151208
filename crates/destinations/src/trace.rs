//! TraceDest - logs every control call at debug level

use contracts::{
    FadeType, MpRefMode, PatchSet, Rgb, ScControl, ScDest, ScResult, ScState, SweepLine, View,
    WinGeom,
};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TraceDest {
    name: String,
    max_size: (u16, u16),
}

impl TraceDest {
    pub fn new(name: impl Into<String>, max_size: (u16, u16)) -> Self {
        Self {
            name: name.into(),
            max_size,
        }
    }
}

impl ScControl for TraceDest {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_win_pos(&self, x: i16, y: i16) -> ScResult<()> {
        debug!(dest = %self.name, x, y, "set_win_pos");
        Ok(())
    }

    fn set_win_geom(&self, geom: WinGeom) -> ScResult<()> {
        geom.validate(self.max_size.0, self.max_size.1)?;
        debug!(dest = %self.name, ?geom, "set_win_geom");
        Ok(())
    }

    fn set_win_param(&self, param: u16, arg1: u32, arg2: u32) -> ScResult<()> {
        debug!(dest = %self.name, param, arg1, arg2, "set_win_param");
        Ok(())
    }

    fn set_fade(&self, rid: u8, fade_type: FadeType, rate: u16) -> ScResult<()> {
        debug!(dest = %self.name, rid, ?fade_type, rate, "set_fade");
        Ok(())
    }

    fn set_view(&self, view: View) -> ScResult<()> {
        view.validate()?;
        debug!(dest = %self.name, ?view, "set_view");
        Ok(())
    }

    fn pan_view(&self, x: f32, y: f32, clear_trails: bool) -> ScResult<()> {
        debug!(dest = %self.name, x, y, clear_trails, "pan_view");
        Ok(())
    }

    fn set_radar_colour(&self, rid: u8, colour: Rgb) -> ScResult<()> {
        debug!(dest = %self.name, rid, rgb = format_args!("{:06x}", colour.as_u32()), "set_radar_colour");
        Ok(())
    }

    fn set_radar_bright(&self, rid: u8, bright: u8) -> ScResult<()> {
        debug!(dest = %self.name, rid, bright, "set_radar_bright");
        Ok(())
    }

    fn set_radar_lut(&self, rid: u8, _lut: &[u8; 256]) -> ScResult<()> {
        debug!(dest = %self.name, rid, "set_radar_lut");
        Ok(())
    }

    fn show_radar(&self, rid: u8, state: ScState) -> ScResult<()> {
        debug!(dest = %self.name, rid, ?state, "show_radar");
        Ok(())
    }

    fn patch_set(&self, patches: &PatchSet) -> ScResult<()> {
        debug!(
            dest = %self.name,
            patches = patches.len(),
            pixels = patches.pixel_count(),
            "patch_set"
        );
        Ok(())
    }

    fn set_source(&self, source_id: u32, arg1: u32, arg2: u32) -> ScResult<()> {
        debug!(dest = %self.name, source_id, arg1, arg2, "set_source");
        Ok(())
    }

    fn set_radar_position(&self, x: f32, y: f32, clear_trails: bool) -> ScResult<()> {
        debug!(dest = %self.name, x, y, clear_trails, "set_radar_position");
        Ok(())
    }

    fn set_rotation_degs(&self, degs: f64) -> ScResult<()> {
        debug!(dest = %self.name, degs, "set_rotation_degs");
        Ok(())
    }

    fn set_scale_factor(&self, factor: u8) -> ScResult<()> {
        debug!(dest = %self.name, factor, "set_scale_factor");
        Ok(())
    }

    fn set_moving_platform_ref_mode(&self, mode: MpRefMode) -> ScResult<()> {
        debug!(dest = %self.name, ?mode, "set_moving_platform_ref_mode");
        Ok(())
    }

    fn set_sweep_line(&self, sweep: SweepLine) -> ScResult<()> {
        debug!(dest = %self.name, ?sweep, "set_sweep_line");
        Ok(())
    }
}

impl ScDest for TraceDest {
    fn max_size(&self) -> (u16, u16) {
        self.max_size
    }

    fn clear(&self, value: u8) -> ScResult<()> {
        debug!(dest = %self.name, value, "clear");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checks_geometry_against_max_size() {
        let dest = TraceDest::new("trace", (100, 50));
        assert!(dest.set_win_geom(WinGeom::new(0, 0, 100, 50)).is_ok());
        assert!(dest.set_win_geom(WinGeom::new(0, 0, 101, 50)).is_err());
        assert!(dest.set_view(View::new(0.0, 0.0, 0.0, 10.0)).is_err());
        assert_eq!(dest.max_size(), (100, 50));
    }
}
