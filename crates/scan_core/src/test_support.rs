use std::sync::{Arc, Mutex};

use contracts::{
    FadeType, PatchSet, Return, Rgb, ScControl, ScDest, ScResult, ScState, View, WinGeom,
};

/// One full turn of `n` returns; `level(azimuth_idx, sample_idx)`
pub fn sweep(n: usize, samples: usize, end_range: f32, level: impl Fn(usize, usize) -> u8) -> Vec<Return> {
    (0..n)
        .map(|i| {
            let azimuth = (i * 65536 / n) as u16;
            let data = (0..samples).map(|s| level(i, s)).collect();
            Return::new_u8(azimuth, 0.0, end_range, data)
        })
        .collect()
}

/// Destination that applies patches to a plain plane
pub struct RecordingDest {
    name: String,
    width: u16,
    height: u16,
    plane: Mutex<Vec<u8>>,
}

impl RecordingDest {
    pub fn new(name: &str, width: u16, height: u16) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            width,
            height,
            plane: Mutex::new(vec![0; width as usize * height as usize]),
        })
    }

    pub fn plane(&self) -> Vec<u8> {
        self.plane.lock().unwrap().clone()
    }
}

impl ScControl for RecordingDest {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_win_pos(&self, _x: i16, _y: i16) -> ScResult<()> {
        Ok(())
    }

    fn set_win_geom(&self, _geom: WinGeom) -> ScResult<()> {
        Ok(())
    }

    fn set_fade(&self, _rid: u8, _fade_type: FadeType, _rate: u16) -> ScResult<()> {
        Ok(())
    }

    fn set_view(&self, _view: View) -> ScResult<()> {
        Ok(())
    }

    fn pan_view(&self, _x: f32, _y: f32, _clear_trails: bool) -> ScResult<()> {
        Ok(())
    }

    fn set_radar_colour(&self, _rid: u8, _colour: Rgb) -> ScResult<()> {
        Ok(())
    }

    fn set_radar_bright(&self, _rid: u8, _bright: u8) -> ScResult<()> {
        Ok(())
    }

    fn set_radar_lut(&self, _rid: u8, _lut: &[u8; 256]) -> ScResult<()> {
        Ok(())
    }

    fn show_radar(&self, _rid: u8, _state: ScState) -> ScResult<()> {
        Ok(())
    }

    fn patch_set(&self, patches: &PatchSet) -> ScResult<()> {
        let mut plane = self.plane.lock().unwrap();
        for patch in &patches.patches {
            for py in 0..patch.h {
                for px in 0..patch.w {
                    let (x, y) = (patch.x + px, patch.y + py);
                    if x < self.width && y < self.height {
                        plane[y as usize * self.width as usize + x as usize] = patch.get(px, py);
                    }
                }
            }
        }
        Ok(())
    }

    fn set_source(&self, _source_id: u32, _arg1: u32, _arg2: u32) -> ScResult<()> {
        Ok(())
    }

    fn set_radar_position(&self, _x: f32, _y: f32, _clear_trails: bool) -> ScResult<()> {
        Ok(())
    }
}

impl ScDest for RecordingDest {
    fn max_size(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    fn clear(&self, value: u8) -> ScResult<()> {
        self.plane.lock().unwrap().fill(value);
        Ok(())
    }
}
