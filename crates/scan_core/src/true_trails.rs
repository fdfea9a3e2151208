//! True trails: ground-stabilised trail history.
//!
//! Each bitmap is a square of `dimension` pixels covering `±range` metres
//! around the radar. Content is geographically anchored; when the radar
//! moves the bitmaps scroll by the displacement and the exposed columns
//! and rows are cleared.

use contracts::{ScError, ScResult, MAX_TRUE_TRAILS};

#[derive(Debug, Clone)]
struct TrailBitmap {
    range_m: f32,
    mpp: f64,
    data: Vec<u8>,
    residual: (f64, f64),
}

/// Copy of one trail bitmap
#[derive(Debug, Clone, PartialEq)]
pub struct TrailSnapshot {
    pub range_m: f32,
    pub dimension: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TrueTrails {
    dimension: u16,
    origin: (f64, f64),
    bitmaps: Vec<TrailBitmap>,
}

impl TrueTrails {
    pub fn new(dimension: u16, ranges: &[f32], origin: (f64, f64)) -> ScResult<Self> {
        if ranges.len() > MAX_TRUE_TRAILS {
            return Err(ScError::invalid(
                "true_trails.ranges",
                format!("at most {MAX_TRUE_TRAILS} bitmaps"),
            ));
        }
        if dimension == 0 {
            return Err(ScError::invalid("true_trails.dimension", "must be > 0"));
        }
        let mut sorted: Vec<f32> = ranges.to_vec();
        if sorted.iter().any(|r| !(r.is_finite() && *r > 0.0)) {
            return Err(ScError::invalid("true_trails.ranges", "ranges must be > 0"));
        }
        // finest first so sampling prefers resolution
        sorted.sort_by(f32::total_cmp);
        let area = dimension as usize * dimension as usize;
        let bitmaps = sorted
            .into_iter()
            .map(|range_m| TrailBitmap {
                range_m,
                mpp: 2.0 * range_m as f64 / dimension as f64,
                data: vec![0; area],
                residual: (0.0, 0.0),
            })
            .collect();
        Ok(Self {
            dimension,
            origin,
            bitmaps,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.bitmaps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bitmaps.len()
    }

    pub fn origin(&self) -> (f64, f64) {
        self.origin
    }

    #[inline]
    fn locate(&self, bitmap: &TrailBitmap, wx: f64, wy: f64) -> Option<usize> {
        let half = self.dimension as f64 / 2.0;
        let bx = (wx - self.origin.0) / bitmap.mpp + half;
        let by = half - (wy - self.origin.1) / bitmap.mpp;
        if bx < 0.0 || by < 0.0 || bx >= self.dimension as f64 || by >= self.dimension as f64 {
            return None;
        }
        Some(by as usize * self.dimension as usize + bx as usize)
    }

    /// Record `value` at a world position in every bitmap covering it
    pub fn write(&mut self, wx: f64, wy: f64, value: u8) {
        if value == 0 {
            return;
        }
        for idx in 0..self.bitmaps.len() {
            if let Some(px) = self.locate(&self.bitmaps[idx], wx, wy) {
                let slot = &mut self.bitmaps[idx].data[px];
                *slot = (*slot).max(value);
            }
        }
    }

    /// Trail value at a world position, from the finest bitmap covering it
    pub fn sample(&self, wx: f64, wy: f64) -> u8 {
        self.bitmaps
            .iter()
            .find_map(|bitmap| self.locate(bitmap, wx, wy).map(|px| bitmap.data[px]))
            .unwrap_or(0)
    }

    /// Platform moved: scroll every bitmap so content stays put on the ground
    pub fn move_origin(&mut self, origin: (f64, f64)) {
        let dx = origin.0 - self.origin.0;
        let dy = origin.1 - self.origin.1;
        self.origin = origin;
        let dim = self.dimension as i64;
        for bitmap in &mut self.bitmaps {
            let sx = bitmap.residual.0 - dx / bitmap.mpp;
            let sy = bitmap.residual.1 + dy / bitmap.mpp;
            let (ix, iy) = (sx.trunc(), sy.trunc());
            bitmap.residual = (sx - ix, sy - iy);
            scroll(&mut bitmap.data, dim, ix as i64, iy as i64);
        }
    }

    /// Fade every bitmap with a LUT
    pub fn fade(&mut self, lut: &[u8; 256]) {
        for bitmap in &mut self.bitmaps {
            for px in bitmap.data.iter_mut() {
                *px = lut[*px as usize];
            }
        }
    }

    pub fn clear(&mut self) {
        for bitmap in &mut self.bitmaps {
            bitmap.data.fill(0);
            bitmap.residual = (0.0, 0.0);
        }
    }

    pub fn snapshot(&self, idx: usize) -> Option<TrailSnapshot> {
        self.bitmaps.get(idx).map(|bitmap| TrailSnapshot {
            range_m: bitmap.range_m,
            dimension: self.dimension,
            data: bitmap.data.clone(),
        })
    }
}

/// Shift content by (sx, sy) pixels, clearing exposed columns and rows
fn scroll(data: &mut [u8], dim: i64, sx: i64, sy: i64) {
    if sx == 0 && sy == 0 {
        return;
    }
    if sx.abs() >= dim || sy.abs() >= dim {
        data.fill(0);
        return;
    }
    let src = data.to_vec();
    for y in 0..dim {
        for x in 0..dim {
            let (ox, oy) = (x - sx, y - sy);
            let value = if ox >= 0 && oy >= 0 && ox < dim && oy < dim {
                src[(oy * dim + ox) as usize]
            } else {
                0
            };
            data[(y * dim + x) as usize] = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn more_than_four_rejected() {
        assert!(TrueTrails::new(64, &[1.0, 2.0, 3.0, 4.0, 5.0], (0.0, 0.0)).is_err());
        assert!(TrueTrails::new(64, &[1.0, 2.0, 3.0, 4.0], (0.0, 0.0)).is_ok());
    }

    #[test]
    fn content_stays_anchored_when_platform_moves() {
        // 64 px over 640 m: 10 m per pixel
        let mut trails = TrueTrails::new(64, &[320.0], (0.0, 0.0)).unwrap();
        trails.write(100.0, 50.0, 180);
        trails.move_origin((40.0, -20.0));
        assert_eq!(trails.sample(100.0, 50.0), 180);
        assert_eq!(trails.sample(60.0, 70.0), 0);
    }

    #[test]
    fn exposed_edges_cleared() {
        let mut trails = TrueTrails::new(8, &[40.0], (0.0, 0.0)).unwrap();
        // fill everything
        for y in 0..8 {
            for x in 0..8 {
                trails.write(-35.0 + x as f64 * 10.0, 35.0 - y as f64 * 10.0, 50);
            }
        }
        trails.move_origin((20.0, 0.0));
        let snap = trails.snapshot(0).unwrap();
        // two rightmost columns are new ground
        for y in 0..8 {
            assert_eq!(snap.data[y * 8 + 7], 0);
            assert_eq!(snap.data[y * 8 + 6], 0);
            assert_eq!(snap.data[y * 8 + 5], 50);
        }
    }

    #[test]
    fn finest_bitmap_sampled_first() {
        let mut trails = TrueTrails::new(32, &[1000.0, 100.0], (0.0, 0.0)).unwrap();
        trails.write(10.0, 10.0, 99);
        assert_eq!(trails.snapshot(0).unwrap().range_m, 100.0);
        assert_eq!(trails.sample(10.0, 10.0), 99);
        assert_eq!(trails.sample(900.0, 0.0), 0);
    }
}
