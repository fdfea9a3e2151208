//! Pixel index mapping for reverse (image-space) scan conversion.
//!
//! Every table pixel gets a 16.16 fixed-point range and azimuth index into
//! the PIM, computed from the pixel centre. Pixels are grouped by the PIM
//! azimuth that contains their centre so that converting one azimuth only
//! touches the pixels that azimuth owns.
//!
//! Near the radar a pixel spans more than one PIM cell; those pixels carry
//! a `CellBox` and take the maximum over the box.

use std::f64::consts::TAU;

use contracts::{ScType, View};
use nalgebra::{Matrix3, Point2, Vector2};

/// Fraction bits of fixed-point indices
pub const FP_SHIFT: u32 = 16;

/// Boxes larger than this many cells are clipped in azimuth
const MAX_BOX_CELLS: u32 = 8192;

/// Fixed-point index to integer index.
///
/// A value exactly on a boundary belongs to both neighbouring cells; the
/// lower index wins.
#[inline]
pub fn fp_index(fp: u32) -> u32 {
    if fp == 0 {
        0
    } else {
        (fp - 1) >> FP_SHIFT
    }
}

/// Everything the tables depend on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub sc_type: ScType,
    pub win_w: u16,
    pub win_h: u16,
    /// Screen pixels per table pixel along each axis
    pub scale: u8,
    pub view: View,
    pub radar: (f32, f32),
    pub rotation_degs: f64,
    pub anticlockwise: bool,
    pub slant_height_m: f32,
    pub pim_azimuths: u32,
    pub pim_cells: u32,
    pub start_range: f32,
    pub end_range: f32,
}

impl Geometry {
    pub fn table_w(&self) -> u16 {
        (self.win_w as u32).div_ceil(self.scale.max(1) as u32) as u16
    }

    pub fn table_h(&self) -> u16 {
        (self.win_h as u32).div_ceil(self.scale.max(1) as u32) as u16
    }

    pub fn cell_m(&self) -> f64 {
        (self.end_range - self.start_range).max(f32::EPSILON) as f64 / self.pim_cells.max(1) as f64
    }

    /// Screen pixel to world metres (PPI)
    fn screen_to_world(&self) -> Matrix3<f64> {
        let mx = self.view.w as f64 / self.win_w.max(1) as f64;
        let my = self.view.h as f64 / self.win_h.max(1) as f64;
        let centre = Matrix3::new_translation(&Vector2::new(
            -(self.win_w as f64) / 2.0,
            -(self.win_h as f64) / 2.0,
        ));
        let scale = Matrix3::new_nonuniform_scaling(&Vector2::new(mx, -my));
        let view = Matrix3::new_translation(&Vector2::new(self.view.x as f64, self.view.y as f64));
        view * scale * centre
    }

    /// World metres of the centre of a table pixel
    pub fn table_pixel_world(&self, px: u16, py: u16) -> (f64, f64) {
        let s = self.scale.max(1) as f64;
        let screen = Point2::new(px as f64 * s + s / 2.0, py as f64 * s + s / 2.0);
        let world = self.screen_to_world().transform_point(&screen);
        (world.x, world.y)
    }

    /// Half diagonal of a table pixel in metres
    fn pixel_half_diag_m(&self) -> f64 {
        let s = self.scale.max(1) as f64;
        let mx = self.view.w as f64 / self.win_w.max(1) as f64 * s;
        let my = self.view.h as f64 / self.win_h.max(1) as f64 * s;
        0.5 * (mx * mx + my * my).sqrt()
    }

    /// Polar position (sample range metres, azimuth fraction of a turn) of
    /// a table pixel centre
    pub fn polar_of(&self, px: u16, py: u16) -> (f64, f64) {
        match self.sc_type {
            ScType::BScan => {
                let s = self.scale.max(1) as f64;
                let sx = px as f64 * s + s / 2.0;
                let sy = py as f64 * s + s / 2.0;
                let degs = self.view.x as f64 - self.view.w as f64 / 2.0
                    + sx / self.win_w.max(1) as f64 * self.view.w as f64;
                let range = self.view.y as f64 - self.view.h as f64 / 2.0
                    + (1.0 - sy / self.win_h.max(1) as f64) * self.view.h as f64;
                (range, self.sample_fraction(degs))
            }
            _ => {
                let (wx, wy) = self.table_pixel_world(px, py);
                let rel = Vector2::new(wx - self.radar.0 as f64, wy - self.radar.1 as f64);
                let ground = rel.norm();
                let range = if self.slant_height_m > 0.0 {
                    (ground * ground + (self.slant_height_m as f64).powi(2)).sqrt()
                } else {
                    ground
                };
                let degs = rel.x.atan2(rel.y).to_degrees();
                (range, self.sample_fraction(degs))
            }
        }
    }

    /// Screen bearing (degrees clockwise from north) to a fraction of the
    /// sample azimuth circle
    fn sample_fraction(&self, screen_degs: f64) -> f64 {
        let mut degs = screen_degs - self.rotation_degs;
        if self.anticlockwise {
            degs = -degs;
        }
        degs.rem_euclid(360.0) / 360.0
    }

    fn range_fp(&self, range: f64) -> Option<u32> {
        let rel = range - self.start_range as f64;
        if rel < 0.0 || range >= self.end_range as f64 {
            return None;
        }
        Some((rel / self.cell_m() * (1u32 << FP_SHIFT) as f64) as u32)
    }

    fn azimuth_fp(&self, fraction: f64) -> u32 {
        let total = (self.pim_azimuths as u64) << FP_SHIFT;
        ((fraction * total as f64) as u64 % total.max(1)) as u32
    }
}

/// PIM cells a pixel spans
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellBox {
    pub azi_lo: u32,
    /// Number of azimuths, wrapping past the end of the PIM
    pub azi_span: u32,
    pub rng_lo: u32,
    pub rng_hi: u32,
}

/// One table pixel owned by an azimuth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelEntry {
    /// Row-major index into the table
    pub pixel: u32,
    pub range_fp: u32,
    pub azi_fp: u32,
    pub cell_box: Option<CellBox>,
}

impl PixelEntry {
    #[inline]
    pub fn cell(&self) -> u32 {
        fp_index(self.range_fp)
    }

    #[inline]
    pub fn azimuth(&self) -> u32 {
        fp_index(self.azi_fp)
    }
}

/// Lookup tables for one geometry
#[derive(Debug, Clone)]
pub struct PixelTables {
    geometry: Geometry,
    width: u16,
    height: u16,
    by_azimuth: Vec<Vec<PixelEntry>>,
    covered: usize,
}

impl PixelTables {
    /// Recalculate every table for `geometry`
    pub fn build(geometry: &Geometry) -> Self {
        let width = geometry.table_w();
        let height = geometry.table_h();
        let n_azi = geometry.pim_azimuths.max(1);
        let mut by_azimuth = vec![Vec::new(); n_azi as usize];
        let half_diag = geometry.pixel_half_diag_m();
        let cell_m = geometry.cell_m();
        let mut covered = 0usize;

        for py in 0..height {
            for px in 0..width {
                let (range, fraction) = geometry.polar_of(px, py);
                let Some(range_fp) = geometry.range_fp(range) else {
                    continue;
                };
                let azi_fp = geometry.azimuth_fp(fraction);
                let cell_box = match geometry.sc_type {
                    ScType::BScan => None,
                    _ => pixel_box(range, fraction, half_diag, cell_m, geometry),
                };
                let entry = PixelEntry {
                    pixel: py as u32 * width as u32 + px as u32,
                    range_fp,
                    azi_fp,
                    cell_box,
                };
                by_azimuth[entry.azimuth() as usize].push(entry);
                covered += 1;
            }
        }

        Self {
            geometry: *geometry,
            width,
            height,
            by_azimuth,
            covered,
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// Pixels owned by PIM azimuth `idx`
    #[inline]
    pub fn azimuth(&self, idx: u32) -> &[PixelEntry] {
        self.by_azimuth
            .get(idx as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn num_azimuths(&self) -> u32 {
        self.by_azimuth.len() as u32
    }

    /// Pixels inside the radar's range
    pub fn covered(&self) -> usize {
        self.covered
    }

    pub fn entries(&self) -> impl Iterator<Item = &PixelEntry> {
        self.by_azimuth.iter().flatten()
    }
}

fn pixel_box(
    range: f64,
    fraction: f64,
    half_diag: f64,
    cell_m: f64,
    geometry: &Geometry,
) -> Option<CellBox> {
    let start = geometry.start_range as f64;
    let max_cell = geometry.pim_cells.saturating_sub(1);
    let to_cell = |r: f64| (((r - start) / cell_m).max(0.0) as u32).min(max_cell);
    let rng_lo = to_cell(range - half_diag);
    let rng_hi = to_cell(range + half_diag);

    let n_azi = geometry.pim_azimuths;
    let (azi_lo, azi_span) = if range <= half_diag {
        (0, n_azi)
    } else {
        let half = (half_diag / range).asin() / TAU;
        let lo = (fraction - half).rem_euclid(1.0);
        let lo_idx = (lo * n_azi as f64) as u32 % n_azi;
        let span = ((2.0 * half * n_azi as f64).ceil() as u32 + 1).min(n_azi);
        (lo_idx, span)
    };

    if rng_lo == rng_hi && azi_span <= 1 {
        return None;
    }
    let rng_span = rng_hi - rng_lo + 1;
    let azi_span = azi_span.min((MAX_BOX_CELLS / rng_span).max(1));
    Some(CellBox {
        azi_lo,
        azi_span,
        rng_lo,
        rng_hi,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(w: u16, h: u16) -> Geometry {
        Geometry {
            sc_type: ScType::Ppi,
            win_w: w,
            win_h: h,
            scale: 1,
            view: View::new(0.0, 0.0, w as f32 * 10.0, h as f32 * 10.0),
            radar: (0.0, 0.0),
            rotation_degs: 0.0,
            anticlockwise: false,
            slant_height_m: 0.0,
            pim_azimuths: 1024,
            pim_cells: 512,
            start_range: 0.0,
            end_range: 5120.0,
        }
    }

    #[test]
    fn boundary_ties_go_to_lower_index() {
        assert_eq!(fp_index(0), 0);
        assert_eq!(fp_index(1 << FP_SHIFT), 0);
        assert_eq!(fp_index((1 << FP_SHIFT) + 1), 1);
        assert_eq!(fp_index((3 << FP_SHIFT) - 1), 2);
        assert_eq!(fp_index(3 << FP_SHIFT), 2);
    }

    #[test]
    fn every_pixel_listed_once() {
        let tables = PixelTables::build(&geometry(64, 64));
        let mut seen = vec![0u8; 64 * 64];
        for entry in tables.entries() {
            seen[entry.pixel as usize] += 1;
        }
        assert!(seen.iter().all(|&n| n <= 1));
        // 640m square view fits inside 5120m range: all listed
        assert_eq!(tables.covered(), 64 * 64);
    }

    #[test]
    fn north_pixel_maps_to_azimuth_zero() {
        let geo = geometry(101, 101);
        let (range, fraction) = geo.polar_of(50, 0);
        assert!((range - 500.0).abs() < 1e-6);
        assert!(fraction.abs() < 1e-9);
        let (_, east) = geo.polar_of(100, 50);
        assert!((east - 0.25).abs() < 1e-9);
    }

    #[test]
    fn out_of_range_pixels_skipped() {
        let mut geo = geometry(64, 64);
        geo.end_range = 100.0;
        let tables = PixelTables::build(&geo);
        assert!(tables.covered() < 64 * 64 / 4);
        for entry in tables.entries() {
            assert!(entry.cell() < geo.pim_cells);
        }
    }

    #[test]
    fn rotation_shifts_sample_azimuth() {
        let mut geo = geometry(101, 101);
        geo.rotation_degs = 90.0;
        let (_, fraction) = geo.polar_of(100, 50);
        assert!(fraction.abs() < 1e-9);
        geo.rotation_degs = 0.0;
        geo.anticlockwise = true;
        let (_, fraction) = geo.polar_of(100, 50);
        assert!((fraction - 0.75).abs() < 1e-9);
    }

    #[test]
    fn centre_pixel_spans_all_azimuths() {
        let geo = geometry(64, 64);
        let tables = PixelTables::build(&geo);
        let centre = 32 * 64 + 32;
        let entry = tables
            .entries()
            .find(|entry| entry.pixel == centre)
            .copied()
            .unwrap();
        let cell_box = entry.cell_box.unwrap();
        assert_eq!(cell_box.rng_lo, 0);
        assert!(cell_box.azi_span > 1);
    }

    #[test]
    fn bscan_maps_columns_to_azimuth() {
        let mut geo = geometry(360, 100);
        geo.sc_type = ScType::BScan;
        geo.view = View::new(180.0, 2560.0, 360.0, 5120.0);
        let (range, fraction) = geo.polar_of(90, 99);
        assert!((fraction - 90.5 / 360.0).abs() < 1e-9);
        assert!(range < 52.0);
    }
}
