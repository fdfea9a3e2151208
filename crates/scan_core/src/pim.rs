//! Plot/Image Memory: polar history of the latest scan.
//!
//! One row of `cells` 8-bit values per PIM azimuth. Returns are resampled
//! onto the fixed cell grid (peak over samples that fall in a cell) so the
//! pixel tables never depend on the sample count of individual returns.

use contracts::Return;

use crate::pixel_map::CellBox;

#[derive(Debug, Clone)]
pub struct Pim {
    azimuths: u32,
    cells: u32,
    data: Vec<u8>,
    start_range: f32,
    end_range: f32,
    last_azimuth: Option<u32>,
}

impl Pim {
    pub fn new(azimuths: u32, cells: u32) -> Self {
        Self {
            azimuths,
            cells,
            data: vec![0; azimuths as usize * cells as usize],
            start_range: 0.0,
            end_range: 0.0,
            last_azimuth: None,
        }
    }

    pub fn azimuths(&self) -> u32 {
        self.azimuths
    }

    pub fn cells(&self) -> u32 {
        self.cells
    }

    pub fn range_scale(&self) -> (f32, f32) {
        (self.start_range, self.end_range)
    }

    /// Adopt the range scale of incoming returns; clears history when it
    /// changes. Returns true on change.
    pub fn set_range_scale(&mut self, start_range: f32, end_range: f32) -> bool {
        if self.start_range == start_range && self.end_range == end_range {
            return false;
        }
        self.start_range = start_range;
        self.end_range = end_range;
        self.clear();
        true
    }

    /// 16-bit azimuth to PIM row
    #[inline]
    pub fn azimuth_index(&self, azimuth: u16) -> u32 {
        (azimuth as u32 * self.azimuths) >> 16
    }

    /// Store one return and report the rows it now owns.
    ///
    /// Rows skipped since the previous return (sparse returns) are filled
    /// with the same data so every row gets converted once per turn. Gaps
    /// of a quarter turn or more are treated as a restart.
    pub fn store(&mut self, ret: &Return) -> (u32, u32) {
        let idx = self.azimuth_index(ret.azimuth);
        let quarter = (self.azimuths / 4).max(1);
        let (first, count) = match self.last_azimuth {
            Some(last) => {
                let forward = (idx + self.azimuths - last) % self.azimuths;
                let backward = (last + self.azimuths - idx) % self.azimuths;
                if forward == 0 {
                    (idx, 1)
                } else if forward < quarter {
                    ((last + 1) % self.azimuths, forward)
                } else if backward < quarter {
                    // anticlockwise antenna
                    (idx, backward)
                } else {
                    (idx, 1)
                }
            }
            None => (idx, 1),
        };
        self.last_azimuth = Some(idx);

        let row = self.resample(ret);
        for k in 0..count {
            let azi = (first + k) % self.azimuths;
            let start = azi as usize * self.cells as usize;
            self.data[start..start + self.cells as usize].copy_from_slice(&row);
        }
        (first, count)
    }

    fn resample(&self, ret: &Return) -> Vec<u8> {
        let n = ret.num_samples();
        let cells = self.cells as usize;
        let mut row = vec![0u8; cells];
        if n == 0 {
            return row;
        }
        for (c, slot) in row.iter_mut().enumerate() {
            let i0 = c * n / cells;
            let i1 = ((c + 1) * n / cells).max(i0 + 1).min(n);
            *slot = (i0..i1).map(|i| ret.samples.level(i)).max().unwrap_or(0);
        }
        row
    }

    #[inline]
    pub fn value(&self, azimuth: u32, cell: u32) -> u8 {
        if azimuth >= self.azimuths || cell >= self.cells {
            return 0;
        }
        self.data[azimuth as usize * self.cells as usize + cell as usize]
    }

    /// Peak over every cell of a pixel's box
    pub fn box_max(&self, cell_box: &CellBox) -> u8 {
        let mut peak = 0u8;
        let hi = cell_box.rng_hi.min(self.cells.saturating_sub(1));
        for k in 0..cell_box.azi_span {
            let azi = (cell_box.azi_lo + k) % self.azimuths;
            let row = azi as usize * self.cells as usize;
            for cell in cell_box.rng_lo..=hi {
                peak = peak.max(self.data[row + cell as usize]);
                if peak == u8::MAX {
                    return peak;
                }
            }
        }
        peak
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
        self.last_azimuth = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_returns_fill_gaps() {
        let mut pim = Pim::new(16, 8);
        pim.store(&Return::new_u8(0, 0.0, 80.0, vec![1; 8]));
        // 16-bit azimuth 8192 is row 2
        let (first, count) = pim.store(&Return::new_u8(8192, 0.0, 80.0, vec![7; 8]));
        assert_eq!((first, count), (1, 2));
        assert_eq!(pim.value(1, 0), 7);
        assert_eq!(pim.value(2, 7), 7);
        assert_eq!(pim.value(3, 0), 0);
    }

    #[test]
    fn resample_keeps_peaks() {
        let mut pim = Pim::new(4, 2);
        pim.store(&Return::new_u8(0, 0.0, 100.0, vec![0, 9, 3, 1]));
        assert_eq!(pim.value(0, 0), 9);
        assert_eq!(pim.value(0, 1), 3);
    }

    #[test]
    fn range_scale_change_clears() {
        let mut pim = Pim::new(4, 2);
        pim.set_range_scale(0.0, 100.0);
        pim.store(&Return::new_u8(0, 0.0, 100.0, vec![5, 5]));
        assert!(!pim.set_range_scale(0.0, 100.0));
        assert!(pim.set_range_scale(0.0, 200.0));
        assert_eq!(pim.value(0, 0), 0);
    }

    #[test]
    fn box_max_wraps_azimuth() {
        let mut pim = Pim::new(8, 4);
        pim.store(&Return::new_u8(7 * 8192, 0.0, 40.0, vec![0, 0, 200, 0]));
        let cell_box = CellBox {
            azi_lo: 6,
            azi_span: 3,
            rng_lo: 1,
            rng_hi: 2,
        };
        assert_eq!(pim.box_max(&cell_box), 200);
    }
}
