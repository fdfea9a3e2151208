//! Output zones: the table is tiled into squares and only zones that saw a
//! pixel change are turned into patches at the next output.

use contracts::{DirtyBox, DirtyRegion};

#[derive(Debug, Clone)]
pub struct ZoneTable {
    zone_size: u16,
    width: u16,
    height: u16,
    cols: u16,
    rows: u16,
    dirty: Vec<bool>,
    pending: usize,
    region: DirtyRegion,
}

/// Table-pixel rectangle of one zone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zone {
    pub x: u16,
    pub y: u16,
    pub w: u16,
    pub h: u16,
}

impl ZoneTable {
    pub fn new(width: u16, height: u16, zone_size: u16) -> Self {
        let zone_size = zone_size.max(1);
        let cols = width.div_ceil(zone_size);
        let rows = height.div_ceil(zone_size);
        Self {
            zone_size,
            width,
            height,
            cols,
            rows,
            dirty: vec![false; cols as usize * rows as usize],
            pending: 0,
            region: DirtyRegion::new(),
        }
    }

    #[inline]
    pub fn mark(&mut self, x: u16, y: u16) {
        let idx = (y / self.zone_size) as usize * self.cols as usize + (x / self.zone_size) as usize;
        if let Some(flag) = self.dirty.get_mut(idx) {
            if !*flag {
                *flag = true;
                self.pending += 1;
            }
        }
        self.region.add_pixel(x, y);
    }

    pub fn mark_all(&mut self) {
        self.dirty.fill(true);
        self.pending = self.dirty.len();
        self.region.add_rect(0, 0, self.width, self.height);
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Dirty zones plus the pixel-level dirty box; resets both
    pub fn take(&mut self) -> (Vec<Zone>, Option<DirtyBox>) {
        let mut zones = Vec::with_capacity(self.pending);
        if self.pending > 0 {
            for (idx, flag) in self.dirty.iter_mut().enumerate() {
                if !*flag {
                    continue;
                }
                *flag = false;
                let zx = (idx % self.cols as usize) as u16 * self.zone_size;
                let zy = (idx / self.cols as usize) as u16 * self.zone_size;
                zones.push(Zone {
                    x: zx,
                    y: zy,
                    w: self.zone_size.min(self.width - zx),
                    h: self.zone_size.min(self.height - zy),
                });
            }
        }
        self.pending = 0;
        (zones, self.region.take())
    }

    pub fn clear(&mut self) {
        self.dirty.fill(false);
        self.pending = 0;
        self.region.take();
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_collapse_per_zone() {
        let mut zones = ZoneTable::new(100, 50, 32);
        assert_eq!((zones.cols(), zones.rows()), (4, 2));
        zones.mark(1, 1);
        zones.mark(2, 2);
        zones.mark(99, 49);
        assert_eq!(zones.pending(), 2);
        let (taken, dirty) = zones.take();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[1], Zone { x: 96, y: 32, w: 4, h: 18 });
        let dirty = dirty.unwrap();
        assert_eq!((dirty.x, dirty.y, dirty.w, dirty.h), (1, 1, 99, 49));
        assert_eq!(zones.pending(), 0);
    }
}
