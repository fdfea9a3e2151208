//! Dirty box: bounding rectangle of pixels changed since the last flush

use serde::{Deserialize, Serialize};

/// Flushed dirty rectangle
///
/// `weight` counts pixel writes, `density` is writes per 100 pixels of area
/// (capped at 100). Receivers use density to decide between patching the
/// box and repainting everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DirtyBox {
    pub x: u16,
    pub y: u16,
    pub w: u16,
    pub h: u16,
    pub weight: u32,
    pub density: u16,
}

impl DirtyBox {
    pub fn contains(&self, x: u16, y: u16) -> bool {
        x >= self.x
            && y >= self.y
            && (x as u32) < self.x as u32 + self.w as u32
            && (y as u32) < self.y as u32 + self.h as u32
    }

    pub fn area(&self) -> u32 {
        self.w as u32 * self.h as u32
    }
}

/// Accumulator behind a `DirtyBox`
#[derive(Debug, Clone, Default)]
pub struct DirtyRegion {
    bounds: Option<(u16, u16, u16, u16)>,
    weight: u32,
}

impl DirtyRegion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_none()
    }

    #[inline]
    pub fn add_pixel(&mut self, x: u16, y: u16) {
        self.add_rect(x, y, 1, 1);
    }

    /// Widen by an inclusive-exclusive rectangle; empty rectangles are ignored
    pub fn add_rect(&mut self, x: u16, y: u16, w: u16, h: u16) {
        if w == 0 || h == 0 {
            return;
        }
        let x1 = x.saturating_add(w - 1);
        let y1 = y.saturating_add(h - 1);
        self.bounds = Some(match self.bounds {
            None => (x, y, x1, y1),
            Some((bx0, by0, bx1, by1)) => (bx0.min(x), by0.min(y), bx1.max(x1), by1.max(y1)),
        });
        self.weight = self.weight.saturating_add(w as u32 * h as u32);
    }

    pub fn merge(&mut self, other: &DirtyBox) {
        if other.w == 0 || other.h == 0 {
            return;
        }
        let weight = self.weight;
        self.add_rect(other.x, other.y, other.w, other.h);
        self.weight = weight.saturating_add(other.weight);
    }

    /// Current box without resetting
    pub fn peek(&self) -> Option<DirtyBox> {
        let (x0, y0, x1, y1) = self.bounds?;
        let w = x1 - x0 + 1;
        let h = y1 - y0 + 1;
        let area = (w as u64 * h as u64).max(1);
        let density = ((self.weight as u64 * 100) / area).min(100) as u16;
        Some(DirtyBox {
            x: x0,
            y: y0,
            w,
            h,
            weight: self.weight,
            density,
        })
    }

    /// Flush: return the box and reset
    pub fn take(&mut self) -> Option<DirtyBox> {
        let dirty = self.peek();
        self.bounds = None;
        self.weight = 0;
        dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widens_and_resets() {
        let mut region = DirtyRegion::new();
        assert!(region.take().is_none());
        region.add_pixel(10, 10);
        region.add_pixel(20, 5);
        let dirty = region.take().unwrap();
        assert_eq!((dirty.x, dirty.y, dirty.w, dirty.h), (10, 5, 11, 6));
        assert_eq!(dirty.weight, 2);
        assert!(dirty.contains(20, 10));
        assert!(!dirty.contains(21, 10));
        assert!(region.is_empty());
    }

    #[test]
    fn density_is_capped() {
        let mut region = DirtyRegion::new();
        region.add_rect(0, 0, 4, 4);
        region.add_rect(0, 0, 4, 4);
        assert_eq!(region.peek().unwrap().density, 100);
    }

    #[test]
    fn empty_rect_ignored() {
        let mut region = DirtyRegion::new();
        region.add_rect(3, 3, 0, 9);
        assert!(region.is_empty());
    }
}
