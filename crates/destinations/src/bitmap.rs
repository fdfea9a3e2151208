//! BitmapDest - lockable pixel memory fed by patch sets
//!
//! The destination keeps an 8-bit intensity plane (the fading buffer) and
//! renders every written pixel into the output memory: a colour index for
//! `Index8`, premultiplied RGBA for `Rgba32`. Writers and external readers
//! serialise on the bitmap lock; the dirty box has its own lock.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use contracts::{
    check, BitmapType, BitmapUpdateCallback, DirtyBox, DirtyRegion, FadeType, PatchSet, Rgb, ScControl,
    ScDest, ScError, ScResult, ScState, View, WinGeom, DEFAULT_FADING_INTERVAL_MS,
};
use scan_core::{FadeEngine, WIN_PARAM_REVOLUTION_MS};
use tracing::{debug, instrument, warn};

static GLOBAL_CALLBACK: Mutex<Option<BitmapUpdateCallback>> = Mutex::new(None);

/// Install (or remove) the callback used by bitmaps without their own
pub fn set_global_update_callback(callback: Option<BitmapUpdateCallback>) {
    *GLOBAL_CALLBACK
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = callback;
}

fn global_callback() -> Option<BitmapUpdateCallback> {
    GLOBAL_CALLBACK
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

fn identity_lut() -> [u8; 256] {
    let mut lut = [0u8; 256];
    for (v, slot) in lut.iter_mut().enumerate() {
        *slot = v as u8;
    }
    lut
}

/// State behind the bitmap lock
struct BitmapState {
    memory: Vec<u8>,
    plane: Vec<u8>,
    win: WinGeom,
    fade: FadeEngine,
    colour: Rgb,
    bright: u8,
    lut: [u8; 256],
    visible: bool,
    running: bool,
}

pub struct BitmapDest {
    name: String,
    max_w: u16,
    max_h: u16,
    bitmap_type: BitmapType,
    stride: usize,
    state: Mutex<BitmapState>,
    dirty: Mutex<DirtyRegion>,
    callback: Mutex<Option<BitmapUpdateCallback>>,
}

impl std::fmt::Debug for BitmapDest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitmapDest")
            .field("name", &self.name)
            .field("max_w", &self.max_w)
            .field("max_h", &self.max_h)
            .field("bitmap_type", &self.bitmap_type)
            .field("stride", &self.stride)
            .finish_non_exhaustive()
    }
}

/// Scoped hold on the bitmap lock
///
/// Patch application and fading block while a guard is alive.
pub struct BitmapGuard<'a> {
    state: MutexGuard<'a, BitmapState>,
    width: usize,
    stride: usize,
    bitmap_type: BitmapType,
}

impl BitmapGuard<'_> {
    /// Output memory, `stride` bytes per row
    pub fn pixels(&self) -> &[u8] {
        &self.state.memory
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn bitmap_type(&self) -> BitmapType {
        self.bitmap_type
    }

    pub fn win_geom(&self) -> WinGeom {
        self.state.win
    }

    /// Intensity before colour mapping
    pub fn value(&self, x: u16, y: u16) -> u8 {
        self.state
            .plane
            .get(y as usize * self.width + x as usize)
            .copied()
            .unwrap_or(0)
    }
}

impl BitmapDest {
    /// Allocate, or adopt `memory` when supplied.
    ///
    /// `stride` of 0 means tightly packed rows.
    pub fn create(
        name: impl Into<String>,
        max_w: u16,
        max_h: u16,
        bitmap_type: BitmapType,
        memory: Option<Vec<u8>>,
        stride: usize,
    ) -> ScResult<Self> {
        if max_w == 0 || max_h == 0 {
            return Err(ScError::invalid("bitmap.size", "max width and height must be > 0"));
        }
        let min_stride = max_w as usize * bitmap_type.bytes_per_pixel();
        let stride = if stride == 0 { min_stride } else { stride };
        if stride < min_stride {
            return Err(ScError::invalid(
                "bitmap.stride",
                format!("stride {stride} < {min_stride} for width {max_w}"),
            ));
        }
        let needed = stride * max_h as usize;
        let memory = match memory {
            Some(memory) if memory.len() < needed => {
                return Err(ScError::invalid(
                    "bitmap.memory",
                    format!("{} bytes supplied, {needed} needed", memory.len()),
                ));
            }
            Some(mut memory) => {
                memory.fill(0);
                memory
            }
            None => vec![0; needed],
        };
        let state = BitmapState {
            memory,
            plane: vec![0; max_w as usize * max_h as usize],
            win: WinGeom::new(0, 0, max_w, max_h),
            fade: FadeEngine::new(
                FadeType::RealTime,
                4,
                Duration::from_millis(DEFAULT_FADING_INTERVAL_MS),
            ),
            colour: Rgb::from_u32(0xffffff),
            bright: 255,
            lut: identity_lut(),
            visible: true,
            running: true,
        };
        Ok(Self {
            name: name.into(),
            max_w,
            max_h,
            bitmap_type,
            stride,
            state: Mutex::new(state),
            dirty: Mutex::new(DirtyRegion::new()),
            callback: Mutex::new(None),
        })
    }

    fn state(&self) -> MutexGuard<'_, BitmapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bitmap_type(&self) -> BitmapType {
        self.bitmap_type
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn lock_bitmap(&self) -> BitmapGuard<'_> {
        BitmapGuard {
            state: self.state(),
            width: self.max_w as usize,
            stride: self.stride,
            bitmap_type: self.bitmap_type,
        }
    }

    pub fn lock_dirty_box(&self) -> MutexGuard<'_, DirtyRegion> {
        self.dirty.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Changed area since the last call
    pub fn take_dirty_box(&self) -> Option<DirtyBox> {
        self.lock_dirty_box().take()
    }

    pub fn set_update_callback(&self, callback: Option<BitmapUpdateCallback>) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    pub fn is_visible(&self) -> bool {
        self.state().visible
    }

    pub fn win_geom(&self) -> WinGeom {
        self.state().win
    }

    pub fn value_at(&self, x: u16, y: u16) -> u8 {
        self.lock_bitmap().value(x, y)
    }

    pub fn fade_interval(&self) -> Duration {
        self.state().fade.interval()
    }

    pub fn set_fade_interval(&self, interval: Duration) {
        self.state().fade.set_interval(interval);
    }

    fn notify(&self, dirty: DirtyBox) {
        self.lock_dirty_box().merge(&dirty);
        let own = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = own.or_else(global_callback) {
            callback(&self.name, dirty);
        }
    }

    /// One real-time fade step if the interval has elapsed.
    ///
    /// Returns false when the call was suppressed.
    #[instrument(name = "bitmap_fade", level = "trace", skip(self), fields(dest = %self.name))]
    pub fn fade_bitmap(&self) -> ScResult<bool> {
        let win = {
            let mut state = self.state();
            if !state.fade.step_due(Instant::now()) {
                return Ok(false);
            }
            let BitmapState { plane, fade, .. } = &mut *state;
            if !fade.apply(plane) {
                return Ok(true);
            }
            let win = state.win;
            self.render_rect(&mut state, 0, 0, win.w, win.h);
            win
        };
        observability::record_fade_step(&self.name);
        let mut region = DirtyRegion::new();
        region.add_rect(0, 0, win.w, win.h);
        if let Some(dirty) = region.take() {
            self.notify(dirty);
        }
        Ok(true)
    }

    /// Rebuild output memory from the plane for a rectangle
    fn render_rect(&self, state: &mut BitmapState, x: u16, y: u16, w: u16, h: u16) {
        let bpp = self.bitmap_type.bytes_per_pixel();
        let width = self.max_w as usize;
        for row in y as usize..(y + h) as usize {
            for col in x as usize..(x + w) as usize {
                let value = state.plane[row * width + col];
                let level = state.lut[value as usize];
                let at = row * self.stride + col * bpp;
                match self.bitmap_type {
                    BitmapType::Index8 => state.memory[at] = level,
                    BitmapType::Rgba32 => {
                        let scaled = level as u32 * state.bright as u32 / 255;
                        let channel = |c: u8| (c as u32 * scaled / 255) as u8;
                        state.memory[at] = channel(state.colour.r);
                        state.memory[at + 1] = channel(state.colour.g);
                        state.memory[at + 2] = channel(state.colour.b);
                        state.memory[at + 3] = scaled as u8;
                    }
                }
            }
        }
    }

    fn fill_window(&self, value: u8) -> WinGeom {
        let mut state = self.state();
        let width = self.max_w as usize;
        let win = state.win;
        for row in 0..win.h as usize {
            state.plane[row * width..row * width + win.w as usize].fill(value);
        }
        self.render_rect(&mut state, 0, 0, win.w, win.h);
        win
    }

    /// Write the visible window to a PNG file
    pub fn snapshot_png(&self, path: impl AsRef<Path>) -> ScResult<()> {
        let guard = self.lock_bitmap();
        let win = guard.win_geom();
        let bpp = self.bitmap_type.bytes_per_pixel();
        let mut buffer = Vec::with_capacity(win.area() * bpp);
        for row in 0..win.h as usize {
            let start = row * self.stride;
            buffer.extend_from_slice(&guard.pixels()[start..start + win.w as usize * bpp]);
        }
        drop(guard);
        let colour_type = match self.bitmap_type {
            BitmapType::Index8 => image::ColorType::L8,
            BitmapType::Rgba32 => image::ColorType::Rgba8,
        };
        image::save_buffer(path.as_ref(), &buffer, win.w as u32, win.h as u32, colour_type)
            .map_err(|e| ScError::Io(std::io::Error::other(e)))?;
        debug!(dest = %self.name, path = %path.as_ref().display(), "snapshot written");
        Ok(())
    }
}

impl ScControl for BitmapDest {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_win_pos(&self, x: i16, y: i16) -> ScResult<()> {
        let mut state = self.state();
        state.win.x = x;
        state.win.y = y;
        Ok(())
    }

    fn set_win_geom(&self, geom: WinGeom) -> ScResult<()> {
        geom.validate(self.max_w, self.max_h)?;
        {
            let mut state = self.state();
            state.plane.fill(0);
            state.memory.fill(0);
            state.win = geom;
        }
        let mut region = DirtyRegion::new();
        region.add_rect(0, 0, geom.w, geom.h);
        if let Some(dirty) = region.take() {
            self.notify(dirty);
        }
        Ok(())
    }

    fn set_win_param(&self, param: u16, arg1: u32, _arg2: u32) -> ScResult<()> {
        match param {
            WIN_PARAM_REVOLUTION_MS => {
                self.state()
                    .fade
                    .set_revolution(Duration::from_millis(arg1 as u64));
                Ok(())
            }
            _ => Err(ScError::not_supported("set_win_param", self.name.clone())),
        }
    }

    fn set_fade(&self, rid: u8, fade_type: FadeType, rate: u16) -> ScResult<()> {
        check::rid(rid)?;
        self.state().fade.configure(fade_type, rate)
    }

    fn set_view(&self, view: View) -> ScResult<()> {
        view.validate()
    }

    fn pan_view(&self, _x: f32, _y: f32, clear_trails: bool) -> ScResult<()> {
        if clear_trails {
            self.clear(0)?;
        }
        Ok(())
    }

    fn set_radar_colour(&self, rid: u8, colour: Rgb) -> ScResult<()> {
        check::rid(rid)?;
        let mut state = self.state();
        state.colour = colour;
        let win = state.win;
        self.render_rect(&mut state, 0, 0, win.w, win.h);
        Ok(())
    }

    fn set_radar_bright(&self, rid: u8, bright: u8) -> ScResult<()> {
        check::rid(rid)?;
        let mut state = self.state();
        state.bright = bright;
        let win = state.win;
        self.render_rect(&mut state, 0, 0, win.w, win.h);
        Ok(())
    }

    fn set_radar_lut(&self, rid: u8, lut: &[u8; 256]) -> ScResult<()> {
        check::rid(rid)?;
        let mut state = self.state();
        state.lut = *lut;
        let win = state.win;
        self.render_rect(&mut state, 0, 0, win.w, win.h);
        Ok(())
    }

    fn show_radar(&self, rid: u8, sc_state: ScState) -> ScResult<()> {
        check::rid(rid)?;
        match sc_state {
            ScState::Hidden => self.state().visible = false,
            ScState::Visible => self.state().visible = true,
            ScState::Run => self.state().running = true,
            ScState::StopAndFade => self.state().running = false,
            ScState::StopAndClear => {
                self.state().running = false;
                self.clear(0)?;
            }
        }
        Ok(())
    }

    /// Applies every patch under one hold of the bitmap lock
    #[instrument(name = "bitmap_patch_set", level = "trace", skip(self, patches), fields(dest = %self.name, n = patches.len()))]
    fn patch_set(&self, patches: &PatchSet) -> ScResult<()> {
        let mut region = DirtyRegion::new();
        {
            let mut state = self.state();
            let win = state.win;
            let width = self.max_w as usize;
            for patch in &patches.patches {
                if patch.x >= win.w || patch.y >= win.h {
                    warn!(dest = %self.name, x = patch.x, y = patch.y, "patch outside window dropped");
                    observability::record_malformed("patch_outside_window");
                    continue;
                }
                let w = patch.w.min(win.w - patch.x);
                let h = patch.h.min(win.h - patch.y);
                for py in 0..h {
                    let row = (patch.y + py) as usize * width;
                    for px in 0..w {
                        state.plane[row + (patch.x + px) as usize] = patch.get(px, py);
                    }
                }
                self.render_rect(&mut state, patch.x, patch.y, w, h);
                region.add_rect(patch.x, patch.y, w, h);
            }
        }
        if let Some(dirty) = region.take() {
            self.notify(dirty);
        }
        Ok(())
    }

    fn set_source(&self, _source_id: u32, _arg1: u32, _arg2: u32) -> ScResult<()> {
        self.clear(0)
    }

    fn set_radar_position(&self, _x: f32, _y: f32, clear_trails: bool) -> ScResult<()> {
        if clear_trails {
            self.clear(0)?;
        }
        Ok(())
    }
}

impl ScDest for BitmapDest {
    fn max_size(&self) -> (u16, u16) {
        (self.max_w, self.max_h)
    }

    fn clear(&self, value: u8) -> ScResult<()> {
        let win = self.fill_window(value);
        let mut region = DirtyRegion::new();
        region.add_rect(0, 0, win.w, win.h);
        if let Some(dirty) = region.take() {
            self.notify(dirty);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{Patch, PatchFormat};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn bitmap(w: u16, h: u16) -> BitmapDest {
        BitmapDest::create("bmp", w, h, BitmapType::Index8, None, 0).unwrap()
    }

    fn sample_set(format: PatchFormat) -> PatchSet {
        let mut set = PatchSet::new(format);
        let gradient: Vec<u8> = (0..12).map(|v| v * 20).collect();
        set.push(Patch::new(2, 3, 4, 3, gradient).unwrap());
        set.push(Patch::filled(10, 0, 5, 5, 77).unwrap());
        set
    }

    #[test]
    fn create_validates_memory_and_stride() {
        assert!(BitmapDest::create("a", 0, 10, BitmapType::Index8, None, 0).is_err());
        assert!(BitmapDest::create("b", 10, 10, BitmapType::Rgba32, None, 39).is_err());
        assert!(BitmapDest::create("c", 10, 10, BitmapType::Index8, Some(vec![0; 99]), 10).is_err());
        let adopted =
            BitmapDest::create("d", 10, 10, BitmapType::Index8, Some(vec![9; 160]), 16).unwrap();
        assert_eq!(adopted.stride(), 16);
        assert_eq!(adopted.lock_bitmap().pixels().len(), 160);
    }

    #[test]
    fn patches_match_direct_writes() {
        let bmp = bitmap(32, 32);
        let set = sample_set(PatchFormat::Raw8);
        bmp.patch_set(&set).unwrap();
        let guard = bmp.lock_bitmap();
        for patch in &set.patches {
            for py in 0..patch.h {
                for px in 0..patch.w {
                    let (x, y) = (patch.x + px, patch.y + py);
                    assert_eq!(guard.value(x, y), patch.get(px, py));
                    assert_eq!(guard.pixels()[y as usize * 32 + x as usize], patch.get(px, py));
                }
            }
        }
        assert_eq!(guard.value(0, 0), 0);
    }

    #[test]
    fn wire_encoding_is_lossless() {
        for format in [PatchFormat::Raw8, PatchFormat::Rle8] {
            let direct = bitmap(32, 32);
            let via_wire = bitmap(32, 32);
            let set = sample_set(format);
            direct.patch_set(&set).unwrap();
            let words = set.encode_words();
            let decoded = PatchSet::decode(format.as_u8(), set.len() as u16, &words).unwrap();
            via_wire.patch_set(&decoded).unwrap();
            assert_eq!(direct.lock_bitmap().pixels(), via_wire.lock_bitmap().pixels());
        }
    }

    #[test]
    fn fade_is_rate_limited() {
        let bmp = bitmap(8, 8);
        bmp.set_fade_interval(Duration::from_secs(60));
        bmp.patch_set(&PatchSet {
            format: PatchFormat::Raw8,
            patches: vec![Patch::filled(0, 0, 8, 8, 200).unwrap()],
        })
        .unwrap();
        assert!(bmp.fade_bitmap().unwrap());
        let after_first = bmp.value_at(0, 0);
        assert!(after_first < 200);
        assert!(!bmp.fade_bitmap().unwrap());
        assert_eq!(bmp.value_at(0, 0), after_first);
    }

    #[test]
    fn replace_mode_never_fades() {
        let bmp = bitmap(4, 4);
        bmp.set_fade(0, FadeType::Replace, 1).unwrap();
        assert!(!bmp.fade_bitmap().unwrap());
    }

    #[test]
    fn dirty_box_widens_then_resets() {
        let bmp = bitmap(32, 32);
        bmp.take_dirty_box();
        bmp.patch_set(&sample_set(PatchFormat::Rle8)).unwrap();
        let dirty = bmp.take_dirty_box().unwrap();
        assert_eq!((dirty.x, dirty.y, dirty.w, dirty.h), (2, 0, 13, 6));
        assert!(bmp.take_dirty_box().is_none());
    }

    #[test]
    fn own_callback_preferred_over_global() {
        let global_hits = Arc::new(AtomicU32::new(0));
        let own_hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&global_hits);
        set_global_update_callback(Some(Arc::new(move |name: &str, _dirty: DirtyBox| {
            if name == "cb-test" {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })));
        let bmp = BitmapDest::create("cb-test", 16, 16, BitmapType::Index8, None, 0).unwrap();
        bmp.patch_set(&sample_set(PatchFormat::Raw8)).unwrap();
        assert_eq!(global_hits.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&own_hits);
        bmp.set_update_callback(Some(Arc::new(move |_: &str, _: DirtyBox| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        bmp.patch_set(&sample_set(PatchFormat::Raw8)).unwrap();
        assert_eq!(own_hits.load(Ordering::SeqCst), 1);
        assert_eq!(global_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rgba_uses_colour_and_brightness() {
        let bmp = BitmapDest::create("rgba", 4, 4, BitmapType::Rgba32, None, 0).unwrap();
        bmp.set_radar_colour(0, Rgb::from_u32(0x00ff00)).unwrap();
        bmp.set_radar_bright(0, 255).unwrap();
        bmp.patch_set(&PatchSet {
            format: PatchFormat::Raw8,
            patches: vec![Patch::filled(1, 1, 1, 1, 255).unwrap()],
        })
        .unwrap();
        let guard = bmp.lock_bitmap();
        let at = guard.stride() + 4;
        assert_eq!(&guard.pixels()[at..at + 4], &[0, 255, 0, 255]);
    }

    #[test]
    fn stop_and_clear_zeroes_window() {
        let bmp = bitmap(16, 16);
        bmp.patch_set(&sample_set(PatchFormat::Raw8)).unwrap();
        bmp.show_radar(0, ScState::StopAndClear).unwrap();
        assert!(bmp.lock_bitmap().pixels().iter().all(|v| *v == 0));
        bmp.show_radar(0, ScState::Hidden).unwrap();
        assert!(!bmp.is_visible());
    }

    #[test]
    fn oversize_geometry_rejected() {
        let bmp = bitmap(16, 16);
        assert!(bmp.set_win_geom(WinGeom::new(0, 0, 17, 16)).is_err());
        assert_eq!(bmp.win_geom(), WinGeom::new(0, 0, 16, 16));
        bmp.set_win_geom(WinGeom::new(0, 0, 8, 8)).unwrap();
        assert_eq!(bmp.win_geom(), WinGeom::new(0, 0, 8, 8));
    }

    #[test]
    fn rotation_not_supported() {
        let bmp = bitmap(4, 4);
        assert!(bmp.set_rotation_degs(45.0).unwrap_err().is_not_supported());
        assert!(bmp.set_win_param(42, 0, 0).unwrap_err().is_not_supported());
        assert!(bmp.set_win_param(WIN_PARAM_REVOLUTION_MS, 2000, 0).is_ok());
    }

    #[test]
    fn snapshot_writes_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.png");
        let bmp = bitmap(24, 16);
        bmp.patch_set(&sample_set(PatchFormat::Raw8)).unwrap();
        bmp.snapshot_png(&path).unwrap();
        let img = image::open(&path).unwrap();
        assert_eq!((img.width(), img.height()), (24, 16));
    }
}
