//! ScanConverter - polar returns to destination pixel planes.
//!
//! Holds the PIM, the pixel tables and one video plane per destination.
//! `new_data` ingests returns, converts the azimuths they cover and hands
//! dirty zones to destinations as patch sets once per output interval.
//!
//! All table recalculation and plane mutation is serialised by a single
//! mutex. With deferred calculations the tables are rebuilt on a worker
//! thread; returns arriving meanwhile are dropped.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use contracts::{
    check, DestRef, FadeType, MpRefMode, OutputReport, Patch, PatchFormat, PatchSet, Return, Rgb,
    RunState, ScControl, ScError, ScResult, ScState, ScType, ScanConfig, SscConfig, SweepLine,
    View, WinGeom, MAX_DESTINATIONS,
};
use tracing::{debug, instrument, warn};

use crate::fade::{FadeEngine, WIN_PARAM_REVOLUTION_MS};
use crate::pim::Pim;
use crate::pixel_map::{Geometry, PixelTables};
use crate::ssc::Ssc;
use crate::true_trails::{TrailSnapshot, TrueTrails};
use crate::zones::ZoneTable;

/// Polar position under a screen pixel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointInfo {
    pub range_m: f64,
    pub azimuth_degs: f64,
    pub pim_azimuth: u32,
    pub cell: u32,
    /// Live plane value (rid 0)
    pub value: u8,
}

struct DestSlot {
    rid: u8,
    dest: DestRef,
    video: Vec<u8>,
    fade: FadeEngine,
    zones: ZoneTable,
    run: RunState,
    visible: bool,
}

impl DestSlot {
    fn accepts_data(&self) -> bool {
        self.run == RunState::Running
    }
}

struct CoreState {
    sc_type: ScType,
    win: WinGeom,
    max_size: (u16, u16),
    view: View,
    radar: (f32, f32),
    rotation_degs: f64,
    mp_ref_mode: MpRefMode,
    scale: u8,
    anticlockwise: bool,
    slant_height_m: f32,
    zone_size: u16,
    fade_interval: Duration,
    sweep: SweepLine,
    sweep_pixels: Vec<u32>,
    sweep_mask: Vec<bool>,
    last_row: Option<u32>,
    pim: Pim,
    tables: Option<Arc<PixelTables>>,
    generation: u64,
    defer_calcs: bool,
    ssc: Ssc,
    trails: TrueTrails,
    dests: [Option<DestSlot>; MAX_DESTINATIONS],
    clear_value: u8,
    source: (u32, u32, u32),
    output_interval: Duration,
    last_output: Option<Instant>,
    patch_format: PatchFormat,
    last_north: Option<Instant>,
    revolution: Option<Duration>,
    returns_ingested: u32,
    returns_dropped: u32,
}

impl CoreState {
    fn geometry(&self) -> Option<Geometry> {
        let (start_range, end_range) = self.pim.range_scale();
        if end_range <= start_range {
            return None;
        }
        Some(Geometry {
            sc_type: self.sc_type,
            win_w: self.win.w,
            win_h: self.win.h,
            scale: self.scale,
            view: self.view,
            radar: self.radar,
            rotation_degs: self.rotation_degs,
            anticlockwise: self.anticlockwise,
            slant_height_m: self.slant_height_m,
            pim_azimuths: self.pim.azimuths(),
            pim_cells: self.pim.cells(),
            start_range,
            end_range,
        })
    }

    fn slots_mut(&mut self) -> impl Iterator<Item = &mut DestSlot> {
        self.dests.iter_mut().flatten()
    }

    fn slot_mut(&mut self, rid: u8) -> ScResult<&mut DestSlot> {
        self.dests
            .get_mut(rid as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| ScError::invalid("rid", format!("no destination for radar id {rid}")))
    }

    fn any_running(&self) -> bool {
        self.dests.iter().flatten().any(DestSlot::accepts_data)
    }

    /// Largest window every destination can hold
    fn effective_max(&self) -> (u16, u16) {
        self.dests
            .iter()
            .flatten()
            .map(|slot| slot.dest.max_size())
            .fold(self.max_size, |(w, h), (dw, dh)| (w.min(dw), h.min(dh)))
    }

    /// Install freshly built tables and rebuild every plane from history
    fn install(&mut self, tables: Arc<PixelTables>) {
        let area = tables.width() as usize * tables.height() as usize;
        let (width, height) = (tables.width(), tables.height());
        let zone_size = self.zone_size;
        let clear_value = self.clear_value;
        self.ssc.resize(area);
        self.sweep_mask = vec![false; area];
        self.sweep_pixels.clear();
        for slot in self.slots_mut() {
            slot.video = vec![clear_value; area];
            slot.zones = ZoneTable::new(width, height, zone_size);
        }
        self.tables = Some(tables);
        self.redraw_all();
    }

    /// Recompute every covered pixel from the PIM and true trails
    fn redraw_all(&mut self) {
        let Some(tables) = self.tables.clone() else {
            return;
        };
        let geometry = *tables.geometry();
        let width = tables.width() as u32;
        for entry in tables.entries() {
            let raw = match entry.cell_box {
                Some(cell_box) => self.pim.box_max(&cell_box),
                None => self.pim.value(entry.azimuth(), entry.cell()),
            };
            let (px, py) = ((entry.pixel % width) as u16, (entry.pixel / width) as u16);
            let trail = if self.trails.is_empty() {
                0
            } else {
                let (wx, wy) = geometry.table_pixel_world(px, py);
                self.trails.sample(wx, wy)
            };
            let value = raw.max(trail);
            for slot in self.dests.iter_mut().flatten() {
                if slot.run == RunState::StoppedCleared {
                    continue;
                }
                slot.video[entry.pixel as usize] = value;
            }
        }
        for slot in self.slots_mut() {
            slot.zones.mark_all();
        }
    }

    /// Convert every pixel owned by one PIM azimuth
    fn convert_azimuth(&mut self, tables: &PixelTables, row: u32) {
        let width = tables.width() as u32;
        let geometry = *tables.geometry();
        let track_trails = !self.trails.is_empty();
        for entry in tables.azimuth(row) {
            let raw = match entry.cell_box {
                Some(cell_box) => self.pim.box_max(&cell_box),
                None => self.pim.value(row, entry.cell()),
            };
            let value = self.ssc.process(entry.pixel as usize, raw);
            let (px, py) = ((entry.pixel % width) as u16, (entry.pixel / width) as u16);
            if track_trails && value > 0 {
                let (wx, wy) = geometry.table_pixel_world(px, py);
                self.trails.write(wx, wy, value);
            }
            for slot in self.dests.iter_mut().flatten() {
                if !slot.accepts_data() {
                    continue;
                }
                let idx = entry.pixel as usize;
                let old = slot.video[idx];
                let new = slot.fade.combine(old, value);
                if new != old {
                    slot.video[idx] = new;
                    slot.zones.mark(px, py);
                }
            }
        }
    }

    /// Move the sweep line to `row`, marking old and new pixels for output
    fn update_sweep_line(&mut self, tables: &PixelTables, row: Option<u32>) {
        let width = tables.width() as u32;
        let old = std::mem::take(&mut self.sweep_pixels);
        for &pixel in &old {
            if let Some(flag) = self.sweep_mask.get_mut(pixel as usize) {
                *flag = false;
            }
        }
        let new: Vec<u32> = match (self.sweep.is_on(), row) {
            (true, Some(row)) => tables.azimuth(row).iter().map(|e| e.pixel).collect(),
            _ => Vec::new(),
        };
        for &pixel in &new {
            if let Some(flag) = self.sweep_mask.get_mut(pixel as usize) {
                *flag = true;
            }
        }
        for pixel in old.iter().chain(new.iter()) {
            let (px, py) = ((pixel % width) as u16, (pixel / width) as u16);
            for slot in self.dests.iter_mut().flatten() {
                if !slot.dest.draws_sweep_line() {
                    slot.zones.mark(px, py);
                }
            }
        }
        self.sweep_pixels = new;
        if let (true, Some(row)) = (self.sweep.is_on(), row) {
            let azimuth = ((row as u64 * 65536) / self.pim.azimuths().max(1) as u64) as u16;
            for slot in self.dests.iter().flatten() {
                if slot.dest.draws_sweep_line() {
                    slot.dest.sweep_azimuth(azimuth);
                }
            }
        }
    }

    /// Real-time fade of every plane whose interval has elapsed
    fn fade_tick(&mut self, now: Instant) {
        let width = self.tables.as_ref().map_or(0, |t| t.width() as usize).max(1);
        let mut trail_lut = None;
        for slot in self.dests.iter_mut().flatten() {
            if slot.run == RunState::StoppedCleared {
                continue;
            }
            if slot.fade.step_due(now) {
                let zones = &mut slot.zones;
                slot.fade.apply_with(&mut slot.video, |idx| {
                    zones.mark((idx % width) as u16, (idx / width) as u16);
                });
                observability::record_fade_step(slot.dest.name());
                trail_lut = Some(*slot.fade.lut());
            }
        }
        if let Some(lut) = trail_lut {
            self.trails.fade(&lut);
        }
    }

    fn note_row(&mut self, row: u32, now: Instant) {
        let n = self.pim.azimuths();
        if let Some(last) = self.last_row {
            // crossed north going clockwise
            if row < last && last - row > n / 2 {
                if let Some(prev) = self.last_north {
                    let period = now.saturating_duration_since(prev);
                    self.set_revolution(period);
                }
                self.last_north = Some(now);
            }
        }
        self.last_row = Some(row);
    }

    fn set_revolution(&mut self, period: Duration) {
        if period.is_zero() {
            return;
        }
        let changed = self.revolution.is_none_or(|old| {
            let (a, b) = (old.as_secs_f64(), period.as_secs_f64());
            (a - b).abs() > a * 0.1
        });
        self.revolution = Some(period);
        if !changed {
            return;
        }
        let ms = period.as_millis().min(u32::MAX as u128) as u32;
        for slot in self.dests.iter_mut().flatten() {
            slot.fade.set_revolution(period);
            if let Err(err) = slot.dest.set_win_param(WIN_PARAM_REVOLUTION_MS, ms, 0) {
                if !err.is_not_supported() {
                    warn!(dest = %slot.dest.name(), error = %err, "revolution update rejected");
                }
            }
        }
    }

    fn clear_all(&mut self) -> ScResult<()> {
        let clear_value = self.clear_value;
        self.pim.clear();
        self.ssc.clear();
        self.trails.clear();
        self.sweep_pixels.clear();
        self.sweep_mask.fill(false);
        self.last_row = None;
        for slot in self.slots_mut() {
            slot.video.fill(clear_value);
            slot.zones.clear();
            slot.dest.clear(clear_value)?;
        }
        Ok(())
    }

    /// Build the patch set for one destination's dirty zones
    fn build_patches(&mut self, rid: usize) -> ScResult<Option<(PatchSet, Option<contracts::DirtyBox>)>> {
        let Some(tables) = self.tables.clone() else {
            return Ok(None);
        };
        let scale = self.scale.max(1) as u16;
        let table_w = tables.width() as usize;
        let (win_w, win_h) = (self.win.w, self.win.h);
        let sweep = self.sweep;
        let format = self.patch_format;
        let sweep_mask = &self.sweep_mask;
        let Some(slot) = self.dests[rid].as_mut() else {
            return Ok(None);
        };
        if !slot.visible || slot.run == RunState::StoppedCleared {
            return Ok(None);
        }
        let baked_sweep = sweep.is_on() && !slot.dest.draws_sweep_line();
        let (zones, dirty) = slot.zones.take();
        if zones.is_empty() {
            return Ok(None);
        }
        let mut set = PatchSet::new(format);
        for zone in zones {
            let sx = zone.x * scale;
            let sy = zone.y * scale;
            if sx >= win_w || sy >= win_h {
                continue;
            }
            let w = (zone.w * scale).min(win_w - sx);
            let h = (zone.h * scale).min(win_h - sy);
            let mut pixels = Vec::with_capacity(w as usize * h as usize);
            for y in sy..sy + h {
                let row = (y / scale) as usize * table_w;
                for x in sx..sx + w {
                    let idx = row + (x / scale) as usize;
                    let value = slot.video[idx];
                    pixels.push(if baked_sweep && sweep_mask[idx] {
                        sweep.combine(value)
                    } else {
                        value
                    });
                }
            }
            set.push(Patch::new(sx, sy, w, h, pixels)?);
        }
        if set.is_empty() {
            return Ok(None);
        }
        let dirty = dirty.map(|mut dirty| {
            dirty.x *= scale;
            dirty.y *= scale;
            dirty.w = (dirty.w * scale).min(win_w.saturating_sub(dirty.x));
            dirty.h = (dirty.h * scale).min(win_h.saturating_sub(dirty.y));
            dirty
        });
        Ok(Some((set, dirty)))
    }
}

struct Inner {
    state: Mutex<CoreState>,
    tables_ready: Condvar,
}

/// Local scan converter
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct ScanConverter {
    name: Arc<str>,
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ScanConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanConverter")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ScanConverter {
    /// Create a converter from scan configuration.
    ///
    /// `max_size` bounds the window before any destination is attached.
    pub fn new(name: impl Into<String>, config: &ScanConfig, max_size: (u16, u16)) -> ScResult<Self> {
        config.window.validate(max_size.0, max_size.1)?;
        config.view.validate()?;
        if !config.pim_azimuths.is_power_of_two() {
            return Err(ScError::invalid("pim_azimuths", "must be a power of two"));
        }
        if config.pim_samples == 0 {
            return Err(ScError::invalid("pim_samples", "must be > 0"));
        }
        check::scale_factor(config.scale_factor)?;
        let trails = TrueTrails::new(
            config.true_trails.dimension,
            &config.true_trails.ranges,
            (config.radar_position[0] as f64, config.radar_position[1] as f64),
        )?;
        let state = CoreState {
            sc_type: config.sc_type,
            win: config.window,
            max_size,
            view: config.view,
            radar: (config.radar_position[0], config.radar_position[1]),
            rotation_degs: 0.0,
            mp_ref_mode: MpRefMode::Normal,
            scale: config.scale_factor,
            anticlockwise: config.anticlockwise,
            slant_height_m: config.slant_height_m,
            zone_size: config.zone_size,
            fade_interval: Duration::from_millis(contracts::DEFAULT_FADING_INTERVAL_MS),
            sweep: config.sweep_line,
            sweep_pixels: Vec::new(),
            sweep_mask: Vec::new(),
            last_row: None,
            pim: Pim::new(config.pim_azimuths as u32, config.pim_samples as u32),
            tables: None,
            generation: 0,
            defer_calcs: config.defer_calcs,
            ssc: Ssc::new(config.ssc, 0)?,
            trails,
            dests: [None, None],
            clear_value: config.clear_value,
            source: (0, 0, 0),
            output_interval: Duration::from_millis(config.output_interval_ms),
            last_output: Some(Instant::now()),
            patch_format: PatchFormat::Rle8,
            last_north: None,
            revolution: None,
            returns_ingested: 0,
            returns_dropped: 0,
        };
        Ok(Self {
            name: Arc::from(name.into()),
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                tables_ready: Condvar::new(),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, CoreState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a destination as radar id `rid` (0 live, 1 trails)
    #[instrument(name = "sc_add_dest", skip(self, dest, fade), fields(converter = %self.name, dest = %dest.name()))]
    pub fn add_dest(&self, rid: u8, dest: DestRef, fade: (FadeType, u16)) -> ScResult<()> {
        check::rid(rid)?;
        let mut state = self.state();
        let (max_w, max_h) = dest.max_size();
        state.win.validate(max_w, max_h)?;
        dest.set_win_geom(state.win)?;
        dest.set_fade(rid, fade.0, fade.1)?;
        let mut engine = FadeEngine::new(fade.0, fade.1, state.fade_interval);
        if let Some(period) = state.revolution {
            engine.set_revolution(period);
        }
        let area = state
            .tables
            .as_ref()
            .map(|t| t.width() as usize * t.height() as usize)
            .unwrap_or(0);
        let zones = state
            .tables
            .as_ref()
            .map(|t| ZoneTable::new(t.width(), t.height(), state.zone_size))
            .unwrap_or_else(|| ZoneTable::new(0, 0, state.zone_size));
        let slot = DestSlot {
            rid,
            dest,
            video: vec![state.clear_value; area],
            fade: engine,
            zones,
            run: RunState::Running,
            visible: true,
        };
        state.dests[rid as usize] = Some(slot);
        state.redraw_all();
        debug!("destination attached");
        Ok(())
    }

    pub fn remove_dest(&self, rid: u8) -> Option<DestRef> {
        let mut state = self.state();
        state
            .dests
            .get_mut(rid as usize)
            .and_then(Option::take)
            .map(|slot| slot.dest)
    }

    /// Invalidate tables and rebuild them, inline or on a worker thread
    fn recalc(&self, state: &mut CoreState) {
        state.generation += 1;
        state.tables = None;
        let Some(geometry) = state.geometry() else {
            return;
        };
        if !state.defer_calcs {
            state.install(Arc::new(PixelTables::build(&geometry)));
            return;
        }
        let generation = state.generation;
        let inner = Arc::clone(&self.inner);
        let name = self.name.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("scconv-calc-{name}"))
            .spawn(move || {
                let tables = Arc::new(PixelTables::build(&geometry));
                let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.generation == generation {
                    state.install(tables);
                    inner.tables_ready.notify_all();
                    debug!(converter = %name, generation, "deferred tables installed");
                }
            });
        if let Err(err) = spawned {
            warn!(converter = %self.name, error = %err, "calc thread failed, computing inline");
            state.install(Arc::new(PixelTables::build(&geometry)));
        }
    }

    /// Block until tables are valid or `timeout` passes
    pub fn wait_for_tables(&self, timeout: Duration) -> bool {
        let state = self.state();
        let (state, _) = self
            .inner
            .tables_ready
            .wait_timeout_while(state, timeout, |s| s.tables.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        state.tables.is_some()
    }

    pub fn tables_valid(&self) -> bool {
        self.state().tables.is_some()
    }

    /// Ingest `num_azis` returns starting at `first_azi_idx`, wrapping
    /// around `returns`. With `run_process` false only the PIM is updated.
    ///
    /// Returns how many returns were scan converted.
    #[instrument(name = "sc_new_data", level = "trace", skip(self, returns), fields(converter = %self.name))]
    pub fn new_data(
        &self,
        run_process: bool,
        returns: &[Return],
        first_azi_idx: usize,
        num_azis: usize,
    ) -> ScResult<usize> {
        if returns.is_empty() || num_azis == 0 {
            return Ok(0);
        }
        let now = Instant::now();
        let mut state = self.state();
        if !state.any_running() {
            state.returns_dropped += num_azis as u32;
            return Ok(0);
        }
        let mut converted = 0usize;
        let mut last_row = None;
        for k in 0..num_azis {
            let ret = &returns[(first_azi_idx + k) % returns.len()];
            if ret.num_samples() == 0 || ret.end_range <= ret.start_range {
                state.returns_dropped += 1;
                continue;
            }
            if state.pim.set_range_scale(ret.start_range, ret.end_range) {
                debug!(start = ret.start_range, end = ret.end_range, "range scale changed");
                self.recalc(&mut state);
            }
            let (first_row, count) = state.pim.store(ret);
            let row = (first_row + count - 1) % state.pim.azimuths();
            state.note_row(row, now);
            if !run_process {
                continue;
            }
            let Some(tables) = state.tables.clone() else {
                state.returns_dropped += 1;
                continue;
            };
            for r in 0..count {
                let row = (first_row + r) % state.pim.azimuths();
                state.convert_azimuth(&tables, row);
            }
            last_row = Some(row);
            state.returns_ingested += 1;
            converted += 1;
        }
        if let (Some(row), Some(tables)) = (last_row, state.tables.clone()) {
            state.update_sweep_line(&tables, Some(row));
        }
        state.fade_tick(now);
        let due = state
            .last_output
            .is_none_or(|last| now.saturating_duration_since(last) >= state.output_interval);
        if due {
            self.output(&mut state, now);
        }
        Ok(converted)
    }

    /// Periodic housekeeping without new data: fading and output when due
    pub fn tick(&self) -> Option<OutputReport> {
        let now = Instant::now();
        let mut state = self.state();
        state.fade_tick(now);
        let due = state
            .last_output
            .is_none_or(|last| now.saturating_duration_since(last) >= state.output_interval);
        due.then(|| self.output(&mut state, now))
    }

    /// Send every dirty zone to the destinations now
    pub fn flush(&self) -> OutputReport {
        let now = Instant::now();
        let mut state = self.state();
        self.output(&mut state, now)
    }

    fn output(&self, state: &mut CoreState, now: Instant) -> OutputReport {
        let started = Instant::now();
        state.last_output = Some(now);
        let mut report = OutputReport {
            returns_ingested: std::mem::take(&mut state.returns_ingested),
            returns_dropped: std::mem::take(&mut state.returns_dropped),
            ..OutputReport::default()
        };
        let mut union = contracts::DirtyRegion::new();
        for rid in 0..MAX_DESTINATIONS {
            let built = match state.build_patches(rid) {
                Ok(Some(built)) => built,
                Ok(None) => continue,
                Err(err) => {
                    warn!(converter = %self.name, rid, error = %err, "patch build failed");
                    continue;
                }
            };
            let (set, dirty) = built;
            let Some(slot) = state.dests[rid].as_ref() else {
                continue;
            };
            let result = slot.dest.patch_set(&set);
            observability::record_patch_dispatched(slot.dest.name(), result.is_ok());
            if let Err(err) = result {
                warn!(converter = %self.name, dest = %slot.dest.name(), error = %err, "patch set rejected");
                continue;
            }
            report.patches += set.len() as u32;
            report.pixels += set.pixel_count() as u64;
            if let Some(dirty) = dirty {
                union.merge(&dirty);
            }
        }
        report.dirty = union.take();
        report.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        observability::record_output_metrics(&self.name, &report);
        report
    }

    /// Clear every plane, the PIM and true trails
    pub fn clear(&self) -> ScResult<()> {
        self.state().clear_all()
    }

    pub fn set_clear_value(&self, value: u8) {
        self.state().clear_value = value;
    }

    pub fn clear_value(&self) -> u8 {
        self.state().clear_value
    }

    /// Move table recalculation to a worker thread
    pub fn set_defer_calcs(&self, defer: bool) {
        self.state().defer_calcs = defer;
    }

    pub fn defer_calcs(&self) -> bool {
        self.state().defer_calcs
    }

    pub fn set_output_interval(&self, interval: Duration) {
        self.state().output_interval = interval;
    }

    pub fn set_patch_format(&self, format: PatchFormat) {
        self.state().patch_format = format;
    }

    pub fn set_ssc(&self, config: SscConfig) -> ScResult<()> {
        self.state().ssc.configure(config)
    }

    pub fn ssc(&self) -> SscConfig {
        self.state().ssc.config()
    }

    pub fn set_ssc_standby(&self, standby: bool) {
        self.state().ssc.set_standby(standby);
    }

    /// Replace the true-trails bitmaps (at most four ranges)
    pub fn set_true_trails(&self, dimension: u16, ranges: &[f32]) -> ScResult<()> {
        let mut state = self.state();
        let origin = (state.radar.0 as f64, state.radar.1 as f64);
        state.trails = TrueTrails::new(dimension, ranges, origin)?;
        Ok(())
    }

    pub fn true_trail(&self, idx: usize) -> Option<TrailSnapshot> {
        self.state().trails.snapshot(idx)
    }

    pub fn set_slant_range_height(&self, metres: f32) -> ScResult<()> {
        if !(metres.is_finite() && metres >= 0.0) {
            return Err(ScError::invalid("slant_height", "must be >= 0"));
        }
        let mut state = self.state();
        state.slant_height_m = metres;
        self.recalc(&mut state);
        Ok(())
    }

    pub fn set_anticlockwise(&self, anticlockwise: bool) {
        let mut state = self.state();
        if state.anticlockwise != anticlockwise {
            state.anticlockwise = anticlockwise;
            self.recalc(&mut state);
        }
    }

    /// Range, azimuth and live value under a screen pixel
    pub fn analyse_point(&self, x: u16, y: u16) -> Option<PointInfo> {
        let state = self.state();
        let tables = state.tables.as_ref()?;
        let geometry = tables.geometry();
        if x >= state.win.w || y >= state.win.h {
            return None;
        }
        let scale = state.scale.max(1) as u16;
        let (tx, ty) = (x / scale, y / scale);
        let (range_m, fraction) = geometry.polar_of(tx, ty);
        let pim_azimuth = ((fraction * geometry.pim_azimuths as f64) as u32) % geometry.pim_azimuths;
        let cell = ((range_m - geometry.start_range as f64) / geometry.cell_m()).max(0.0) as u32;
        let idx = ty as usize * tables.width() as usize + tx as usize;
        let value = state
            .dests
            .iter()
            .flatten()
            .next()
            .and_then(|slot| slot.video.get(idx).copied())
            .unwrap_or(0);
        Some(PointInfo {
            range_m,
            azimuth_degs: fraction * 360.0,
            pim_azimuth,
            cell,
            value,
        })
    }

    pub fn win_geom(&self) -> WinGeom {
        self.state().win
    }

    pub fn view(&self) -> View {
        self.state().view
    }

    pub fn radar_position(&self) -> (f32, f32) {
        self.state().radar
    }

    pub fn sweep_line(&self) -> SweepLine {
        self.state().sweep
    }

    pub fn scale_factor(&self) -> u8 {
        self.state().scale
    }

    pub fn rotation_degs(&self) -> f64 {
        self.state().rotation_degs
    }

    pub fn moving_platform_ref_mode(&self) -> MpRefMode {
        self.state().mp_ref_mode
    }

    pub fn source(&self) -> (u32, u32, u32) {
        self.state().source
    }

    pub fn run_state(&self, rid: u8) -> Option<(RunState, bool)> {
        let state = self.state();
        state
            .dests
            .get(rid as usize)
            .and_then(Option::as_ref)
            .map(|slot| (slot.run, slot.visible))
    }

    pub fn fade(&self, rid: u8) -> Option<(FadeType, u16)> {
        let state = self.state();
        state
            .dests
            .get(rid as usize)
            .and_then(Option::as_ref)
            .map(|slot| (slot.fade.fade_type(), slot.fade.rate()))
    }

    pub fn revolution_period(&self) -> Option<Duration> {
        self.state().revolution
    }

    /// Named parameter access for command channels
    pub fn set_parameter(&self, name: &str, value: &str) -> ScResult<()> {
        let bad = |field: &str| ScError::invalid(field.to_string(), format!("bad value '{value}'"));
        match name {
            "clear_value" => self.set_clear_value(value.parse().map_err(|_| bad(name))?),
            "defer_calcs" => self.set_defer_calcs(parse_flag(value).ok_or_else(|| bad(name))?),
            "slant_height" => self.set_slant_range_height(value.parse().map_err(|_| bad(name))?)?,
            "anticlockwise" => self.set_anticlockwise(parse_flag(value).ok_or_else(|| bad(name))?),
            "output_interval_ms" => {
                let ms: u64 = value.parse().map_err(|_| bad(name))?;
                self.set_output_interval(Duration::from_millis(ms.max(1)));
            }
            "scale_factor" => self.set_scale_factor(value.parse().map_err(|_| bad(name))?)?,
            "rotation" => self.set_rotation_degs(value.parse().map_err(|_| bad(name))?)?,
            "ssc_standby" => self.set_ssc_standby(parse_flag(value).ok_or_else(|| bad(name))?),
            "ssc_enabled" | "ssc_window_length" | "ssc_window_threshold" | "ssc_instant_threshold" => {
                let mut config = self.ssc();
                match name {
                    "ssc_enabled" => config.enabled = parse_flag(value).ok_or_else(|| bad(name))?,
                    "ssc_window_length" => config.window_length = value.parse().map_err(|_| bad(name))?,
                    "ssc_window_threshold" => {
                        config.window_threshold = value.parse().map_err(|_| bad(name))?
                    }
                    _ => config.instant_threshold = value.parse().map_err(|_| bad(name))?,
                }
                self.set_ssc(config)?;
            }
            other => return Err(ScError::invalid("parameter", format!("unknown parameter '{other}'"))),
        }
        Ok(())
    }

    pub fn get_parameter(&self, name: &str) -> ScResult<String> {
        let state = self.state();
        let ssc = state.ssc.config();
        let value = match name {
            "clear_value" => state.clear_value.to_string(),
            "defer_calcs" => (state.defer_calcs as u8).to_string(),
            "slant_height" => state.slant_height_m.to_string(),
            "anticlockwise" => (state.anticlockwise as u8).to_string(),
            "output_interval_ms" => state.output_interval.as_millis().to_string(),
            "scale_factor" => state.scale.to_string(),
            "rotation" => state.rotation_degs.to_string(),
            "ssc_enabled" => (ssc.enabled as u8).to_string(),
            "ssc_window_length" => ssc.window_length.to_string(),
            "ssc_window_threshold" => ssc.window_threshold.to_string(),
            "ssc_instant_threshold" => ssc.instant_threshold.to_string(),
            "tables_valid" => (state.tables.is_some() as u8).to_string(),
            other => return Err(ScError::invalid("parameter", format!("unknown parameter '{other}'"))),
        };
        Ok(value)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

impl ScControl for ScanConverter {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_win_pos(&self, x: i16, y: i16) -> ScResult<()> {
        let mut state = self.state();
        for slot in state.slots_mut() {
            slot.dest.set_win_pos(x, y)?;
        }
        state.win.x = x;
        state.win.y = y;
        Ok(())
    }

    #[instrument(name = "sc_set_win_geom", skip(self), fields(converter = %self.name))]
    fn set_win_geom(&self, geom: WinGeom) -> ScResult<()> {
        let mut state = self.state();
        let (max_w, max_h) = state.effective_max();
        geom.validate(max_w, max_h)?;
        let resized = geom.w != state.win.w || geom.h != state.win.h;
        for slot in state.slots_mut() {
            slot.dest.set_win_geom(geom)?;
        }
        state.win = geom;
        if resized {
            self.recalc(&mut state);
        }
        Ok(())
    }

    fn set_win_param(&self, param: u16, arg1: u32, arg2: u32) -> ScResult<()> {
        let state = self.state();
        let mut supported = false;
        for slot in state.dests.iter().flatten() {
            match slot.dest.set_win_param(param, arg1, arg2) {
                Ok(()) => supported = true,
                Err(err) if err.is_not_supported() => {}
                Err(err) => return Err(err),
            }
        }
        if supported {
            Ok(())
        } else {
            Err(ScError::not_supported("set_win_param", self.name.to_string()))
        }
    }

    fn set_fade(&self, rid: u8, fade_type: FadeType, rate: u16) -> ScResult<()> {
        let mut state = self.state();
        let slot = state.slot_mut(rid)?;
        let mut engine = slot.fade.clone();
        engine.configure(fade_type, rate)?;
        slot.dest.set_fade(slot.rid, fade_type, rate)?;
        slot.fade = engine;
        Ok(())
    }

    fn set_view(&self, view: View) -> ScResult<()> {
        view.validate()?;
        let mut state = self.state();
        state.view = view;
        self.recalc(&mut state);
        Ok(())
    }

    fn pan_view(&self, x: f32, y: f32, clear_trails: bool) -> ScResult<()> {
        let mut state = self.state();
        let view = View::new(x, y, state.view.w, state.view.h);
        view.validate()?;
        if clear_trails {
            state.clear_all()?;
        }
        state.view = view;
        self.recalc(&mut state);
        Ok(())
    }

    fn set_radar_colour(&self, rid: u8, colour: Rgb) -> ScResult<()> {
        let mut state = self.state();
        let slot = state.slot_mut(rid)?;
        slot.dest.set_radar_colour(slot.rid, colour)
    }

    fn set_radar_bright(&self, rid: u8, bright: u8) -> ScResult<()> {
        let mut state = self.state();
        let slot = state.slot_mut(rid)?;
        slot.dest.set_radar_bright(slot.rid, bright)
    }

    fn set_radar_lut(&self, rid: u8, lut: &[u8; 256]) -> ScResult<()> {
        let mut state = self.state();
        let slot = state.slot_mut(rid)?;
        slot.dest.set_radar_lut(slot.rid, lut)
    }

    #[instrument(name = "sc_show_radar", skip(self), fields(converter = %self.name))]
    fn show_radar(&self, rid: u8, sc_state: ScState) -> ScResult<()> {
        let mut state = self.state();
        let clear_value = state.clear_value;
        let slot = state.slot_mut(rid)?;
        slot.dest.show_radar(slot.rid, sc_state)?;
        slot.run = slot.run.apply(sc_state);
        match sc_state {
            ScState::Hidden => slot.visible = false,
            ScState::Visible => {
                slot.visible = true;
                slot.zones.mark_all();
            }
            ScState::StopAndClear => {
                slot.video.fill(clear_value);
                slot.zones.clear();
                slot.dest.clear(clear_value)?;
            }
            ScState::Run | ScState::StopAndFade => {}
        }
        debug!(rid, run = ?slot.run, visible = slot.visible, "radar state changed");
        Ok(())
    }

    fn patch_set(&self, _patches: &PatchSet) -> ScResult<()> {
        Err(ScError::not_supported("patch_set", self.name.to_string()))
    }

    fn set_source(&self, source_id: u32, arg1: u32, arg2: u32) -> ScResult<()> {
        let mut state = self.state();
        state.source = (source_id, arg1, arg2);
        state.clear_all()
    }

    #[instrument(name = "sc_set_radar_position", skip(self), fields(converter = %self.name))]
    fn set_radar_position(&self, x: f32, y: f32, clear_trails: bool) -> ScResult<()> {
        check::finite("radar_position", &[x as f64, y as f64])?;
        let mut state = self.state();
        if clear_trails {
            state.clear_all()?;
        } else {
            state.trails.move_origin((x as f64, y as f64));
        }
        state.radar = (x, y);
        if clear_trails {
            state.trails.move_origin((x as f64, y as f64));
        }
        self.recalc(&mut state);
        Ok(())
    }

    fn set_rotation_degs(&self, degs: f64) -> ScResult<()> {
        check::finite("rotation", &[degs])?;
        let mut state = self.state();
        state.rotation_degs = degs.rem_euclid(360.0);
        self.recalc(&mut state);
        Ok(())
    }

    fn set_scale_factor(&self, factor: u8) -> ScResult<()> {
        check::scale_factor(factor)?;
        let mut state = self.state();
        if state.scale != factor {
            state.scale = factor;
            self.recalc(&mut state);
        }
        Ok(())
    }

    fn set_moving_platform_ref_mode(&self, mode: MpRefMode) -> ScResult<()> {
        self.state().mp_ref_mode = mode;
        Ok(())
    }

    fn set_sweep_line(&self, sweep: SweepLine) -> ScResult<()> {
        let mut state = self.state();
        state.sweep = sweep;
        if !sweep.is_on() {
            if let Some(tables) = state.tables.clone() {
                // erase the last line at the next output
                state.update_sweep_line(&tables, None);
            }
        }
        Ok(())
    }

    fn sc_type(&self) -> ScType {
        self.state().sc_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sweep, RecordingDest};
    use contracts::{ScBlueprint, SweepColourMode};

    fn converter(w: u16, h: u16) -> (ScanConverter, Arc<RecordingDest>) {
        let mut blueprint = ScBlueprint::with_window(w, h, WinGeom::new(0, 0, w, h));
        blueprint.scan.view = View::new(0.0, 0.0, w as f32 * 10.0, h as f32 * 10.0);
        blueprint.scan.pim_azimuths = 256;
        blueprint.scan.pim_samples = 256;
        blueprint.scan.fade = contracts::FadeSettings {
            fade_type: FadeType::Replace,
            rate: 1,
        };
        let sc = ScanConverter::new("test", &blueprint.scan, (w, h)).unwrap();
        let dest = RecordingDest::new("rec", w, h);
        sc.add_dest(0, dest.clone(), (FadeType::Replace, 1)).unwrap();
        (sc, dest)
    }

    #[test]
    fn win_geom_round_trips_and_rejects_oversize() {
        let (sc, _dest) = converter(64, 64);
        sc.set_win_geom(WinGeom::new(3, 4, 40, 30)).unwrap();
        assert_eq!(sc.win_geom(), WinGeom::new(3, 4, 40, 30));
        let err = sc.set_win_geom(WinGeom::new(0, 0, 65, 30)).unwrap_err();
        assert!(matches!(err, ScError::InvalidArgument { .. }));
        assert_eq!(sc.win_geom(), WinGeom::new(3, 4, 40, 30));
    }

    #[test]
    fn zero_view_rejected_without_change() {
        let (sc, _dest) = converter(32, 32);
        let before = sc.view();
        assert!(sc.set_view(View::new(0.0, 0.0, 0.0, 100.0)).is_err());
        assert_eq!(sc.view(), before);
    }

    #[test]
    fn full_sweep_is_covered_by_dirty_box() {
        let (sc, dest) = converter(64, 64);
        sc.set_output_interval(Duration::from_secs(3600));
        let returns = sweep(256, 256, 1280.0, |_, _| 100);
        sc.new_data(true, &returns, 0, returns.len()).unwrap();
        let report = sc.flush();
        assert_eq!(report.returns_ingested, 256);
        assert!(report.patches > 0);
        let dirty = report.dirty.expect("dirty box");
        for (idx, value) in dest.plane().iter().enumerate() {
            if *value != 0 {
                let (x, y) = ((idx % 64) as u16, (idx / 64) as u16);
                assert!(dirty.contains(x, y), "pixel {x},{y} outside dirty box");
            }
        }
        // the view fits inside range: everything lit
        assert!(dest.plane().iter().all(|v| *v == 100));
    }

    #[test]
    fn zero_pim_samples_rejected() {
        let mut blueprint = ScBlueprint::with_window(32, 32, WinGeom::new(0, 0, 32, 32));
        blueprint.scan.pim_samples = 0;
        let err = ScanConverter::new("empty", &blueprint.scan, (32, 32)).unwrap_err();
        assert!(matches!(err, ScError::InvalidArgument { .. }));
    }

    #[test]
    fn realtime_fade_reaches_destination() {
        let (sc, _) = converter(64, 64);
        let dest = RecordingDest::new("faded", 64, 64);
        sc.add_dest(0, dest.clone(), (FadeType::RealTime, 1)).unwrap();
        sc.set_output_interval(Duration::from_secs(3600));
        let returns = sweep(256, 256, 1280.0, |_, _| 200);
        sc.new_data(true, &returns, 0, returns.len()).unwrap();
        sc.flush();
        let before = dest.plane().iter().copied().max().unwrap();
        assert!(before > 0);

        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(120));
            sc.tick();
        }
        sc.flush();
        let after = dest.plane().iter().copied().max().unwrap();
        assert!(after < before, "destination stayed at {after}");
    }

    #[test]
    fn clear_trails_on_radar_move() {
        let (sc, dest) = converter(32, 32);
        let returns = sweep(256, 256, 1280.0, |_, _| 200);
        sc.new_data(true, &returns, 0, returns.len()).unwrap();
        sc.flush();
        assert!(dest.plane().iter().any(|v| *v == 200));
        sc.set_radar_position(50.0, 50.0, true).unwrap();
        assert!(dest.plane().iter().all(|v| *v == 0));
        assert_eq!(sc.radar_position(), (50.0, 50.0));
    }

    #[test]
    fn sweep_line_leaves_no_ghost() {
        let (sc, dest) = converter(64, 64);
        sc.set_sweep_line(SweepLine::auto(SweepColourMode::Replace, 0x00_ff_00))
            .unwrap();
        let returns = sweep(256, 256, 1280.0, |_, _| 0);
        sc.new_data(true, &returns, 0, 100).unwrap();
        sc.flush();
        assert!(dest.plane().iter().any(|v| *v == 0xff));
        sc.set_sweep_line(SweepLine::default()).unwrap();
        sc.flush();
        assert!(dest.plane().iter().all(|v| *v == 0));
    }

    #[test]
    fn moved_sweep_line_erases_old_azimuth() {
        let (sc, dest) = converter(64, 64);
        sc.set_sweep_line(SweepLine::auto(SweepColourMode::Replace, 0x00_ff_00))
            .unwrap();
        let returns = sweep(256, 256, 1280.0, |_, _| 0);
        sc.new_data(true, &returns, 0, 64).unwrap();
        sc.flush();
        let first: Vec<usize> = lit(&dest.plane());
        sc.new_data(true, &returns, 128, 64).unwrap();
        sc.flush();
        let second = lit(&dest.plane());
        assert!(!second.is_empty());
        assert!(first.iter().all(|idx| !second.contains(idx)));
    }

    fn lit(plane: &[u8]) -> Vec<usize> {
        plane
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0)
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn stopped_radar_ignores_data_and_stop_clear_clears() {
        let (sc, dest) = converter(32, 32);
        let returns = sweep(256, 256, 1280.0, |_, _| 50);
        sc.show_radar(0, ScState::StopAndFade).unwrap();
        assert_eq!(sc.new_data(true, &returns, 0, 256).unwrap(), 0);
        sc.show_radar(0, ScState::Run).unwrap();
        sc.new_data(true, &returns, 0, 256).unwrap();
        sc.flush();
        assert!(dest.plane().iter().any(|v| *v == 50));
        sc.show_radar(0, ScState::Hidden).unwrap();
        assert_eq!(sc.run_state(0), Some((RunState::Running, false)));
        sc.show_radar(0, ScState::StopAndClear).unwrap();
        assert!(dest.plane().iter().all(|v| *v == 0));
        assert_eq!(sc.run_state(0), Some((RunState::StoppedCleared, false)));
    }

    #[test]
    fn ssc_suppresses_single_scan_noise() {
        let (sc, dest) = converter(32, 32);
        sc.set_ssc(SscConfig {
            enabled: true,
            window_length: 4,
            window_threshold: 3,
            instant_threshold: 250,
            quantisation_gain: 16,
            correlation_gain: 16,
        })
        .unwrap();
        let returns = sweep(256, 256, 1280.0, |_, _| 180);
        sc.new_data(true, &returns, 0, 256).unwrap();
        sc.flush();
        assert!(dest.plane().iter().all(|v| *v == 0));
        sc.new_data(true, &returns, 0, 256).unwrap();
        sc.new_data(true, &returns, 0, 256).unwrap();
        sc.flush();
        assert!(dest.plane().iter().all(|v| *v == 180));
    }

    #[test]
    fn deferred_calcs_install_in_background() {
        let (sc, _dest) = converter(32, 32);
        sc.set_defer_calcs(true);
        let returns = sweep(256, 256, 1280.0, |_, _| 10);
        sc.new_data(true, &returns, 0, 1).unwrap();
        assert!(sc.wait_for_tables(Duration::from_secs(5)));
        sc.set_view(View::new(0.0, 0.0, 200.0, 200.0)).unwrap();
        assert!(sc.wait_for_tables(Duration::from_secs(5)));
        assert_eq!(sc.get_parameter("tables_valid").unwrap(), "1");
    }

    #[test]
    fn analyse_point_reports_polar_position() {
        let (sc, _dest) = converter(33, 33);
        let returns = sweep(256, 256, 1280.0, |_, _| 1);
        sc.new_data(true, &returns, 0, 1).unwrap();
        // pixel (32,16): 16 pixels east of the centre pixel
        let info = sc.analyse_point(32, 16).unwrap();
        assert!((info.range_m - 160.0).abs() < 1e-3);
        assert!((info.azimuth_degs - 90.0).abs() < 1e-6);
        assert!(sc.analyse_point(40, 0).is_none());
    }

    #[test]
    fn parameters_by_name() {
        let (sc, _dest) = converter(32, 32);
        sc.set_parameter("clear_value", "7").unwrap();
        assert_eq!(sc.get_parameter("clear_value").unwrap(), "7");
        sc.set_parameter("ssc_window_length", "6").unwrap();
        assert_eq!(sc.ssc().window_length, 6);
        assert!(sc.set_parameter("nope", "1").is_err());
        assert!(sc.set_parameter("scale_factor", "9").is_err());
    }

    #[test]
    fn unsupported_calls_report_not_supported() {
        let (sc, _dest) = converter(32, 32);
        let err = sc.patch_set(&PatchSet::default()).unwrap_err();
        assert!(err.is_not_supported());
        assert!(sc.set_win_param(99, 0, 0).unwrap_err().is_not_supported());
    }

    #[test]
    fn scale_factor_expands_pixels() {
        let (sc, dest) = converter(32, 32);
        sc.set_scale_factor(2).unwrap();
        let returns = sweep(256, 256, 1280.0, |_, _| 77);
        sc.new_data(true, &returns, 0, 256).unwrap();
        sc.flush();
        assert!(dest.plane().iter().all(|v| *v == 77));
    }

    #[test]
    fn true_trails_survive_pan_without_clear() {
        let (sc, _dest) = converter(32, 32);
        sc.set_true_trails(64, &[320.0]).unwrap();
        let returns = sweep(256, 256, 1280.0, |azi, _| if azi < 16 { 90 } else { 0 });
        sc.new_data(true, &returns, 0, 256).unwrap();
        let trail = sc.true_trail(0).unwrap();
        assert!(trail.data.iter().any(|v| *v == 90));
        sc.pan_view(10.0, 10.0, false).unwrap();
        let trail = sc.true_trail(0).unwrap();
        assert!(trail.data.iter().any(|v| *v == 90));
        sc.pan_view(0.0, 0.0, true).unwrap();
        let trail = sc.true_trail(0).unwrap();
        assert!(trail.data.iter().all(|v| *v == 0));
    }
}
