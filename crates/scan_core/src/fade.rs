//! Fade engine: fade LUTs plus rate-limited real-time stepping.
//!
//! - `RealTime`: the whole plane decays in fixed steps every interval; a
//!   full-intensity pixel reaches zero after `rate` antenna revolutions.
//! - `Sweep`: a pixel decays by `rate` percent each time the sweep passes.
//! - `Replace`: no decay, new data overwrites.

use std::time::{Duration, Instant};

use contracts::{FadeType, ScResult, DEFAULT_FADING_INTERVAL_MS};

/// `set_win_param` id carrying the measured revolution period (ms)
pub const WIN_PARAM_REVOLUTION_MS: u16 = 1;

const DEFAULT_REVOLUTION_MS: u64 = 2500;

#[derive(Debug, Clone)]
pub struct FadeEngine {
    fade_type: FadeType,
    rate: u16,
    interval: Duration,
    revolution: Duration,
    last_step: Option<Instant>,
    lut: [u8; 256],
    steps: u64,
}

impl Default for FadeEngine {
    fn default() -> Self {
        Self::new(
            FadeType::RealTime,
            4,
            Duration::from_millis(DEFAULT_FADING_INTERVAL_MS),
        )
    }
}

impl FadeEngine {
    pub fn new(fade_type: FadeType, rate: u16, interval: Duration) -> Self {
        let mut engine = Self {
            fade_type,
            rate: rate.max(1),
            interval,
            revolution: Duration::from_millis(DEFAULT_REVOLUTION_MS),
            last_step: None,
            lut: [0; 256],
            steps: 0,
        };
        engine.rebuild_lut();
        engine
    }

    /// Change mode and rate; invalid rates leave the engine unchanged
    pub fn configure(&mut self, fade_type: FadeType, rate: u16) -> ScResult<()> {
        fade_type.check_rate(rate)?;
        self.fade_type = fade_type;
        self.rate = rate.max(1);
        self.rebuild_lut();
        Ok(())
    }

    pub fn fade_type(&self) -> FadeType {
        self.fade_type
    }

    pub fn rate(&self) -> u16 {
        self.rate
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval.max(Duration::from_millis(1));
        self.rebuild_lut();
    }

    pub fn revolution(&self) -> Duration {
        self.revolution
    }

    pub fn set_revolution(&mut self, period: Duration) {
        if period.is_zero() {
            return;
        }
        self.revolution = period;
        self.rebuild_lut();
    }

    /// Decay table for the current mode
    pub fn lut(&self) -> &[u8; 256] {
        &self.lut
    }

    /// Level removed per real-time step
    pub fn realtime_decrement(&self) -> u8 {
        let steps = (self.rate as u128 * self.revolution.as_millis()
            / self.interval.as_millis().max(1))
        .max(1);
        255u128.div_ceil(steps).clamp(1, 255) as u8
    }

    fn rebuild_lut(&mut self) {
        match self.fade_type {
            FadeType::RealTime => {
                let dec = self.realtime_decrement();
                for (v, slot) in self.lut.iter_mut().enumerate() {
                    *slot = (v as u8).saturating_sub(dec);
                }
            }
            FadeType::Sweep => {
                let keep = 100u32.saturating_sub(self.rate as u32);
                for (v, slot) in self.lut.iter_mut().enumerate() {
                    *slot = (v as u32 * keep / 100) as u8;
                }
            }
            FadeType::Replace => {
                for (v, slot) in self.lut.iter_mut().enumerate() {
                    *slot = v as u8;
                }
            }
        }
    }

    /// True when a real-time step may run at `now`; records it.
    ///
    /// Calls closer together than the interval are suppressed. Non
    /// real-time modes never step on a timer.
    pub fn step_due(&mut self, now: Instant) -> bool {
        if self.fade_type != FadeType::RealTime {
            return false;
        }
        if let Some(last) = self.last_step {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last_step = Some(now);
        self.steps += 1;
        true
    }

    /// Apply one decay step to a plane; true when any pixel changed
    pub fn apply(&self, plane: &mut [u8]) -> bool {
        self.apply_with(plane, |_| {})
    }

    /// Like `apply`, calling `changed` with the index of every decayed pixel
    pub fn apply_with(&self, plane: &mut [u8], mut changed: impl FnMut(usize)) -> bool {
        let mut any = false;
        for (idx, px) in plane.iter_mut().enumerate() {
            if *px == 0 {
                continue;
            }
            let faded = self.lut[*px as usize];
            if faded != *px {
                *px = faded;
                changed(idx);
                any = true;
            }
        }
        any
    }

    /// Combine new data with the stored value under the current mode
    #[inline]
    pub fn combine(&self, existing: u8, new: u8) -> u8 {
        match self.fade_type {
            FadeType::RealTime => existing.max(new),
            FadeType::Sweep => self.lut[existing as usize].max(new),
            FadeType::Replace => new,
        }
    }

    /// Real-time steps performed so far
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn reset_timer(&mut self) {
        self.last_step = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_is_rate_limited() {
        let mut engine = FadeEngine::new(FadeType::RealTime, 1, Duration::from_millis(100));
        let t0 = Instant::now();
        assert!(engine.step_due(t0));
        assert!(!engine.step_due(t0 + Duration::from_millis(40)));
        assert!(engine.step_due(t0 + Duration::from_millis(100)));
        assert_eq!(engine.steps(), 2);
    }

    #[test]
    fn realtime_reaches_zero_after_rate_revolutions() {
        let mut engine = FadeEngine::new(FadeType::RealTime, 2, Duration::from_millis(100));
        engine.set_revolution(Duration::from_millis(1000));
        // 2 revs * 1000ms / 100ms = 20 steps
        let mut plane = [255u8];
        for _ in 0..20 {
            engine.apply(&mut plane);
        }
        assert_eq!(plane[0], 0);
        assert_eq!(engine.realtime_decrement(), 13);
    }

    #[test]
    fn apply_reports_changed_pixels() {
        let engine = FadeEngine::new(FadeType::RealTime, 1, Duration::from_millis(100));
        let mut plane = [0u8, 200, 0, 1];
        let mut hit = Vec::new();
        assert!(engine.apply_with(&mut plane, |idx| hit.push(idx)));
        assert_eq!(hit, vec![1, 3]);
        assert_eq!(plane[3], 0);
        assert!(!engine.apply_with(&mut [0u8; 4], |_| panic!("no change expected")));
    }

    #[test]
    fn sweep_decays_by_percentage() {
        let engine = FadeEngine::new(FadeType::Sweep, 50, Duration::from_millis(100));
        assert_eq!(engine.combine(200, 0), 100);
        assert_eq!(engine.combine(200, 150), 150);
    }

    #[test]
    fn invalid_rate_rejected_without_change() {
        let mut engine = FadeEngine::new(FadeType::Replace, 1, Duration::from_millis(100));
        assert!(engine.configure(FadeType::Sweep, 150).is_err());
        assert_eq!(engine.fade_type(), FadeType::Replace);
        assert_eq!(engine.combine(200, 10), 10);
    }

    #[test]
    fn non_realtime_never_steps() {
        let mut engine = FadeEngine::new(FadeType::Sweep, 10, Duration::from_millis(1));
        assert!(!engine.step_due(Instant::now()));
    }
}
