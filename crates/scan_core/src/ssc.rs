//! Scan-to-scan correlation (clutter rejection).
//!
//! Each pixel keeps a bit history of the last `window_length` scans. A
//! sample counts as a hit when its quantised level reaches mid scale. The
//! pixel passes when the hits in the window reach `window_threshold` or the
//! live sample alone reaches `instant_threshold`; otherwise it is suppressed.

use contracts::{ScError, ScResult, SscConfig};

const HIT_LEVEL: u32 = 128;

#[derive(Debug, Clone)]
pub struct Ssc {
    config: SscConfig,
    standby: bool,
    history: Vec<u8>,
    hit_lut: [bool; 256],
    out_lut: [u8; 256],
}

impl Ssc {
    pub fn new(config: SscConfig, pixels: usize) -> ScResult<Self> {
        let mut ssc = Self {
            config,
            standby: false,
            history: vec![0; pixels],
            hit_lut: [false; 256],
            out_lut: [0; 256],
        };
        ssc.configure(config)?;
        Ok(ssc)
    }

    pub fn configure(&mut self, config: SscConfig) -> ScResult<()> {
        if config.window_length == 0 || config.window_length > 8 {
            return Err(ScError::invalid("ssc.window_length", "must be 1..=8"));
        }
        if config.window_threshold == 0 || config.window_threshold > config.window_length {
            return Err(ScError::invalid(
                "ssc.window_threshold",
                "must be 1..=window_length",
            ));
        }
        let quant = config.quantisation_gain as u32;
        let gain = config.correlation_gain as u32;
        for v in 0..256u32 {
            self.hit_lut[v as usize] = v * quant / 16 >= HIT_LEVEL;
            self.out_lut[v as usize] = (v * gain / 16).min(255) as u8;
        }
        if config.window_length != self.config.window_length {
            self.history.fill(0);
        }
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> SscConfig {
        self.config
    }

    pub fn is_active(&self) -> bool {
        self.config.enabled && !self.standby
    }

    /// Standby passes samples straight through but keeps history
    pub fn set_standby(&mut self, standby: bool) {
        self.standby = standby;
    }

    pub fn resize(&mut self, pixels: usize) {
        self.history.clear();
        self.history.resize(pixels, 0);
    }

    pub fn clear(&mut self) {
        self.history.fill(0);
    }

    fn window_mask(&self) -> u8 {
        if self.config.window_length >= 8 {
            0xff
        } else {
            (1u8 << self.config.window_length) - 1
        }
    }

    /// Feed one scan's sample for `pixel` and return the correlated output
    #[inline]
    pub fn process(&mut self, pixel: usize, sample: u8) -> u8 {
        if !self.config.enabled {
            return sample;
        }
        let mask = self.window_mask();
        let hit = self.hit_lut[sample as usize] as u8;
        let Some(slot) = self.history.get_mut(pixel) else {
            return sample;
        };
        let history = ((*slot << 1) | hit) & mask;
        *slot = history;
        if self.standby {
            return sample;
        }
        let hits = history.count_ones() as u8;
        if hits >= self.config.window_threshold || sample >= self.config.instant_threshold {
            self.out_lut[sample as usize]
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(window_length: u8, window_threshold: u8, instant_threshold: u8) -> SscConfig {
        SscConfig {
            enabled: true,
            window_length,
            window_threshold,
            instant_threshold,
            quantisation_gain: 16,
            correlation_gain: 16,
        }
    }

    #[test]
    fn too_few_hits_are_suppressed() {
        let mut ssc = Ssc::new(config(4, 3, 250), 1).unwrap();
        assert_eq!(ssc.process(0, 200), 0);
        assert_eq!(ssc.process(0, 200), 0);
        assert_eq!(ssc.process(0, 200), 200);
    }

    #[test]
    fn hits_age_out_of_the_window() {
        let mut ssc = Ssc::new(config(2, 2, 255), 1).unwrap();
        ssc.process(0, 200);
        assert_eq!(ssc.process(0, 200), 200);
        ssc.process(0, 0);
        ssc.process(0, 0);
        assert_eq!(ssc.process(0, 200), 0);
    }

    #[test]
    fn instant_threshold_passes_single_strong_sample() {
        let mut ssc = Ssc::new(config(4, 4, 240), 1).unwrap();
        assert_eq!(ssc.process(0, 250), 250);
        assert_eq!(ssc.process(0, 100), 0);
    }

    #[test]
    fn standby_and_disabled_pass_through() {
        let mut ssc = Ssc::new(config(4, 4, 255), 2).unwrap();
        ssc.set_standby(true);
        assert_eq!(ssc.process(0, 90), 90);
        let mut off = Ssc::new(SscConfig::default(), 2).unwrap();
        assert_eq!(off.process(1, 90), 90);
    }

    #[test]
    fn threshold_above_window_rejected() {
        assert!(Ssc::new(config(2, 3, 255), 1).is_err());
    }
}
