//! Polar radar return - one azimuth worth of range samples

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Range samples of one return
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Samples {
    U8(Bytes),
    U16(Vec<u16>),
}

impl Samples {
    pub fn len(&self) -> usize {
        match self {
            Self::U8(data) => data.len(),
            Self::U16(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample reduced to 8 bits (upper byte for 16-bit data)
    #[inline]
    pub fn level(&self, idx: usize) -> u8 {
        match self {
            Self::U8(data) => data.get(idx).copied().unwrap_or(0),
            Self::U16(data) => data.get(idx).map(|v| (v >> 8) as u8).unwrap_or(0),
        }
    }
}

/// One polar sweep sample set
///
/// Consumed once by `new_data`; the converter copies what it needs into
/// its PIM and never keeps the return itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Return {
    /// 0..=65535 covers one revolution
    pub azimuth: u16,
    /// Range of the first sample (metres)
    pub start_range: f32,
    /// Range of the end of the last sample (metres)
    pub end_range: f32,
    pub samples: Samples,
}

impl Return {
    pub fn new_u8(azimuth: u16, start_range: f32, end_range: f32, samples: Vec<u8>) -> Self {
        Self {
            azimuth,
            start_range,
            end_range,
            samples: Samples::U8(Bytes::from(samples)),
        }
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    /// Metres covered by one sample
    pub fn range_per_sample(&self) -> f32 {
        let n = self.num_samples().max(1) as f32;
        (self.end_range - self.start_range).max(0.0) / n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sixteen_bit_samples_use_upper_byte() {
        let samples = Samples::U16(vec![0x1234, 0xff00]);
        assert_eq!(samples.level(0), 0x12);
        assert_eq!(samples.level(1), 0xff);
        assert_eq!(samples.level(5), 0);
    }

    #[test]
    fn range_per_sample() {
        let ret = Return::new_u8(0, 0.0, 1000.0, vec![0; 100]);
        assert_eq!(ret.range_per_sample(), 10.0);
    }
}
