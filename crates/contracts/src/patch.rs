//! Patch sets - rectangular pixel updates sent to destinations
//!
//! Wire form is `format: u8, num_patches: u16, words: [u16]` where
//! `patch_len == words.len()`. Each patch is laid out as
//! `[x, y, w, h, n, data[n]]`:
//!
//! - `Raw8`: two pixels per word, high byte first, last word zero padded
//! - `Rle8`: one word per run, `(run_len - 1) << 8 | value`, row-major

use serde::{Deserialize, Serialize};

use crate::{ScError, ScResult};

/// Upper bound on words in one patch message
pub const MAX_PATCH_WORDS: usize = 1024;

const PATCH_HEADER_WORDS: usize = 5;
const MAX_RUN: usize = 256;
const MAX_DATA_WORDS: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchFormat {
    #[default]
    Raw8,
    Rle8,
}

impl PatchFormat {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Raw8 => 0,
            Self::Rle8 => 1,
        }
    }

    pub fn from_u8(value: u8) -> ScResult<Self> {
        match value {
            0 => Ok(Self::Raw8),
            1 => Ok(Self::Rle8),
            other => Err(ScError::protocol(format!("unknown patch format {other}"))),
        }
    }

    fn pixels_per_word(self) -> usize {
        match self {
            Self::Raw8 => 2,
            Self::Rle8 => 1,
        }
    }
}

/// Rectangle of 8-bit pixels, row-major
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub x: u16,
    pub y: u16,
    pub w: u16,
    pub h: u16,
    #[serde(with = "serde_bytes")]
    pub pixels: Vec<u8>,
}

impl Patch {
    pub fn new(x: u16, y: u16, w: u16, h: u16, pixels: Vec<u8>) -> ScResult<Self> {
        if w == 0 || h == 0 {
            return Err(ScError::invalid("patch", "empty patch"));
        }
        if pixels.len() != w as usize * h as usize {
            return Err(ScError::invalid(
                "patch.pixels",
                format!("expected {} pixels, got {}", w as usize * h as usize, pixels.len()),
            ));
        }
        Ok(Self { x, y, w, h, pixels })
    }

    /// Single-value rectangle
    pub fn filled(x: u16, y: u16, w: u16, h: u16, value: u8) -> ScResult<Self> {
        Self::new(x, y, w, h, vec![value; w as usize * h as usize])
    }

    #[inline]
    pub fn get(&self, px: u16, py: u16) -> u8 {
        self.pixels[py as usize * self.w as usize + px as usize]
    }

    fn sub_patch(&self, x0: u16, y0: u16, w: u16, h: u16) -> Patch {
        let mut pixels = Vec::with_capacity(w as usize * h as usize);
        for row in y0..y0 + h {
            let start = row as usize * self.w as usize + x0 as usize;
            pixels.extend_from_slice(&self.pixels[start..start + w as usize]);
        }
        Patch {
            x: self.x + x0,
            y: self.y + y0,
            w,
            h,
            pixels,
        }
    }

    fn encode_into(&self, format: PatchFormat, words: &mut Vec<u16>) {
        words.extend_from_slice(&[self.x, self.y, self.w, self.h, 0]);
        let len_slot = words.len() - 1;
        let data_start = words.len();
        match format {
            PatchFormat::Raw8 => {
                for pair in self.pixels.chunks(2) {
                    let hi = pair[0] as u16;
                    let lo = pair.get(1).copied().unwrap_or(0) as u16;
                    words.push(hi << 8 | lo);
                }
            }
            PatchFormat::Rle8 => {
                let mut iter = self.pixels.iter().copied().peekable();
                while let Some(value) = iter.next() {
                    let mut run = 1usize;
                    while run < MAX_RUN && iter.peek() == Some(&value) {
                        iter.next();
                        run += 1;
                    }
                    words.push(((run - 1) as u16) << 8 | value as u16);
                }
            }
        }
        debug_assert!(words.len() - data_start <= MAX_DATA_WORDS);
        words[len_slot] = (words.len() - data_start) as u16;
    }

    fn encoded_words(&self, format: PatchFormat) -> usize {
        let mut scratch = Vec::new();
        self.encode_into(format, &mut scratch);
        scratch.len()
    }
}

/// Batch of patches applied atomically by a destination
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PatchSet {
    pub format: PatchFormat,
    pub patches: Vec<Patch>,
}

impl PatchSet {
    pub fn new(format: PatchFormat) -> Self {
        Self {
            format,
            patches: Vec::new(),
        }
    }

    pub fn push(&mut self, patch: Patch) {
        self.patches.push(patch);
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn pixel_count(&self) -> usize {
        self.patches.iter().map(|p| p.pixels.len()).sum()
    }

    /// Encode to the `patchData` word array
    pub fn encode_words(&self) -> Vec<u16> {
        self.encode().1
    }

    /// Encode to `(numPatches, patchData)`.
    ///
    /// A patch whose data would not fit the `u16` length word is sent as
    /// row bands, so `numPatches` can exceed `len()`.
    pub fn encode(&self) -> (u16, Vec<u16>) {
        let mut words = Vec::new();
        let mut count = 0u16;
        for patch in &self.patches {
            // worst case is one word per pixel (RLE of noise)
            if patch.pixels.len() <= MAX_DATA_WORDS {
                patch.encode_into(self.format, &mut words);
                count = count.wrapping_add(1);
                continue;
            }
            let rows = (MAX_DATA_WORDS / patch.w as usize).max(1) as u16;
            let mut y = 0;
            while y < patch.h {
                let h = rows.min(patch.h - y);
                patch.sub_patch(0, y, patch.w, h).encode_into(self.format, &mut words);
                count = count.wrapping_add(1);
                y += h;
            }
        }
        (count, words)
    }

    /// Decode a `(format, numPatches, patchData)` triple
    ///
    /// Rejects undersized buffers, trailing words, run overflow and
    /// count mismatches without producing a partial set.
    pub fn decode(format: u8, num_patches: u16, words: &[u16]) -> ScResult<Self> {
        let format = PatchFormat::from_u8(format)?;
        let mut patches = Vec::with_capacity(num_patches as usize);
        let mut pos = 0usize;
        for idx in 0..num_patches {
            let header = words
                .get(pos..pos + PATCH_HEADER_WORDS)
                .ok_or_else(|| ScError::protocol(format!("patch {idx}: truncated header")))?;
            let (x, y, w, h, n) = (header[0], header[1], header[2], header[3], header[4] as usize);
            pos += PATCH_HEADER_WORDS;
            if w == 0 || h == 0 {
                return Err(ScError::protocol(format!("patch {idx}: empty rectangle")));
            }
            let data = words
                .get(pos..pos + n)
                .ok_or_else(|| ScError::protocol(format!("patch {idx}: truncated data")))?;
            pos += n;
            let expected = w as usize * h as usize;
            let mut pixels = Vec::with_capacity(expected);
            match format {
                PatchFormat::Raw8 => {
                    if n != expected.div_ceil(2) {
                        return Err(ScError::protocol(format!(
                            "patch {idx}: {n} raw words for {expected} pixels"
                        )));
                    }
                    for word in data {
                        pixels.push((word >> 8) as u8);
                        pixels.push((word & 0xff) as u8);
                    }
                    pixels.truncate(expected);
                }
                PatchFormat::Rle8 => {
                    for word in data {
                        let run = (word >> 8) as usize + 1;
                        if pixels.len() + run > expected {
                            return Err(ScError::protocol(format!("patch {idx}: run overflow")));
                        }
                        pixels.resize(pixels.len() + run, (word & 0xff) as u8);
                    }
                    if pixels.len() != expected {
                        return Err(ScError::protocol(format!(
                            "patch {idx}: runs cover {} of {expected} pixels",
                            pixels.len()
                        )));
                    }
                }
            }
            patches.push(Patch { x, y, w, h, pixels });
        }
        if pos != words.len() {
            return Err(ScError::protocol(format!(
                "{} trailing words after {num_patches} patches",
                words.len() - pos
            )));
        }
        Ok(Self { format, patches })
    }

    /// Split into sets whose encoding fits `max_words`, cutting patches
    /// into row or column bands where one patch alone is too large
    pub fn split_to_fit(&self, max_words: usize) -> Vec<PatchSet> {
        let budget = max_words.max(PATCH_HEADER_WORDS + 1);
        let per_word = self.format.pixels_per_word();
        let max_pixels = (budget - PATCH_HEADER_WORDS) * per_word;

        let mut pieces = Vec::new();
        for patch in &self.patches {
            if patch.encoded_words(self.format) <= budget {
                pieces.push(patch.clone());
                continue;
            }
            let cols = (patch.w as usize).min(max_pixels).max(1) as u16;
            let rows = (max_pixels / cols as usize).clamp(1, patch.h as usize) as u16;
            let mut y = 0;
            while y < patch.h {
                let h = rows.min(patch.h - y);
                let mut x = 0;
                while x < patch.w {
                    let w = cols.min(patch.w - x);
                    pieces.push(patch.sub_patch(x, y, w, h));
                    x += w;
                }
                y += h;
            }
        }

        let mut sets = Vec::new();
        let mut current = PatchSet::new(self.format);
        let mut used = 0usize;
        for piece in pieces {
            let cost = piece.encoded_words(self.format);
            if used + cost > budget && !current.is_empty() {
                sets.push(std::mem::replace(&mut current, PatchSet::new(self.format)));
                used = 0;
            }
            used += cost;
            current.push(piece);
        }
        if !current.is_empty() {
            sets.push(current);
        }
        sets
    }
}
