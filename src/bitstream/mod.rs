/*
    FluxMend
    https://github.com/dbalsom/fluxmend

    Copyright 2024 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    src/bitstream/mod.rs

    The raw bit cell representation of one track revolution.
*/

pub mod builder;
pub mod scanner;

use crate::types::enums::{DataRate, Encoding};
use bit_vec::BitVec;

/// The MFM A1 sync byte with its missing clock bit, as raw cells.
pub const MFM_SYNC_A1: u16 = 0x4489;
/// The MFM C2 sync byte used by the index address mark.
pub const MFM_SYNC_C2: u16 = 0x5224;

/// One revolution of raw bit cells, with the rate and modulation needed to
/// interpret them. The stream is a ring: reads wrap at the end.
#[derive(Clone, Debug, Default)]
pub struct BitBuffer {
    bits: BitVec,
    pub datarate: DataRate,
    pub encoding: Encoding,
}

impl BitBuffer {
    pub fn new(datarate: DataRate, encoding: Encoding) -> Self {
        Self {
            bits: BitVec::new(),
            datarate,
            encoding,
        }
    }

    pub fn with_capacity(datarate: DataRate, encoding: Encoding, bits: usize) -> Self {
        Self {
            bits: BitVec::with_capacity(bits),
            datarate,
            encoding,
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn push(&mut self, bit: bool) {
        self.bits.push(bit);
    }

    /// Read one cell, wrapping at the end of the revolution.
    pub fn bit(&self, index: usize) -> bool {
        if self.bits.is_empty() {
            return false;
        }
        self.bits[index % self.bits.len()]
    }

    pub fn iter(&self) -> bit_vec::Iter<'_> {
        self.bits.iter()
    }

    /// Rotate the stream so the first sync mark starts on a byte boundary.
    /// Returns whether anything moved.
    pub fn align(&mut self) -> bool {
        if self.encoding != Encoding::Mfm || self.bits.is_empty() {
            return false;
        }
        let Some(sync_pos) = self.find_pattern16(MFM_SYNC_A1, 0) else {
            return false;
        };
        let shift = sync_pos % 16;
        if shift == 0 {
            return false;
        }
        let len = self.bits.len();
        let mut rotated = BitVec::with_capacity(len);
        for i in 0..len {
            rotated.push(self.bits[(i + shift) % len]);
        }
        self.bits = rotated;
        true
    }

    /// Find the next occurrence of a 16-cell pattern at or after `from`.
    /// The search does not wrap.
    pub fn find_pattern16(&self, pattern: u16, from: usize) -> Option<usize> {
        let len = self.bits.len();
        if len < 16 {
            return None;
        }
        let mut reg = 0u16;
        let mut count = 0usize;
        for i in from..len {
            reg = (reg << 1) | self.bits[i] as u16;
            count += 1;
            if count >= 16 && reg == pattern {
                return Some(i + 1 - 16);
            }
        }
        None
    }

    /// Read 16 cells from `pos` (wrapping) and split them into clock and
    /// data bytes.
    pub fn read_mfm_byte(&self, pos: usize) -> (u8, u8) {
        let mut clock = 0u8;
        let mut data = 0u8;
        for i in 0..8 {
            clock = (clock << 1) | self.bit(pos + i * 2) as u8;
            data = (data << 1) | self.bit(pos + i * 2 + 1) as u8;
        }
        (clock, data)
    }

    /// Read 32 cells from `pos` (wrapping) as one FM byte. FM cells carry a
    /// dead half-cell after every bit, so a byte spans 32 cells.
    pub fn read_fm_byte(&self, pos: usize) -> (u8, u8) {
        let mut clock = 0u8;
        let mut data = 0u8;
        for i in 0..8 {
            clock = (clock << 1) | self.bit(pos + i * 4) as u8;
            data = (data << 1) | self.bit(pos + i * 4 + 2) as u8;
        }
        (clock, data)
    }
}

/// Build the 32-cell FM pattern for a byte with an explicit clock.
pub fn fm_pattern(data: u8, clock: u8) -> u32 {
    let mut pattern = 0u32;
    for i in (0..8).rev() {
        let c = (clock >> i) & 1;
        let d = (data >> i) & 1;
        pattern = (pattern << 4) | ((c as u32) << 3) | ((d as u32) << 1);
    }
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_search_finds_sync() {
        let mut buf = BitBuffer::new(DataRate::Rate250K, Encoding::Mfm);
        for _ in 0..5 {
            buf.push(false);
        }
        for i in (0..16).rev() {
            buf.push((MFM_SYNC_A1 >> i) & 1 != 0);
        }
        for _ in 0..8 {
            buf.push(true);
        }
        assert_eq!(buf.find_pattern16(MFM_SYNC_A1, 0), Some(5));
        assert_eq!(buf.find_pattern16(MFM_SYNC_A1, 6), None);
    }

    #[test]
    fn align_rotates_to_byte_boundary() {
        let mut buf = BitBuffer::new(DataRate::Rate250K, Encoding::Mfm);
        for _ in 0..5 {
            buf.push(false);
        }
        for i in (0..16).rev() {
            buf.push((MFM_SYNC_A1 >> i) & 1 != 0);
        }
        for _ in 0..11 {
            buf.push(false);
        }
        assert!(buf.align());
        assert_eq!(buf.find_pattern16(MFM_SYNC_A1, 0), Some(0));
        assert!(!buf.align());
    }
}
