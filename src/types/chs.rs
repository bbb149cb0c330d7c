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

    src/types/chs.rs

    Physical track addresses and on-media sector identifiers.
*/

use crate::MAXIMUM_SECTOR_SIZE;
use std::fmt::Display;

/// The physical address of one side of one cylinder.
#[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct CylHead {
    pub cyl: u16,
    pub head: u8,
}

impl CylHead {
    pub fn new(cyl: u16, head: u8) -> Self {
        Self { cyl, head }
    }

    /// Apply a physical stepping multiplier (double-stepping 40-track media
    /// in an 80-track drive).
    pub fn stepped(&self, step: u16) -> Self {
        Self {
            cyl: self.cyl * step,
            head: self.head,
        }
    }
}

impl From<(u16, u8)> for CylHead {
    fn from((cyl, head): (u16, u8)) -> Self {
        Self { cyl, head }
    }
}

impl Display for CylHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[c:{} h:{}]", self.cyl, self.head)
    }
}

/// The CHRN sector identifier as recorded on the medium. Not necessarily
/// equal to the sector's physical position.
#[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq)]
pub struct Header {
    pub cyl: u16,
    pub head: u8,
    pub sector: u8,
    pub size: u8,
}

impl Header {
    pub fn new(cyl: u16, head: u8, sector: u8, size: u8) -> Self {
        Self {
            cyl,
            head,
            sector,
            size,
        }
    }

    pub fn with_cylhead(cylhead: CylHead, sector: u8, size: u8) -> Self {
        Self {
            cyl: cylhead.cyl,
            head: cylhead.head,
            sector,
            size,
        }
    }

    pub fn cylhead(&self) -> CylHead {
        CylHead::new(self.cyl, self.head)
    }

    /// Return the sector size in bytes described by the size code.
    /// The formula is `128 << n`, wrapped at the µPD765's 3-bit field.
    pub fn size_bytes(&self) -> usize {
        Self::size_code_to_length(self.size)
    }

    pub fn size_code_to_length(size: u8) -> usize {
        128usize << (size & 7)
    }

    pub fn length_to_size_code(len: usize) -> u8 {
        let mut n = 0u8;
        let mut len = len;
        while len > 128 {
            len >>= 1;
            n += 1;
        }
        n
    }

    /// The real size code is masked to the sizes the controller can transfer.
    pub fn size_code_to_real_length(size: u8) -> usize {
        std::cmp::min(MAXIMUM_SECTOR_SIZE, Self::size_code_to_length(size))
    }

    /// An 8K sector only fits a track if the stored data is truncated, which
    /// various protection schemes rely on.
    pub fn is_8k(&self) -> bool {
        self.size == 6
    }

    /// Whether the header looks like one a regular format would produce for a
    /// disk of `cyl_limit` cylinders.
    pub fn is_normal(&self, cyl_limit: u16) -> bool {
        self.cyl < cyl_limit && self.head < 2
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[c:{} h:{} s:{} n:{}]",
            self.cyl, self.head, self.sector, self.size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_code_round_trip() {
        for n in 0..8u8 {
            let len = Header::size_code_to_length(n);
            assert_eq!(len, 128 << n);
            assert_eq!(Header::length_to_size_code(len), n);
        }
    }

    #[test]
    fn real_size_caps_at_8k() {
        assert_eq!(Header::size_code_to_real_length(6), 8192);
        assert_eq!(Header::size_code_to_real_length(7), 8192);
    }

    #[test]
    fn cylhead_order() {
        assert!(CylHead::new(0, 1) < CylHead::new(1, 0));
        assert!(CylHead::new(2, 0) < CylHead::new(2, 1));
    }
}
