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

    src/types/range.rs

    A rectangular region of cylinders and heads.
*/

use crate::types::chs::CylHead;
use std::fmt::Display;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Range {
    pub cyl_begin: u16,
    pub cyl_end: u16,
    pub head_begin: u8,
    pub head_end: u8,
}

impl Range {
    pub fn new(cyls: u16, heads: u8) -> Self {
        Self {
            cyl_begin: 0,
            cyl_end: cyls,
            head_begin: 0,
            head_end: heads,
        }
    }

    pub fn with_bounds(cyl_begin: u16, cyl_end: u16, head_begin: u8, head_end: u8) -> Self {
        Self {
            cyl_begin,
            cyl_end,
            head_begin,
            head_end,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cyls() == 0 || self.heads() == 0
    }

    pub fn cyls(&self) -> u16 {
        self.cyl_end.saturating_sub(self.cyl_begin)
    }

    pub fn heads(&self) -> u8 {
        self.head_end.saturating_sub(self.head_begin)
    }

    pub fn contains(&self, cylhead: CylHead) -> bool {
        cylhead.cyl >= self.cyl_begin
            && cylhead.cyl < self.cyl_end
            && cylhead.head >= self.head_begin
            && cylhead.head < self.head_end
    }

    /// Visit every address in the region. The default order visits both heads
    /// of a cylinder before stepping; `cyls_first` walks a whole side first.
    pub fn each<F>(&self, mut func: F, cyls_first: bool)
    where
        F: FnMut(CylHead),
    {
        if cyls_first {
            for head in self.head_begin..self.head_end {
                for cyl in self.cyl_begin..self.cyl_end {
                    func(CylHead::new(cyl, head));
                }
            }
        }
        else {
            for cyl in self.cyl_begin..self.cyl_end {
                for head in self.head_begin..self.head_end {
                    func(CylHead::new(cyl, head));
                }
            }
        }
    }
}

impl Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.cyl_begin == 0 && self.head_begin == 0 {
            write!(f, "{} cyls, {} heads", self.cyl_end, self.head_end)
        }
        else {
            write!(
                f,
                "cyls {}-{}, heads {}-{}",
                self.cyl_begin,
                self.cyl_end.saturating_sub(1),
                self.head_begin,
                self.head_end.saturating_sub(1)
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_orders() {
        let range = Range::new(2, 2);
        let mut heads_first = Vec::new();
        range.each(|ch| heads_first.push((ch.cyl, ch.head)), false);
        assert_eq!(heads_first, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);

        let mut cyls_first = Vec::new();
        range.each(|ch| cyls_first.push((ch.cyl, ch.head)), true);
        assert_eq!(cyls_first, vec![(0, 0), (1, 0), (0, 1), (1, 1)]);
    }

    #[test]
    fn empty_iff_zero_area() {
        assert!(Range::new(0, 2).is_empty());
        assert!(Range::new(2, 0).is_empty());
        assert!(!Range::new(1, 1).is_empty());
        assert!(Range::with_bounds(3, 3, 0, 2).is_empty());
    }
}
