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

    src/format.rs

    Regular-geometry hints: the shape a well-behaved disk is expected to
    take, and the well-known formats sized images are matched against.
*/

use crate::opts::CoreOptions;
use crate::types::chs::{CylHead, Header};
use crate::types::enums::{DataRate, Encoding};
use crate::types::range::Range;
use crate::DiskError;
use crate::{MAX_CYLS, MAX_HEADS, MAX_SECTORS};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegularFormat {
    Mgt,
    Pc320,
    Pc360,
    Pc640,
    Pc720,
    Pc1200,
    Pc1232,
    Pc1440,
    Pc2880,
    AtariSt,
    AmigaDos,
    AmigaDosHd,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Format {
    pub regular_format: Option<RegularFormat>,
    pub cyls: u16,
    pub heads: u8,
    pub sectors: u8,
    /// Sector size code; bytes are `128 << size`.
    pub size: u8,
    /// First sector id.
    pub base: u8,
    /// Rotation of the id sequence at cylinder 0.
    pub offset: u8,
    pub interleave: u8,
    pub skew: u8,
    pub gap3: u8,
    pub fill: u8,
    pub datarate: DataRate,
    pub encoding: Encoding,
    /// Overrides for the head byte recorded in sector headers.
    pub head0: Option<u8>,
    pub head1: Option<u8>,
    pub cyls_first: bool,
}

impl Default for Format {
    fn default() -> Self {
        Self {
            regular_format: None,
            cyls: 80,
            heads: 2,
            sectors: 0,
            size: 2,
            base: 1,
            offset: 0,
            interleave: 1,
            skew: 0,
            gap3: 0,
            fill: 0x00,
            datarate: DataRate::Unknown,
            encoding: Encoding::Unknown,
            head0: None,
            head1: None,
            cyls_first: false,
        }
    }
}

impl From<RegularFormat> for Format {
    fn from(reg_fmt: RegularFormat) -> Self {
        let mut fmt = Format {
            regular_format: Some(reg_fmt),
            datarate: DataRate::Rate250K,
            encoding: Encoding::Mfm,
            ..Format::default()
        };

        match reg_fmt {
            RegularFormat::Mgt => {
                fmt.sectors = 10;
                fmt.skew = 1;
                fmt.gap3 = 24;
            }
            RegularFormat::Pc320 => {
                fmt.cyls = 40;
                fmt.sectors = 8;
                fmt.skew = 1;
                fmt.gap3 = 0x50;
                fmt.fill = 0xF6;
            }
            RegularFormat::Pc360 => {
                fmt.cyls = 40;
                fmt.sectors = 9;
                fmt.skew = 1;
                fmt.gap3 = 0x50;
                fmt.fill = 0xF6;
            }
            RegularFormat::Pc640 => {
                fmt.sectors = 8;
                fmt.skew = 1;
                fmt.gap3 = 0x50;
                fmt.fill = 0xE5;
            }
            RegularFormat::Pc720 => {
                fmt.sectors = 9;
                fmt.skew = 1;
                fmt.gap3 = 0x50;
                fmt.fill = 0xF6;
            }
            RegularFormat::Pc1200 => {
                fmt.datarate = DataRate::Rate500K;
                fmt.sectors = 15;
                fmt.skew = 1;
                fmt.gap3 = 0x54;
                fmt.fill = 0xF6;
            }
            RegularFormat::Pc1232 => {
                fmt.datarate = DataRate::Rate500K;
                fmt.cyls = 77;
                fmt.sectors = 8;
                fmt.size = 3;
                fmt.skew = 1;
                fmt.gap3 = 0x54;
                fmt.fill = 0xF6;
            }
            RegularFormat::Pc1440 => {
                fmt.datarate = DataRate::Rate500K;
                fmt.sectors = 18;
                fmt.skew = 1;
                fmt.gap3 = 0x65;
                fmt.fill = 0xF6;
            }
            RegularFormat::Pc2880 => {
                fmt.datarate = DataRate::Rate1M;
                fmt.sectors = 36;
                fmt.skew = 1;
                fmt.gap3 = 0x53;
                fmt.fill = 0xF6;
            }
            RegularFormat::AtariSt => {
                fmt.sectors = 9;
                fmt.gap3 = 40;
                fmt.fill = 0x00;
            }
            RegularFormat::AmigaDos => {
                fmt.encoding = Encoding::Amiga;
                fmt.sectors = 11;
                fmt.base = 0;
            }
            RegularFormat::AmigaDosHd => {
                fmt.datarate = DataRate::Rate500K;
                fmt.encoding = Encoding::Amiga;
                fmt.sectors = 22;
                fmt.base = 0;
            }
        }
        fmt
    }
}

impl Format {
    pub fn is_none(&self) -> bool {
        self.sectors == 0
    }

    pub fn sector_size(&self) -> usize {
        Header::size_code_to_length(self.size)
    }

    pub fn track_size(&self) -> usize {
        self.sector_size() * self.sectors as usize
    }

    pub fn cyl_size(&self) -> usize {
        self.track_size() * self.heads as usize
    }

    pub fn disk_size(&self) -> usize {
        self.cyl_size() * self.cyls as usize
    }

    pub fn total_sectors(&self) -> usize {
        self.cyls as usize * self.heads as usize * self.sectors as usize
    }

    pub fn range(&self) -> Range {
        Range::new(self.cyls, self.heads)
    }

    /// The head byte recorded in sector headers for a physical head.
    pub fn head_id(&self, head: u8) -> u8 {
        match head {
            0 => self.head0.unwrap_or(0),
            _ => self.head1.unwrap_or(1),
        }
    }

    /// The sector ids of one track, laid out with the configured
    /// interleave, skew and rotation.
    pub fn get_ids(&self, cylhead: CylHead) -> Vec<u8> {
        let sectors = self.sectors as usize;
        if sectors == 0 {
            return Vec::new();
        }
        let mut ids = vec![0u8; sectors];
        let mut used = vec![false; sectors];
        let interleave = (self.interleave.max(1)) as usize;
        let start =
            (self.offset as usize + cylhead.cyl as usize * self.skew as usize) % sectors;

        let mut pos = start;
        for i in 0..sectors {
            while used[pos] {
                pos = (pos + 1) % sectors;
            }
            ids[pos] = self.base.wrapping_add(i as u8);
            used[pos] = true;
            pos = (pos + interleave) % sectors;
        }
        ids
    }

    pub fn try_validate(&self) -> bool {
        self.cyls > 0
            && (self.cyls as usize) <= MAX_CYLS
            && self.heads > 0
            && (self.heads as usize) <= MAX_HEADS
            && self.sectors > 0
            && (self.sectors as usize) <= MAX_SECTORS
    }

    pub fn validate(&self) -> Result<(), DiskError> {
        if !self.try_validate() {
            return Err(DiskError::BadGeometry);
        }
        Ok(())
    }

    /// Match an image size against the well-known regular formats.
    pub fn from_size(size: u64) -> Option<Format> {
        let mut fmt = match size {
            163_840 => {
                // 5.25" SSDD (160K)
                let mut f = Format::from(RegularFormat::Pc320);
                f.heads = 1;
                f
            }
            184_320 => {
                // 5.25" SSDD (180K)
                let mut f = Format::from(RegularFormat::Pc360);
                f.heads = 1;
                f
            }
            327_680 => Format::from(RegularFormat::Pc320), // 5.25" DSDD (320K)
            368_640 => Format::from(RegularFormat::Pc360), // 5.25" DSDD (360K)
            655_360 => Format::from(RegularFormat::Pc640), // 3.5"  DSDD (640K)
            737_280 => Format::from(RegularFormat::Pc720), // 3.5"  DSDD (720K)
            819_200 => Format::from(RegularFormat::Mgt),   // MGT (800K)
            1_228_800 => Format::from(RegularFormat::Pc1200), // 5.25" DSHD (1200K)
            1_261_568 => Format::from(RegularFormat::Pc1232), // 5.25" DSHD (1232K)
            1_474_560 => Format::from(RegularFormat::Pc1440), // 3.5"  DSHD (1440K)
            1_763_328 => {
                // 3.5" DSHD (1722K)
                let mut f = Format::from(RegularFormat::Pc1440);
                f.cyls = 82;
                f.sectors = 21;
                f.gap3 = 0;
                f
            }
            2_949_120 => Format::from(RegularFormat::Pc2880), // 3.5" DSED (2880K)
            _ => return None,
        };

        // Oversized DOS variants share the 1440K shell with more sectors.
        if fmt.regular_format == Some(RegularFormat::Pc1440) && size != 1_474_560 {
            fmt.gap3 = 0;
        }
        Some(fmt)
    }

    /// Merge command-line overrides into the format.
    pub fn apply_overrides(&mut self, opts: &CoreOptions) {
        if opts.fill >= 0 {
            self.fill = opts.fill as u8;
        }
        if opts.gap3 >= 0 {
            self.gap3 = opts.gap3 as u8;
        }
        if opts.base >= 0 {
            self.base = opts.base as u8;
        }
        if opts.interleave >= 0 {
            self.interleave = opts.interleave as u8;
        }
        if opts.skew >= 0 {
            self.skew = opts.skew as u8;
        }
        if (0..=7).contains(&opts.size) {
            self.size = opts.size as u8;
        }
        if opts.head0 >= 0 {
            self.head0 = Some(opts.head0 as u8);
        }
        if opts.head1 >= 0 {
            self.head1 = Some(opts.head1 as u8);
        }
        if opts.datarate != DataRate::Unknown {
            self.datarate = opts.datarate;
        }
        if opts.encoding != Encoding::Unknown {
            self.encoding = opts.encoding;
        }
        self.cyls_first = opts.cyls_first;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_360k_matches_pc360() {
        let fmt = Format::from_size(368_640).expect("known size");
        assert_eq!(fmt.encoding, Encoding::Mfm);
        assert_eq!(fmt.datarate, DataRate::Rate250K);
        assert_eq!(
            (fmt.cyls, fmt.heads, fmt.sectors, fmt.sector_size()),
            (40, 2, 9, 512)
        );
        assert_eq!(fmt.disk_size(), 368_640);
    }

    #[test]
    fn unknown_sizes_are_rejected() {
        assert!(Format::from_size(12_345).is_none());
    }

    #[test]
    fn sequential_ids_with_interleave_one() {
        let fmt = Format::from(RegularFormat::Pc360);
        let ids = fmt.get_ids(CylHead::new(0, 0));
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn interleave_two_spreads_ids() {
        let mut fmt = Format::from(RegularFormat::Pc360);
        fmt.interleave = 2;
        fmt.skew = 0;
        let ids = fmt.get_ids(CylHead::new(0, 0));
        assert_eq!(ids.len(), 9);
        // Logical successors sit two slots apart.
        let pos_of = |id: u8| ids.iter().position(|&x| x == id).unwrap();
        assert_eq!((pos_of(2) + 9 - pos_of(1)) % 9, 2);
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn skew_rotates_by_cylinder() {
        let mut fmt = Format::from(RegularFormat::Pc360);
        fmt.skew = 2;
        let cyl0 = fmt.get_ids(CylHead::new(0, 0));
        let cyl1 = fmt.get_ids(CylHead::new(1, 0));
        assert_eq!(cyl0[0], 1);
        assert_eq!(cyl1[2], 1);
    }

    #[test]
    fn geometry_bounds_are_enforced() {
        let mut fmt = Format::from(RegularFormat::Pc360);
        assert!(fmt.validate().is_ok());
        fmt.cyls = 0;
        assert!(matches!(fmt.validate(), Err(DiskError::BadGeometry)));
        fmt.cyls = 300;
        assert!(fmt.validate().is_err());
    }
}
