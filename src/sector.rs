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

    src/sector.rs

    One physical sector: its identity, its accumulated data copies, and the
    statistics gathered while reading it.
*/

use crate::normalise::checksum_methods;
use crate::types::chs::Header;
use crate::types::enums::{DataRate, Encoding, DAM_DELETED, DAM_NORMAL};
use crate::util::are_offsets_tolerated_same;
use bitflags::bitflags;
use std::fmt::Display;

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct SectorFlags: u8 {
        /// The ID field CRC failed on every read so far.
        const BAD_ID_CRC   = 0b0000_0001;
        /// No stored copy passed the data field CRC.
        const BAD_DATA_CRC = 0b0000_0010;
        /// A data field was found with no readable ID field before it.
        const ORPHAN       = 0b0000_0100;
    }
}

/// One observed rendition of the sector's data field.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DataCopy {
    pub data: Vec<u8>,
    /// How many reads produced exactly these bytes.
    pub read_count: u32,
}

/// The result of merging another observation into a sector.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MergeResult {
    Unchanged,
    Improved,
    NewDataOverLimit,
    Matched,
}

impl MergeResult {
    fn rank(self) -> u8 {
        match self {
            MergeResult::Improved => 3,
            MergeResult::Matched => 2,
            MergeResult::NewDataOverLimit => 1,
            MergeResult::Unchanged => 0,
        }
    }

    /// The stronger of two outcomes, used when folding per-copy results.
    pub fn combine(self, other: MergeResult) -> MergeResult {
        if other.rank() > self.rank() {
            other
        }
        else {
            self
        }
    }
}

#[derive(Clone, Debug)]
pub struct Sector {
    pub header: Header,
    pub datarate: DataRate,
    pub encoding: Encoding,
    /// The data address mark byte preceding the data field.
    pub dam: u8,
    /// Raw bit offset of the ID address mark within the revolution.
    /// Zero means the offset is unknown; use [`Sector::offset`].
    pub raw_offset: u32,
    /// Which revolution of a multi-revolution capture this sector came from.
    pub revolution: u8,
    pub gap3: u8,
    flags: SectorFlags,
    copies: Vec<DataCopy>,
    read_attempts: u32,
}

impl Sector {
    /// Offsets in [0, 16) collapse to "unknown" when encoders divide by 16,
    /// so synced sectors must never end up this close to zero.
    pub const OFFSET_ALMOST_0: u32 = 16;

    pub fn new(datarate: DataRate, encoding: Encoding, header: Header) -> Self {
        Self {
            header,
            datarate,
            encoding,
            dam: DAM_NORMAL,
            raw_offset: 0,
            revolution: 0,
            gap3: 0,
            flags: SectorFlags::empty(),
            copies: Vec::new(),
            read_attempts: 0,
        }
    }

    /// The sector's bit offset, if one is known.
    pub fn offset(&self) -> Option<u32> {
        (self.raw_offset != 0).then_some(self.raw_offset)
    }

    pub fn set_offset(&mut self, offset: u32) {
        self.raw_offset = offset;
    }

    /// Nudge a synced offset of exactly zero to one, so it survives storage.
    pub fn make_offset_not_0(&mut self) -> bool {
        if self.raw_offset == 0 {
            self.raw_offset = 1;
            return true;
        }
        false
    }

    /// The size in bytes declared by the header.
    pub fn size(&self) -> usize {
        self.header.size_bytes()
    }

    pub fn is_8k_sector(&self) -> bool {
        self.header.is_8k()
    }

    pub fn copies(&self) -> usize {
        self.copies.len()
    }

    pub fn datas(&self) -> &[DataCopy] {
        &self.copies
    }

    pub fn has_data(&self) -> bool {
        !self.copies.is_empty()
    }

    /// The stored length of the best copy, which may exceed the declared size
    /// when gap bytes were captured.
    pub fn data_size(&self) -> usize {
        self.data_best_copy().map_or(0, |d| d.len())
    }

    pub fn has_gapdata(&self) -> bool {
        self.data_size() > self.size()
    }

    /// Whether a copy exists covering at least the declared sector size.
    pub fn has_normaldata(&self) -> bool {
        self.data_size() >= self.size()
    }

    pub fn data_copy(&self, index: usize) -> &[u8] {
        &self.copies[index].data
    }

    /// The copy seen most often, the best available reconstruction.
    pub fn data_best_copy(&self) -> Option<&Vec<u8>> {
        self.copies
            .iter()
            .max_by_key(|c| c.read_count)
            .map(|c| &c.data)
    }

    pub fn read_count_of_copy(&self, index: usize) -> u32 {
        self.copies[index].read_count
    }

    pub fn set_read_count_of_copy(&mut self, index: usize, count: u32) {
        if let Some(copy) = self.copies.get_mut(index) {
            copy.read_count = count.max(1);
        }
    }

    pub fn read_attempts(&self) -> u32 {
        self.read_attempts
    }

    pub fn set_read_attempts(&mut self, attempts: u32) {
        self.read_attempts = attempts;
    }

    /// Called once a disk read completes, so sectors populated by image
    /// readers carry plausible statistics.
    pub fn fix_readstats(&mut self) {
        for copy in &mut self.copies {
            if copy.read_count == 0 {
                copy.read_count = 1;
            }
        }
        let total: u32 = self.copies.iter().map(|c| c.read_count).sum();
        if self.read_attempts < total {
            self.read_attempts = total;
        }
    }

    pub fn has_badidcrc(&self) -> bool {
        self.flags.contains(SectorFlags::BAD_ID_CRC)
    }

    pub fn has_baddatacrc(&self) -> bool {
        self.flags.contains(SectorFlags::BAD_DATA_CRC)
    }

    pub fn set_badidcrc(&mut self) {
        self.flags.insert(SectorFlags::BAD_ID_CRC);
    }

    pub fn set_baddatacrc(&mut self) {
        self.flags.insert(SectorFlags::BAD_DATA_CRC);
    }

    pub fn is_deleted(&self) -> bool {
        self.dam == DAM_DELETED
    }

    pub fn is_orphan(&self) -> bool {
        self.flags.contains(SectorFlags::ORPHAN)
    }

    pub fn set_orphan(&mut self) {
        self.flags.insert(SectorFlags::ORPHAN);
    }

    /// An 8K sector whose stored checksum matches a recognised protection
    /// method is as good as a CRC-clean sector.
    pub fn is_checksummable_8k(&self) -> bool {
        if !self.is_8k_sector() || !self.has_data() {
            return false;
        }
        let data = self.data_best_copy().expect("has_data checked");
        let methods = checksum_methods(data);
        !methods.is_empty()
    }

    /// A good sector has a good ID CRC and a good data CRC, or is a
    /// checksummable 8K sector.
    pub fn has_good_data(&self) -> bool {
        if self.has_badidcrc() {
            return false;
        }
        if self.has_data() && !self.has_baddatacrc() {
            return true;
        }
        self.is_checksummable_8k()
    }

    pub fn has_good_normaldata(&self) -> bool {
        self.has_good_data() && self.has_normaldata()
    }

    /// Stable data will not improve with further reads: either it is already
    /// good, or repeated reads keep producing the same bytes.
    pub fn has_stable_data(&self) -> bool {
        if self.has_good_data() {
            return true;
        }
        self.copies.iter().any(|c| c.read_count >= 2)
    }

    /// Adopt the target rate when ours is only its rotation-speed twin, so
    /// 300K reads of a 250K disk match during repair.
    pub fn normalise_datarate(&mut self, target: DataRate) {
        if self.datarate != target && self.datarate.is_interchangeable_with(target) {
            self.datarate = target;
        }
    }

    pub fn has_same_header(&self, other: &Sector) -> bool {
        self.header == other.header
    }

    pub fn has_same_header_rate_encoding(&self, other: &Sector) -> bool {
        self.header == other.header
            && self.encoding == other.encoding
            && self.datarate.is_interchangeable_with(other.datarate)
    }

    /// Whether `other` is another observation of this physical sector, its
    /// offset within the byte tolerance of ours.
    pub fn is_tolerated_same(&self, other: &Sector, byte_tolerance: i32, tracklen: u32) -> bool {
        self.has_same_header_rate_encoding(other)
            && are_offsets_tolerated_same(
                self.raw_offset,
                other.raw_offset,
                self.encoding,
                byte_tolerance,
                tracklen,
            )
    }

    /// Forward bit distance from this sector to `next`, wrapped at the track
    /// end.
    pub fn offset_distance_to(&self, next: &Sector, tracklen: u32) -> u32 {
        if next.raw_offset >= self.raw_offset {
            next.raw_offset - self.raw_offset
        }
        else {
            tracklen + next.raw_offset - self.raw_offset
        }
    }

    /// The least bit distance to the next sector's ID: this sector's overhead
    /// plus its data.
    pub fn next_sector_offset_distance_min(&self) -> u32 {
        let overhead_bytes = match self.encoding {
            Encoding::Fm | Encoding::Rx02 => 33,
            _ => 62,
        };
        (overhead_bytes + self.size() as u32) * self.encoding.bitcells_per_byte()
    }

    /// Add one copy of the sector's data. A copy identical to one already
    /// held increments that copy's read count instead of being stored.
    pub fn add(&mut self, data: Vec<u8>, bad_crc: bool, dam: u8) -> MergeResult {
        self.add_with_readstats(data, bad_crc, dam, 1, usize::MAX, false)
    }

    pub fn add_with_readstats(
        &mut self,
        data: Vec<u8>,
        bad_crc: bool,
        dam: u8,
        read_count: u32,
        max_copies: usize,
        paranoia: bool,
    ) -> MergeResult {
        self.read_attempts += read_count.max(1);

        if self.copies.is_empty() {
            self.dam = dam;
            self.flags.set(SectorFlags::BAD_DATA_CRC, bad_crc);
            self.copies.push(DataCopy {
                data,
                read_count: read_count.max(1),
            });
            return MergeResult::Improved;
        }

        // An existing good copy beats an incoming bad one.
        if !self.has_baddatacrc() && bad_crc {
            return MergeResult::Unchanged;
        }

        // An incoming good copy retires the accumulated bad ones.
        if self.has_baddatacrc() && !bad_crc {
            if !paranoia {
                self.copies.clear();
            }
            self.flags.remove(SectorFlags::BAD_DATA_CRC);
            self.dam = dam;
            self.copies.push(DataCopy {
                data,
                read_count: read_count.max(1),
            });
            return MergeResult::Improved;
        }

        // Same CRC status: an identical copy only bumps the read count.
        if let Some(copy) = self.copies.iter_mut().find(|c| c.data == data) {
            copy.read_count += read_count.max(1);
            return MergeResult::Matched;
        }

        // Differing good copies are only kept when being paranoid.
        if !bad_crc && !paranoia {
            return MergeResult::Unchanged;
        }

        if self.copies.len() >= max_copies {
            return MergeResult::NewDataOverLimit;
        }

        self.copies.push(DataCopy {
            data,
            read_count: read_count.max(1),
        });
        MergeResult::Improved
    }

    /// Merge another observation of the same physical sector. Header error
    /// flags stay sticky until a good read arrives; data copies accumulate
    /// up to `max_copies`.
    pub fn merge(&mut self, other: Sector, max_copies: usize, paranoia: bool) -> MergeResult {
        let mut result = MergeResult::Unchanged;

        if self.has_badidcrc() && !other.has_badidcrc() {
            self.flags.remove(SectorFlags::BAD_ID_CRC);
            result = MergeResult::Improved;
        }

        if self.raw_offset == 0 && other.raw_offset != 0 {
            self.raw_offset = other.raw_offset;
        }
        if self.gap3 == 0 && other.gap3 != 0 {
            self.gap3 = other.gap3;
        }

        let other_bad_crc = other.has_baddatacrc();
        let other_dam = other.dam;
        self.read_attempts += other.read_attempts;
        for copy in other.copies {
            let copy_result = self.add_with_readstats(
                copy.data,
                other_bad_crc,
                other_dam,
                copy.read_count,
                max_copies,
                paranoia,
            );
            result = result.combine(copy_result);
        }

        result
    }

    /// Drop all but the first `count` copies.
    pub fn limit_copies(&mut self, count: usize) {
        if self.copies.len() > count {
            self.copies.truncate(count);
        }
    }

    pub fn remove_data(&mut self) {
        self.copies.clear();
        self.flags.remove(SectorFlags::BAD_DATA_CRC);
    }

    /// Trim stored gap bytes back to the declared sector size. When
    /// `keep_crc_hint` is set the sector is assumed to retain its gap3 field
    /// separately.
    pub fn remove_gapdata(&mut self) {
        let size = self.size();
        for copy in &mut self.copies {
            if copy.data.len() > size {
                copy.data.truncate(size);
            }
        }
    }

    /// Replace every copy's bytes. Used by fixups that patch data in place.
    pub fn replace_data(&mut self, data: Vec<u8>, bad_crc: bool) {
        self.copies.clear();
        self.flags.set(SectorFlags::BAD_DATA_CRC, bad_crc);
        self.copies.push(DataCopy {
            data,
            read_count: 1,
        });
    }

    /// Reset data copies but keep identity, for sector-map summaries.
    pub fn copy_without_data(&self) -> Sector {
        let mut sector = self.clone();
        sector.copies.clear();
        sector.read_attempts = 0;
        sector
    }
}

impl Display for Sector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.header, self.datarate, self.encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sector() -> Sector {
        Sector::new(
            DataRate::Rate250K,
            Encoding::Mfm,
            Header::new(0, 0, 1, 2),
        )
    }

    #[test]
    fn identical_copy_bumps_read_count() {
        let mut s = sector();
        assert_eq!(s.add(vec![1; 512], true, DAM_NORMAL), MergeResult::Improved);
        assert_eq!(s.add(vec![1; 512], true, DAM_NORMAL), MergeResult::Matched);
        assert_eq!(s.copies(), 1);
        assert_eq!(s.read_count_of_copy(0), 2);
    }

    #[test]
    fn copies_differ_pairwise() {
        let mut s = sector();
        s.add(vec![1; 512], true, DAM_NORMAL);
        s.add(vec![2; 512], true, DAM_NORMAL);
        s.add(vec![1; 512], true, DAM_NORMAL);
        assert_eq!(s.copies(), 2);
        for i in 0..s.copies() {
            for j in i + 1..s.copies() {
                assert_ne!(s.data_copy(i), s.data_copy(j));
            }
        }
    }

    #[test]
    fn good_copy_retires_bad_ones() {
        let mut s = sector();
        s.add(vec![1; 512], true, DAM_NORMAL);
        s.add(vec![2; 512], true, DAM_NORMAL);
        assert!(s.has_baddatacrc());
        assert_eq!(s.add(vec![3; 512], false, DAM_NORMAL), MergeResult::Improved);
        assert!(!s.has_baddatacrc());
        assert_eq!(s.copies(), 1);
        assert!(s.has_good_data());
    }

    #[test]
    fn bad_copy_cannot_degrade_good_sector() {
        let mut s = sector();
        s.add(vec![3; 512], false, DAM_NORMAL);
        assert_eq!(s.add(vec![1; 512], true, DAM_NORMAL), MergeResult::Unchanged);
        assert!(s.has_good_data());
        assert_eq!(s.copies(), 1);
    }

    #[test]
    fn copy_cap_is_honoured() {
        let mut s = sector();
        for i in 0..5u8 {
            s.add_with_readstats(vec![i; 512], true, DAM_NORMAL, 1, 3, false);
        }
        assert_eq!(s.copies(), 3);
        assert_eq!(
            s.add_with_readstats(vec![9; 512], true, DAM_NORMAL, 1, 3, false),
            MergeResult::NewDataOverLimit
        );
    }

    #[test]
    fn merge_clears_sticky_id_crc_on_good_read() {
        let mut bad = sector();
        bad.set_badidcrc();
        let mut good = sector();
        good.add(vec![7; 512], false, DAM_NORMAL);
        assert_eq!(bad.merge(good, 3, false), MergeResult::Improved);
        assert!(!bad.has_badidcrc());
        assert!(bad.has_good_data());
    }

    #[test]
    fn stable_after_two_matching_bad_reads() {
        let mut s = sector();
        s.add(vec![1; 512], true, DAM_NORMAL);
        assert!(!s.has_stable_data());
        s.add(vec![1; 512], true, DAM_NORMAL);
        assert!(s.has_stable_data());
    }
}
