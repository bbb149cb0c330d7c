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

    src/track.rs

    The ordered set of sectors observed on one side of one cylinder, and the
    algebra that merges, validates, and re-synchronises observations.
*/

use crate::messages::{message, message_always, MessageKind};
use crate::sector::{MergeResult, Sector};
use crate::types::chs::{CylHead, Header};
use crate::types::enums::{DataRate, Encoding};
use crate::util::{
    are_offsets_tolerated_same, bits_to_time_us, byte_position_as_bit_offset, modulo, modulo_div,
    time_us_to_bits, tolerated_offset_distance,
};
use crate::DiskError;
use std::collections::{BTreeMap, BTreeSet};

/// The outcome of adding a sector observation to a track.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddResult {
    Append,
    Insert,
    Merge,
    Unchanged,
}

/// Offset matching and copy accumulation policy, carried from `CoreOptions`.
#[derive(Copy, Clone, Debug)]
pub struct MergePolicy {
    pub byte_tolerance: i32,
    pub max_copies: usize,
    pub paranoia: bool,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            byte_tolerance: 64,
            max_copies: 3,
            paranoia: false,
        }
    }
}

impl From<&crate::opts::CoreOptions> for MergePolicy {
    fn from(opts: &crate::opts::CoreOptions) -> Self {
        Self {
            byte_tolerance: opts.byte_tolerance_of_time,
            max_copies: opts.maxcopies,
            paranoia: opts.paranoia,
        }
    }
}

/// Sector ids seen more than once on a track, with their observed offsets.
/// Legal on protected disks, problematic everywhere else.
#[derive(Clone, Debug, Default)]
pub struct RepeatedSectors(pub BTreeMap<u8, Vec<u32>>);

impl RepeatedSectors {
    pub fn contains_id(&self, id: u8) -> bool {
        self.0.contains_key(&id)
    }

    pub fn find_tolerated_offset_by_id(
        &self,
        id: u8,
        offset: u32,
        encoding: Encoding,
        byte_tolerance: i32,
        tracklen: u32,
    ) -> Option<u32> {
        let offsets = self.0.get(&id)?;
        offsets
            .iter()
            .copied()
            .find(|&o| are_offsets_tolerated_same(offset, o, encoding, byte_tolerance, tracklen))
    }
}

/// A set of sector identities, used to describe already-good sectors that
/// need not be read again.
#[derive(Clone, Debug, Default)]
pub struct SectorSet {
    sectors: Vec<Sector>,
}

impl SectorSet {
    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sector> {
        self.sectors.iter()
    }

    pub fn push(&mut self, sector: Sector) {
        self.sectors.push(sector);
    }

    pub fn extend(&mut self, other: SectorSet) {
        self.sectors.extend(other.sectors);
    }

    /// Whether a matching identity is present. Offsets are ignored when
    /// `ignore_offset` is set, as repair matching does.
    pub fn contains(&self, sector: &Sector, tracklen: u32, ignore_offset: bool) -> bool {
        self.sectors.iter().any(|s| {
            s.has_same_header_rate_encoding(sector)
                && (ignore_offset
                    || s.offset().is_none()
                    || sector.offset().is_none()
                    || are_offsets_tolerated_same(
                        s.raw_offset,
                        sector.raw_offset,
                        s.encoding,
                        MergePolicy::default().byte_tolerance,
                        tracklen,
                    ))
        })
    }

    pub fn contains_id(&self, id: u8) -> bool {
        self.sectors.iter().any(|s| s.header.sector == id)
    }

    /// Whether the set covers the full id run `[base, base+len)`.
    pub fn has_id_sequence(&self, base: u8, len: u8) -> bool {
        (base..base.saturating_add(len)).all(|id| self.contains_id(id))
    }

    /// The ids from `wanted` that are not covered by this set.
    pub fn not_containing_ids(&self, wanted: std::ops::Range<u8>) -> BTreeSet<u8> {
        wanted.filter(|&id| !self.contains_id(id)).collect()
    }

    pub fn ids_string(&self) -> String {
        let ids: Vec<String> = self
            .sectors
            .iter()
            .map(|s| s.header.sector.to_string())
            .collect();
        ids.join(",")
    }
}

/// Statistics of the uniform bit distance between neighbouring sector ids.
#[derive(Clone, Debug, Default)]
pub struct OffsetDistanceInfo {
    pub average: f64,
    pub min: f64,
    pub max: f64,
    /// Sector indices dropped for being implausibly close to a neighbour.
    pub ignored: BTreeSet<usize>,
    /// Sector indices whose distance to the next id is not the average.
    pub not_average: BTreeSet<usize>,
}

impl OffsetDistanceInfo {
    pub fn is_empty(&self) -> bool {
        self.average == 0.0
    }

    pub fn reset(&mut self) {
        *self = OffsetDistanceInfo::default();
    }
}

/// A discovered or predicted sector id at an offset interval. A hole where a
/// sector must sit carries `id: None` until the scheme is recognised.
#[derive(Clone, Debug)]
pub struct IdAndOffset {
    pub id: Option<u8>,
    pub offset_min: u32,
    pub offset_max: u32,
}

/// How syncing treats offsets that leave the revolution.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyncMode {
    Unlimited,
    RevolutionLimited,
}

#[derive(Clone, Debug, Default)]
pub struct Track {
    sectors: Vec<Sector>,
    /// Track length in raw bit cells; zero when unknown.
    pub tracklen: u32,
    /// Track time in microseconds; zero when unknown.
    pub tracktime: u32,
    /// Discovered sector-id scheme, populated by `discover_sector_scheme`.
    pub id_offset_pairs: Vec<IdAndOffset>,
    offset_distance: OffsetDistanceInfo,
}

impl Track {
    pub fn new() -> Self {
        Track::default()
    }

    pub fn with_capacity(num_sectors: usize) -> Self {
        Track {
            sectors: Vec::with_capacity(num_sectors),
            ..Track::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn sectors(&self) -> &[Sector] {
        &self.sectors
    }

    pub fn sectors_mut(&mut self) -> &mut [Sector] {
        &mut self.sectors
    }

    pub fn sector(&self, index: usize) -> &Sector {
        &self.sectors[index]
    }

    pub fn sector_mut(&mut self, index: usize) -> &mut Sector {
        &mut self.sectors[index]
    }

    /// The track's sectors reordered by sector id, for directory-style
    /// listings.
    pub fn sectors_view_ordered_by_id(&self) -> Vec<&Sector> {
        let mut view: Vec<&Sector> = self.sectors.iter().collect();
        view.sort_by_key(|s| s.header.sector);
        view
    }

    pub fn data_rate(&self) -> Option<DataRate> {
        self.sectors.first().map(|s| s.datarate)
    }

    pub fn encoding(&self) -> Option<Encoding> {
        self.sectors.first().map(|s| s.encoding)
    }

    pub fn index_of(&self, header: &Header) -> Option<usize> {
        self.sectors.iter().position(|s| s.header == *header)
    }

    pub fn find(&self, header: &Header) -> Option<&Sector> {
        self.sectors.iter().find(|s| s.header == *header)
    }

    pub fn find_mut(&mut self, header: &Header) -> Option<&mut Sector> {
        self.sectors.iter_mut().find(|s| s.header == *header)
    }

    /// Match by CHRN ignoring the size code, needed when probing for a boot
    /// sector of unknown size.
    pub fn find_ignoring_size(&self, header: &Header) -> Option<&Sector> {
        self.sectors.iter().find(|s| {
            s.header.cyl == header.cyl
                && s.header.head == header.head
                && s.header.sector == header.sector
        })
    }

    pub fn find_with_rate_encoding(
        &self,
        header: &Header,
        datarate: DataRate,
        encoding: Encoding,
    ) -> Option<usize> {
        self.sectors.iter().position(|s| {
            s.header == *header
                && s.encoding == encoding
                && s.datarate.is_interchangeable_with(datarate)
        })
    }

    pub fn clear(&mut self) {
        // Keep tracklen and tracktime; only the sectors are discarded.
        self.sectors.clear();
        self.id_offset_pairs.clear();
        self.offset_distance.reset();
    }

    pub fn set_tracklen(&mut self, tracklen: u32) {
        self.tracklen = tracklen;
        if let Some(rate) = self.data_rate() {
            self.tracktime = bits_to_time_us(rate, tracklen);
        }
    }

    pub fn set_tracktime(&mut self, tracktime: u32) {
        self.tracktime = tracktime;
        if let Some(rate) = self.data_rate() {
            self.tracklen = time_us_to_bits(rate, tracktime);
        }
    }

    /// Add a sector observation, merging it into a close-enough existing
    /// sector when there is one.
    pub fn add(&mut self, sector: Sector, policy: &MergePolicy) -> Result<AddResult, DiskError> {
        if let Some(rate) = self.data_rate() {
            if rate != sector.datarate {
                return Err(DiskError::MixedDataRates);
            }
        }

        // With no positional information, simply append.
        if sector.offset().is_none() {
            self.sectors.push(sector);
            return Ok(AddResult::Append);
        }

        // Find a sector close enough to the new offset to be the same one.
        let tracklen = self.tracklen;
        if let Some(index) = self
            .sectors
            .iter()
            .position(|s| sector.is_tolerated_same(s, policy.byte_tolerance, tracklen))
        {
            let merge_result =
                self.sectors[index].merge(sector, policy.max_copies, policy.paranoia);
            let result = match merge_result {
                MergeResult::Unchanged | MergeResult::Matched | MergeResult::NewDataOverLimit => {
                    AddResult::Unchanged
                }
                MergeResult::Improved => {
                    // Overlapping data cannot hold multiple trustworthy
                    // copies, except for protected 8K tracks.
                    if self.data_overlap(index) && !self.is_8k_sector() {
                        self.sectors[index].limit_copies(1);
                    }
                    AddResult::Merge
                }
            };
            return Ok(result);
        }

        // A new sector: insert at the position preserving offset order.
        let index = self
            .sectors
            .iter()
            .position(|s| sector.raw_offset < s.raw_offset)
            .unwrap_or(self.sectors.len());
        self.sectors.insert(index, sector);
        Ok(AddResult::Insert)
    }

    pub fn insert(&mut self, index: usize, sector: Sector) -> Result<(), DiskError> {
        if let Some(rate) = self.data_rate() {
            if rate != sector.datarate {
                return Err(DiskError::MixedDataRates);
            }
        }
        self.sectors.insert(index.min(self.sectors.len()), sector);
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Sector {
        self.sectors.remove(index)
    }

    /// Merge another observation of the whole track.
    pub fn add_track(&mut self, track: Track, policy: &MergePolicy) -> Result<(), DiskError> {
        // Use the longest track length and time seen.
        self.tracklen = self.tracklen.max(track.tracklen);
        self.tracktime = self.tracktime.max(track.tracktime);

        for sector in track.sectors {
            self.add(sector, policy)?;
        }
        Ok(())
    }

    /// Whether two non-orphan sectors share this sector's header.
    pub fn is_repeated(&self, sector: &Sector) -> bool {
        self.sectors
            .iter()
            .filter(|s| s.has_same_header_rate_encoding(sector))
            .count()
            > 1
    }

    pub fn is_mixed_encoding(&self) -> bool {
        match self.encoding() {
            None => false,
            Some(enc) => self.sectors.iter().any(|s| s.encoding != enc),
        }
    }

    /// A single-sector track declaring 8K of data, the shape of several
    /// protection schemes.
    pub fn is_8k_sector(&self) -> bool {
        self.sectors.len() == 1 && self.sectors[0].is_8k_sector()
    }

    pub fn has_all_good_data(&self) -> bool {
        self.sectors.iter().all(|s| s.has_good_data())
    }

    pub fn has_any_good_data(&self) -> bool {
        self.sectors.iter().any(|s| s.has_good_data())
    }

    pub fn good_sectors(&self) -> Vec<&Sector> {
        self.sectors
            .iter()
            .filter(|s| !s.has_badidcrc() && s.has_good_data())
            .collect()
    }

    /// The identities of sectors whose data will not improve with further
    /// reads.
    pub fn stable_sectors(&self) -> SectorSet {
        let mut set = SectorSet::default();
        for sector in &self.sectors {
            if !sector.has_badidcrc() && sector.has_stable_data() {
                set.push(sector.clone());
            }
        }
        set
    }

    /// Whether every sector is either stable or already covered by the
    /// supplied set.
    pub fn has_all_stable_data(&self, stable: &SectorSet) -> bool {
        self.sectors.iter().all(|s| {
            !s.has_badidcrc() && (stable.contains(s, self.tracklen, false) || s.has_stable_data())
        })
    }

    /// Estimate how many sequential-id sectors this track holds, by doubling
    /// the average id seen.
    pub fn normal_probable_size(&self) -> usize {
        let mut count = 0usize;
        let mut sum = 0i64;
        for sector in &self.sectors {
            if sector.has_badidcrc() {
                continue;
            }
            count += 1;
            sum += sector.header.sector as i64 - 1; // 0-based ids for the average
        }
        if count == 0 {
            return 0;
        }
        let average = sum as f64 / count as f64;
        let max_id = (average * 2.0 + 1.0).round() as i64;
        self.sectors
            .iter()
            .filter(|s| {
                !s.has_badidcrc() && s.header.sector >= 1 && (s.header.sector as i64) <= max_id
            })
            .count()
    }

    /// The bit distance from a sector's ID to the next non-orphan ID,
    /// wrapping past the index hole.
    pub fn data_extent_bits(&self, index: usize) -> u32 {
        let sector = &self.sectors[index];
        let tracklen = if self.tracklen != 0 {
            self.tracklen
        }
        else {
            crate::util::track_capacity(crate::util::RPM_TIME_300, sector.datarate)
        };

        let mut gap_bits = 0i64;
        let mut i = index;
        loop {
            i += 1;
            if i >= self.sectors.len() {
                i = 0;
                gap_bits += tracklen as i64;
            }
            if i == index || !self.sectors[i].is_orphan() {
                break;
            }
        }
        (gap_bits + self.sectors[i].raw_offset as i64 - sector.raw_offset as i64).max(0) as u32
    }

    /// The bytes available for the sector's data field before the next ID.
    pub fn data_extent_bytes(&self, index: usize) -> usize {
        let sector = &self.sectors[index];
        if sector.encoding != Encoding::Mfm && sector.encoding != Encoding::Fm {
            return sector.size();
        }
        let shift = if sector.encoding == Encoding::Fm { 5 } else { 4 };
        let gap_bytes = (self.data_extent_bits(index) >> shift) as usize;
        // ID overhead, gap2, sync and DAM overhead precede the data bytes.
        let overhead = if sector.encoding == Encoding::Fm { 31 } else { 60 };
        gap_bytes.saturating_sub(overhead)
    }

    /// Whether the sector's data field runs into the next sector's ID.
    pub fn data_overlap(&self, index: usize) -> bool {
        let sector = &self.sectors[index];
        if sector.offset().is_none() {
            return false;
        }
        self.data_extent_bytes(index) < sector.size()
    }

    /// Record ids appearing on more than one non-orphan sector.
    pub fn collect_repeated_sector_ids_into(&self, repeated: &mut RepeatedSectors) {
        if self.sectors.len() < 2 {
            return;
        }
        for (i, sector) in self.sectors.iter().enumerate().take(self.sectors.len() - 1) {
            if sector.is_orphan() || repeated.contains_id(sector.header.sector) {
                continue;
            }
            for other in &self.sectors[i + 1..] {
                if other.is_orphan() {
                    continue;
                }
                if sector.has_same_header(other) {
                    repeated.0.insert(
                        sector.header.sector,
                        vec![sector.raw_offset, other.raw_offset],
                    );
                    message_always(
                        MessageKind::Warning,
                        format!(
                            "repeated sectors ({}) at offsets ({}, {}) are problematic",
                            sector, sector.raw_offset, other.raw_offset
                        ),
                    );
                    break;
                }
            }
        }
    }

    /// Merge a track of known-repeated sectors into this one, matching each
    /// by tolerated offset so data lands on the right repetition.
    pub fn merge_by_avoiding_repeated_sectors(&mut self, track: Track, policy: &MergePolicy) {
        if self.is_empty() || track.is_empty() {
            return;
        }
        let tracklen = self.tracklen;
        for sector in track.sectors {
            let matched = self
                .sectors
                .iter_mut()
                .find(|s| s.is_tolerated_same(&sector, policy.byte_tolerance, tracklen));
            match matched {
                Some(target) => {
                    message_always(
                        MessageKind::Warning,
                        format!(
                            "matched repeated sector ({}) at offset {}, merging",
                            sector, sector.raw_offset
                        ),
                    );
                    target.merge(sector, policy.max_copies, policy.paranoia);
                }
                None => {
                    message_always(
                        MessageKind::Warning,
                        format!(
                            "cannot match repeated sector ({}) at offset {}, dropping it",
                            sector, sector.raw_offset
                        ),
                    );
                }
            }
        }
    }

    /// Validate a freshly scanned track. Repeats and overlaps are distinct
    /// error kinds so the caller can decide to accept the track anyway.
    pub fn validate(
        &self,
        repeated: &RepeatedSectors,
        byte_tolerance: i32,
    ) -> Result<(), DiskError> {
        if self.sectors.len() < 2 {
            return Ok(());
        }
        let encoding = self.encoding().unwrap_or_default();
        let tolerated = tolerated_offset_distance(encoding, byte_tolerance);

        for (i, sector) in self.sectors.iter().enumerate() {
            if sector.offset().is_none() {
                return Err(DiskError::InvalidOffset(format!(
                    "sector ({}) has no offset",
                    sector
                )));
            }
            if i + 1 < self.sectors.len() && self.sectors[i + 1].raw_offset < sector.raw_offset {
                return Err(DiskError::InvalidOffset(format!(
                    "sector ({}) offset {} exceeds the next sector's {}",
                    sector,
                    sector.raw_offset,
                    self.sectors[i + 1].raw_offset
                )));
            }
            if sector.is_orphan() {
                continue;
            }

            for other in &self.sectors[i + 1..] {
                if other.is_orphan() || !other.has_same_header(sector) {
                    continue;
                }
                let diff = sector.offset_distance_to(other, self.tracklen);
                if diff as i64 <= tolerated as i64 {
                    return Err(DiskError::InvalidOffset(format!(
                        "same tolerated close sectors ({}) at offsets ({}, {})",
                        sector, sector.raw_offset, other.raw_offset
                    )));
                }
                let known = repeated
                    .find_tolerated_offset_by_id(
                        sector.header.sector,
                        other.raw_offset,
                        encoding,
                        byte_tolerance,
                        self.tracklen,
                    )
                    .is_some();
                if known {
                    continue;
                }
                if diff < sector.next_sector_offset_distance_min() {
                    return Err(DiskError::OverlappedRepeatedSector);
                }
                return Err(DiskError::RepeatedSector {
                    id: sector.header.sector,
                });
            }
        }
        Ok(())
    }

    /// Drop sectors whose normal-looking headers betray a misread from a
    /// neighbouring cylinder.
    pub fn drop_sectors_from_neighbor_cyls(&mut self, cylhead: CylHead, cyl_limit: u16) {
        let mut i = 0;
        while i < self.sectors.len() {
            let sector = &self.sectors[i];
            let neighbor = sector.header.is_normal(cyl_limit)
                && sector.header.cyl != cylhead.cyl
                && sector.header.cyl.abs_diff(cylhead.cyl) <= 1;
            if neighbor {
                message_always(
                    MessageKind::Warning,
                    format!(
                        "dropping {} at offset {} due to misreading",
                        sector, sector.raw_offset
                    ),
                );
                self.sectors.remove(i);
            }
            else {
                i += 1;
            }
        }
    }

    /// Shift the whole track so no sector offset falls inside [0, 16), which
    /// storage formats would collapse to "unknown".
    pub fn ensure_not_almost0_offset(&mut self) {
        let Some(first) = self.sectors.first() else {
            return;
        };
        if first.raw_offset >= Sector::OFFSET_ALMOST_0 {
            return;
        }
        let shift = Sector::OFFSET_ALMOST_0 - first.raw_offset;
        for sector in &mut self.sectors {
            if sector.raw_offset >= Sector::OFFSET_ALMOST_0 {
                break;
            }
            sector.raw_offset += shift;
        }
    }

    /// Shift sector offsets by `sync_offset`, assuming single-revolution
    /// input; wrapped offsets re-enter at the far end of the track.
    pub fn sync_unlimited_to_offset(&mut self, sync_offset: i32) -> Result<(), DiskError> {
        self.sync_and_demulti(sync_offset, false, SyncMode::Unlimited, 0)
    }

    /// Shift sector offsets by `sync_offset`, refusing shifts that would push
    /// the first or last sector across the revolution boundary.
    pub fn sync_limited_to_offset(&mut self, sync_offset: i32) -> Result<(), DiskError> {
        self.sync_and_demulti(sync_offset, false, SyncMode::RevolutionLimited, 0)
    }

    /// Collapse a multi-revolution capture to one revolution and sync it.
    pub fn demulti_and_sync_unlimited(
        &mut self,
        sync_offset: i32,
        tracklen_single: u32,
    ) -> Result<(), DiskError> {
        self.sync_and_demulti(sync_offset, true, SyncMode::Unlimited, tracklen_single)
    }

    pub fn demulti_and_sync_limited(
        &mut self,
        sync_offset: i32,
        tracklen_single: u32,
    ) -> Result<(), DiskError> {
        self.sync_and_demulti(
            sync_offset,
            true,
            SyncMode::RevolutionLimited,
            tracklen_single,
        )
    }

    fn sync_and_demulti(
        &mut self,
        sync_offset: i32,
        demulti: bool,
        mode: SyncMode,
        tracklen_single: u32,
    ) -> Result<(), DiskError> {
        debug_assert!(self.tracklen > 0);
        debug_assert!(!demulti || tracklen_single > 0);

        if demulti {
            let tracklen_multi = self.tracklen;
            self.tracklen = tracklen_single;
            self.tracktime = ((self.tracktime as u64 * tracklen_single as u64)
                / tracklen_multi.max(1) as u64) as u32;
        }
        if self.sectors.is_empty() {
            return Ok(());
        }

        let tracklen = self.tracklen as i64;
        let mut adjusted_sync = sync_offset as i64;
        if mode == SyncMode::RevolutionLimited && sync_offset != 0 {
            let offset_first = self.sectors.first().unwrap().raw_offset as i64;
            if modulo_div(offset_first - adjusted_sync, tracklen)
                < modulo_div(offset_first, tracklen)
            {
                // Shifting left would wrap the first sector; go for the minimum.
                adjusted_sync = offset_first - Sector::OFFSET_ALMOST_0 as i64;
            }
            let offset_last = self.sectors.last().unwrap().raw_offset as i64;
            if modulo_div(offset_last - adjusted_sync, tracklen) > modulo_div(offset_last, tracklen)
            {
                if adjusted_sync > 0 {
                    return Err(DiskError::TightTrackEnds);
                }
                adjusted_sync = -(tracklen - 1 - offset_last);
            }
        }

        let originals = std::mem::take(&mut self.sectors);
        for mut sector in originals {
            let offset_original = sector.raw_offset;
            if demulti {
                sector.revolution = (offset_original / self.tracklen.max(1)) as u8;
            }
            sector.raw_offset = modulo(offset_original as i64 - adjusted_sync, tracklen) as u32;
            if sector.make_offset_not_0() && !sector.is_orphan() {
                message_always(
                    MessageKind::Warning,
                    format!(
                        "synced offset of sector ({}) changed from 0 to 1, unsynced offset was {}",
                        sector.header, offset_original
                    ),
                );
            }
            // Re-add to restore offset ordering; merging close offsets here
            // would conflate distinct repeats, so insert positionally.
            let index = self
                .sectors
                .iter()
                .position(|s| sector.raw_offset < s.raw_offset)
                .unwrap_or(self.sectors.len());
            self.sectors.insert(index, sector);
        }
        Ok(())
    }

    /// Move a sector to a new offset, rotating it to keep the list ordered.
    /// Returns the sector's new index.
    pub fn set_sector_offset_at(&mut self, index: usize, offset: u32) -> usize {
        let old = self.sectors[index].raw_offset;
        if old == offset {
            return index;
        }
        let mut sector = self.sectors.remove(index);
        sector.raw_offset = offset;
        let new_index = self
            .sectors
            .iter()
            .position(|s| offset < s.raw_offset)
            .unwrap_or(self.sectors.len());
        self.sectors.insert(new_index, sector);
        new_index
    }

    /// Determine the uniform inter-sector bit distance by averaging
    /// neighbouring distances and discarding outliers.
    pub fn determine_offset_distance(
        &mut self,
        repeated: &RepeatedSectors,
        normal_disk: bool,
        byte_tolerance: i32,
    ) -> bool {
        if !normal_disk {
            return false;
        }
        if !self.offset_distance.is_empty() {
            return true;
        }
        if self.sectors.len() < 2 {
            return false;
        }
        debug_assert!(self.tracklen > 0);

        let encoding = self.encoding().unwrap_or_default();
        let mut first_size: Option<usize> = None;
        let mut distances: Vec<(usize, f64)> = Vec::new();

        let count = self.sectors.len();
        let mut i = 0usize;
        while i < count {
            let current = &self.sectors[i];
            if current.is_orphan() || repeated.contains_id(current.header.sector) {
                i += 1;
                continue;
            }
            match first_size {
                None => first_size = Some(current.size()),
                Some(size) if size != current.size() => {
                    message_always(
                        MessageKind::Warning,
                        format!(
                            "different sized sectors ({}, {}) are invalid in normal disk mode",
                            size,
                            current.size()
                        ),
                    );
                    return false;
                }
                _ => {}
            }

            // Predicted distance covers the sector with its gap3, bounded by
            // the tight and roomy gap choices.
            let size = first_size.unwrap();
            let overhead = if encoding == Encoding::Fm { 33 } else { 62 };
            let tight =
                byte_position_as_bit_offset((overhead + size + 1) as i32, encoding) as f64;
            let roomy =
                byte_position_as_bit_offset((overhead + size + 84) as i32, encoding) as f64;

            // Find the next non-orphan sector, wrapping.
            let mut j = (i + 1) % count;
            while self.sectors[j].is_orphan() && j != i {
                j = (j + 1) % count;
            }
            if j == i {
                break;
            }
            let next = &self.sectors[j];
            if repeated.contains_id(next.header.sector) {
                i += 1;
                continue;
            }
            let diff = self.sectors[i].offset_distance_to(next, self.tracklen) as f64;
            // How many sector slots the gap spans, judged by both gap bounds.
            let by_tight = diff / tight;
            let by_roomy = diff / roomy;
            let between = if (by_tight - by_tight.round()).abs() < (by_roomy - by_roomy.round()).abs()
            {
                by_tight.round() as i64
            }
            else {
                by_roomy.round() as i64
            };
            if between == 0 {
                message_always(
                    MessageKind::Warning,
                    format!(
                        "too close sectors at offsets ({}, {}) are invalid in normal disk mode",
                        self.sectors[i].raw_offset, next.raw_offset
                    ),
                );
                self.offset_distance.ignored.insert(i);
            }
            else {
                distances.push((i, diff / between as f64));
            }
            if j <= i {
                break;
            }
            i = j;
        }

        if distances.is_empty() {
            return false;
        }
        if distances.len() == 1 {
            self.offset_distance.average = distances[0].1;
            self.offset_distance.min = distances[0].1;
            self.offset_distance.max = distances[0].1;
            return true;
        }

        let mut average: f64 =
            distances.iter().map(|d| d.1).sum::<f64>() / distances.len() as f64;
        let allowed_max = tolerated_offset_distance(encoding, byte_tolerance) as f64;
        loop {
            distances.sort_by(|a, b| (a.1 - average).abs().total_cmp(&(b.1 - average).abs()));
            let min = distances.iter().map(|d| d.1).fold(f64::INFINITY, f64::min);
            let max = distances
                .iter()
                .map(|d| d.1)
                .fold(f64::NEG_INFINITY, f64::max);
            let variance = (min + max - 2.0 * average).abs() / allowed_max;
            if variance <= 0.1 || distances.len() <= 2 {
                self.offset_distance.min = min;
                self.offset_distance.max = max;
                self.offset_distance.average = average;
                return true;
            }
            // The farthest-from-average distance is an outlier; drop it.
            let (index, value) = *distances.last().unwrap();
            self.offset_distance.not_average.insert(index);
            average = (average * distances.len() as f64 - value) / (distances.len() - 1) as f64;
            distances.pop();
        }
    }

    /// Nudge offsets of sectors whose distance to the next id strays from
    /// the uniform average.
    pub fn adjust_suspicious_offsets(
        &mut self,
        repeated: &RepeatedSectors,
        normal_disk: bool,
        byte_tolerance: i32,
        redetermine: bool,
        balance: bool,
    ) {
        if self.is_empty() {
            return;
        }
        if redetermine {
            self.offset_distance.reset();
        }
        if !self.determine_offset_distance(repeated, normal_disk, byte_tolerance) {
            return;
        }
        let average = self.offset_distance.average;
        let count = self.sectors.len();
        let mut i = 0usize;
        while i < count {
            if self.sectors[i].is_orphan() || self.offset_distance.ignored.contains(&i) {
                i += 1;
                continue;
            }
            let mut j = (i + 1) % count;
            while self.sectors[j].is_orphan() && j != i {
                j = (j + 1) % count;
            }
            if j <= i {
                break; // Wrapped; better not to touch offsets at the start.
            }
            let diff = self.sectors[i].offset_distance_to(&self.sectors[j], self.tracklen) as f64;
            let between = (diff / average).round() as i64;
            if between == 1 && balance && !self.offset_distance.not_average.contains(&i) {
                let increment = (average - diff).round() as i64;
                let target = (self.sectors[j].raw_offset as i64 + increment).max(1) as u32;
                self.set_sector_offset_at(j, target);
            }
            i = j;
        }
    }

    /// Infer the track's sector-id scheme from a partial read: compute the
    /// average id distance, place holes where missing sectors must sit, and
    /// recover their ids from the visible id sequence.
    ///
    /// Works only in normal-disk mode with same-sized sectors.
    pub fn discover_sector_scheme(
        &mut self,
        repeated: &RepeatedSectors,
        normal_disk: bool,
        byte_tolerance: i32,
    ) -> bool {
        self.id_offset_pairs.clear();
        if self.is_empty() {
            return false;
        }
        if !normal_disk {
            message(
                MessageKind::Warning,
                "sector scheme discovery requires normal disk mode with same sized sectors",
            );
            return false;
        }
        debug_assert!(self.tracklen > 0);

        let encoding = self.encoding().unwrap_or_default();
        let tolerated = tolerated_offset_distance(encoding, byte_tolerance) as i64;
        if !self.determine_offset_distance(repeated, normal_disk, byte_tolerance) {
            return false;
        }
        let average = self.offset_distance.average.round() as i64;
        let distance_min = self.offset_distance.min.round() as i64;

        let mut pairs: Vec<IdAndOffset> = Vec::with_capacity(self.sectors.len());
        let count = self.sectors.len();
        for i in 0..count {
            let sector = &self.sectors[i];
            if sector.is_orphan() || self.offset_distance.ignored.contains(&i) {
                continue;
            }
            pairs.push(IdAndOffset {
                id: Some(sector.header.sector),
                offset_min: sector.raw_offset,
                offset_max: sector.raw_offset,
            });

            // Predict where the next id should be; a larger gap is a hole.
            let predicted_next = sector.raw_offset as i64 + average;
            let wrapped = i >= count - 1;
            let next = if wrapped {
                &self.sectors[0]
            }
            else {
                &self.sectors[i + 1]
            };
            let hole = (if wrapped { self.tracklen as i64 } else { 0 }) + next.raw_offset as i64
                - predicted_next;
            if hole > tolerated {
                let fitting = ((hole + tolerated) as f64 / average as f64).floor() as i64;
                let mut hole_offset = predicted_next;
                let remaining = (hole - fitting * distance_min).max(0);
                for _ in 0..fitting {
                    if hole_offset >= self.tracklen as i64 {
                        hole_offset -= self.tracklen as i64;
                    }
                    let hole_max = hole_offset + remaining;
                    let hole_max_wrapped = if hole_max >= self.tracklen as i64 {
                        hole_max - self.tracklen as i64
                    }
                    else {
                        hole_max
                    };
                    pairs.push(IdAndOffset {
                        id: None,
                        offset_min: hole_offset as u32,
                        offset_max: hole_max_wrapped as u32,
                    });
                    hole_offset += distance_min;
                }
            }
        }

        if !pairs.is_empty() && Self::replace_missing_ids(&mut pairs) {
            self.id_offset_pairs = pairs;
            return true;
        }
        false
    }

    /// Fill hole entries by matching visible ids against the rotated
    /// sequential scheme {base, base+1, ...}.
    fn replace_missing_ids(pairs: &mut [IdAndOffset]) -> bool {
        let len = pairs.len() as i64;
        if len == 0 {
            return false;
        }
        let known: Vec<(usize, u8)> = pairs
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.id.map(|id| (i, id)))
            .collect();
        if known.is_empty() {
            return false;
        }

        // Try the usual base of 1 first, then the lowest visible id, against
        // every rotation of the sequential scheme.
        let min_id = known.iter().map(|&(_, id)| id).min().unwrap();
        let mut bases = vec![1u8];
        if min_id != 1 {
            bases.push(min_id);
        }
        for base in bases {
            let mut matched_rotation: Option<i64> = None;
            for rotation in 0..len {
                let fits = known.iter().all(|&(i, id)| {
                    let expected = base as i64 + modulo(i as i64 - rotation, len);
                    expected == id as i64
                });
                if fits {
                    if matched_rotation.is_some() {
                        matched_rotation = None;
                        break; // Ambiguous; refuse to guess.
                    }
                    matched_rotation = Some(rotation);
                }
            }
            if let Some(rotation) = matched_rotation {
                for (i, pair) in pairs.iter_mut().enumerate() {
                    if pair.id.is_none() {
                        pair.id = Some((base as i64 + modulo(i as i64 - rotation, len)) as u8);
                    }
                }
                return true;
            }
        }
        false
    }

    /// The ids the discovered scheme expects but the track does not hold.
    pub fn missing_sector_ids(&self) -> Vec<u8> {
        let present: BTreeSet<u8> = self.sectors.iter().map(|s| s.header.sector).collect();
        self.id_offset_pairs
            .iter()
            .filter_map(|p| p.id)
            .filter(|id| !present.contains(id))
            .collect()
    }

    /// Pair up this track's sector indices with another observation of the
    /// same track, skipping orphans and ambiguous repeats.
    pub fn find_matching_sectors(
        &self,
        other: &Track,
        repeated: &RepeatedSectors,
    ) -> BTreeMap<usize, usize> {
        let mut result = BTreeMap::new();
        for (i, sector) in self.sectors.iter().enumerate() {
            if sector.is_orphan() || repeated.contains_id(sector.header.sector) {
                continue;
            }
            if let Some(j) = other.index_of(&sector.header) {
                result.insert(i, j);
            }
        }
        result
    }
}
