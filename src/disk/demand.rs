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

    src/disk/demand.rs

    Demand-loaded disk tracks, for slow media.
*/

use crate::disk::{Disk, DiskBackend};
use crate::trackdata::TrackData;
use crate::transfer::{DeviceReadingPolicy, RetryPolicy};
use crate::types::chs::CylHead;
use crate::types::range::Range;
use crate::DiskError;
use crate::{MAX_CYLS, MAX_HEADS};

/// A device source able to acquire one track at a time.
pub trait TrackLoader {
    fn load(
        &mut self,
        cylhead: CylHead,
        first_read: bool,
        with_head_seek_to: Option<u16>,
        policy: &DeviceReadingPolicy,
    ) -> Result<TrackData, DiskError>;

    /// Whether the device retries individual sectors itself, making our
    /// duplicate retries pointless.
    fn supports_retries(&self) -> bool {
        false
    }

    fn supports_rescans(&self) -> bool {
        true
    }

    /// Physical media never reads the same twice; images always do.
    fn is_constant(&self) -> bool {
        false
    }

    fn cyls(&self) -> u16 {
        MAX_CYLS as u16
    }

    fn preload(&mut self, _range: &Range, _cyl_step: u16) -> bool {
        false
    }
}

/// A disk that loads each track from its device on first access, applying
/// the configured rescan and retry budget before committing the result.
pub struct DemandDisk<L: TrackLoader> {
    base: Disk,
    loader: L,
    loaded: Vec<bool>,
    retries: RetryPolicy,
    rescans: RetryPolicy,
}

impl<L: TrackLoader> DemandDisk<L> {
    /// Flux captures read this many revolutions on the first acquisition,
    /// and this many on each rescan.
    pub const FIRST_READ_REVS: usize = 2;
    pub const REMAIN_READ_REVS: i32 = 5;

    pub fn new(loader: L, retries: RetryPolicy, rescans: RetryPolicy) -> Self {
        Self {
            base: Disk::new(),
            loader,
            loaded: vec![false; MAX_CYLS * MAX_HEADS],
            retries,
            rescans,
        }
    }

    pub fn with_options(loader: L, opts: &crate::opts::CoreOptions) -> Self {
        Self::new(loader, opts.retries, opts.rescans)
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    fn slot(cylhead: CylHead) -> usize {
        (cylhead.cyl as usize * MAX_HEADS + cylhead.head as usize).min(MAX_CYLS * MAX_HEADS - 1)
    }

    /// Pre-extend the disk ahead of loading a track.
    pub fn extend(&mut self, cylhead: CylHead) {
        let _ = self.base.read_cached(cylhead);
    }

    pub fn is_cached(&self, cylhead: CylHead) -> bool {
        self.loaded[Self::slot(cylhead)]
    }

    fn acquire(
        &mut self,
        cylhead: CylHead,
        with_head_seek_to: Option<u16>,
        policy: &mut DeviceReadingPolicy,
    ) -> Result<TrackData, DiskError> {
        // Quick first read, plus sector-based conversion.
        let mut trackdata = self.loader.load(cylhead, true, with_head_seek_to, policy)?;

        // If the device retries individual sectors we won't duplicate them.
        let initial_retries = if self.loader.supports_retries() {
            RetryPolicy::default()
        }
        else {
            self.retries
        };
        let mut retries = initial_retries;
        let mut rescans = self.rescans;

        while !rescans.is_exhausted() || !retries.is_exhausted() {
            // If no more rescans are required, stop when there's nothing to
            // fix.
            if rescans.is_exhausted() {
                let track = trackdata.track()?;
                if track.has_all_stable_data(policy.skippable()) {
                    break;
                }
            }
            // Do not seek away from the track on repeat loads.
            let mut rescan = self.loader.load(cylhead, false, None, policy)?;

            // If the rescan found more sectors, or more good sectors, use
            // the new track data.
            let better = {
                let rescan_track = rescan.track()?;
                let track = trackdata.track()?;
                rescan_track.len() > track.len()
                    || rescan_track.good_sectors().len() > track.good_sectors().len()
            };
            if better {
                std::mem::swap(&mut trackdata, &mut rescan);
                retries.on_change(initial_retries);
                rescans.on_change(self.rescans);
            }

            // Flux reads cover several revolutions per pass, others one.
            let revs = if trackdata.has_flux() {
                Self::REMAIN_READ_REVS
            }
            else {
                1
            };
            rescans.consume(revs);
            retries.consume(revs);
        }

        Ok(trackdata)
    }
}

impl<L: TrackLoader> DiskBackend for DemandDisk<L> {
    fn base(&self) -> &Disk {
        &self.base
    }

    fn base_mut(&mut self) -> &mut Disk {
        &mut self.base
    }

    fn is_constant_disk(&self) -> bool {
        self.loader.is_constant()
    }

    fn supports_retries(&self) -> bool {
        self.loader.supports_retries()
    }

    fn supports_rescans(&self) -> bool {
        self.loader.supports_rescans()
    }

    fn cyls(&self) -> u16 {
        self.loader.cyls()
    }

    fn preload(&mut self, range: &Range, cyl_step: u16) -> bool {
        self.loader.preload(range, cyl_step)
    }

    fn read(
        &mut self,
        cylhead: CylHead,
        uncached: bool,
        with_head_seek_to: Option<u16>,
        policy: &mut DeviceReadingPolicy,
    ) -> Result<TrackData, DiskError> {
        let slot = Self::slot(cylhead);
        if uncached || !self.loaded[slot] {
            let trackdata = self.acquire(cylhead, with_head_seek_to, policy)?;
            self.base.write_trackdata(trackdata);
            self.loaded[slot] = true;
        }
        Ok(self.base.read_cached(cylhead))
    }

    fn write(&mut self, _trackdata: TrackData) -> Result<(), DiskError> {
        Err(DiskError::WriteUnsupported)
    }

    fn clear(&mut self) {
        self.base.clear();
        self.loaded.fill(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sector::Sector;
    use crate::track::{MergePolicy, Track};
    use crate::types::chs::Header;
    use crate::types::enums::{DataRate, Encoding, DAM_NORMAL};

    /// A flaky device: each track needs several reads before the bad sector
    /// comes back clean.
    struct FlakyLoader {
        loads: Vec<(CylHead, bool, Option<u16>)>,
        good_after: u32,
    }

    impl FlakyLoader {
        fn track(cylhead: CylHead, good: bool) -> Track {
            let mut track = Track::new();
            track.tracklen = 100_000;
            for i in 0..9u8 {
                let mut sector = Sector::new(
                    DataRate::Rate250K,
                    Encoding::Mfm,
                    Header::with_cylhead(cylhead, i + 1, 2),
                );
                sector.raw_offset = 1000 + i as u32 * 11_000;
                let bad = i == 4 && !good;
                sector.add(vec![i; 512], bad, DAM_NORMAL);
                track.add(sector, &MergePolicy::default()).unwrap();
            }
            track
        }
    }

    impl TrackLoader for FlakyLoader {
        fn load(
            &mut self,
            cylhead: CylHead,
            first_read: bool,
            with_head_seek_to: Option<u16>,
            _policy: &DeviceReadingPolicy,
        ) -> Result<TrackData, DiskError> {
            self.loads.push((cylhead, first_read, with_head_seek_to));
            let good = self.loads.len() as u32 > self.good_after;
            Ok(TrackData::from_track(cylhead, Self::track(cylhead, good)))
        }

        fn cyls(&self) -> u16 {
            40
        }
    }

    #[test]
    fn retries_until_stable_then_caches() {
        let loader = FlakyLoader {
            loads: Vec::new(),
            good_after: 2,
        };
        let mut disk = DemandDisk::new(loader, RetryPolicy::new(5, false), RetryPolicy::default());
        let ch = CylHead::new(0, 0);
        let mut policy = DeviceReadingPolicy::default();

        let mut first = disk.read(ch, false, None, &mut policy).unwrap();
        assert!(first.track().unwrap().has_all_good_data());
        // First read plus two retries to get the good version.
        assert_eq!(disk.loader().loads.len(), 3);
        assert!(disk.loader().loads[0].1);
        assert!(!disk.loader().loads[1].1);

        // Cached reads return identical data without touching the device.
        let mut second = disk.read(ch, false, None, &mut policy).unwrap();
        assert_eq!(disk.loader().loads.len(), 3);
        assert_eq!(
            first.track().unwrap().sector(4).data_best_copy(),
            second.track().unwrap().sector(4).data_best_copy()
        );
    }

    #[test]
    fn rescan_budget_reads_even_when_stable() {
        let loader = FlakyLoader {
            loads: Vec::new(),
            good_after: 0,
        };
        let mut disk = DemandDisk::new(loader, RetryPolicy::default(), RetryPolicy::new(2, false));
        let mut policy = DeviceReadingPolicy::default();
        disk.read(CylHead::new(1, 0), false, None, &mut policy)
            .unwrap();
        // One first read and two rescans, despite the track being good.
        assert_eq!(disk.loader().loads.len(), 3);
    }

    #[test]
    fn writes_are_rejected() {
        let loader = FlakyLoader {
            loads: Vec::new(),
            good_after: 0,
        };
        let mut disk = DemandDisk::new(loader, RetryPolicy::default(), RetryPolicy::default());
        let td = TrackData::new(CylHead::new(0, 0));
        assert!(matches!(disk.write(td), Err(DiskError::WriteUnsupported)));
    }
}
