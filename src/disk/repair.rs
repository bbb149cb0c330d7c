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

    src/disk/repair.rs

    A virtual disk which acts like the origin disk it reads from, but whose
    tracks are continuously repaired into an internal disk. On each read the
    track is transferred in repair mode (copy mode when it doesn't exist yet)
    and the repaired track is returned. Already-good sectors are never read
    from the origin again.
*/

use crate::disk::{Disk, DiskBackend};
use crate::format::Format;
use crate::normalise::NormaliseContext;
use crate::opts::CoreOptions;
use crate::trackdata::TrackData;
use crate::transfer::{transfer_track, DeviceReadingPolicy};
use crate::types::chs::CylHead;
use crate::types::enums::TransferMode;
use crate::types::range::Range;
use crate::DiskError;
use std::collections::BTreeMap;

pub struct RepairSummaryDisk<'a> {
    read_from: &'a mut dyn DiskBackend,
    write_to: Disk,
    opts: CoreOptions,
    ctx: NormaliseContext,
}

impl<'a> RepairSummaryDisk<'a> {
    pub fn new(read_from: &'a mut dyn DiskBackend, opts: CoreOptions) -> Self {
        Self {
            read_from,
            write_to: Disk::new(),
            opts,
            ctx: NormaliseContext::new(),
        }
    }

    /// Surrender the accumulated repair result.
    pub fn into_inner(self) -> Disk {
        self.write_to
    }
}

impl DiskBackend for RepairSummaryDisk<'_> {
    fn base(&self) -> &Disk {
        &self.write_to
    }

    fn base_mut(&mut self) -> &mut Disk {
        &mut self.write_to
    }

    fn is_constant_disk(&self) -> bool {
        self.read_from.is_constant_disk()
    }

    fn cyls(&self) -> u16 {
        self.read_from.cyls()
    }

    fn range(&self) -> Range {
        self.read_from.range()
    }

    // Identity forwards to the origin; only the stored tracks are ours.
    fn fmt(&self) -> Format {
        self.read_from.fmt()
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        self.read_from.metadata()
    }

    fn str_type(&self) -> String {
        self.read_from.str_type()
    }

    fn read(
        &mut self,
        cylhead: CylHead,
        uncached: bool,
        _with_head_seek_to: Option<u16>,
        policy: &mut DeviceReadingPolicy,
    ) -> Result<TrackData, DiskError> {
        let track_exists = self.write_to.track_exists(cylhead);
        let mut uncached = uncached;
        if !uncached && track_exists {
            let mut trackdata = self.write_to.read_cached(cylhead);
            let mut local_policy = policy.clone();
            local_policy.add_skippable_sectors(trackdata.track()?.stable_sectors());
            if !local_policy.wants_more_sectors() {
                return Ok(trackdata);
            }
            uncached = true;
        }

        let mode = if track_exists {
            TransferMode::Repair
        }
        else {
            TransferMode::Copy
        };
        transfer_track(
            self.read_from,
            cylhead,
            &mut self.write_to,
            mode,
            uncached,
            policy,
            &self.opts,
            None,
            &mut self.ctx,
        )?;

        let trackdata = self.write_to.read_cached(cylhead);
        if mode == TransferMode::Repair {
            // The repaired track is usually better than the origin's; push
            // it back so later origin reads start from it.
            self.read_from
                .base_mut()
                .write_trackdata(trackdata.clone());
        }
        Ok(trackdata)
    }

    fn write(&mut self, trackdata: TrackData) -> Result<(), DiskError> {
        self.read_from.write(trackdata.clone())?;
        self.write_to.write_trackdata(trackdata);
        Ok(())
    }

    fn clear(&mut self) {
        self.read_from.clear();
        self.write_to.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sector::Sector;
    use crate::track::{MergePolicy, Track};
    use crate::types::chs::Header;
    use crate::types::enums::{DataRate, Encoding, DAM_NORMAL};

    fn source_disk() -> Disk {
        let mut disk = Disk::new();
        let ch = CylHead::new(0, 0);
        let mut track = Track::new();
        track.tracklen = 100_000;
        for i in 0..9u8 {
            let mut sector = Sector::new(
                DataRate::Rate250K,
                Encoding::Mfm,
                Header::with_cylhead(ch, i + 1, 2),
            );
            sector.raw_offset = 1000 + i as u32 * 11_000;
            sector.add(vec![i; 512], false, DAM_NORMAL);
            track.add(sector, &MergePolicy::default()).unwrap();
        }
        disk.write_track(ch, track);
        disk
    }

    #[test]
    fn first_read_copies_then_reads_through() {
        let mut src = source_disk();
        let mut summary = RepairSummaryDisk::new(&mut src, CoreOptions::default());
        let ch = CylHead::new(0, 0);
        let mut policy = DeviceReadingPolicy::default();

        let mut first = summary.read(ch, false, None, &mut policy).unwrap();
        assert_eq!(first.track().unwrap().len(), 9);

        let mut again = summary.read(ch, false, None, &mut policy).unwrap();
        assert_eq!(again.track().unwrap().len(), 9);

        let inner = summary.into_inner();
        assert!(inner.track_exists(ch));
    }
}
