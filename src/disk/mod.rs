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

    src/disk/mod.rs

    The addressable map from (cyl, head) to track data, the backend trait
    that lets specialisations reroute storage, and the demand-loading and
    repairing specialisations themselves.
*/

pub mod demand;
pub mod repair;

pub use demand::{DemandDisk, TrackLoader};
pub use repair::RepairSummaryDisk;

use crate::bitstream::BitBuffer;
use crate::file_system::FileSystem;
use crate::flux::FluxData;
use crate::format::Format;
use crate::sector::Sector;
use crate::track::Track;
use crate::trackdata::TrackData;
use crate::transfer::DeviceReadingPolicy;
use crate::types::chs::{CylHead, Header};
use crate::types::range::Range;
use crate::DiskError;
use std::collections::BTreeMap;
use std::sync::Mutex;

pub const TYPE_UNKNOWN: &str = "<unknown>";

/// A container of track data addressed by cylinder and head. The map is
/// guarded by a single mutex so a preloader may fan reads across threads.
#[derive(Debug)]
pub struct Disk {
    pub fmt: Format,
    pub metadata: BTreeMap<String, String>,
    str_type: String,
    pub file_system: Option<Box<dyn FileSystem>>,
    trackdata: Mutex<BTreeMap<CylHead, TrackData>>,
}

impl Default for Disk {
    fn default() -> Self {
        Self {
            fmt: Format::default(),
            metadata: BTreeMap::new(),
            str_type: TYPE_UNKNOWN.to_string(),
            file_system: None,
            trackdata: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Clone for Disk {
    fn clone(&self) -> Self {
        let map = self.trackdata.lock().expect("track map poisoned").clone();
        Self {
            fmt: self.fmt.clone(),
            metadata: self.metadata.clone(),
            str_type: self.str_type.clone(),
            file_system: self.file_system.clone(),
            trackdata: Mutex::new(map),
        }
    }
}

impl Disk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn str_type(&self) -> &str {
        &self.str_type
    }

    pub fn set_str_type(&mut self, str_type: impl Into<String>) {
        self.str_type = str_type.into();
    }

    pub fn track_exists(&self, cylhead: CylHead) -> bool {
        self.trackdata
            .lock()
            .expect("track map poisoned")
            .contains_key(&cylhead)
    }

    pub fn is_empty(&self) -> bool {
        self.trackdata.lock().expect("track map poisoned").is_empty()
    }

    /// The stored track data, creating an empty entry on first touch.
    pub fn read_cached(&self, cylhead: CylHead) -> TrackData {
        let mut map = self.trackdata.lock().expect("track map poisoned");
        map.entry(cylhead)
            .or_insert_with(|| TrackData::new(cylhead))
            .clone()
    }

    /// The decoded sector view of a track, deriving it if necessary. The
    /// derived view is stored back so later reads are cheap.
    pub fn read_track(&self, cylhead: CylHead) -> Result<Track, DiskError> {
        let mut map = self.trackdata.lock().expect("track map poisoned");
        let td = map
            .entry(cylhead)
            .or_insert_with(|| TrackData::new(cylhead));
        Ok(td.track()?.clone())
    }

    pub fn read_bitstream(&self, cylhead: CylHead) -> Result<BitBuffer, DiskError> {
        let mut map = self.trackdata.lock().expect("track map poisoned");
        let td = map
            .entry(cylhead)
            .or_insert_with(|| TrackData::new(cylhead));
        Ok(td.bitstream()?.clone())
    }

    pub fn read_flux(&self, cylhead: CylHead) -> Result<FluxData, DiskError> {
        let mut map = self.trackdata.lock().expect("track map poisoned");
        let td = map
            .entry(cylhead)
            .or_insert_with(|| TrackData::new(cylhead));
        Ok(td.flux()?.clone())
    }

    pub fn write_trackdata(&mut self, trackdata: TrackData) {
        // The stored format can no longer be guaranteed to match.
        self.fmt.sectors = 0;
        let mut map = self.trackdata.lock().expect("track map poisoned");
        map.insert(trackdata.cylhead, trackdata);
    }

    pub fn write_track(&mut self, cylhead: CylHead, track: Track) {
        self.write_trackdata(TrackData::from_track(cylhead, track));
    }

    pub fn write_bitstream(&mut self, cylhead: CylHead, bitstream: BitBuffer) {
        self.write_trackdata(TrackData::from_bitstream(cylhead, bitstream));
    }

    pub fn write_flux(&mut self, cylhead: CylHead, flux: FluxData, normalised: bool) {
        self.write_trackdata(TrackData::from_flux(cylhead, flux, normalised));
    }

    pub fn clear(&mut self) {
        self.trackdata.lock().expect("track map poisoned").clear();
    }

    pub fn cyls(&self) -> u16 {
        self.trackdata
            .lock()
            .expect("track map poisoned")
            .keys()
            .last()
            .map_or(0, |ch| ch.cyl + 1)
    }

    pub fn heads(&self) -> u8 {
        let map = self.trackdata.lock().expect("track map poisoned");
        if map.is_empty() {
            0
        }
        else if map.keys().any(|ch| ch.head != 0) {
            2
        }
        else {
            1
        }
    }

    pub fn range(&self) -> Range {
        Range::new(self.cyls(), self.heads())
    }

    /// Visit every stored track's decoded sector view.
    pub fn each<F>(&self, mut func: F, cyls_first: bool) -> Result<(), DiskError>
    where
        F: FnMut(CylHead, &Track),
    {
        if self.is_empty() {
            return Ok(());
        }
        let mut result = Ok(());
        self.range().each(
            |cylhead| {
                if result.is_err() {
                    return;
                }
                match self.read_track(cylhead) {
                    Ok(track) => func(cylhead, &track),
                    Err(err) => result = Err(err),
                }
            },
            cyls_first,
        );
        result
    }

    /// Populate the disk with a regular format, filling sector data from
    /// `data` in logical order (or with the format's filler when exhausted).
    pub fn format_disk(&mut self, fmt: &Format, data: &[u8]) -> Result<(), DiskError> {
        fmt.validate()?;
        let sector_size = fmt.sector_size();
        let mut offset = 0usize;

        let mut cylheads = Vec::new();
        fmt.range().each(|ch| cylheads.push(ch), fmt.cyls_first);
        for cylhead in cylheads {
            let mut track = Track::with_capacity(fmt.sectors as usize);
            track.set_tracklen(crate::util::track_capacity(
                crate::util::RPM_TIME_300,
                fmt.datarate,
            ));

            let ids = fmt.get_ids(cylhead);
            // Physical layout walks the interleave order; sector N of the
            // logical image lands wherever its id was placed.
            let overhead = match fmt.encoding {
                crate::types::enums::Encoding::Fm => 33usize,
                _ => 62usize,
            };
            let cells = fmt.encoding.bitcells_per_byte() as usize;
            let slot_bits = (overhead + sector_size + fmt.gap3.max(1) as usize) * cells;

            for (slot, &id) in ids.iter().enumerate() {
                let header = Header::new(
                    cylhead.cyl,
                    fmt.head_id(cylhead.head),
                    id,
                    fmt.size as u8,
                );
                let mut sector = Sector::new(fmt.datarate, fmt.encoding, header);
                sector.raw_offset = (2000 + slot * slot_bits) as u32;
                sector.gap3 = fmt.gap3;

                let logical = (id as i32 - fmt.base as i32).max(0) as usize;
                let begin = offset + logical * sector_size;
                let bytes = if begin < data.len() {
                    let end = (begin + sector_size).min(data.len());
                    let mut chunk = data[begin..end].to_vec();
                    chunk.resize(sector_size, fmt.fill);
                    chunk
                }
                else {
                    vec![fmt.fill; sector_size]
                };
                sector.add(bytes, false, crate::types::enums::DAM_NORMAL);
                track.add(sector, &crate::track::MergePolicy::default())?;
            }
            offset += sector_size * fmt.sectors as usize;
            self.write_track(cylhead, track);
        }

        // Assign the format after formatting, which cleared it.
        self.fmt = fmt.clone();
        Ok(())
    }

    pub fn find_sector(&self, header: &Header) -> Result<Option<Sector>, DiskError> {
        let track = self.read_track(header.cylhead())?;
        Ok(track.find(header).cloned())
    }

    pub fn find_sector_ignoring_size(&self, header: &Header) -> Result<Option<Sector>, DiskError> {
        let track = self.read_track(header.cylhead())?;
        Ok(track.find_ignoring_size(header).cloned())
    }

    pub fn get_sector(&self, header: &Header) -> Result<Sector, DiskError> {
        self.find_sector(header)?.ok_or(DiskError::MissingSector)
    }

    /// Mark the disk fully read, fixing up read statistics on every track.
    pub fn disk_is_read(&mut self) {
        let mut map = self.trackdata.lock().expect("track map poisoned");
        for td in map.values_mut() {
            td.fix_track_readstats();
        }
    }

    /// Materialise every track in the range from worker threads. Reads
    /// serialise on the track map's mutex, so each track is decoded exactly
    /// once and later reads are cache hits.
    pub fn preload_tracks(&self, range: &Range, cyl_step: u16) -> Result<(), DiskError> {
        let mut cylheads = Vec::new();
        range.each(|ch| cylheads.push(ch), false);

        std::thread::scope(|scope| {
            let handles: Vec<_> = cylheads
                .into_iter()
                .map(|cylhead| {
                    scope.spawn(move || self.read_track(cylhead.stepped(cyl_step)).map(|_| ()))
                })
                .collect();
            for handle in handles {
                handle
                    .join()
                    .map_err(|_| DiskError::Io("preload worker panicked".to_string()))??;
            }
            Ok(())
        })
    }
}

/// Storage access for a disk, virtualised so specialisations can reroute it.
/// `RepairSummaryDisk` stores into an inner disk while forwarding identity
/// to its outer source; `DemandDisk` loads from a device on first touch.
pub trait DiskBackend {
    fn base(&self) -> &Disk;
    fn base_mut(&mut self) -> &mut Disk;

    /// A constant disk returns identical data on every read, so retries and
    /// rescans are pointless.
    fn is_constant_disk(&self) -> bool {
        true
    }

    fn supports_retries(&self) -> bool {
        false
    }

    fn supports_rescans(&self) -> bool {
        false
    }

    fn preload(&mut self, _range: &Range, _cyl_step: u16) -> bool {
        false
    }

    fn read(
        &mut self,
        cylhead: CylHead,
        uncached: bool,
        with_head_seek_to: Option<u16>,
        policy: &mut DeviceReadingPolicy,
    ) -> Result<TrackData, DiskError> {
        let _ = (uncached, with_head_seek_to, policy);
        Ok(self.base().read_cached(cylhead))
    }

    fn write(&mut self, trackdata: TrackData) -> Result<(), DiskError> {
        self.base_mut().write_trackdata(trackdata);
        Ok(())
    }

    fn clear(&mut self) {
        self.base_mut().clear();
    }

    fn fmt(&self) -> Format {
        self.base().fmt.clone()
    }

    fn metadata(&self) -> BTreeMap<String, String> {
        self.base().metadata.clone()
    }

    fn str_type(&self) -> String {
        self.base().str_type().to_string()
    }

    fn cyls(&self) -> u16 {
        self.base().cyls()
    }

    fn range(&self) -> Range {
        self.base().range()
    }
}

impl DiskBackend for Disk {
    fn base(&self) -> &Disk {
        self
    }

    fn base_mut(&mut self) -> &mut Disk {
        self
    }

    fn preload(&mut self, range: &Range, cyl_step: u16) -> bool {
        self.preload_tracks(range, cyl_step).is_ok()
    }
}
