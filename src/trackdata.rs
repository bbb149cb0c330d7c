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

    src/trackdata.rs

    The multi-representation bundle for one track: whichever of sectors,
    bitstream and flux are materialised, with the rest derived on demand.
*/

use crate::bitstream::builder::generate_bitstream;
use crate::bitstream::scanner::scan_bitstream;
use crate::bitstream::BitBuffer;
use crate::flux::{decode_revolution, generate_flux, FluxData, PRECOMP_NS};
use crate::messages::{message_always, MessageKind};
use crate::sector::Sector;
use crate::track::{MergePolicy, Track};
use crate::types::chs::CylHead;
use crate::types::enums::PreferredData;
use crate::DiskError;

#[derive(Clone, Debug, Default)]
pub struct TrackData {
    pub cylhead: CylHead,
    track: Option<Track>,
    bitstream: Option<BitBuffer>,
    flux: Option<FluxData>,
    normalised_flux: bool,
}

impl TrackData {
    pub fn new(cylhead: CylHead) -> Self {
        Self {
            cylhead,
            ..Self::default()
        }
    }

    pub fn from_track(cylhead: CylHead, track: Track) -> Self {
        Self {
            cylhead,
            track: Some(track),
            ..Self::default()
        }
    }

    pub fn from_bitstream(cylhead: CylHead, bitstream: BitBuffer) -> Self {
        Self {
            cylhead,
            bitstream: Some(bitstream),
            ..Self::default()
        }
    }

    pub fn from_flux(cylhead: CylHead, flux: FluxData, normalised: bool) -> Self {
        Self {
            cylhead,
            flux: Some(flux),
            normalised_flux: normalised,
            ..Self::default()
        }
    }

    pub fn has_track(&self) -> bool {
        self.track.is_some()
    }

    pub fn has_bitstream(&self) -> bool {
        self.bitstream.is_some()
    }

    pub fn has_flux(&self) -> bool {
        self.flux.is_some()
    }

    pub fn has_normalised_flux(&self) -> bool {
        self.has_flux() && self.normalised_flux
    }

    pub fn is_empty(&self) -> bool {
        !self.has_track() && !self.has_bitstream() && !self.has_flux()
    }

    /// The decoded sector view, derived from flux or bitstream on demand.
    /// A flux capture decodes every revolution and merges them, so weak
    /// sectors accumulate their differing copies.
    pub fn track(&mut self) -> Result<&Track, DiskError> {
        if self.track.is_none() {
            let policy = MergePolicy::default();
            if let Some(flux) = &self.flux {
                let mut merged = Track::new();
                for (rev, flux_rev) in flux.iter().enumerate() {
                    let bitbuf = decode_revolution(
                        flux_rev,
                        self.datarate_hint(),
                        self.encoding_hint(),
                    );
                    let mut rev_track = scan_bitstream(&bitbuf, self.cylhead, &policy)?;
                    for sector in rev_track.sectors_mut() {
                        sector.revolution = rev as u8;
                    }
                    if rev == 0 && self.bitstream.is_none() {
                        self.bitstream = Some(bitbuf);
                    }
                    merged.add_track(rev_track, &policy)?;
                }
                self.track = Some(merged);
            }
            else {
                if self.bitstream.is_none() {
                    self.bitstream()?;
                }
                let bitbuf = self.bitstream.as_ref().expect("bitstream materialised");
                self.track = Some(scan_bitstream(bitbuf, self.cylhead, &policy)?);
            }
        }
        Ok(self.track.as_ref().expect("track materialised"))
    }

    pub fn track_cloned(&mut self) -> Result<Track, DiskError> {
        Ok(self.track()?.clone())
    }

    /// The raw bitstream, generated from the track or decoded from the first
    /// flux revolution on demand.
    pub fn bitstream(&mut self) -> Result<&BitBuffer, DiskError> {
        if self.bitstream.is_none() {
            if let Some(track) = &self.track {
                self.bitstream = Some(generate_bitstream(track)?);
            }
            else if let Some(flux) = &self.flux {
                let first = flux.first().map(Vec::as_slice).unwrap_or(&[]);
                self.bitstream = Some(decode_revolution(
                    first,
                    self.datarate_hint(),
                    self.encoding_hint(),
                ));
            }
            else {
                self.track = Some(Track::new());
                self.bitstream = Some(generate_bitstream(self.track.as_ref().unwrap())?);
            }
        }
        Ok(self.bitstream.as_ref().expect("bitstream materialised"))
    }

    pub fn bitstream_cloned(&mut self) -> Result<BitBuffer, DiskError> {
        Ok(self.bitstream()?.clone())
    }

    /// The flux representation, expanded from the bitstream on demand.
    pub fn flux(&mut self) -> Result<&FluxData, DiskError> {
        if self.flux.is_none() {
            self.bitstream()?;
            let bitbuf = self.bitstream.as_ref().expect("bitstream materialised");
            let rev = generate_flux(bitbuf, PRECOMP_NS);
            self.flux = Some(vec![rev]);
            // Flux synthesised from a bitstream is already regular.
            self.normalised_flux = true;
        }
        Ok(self.flux.as_ref().expect("flux materialised"))
    }

    /// Replace the track layer, leaving other layers untouched until the
    /// caller invalidates them.
    pub fn set_track(&mut self, track: Track) {
        self.track = Some(track);
    }

    pub fn set_bitstream(&mut self, bitstream: BitBuffer) {
        self.bitstream = Some(bitstream);
    }

    /// Drop derived layers after the track has been modified.
    pub fn invalidate_derived(&mut self) {
        self.bitstream = None;
        self.flux = None;
        self.normalised_flux = false;
    }

    /// Reduce to the representation the caller prefers. Unnormalised flux is
    /// an acquisition detail: it is dropped unless explicitly requested.
    pub fn preferred(&mut self, prefer: PreferredData) -> Result<TrackData, DiskError> {
        match prefer {
            PreferredData::Track => {
                return Ok(TrackData::from_track(self.cylhead, self.track()?.clone()));
            }
            PreferredData::Bitstream => {
                return Ok(TrackData::from_bitstream(
                    self.cylhead,
                    self.bitstream()?.clone(),
                ));
            }
            PreferredData::Flux => {
                return Ok(TrackData::from_flux(
                    self.cylhead,
                    self.flux()?.clone(),
                    self.normalised_flux,
                ));
            }
            PreferredData::Unknown => {}
        }

        let mut trackdata = self.clone();
        if trackdata.has_flux() && !trackdata.has_normalised_flux() {
            // Ensure there are track and bitstream representations, then
            // clear the unnormalised flux.
            trackdata.track()?;
            trackdata.flux = None;
        }
        Ok(trackdata)
    }

    /// Merge another observation of the same physical track, layer by layer.
    pub fn add(&mut self, mut other: TrackData) -> Result<(), DiskError> {
        if let Some(flux) = other.flux.take() {
            self.flux = Some(flux);
            self.normalised_flux = other.normalised_flux;
        }
        if let Some(bitstream) = other.bitstream.take() {
            self.bitstream = Some(bitstream);
        }
        if let Some(track) = other.track.take() {
            match &mut self.track {
                None => self.track = Some(track),
                Some(existing) => existing.add_track(track, &MergePolicy::default())?,
            }
        }
        Ok(())
    }

    pub fn fix_track_readstats(&mut self) {
        if let Some(track) = &mut self.track {
            for sector in track.sectors_mut() {
                sector.fix_readstats();
            }
        }
    }

    /// Reconcile sector headers with the physical position, in strict
    /// normal-disk mode. A wrong head byte is overridden; a foreign cylinder
    /// is an error the caller may downgrade.
    pub fn force_cylheads(&mut self, cyl_limit: u16) -> Result<(), DiskError> {
        let cylhead = self.cylhead;
        let track = self.track()?;
        // Collect fixes first; messages reference the original values.
        let mut head_fixes: Vec<usize> = Vec::new();
        for (i, sector) in track.sectors().iter().enumerate() {
            if sector.header.cyl == cylhead.cyl && sector.header.head == cylhead.head {
                continue;
            }
            if !sector.header.is_normal(cyl_limit) {
                return Err(DiskError::ForeignCylHead);
            }
            if sector.header.cyl != cylhead.cyl {
                message_always(
                    MessageKind::Warning,
                    format!(
                        "suspicious: {}'s cyl does not match sector's cyl ({})",
                        cylhead, sector
                    ),
                );
                if sector.header.head != cylhead.head {
                    message_always(
                        MessageKind::Warning,
                        format!(
                            "suspicious: {}'s head does not match sector's head ({})",
                            cylhead, sector
                        ),
                    );
                }
            }
            else {
                // A wrong head is a hardware or formatting slip; adjust it
                // to give the sector a chance.
                message_always(
                    MessageKind::Warning,
                    format!(
                        "overriding wrong head of sector ({}) with head {}",
                        sector, cylhead.head
                    ),
                );
                head_fixes.push(i);
            }
        }
        if !head_fixes.is_empty() {
            let track = self.track.as_mut().expect("track materialised");
            for i in head_fixes {
                track.sector_mut(i).header.head = cylhead.head;
            }
        }
        Ok(())
    }

    /// Convenience access to a sector of the decoded track.
    pub fn find_sector(&mut self, id: u8) -> Result<Option<&Sector>, DiskError> {
        let track = self.track()?;
        Ok(track.sectors().iter().find(|s| s.header.sector == id))
    }

    fn datarate_hint(&self) -> crate::types::enums::DataRate {
        self.bitstream
            .as_ref()
            .map(|b| b.datarate)
            .or_else(|| self.track.as_ref().and_then(|t| t.data_rate()))
            .unwrap_or(crate::types::enums::DataRate::Rate250K)
    }

    fn encoding_hint(&self) -> crate::types::enums::Encoding {
        self.bitstream
            .as_ref()
            .map(|b| b.encoding)
            .or_else(|| self.track.as_ref().and_then(|t| t.encoding()))
            .unwrap_or(crate::types::enums::Encoding::Mfm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sector::Sector;
    use crate::types::chs::Header;
    use crate::types::enums::{DataRate, Encoding, DAM_NORMAL};

    fn sample_track() -> Track {
        let mut track = Track::new();
        track.tracklen = 100_000;
        for i in 0..9u8 {
            let mut sector = Sector::new(
                DataRate::Rate250K,
                Encoding::Mfm,
                Header::new(1, 0, i + 1, 2),
            );
            sector.raw_offset = 1000 + i as u32 * 11_000;
            sector.add(vec![i; 512], false, DAM_NORMAL);
            track.add(sector, &MergePolicy::default()).unwrap();
        }
        track
    }

    #[test]
    fn track_to_bitstream_to_track() {
        let mut td = TrackData::from_track(CylHead::new(1, 0), sample_track());
        assert!(!td.has_bitstream());
        td.bitstream().unwrap();
        assert!(td.has_bitstream());

        let mut derived = TrackData::from_bitstream(
            CylHead::new(1, 0),
            td.bitstream().unwrap().clone(),
        );
        let track = derived.track().unwrap();
        assert_eq!(track.len(), 9);
        assert!(track.has_all_good_data());
    }

    #[test]
    fn flux_decodes_through_every_layer() {
        let mut td = TrackData::from_track(CylHead::new(1, 0), sample_track());
        let flux = td.flux().unwrap().clone();
        assert_eq!(flux.len(), 1);

        let mut from_flux = TrackData::from_flux(CylHead::new(1, 0), flux, false);
        let track = from_flux.track().unwrap();
        assert_eq!(track.len(), 9);
        assert!(track.has_all_good_data());
    }

    #[test]
    fn preferred_drops_unnormalised_flux() {
        let mut td = TrackData::from_track(CylHead::new(1, 0), sample_track());
        let flux = td.flux().unwrap().clone();

        let mut raw = TrackData::from_flux(CylHead::new(1, 0), flux, false);
        let reduced = raw.preferred(PreferredData::Unknown).unwrap();
        assert!(!reduced.has_flux());
        assert!(reduced.has_track());
    }

    #[test]
    fn multi_revolution_flux_merges_copies() {
        let mut td = TrackData::from_track(CylHead::new(1, 0), sample_track());
        let rev = td.flux().unwrap()[0].clone();
        let multi = vec![rev.clone(), rev];

        let mut from_flux = TrackData::from_flux(CylHead::new(1, 0), multi, false);
        let track = from_flux.track().unwrap();
        assert_eq!(track.len(), 9);
        // Two identical revolutions: each sector read twice, stored once.
        for sector in track.sectors() {
            assert_eq!(sector.copies(), 1);
            assert!(sector.read_count_of_copy(0) >= 2);
        }
    }

    #[test]
    fn wrong_head_is_overridden() {
        crate::messages::drain();
        let mut track = sample_track();
        track.sector_mut(4).header.head = 1;
        let mut td = TrackData::from_track(CylHead::new(1, 0), track);
        td.force_cylheads(80).unwrap();
        assert_eq!(td.track().unwrap().sector(4).header.head, 0);
    }
}
