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

    src/protection.rs

    Detection of known copy-protection track shapes, so normalisation can
    repair captures that lost the protection's characteristic weakness.
*/

use crate::track::Track;
use crate::types::enums::{DataRate, Encoding};
use std::fmt::{Display, Formatter, Result};

#[derive(Copy, Clone, Debug)]
pub enum ProtectionScheme {
    SpeedlockPlus3,
    SpeedlockCpc,
    RainbowArts,
    OperaSoft32K,
    Prehistorik,
    Reussir,
}

impl Display for ProtectionScheme {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            ProtectionScheme::SpeedlockPlus3 => write!(f, "+3 Speedlock"),
            ProtectionScheme::SpeedlockCpc => write!(f, "CPC Speedlock"),
            ProtectionScheme::RainbowArts => write!(f, "Rainbow Arts"),
            ProtectionScheme::OperaSoft32K => write!(f, "OperaSoft 32K"),
            ProtectionScheme::Prehistorik => write!(f, "Prehistorik"),
            ProtectionScheme::Reussir => write!(f, "Reussir"),
        }
    }
}

const SPEEDLOCK_SIG: &[u8] = b"SPEEDLOCK";

/// The weak region of a protection's weak sector.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WeakRegion {
    pub offset: usize,
    pub size: usize,
}

fn is_512_mfm_250k(track: &Track, index: usize) -> bool {
    let sector = track.sector(index);
    sector.encoding == Encoding::Mfm
        && sector.datarate.is_interchangeable_with(DataRate::Rate250K)
        && sector.size() == 512
        && sector.data_size() >= 512
}

fn contains_at(data: &[u8], offset: usize, needle: &[u8]) -> bool {
    data.len() >= offset + needle.len() && &data[offset..offset + needle.len()] == needle
}

/// Spectrum +3 Speedlock: 9 sectors, the Speedlock signature in the first
/// sector, and a weak second sector whose tail reads differently every time.
pub fn is_spectrum_speedlock_track(track: &Track) -> Option<WeakRegion> {
    if track.len() != 9 || !is_512_mfm_250k(track, 0) || !is_512_mfm_250k(track, 1) {
        return None;
    }
    if !track.sector(1).has_baddatacrc() {
        return None;
    }
    let data0 = track.sector(0).data_best_copy()?;
    // The signature appears at one of two known positions.
    if !contains_at(data0, 304, SPEEDLOCK_SIG) && !contains_at(data0, 176, SPEEDLOCK_SIG) {
        return None;
    }
    Some(WeakRegion {
        offset: 336,
        size: 32,
    })
}

/// CPC Speedlock: 9 sectors, signature in the first sector, weak eighth
/// sector from offset 256.
pub fn is_cpc_speedlock_track(track: &Track) -> Option<WeakRegion> {
    if track.len() != 9 || !is_512_mfm_250k(track, 0) || !is_512_mfm_250k(track, 7) {
        return None;
    }
    if !track.sector(7).has_baddatacrc() {
        return None;
    }
    let data0 = track.sector(0).data_best_copy()?;
    if !contains_at(data0, 257, SPEEDLOCK_SIG) && !contains_at(data0, 129, SPEEDLOCK_SIG) {
        return None;
    }
    Some(WeakRegion {
        offset: 256,
        size: 256,
    })
}

/// Rainbow Arts: 9 sectors with the out-of-range id 198 in second position,
/// weak from offset 100.
pub fn is_rainbow_arts_track(track: &Track) -> Option<WeakRegion> {
    if track.len() != 9 || !is_512_mfm_250k(track, 1) {
        return None;
    }
    let weak = track.sector(1);
    if weak.header.sector != 198 {
        return None;
    }
    // The track following the weak sector holds the protection check code.
    let data3 = track.sector(3).data_best_copy()?;
    if !contains_at(data3, 0, b"KBI") {
        return None;
    }
    Some(WeakRegion {
        offset: 100,
        size: 412,
    })
}

/// OperaSoft 32K: 9 sectors ending in a declared 32K sector whose stored
/// data CPDRead-style dumps leave empty.
pub fn is_opera_soft_track(track: &Track) -> bool {
    track.len() == 9 && track.sector(8).header.size == 8
}

/// Prehistorik: a 13-sector track whose tail is 6 junk KBI-19 sectors.
pub fn is_prehistorik_track(track: &Track) -> bool {
    if track.len() != 13 || track.sector(6).header.sector != 12 {
        return false;
    }
    track.sectors()[7..].iter().all(|s| s.header.sector >= 0x41)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sector::Sector;
    use crate::track::MergePolicy;
    use crate::types::chs::Header;
    use crate::types::enums::DAM_NORMAL;

    fn speedlock_track() -> Track {
        let mut track = Track::new();
        track.tracklen = 100_000;
        for i in 0..9u8 {
            let mut sector = Sector::new(
                DataRate::Rate250K,
                Encoding::Mfm,
                Header::new(0, 0, i + 1, 2),
            );
            sector.raw_offset = 1000 + i as u32 * 11_000;
            let mut data = vec![0u8; 512];
            if i == 0 {
                data[304..313].copy_from_slice(SPEEDLOCK_SIG);
            }
            let bad_crc = i == 1;
            sector.add(data, bad_crc, DAM_NORMAL);
            track.add(sector, &MergePolicy::default()).unwrap();
        }
        track
    }

    #[test]
    fn detects_plus3_speedlock() {
        let track = speedlock_track();
        let region = is_spectrum_speedlock_track(&track).expect("should detect");
        assert_eq!(region, WeakRegion { offset: 336, size: 32 });
    }

    #[test]
    fn requires_weak_sector_crc_error() {
        let mut track = speedlock_track();
        let mut fixed = track.sector(1).clone();
        fixed.remove_data();
        fixed.add(vec![0u8; 512], false, DAM_NORMAL);
        *track.sector_mut(1) = fixed;
        assert!(is_spectrum_speedlock_track(&track).is_none());
    }
}
