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

    src/bitstream/scanner.rs

    Address-mark seekers that decode a raw bitstream into a Track.
*/

use crate::bitstream::{fm_pattern, BitBuffer, MFM_SYNC_A1};
use crate::bitstream::builder::IBM_IDAM;
use crate::messages::{message, MessageKind};
use crate::sector::Sector;
use crate::track::{MergePolicy, Track};
use crate::types::chs::{CylHead, Header};
use crate::types::enums::{Encoding, DAM_ALT, DAM_DELETED, DAM_NORMAL, DAM_RX02};
use crate::util::{crc16_byte, CRC_CCITT_INITIAL, CRC_MFM_A1A1A1};
use crate::DiskError;

/// The widest plausible gap2 between an ID field and its data field, in
/// data bytes. A DAM further away belongs to no ID.
const MAX_ID_TO_DAM_BYTES: usize = 50;

/// Decode a bitstream into sectors using the seeker for its encoding.
pub fn scan_bitstream(
    bitbuf: &BitBuffer,
    cylhead: CylHead,
    policy: &MergePolicy,
) -> Result<Track, DiskError> {
    let mut track = match bitbuf.encoding {
        Encoding::Mfm => scan_mfm(bitbuf, cylhead, policy)?,
        Encoding::Fm => scan_fm(bitbuf, cylhead, policy)?,
        Encoding::Amiga => scan_amiga(bitbuf, cylhead, policy)?,
        other => {
            message(
                MessageKind::Warning,
                format!("no address mark seeker for {} bitstreams", other),
            );
            Track::new()
        }
    };
    track.tracklen = bitbuf.len() as u32;
    track.set_tracklen(track.tracklen);
    track.ensure_not_almost0_offset();
    Ok(track)
}

fn is_dam(byte: u8) -> bool {
    matches!(byte, DAM_NORMAL | DAM_DELETED | DAM_ALT | DAM_RX02 | 0xF9)
}

struct PendingId {
    index: usize,
    end_pos: usize,
}

fn scan_mfm(
    bitbuf: &BitBuffer,
    cylhead: CylHead,
    policy: &MergePolicy,
) -> Result<Track, DiskError> {
    let mut track = Track::new();
    track.tracklen = bitbuf.len() as u32;

    let mut sectors: Vec<Sector> = Vec::new();
    let mut pending: Option<PendingId> = None;

    let mut pos = 0usize;
    while let Some(sync) = bitbuf.find_pattern16(MFM_SYNC_A1, pos) {
        // An address mark needs the full A1 A1 A1 run.
        let in_run = bitbuf.find_pattern16(MFM_SYNC_A1, sync + 16) == Some(sync + 16)
            && bitbuf.find_pattern16(MFM_SYNC_A1, sync + 32) == Some(sync + 32);
        if !in_run {
            pos = sync + 16;
            continue;
        }

        let am_pos = sync + 48;
        let (_, am_type) = bitbuf.read_mfm_byte(am_pos);

        if am_type == IBM_IDAM {
            let mut crc = crc16_byte(am_type, CRC_MFM_A1A1A1);
            let mut chrn = [0u8; 4];
            for (i, byte) in chrn.iter_mut().enumerate() {
                let (_, value) = bitbuf.read_mfm_byte(am_pos + 16 * (1 + i));
                *byte = value;
                crc = crc16_byte(value, crc);
            }
            for i in 0..2 {
                let (_, value) = bitbuf.read_mfm_byte(am_pos + 16 * (5 + i));
                crc = crc16_byte(value, crc);
            }

            let header = Header::new(chrn[0] as u16, chrn[1], chrn[2], chrn[3]);
            let mut sector = Sector::new(bitbuf.datarate, Encoding::Mfm, header);
            sector.raw_offset = sync as u32;
            if crc != 0 {
                sector.set_badidcrc();
            }
            pending = Some(PendingId {
                index: sectors.len(),
                end_pos: am_pos + 16 * 7,
            });
            sectors.push(sector);
            pos = am_pos + 16 * 7;
        }
        else if is_dam(am_type) {
            let owner = pending.take().filter(|id| {
                sync.saturating_sub(id.end_pos) <= 16 * MAX_ID_TO_DAM_BYTES
            });
            match owner {
                Some(id) => {
                    let size = sectors[id.index].size();
                    let mut crc = crc16_byte(am_type, CRC_MFM_A1A1A1);
                    let mut data = Vec::with_capacity(size);
                    for i in 0..size {
                        let (_, value) = bitbuf.read_mfm_byte(am_pos + 16 * (1 + i));
                        data.push(value);
                        crc = crc16_byte(value, crc);
                    }
                    for i in 0..2 {
                        let (_, value) = bitbuf.read_mfm_byte(am_pos + 16 * (1 + size + i));
                        crc = crc16_byte(value, crc);
                    }
                    sectors[id.index].add(data, crc != 0, am_type);
                    pos = am_pos + 16 * (3 + size);
                }
                None => {
                    // A data field with no readable ID before it.
                    let (data, end) = read_orphan_data(bitbuf, am_pos + 16, am_type);
                    let size_code = Header::length_to_size_code(data.len().max(128));
                    let header = Header::new(cylhead.cyl, cylhead.head, 0, size_code);
                    let mut sector = Sector::new(bitbuf.datarate, Encoding::Mfm, header);
                    sector.raw_offset = sync as u32;
                    sector.set_orphan();
                    sector.add(data, true, am_type);
                    sectors.push(sector);
                    pos = end;
                }
            }
        }
        else {
            pos = sync + 16;
        }

        if pos >= bitbuf.len() {
            break;
        }
    }

    for sector in sectors {
        track.add(sector, policy)?;
    }
    Ok(track)
}

/// Orphan data runs until the next sync mark, capped at the largest sector.
fn read_orphan_data(bitbuf: &BitBuffer, start: usize, _dam: u8) -> (Vec<u8>, usize) {
    let limit = match bitbuf.find_pattern16(MFM_SYNC_A1, start) {
        Some(next_sync) => (next_sync - start) / 16,
        None => (bitbuf.len().saturating_sub(start)) / 16,
    };
    let len = limit.min(crate::MAXIMUM_SECTOR_SIZE);
    let mut data = Vec::with_capacity(len);
    for i in 0..len {
        let (_, value) = bitbuf.read_mfm_byte(start + 16 * i);
        data.push(value);
    }
    (data, start + 16 * len)
}

/// Find a 32-cell FM pattern at or after `from`.
fn find_pattern32(bitbuf: &BitBuffer, pattern: u32, from: usize) -> Option<usize> {
    let len = bitbuf.len();
    if len < 32 {
        return None;
    }
    let mut reg = 0u32;
    let mut count = 0usize;
    for i in from..len {
        reg = (reg << 1) | bitbuf.bit(i) as u32;
        count += 1;
        if count >= 32 && reg == pattern {
            return Some(i + 1 - 32);
        }
    }
    None
}

fn scan_fm(bitbuf: &BitBuffer, cylhead: CylHead, policy: &MergePolicy) -> Result<Track, DiskError> {
    let _ = cylhead;
    let mut track = Track::new();
    track.tracklen = bitbuf.len() as u32;

    let idam_pattern = fm_pattern(IBM_IDAM, 0xC7);
    let dam_patterns: [(u8, u32); 4] = [
        (DAM_NORMAL, fm_pattern(DAM_NORMAL, 0xC7)),
        (DAM_DELETED, fm_pattern(DAM_DELETED, 0xC7)),
        (DAM_ALT, fm_pattern(DAM_ALT, 0xC7)),
        (DAM_RX02, fm_pattern(DAM_RX02, 0xC7)),
    ];

    let mut sectors: Vec<Sector> = Vec::new();
    let mut pending: Option<PendingId> = None;

    let mut pos = 0usize;
    while pos + 32 <= bitbuf.len() {
        // Find the nearest address mark of any type.
        let id_hit = find_pattern32(bitbuf, idam_pattern, pos);
        let dam_hit = dam_patterns
            .iter()
            .filter_map(|&(dam, pattern)| {
                find_pattern32(bitbuf, pattern, pos).map(|p| (p, dam))
            })
            .min_by_key(|&(p, _)| p);

        let next = match (id_hit, dam_hit) {
            (Some(id), Some((dam, _))) if id <= dam => Some((id, None)),
            (_, Some((dam_pos, dam))) => Some((dam_pos, Some(dam))),
            (Some(id), None) => Some((id, None)),
            (None, None) => None,
        };
        let Some((am_pos, dam)) = next else {
            break;
        };

        match dam {
            None => {
                let mut crc = crc16_byte(IBM_IDAM, CRC_CCITT_INITIAL);
                let mut chrn = [0u8; 4];
                for (i, byte) in chrn.iter_mut().enumerate() {
                    let (_, value) = bitbuf.read_fm_byte(am_pos + 32 * (1 + i));
                    *byte = value;
                    crc = crc16_byte(value, crc);
                }
                for i in 0..2 {
                    let (_, value) = bitbuf.read_fm_byte(am_pos + 32 * (5 + i));
                    crc = crc16_byte(value, crc);
                }
                let header = Header::new(chrn[0] as u16, chrn[1], chrn[2], chrn[3]);
                let mut sector = Sector::new(bitbuf.datarate, Encoding::Fm, header);
                sector.raw_offset = am_pos as u32;
                if crc != 0 {
                    sector.set_badidcrc();
                }
                pending = Some(PendingId {
                    index: sectors.len(),
                    end_pos: am_pos + 32 * 7,
                });
                sectors.push(sector);
                pos = am_pos + 32 * 7;
            }
            Some(dam_byte) => {
                let owner = pending.take().filter(|id| {
                    am_pos.saturating_sub(id.end_pos) <= 32 * MAX_ID_TO_DAM_BYTES
                });
                if let Some(id) = owner {
                    let size = sectors[id.index].size();
                    let mut crc = crc16_byte(dam_byte, CRC_CCITT_INITIAL);
                    let mut data = Vec::with_capacity(size);
                    for i in 0..size {
                        let (_, value) = bitbuf.read_fm_byte(am_pos + 32 * (1 + i));
                        data.push(value);
                        crc = crc16_byte(value, crc);
                    }
                    for i in 0..2 {
                        let (_, value) = bitbuf.read_fm_byte(am_pos + 32 * (1 + size + i));
                        crc = crc16_byte(value, crc);
                    }
                    sectors[id.index].add(data, crc != 0, dam_byte);
                    pos = am_pos + 32 * (3 + size);
                }
                else {
                    pos = am_pos + 32;
                }
            }
        }
    }

    for sector in sectors {
        track.add(sector, policy)?;
    }
    Ok(track)
}

/// Rebuild a 32-bit value from its Amiga odd and even bit planes.
fn amiga_merge_planes(first: u32, second: u32) -> u32 {
    let mut value = 0u32;
    for k in 0..16 {
        let hi = (first >> (30 - k * 2)) & 1;
        let lo = (second >> (30 - k * 2)) & 1;
        value |= hi << (31 - k * 2);
        value |= lo << (30 - k * 2);
    }
    value
}

fn scan_amiga(
    bitbuf: &BitBuffer,
    cylhead: CylHead,
    policy: &MergePolicy,
) -> Result<Track, DiskError> {
    let _ = cylhead;
    let mut track = Track::new();
    track.tracklen = bitbuf.len() as u32;

    // Read one plane word: 16 data bits stored at the even positions.
    let read_plane = |pos: usize| -> u32 {
        let mut word = 0u32;
        for k in 0..16 {
            word |= (bitbuf.bit(pos + k * 2 + 1) as u32) << (30 - k * 2);
        }
        word
    };

    let mut sectors: Vec<Sector> = Vec::new();
    let mut pos = 0usize;
    while let Some(sync) = bitbuf.find_pattern16(MFM_SYNC_A1, pos) {
        if bitbuf.find_pattern16(MFM_SYNC_A1, sync + 16) != Some(sync + 16) {
            pos = sync + 16;
            continue;
        }

        let mut cursor = sync + 32;
        let mut header_checksum = 0u32;
        let mut read_dword = |cursor: &mut usize, checksum: &mut u32| -> u32 {
            let first = read_plane(*cursor);
            let second = read_plane(*cursor + 32);
            *checksum ^= first ^ second;
            *cursor += 64;
            amiga_merge_planes(first, second)
        };

        let info = read_dword(&mut cursor, &mut header_checksum);
        // Label: four dwords, even planes then odd planes.
        for _ in 0..8 {
            header_checksum ^= read_plane(cursor);
            cursor += 32;
        }
        let mut ignored = 0u32;
        let stored_header_checksum = read_dword(&mut cursor, &mut ignored);
        let stored_data_checksum = read_dword(&mut cursor, &mut ignored);

        // Data: 512 bytes as 128 even plane words then 128 odd plane words.
        let mut planes = [0u32; 256];
        let mut data_checksum = 0u32;
        for plane in planes.iter_mut() {
            *plane = read_plane(cursor);
            data_checksum ^= *plane;
            cursor += 32;
        }
        let mut data = Vec::with_capacity(512);
        for i in 0..128 {
            let value = amiga_merge_planes(planes[i], planes[i + 128]);
            data.extend_from_slice(&value.to_be_bytes());
        }

        let track_byte = ((info >> 16) & 0xFF) as u8;
        let header = Header::new(
            (track_byte >> 1) as u16,
            track_byte & 1,
            ((info >> 8) & 0xFF) as u8,
            2,
        );
        let mut sector = Sector::new(bitbuf.datarate, Encoding::Amiga, header);
        sector.raw_offset = sync as u32;
        if stored_header_checksum != header_checksum {
            sector.set_badidcrc();
        }
        sector.add(data, stored_data_checksum != data_checksum, DAM_NORMAL);
        sectors.push(sector);
        pos = cursor;
    }

    for sector in sectors {
        track.add(sector, policy)?;
    }
    Ok(track)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::builder::{generate_bitstream, TrackBuilder};
    use crate::types::enums::DataRate;

    fn build_track(encoding: Encoding, sectors: u8, size_code: u8) -> Track {
        let mut track = Track::new();
        track.tracklen = 100_000;
        for i in 0..sectors {
            let mut sector = Sector::new(
                DataRate::Rate250K,
                encoding,
                Header::new(2, 0, i + 1, size_code),
            );
            sector.raw_offset = 1000 + i as u32 * (100_000 / sectors as u32);
            let data: Vec<u8> = (0..Header::size_code_to_length(size_code))
                .map(|n| (n as u8).wrapping_add(i))
                .collect();
            sector.add(data, false, DAM_NORMAL);
            track.add(sector, &MergePolicy::default()).unwrap();
        }
        track
    }

    #[test]
    fn mfm_round_trip_preserves_headers_and_data() {
        let track = build_track(Encoding::Mfm, 9, 2);
        let bitbuf = generate_bitstream(&track).unwrap();
        let scanned = scan_bitstream(&bitbuf, CylHead::new(2, 0), &MergePolicy::default()).unwrap();

        assert_eq!(scanned.len(), track.len());
        for (original, decoded) in track.sectors().iter().zip(scanned.sectors()) {
            assert_eq!(original.header, decoded.header);
            assert!(!decoded.has_badidcrc());
            assert!(decoded.has_good_data());
            assert_eq!(original.data_best_copy(), decoded.data_best_copy());
        }
    }

    #[test]
    fn fm_round_trip_preserves_headers_and_data() {
        let track = build_track(Encoding::Fm, 5, 1);
        let bitbuf = generate_bitstream(&track).unwrap();
        let scanned = scan_bitstream(&bitbuf, CylHead::new(2, 0), &MergePolicy::default()).unwrap();

        assert_eq!(scanned.len(), track.len());
        for (original, decoded) in track.sectors().iter().zip(scanned.sectors()) {
            assert_eq!(original.header, decoded.header);
            assert!(decoded.has_good_data());
            assert_eq!(original.data_best_copy(), decoded.data_best_copy());
        }
    }

    #[test]
    fn bad_data_crc_survives_round_trip() {
        let mut track = build_track(Encoding::Mfm, 9, 2);
        {
            let sector = track.sector_mut(4);
            let data = sector.data_best_copy().unwrap().clone();
            sector.replace_data(data, true);
        }
        let bitbuf = generate_bitstream(&track).unwrap();
        let scanned = scan_bitstream(&bitbuf, CylHead::new(2, 0), &MergePolicy::default()).unwrap();
        assert!(scanned.sector(4).has_baddatacrc());
        assert!(!scanned.sector(3).has_baddatacrc());
    }

    #[test]
    fn deleted_dam_survives_round_trip() {
        let mut track = build_track(Encoding::Mfm, 9, 2);
        track.sector_mut(2).dam = DAM_DELETED;
        let bitbuf = generate_bitstream(&track).unwrap();
        let scanned = scan_bitstream(&bitbuf, CylHead::new(2, 0), &MergePolicy::default()).unwrap();
        assert!(scanned.sector(2).is_deleted());
    }

    #[test]
    fn orphan_data_is_captured() {
        // A data field with no ID before it.
        let mut builder = TrackBuilder::new(DataRate::Rate250K, Encoding::Mfm).unwrap();
        builder.add_track_start(false).unwrap();
        builder.add_am(DAM_NORMAL, false, false);
        builder.add_block(0x33, 256);
        builder.add_gap(16, None);
        let bitbuf = builder.into_buffer();
        let scanned = scan_bitstream(&bitbuf, CylHead::new(0, 0), &MergePolicy::default()).unwrap();
        assert_eq!(scanned.len(), 1);
        assert!(scanned.sector(0).is_orphan());
        assert!(scanned.sector(0).has_data());
    }

    #[test]
    fn amiga_round_trip_preserves_data() {
        let mut builder = TrackBuilder::new(DataRate::Rate250K, Encoding::Amiga).unwrap();
        builder.add_track_start(false).unwrap();
        let payload: Vec<u8> = (0..512u32).map(|n| (n % 251) as u8).collect();
        builder.add_amiga_sector(CylHead::new(3, 1), 4, &payload);
        let bitbuf = builder.into_buffer();

        let scanned = scan_bitstream(&bitbuf, CylHead::new(3, 1), &MergePolicy::default()).unwrap();
        assert_eq!(scanned.len(), 1);
        let sector = scanned.sector(0);
        assert_eq!(sector.header, Header::new(3, 1, 4, 2));
        assert!(!sector.has_badidcrc());
        assert!(sector.has_good_data());
        assert_eq!(sector.data_best_copy().unwrap(), &payload);
    }
}
