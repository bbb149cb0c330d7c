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

    src/image/edsk.rs

    The extended DSK image codec, with the RDSK variant used for repair
    archives. Per-sector status bytes mirror the NEC µPD765 ST1/ST2 fields;
    weak sectors store multiple data copies; optional trailers carry sector
    offsets and (RDSK) read statistics.

    EDSK:  http://www.cpctech.org.uk/docs/extdsk.html
    Copy-protection extensions:  http://simonowen.com/misc/extextdsk.txt
*/

use crate::disk::Disk;
use crate::opts::CoreOptions;
use crate::sector::Sector;
use crate::track::{MergePolicy, Track};
use crate::types::chs::{CylHead, Header};
use crate::types::enums::{DataRate, Encoding, DAM_DELETED, DAM_NORMAL};
use crate::DiskError;
use binrw::{binrw, BinRead, BinWrite};
use std::io::Cursor;

pub const EDSK_SIGNATURE: &[u8; 34] = b"EXTENDED CPC DSK File\r\nDisk-Info\r\n";
// Same length as the EDSK signature; the first letter must differ.
pub const RDSK_SIGNATURE: &[u8; 34] = b"REPAIRER CPC DSK File\r\nDisk-Info\r\n";
pub const EDSK_TRACK_SIG: &[u8; 13] = b"Track-Info\r\n\0";
pub const EDSK_OFFSETS_SIG: &[u8; 14] = b"Offset-Info\r\n\0";
pub const RDSK_READSTATS_SIG: &[u8; 17] = b"ReadStats-Info\r\n\0";

const CREATOR: &[u8; 14] = b"FluxMend 0.2\0\0";
const EDSK_HEADER_SIZE: usize = 256;
const RDSK_HEADER_SIZE: usize = 1024;
const TRACK_DATA_OFFSET: usize = 256;

// µPD765 status bits used by the format.
const ST1_CRC_ERROR: u8 = 0x20;
const ST2_CRC_ERROR_IN_DATA: u8 = 0x20;
const ST2_CONTROL_MARK: u8 = 0x40;
// Deprecated marker for weak sectors, stored in the head field.
const HEAD_FLAG_RANDOM_ERRORS: u8 = 0x80;

#[derive(Clone, Debug)]
#[binrw]
#[brw(little)]
struct DiskHeader {
    signature: [u8; 34],
    creator: [u8; 14],
    tracks: u8,
    sides: u8,
    track_size: u16, // legacy DSK only; zero for extended images
}

impl Default for DiskHeader {
    fn default() -> Self {
        DiskHeader {
            signature: [0; 34],
            creator: [0; 14],
            tracks: 0,
            sides: 0,
            track_size: 0,
        }
    }
}

#[derive(Clone, Debug, Default)]
#[binrw]
#[brw(little)]
struct TrackInfo {
    signature: [u8; 13],
    unused: [u8; 3],
    track: u8,
    side: u8,
    rate: u8,     // 0=unknown, 1=250/300K, 2=500K, 3=1M
    encoding: u8, // 0=unknown, 1=FM, 2=MFM
    size: u8,
    sectors: u8,
    gap3: u8,
    fill: u8,
}

#[derive(Clone, Debug, Default)]
#[binrw]
#[brw(little)]
struct SectorInfo {
    track: u8,
    side: u8,
    sector: u8,
    size: u8,
    status1: u8,
    status2: u8,
    data_len: u16,
}

fn rate_to_byte(datarate: DataRate) -> u8 {
    match datarate {
        DataRate::Rate250K | DataRate::Rate300K => 1,
        DataRate::Rate500K => 2,
        DataRate::Rate1M => 3,
        _ => 0,
    }
}

fn byte_to_rate(byte: u8) -> DataRate {
    match byte {
        1 => DataRate::Rate250K,
        2 => DataRate::Rate500K,
        3 => DataRate::Rate1M,
        _ => DataRate::Unknown,
    }
}

fn encoding_to_byte(encoding: Encoding) -> u8 {
    match encoding {
        Encoding::Fm => 1,
        Encoding::Mfm => 2,
        _ => 0,
    }
}

fn byte_to_encoding(byte: u8) -> Encoding {
    match byte {
        1 => Encoding::Fm,
        _ => Encoding::Mfm,
    }
}

struct TrackRecord {
    info: TrackInfo,
    sector_infos: Vec<SectorInfo>,
    data: Vec<u8>,
}

/// Serialise one track: info header, sector index, packed sector data.
fn build_track_record(cylhead: CylHead, track: &Track) -> Result<TrackRecord, DiskError> {
    if track.len() > 29 {
        // The sector index must fit the first 256 bytes of the block.
        return Err(DiskError::UnsuitableTarget);
    }

    let mut info = TrackInfo {
        signature: *EDSK_TRACK_SIG,
        track: cylhead.cyl as u8,
        side: cylhead.head,
        rate: rate_to_byte(track.data_rate().unwrap_or(DataRate::Unknown)),
        encoding: encoding_to_byte(track.encoding().unwrap_or(Encoding::Unknown)),
        size: track.sectors().first().map_or(2, |s| s.header.size),
        sectors: track.len() as u8,
        gap3: 0x4E,
        fill: 0xE5,
        ..TrackInfo::default()
    };
    if let Some(first) = track.sectors().first() {
        if first.gap3 != 0 {
            info.gap3 = first.gap3;
        }
    }

    let mut sector_infos = Vec::with_capacity(track.len());
    let mut data = Vec::new();
    for sector in track.sectors() {
        let native = sector.size();
        let mut status1 = 0u8;
        let mut status2 = 0u8;
        if sector.has_badidcrc() {
            status1 |= ST1_CRC_ERROR;
        }
        if sector.has_baddatacrc() {
            status1 |= ST1_CRC_ERROR;
            status2 |= ST2_CRC_ERROR_IN_DATA;
        }
        if sector.dam == DAM_DELETED {
            status2 |= ST2_CONTROL_MARK;
        }

        let mut sector_bytes = Vec::new();
        if sector.copies() > 1 && sector.has_baddatacrc() {
            // Weak sector: every copy at native size, back to back.
            for i in 0..sector.copies() {
                let mut copy = sector.data_copy(i).to_vec();
                copy.resize(native, 0x00);
                sector_bytes.extend(copy);
            }
        }
        else if sector.has_data() {
            sector_bytes = sector.data_best_copy().expect("has data").clone();
            // A single bad copy whose length is an exact multiple of the
            // native size would read back as multiple copies; a dummy
            // trailing byte disambiguates.
            if sector.has_baddatacrc()
                && sector_bytes.len() > native
                && sector_bytes.len() % native == 0
            {
                sector_bytes.push(0x00);
            }
        }

        if sector_bytes.len() > u16::MAX as usize {
            return Err(DiskError::UnsuitableTarget);
        }
        sector_infos.push(SectorInfo {
            track: sector.header.cyl as u8,
            side: sector.header.head,
            sector: sector.header.sector,
            size: sector.header.size,
            status1,
            status2,
            data_len: sector_bytes.len() as u16,
        });
        data.extend(sector_bytes);
    }

    Ok(TrackRecord {
        info,
        sector_infos,
        data,
    })
}

fn write_image(disk: &Disk, opts: &CoreOptions, rdsk: bool) -> Result<Vec<u8>, DiskError> {
    let cyls = disk.cyls();
    let heads = disk.heads().max(1);
    let header_size = if rdsk { RDSK_HEADER_SIZE } else { EDSK_HEADER_SIZE };

    let mut out = Vec::new();
    let mut track_blocks: Vec<Vec<u8>> = Vec::new();
    let mut offsets_trailer: Vec<u8> = Vec::new();
    let mut readstats_trailer: Vec<u8> = Vec::new();
    let mut any_offsets = false;

    let mut cylheads = Vec::new();
    crate::types::range::Range::new(cyls, heads).each(|ch| cylheads.push(ch), false);

    for cylhead in &cylheads {
        let track = disk.read_track(*cylhead)?;
        let record = build_track_record(*cylhead, &track)?;

        let mut block = Cursor::new(Vec::new());
        record.info.write(&mut block)?;
        for sector_info in &record.sector_infos {
            sector_info.write(&mut block)?;
        }
        let mut block = block.into_inner();
        block.resize(TRACK_DATA_OFFSET, 0);
        block.extend(&record.data);
        // Pad the block to the next 256-byte boundary.
        block.resize(block.len().div_ceil(256) * 256, 0);
        track_blocks.push(block);

        // Sector offsets, when known: track length then per-sector offsets,
        // all divided by 16.
        offsets_trailer.extend(((track.tracklen / 16) as u16).to_le_bytes());
        for sector in track.sectors() {
            if sector.raw_offset != 0 {
                any_offsets = true;
            }
            offsets_trailer.extend(((sector.raw_offset / 16) as u16).to_le_bytes());
        }

        if rdsk {
            for sector in track.sectors() {
                readstats_trailer
                    .extend((sector.read_attempts().min(u16::MAX as u32) as u16).to_le_bytes());
                readstats_trailer.extend((sector.copies() as u16).to_le_bytes());
                for i in 0..sector.copies() {
                    readstats_trailer.extend(
                        (sector.read_count_of_copy(i).min(u16::MAX as u32) as u16).to_le_bytes(),
                    );
                }
            }
        }
    }

    // Disk header with the per-track size index.
    let header = DiskHeader {
        signature: if rdsk { *RDSK_SIGNATURE } else { *EDSK_SIGNATURE },
        creator: *CREATOR,
        tracks: cyls as u8,
        sides: heads,
        track_size: 0,
    };
    let mut cursor = Cursor::new(Vec::new());
    header.write(&mut cursor)?;
    out.extend(cursor.into_inner());
    for block in &track_blocks {
        if rdsk {
            // RDSK tracks can exceed the byte index, so it holds words.
            out.extend(((block.len() / 256) as u16).to_le_bytes());
        }
        else {
            let units = block.len() / 256;
            if units > u8::MAX as usize {
                return Err(DiskError::UnsuitableTarget);
            }
            out.push(units as u8);
        }
    }
    if out.len() > header_size {
        return Err(DiskError::UnsuitableTarget);
    }
    out.resize(header_size, 0);

    for block in track_blocks {
        out.extend(block);
    }

    if any_offsets && opts.offsets {
        out.extend(EDSK_OFFSETS_SIG);
        out.push(0); // reserved flags
        out.extend(offsets_trailer);
    }
    if rdsk {
        out.extend(RDSK_READSTATS_SIG);
        out.push(0); // reserved flags
        out.extend(readstats_trailer);
    }
    Ok(out)
}

pub fn write_edsk(disk: &Disk, opts: &CoreOptions) -> Result<Vec<u8>, DiskError> {
    write_image(disk, opts, false)
}

pub fn write_rdsk(disk: &Disk, opts: &CoreOptions) -> Result<Vec<u8>, DiskError> {
    write_image(disk, opts, true)
}

/// Split a stored data field back into copies, honouring the multi-copy and
/// dummy-byte conventions.
fn split_copies(bytes: &[u8], native: usize, bad_data: bool) -> Vec<Vec<u8>> {
    if bytes.is_empty() {
        return Vec::new();
    }
    if bad_data && native > 0 {
        // Legacy 48K form: an 8K sector stored as three 16K reads.
        if native == 8192 && bytes.len() == 3 * 16384 {
            return bytes.chunks(16384).map(|c| c.to_vec()).collect();
        }
        if bytes.len() > native && bytes.len() % native == 0 {
            return bytes.chunks(native).map(|c| c.to_vec()).collect();
        }
        // A trailing dummy byte marks a single copy of gap-extended data.
        if bytes.len() > native && bytes.len() % native == 1 {
            return vec![bytes[..bytes.len() - 1].to_vec()];
        }
    }
    vec![bytes.to_vec()]
}

fn read_image(bytes: &[u8], rdsk: bool) -> Result<Disk, DiskError> {
    let expected_sig: &[u8; 34] = if rdsk { RDSK_SIGNATURE } else { EDSK_SIGNATURE };
    let header_size = if rdsk { RDSK_HEADER_SIZE } else { EDSK_HEADER_SIZE };
    if bytes.len() < header_size {
        return Err(DiskError::UnknownFormat);
    }
    let mut cursor = Cursor::new(bytes);
    let header = DiskHeader::read(&mut cursor)?;
    if &header.signature != expected_sig {
        return Err(DiskError::UnknownFormat);
    }

    let tracks = header.tracks as usize;
    let sides = header.sides.max(1) as usize;
    let mut sizes = Vec::with_capacity(tracks * sides);
    let mut index_pos = 52usize;
    for _ in 0..tracks * sides {
        let size = if rdsk {
            if index_pos + 2 > header_size {
                return Err(DiskError::ImageCorrupt);
            }
            let units = u16::from_le_bytes([bytes[index_pos], bytes[index_pos + 1]]);
            index_pos += 2;
            units as usize * 256
        }
        else {
            if index_pos >= header_size {
                return Err(DiskError::ImageCorrupt);
            }
            let units = bytes[index_pos];
            index_pos += 1;
            units as usize * 256
        };
        sizes.push(size);
    }

    let mut disk = Disk::new();
    let mut block_start = header_size;
    let mut track_order: Vec<(CylHead, usize)> = Vec::new();

    for (ti, &block_size) in sizes.iter().enumerate() {
        let cylhead = CylHead::new((ti / sides) as u16, (ti % sides) as u8);
        if block_size == 0 {
            // A blank, unformatted track.
            disk.write_track(cylhead, Track::new());
            track_order.push((cylhead, 0));
            continue;
        }
        if block_start + block_size > bytes.len() {
            return Err(DiskError::ImageCorrupt);
        }
        let block = &bytes[block_start..block_start + block_size];

        let mut cursor = Cursor::new(block);
        let info = TrackInfo::read(&mut cursor)?;
        if &info.signature != EDSK_TRACK_SIG {
            return Err(DiskError::ImageCorrupt);
        }
        let mut sector_infos = Vec::with_capacity(info.sectors as usize);
        for _ in 0..info.sectors {
            sector_infos.push(SectorInfo::read(&mut cursor)?);
        }

        let datarate = byte_to_rate(info.rate);
        let encoding = byte_to_encoding(info.encoding);
        let mut track = Track::with_capacity(sector_infos.len());
        let mut data_pos = TRACK_DATA_OFFSET;
        for sector_info in &sector_infos {
            let end = data_pos + sector_info.data_len as usize;
            if end > block.len() {
                return Err(DiskError::ImageCorrupt);
            }
            let stored = &block[data_pos..end];
            data_pos = end;

            // The deprecated random-errors flag lives in the head field.
            let legacy_random = sector_info.side & HEAD_FLAG_RANDOM_ERRORS != 0;
            let head = sector_info.side & !HEAD_FLAG_RANDOM_ERRORS;

            let header = Header::new(
                sector_info.track as u16,
                head,
                sector_info.sector,
                sector_info.size,
            );
            let mut sector = Sector::new(
                if datarate == DataRate::Unknown {
                    DataRate::Rate250K
                }
                else {
                    datarate
                },
                encoding,
                header,
            );
            sector.gap3 = info.gap3;

            let bad_data =
                sector_info.status2 & ST2_CRC_ERROR_IN_DATA != 0 || legacy_random;
            let bad_id = sector_info.status1 & ST1_CRC_ERROR != 0 && !bad_data;
            if bad_id {
                sector.set_badidcrc();
            }
            let dam = if sector_info.status2 & ST2_CONTROL_MARK != 0 {
                DAM_DELETED
            }
            else {
                DAM_NORMAL
            };

            for copy in split_copies(stored, sector.size(), bad_data) {
                sector.add(copy, bad_data, dam);
            }
            track.add(sector, &MergePolicy::default())?;
        }
        track_order.push((cylhead, track.len()));
        disk.write_track(cylhead, track);
        block_start += block_size;
    }

    // Optional trailers follow the track blocks.
    let mut trailer_pos = block_start;
    while trailer_pos < bytes.len() {
        let rest = &bytes[trailer_pos..];
        if rest.starts_with(EDSK_OFFSETS_SIG) {
            trailer_pos += EDSK_OFFSETS_SIG.len() + 1; // signature + flags
            for (cylhead, sector_count) in &track_order {
                let mut track = disk.read_track(*cylhead)?;
                if trailer_pos + 2 > bytes.len() {
                    break;
                }
                let tracklen =
                    u16::from_le_bytes([bytes[trailer_pos], bytes[trailer_pos + 1]]) as u32 * 16;
                trailer_pos += 2;
                if tracklen != 0 {
                    track.set_tracklen(tracklen);
                }
                for i in 0..*sector_count {
                    if trailer_pos + 2 > bytes.len() {
                        break;
                    }
                    let offset = u16::from_le_bytes([
                        bytes[trailer_pos],
                        bytes[trailer_pos + 1],
                    ]) as u32
                        * 16;
                    trailer_pos += 2;
                    track.sector_mut(i).raw_offset = offset;
                }
                disk.write_track(*cylhead, track);
            }
        }
        else if rest.starts_with(RDSK_READSTATS_SIG) {
            trailer_pos += RDSK_READSTATS_SIG.len() + 1;
            for (cylhead, sector_count) in &track_order {
                let mut track = disk.read_track(*cylhead)?;
                for i in 0..*sector_count {
                    if trailer_pos + 4 > bytes.len() {
                        break;
                    }
                    let attempts =
                        u16::from_le_bytes([bytes[trailer_pos], bytes[trailer_pos + 1]]);
                    let num_datas =
                        u16::from_le_bytes([bytes[trailer_pos + 2], bytes[trailer_pos + 3]]);
                    trailer_pos += 4;
                    let sector = track.sector_mut(i);
                    sector.set_read_attempts(attempts as u32);
                    for copy in 0..num_datas as usize {
                        if trailer_pos + 2 > bytes.len() {
                            break;
                        }
                        let count =
                            u16::from_le_bytes([bytes[trailer_pos], bytes[trailer_pos + 1]]);
                        trailer_pos += 2;
                        sector.set_read_count_of_copy(copy, count as u32);
                    }
                }
                disk.write_track(*cylhead, track);
            }
        }
        else {
            break;
        }
    }

    disk.set_str_type(if rdsk { "RDSK" } else { "EDSK" });
    Ok(disk)
}

pub fn read_edsk(bytes: &[u8], _opts: &CoreOptions) -> Result<Disk, DiskError> {
    read_image(bytes, false)
}

pub fn read_rdsk(bytes: &[u8], _opts: &CoreOptions) -> Result<Disk, DiskError> {
    read_image(bytes, true)
}
