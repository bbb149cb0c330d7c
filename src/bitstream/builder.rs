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

    src/bitstream/builder.rs

    Building raw track content from scratch: clock rules, sync runs, address
    marks, CRCs and gap structure for MFM, FM, Amiga and RX02 tracks.
*/

use crate::bitstream::BitBuffer;
use crate::sector::Sector;
use crate::track::Track;
use crate::types::chs::{CylHead, Header};
use crate::types::enums::{DataRate, Encoding, DAM_RX02};
use crate::util::{crc16_byte, track_capacity, CRC_CCITT_INITIAL, RPM_TIME_300};
use crate::DiskError;

pub const IBM_IAM: u8 = 0xFC;
pub const IBM_IDAM: u8 = 0xFE;

pub struct TrackBuilder {
    buffer: BitBuffer,
    datarate: DataRate,
    encoding: Encoding,
    crc: u16,
    last_bit: bool,
}

impl TrackBuilder {
    pub fn new(datarate: DataRate, encoding: Encoding) -> Result<Self, DiskError> {
        Self::check_encoding(encoding)?;
        Ok(Self {
            buffer: BitBuffer::new(datarate, encoding),
            datarate,
            encoding,
            crc: CRC_CCITT_INITIAL,
            last_bit: false,
        })
    }

    fn check_encoding(encoding: Encoding) -> Result<(), DiskError> {
        match encoding {
            Encoding::Mfm | Encoding::Fm | Encoding::Rx02 | Encoding::Amiga => Ok(()),
            _ => Err(DiskError::UnsupportedFormat),
        }
    }

    /// Switch modulation mid-track, as RX02 sectors must.
    pub fn set_encoding(&mut self, encoding: Encoding) -> Result<(), DiskError> {
        Self::check_encoding(encoding)?;
        self.encoding = encoding;
        Ok(())
    }

    pub fn into_buffer(self) -> BitBuffer {
        self.buffer
    }

    pub fn bit_len(&self) -> usize {
        self.buffer.len()
    }

    fn add_raw_bit(&mut self, bit: bool) {
        self.buffer.push(bit);
    }

    fn add_bit(&mut self, bit: bool) {
        self.add_raw_bit(bit);
        // FM cells are twice as wide, with a dead half after each bit.
        if self.encoding == Encoding::Fm {
            self.add_raw_bit(false);
        }
    }

    pub fn add_data_bit(&mut self, bit: bool) {
        if self.encoding == Encoding::Fm {
            // FM has a reversal before every data bit.
            self.add_bit(true);
            self.add_bit(bit);
        }
        else {
            // MFM has a reversal between consecutive zeros (clock or data).
            self.add_bit(!self.last_bit && !bit);
            self.add_bit(bit);
        }
        self.last_bit = bit;
    }

    pub fn add_byte(&mut self, byte: u8) {
        for i in (0..8).rev() {
            self.add_data_bit((byte >> i) & 1 != 0);
        }
    }

    pub fn add_byte_update_crc(&mut self, byte: u8) {
        self.add_byte(byte);
        self.crc = crc16_byte(byte, self.crc);
    }

    /// Write a byte with an explicit clock pattern, for address marks whose
    /// missing clock bits violate the normal rules.
    pub fn add_byte_with_clock(&mut self, data: u8, clock: u8) {
        for i in (0..8).rev() {
            self.add_bit((clock >> i) & 1 != 0);
            self.add_bit((data >> i) & 1 != 0);
        }
        self.last_bit = data & 1 != 0;
    }

    pub fn add_block(&mut self, byte: u8, count: usize) {
        for _ in 0..count {
            self.add_byte(byte);
        }
    }

    pub fn add_block_slice(&mut self, data: &[u8]) {
        for &byte in data {
            self.add_byte(byte);
        }
    }

    pub fn add_block_update_crc(&mut self, data: &[u8]) {
        for &byte in data {
            self.add_byte_update_crc(byte);
        }
    }

    pub fn add_gap(&mut self, count: usize, fill: Option<u8>) {
        let fill = fill.unwrap_or(if self.encoding == Encoding::Fm { 0xFF } else { 0x4E });
        self.add_block(fill, count);
    }

    pub fn add_gap2(&mut self) {
        let gap2 = if self.encoding == Encoding::Fm { 11 } else { 22 };
        self.add_gap(gap2, None);
    }

    fn sync_length(&self, short_mfm_gap: bool) -> usize {
        match self.encoding {
            Encoding::Fm | Encoding::Rx02 => 6,
            _ if short_mfm_gap => 3,
            _ => 12,
        }
    }

    pub fn add_sync(&mut self, short_mfm_gap: bool) {
        self.add_block(0x00, self.sync_length(short_mfm_gap));
    }

    pub fn add_am(&mut self, am_type: u8, omit_sync: bool, short_mfm_gap: bool) {
        if !omit_sync {
            self.add_sync(short_mfm_gap);
        }

        if self.encoding == Encoding::Fm {
            self.add_byte_with_clock(am_type, 0xC7); // FM AM uses C7 clock pattern
            self.crc = crc16_byte(am_type, CRC_CCITT_INITIAL);
        }
        else {
            self.add_byte_with_clock(0xA1, 0x0A); // A1 with missing clock bit
            self.add_byte_with_clock(0xA1, 0x0A); // clock: 0 0 0 0 1 X 1 0
            self.add_byte_with_clock(0xA1, 0x0A); // data:  1 0 1 0 0 0 0 1
            self.crc = 0xCDB4; // A1A1A1
            self.add_byte_update_crc(am_type);
        }
    }

    pub fn add_iam(&mut self) {
        self.add_sync(false);

        if self.encoding == Encoding::Fm {
            self.add_byte_with_clock(IBM_IAM, 0xD7); // FM IAM uses D7 clock pattern
        }
        else {
            self.add_byte_with_clock(0xC2, 0x14); // C2 with missing clock bit
            self.add_byte_with_clock(0xC2, 0x14); // clock: 0 0 0 1 X 1 0 0
            self.add_byte_with_clock(0xC2, 0x14); // data:  1 1 0 0 0 0 1 0
            self.add_byte(IBM_IAM);
        }
    }

    pub fn add_crc_bytes(&mut self, bad_crc: bool) {
        let adjust: u16 = if bad_crc { 0x5555 } else { 0 };
        let crc = self.crc ^ adjust;
        self.add_byte((crc >> 8) as u8);
        self.add_byte((crc & 0xFF) as u8);
    }

    pub fn add_track_start(&mut self, short_mfm_gap: bool) -> Result<(), DiskError> {
        match self.encoding {
            Encoding::Mfm | Encoding::Fm => {
                if self.encoding == Encoding::Mfm && short_mfm_gap {
                    // Short gap without IAM, for 11-sector disks.
                    self.add_gap(20, None);
                }
                else {
                    let fm = self.encoding == Encoding::Fm;
                    self.add_gap(if fm { 40 } else { 80 }, None); // gap 4a
                    self.add_iam();
                    self.add_gap(if fm { 26 } else { 50 }, None); // gap 1
                }
            }
            Encoding::Amiga => {
                self.add_block(0x00, 60);
            }
            Encoding::Rx02 => {
                self.set_encoding(Encoding::Fm)?;
                self.add_gap(32, None); // gap 4a
                self.add_iam();
                self.add_gap(27, None); // gap 1
                self.set_encoding(Encoding::Rx02)?;
            }
            _ => return Err(DiskError::UnsupportedFormat),
        }
        Ok(())
    }

    pub fn add_sector_header(&mut self, header: &Header, crc_error: bool, short_mfm_gap: bool) {
        self.add_am(IBM_IDAM, false, short_mfm_gap);
        self.add_byte_update_crc(header.cyl as u8);
        self.add_byte_update_crc(header.head);
        self.add_byte_update_crc(header.sector);
        self.add_byte_update_crc(header.size);
        self.add_crc_bytes(crc_error);
    }

    pub fn add_sector_data(&mut self, data: &[u8], size: u8, dam: u8, crc_error: bool) {
        self.add_am(dam, false, false);

        let len_bytes = Header::size_code_to_length(size);
        if data.len() == len_bytes {
            // Normal data and appropriate CRC.
            self.add_block_update_crc(data);
            self.add_crc_bytes(crc_error);
        }
        else if data.len() > len_bytes {
            // Data plus gap, which will include the data CRC.
            self.add_block_update_crc(data);
        }
        else {
            // Short data padded to full size, and an appropriate CRC.
            self.add_block_update_crc(data);
            let pad = vec![0x00u8; len_bytes - data.len()];
            self.add_block_update_crc(&pad);
            self.add_crc_bytes(crc_error);
        }
    }

    pub fn add_sector(
        &mut self,
        sector: &Sector,
        gap3_bytes: usize,
        short_mfm_gap: bool,
    ) -> Result<(), DiskError> {
        self.set_encoding(sector.encoding)?;

        match self.encoding {
            Encoding::Mfm | Encoding::Fm => {
                self.add_sector_header(&sector.header, sector.has_badidcrc(), short_mfm_gap);
                self.add_gap2(); // Post ID.
                if sector.has_data() {
                    let data = sector.data_best_copy().expect("has_data checked");
                    self.add_sector_data(
                        data,
                        sector.header.size,
                        sector.dam,
                        sector.has_baddatacrc(),
                    );
                }
                if !sector.has_gapdata() {
                    self.add_gap(gap3_bytes, None); // Post DATA.
                }
            }
            Encoding::Amiga => {
                let empty = Vec::new();
                let data = sector.data_best_copy().unwrap_or(&empty);
                self.add_amiga_sector(sector.header.cylhead(), sector.header.sector, data);
            }
            Encoding::Rx02 => {
                let empty = Vec::new();
                let data = sector.data_best_copy().unwrap_or(&empty);
                self.add_rx02_sector(&sector.header, data, gap3_bytes)?;
            }
            _ => return Err(DiskError::UnsupportedFormat),
        }
        Ok(())
    }

    /// Sector header and DAM, but no data, CRC, or gap3: the lead-in of a
    /// weak sector that will be completed by a raw write.
    pub fn add_sector_up_to_data(&mut self, header: &Header, dam: u8) {
        self.add_sector_header(header, false, false);
        self.add_gap2();
        self.add_am(dam, false, false);
    }

    fn add_amiga_dword(&mut self, dword: u32, checksum: &mut u32) {
        let bytes = dword.to_be_bytes();
        let bits = Self::split_amiga_bits(&bytes, checksum);
        self.add_amiga_bits(&bits);
    }

    fn add_amiga_bits(&mut self, bits: &[u32]) {
        for &word in bits {
            let mut data = word;
            for _ in 0..16 {
                self.add_data_bit(data & 0x4000_0000 != 0);
                data <<= 2;
            }
        }
    }

    /// Split data into the odd and even bit planes of Amiga encoding.
    fn split_amiga_bits(buf: &[u8], checksum: &mut u32) -> Vec<u32> {
        let dwords: Vec<u32> = buf
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let mut planes = Vec::with_capacity(dwords.len() * 2);

        // Even then odd passes over the data.
        for pass in 0..2 {
            for &dword in &dwords {
                let mut bits = 0u32;
                let mut data = dword << pass;
                for k in 0..16 {
                    bits |= (data & 0x8000_0000) >> (1 + k * 2);
                    data <<= 2;
                }
                planes.push(bits);
                *checksum ^= bits;
            }
        }
        planes
    }

    pub fn add_amiga_sector(&mut self, cylhead: CylHead, sector: u8, buf: &[u8]) {
        self.add_byte(0x00);
        self.add_byte_with_clock(0xA1, 0x0A); // A1 with missing clock bit
        self.add_byte_with_clock(0xA1, 0x0A);

        let sectors: u8 = if self.datarate == DataRate::Rate500K { 22 } else { 11 };
        let remain = sectors.saturating_sub(sector);

        let mut checksum = 0u32;
        let info: u32 = 0xFF00_0000
            | ((((cylhead.cyl as u32) << 1) | cylhead.head as u32) << 16)
            | ((sector as u32) << 8)
            | remain as u32;
        self.add_amiga_dword(info, &mut checksum);

        let sector_label = [0u8; 16];
        let bits = Self::split_amiga_bits(&sector_label, &mut checksum);
        self.add_amiga_bits(&bits);
        self.add_amiga_dword(checksum, &mut checksum);

        let mut data_checksum = 0u32;
        let mut padded = buf.to_vec();
        padded.resize(512, 0x00);
        let bits = Self::split_amiga_bits(&padded, &mut data_checksum);
        self.add_amiga_dword(data_checksum, &mut data_checksum);
        self.add_amiga_bits(&bits);

        self.add_byte(0x00);
    }

    pub fn add_rx02_sector(
        &mut self,
        header: &Header,
        data: &[u8],
        gap3_bytes: usize,
    ) -> Result<(), DiskError> {
        self.set_encoding(Encoding::Fm)?;

        self.add_sector_header(header, false, false);
        self.add_gap2();
        self.add_am(DAM_RX02, false, false);

        self.set_encoding(Encoding::Mfm)?;

        self.add_block_update_crc(data);
        self.add_crc_bytes(false);
        self.add_gap(gap3_bytes, None);

        self.set_encoding(Encoding::Rx02)?;
        Ok(())
    }
}

/// Encode a whole track into a bitstream, deriving a gap3 that spreads the
/// sectors over the revolution.
pub fn generate_bitstream(track: &Track) -> Result<BitBuffer, DiskError> {
    let datarate = track.data_rate().unwrap_or(DataRate::Rate250K);
    let encoding = track.encoding().unwrap_or(Encoding::Mfm);

    let capacity = if track.tracklen > 0 {
        track.tracklen as usize
    }
    else {
        track_capacity(RPM_TIME_300, datarate) as usize
    };

    let gap3 = track_gap3(track, capacity);
    let mut builder = TrackBuilder::new(datarate, encoding)?;
    builder.add_track_start(false)?;
    for sector in track.sectors() {
        let sector_gap3 = if sector.gap3 != 0 {
            sector.gap3 as usize
        }
        else {
            gap3
        };
        builder.add_sector(sector, sector_gap3, false)?;
    }

    // Pad the remainder of the revolution with gap filler.
    while builder.bit_len() + 16 <= capacity {
        builder.add_gap(1, None);
    }
    Ok(builder.into_buffer())
}

/// Choose a gap3 that fits the track's sectors into the revolution.
fn track_gap3(track: &Track, capacity_bits: usize) -> usize {
    if track.is_empty() {
        return 0;
    }
    let encoding = track.encoding().unwrap_or(Encoding::Mfm);
    let cells = encoding.bitcells_per_byte() as usize;
    let overhead = match encoding {
        Encoding::Fm | Encoding::Rx02 => 33,
        _ => 62,
    };
    let track_overhead: usize = 146; // gap4a + IAM + gap1
    let used: usize = track
        .sectors()
        .iter()
        .map(|s| (overhead + s.size()) * cells)
        .sum();
    let space = capacity_bits.saturating_sub(track_overhead * cells + used);
    let gap3 = space / cells / track.len().max(1);
    gap3.clamp(1, 82)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::MFM_SYNC_A1;
    use crate::track::MergePolicy;
    use crate::types::enums::DAM_NORMAL;

    #[test]
    fn mfm_clock_rule_inserts_reversal_between_zeros() {
        let mut builder = TrackBuilder::new(DataRate::Rate250K, Encoding::Mfm).unwrap();
        builder.add_byte(0x00);
        let buf = builder.into_buffer();
        // 0x00 after an initial zero: every cell pair is (clock=1, data=0).
        let cells: Vec<bool> = buf.iter().collect();
        for pair in cells.chunks(2) {
            assert_eq!(pair, &[true, false]);
        }
    }

    #[test]
    fn fm_bytes_span_32_cells() {
        let mut builder = TrackBuilder::new(DataRate::Rate250K, Encoding::Fm).unwrap();
        builder.add_byte(0xFF);
        let buf = builder.into_buffer();
        assert_eq!(buf.len(), 32);
        let (clock, data) = buf.read_fm_byte(0);
        assert_eq!(clock, 0xFF);
        assert_eq!(data, 0xFF);
    }

    #[test]
    fn sync_run_encodes_as_4489() {
        let mut builder = TrackBuilder::new(DataRate::Rate250K, Encoding::Mfm).unwrap();
        builder.add_am(IBM_IDAM, false, false);
        let buf = builder.into_buffer();
        let pos = buf.find_pattern16(MFM_SYNC_A1, 0).expect("sync present");
        let (_, a1) = buf.read_mfm_byte(pos);
        assert_eq!(a1, 0xA1);
        let (_, idam) = buf.read_mfm_byte(pos + 48);
        assert_eq!(idam, IBM_IDAM);
    }

    #[test]
    fn generated_track_contains_every_sector() {
        let mut track = Track::new();
        track.tracklen = 100_000;
        for i in 0..9u8 {
            let mut sector = Sector::new(
                DataRate::Rate250K,
                Encoding::Mfm,
                Header::new(0, 0, i + 1, 2),
            );
            sector.raw_offset = 1000 + i as u32 * 11_000;
            sector.add(vec![i; 512], false, DAM_NORMAL);
            track.add(sector, &MergePolicy::default()).unwrap();
        }
        let buf = generate_bitstream(&track).unwrap();
        assert!(buf.len() <= 100_000);
        assert!(buf.len() > 90_000);
    }
}
