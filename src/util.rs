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

    src/util.rs

    CRC-16 and timing helpers shared across the crate.
*/

use crate::types::enums::{DataRate, Encoding};

/// The initial seed value for CRC-CCITT and related checksums.
pub const CRC_CCITT_INITIAL: u16 = 0xFFFF;

/// The CRC state after the three A1 sync bytes that precede every MFM
/// address mark.
pub const CRC_MFM_A1A1A1: u16 = 0xCDB4;

/// Calculate a 16-bit checksum over a byte slice.
/// See: https://reveng.sourceforge.io/crc-catalogue/16.htm
pub fn crc16(data: &[u8], start: u16) -> u16 {
    let mut crc = start;
    for &byte in data {
        crc = crc16_byte(byte, crc);
    }
    crc
}

/// Calculate a 16-bit checksum one byte at a time.
pub fn crc16_byte(byte: u8, crc: u16) -> u16 {
    const POLY: u16 = 0x1021; // Polynomial x^16 + x^12 + x^5 + 1
    let mut crc = crc ^ ((byte as u16) << 8);
    for _ in 0..8 {
        if (crc & 0x8000) != 0 {
            crc = (crc << 1) ^ POLY;
        }
        else {
            crc <<= 1;
        }
    }
    crc
}

/// The disk rotates once per 200ms at 300rpm, or once per 166.6ms at 360rpm.
pub const RPM_TIME_300: u32 = 200_000;
pub const RPM_TIME_360: u32 = 166_666;

/// Raw bit cells per second. Clock and data cells interleave, so the raw cell
/// rate is twice the data rate for both FM and MFM.
pub fn raw_cell_rate(datarate: DataRate) -> u32 {
    datarate.bits_per_second() * 2
}

/// Convert a bit offset to a time in microseconds.
pub fn bits_to_time_us(datarate: DataRate, bits: u32) -> u32 {
    let rate = raw_cell_rate(datarate);
    if rate == 0 {
        return 0;
    }
    ((bits as u64 * 1_000_000 + rate as u64 / 2) / rate as u64) as u32
}

/// Convert a time in microseconds to a bit offset.
pub fn time_us_to_bits(datarate: DataRate, time_us: u32) -> u32 {
    ((time_us as u64 * raw_cell_rate(datarate) as u64 + 500_000) / 1_000_000) as u32
}

/// Translate a data byte position into a raw bit offset.
pub fn byte_position_as_bit_offset(bytes: i32, encoding: Encoding) -> i32 {
    bytes * encoding.bitcells_per_byte() as i32
}

/// The bit distance within which two observed offsets refer to one sector.
pub fn tolerated_offset_distance(encoding: Encoding, byte_tolerance: i32) -> i32 {
    byte_position_as_bit_offset(byte_tolerance, encoding)
}

/// Whether two offsets refer to the same position on the track, allowing for
/// wrap at the index hole.
pub fn are_offsets_tolerated_same(
    offset1: u32,
    offset2: u32,
    encoding: Encoding,
    byte_tolerance: i32,
    tracklen: u32,
) -> bool {
    let tolerance = tolerated_offset_distance(encoding, byte_tolerance) as i64;
    let diff = (offset1 as i64 - offset2 as i64).abs();
    if diff <= tolerance {
        return true;
    }
    // Offsets near opposite ends of the revolution may still be neighbours.
    tracklen > 0 && (tracklen as i64 - diff).abs() <= tolerance
}

/// The unformatted track capacity in raw bit cells for a revolution time.
pub fn track_capacity(revolution_time_us: u32, datarate: DataRate) -> u32 {
    // Derate slightly as real drives never spin at exactly nominal speed.
    let raw = (raw_cell_rate(datarate) as u64 * revolution_time_us as u64 / 1_000_000) as u32;
    (raw as u64 * 1995 / 2000) as u32
}

/// Euclidean-style division that rounds towards negative infinity, used when
/// wrapping offsets around the revolution boundary.
pub fn modulo_div(value: i64, modulus: i64) -> i64 {
    let mut div = value / modulus;
    if value % modulus < 0 {
        div -= 1;
    }
    div
}

pub fn modulo(value: i64, modulus: i64) -> i64 {
    let rem = value % modulus;
    if rem < 0 {
        rem + modulus
    }
    else {
        rem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_known_vectors() {
        // CRC of the MFM sync run A1 A1 A1 from the CCITT seed.
        assert_eq!(crc16(&[0xA1, 0xA1, 0xA1], CRC_CCITT_INITIAL), CRC_MFM_A1A1A1);
        // Appending a message's own CRC always yields zero.
        let mut data = vec![0xFE, 0x00, 0x00, 0x01, 0x02];
        let crc = crc16(&data, CRC_MFM_A1A1A1);
        data.push((crc >> 8) as u8);
        data.push((crc & 0xFF) as u8);
        assert_eq!(crc16(&data, CRC_MFM_A1A1A1), 0);
    }

    #[test]
    fn raw_cell_timing() {
        // A 250Kbps MFM track spins 100,000 raw cells past the head in 200ms.
        assert!(track_capacity(RPM_TIME_300, DataRate::Rate250K) > 99_000);
        assert_eq!(bits_to_time_us(DataRate::Rate250K, 100_000), 200_000);
        assert_eq!(time_us_to_bits(DataRate::Rate250K, 200_000), 100_000);
    }

    #[test]
    fn wrapped_offsets_match() {
        assert!(are_offsets_tolerated_same(10, 99_990, Encoding::Mfm, 64, 100_000));
        assert!(!are_offsets_tolerated_same(10, 50_000, Encoding::Mfm, 64, 100_000));
    }

    #[test]
    fn modulo_negative_values() {
        assert_eq!(modulo(-1, 100), 99);
        assert_eq!(modulo_div(-1, 100), -1);
        assert_eq!(modulo_div(250, 100), 2);
    }
}
