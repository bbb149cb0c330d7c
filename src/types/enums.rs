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

    src/types/enums.rs

    Data rates, encodings, and pipeline policy enums.
*/

use strum::{Display, EnumIter};

/// The bit cell rate of a track.
///
/// 250Kbps and 300Kbps are the same physical format spun at 300rpm and 360rpm
/// respectively, so the two are interchangeable when matching sectors.
#[derive(Copy, Clone, Debug, Default, Display, EnumIter, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum DataRate {
    #[default]
    #[strum(to_string = "Unknown")]
    Unknown,
    #[strum(to_string = "250Kbps")]
    Rate250K,
    #[strum(to_string = "300Kbps")]
    Rate300K,
    #[strum(to_string = "500Kbps")]
    Rate500K,
    #[strum(to_string = "1Mbps")]
    Rate1M,
    #[strum(to_string = "2Mbps")]
    Rate2M,
}

impl DataRate {
    pub fn bits_per_second(&self) -> u32 {
        match self {
            DataRate::Unknown => 0,
            DataRate::Rate250K => 250_000,
            DataRate::Rate300K => 300_000,
            DataRate::Rate500K => 500_000,
            DataRate::Rate1M => 1_000_000,
            DataRate::Rate2M => 2_000_000,
        }
    }

    /// 250Kbps and 300Kbps are rotation-speed twins of the same format.
    pub fn is_interchangeable_with(&self, other: DataRate) -> bool {
        if *self == other {
            return true;
        }
        matches!(
            (*self, other),
            (DataRate::Rate250K, DataRate::Rate300K) | (DataRate::Rate300K, DataRate::Rate250K)
        )
    }
}

impl From<u32> for DataRate {
    fn from(bps: u32) -> Self {
        match bps {
            250_000 => DataRate::Rate250K,
            300_000 => DataRate::Rate300K,
            500_000 => DataRate::Rate500K,
            1_000_000 => DataRate::Rate1M,
            2_000_000 => DataRate::Rate2M,
            _ => DataRate::Unknown,
        }
    }
}

/// The modulation scheme of a track.
#[derive(Copy, Clone, Debug, Default, Display, EnumIter, Eq, Hash, PartialEq)]
pub enum Encoding {
    #[default]
    Unknown,
    #[strum(to_string = "FM")]
    Fm,
    #[strum(to_string = "MFM")]
    Mfm,
    Amiga,
    #[strum(to_string = "RX02")]
    Rx02,
    Ace,
    #[strum(to_string = "MX")]
    Mx,
    Agat,
}

impl Encoding {
    /// Raw bit cells per data byte. An FM data bit occupies two MFM-sized
    /// cells, so an FM byte spans 32 raw cells.
    pub fn bitcells_per_byte(&self) -> u32 {
        match self {
            Encoding::Fm | Encoding::Rx02 => 32,
            _ => 16,
        }
    }
}

/// How a source track is applied to the destination disk.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum TransferMode {
    #[default]
    Copy,
    Merge,
    Repair,
}

/// Gap-data retention policy during track normalisation.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum GapsPolicy {
    /// Remove all gap data.
    None,
    /// Remove clean 0x4E/0x00 tails, keep anything suspicious.
    #[default]
    Clean,
    /// Keep all gap data.
    All,
}

/// Whether known protection problems are repaired or merely reported.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum FixMode {
    Warn,
    #[default]
    Apply,
}

/// The representation to keep when reducing a multi-layer track.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum PreferredData {
    #[default]
    Unknown,
    Track,
    Bitstream,
    Flux,
}

/// Data address marks recognised by the scanner and encoder.
pub const DAM_NORMAL: u8 = 0xFB;
pub const DAM_DELETED: u8 = 0xF8;
pub const DAM_ALT: u8 = 0xFA;
pub const DAM_RX02: u8 = 0xFD;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datarate_twins() {
        assert!(DataRate::Rate250K.is_interchangeable_with(DataRate::Rate300K));
        assert!(DataRate::Rate300K.is_interchangeable_with(DataRate::Rate250K));
        assert!(!DataRate::Rate250K.is_interchangeable_with(DataRate::Rate500K));
        assert!(DataRate::Rate500K.is_interchangeable_with(DataRate::Rate500K));
    }

    #[test]
    fn fm_bytes_are_twice_as_wide() {
        assert_eq!(Encoding::Mfm.bitcells_per_byte(), 16);
        assert_eq!(Encoding::Fm.bitcells_per_byte(), 32);
    }
}
