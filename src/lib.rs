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
*/

//! # fluxmend
//!
//! fluxmend is a Rust library for imaging floppy disks into a model rich
//! enough to describe copy-protected content, and for writing that model back
//! to another image, another device, or a regularised file-system view.
//!
//! The heart of the crate is a layered track representation (flux,
//! bitstream, and decoded sectors) held together by [`TrackData`], which
//! derives missing layers on demand. Above it sit the [`Disk`] container and
//! its demand-loading and repairing specialisations, the transfer engine that
//! merges multiple reads of the same track into the best possible
//! reconstruction, and a FAT12 reconstructor able to rebuild a BIOS Parameter
//! Block from a disk whose boot sector is missing or damaged.
//!
//! Image codecs plug into a small dispatch table keyed by file extension; the
//! bit-exact EDSK/RDSK codec used for archival interchange is built in.

pub mod bitstream;
pub mod disk;
pub mod file_system;
pub mod flux;
pub mod format;
pub mod image;
pub mod messages;
pub mod normalise;
pub mod opts;
pub mod protection;
pub mod sector;
pub mod track;
pub mod trackdata;
pub mod transfer;
pub mod types;
pub mod util;

use thiserror::Error;

/// Sectors declared larger than this are truncated by the hardware anyway.
pub const MAXIMUM_SECTOR_SIZE: usize = 8192;
pub const DEFAULT_SECTOR_SIZE: usize = 512;
pub const MIN_SECTOR_SIZE: usize = 128;

/// Internal geometry limits, needed for the largest supported images.
pub const MAX_CYLS: usize = 128;
pub const MAX_HEADS: usize = 2;
pub const MAX_SECTORS: usize = 144;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("An IO error occurred reading or writing the disk image: {0}")]
    Io(String),
    #[error("A binary parse error occurred in a disk image: {0}")]
    Parse(String),
    #[error("Unknown disk image format")]
    UnknownFormat,
    #[error("Unsupported disk image format for requested operation")]
    UnsupportedFormat,
    #[error("The disk image is corrupt")]
    ImageCorrupt,
    #[error("Bad disk geometry")]
    BadGeometry,
    #[error("The write target is unsuitable for the source content")]
    UnsuitableTarget,
    #[error("Data rates cannot be mixed within one track")]
    MixedDataRates,
    #[error("A sector carries an invalid bit offset: {0}")]
    InvalidOffset(String),
    #[error("Sector id {id} is repeated on the track")]
    RepeatedSector { id: u8 },
    #[error("Repeated sectors overlap on the track")]
    OverlappedRepeatedSector,
    #[error("A sector header does not belong to this cylinder/head")]
    ForeignCylHead,
    #[error("The requested sector could not be found")]
    MissingSector,
    #[error("The boot sector is missing or has no usable data")]
    MissingBootSector,
    #[error("The track cannot be synced because its endings are tight")]
    TightTrackEnds,
    #[error("Writing to this device is not supported")]
    WriteUnsupported,
}

impl From<std::io::Error> for DiskError {
    fn from(err: std::io::Error) -> Self {
        DiskError::Io(err.to_string())
    }
}

impl From<binrw::Error> for DiskError {
    fn from(err: binrw::Error) -> Self {
        DiskError::Parse(err.to_string())
    }
}

pub use crate::disk::{DemandDisk, Disk, DiskBackend, RepairSummaryDisk, TrackLoader};
pub use crate::format::{Format, RegularFormat};
pub use crate::opts::CoreOptions;
pub use crate::sector::Sector;
pub use crate::track::Track;
pub use crate::trackdata::TrackData;
pub use crate::transfer::{transfer_disk, transfer_track, DeviceReadingPolicy, RetryPolicy};
pub use crate::types::chs::{CylHead, Header};
pub use crate::types::enums::{DataRate, Encoding, TransferMode};
pub use crate::types::range::Range;
