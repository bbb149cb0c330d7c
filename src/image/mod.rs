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

    src/image/mod.rs

    Image codec dispatch. Codecs are keyed by file extension; a reader fully
    populates the disk and tags its type before returning.
*/

pub mod edsk;
pub mod raw;

use crate::disk::Disk;
use crate::file_system::detect_file_system;
use crate::opts::CoreOptions;
use crate::DiskError;

/// Placed at the start of sectors a regular view cannot provide.
pub const MISSING_SECTOR_SIGN: &[u8] = b"[MISSING SECTOR]";
/// Placed at the end of sectors whose data never read cleanly.
pub const BAD_SECTOR_SIGN: &[u8] = b"[BAD SECTOR]";

type ReadFn = fn(&[u8], &CoreOptions) -> Result<Disk, DiskError>;
type WriteFn = fn(&Disk, &CoreOptions) -> Result<Vec<u8>, DiskError>;

pub struct ImageCodec {
    pub name: &'static str,
    pub extensions: &'static [&'static str],
    pub read: ReadFn,
    pub write: Option<WriteFn>,
}

/// The codec table, probed in order when the extension doesn't decide.
pub const CODECS: &[ImageCodec] = &[
    ImageCodec {
        name: "EDSK",
        extensions: &["dsk", "edsk"],
        read: edsk::read_edsk,
        write: Some(edsk::write_edsk),
    },
    ImageCodec {
        name: "RDSK",
        extensions: &["rdsk"],
        read: edsk::read_rdsk,
        write: Some(edsk::write_rdsk),
    },
    ImageCodec {
        name: "RAW",
        extensions: &["raw", "img", "st", "ima"],
        read: raw::read_raw,
        write: Some(raw::write_raw),
    },
];

fn extension_of(name: &str) -> String {
    name.rsplit('.').next().unwrap_or("").to_ascii_lowercase()
}

pub fn codec_for_extension(name: &str) -> Option<&'static ImageCodec> {
    let ext = extension_of(name);
    CODECS
        .iter()
        .find(|codec| codec.extensions.contains(&ext.as_str()))
}

/// Parse image bytes, trying the extension's codec first and the rest in
/// registration order. The returned disk carries its type tag and any
/// detected file system.
pub fn read_image(name: &str, bytes: &[u8], opts: &CoreOptions) -> Result<Disk, DiskError> {
    let preferred = codec_for_extension(name);
    let ordered = preferred
        .into_iter()
        .chain(CODECS.iter().filter(|c| {
            preferred.map_or(true, |p| !std::ptr::eq(*c, p))
        }));

    for codec in ordered {
        match (codec.read)(bytes, opts) {
            Ok(mut disk) => {
                if disk.file_system.is_none() {
                    let fs = detect_file_system(&disk);
                    disk.file_system = fs;
                }
                return Ok(disk);
            }
            Err(DiskError::UnknownFormat) => continue,
            Err(err) => return Err(err),
        }
    }
    Err(DiskError::UnknownFormat)
}

/// Serialise a disk with the codec matching the target extension.
pub fn write_image(name: &str, disk: &Disk, opts: &CoreOptions) -> Result<Vec<u8>, DiskError> {
    let codec = codec_for_extension(name).ok_or(DiskError::UnknownFormat)?;
    let write = codec.write.ok_or(DiskError::UnsupportedFormat)?;
    write(disk, opts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_pick_codecs() {
        assert_eq!(codec_for_extension("game.dsk").unwrap().name, "EDSK");
        assert_eq!(codec_for_extension("dump.RDSK").unwrap().name, "RDSK");
        assert_eq!(codec_for_extension("boot.img").unwrap().name, "RAW");
        assert!(codec_for_extension("file.xyz").is_none());
    }
}
