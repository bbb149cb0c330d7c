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

    src/image/raw.rs

    Raw sector images: geometry guessed from the file size on input, and the
    regularised file-system view on output.
*/

use crate::disk::Disk;
use crate::format::Format;
use crate::image::{BAD_SECTOR_SIGN, MISSING_SECTOR_SIGN};
use crate::messages::{message, message_always, MessageKind};
use crate::opts::CoreOptions;
use crate::types::chs::Header;
use crate::DiskError;

/// Interpret a sized file as a regular disk image.
pub fn read_raw(bytes: &[u8], opts: &CoreOptions) -> Result<Disk, DiskError> {
    let Some(mut fmt) = Format::from_size(bytes.len() as u64) else {
        return Err(DiskError::UnknownFormat);
    };
    fmt.apply_overrides(opts);

    let mut disk = Disk::new();
    disk.format_disk(&fmt, bytes)?;
    disk.set_str_type("RAW");
    Ok(disk)
}

/// Write the regularised view of a disk: every sector of the format, in
/// logical order, best copy first. Missing and bad sectors are signed so a
/// later repair pass can find them.
pub fn write_regular_disk(disk: &Disk, fmt: &Format) -> Result<Vec<u8>, DiskError> {
    fmt.validate()?;
    let sector_size = fmt.sector_size();

    let mut inexistent = 0usize;
    let mut missing = 0usize;
    let mut bad = 0usize;
    let mut unstable = 0usize;
    let mut multigood = 0usize;

    let mut cylheads = Vec::new();
    fmt.range().each(|ch| cylheads.push(ch), fmt.cyls_first);

    let mut out = Vec::with_capacity(fmt.disk_size());
    for cylhead in cylheads {
        let track = disk.read_track(cylhead)?;
        for id in fmt.base..fmt.base + fmt.sectors {
            let header = Header::new(cylhead.cyl, fmt.head_id(cylhead.head), id, fmt.size);
            let mut buf = vec![fmt.fill; sector_size];

            let found = track.find_ignoring_size(&header);
            match found {
                Some(sector) if sector.has_data() => {
                    let data = sector.data_best_copy().expect("has data");
                    let common = data.len().min(buf.len());
                    buf[..common].copy_from_slice(&data[..common]);
                    if !sector.has_good_data() {
                        bad += 1;
                        // Sign the end of the sector: the start is usually
                        // the readable part.
                        let at = buf.len().saturating_sub(BAD_SECTOR_SIGN.len());
                        buf[at..].copy_from_slice(BAD_SECTOR_SIGN);
                        message_always(MessageKind::Warning, format!("bad sector ({})", header));
                    }
                    else {
                        if !sector.has_stable_data() {
                            unstable += 1;
                            message_always(
                                MessageKind::Warning,
                                format!("unstable sector ({})", header),
                            );
                        }
                        if sector.copies() > 1 {
                            multigood += 1;
                            message_always(
                                MessageKind::Warning,
                                format!("multiple good copies of sector ({})", header),
                            );
                        }
                    }
                }
                other => {
                    buf[..MISSING_SECTOR_SIGN.len()].copy_from_slice(MISSING_SECTOR_SIGN);
                    if other.is_none() {
                        inexistent += 1;
                    }
                    else {
                        missing += 1;
                    }
                    message_always(
                        MessageKind::Warning,
                        format!(
                            "{} sector ({})",
                            if other.is_none() { "inexistent" } else { "missing" },
                            header
                        ),
                    );
                }
            }
            out.extend(buf);
        }
    }

    if inexistent + missing + bad + unstable + multigood > 0 {
        message(
            MessageKind::Warning,
            format!(
                "detected {} inexistent, {} missing, {} bad, {} unstable, {} multigood sectors \
                 of source by {}/{}/{}/{} regular format",
                inexistent,
                missing,
                bad,
                unstable,
                multigood,
                fmt.cyls,
                fmt.heads,
                fmt.sectors,
                sector_size
            ),
        );
    }

    Ok(out)
}

/// Write a raw image using the disk's own format hint (or one matched from
/// its geometry).
pub fn write_raw(disk: &Disk, _opts: &CoreOptions) -> Result<Vec<u8>, DiskError> {
    let fmt = if !disk.fmt.is_none() {
        disk.fmt.clone()
    }
    else if let Some(fs) = &disk.file_system {
        fs.format().clone()
    }
    else {
        return Err(DiskError::UnsuitableTarget);
    };
    write_regular_disk(disk, &fmt)
}
