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

    src/normalise.rs

    Track normalisation and repair: duplicate removal, gap cleaning, option
    overrides, known-protection fixups, 8K checksum tracking, and the merge
    of one track observation into another.
*/

use crate::bitstream::BitBuffer;
use crate::messages::{message, message_always, MessageKind};
use crate::opts::CoreOptions;
use crate::protection::{
    is_cpc_speedlock_track, is_opera_soft_track, is_prehistorik_track, is_rainbow_arts_track,
    is_spectrum_speedlock_track, ProtectionScheme, WeakRegion,
};
use crate::sector::MergeResult;
use crate::track::{SectorSet, Track};
use crate::types::chs::CylHead;
use crate::types::enums::{DataRate, Encoding, FixMode, GapsPolicy};
use crate::util::crc16;
use crate::DiskError;
use std::collections::{BTreeMap, BTreeSet};
use strum::Display;

/// The checksum methods observed at offset 0x1800 of protected 8K sectors.
#[derive(Copy, Clone, Debug, Display, Eq, Ord, PartialEq, PartialOrd)]
pub enum ChecksumType {
    /// No checksum, known valid.
    None,
    /// The fixed 8C 15 marker found on some disks.
    #[strum(to_string = "Constant_8C15")]
    Constant8C15,
    /// Sum of the first 0x1800 bytes.
    #[strum(to_string = "Sum")]
    Sum1800,
    /// XOR of the first 0x1800 bytes.
    #[strum(to_string = "XOR")]
    Xor1800,
    /// XOR of the first 0x18A0 bytes.
    #[strum(to_string = "XOR_18A0")]
    Xor18A0,
    /// CRC-16 (init D2F6) over 0x1800 bytes.
    #[strum(to_string = "CRC_D2F6")]
    CrcD2F61800,
    /// CRC-16 (init D2F6) over 0x1802 bytes.
    #[strum(to_string = "CRC_D2F6_1802")]
    CrcD2F61802,
}

pub fn checksum_length(method: ChecksumType) -> usize {
    match method {
        ChecksumType::None => 0,
        ChecksumType::Sum1800 | ChecksumType::Xor1800 | ChecksumType::Xor18A0 => 1,
        ChecksumType::Constant8C15 | ChecksumType::CrcD2F61800 | ChecksumType::CrcD2F61802 => 2,
    }
}

/// Determine the potential 8K checksum methods for a data block, if any.
pub fn checksum_methods(data: &[u8]) -> BTreeSet<ChecksumType> {
    let mut methods = BTreeSet::new();
    let len = data.len();

    // With no data beyond the 6K payload there can be no checksum.
    if len <= 0x1800 {
        return methods;
    }

    // 2-byte checksums.
    if len >= 0x1803 && data[0x1800] == 0x8C && data[0x1801] == 0x15 {
        methods.insert(ChecksumType::Constant8C15);
    }
    if len >= 0x1802 && crc16(&data[..0x1802], 0xD2F6) == 0 {
        methods.insert(ChecksumType::CrcD2F61800);
    }
    if len >= 0x1804 && crc16(&data[..0x1804], 0xD2F6) == 0 {
        methods.insert(ChecksumType::CrcD2F61802);
    }

    // 1-byte checksums over the first 6K.
    let sum = data[..0x1800]
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    if data[0x1800] == sum {
        methods.insert(ChecksumType::Sum1800);
    }
    let mut xor = data[..0x1800].iter().fold(0u8, |acc, &b| acc ^ b);
    if data[0x1800] == xor {
        methods.insert(ChecksumType::Xor1800);
    }
    if len > 0x18A0 {
        xor = data[0x1800..0x18A0].iter().fold(xor, |acc, &b| acc ^ b);
        if data[0x18A0] == xor {
            methods.insert(ChecksumType::Xor18A0);
        }
    }

    // 6K of filler on an unused track needs no checksum at all.
    if methods.is_empty() && data[..0x1800].windows(2).all(|w| w[0] == w[1]) {
        methods.insert(ChecksumType::None);
    }

    methods
}

fn checksum_set_name(methods: &BTreeSet<ChecksumType>) -> String {
    methods
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join("|")
}

/// Per-run normalisation state. The 8K checksum memo lives here so two disks
/// processed back to back cannot cross-contaminate each other's methods.
#[derive(Debug, Default)]
pub struct NormaliseContext {
    /// Checksum methods per (sector id, DAM); a disk can change method when
    /// the id or mark type changes.
    methods_8k: BTreeMap<(u8, u8), BTreeSet<ChecksumType>>,
}

impl NormaliseContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Apply the configured normalisation policies to a freshly read track.
/// Returns whether any bytes changed.
pub fn normalise_track(
    cylhead: CylHead,
    track: &mut Track,
    opts: &CoreOptions,
    ctx: &mut NormaliseContext,
) -> bool {
    let mut changed = false;

    // Clear the track length if offsets are disabled (cosmetic).
    if !opts.offsets {
        track.tracklen = 0;
    }

    // Pass 1: per-sector data policies.
    let mut i = 0;
    while i < track.len() {
        if opts.nodups {
            // Remove duplicates found later on the track.
            let header = track.sector(i).header;
            let encoding = track.sector(i).encoding;
            let mut j = i + 1;
            while j < track.len() {
                let other = track.sector(j);
                if other.header == header && other.encoding == encoding {
                    track.remove(j);
                    changed = true;
                }
                else {
                    j += 1;
                }
            }
        }

        let sector = track.sector_mut(i);

        // Clear all data, for privacy during diagnostics?
        if opts.nodata && sector.has_data() {
            let bad = sector.has_baddatacrc();
            sector.replace_data(Vec::new(), bad);
            changed = true;
        }

        if !opts.offsets {
            sector.raw_offset = 0;
        }

        if sector.has_gapdata() {
            // Remove gap data if disabled, or the gap mask doesn't allow it.
            let mask_allows = i < 32 && (opts.gapmask & (1u32 << i)) != 0;
            if opts.gaps == GapsPolicy::None || !mask_allows {
                sector.remove_gapdata();
                changed = true;
            }
            // Remove normal gaps unless we're asked to keep them.
            else if opts.gaps == GapsPolicy::Clean && sector.encoding == Encoding::Mfm {
                let size = sector.size();
                let found = sector
                    .data_best_copy()
                    .and_then(|data| test_remove_gap3(data, size, opts.maxsplice));
                if let Some(gap3) = found {
                    sector.remove_gapdata();
                    changed = true;
                    if sector.gap3 == 0 {
                        sector.gap3 = gap3;
                    }
                }
            }
        }
        i += 1;
    }

    // Pass 2: per-sector overrides.
    let last = track.len().saturating_sub(1);
    for (i, sector) in track.sectors_mut().iter_mut().enumerate() {
        // Remove only the final gap if gap4b output is disabled.
        if i == last && !opts.gap4b && sector.has_gapdata() {
            let size = sector.size();
            let removable = sector
                .data_best_copy()
                .is_some_and(|data| test_remove_gap4b(data, size, opts.maxsplice));
            if removable {
                sector.remove_gapdata();
                changed = true;
            }
        }

        if opts.datarate != DataRate::Unknown {
            sector.datarate = opts.datarate;
            changed = true;
        }
        if opts.encoding != Encoding::Unknown {
            sector.encoding = opts.encoding;
            changed = true;
        }
        if opts.gap3 >= 0 {
            sector.gap3 = opts.gap3 as u8;
        }
    }

    changed |= apply_protection_fixes(cylhead, track, opts);
    check_8k_methods(cylhead, track, opts, ctx);

    changed
}

/// Add a second data copy whose bytes invert from the weak offset onward,
/// matching the typical weak sector of a protection.
fn add_weak_copy(track: &mut Track, index: usize, region: WeakRegion) {
    let sector = track.sector_mut(index);
    let Some(data) = sector.data_best_copy() else {
        return;
    };
    let mut copy = data.clone();
    for byte in copy.iter_mut().skip(region.offset) {
        *byte = !*byte;
    }
    let dam = sector.dam;
    sector.add(copy, true, dam);
}

fn apply_protection_fixes(cylhead: CylHead, track: &mut Track, opts: &CoreOptions) -> bool {
    let mut changed = false;

    // Check for Speedlock weak sector (either +3 or CPC).
    if cylhead.cyl == 0 && track.len() == 9 {
        if track.sector(1).copies() == 1 {
            if let Some(region) = is_spectrum_speedlock_track(track) {
                if opts.fix == FixMode::Apply {
                    add_weak_copy(track, 1, region);
                    message(
                        MessageKind::Fix,
                        format!(
                            "added suitable second copy of {} weak sector",
                            ProtectionScheme::SpeedlockPlus3
                        ),
                    );
                    changed = true;
                }
                else {
                    message(
                        MessageKind::Warning,
                        format!(
                            "missing multiple copies of {} weak sector",
                            ProtectionScheme::SpeedlockPlus3
                        ),
                    );
                }
            }
        }

        if track.sector(7).copies() == 1 {
            if let Some(region) = is_cpc_speedlock_track(track) {
                if opts.fix == FixMode::Apply {
                    add_weak_copy(track, 7, region);
                    message(
                        MessageKind::Fix,
                        format!(
                            "added suitable second copy of {} weak sector",
                            ProtectionScheme::SpeedlockCpc
                        ),
                    );
                    changed = true;
                }
                else {
                    message(
                        MessageKind::Warning,
                        format!(
                            "missing multiple copies of {} weak sector",
                            ProtectionScheme::SpeedlockCpc
                        ),
                    );
                }
            }
        }
    }

    // Check for Rainbow Arts weak sector missing copies.
    if cylhead.cyl == 40 && track.len() == 9 && track.sector(1).copies() == 1 {
        if let Some(region) = is_rainbow_arts_track(track) {
            if opts.fix == FixMode::Apply {
                // The weak sector must carry a data CRC error; broken dumps
                // omit it.
                if !track.sector(1).has_baddatacrc() {
                    track.sector_mut(1).set_baddatacrc();
                }
                add_weak_copy(track, 1, region);
                message(
                    MessageKind::Fix,
                    format!(
                        "added suitable second copy of {} weak sector",
                        ProtectionScheme::RainbowArts
                    ),
                );
                changed = true;
            }
            else {
                message(
                    MessageKind::Warning,
                    format!(
                        "missing multiple copies of {} weak sector",
                        ProtectionScheme::RainbowArts
                    ),
                );
            }
        }
    }

    // Check for a missing OperaSoft 32K sector (CPDRead dumps).
    if cylhead.cyl == 40
        && track.len() == 9
        && track.sector(7).has_data()
        && track.sector(8).data_size() == 0
        && is_opera_soft_track(track)
    {
        if opts.fix == FixMode::Apply {
            let data7 = track
                .sector(7)
                .data_best_copy()
                .cloned()
                .unwrap_or_default();

            // 0x55 filler with a correct CRC for the first 256 bytes.
            let mut data8 = vec![0x55u8; 256];
            data8.push(0xE8);
            data8.push(0x9F);
            // Fill up to the protection check with gap filler.
            data8.resize(0x512, 0x4E);
            // Sector 7's data appears at 0x512 to pass the protection check.
            data8.extend_from_slice(&data7);

            track.sector_mut(8).replace_data(data8, true);
            message(
                MessageKind::Fix,
                format!(
                    "added missing data to {} sector",
                    ProtectionScheme::OperaSoft32K
                ),
            );
            changed = true;
        }
        else {
            message(
                MessageKind::Warning,
                format!("missing data in {} sector", ProtectionScheme::OperaSoft32K),
            );
        }
    }

    // Check for a Prehistorik track followed by unused KBI-19 sectors.
    if track.len() == 13 && is_prehistorik_track(track) {
        if opts.fix == FixMode::Apply {
            while track.len() > 7 {
                track.remove(7);
            }
            message(
                MessageKind::Fix,
                format!(
                    "removed unused KBI-19 sectors from end of {} track",
                    ProtectionScheme::Prehistorik
                ),
            );
            changed = true;
        }
        else {
            message(
                MessageKind::Warning,
                "6 junk KBI-19 sectors found (enable fixes to remove)",
            );
        }
    }

    // Check for the problematic Reussir protection (CPC).
    if track.len() == 10 {
        const PROT_CHECK: [u8; 5] = [0xDD, 0x7E, 0x00, 0xBE, 0x20]; // LD A,(IX+0); CP (HL); JR NZ,e
        for index in 0..track.len() {
            let sector = track.sector(index);
            if sector.size() != 512 || !sector.has_good_data() {
                continue;
            }
            let Some(data) = sector.data_best_copy() else {
                continue;
            };
            if data.len() < 6 || &data[..6] != b"\0LANCE" {
                continue;
            }
            if let Some(pos) = data.windows(PROT_CHECK.len()).position(|w| w == PROT_CHECK) {
                if opts.fix == FixMode::Apply {
                    let mut patched = data.clone();
                    patched[pos + 3] = 0xAF; // XOR A
                    track.sector_mut(index).replace_data(patched, false);
                    message(
                        MessageKind::Fix,
                        format!("disabled problematic {} protection", ProtectionScheme::Reussir),
                    );
                    changed = true;
                }
                else {
                    message(
                        MessageKind::Warning,
                        format!(
                            "detected problematic {} protection (enable fixes to disable)",
                            ProtectionScheme::Reussir
                        ),
                    );
                }
                break;
            }
        }
    }

    changed
}

/// Track which 8K checksum method the disk uses, and warn when a sector
/// deviates from it.
fn check_8k_methods(
    cylhead: CylHead,
    track: &Track,
    opts: &CoreOptions,
    ctx: &mut NormaliseContext,
) {
    if !opts.check8k
        || !track.is_8k_sector()
        || track.sector(0).copies() != 1
        || track.sector(0).data_size() < 0x1801
    {
        return;
    }
    let sector = track.sector(0);
    let data = sector.data_best_copy().expect("single copy present");

    // The checksum method can change within a disk, but usually corresponds
    // to a change in sector id or DAM type.
    let key = (sector.header.sector, sector.dam);
    let sector_methods = checksum_methods(data);
    let disk_methods = ctx.methods_8k.entry(key).or_insert_with(|| {
        if sector_methods.is_empty() {
            BTreeSet::from([ChecksumType::None])
        }
        else {
            sector_methods.clone()
        }
    });

    let common: BTreeSet<ChecksumType> = sector_methods
        .intersection(disk_methods)
        .copied()
        .collect();

    if sector_methods.contains(&ChecksumType::None) {
        // If None is an option, there's no checksum.
    }
    else if common.len() == 1 {
        // A single match means a good sector, so have the disk follow it.
        if disk_methods.len() > 1 {
            *disk_methods = common.clone();
        }
    }
    else if sector_methods.is_empty() {
        // Unrecognised method; two matching bytes or a single zero are
        // likely junk rather than a checksum.
        if data.len() >= 0x1802 && data[0x1800] != data[0x1801] {
            message(
                MessageKind::Warning,
                format!(
                    "unknown or invalid 6K checksum [{:02X} {:02X}] on {}",
                    data[0x1800], data[0x1801], cylhead
                ),
            );
        }
        else if data[0x1800] != 0 {
            message(
                MessageKind::Warning,
                format!(
                    "unknown or invalid 6K checksum [{:02X}] on {}",
                    data[0x1800], cylhead
                ),
            );
        }
    }
    else if disk_methods.len() == 1
        && common.is_empty()
        && !disk_methods.contains(&ChecksumType::None)
    {
        // The disk has a method, which the sector lacks. Probably bad.
        let method = *disk_methods.iter().next().expect("one method");
        if checksum_length(method) == 1 || data.len() < 0x1802 {
            message(
                MessageKind::Warning,
                format!(
                    "invalid {} checksum [{:02X}] on {}",
                    checksum_set_name(disk_methods),
                    data[0x1800],
                    cylhead
                ),
            );
        }
        else {
            message(
                MessageKind::Warning,
                format!(
                    "invalid {} checksum [{:02X} {:02X}] on {}",
                    checksum_set_name(disk_methods),
                    data[0x1800],
                    data[0x1801],
                    cylhead
                ),
            );
        }
    }
}

/// Normalise a raw bitstream before scanning it. Returns whether it changed.
pub fn normalise_bitstream(bitbuf: &mut BitBuffer, opts: &CoreOptions) -> bool {
    let mut modified = false;
    if opts.align {
        modified |= bitbuf.align();
    }
    modified
}

/// Attempt to repair a track, given another observation of the same track.
/// Matching ignores offsets. Returns the number of improvements made; the
/// set of good sectors never shrinks.
pub fn repair_track(
    cylhead: CylHead,
    track: &mut Track,
    src_track: &Track,
    ignored: &SectorSet,
    opts: &CoreOptions,
) -> Result<usize, DiskError> {
    let _ = cylhead;
    let mut changed = 0usize;
    track.tracklen = track.tracklen.max(src_track.tracklen);
    track.tracktime = track.tracktime.max(src_track.tracktime);

    for (src_index, src_sector) in src_track.sectors().iter().enumerate() {
        // Ignored sectors are already good at the destination.
        if ignored.contains(src_sector, src_track.tracklen, true) {
            continue;
        }
        // Repeated source sectors are ambiguous as a data source.
        if src_track.is_repeated(src_sector) {
            continue;
        }

        let mut src_copy = src_sector.clone();
        // 250Kbps/300Kbps are interchangeable due to 300rpm/360rpm drives.
        if let Some(rate) = track.data_rate() {
            src_copy.normalise_datarate(rate);
        }

        if let Some(index) =
            track.find_with_rate_encoding(&src_copy.header, src_copy.datarate, src_copy.encoding)
        {
            // Repeated target sectors are ambiguous as a repair target.
            if track.is_repeated(track.sector(index)) {
                continue;
            }
            let had_data = track.sector(index).has_data();
            let had_good = track.sector(index).has_good_data();
            let status = track
                .sector_mut(index)
                .merge(src_copy, opts.maxcopies, opts.paranoia);
            if status != MergeResult::Unchanged
                && status != MergeResult::NewDataOverLimit
                && (opts.paranoia || status != MergeResult::Matched)
            {
                let target = track.sector(index);
                if target.has_good_data() {
                    changed += 1;
                    if had_good {
                        message_always(
                            MessageKind::Fix,
                            format!("improved good {}", target),
                        );
                    }
                    else {
                        message_always(
                            MessageKind::Fix,
                            format!(
                                "repaired {} {}",
                                if had_data { "bad" } else { "missing" },
                                target
                            ),
                        );
                    }
                }
                else {
                    message_always(MessageKind::Info, format!("matched bad {}", target));
                }
            }
        }
        else {
            // Default to adding at the end of the track.
            let mut insert_idx = track.len();
            if !track.is_empty() {
                // The missing sector must appear before the first source
                // sector that follows it and exists on the target.
                for s in &src_track.sectors()[src_index + 1..] {
                    let mut found =
                        track.find_with_rate_encoding(&s.header, s.datarate, s.encoding);
                    if found.is_none()
                        && s.datarate != src_copy.datarate
                        && s.datarate.is_interchangeable_with(src_copy.datarate)
                    {
                        found =
                            track.find_with_rate_encoding(&s.header, src_copy.datarate, s.encoding);
                    }
                    if let Some(i) = found {
                        insert_idx = i;
                        break;
                    }
                }
                // Look for a more exact position when offsets are available.
                if src_copy.offset().is_some() {
                    while insert_idx > 0 {
                        insert_idx -= 1;
                        let prior = track.sector(insert_idx);
                        if prior.offset().is_none() || prior.raw_offset <= src_copy.raw_offset {
                            insert_idx += 1;
                            break;
                        }
                    }
                }
            }

            let details = if src_copy.has_data() {
                if src_copy.has_baddatacrc() {
                    "(bad CRC)"
                }
                else {
                    "(good CRC)"
                }
            }
            else {
                "(no data)"
            };
            message_always(
                MessageKind::Fix,
                format!("added missing {} {}", src_copy, details),
            );
            track.insert(insert_idx, src_copy)?;
            changed += 1;
        }
    }

    Ok(changed)
}

const DEFAULT_MAX_SPLICE: usize = 3;

fn max_splice_bytes(maxsplice: i32) -> usize {
    if maxsplice < 0 {
        DEFAULT_MAX_SPLICE
    }
    else {
        maxsplice as usize
    }
}

/// Run-length iterator over gap bytes.
fn gap_runs(tail: &[u8]) -> Vec<(usize, u8)> {
    let mut runs = Vec::new();
    let mut i = 0;
    while i < tail.len() {
        let byte = tail[i];
        let mut len = 1;
        while i + len < tail.len() && tail[i + len] == byte {
            len += 1;
        }
        runs.push((len, byte));
        i += len;
    }
    runs
}

/// Whether the bytes beyond the sector size are a clean gap3 tail: 0x4E
/// filler, optional sync zeroes, optionally up to the next address mark.
/// Returns the detected gap3 length.
pub fn test_remove_gap3(data: &[u8], size: usize, maxsplice: i32) -> Option<u8> {
    if data.len() <= size {
        return None;
    }
    let tail = &data[size..];
    let mut runs = gap_runs(tail).into_iter().peekable();
    let mut gap3 = 0u8;

    // A splice leaves a few bytes of rubbish before the filler settles.
    let mut splice = 0usize;
    while let Some(&(len, byte)) = runs.peek() {
        if byte == 0x4E || byte == 0x00 || byte == 0xA1 {
            break;
        }
        splice += len;
        if splice > max_splice_bytes(maxsplice) {
            return None;
        }
        runs.next();
    }

    for (len, byte) in runs {
        if byte == 0xA1 {
            // A full sync run means the next address mark follows; anything
            // after it belongs to that sector.
            if len == 3 {
                break;
            }
            return None;
        }
        if byte != 0x4E && byte != 0x00 {
            return None;
        }
        if byte == 0x4E && gap3 == 0 {
            gap3 = len.min(255) as u8;
        }
    }
    Some(gap3)
}

/// Whether the final sector's tail is removable gap4b: 0x4E and/or 0x00 runs
/// only.
pub fn test_remove_gap4b(data: &[u8], size: usize, maxsplice: i32) -> bool {
    if data.len() <= size {
        return false;
    }
    let tail = &data[size..];
    let mut splice = 0usize;
    let mut seen_filler = false;
    for (len, byte) in gap_runs(tail) {
        if byte == 0x4E || byte == 0x00 {
            seen_filler = true;
            continue;
        }
        if seen_filler {
            return false;
        }
        splice += len;
        if splice > max_splice_bytes(maxsplice) {
            return false;
        }
    }
    true
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
            let mut data = vec![0x17u8; 512];
            if i == 0 {
                data[304..313].copy_from_slice(b"SPEEDLOCK");
            }
            sector.add(data, i == 1, DAM_NORMAL);
            track.add(sector, &MergePolicy::default()).unwrap();
        }
        track
    }

    #[test]
    fn speedlock_fix_adds_inverted_copy() {
        crate::messages::drain();
        let mut track = speedlock_track();
        let opts = CoreOptions::default();
        let mut ctx = NormaliseContext::new();
        let changed = normalise_track(CylHead::new(0, 0), &mut track, &opts, &mut ctx);
        assert!(changed);

        let weak = track.sector(1);
        assert_eq!(weak.copies(), 2);
        assert!(weak.has_baddatacrc());
        let (first, second) = (weak.data_copy(0), weak.data_copy(1));
        assert_eq!(&first[..336], &second[..336]);
        for (a, b) in first[336..].iter().zip(second[336..].iter()) {
            assert_eq!(*a, !*b);
        }
    }

    #[test]
    fn speedlock_warn_leaves_single_copy() {
        crate::messages::drain();
        let mut track = speedlock_track();
        let opts = CoreOptions {
            fix: crate::types::enums::FixMode::Warn,
            ..CoreOptions::default()
        };
        let mut ctx = NormaliseContext::new();
        normalise_track(CylHead::new(0, 0), &mut track, &opts, &mut ctx);
        assert_eq!(track.sector(1).copies(), 1);
        let warnings = crate::messages::drain();
        assert_eq!(
            warnings
                .iter()
                .filter(|(_, text)| text.contains("Speedlock"))
                .count(),
            1
        );
    }

    #[test]
    fn nodups_removes_duplicate_chrn() {
        let mut track = Track::new();
        track.tracklen = 100_000;
        for offset in [1000u32, 51_000] {
            let mut sector = Sector::new(
                DataRate::Rate250K,
                Encoding::Mfm,
                Header::new(0, 0, 1, 2),
            );
            sector.raw_offset = offset;
            sector.add(vec![0u8; 512], false, DAM_NORMAL);
            track.add(sector, &MergePolicy::default()).unwrap();
        }
        let opts = CoreOptions {
            nodups: true,
            ..CoreOptions::default()
        };
        let mut ctx = NormaliseContext::new();
        assert!(normalise_track(CylHead::new(0, 0), &mut track, &opts, &mut ctx));
        assert_eq!(track.len(), 1);
    }

    #[test]
    fn gap3_tail_is_detected_and_removed() {
        let mut data = vec![0xABu8; 512];
        data.extend(std::iter::repeat(0x4E).take(22));
        data.extend(std::iter::repeat(0x00).take(12));
        assert_eq!(test_remove_gap3(&data, 512, -1), Some(22));

        // A tail containing other content must be kept.
        let mut dirty = vec![0xABu8; 512];
        dirty.extend(std::iter::repeat(0x4E).take(8));
        dirty.extend(std::iter::repeat(0xC9).take(16));
        assert_eq!(test_remove_gap3(&dirty, 512, -1), None);
    }

    #[test]
    fn checksum_methods_recognise_sum_and_xor() {
        let mut data = vec![3u8; 0x1800];
        let sum = data.iter().fold(0u8, |a, &b| a.wrapping_add(b));
        data.push(sum);
        let methods = checksum_methods(&data);
        assert!(methods.contains(&ChecksumType::Sum1800));

        let mut data = vec![0u8; 0x1800];
        data[0] = 0x55;
        let xor = data.iter().fold(0u8, |a, &b| a ^ b);
        data.push(xor);
        let methods = checksum_methods(&data);
        assert!(methods.contains(&ChecksumType::Xor1800));
    }

    #[test]
    fn repair_is_monotone_on_good_sectors() {
        let mut dst = speedlock_track();
        // Damage one destination sector and count good ones.
        dst.sector_mut(3).set_baddatacrc();
        let good_before = dst.good_sectors().len();

        let src = speedlock_track();
        let opts = CoreOptions::default();
        let changed = repair_track(
            CylHead::new(0, 0),
            &mut dst,
            &src,
            &SectorSet::default(),
            &opts,
        )
        .unwrap();
        assert!(changed > 0);
        assert!(dst.good_sectors().len() >= good_before);
        assert!(dst.sector(3).has_good_data());
    }

    #[test]
    fn repair_inserts_missing_sector_in_order() {
        let mut dst = speedlock_track();
        dst.remove(4); // drop sector id 5
        let src = speedlock_track();
        let opts = CoreOptions::default();
        repair_track(
            CylHead::new(0, 0),
            &mut dst,
            &src,
            &SectorSet::default(),
            &opts,
        )
        .unwrap();
        let ids: Vec<u8> = dst.sectors().iter().map(|s| s.header.sector).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }
}
