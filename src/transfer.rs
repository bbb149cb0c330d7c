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

    src/transfer.rs

    The engine that copies, merges or repairs one track from a source disk to
    a destination disk, and the whole-disk loop above it.
*/

use crate::disk::{Disk, DiskBackend};
use crate::messages::{message, MessageKind};
use crate::normalise::{normalise_bitstream, normalise_track, repair_track, NormaliseContext};
use crate::opts::CoreOptions;
use crate::track::{SectorSet, Track};
use crate::trackdata::TrackData;
use crate::types::chs::CylHead;
use crate::types::enums::TransferMode;
use crate::DiskError;
use std::collections::BTreeSet;
use std::fmt::Display;

/// A retry budget: how many more attempts to make, optionally measured since
/// the last attempt that changed anything.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RetryPolicy {
    pub retry_times: i32,
    pub since_last_change: bool,
}

impl RetryPolicy {
    pub fn new(retry_times: i32, since_last_change: bool) -> Self {
        Self {
            retry_times,
            since_last_change,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_times <= 0
    }

    pub fn consume(&mut self, amount: i32) {
        self.retry_times -= amount;
    }

    /// An attempt changed something; a since-last-change budget starts over.
    pub fn on_change(&mut self, initial: RetryPolicy) {
        if self.since_last_change && initial.retry_times > self.retry_times {
            self.retry_times = initial.retry_times;
        }
    }
}

impl Ord for RetryPolicy {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.retry_times
            .cmp(&other.retry_times)
            .then(self.since_last_change.cmp(&other.since_last_change))
    }
}

impl PartialOrd for RetryPolicy {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.retry_times)?;
        if self.since_last_change {
            write!(f, " (since last change)")?;
        }
        Ok(())
    }
}

/// What a device read should aim for: the sector ids still wanted, and the
/// sectors already good enough to skip.
#[derive(Clone, Debug)]
pub struct DeviceReadingPolicy {
    wanted: Option<std::ops::Range<u8>>,
    skippable: SectorSet,
    /// Lazily derived "wanted minus skippable" set.
    unskippable_wanted: Option<BTreeSet<u8>>,
    look_for_possible: bool,
}

impl Default for DeviceReadingPolicy {
    fn default() -> Self {
        Self {
            wanted: None,
            skippable: SectorSet::default(),
            unskippable_wanted: None,
            look_for_possible: true,
        }
    }
}

impl DeviceReadingPolicy {
    pub fn with_wanted(wanted: std::ops::Range<u8>, look_for_possible: bool) -> Self {
        Self {
            wanted: Some(wanted),
            look_for_possible,
            ..Self::default()
        }
    }

    pub fn wanted(&self) -> Option<&std::ops::Range<u8>> {
        self.wanted.as_ref()
    }

    pub fn set_wanted(&mut self, wanted: std::ops::Range<u8>) {
        self.wanted = Some(wanted);
        self.unskippable_wanted = None;
    }

    pub fn skippable(&self) -> &SectorSet {
        &self.skippable
    }

    pub fn set_skippable(&mut self, skippable: SectorSet) {
        self.skippable = skippable;
        self.unskippable_wanted = None;
    }

    pub fn add_skippable_sectors(&mut self, more: SectorSet) {
        self.skippable.extend(more);
        self.unskippable_wanted = None;
    }

    pub fn look_for_possible_sectors(&self) -> bool {
        self.look_for_possible
    }

    pub fn set_look_for_possible_sectors(&mut self, value: bool) {
        self.look_for_possible = value;
    }

    /// The wanted ids not covered by a skippable sector.
    pub fn unskippable_wanted(&mut self) -> &BTreeSet<u8> {
        if self.unskippable_wanted.is_none() {
            let set = match &self.wanted {
                Some(range) => self.skippable.not_containing_ids(range.clone()),
                None => BTreeSet::new(),
            };
            self.unskippable_wanted = Some(set);
        }
        self.unskippable_wanted.as_ref().expect("cache filled")
    }

    /// Whether another read could still contribute anything.
    pub fn wants_more_sectors(&mut self) -> bool {
        if self.look_for_possible {
            return true;
        }
        match &self.wanted {
            None => false,
            Some(_) => !self.unskippable_wanted().is_empty(),
        }
    }
}

/// The cylinder to seek to before a retried read: alternate around the
/// target to exercise the stepper and reposition the head.
pub fn head_seek_for_retry(cylhead: CylHead, track_round: u32, src_cyls: u16) -> Option<u16> {
    if track_round == 0 {
        return None;
    }
    let delta: i32 = if track_round % 2 == 1 { 1 } else { -1 };
    let limit = src_cyls.max(1) as i32 - 1;
    Some((cylhead.cyl as i32 + delta).clamp(0, limit) as u16)
}

/// Transfer one track from `src` to `dst` in the given mode. Returns the
/// number of repair improvements made.
pub fn transfer_track(
    src: &mut dyn DiskBackend,
    cylhead: CylHead,
    dst: &mut Disk,
    mode: TransferMode,
    uncached: bool,
    policy: &mut DeviceReadingPolicy,
    opts: &CoreOptions,
    used_tracks: Option<&BTreeSet<CylHead>>,
    ctx: &mut NormaliseContext,
) -> Result<usize, DiskError> {
    // In minimal reading mode, skip unused tracks.
    if opts.minimal {
        if let Some(used) = used_tracks {
            if !used.contains(&cylhead) {
                return Ok(0);
            }
        }
    }

    let src_constant = src.is_constant_disk();
    let skip_stable = mode == TransferMode::Repair && !src_constant && opts.skip_stable_sectors;
    // Retrying only pays off when repairing a non-constant source.
    let track_retries = if mode == TransferMode::Repair && !src_constant {
        opts.track_retries
    }
    else {
        crate::opts::RetryMode::Off
    };

    let mut total_changed = 0usize;
    for track_round in 0..=track_retries.rounds() {
        let mut dst_track = Track::new();
        if mode == TransferMode::Repair {
            // Read the target early so its stable sectors can be skipped.
            dst_track = dst.read_track(cylhead)?;
            normalise_track(cylhead, &mut dst_track, opts, ctx);

            if skip_stable {
                policy.set_skippable(dst_track.stable_sectors());
                // With no appetite for unknown sectors and every wanted id
                // already stable, the track needs nothing.
                if !policy.look_for_possible_sectors()
                    && policy.wanted().is_some()
                    && policy.unskippable_wanted().is_empty()
                {
                    return Ok(total_changed);
                }
                if !policy.skippable().is_empty() {
                    message(
                        MessageKind::Info,
                        format!(
                            "ignoring already good sectors on {}: {}",
                            cylhead,
                            policy.skippable().ids_string()
                        ),
                    );
                }
            }
        }

        let with_head_seek_to = head_seek_for_retry(cylhead, track_round, src.cyls());
        let mut src_data = src.read(
            cylhead.stepped(opts.step),
            !src_constant || uncached,
            with_head_seek_to,
            policy,
        )?;
        // Strict mode reconciles sector headers with the physical position
        // before anything else looks at them.
        if opts.normal_disk {
            src_data.force_cylheads(src.cyls())?;
        }
        let mut src_track = src_data.track_cloned()?;

        // A modified bitstream invalidates the decoded track.
        if src_data.has_bitstream() {
            let mut bitstream = src_data.bitstream_cloned()?;
            if normalise_bitstream(&mut bitstream, opts) {
                src_data = TrackData::from_bitstream(src_data.cylhead, bitstream);
                src_track = src_data.track_cloned()?;
            }
        }

        let changed = normalise_track(cylhead, &mut src_track, opts, ctx);

        // Strict mode rejects structural oddities a protected disk is
        // allowed: misread neighbour-cylinder sectors are dropped, and
        // repeated ids or overlaps fail validation.
        if opts.normal_disk {
            src_track.drop_sectors_from_neighbor_cyls(cylhead, src.cyls());
            src_track.validate(
                &crate::track::RepeatedSectors::default(),
                opts.byte_tolerance_of_time,
            )?;
        }

        if mode == TransferMode::Repair {
            let amount = repair_track(cylhead, &mut dst_track, &src_track, policy.skippable(), opts)?;
            dst.write_track(cylhead, dst_track);
            // An automatic retry budget stops once repairing stops helping.
            if track_retries.is_auto() && amount == 0 {
                break;
            }
            total_changed += amount;
        }
        else {
            if mode == TransferMode::Merge && dst.track_exists(cylhead) {
                let mut merged = dst.read_track(cylhead)?;
                merged.add_track(src_track, &opts.into())?;
                dst.write_track(cylhead, merged);
            }
            else if changed {
                // The modified track becomes the only representation.
                dst.write_track(cylhead, src_track);
            }
            else {
                // Preserve the source layers, reduced to the preferred
                // representation (unnormalised flux is dropped).
                let mut reduced = src_data.preferred(opts.prefer)?;
                reduced.cylhead = cylhead;
                dst.write_trackdata(reduced);
            }
        }
    }

    Ok(total_changed)
}

/// Transfer a whole disk, optionally retrying it and switching from Copy to
/// Repair after the first full pass.
pub fn transfer_disk(
    src: &mut dyn DiskBackend,
    dst: &mut Disk,
    opts: &CoreOptions,
    used_tracks: Option<&BTreeSet<CylHead>>,
) -> Result<usize, DiskError> {
    let mut opts = opts.clone();

    // Retrying a constant source or a merge target wastes time.
    let disk_retries = if !opts.merge && !src.is_constant_disk() {
        opts.disk_retries
    }
    else {
        crate::opts::RetryMode::Off
    };

    let range = if opts.range.is_empty() {
        src.range()
    }
    else {
        opts.range
    };

    let mut cylheads = Vec::new();
    range.each(|ch| cylheads.push(ch), opts.cyls_first);

    let mut ctx = NormaliseContext::new();
    let mut total_changed = 0usize;
    for _disk_round in 0..=disk_retries.rounds() {
        let mode = if opts.repair {
            TransferMode::Repair
        }
        else if opts.merge {
            TransferMode::Merge
        }
        else {
            TransferMode::Copy
        };

        let mut round_changed = 0usize;
        for &cylhead in &cylheads {
            let mut policy = DeviceReadingPolicy::default();
            round_changed += transfer_track(
                src,
                cylhead,
                dst,
                mode,
                false,
                &mut policy,
                &opts,
                used_tracks,
                &mut ctx,
            )?;
        }

        // Copy any metadata not already present in the target.
        for (key, value) in src.metadata() {
            dst.metadata.entry(key).or_insert(value);
        }

        total_changed += round_changed;
        if opts.repair && disk_retries.is_auto() && round_changed == 0 {
            break;
        }
        // Later rounds refine rather than overwrite.
        if !opts.merge && !opts.repair {
            opts.repair = true;
        }
    }
    Ok(total_changed)
}
