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

    src/opts.rs

    The engine option surface. A CLI front end builds one of these from argv
    and passes it by reference through the pipeline.
*/

use crate::transfer::RetryPolicy;
use crate::types::enums::{DataRate, Encoding, FixMode, GapsPolicy, PreferredData};
use crate::types::range::Range;

/// An iteration budget that can also run until an attempt stops improving.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum RetryMode {
    #[default]
    Off,
    Count(u32),
    /// Keep going while each round still improves the destination.
    Auto,
}

impl RetryMode {
    /// The number of extra rounds to attempt beyond the first.
    pub fn rounds(&self) -> u32 {
        match self {
            RetryMode::Off => 0,
            RetryMode::Count(n) => *n,
            // Bounded so a never-improving source cannot spin forever.
            RetryMode::Auto => 20,
        }
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, RetryMode::Auto)
    }
}

/// All engine options, with the historical defaults.
#[derive(Clone, Debug)]
pub struct CoreOptions {
    /// DemandDisk error-retry budget.
    pub retries: RetryPolicy,
    /// DemandDisk full-track rescan budget.
    pub rescans: RetryPolicy,
    /// Cap on stored data copies per sector.
    pub maxcopies: usize,
    /// Offset equality tolerance, in data bytes.
    pub byte_tolerance_of_time: i32,
    /// Whole-track repair rounds per transfer.
    pub track_retries: RetryMode,
    /// Whole-disk rounds per transfer.
    pub disk_retries: RetryMode,
    /// Merge into the existing target instead of overwriting.
    pub merge: bool,
    /// Repair the existing target in place.
    pub repair: bool,
    /// Skip re-reading sectors already stable at the destination.
    pub skip_stable_sectors: bool,
    /// Strict mode: equal sector sizes, sequential ids, no repeats.
    pub normal_disk: bool,
    /// Restrict transfers to file-system-used tracks.
    pub minimal: bool,
    /// Remove sectors with duplicate CHRN during normalisation.
    pub nodups: bool,
    /// Clear sector data during normalisation, for privacy in diagnostics.
    pub nodata: bool,
    /// Track 8K-sector checksum methods and warn on deviation.
    pub check8k: bool,
    /// Keep multiple good-CRC copies of a sector.
    pub paranoia: bool,
    pub gaps: GapsPolicy,
    /// Keep the final sector's gap4b data.
    pub gap4b: bool,
    /// Per-sector gap-keep mask; bit N covers sector index N.
    pub gapmask: u32,
    /// Splice-bit tolerance in gap analysis.
    pub maxsplice: i32,
    pub fix: FixMode,
    /// Align bitstream sync marks to byte boundaries.
    pub align: bool,
    /// Keep sector offsets (and track lengths) in output.
    pub offsets: bool,
    pub prefer: PreferredData,

    // Format overrides. A negative value leaves the source value alone.
    pub gap3: i32,
    pub fill: i32,
    pub base: i32,
    pub interleave: i32,
    pub skew: i32,
    pub size: i32,
    pub head0: i32,
    pub head1: i32,
    pub datarate: DataRate,
    pub encoding: Encoding,

    /// Physical stepping multiplier.
    pub step: u16,
    pub range: Range,
    pub cyls_first: bool,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            retries: RetryPolicy::new(5, false),
            rescans: RetryPolicy::new(0, false),
            maxcopies: 3,
            byte_tolerance_of_time: 64,
            track_retries: RetryMode::Off,
            disk_retries: RetryMode::Off,
            merge: false,
            repair: false,
            skip_stable_sectors: false,
            normal_disk: false,
            minimal: false,
            nodups: false,
            nodata: false,
            check8k: true,
            paranoia: false,
            gaps: GapsPolicy::Clean,
            gap4b: true,
            gapmask: u32::MAX,
            maxsplice: -1,
            fix: FixMode::Apply,
            align: false,
            offsets: true,
            prefer: PreferredData::Unknown,
            gap3: -1,
            fill: -1,
            base: -1,
            interleave: -1,
            skew: -1,
            size: -1,
            head0: -1,
            head1: -1,
            datarate: DataRate::Unknown,
            encoding: Encoding::Unknown,
            step: 1,
            range: Range::default(),
            cyls_first: false,
        }
    }
}
