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

    src/flux/pll.rs

    A software phase-locked loop tracking the bit cell clock through the
    speed wobble of real drives.
*/

use crate::types::enums::DataRate;
use crate::util::raw_cell_rate;

/// How much of the observed phase error feeds back into the period, in
/// sixteenths.
const ADJUST_NUMERATOR: i64 = 1;
const ADJUST_DENOMINATOR: i64 = 16;

/// The period may drift at most this far from nominal, in percent.
const MAX_DRIFT_PERCENT: i64 = 10;

pub struct Pll {
    nominal_ns: i64,
    period_ns: i64,
}

impl Pll {
    pub fn new(datarate: DataRate) -> Self {
        let rate = raw_cell_rate(datarate).max(1);
        let nominal_ns = 1_000_000_000i64 / rate as i64;
        Self {
            nominal_ns,
            period_ns: nominal_ns,
        }
    }

    pub fn period_ns(&self) -> i64 {
        self.period_ns
    }

    /// Feed one flux interval to the loop. Returns how many whole bit cells
    /// the interval spans (at least one), with the period adjusted towards
    /// the observed timing.
    pub fn advance(&mut self, interval_ns: u32) -> u32 {
        let interval = interval_ns as i64;
        let mut cells = (interval + self.period_ns / 2) / self.period_ns;
        if cells < 1 {
            cells = 1;
        }

        // Phase error per cell pulls the period towards the drive's speed.
        let error = interval - cells * self.period_ns;
        self.period_ns += error / cells * ADJUST_NUMERATOR / ADJUST_DENOMINATOR;

        let min = self.nominal_ns * (100 - MAX_DRIFT_PERCENT) / 100;
        let max = self.nominal_ns * (100 + MAX_DRIFT_PERCENT) / 100;
        self.period_ns = self.period_ns.clamp(min, max);

        cells as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nominal_intervals_decode_exactly() {
        let mut pll = Pll::new(DataRate::Rate250K);
        assert_eq!(pll.advance(2000), 1);
        assert_eq!(pll.advance(4000), 2);
        assert_eq!(pll.advance(6000), 3);
    }

    #[test]
    fn period_tracks_a_slow_drive() {
        let mut pll = Pll::new(DataRate::Rate250K);
        // A drive running 4% slow stretches every interval.
        for _ in 0..200 {
            pll.advance(2080);
        }
        assert!(pll.period_ns() > 2020);
    }

    #[test]
    fn drift_is_clamped() {
        let mut pll = Pll::new(DataRate::Rate250K);
        for _ in 0..10_000 {
            pll.advance(2900);
        }
        assert!(pll.period_ns() <= 2200);
    }
}
