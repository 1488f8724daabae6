// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Monitor of SYT field in received packets.
//!
//! The monitor reconstructs the presentation time from the SYT field and the cycle time at
//! which the packet arrived, then cross-checks it against the nominal period of events so that
//! bugs about wrap around of cycle counter and jitter of timing are detected.

use {
    firewire_isoch_protocols::cycle_time::*,
    tracing::{debug, info},
};

/// The default tolerance of deviation from the nominal interval, in ticks.
pub const DEFAULT_SYT_TOLERANCE: u64 = 256;

/// Statistics of observed SYT fields.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SytMonitorStats {
    /// The number of observed packets with SYT.
    pub observed: u64,
    /// The number of packets with SYT field without information.
    pub no_info: u64,
    /// The number of packets in which the lower 4 bits of cycle wrapped around.
    pub nibble_wraps: u64,
    /// The number of packets presented in the second after the arrival.
    pub second_carries: u64,
    /// The number of reconstructions which did not reproduce the SYT field.
    pub mismatches: u64,
    /// The number of intervals deviated from the nominal one more than the tolerance.
    pub discontinuities: u64,
    /// The maximum deviation from the nominal interval, in ticks.
    pub max_deviation: u64,
    /// The minimum delay from the arrival to the presentation, in ticks.
    pub min_delay: Option<i64>,
    /// The maximum delay from the arrival to the presentation, in ticks.
    pub max_delay: Option<i64>,
}

/// The result of one observation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SytObservation {
    /// The presentation time reconstructed from the SYT field and the arrival.
    pub full: CycleTime,
    /// The presentation time extended to monotonic ticks.
    pub ticks: u64,
    /// The delay from the arrival to the presentation, in ticks.
    pub delay: i64,
    /// The deviation of interval from the nominal one since the last observation.
    pub deviation: Option<u64>,
}

/// The monitor of SYT field for one stream.
#[derive(Debug)]
pub struct SytMonitor {
    name: String,
    rate: u32,
    tolerance: u64,
    timer: CycleTimer,
    last: Option<(u64, usize)>,
    stats: SytMonitorStats,
}

impl SytMonitor {
    pub fn new(name: &str, rate: u32) -> Self {
        Self {
            name: name.to_string(),
            rate,
            tolerance: DEFAULT_SYT_TOLERANCE,
            timer: Default::default(),
            last: None,
            stats: Default::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_tolerance(&mut self, tolerance: u64) {
        self.tolerance = tolerance;
    }

    /// Change the sampling rate. The history of timestamp is discarded.
    pub fn set_rate(&mut self, rate: u32) {
        self.rate = rate;
        self.last = None;
        self.timer.reset();
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.timer.reset();
        self.stats = Default::default();
    }

    pub fn stats(&self) -> &SytMonitorStats {
        &self.stats
    }

    /// The presentation time of the last observation in monotonic ticks.
    pub fn last_ticks(&self) -> Option<u64> {
        self.last.map(|(ticks, _)| ticks)
    }

    /// The difference of the last presentation time from the other stream, in ticks.
    pub fn offset_to(&self, other: &SytMonitor) -> Option<i64> {
        self.last_ticks()
            .zip(other.last_ticks())
            .map(|(lhs, rhs)| lhs as i64 - rhs as i64)
    }

    fn nominal_interval(&self, events: usize) -> u64 {
        if self.rate == 0 {
            0
        } else {
            (events as u64 * TICKS_PER_SECOND as u64 + self.rate as u64 / 2) / self.rate as u64
        }
    }

    /// Observe the SYT field in the packet which arrived at the cycle time with the number of
    /// events.
    pub fn observe(
        &mut self,
        syt: u16,
        arrival: &CycleTime,
        events: usize,
    ) -> Option<SytObservation> {
        if syt == SYT_NO_INFO {
            self.stats.no_info += 1;
            return None;
        }

        self.stats.observed += 1;

        let raw = reconstruct_full_timestamp(syt, arrival.cycle, arrival.sec);
        let reproduced = extract_offset(raw) == syt_offset(syt)
            && extract_cycle_nibble(raw) == syt_cycle_nibble(syt);
        if !reproduced {
            self.stats.mismatches += 1;
            debug!(name = %self.name, syt, raw, "SYT is not reproduced");
        }

        if syt_cycle_nibble(syt) < arrival.cycle & 0x0f {
            self.stats.nibble_wraps += 1;
        }
        let full = presentation_time(raw, arrival);
        if full.sec != arrival.sec {
            self.stats.second_carries += 1;
        }

        let delay = full.diff_ticks(arrival);
        if self.stats.min_delay.map(|d| delay < d).unwrap_or(true) {
            self.stats.min_delay = Some(delay);
        }
        if self.stats.max_delay.map(|d| delay > d).unwrap_or(true) {
            self.stats.max_delay = Some(delay);
        }

        let ticks = self.timer.extend(&full);
        let deviation = self.last.map(|(last_ticks, last_events)| {
            let interval = ticks as i64 - last_ticks as i64;
            let nominal = self.nominal_interval(last_events) as i64;
            (interval - nominal).unsigned_abs()
        });

        if let Some(deviation) = deviation {
            if deviation > self.stats.max_deviation {
                self.stats.max_deviation = deviation;
            }
            if deviation > self.tolerance {
                self.stats.discontinuities += 1;
                debug!(name = %self.name, %full, deviation, "discontinuity of SYT");
            }
        }

        self.last = Some((ticks, events));

        Some(SytObservation {
            full,
            ticks,
            delay,
            deviation,
        })
    }

    /// Log summary of statistics.
    pub fn report(&self) {
        let stats = &self.stats;
        info!(
            name = %self.name,
            observed = stats.observed,
            no_info = stats.no_info,
            nibble_wraps = stats.nibble_wraps,
            second_carries = stats.second_carries,
            mismatches = stats.mismatches,
            discontinuities = stats.discontinuities,
            max_deviation = stats.max_deviation,
            min_delay = ?stats.min_delay,
            max_delay = ?stats.max_delay,
            "SYT statistics"
        );
    }
}
