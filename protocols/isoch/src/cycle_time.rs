// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Protocol about cycle time of IEEE 1394 bus.
//!
//! The module includes structure, enumeration, and trait and its implementation for the 32 bit
//! cycle time register defined in IEEE 1394, and reconstruction of presentation time from the
//! 16 bit SYT field of CIP header, defined in IEC 61883-1.
//!
//! ```text
//!  31        25 24                     12 11                     0
//! +------------+-------------------------+------------------------+
//! | seconds(7) |       cycle(13)         |      offset(12)        |
//! +------------+-------------------------+------------------------+
//!                             |  lower 4 bits        |
//!                             v                      v
//!                        +--------+------------------------+
//!                   SYT  | nibble |       offset(12)       |
//!                        +--------+------------------------+
//! ```

/// The number of ticks in one isochronous cycle, driven by 24.576 MHz clock.
pub const TICKS_PER_CYCLE: u32 = 3072;

/// The number of isochronous cycles in one second.
pub const CYCLES_PER_SECOND: u32 = 8000;

/// The number of ticks in one second.
pub const TICKS_PER_SECOND: u32 = TICKS_PER_CYCLE * CYCLES_PER_SECOND;

/// The seconds field wraps around at this value.
pub const SECONDS_PER_WRAP: u32 = 128;

/// The number of ticks until the cycle time wraps around.
pub const TICKS_PER_WRAP: u64 = TICKS_PER_SECOND as u64 * SECONDS_PER_WRAP as u64;

/// The value of SYT field to express no information about presentation time.
pub const SYT_NO_INFO: u16 = 0xffff;

const SEC_MASK: u32 = 0xfe000000;
const SEC_SHIFT: usize = 25;
const CYCLE_MASK: u32 = 0x01fff000;
const CYCLE_SHIFT: usize = 12;
const OFFSET_MASK: u32 = 0x00000fff;

const SYT_CYCLE_MASK: u16 = 0xf000;
const SYT_CYCLE_SHIFT: usize = 12;
const SYT_OFFSET_MASK: u16 = 0x0fff;

/// The value of cycle time.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct CycleTime {
    /// The seconds, wrapping around at 128.
    pub sec: u8,
    /// The isochronous cycle, less than 8000.
    pub cycle: u16,
    /// The offset in the cycle, less than 3072.
    pub offset: u16,
}

impl std::fmt::Display for CycleTime {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:03}:{:04}:{:04}", self.sec, self.cycle, self.offset)
    }
}

impl CycleTime {
    pub fn new(sec: u8, cycle: u16, offset: u16) -> Self {
        Self { sec, cycle, offset }
    }

    /// Parse the value of cycle time register.
    pub fn from_raw(raw: u32) -> Self {
        Self {
            sec: ((raw & SEC_MASK) >> SEC_SHIFT) as u8,
            cycle: ((raw & CYCLE_MASK) >> CYCLE_SHIFT) as u16,
            offset: (raw & OFFSET_MASK) as u16,
        }
    }

    /// Build the value of cycle time register.
    pub fn raw(&self) -> u32 {
        ((self.sec as u32) << SEC_SHIFT) & SEC_MASK
            | ((self.cycle as u32) << CYCLE_SHIFT) & CYCLE_MASK
            | (self.offset as u32) & OFFSET_MASK
    }

    /// Whether each field is in its range.
    pub fn is_valid(&self) -> bool {
        (self.sec as u32) < SECONDS_PER_WRAP
            && (self.cycle as u32) < CYCLES_PER_SECOND
            && (self.offset as u32) < TICKS_PER_CYCLE
    }

    /// Convert from the number of ticks, modulo 128 seconds.
    pub fn from_ticks(ticks: u64) -> Self {
        let ticks = ticks % TICKS_PER_WRAP;
        let sec = ticks / TICKS_PER_SECOND as u64;
        let rem = ticks % TICKS_PER_SECOND as u64;
        Self {
            sec: sec as u8,
            cycle: (rem / TICKS_PER_CYCLE as u64) as u16,
            offset: (rem % TICKS_PER_CYCLE as u64) as u16,
        }
    }

    /// Convert to the number of ticks since the last wrap around.
    pub fn ticks(&self) -> u64 {
        self.sec as u64 * TICKS_PER_SECOND as u64
            + self.cycle as u64 * TICKS_PER_CYCLE as u64
            + self.offset as u64
    }

    /// Convert from the number of isochronous cycles, modulo 128 seconds.
    pub fn from_cycles(cycles: u64) -> Self {
        Self::from_ticks(cycles_to_ticks(cycles))
    }

    pub fn add_ticks(&self, ticks: u64) -> Self {
        Self::from_ticks(self.ticks() + ticks % TICKS_PER_WRAP)
    }

    /// The signed difference to the earlier cycle time. The result is folded into the half
    /// of wrap period so that the difference across the wrap around is still small.
    pub fn diff_ticks(&self, earlier: &Self) -> i64 {
        let wrap = TICKS_PER_WRAP as i64;
        let mut diff = self.ticks() as i64 - earlier.ticks() as i64;
        if diff > wrap / 2 {
            diff -= wrap;
        } else if diff <= -wrap / 2 {
            diff += wrap;
        }
        diff
    }

    /// Build SYT field from the lower 4 bits of cycle and the offset.
    pub fn syt(&self) -> u16 {
        ((self.cycle << SYT_CYCLE_SHIFT) & SYT_CYCLE_MASK) | (self.offset & SYT_OFFSET_MASK)
    }
}

pub fn ticks_to_cycles(ticks: u64) -> u64 {
    ticks / TICKS_PER_CYCLE as u64
}

pub fn cycles_to_ticks(cycles: u64) -> u64 {
    cycles * TICKS_PER_CYCLE as u64
}

/// The lower 4 bits of cycle in SYT field.
pub fn syt_cycle_nibble(syt: u16) -> u16 {
    (syt & SYT_CYCLE_MASK) >> SYT_CYCLE_SHIFT
}

/// The offset in SYT field.
pub fn syt_offset(syt: u16) -> u16 {
    syt & SYT_OFFSET_MASK
}

/// Reconstruct full cycle time expressed by SYT field, with the cycle of hardware at the time
/// to receive the packet and the local estimation of seconds.
///
/// The SYT field has only the lower 4 bits of cycle, thus the value is assumed to be within 15
/// cycles after the hardware cycle. When the lower 4 bits of SYT is less than the one of hardware
/// cycle, the 4 bit counter wrapped around once; 16 cycles are added and the seconds field is
/// incremented by one from the local estimation. The cycle field is folded at 8000 cycles
/// without further carry. Multiple wrap around between the two values is not detectable.
///
/// The seconds field marks the wrap of the 4 bit counter and is not the presentation time. Use
/// [`presentation_time`] for arithmetic against the arrival time.
pub fn reconstruct_full_timestamp(syt: u16, hw_cycle: u16, local_seconds: u8) -> u32 {
    let mut syt_cycle = syt_cycle_nibble(syt) as u32;
    let masked_cycle = hw_cycle as u32 & 0x0f;
    let mut sec = local_seconds as u32 % SECONDS_PER_WRAP;

    if syt_cycle < masked_cycle {
        syt_cycle += 16;
        sec = (sec + 1) % SECONDS_PER_WRAP;
    }

    let cycle = (hw_cycle as u32 + syt_cycle - masked_cycle) % CYCLES_PER_SECOND;

    CycleTime::new(sec as u8, cycle as u16, syt_offset(syt)).raw()
}

/// The presentation time of full cycle time reconstructed against the arrival time. The seconds
/// is taken from the arrival and carried when the cycle crosses the boundary of second.
pub fn presentation_time(full: u32, arrival: &CycleTime) -> CycleTime {
    let full = CycleTime::from_raw(full);
    let mut sec = arrival.sec as u32 % SECONDS_PER_WRAP;
    if full.cycle < arrival.cycle {
        sec = (sec + 1) % SECONDS_PER_WRAP;
    }
    CycleTime::new(sec as u8, full.cycle, full.offset)
}

/// The offset of reconstructed full cycle time.
pub fn extract_offset(full: u32) -> u16 {
    (full & OFFSET_MASK) as u16
}

/// The lower 4 bits of cycle in reconstructed full cycle time.
pub fn extract_cycle_nibble(full: u32) -> u16 {
    (((full & CYCLE_MASK) >> CYCLE_SHIFT) & 0x0f) as u16
}

/// Extender of successive cycle time values to monotonic count of ticks. The wrap around of
/// seconds field is detected when the value goes backward more than the half of wrap period.
#[derive(Default, Debug)]
pub struct CycleTimer {
    wraps: u64,
    last: Option<u64>,
}

impl CycleTimer {
    pub fn extend(&mut self, cycle_time: &CycleTime) -> u64 {
        let ticks = cycle_time.ticks();
        let half = TICKS_PER_WRAP / 2;

        match self.last {
            Some(last) if ticks < last && last - ticks > half => {
                self.wraps += 1;
                self.last = Some(ticks);
            }
            Some(last) if ticks > last && ticks - last > half => {
                // A late value from the period before the last wrap around.
                return self.wraps.saturating_sub(1) * TICKS_PER_WRAP + ticks;
            }
            _ => self.last = Some(ticks),
        }

        self.wraps * TICKS_PER_WRAP + ticks
    }

    pub fn reset(&mut self) {
        self.wraps = 0;
        self.last = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cycle_time_raw() {
        let cycle_time = CycleTime::new(0x7f, 7999, 3071);
        let raw = cycle_time.raw();
        assert_eq!(raw, 0xfe000000 | (7999 << 12) | 3071);
        assert_eq!(CycleTime::from_raw(raw), cycle_time);
        assert!(cycle_time.is_valid());

        assert!(!CycleTime::from_raw(0x01fff000).is_valid());
    }

    #[test]
    fn cycle_time_ticks() {
        let cycle_time = CycleTime::new(3, 100, 20);
        let ticks = cycle_time.ticks();
        assert_eq!(ticks, 3 * 24_576_000 + 100 * 3072 + 20);
        assert_eq!(CycleTime::from_ticks(ticks), cycle_time);
        assert_eq!(CycleTime::from_ticks(ticks + TICKS_PER_WRAP), cycle_time);

        assert_eq!(ticks_to_cycles(cycles_to_ticks(12345)), 12345);
        assert_eq!(ticks_to_cycles(3071), 0);
        assert_eq!(ticks_to_cycles(3072), 1);
        assert_eq!(CycleTime::from_cycles(8001), CycleTime::new(1, 1, 0));
    }

    #[test]
    fn cycle_time_arithmetic() {
        let last = CycleTime::new(127, 7999, 3000);
        let next = last.add_ticks(100);
        assert_eq!(next, CycleTime::new(0, 0, 28));
        assert_eq!(next.diff_ticks(&last), 100);
        assert_eq!(last.diff_ticks(&next), -100);
    }

    #[test]
    fn syt_field() {
        let cycle_time = CycleTime::new(1, 0x1234, 0x0abc);
        assert_eq!(cycle_time.syt(), 0x4abc);
        assert_eq!(syt_cycle_nibble(0x4abc), 0x4);
        assert_eq!(syt_offset(0x4abc), 0x0abc);
    }

    #[test]
    fn reconstruction_round_trip() {
        (0..CYCLES_PER_SECOND as u16).for_each(|hw_cycle| {
            (0..16u16).for_each(|nibble| {
                [0u16, 1, 1535, 3071].iter().for_each(|&offset| {
                    let syt = (nibble << 12) | offset;
                    let full = reconstruct_full_timestamp(syt, hw_cycle, 5);
                    assert_eq!(extract_cycle_nibble(full), nibble);
                    assert_eq!(extract_offset(full), offset);
                    assert!(CycleTime::from_raw(full).is_valid());

                    let arrival = CycleTime::new(5, hw_cycle, 0);
                    let ahead = presentation_time(full, &arrival).diff_ticks(&arrival);
                    assert!(ahead >= 0);
                    assert!(ahead < 16 * TICKS_PER_CYCLE as i64);
                });
            });
        });
    }

    #[test]
    fn reconstruction_wrap_once() {
        (0..CYCLES_PER_SECOND as u16).for_each(|hw_cycle| {
            let hw_nibble = hw_cycle & 0x0f;
            (0..16u16).for_each(|nibble| {
                [0u8, 10, 127].iter().for_each(|&local_seconds| {
                    let full = reconstruct_full_timestamp(nibble << 12, hw_cycle, local_seconds);
                    let cycle_time = CycleTime::from_raw(full);
                    if nibble < hw_nibble {
                        let cycle = (hw_cycle + nibble + 16 - hw_nibble) % 8000;
                        assert_eq!(cycle_time.cycle, cycle);
                        assert_eq!(cycle_time.sec, (local_seconds + 1) % 128);
                    } else {
                        assert_eq!(cycle_time.cycle, hw_cycle + nibble - hw_nibble);
                        assert_eq!(cycle_time.sec, local_seconds);
                    }
                });
            });
        });
    }

    #[test]
    fn reconstruction_wrap_around() {
        let full = reconstruct_full_timestamp(0x0123, 7999, 10);
        assert_eq!(CycleTime::from_raw(full), CycleTime::new(11, 0, 0x123));

        let full = reconstruct_full_timestamp(0xf010, 7999, 127);
        assert_eq!(CycleTime::from_raw(full), CycleTime::new(127, 7999, 0x10));

        let full = reconstruct_full_timestamp(0x2000, 7999, 127);
        assert_eq!(CycleTime::from_raw(full), CycleTime::new(0, 2, 0));

        let full = reconstruct_full_timestamp(0x1000, 30, 10);
        assert_eq!(CycleTime::from_raw(full), CycleTime::new(11, 33, 0));
    }

    #[test]
    fn presentation_against_arrival() {
        let arrival = CycleTime::new(10, 30, 100);
        let full = reconstruct_full_timestamp(0x1000, arrival.cycle, arrival.sec);
        assert_eq!(presentation_time(full, &arrival), CycleTime::new(10, 33, 0));

        let arrival = CycleTime::new(127, 7999, 0);
        let full = reconstruct_full_timestamp(0x2000, arrival.cycle, arrival.sec);
        assert_eq!(presentation_time(full, &arrival), CycleTime::new(0, 2, 0));

        let arrival = CycleTime::new(4, 7990, 0);
        let full = reconstruct_full_timestamp(0x9000, arrival.cycle, arrival.sec);
        assert_eq!(presentation_time(full, &arrival), CycleTime::new(4, 7993, 0));
    }

    #[test]
    fn cycle_timer_extension() {
        let mut timer = CycleTimer::default();
        assert_eq!(timer.extend(&CycleTime::new(127, 7999, 0)), 127 * 24_576_000 + 7999 * 3072);
        assert_eq!(timer.extend(&CycleTime::new(0, 1, 0)), TICKS_PER_WRAP + 3072);
        assert_eq!(timer.extend(&CycleTime::new(127, 7999, 1)), 127 * 24_576_000 + 7999 * 3072 + 1);
        assert_eq!(timer.extend(&CycleTime::new(0, 2, 0)), TICKS_PER_WRAP + 2 * 3072);

        timer.reset();
        assert_eq!(timer.extend(&CycleTime::new(0, 2, 0)), 2 * 3072);
    }
}
