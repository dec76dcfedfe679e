//! Tick and nanosecond arithmetic.
//!
//! Both conversions floor through a 128-bit intermediate, so they are
//! monotonic and a round trip loses at most one tick worth of time. The
//! rounded variant is for display only.

use core::fmt::Write;

use heapless::String;

pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Conversion factors for a clock running at `freq` Hz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickScale {
    freq: u64,
}

impl TickScale {
    pub const fn new(freq: u64) -> Self {
        Self {
            freq: if freq == 0 { 1 } else { freq },
        }
    }

    pub const fn frequency(&self) -> u64 {
        self.freq
    }

    pub fn ns_to_ticks(&self, ns: u64) -> u64 {
        saturate(ns as u128 * self.freq as u128 / NSEC_PER_SEC as u128)
    }

    pub fn ticks_to_ns(&self, ticks: u64) -> u64 {
        saturate(ticks as u128 * NSEC_PER_SEC as u128 / self.freq as u128)
    }

    pub fn ticks_to_ns_rounded(&self, ticks: u64) -> u64 {
        let freq = self.freq as u128;
        saturate((ticks as u128 * NSEC_PER_SEC as u128 + freq / 2) / freq)
    }

    /// Signed conversion, symmetric around zero.
    pub fn ns_to_ticks_signed(&self, ns: i64) -> i64 {
        let ticks = self.ns_to_ticks(ns.unsigned_abs()).min(i64::MAX as u64) as i64;
        if ns < 0 {
            -ticks
        } else {
            ticks
        }
    }

    /// Length of one tick in nanoseconds, rounded up.
    pub fn tick_ns(&self) -> u64 {
        NSEC_PER_SEC.div_ceil(self.freq).max(1)
    }
}

fn saturate(v: u128) -> u64 {
    v.min(u64::MAX as u128) as u64
}

/// Splits `ns` into whole seconds and the nanosecond remainder.
pub const fn divrem_billion(ns: u64) -> (u64, u32) {
    (ns / NSEC_PER_SEC, (ns % NSEC_PER_SEC) as u32)
}

/// Adds a signed offset to an unsigned date, clamping at zero.
pub(crate) fn offset_date(date: u64, delta: i64) -> u64 {
    (date as i128 + delta as i128).clamp(0, u64::MAX as i128) as u64
}

/// Human readable duration: `"1s500ms"`, `"2ms10us"`, `"-"` for zero.
pub fn format_duration(ns: u64) -> String<24> {
    let mut out = String::new();
    if ns == 0 {
        let _ = out.push('-');
        return out;
    }

    let (sec, rem) = divrem_billion(ns);
    let us_total = rem / 1000;
    let ms = us_total / 1000;
    let us = us_total % 1000;

    if sec > 0 {
        let _ = write!(out, "{sec}s");
    }
    if ms > 0 || (sec > 0 && us > 0) {
        let _ = write!(out, "{ms}ms");
    }
    if us > 0 {
        let _ = write!(out, "{us}us");
    }
    if out.is_empty() {
        let _ = write!(out, "{rem}ns");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_floor() {
        let scale = TickScale::new(19_200_000);
        assert_eq!(scale.ns_to_ticks(1_000), 19);
        assert_eq!(scale.ticks_to_ns(19), 989);
        assert_eq!(scale.ticks_to_ns_rounded(19), 990);
        assert_eq!(scale.tick_ns(), 53);
        assert_eq!(scale.ns_to_ticks_signed(-1_000), -19);
    }

    #[test]
    fn nanosecond_clock_is_identity() {
        let scale = TickScale::new(NSEC_PER_SEC);
        assert_eq!(scale.ns_to_ticks(123_456_789), 123_456_789);
        assert_eq!(scale.ticks_to_ns(u64::MAX), u64::MAX);
        assert_eq!(scale.tick_ns(), 1);
    }

    #[test]
    fn durations_format_like_the_timer_listing() {
        assert_eq!(format_duration(0).as_str(), "-");
        assert_eq!(format_duration(1_500_000_000).as_str(), "1s500ms");
        assert_eq!(format_duration(1_000_002_000).as_str(), "1s0ms2us");
        assert_eq!(format_duration(2_010_000).as_str(), "2ms10us");
        assert_eq!(format_duration(750).as_str(), "750ns");
    }

    #[test]
    fn offsets_clamp_at_zero() {
        assert_eq!(offset_date(10, -20), 0);
        assert_eq!(offset_date(10, 5), 15);
    }
}
