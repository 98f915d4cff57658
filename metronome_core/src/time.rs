// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Monotonic host time in integer nanoseconds.
//!
//! [`HostTime`] is a point on the process-wide steady clock, expressed as
//! nanoseconds since an arbitrary epoch fixed at first use. [`Duration`] is a
//! nanosecond span in the same units.
//!
//! All pacing arithmetic goes through these two types. Division that yields a
//! count of refresh periods truncates toward zero; helpers that need the
//! opposite ([`Duration::periods_ceil`]) say so in their name.
//!
//! The pacing core never calls [`std::time::Instant`] directly. It reads time
//! through a [`Clock`], so simulations and tests can drive it with a
//! [`ManualClock`].

use core::fmt;
use core::ops::{Add, AddAssign, Div, Mul, Sub};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A point in time, in nanoseconds on the monotonic steady clock.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HostTime(pub u64);

impl HostTime {
    /// The epoch itself.
    pub const ZERO: Self = Self(0);

    /// Returns the raw nanosecond value.
    #[inline]
    #[must_use]
    pub const fn nanos(self) -> u64 {
        self.0
    }

    /// Returns the duration between `self` and an earlier time, or zero if
    /// `earlier` is after `self`.
    #[inline]
    #[must_use]
    pub const fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration(self.0.saturating_sub(earlier.0))
    }

    /// Checked addition of a duration.
    #[inline]
    #[must_use]
    pub const fn checked_add(self, duration: Duration) -> Option<Self> {
        match self.0.checked_add(duration.0) {
            Some(t) => Some(Self(t)),
            None => None,
        }
    }

    /// Checked subtraction of a duration.
    #[inline]
    #[must_use]
    pub const fn checked_sub(self, duration: Duration) -> Option<Self> {
        match self.0.checked_sub(duration.0) {
            Some(t) => Some(Self(t)),
            None => None,
        }
    }

    /// Saturating addition of a duration.
    #[inline]
    #[must_use]
    pub const fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.0))
    }

    /// Saturating subtraction of a duration, clamped at the epoch.
    #[inline]
    #[must_use]
    pub const fn saturating_sub(self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.0))
    }
}

impl Add<Duration> for HostTime {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign<Duration> for HostTime {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0;
    }
}

impl Sub<Duration> for HostTime {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Duration) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl Sub for HostTime {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Self) -> Duration {
        Duration(self.0 - rhs.0)
    }
}

impl fmt::Debug for HostTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostTime({})", self.0)
    }
}

/// A span of time in nanoseconds.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Duration(pub u64);

impl Duration {
    /// A zero-length duration.
    pub const ZERO: Self = Self(0);

    /// Creates a duration from nanoseconds.
    #[inline]
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Creates a duration from microseconds.
    #[inline]
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros * 1_000)
    }

    /// Creates a duration from milliseconds.
    #[inline]
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Returns the raw nanosecond value.
    #[inline]
    #[must_use]
    pub const fn nanos(self) -> u64 {
        self.0
    }

    /// Returns `true` for a zero-length span.
    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Saturating addition.
    #[inline]
    #[must_use]
    pub const fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    /// Saturating subtraction.
    #[inline]
    #[must_use]
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    /// Saturating multiplication by an integer count.
    #[inline]
    #[must_use]
    pub const fn saturating_mul(self, n: u64) -> Self {
        Self(self.0.saturating_mul(n))
    }

    /// Number of whole `period`s in `self`, truncating toward zero.
    ///
    /// Returns 0 when `period` is zero.
    #[inline]
    #[must_use]
    pub const fn periods_floor(self, period: Self) -> u64 {
        match self.0.checked_div(period.0) {
            Some(n) => n,
            None => 0,
        }
    }

    /// Smallest `n` such that `n * period >= self`.
    ///
    /// Returns 0 when `period` is zero.
    #[inline]
    #[must_use]
    pub const fn periods_ceil(self, period: Self) -> u64 {
        if period.0 == 0 {
            return 0;
        }
        self.0.div_ceil(period.0)
    }

    /// Converts to a [`std::time::Duration`] for sleeping and timeouts.
    #[inline]
    #[must_use]
    pub const fn to_std(self) -> std::time::Duration {
        std::time::Duration::from_nanos(self.0)
    }

    /// Converts from a [`std::time::Duration`], saturating at `u64::MAX`
    /// nanoseconds.
    #[inline]
    #[must_use]
    pub fn from_std(d: std::time::Duration) -> Self {
        Self(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }
}

impl Add for Duration {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Duration {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl Mul<u64> for Duration {
    type Output = Self;

    #[inline]
    fn mul(self, rhs: u64) -> Self {
        Self(self.0 * rhs)
    }
}

impl Div<u64> for Duration {
    type Output = Self;

    #[inline]
    fn div(self, rhs: u64) -> Self {
        Self(self.0 / rhs)
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Duration({})", self.0)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}ms", self.0 as f64 / 1_000_000.0)
    }
}

/// Source of monotonic time for the pacing core.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> HostTime;
}

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Converts a [`std::time::Instant`] to a [`HostTime`] on the process epoch.
///
/// Instants taken before the epoch map to [`HostTime::ZERO`].
#[must_use]
pub fn host_time_from_instant(instant: Instant) -> HostTime {
    HostTime(Duration::from_std(instant.saturating_duration_since(epoch())).0)
}

/// Converts a [`HostTime`] back to a [`std::time::Instant`].
#[must_use]
pub fn instant_from_host_time(t: HostTime) -> Instant {
    epoch() + Duration(t.0).to_std()
}

/// The production clock, backed by [`std::time::Instant`].
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

impl MonotonicClock {
    /// Returns the current steady-clock time.
    #[must_use]
    pub fn now() -> HostTime {
        host_time_from_instant(Instant::now())
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> HostTime {
        Self::now()
    }
}

/// A clock that only moves when told to.
///
/// Shared between threads by reference; all operations are atomic.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    #[must_use]
    pub const fn new(start: HostTime) -> Self {
        Self {
            now: AtomicU64::new(start.0),
        }
    }

    /// Moves the clock forward by `d`.
    pub fn advance(&self, d: Duration) {
        self.now.fetch_add(d.0, Ordering::SeqCst);
    }

    /// Jumps the clock to `t`. Going backwards is ignored.
    pub fn set(&self, t: HostTime) {
        self.now.fetch_max(t.0, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> HostTime {
        HostTime(self.now.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_arithmetic() {
        let a = Duration(100);
        let b = Duration(30);
        assert_eq!((a + b).nanos(), 130);
        assert_eq!((a - b).nanos(), 70);
        assert_eq!((b * 3).nanos(), 90);
        assert_eq!(a.saturating_sub(Duration(200)), Duration::ZERO);
    }

    #[test]
    fn host_time_duration_ops() {
        let t = HostTime(1000);
        let d = Duration(200);
        assert_eq!((t + d).nanos(), 1200);
        assert_eq!((t - d).nanos(), 800);
        assert_eq!(t.saturating_duration_since(HostTime(1500)), Duration::ZERO);
        assert_eq!(t.saturating_duration_since(HostTime(400)), Duration(600));
        assert_eq!(t.saturating_sub(Duration(5000)), HostTime::ZERO);
    }

    #[test]
    fn period_division_truncates_and_rounds_up() {
        let period = Duration(16_666_666);
        assert_eq!(Duration(41_666_665).periods_floor(period), 2);
        assert_eq!(Duration(41_666_665).periods_ceil(period), 3);
        assert_eq!(Duration(33_333_332).periods_ceil(period), 2);
        assert_eq!(Duration(1).periods_floor(Duration::ZERO), 0);
        assert_eq!(Duration(1).periods_ceil(Duration::ZERO), 0);
    }

    #[test]
    fn std_conversion_round_trips() {
        let d = Duration::from_millis(16);
        assert_eq!(Duration::from_std(d.to_std()), d);
    }

    #[test]
    fn instant_conversion_is_monotonic() {
        let a = MonotonicClock::now();
        let b = MonotonicClock::now();
        assert!(b >= a, "steady clock went backwards");
        let back = host_time_from_instant(instant_from_host_time(b));
        assert_eq!(back, b);
    }

    #[test]
    fn manual_clock_only_moves_forward() {
        let clock = ManualClock::new(HostTime(1_000));
        clock.advance(Duration(500));
        assert_eq!(clock.now(), HostTime(1_500));
        clock.set(HostTime(1_200));
        assert_eq!(clock.now(), HostTime(1_500), "set must not go backwards");
        clock.set(HostTime(2_000));
        assert_eq!(clock.now(), HostTime(2_000));
    }
}
