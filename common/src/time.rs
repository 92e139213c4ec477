//
// Copyright 2025 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::{
    fmt::Debug,
    ops::{Add, AddAssign, Sub},
};

/// A wrapper around [`std::time::Instant`] that does not expose panicking `duration_since` operations.
///
/// Instead of subtraction, use `saturating_duration_since`.
///
/// Every layer takes the current time as an argument rather than reading a clock,
/// so tests can drive time by adding durations to a single base `Instant`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(std::time::Instant);

impl Instant {
    pub fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        Duration(self.0.saturating_duration_since(earlier.0))
    }

    /// Milliseconds elapsed since `epoch`, truncated to 32 bits the way they
    /// appear in media timestamps. Wraps after ~49.7 days.
    pub fn millis_since_truncated(&self, epoch: Instant) -> u32 {
        self.saturating_duration_since(epoch).as_millis() as u32
    }

    pub fn now() -> Instant {
        Instant(std::time::Instant::now())
    }
}

impl From<std::time::Instant> for Instant {
    fn from(instant: std::time::Instant) -> Self {
        Self(instant)
    }
}

impl From<Instant> for std::time::Instant {
    fn from(instant: Instant) -> Self {
        instant.0
    }
}

impl Debug for Instant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

/// A wrapper around [`std::time::Duration`] that does not expose panicking difference operations.
///
/// Only methods of `std::time::Duration` that are used in the project are exposed here.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration(std::time::Duration);

impl Duration {
    pub const ZERO: Duration = Duration::from_secs(0);
    pub const SECOND: Duration = Duration::from_secs(1);

    pub const fn from_secs(secs: u64) -> Duration {
        Duration(std::time::Duration::from_secs(secs))
    }

    pub const fn from_millis(millis: u64) -> Duration {
        Duration(std::time::Duration::from_millis(millis))
    }

    pub const fn as_millis(&self) -> u128 {
        self.0.as_millis()
    }
}

impl From<std::time::Duration> for Duration {
    fn from(duration: std::time::Duration) -> Self {
        Self(duration)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(duration: Duration) -> Self {
        duration.0
    }
}

impl Debug for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Add<Duration> for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Self::Output {
        Duration(self.0 + rhs.0)
    }
}

impl AddAssign<Duration> for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap() {
        let now = std::time::Instant::now();
        assert_eq!(now, Instant::from(now).into());

        let duration = std::time::Duration::new(5, 10);
        assert_eq!(duration, Duration::from(duration).into());
    }

    #[test]
    fn duration_arithmetic() {
        let short = Duration::from_millis(2);
        let long = Duration::from_secs(5);
        let sum = Duration::from_millis(5002);

        assert_eq!(sum, short + long);
        assert_eq!(5002, sum.as_millis());

        let mut manual_sum = short;
        manual_sum += long;
        assert_eq!(sum, manual_sum);
    }

    #[test]
    fn instant_arithmetic() {
        let now = Instant::now();
        let duration = Duration::from_millis(2);
        let soon = now + duration;

        assert_eq!(now, soon - duration);
        assert_eq!(duration, soon.saturating_duration_since(now));
        assert_eq!(Duration::ZERO, now.saturating_duration_since(soon));

        let mut manual_sum = now;
        manual_sum += duration;
        assert_eq!(soon, manual_sum);
    }

    #[test]
    fn media_timestamps() {
        let epoch = Instant::now();
        let at = |millis| epoch + Duration::from_millis(millis);

        assert_eq!(0, epoch.millis_since_truncated(epoch));
        assert_eq!(15, at(15).millis_since_truncated(epoch));
        // Earlier than the epoch saturates instead of panicking.
        assert_eq!(0, epoch.millis_since_truncated(at(15)));
        assert_eq!(
            7,
            at(u32::MAX as u64 + 8).millis_since_truncated(epoch),
            "wraps like the 32-bit wire field"
        );
    }
}
