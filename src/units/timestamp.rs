use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use super::{div_round, unit_base, TimeDelta, MINUS_INFINITY_VAL};

/// A point on the monotonic clock, stored as microseconds since an arbitrary
/// epoch chosen by the clock that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

unit_base!(Timestamp);

impl Timestamp {
    pub const fn minus_infinity() -> Self {
        Self(MINUS_INFINITY_VAL)
    }

    pub const fn from_micros(us: i64) -> Self {
        Self(us)
    }

    pub fn from_millis(ms: i64) -> Self {
        Self(ms.saturating_mul(1000))
    }

    pub fn from_seconds(seconds: i64) -> Self {
        Self(seconds.saturating_mul(1_000_000))
    }

    pub fn micros(self) -> i64 {
        debug_assert!(self.is_finite());
        self.0
    }

    pub fn millis(self) -> i64 {
        div_round(self.micros(), 1000)
    }

    pub fn seconds(self) -> i64 {
        div_round(self.micros(), 1_000_000)
    }

    pub fn seconds_f64(self) -> f64 {
        if self.is_plus_infinity() {
            f64::INFINITY
        } else if self.is_minus_infinity() {
            f64::NEG_INFINITY
        } else {
            self.0 as f64 * 1e-6
        }
    }

    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }

    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }
}

impl Add<TimeDelta> for Timestamp {
    type Output = Timestamp;
    fn add(self, rhs: TimeDelta) -> Timestamp {
        if rhs.is_plus_infinity() {
            debug_assert!(!self.is_minus_infinity());
            return Timestamp::plus_infinity();
        }
        if rhs.is_minus_infinity() {
            debug_assert!(!self.is_plus_infinity());
            return Timestamp::minus_infinity();
        }
        Timestamp(self.saturating_add_raw(if rhs.is_finite() { rhs.micros() } else { 0 }))
    }
}

impl AddAssign<TimeDelta> for Timestamp {
    fn add_assign(&mut self, rhs: TimeDelta) {
        *self = *self + rhs;
    }
}

impl Sub<TimeDelta> for Timestamp {
    type Output = Timestamp;
    fn sub(self, rhs: TimeDelta) -> Timestamp {
        self + (-rhs)
    }
}

impl SubAssign<TimeDelta> for Timestamp {
    fn sub_assign(&mut self, rhs: TimeDelta) {
        *self = *self - rhs;
    }
}

impl Sub for Timestamp {
    type Output = TimeDelta;
    fn sub(self, rhs: Timestamp) -> TimeDelta {
        debug_assert!(
            !(self.is_infinite() && self.0 == rhs.0),
            "subtracting equal infinities"
        );
        if self.is_plus_infinity() || rhs.is_minus_infinity() {
            return TimeDelta::plus_infinity();
        }
        if self.is_minus_infinity() || rhs.is_plus_infinity() {
            return TimeDelta::minus_infinity();
        }
        TimeDelta::from_micros(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_plus_infinity() {
            write!(f, "+inf")
        } else if self.is_minus_infinity() {
            write!(f, "-inf")
        } else {
            write!(f, "{:.6}s", self.seconds_f64())
        }
    }
}
