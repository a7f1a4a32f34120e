use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

use super::{div_round, unit_base, MINUS_INFINITY_VAL};

/// A signed span of time, stored in microseconds.
///
/// Unlike `std::time::Duration` this can be negative (one way delay
/// variations regularly are) and carries both infinities so that "never" and
/// "immediately expired" deadlines need no side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeDelta(i64);

unit_base!(TimeDelta);

impl TimeDelta {
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

    pub fn from_seconds_f64(seconds: f64) -> Self {
        if seconds == f64::INFINITY {
            Self::plus_infinity()
        } else if seconds == f64::NEG_INFINITY {
            Self::minus_infinity()
        } else {
            Self((seconds * 1e6).round() as i64)
        }
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

    pub fn millis_f64(self) -> f64 {
        self.seconds_f64() * 1e3
    }

    pub fn abs(self) -> Self {
        if self.0 < 0 && !self.is_minus_infinity() {
            Self(-self.0)
        } else if self.is_minus_infinity() {
            Self::plus_infinity()
        } else {
            self
        }
    }

    pub fn clamp(self, lo: Self, hi: Self) -> Self {
        Self(self.0.clamp(lo.0, hi.0))
    }

    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }

    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }
}

impl Add for TimeDelta {
    type Output = TimeDelta;
    fn add(self, rhs: TimeDelta) -> TimeDelta {
        TimeDelta(self.saturating_add_raw(rhs.0))
    }
}

impl AddAssign for TimeDelta {
    fn add_assign(&mut self, rhs: TimeDelta) {
        *self = *self + rhs;
    }
}

impl Sub for TimeDelta {
    type Output = TimeDelta;
    fn sub(self, rhs: TimeDelta) -> TimeDelta {
        self + (-rhs)
    }
}

impl SubAssign for TimeDelta {
    fn sub_assign(&mut self, rhs: TimeDelta) {
        *self = *self - rhs;
    }
}

impl Neg for TimeDelta {
    type Output = TimeDelta;
    fn neg(self) -> TimeDelta {
        if self.is_plus_infinity() {
            TimeDelta::minus_infinity()
        } else if self.is_minus_infinity() {
            TimeDelta::plus_infinity()
        } else {
            TimeDelta(-self.0)
        }
    }
}

impl Mul<i64> for TimeDelta {
    type Output = TimeDelta;
    fn mul(self, rhs: i64) -> TimeDelta {
        if self.is_infinite() {
            debug_assert!(rhs != 0);
            if rhs < 0 {
                -self
            } else {
                self
            }
        } else {
            TimeDelta(self.0.saturating_mul(rhs))
        }
    }
}

impl Mul<f64> for TimeDelta {
    type Output = TimeDelta;
    fn mul(self, rhs: f64) -> TimeDelta {
        TimeDelta::from_seconds_f64(self.seconds_f64() * rhs)
    }
}

impl Div<i64> for TimeDelta {
    type Output = TimeDelta;
    fn div(self, rhs: i64) -> TimeDelta {
        debug_assert!(rhs != 0);
        if self.is_infinite() {
            if rhs < 0 {
                -self
            } else {
                self
            }
        } else {
            TimeDelta(self.0 / rhs)
        }
    }
}

impl Div<TimeDelta> for TimeDelta {
    type Output = f64;
    fn div(self, rhs: TimeDelta) -> f64 {
        self.seconds_f64() / rhs.seconds_f64()
    }
}

impl fmt::Display for TimeDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_plus_infinity() {
            write!(f, "+inf")
        } else if self.is_minus_infinity() {
            write!(f, "-inf")
        } else if self.0.abs() >= 1_000_000 {
            write!(f, "{:.3}s", self.seconds_f64())
        } else {
            write!(f, "{}us", self.0)
        }
    }
}
