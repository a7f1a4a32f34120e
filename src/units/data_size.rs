use std::fmt;
use std::ops::{Add, AddAssign, Div, Sub, SubAssign};

use super::{unit_base, DataRate, TimeDelta};

/// An amount of data, stored in bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataSize(i64);

unit_base!(DataSize);

impl DataSize {
    pub const fn from_bytes(bytes: i64) -> Self {
        Self(bytes)
    }

    pub fn from_bits(bits: i64) -> Self {
        Self(super::div_round(bits, 8))
    }

    pub fn bytes(self) -> i64 {
        debug_assert!(self.is_finite());
        self.0
    }

    pub fn bits(self) -> i64 {
        self.bytes().saturating_mul(8)
    }

    pub fn bytes_f64(self) -> f64 {
        if self.is_plus_infinity() {
            f64::INFINITY
        } else {
            self.0 as f64
        }
    }

    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }

    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    pub fn saturating_sub(self, rhs: Self) -> Self {
        (self - rhs).max(DataSize::zero())
    }
}

impl Add for DataSize {
    type Output = DataSize;
    fn add(self, rhs: DataSize) -> DataSize {
        DataSize(self.saturating_add_raw(rhs.0))
    }
}

impl AddAssign for DataSize {
    fn add_assign(&mut self, rhs: DataSize) {
        *self = *self + rhs;
    }
}

impl Sub for DataSize {
    type Output = DataSize;
    fn sub(self, rhs: DataSize) -> DataSize {
        debug_assert!(self.is_finite() && rhs.is_finite());
        DataSize(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for DataSize {
    fn sub_assign(&mut self, rhs: DataSize) {
        *self = *self - rhs;
    }
}

/// size / duration -> rate. The duration must be finite and non-zero.
impl Div<TimeDelta> for DataSize {
    type Output = DataRate;
    fn div(self, rhs: TimeDelta) -> DataRate {
        debug_assert!(rhs.is_finite() && !rhs.is_zero());
        let bits = self.bytes() as i128 * 8 * 1_000_000;
        DataRate::from_bps((bits / rhs.micros() as i128).clamp(0, i64::MAX as i128 - 1) as i64)
    }
}

/// size / rate -> duration. Division by an infinite rate yields zero.
impl Div<DataRate> for DataSize {
    type Output = TimeDelta;
    fn div(self, rhs: DataRate) -> TimeDelta {
        if rhs.is_infinite() {
            return TimeDelta::zero();
        }
        debug_assert!(!rhs.is_zero());
        let us = self.bytes() as i128 * 8 * 1_000_000 / rhs.bps() as i128;
        TimeDelta::from_micros(us.clamp(i64::MIN as i128 + 1, i64::MAX as i128 - 1) as i64)
    }
}

impl fmt::Display for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_plus_infinity() {
            write!(f, "+inf")
        } else {
            write!(f, "{} bytes", self.0)
        }
    }
}
