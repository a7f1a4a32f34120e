use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Sub};

use super::{div_round, unit_base, DataSize, TimeDelta};

/// A data rate, stored in bits per second.
///
/// Bits rather than bytes keeps raw values recognizable next to the bitrate
/// figures the rest of the stack is configured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataRate(i64);

unit_base!(DataRate);

impl DataRate {
    pub const fn from_bps(bits_per_second: i64) -> Self {
        Self(bits_per_second)
    }

    pub fn from_kbps(kilobits_per_second: i64) -> Self {
        Self(kilobits_per_second.saturating_mul(1000))
    }

    pub fn from_bytes_per_second(bytes_per_second: i64) -> Self {
        Self(bytes_per_second.saturating_mul(8))
    }

    pub fn from_bps_f64(bits_per_second: f64) -> Self {
        if bits_per_second >= i64::MAX as f64 || bits_per_second == f64::INFINITY {
            Self::plus_infinity()
        } else {
            Self(bits_per_second.round().max(0.0) as i64)
        }
    }

    pub fn bps(self) -> i64 {
        debug_assert!(self.is_finite());
        self.0
    }

    pub fn kbps(self) -> i64 {
        div_round(self.bps(), 1000)
    }

    pub fn bytes_per_second(self) -> i64 {
        div_round(self.bps(), 8)
    }

    pub fn bps_f64(self) -> f64 {
        if self.is_plus_infinity() {
            f64::INFINITY
        } else {
            self.0 as f64
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

impl Add for DataRate {
    type Output = DataRate;
    fn add(self, rhs: DataRate) -> DataRate {
        DataRate(self.saturating_add_raw(rhs.0))
    }
}

impl AddAssign for DataRate {
    fn add_assign(&mut self, rhs: DataRate) {
        *self = *self + rhs;
    }
}

impl Sub for DataRate {
    type Output = DataRate;
    fn sub(self, rhs: DataRate) -> DataRate {
        debug_assert!(self.is_finite() && rhs.is_finite());
        DataRate(self.0.saturating_sub(rhs.0))
    }
}

impl Mul<f64> for DataRate {
    type Output = DataRate;
    fn mul(self, rhs: f64) -> DataRate {
        DataRate::from_bps_f64(self.bps_f64() * rhs)
    }
}

impl Mul<i64> for DataRate {
    type Output = DataRate;
    fn mul(self, rhs: i64) -> DataRate {
        debug_assert!(rhs >= 0);
        if self.is_infinite() {
            self
        } else {
            DataRate(self.0.saturating_mul(rhs))
        }
    }
}

/// rate * duration -> size. A finite rate over a finite duration is always a
/// finite size.
impl Mul<TimeDelta> for DataRate {
    type Output = DataSize;
    fn mul(self, rhs: TimeDelta) -> DataSize {
        debug_assert!(self.is_finite() && rhs.is_finite());
        let bits = self.bps() as i128 * rhs.micros() as i128;
        let bytes = (bits + 4_000_000) / 8_000_000;
        DataSize::from_bytes(bytes.clamp(0, i64::MAX as i128 - 1) as i64)
    }
}

impl Mul<DataRate> for TimeDelta {
    type Output = DataSize;
    fn mul(self, rhs: DataRate) -> DataSize {
        rhs * self
    }
}

impl Div<DataRate> for DataRate {
    type Output = f64;
    fn div(self, rhs: DataRate) -> f64 {
        self.bps_f64() / rhs.bps_f64()
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_plus_infinity() {
            write!(f, "+inf")
        } else if self.0 >= 10_000 {
            write!(f, "{} kbps", self.kbps())
        } else {
            write!(f, "{} bps", self.0)
        }
    }
}
