//! Strongly typed time and data-volume units.
//!
//! Every unit wraps a signed 64-bit count (microseconds, bits per second or
//! bytes) with two reserved sentinel values for plus and minus infinity.
//! Finite arithmetic saturates into the sentinels instead of wrapping, and
//! comparisons are total over the lattice {-inf, finite, +inf}. Down
//! conversions (for example microseconds to milliseconds) round half away
//! from zero.

mod data_rate;
mod data_size;
mod time_delta;
mod timestamp;

pub use data_rate::DataRate;
pub use data_size::DataSize;
pub use time_delta::TimeDelta;
pub use timestamp::Timestamp;

pub(crate) const PLUS_INFINITY_VAL: i64 = i64::MAX;
pub(crate) const MINUS_INFINITY_VAL: i64 = i64::MIN;

/// Integer division rounding half away from zero.
pub(crate) fn div_round(dividend: i64, divisor: i64) -> i64 {
    debug_assert!(divisor > 0);
    if dividend >= 0 {
        (dividend + divisor / 2) / divisor
    } else {
        (dividend - divisor / 2) / divisor
    }
}

/// Shared scaffolding for the unit types. The wrapped value is ordered so
/// that the derived `Ord` already respects the infinity lattice.
macro_rules! unit_base {
    ($name:ident) => {
        impl $name {
            pub const fn zero() -> Self {
                Self(0)
            }

            pub const fn plus_infinity() -> Self {
                Self(crate::units::PLUS_INFINITY_VAL)
            }

            pub const fn is_zero(self) -> bool {
                self.0 == 0
            }

            pub const fn is_plus_infinity(self) -> bool {
                self.0 == crate::units::PLUS_INFINITY_VAL
            }

            pub const fn is_minus_infinity(self) -> bool {
                self.0 == crate::units::MINUS_INFINITY_VAL
            }

            pub const fn is_infinite(self) -> bool {
                self.is_plus_infinity() || self.is_minus_infinity()
            }

            pub const fn is_finite(self) -> bool {
                !self.is_infinite()
            }

            /// Saturating sum that keeps the sentinels stable. Adding the two
            /// opposite infinities is a logic error.
            pub(crate) fn saturating_add_raw(self, rhs: i64) -> i64 {
                debug_assert!(
                    !(self.is_plus_infinity() && rhs == crate::units::MINUS_INFINITY_VAL)
                        && !(self.is_minus_infinity() && rhs == crate::units::PLUS_INFINITY_VAL),
                    "adding opposite infinities"
                );
                if self.is_infinite() {
                    self.0
                } else if rhs == crate::units::PLUS_INFINITY_VAL
                    || rhs == crate::units::MINUS_INFINITY_VAL
                {
                    rhs
                } else {
                    self.0.saturating_add(rhs)
                }
            }
        }
    };
}

pub(crate) use unit_base;
