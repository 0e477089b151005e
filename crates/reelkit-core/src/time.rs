// crates/reelkit-core/src/time.rs
//
// Rational time: a value measured against a rate (frames at 24 fps, samples
// at 48 kHz, seconds at rate 1). All composition math in reelkit runs on
// this type so frame boundaries stay exact across mixed-rate sources.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Neg, Sub};

/// Tolerance for rescaled comparisons. Rescaling between common media rates
/// (24, 25, 30000/1001, 48000) keeps errors far below this.
pub const TIME_EPSILON: f64 = 1e-6;

/// A point in time (or a duration) expressed as `value` units at `rate`
/// units per second.
///
/// Derived `PartialEq` compares the raw `(value, rate)` fields; use
/// [`time_equals`] to compare across rates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RationalTime {
    pub value: f64,
    pub rate:  f64,
}

impl RationalTime {
    /// Sentinel for "no time". Never equal to any valid time since valid
    /// times require `rate > 0`.
    pub const INVALID: RationalTime = RationalTime { value: 0.0, rate: -1.0 };

    pub fn new(value: f64, rate: f64) -> Self {
        Self { value, rate }
    }

    /// The smallest representable step at `rate` — one frame, one sample.
    pub fn one_tick(rate: f64) -> Self {
        Self { value: 1.0, rate }
    }

    pub fn from_seconds(seconds: f64, rate: f64) -> Self {
        Self { value: seconds * rate, rate }
    }

    pub fn is_invalid(&self) -> bool {
        self.rate <= 0.0 || !self.value.is_finite() || !self.rate.is_finite()
    }

    pub fn to_seconds(&self) -> f64 {
        self.value / self.rate
    }

    /// The same point in time expressed at a different rate.
    pub fn rescaled_to(&self, rate: f64) -> Self {
        if self.rate == rate {
            return *self;
        }
        Self { value: self.value * rate / self.rate, rate }
    }

    pub fn floor(&self) -> Self {
        Self { value: self.value.floor(), rate: self.rate }
    }

    pub fn ceil(&self) -> Self {
        Self { value: self.value.ceil(), rate: self.rate }
    }

    pub fn round(&self) -> Self {
        Self { value: self.value.round(), rate: self.rate }
    }

    /// Rounded integer frame index at this time's own rate.
    pub fn frame(&self) -> i64 {
        self.value.round() as i64
    }
}

impl Default for RationalTime {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for RationalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.value, self.rate)
    }
}

// Arithmetic rescales the right operand to the left operand's rate.

impl Add for RationalTime {
    type Output = RationalTime;
    fn add(self, rhs: RationalTime) -> RationalTime {
        let rhs = rhs.rescaled_to(self.rate);
        RationalTime { value: self.value + rhs.value, rate: self.rate }
    }
}

impl Sub for RationalTime {
    type Output = RationalTime;
    fn sub(self, rhs: RationalTime) -> RationalTime {
        let rhs = rhs.rescaled_to(self.rate);
        RationalTime { value: self.value - rhs.value, rate: self.rate }
    }
}

impl Neg for RationalTime {
    type Output = RationalTime;
    fn neg(self) -> RationalTime {
        RationalTime { value: -self.value, rate: self.rate }
    }
}

/// Compare two times as points on the clock, rescaling `a` to `b`'s rate.
///
/// `(12, 24)` equals `(0.5, 1)` here, while derived `==` says they differ.
/// Two invalid times compare equal to each other and unequal to everything
/// else.
pub fn time_equals(a: RationalTime, b: RationalTime) -> bool {
    if a.is_invalid() || b.is_invalid() {
        return a.is_invalid() && b.is_invalid();
    }
    (a.rescaled_to(b.rate).value - b.value).abs() < TIME_EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_preserves_seconds() {
        let t = RationalTime::new(12.0, 24.0);
        let r = t.rescaled_to(48.0);
        assert_eq!(r.value, 24.0);
        assert_eq!(t.to_seconds(), r.to_seconds());
    }

    #[test]
    fn invalid_never_equals_valid() {
        let t = RationalTime::new(0.0, 24.0);
        assert_ne!(RationalTime::INVALID, t);
        assert!(!time_equals(RationalTime::INVALID, t));
        assert!(time_equals(RationalTime::INVALID, RationalTime::INVALID));
    }

    #[test]
    fn time_equals_crosses_rates() {
        let a = RationalTime::new(12.0, 24.0);
        let b = RationalTime::new(0.5, 1.0);
        assert_ne!(a, b);
        assert!(time_equals(a, b));
    }

    #[test]
    fn arithmetic_rescales_rhs() {
        let a = RationalTime::new(24.0, 24.0);
        let b = RationalTime::new(1.0, 1.0);
        let sum = a + b;
        assert_eq!(sum.rate, 24.0);
        assert_eq!(sum.value, 48.0);
        let diff = a - b;
        assert_eq!(diff.value, 0.0);
    }

    #[test]
    fn seconds_round_trip() {
        let t = RationalTime::from_seconds(2.5, 24.0);
        assert_eq!(t.value, 60.0);
        assert_eq!(t.to_seconds(), 2.5);
    }
}
