//! [`Q16`] – unsigned 16-bit fixed-point confidence in `[0, 1]`.
//!
//! Probability math that ends up in logs, the persisted snapshot, or is
//! compared across nodes is carried as a `Q16` so it is stable at the byte
//! level.  `0` is 0 % and `65535` is 100 %.
//!
//! Encoding rounds to the nearest representable step, which makes
//! `Q16::from_float(q.to_float()) == q` exact for every `q`.
//!
//! ```
//! use trustgate_types::Q16;
//!
//! let q = Q16::from_float(0.75);
//! assert_eq!(q.raw(), 49151);
//! assert_eq!(Q16::from_float(q.to_float()), q);
//! assert_eq!(Q16::from_float(7.0), Q16::MAX);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fixed-point confidence value, `raw / 65535`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Q16(u16);

impl Q16 {
    /// 0 %.
    pub const ZERO: Q16 = Q16(0);
    /// 100 %.
    pub const MAX: Q16 = Q16(u16::MAX);
    /// The midpoint, just above 50 %.
    pub const HALF: Q16 = Q16(32768);

    const SCALE: f64 = u16::MAX as f64;

    /// Wrap a raw fixed-point value.
    pub const fn from_raw(raw: u16) -> Self {
        Q16(raw)
    }

    /// The raw fixed-point value.
    pub const fn raw(self) -> u16 {
        self.0
    }

    /// Decode to a float in `[0, 1]`.
    pub fn to_float(self) -> f64 {
        f64::from(self.0) / Self::SCALE
    }

    /// Encode a float, clamping to `[0, 1]` first.  `NaN` encodes as zero.
    pub fn from_float(f: f64) -> Self {
        if f.is_nan() {
            return Q16::ZERO;
        }
        Q16((f.clamp(0.0, 1.0) * Self::SCALE).round() as u16)
    }

    /// Fixed-point product `(a * b) / 65535`, truncated.
    pub fn multiply(self, other: Q16) -> Q16 {
        let product = u32::from(self.0) * u32::from(other.0) / u32::from(u16::MAX);
        Q16(product as u16)
    }

    /// Whole-number percentage for display.
    pub fn percentage(self) -> u8 {
        (self.to_float() * 100.0).round() as u8
    }
}

impl fmt::Display for Q16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/65535 ({}%)", self.0, self.percentage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_is_exact_for_every_raw_value() {
        for raw in 0..=u16::MAX {
            let q = Q16::from_raw(raw);
            assert_eq!(Q16::from_float(q.to_float()), q, "raw {raw}");
        }
    }

    #[test]
    fn decode_of_encode_is_within_one_unit() {
        let unit = 1.0 / 65535.0;
        let mut f = -0.25;
        while f <= 1.25 {
            let back = Q16::from_float(f).to_float();
            assert!((back - f.clamp(0.0, 1.0)).abs() <= unit, "f = {f}");
            f += 0.0013;
        }
    }

    #[test]
    fn out_of_range_and_nan_are_clamped() {
        assert_eq!(Q16::from_float(-3.0), Q16::ZERO);
        assert_eq!(Q16::from_float(1.5), Q16::MAX);
        assert_eq!(Q16::from_float(f64::NAN), Q16::ZERO);
        assert_eq!(Q16::from_float(f64::INFINITY), Q16::MAX);
    }

    #[test]
    fn multiply_scales_like_probabilities() {
        assert_eq!(Q16::MAX.multiply(Q16::MAX), Q16::MAX);
        assert_eq!(Q16::MAX.multiply(Q16::ZERO), Q16::ZERO);
        let half = Q16::from_float(0.5);
        let quarter = half.multiply(half);
        assert!((quarter.to_float() - 0.25).abs() < 1e-4);
    }

    #[test]
    fn percentage_rounds() {
        assert_eq!(Q16::MAX.percentage(), 100);
        assert_eq!(Q16::from_float(0.404).percentage(), 40);
    }

    #[test]
    fn serializes_as_bare_integer() {
        let json = serde_json::to_string(&Q16::from_raw(40000)).unwrap();
        assert_eq!(json, "40000");
    }
}
