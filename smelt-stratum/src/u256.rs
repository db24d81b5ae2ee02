//! 256-bit unsigned integer arithmetic.
//!
//! Wraps `ruint::aliases::U256` to provide a stable interface for proof-of-work
//! target math. This adapter module exists so we can swap the underlying
//! library or implement our own arithmetic without changing callers.

use ruint::aliases::{U256 as Ruint256, U512 as Ruint512};
use std::fmt;
use std::ops::{Div, Mul};

/// A 256-bit unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct U256(Ruint256);

impl U256 {
    /// Zero constant.
    pub const ZERO: Self = Self(Ruint256::ZERO);

    /// Maximum value (2^256 - 1).
    pub const MAX: Self = Self(Ruint256::MAX);

    /// Create from little-endian bytes.
    ///
    /// Bitcoin hashes compare as little-endian numbers, so this is the entry
    /// point for turning a header hash into something comparable to a target.
    pub fn from_le_bytes(bytes: [u8; 32]) -> Self {
        Self(Ruint256::from_le_bytes(bytes))
    }

    /// Create from big-endian bytes.
    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(Ruint256::from_be_bytes(bytes))
    }

    /// Convert to little-endian bytes.
    pub fn to_le_bytes(self) -> [u8; 32] {
        self.0.to_le_bytes()
    }

    /// Convert to big-endian bytes.
    pub fn to_be_bytes(self) -> [u8; 32] {
        self.0.to_be_bytes()
    }

    /// Decode a compact "bits" encoding (nBits) into a full target.
    ///
    /// The compact format is a base-256 floating point number: one exponent
    /// byte followed by a 23-bit mantissa. Overflowing exponents saturate to
    /// `U256::MAX` rather than wrapping; the sign bit yields zero, matching
    /// consensus treatment of negative targets.
    pub fn from_compact(bits: u32) -> Self {
        let exponent = (bits >> 24) as usize;
        let mantissa = bits & 0x007f_ffff;
        if mantissa == 0 || bits & 0x0080_0000 != 0 {
            return Self::ZERO;
        }
        let value = Ruint256::from(mantissa);
        if exponent <= 3 {
            Self(value >> (8 * (3 - exponent)))
        } else if exponent > 34 {
            // exponent 35 already shifts the mantissa past bit 255
            Self::MAX
        } else {
            let shifted = Ruint512::from(value) << (8 * (exponent - 3));
            Self::from_wide(shifted)
        }
    }

    /// Divide by a positive floating point number, rounding down.
    ///
    /// Used to derive a session share target from a fractional difficulty.
    /// The divisor is converted to 32.32 fixed point; a divisor below the
    /// fixed point resolution saturates the quotient to `U256::MAX`.
    pub fn div_f64(self, divisor: f64) -> Self {
        const SCALE: u64 = 1 << 32;
        let scaled = divisor * SCALE as f64;
        if scaled < 1.0 {
            return Self::MAX;
        }
        let wide = Ruint512::from(self.0) * Ruint512::from(SCALE);
        Self::from_wide(wide / Ruint512::from(scaled as u128))
    }

    /// Convert to u64, saturating at u64::MAX.
    pub fn saturating_to_u64(self) -> u64 {
        self.0.saturating_to()
    }

    /// Truncate a 512-bit intermediate, saturating at `U256::MAX`.
    fn from_wide(wide: Ruint512) -> Self {
        let limbs = wide.as_limbs();
        if limbs[4..].iter().any(|&l| l != 0) {
            return Self::MAX;
        }
        Self(Ruint256::from_limbs([limbs[0], limbs[1], limbs[2], limbs[3]]))
    }
}

impl Div for U256 {
    type Output = Self;

    fn div(self, rhs: Self) -> Self::Output {
        Self(self.0 / rhs.0)
    }
}

impl Div<u64> for U256 {
    type Output = Self;

    fn div(self, rhs: u64) -> Self::Output {
        Self(self.0 / Ruint256::from(rhs))
    }
}

impl Mul<u64> for U256 {
    type Output = Self;

    fn mul(self, rhs: u64) -> Self::Output {
        Self(self.0 * Ruint256::from(rhs))
    }
}

impl fmt::Display for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
