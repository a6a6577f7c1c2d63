//! Fixed-scale wire representation of reward amounts.
//!
//! All reward math runs on [`Decimal`]; a [`Wad`] is the 18-fractional-digit
//! unsigned integer the chain sees. Conversion into wire units always rounds
//! down, so a holder can never be paid more than the exact decimal amount.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{MiningError, MiningResult};

/// Number of fractional digits carried on the wire.
pub const WAD_DECIMALS: u32 = 18;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Wad(u128);

impl Wad {
    pub const ZERO: Wad = Wad(0);

    pub fn from_raw(raw: u128) -> Self {
        Wad(raw)
    }

    /// Converts a decimal amount into wire units, truncating anything beyond
    /// 18 fractional digits. Negative amounts are refused.
    pub fn from_decimal(value: Decimal) -> MiningResult<Self> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(MiningError::NegativeAmount(value));
        }
        let truncated = value.trunc_with_scale(WAD_DECIMALS);
        let mantissa = truncated.mantissa().unsigned_abs();
        let shift = 10u128.pow(WAD_DECIMALS - truncated.scale());
        mantissa
            .checked_mul(shift)
            .map(Wad)
            .ok_or(MiningError::AmountOverflow(value))
    }

    pub fn raw(self) -> u128 {
        self.0
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::from_i128_with_scale(self.0 as i128, WAD_DECIMALS).normalize()
    }

    /// Big-endian 256-bit word as expected by the contract ABI.
    pub fn to_abi_word(self) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[16..].copy_from_slice(&self.0.to_be_bytes());
        word
    }
}

impl fmt::Display for Wad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().expect("decimal literal")
    }

    #[test]
    fn conversion_rounds_down() {
        let wad = Wad::from_decimal(dec("1.0000000000000000019")).expect("wad");
        assert_eq!(wad.raw(), 1_000_000_000_000_000_001);
    }

    #[test]
    fn integral_amounts_scale_up() {
        let wad = Wad::from_decimal(dec("42")).expect("wad");
        assert_eq!(wad.raw(), 42_000_000_000_000_000_000);
        assert_eq!(wad.to_decimal(), dec("42"));
    }

    #[test]
    fn negative_amounts_are_refused() {
        assert!(matches!(
            Wad::from_decimal(dec("-0.5")),
            Err(MiningError::NegativeAmount(_))
        ));
    }

    #[test]
    fn abi_word_is_right_aligned() {
        let word = Wad::from_raw(0x0102).to_abi_word();
        assert_eq!(&word[..30], &[0u8; 30]);
        assert_eq!(&word[30..], &[0x01, 0x02]);
    }

    #[test]
    fn round_trips_through_decimal() {
        let original = dec("123.456789");
        let wad = Wad::from_decimal(original).expect("wad");
        assert_eq!(wad.to_decimal(), original);
    }
}
