// amount.rs
// Fixed-point token quantities with 8 fractional digits.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const TOKEN_DECIMALS: u32 = 8;
pub const UNITS_PER_TOKEN: u64 = 100_000_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("empty token amount")]
    Empty,
    #[error("invalid token amount `{0}`")]
    Invalid(String),
    #[error("token amount `{0}` is out of range")]
    Overflow(String),
}

/// A token quantity in base units (1 token = 10^8 units).
///
/// Every conversion from a decimal representation truncates past the eighth
/// fractional digit, so values held here are already `floor8`-ed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenAmount(u64);

impl TokenAmount {
    pub const ZERO: TokenAmount = TokenAmount(0);

    pub const fn from_units(units: u64) -> Self {
        Self(units)
    }

    pub const fn units(self) -> u64 {
        self.0
    }

    pub fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl FromStr for TokenAmount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AmountError::Empty);
        }
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(AmountError::Invalid(s.to_string()));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(AmountError::Invalid(s.to_string()));
        }

        let whole_units = if whole.is_empty() {
            0
        } else {
            whole
                .parse::<u64>()
                .ok()
                .and_then(|w| w.checked_mul(UNITS_PER_TOKEN))
                .ok_or_else(|| AmountError::Overflow(s.to_string()))?
        };

        // floor8: digits past the eighth are dropped, never rounded
        let mut frac_units: u64 = 0;
        for (i, c) in frac.chars().take(TOKEN_DECIMALS as usize).enumerate() {
            let digit = c.to_digit(10).unwrap_or(0) as u64;
            frac_units += digit * 10u64.pow(TOKEN_DECIMALS - 1 - i as u32);
        }

        whole_units
            .checked_add(frac_units)
            .map(Self)
            .ok_or_else(|| AmountError::Overflow(s.to_string()))
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / UNITS_PER_TOKEN;
        let frac = self.0 % UNITS_PER_TOKEN;
        if frac == 0 {
            return write!(f, "{whole}");
        }
        let digits = format!("{frac:08}");
        write!(f, "{whole}.{}", digits.trim_end_matches('0'))
    }
}

impl std::iter::Sum for TokenAmount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(TokenAmount::ZERO, TokenAmount::saturating_add)
    }
}
