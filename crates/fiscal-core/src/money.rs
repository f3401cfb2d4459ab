//! # Money Module
//!
//! Provides the `Money` type for handling monetary values safely.
//!
//! ## Why Integer Money?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  THE FLOATING POINT PROBLEM                                             │
//! │                                                                         │
//! │  The authority rejects an invoice when                                  │
//! │    ImpTotal != ImpNeto + ImpOpEx + ImpTotConc + ImpIVA                  │
//! │                                                                         │
//! │  With floats: 100.10 + 21.02 = 121.11999999999999  ❌ REJECTED          │
//! │                                                                         │
//! │  OUR SOLUTION: Integer Cents                                            │
//! │    10010 + 2102 = 12112 → "121.12"                                      │
//! │    Decimal text is produced only at the wire boundary                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use fiscal_core::money::Money;
//!
//! let net = Money::from_cents(10_000);
//! assert_eq!(net.to_wire(), "100.00");
//! assert_eq!(Money::from_wire("121.5").unwrap().cents(), 12_150);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};
use ts_rs::TS;

use crate::error::ValidationError;
use crate::types::TaxRate;

// =============================================================================
// Money Type
// =============================================================================

/// Represents a monetary value in cents of the local currency.
///
/// ## Design Decisions
/// - **i64 (signed)**: credit notes carry the same positive amounts, but
///   intermediate differences may be negative
/// - **Single field tuple struct**: Zero-cost abstraction over i64
/// - **Wire format**: the authority exchanges amounts as decimal text with two
///   fraction digits; conversion happens only in [`Money::to_wire`] and
///   [`Money::from_wire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Money(i64);

impl Money {
    /// Creates a Money value from cents.
    #[inline]
    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    /// Returns the value in cents.
    #[inline]
    pub const fn cents(&self) -> i64 {
        self.0
    }

    /// Returns zero money value.
    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    /// Checks if the value is zero.
    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Checks if the value is negative (less than zero).
    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Returns the absolute value.
    #[inline]
    pub const fn abs(&self) -> Self {
        Money(self.0.abs())
    }

    /// Calculates tax on this amount, rounding half away from zero.
    ///
    /// ## Implementation
    /// Integer math: `(amount * bps + 5000) / 10000`
    ///
    /// ## Example
    /// ```rust
    /// use fiscal_core::money::Money;
    /// use fiscal_core::types::TaxRate;
    ///
    /// let base = Money::from_cents(1_000);          // 10.00
    /// let tax = base.calculate_tax(TaxRate::from_bps(1_050)); // 10.5%
    /// assert_eq!(tax.cents(), 105);
    /// ```
    /// Addition that reports overflow instead of wrapping or panicking.
    #[inline]
    pub const fn checked_add(self, other: Money) -> Option<Money> {
        match self.0.checked_add(other.0) {
            Some(cents) => Some(Money(cents)),
            None => None,
        }
    }

    pub fn calculate_tax(&self, rate: TaxRate) -> Money {
        // i128 prevents overflow on large amounts
        let product = self.0 as i128 * rate.bps() as i128;
        let rounded = if product >= 0 {
            (product + 5000) / 10000
        } else {
            (product - 5000) / 10000
        };
        Money::from_cents(rounded as i64)
    }

    /// Formats the amount the way the authority expects it: `"121.00"`.
    pub fn to_wire(&self) -> String {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        format!("{}{}.{:02}", sign, abs / 100, abs % 100)
    }

    /// Parses a decimal amount as returned by the authority.
    ///
    /// Accepts `"121"`, `"121.5"` and `"121.50"`. More than two fraction
    /// digits are accepted only when the extra digits are zero.
    pub fn from_wire(text: &str) -> Result<Money, ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidFormat {
            field: "amount".to_string(),
            reason: format!("{}: '{}'", reason, text),
        };

        let text = text.trim();
        let (negative, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };

        let (whole, fraction) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };

        if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid("not a decimal number"));
        }
        if !fraction.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid("not a decimal number"));
        }
        if fraction.len() > 2 && fraction[2..].chars().any(|c| c != '0') {
            return Err(invalid("more than two significant decimals"));
        }

        let whole: i64 = whole.parse().map_err(|_| invalid("amount too large"))?;
        let cents = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<i64>().map_err(|_| invalid("bad fraction"))? * 10,
            _ => fraction[..2].parse::<i64>().map_err(|_| invalid("bad fraction"))?,
        };

        let value = whole
            .checked_mul(100)
            .and_then(|v| v.checked_add(cents))
            .ok_or_else(|| invalid("amount too large"))?;

        Ok(Money(if negative { -value } else { value }))
    }
}

// =============================================================================
// Trait Implementations
// =============================================================================

/// Display shows the amount with a currency sign, for logs only.
impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.to_wire();
        match text.strip_prefix('-') {
            Some(rest) => write!(f, "-${}", rest),
            None => write!(f, "${}", text),
        }
    }
}

impl Default for Money {
    fn default() -> Self {
        Money::zero()
    }
}

impl Add for Money {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sub for Money {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Money(self.0 - other.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), |acc, m| acc + m)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
