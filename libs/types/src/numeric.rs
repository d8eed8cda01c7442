//! Fixed-point decimal types for prices and quantities
//!
//! Uses rust_decimal so that book levels are keyed by exact values: the
//! exchange sends "50000.10" and "50000.1" for the same level, and both
//! must hit the same map entry. Decimals are normalized on construction.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ParseError;

/// A strictly positive price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(Decimal);

impl Price {
    /// Returns None unless `value > 0`.
    pub fn try_new(value: Decimal) -> Option<Self> {
        if value > Decimal::ZERO {
            Some(Self(value.normalize()))
        } else {
            None
        }
    }

    pub fn from_u64(value: u64) -> Self {
        Self(Decimal::from(value))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }
}

impl FromStr for Price {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s)
            .ok()
            .and_then(Self::try_new)
            .ok_or_else(|| ParseError::InvalidPrice(s.to_string()))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A non-negative quantity. Zero is meaningful: it removes a book level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(Decimal);

impl Quantity {
    pub const ZERO: Quantity = Quantity(Decimal::ZERO);

    /// Returns None for negative values.
    pub fn try_new(value: Decimal) -> Option<Self> {
        if value >= Decimal::ZERO {
            Some(Self(value.normalize()))
        } else {
            None
        }
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl FromStr for Quantity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s)
            .ok()
            .and_then(Self::try_new)
            .ok_or_else(|| ParseError::InvalidQuantity(s.to_string()))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_price_equal_after_normalization() {
        let a = Price::from_str("50000.10").unwrap();
        let b = Price::from_str("50000.1").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "50000.1");
    }

    #[test]
    fn test_price_rejects_non_positive() {
        assert!(Price::from_str("0").is_err());
        assert!(Price::from_str("-5").is_err());
        assert!(Price::from_str("abc").is_err());
    }

    #[test]
    fn test_quantity_zero_allowed() {
        let q = Quantity::from_str("0.000").unwrap();
        assert!(q.is_zero());
        assert_eq!(q, Quantity::ZERO);
        assert!(Quantity::from_str("-0.1").is_err());
    }

    #[test]
    fn test_serialized_as_string() {
        let p = Price::from_str("1.5").unwrap();
        assert_eq!(serde_json::to_string(&p).unwrap(), "\"1.5\"");
    }

    proptest! {
        #[test]
        fn prop_trailing_zeros_do_not_change_price(units in 1u64..10_000_000, zeros in 0usize..6) {
            let plain = Price::from_str(&format!("{}.5", units)).unwrap();
            let padded = Price::from_str(&format!("{}.5{}", units, "0".repeat(zeros))).unwrap();
            prop_assert_eq!(plain, padded);
        }
    }
}
