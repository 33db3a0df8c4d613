use crate::error::DispatchError;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of minor units in one major currency unit (fen per yuan).
pub const MINOR_UNITS_SCALE: u32 = 2;

/// A wallet balance in minor currency units.
///
/// Balances never use floating point. Arithmetic is checked so an overflow
/// surfaces as an error instead of wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Balance(pub i64);

/// A strictly positive amount of money in minor currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Amount(i64);

impl Amount {
    pub fn new(value: i64) -> Result<Self, DispatchError> {
        if value > 0 {
            Ok(Self(value))
        } else {
            Err(DispatchError::Validation(
                "Amount must be positive".to_string(),
            ))
        }
    }

    /// For constants; panics at compile time on a non-positive value.
    pub const fn from_const(value: i64) -> Self {
        assert!(value > 0, "Amount must be positive");
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    /// Multiplies a per-unit price by a unit count.
    pub fn times(self, units: u32) -> Result<Self, DispatchError> {
        self.0
            .checked_mul(i64::from(units))
            .ok_or_else(|| DispatchError::Validation("Amount overflow".to_string()))
            .and_then(Self::new)
    }

    /// The amount in major units, exact.
    pub fn to_major(self) -> Decimal {
        Decimal::new(self.0, MINOR_UNITS_SCALE)
    }

    /// Parses an amount written in major units. Fractions finer than one
    /// minor unit are rejected rather than rounded.
    pub fn from_major(value: Decimal) -> Result<Self, DispatchError> {
        let minor = value
            .checked_mul(Decimal::from(10_i64.pow(MINOR_UNITS_SCALE)))
            .ok_or_else(|| DispatchError::Validation("Amount overflow".to_string()))?;
        if !minor.fract().is_zero() {
            return Err(DispatchError::Validation(format!(
                "Amount {value} has more than {MINOR_UNITS_SCALE} decimal places"
            )));
        }
        minor
            .to_i64()
            .ok_or_else(|| DispatchError::Validation(format!("Amount {value} out of range")))
            .and_then(Self::new)
    }
}

impl TryFrom<i64> for Amount {
    type Error = DispatchError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for i64 {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_major())
    }
}

impl Balance {
    pub const ZERO: Self = Self(0);

    pub fn new(minor_units: i64) -> Self {
        Self(minor_units)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn credit(self, amount: Amount) -> Result<Self, DispatchError> {
        self.0
            .checked_add(amount.0)
            .map(Self)
            .ok_or_else(|| DispatchError::Validation("Balance overflow".to_string()))
    }

    pub fn debit(self, amount: Amount) -> Result<Self, DispatchError> {
        self.0
            .checked_sub(amount.0)
            .map(Self)
            .ok_or_else(|| DispatchError::Validation("Balance underflow".to_string()))
    }

    pub fn covers(&self, amount: Amount) -> bool {
        self.0 >= amount.0
    }

    pub fn to_major(self) -> Decimal {
        Decimal::new(self.0, MINOR_UNITS_SCALE)
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_major())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_balance_arithmetic() {
        let balance = Balance::new(1000);
        let amount = Amount::new(250).unwrap();
        assert_eq!(balance.credit(amount).unwrap(), Balance::new(1250));
        assert_eq!(balance.debit(amount).unwrap(), Balance::new(750));
        assert!(balance.covers(amount));
        assert!(!Balance::ZERO.covers(amount));
    }

    #[test]
    fn test_amount_validation() {
        assert!(Amount::new(1).is_ok());
        assert!(matches!(
            Amount::new(0),
            Err(DispatchError::Validation(_))
        ));
        assert!(matches!(
            Amount::new(-1),
            Err(DispatchError::Validation(_))
        ));
    }

    #[test]
    fn test_overflow_is_an_error() {
        let max = Balance::new(i64::MAX);
        assert!(max.credit(Amount::new(1).unwrap()).is_err());
        let price = Amount::new(i64::MAX / 2).unwrap();
        assert!(price.times(3).is_err());
        assert_eq!(Amount::new(200).unwrap().times(3).unwrap().value(), 600);
    }

    #[test]
    fn test_major_units_are_exact() {
        assert_eq!(Amount::new(1234).unwrap().to_major(), dec!(12.34));
        assert_eq!(Balance::new(-5).to_major(), dec!(-0.05));
        assert_eq!(Amount::new(20000).unwrap().to_string(), "200.00");
    }

    #[test]
    fn test_parse_major_units() {
        assert_eq!(Amount::from_major(dec!(12.34)).unwrap().value(), 1234);
        assert_eq!(Amount::from_major(dec!(5)).unwrap().value(), 500);
        assert!(matches!(
            Amount::from_major(dec!(0.001)),
            Err(DispatchError::Validation(_))
        ));
        assert!(Amount::from_major(dec!(-1.00)).is_err());
        assert!(Amount::from_major(dec!(0)).is_err());
    }
}
