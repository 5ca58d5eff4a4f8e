use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};

/// An amount in Chilean pesos, kept at two decimal places so that split
/// shares always add back up to the original amount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(Decimal);

impl Money {
    pub fn from_clp(amount: i64) -> Self {
        Money(Decimal::from(amount))
    }

    pub fn from_decimal(decimal: Decimal) -> Self {
        Money(decimal.round_dp(2))
    }

    pub fn zero() -> Self {
        Money(Decimal::ZERO)
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn as_decimal(self) -> Decimal {
        self.0
    }

    pub fn to_f64(self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }

    /// `pct` percent of this amount, rounded to cents.
    pub fn percent(self, pct: Decimal) -> Money {
        Money::from_decimal(self.0 * pct / Decimal::ONE_HUNDRED)
    }

    /// Splits the amount into `parts` equal pieces; the last piece absorbs the
    /// rounding remainder.
    pub fn installment(self, parts: u32, number: u32) -> Money {
        if parts == 0 {
            return Money::zero();
        }
        let base = Money::from_decimal(self.0 / Decimal::from(parts));
        if number >= parts {
            self - Money(base.0 * Decimal::from(parts - 1))
        } else {
            base
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0.round().abs().to_string();
        let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
        for (i, ch) in whole.chars().enumerate() {
            if i > 0 && (whole.len() - i) % 3 == 0 {
                grouped.push('.');
            }
            grouped.push(ch);
        }
        let sign = if self.is_negative() { "-" } else { "" };
        write!(f, "{sign}${grouped}")
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Money(self.0 - rhs.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), |a, b| a + b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_groups_thousands_with_dots() {
        assert_eq!(Money::from_clp(50_000).to_string(), "$50.000");
        assert_eq!(Money::from_clp(1_234_567).to_string(), "$1.234.567");
        assert_eq!(Money::from_clp(999).to_string(), "$999");
        assert_eq!(Money::zero().to_string(), "$0");
    }

    #[test]
    fn percent_rounds_to_cents() {
        let m = Money::from_clp(10_001);
        assert_eq!(m.percent(Decimal::from(50)), Money::from_decimal(Decimal::new(500050, 2)));
        assert_eq!(m.percent(Decimal::ZERO), Money::zero());
    }

    #[test]
    fn installments_sum_to_total() {
        let total = Money::from_clp(100_000);
        let parts: Money = (1..=3).map(|n| total.installment(3, n)).sum();
        assert_eq!(parts, total);
        assert_eq!(total.installment(3, 1), Money::from_decimal(Decimal::new(3333333, 2)));
        assert_eq!(total.installment(3, 3), Money::from_decimal(Decimal::new(3333334, 2)));
    }

    #[test]
    fn negative_detection() {
        assert!(Money::from_clp(-1).is_negative());
        assert!(!Money::zero().is_negative());
    }
}
