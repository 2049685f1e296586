//! Decimal arithmetic helpers for money, quantities and line pricing.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Decimal places kept for monetary amounts.
pub const MONEY_SCALE: u32 = 2;
/// Decimal places kept for weighted-average unit costs.
pub const COST_SCALE: u32 = 4;

/// Round a monetary amount to cents (midpoint away from zero).
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Round a unit cost to four decimal places (midpoint away from zero).
pub fn round_cost(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(COST_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

fn out_of_range() -> DomainError {
    DomainError::validation("amount out of range")
}

/// `a + b`, failing instead of overflowing.
pub fn try_add(a: Decimal, b: Decimal) -> DomainResult<Decimal> {
    a.checked_add(b).ok_or_else(out_of_range)
}

/// `a - b`, failing instead of overflowing.
pub fn try_sub(a: Decimal, b: Decimal) -> DomainResult<Decimal> {
    a.checked_sub(b).ok_or_else(out_of_range)
}

/// `a * b`, failing instead of overflowing.
pub fn try_mul(a: Decimal, b: Decimal) -> DomainResult<Decimal> {
    a.checked_mul(b).ok_or_else(out_of_range)
}

/// `a / b`, failing on overflow or a zero divisor.
pub fn try_div(a: Decimal, b: Decimal) -> DomainResult<Decimal> {
    a.checked_div(b).ok_or_else(out_of_range)
}

/// Sum of `values`, failing instead of overflowing.
pub fn try_sum(values: impl IntoIterator<Item = Decimal>) -> DomainResult<Decimal> {
    values.into_iter().try_fold(Decimal::ZERO, try_add)
}

/// `value * percent / 100`, unrounded.
pub fn percent_of(value: Decimal, percent: Decimal) -> DomainResult<Decimal> {
    try_div(try_mul(value, percent)?, Decimal::ONE_HUNDRED)
}

pub fn ensure_positive(field: &str, value: Decimal) -> DomainResult<()> {
    if value <= Decimal::ZERO {
        return Err(DomainError::validation(format!(
            "{field} must be positive (got {value})"
        )));
    }
    Ok(())
}

pub fn ensure_non_negative(field: &str, value: Decimal) -> DomainResult<()> {
    if value < Decimal::ZERO {
        return Err(DomainError::validation(format!(
            "{field} cannot be negative (got {value})"
        )));
    }
    Ok(())
}

/// Percentages are accepted in the closed range `[0, 100]`.
pub fn ensure_percentage(field: &str, value: Decimal) -> DomainResult<()> {
    if value < Decimal::ZERO || value > Decimal::ONE_HUNDRED {
        return Err(DomainError::validation(format!(
            "{field} must be between 0 and 100 (got {value})"
        )));
    }
    Ok(())
}

/// Computed amounts of a single document line.
///
/// ```text
/// discount = unit_price * quantity * discount% / 100
/// subtotal = unit_price * quantity - discount
/// tax      = subtotal * tax% / 100
/// total    = subtotal + tax
/// ```
///
/// Every amount is rounded to cents after it is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinePricing {
    pub discount_amount: Decimal,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

impl LinePricing {
    pub fn compute(
        unit_price: Decimal,
        quantity: Decimal,
        discount_percent: Decimal,
        tax_percent: Decimal,
    ) -> DomainResult<Self> {
        ensure_positive("quantity", quantity)?;
        ensure_non_negative("unit price", unit_price)?;
        ensure_percentage("discount", discount_percent)?;
        ensure_percentage("tax rate", tax_percent)?;

        let gross = try_mul(unit_price, quantity)?;
        let discount_amount = round_money(percent_of(gross, discount_percent)?);
        let subtotal = round_money(gross - discount_amount);
        let tax_amount = round_money(percent_of(subtotal, tax_percent)?);
        let total = try_add(subtotal, tax_amount)?;

        Ok(Self {
            discount_amount,
            subtotal,
            tax_amount,
            total,
        })
    }
}

/// Document-level totals accumulated from its lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentTotals {
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

impl DocumentTotals {
    pub fn add_line(&mut self, line: &LinePricing) -> DomainResult<()> {
        *self = Self {
            subtotal: try_add(self.subtotal, line.subtotal)?,
            discount_amount: try_add(self.discount_amount, line.discount_amount)?,
            tax_amount: try_add(self.tax_amount, line.tax_amount)?,
            total: try_add(self.total, line.total)?,
        };
        Ok(())
    }

    pub fn from_lines(lines: impl IntoIterator<Item = LinePricing>) -> DomainResult<Self> {
        let mut totals = Self::default();
        for line in lines {
            totals.add_line(&line)?;
        }
        Ok(totals)
    }
}
