//! Payment sub-ledger shared by sales and purchases.
//!
//! `paid_amount` is a running total maintained alongside each appended
//! payment; it is never re-derived by summing `payments`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::UserId;
use crate::money::{ensure_positive, try_add};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Partial,
    Paid,
}

impl PaymentStatus {
    /// Derive the status from the paid amount against the document total.
    pub fn derive(paid_amount: Decimal, total_amount: Decimal) -> Self {
        if paid_amount >= total_amount {
            PaymentStatus::Paid
        } else if paid_amount > Decimal::ZERO {
            PaymentStatus::Partial
        } else {
            PaymentStatus::Unpaid
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Upi,
    BankTransfer,
    Cheque,
    Credit,
    Wallet,
    Other,
}

impl PaymentMethod {
    /// Credit documents start unpaid and accrue an outstanding balance.
    pub fn is_credit(self) -> bool {
        matches!(self, PaymentMethod::Credit)
    }
}

/// One appended payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub recorded_by: UserId,
    pub paid_at: DateTime<Utc>,
}

/// Payment state of a transactional document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    total_amount: Decimal,
    paid_amount: Decimal,
    balance_amount: Decimal,
    payment_status: PaymentStatus,
    payments: Vec<Payment>,
}

impl Settlement {
    /// Opening settlement: credit documents start unpaid, anything else is
    /// settled in full at creation.
    pub fn open(total_amount: Decimal, method: PaymentMethod) -> Self {
        let paid_amount = if method.is_credit() {
            Decimal::ZERO
        } else {
            total_amount
        };
        let mut settlement = Self {
            total_amount,
            paid_amount,
            balance_amount: Decimal::ZERO,
            payment_status: PaymentStatus::Unpaid,
            payments: Vec::new(),
        };
        settlement.recompute();
        settlement
    }

    pub fn total_amount(&self) -> Decimal {
        self.total_amount
    }

    pub fn paid_amount(&self) -> Decimal {
        self.paid_amount
    }

    pub fn balance_amount(&self) -> Decimal {
        self.balance_amount
    }

    pub fn payment_status(&self) -> PaymentStatus {
        self.payment_status
    }

    pub fn payments(&self) -> &[Payment] {
        &self.payments
    }

    pub fn is_paid(&self) -> bool {
        self.payment_status == PaymentStatus::Paid
    }

    /// Check that `amount` may be recorded against this settlement.
    ///
    /// Amounts above the balance are accepted; the document becomes paid
    /// and the balance goes negative.
    pub fn validate_payment(&self, amount: Decimal) -> DomainResult<()> {
        if self.is_paid() {
            return Err(DomainError::AlreadyPaid);
        }
        ensure_positive("payment amount", amount)?;
        try_add(self.paid_amount, amount)?;
        Ok(())
    }

    /// Append a payment accepted by `validate_payment` and update the
    /// running totals.
    pub fn record(&mut self, payment: Payment) {
        self.paid_amount += payment.amount;
        self.payments.push(payment);
        self.recompute();
    }

    /// The single place where balance and status are derived.
    fn recompute(&mut self) {
        self.balance_amount = self.total_amount - self.paid_amount;
        self.payment_status = PaymentStatus::derive(self.paid_amount, self.total_amount);
    }
}
