//! `stockledger-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the error model, aggregate traits, decimal money helpers and
//! the payment sub-ledger shared by transactional documents.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod money;
pub mod payment;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{
    BranchId, LedgerEntryId, OrganizationId, PartyId, ProductId, PurchaseId, SaleId, TransferId,
    UserId, WarehouseId,
};
pub use money::{DocumentTotals, LinePricing};
pub use payment::{Payment, PaymentMethod, PaymentStatus, Settlement};
pub use rust_decimal::Decimal;
