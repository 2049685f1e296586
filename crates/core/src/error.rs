//! Domain error model.

use rust_decimal::Decimal;
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, conflicts). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. negative quantity, malformed id).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced entity does not exist within the caller's organization.
    #[error("{0} not found")]
    NotFound(String),

    /// The requested quantity exceeds what is available at the warehouse.
    #[error("insufficient stock for {product}: requested {requested}, available {available}")]
    InsufficientStock {
        product: String,
        requested: Decimal,
        available: Decimal,
    },

    #[error("document is already fully paid")]
    AlreadyPaid,

    #[error("document is already cancelled")]
    AlreadyCancelled,

    /// A transfer action is not valid for the transfer's current status.
    #[error("cannot {action} a transfer in status {status}")]
    InvalidTransferState { status: String, action: String },

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// A conflict occurred (e.g. stale version / optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(entity: impl Into<String>) -> Self {
        Self::NotFound(entity.into())
    }

    pub fn insufficient_stock(
        product: impl Into<String>,
        requested: Decimal,
        available: Decimal,
    ) -> Self {
        Self::InsufficientStock {
            product: product.into(),
            requested,
            available,
        }
    }

    pub fn invalid_transfer_state(status: impl Into<String>, action: impl Into<String>) -> Self {
        Self::InvalidTransferState {
            status: status.into(),
            action: action.into(),
        }
    }

    /// Replace the product label of an `InsufficientStock` error.
    ///
    /// Aggregates only know product ids; callers that resolved the product
    /// document use this to report the human-readable name.
    pub fn with_product_label(self, label: &str) -> Self {
        match self {
            Self::InsufficientStock {
                requested,
                available,
                ..
            } => Self::InsufficientStock {
                product: label.to_string(),
                requested,
                available,
            },
            other => other,
        }
    }
}
