//! The stock ledger: an append-only journal of every quantity change.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockledger_core::{
    BranchId, Decimal, DomainError, DomainResult, LedgerEntryId, OrganizationId, ProductId,
    UserId, WarehouseId,
};

/// Which way a movement type moves stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inflow,
    Outflow,
    /// Adjustments set an absolute quantity and may go either way.
    Either,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    Purchase,
    Sale,
    SaleReturn,
    PurchaseReturn,
    TransferIn,
    TransferOut,
    Adjustment,
    Opening,
    Damage,
    Expired,
    Production,
}

impl MovementType {
    pub const ALL: [MovementType; 11] = [
        MovementType::Purchase,
        MovementType::Sale,
        MovementType::SaleReturn,
        MovementType::PurchaseReturn,
        MovementType::TransferIn,
        MovementType::TransferOut,
        MovementType::Adjustment,
        MovementType::Opening,
        MovementType::Damage,
        MovementType::Expired,
        MovementType::Production,
    ];

    pub fn direction(self) -> Direction {
        match self {
            MovementType::Purchase
            | MovementType::SaleReturn
            | MovementType::TransferIn
            | MovementType::Opening
            | MovementType::Production => Direction::Inflow,
            MovementType::Sale
            | MovementType::PurchaseReturn
            | MovementType::TransferOut
            | MovementType::Damage
            | MovementType::Expired => Direction::Outflow,
            MovementType::Adjustment => Direction::Either,
        }
    }

    /// Inflows that revise the weighted average cost. Returns come back at
    /// the existing average and leave it untouched.
    pub fn revises_cost(self) -> bool {
        matches!(
            self,
            MovementType::Purchase
                | MovementType::Opening
                | MovementType::Production
                | MovementType::TransferIn
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MovementType::Purchase => "purchase",
            MovementType::Sale => "sale",
            MovementType::SaleReturn => "sale_return",
            MovementType::PurchaseReturn => "purchase_return",
            MovementType::TransferIn => "transfer_in",
            MovementType::TransferOut => "transfer_out",
            MovementType::Adjustment => "adjustment",
            MovementType::Opening => "opening",
            MovementType::Damage => "damage",
            MovementType::Expired => "expired",
            MovementType::Production => "production",
        }
    }
}

impl core::fmt::Display for MovementType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for MovementType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MovementType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown movement type: {s}")))
    }
}

/// Kind of document that originated a movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    Purchase,
    Sale,
    Transfer,
    Adjustment,
    Opening,
    Production,
}

/// Pointer from a ledger entry back to its originating document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    pub reference_type: ReferenceType,
    pub reference_id: Uuid,
    pub reference_number: Option<String>,
}

impl Reference {
    pub fn new(reference_type: ReferenceType, reference_id: impl Into<Uuid>) -> Self {
        Self {
            reference_type,
            reference_id: reference_id.into(),
            reference_number: None,
        }
    }

    pub fn with_number(mut self, number: impl Into<String>) -> Self {
        self.reference_number = Some(number.into());
        self
    }
}

/// Immutable ledger row.
///
/// `sequence` is zero until the store assigns one at commit; committed
/// entries are strictly increasing per organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLedgerEntry {
    pub id: LedgerEntryId,
    pub sequence: u64,
    pub organization_id: OrganizationId,
    pub branch_id: BranchId,
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub quantity_change: Decimal,
    pub previous_quantity: Decimal,
    pub new_quantity: Decimal,
    pub movement_type: MovementType,
    pub reference: Reference,
    pub unit_cost: Decimal,
    pub total_cost: Decimal,
    pub batch_number: Option<String>,
    pub expiry_date: Option<NaiveDate>,
    pub manufacturing_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub performed_by: UserId,
    pub performed_at: DateTime<Utc>,
    pub source_warehouse_id: Option<WarehouseId>,
    pub destination_warehouse_id: Option<WarehouseId>,
}

impl StockLedgerEntry {
    pub fn is_inflow(&self) -> bool {
        self.quantity_change > Decimal::ZERO
    }

    /// Quantity physically moved, regardless of sign.
    pub fn moved_quantity(&self) -> Decimal {
        self.quantity_change.abs()
    }
}

/// Ledger filter. Every field is optional; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerQuery {
    pub product_id: Option<ProductId>,
    pub warehouse_id: Option<WarehouseId>,
    pub movement_type: Option<MovementType>,
    pub reference_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl LedgerQuery {
    pub fn for_stock(warehouse_id: WarehouseId, product_id: ProductId) -> Self {
        Self {
            product_id: Some(product_id),
            warehouse_id: Some(warehouse_id),
            ..Self::default()
        }
    }

    pub fn for_reference(reference_id: impl Into<Uuid>) -> Self {
        Self {
            reference_id: Some(reference_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &StockLedgerEntry) -> bool {
        self.product_id.is_none_or(|p| p == entry.product_id)
            && self.warehouse_id.is_none_or(|w| w == entry.warehouse_id)
            && self.movement_type.is_none_or(|t| t == entry.movement_type)
            && self
                .reference_id
                .is_none_or(|r| r == entry.reference.reference_id)
            && self.from.is_none_or(|from| entry.performed_at >= from)
            && self.to.is_none_or(|to| entry.performed_at <= to)
    }
}

/// Replays ledger entries of one (warehouse, product) pair in sequence order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerReplay {
    pub quantity: Decimal,
    pub entries: usize,
    pub last_sequence: u64,
}

impl LedgerReplay {
    /// Fold `entries` (which must be sorted by sequence) into a running quantity.
    ///
    /// Fails when the chain is broken: an entry whose `previous_quantity`
    /// differs from the running total, whose `new_quantity` is not
    /// `previous + change`, or that is out of order.
    pub fn replay<'a>(
        entries: impl IntoIterator<Item = &'a StockLedgerEntry>,
    ) -> DomainResult<Self> {
        let mut state = LedgerReplay::default();
        for entry in entries {
            if state.entries > 0 && entry.sequence <= state.last_sequence {
                return Err(DomainError::invariant(format!(
                    "ledger entry {} out of sequence order",
                    entry.id
                )));
            }
            if entry.previous_quantity != state.quantity {
                return Err(DomainError::invariant(format!(
                    "ledger entry {} starts at {} but running quantity is {}",
                    entry.id, entry.previous_quantity, state.quantity
                )));
            }
            if entry.previous_quantity.checked_add(entry.quantity_change) != Some(entry.new_quantity) {
                return Err(DomainError::invariant(format!(
                    "ledger entry {} does not add up",
                    entry.id
                )));
            }
            state.quantity = entry.new_quantity;
            state.entries += 1;
            state.last_sequence = entry.sequence;
        }
        Ok(state)
    }
}
