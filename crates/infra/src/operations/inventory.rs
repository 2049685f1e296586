//! Direct stock movements: receipts, issues, adjustments and returns.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{Decimal, DomainError, LedgerEntryId, ProductId, UserId, WarehouseId};
use stockledger_inventory::{MovementType, Reference};

use crate::dispatcher::{DispatchError, Operation};
use crate::engine::{self, Movement, MovementMeta, ReceiptBatch, StockInRequest, StockOutRequest};
use crate::store::InventoryStore;
use crate::unit_of_work::UnitOfWork;

/// Receive stock outside of a purchase (opening balance, production, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockIn {
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub quantity: Decimal,
    pub unit_cost: Option<Decimal>,
    pub movement_type: MovementType,
    /// Originating document; manual movements reference themselves.
    pub reference: Option<Reference>,
    pub batch_number: Option<String>,
    pub expiry_date: Option<NaiveDate>,
    pub manufacturing_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub performed_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl Operation for StockIn {
    type Output = Movement;

    fn name(&self) -> &'static str {
        "stock_in"
    }

    async fn run<S>(&self, uow: &mut UnitOfWork<'_, S>) -> Result<Movement, DispatchError>
    where
        S: InventoryStore + ?Sized,
    {
        let reference = self
            .reference
            .clone()
            .unwrap_or_else(|| engine::manual_reference(self.movement_type));
        let batch = (self.batch_number.is_some() || self.expiry_date.is_some()).then(|| {
            ReceiptBatch {
                batch_number: self.batch_number.clone(),
                expiry_date: self.expiry_date,
                manufacturing_date: self.manufacturing_date,
            }
        });

        engine::stock_in(
            uow,
            StockInRequest {
                product_id: self.product_id,
                warehouse_id: self.warehouse_id,
                quantity: self.quantity,
                unit_cost: self.unit_cost,
                movement_type: self.movement_type,
                batch,
                meta: MovementMeta::new(reference, self.performed_by, self.occurred_at)
                    .with_notes(self.notes.clone()),
            },
        )
        .await
    }
}

/// Issue stock outside of a sale or transfer (damage, expiry, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockOut {
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub quantity: Decimal,
    pub movement_type: MovementType,
    pub reference: Option<Reference>,
    pub notes: Option<String>,
    pub performed_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl Operation for StockOut {
    type Output = Movement;

    fn name(&self) -> &'static str {
        "stock_out"
    }

    async fn run<S>(&self, uow: &mut UnitOfWork<'_, S>) -> Result<Movement, DispatchError>
    where
        S: InventoryStore + ?Sized,
    {
        let reference = self
            .reference
            .clone()
            .unwrap_or_else(|| engine::manual_reference(self.movement_type));

        engine::stock_out(
            uow,
            StockOutRequest {
                product_id: self.product_id,
                warehouse_id: self.warehouse_id,
                quantity: self.quantity,
                movement_type: self.movement_type,
                meta: MovementMeta::new(reference, self.performed_by, self.occurred_at)
                    .with_notes(self.notes.clone()),
            },
        )
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustStock {
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub new_quantity: Decimal,
    pub reason: String,
    pub notes: Option<String>,
    pub performed_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl Operation for AdjustStock {
    type Output = Movement;

    fn name(&self) -> &'static str {
        "adjust_stock"
    }

    async fn run<S>(&self, uow: &mut UnitOfWork<'_, S>) -> Result<Movement, DispatchError>
    where
        S: InventoryStore + ?Sized,
    {
        let reason = self.reason.trim();
        if reason.is_empty() {
            return Err(DomainError::validation("adjustment reason is required").into());
        }

        engine::adjust(
            uow,
            self.product_id,
            self.warehouse_id,
            self.new_quantity,
            reason,
            self.notes.as_deref(),
            self.performed_by,
            self.occurred_at,
        )
        .await
    }
}

/// Return part of an earlier sale or purchase movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnStock {
    pub entry_id: LedgerEntryId,
    pub quantity: Decimal,
    pub notes: Option<String>,
    pub performed_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl Operation for ReturnStock {
    type Output = Movement;

    fn name(&self) -> &'static str {
        "return_stock"
    }

    async fn run<S>(&self, uow: &mut UnitOfWork<'_, S>) -> Result<Movement, DispatchError>
    where
        S: InventoryStore + ?Sized,
    {
        let original = uow
            .ledger_entry(self.entry_id)
            .await?
            .ok_or_else(|| DomainError::not_found("ledger entry"))?;

        engine::return_stock(
            uow,
            &original,
            self.quantity,
            self.performed_by,
            self.occurred_at,
            self.notes.clone(),
        )
        .await
    }
}
