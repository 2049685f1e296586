//! Warehouse-to-warehouse transfers. Creation only reserves a document;
//! stock leaves the source on ship and arrives at the destination on receipt.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use stockledger_core::money::try_add;
use stockledger_core::{
    Aggregate, Decimal, DomainError, ProductId, TransferId, UserId, WarehouseId,
};
use stockledger_inventory::{
    CancelTransfer as CancelTransferCommand, CreateTransfer as CreateTransferCommand,
    MovementType, ReceiveTransfer as ReceiveTransferCommand, Reference, ReferenceType,
    ShipTransfer as ShipTransferCommand, StockKey, StockRecord, StockTransfer, TransferCommand,
    TransferItem, TransferStatus, Warehouse,
};
use stockledger_products::Product;

use crate::dispatcher::{DispatchError, Operation};
use crate::engine::{self, MovementMeta, StockInRequest, StockOutRequest};
use crate::numbering::{DocumentPrefix, claim_document_number};
use crate::store::InventoryStore;
use crate::unit_of_work::UnitOfWork;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferItemRequest {
    pub product_id: ProductId,
    pub quantity: Decimal,
    pub batch_number: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransfer {
    pub source_warehouse_id: WarehouseId,
    pub destination_warehouse_id: WarehouseId,
    pub items: Vec<TransferItemRequest>,
    pub notes: Option<String>,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl Operation for CreateTransfer {
    type Output = StockTransfer;

    fn name(&self) -> &'static str {
        "create_transfer"
    }

    async fn run<S>(&self, uow: &mut UnitOfWork<'_, S>) -> Result<StockTransfer, DispatchError>
    where
        S: InventoryStore + ?Sized,
    {
        let organization_id = uow.organization_id();
        let source: Warehouse = uow
            .require(&self.source_warehouse_id, "source warehouse")
            .await?;
        source.ensure_active()?;
        let destination: Warehouse = uow
            .require(&self.destination_warehouse_id, "destination warehouse")
            .await?;
        destination.ensure_active()?;

        // Availability is checked against the total requested per product.
        let mut requested: BTreeMap<ProductId, Decimal> = BTreeMap::new();
        let mut items = Vec::with_capacity(self.items.len());
        for item in &self.items {
            let product: Product = uow.require(&item.product_id, "product").await?;
            let key = StockKey::new(self.source_warehouse_id, item.product_id);
            let record: Option<StockRecord> = uow.load(&key).await?;
            let available = record
                .as_ref()
                .map(StockRecord::available_quantity)
                .unwrap_or(Decimal::ZERO);

            let total = requested.entry(item.product_id).or_insert(Decimal::ZERO);
            *total = try_add(*total, item.quantity)?;
            if *total > available {
                return Err(DomainError::insufficient_stock(product.name(), *total, available).into());
            }

            items.push(TransferItem {
                product_id: item.product_id,
                product_name: product.name().to_string(),
                sku: product.sku().to_string(),
                unit: product.unit().to_string(),
                quantity: item.quantity,
                unit_cost: record
                    .as_ref()
                    .map(StockRecord::average_cost)
                    .unwrap_or(Decimal::ZERO),
                batch_number: item.batch_number.clone(),
                notes: item.notes.clone(),
            });
        }

        let transfer_id = TransferId::new();
        let number = claim_document_number(uow, DocumentPrefix::Transfer, self.occurred_at).await?;
        let mut transfer = StockTransfer::empty(transfer_id);
        transfer.execute(&TransferCommand::Create(CreateTransferCommand {
            organization_id,
            transfer_id,
            number: number.clone(),
            source_branch_id: source.branch_id(),
            source_warehouse_id: self.source_warehouse_id,
            destination_branch_id: destination.branch_id(),
            destination_warehouse_id: self.destination_warehouse_id,
            items,
            notes: self.notes.clone(),
            created_by: self.created_by,
            occurred_at: self.occurred_at,
        }))?;

        uow.stage(&transfer)?;
        info!(
            organization_id = %organization_id,
            transfer_id = %transfer_id,
            transfer_number = %number,
            items = transfer.total_items(),
            "transfer created"
        );
        Ok(transfer)
    }
}

fn endpoints(transfer: &StockTransfer) -> Result<(WarehouseId, WarehouseId), DispatchError> {
    match (
        transfer.source_warehouse_id(),
        transfer.destination_warehouse_id(),
    ) {
        (Some(source), Some(destination)) => Ok((source, destination)),
        _ => Err(DomainError::invariant("transfer has no warehouses").into()),
    }
}

fn transfer_reference(transfer: &StockTransfer) -> Reference {
    Reference::new(ReferenceType::Transfer, transfer.id_typed()).with_number(transfer.number())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipTransfer {
    pub transfer_id: TransferId,
    pub shipped_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl Operation for ShipTransfer {
    type Output = StockTransfer;

    fn name(&self) -> &'static str {
        "ship_transfer"
    }

    async fn run<S>(&self, uow: &mut UnitOfWork<'_, S>) -> Result<StockTransfer, DispatchError>
    where
        S: InventoryStore + ?Sized,
    {
        let organization_id = uow.organization_id();
        let mut transfer: StockTransfer = uow.require(&self.transfer_id, "stock transfer").await?;
        transfer.execute(&TransferCommand::Ship(ShipTransferCommand {
            organization_id,
            transfer_id: self.transfer_id,
            shipped_by: self.shipped_by,
            occurred_at: self.occurred_at,
        }))?;

        let (source, destination) = endpoints(&transfer)?;
        let reference = transfer_reference(&transfer);
        for item in transfer.items() {
            engine::stock_out(
                uow,
                StockOutRequest {
                    product_id: item.product_id,
                    warehouse_id: source,
                    quantity: item.quantity,
                    movement_type: MovementType::TransferOut,
                    meta: MovementMeta::new(reference.clone(), self.shipped_by, self.occurred_at)
                        .with_notes(item.notes.clone())
                        .with_counterpart(destination),
                },
            )
            .await?;
        }

        uow.stage(&transfer)?;
        info!(
            organization_id = %organization_id,
            transfer_id = %self.transfer_id,
            "transfer shipped"
        );
        Ok(transfer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveTransfer {
    pub transfer_id: TransferId,
    pub received_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl Operation for ReceiveTransfer {
    type Output = StockTransfer;

    fn name(&self) -> &'static str {
        "receive_transfer"
    }

    async fn run<S>(&self, uow: &mut UnitOfWork<'_, S>) -> Result<StockTransfer, DispatchError>
    where
        S: InventoryStore + ?Sized,
    {
        let organization_id = uow.organization_id();
        let mut transfer: StockTransfer = uow.require(&self.transfer_id, "stock transfer").await?;
        transfer.execute(&TransferCommand::Receive(ReceiveTransferCommand {
            organization_id,
            transfer_id: self.transfer_id,
            received_by: self.received_by,
            occurred_at: self.occurred_at,
        }))?;

        let (source, destination) = endpoints(&transfer)?;
        let reference = transfer_reference(&transfer);
        for item in transfer.items() {
            engine::stock_in(
                uow,
                StockInRequest {
                    product_id: item.product_id,
                    warehouse_id: destination,
                    quantity: item.quantity,
                    unit_cost: Some(item.unit_cost),
                    movement_type: MovementType::TransferIn,
                    batch: None,
                    meta: MovementMeta::new(reference.clone(), self.received_by, self.occurred_at)
                        .with_notes(item.notes.clone())
                        .with_counterpart(source),
                },
            )
            .await?;
        }

        uow.stage(&transfer)?;
        info!(
            organization_id = %organization_id,
            transfer_id = %self.transfer_id,
            "transfer received"
        );
        Ok(transfer)
    }
}

/// Cancel a transfer that has not been received. Shipped stock is not
/// returned to the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTransfer {
    pub transfer_id: TransferId,
    pub reason: Option<String>,
    pub cancelled_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl Operation for CancelTransfer {
    type Output = StockTransfer;

    fn name(&self) -> &'static str {
        "cancel_transfer"
    }

    async fn run<S>(&self, uow: &mut UnitOfWork<'_, S>) -> Result<StockTransfer, DispatchError>
    where
        S: InventoryStore + ?Sized,
    {
        let organization_id = uow.organization_id();
        let mut transfer: StockTransfer = uow.require(&self.transfer_id, "stock transfer").await?;
        let previous = transfer.status();
        transfer.execute(&TransferCommand::Cancel(CancelTransferCommand {
            organization_id,
            transfer_id: self.transfer_id,
            reason: self.reason.clone(),
            cancelled_by: self.cancelled_by,
            occurred_at: self.occurred_at,
        }))?;

        if previous == TransferStatus::InTransit {
            warn!(
                organization_id = %organization_id,
                transfer_id = %self.transfer_id,
                "cancelled an in-transit transfer; shipped stock is not returned"
            );
        }

        uow.stage(&transfer)?;
        Ok(transfer)
    }
}
