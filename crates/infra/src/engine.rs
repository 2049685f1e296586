//! Inventory movement engine.
//!
//! The only code path that mutates a `StockRecord`. Each movement loads the
//! record through the unit of work, lets the aggregate decide the ledger
//! entry, applies it, and stages both the record and the entry for the same
//! atomic commit.

use chrono::{DateTime, NaiveDate, Utc};
use tracing::debug;
use uuid::Uuid;

use stockledger_core::money::{try_add, try_sub};
use stockledger_core::{
    Aggregate, Decimal, DomainError, LedgerEntryId, ProductId, UserId, WarehouseId,
};
use stockledger_inventory::{
    AdjustStock, BatchInfo, LedgerQuery, MovementContext, MovementType, Reference, ReferenceType,
    StockCommand, StockIn, StockKey, StockLedgerEntry, StockOut, StockRecord, Warehouse,
};
use stockledger_products::Product;

use crate::dispatcher::DispatchError;
use crate::store::InventoryStore;
use crate::unit_of_work::UnitOfWork;

/// Where a movement came from and who performed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovementMeta {
    pub reference: Reference,
    pub performed_by: UserId,
    pub occurred_at: DateTime<Utc>,
    pub notes: Option<String>,
    pub counterpart_warehouse_id: Option<WarehouseId>,
}

impl MovementMeta {
    pub fn new(reference: Reference, performed_by: UserId, occurred_at: DateTime<Utc>) -> Self {
        Self {
            reference,
            performed_by,
            occurred_at,
            notes: None,
            counterpart_warehouse_id: None,
        }
    }

    pub fn with_notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes;
        self
    }

    pub fn with_counterpart(mut self, warehouse_id: WarehouseId) -> Self {
        self.counterpart_warehouse_id = Some(warehouse_id);
        self
    }

    fn context(&self, organization_id: stockledger_core::OrganizationId) -> MovementContext {
        MovementContext {
            organization_id,
            entry_id: LedgerEntryId::new(),
            reference: self.reference.clone(),
            performed_by: self.performed_by,
            occurred_at: self.occurred_at,
            notes: self.notes.clone(),
            counterpart_warehouse_id: self.counterpart_warehouse_id,
        }
    }
}

/// Batch details supplied with a receipt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiptBatch {
    pub batch_number: Option<String>,
    pub expiry_date: Option<NaiveDate>,
    pub manufacturing_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockInRequest {
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub quantity: Decimal,
    /// Defaults to the product cost for cost-revising receipts and to the
    /// current average cost for returns.
    pub unit_cost: Option<Decimal>,
    pub movement_type: MovementType,
    pub batch: Option<ReceiptBatch>,
    pub meta: MovementMeta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockOutRequest {
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub quantity: Decimal,
    pub movement_type: MovementType,
    pub meta: MovementMeta,
}

/// A staged movement: the record after the change and the entry that made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Movement {
    pub record: StockRecord,
    pub entry: StockLedgerEntry,
}

/// Reference type recorded for a movement that was not issued by a document.
pub fn default_reference_type(movement_type: MovementType) -> ReferenceType {
    match movement_type {
        MovementType::Purchase | MovementType::PurchaseReturn => ReferenceType::Purchase,
        MovementType::Sale | MovementType::SaleReturn => ReferenceType::Sale,
        MovementType::TransferIn | MovementType::TransferOut => ReferenceType::Transfer,
        MovementType::Opening => ReferenceType::Opening,
        MovementType::Production => ReferenceType::Production,
        MovementType::Adjustment | MovementType::Damage | MovementType::Expired => {
            ReferenceType::Adjustment
        }
    }
}

/// A fresh self-reference for a manual movement.
pub fn manual_reference(movement_type: MovementType) -> Reference {
    Reference::new(default_reference_type(movement_type), Uuid::now_v7())
}

/// Batch number used when a tracked receipt does not carry one.
pub fn default_batch_number(at: DateTime<Utc>) -> String {
    format!("BATCH-{}", at.timestamp_millis())
}

fn stage_movement<S>(
    uow: &mut UnitOfWork<'_, S>,
    record: &mut StockRecord,
    command: &StockCommand,
) -> Result<StockLedgerEntry, DispatchError>
where
    S: InventoryStore + ?Sized,
{
    let entries = record.execute(command)?;
    uow.stage(&*record)?;
    let mut last = None;
    for entry in entries {
        uow.append(entry.clone())?;
        last = Some(entry);
    }
    last.ok_or_else(|| DispatchError::Domain(DomainError::invariant("movement produced no entry")))
}

/// Receive stock, creating the stock record on first receipt.
pub async fn stock_in<S>(
    uow: &mut UnitOfWork<'_, S>,
    request: StockInRequest,
) -> Result<Movement, DispatchError>
where
    S: InventoryStore + ?Sized,
{
    let organization_id = uow.organization_id();
    let product: Product = uow.require(&request.product_id, "product").await?;
    let warehouse: Warehouse = uow.require(&request.warehouse_id, "warehouse").await?;
    warehouse.ensure_active()?;

    let key = StockKey::new(request.warehouse_id, request.product_id);
    let mut record = match uow.load::<StockRecord>(&key).await? {
        Some(record) => record,
        None => StockRecord::open(
            organization_id,
            warehouse.branch_id(),
            key,
            request.meta.occurred_at,
        ),
    };

    let unit_cost = request.unit_cost.unwrap_or_else(|| {
        if request.movement_type.revises_cost() {
            product.cost_price()
        } else {
            record.average_cost()
        }
    });

    let receipt = request.batch.unwrap_or_default();
    let batch = (product.has_expiry() || receipt.expiry_date.is_some()).then(|| BatchInfo {
        batch_number: receipt
            .batch_number
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| default_batch_number(request.meta.occurred_at)),
        expiry_date: receipt.expiry_date,
        manufacturing_date: receipt.manufacturing_date,
    });

    let command = StockCommand::StockIn(StockIn {
        context: request.meta.context(organization_id),
        movement_type: request.movement_type,
        quantity: request.quantity,
        unit_cost,
        batch,
    });
    let entry = stage_movement(uow, &mut record, &command).map_err(|e| label(e, product.name()))?;

    debug!(
        organization_id = %organization_id,
        stock = %key,
        movement = %request.movement_type,
        quantity = %request.quantity,
        new_quantity = %record.quantity(),
        "stock in staged"
    );
    Ok(Movement { record, entry })
}

/// Issue stock. A missing record counts as zero available.
pub async fn stock_out<S>(
    uow: &mut UnitOfWork<'_, S>,
    request: StockOutRequest,
) -> Result<Movement, DispatchError>
where
    S: InventoryStore + ?Sized,
{
    let organization_id = uow.organization_id();
    let product: Product = uow.require(&request.product_id, "product").await?;

    let key = StockKey::new(request.warehouse_id, request.product_id);
    let Some(mut record) = uow.load::<StockRecord>(&key).await? else {
        return Err(DomainError::insufficient_stock(
            product.name(),
            request.quantity,
            Decimal::ZERO,
        )
        .into());
    };

    let command = StockCommand::StockOut(StockOut {
        context: request.meta.context(organization_id),
        movement_type: request.movement_type,
        quantity: request.quantity,
    });
    let entry = stage_movement(uow, &mut record, &command).map_err(|e| label(e, product.name()))?;

    debug!(
        organization_id = %organization_id,
        stock = %key,
        movement = %request.movement_type,
        quantity = %request.quantity,
        new_quantity = %record.quantity(),
        "stock out staged"
    );
    Ok(Movement { record, entry })
}

/// Set an absolute quantity on an existing record.
#[allow(clippy::too_many_arguments)]
pub async fn adjust<S>(
    uow: &mut UnitOfWork<'_, S>,
    product_id: ProductId,
    warehouse_id: WarehouseId,
    new_quantity: Decimal,
    reason: &str,
    notes: Option<&str>,
    performed_by: UserId,
    occurred_at: DateTime<Utc>,
) -> Result<Movement, DispatchError>
where
    S: InventoryStore + ?Sized,
{
    let organization_id = uow.organization_id();
    let key = StockKey::new(warehouse_id, product_id);
    let mut record: StockRecord = uow.require(&key, "stock record").await?;

    let notes = match notes.map(str::trim).filter(|n| !n.is_empty()) {
        Some(extra) => format!("{reason}: {extra}"),
        None => reason.to_string(),
    };
    let meta = MovementMeta::new(
        manual_reference(MovementType::Adjustment),
        performed_by,
        occurred_at,
    )
    .with_notes(Some(notes));

    let command = StockCommand::Adjust(AdjustStock {
        context: meta.context(organization_id),
        new_quantity,
    });
    let entry = stage_movement(uow, &mut record, &command)?;

    debug!(
        organization_id = %organization_id,
        stock = %key,
        change = %entry.quantity_change,
        "stock adjustment staged"
    );
    Ok(Movement { record, entry })
}

/// Quantity of `product` at `warehouse` moved by `original` movements of a
/// document that has not been returned yet.
pub async fn returnable_quantity<S>(
    uow: &UnitOfWork<'_, S>,
    reference_id: Uuid,
    product_id: ProductId,
    warehouse_id: WarehouseId,
    original: MovementType,
) -> Result<Decimal, DispatchError>
where
    S: InventoryStore + ?Sized,
{
    let return_type = return_type_for(original)?;
    let query = LedgerQuery {
        product_id: Some(product_id),
        warehouse_id: Some(warehouse_id),
        reference_id: Some(reference_id),
        ..LedgerQuery::default()
    };

    let mut moved = Decimal::ZERO;
    let mut returned = Decimal::ZERO;
    for entry in uow.ledger_entries(&query).await? {
        if entry.movement_type == original {
            moved = try_add(moved, entry.moved_quantity())?;
        } else if entry.movement_type == return_type {
            returned = try_add(returned, entry.moved_quantity())?;
        }
    }
    Ok(try_sub(moved, returned)?.max(Decimal::ZERO))
}

fn return_type_for(original: MovementType) -> Result<MovementType, DispatchError> {
    match original {
        MovementType::Sale => Ok(MovementType::SaleReturn),
        MovementType::Purchase => Ok(MovementType::PurchaseReturn),
        other => Err(DomainError::validation(format!(
            "{other} movements cannot be returned"
        ))
        .into()),
    }
}

/// Reverse (part of) a sale or purchase movement.
///
/// Sale returns come back in at the current average cost; purchase returns
/// leave like any other outflow and are checked for availability.
pub async fn return_stock<S>(
    uow: &mut UnitOfWork<'_, S>,
    original: &StockLedgerEntry,
    quantity: Decimal,
    performed_by: UserId,
    occurred_at: DateTime<Utc>,
    notes: Option<String>,
) -> Result<Movement, DispatchError>
where
    S: InventoryStore + ?Sized,
{
    let return_type = return_type_for(original.movement_type)?;
    if quantity <= Decimal::ZERO {
        return Err(DomainError::validation(format!(
            "return quantity must be positive (got {quantity})"
        ))
        .into());
    }

    let returnable = returnable_quantity(
        uow,
        original.reference.reference_id,
        original.product_id,
        original.warehouse_id,
        original.movement_type,
    )
    .await?;
    if quantity > returnable {
        return Err(DomainError::validation(format!(
            "return quantity {quantity} exceeds returnable quantity {returnable}"
        ))
        .into());
    }

    let meta = MovementMeta::new(original.reference.clone(), performed_by, occurred_at)
        .with_notes(notes);

    match return_type {
        MovementType::SaleReturn => {
            stock_in(
                uow,
                StockInRequest {
                    product_id: original.product_id,
                    warehouse_id: original.warehouse_id,
                    quantity,
                    unit_cost: None,
                    movement_type: return_type,
                    batch: None,
                    meta,
                },
            )
            .await
        }
        _ => {
            stock_out(
                uow,
                StockOutRequest {
                    product_id: original.product_id,
                    warehouse_id: original.warehouse_id,
                    quantity,
                    movement_type: return_type,
                    meta,
                },
            )
            .await
        }
    }
}

fn label(err: DispatchError, product_name: &str) -> DispatchError {
    match err {
        DispatchError::Domain(domain) => DispatchError::Domain(domain.with_product_label(product_name)),
        other => other,
    }
}
