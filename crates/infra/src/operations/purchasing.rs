use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use stockledger_core::{
    Aggregate, Decimal, DomainError, PartyId, PaymentMethod, ProductId, PurchaseId, UserId,
    WarehouseId,
};
use stockledger_inventory::{MovementType, Reference, ReferenceType, Warehouse};
use stockledger_parties::{
    Party, PartyCommand, PartyKind, PostDocument, PostPayment, ReleaseOutstanding,
};
use stockledger_products::Product;
use stockledger_purchasing::{
    AddPurchasePayment as AddPurchasePaymentCommand, CancelPurchase as CancelPurchaseCommand,
    CreatePurchase as CreatePurchaseCommand, Purchase, PurchaseCommand, PurchaseEvent,
    PurchaseLineInput, ReceivePurchase as ReceivePurchaseCommand,
};

use crate::dispatcher::{DispatchError, Operation};
use crate::engine::{self, MovementMeta, ReceiptBatch, StockInRequest};
use crate::numbering::{DocumentPrefix, claim_document_number};
use crate::store::InventoryStore;
use crate::unit_of_work::UnitOfWork;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseItem {
    pub product_id: ProductId,
    pub quantity: Decimal,
    /// Defaults to the product's cost price.
    pub unit_price: Option<Decimal>,
    pub discount_percent: Decimal,
    /// Defaults to the product's tax rate.
    pub tax_percent: Option<Decimal>,
    pub batch_number: Option<String>,
    pub expiry_date: Option<NaiveDate>,
    pub manufacturing_date: Option<NaiveDate>,
}

/// Order goods from a supplier. Nothing moves until the purchase is received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePurchase {
    pub warehouse_id: WarehouseId,
    pub supplier_id: PartyId,
    pub items: Vec<PurchaseItem>,
    pub shipping_charges: Decimal,
    pub other_charges: Decimal,
    pub payment_method: PaymentMethod,
    pub notes: Option<String>,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl Operation for CreatePurchase {
    type Output = Purchase;

    fn name(&self) -> &'static str {
        "create_purchase"
    }

    async fn run<S>(&self, uow: &mut UnitOfWork<'_, S>) -> Result<Purchase, DispatchError>
    where
        S: InventoryStore + ?Sized,
    {
        let organization_id = uow.organization_id();
        let warehouse: Warehouse = uow.require(&self.warehouse_id, "warehouse").await?;
        warehouse.ensure_active()?;
        let mut supplier: Party = uow.require(&self.supplier_id, "supplier").await?;
        supplier.ensure_kind(PartyKind::Supplier)?;

        let mut lines = Vec::with_capacity(self.items.len());
        for item in &self.items {
            let product: Product = uow.require(&item.product_id, "product").await?;
            product.ensure_tradable()?;
            lines.push(PurchaseLineInput {
                product_id: product.id(),
                product_name: product.name().to_string(),
                sku: product.sku().to_string(),
                unit: product.unit().to_string(),
                quantity: item.quantity,
                unit_price: item.unit_price.unwrap_or_else(|| product.cost_price()),
                discount_percent: item.discount_percent,
                tax_percent: item.tax_percent.unwrap_or_else(|| product.tax_rate()),
                batch_number: item.batch_number.clone(),
                expiry_date: item.expiry_date,
                manufacturing_date: item.manufacturing_date,
            });
        }

        let purchase_id = PurchaseId::new();
        let purchase_number =
            claim_document_number(uow, DocumentPrefix::Purchase, self.occurred_at).await?;
        let mut purchase = Purchase::empty(purchase_id);
        purchase.execute(&PurchaseCommand::CreatePurchase(CreatePurchaseCommand {
            organization_id,
            purchase_id,
            purchase_number: purchase_number.clone(),
            branch_id: warehouse.branch_id(),
            warehouse_id: self.warehouse_id,
            supplier_id: self.supplier_id,
            lines,
            shipping_charges: self.shipping_charges,
            other_charges: self.other_charges,
            payment_method: self.payment_method,
            notes: self.notes.clone(),
            created_by: self.created_by,
            occurred_at: self.occurred_at,
        }))?;

        supplier.execute(&PartyCommand::PostDocument(PostDocument {
            organization_id,
            party_id: self.supplier_id,
            total: purchase.total_amount(),
            on_credit: self.payment_method.is_credit(),
            occurred_at: self.occurred_at,
        }))?;

        uow.stage(&supplier)?;
        uow.stage(&purchase)?;
        info!(
            organization_id = %organization_id,
            purchase_id = %purchase_id,
            purchase_number = %purchase_number,
            total = %purchase.total_amount(),
            "purchase created"
        );
        Ok(purchase)
    }
}

/// Book the ordered goods into the purchase's warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivePurchase {
    pub purchase_id: PurchaseId,
    pub received_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl Operation for ReceivePurchase {
    type Output = Purchase;

    fn name(&self) -> &'static str {
        "receive_purchase"
    }

    async fn run<S>(&self, uow: &mut UnitOfWork<'_, S>) -> Result<Purchase, DispatchError>
    where
        S: InventoryStore + ?Sized,
    {
        let organization_id = uow.organization_id();
        let mut purchase: Purchase = uow.require(&self.purchase_id, "purchase").await?;
        purchase.execute(&PurchaseCommand::ReceivePurchase(ReceivePurchaseCommand {
            organization_id,
            purchase_id: self.purchase_id,
            received_by: self.received_by,
            occurred_at: self.occurred_at,
        }))?;

        let warehouse_id = purchase
            .warehouse_id()
            .ok_or_else(|| DomainError::invariant("purchase has no warehouse"))?;
        let reference = Reference::new(ReferenceType::Purchase, self.purchase_id)
            .with_number(purchase.purchase_number());

        for item in purchase.items() {
            engine::stock_in(
                uow,
                StockInRequest {
                    product_id: item.product_id,
                    warehouse_id,
                    quantity: item.quantity,
                    unit_cost: Some(item.unit_price),
                    movement_type: MovementType::Purchase,
                    batch: Some(ReceiptBatch {
                        batch_number: item.batch_number.clone(),
                        expiry_date: item.expiry_date,
                        manufacturing_date: item.manufacturing_date,
                    }),
                    meta: MovementMeta::new(reference.clone(), self.received_by, self.occurred_at),
                },
            )
            .await?;

            let mut product: Product = uow.require(&item.product_id, "product").await?;
            product.set_cost_price(item.unit_price, self.occurred_at)?;
            uow.stage(&product)?;
        }

        uow.stage(&purchase)?;
        info!(
            organization_id = %organization_id,
            purchase_id = %self.purchase_id,
            items = purchase.items().len(),
            "purchase received"
        );
        Ok(purchase)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPurchasePayment {
    pub purchase_id: PurchaseId,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub recorded_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl Operation for AddPurchasePayment {
    type Output = Purchase;

    fn name(&self) -> &'static str {
        "add_purchase_payment"
    }

    async fn run<S>(&self, uow: &mut UnitOfWork<'_, S>) -> Result<Purchase, DispatchError>
    where
        S: InventoryStore + ?Sized,
    {
        let organization_id = uow.organization_id();
        let mut purchase: Purchase = uow.require(&self.purchase_id, "purchase").await?;
        purchase.execute(&PurchaseCommand::AddPayment(AddPurchasePaymentCommand {
            organization_id,
            purchase_id: self.purchase_id,
            amount: self.amount,
            method: self.method,
            reference: self.reference.clone(),
            recorded_by: self.recorded_by,
            occurred_at: self.occurred_at,
        }))?;

        if let Some(supplier_id) = purchase.supplier_id() {
            let mut supplier: Party = uow.require(&supplier_id, "supplier").await?;
            supplier.execute(&PartyCommand::PostPayment(PostPayment {
                organization_id,
                party_id: supplier_id,
                amount: self.amount,
                occurred_at: self.occurred_at,
            }))?;
            uow.stage(&supplier)?;
        }

        uow.stage(&purchase)?;
        Ok(purchase)
    }
}

/// Cancel a purchase. Received stock stays where it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelPurchase {
    pub purchase_id: PurchaseId,
    pub cancelled_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl Operation for CancelPurchase {
    type Output = Purchase;

    fn name(&self) -> &'static str {
        "cancel_purchase"
    }

    async fn run<S>(&self, uow: &mut UnitOfWork<'_, S>) -> Result<Purchase, DispatchError>
    where
        S: InventoryStore + ?Sized,
    {
        let organization_id = uow.organization_id();
        let mut purchase: Purchase = uow.require(&self.purchase_id, "purchase").await?;
        let events = purchase.execute(&PurchaseCommand::CancelPurchase(CancelPurchaseCommand {
            organization_id,
            purchase_id: self.purchase_id,
            cancelled_by: self.cancelled_by,
            occurred_at: self.occurred_at,
        }))?;

        let (released, was_received) = events
            .iter()
            .find_map(|e| match e {
                PurchaseEvent::PurchaseCancelled {
                    released_balance,
                    was_received,
                    ..
                } => Some((*released_balance, *was_received)),
                _ => None,
            })
            .unwrap_or((Decimal::ZERO, false));

        if was_received {
            warn!(
                organization_id = %organization_id,
                purchase_id = %self.purchase_id,
                "cancelled a received purchase; received stock is not reversed"
            );
        }

        if let Some(supplier_id) = purchase.supplier_id() {
            if released > Decimal::ZERO {
                let mut supplier: Party = uow.require(&supplier_id, "supplier").await?;
                supplier.execute(&PartyCommand::ReleaseOutstanding(ReleaseOutstanding {
                    organization_id,
                    party_id: supplier_id,
                    amount: released,
                    occurred_at: self.occurred_at,
                }))?;
                uow.stage(&supplier)?;
            }
        }

        uow.stage(&purchase)?;
        Ok(purchase)
    }
}
