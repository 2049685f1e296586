use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use stockledger_core::{
    Aggregate, Decimal, DomainError, PartyId, PaymentMethod, ProductId, SaleId, UserId,
    WarehouseId,
};
use stockledger_inventory::{MovementType, Reference, ReferenceType, Warehouse};
use stockledger_parties::{
    Party, PartyCommand, PartyKind, PostDocument, PostPayment, ReleaseOutstanding,
};
use stockledger_products::Product;
use stockledger_sales::{
    AddSalePayment as AddSalePaymentCommand, CancelSale as CancelSaleCommand,
    CreateSale as CreateSaleCommand, Sale, SaleCommand, SaleEvent, SaleLineInput, SaleStatus,
    UpdateSaleStatus as UpdateSaleStatusCommand,
};

use crate::dispatcher::{DispatchError, Operation};
use crate::engine::{self, MovementMeta, StockInRequest, StockOutRequest};
use crate::numbering::{DocumentPrefix, claim_document_number};
use crate::store::InventoryStore;
use crate::unit_of_work::UnitOfWork;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleItem {
    pub product_id: ProductId,
    pub quantity: Decimal,
    /// Defaults to the product's selling price.
    pub unit_price: Option<Decimal>,
    pub discount_percent: Decimal,
    /// Defaults to the product's tax rate.
    pub tax_percent: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSale {
    pub warehouse_id: WarehouseId,
    pub customer_id: Option<PartyId>,
    pub customer_name: Option<String>,
    pub items: Vec<SaleItem>,
    /// Document-level discount amount.
    pub discount_amount: Decimal,
    pub payment_method: PaymentMethod,
    pub notes: Option<String>,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl Operation for CreateSale {
    type Output = Sale;

    fn name(&self) -> &'static str {
        "create_sale"
    }

    async fn run<S>(&self, uow: &mut UnitOfWork<'_, S>) -> Result<Sale, DispatchError>
    where
        S: InventoryStore + ?Sized,
    {
        let organization_id = uow.organization_id();
        let warehouse: Warehouse = uow.require(&self.warehouse_id, "warehouse").await?;
        warehouse.ensure_active()?;

        let mut customer = match self.customer_id {
            Some(customer_id) => {
                let party: Party = uow.require(&customer_id, "customer").await?;
                party.ensure_kind(PartyKind::Customer)?;
                Some(party)
            }
            None => None,
        };
        if self.payment_method.is_credit() && customer.is_none() {
            return Err(DomainError::validation("credit sales require a customer").into());
        }

        let mut lines = Vec::with_capacity(self.items.len());
        for item in &self.items {
            let product: Product = uow.require(&item.product_id, "product").await?;
            product.ensure_tradable()?;
            lines.push(SaleLineInput {
                product_id: product.id(),
                product_name: product.name().to_string(),
                sku: product.sku().to_string(),
                unit: product.unit().to_string(),
                quantity: item.quantity,
                unit_price: item.unit_price.unwrap_or_else(|| product.selling_price()),
                discount_percent: item.discount_percent,
                tax_percent: item.tax_percent.unwrap_or_else(|| product.tax_rate()),
                cost_price: product.cost_price(),
            });
        }

        let sale_id = SaleId::new();
        let invoice_number =
            claim_document_number(uow, DocumentPrefix::Invoice, self.occurred_at).await?;
        let mut sale = Sale::empty(sale_id);
        sale.execute(&SaleCommand::CreateSale(CreateSaleCommand {
            organization_id,
            sale_id,
            invoice_number: invoice_number.clone(),
            branch_id: warehouse.branch_id(),
            warehouse_id: self.warehouse_id,
            customer_id: self.customer_id,
            customer_name: self
                .customer_name
                .clone()
                .or_else(|| customer.as_ref().map(|c| c.name().to_string())),
            lines,
            document_discount: self.discount_amount,
            payment_method: self.payment_method,
            notes: self.notes.clone(),
            created_by: self.created_by,
            occurred_at: self.occurred_at,
        }))?;

        let reference = Reference::new(ReferenceType::Sale, sale_id).with_number(&invoice_number);
        for line in sale.items() {
            engine::stock_out(
                uow,
                StockOutRequest {
                    product_id: line.product_id,
                    warehouse_id: self.warehouse_id,
                    quantity: line.quantity,
                    movement_type: MovementType::Sale,
                    meta: MovementMeta::new(reference.clone(), self.created_by, self.occurred_at),
                },
            )
            .await?;
        }

        if let Some(party) = customer.as_mut() {
            let party_id = party.id_typed();
            party.execute(&PartyCommand::PostDocument(PostDocument {
                organization_id,
                party_id,
                total: sale.total_amount(),
                on_credit: self.payment_method.is_credit(),
                occurred_at: self.occurred_at,
            }))?;
            if party.exceeds_credit_limit() {
                warn!(
                    organization_id = %organization_id,
                    customer_id = %party_id,
                    outstanding = %party.outstanding_balance(),
                    credit_limit = %party.credit_limit(),
                    "customer is over the credit limit"
                );
            }
            uow.stage(&*party)?;
        }

        uow.stage(&sale)?;
        info!(
            organization_id = %organization_id,
            sale_id = %sale_id,
            invoice_number = %invoice_number,
            total = %sale.total_amount(),
            "sale created"
        );
        Ok(sale)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddSalePayment {
    pub sale_id: SaleId,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub recorded_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl Operation for AddSalePayment {
    type Output = Sale;

    fn name(&self) -> &'static str {
        "add_sale_payment"
    }

    async fn run<S>(&self, uow: &mut UnitOfWork<'_, S>) -> Result<Sale, DispatchError>
    where
        S: InventoryStore + ?Sized,
    {
        let organization_id = uow.organization_id();
        let mut sale: Sale = uow.require(&self.sale_id, "sale").await?;
        sale.execute(&SaleCommand::AddPayment(AddSalePaymentCommand {
            organization_id,
            sale_id: self.sale_id,
            amount: self.amount,
            method: self.method,
            reference: self.reference.clone(),
            recorded_by: self.recorded_by,
            occurred_at: self.occurred_at,
        }))?;

        if let Some(customer_id) = sale.customer_id() {
            let mut party: Party = uow.require(&customer_id, "customer").await?;
            party.execute(&PartyCommand::PostPayment(PostPayment {
                organization_id,
                party_id: customer_id,
                amount: self.amount,
                occurred_at: self.occurred_at,
            }))?;
            uow.stage(&party)?;
        }

        uow.stage(&sale)?;
        Ok(sale)
    }
}

/// Move a sale forward through fulfilment. Stock and balances are untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSaleStatus {
    pub sale_id: SaleId,
    pub status: SaleStatus,
    pub updated_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl Operation for UpdateSaleStatus {
    type Output = Sale;

    fn name(&self) -> &'static str {
        "update_sale_status"
    }

    async fn run<S>(&self, uow: &mut UnitOfWork<'_, S>) -> Result<Sale, DispatchError>
    where
        S: InventoryStore + ?Sized,
    {
        let organization_id = uow.organization_id();
        let mut sale: Sale = uow.require(&self.sale_id, "sale").await?;
        let previous = sale.status();
        sale.execute(&SaleCommand::UpdateStatus(UpdateSaleStatusCommand {
            organization_id,
            sale_id: self.sale_id,
            status: self.status,
            updated_by: self.updated_by,
            occurred_at: self.occurred_at,
        }))?;

        uow.stage(&sale)?;
        info!(
            organization_id = %organization_id,
            sale_id = %self.sale_id,
            from = %previous,
            to = %self.status,
            "sale status updated"
        );
        Ok(sale)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelSale {
    pub sale_id: SaleId,
    pub cancelled_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl Operation for CancelSale {
    type Output = Sale;

    fn name(&self) -> &'static str {
        "cancel_sale"
    }

    async fn run<S>(&self, uow: &mut UnitOfWork<'_, S>) -> Result<Sale, DispatchError>
    where
        S: InventoryStore + ?Sized,
    {
        let organization_id = uow.organization_id();
        let mut sale: Sale = uow.require(&self.sale_id, "sale").await?;
        let events = sale.execute(&SaleCommand::CancelSale(CancelSaleCommand {
            organization_id,
            sale_id: self.sale_id,
            cancelled_by: self.cancelled_by,
            occurred_at: self.occurred_at,
        }))?;
        let released = events
            .iter()
            .find_map(|e| match e {
                SaleEvent::SaleCancelled {
                    released_balance, ..
                } => Some(*released_balance),
                _ => None,
            })
            .unwrap_or(Decimal::ZERO);

        let warehouse_id = sale
            .warehouse_id()
            .ok_or_else(|| DomainError::invariant("sale has no warehouse"))?;
        let reference =
            Reference::new(ReferenceType::Sale, self.sale_id).with_number(sale.invoice_number());
        let products: BTreeSet<ProductId> = sale.items().iter().map(|l| l.product_id).collect();

        for product_id in products {
            let remaining = engine::returnable_quantity(
                uow,
                reference.reference_id,
                product_id,
                warehouse_id,
                MovementType::Sale,
            )
            .await?;
            if remaining <= Decimal::ZERO {
                continue;
            }
            engine::stock_in(
                uow,
                StockInRequest {
                    product_id,
                    warehouse_id,
                    quantity: remaining,
                    unit_cost: None,
                    movement_type: MovementType::SaleReturn,
                    batch: None,
                    meta: MovementMeta::new(reference.clone(), self.cancelled_by, self.occurred_at)
                        .with_notes(Some("sale cancelled".to_string())),
                },
            )
            .await?;
        }

        if let Some(customer_id) = sale.customer_id() {
            if released > Decimal::ZERO {
                let mut party: Party = uow.require(&customer_id, "customer").await?;
                party.execute(&PartyCommand::ReleaseOutstanding(ReleaseOutstanding {
                    organization_id,
                    party_id: customer_id,
                    amount: released,
                    occurred_at: self.occurred_at,
                }))?;
                uow.stage(&party)?;
            }
        }

        uow.stage(&sale)?;
        info!(
            organization_id = %organization_id,
            sale_id = %self.sale_id,
            released_balance = %released,
            "sale cancelled"
        );
        Ok(sale)
    }
}
