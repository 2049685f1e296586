use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::money::{ensure_non_negative, ensure_percentage};
use stockledger_core::{Decimal, DomainError, DomainResult, OrganizationId, ProductId};

/// Unit of measure used when none is supplied.
pub const DEFAULT_UNIT: &str = "pcs";

/// Input for seeding a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProduct {
    pub organization_id: OrganizationId,
    pub product_id: ProductId,
    pub name: String,
    pub sku: String,
    pub unit: Option<String>,
    pub selling_price: Decimal,
    pub cost_price: Decimal,
    pub tax_rate: Decimal,
    pub has_expiry: bool,
    pub min_stock_level: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Catalogue product as seen by the stock ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    id: ProductId,
    organization_id: OrganizationId,
    name: String,
    sku: String,
    unit: String,
    selling_price: Decimal,
    cost_price: Decimal,
    tax_rate: Decimal,
    has_expiry: bool,
    min_stock_level: Decimal,
    is_active: bool,
    updated_at: DateTime<Utc>,
}

impl Product {
    pub fn create(input: NewProduct) -> DomainResult<Self> {
        if input.name.trim().is_empty() {
            return Err(DomainError::validation("product name cannot be empty"));
        }
        if input.sku.trim().is_empty() {
            return Err(DomainError::validation("product SKU cannot be empty"));
        }
        ensure_non_negative("selling price", input.selling_price)?;
        ensure_non_negative("cost price", input.cost_price)?;
        ensure_non_negative("minimum stock level", input.min_stock_level)?;
        ensure_percentage("tax rate", input.tax_rate)?;

        let unit = match input.unit {
            Some(u) if !u.trim().is_empty() => u.trim().to_string(),
            _ => DEFAULT_UNIT.to_string(),
        };

        Ok(Self {
            id: input.product_id,
            organization_id: input.organization_id,
            name: input.name.trim().to_string(),
            sku: input.sku.trim().to_string(),
            unit,
            selling_price: input.selling_price,
            cost_price: input.cost_price,
            tax_rate: input.tax_rate,
            has_expiry: input.has_expiry,
            min_stock_level: input.min_stock_level,
            is_active: true,
            updated_at: input.created_at,
        })
    }

    pub fn id(&self) -> ProductId {
        self.id
    }

    pub fn organization_id(&self) -> OrganizationId {
        self.organization_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sku(&self) -> &str {
        &self.sku
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn selling_price(&self) -> Decimal {
        self.selling_price
    }

    pub fn cost_price(&self) -> Decimal {
        self.cost_price
    }

    pub fn tax_rate(&self) -> Decimal {
        self.tax_rate
    }

    pub fn has_expiry(&self) -> bool {
        self.has_expiry
    }

    pub fn min_stock_level(&self) -> Decimal {
        self.min_stock_level
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Products can be sold or purchased only while active.
    pub fn ensure_tradable(&self) -> DomainResult<()> {
        if !self.is_active {
            return Err(DomainError::validation(format!(
                "product {} is inactive",
                self.name
            )));
        }
        Ok(())
    }

    pub fn deactivate(&mut self, at: DateTime<Utc>) {
        self.is_active = false;
        self.updated_at = at;
    }

    /// Latest purchase cost wins.
    pub fn set_cost_price(&mut self, cost_price: Decimal, at: DateTime<Utc>) -> DomainResult<()> {
        ensure_non_negative("cost price", cost_price)?;
        self.cost_price = cost_price;
        self.updated_at = at;
        Ok(())
    }
}
