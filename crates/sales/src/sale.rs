use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::money::{ensure_non_negative, round_money, try_add, try_mul, try_sub, try_sum};
use stockledger_core::{
    Aggregate, AggregateRoot, BranchId, Decimal, DocumentTotals, DomainError, DomainResult,
    LinePricing, OrganizationId, PartyId, Payment, PaymentMethod, PaymentStatus, ProductId,
    SaleId, Settlement, UserId, WarehouseId,
};

/// Customer name used when no named customer is attached.
pub const WALK_IN_CUSTOMER: &str = "Walk-in Customer";

/// Sale lifecycle. Creation yields `Confirmed`; fulfilment moves forward
/// through `Shipped` to `Delivered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaleStatus {
    Confirmed,
    Shipped,
    Delivered,
    Cancelled,
}

impl SaleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SaleStatus::Confirmed => "confirmed",
            SaleStatus::Shipped => "shipped",
            SaleStatus::Delivered => "delivered",
            SaleStatus::Cancelled => "cancelled",
        }
    }

    /// Fulfilment transitions. Cancellation has its own command.
    pub fn can_advance_to(self, next: SaleStatus) -> bool {
        matches!(
            (self, next),
            (SaleStatus::Confirmed, SaleStatus::Shipped)
                | (SaleStatus::Confirmed, SaleStatus::Delivered)
                | (SaleStatus::Shipped, SaleStatus::Delivered)
        )
    }
}

impl core::fmt::Display for SaleStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Line as requested by the caller, with prices already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleLineInput {
    pub product_id: ProductId,
    pub product_name: String,
    pub sku: String,
    pub unit: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub discount_percent: Decimal,
    pub tax_percent: Decimal,
    /// Product cost at the time of sale.
    pub cost_price: Decimal,
}

/// Priced sale line. Immutable once the sale exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleLine {
    pub product_id: ProductId,
    pub product_name: String,
    pub sku: String,
    pub unit: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub discount_percent: Decimal,
    pub discount_amount: Decimal,
    pub tax_percent: Decimal,
    pub tax_amount: Decimal,
    pub subtotal: Decimal,
    pub total_amount: Decimal,
    pub cost_price: Decimal,
}

impl SaleLine {
    pub fn price(input: &SaleLineInput) -> DomainResult<Self> {
        ensure_non_negative("cost price", input.cost_price)?;
        let pricing = LinePricing::compute(
            input.unit_price,
            input.quantity,
            input.discount_percent,
            input.tax_percent,
        )
        .map_err(|e| match e {
            DomainError::Validation(msg) => {
                DomainError::validation(format!("{}: {msg}", input.product_name))
            }
            other => other,
        })?;

        Ok(Self {
            product_id: input.product_id,
            product_name: input.product_name.clone(),
            sku: input.sku.clone(),
            unit: input.unit.clone(),
            quantity: input.quantity,
            unit_price: input.unit_price,
            discount_percent: input.discount_percent,
            discount_amount: pricing.discount_amount,
            tax_percent: input.tax_percent,
            tax_amount: pricing.tax_amount,
            subtotal: pricing.subtotal,
            total_amount: pricing.total,
            cost_price: input.cost_price,
        })
    }

    fn pricing(&self) -> LinePricing {
        LinePricing {
            discount_amount: self.discount_amount,
            subtotal: self.subtotal,
            tax_amount: self.tax_amount,
            total: self.total_amount,
        }
    }
}

/// Aggregate root: Sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sale {
    id: SaleId,
    organization_id: Option<OrganizationId>,
    invoice_number: String,
    branch_id: Option<BranchId>,
    warehouse_id: Option<WarehouseId>,
    customer_id: Option<PartyId>,
    customer_name: String,
    items: Vec<SaleLine>,
    subtotal: Decimal,
    document_discount: Decimal,
    total_discount: Decimal,
    total_tax: Decimal,
    payment_method: PaymentMethod,
    settlement: Settlement,
    status: SaleStatus,
    notes: Option<String>,
    created_by: Option<UserId>,
    invoice_date: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    cancelled_by: Option<UserId>,
    status_updated_at: Option<DateTime<Utc>>,
    created: bool,
}

impl Sale {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: SaleId) -> Self {
        Self {
            id,
            organization_id: None,
            invoice_number: String::new(),
            branch_id: None,
            warehouse_id: None,
            customer_id: None,
            customer_name: String::new(),
            items: Vec::new(),
            subtotal: Decimal::ZERO,
            document_discount: Decimal::ZERO,
            total_discount: Decimal::ZERO,
            total_tax: Decimal::ZERO,
            payment_method: PaymentMethod::Cash,
            settlement: Settlement::open(Decimal::ZERO, PaymentMethod::Cash),
            status: SaleStatus::Confirmed,
            notes: None,
            created_by: None,
            invoice_date: None,
            cancelled_at: None,
            cancelled_by: None,
            status_updated_at: None,
            created: false,
        }
    }

    pub fn id_typed(&self) -> SaleId {
        self.id
    }

    pub fn organization_id(&self) -> Option<OrganizationId> {
        self.organization_id
    }

    pub fn invoice_number(&self) -> &str {
        &self.invoice_number
    }

    pub fn branch_id(&self) -> Option<BranchId> {
        self.branch_id
    }

    pub fn warehouse_id(&self) -> Option<WarehouseId> {
        self.warehouse_id
    }

    pub fn customer_id(&self) -> Option<PartyId> {
        self.customer_id
    }

    pub fn customer_name(&self) -> &str {
        &self.customer_name
    }

    pub fn items(&self) -> &[SaleLine] {
        &self.items
    }

    pub fn subtotal(&self) -> Decimal {
        self.subtotal
    }

    pub fn document_discount(&self) -> Decimal {
        self.document_discount
    }

    /// Line discounts plus the document-level discount.
    pub fn total_discount(&self) -> Decimal {
        self.total_discount
    }

    pub fn total_tax(&self) -> Decimal {
        self.total_tax
    }

    pub fn total_amount(&self) -> Decimal {
        self.settlement.total_amount()
    }

    pub fn paid_amount(&self) -> Decimal {
        self.settlement.paid_amount()
    }

    pub fn balance_amount(&self) -> Decimal {
        self.settlement.balance_amount()
    }

    pub fn payment_status(&self) -> PaymentStatus {
        self.settlement.payment_status()
    }

    pub fn payment_method(&self) -> PaymentMethod {
        self.payment_method
    }

    pub fn payments(&self) -> &[Payment] {
        self.settlement.payments()
    }

    pub fn status(&self) -> SaleStatus {
        self.status
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn created_by(&self) -> Option<UserId> {
        self.created_by
    }

    pub fn invoice_date(&self) -> Option<DateTime<Utc>> {
        self.invoice_date
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    pub fn status_updated_at(&self) -> Option<DateTime<Utc>> {
        self.status_updated_at
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == SaleStatus::Cancelled
    }

    /// Gross profit: total amount less the cost of goods sold.
    pub fn profit(&self) -> DomainResult<Decimal> {
        let cost = try_sum(
            self.items
                .iter()
                .map(|line| try_mul(line.cost_price, line.quantity))
                .collect::<DomainResult<Vec<_>>>()?,
        )?;
        Ok(round_money(try_sub(self.total_amount(), cost)?))
    }
}

impl AggregateRoot for Sale {
    type Id = SaleId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Command: CreateSale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSale {
    pub organization_id: OrganizationId,
    pub sale_id: SaleId,
    pub invoice_number: String,
    pub branch_id: BranchId,
    pub warehouse_id: WarehouseId,
    pub customer_id: Option<PartyId>,
    pub customer_name: Option<String>,
    pub lines: Vec<SaleLineInput>,
    pub document_discount: Decimal,
    pub payment_method: PaymentMethod,
    pub notes: Option<String>,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddSalePayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddSalePayment {
    pub organization_id: OrganizationId,
    pub sale_id: SaleId,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub recorded_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelSale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelSale {
    pub organization_id: OrganizationId,
    pub sale_id: SaleId,
    pub cancelled_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UpdateSaleStatus (fulfilment progress).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSaleStatus {
    pub organization_id: OrganizationId,
    pub sale_id: SaleId,
    pub status: SaleStatus,
    pub updated_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaleCommand {
    CreateSale(CreateSale),
    AddPayment(AddSalePayment),
    UpdateStatus(UpdateSaleStatus),
    CancelSale(CancelSale),
}

/// Event: SaleCreated. Carries the priced lines and totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleCreated {
    pub organization_id: OrganizationId,
    pub sale_id: SaleId,
    pub invoice_number: String,
    pub branch_id: BranchId,
    pub warehouse_id: WarehouseId,
    pub customer_id: Option<PartyId>,
    pub customer_name: String,
    pub items: Vec<SaleLine>,
    pub subtotal: Decimal,
    pub document_discount: Decimal,
    pub total_discount: Decimal,
    pub total_tax: Decimal,
    pub total_amount: Decimal,
    pub payment_method: PaymentMethod,
    pub notes: Option<String>,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaleEvent {
    SaleCreated(SaleCreated),
    PaymentRecorded(Payment),
    StatusChanged {
        from: SaleStatus,
        to: SaleStatus,
        updated_by: UserId,
        occurred_at: DateTime<Utc>,
    },
    SaleCancelled {
        /// Unpaid balance written off against the customer.
        released_balance: Decimal,
        cancelled_by: UserId,
        occurred_at: DateTime<Utc>,
    },
}

impl Aggregate for Sale {
    type Command = SaleCommand;
    type Event = SaleEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            SaleEvent::SaleCreated(e) => {
                self.id = e.sale_id;
                self.organization_id = Some(e.organization_id);
                self.invoice_number = e.invoice_number.clone();
                self.branch_id = Some(e.branch_id);
                self.warehouse_id = Some(e.warehouse_id);
                self.customer_id = e.customer_id;
                self.customer_name = e.customer_name.clone();
                self.items = e.items.clone();
                self.subtotal = e.subtotal;
                self.document_discount = e.document_discount;
                self.total_discount = e.total_discount;
                self.total_tax = e.total_tax;
                self.payment_method = e.payment_method;
                self.settlement = Settlement::open(e.total_amount, e.payment_method);
                self.status = SaleStatus::Confirmed;
                self.notes = e.notes.clone();
                self.created_by = Some(e.created_by);
                self.invoice_date = Some(e.occurred_at);
                self.created = true;
            }
            SaleEvent::PaymentRecorded(payment) => {
                self.settlement.record(payment.clone());
            }
            SaleEvent::StatusChanged {
                to, occurred_at, ..
            } => {
                self.status = *to;
                self.status_updated_at = Some(*occurred_at);
            }
            SaleEvent::SaleCancelled {
                cancelled_by,
                occurred_at,
                ..
            } => {
                self.status = SaleStatus::Cancelled;
                self.cancelled_by = Some(*cancelled_by);
                self.cancelled_at = Some(*occurred_at);
            }
        }
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            SaleCommand::CreateSale(cmd) => self.handle_create(cmd),
            SaleCommand::AddPayment(cmd) => self.handle_add_payment(cmd),
            SaleCommand::UpdateStatus(cmd) => self.handle_update_status(cmd),
            SaleCommand::CancelSale(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl Sale {
    fn ensure_existing(&self, organization_id: OrganizationId, sale_id: SaleId) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::not_found("sale"));
        }
        if self.organization_id != Some(organization_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != sale_id {
            return Err(DomainError::invariant("sale_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateSale) -> DomainResult<Vec<SaleEvent>> {
        if self.created {
            return Err(DomainError::conflict("sale already exists"));
        }
        if cmd.lines.is_empty() {
            return Err(DomainError::validation("sale must have at least one item"));
        }
        ensure_non_negative("discount amount", cmd.document_discount)?;

        let items = cmd
            .lines
            .iter()
            .map(SaleLine::price)
            .collect::<DomainResult<Vec<_>>>()?;

        let line_totals = DocumentTotals::from_lines(items.iter().map(SaleLine::pricing))?;
        let document_discount = round_money(cmd.document_discount);
        let total_amount = try_sub(
            try_add(line_totals.subtotal, line_totals.tax_amount)?,
            document_discount,
        )?;
        if total_amount < Decimal::ZERO {
            return Err(DomainError::validation(format!(
                "discount {document_discount} exceeds the sale amount"
            )));
        }

        let customer_name = cmd
            .customer_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(WALK_IN_CUSTOMER)
            .to_string();

        Ok(vec![SaleEvent::SaleCreated(SaleCreated {
            organization_id: cmd.organization_id,
            sale_id: cmd.sale_id,
            invoice_number: cmd.invoice_number.clone(),
            branch_id: cmd.branch_id,
            warehouse_id: cmd.warehouse_id,
            customer_id: cmd.customer_id,
            customer_name,
            items,
            subtotal: line_totals.subtotal,
            document_discount,
            total_discount: try_add(line_totals.discount_amount, document_discount)?,
            total_tax: line_totals.tax_amount,
            total_amount,
            payment_method: cmd.payment_method,
            notes: cmd.notes.clone(),
            created_by: cmd.created_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_add_payment(&self, cmd: &AddSalePayment) -> DomainResult<Vec<SaleEvent>> {
        self.ensure_existing(cmd.organization_id, cmd.sale_id)?;
        if self.is_cancelled() {
            return Err(DomainError::AlreadyCancelled);
        }
        self.settlement.validate_payment(cmd.amount)?;

        Ok(vec![SaleEvent::PaymentRecorded(Payment {
            amount: cmd.amount,
            method: cmd.method,
            reference: cmd.reference.clone(),
            recorded_by: cmd.recorded_by,
            paid_at: cmd.occurred_at,
        })])
    }

    fn handle_update_status(&self, cmd: &UpdateSaleStatus) -> DomainResult<Vec<SaleEvent>> {
        self.ensure_existing(cmd.organization_id, cmd.sale_id)?;
        if self.is_cancelled() {
            return Err(DomainError::AlreadyCancelled);
        }
        if !self.status.can_advance_to(cmd.status) {
            return Err(DomainError::invariant(format!(
                "sale {} cannot move from {} to {}",
                self.invoice_number, self.status, cmd.status
            )));
        }

        Ok(vec![SaleEvent::StatusChanged {
            from: self.status,
            to: cmd.status,
            updated_by: cmd.updated_by,
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_cancel(&self, cmd: &CancelSale) -> DomainResult<Vec<SaleEvent>> {
        self.ensure_existing(cmd.organization_id, cmd.sale_id)?;
        if self.is_cancelled() {
            return Err(DomainError::AlreadyCancelled);
        }

        let released_balance = if self.settlement.is_paid() {
            Decimal::ZERO
        } else {
            self.balance_amount()
        };

        Ok(vec![SaleEvent::SaleCancelled {
            released_balance,
            cancelled_by: cmd.cancelled_by,
            occurred_at: cmd.occurred_at,
        }])
    }
}
