use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::money::{ensure_non_negative, round_money, try_sum};
use stockledger_core::{
    Aggregate, AggregateRoot, BranchId, Decimal, DocumentTotals, DomainError, DomainResult,
    LinePricing, OrganizationId, PartyId, Payment, PaymentMethod, PaymentStatus, ProductId,
    PurchaseId, Settlement, UserId, WarehouseId,
};

/// Purchase lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Ordered,
    Received,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseLineInput {
    pub product_id: ProductId,
    pub product_name: String,
    pub sku: String,
    pub unit: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub discount_percent: Decimal,
    pub tax_percent: Decimal,
    pub batch_number: Option<String>,
    pub expiry_date: Option<NaiveDate>,
    pub manufacturing_date: Option<NaiveDate>,
}

/// Priced purchase line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseLine {
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
    pub batch_number: Option<String>,
    pub expiry_date: Option<NaiveDate>,
    pub manufacturing_date: Option<NaiveDate>,
}

impl PurchaseLine {
    pub fn price(input: &PurchaseLineInput) -> DomainResult<Self> {
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
            batch_number: input.batch_number.clone(),
            expiry_date: input.expiry_date,
            manufacturing_date: input.manufacturing_date,
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

/// Aggregate root: Purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    id: PurchaseId,
    organization_id: Option<OrganizationId>,
    purchase_number: String,
    branch_id: Option<BranchId>,
    warehouse_id: Option<WarehouseId>,
    supplier_id: Option<PartyId>,
    items: Vec<PurchaseLine>,
    subtotal: Decimal,
    total_discount: Decimal,
    total_tax: Decimal,
    shipping_charges: Decimal,
    other_charges: Decimal,
    payment_method: PaymentMethod,
    settlement: Settlement,
    status: PurchaseStatus,
    notes: Option<String>,
    created_by: Option<UserId>,
    purchase_date: Option<DateTime<Utc>>,
    received_by: Option<UserId>,
    received_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    created: bool,
}

impl Purchase {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: PurchaseId) -> Self {
        Self {
            id,
            organization_id: None,
            purchase_number: String::new(),
            branch_id: None,
            warehouse_id: None,
            supplier_id: None,
            items: Vec::new(),
            subtotal: Decimal::ZERO,
            total_discount: Decimal::ZERO,
            total_tax: Decimal::ZERO,
            shipping_charges: Decimal::ZERO,
            other_charges: Decimal::ZERO,
            payment_method: PaymentMethod::Cash,
            settlement: Settlement::open(Decimal::ZERO, PaymentMethod::Cash),
            status: PurchaseStatus::Ordered,
            notes: None,
            created_by: None,
            purchase_date: None,
            received_by: None,
            received_at: None,
            cancelled_at: None,
            created: false,
        }
    }

    pub fn id_typed(&self) -> PurchaseId {
        self.id
    }

    pub fn organization_id(&self) -> Option<OrganizationId> {
        self.organization_id
    }

    pub fn purchase_number(&self) -> &str {
        &self.purchase_number
    }

    pub fn branch_id(&self) -> Option<BranchId> {
        self.branch_id
    }

    pub fn warehouse_id(&self) -> Option<WarehouseId> {
        self.warehouse_id
    }

    pub fn supplier_id(&self) -> Option<PartyId> {
        self.supplier_id
    }

    pub fn items(&self) -> &[PurchaseLine] {
        &self.items
    }

    pub fn subtotal(&self) -> Decimal {
        self.subtotal
    }

    pub fn total_discount(&self) -> Decimal {
        self.total_discount
    }

    pub fn total_tax(&self) -> Decimal {
        self.total_tax
    }

    pub fn shipping_charges(&self) -> Decimal {
        self.shipping_charges
    }

    pub fn other_charges(&self) -> Decimal {
        self.other_charges
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

    pub fn status(&self) -> PurchaseStatus {
        self.status
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn purchase_date(&self) -> Option<DateTime<Utc>> {
        self.purchase_date
    }

    pub fn received_by(&self) -> Option<UserId> {
        self.received_by
    }

    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        self.received_at
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == PurchaseStatus::Cancelled
    }

    pub fn is_received(&self) -> bool {
        self.status == PurchaseStatus::Received
    }
}

impl AggregateRoot for Purchase {
    type Id = PurchaseId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Command: CreatePurchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePurchase {
    pub organization_id: OrganizationId,
    pub purchase_id: PurchaseId,
    pub purchase_number: String,
    pub branch_id: BranchId,
    pub warehouse_id: WarehouseId,
    pub supplier_id: PartyId,
    pub lines: Vec<PurchaseLineInput>,
    pub shipping_charges: Decimal,
    pub other_charges: Decimal,
    pub payment_method: PaymentMethod,
    pub notes: Option<String>,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReceivePurchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivePurchase {
    pub organization_id: OrganizationId,
    pub purchase_id: PurchaseId,
    pub received_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddPurchasePayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddPurchasePayment {
    pub organization_id: OrganizationId,
    pub purchase_id: PurchaseId,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub recorded_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelPurchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelPurchase {
    pub organization_id: OrganizationId,
    pub purchase_id: PurchaseId,
    pub cancelled_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseCommand {
    CreatePurchase(CreatePurchase),
    ReceivePurchase(ReceivePurchase),
    AddPayment(AddPurchasePayment),
    CancelPurchase(CancelPurchase),
}

/// Event: PurchaseCreated. Carries the priced lines and totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseCreated {
    pub organization_id: OrganizationId,
    pub purchase_id: PurchaseId,
    pub purchase_number: String,
    pub branch_id: BranchId,
    pub warehouse_id: WarehouseId,
    pub supplier_id: PartyId,
    pub items: Vec<PurchaseLine>,
    pub subtotal: Decimal,
    pub total_discount: Decimal,
    pub total_tax: Decimal,
    pub shipping_charges: Decimal,
    pub other_charges: Decimal,
    pub total_amount: Decimal,
    pub payment_method: PaymentMethod,
    pub notes: Option<String>,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseEvent {
    PurchaseCreated(PurchaseCreated),
    PurchaseReceived {
        received_by: UserId,
        occurred_at: DateTime<Utc>,
    },
    PaymentRecorded(Payment),
    PurchaseCancelled {
        /// Unpaid balance written off against the supplier.
        released_balance: Decimal,
        /// Stock already received stays in the warehouse.
        was_received: bool,
        occurred_at: DateTime<Utc>,
    },
}

impl Aggregate for Purchase {
    type Command = PurchaseCommand;
    type Event = PurchaseEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PurchaseEvent::PurchaseCreated(e) => {
                self.id = e.purchase_id;
                self.organization_id = Some(e.organization_id);
                self.purchase_number = e.purchase_number.clone();
                self.branch_id = Some(e.branch_id);
                self.warehouse_id = Some(e.warehouse_id);
                self.supplier_id = Some(e.supplier_id);
                self.items = e.items.clone();
                self.subtotal = e.subtotal;
                self.total_discount = e.total_discount;
                self.total_tax = e.total_tax;
                self.shipping_charges = e.shipping_charges;
                self.other_charges = e.other_charges;
                self.payment_method = e.payment_method;
                self.settlement = Settlement::open(e.total_amount, e.payment_method);
                self.status = PurchaseStatus::Ordered;
                self.notes = e.notes.clone();
                self.created_by = Some(e.created_by);
                self.purchase_date = Some(e.occurred_at);
                self.created = true;
            }
            PurchaseEvent::PurchaseReceived {
                received_by,
                occurred_at,
            } => {
                self.status = PurchaseStatus::Received;
                self.received_by = Some(*received_by);
                self.received_at = Some(*occurred_at);
            }
            PurchaseEvent::PaymentRecorded(payment) => {
                self.settlement.record(payment.clone());
            }
            PurchaseEvent::PurchaseCancelled { occurred_at, .. } => {
                self.status = PurchaseStatus::Cancelled;
                self.cancelled_at = Some(*occurred_at);
            }
        }
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PurchaseCommand::CreatePurchase(cmd) => self.handle_create(cmd),
            PurchaseCommand::ReceivePurchase(cmd) => self.handle_receive(cmd),
            PurchaseCommand::AddPayment(cmd) => self.handle_add_payment(cmd),
            PurchaseCommand::CancelPurchase(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl Purchase {
    fn ensure_existing(
        &self,
        organization_id: OrganizationId,
        purchase_id: PurchaseId,
    ) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::not_found("purchase"));
        }
        if self.organization_id != Some(organization_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != purchase_id {
            return Err(DomainError::invariant("purchase_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreatePurchase) -> DomainResult<Vec<PurchaseEvent>> {
        if self.created {
            return Err(DomainError::conflict("purchase already exists"));
        }
        if cmd.lines.is_empty() {
            return Err(DomainError::validation(
                "purchase must have at least one item",
            ));
        }
        ensure_non_negative("shipping charges", cmd.shipping_charges)?;
        ensure_non_negative("other charges", cmd.other_charges)?;

        let items = cmd
            .lines
            .iter()
            .map(PurchaseLine::price)
            .collect::<DomainResult<Vec<_>>>()?;
        let totals = DocumentTotals::from_lines(items.iter().map(PurchaseLine::pricing))?;

        let shipping_charges = round_money(cmd.shipping_charges);
        let other_charges = round_money(cmd.other_charges);
        let total_amount = try_sum([
            totals.subtotal,
            totals.tax_amount,
            shipping_charges,
            other_charges,
        ])?;

        Ok(vec![PurchaseEvent::PurchaseCreated(PurchaseCreated {
            organization_id: cmd.organization_id,
            purchase_id: cmd.purchase_id,
            purchase_number: cmd.purchase_number.clone(),
            branch_id: cmd.branch_id,
            warehouse_id: cmd.warehouse_id,
            supplier_id: cmd.supplier_id,
            items,
            subtotal: totals.subtotal,
            total_discount: totals.discount_amount,
            total_tax: totals.tax_amount,
            shipping_charges,
            other_charges,
            total_amount,
            payment_method: cmd.payment_method,
            notes: cmd.notes.clone(),
            created_by: cmd.created_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_receive(&self, cmd: &ReceivePurchase) -> DomainResult<Vec<PurchaseEvent>> {
        self.ensure_existing(cmd.organization_id, cmd.purchase_id)?;
        match self.status {
            PurchaseStatus::Cancelled => Err(DomainError::AlreadyCancelled),
            PurchaseStatus::Received => Err(DomainError::invariant(format!(
                "purchase {} has already been received",
                self.purchase_number
            ))),
            PurchaseStatus::Ordered => {
                Ok(vec![PurchaseEvent::PurchaseReceived {
                    received_by: cmd.received_by,
                    occurred_at: cmd.occurred_at,
                }])
            }
        }
    }

    fn handle_add_payment(&self, cmd: &AddPurchasePayment) -> DomainResult<Vec<PurchaseEvent>> {
        self.ensure_existing(cmd.organization_id, cmd.purchase_id)?;
        if self.is_cancelled() {
            return Err(DomainError::AlreadyCancelled);
        }
        self.settlement.validate_payment(cmd.amount)?;

        Ok(vec![PurchaseEvent::PaymentRecorded(Payment {
            amount: cmd.amount,
            method: cmd.method,
            reference: cmd.reference.clone(),
            recorded_by: cmd.recorded_by,
            paid_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelPurchase) -> DomainResult<Vec<PurchaseEvent>> {
        self.ensure_existing(cmd.organization_id, cmd.purchase_id)?;
        if self.is_cancelled() {
            return Err(DomainError::AlreadyCancelled);
        }

        let released_balance = if self.settlement.is_paid() {
            Decimal::ZERO
        } else {
            self.balance_amount()
        };

        Ok(vec![PurchaseEvent::PurchaseCancelled {
            released_balance,
            was_received: self.is_received(),
            occurred_at: cmd.occurred_at,
        }])
    }
}
