//! Warehouse-to-warehouse transfers.
//!
//! ```text
//! draft ─┐
//!        ├─> pending ──ship──> in_transit ──receive──> received
//!        │      │                  │
//!        └──────┴──────cancel──────┴──> cancelled
//! ```
//!
//! The aggregate only tracks the workflow. Stock moves when the transfer
//! ships (`transfer_out` at the source) and when it is received
//! (`transfer_in` at the destination); neither happens on creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::money::{ensure_non_negative, ensure_positive};
use stockledger_core::{
    Aggregate, AggregateRoot, BranchId, Decimal, DomainError, DomainResult, OrganizationId,
    ProductId, TransferId, UserId, WarehouseId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Draft,
    Pending,
    InTransit,
    Received,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Draft => "draft",
            TransferStatus::Pending => "pending",
            TransferStatus::InTransit => "in_transit",
            TransferStatus::Received => "received",
            TransferStatus::Cancelled => "cancelled",
        }
    }

    pub fn can_cancel(self) -> bool {
        matches!(
            self,
            TransferStatus::Draft | TransferStatus::Pending | TransferStatus::InTransit
        )
    }
}

impl core::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Line of a transfer. `unit_cost` is the source average cost at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferItem {
    pub product_id: ProductId,
    pub product_name: String,
    pub sku: String,
    pub unit: String,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub batch_number: Option<String>,
    pub notes: Option<String>,
}

/// Aggregate root: StockTransfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockTransfer {
    id: TransferId,
    organization_id: Option<OrganizationId>,
    number: String,
    source_branch_id: Option<BranchId>,
    source_warehouse_id: Option<WarehouseId>,
    destination_branch_id: Option<BranchId>,
    destination_warehouse_id: Option<WarehouseId>,
    items: Vec<TransferItem>,
    total_items: usize,
    total_quantity: Decimal,
    status: TransferStatus,
    notes: Option<String>,
    created_by: Option<UserId>,
    created_at: Option<DateTime<Utc>>,
    shipped_by: Option<UserId>,
    shipped_at: Option<DateTime<Utc>>,
    received_by: Option<UserId>,
    received_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    cancellation_reason: Option<String>,
    created: bool,
}

impl StockTransfer {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: TransferId) -> Self {
        Self {
            id,
            organization_id: None,
            number: String::new(),
            source_branch_id: None,
            source_warehouse_id: None,
            destination_branch_id: None,
            destination_warehouse_id: None,
            items: Vec::new(),
            total_items: 0,
            total_quantity: Decimal::ZERO,
            status: TransferStatus::Draft,
            notes: None,
            created_by: None,
            created_at: None,
            shipped_by: None,
            shipped_at: None,
            received_by: None,
            received_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            created: false,
        }
    }

    pub fn id_typed(&self) -> TransferId {
        self.id
    }

    pub fn organization_id(&self) -> Option<OrganizationId> {
        self.organization_id
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    pub fn source_branch_id(&self) -> Option<BranchId> {
        self.source_branch_id
    }

    pub fn source_warehouse_id(&self) -> Option<WarehouseId> {
        self.source_warehouse_id
    }

    pub fn destination_branch_id(&self) -> Option<BranchId> {
        self.destination_branch_id
    }

    pub fn destination_warehouse_id(&self) -> Option<WarehouseId> {
        self.destination_warehouse_id
    }

    pub fn items(&self) -> &[TransferItem] {
        &self.items
    }

    pub fn total_items(&self) -> usize {
        self.total_items
    }

    pub fn total_quantity(&self) -> Decimal {
        self.total_quantity
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    pub fn created_by(&self) -> Option<UserId> {
        self.created_by
    }

    pub fn shipped_at(&self) -> Option<DateTime<Utc>> {
        self.shipped_at
    }

    pub fn received_by(&self) -> Option<UserId> {
        self.received_by
    }

    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        self.received_at
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        self.cancellation_reason.as_deref()
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    /// True when the transfer touches `warehouse_id` at either end.
    pub fn involves(&self, warehouse_id: WarehouseId) -> bool {
        self.source_warehouse_id == Some(warehouse_id)
            || self.destination_warehouse_id == Some(warehouse_id)
    }
}

impl AggregateRoot for StockTransfer {
    type Id = TransferId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Command: CreateTransfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransfer {
    pub organization_id: OrganizationId,
    pub transfer_id: TransferId,
    pub number: String,
    pub source_branch_id: BranchId,
    pub source_warehouse_id: WarehouseId,
    pub destination_branch_id: BranchId,
    pub destination_warehouse_id: WarehouseId,
    pub items: Vec<TransferItem>,
    pub notes: Option<String>,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ShipTransfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipTransfer {
    pub organization_id: OrganizationId,
    pub transfer_id: TransferId,
    pub shipped_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReceiveTransfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveTransfer {
    pub organization_id: OrganizationId,
    pub transfer_id: TransferId,
    pub received_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelTransfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTransfer {
    pub organization_id: OrganizationId,
    pub transfer_id: TransferId,
    pub reason: Option<String>,
    pub cancelled_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferCommand {
    Create(CreateTransfer),
    Ship(ShipTransfer),
    Receive(ReceiveTransfer),
    Cancel(CancelTransfer),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferEvent {
    Created(CreateTransfer),
    Shipped {
        shipped_by: UserId,
        occurred_at: DateTime<Utc>,
    },
    Received {
        received_by: UserId,
        occurred_at: DateTime<Utc>,
    },
    Cancelled {
        previous_status: TransferStatus,
        reason: Option<String>,
        occurred_at: DateTime<Utc>,
    },
}

impl Aggregate for StockTransfer {
    type Command = TransferCommand;
    type Event = TransferEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            TransferEvent::Created(e) => {
                self.id = e.transfer_id;
                self.organization_id = Some(e.organization_id);
                self.number = e.number.clone();
                self.source_branch_id = Some(e.source_branch_id);
                self.source_warehouse_id = Some(e.source_warehouse_id);
                self.destination_branch_id = Some(e.destination_branch_id);
                self.destination_warehouse_id = Some(e.destination_warehouse_id);
                self.items = e.items.clone();
                self.total_items = e.items.len();
                self.total_quantity = e.items.iter().map(|i| i.quantity).sum();
                self.status = TransferStatus::Pending;
                self.notes = e.notes.clone();
                self.created_by = Some(e.created_by);
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            TransferEvent::Shipped {
                shipped_by,
                occurred_at,
            } => {
                self.status = TransferStatus::InTransit;
                self.shipped_by = Some(*shipped_by);
                self.shipped_at = Some(*occurred_at);
            }
            TransferEvent::Received {
                received_by,
                occurred_at,
            } => {
                self.status = TransferStatus::Received;
                self.received_by = Some(*received_by);
                self.received_at = Some(*occurred_at);
            }
            TransferEvent::Cancelled {
                reason,
                occurred_at,
                ..
            } => {
                self.status = TransferStatus::Cancelled;
                self.cancellation_reason = reason.clone();
                self.cancelled_at = Some(*occurred_at);
            }
        }
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            TransferCommand::Create(cmd) => self.handle_create(cmd),
            TransferCommand::Ship(cmd) => {
                self.ensure_created(cmd.organization_id, cmd.transfer_id)?;
                self.ensure_status(TransferStatus::Pending, "ship")?;
                Ok(vec![TransferEvent::Shipped {
                    shipped_by: cmd.shipped_by,
                    occurred_at: cmd.occurred_at,
                }])
            }
            TransferCommand::Receive(cmd) => {
                self.ensure_created(cmd.organization_id, cmd.transfer_id)?;
                self.ensure_status(TransferStatus::InTransit, "receive")?;
                Ok(vec![TransferEvent::Received {
                    received_by: cmd.received_by,
                    occurred_at: cmd.occurred_at,
                }])
            }
            TransferCommand::Cancel(cmd) => {
                self.ensure_created(cmd.organization_id, cmd.transfer_id)?;
                if !self.status.can_cancel() {
                    return Err(DomainError::invalid_transfer_state(
                        self.status.as_str(),
                        "cancel",
                    ));
                }
                Ok(vec![TransferEvent::Cancelled {
                    previous_status: self.status,
                    reason: cmd.reason.clone(),
                    occurred_at: cmd.occurred_at,
                }])
            }
        }
    }
}

impl StockTransfer {
    fn ensure_created(
        &self,
        organization_id: OrganizationId,
        transfer_id: TransferId,
    ) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::not_found("stock transfer"));
        }
        if self.organization_id != Some(organization_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != transfer_id {
            return Err(DomainError::invariant("transfer_id mismatch"));
        }
        Ok(())
    }

    fn ensure_status(&self, expected: TransferStatus, action: &str) -> DomainResult<()> {
        if self.status != expected {
            return Err(DomainError::invalid_transfer_state(self.status.as_str(), action));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateTransfer) -> DomainResult<Vec<TransferEvent>> {
        if self.created {
            return Err(DomainError::conflict("transfer already exists"));
        }
        if cmd.source_warehouse_id == cmd.destination_warehouse_id {
            return Err(DomainError::validation(
                "source and destination warehouse must differ",
            ));
        }
        if cmd.items.is_empty() {
            return Err(DomainError::validation("transfer must have at least one item"));
        }
        for item in &cmd.items {
            ensure_positive("transfer quantity", item.quantity)?;
            ensure_non_negative("transfer unit cost", item.unit_cost)?;
        }
        Ok(vec![TransferEvent::Created(cmd.clone())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_org() -> OrganizationId {
        OrganizationId::from_uuid(uuid::Uuid::from_u128(7))
    }

    fn item(qty: Decimal) -> TransferItem {
        TransferItem {
            product_id: ProductId::new(),
            product_name: "Widget".to_string(),
            sku: "W-1".to_string(),
            unit: "pcs".to_string(),
            quantity: qty,
            unit_cost: dec!(2.5),
            batch_number: None,
            notes: None,
        }
    }

    fn create_cmd(id: TransferId, items: Vec<TransferItem>) -> CreateTransfer {
        CreateTransfer {
            organization_id: test_org(),
            transfer_id: id,
            number: "TRF-260101-0007-AB12".to_string(),
            source_branch_id: BranchId::new(),
            source_warehouse_id: WarehouseId::new(),
            destination_branch_id: BranchId::new(),
            destination_warehouse_id: WarehouseId::new(),
            items,
            notes: None,
            created_by: UserId::new(),
            occurred_at: Utc::now(),
        }
    }

    fn created(items: Vec<TransferItem>) -> StockTransfer {
        let id = TransferId::new();
        let mut transfer = StockTransfer::empty(id);
        transfer
            .execute(&TransferCommand::Create(create_cmd(id, items)))
            .unwrap();
        transfer
    }

    fn ship(t: &StockTransfer) -> TransferCommand {
        TransferCommand::Ship(ShipTransfer {
            organization_id: test_org(),
            transfer_id: t.id_typed(),
            shipped_by: UserId::new(),
            occurred_at: Utc::now(),
        })
    }

    fn receive(t: &StockTransfer) -> TransferCommand {
        TransferCommand::Receive(ReceiveTransfer {
            organization_id: test_org(),
            transfer_id: t.id_typed(),
            received_by: UserId::new(),
            occurred_at: Utc::now(),
        })
    }

    fn cancel(t: &StockTransfer) -> TransferCommand {
        TransferCommand::Cancel(CancelTransfer {
            organization_id: test_org(),
            transfer_id: t.id_typed(),
            reason: Some("truck unavailable".to_string()),
            cancelled_by: UserId::new(),
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn create_yields_pending_with_totals() {
        let t = created(vec![item(dec!(4)), item(dec!(6))]);
        assert_eq!(t.status(), TransferStatus::Pending);
        assert_eq!(t.total_items(), 2);
        assert_eq!(t.total_quantity(), dec!(10));
    }

    #[test]
    fn happy_path_ship_then_receive() {
        let mut t = created(vec![item(dec!(1))]);
        t.execute(&ship(&t)).unwrap();
        assert_eq!(t.status(), TransferStatus::InTransit);
        assert!(t.shipped_at().is_some());
        t.execute(&receive(&t)).unwrap();
        assert_eq!(t.status(), TransferStatus::Received);
        assert!(t.received_by().is_some());
    }

    #[test]
    fn receive_before_ship_is_invalid() {
        let t = created(vec![item(dec!(1))]);
        match t.handle(&receive(&t)).unwrap_err() {
            DomainError::InvalidTransferState { status, action } => {
                assert_eq!(status, "pending");
                assert_eq!(action, "receive");
            }
            _ => panic!("Expected InvalidTransferState"),
        }
    }

    #[test]
    fn cancel_allowed_until_received() {
        let mut t = created(vec![item(dec!(1))]);
        t.execute(&ship(&t)).unwrap();
        let events = t.execute(&cancel(&t)).unwrap();
        assert!(matches!(
            events[0],
            TransferEvent::Cancelled {
                previous_status: TransferStatus::InTransit,
                ..
            }
        ));
        assert_eq!(t.status(), TransferStatus::Cancelled);
        assert_eq!(t.cancellation_reason(), Some("truck unavailable"));

        assert!(matches!(
            t.handle(&cancel(&t)),
            Err(DomainError::InvalidTransferState { .. })
        ));
    }

    #[test]
    fn received_transfer_cannot_be_cancelled() {
        let mut t = created(vec![item(dec!(1))]);
        t.execute(&ship(&t)).unwrap();
        t.execute(&receive(&t)).unwrap();
        assert!(matches!(
            t.handle(&cancel(&t)),
            Err(DomainError::InvalidTransferState { .. })
        ));
    }

    #[test]
    fn create_validation() {
        let id = TransferId::new();
        let empty = StockTransfer::empty(id);

        let mut same = create_cmd(id, vec![item(dec!(1))]);
        same.destination_warehouse_id = same.source_warehouse_id;
        match empty.handle(&TransferCommand::Create(same)).unwrap_err() {
            DomainError::Validation(msg) if msg.contains("must differ") => {}
            _ => panic!("Expected validation error for same warehouse"),
        }

        let no_items = create_cmd(id, vec![]);
        assert!(empty.handle(&TransferCommand::Create(no_items)).is_err());

        let zero = create_cmd(id, vec![item(dec!(0))]);
        assert!(empty.handle(&TransferCommand::Create(zero)).is_err());
    }

    #[test]
    fn commands_on_missing_transfer_are_not_found() {
        let t = StockTransfer::empty(TransferId::new());
        assert!(matches!(t.handle(&ship(&t)), Err(DomainError::NotFound(_))));
    }
}
