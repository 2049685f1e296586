use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::money::{ensure_non_negative, ensure_positive, try_add};
use stockledger_core::{
    Aggregate, AggregateRoot, Decimal, DomainError, DomainResult, OrganizationId, PartyId,
};

/// Party kind: customer or supplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartyKind {
    Customer,
    Supplier,
}

impl PartyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PartyKind::Customer => "customer",
            PartyKind::Supplier => "supplier",
        }
    }
}

/// Party status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartyStatus {
    Active,
    Suspended,
}

/// Contact information for a party.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
}

/// Exact change to a party's running balances.
///
/// Balances are maintained incrementally; every path that touches them
/// posts one of these and nothing else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub outstanding: Decimal,
    pub billed: Decimal,
    pub payments: Decimal,
}

impl BalanceDelta {
    /// A new sale or purchase. Credit documents accrue outstanding balance,
    /// anything else is paid at once.
    pub fn document(total: Decimal, on_credit: bool) -> Self {
        if on_credit {
            Self {
                outstanding: total,
                billed: total,
                payments: Decimal::ZERO,
            }
        } else {
            Self {
                outstanding: Decimal::ZERO,
                billed: total,
                payments: total,
            }
        }
    }

    pub fn payment(amount: Decimal) -> Self {
        Self {
            outstanding: -amount,
            billed: Decimal::ZERO,
            payments: amount,
        }
    }

    /// Outstanding amount written off when a document is cancelled.
    pub fn release(amount: Decimal) -> Self {
        Self {
            outstanding: -amount,
            billed: Decimal::ZERO,
            payments: Decimal::ZERO,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.outstanding.is_zero() && self.billed.is_zero() && self.payments.is_zero()
    }
}

/// Aggregate root: Party (customer or supplier).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    id: PartyId,
    organization_id: Option<OrganizationId>,
    kind: PartyKind,
    name: String,
    contact: ContactInfo,
    status: PartyStatus,
    credit_limit: Decimal,
    outstanding_balance: Decimal,
    total_billed: Decimal,
    total_payments: Decimal,
    updated_at: Option<DateTime<Utc>>,
    created: bool,
}

impl Party {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: PartyId) -> Self {
        Self {
            id,
            organization_id: None,
            kind: PartyKind::Customer,
            name: String::new(),
            contact: ContactInfo::default(),
            status: PartyStatus::Active,
            credit_limit: Decimal::ZERO,
            outstanding_balance: Decimal::ZERO,
            total_billed: Decimal::ZERO,
            total_payments: Decimal::ZERO,
            updated_at: None,
            created: false,
        }
    }

    /// Convenience for seeding: register a party in one step.
    pub fn register(cmd: RegisterParty) -> DomainResult<Self> {
        let mut party = Party::empty(cmd.party_id);
        party.execute(&PartyCommand::RegisterParty(cmd))?;
        Ok(party)
    }

    pub fn id_typed(&self) -> PartyId {
        self.id
    }

    pub fn organization_id(&self) -> Option<OrganizationId> {
        self.organization_id
    }

    pub fn kind(&self) -> PartyKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contact(&self) -> &ContactInfo {
        &self.contact
    }

    pub fn status(&self) -> PartyStatus {
        self.status
    }

    pub fn credit_limit(&self) -> Decimal {
        self.credit_limit
    }

    pub fn outstanding_balance(&self) -> Decimal {
        self.outstanding_balance
    }

    /// Total billed: `totalSales` for customers, `totalPurchases` for suppliers.
    pub fn total_billed(&self) -> Decimal {
        self.total_billed
    }

    pub fn total_sales(&self) -> Decimal {
        match self.kind {
            PartyKind::Customer => self.total_billed,
            PartyKind::Supplier => Decimal::ZERO,
        }
    }

    pub fn total_purchases(&self) -> Decimal {
        match self.kind {
            PartyKind::Supplier => self.total_billed,
            PartyKind::Customer => Decimal::ZERO,
        }
    }

    pub fn total_payments(&self) -> Decimal {
        self.total_payments
    }

    /// Invariant helper: whether this party is allowed to transact.
    ///
    /// Suspended parties cannot transact.
    pub fn can_transact(&self) -> bool {
        self.status == PartyStatus::Active
    }

    /// A zero credit limit means "no limit configured".
    pub fn exceeds_credit_limit(&self) -> bool {
        self.credit_limit > Decimal::ZERO && self.outstanding_balance > self.credit_limit
    }

    pub fn ensure_kind(&self, kind: PartyKind) -> DomainResult<()> {
        if self.kind != kind {
            return Err(DomainError::validation(format!(
                "{} is a {}, expected a {}",
                self.name,
                self.kind.as_str(),
                kind.as_str()
            )));
        }
        Ok(())
    }
}

impl AggregateRoot for Party {
    type Id = PartyId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Command: RegisterParty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterParty {
    pub organization_id: OrganizationId,
    pub party_id: PartyId,
    pub kind: PartyKind,
    pub name: String,
    pub contact: Option<ContactInfo>,
    pub credit_limit: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SuspendParty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendParty {
    pub organization_id: OrganizationId,
    pub party_id: PartyId,
    /// Optional human-readable reason for suspension.
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: post a new sale/purchase total against the party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostDocument {
    pub organization_id: OrganizationId,
    pub party_id: PartyId,
    pub total: Decimal,
    pub on_credit: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Command: post a payment made against an open document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostPayment {
    pub organization_id: OrganizationId,
    pub party_id: PartyId,
    pub amount: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Command: release the unpaid balance of a cancelled document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseOutstanding {
    pub organization_id: OrganizationId,
    pub party_id: PartyId,
    pub amount: Decimal,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartyCommand {
    RegisterParty(RegisterParty),
    SuspendParty(SuspendParty),
    PostDocument(PostDocument),
    PostPayment(PostPayment),
    ReleaseOutstanding(ReleaseOutstanding),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartyEvent {
    PartyRegistered(RegisterParty),
    PartySuspended {
        reason: Option<String>,
        occurred_at: DateTime<Utc>,
    },
    BalanceAdjusted {
        delta: BalanceDelta,
        occurred_at: DateTime<Utc>,
    },
}

impl Aggregate for Party {
    type Command = PartyCommand;
    type Event = PartyEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PartyEvent::PartyRegistered(e) => {
                self.id = e.party_id;
                self.organization_id = Some(e.organization_id);
                self.kind = e.kind;
                self.name = e.name.trim().to_string();
                self.contact = e.contact.clone().unwrap_or_default();
                self.status = PartyStatus::Active;
                self.credit_limit = e.credit_limit;
                self.updated_at = Some(e.occurred_at);
                self.created = true;
            }
            PartyEvent::PartySuspended { occurred_at, .. } => {
                self.status = PartyStatus::Suspended;
                self.updated_at = Some(*occurred_at);
            }
            PartyEvent::BalanceAdjusted { delta, occurred_at } => {
                self.outstanding_balance += delta.outstanding;
                self.total_billed += delta.billed;
                self.total_payments += delta.payments;
                self.updated_at = Some(*occurred_at);
            }
        }
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PartyCommand::RegisterParty(cmd) => self.handle_register(cmd),
            PartyCommand::SuspendParty(cmd) => self.handle_suspend(cmd),
            PartyCommand::PostDocument(cmd) => {
                self.ensure_existing(cmd.organization_id, cmd.party_id)?;
                if !self.can_transact() {
                    return Err(DomainError::validation(format!(
                        "{} {} is suspended",
                        self.kind.as_str(),
                        self.name
                    )));
                }
                ensure_non_negative("document total", cmd.total)?;
                self.balance_event(BalanceDelta::document(cmd.total, cmd.on_credit), cmd.occurred_at)
            }
            PartyCommand::PostPayment(cmd) => {
                self.ensure_existing(cmd.organization_id, cmd.party_id)?;
                ensure_positive("payment amount", cmd.amount)?;
                self.balance_event(BalanceDelta::payment(cmd.amount), cmd.occurred_at)
            }
            PartyCommand::ReleaseOutstanding(cmd) => {
                self.ensure_existing(cmd.organization_id, cmd.party_id)?;
                ensure_non_negative("released amount", cmd.amount)?;
                self.balance_event(BalanceDelta::release(cmd.amount), cmd.occurred_at)
            }
        }
    }
}

impl Party {
    fn ensure_existing(&self, organization_id: OrganizationId, party_id: PartyId) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::not_found(self.kind.as_str()));
        }
        if self.organization_id != Some(organization_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != party_id {
            return Err(DomainError::invariant("party_id mismatch"));
        }
        Ok(())
    }

    fn balance_event(
        &self,
        delta: BalanceDelta,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<Vec<PartyEvent>> {
        if delta.is_zero() {
            return Ok(vec![]);
        }
        try_add(self.outstanding_balance, delta.outstanding)?;
        try_add(self.total_billed, delta.billed)?;
        try_add(self.total_payments, delta.payments)?;
        Ok(vec![PartyEvent::BalanceAdjusted { delta, occurred_at }])
    }

    fn handle_register(&self, cmd: &RegisterParty) -> DomainResult<Vec<PartyEvent>> {
        if self.created {
            return Err(DomainError::conflict("party already exists"));
        }
        if cmd.name.trim().is_empty() {
            return Err(DomainError::validation("name cannot be empty"));
        }
        ensure_non_negative("credit limit", cmd.credit_limit)?;

        Ok(vec![PartyEvent::PartyRegistered(cmd.clone())])
    }

    fn handle_suspend(&self, cmd: &SuspendParty) -> DomainResult<Vec<PartyEvent>> {
        self.ensure_existing(cmd.organization_id, cmd.party_id)?;

        if self.status == PartyStatus::Suspended {
            return Err(DomainError::conflict("party is already suspended"));
        }

        Ok(vec![PartyEvent::PartySuspended {
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        }])
    }
}
