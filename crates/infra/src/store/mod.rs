//! Tenant-partitioned document + ledger store boundary.
//!
//! Every mutable document (stock records, parties, sales, purchases,
//! transfers, products, warehouses) is stored as a versioned JSON body keyed
//! by `(organization, kind, key)`. Stock ledger entries live in a separate
//! append-only journal and receive their `sequence` at commit time.
//!
//! A [`ChangeSet`] is applied all-or-nothing: every write carries the version
//! it was read at, and a single mismatch rejects the whole set with
//! [`StoreError::Concurrency`].

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

use stockledger_core::{
    ExpectedVersion, LedgerEntryId, OrganizationId, PartyId, ProductId, PurchaseId, SaleId,
    TransferId, WarehouseId,
};
use stockledger_inventory::{LedgerQuery, StockKey, StockLedgerEntry, StockRecord, StockTransfer, Warehouse};
use stockledger_parties::Party;
use stockledger_products::Product;
use stockledger_purchasing::Purchase;
use stockledger_sales::Sale;

pub use in_memory::InMemoryInventoryStore;
pub use postgres::PostgresInventoryStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A document changed (or appeared) since it was read.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// A write or read crossed organization boundaries.
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Serialization(value.to_string())
    }
}

/// A persisted document body with its version (starting at 1).
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub kind: String,
    pub key: String,
    pub version: u64,
    pub body: JsonValue,
}

impl StoredDocument {
    pub fn decode<D: Document>(&self) -> Result<D, StoreError> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// A staged document write.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWrite {
    pub kind: &'static str,
    pub key: String,
    pub expected: ExpectedVersion,
    pub body: JsonValue,
}

/// Everything one operation wants to persist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub writes: Vec<DocumentWrite>,
    pub ledger: Vec<StockLedgerEntry>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.ledger.is_empty()
    }
}

/// A type that can be stored as a versioned document.
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    const KIND: &'static str;

    type Key: core::fmt::Display + Send + Sync;

    fn document_key(&self) -> Self::Key;

    fn owner(&self) -> Option<OrganizationId>;
}

impl Document for Product {
    const KIND: &'static str = "product";
    type Key = ProductId;

    fn document_key(&self) -> ProductId {
        self.id()
    }

    fn owner(&self) -> Option<OrganizationId> {
        Some(self.organization_id())
    }
}

impl Document for Warehouse {
    const KIND: &'static str = "warehouse";
    type Key = WarehouseId;

    fn document_key(&self) -> WarehouseId {
        self.id()
    }

    fn owner(&self) -> Option<OrganizationId> {
        Some(self.organization_id())
    }
}

impl Document for StockRecord {
    const KIND: &'static str = "stock";
    type Key = StockKey;

    fn document_key(&self) -> StockKey {
        self.key()
    }

    fn owner(&self) -> Option<OrganizationId> {
        Some(self.organization_id())
    }
}

impl Document for Party {
    const KIND: &'static str = "party";
    type Key = PartyId;

    fn document_key(&self) -> PartyId {
        self.id_typed()
    }

    fn owner(&self) -> Option<OrganizationId> {
        self.organization_id()
    }
}

impl Document for Sale {
    const KIND: &'static str = "sale";
    type Key = SaleId;

    fn document_key(&self) -> SaleId {
        self.id_typed()
    }

    fn owner(&self) -> Option<OrganizationId> {
        self.organization_id()
    }
}

impl Document for Purchase {
    const KIND: &'static str = "purchase";
    type Key = PurchaseId;

    fn document_key(&self) -> PurchaseId {
        self.id_typed()
    }

    fn owner(&self) -> Option<OrganizationId> {
        self.organization_id()
    }
}

impl Document for StockTransfer {
    const KIND: &'static str = "transfer";
    type Key = TransferId;

    fn document_key(&self) -> TransferId {
        self.id_typed()
    }

    fn owner(&self) -> Option<OrganizationId> {
        self.organization_id()
    }
}

/// Storage boundary shared by the in-memory and Postgres backends.
///
/// All reads and writes are partitioned by organization; there is no way to
/// address another tenant's data through this trait.
#[async_trait::async_trait]
pub trait InventoryStore: Send + Sync {
    async fn load(
        &self,
        organization_id: OrganizationId,
        kind: &str,
        key: &str,
    ) -> Result<Option<StoredDocument>, StoreError>;

    async fn list(
        &self,
        organization_id: OrganizationId,
        kind: &str,
    ) -> Result<Vec<StoredDocument>, StoreError>;

    /// Ledger entries matching `query`, in sequence order.
    async fn ledger(
        &self,
        organization_id: OrganizationId,
        query: &LedgerQuery,
    ) -> Result<Vec<StockLedgerEntry>, StoreError>;

    async fn ledger_entry(
        &self,
        organization_id: OrganizationId,
        entry_id: LedgerEntryId,
    ) -> Result<Option<StockLedgerEntry>, StoreError>;

    /// Atomically apply `changes`, returning the ledger entries with their
    /// assigned sequence numbers.
    async fn commit(
        &self,
        organization_id: OrganizationId,
        changes: ChangeSet,
    ) -> Result<Vec<StockLedgerEntry>, StoreError>;
}

#[async_trait::async_trait]
impl<S> InventoryStore for Arc<S>
where
    S: InventoryStore + ?Sized,
{
    async fn load(
        &self,
        organization_id: OrganizationId,
        kind: &str,
        key: &str,
    ) -> Result<Option<StoredDocument>, StoreError> {
        (**self).load(organization_id, kind, key).await
    }

    async fn list(
        &self,
        organization_id: OrganizationId,
        kind: &str,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        (**self).list(organization_id, kind).await
    }

    async fn ledger(
        &self,
        organization_id: OrganizationId,
        query: &LedgerQuery,
    ) -> Result<Vec<StockLedgerEntry>, StoreError> {
        (**self).ledger(organization_id, query).await
    }

    async fn ledger_entry(
        &self,
        organization_id: OrganizationId,
        entry_id: LedgerEntryId,
    ) -> Result<Option<StockLedgerEntry>, StoreError> {
        (**self).ledger_entry(organization_id, entry_id).await
    }

    async fn commit(
        &self,
        organization_id: OrganizationId,
        changes: ChangeSet,
    ) -> Result<Vec<StockLedgerEntry>, StoreError> {
        (**self).commit(organization_id, changes).await
    }
}

/// Insert a reference document (product, warehouse, party) that must not
/// exist yet.
pub async fn seed_document<S, D>(store: &S, document: &D) -> Result<(), StoreError>
where
    S: InventoryStore + ?Sized,
    D: Document,
{
    let organization_id = document.owner().ok_or_else(|| {
        StoreError::TenantIsolation(format!("{} document has no organization", D::KIND))
    })?;

    let changes = ChangeSet {
        writes: vec![DocumentWrite {
            kind: D::KIND,
            key: document.document_key().to_string(),
            expected: ExpectedVersion::ABSENT,
            body: serde_json::to_value(document)?,
        }],
        ledger: Vec::new(),
    };

    store.commit(organization_id, changes).await?;
    tracing::debug!(
        organization_id = %organization_id,
        kind = D::KIND,
        "seeded reference document"
    );
    Ok(())
}
