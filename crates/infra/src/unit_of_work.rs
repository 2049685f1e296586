//! Read-tracking, write-staging transaction scope for one operation attempt.
//!
//! Every document read through a `UnitOfWork` remembers the version it was
//! read at; staging a write reuses that version as the commit expectation.
//! Documents that were never read are staged as "must not exist yet".
//! Reads see staged writes of the same unit of work.

use std::collections::HashMap;

use stockledger_core::{DomainError, ExpectedVersion, LedgerEntryId, OrganizationId};
use stockledger_inventory::{LedgerQuery, StockLedgerEntry};

use crate::dispatcher::DispatchError;
use crate::store::{ChangeSet, Document, DocumentWrite, InventoryStore, StoreError};

type SlotKey = (&'static str, String);

pub struct UnitOfWork<'s, S: InventoryStore + ?Sized> {
    store: &'s S,
    organization_id: OrganizationId,
    versions: HashMap<SlotKey, u64>,
    staged: Vec<DocumentWrite>,
    ledger: Vec<StockLedgerEntry>,
}

impl<'s, S: InventoryStore + ?Sized> UnitOfWork<'s, S> {
    pub fn new(store: &'s S, organization_id: OrganizationId) -> Self {
        Self {
            store,
            organization_id,
            versions: HashMap::new(),
            staged: Vec::new(),
            ledger: Vec::new(),
        }
    }

    pub fn organization_id(&self) -> OrganizationId {
        self.organization_id
    }

    /// Load a document, preferring this unit of work's staged copy.
    pub async fn load<D: Document>(&mut self, key: &D::Key) -> Result<Option<D>, StoreError> {
        let key = key.to_string();
        if let Some(write) = self
            .staged
            .iter()
            .find(|w| w.kind == D::KIND && w.key == key)
        {
            return Ok(Some(serde_json::from_value(write.body.clone())?));
        }

        let stored = self.store.load(self.organization_id, D::KIND, &key).await?;
        let version = stored.as_ref().map(|d| d.version).unwrap_or(0);
        self.versions.entry((D::KIND, key)).or_insert(version);

        let document = stored.map(|d| d.decode::<D>()).transpose()?;
        if let Some(doc) = &document {
            if doc.owner() != Some(self.organization_id) {
                return Err(StoreError::TenantIsolation(format!(
                    "{} document owned by another organization",
                    D::KIND
                )));
            }
        }
        Ok(document)
    }

    /// Load a document that must exist, failing with `NotFound(entity)`.
    pub async fn require<D: Document>(
        &mut self,
        key: &D::Key,
        entity: &str,
    ) -> Result<D, DispatchError> {
        self.load::<D>(key)
            .await?
            .ok_or_else(|| DispatchError::Domain(DomainError::not_found(entity)))
    }

    /// Stage a document write, replacing any earlier staged copy.
    pub fn stage<D: Document>(&mut self, document: &D) -> Result<(), StoreError> {
        if document.owner() != Some(self.organization_id) {
            return Err(StoreError::TenantIsolation(format!(
                "cannot stage {} for another organization",
                D::KIND
            )));
        }

        let key = document.document_key().to_string();
        let expected = match self.versions.get(&(D::KIND, key.clone())) {
            Some(version) => ExpectedVersion::Exact(*version),
            None => ExpectedVersion::ABSENT,
        };
        let body = serde_json::to_value(document)?;

        match self
            .staged
            .iter_mut()
            .find(|w| w.kind == D::KIND && w.key == key)
        {
            Some(existing) => existing.body = body,
            None => self.staged.push(DocumentWrite {
                kind: D::KIND,
                key,
                expected,
                body,
            }),
        }
        Ok(())
    }

    pub fn append(&mut self, entry: StockLedgerEntry) -> Result<(), StoreError> {
        if entry.organization_id != self.organization_id {
            return Err(StoreError::TenantIsolation(
                "cannot append a ledger entry for another organization".to_string(),
            ));
        }
        self.ledger.push(entry);
        Ok(())
    }

    /// Committed ledger entries matching `query` followed by the staged ones.
    pub async fn ledger_entries(
        &self,
        query: &LedgerQuery,
    ) -> Result<Vec<StockLedgerEntry>, StoreError> {
        let mut entries = self.store.ledger(self.organization_id, query).await?;
        entries.extend(self.ledger.iter().filter(|e| query.matches(e)).cloned());
        Ok(entries)
    }

    pub async fn ledger_entry(
        &self,
        entry_id: LedgerEntryId,
    ) -> Result<Option<StockLedgerEntry>, StoreError> {
        if let Some(entry) = self.ledger.iter().find(|e| e.id == entry_id) {
            return Ok(Some(entry.clone()));
        }
        self.store.ledger_entry(self.organization_id, entry_id).await
    }

    /// Persist everything staged in one atomic store commit.
    pub async fn commit(self) -> Result<Vec<StockLedgerEntry>, StoreError> {
        let changes = ChangeSet {
            writes: self.staged,
            ledger: self.ledger,
        };
        if changes.is_empty() {
            return Ok(vec![]);
        }
        self.store.commit(self.organization_id, changes).await
    }
}
