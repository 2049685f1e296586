use std::collections::HashMap;
use std::sync::RwLock;

use stockledger_core::{LedgerEntryId, OrganizationId};
use stockledger_inventory::{LedgerQuery, StockLedgerEntry};

use super::{ChangeSet, InventoryStore, StoreError, StoredDocument};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DocumentKey {
    kind: String,
    key: String,
}

#[derive(Debug, Default)]
struct Partition {
    documents: HashMap<DocumentKey, StoredDocument>,
    ledger: Vec<StockLedgerEntry>,
    last_sequence: u64,
}

/// In-memory inventory store.
///
/// Intended for tests/dev. A single write lock covers the whole commit, so
/// the version checks and the writes are atomic.
#[derive(Debug, Default)]
pub struct InMemoryInventoryStore {
    partitions: RwLock<HashMap<OrganizationId, Partition>>,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::Backend("lock poisoned".to_string())
    }
}

#[async_trait::async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn load(
        &self,
        organization_id: OrganizationId,
        kind: &str,
        key: &str,
    ) -> Result<Option<StoredDocument>, StoreError> {
        let partitions = self.partitions.read().map_err(|_| Self::poisoned())?;
        let doc_key = DocumentKey {
            kind: kind.to_string(),
            key: key.to_string(),
        };
        Ok(partitions
            .get(&organization_id)
            .and_then(|p| p.documents.get(&doc_key))
            .cloned())
    }

    async fn list(
        &self,
        organization_id: OrganizationId,
        kind: &str,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let partitions = self.partitions.read().map_err(|_| Self::poisoned())?;
        let mut documents: Vec<StoredDocument> = partitions
            .get(&organization_id)
            .map(|p| {
                p.documents
                    .values()
                    .filter(|d| d.kind == kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        documents.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(documents)
    }

    async fn ledger(
        &self,
        organization_id: OrganizationId,
        query: &LedgerQuery,
    ) -> Result<Vec<StockLedgerEntry>, StoreError> {
        let partitions = self.partitions.read().map_err(|_| Self::poisoned())?;
        Ok(partitions
            .get(&organization_id)
            .map(|p| {
                p.ledger
                    .iter()
                    .filter(|e| query.matches(e))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ledger_entry(
        &self,
        organization_id: OrganizationId,
        entry_id: LedgerEntryId,
    ) -> Result<Option<StockLedgerEntry>, StoreError> {
        let partitions = self.partitions.read().map_err(|_| Self::poisoned())?;
        Ok(partitions
            .get(&organization_id)
            .and_then(|p| p.ledger.iter().find(|e| e.id == entry_id))
            .cloned())
    }

    async fn commit(
        &self,
        organization_id: OrganizationId,
        changes: ChangeSet,
    ) -> Result<Vec<StockLedgerEntry>, StoreError> {
        if changes.is_empty() {
            return Ok(vec![]);
        }

        for (idx, entry) in changes.ledger.iter().enumerate() {
            if entry.organization_id != organization_id {
                return Err(StoreError::TenantIsolation(format!(
                    "ledger entry at index {idx} belongs to another organization"
                )));
            }
        }

        let mut partitions = self.partitions.write().map_err(|_| Self::poisoned())?;
        let partition = partitions.entry(organization_id).or_default();

        // Verify every expectation before touching anything.
        for write in &changes.writes {
            let doc_key = DocumentKey {
                kind: write.kind.to_string(),
                key: write.key.clone(),
            };
            let current = partition
                .documents
                .get(&doc_key)
                .map(|d| d.version)
                .unwrap_or(0);
            if !write.expected.matches(current) {
                return Err(StoreError::Concurrency(format!(
                    "{} {}: expected {:?}, found {current}",
                    write.kind, write.key, write.expected
                )));
            }
        }

        for write in changes.writes {
            let doc_key = DocumentKey {
                kind: write.kind.to_string(),
                key: write.key.clone(),
            };
            let version = partition
                .documents
                .get(&doc_key)
                .map(|d| d.version)
                .unwrap_or(0)
                + 1;
            partition.documents.insert(
                doc_key,
                StoredDocument {
                    kind: write.kind.to_string(),
                    key: write.key,
                    version,
                    body: write.body,
                },
            );
        }

        let mut committed = Vec::with_capacity(changes.ledger.len());
        for mut entry in changes.ledger {
            partition.last_sequence += 1;
            entry.sequence = partition.last_sequence;
            partition.ledger.push(entry.clone());
            committed.push(entry);
        }

        Ok(committed)
    }
}
