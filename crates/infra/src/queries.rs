//! Read side: stock lookups, valuation, ledger history and reconciliation.
//!
//! Queries read committed state straight from the store; there are no
//! separate read models to keep in sync.

use std::sync::Arc;

use serde::Serialize;
use tracing::{instrument, warn};

use stockledger_core::money::round_money;
use stockledger_core::{
    Decimal, OrganizationId, PartyId, PurchaseId, SaleId, TransferId, WarehouseId,
};
use stockledger_inventory::{
    LedgerQuery, LedgerReplay, StockKey, StockLedgerEntry, StockRecord, StockTransfer,
    TransferStatus,
};
use stockledger_parties::Party;
use stockledger_purchasing::Purchase;
use stockledger_sales::Sale;

use crate::store::{Document, InventoryStore, StoreError};

/// Valuation of one warehouse: Σ quantity × average cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarehouseValuation {
    pub warehouse_id: WarehouseId,
    pub products: usize,
    pub total_quantity: Decimal,
    pub total_value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationLine {
    pub stock: StockKey,
    pub recorded_quantity: Decimal,
    pub ledger_quantity: Decimal,
    pub entries: usize,
    /// Set when the ledger chain is broken or does not end at the recorded quantity.
    pub problem: Option<String>,
}

impl ReconciliationLine {
    pub fn is_consistent(&self) -> bool {
        self.problem.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub organization_id: OrganizationId,
    pub lines: Vec<ReconciliationLine>,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.lines.iter().all(ReconciliationLine::is_consistent)
    }

    pub fn discrepancies(&self) -> impl Iterator<Item = &ReconciliationLine> {
        self.lines.iter().filter(|l| !l.is_consistent())
    }
}

pub struct InventoryQueries<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> Clone for InventoryQueries<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S> InventoryQueries<S>
where
    S: InventoryStore + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    async fn document<D: Document>(
        &self,
        organization_id: OrganizationId,
        key: &D::Key,
    ) -> Result<Option<D>, StoreError> {
        self.store
            .load(organization_id, D::KIND, &key.to_string())
            .await?
            .map(|d| d.decode())
            .transpose()
    }

    async fn documents<D: Document>(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Vec<D>, StoreError> {
        self.store
            .list(organization_id, D::KIND)
            .await?
            .iter()
            .map(|d| d.decode())
            .collect()
    }

    pub async fn stock_level(
        &self,
        organization_id: OrganizationId,
        key: StockKey,
    ) -> Result<Option<StockRecord>, StoreError> {
        self.document(organization_id, &key).await
    }

    /// Stock records of a warehouse. `low_stock_only` keeps records with
    /// nothing available.
    pub async fn warehouse_stock(
        &self,
        organization_id: OrganizationId,
        warehouse_id: WarehouseId,
        low_stock_only: bool,
    ) -> Result<Vec<StockRecord>, StoreError> {
        let mut records: Vec<StockRecord> = self
            .documents::<StockRecord>(organization_id)
            .await?
            .into_iter()
            .filter(|r| r.warehouse_id() == warehouse_id)
            .filter(|r| !low_stock_only || r.available_quantity() <= Decimal::ZERO)
            .collect();
        records.sort_by_key(StockRecord::key);
        Ok(records)
    }

    pub async fn valuation(
        &self,
        organization_id: OrganizationId,
        warehouse_id: WarehouseId,
    ) -> Result<WarehouseValuation, StoreError> {
        let records = self
            .warehouse_stock(organization_id, warehouse_id, false)
            .await?;
        // Totals saturate at the decimal range.
        let total_quantity = records
            .iter()
            .fold(Decimal::ZERO, |acc, r| acc.saturating_add(r.quantity()));
        let total_value = records.iter().fold(Decimal::ZERO, |acc, r| {
            acc.saturating_add(r.quantity().saturating_mul(r.average_cost()))
        });
        Ok(WarehouseValuation {
            warehouse_id,
            products: records.len(),
            total_quantity,
            total_value: round_money(total_value),
        })
    }

    pub async fn ledger(
        &self,
        organization_id: OrganizationId,
        query: &LedgerQuery,
    ) -> Result<Vec<StockLedgerEntry>, StoreError> {
        self.store.ledger(organization_id, query).await
    }

    pub async fn sale(
        &self,
        organization_id: OrganizationId,
        sale_id: SaleId,
    ) -> Result<Option<Sale>, StoreError> {
        self.document(organization_id, &sale_id).await
    }

    pub async fn purchase(
        &self,
        organization_id: OrganizationId,
        purchase_id: PurchaseId,
    ) -> Result<Option<Purchase>, StoreError> {
        self.document(organization_id, &purchase_id).await
    }

    pub async fn transfer(
        &self,
        organization_id: OrganizationId,
        transfer_id: TransferId,
    ) -> Result<Option<StockTransfer>, StoreError> {
        self.document(organization_id, &transfer_id).await
    }

    pub async fn party(
        &self,
        organization_id: OrganizationId,
        party_id: PartyId,
    ) -> Result<Option<Party>, StoreError> {
        self.document(organization_id, &party_id).await
    }

    /// Transfers filtered by status and by a warehouse on either end.
    pub async fn transfers(
        &self,
        organization_id: OrganizationId,
        status: Option<TransferStatus>,
        warehouse_id: Option<WarehouseId>,
    ) -> Result<Vec<StockTransfer>, StoreError> {
        let mut transfers: Vec<StockTransfer> = self
            .documents::<StockTransfer>(organization_id)
            .await?
            .into_iter()
            .filter(|t| status.is_none_or(|s| t.status() == s))
            .filter(|t| warehouse_id.is_none_or(|w| t.involves(w)))
            .collect();
        transfers.sort_by_key(StockTransfer::id_typed);
        Ok(transfers)
    }

    /// Replay the ledger of every stock record and compare it with the
    /// recorded quantity.
    #[instrument(skip(self), fields(organization_id = %organization_id), err)]
    pub async fn reconcile(
        &self,
        organization_id: OrganizationId,
    ) -> Result<ReconciliationReport, StoreError> {
        let mut records = self.documents::<StockRecord>(organization_id).await?;
        records.sort_by_key(StockRecord::key);

        let mut lines = Vec::with_capacity(records.len());
        for record in records {
            let query = LedgerQuery::for_stock(record.warehouse_id(), record.product_id());
            let entries = self.store.ledger(organization_id, &query).await?;
            let line = match LedgerReplay::replay(&entries) {
                Ok(replay) => ReconciliationLine {
                    stock: record.key(),
                    recorded_quantity: record.quantity(),
                    ledger_quantity: replay.quantity,
                    entries: replay.entries,
                    problem: (replay.quantity != record.quantity()).then(|| {
                        format!(
                            "ledger ends at {} but record holds {}",
                            replay.quantity,
                            record.quantity()
                        )
                    }),
                },
                Err(err) => ReconciliationLine {
                    stock: record.key(),
                    recorded_quantity: record.quantity(),
                    ledger_quantity: Decimal::ZERO,
                    entries: entries.len(),
                    problem: Some(err.to_string()),
                },
            };
            if let Some(problem) = &line.problem {
                warn!(stock = %line.stock, %problem, "stock record does not reconcile");
            }
            lines.push(line);
        }

        Ok(ReconciliationReport {
            organization_id,
            lines,
        })
    }
}
