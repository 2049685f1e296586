//! Postgres-backed inventory store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Concurrency` | Concurrent insert of the same document or ledger entry |
//! | Database (serialization failure) | `40001` | `Concurrency` | Transaction aborted by the server |
//! | Database (other) | Any other | `Backend` | Other database errors |
//! | PoolClosed / Other | N/A | `Backend` | Network errors, connection failures, etc. |
//!
//! ## Optimistic Concurrency
//!
//! `commit()` runs one transaction. Existing documents are updated with
//! `UPDATE ... WHERE version = $expected`, new ones inserted with
//! `INSERT ... ON CONFLICT DO NOTHING`; zero affected rows means another
//! writer got there first and the transaction is rolled back. Ledger rows are
//! inserted after the document writes, so their `BIGSERIAL` sequence is
//! allocated while the affected rows are locked.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use stockledger_core::{ExpectedVersion, LedgerEntryId, OrganizationId};
use stockledger_inventory::{LedgerQuery, StockLedgerEntry};

use super::{ChangeSet, DocumentWrite, InventoryStore, StoreError, StoredDocument};

const SCHEMA: &str = include_str!("../../migrations/0001_stock_ledger.sql");

#[derive(Debug, Clone)]
pub struct PostgresInventoryStore {
    pool: Arc<PgPool>,
}

impl PostgresInventoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect a pool using `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the tables if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn write_document(
        tx: &mut Transaction<'_, Postgres>,
        organization_id: OrganizationId,
        write: &DocumentWrite,
    ) -> Result<(), StoreError> {
        let result = match write.expected {
            ExpectedVersion::Exact(0) => sqlx::query(
                r#"
                INSERT INTO documents (organization_id, kind, key, version, body)
                VALUES ($1, $2, $3, 1, $4)
                ON CONFLICT (organization_id, kind, key) DO NOTHING
                "#,
            )
            .bind(organization_id.as_uuid())
            .bind(write.kind)
            .bind(&write.key)
            .bind(&write.body)
            .execute(&mut **tx)
            .await,
            ExpectedVersion::Exact(version) => sqlx::query(
                r#"
                UPDATE documents
                SET body = $4, version = version + 1, updated_at = now()
                WHERE organization_id = $1 AND kind = $2 AND key = $3 AND version = $5
                "#,
            )
            .bind(organization_id.as_uuid())
            .bind(write.kind)
            .bind(&write.key)
            .bind(&write.body)
            .bind(version as i64)
            .execute(&mut **tx)
            .await,
            ExpectedVersion::Any => sqlx::query(
                r#"
                INSERT INTO documents (organization_id, kind, key, version, body)
                VALUES ($1, $2, $3, 1, $4)
                ON CONFLICT (organization_id, kind, key)
                DO UPDATE SET body = EXCLUDED.body,
                              version = documents.version + 1,
                              updated_at = now()
                "#,
            )
            .bind(organization_id.as_uuid())
            .bind(write.kind)
            .bind(&write.key)
            .bind(&write.body)
            .execute(&mut **tx)
            .await,
        }
        .map_err(|e| map_sqlx_error("write_document", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Concurrency(format!(
                "{} {}: expected {:?} no longer holds",
                write.kind, write.key, write.expected
            )));
        }
        Ok(())
    }

    async fn append_entry(
        tx: &mut Transaction<'_, Postgres>,
        entry: &StockLedgerEntry,
    ) -> Result<u64, StoreError> {
        let body = serde_json::to_value(entry)?;
        let row = sqlx::query(
            r#"
            INSERT INTO stock_ledger (
                entry_id,
                organization_id,
                warehouse_id,
                product_id,
                movement_type,
                reference_id,
                performed_at,
                body
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING sequence
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.organization_id.as_uuid())
        .bind(entry.warehouse_id.as_uuid())
        .bind(entry.product_id.as_uuid())
        .bind(entry.movement_type.as_str())
        .bind(entry.reference.reference_id)
        .bind(entry.performed_at)
        .bind(&body)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("append_entry", e))?;

        let sequence: i64 = row
            .try_get("sequence")
            .map_err(|e| map_sqlx_error("append_entry", e))?;
        Ok(sequence as u64)
    }
}

fn document_from_row(row: &sqlx::postgres::PgRow) -> Result<StoredDocument, StoreError> {
    let version: i64 = row
        .try_get("version")
        .map_err(|e| map_sqlx_error("decode_document", e))?;
    Ok(StoredDocument {
        kind: row
            .try_get("kind")
            .map_err(|e| map_sqlx_error("decode_document", e))?,
        key: row
            .try_get("key")
            .map_err(|e| map_sqlx_error("decode_document", e))?,
        version: version as u64,
        body: row
            .try_get("body")
            .map_err(|e| map_sqlx_error("decode_document", e))?,
    })
}

fn entry_from_row(row: &sqlx::postgres::PgRow) -> Result<StockLedgerEntry, StoreError> {
    let sequence: i64 = row
        .try_get("sequence")
        .map_err(|e| map_sqlx_error("decode_entry", e))?;
    let body: serde_json::Value = row
        .try_get("body")
        .map_err(|e| map_sqlx_error("decode_entry", e))?;
    let mut entry: StockLedgerEntry = serde_json::from_value(body)?;
    entry.sequence = sequence as u64;
    Ok(entry)
}

#[async_trait::async_trait]
impl InventoryStore for PostgresInventoryStore {
    #[instrument(skip(self), fields(organization_id = %organization_id.as_uuid()), err)]
    async fn load(
        &self,
        organization_id: OrganizationId,
        kind: &str,
        key: &str,
    ) -> Result<Option<StoredDocument>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT kind, key, version, body
            FROM documents
            WHERE organization_id = $1 AND kind = $2 AND key = $3
            "#,
        )
        .bind(organization_id.as_uuid())
        .bind(kind)
        .bind(key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load", e))?;

        row.as_ref().map(document_from_row).transpose()
    }

    #[instrument(
        skip(self),
        fields(organization_id = %organization_id.as_uuid(), document_count = tracing::field::Empty),
        err
    )]
    async fn list(
        &self,
        organization_id: OrganizationId,
        kind: &str,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT kind, key, version, body
            FROM documents
            WHERE organization_id = $1 AND kind = $2
            ORDER BY key ASC
            "#,
        )
        .bind(organization_id.as_uuid())
        .bind(kind)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        Span::current().record("document_count", rows.len());
        rows.iter().map(document_from_row).collect()
    }

    #[instrument(
        skip(self, query),
        fields(organization_id = %organization_id.as_uuid(), entry_count = tracing::field::Empty),
        err
    )]
    async fn ledger(
        &self,
        organization_id: OrganizationId,
        query: &LedgerQuery,
    ) -> Result<Vec<StockLedgerEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, body
            FROM stock_ledger
            WHERE organization_id = $1
              AND ($2::uuid IS NULL OR product_id = $2)
              AND ($3::uuid IS NULL OR warehouse_id = $3)
              AND ($4::text IS NULL OR movement_type = $4)
              AND ($5::uuid IS NULL OR reference_id = $5)
              AND ($6::timestamptz IS NULL OR performed_at >= $6)
              AND ($7::timestamptz IS NULL OR performed_at <= $7)
            ORDER BY sequence ASC
            "#,
        )
        .bind(organization_id.as_uuid())
        .bind(query.product_id.map(Uuid::from))
        .bind(query.warehouse_id.map(Uuid::from))
        .bind(query.movement_type.map(|m| m.as_str()))
        .bind(query.reference_id)
        .bind(query.from)
        .bind(query.to)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger", e))?;

        Span::current().record("entry_count", rows.len());
        rows.iter().map(entry_from_row).collect()
    }

    #[instrument(
        skip(self),
        fields(organization_id = %organization_id.as_uuid(), entry_id = %entry_id),
        err
    )]
    async fn ledger_entry(
        &self,
        organization_id: OrganizationId,
        entry_id: LedgerEntryId,
    ) -> Result<Option<StockLedgerEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT sequence, body
            FROM stock_ledger
            WHERE organization_id = $1 AND entry_id = $2
            "#,
        )
        .bind(organization_id.as_uuid())
        .bind(entry_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ledger_entry", e))?;

        row.as_ref().map(entry_from_row).transpose()
    }

    #[instrument(
        skip(self, changes),
        fields(
            organization_id = %organization_id.as_uuid(),
            write_count = changes.writes.len(),
            ledger_count = changes.ledger.len()
        ),
        err
    )]
    async fn commit(
        &self,
        organization_id: OrganizationId,
        changes: ChangeSet,
    ) -> Result<Vec<StockLedgerEntry>, StoreError> {
        if changes.is_empty() {
            return Ok(vec![]);
        }
        if changes
            .ledger
            .iter()
            .any(|e| e.organization_id != organization_id)
        {
            return Err(StoreError::TenantIsolation(
                "ledger entry belongs to another organization".to_string(),
            ));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for write in &changes.writes {
            if let Err(err) = Self::write_document(&mut tx, organization_id, write).await {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(err);
            }
        }

        let mut committed = Vec::with_capacity(changes.ledger.len());
        for mut entry in changes.ledger {
            match Self::append_entry(&mut tx, &entry).await {
                Ok(sequence) => {
                    entry.sequence = sequence;
                    committed.push(entry);
                }
                Err(err) => {
                    tx.rollback()
                        .await
                        .map_err(|e| map_sqlx_error("rollback", e))?;
                    return Err(err);
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(committed)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") => StoreError::Concurrency(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("failed to decode row in {}: {}", operation, err))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}
