//! Operation execution pipeline.
//!
//! ```text
//! Operation
//!   ↓
//! 1. Open a UnitOfWork (tenant-scoped, version-tracking)
//!   ↓
//! 2. Run the operation: load documents, decide through the aggregates, stage
//!   ↓
//! 3. Commit staged documents + ledger entries atomically
//!   ↓
//! 4. On a version conflict, discard everything and start again at 1
//! ```
//!
//! `RetryPolicy::operation_timeout` bounds step 2 only. An attempt that
//! times out is dropped before it commits, so `DispatchError::Timeout`
//! always means nothing was persisted. Once the commit has been sent its
//! result is reported as-is; a commit that stalls is bounded by the store's
//! own connection settings, never cut short by the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{Instrument, debug, info_span, warn};

use stockledger_core::{DomainError, OrganizationId};
use stockledger_inventory::StockLedgerEntry;

use crate::store::{InventoryStore, StoreError};
use crate::unit_of_work::UnitOfWork;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    /// Deterministic business failure; retrying will not help.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Optimistic concurrency conflict that outlived the retry budget.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// The operation did not finish staging in time. Raised before the
    /// commit is sent, so no change from the attempt was persisted.
    #[error("operation timed out")]
    Timeout,

    #[error(transparent)]
    Store(StoreError),
}

impl DispatchError {
    /// Whether the caller may safely submit the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Concurrency(_) | DispatchError::Timeout)
    }
}

impl From<StoreError> for DispatchError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Store(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before attempt `n + 1` is `backoff * n`.
    pub backoff: Duration,
    pub operation_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(10),
            operation_timeout: Duration::from_secs(5),
        }
    }
}

/// A unit of business work executed inside one `UnitOfWork`.
///
/// `run` may be invoked several times for one dispatch; it must derive
/// everything from what it reads through the unit of work.
#[async_trait::async_trait]
pub trait Operation: Send + Sync {
    type Output: Send;

    fn name(&self) -> &'static str;

    async fn run<S>(&self, uow: &mut UnitOfWork<'_, S>) -> Result<Self::Output, DispatchError>
    where
        S: InventoryStore + ?Sized;
}

/// Result of a committed operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    pub value: T,
    /// Ledger entries appended by the operation, with their sequences.
    pub ledger_entries: Vec<StockLedgerEntry>,
    pub attempts: u32,
}

#[derive(Debug)]
pub struct CommandDispatcher<S: ?Sized> {
    store: Arc<S>,
    policy: RetryPolicy,
}

impl<S: ?Sized> Clone for CommandDispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: self.policy,
        }
    }
}

impl<S> CommandDispatcher<S>
where
    S: InventoryStore + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self::with_policy(store, RetryPolicy::default())
    }

    pub fn with_policy(store: Arc<S>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `operation` for `organization_id`, re-running it from scratch on
    /// version conflicts.
    pub async fn dispatch<O: Operation>(
        &self,
        organization_id: OrganizationId,
        operation: &O,
    ) -> Result<Outcome<O::Output>, DispatchError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let span = info_span!(
                "dispatch",
                operation = operation.name(),
                organization_id = %organization_id,
                attempt
            );

            let result = self
                .attempt(organization_id, operation)
                .instrument(span)
                .await;

            match result {
                Err(DispatchError::Timeout) => {
                    warn!(
                        operation = operation.name(),
                        organization_id = %organization_id,
                        attempt,
                        timeout_ms = self.policy.operation_timeout.as_millis() as u64,
                        "operation timed out; uncommitted work discarded"
                    );
                    return Err(DispatchError::Timeout);
                }
                Ok((value, ledger_entries)) => {
                    debug!(
                        operation = operation.name(),
                        organization_id = %organization_id,
                        attempt,
                        ledger_entries = ledger_entries.len(),
                        "operation committed"
                    );
                    return Ok(Outcome {
                        value,
                        ledger_entries,
                        attempts: attempt,
                    });
                }
                Err(DispatchError::Concurrency(msg)) if attempt < max_attempts => {
                    debug!(
                        operation = operation.name(),
                        organization_id = %organization_id,
                        attempt,
                        reason = %msg,
                        "version conflict, retrying"
                    );
                    tokio::time::sleep(self.policy.backoff * attempt).await;
                }
                Err(DispatchError::Concurrency(msg)) => {
                    warn!(
                        operation = operation.name(),
                        organization_id = %organization_id,
                        attempts = attempt,
                        reason = %msg,
                        "giving up after repeated version conflicts"
                    );
                    return Err(DispatchError::Concurrency(format!(
                        "{} failed after {attempt} attempts: {msg}",
                        operation.name()
                    )));
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt<O: Operation>(
        &self,
        organization_id: OrganizationId,
        operation: &O,
    ) -> Result<(O::Output, Vec<StockLedgerEntry>), DispatchError> {
        let mut uow = UnitOfWork::new(&*self.store, organization_id);
        let value = tokio::time::timeout(self.policy.operation_timeout, operation.run(&mut uow))
            .await
            .map_err(|_| DispatchError::Timeout)??;
        let ledger_entries = uow.commit().await?;
        Ok((value, ledger_entries))
    }
}
