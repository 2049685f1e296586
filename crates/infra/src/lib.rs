//! Infrastructure layer: persistence, the movement engine, operations,
//! queries and configuration.
//!
//! Domain crates decide; this crate loads documents, runs the decisions
//! inside a `UnitOfWork` and commits the result atomically.

pub mod bootstrap;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod numbering;
pub mod operations;
pub mod queries;
pub mod store;
pub mod unit_of_work;

#[cfg(test)]
mod integration_tests;

pub use dispatcher::{CommandDispatcher, DispatchError, Operation, Outcome, RetryPolicy};
pub use queries::{InventoryQueries, ReconciliationReport};
pub use store::{InMemoryInventoryStore, InventoryStore, PostgresInventoryStore, StoreError};
pub use unit_of_work::UnitOfWork;
