//! Inventory domain module.
//!
//! Stock records, the stock ledger and warehouse transfers, implemented purely
//! as deterministic domain logic (no IO, no storage). A `StockRecord` is only
//! ever mutated by applying a `StockLedgerEntry` its own `handle` produced.

pub mod ledger;
pub mod stock;
pub mod transfer;
pub mod warehouse;

pub use ledger::{
    Direction, LedgerQuery, LedgerReplay, MovementType, Reference, ReferenceType,
    StockLedgerEntry,
};
pub use stock::{
    AdjustStock, Batch, BatchInfo, MovementContext, StockCommand, StockIn, StockKey, StockOut,
    StockRecord,
};
pub use transfer::{
    CancelTransfer, CreateTransfer, ReceiveTransfer, ShipTransfer, StockTransfer,
    TransferCommand, TransferEvent, TransferItem, TransferStatus,
};
pub use warehouse::{NewWarehouse, Warehouse};
