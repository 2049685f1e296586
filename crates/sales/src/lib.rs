//! Sales domain module.
//!
//! A `Sale` is priced and confirmed in one step; afterwards only its payment
//! sub-ledger and status evolve. Stock deduction and customer balances are
//! coordinated by the infrastructure layer in the same unit of work.

pub mod sale;

pub use sale::{
    AddSalePayment, CancelSale, CreateSale, Sale, SaleCommand, SaleCreated, SaleEvent, SaleLine,
    SaleLineInput, SaleStatus, UpdateSaleStatus, WALK_IN_CUSTOMER,
};
