//! Products reference data.
//!
//! Products are seeded by the surrounding catalogue layer; the stock ledger
//! only reads them (prices, tax rate, expiry tracking) and, on purchase
//! receipt, refreshes the cost price.

pub mod product;

pub use product::{DEFAULT_UNIT, NewProduct, Product};
