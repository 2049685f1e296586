//! Purchasing domain module.
//!
//! Purchases are ordered first and received later; receipt is what moves
//! stock into the warehouse.

pub mod purchase;

pub use purchase::{
    AddPurchasePayment, CancelPurchase, CreatePurchase, Purchase, PurchaseCommand,
    PurchaseCreated, PurchaseEvent, PurchaseLine, PurchaseLineInput, PurchaseStatus,
    ReceivePurchase,
};
