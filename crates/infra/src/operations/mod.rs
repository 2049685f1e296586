//! Business operations run through the `CommandDispatcher`.

pub mod inventory;
pub mod purchasing;
pub mod sales;
pub mod transfers;

pub use inventory::{AdjustStock, ReturnStock, StockIn, StockOut};
pub use purchasing::{
    AddPurchasePayment, CancelPurchase, CreatePurchase, PurchaseItem, ReceivePurchase,
};
pub use sales::{AddSalePayment, CancelSale, CreateSale, SaleItem, UpdateSaleStatus};
pub use transfers::{
    CancelTransfer, CreateTransfer, ReceiveTransfer, ShipTransfer, TransferItemRequest,
};
