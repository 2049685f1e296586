//! End-to-end tests: operations → dispatcher → unit of work → store.
//!
//! Verifies:
//! - Stock, documents and party balances change together or not at all
//! - The ledger reconciles with every stock record
//! - Concurrent writers cannot drive stock negative
//! - Tenants never see each other's data

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use proptest::prelude::*;
use rust_decimal_macros::dec;

use stockledger_core::{
    Aggregate, BranchId, Decimal, DomainError, OrganizationId, PartyId, PaymentMethod, PaymentStatus,
    ProductId, UserId, WarehouseId,
};
use stockledger_inventory::{
    LedgerQuery, MovementType, NewWarehouse, StockKey, StockLedgerEntry, StockRecord,
    TransferStatus, Warehouse,
};
use stockledger_parties::{Party, PartyCommand, PartyKind, RegisterParty, SuspendParty};
use stockledger_products::{NewProduct, Product};
use stockledger_sales::SaleStatus;

use crate::dispatcher::{CommandDispatcher, DispatchError, Operation, RetryPolicy};
use crate::operations::{
    AddSalePayment, CancelSale, CancelTransfer, CreatePurchase, CreateSale, CreateTransfer,
    PurchaseItem, ReceivePurchase, ReceiveTransfer, ReturnStock, SaleItem, ShipTransfer, StockIn,
    StockOut, TransferItemRequest, UpdateSaleStatus,
};
use crate::queries::InventoryQueries;
use crate::store::{
    ChangeSet, InMemoryInventoryStore, InventoryStore, StoreError, StoredDocument, seed_document,
};
use crate::unit_of_work::UnitOfWork;

struct World {
    store: Arc<InMemoryInventoryStore>,
    dispatcher: CommandDispatcher<InMemoryInventoryStore>,
    queries: InventoryQueries<InMemoryInventoryStore>,
    org: OrganizationId,
    user: UserId,
    main: WarehouseId,
    annex: WarehouseId,
}

impl World {
    async fn new() -> Self {
        let store = Arc::new(InMemoryInventoryStore::new());
        let org = OrganizationId::new();
        let branch = BranchId::new();
        let mut ids = Vec::new();
        for (name, code) in [("Main store", "main"), ("Annex", "annex")] {
            let warehouse = Warehouse::create(NewWarehouse {
                organization_id: org,
                warehouse_id: WarehouseId::new(),
                branch_id: branch,
                name: name.to_string(),
                code: code.to_string(),
            })
            .unwrap();
            seed_document(&*store, &warehouse).await.unwrap();
            ids.push(warehouse.id());
        }

        Self {
            dispatcher: CommandDispatcher::new(Arc::clone(&store)),
            queries: InventoryQueries::new(Arc::clone(&store)),
            store,
            org,
            user: UserId::new(),
            main: ids[0],
            annex: ids[1],
        }
    }

    async fn product(&self, name: &str, cost: Decimal, price: Decimal, tax: Decimal) -> ProductId {
        let product = Product::create(NewProduct {
            organization_id: self.org,
            product_id: ProductId::new(),
            name: name.to_string(),
            sku: name.to_uppercase().replace(' ', "-"),
            unit: None,
            selling_price: price,
            cost_price: cost,
            tax_rate: tax,
            has_expiry: false,
            min_stock_level: Decimal::ZERO,
            created_at: Utc::now(),
        })
        .unwrap();
        seed_document(&*self.store, &product).await.unwrap();
        product.id()
    }

    async fn party(&self, kind: PartyKind, credit_limit: Decimal) -> PartyId {
        let party = Party::register(RegisterParty {
            organization_id: self.org,
            party_id: PartyId::new(),
            kind,
            name: format!("{} one", kind.as_str()),
            contact: None,
            credit_limit,
            occurred_at: Utc::now(),
        })
        .unwrap();
        seed_document(&*self.store, &party).await.unwrap();
        party.id_typed()
    }

    fn stock_in(&self, product_id: ProductId, warehouse_id: WarehouseId, qty: Decimal, cost: Decimal) -> StockIn {
        StockIn {
            product_id,
            warehouse_id,
            quantity: qty,
            unit_cost: Some(cost),
            movement_type: MovementType::Opening,
            reference: None,
            batch_number: None,
            expiry_date: None,
            manufacturing_date: None,
            notes: None,
            performed_by: self.user,
            occurred_at: Utc::now(),
        }
    }

    fn stock_out(&self, product_id: ProductId, warehouse_id: WarehouseId, qty: Decimal) -> StockOut {
        StockOut {
            product_id,
            warehouse_id,
            quantity: qty,
            movement_type: MovementType::Damage,
            reference: None,
            notes: None,
            performed_by: self.user,
            occurred_at: Utc::now(),
        }
    }

    fn sale(&self, items: Vec<SaleItem>, customer: Option<PartyId>, method: PaymentMethod) -> CreateSale {
        CreateSale {
            warehouse_id: self.main,
            customer_id: customer,
            customer_name: None,
            items,
            discount_amount: Decimal::ZERO,
            payment_method: method,
            notes: None,
            created_by: self.user,
            occurred_at: Utc::now(),
        }
    }

    async fn record(&self, warehouse_id: WarehouseId, product_id: ProductId) -> Option<StockRecord> {
        self.queries
            .stock_level(self.org, StockKey::new(warehouse_id, product_id))
            .await
            .unwrap()
    }

    async fn quantity(&self, warehouse_id: WarehouseId, product_id: ProductId) -> Decimal {
        self.record(warehouse_id, product_id)
            .await
            .map(|r| r.quantity())
            .unwrap_or(Decimal::ZERO)
    }

    async fn ledger(&self, query: LedgerQuery) -> Vec<StockLedgerEntry> {
        self.queries.ledger(self.org, &query).await.unwrap()
    }

    async fn assert_reconciles(&self) {
        let report = self.queries.reconcile(self.org).await.unwrap();
        assert!(report.is_consistent(), "{report:?}");
    }
}

fn item(product_id: ProductId, quantity: Decimal) -> SaleItem {
    SaleItem {
        product_id,
        quantity,
        unit_price: None,
        discount_percent: Decimal::ZERO,
        tax_percent: None,
    }
}

#[tokio::test]
async fn stock_in_then_sale_then_cancel_restores_the_record() {
    let w = World::new().await;
    let p1 = w.product("Rice 5kg", dec!(8), dec!(15), dec!(12)).await;

    w.dispatcher.dispatch(w.org, &w.stock_in(p1, w.main, dec!(100), dec!(10))).await.unwrap();
    let record = w.record(w.main, p1).await.unwrap();
    assert_eq!(record.quantity(), dec!(100));
    assert_eq!(record.average_cost(), dec!(10));

    let mut line = item(p1, dec!(30));
    line.unit_price = Some(dec!(15));
    let created = w
        .dispatcher
        .dispatch(w.org, &w.sale(vec![line], None, PaymentMethod::Cash))
        .await
        .unwrap();
    let sale = created.value;
    assert_eq!(w.quantity(w.main, p1).await, dec!(70));
    assert_eq!(created.ledger_entries.len(), 1);
    assert_eq!(created.ledger_entries[0].quantity_change, dec!(-30));
    assert_eq!(created.ledger_entries[0].movement_type, MovementType::Sale);
    // 30 × 15 = 450, plus 12% tax.
    assert_eq!(sale.total_amount(), dec!(504.00));
    assert_eq!(sale.payment_status(), PaymentStatus::Paid);

    let cancelled = w
        .dispatcher
        .dispatch(
            w.org,
            &CancelSale {
                sale_id: sale.id_typed(),
                cancelled_by: w.user,
                occurred_at: Utc::now(),
            },
        )
        .await
        .unwrap();
    assert_eq!(cancelled.value.status(), SaleStatus::Cancelled);
    assert_eq!(w.quantity(w.main, p1).await, dec!(100));
    assert_eq!(cancelled.ledger_entries.len(), 1);
    assert_eq!(cancelled.ledger_entries[0].movement_type, MovementType::SaleReturn);
    assert_eq!(cancelled.ledger_entries[0].quantity_change, dec!(30));
    assert_eq!(cancelled.ledger_entries[0].reference.reference_id, *sale.id_typed().as_uuid());

    w.assert_reconciles().await;
}

#[tokio::test]
async fn failing_line_leaves_no_partial_sale() {
    let w = World::new().await;
    let a = w.product("Soap", dec!(1), dec!(2), dec!(0)).await;
    let b = w.product("Shampoo", dec!(3), dec!(5), dec!(0)).await;
    let c = w.product("Toothpaste", dec!(2), dec!(4), dec!(0)).await;
    for product in [a, b, c] {
        w.dispatcher.dispatch(w.org, &w.stock_in(product, w.main, dec!(10), dec!(1))).await.unwrap();
    }
    let ledger_before = w.ledger(LedgerQuery::default()).await.len();

    let err = w
        .dispatcher
        .dispatch(
            w.org,
            &w.sale(
                vec![item(a, dec!(4)), item(b, dec!(5)), item(c, dec!(11))],
                None,
                PaymentMethod::Cash,
            ),
        )
        .await
        .unwrap_err();

    match err {
        DispatchError::Domain(DomainError::InsufficientStock {
            product,
            requested,
            available,
        }) => {
            assert_eq!(product, "Toothpaste");
            assert_eq!(requested, dec!(11));
            assert_eq!(available, dec!(10));
        }
        other => panic!("Expected InsufficientStock, got {other:?}"),
    }
    for product in [a, b, c] {
        assert_eq!(w.quantity(w.main, product).await, dec!(10));
    }
    assert_eq!(w.ledger(LedgerQuery::default()).await.len(), ledger_before);
    assert!(w.store.list(w.org, "sale").await.unwrap().is_empty());
}

#[tokio::test]
async fn credit_sale_payments_drive_status_and_customer_balance() {
    let w = World::new().await;
    let product = w.product("Cement bag", dec!(60), dec!(100), dec!(0)).await;
    let customer = w.party(PartyKind::Customer, dec!(5000)).await;
    w.dispatcher.dispatch(w.org, &w.stock_in(product, w.main, dec!(20), dec!(60))).await.unwrap();

    let sale = w
        .dispatcher
        .dispatch(
            w.org,
            &w.sale(vec![item(product, dec!(10))], Some(customer), PaymentMethod::Credit),
        )
        .await
        .unwrap()
        .value;
    assert_eq!(sale.total_amount(), dec!(1000));
    assert_eq!(sale.payment_status(), PaymentStatus::Unpaid);

    let pay = |amount| AddSalePayment {
        sale_id: sale.id_typed(),
        amount,
        method: PaymentMethod::Cash,
        reference: None,
        recorded_by: w.user,
        occurred_at: Utc::now(),
    };

    let partial = w.dispatcher.dispatch(w.org, &pay(dec!(400))).await.unwrap().value;
    assert_eq!(partial.paid_amount(), dec!(400));
    assert_eq!(partial.balance_amount(), dec!(600));
    assert_eq!(partial.payment_status(), PaymentStatus::Partial);

    let paid = w.dispatcher.dispatch(w.org, &pay(dec!(600))).await.unwrap().value;
    assert_eq!(paid.paid_amount(), dec!(1000));
    assert_eq!(paid.balance_amount(), Decimal::ZERO);
    assert_eq!(paid.payment_status(), PaymentStatus::Paid);

    let err = w.dispatcher.dispatch(w.org, &pay(dec!(1))).await.unwrap_err();
    assert_eq!(err, DispatchError::Domain(DomainError::AlreadyPaid));

    let party = w.queries.party(w.org, customer).await.unwrap().unwrap();
    assert_eq!(party.outstanding_balance(), Decimal::ZERO);
    assert_eq!(party.total_sales(), dec!(1000));
    assert_eq!(party.total_payments(), dec!(1000));
}

#[tokio::test]
async fn credit_sale_without_customer_is_rejected() {
    let w = World::new().await;
    let product = w.product("Nails", dec!(1), dec!(2), dec!(0)).await;
    w.dispatcher.dispatch(w.org, &w.stock_in(product, w.main, dec!(5), dec!(1))).await.unwrap();

    let err = w
        .dispatcher
        .dispatch(w.org, &w.sale(vec![item(product, dec!(1))], None, PaymentMethod::Credit))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Domain(DomainError::Validation(_))));
    assert_eq!(w.quantity(w.main, product).await, dec!(5));
}

#[tokio::test]
async fn payment_above_the_balance_settles_the_sale() {
    let w = World::new().await;
    let product = w.product("Tiles", dec!(60), dec!(100), dec!(0)).await;
    let customer = w.party(PartyKind::Customer, dec!(5000)).await;
    w.dispatcher.dispatch(w.org, &w.stock_in(product, w.main, dec!(20), dec!(60))).await.unwrap();

    let sale = w
        .dispatcher
        .dispatch(
            w.org,
            &w.sale(vec![item(product, dec!(10))], Some(customer), PaymentMethod::Credit),
        )
        .await
        .unwrap()
        .value;
    assert_eq!(sale.balance_amount(), dec!(1000));

    let paid = w
        .dispatcher
        .dispatch(
            w.org,
            &AddSalePayment {
                sale_id: sale.id_typed(),
                amount: dec!(1200),
                method: PaymentMethod::Cash,
                reference: None,
                recorded_by: w.user,
                occurred_at: Utc::now(),
            },
        )
        .await
        .unwrap()
        .value;
    assert_eq!(paid.payment_status(), PaymentStatus::Paid);
    assert_eq!(paid.paid_amount(), dec!(1200));
    assert_eq!(paid.balance_amount(), dec!(-200));

    let party = w.queries.party(w.org, customer).await.unwrap().unwrap();
    assert_eq!(party.outstanding_balance(), dec!(-200));
    assert_eq!(party.total_payments(), dec!(1200));
}

#[tokio::test]
async fn suspended_customer_cannot_buy() {
    let w = World::new().await;
    let product = w.product("Glue", dec!(2), dec!(4), dec!(0)).await;
    w.dispatcher.dispatch(w.org, &w.stock_in(product, w.main, dec!(10), dec!(2))).await.unwrap();

    let mut customer = Party::register(RegisterParty {
        organization_id: w.org,
        party_id: PartyId::new(),
        kind: PartyKind::Customer,
        name: "Late payer".to_string(),
        contact: None,
        credit_limit: dec!(1000),
        occurred_at: Utc::now(),
    })
    .unwrap();
    customer
        .execute(&PartyCommand::SuspendParty(SuspendParty {
            organization_id: w.org,
            party_id: customer.id_typed(),
            reason: Some("unpaid invoices".to_string()),
            occurred_at: Utc::now(),
        }))
        .unwrap();
    seed_document(&*w.store, &customer).await.unwrap();

    for method in [PaymentMethod::Credit, PaymentMethod::Cash] {
        let err = w
            .dispatcher
            .dispatch(
                w.org,
                &w.sale(vec![item(product, dec!(3))], Some(customer.id_typed()), method),
            )
            .await
            .unwrap_err();
        match err {
            DispatchError::Domain(DomainError::Validation(message)) => {
                assert!(message.contains("is suspended"), "{message}");
            }
            other => panic!("Expected Validation, got {other:?}"),
        }
    }

    assert_eq!(w.quantity(w.main, product).await, dec!(10));
    assert!(w.store.list(w.org, "sale").await.unwrap().is_empty());
    let party = w.queries.party(w.org, customer.id_typed()).await.unwrap().unwrap();
    assert_eq!(party.outstanding_balance(), Decimal::ZERO);
    assert_eq!(party.total_sales(), Decimal::ZERO);
}

#[tokio::test]
async fn sale_fulfilment_status_moves_forward() {
    let w = World::new().await;
    let product = w.product("Lamp", dec!(5), dec!(9), dec!(0)).await;
    w.dispatcher.dispatch(w.org, &w.stock_in(product, w.main, dec!(10), dec!(5))).await.unwrap();

    let sale = w
        .dispatcher
        .dispatch(w.org, &w.sale(vec![item(product, dec!(2))], None, PaymentMethod::Cash))
        .await
        .unwrap()
        .value;
    assert_eq!(sale.status(), SaleStatus::Confirmed);

    let update = |status| UpdateSaleStatus {
        sale_id: sale.id_typed(),
        status,
        updated_by: w.user,
        occurred_at: Utc::now(),
    };

    let shipped = w.dispatcher.dispatch(w.org, &update(SaleStatus::Shipped)).await.unwrap();
    assert_eq!(shipped.value.status(), SaleStatus::Shipped);
    assert!(shipped.ledger_entries.is_empty());

    let err = w
        .dispatcher
        .dispatch(w.org, &update(SaleStatus::Confirmed))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Domain(DomainError::InvariantViolation(_))));

    let delivered = w.dispatcher.dispatch(w.org, &update(SaleStatus::Delivered)).await.unwrap();
    assert_eq!(delivered.value.status(), SaleStatus::Delivered);
    assert_eq!(w.quantity(w.main, product).await, dec!(8));

    let stored = w.queries.sale(w.org, sale.id_typed()).await.unwrap().unwrap();
    assert_eq!(stored.status(), SaleStatus::Delivered);
}

#[tokio::test]
async fn cancelled_sale_status_cannot_change() {
    let w = World::new().await;
    let product = w.product("Fan", dec!(10), dec!(20), dec!(0)).await;
    w.dispatcher.dispatch(w.org, &w.stock_in(product, w.main, dec!(5), dec!(10))).await.unwrap();

    let sale = w
        .dispatcher
        .dispatch(w.org, &w.sale(vec![item(product, dec!(1))], None, PaymentMethod::Cash))
        .await
        .unwrap()
        .value;
    w.dispatcher
        .dispatch(
            w.org,
            &CancelSale {
                sale_id: sale.id_typed(),
                cancelled_by: w.user,
                occurred_at: Utc::now(),
            },
        )
        .await
        .unwrap();

    let err = w
        .dispatcher
        .dispatch(
            w.org,
            &UpdateSaleStatus {
                sale_id: sale.id_typed(),
                status: SaleStatus::Shipped,
                updated_by: w.user,
                occurred_at: Utc::now(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::Domain(DomainError::AlreadyCancelled));
}

#[tokio::test]
async fn stock_in_beyond_decimal_range_is_rejected() {
    let w = World::new().await;
    let product = w.product("Sand", dec!(1), dec!(2), dec!(0)).await;
    let huge = dec!(50000000000000000000000000000);
    let mut first = w.stock_in(product, w.main, huge, dec!(1));
    first.unit_cost = None;
    w.dispatcher.dispatch(w.org, &first).await.unwrap();

    let mut second = w.stock_in(product, w.main, huge, dec!(1));
    second.unit_cost = None;
    let err = w.dispatcher.dispatch(w.org, &second).await.unwrap_err();
    assert_eq!(
        err,
        DispatchError::Domain(DomainError::validation("amount out of range"))
    );
    assert_eq!(w.quantity(w.main, product).await, huge);
    assert_eq!(w.ledger(LedgerQuery::default()).await.len(), 1);
    w.assert_reconciles().await;
}

#[tokio::test]
async fn cancelling_an_unpaid_sale_releases_the_customer_balance() {
    let w = World::new().await;
    let product = w.product("Paint", dec!(20), dec!(50), dec!(0)).await;
    let customer = w.party(PartyKind::Customer, Decimal::ZERO).await;
    w.dispatcher.dispatch(w.org, &w.stock_in(product, w.main, dec!(10), dec!(20))).await.unwrap();

    let sale = w
        .dispatcher
        .dispatch(
            w.org,
            &w.sale(vec![item(product, dec!(4))], Some(customer), PaymentMethod::Credit),
        )
        .await
        .unwrap()
        .value;
    let party = w.queries.party(w.org, customer).await.unwrap().unwrap();
    assert_eq!(party.outstanding_balance(), dec!(200));

    w.dispatcher
        .dispatch(
            w.org,
            &CancelSale {
                sale_id: sale.id_typed(),
                cancelled_by: w.user,
                occurred_at: Utc::now(),
            },
        )
        .await
        .unwrap();

    let party = w.queries.party(w.org, customer).await.unwrap().unwrap();
    assert_eq!(party.outstanding_balance(), Decimal::ZERO);
    assert_eq!(w.quantity(w.main, product).await, dec!(10));

    let err = w
        .dispatcher
        .dispatch(
            w.org,
            &CancelSale {
                sale_id: sale.id_typed(),
                cancelled_by: w.user,
                occurred_at: Utc::now(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::Domain(DomainError::AlreadyCancelled));
}

#[tokio::test]
async fn returns_are_capped_by_the_original_movement() {
    let w = World::new().await;
    let product = w.product("Bulb", dec!(2), dec!(5), dec!(0)).await;
    w.dispatcher.dispatch(w.org, &w.stock_in(product, w.main, dec!(50), dec!(2))).await.unwrap();

    let created = w
        .dispatcher
        .dispatch(w.org, &w.sale(vec![item(product, dec!(30))], None, PaymentMethod::Cash))
        .await
        .unwrap();
    let sale_entry = created.ledger_entries[0].clone();

    let ret = |quantity| ReturnStock {
        entry_id: sale_entry.id,
        quantity,
        notes: Some("customer return".to_string()),
        performed_by: w.user,
        occurred_at: Utc::now(),
    };

    let first = w.dispatcher.dispatch(w.org, &ret(dec!(20))).await.unwrap();
    assert_eq!(first.value.entry.movement_type, MovementType::SaleReturn);
    assert_eq!(first.value.entry.reference, sale_entry.reference);
    assert_eq!(w.quantity(w.main, product).await, dec!(40));

    let err = w.dispatcher.dispatch(w.org, &ret(dec!(15))).await.unwrap_err();
    assert!(matches!(err, DispatchError::Domain(DomainError::Validation(_))));

    w.dispatcher.dispatch(w.org, &ret(dec!(10))).await.unwrap();
    assert_eq!(w.quantity(w.main, product).await, dec!(50));

    // Everything already came back, so cancelling restocks nothing.
    let cancelled = w
        .dispatcher
        .dispatch(
            w.org,
            &CancelSale {
                sale_id: created.value.id_typed(),
                cancelled_by: w.user,
                occurred_at: Utc::now(),
            },
        )
        .await
        .unwrap();
    assert!(cancelled.ledger_entries.is_empty());
    assert_eq!(w.quantity(w.main, product).await, dec!(50));
    w.assert_reconciles().await;
}

#[tokio::test]
async fn receiving_a_purchase_revises_average_and_product_cost() {
    let w = World::new().await;
    let product = w.product("Flour 25kg", dec!(10), dec!(16), dec!(0)).await;
    let supplier = w.party(PartyKind::Supplier, Decimal::ZERO).await;
    w.dispatcher.dispatch(w.org, &w.stock_in(product, w.main, dec!(100), dec!(10))).await.unwrap();

    let purchase = w
        .dispatcher
        .dispatch(
            w.org,
            &CreatePurchase {
                warehouse_id: w.main,
                supplier_id: supplier,
                items: vec![PurchaseItem {
                    product_id: product,
                    quantity: dec!(50),
                    unit_price: Some(dec!(13)),
                    discount_percent: Decimal::ZERO,
                    tax_percent: None,
                    batch_number: Some("LOT-7".to_string()),
                    expiry_date: None,
                    manufacturing_date: None,
                }],
                shipping_charges: Decimal::ZERO,
                other_charges: Decimal::ZERO,
                payment_method: PaymentMethod::Credit,
                notes: None,
                created_by: w.user,
                occurred_at: Utc::now(),
            },
        )
        .await
        .unwrap();
    assert!(purchase.ledger_entries.is_empty());
    assert_eq!(w.quantity(w.main, product).await, dec!(100));
    assert_eq!(purchase.value.total_amount(), dec!(650));

    let receive = ReceivePurchase {
        purchase_id: purchase.value.id_typed(),
        received_by: w.user,
        occurred_at: Utc::now(),
    };
    let received = w.dispatcher.dispatch(w.org, &receive).await.unwrap();
    assert!(received.value.is_received());
    assert_eq!(received.ledger_entries.len(), 1);
    assert_eq!(received.ledger_entries[0].movement_type, MovementType::Purchase);

    let record = w.record(w.main, product).await.unwrap();
    assert_eq!(record.quantity(), dec!(150));
    assert_eq!(record.average_cost(), dec!(11));
    assert_eq!(record.last_purchase_price(), Some(dec!(13)));

    let mut uow = UnitOfWork::new(&*w.store, w.org);
    let stored: Product = uow.require(&product, "product").await.unwrap();
    assert_eq!(stored.cost_price(), dec!(13));

    let party = w.queries.party(w.org, supplier).await.unwrap().unwrap();
    assert_eq!(party.outstanding_balance(), dec!(650));
    assert_eq!(party.total_purchases(), dec!(650));

    // A purchase can only be received once.
    assert!(w.dispatcher.dispatch(w.org, &receive).await.is_err());

    // Purchase returns are capped like sale returns.
    let err = w
        .dispatcher
        .dispatch(
            w.org,
            &ReturnStock {
                entry_id: received.ledger_entries[0].id,
                quantity: dec!(60),
                notes: None,
                performed_by: w.user,
                occurred_at: Utc::now(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Domain(DomainError::Validation(_))));
    w.assert_reconciles().await;
}

#[tokio::test]
async fn transfer_moves_stock_between_warehouses() {
    let w = World::new().await;
    let product = w.product("Tiles", dec!(4), dec!(9), dec!(0)).await;
    w.dispatcher.dispatch(w.org, &w.stock_in(product, w.main, dec!(100), dec!(4))).await.unwrap();

    let transfer = w
        .dispatcher
        .dispatch(
            w.org,
            &CreateTransfer {
                source_warehouse_id: w.main,
                destination_warehouse_id: w.annex,
                items: vec![TransferItemRequest {
                    product_id: product,
                    quantity: dec!(40),
                    batch_number: None,
                    notes: None,
                }],
                notes: None,
                created_by: w.user,
                occurred_at: Utc::now(),
            },
        )
        .await
        .unwrap()
        .value;
    assert_eq!(transfer.status(), TransferStatus::Pending);
    assert_eq!(transfer.items()[0].unit_cost, dec!(4));
    assert_eq!(w.quantity(w.main, product).await, dec!(100));

    let transfer_id = transfer.id_typed();
    w.dispatcher
        .dispatch(
            w.org,
            &ShipTransfer {
                transfer_id,
                shipped_by: w.user,
                occurred_at: Utc::now(),
            },
        )
        .await
        .unwrap();
    assert_eq!(w.quantity(w.main, product).await, dec!(60));
    assert_eq!(w.quantity(w.annex, product).await, Decimal::ZERO);

    let received = w
        .dispatcher
        .dispatch(
            w.org,
            &ReceiveTransfer {
                transfer_id,
                received_by: w.user,
                occurred_at: Utc::now(),
            },
        )
        .await
        .unwrap();
    assert_eq!(received.value.status(), TransferStatus::Received);
    assert_eq!(w.quantity(w.main, product).await, dec!(60));
    assert_eq!(w.quantity(w.annex, product).await, dec!(40));
    assert_eq!(w.record(w.annex, product).await.unwrap().average_cost(), dec!(4));

    let entries = w.ledger(LedgerQuery::for_reference(transfer_id)).await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].movement_type, MovementType::TransferOut);
    assert_eq!(entries[0].warehouse_id, w.main);
    assert_eq!(entries[0].destination_warehouse_id, Some(w.annex));
    assert_eq!(entries[1].movement_type, MovementType::TransferIn);
    assert_eq!(entries[1].warehouse_id, w.annex);
    assert_eq!(entries[1].source_warehouse_id, Some(w.main));

    let err = w
        .dispatcher
        .dispatch(
            w.org,
            &CancelTransfer {
                transfer_id,
                reason: None,
                cancelled_by: w.user,
                occurred_at: Utc::now(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Domain(DomainError::InvalidTransferState { .. })
    ));

    let by_warehouse = w
        .queries
        .transfers(w.org, Some(TransferStatus::Received), Some(w.annex))
        .await
        .unwrap();
    assert_eq!(by_warehouse.len(), 1);
    w.assert_reconciles().await;
}

#[tokio::test]
async fn transfer_checks_cumulative_availability_and_in_transit_cancel_keeps_stock_out() {
    let w = World::new().await;
    let product = w.product("Pipes", dec!(3), dec!(6), dec!(0)).await;
    w.dispatcher.dispatch(w.org, &w.stock_in(product, w.main, dec!(10), dec!(3))).await.unwrap();

    let request = |quantities: &[Decimal]| CreateTransfer {
        source_warehouse_id: w.main,
        destination_warehouse_id: w.annex,
        items: quantities
            .iter()
            .map(|q| TransferItemRequest {
                product_id: product,
                quantity: *q,
                batch_number: None,
                notes: None,
            })
            .collect(),
        notes: None,
        created_by: w.user,
        occurred_at: Utc::now(),
    };

    let err = w
        .dispatcher
        .dispatch(w.org, &request(&[dec!(6), dec!(6)]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Domain(DomainError::InsufficientStock { .. })
    ));

    let transfer = w
        .dispatcher
        .dispatch(w.org, &request(&[dec!(4), dec!(6)]))
        .await
        .unwrap()
        .value;
    w.dispatcher
        .dispatch(
            w.org,
            &ShipTransfer {
                transfer_id: transfer.id_typed(),
                shipped_by: w.user,
                occurred_at: Utc::now(),
            },
        )
        .await
        .unwrap();
    let cancelled = w
        .dispatcher
        .dispatch(
            w.org,
            &CancelTransfer {
                transfer_id: transfer.id_typed(),
                reason: Some("truck broke down".to_string()),
                cancelled_by: w.user,
                occurred_at: Utc::now(),
            },
        )
        .await
        .unwrap();
    assert_eq!(cancelled.value.status(), TransferStatus::Cancelled);
    assert!(cancelled.ledger_entries.is_empty());
    assert_eq!(w.quantity(w.main, product).await, Decimal::ZERO);
    assert_eq!(w.quantity(w.annex, product).await, Decimal::ZERO);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_deductions_never_oversell() {
    let w = World::new().await;
    let product = w.product("Sugar", dec!(1), dec!(2), dec!(0)).await;
    w.dispatcher.dispatch(w.org, &w.stock_in(product, w.main, dec!(100), dec!(1))).await.unwrap();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let dispatcher = w.dispatcher.clone();
            let org = w.org;
            let op = w.stock_out(product, w.main, dec!(60));
            tokio::spawn(async move { dispatcher.dispatch(org, &op).await })
        })
        .collect();

    let mut successes = 0;
    let mut shortfalls = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(DispatchError::Domain(DomainError::InsufficientStock { available, .. })) => {
                assert_eq!(available, dec!(40));
                shortfalls += 1;
            }
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!((successes, shortfalls), (1, 1));
    assert_eq!(w.quantity(w.main, product).await, dec!(40));
    w.assert_reconciles().await;
}

#[tokio::test]
async fn organizations_cannot_reach_each_other() {
    let a = World::new().await;
    let product = a.product("Salt", dec!(1), dec!(2), dec!(0)).await;
    a.dispatcher.dispatch(a.org, &a.stock_in(product, a.main, dec!(10), dec!(1))).await.unwrap();

    let other = OrganizationId::new();
    let err = a
        .dispatcher
        .dispatch(other, &a.stock_out(product, a.main, dec!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Domain(DomainError::NotFound(_))));

    assert!(
        a.queries
            .stock_level(other, StockKey::new(a.main, product))
            .await
            .unwrap()
            .is_none()
    );
    assert!(a.queries.ledger(other, &LedgerQuery::default()).await.unwrap().is_empty());
    assert_eq!(a.quantity(a.main, product).await, dec!(10));
}

#[tokio::test]
async fn low_stock_and_valuation_queries() {
    let w = World::new().await;
    let stocked = w.product("Oil", dec!(5), dec!(8), dec!(0)).await;
    let empty = w.product("Vinegar", dec!(2), dec!(3), dec!(0)).await;
    w.dispatcher.dispatch(w.org, &w.stock_in(stocked, w.main, dec!(10), dec!(5))).await.unwrap();
    w.dispatcher.dispatch(w.org, &w.stock_in(empty, w.main, dec!(3), dec!(2))).await.unwrap();
    w.dispatcher.dispatch(w.org, &w.stock_out(empty, w.main, dec!(3))).await.unwrap();

    let all = w.queries.warehouse_stock(w.org, w.main, false).await.unwrap();
    assert_eq!(all.len(), 2);
    let low = w.queries.warehouse_stock(w.org, w.main, true).await.unwrap();
    assert_eq!(low.len(), 1);
    assert_eq!(low[0].product_id(), empty);

    let valuation = w.queries.valuation(w.org, w.main).await.unwrap();
    assert_eq!(valuation.products, 2);
    assert_eq!(valuation.total_quantity, dec!(10));
    assert_eq!(valuation.total_value, dec!(50.00));

    let damage = w
        .ledger(LedgerQuery {
            movement_type: Some(MovementType::Damage),
            ..LedgerQuery::default()
        })
        .await;
    assert_eq!(damage.len(), 1);
    assert_eq!(damage[0].product_id, empty);
}

/// Stages a write and then stalls past the dispatcher's timeout.
struct SlowStockIn {
    inner: StockIn,
    stall: Duration,
}

#[async_trait::async_trait]
impl Operation for SlowStockIn {
    type Output = ();

    fn name(&self) -> &'static str {
        "slow_stock_in"
    }

    async fn run<S>(&self, uow: &mut UnitOfWork<'_, S>) -> Result<(), DispatchError>
    where
        S: InventoryStore + ?Sized,
    {
        self.inner.run(uow).await?;
        tokio::time::sleep(self.stall).await;
        Ok(())
    }
}

#[tokio::test]
async fn timed_out_operations_persist_nothing() {
    let w = World::new().await;
    let product = w.product("Beans", dec!(1), dec!(2), dec!(0)).await;
    let dispatcher = CommandDispatcher::with_policy(
        Arc::clone(&w.store),
        RetryPolicy {
            operation_timeout: Duration::from_millis(20),
            ..RetryPolicy::default()
        },
    );

    let err = dispatcher
        .dispatch(
            w.org,
            &SlowStockIn {
                inner: w.stock_in(product, w.main, dec!(5), dec!(1)),
                stall: Duration::from_millis(500),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::Timeout);
    assert!(err.is_retryable());
    assert!(w.record(w.main, product).await.is_none());
    assert!(w.ledger(LedgerQuery::default()).await.is_empty());
}

/// Rejects the first `conflicts` commits with a version conflict and stalls
/// every commit by `commit_delay_ms`.
struct ConflictingStore {
    inner: InMemoryInventoryStore,
    conflicts: AtomicU32,
    commit_delay_ms: AtomicU64,
}

#[async_trait::async_trait]
impl InventoryStore for ConflictingStore {
    async fn load(
        &self,
        organization_id: OrganizationId,
        kind: &str,
        key: &str,
    ) -> Result<Option<StoredDocument>, StoreError> {
        self.inner.load(organization_id, kind, key).await
    }

    async fn list(
        &self,
        organization_id: OrganizationId,
        kind: &str,
    ) -> Result<Vec<StoredDocument>, StoreError> {
        self.inner.list(organization_id, kind).await
    }

    async fn ledger(
        &self,
        organization_id: OrganizationId,
        query: &LedgerQuery,
    ) -> Result<Vec<StockLedgerEntry>, StoreError> {
        self.inner.ledger(organization_id, query).await
    }

    async fn ledger_entry(
        &self,
        organization_id: OrganizationId,
        entry_id: stockledger_core::LedgerEntryId,
    ) -> Result<Option<StockLedgerEntry>, StoreError> {
        self.inner.ledger_entry(organization_id, entry_id).await
    }

    async fn commit(
        &self,
        organization_id: OrganizationId,
        changes: ChangeSet,
    ) -> Result<Vec<StockLedgerEntry>, StoreError> {
        let remaining = self.conflicts.load(Ordering::SeqCst);
        if remaining > 0 && !changes.ledger.is_empty() {
            self.conflicts.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Concurrency("injected conflict".into()));
        }
        let delay = self.commit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.commit(organization_id, changes).await
    }
}

async fn conflicting_world(conflicts: u32, max_attempts: u32) -> (CommandDispatcher<ConflictingStore>, StockIn, OrganizationId) {
    let store = Arc::new(ConflictingStore {
        inner: InMemoryInventoryStore::new(),
        conflicts: AtomicU32::new(conflicts),
        commit_delay_ms: AtomicU64::new(0),
    });
    let org = OrganizationId::new();
    let warehouse = Warehouse::create(NewWarehouse {
        organization_id: org,
        warehouse_id: WarehouseId::new(),
        branch_id: BranchId::new(),
        name: "Depot".to_string(),
        code: "depot".to_string(),
    })
    .unwrap();
    let product = Product::create(NewProduct {
        organization_id: org,
        product_id: ProductId::new(),
        name: "Gravel".to_string(),
        sku: "GRV".to_string(),
        unit: None,
        selling_price: dec!(1),
        cost_price: dec!(1),
        tax_rate: Decimal::ZERO,
        has_expiry: false,
        min_stock_level: Decimal::ZERO,
        created_at: Utc::now(),
    })
    .unwrap();
    seed_document(&*store, &warehouse).await.unwrap();
    seed_document(&*store, &product).await.unwrap();

    let op = StockIn {
        product_id: product.id(),
        warehouse_id: warehouse.id(),
        quantity: dec!(5),
        unit_cost: None,
        movement_type: MovementType::Opening,
        reference: None,
        batch_number: None,
        expiry_date: None,
        manufacturing_date: None,
        notes: None,
        performed_by: UserId::new(),
        occurred_at: Utc::now(),
    };
    let dispatcher = CommandDispatcher::with_policy(
        store,
        RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
            ..RetryPolicy::default()
        },
    );
    (dispatcher, op, org)
}

#[tokio::test]
async fn version_conflicts_are_retried_from_scratch() {
    let (dispatcher, op, org) = conflicting_world(2, 5).await;

    let outcome = dispatcher.dispatch(org, &op).await.unwrap();
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.ledger_entries.len(), 1);
    assert_eq!(outcome.value.record.quantity(), dec!(5));

    let ledger = dispatcher.store().ledger(org, &LedgerQuery::default()).await.unwrap();
    assert_eq!(ledger.len(), 1);
}

#[tokio::test]
async fn slow_commit_is_reported_as_committed() {
    let (dispatcher, op, org) = conflicting_world(0, 1).await;
    dispatcher.store().commit_delay_ms.store(200, Ordering::SeqCst);
    let dispatcher = CommandDispatcher::with_policy(
        Arc::clone(dispatcher.store()),
        RetryPolicy {
            operation_timeout: Duration::from_millis(20),
            ..dispatcher.policy()
        },
    );

    let outcome = dispatcher.dispatch(org, &op).await.unwrap();
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.value.record.quantity(), dec!(5));
    let ledger = dispatcher.store().ledger(org, &LedgerQuery::default()).await.unwrap();
    assert_eq!(ledger.len(), 1);
}

#[tokio::test]
async fn exhausted_retries_surface_a_concurrency_error() {
    let (dispatcher, op, org) = conflicting_world(10, 2).await;

    let err = dispatcher.dispatch(org, &op).await.unwrap_err();
    assert!(matches!(err, DispatchError::Concurrency(_)));
    assert!(err.is_retryable());
    assert!(dispatcher.store().ledger(org, &LedgerQuery::default()).await.unwrap().is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

    #[test]
    fn ledger_reconciles_after_any_movement_sequence(
        moves in prop::collection::vec((any::<bool>(), 1u32..40), 1..15)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let (quantity, expected) = runtime.block_on(async {
            let w = World::new().await;
            let product = w.product("Widget", dec!(2), dec!(3), dec!(0)).await;
            let mut expected = Decimal::ZERO;
            for (inbound, qty) in moves {
                let qty = Decimal::from(qty);
                if inbound {
                    w.dispatcher.dispatch(w.org, &w.stock_in(product, w.main, qty, dec!(2))).await.unwrap();
                    expected += qty;
                } else {
                    match w.dispatcher.dispatch(w.org, &w.stock_out(product, w.main, qty)).await {
                        Ok(_) => expected -= qty,
                        Err(DispatchError::Domain(DomainError::InsufficientStock { .. })) => {
                            assert!(qty > expected);
                        }
                        Err(other) => panic!("unexpected error {other:?}"),
                    }
                }
            }
            w.assert_reconciles().await;
            (w.quantity(w.main, product).await, expected)
        });
        prop_assert_eq!(quantity, expected);
        prop_assert!(quantity >= Decimal::ZERO);
    }
}
