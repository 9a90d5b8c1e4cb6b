//! End-to-end lifecycle scenarios: demand → docking → contract → order,
//! with the reservation engine and sweeper in the loop.

use agri_trade::audit::MemorySink;
use agri_trade::contract::{ContractStatus, PurchaseContract, SignRole};
use agri_trade::demand::{DeliveryWindow, DemandDraft, DockingOffer};
use agri_trade::error::TradeError;
use agri_trade::order::OrderStatus;
use agri_trade::product::{Product, ProductDraft};
use agri_trade::reservation::ReservationStatus;
use agri_trade::service::{TradeConfig, TradeService};
use agri_trade::timestamp::TimeStamp;
use anyhow::Context;
use chrono::Duration;
use std::sync::Arc;
use tempfile::TempDir;

const FARMER: &str = "farmer-anna";
const PURCHASER: &str = "purchaser-benno";

// Sled uses file-based locking to prevent concurrent access, so each test
// gets its own database under a temp dir for simplified cleanup.
fn service_with_sink(name: &str) -> anyhow::Result<(TempDir, TradeService, Arc<MemorySink>)> {
    let temp_dir = tempfile::tempdir()?;
    let db = sled::open(temp_dir.path().join(name))?;
    let sink = Arc::new(MemorySink::new());
    let service = TradeService::with_config(Arc::new(db), TradeConfig::default(), sink.clone())?;
    Ok((temp_dir, service, sink))
}

fn window() -> DeliveryWindow {
    DeliveryWindow {
        from: TimeStamp::new_with(2026, 9, 1, 0, 0, 0),
        to: TimeStamp::new_with(2026, 9, 15, 0, 0, 0),
    }
}

fn listed_product(service: &TradeService, stock: u64) -> anyhow::Result<Product> {
    let product = service.register_product(
        FARMER.into(),
        ProductDraft {
            name: "Gala apples".into(),
            spec: "80mm".into(),
            unit: "kg".into(),
            price: 450,
            stock,
            min_purchase: 5,
        },
    )?;
    service.put_product_on_sale(&product.id, FARMER)
}

/// Walk from an open demand to a fully signed contract over `quantity` units.
fn signed_contract(
    service: &TradeService,
    product: &Product,
    quantity: u64,
) -> anyhow::Result<PurchaseContract> {
    let demand = service.publish_demand(
        PURCHASER.into(),
        DemandDraft {
            category: "fruit".into(),
            product_name: "apples".into(),
            quantity,
            delivery_window: window(),
        },
    )?;
    let docking = service.respond_to_demand(
        FARMER.into(),
        &demand.id,
        DockingOffer {
            product_id: Some(product.id.clone()),
            quoted_price: product.price,
            quantity,
            remark: None,
        },
    )?;
    service.accept_docking(&docking.id, PURCHASER)?;
    let contract = service.create_contract(&docking.id, PURCHASER)?;
    service.sign_contract(&contract.id, PURCHASER, SignRole::Purchaser, "oss://sig-p".into())?;
    service.sign_contract(&contract.id, FARMER, SignRole::Farmer, "oss://sig-f".into())
}

#[test]
fn full_lifecycle_to_completion() -> anyhow::Result<()> {
    let (_tmp, service, _sink) = service_with_sink("full_lifecycle.db")?;
    let product = listed_product(&service, 100)?;

    let contract = signed_contract(&service, &product, 20).context("contract setup failed")?;
    assert_eq!(contract.status, ContractStatus::Signed);
    assert_eq!(contract.total_amount, 450 * 20);

    let order = service.create_order(&contract.id)?;
    assert_eq!(order.status, OrderStatus::StockReserved);
    assert_eq!(service.store().must_product(&product.id)?.stock, 80);

    let order = service.confirm_payment(&order.id)?;
    assert_eq!(order.status, OrderStatus::Paid);
    let reservation = service.store().reservation_by_order(&order.id)?.unwrap();
    assert_eq!(reservation.status, ReservationStatus::Confirmed);

    let order = service.ship_order(&order.id)?;
    assert_eq!(order.status, OrderStatus::Shipped);

    let order = service.deliver_order(&order.id, 19, Some("one crate bruised".into()))?;
    assert_eq!(order.status, OrderStatus::Delivered);
    assert_eq!(order.actual_quantity, Some(19));
    assert_eq!(order.actual_amount, Some(450 * 19));

    let order = service.complete_order(&order.id)?;
    assert_eq!(order.status, OrderStatus::Completed);
    assert!(order.status.is_terminal());

    // the confirmed hold keeps the stock decrement committed
    assert_eq!(service.store().must_product(&product.id)?.stock, 80);
    Ok(())
}

#[test]
fn contract_snapshot_survives_product_edits() -> anyhow::Result<()> {
    let (_tmp, service, _sink) = service_with_sink("snapshot_freeze.db")?;
    let product = listed_product(&service, 50)?;
    let contract = signed_contract(&service, &product, 10)?;

    // reprice the product after signing
    service.store().update_product(&product.id, |p| {
        p.price = 9_999;
        Ok(())
    })?;

    let reread = service.store().must_contract(&contract.id)?;
    assert_eq!(reread.snapshot.price, 450);
    assert_eq!(reread.snapshot.digest()?, reread.snapshot_digest);

    // and the order spawned later still carries the frozen terms
    let order = service.create_order(&contract.id)?;
    assert_eq!(order.snapshot.price, 450);
    assert_eq!(order.total_amount, 450 * 10);
    Ok(())
}

#[test]
fn withdraw_with_live_order_releases_stock() -> anyhow::Result<()> {
    let (_tmp, service, sink) = service_with_sink("withdraw_live_order.db")?;
    let product = listed_product(&service, 30)?;
    let contract = signed_contract(&service, &product, 12)?;

    let order = service.create_order(&contract.id)?;
    assert_eq!(order.status, OrderStatus::StockReserved);
    assert_eq!(service.store().must_product(&product.id)?.stock, 18);

    let contract = service.withdraw_contract(&contract.id, PURCHASER, "supplier change")?;
    assert_eq!(contract.status, ContractStatus::Withdrawn);

    let order = service.store().must_order(&order.id)?;
    assert_eq!(order.status, OrderStatus::Cancelled);
    let reservation = service.store().reservation_by_order(&order.id)?.unwrap();
    assert_eq!(reservation.status, ReservationStatus::Released);
    assert_eq!(service.store().must_product(&product.id)?.stock, 30);

    assert!(
        sink.events_for(&contract.id)
            .contains(&"contract.withdraw".to_string())
    );
    Ok(())
}

#[test]
fn second_order_for_same_contract_rejected() -> anyhow::Result<()> {
    let (_tmp, service, _sink) = service_with_sink("duplicate_order.db")?;
    let product = listed_product(&service, 40)?;
    let contract = signed_contract(&service, &product, 10)?;

    service.create_order(&contract.id)?;
    let err = service.create_order(&contract.id).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<TradeError>(),
        Some(TradeError::Duplicate { entity: "order", .. })
    ));
    // stock was decremented exactly once
    assert_eq!(service.store().must_product(&product.id)?.stock, 30);
    Ok(())
}

#[test]
fn insufficient_stock_aborts_order_creation() -> anyhow::Result<()> {
    let (_tmp, service, _sink) = service_with_sink("insufficient_abort.db")?;
    let product = listed_product(&service, 8)?;
    let contract = signed_contract(&service, &product, 12)?;

    let err = service.create_order(&contract.id).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TradeError>(),
        Some(TradeError::InsufficientStock { .. })
    ));

    // no partial state: no order row, no stock movement, contract untouched
    assert!(service.store().order_by_contract(&contract.id)?.is_none());
    assert_eq!(service.store().must_product(&product.id)?.stock, 8);
    assert_eq!(
        service.store().must_contract(&contract.id)?.status,
        ContractStatus::Signed
    );
    Ok(())
}

#[test]
fn cancelled_order_frees_stock_for_the_next_buyer() -> anyhow::Result<()> {
    let (_tmp, service, _sink) = service_with_sink("cancel_frees_stock.db")?;
    let product = listed_product(&service, 10)?;

    let contract_a = signed_contract(&service, &product, 10)?;
    let order_a = service.create_order(&contract_a.id)?;
    assert_eq!(service.store().must_product(&product.id)?.stock, 0);

    // a second buyer cannot reserve while the first hold is live
    let contract_b = signed_contract_second_purchaser(&service, &product, 5)?;
    let err = service.create_order(&contract_b.id).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TradeError>(),
        Some(TradeError::InsufficientStock { .. })
    ));

    service.cancel_order(&order_a.id, "buyer backed out")?;
    assert_eq!(service.store().must_product(&product.id)?.stock, 10);

    let order_b = service.create_order(&contract_b.id)?;
    assert_eq!(order_b.status, OrderStatus::StockReserved);
    assert_eq!(service.store().must_product(&product.id)?.stock, 5);
    Ok(())
}

// a second purchaser running the same demand→contract path
fn signed_contract_second_purchaser(
    service: &TradeService,
    product: &Product,
    quantity: u64,
) -> anyhow::Result<PurchaseContract> {
    let purchaser = "purchaser-carla";
    let demand = service.publish_demand(
        purchaser.into(),
        DemandDraft {
            category: "fruit".into(),
            product_name: "apples".into(),
            quantity,
            delivery_window: window(),
        },
    )?;
    let docking = service.respond_to_demand(
        FARMER.into(),
        &demand.id,
        DockingOffer {
            product_id: Some(product.id.clone()),
            quoted_price: product.price,
            quantity,
            remark: None,
        },
    )?;
    service.accept_docking(&docking.id, purchaser)?;
    let contract = service.create_contract(&docking.id, purchaser)?;
    service.sign_contract(&contract.id, purchaser, SignRole::Purchaser, "oss://sig-p2".into())?;
    service.sign_contract(&contract.id, FARMER, SignRole::Farmer, "oss://sig-f2".into())
}

#[test]
fn sweep_reclaims_abandoned_order_after_ttl() -> anyhow::Result<()> {
    let (_tmp, service, sink) = service_with_sink("sweep_reclaims.db")?;
    let product = listed_product(&service, 25)?;
    let contract = signed_contract(&service, &product, 10)?;

    let order = service.create_order(&contract.id)?;
    assert_eq!(service.store().must_product(&product.id)?.stock, 15);

    let sweeper = service.sweeper();

    // one minute before the deadline nothing happens
    let just_before = TimeStamp::now().plus(Duration::hours(24) - Duration::minutes(1));
    let summary = sweeper.run_sweep_at(just_before)?;
    assert_eq!(summary.expired, 0);

    // one minute past the deadline the hold is reclaimed
    let just_after = TimeStamp::now().plus(Duration::hours(24) + Duration::minutes(1));
    let summary = sweeper.run_sweep_at(just_after.clone())?;
    assert_eq!(summary.expired, 1);
    assert_eq!(service.store().must_product(&product.id)?.stock, 25);

    let reservation = service.store().reservation_by_order(&order.id)?.unwrap();
    assert_eq!(reservation.status, ReservationStatus::Expired);
    assert_eq!(reservation.release_reason.as_deref(), Some("auto-expired"));
    assert!(
        sink.events_for(&reservation.id)
            .contains(&"reservation.expired".to_string())
    );

    // sweeping again is a no-op, the hold is terminal
    let summary = sweeper.run_sweep_at(just_after)?;
    assert_eq!(summary, Default::default());
    assert_eq!(service.store().must_product(&product.id)?.stock, 25);

    // paying for the swept order now fails, its hold is gone
    let err = service.confirm_payment(&order.id).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TradeError>(),
        Some(TradeError::NotFound { .. })
    ));
    Ok(())
}

#[test]
fn paid_order_is_immune_to_the_sweeper() -> anyhow::Result<()> {
    let (_tmp, service, _sink) = service_with_sink("paid_immune.db")?;
    let product = listed_product(&service, 25)?;
    let contract = signed_contract(&service, &product, 10)?;

    let order = service.create_order(&contract.id)?;
    service.confirm_payment(&order.id)?;

    let far_future = TimeStamp::now().plus(Duration::days(30));
    let summary = service.sweeper().run_sweep_at(far_future)?;

    assert_eq!(summary.expired, 0);
    assert_eq!(service.store().must_product(&product.id)?.stock, 15);
    assert_eq!(
        service
            .store()
            .reservation_by_order(&order.id)?
            .unwrap()
            .status,
        ReservationStatus::Confirmed
    );
    Ok(())
}

#[test]
fn demand_ownership_and_docking_rules() -> anyhow::Result<()> {
    let (_tmp, service, _sink) = service_with_sink("demand_rules.db")?;
    let product = listed_product(&service, 50)?;

    let demand = service.publish_demand(
        PURCHASER.into(),
        DemandDraft {
            category: "fruit".into(),
            product_name: "apples".into(),
            quantity: 10,
            delivery_window: window(),
        },
    )?;

    // only the owner may close
    let err = service.close_demand(&demand.id, "someone-else").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TradeError>(),
        Some(TradeError::NotPermitted { .. })
    ));

    let offer = DockingOffer {
        product_id: Some(product.id.clone()),
        quoted_price: 440,
        quantity: 10,
        remark: Some("first harvest".into()),
    };

    let docking = service.respond_to_demand(FARMER.into(), &demand.id, offer.clone())?;

    // the same farmer cannot respond twice
    let err = service
        .respond_to_demand(FARMER.into(), &demand.id, offer.clone())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TradeError>(),
        Some(TradeError::Duplicate { entity: "docking", .. })
    ));

    // a closed demand takes no further responses
    service.close_demand(&demand.id, PURCHASER)?;
    let err = service
        .respond_to_demand("farmer-dora".into(), &demand.id, offer)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TradeError>(),
        Some(TradeError::InvalidState { .. })
    ));

    // only the demand owner may accept the docking
    let err = service.accept_docking(&docking.id, "someone-else").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TradeError>(),
        Some(TradeError::NotPermitted { .. })
    ));

    let docking = service.accept_docking(&docking.id, PURCHASER)?;
    let contract = service.create_contract(&docking.id, PURCHASER)?;
    assert_eq!(contract.status, ContractStatus::Draft);

    // one contract per docking
    let err = service.create_contract(&docking.id, PURCHASER).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TradeError>(),
        Some(TradeError::Duplicate { entity: "contract", .. })
    ));
    Ok(())
}

#[test]
fn oversized_amounts_are_rejected_not_wrapped() -> anyhow::Result<()> {
    let (_tmp, service, _sink) = service_with_sink("amount_overflow.db")?;
    let product = listed_product(&service, 100)?;

    // a quoted quantity whose total cannot be represented fails at contract
    // creation instead of wrapping
    let demand = service.publish_demand(
        PURCHASER.into(),
        DemandDraft {
            category: "fruit".into(),
            product_name: "apples".into(),
            quantity: u64::MAX,
            delivery_window: window(),
        },
    )?;
    let docking = service.respond_to_demand(
        FARMER.into(),
        &demand.id,
        DockingOffer {
            product_id: Some(product.id.clone()),
            quoted_price: product.price,
            quantity: u64::MAX,
            remark: None,
        },
    )?;
    service.accept_docking(&docking.id, PURCHASER)?;
    let err = service.create_contract(&docking.id, PURCHASER).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TradeError>(),
        Some(TradeError::AmountOverflow { .. })
    ));

    // same guard on the settled amount at delivery
    let contract = signed_contract(&service, &product, 20)?;
    let order = service.create_order(&contract.id)?;
    service.confirm_payment(&order.id)?;
    service.ship_order(&order.id)?;

    let err = service
        .deliver_order(&order.id, u64::MAX, None)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TradeError>(),
        Some(TradeError::AmountOverflow { .. })
    ));
    // the failed delivery persisted nothing
    let order = service.store().must_order(&order.id)?;
    assert_eq!(order.status, OrderStatus::Shipped);
    assert_eq!(order.actual_quantity, None);
    Ok(())
}

#[test]
fn unsigned_contract_cannot_spawn_an_order() -> anyhow::Result<()> {
    let (_tmp, service, _sink) = service_with_sink("unsigned_contract.db")?;
    let product = listed_product(&service, 50)?;

    let demand = service.publish_demand(
        PURCHASER.into(),
        DemandDraft {
            category: "fruit".into(),
            product_name: "apples".into(),
            quantity: 10,
            delivery_window: window(),
        },
    )?;
    let docking = service.respond_to_demand(
        FARMER.into(),
        &demand.id,
        DockingOffer {
            product_id: Some(product.id.clone()),
            quoted_price: 450,
            quantity: 10,
            remark: None,
        },
    )?;
    service.accept_docking(&docking.id, PURCHASER)?;
    let contract = service.create_contract(&docking.id, PURCHASER)?;
    service.sign_contract(&contract.id, PURCHASER, SignRole::Purchaser, "oss://p".into())?;

    // one signature is not enough
    let err = service.create_order(&contract.id).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TradeError>(),
        Some(TradeError::InvalidState { .. })
    ));
    assert_eq!(service.store().must_product(&product.id)?.stock, 50);
    Ok(())
}
