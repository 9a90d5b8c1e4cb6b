//! Service layer API for the trade lifecycle
//!
//! `TradeService` is the state machine root: it owns the store and the audit
//! sink, validates each transition against the tables in the entity modules,
//! and calls into the reservation engine at the transition points that touch
//! stock. Any reservation failure surfaces to the caller with the
//! contract/order left in its prior state.

use super::audit::{AuditSink, LogSink};
use super::contract::{ContractStatus, PurchaseContract, SignRole};
use super::demand::{
    DemandDraft, DemandStatus, DockingOffer, DockingRecord, DockingStatus, PurchaseDemand,
};
use super::error::TradeError;
use super::order::{OrderStatus, PurchaseOrder};
use super::product::{Product, ProductDraft, ProductSnapshot, ProductStatus};
use super::store::{ReleaseOutcome, TradeStore};
use super::sweeper::ReservationSweeper;
use super::timestamp::TimeStamp;
use super::utils;
use chrono::Duration;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct TradeConfig {
    /// Lower bound on how long a pending reservation stays valid. The
    /// sweeper reclaims it on its first run after the deadline, so actual
    /// expiry can lag by up to one sweep interval.
    pub reservation_ttl: Duration,
    /// Advisory interval for the host timer driving the sweeper.
    pub sweep_interval: Duration,
}

impl Default for TradeConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::hours(24),
            sweep_interval: Duration::hours(1),
        }
    }
}

pub struct TradeService {
    store: TradeStore,
    audit: Arc<dyn AuditSink>,
    config: TradeConfig,
}

impl TradeService {
    pub fn new(instance: Arc<sled::Db>) -> anyhow::Result<Self> {
        Self::with_config(instance, TradeConfig::default(), Arc::new(LogSink))
    }

    pub fn with_config(
        instance: Arc<sled::Db>,
        config: TradeConfig,
        audit: Arc<dyn AuditSink>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            store: TradeStore::open(instance)?,
            audit,
            config,
        })
    }

    pub fn store(&self) -> &TradeStore {
        &self.store
    }

    pub fn config(&self) -> &TradeConfig {
        &self.config
    }

    /// The sweeper shares this service's store and audit sink; the hosting
    /// process wires it to a timer at `config.sweep_interval`.
    pub fn sweeper(&self) -> ReservationSweeper {
        ReservationSweeper::new(self.store.clone(), Arc::clone(&self.audit))
    }

    // products

    pub fn register_product(
        &self,
        farmer_id: String,
        draft: ProductDraft,
    ) -> anyhow::Result<Product> {
        let product = Product {
            id: utils::new_entity_id(utils::PRODUCT_HRP)?,
            farmer_id,
            name: draft.name,
            spec: draft.spec,
            unit: draft.unit,
            price: draft.price,
            stock: draft.stock,
            min_purchase: draft.min_purchase.max(1),
            status: ProductStatus::Draft,
            created_at: TimeStamp::now(),
        };
        self.store.insert_product(&product)?;
        self.audit
            .record("product.registered", &product.id, &product.name);
        Ok(product)
    }

    pub fn put_product_on_sale(
        &self,
        product_id: &str,
        farmer_id: &str,
    ) -> anyhow::Result<Product> {
        self.set_product_status(product_id, farmer_id, ProductStatus::OnSale, "put on sale")
    }

    pub fn take_product_off_sale(
        &self,
        product_id: &str,
        farmer_id: &str,
    ) -> anyhow::Result<Product> {
        self.set_product_status(product_id, farmer_id, ProductStatus::OffSale, "take off sale")
    }

    fn set_product_status(
        &self,
        product_id: &str,
        farmer_id: &str,
        to: ProductStatus,
        attempted: &'static str,
    ) -> anyhow::Result<Product> {
        let current = self.store.must_product(product_id)?;
        if current.farmer_id != farmer_id {
            return Err(TradeError::not_permitted(farmer_id, "product", product_id).into());
        }
        let product = self.store.update_product(product_id, |product| {
            if product.status == to {
                return Err(TradeError::invalid_state(
                    "product",
                    product_id,
                    product.status,
                    attempted,
                ));
            }
            product.status = to;
            Ok(())
        })?;
        Ok(product)
    }

    // demands

    pub fn publish_demand(
        &self,
        purchaser_id: String,
        draft: DemandDraft,
    ) -> anyhow::Result<PurchaseDemand> {
        let demand = PurchaseDemand {
            id: utils::new_entity_id(utils::DEMAND_HRP)?,
            purchaser_id,
            category: draft.category,
            product_name: draft.product_name,
            quantity: draft.quantity,
            delivery_window: draft.delivery_window,
            status: DemandStatus::Open,
            created_at: TimeStamp::now(),
        };
        self.store.insert_demand(&demand)?;
        self.audit
            .record("demand.published", &demand.id, &demand.product_name);
        Ok(demand)
    }

    pub fn close_demand(&self, demand_id: &str, caller_id: &str) -> anyhow::Result<PurchaseDemand> {
        let demand = self.set_demand_status(demand_id, caller_id, DemandStatus::Closed, "close")?;
        self.audit.record("demand.closed", demand_id, "");
        Ok(demand)
    }

    pub fn reopen_demand(
        &self,
        demand_id: &str,
        caller_id: &str,
    ) -> anyhow::Result<PurchaseDemand> {
        let demand = self.set_demand_status(demand_id, caller_id, DemandStatus::Open, "reopen")?;
        self.audit.record("demand.reopened", demand_id, "");
        Ok(demand)
    }

    fn set_demand_status(
        &self,
        demand_id: &str,
        caller_id: &str,
        to: DemandStatus,
        attempted: &'static str,
    ) -> anyhow::Result<PurchaseDemand> {
        let current = self.store.must_demand(demand_id)?;
        if current.purchaser_id != caller_id {
            return Err(TradeError::not_permitted(caller_id, "demand", demand_id).into());
        }
        let demand = self.store.update_demand(demand_id, |demand| {
            if demand.status == to {
                return Err(TradeError::invalid_state(
                    "demand",
                    demand_id,
                    demand.status,
                    attempted,
                ));
            }
            demand.status = to;
            Ok(())
        })?;
        Ok(demand)
    }

    // dockings

    /// A farmer responds to an open demand. One response per farmer per
    /// demand; the demand must still be open.
    pub fn respond_to_demand(
        &self,
        farmer_id: String,
        demand_id: &str,
        offer: DockingOffer,
    ) -> anyhow::Result<DockingRecord> {
        let demand = self.store.must_demand(demand_id)?;
        if demand.status != DemandStatus::Open {
            return Err(TradeError::invalid_state(
                "demand",
                demand_id,
                demand.status,
                "respond",
            )
            .into());
        }
        let docking = DockingRecord {
            id: utils::new_entity_id(utils::DOCKING_HRP)?,
            demand_id: demand_id.to_string(),
            farmer_id,
            product_id: offer.product_id,
            quoted_price: offer.quoted_price,
            quantity: offer.quantity,
            remark: offer.remark,
            status: DockingStatus::Pending,
            created_at: TimeStamp::now(),
        };
        self.store.insert_docking(&docking)?;
        self.audit
            .record("docking.created", &docking.id, &docking.demand_id);
        Ok(docking)
    }

    pub fn accept_docking(
        &self,
        docking_id: &str,
        purchaser_id: &str,
    ) -> anyhow::Result<DockingRecord> {
        let docking =
            self.handle_docking(docking_id, purchaser_id, DockingStatus::Accepted, "accept")?;
        self.audit
            .record("docking.accepted", docking_id, &docking.demand_id);
        Ok(docking)
    }

    pub fn reject_docking(
        &self,
        docking_id: &str,
        purchaser_id: &str,
    ) -> anyhow::Result<DockingRecord> {
        let docking =
            self.handle_docking(docking_id, purchaser_id, DockingStatus::Rejected, "reject")?;
        self.audit
            .record("docking.rejected", docking_id, &docking.demand_id);
        Ok(docking)
    }

    fn handle_docking(
        &self,
        docking_id: &str,
        purchaser_id: &str,
        to: DockingStatus,
        attempted: &'static str,
    ) -> anyhow::Result<DockingRecord> {
        let current = self.store.must_docking(docking_id)?;
        let demand = self.store.must_demand(&current.demand_id)?;
        if demand.purchaser_id != purchaser_id {
            return Err(TradeError::not_permitted(purchaser_id, "docking", docking_id).into());
        }
        let docking = self.store.update_docking(docking_id, |docking| {
            if docking.status != DockingStatus::Pending {
                return Err(TradeError::invalid_state(
                    "docking",
                    docking_id,
                    docking.status,
                    attempted,
                ));
            }
            docking.status = to;
            Ok(())
        })?;
        Ok(docking)
    }

    // contracts

    /// Derive a draft contract from an accepted docking, freezing the
    /// product terms as of now. At most one contract per docking.
    pub fn create_contract(
        &self,
        docking_id: &str,
        purchaser_id: &str,
    ) -> anyhow::Result<PurchaseContract> {
        let docking = self.store.must_docking(docking_id)?;
        if docking.status != DockingStatus::Accepted {
            return Err(TradeError::invalid_state(
                "docking",
                docking_id,
                docking.status,
                "create a contract",
            )
            .into());
        }
        let demand = self.store.must_demand(&docking.demand_id)?;
        if demand.purchaser_id != purchaser_id {
            return Err(TradeError::not_permitted(purchaser_id, "docking", docking_id).into());
        }
        let product_id = docking
            .product_id
            .clone()
            .ok_or_else(|| TradeError::not_found("product reference on docking", docking_id))?;
        let product = self.store.must_product(&product_id)?;
        if docking.quantity < product.min_purchase {
            return Err(TradeError::BelowMinimumPurchase {
                product_id: product_id.clone(),
                quantity: docking.quantity,
                min_purchase: product.min_purchase,
            }
            .into());
        }

        let now = TimeStamp::now();
        let snapshot = ProductSnapshot::capture(&product, now.clone());
        let snapshot_digest = snapshot.digest()?;
        let total_amount = snapshot.price.checked_mul(docking.quantity).ok_or_else(|| {
            TradeError::AmountOverflow {
                product_id: snapshot.product_id.clone(),
                price: snapshot.price,
                quantity: docking.quantity,
            }
        })?;

        let contract = PurchaseContract {
            id: utils::new_entity_id(utils::CONTRACT_HRP)?,
            contract_no: format!("C{}{:06}", now.date_digits(), self.store.next_serial()?),
            docking_id: docking_id.to_string(),
            purchaser_id: demand.purchaser_id.clone(),
            farmer_id: docking.farmer_id.clone(),
            product_id,
            snapshot,
            snapshot_digest,
            quantity: docking.quantity,
            total_amount,
            purchaser_sign_ref: None,
            farmer_sign_ref: None,
            status: ContractStatus::Draft,
            created_at: now,
        };
        self.store.insert_contract(&contract)?;
        self.audit
            .record("contract.created", &contract.id, &contract.contract_no);
        Ok(contract)
    }

    /// Record a party's signature artifact. The contract reaches Signed once
    /// both roles have signed; a second signature by the same role fails.
    pub fn sign_contract(
        &self,
        contract_id: &str,
        caller_id: &str,
        role: SignRole,
        artifact_ref: String,
    ) -> anyhow::Result<PurchaseContract> {
        let current = self.store.must_contract(contract_id)?;
        let party = match role {
            SignRole::Purchaser => &current.purchaser_id,
            SignRole::Farmer => &current.farmer_id,
        };
        if party != caller_id {
            return Err(TradeError::not_permitted(caller_id, "contract", contract_id).into());
        }
        let contract = self.store.update_contract(contract_id, |contract| {
            contract.apply_signature(role, artifact_ref.clone())
        })?;
        self.audit.record(
            "contract.signed",
            contract_id,
            match role {
                SignRole::Purchaser => "purchaser",
                SignRole::Farmer => "farmer",
            },
        );
        Ok(contract)
    }

    /// Purchaser pulls the contract before completion. Any live order is
    /// cancelled and its reservation released.
    pub fn withdraw_contract(
        &self,
        contract_id: &str,
        caller_id: &str,
        reason: &str,
    ) -> anyhow::Result<PurchaseContract> {
        self.close_contract(
            contract_id,
            caller_id,
            ContractStatus::Withdrawn,
            "withdraw",
            reason,
        )
    }

    /// Farmer declines a contract that has not been fully signed.
    pub fn reject_contract(
        &self,
        contract_id: &str,
        caller_id: &str,
        reason: &str,
    ) -> anyhow::Result<PurchaseContract> {
        self.close_contract(
            contract_id,
            caller_id,
            ContractStatus::Rejected,
            "reject",
            reason,
        )
    }

    /// Either party ends a fully signed contract.
    pub fn terminate_contract(
        &self,
        contract_id: &str,
        caller_id: &str,
        reason: &str,
    ) -> anyhow::Result<PurchaseContract> {
        self.close_contract(
            contract_id,
            caller_id,
            ContractStatus::Terminated,
            "terminate",
            reason,
        )
    }

    fn close_contract(
        &self,
        contract_id: &str,
        caller_id: &str,
        to: ContractStatus,
        attempted: &'static str,
        reason: &str,
    ) -> anyhow::Result<PurchaseContract> {
        let current = self.store.must_contract(contract_id)?;
        if current.purchaser_id != caller_id && current.farmer_id != caller_id {
            return Err(TradeError::not_permitted(caller_id, "contract", contract_id).into());
        }
        let contract = self
            .store
            .update_contract(contract_id, |contract| contract.close(to, attempted))?;

        // a live order under this contract is cancelled and its hold released
        if let Some(order) = self.store.order_by_contract(contract_id)? {
            if order.status.can_cancel() {
                self.release_order_hold(&order.id, reason)?;
                self.store.update_order(&order.id, |order| order.cancel())?;
                self.audit.record("order.cancelled", &order.id, reason);
            }
        }

        self.audit
            .record(&format!("contract.{attempted}"), contract_id, reason);
        Ok(contract)
    }

    // orders

    /// Spawn the order for a signed contract and reserve stock. The order
    /// only survives if the reservation commits; on `InsufficientStock` the
    /// freshly inserted order is removed again and the error surfaces.
    pub fn create_order(&self, contract_id: &str) -> anyhow::Result<PurchaseOrder> {
        let contract = self.store.must_contract(contract_id)?;
        if contract.status != ContractStatus::Signed {
            return Err(TradeError::invalid_state(
                "contract",
                contract_id,
                contract.status,
                "create an order",
            )
            .into());
        }

        let now = TimeStamp::now();
        let order = PurchaseOrder {
            id: utils::new_entity_id(utils::ORDER_HRP)?,
            order_no: format!("ORD{}{:06}", now.date_digits(), self.store.next_serial()?),
            contract_id: contract_id.to_string(),
            product_id: contract.product_id.clone(),
            snapshot: contract.snapshot.clone(),
            quantity: contract.quantity,
            total_amount: contract.total_amount,
            actual_quantity: None,
            actual_amount: None,
            inspection_note: None,
            status: OrderStatus::Created,
            created_at: now.clone(),
        };
        self.store.insert_order(&order)?;

        let reservation_id = match self.store.reserve(
            &order.id,
            &contract.product_id,
            contract.quantity,
            now,
            self.config.reservation_ttl,
        ) {
            Ok(reservation_id) => reservation_id,
            Err(e) => {
                tracing::warn!(
                    order = %order.id,
                    contract = %contract_id,
                    error = %e,
                    "stock reservation failed, aborting order creation"
                );
                self.store.remove_order(&order.id, contract_id)?;
                return Err(e.into());
            }
        };

        let order = self
            .store
            .update_order(&order.id, |order| order.advance(OrderStatus::StockReserved, "reserve"))?;
        self.audit.record("order.created", &order.id, &order.order_no);
        self.audit.record(
            "reservation.reserved",
            &reservation_id,
            &format!("order={} quantity={}", order.id, order.quantity),
        );
        Ok(order)
    }

    /// Payment subsystem callback: pin the stock for good and move the order
    /// to Paid.
    pub fn confirm_payment(&self, order_id: &str) -> anyhow::Result<PurchaseOrder> {
        let order = self.store.must_order(order_id)?;
        if order.status != OrderStatus::StockReserved {
            return Err(TradeError::invalid_state(
                "order",
                order_id,
                order.status,
                "confirm payment",
            )
            .into());
        }
        let reservation = self
            .store
            .get_active_by_order(order_id)?
            .ok_or_else(|| TradeError::not_found("active reservation for order", order_id))?;
        self.store.confirm(&reservation.id)?;

        let order = self
            .store
            .update_order(order_id, |order| order.advance(OrderStatus::Paid, "pay"))?;
        self.audit
            .record("reservation.confirmed", &reservation.id, order_id);
        self.audit.record("order.paid", order_id, "");
        Ok(order)
    }

    /// Cancel before shipment. Releasing the hold is idempotent: a
    /// reservation already confirmed (order paid) keeps its stock committed.
    pub fn cancel_order(&self, order_id: &str, reason: &str) -> anyhow::Result<PurchaseOrder> {
        let current = self.store.must_order(order_id)?;
        if !current.status.can_cancel() {
            return Err(
                TradeError::invalid_state("order", order_id, current.status, "cancel").into(),
            );
        }
        self.release_order_hold(order_id, reason)?;
        let order = self.store.update_order(order_id, |order| order.cancel())?;
        self.audit.record("order.cancelled", order_id, reason);
        Ok(order)
    }

    fn release_order_hold(&self, order_id: &str, reason: &str) -> anyhow::Result<()> {
        match self.store.release(order_id, reason) {
            Ok(ReleaseOutcome::Released {
                reservation_id,
                quantity,
            }) => {
                self.audit.record(
                    "reservation.released",
                    &reservation_id,
                    &format!("order={order_id} quantity={quantity} reason={reason}"),
                );
                Ok(())
            }
            Ok(ReleaseOutcome::AlreadyResolved {
                reservation_id,
                status,
            }) => {
                tracing::debug!(
                    reservation = %reservation_id,
                    ?status,
                    "release was a no-op, reservation already resolved"
                );
                Ok(())
            }
            // an order cancelled before its reservation existed has no hold
            Err(TradeError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn ship_order(&self, order_id: &str) -> anyhow::Result<PurchaseOrder> {
        let order = self
            .store
            .update_order(order_id, |order| order.advance(OrderStatus::Shipped, "ship"))?;
        self.audit.record("order.shipped", order_id, "");
        Ok(order)
    }

    /// Goods arrived and were inspected; record the actual delivered
    /// quantity and the settled amount at the frozen snapshot price.
    pub fn deliver_order(
        &self,
        order_id: &str,
        actual_quantity: u64,
        inspection_note: Option<String>,
    ) -> anyhow::Result<PurchaseOrder> {
        let order = self.store.update_order(order_id, |order| {
            order.advance(OrderStatus::Delivered, "deliver")?;
            let actual_amount = order
                .snapshot
                .price
                .checked_mul(actual_quantity)
                .ok_or_else(|| TradeError::AmountOverflow {
                    product_id: order.product_id.clone(),
                    price: order.snapshot.price,
                    quantity: actual_quantity,
                })?;
            order.actual_quantity = Some(actual_quantity);
            order.actual_amount = Some(actual_amount);
            order.inspection_note = inspection_note.clone();
            Ok(())
        })?;
        self.audit.record(
            "order.delivered",
            order_id,
            &format!("actual_quantity={actual_quantity}"),
        );
        Ok(order)
    }

    pub fn complete_order(&self, order_id: &str) -> anyhow::Result<PurchaseOrder> {
        let order = self
            .store
            .update_order(order_id, |order| {
                order.advance(OrderStatus::Completed, "complete")
            })?;
        self.audit.record("order.completed", order_id, "");
        Ok(order)
    }
}
