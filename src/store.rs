//! Sled-backed persistence for the trade lifecycle
//!
//! Every entity kind lives in its own tree, CBOR-encoded and keyed by id.
//! The operations the reservation engine depends on are expressed as sled
//! multi-tree transactions (stock and reservation commit together) or
//! status-guarded compare-and-swap loops, so concurrent callers serialize on
//! the storage engine instead of a read-then-write pair.

use super::contract::PurchaseContract;
use super::demand::{DockingRecord, PurchaseDemand};
use super::error::TradeError;
use super::order::PurchaseOrder;
use super::product::Product;
use super::reservation::{ReservationStatus, StockReservation};
use super::timestamp::TimeStamp;
use super::utils;
use chrono::{Duration, Utc};
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError, abort};
use std::sync::Arc;

/// One re-read after a lost compare-and-swap; after that the conflict
/// surfaces to the caller.
const CAS_ATTEMPTS: usize = 2;

/// Outcome of a release or expire. `AlreadyResolved` means another path got
/// there first and stock was not credited again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released {
        reservation_id: String,
        quantity: u64,
    },
    AlreadyResolved {
        reservation_id: String,
        status: ReservationStatus,
    },
}

#[derive(Clone)]
pub struct TradeStore {
    db: Arc<sled::Db>,
    products: sled::Tree,
    demands: sled::Tree,
    dockings: sled::Tree,
    contracts: sled::Tree,
    orders: sled::Tree,
    reservations: sled::Tree,
    indexes: sled::Tree,
}

fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, TradeError> {
    minicbor::to_vec(value).map_err(|e| TradeError::Codec(e.to_string()))
}

fn decode<T: for<'b> minicbor::Decode<'b, ()>>(bytes: &[u8]) -> Result<T, TradeError> {
    minicbor::decode(bytes).map_err(|e| TradeError::Codec(e.to_string()))
}

fn unwrap_txn<T>(result: Result<T, TransactionError<TradeError>>) -> Result<T, TradeError> {
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => TradeError::Storage(e),
    })
}

// index keys tying entities together
fn reservation_by_order_key(order_id: &str) -> String {
    format!("order_resv/{order_id}")
}
fn contract_by_docking_key(docking_id: &str) -> String {
    format!("docking_contract/{docking_id}")
}
fn order_by_contract_key(contract_id: &str) -> String {
    format!("contract_order/{contract_id}")
}
fn docking_by_demand_farmer_key(demand_id: &str, farmer_id: &str) -> String {
    format!("demand_farmer_dock/{demand_id}/{farmer_id}")
}

impl TradeStore {
    pub fn open(db: Arc<sled::Db>) -> Result<Self, TradeError> {
        Ok(Self {
            products: db.open_tree("products")?,
            demands: db.open_tree("demands")?,
            dockings: db.open_tree("dockings")?,
            contracts: db.open_tree("contracts")?,
            orders: db.open_tree("orders")?,
            reservations: db.open_tree("reservations")?,
            indexes: db.open_tree("indexes")?,
            db,
        })
    }

    /// Monotonic counter for human-facing contract/order numbers.
    pub fn next_serial(&self) -> Result<u64, TradeError> {
        Ok(self.db.generate_id()?)
    }

    // plain typed CRUD

    fn get<T: for<'b> minicbor::Decode<'b, ()>>(
        tree: &sled::Tree,
        id: &str,
    ) -> Result<Option<T>, TradeError> {
        match tree.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put<T: minicbor::Encode<()>>(
        tree: &sled::Tree,
        id: &str,
        value: &T,
    ) -> Result<(), TradeError> {
        tree.insert(id.as_bytes(), encode(value)?)?;
        Ok(())
    }

    /// Status-guarded read-modify-write via compare-and-swap. `apply` runs
    /// against a fresh read on every attempt, so a record that moved to an
    /// incompatible state in between reports `InvalidState` rather than
    /// clobbering the concurrent transition.
    fn update<T, F>(
        tree: &sled::Tree,
        entity: &'static str,
        id: &str,
        mut apply: F,
    ) -> Result<T, TradeError>
    where
        T: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()>,
        F: FnMut(&mut T) -> Result<(), TradeError>,
    {
        for _ in 0..CAS_ATTEMPTS {
            let old_bytes = tree
                .get(id.as_bytes())?
                .ok_or_else(|| TradeError::not_found(entity, id))?;
            let mut value: T = decode(&old_bytes)?;
            apply(&mut value)?;
            let new_bytes = encode(&value)?;
            match tree.compare_and_swap(id.as_bytes(), Some(old_bytes), Some(new_bytes))? {
                Ok(()) => return Ok(value),
                Err(_) => continue,
            }
        }
        Err(TradeError::ConcurrencyConflict {
            entity,
            id: id.to_string(),
        })
    }

    // products

    pub fn insert_product(&self, product: &Product) -> Result<(), TradeError> {
        Self::put(&self.products, &product.id, product)
    }

    pub fn product(&self, id: &str) -> Result<Option<Product>, TradeError> {
        Self::get(&self.products, id)
    }

    pub fn must_product(&self, id: &str) -> Result<Product, TradeError> {
        self.product(id)?
            .ok_or_else(|| TradeError::not_found("product", id))
    }

    /// Metadata-only product update (name, price, status, ...). Refuses to
    /// change the stock count, which belongs to the reservation engine.
    pub fn update_product<F>(&self, id: &str, apply: F) -> Result<Product, TradeError>
    where
        F: FnMut(&mut Product) -> Result<(), TradeError>,
    {
        let mut apply = apply;
        Self::update(&self.products, "product", id, |product: &mut Product| {
            let stock_before = product.stock;
            apply(product)?;
            product.stock = stock_before;
            Ok(())
        })
    }

    // demands

    pub fn insert_demand(&self, demand: &PurchaseDemand) -> Result<(), TradeError> {
        Self::put(&self.demands, &demand.id, demand)
    }

    pub fn must_demand(&self, id: &str) -> Result<PurchaseDemand, TradeError> {
        Self::get(&self.demands, id)?.ok_or_else(|| TradeError::not_found("demand", id))
    }

    pub fn update_demand<F>(&self, id: &str, apply: F) -> Result<PurchaseDemand, TradeError>
    where
        F: FnMut(&mut PurchaseDemand) -> Result<(), TradeError>,
    {
        Self::update(&self.demands, "demand", id, apply)
    }

    // dockings

    /// Insert a docking, enforcing one response per (demand, farmer).
    pub fn insert_docking(&self, docking: &DockingRecord) -> Result<(), TradeError> {
        let bytes = encode(docking)?;
        let index_key = docking_by_demand_farmer_key(&docking.demand_id, &docking.farmer_id);
        let outcome = (&self.dockings, &self.indexes).transaction(|(dockings, indexes)| {
            if indexes.get(index_key.as_bytes())?.is_some() {
                return abort(TradeError::Duplicate {
                    entity: "docking",
                    key: index_key.clone(),
                });
            }
            dockings.insert(docking.id.as_bytes(), bytes.as_slice())?;
            indexes.insert(index_key.as_bytes(), docking.id.as_bytes())?;
            Ok(())
        });
        unwrap_txn(outcome)
    }

    pub fn must_docking(&self, id: &str) -> Result<DockingRecord, TradeError> {
        Self::get(&self.dockings, id)?.ok_or_else(|| TradeError::not_found("docking", id))
    }

    pub fn update_docking<F>(&self, id: &str, apply: F) -> Result<DockingRecord, TradeError>
    where
        F: FnMut(&mut DockingRecord) -> Result<(), TradeError>,
    {
        Self::update(&self.dockings, "docking", id, apply)
    }

    // contracts

    /// Insert a contract, enforcing at most one per docking.
    pub fn insert_contract(&self, contract: &PurchaseContract) -> Result<(), TradeError> {
        let bytes = encode(contract)?;
        let index_key = contract_by_docking_key(&contract.docking_id);
        let outcome = (&self.contracts, &self.indexes).transaction(|(contracts, indexes)| {
            if indexes.get(index_key.as_bytes())?.is_some() {
                return abort(TradeError::Duplicate {
                    entity: "contract",
                    key: index_key.clone(),
                });
            }
            contracts.insert(contract.id.as_bytes(), bytes.as_slice())?;
            indexes.insert(index_key.as_bytes(), contract.id.as_bytes())?;
            Ok(())
        });
        unwrap_txn(outcome)
    }

    pub fn must_contract(&self, id: &str) -> Result<PurchaseContract, TradeError> {
        Self::get(&self.contracts, id)?.ok_or_else(|| TradeError::not_found("contract", id))
    }

    pub fn update_contract<F>(&self, id: &str, apply: F) -> Result<PurchaseContract, TradeError>
    where
        F: FnMut(&mut PurchaseContract) -> Result<(), TradeError>,
    {
        Self::update(&self.contracts, "contract", id, apply)
    }

    // orders

    /// Insert an order, enforcing at most one per contract.
    pub fn insert_order(&self, order: &PurchaseOrder) -> Result<(), TradeError> {
        let bytes = encode(order)?;
        let index_key = order_by_contract_key(&order.contract_id);
        let outcome = (&self.orders, &self.indexes).transaction(|(orders, indexes)| {
            if indexes.get(index_key.as_bytes())?.is_some() {
                return abort(TradeError::Duplicate {
                    entity: "order",
                    key: index_key.clone(),
                });
            }
            orders.insert(order.id.as_bytes(), bytes.as_slice())?;
            indexes.insert(index_key.as_bytes(), order.id.as_bytes())?;
            Ok(())
        });
        unwrap_txn(outcome)
    }

    /// Compensating delete for an order whose stock reservation failed.
    pub fn remove_order(&self, order_id: &str, contract_id: &str) -> Result<(), TradeError> {
        let index_key = order_by_contract_key(contract_id);
        let outcome = (&self.orders, &self.indexes).transaction(|(orders, indexes)| {
            orders.remove(order_id.as_bytes())?;
            indexes.remove(index_key.as_bytes())?;
            Ok(())
        });
        unwrap_txn(outcome)
    }

    pub fn must_order(&self, id: &str) -> Result<PurchaseOrder, TradeError> {
        Self::get(&self.orders, id)?.ok_or_else(|| TradeError::not_found("order", id))
    }

    pub fn order_by_contract(&self, contract_id: &str) -> Result<Option<PurchaseOrder>, TradeError> {
        match self.indexes.get(order_by_contract_key(contract_id).as_bytes())? {
            Some(id_bytes) => {
                let order_id = String::from_utf8_lossy(&id_bytes).into_owned();
                Self::get(&self.orders, &order_id)
            }
            None => Ok(None),
        }
    }

    pub fn update_order<F>(&self, id: &str, apply: F) -> Result<PurchaseOrder, TradeError>
    where
        F: FnMut(&mut PurchaseOrder) -> Result<(), TradeError>,
    {
        Self::update(&self.orders, "order", id, apply)
    }

    // reservation engine

    /// Create a Pending reservation and decrement product stock in one
    /// transaction. The transaction is the serialization point: two
    /// concurrent reserves near the stock boundary cannot both commit.
    pub fn reserve(
        &self,
        order_id: &str,
        product_id: &str,
        quantity: u64,
        now: TimeStamp<Utc>,
        ttl: Duration,
    ) -> Result<String, TradeError> {
        let reservation = StockReservation {
            id: utils::new_entity_id(utils::RESERVATION_HRP)
                .map_err(|e| TradeError::Codec(e.to_string()))?,
            order_id: order_id.to_string(),
            product_id: product_id.to_string(),
            quantity,
            status: ReservationStatus::Pending,
            created_at: now.clone(),
            deadline: now.plus(ttl),
            release_reason: None,
        };
        let reservation_bytes = encode(&reservation)?;
        let index_key = reservation_by_order_key(order_id);

        let outcome = (&self.products, &self.reservations, &self.indexes).transaction(
            |(products, reservations, indexes)| {
                // idempotency guard against duplicate order-creation retries
                if let Some(existing_id) = indexes.get(index_key.as_bytes())? {
                    if let Some(existing_bytes) = reservations.get(&existing_id)? {
                        let existing: StockReservation = decode(&existing_bytes)
                            .map_err(ConflictableTransactionError::Abort)?;
                        if matches!(
                            existing.status,
                            ReservationStatus::Pending | ReservationStatus::Confirmed
                        ) {
                            return abort(TradeError::AlreadyReserved {
                                order_id: order_id.to_string(),
                            });
                        }
                        // a Released/Expired hold does not block re-reserving
                    }
                }

                let product_bytes = products
                    .get(product_id.as_bytes())?
                    .ok_or_else(|| {
                        ConflictableTransactionError::Abort(TradeError::not_found(
                            "product", product_id,
                        ))
                    })?;
                let mut product: Product =
                    decode(&product_bytes).map_err(ConflictableTransactionError::Abort)?;
                product
                    .adjust_stock(-(quantity as i64))
                    .map_err(ConflictableTransactionError::Abort)?;
                products.insert(
                    product_id.as_bytes(),
                    encode(&product).map_err(ConflictableTransactionError::Abort)?,
                )?;

                reservations.insert(reservation.id.as_bytes(), reservation_bytes.as_slice())?;
                indexes.insert(index_key.as_bytes(), reservation.id.as_bytes())?;
                Ok(())
            },
        );
        unwrap_txn(outcome)?;
        Ok(reservation.id)
    }

    /// Pending → Confirmed. Stock stays decremented; a confirmed hold is
    /// never swept. Lost races are re-read once before surfacing.
    pub fn confirm(&self, reservation_id: &str) -> Result<StockReservation, TradeError> {
        Self::update(
            &self.reservations,
            "reservation",
            reservation_id,
            |reservation: &mut StockReservation| {
                if reservation.status != ReservationStatus::Pending {
                    return Err(TradeError::invalid_state(
                        "reservation",
                        reservation_id,
                        reservation.status,
                        "confirm",
                    ));
                }
                reservation.status = ReservationStatus::Confirmed;
                Ok(())
            },
        )
    }

    /// Release the order's reservation and restore stock. Idempotent: a
    /// reservation already Confirmed/Released/Expired reports
    /// `AlreadyResolved` without crediting stock a second time.
    pub fn release(&self, order_id: &str, reason: &str) -> Result<ReleaseOutcome, TradeError> {
        let reservation_id = self
            .reservation_id_for_order(order_id)?
            .ok_or_else(|| TradeError::not_found("reservation for order", order_id))?;
        self.resolve_pending(&reservation_id, ReservationStatus::Released, reason)
    }

    /// Sweeper path: Pending → Expired for a reservation past its deadline.
    /// The status check runs inside the transaction, so a concurrent confirm
    /// or release wins cleanly and this reports `AlreadyResolved`.
    pub fn expire(
        &self,
        reservation_id: &str,
        now: &TimeStamp<Utc>,
        reason: &str,
    ) -> Result<ReleaseOutcome, TradeError> {
        let reservation = self.must_reservation(reservation_id)?;
        if reservation.status == ReservationStatus::Pending && !reservation.is_expired_at(now) {
            return Err(TradeError::invalid_state(
                "reservation",
                reservation_id,
                reservation.status,
                "expire before deadline",
            ));
        }
        self.resolve_pending(reservation_id, ReservationStatus::Expired, reason)
    }

    /// Single conditional transition out of Pending plus the stock credit,
    /// atomically. Exactly one of release/expire can win; the loser observes
    /// the moved status and leaves the ledger alone.
    fn resolve_pending(
        &self,
        reservation_id: &str,
        to: ReservationStatus,
        reason: &str,
    ) -> Result<ReleaseOutcome, TradeError> {
        debug_assert!(matches!(
            to,
            ReservationStatus::Released | ReservationStatus::Expired
        ));

        let outcome =
            (&self.products, &self.reservations).transaction(|(products, reservations)| {
                let reservation_bytes = reservations
                    .get(reservation_id.as_bytes())?
                    .ok_or_else(|| {
                        ConflictableTransactionError::Abort(TradeError::not_found(
                            "reservation",
                            reservation_id,
                        ))
                    })?;
                let mut reservation: StockReservation =
                    decode(&reservation_bytes).map_err(ConflictableTransactionError::Abort)?;

                if reservation.status != ReservationStatus::Pending {
                    return Ok(ReleaseOutcome::AlreadyResolved {
                        reservation_id: reservation_id.to_string(),
                        status: reservation.status,
                    });
                }

                let product_bytes = products
                    .get(reservation.product_id.as_bytes())?
                    .ok_or_else(|| {
                        ConflictableTransactionError::Abort(TradeError::not_found(
                            "product",
                            &reservation.product_id,
                        ))
                    })?;
                let mut product: Product =
                    decode(&product_bytes).map_err(ConflictableTransactionError::Abort)?;
                product
                    .adjust_stock(reservation.quantity as i64)
                    .map_err(ConflictableTransactionError::Abort)?;
                products.insert(
                    reservation.product_id.as_bytes(),
                    encode(&product).map_err(ConflictableTransactionError::Abort)?,
                )?;

                reservation.status = to;
                reservation.release_reason = Some(reason.to_string());
                reservations.insert(
                    reservation_id.as_bytes(),
                    encode(&reservation).map_err(ConflictableTransactionError::Abort)?,
                )?;
                Ok(ReleaseOutcome::Released {
                    reservation_id: reservation_id.to_string(),
                    quantity: reservation.quantity,
                })
            });
        unwrap_txn(outcome)
    }

    fn reservation_id_for_order(&self, order_id: &str) -> Result<Option<String>, TradeError> {
        Ok(self
            .indexes
            .get(reservation_by_order_key(order_id).as_bytes())?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub fn must_reservation(&self, id: &str) -> Result<StockReservation, TradeError> {
        Self::get(&self.reservations, id)?.ok_or_else(|| TradeError::not_found("reservation", id))
    }

    /// The reservation for this order, only while it is still Pending.
    pub fn get_active_by_order(
        &self,
        order_id: &str,
    ) -> Result<Option<StockReservation>, TradeError> {
        let Some(reservation_id) = self.reservation_id_for_order(order_id)? else {
            return Ok(None);
        };
        let Some(reservation): Option<StockReservation> =
            Self::get(&self.reservations, &reservation_id)?
        else {
            return Ok(None);
        };
        Ok(reservation.status.is_active().then_some(reservation))
    }

    /// The order's reservation regardless of status.
    pub fn reservation_by_order(
        &self,
        order_id: &str,
    ) -> Result<Option<StockReservation>, TradeError> {
        match self.reservation_id_for_order(order_id)? {
            Some(reservation_id) => Self::get(&self.reservations, &reservation_id),
            None => Ok(None),
        }
    }

    /// All Pending reservations whose deadline has passed. Records that fail
    /// to decode are logged and skipped so one bad row cannot stall a sweep.
    pub fn pending_expired_at(
        &self,
        now: &TimeStamp<Utc>,
    ) -> Result<Vec<StockReservation>, TradeError> {
        let mut expired = Vec::new();
        for item in self.reservations.iter() {
            let (key, value) = item?;
            match decode::<StockReservation>(&value) {
                Ok(reservation) if reservation.is_expired_at(now) => expired.push(reservation),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        key = %String::from_utf8_lossy(&key),
                        error = %e,
                        "skipping undecodable reservation record"
                    );
                }
            }
        }
        Ok(expired)
    }
}
