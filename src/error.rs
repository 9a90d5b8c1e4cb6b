//! Business errors surfaced by the reservation store and trade state machine
#[derive(thiserror::Error, Debug)]
pub enum TradeError {
    #[error(
        "insufficient stock for product {product_id}: available {available}, requested {requested}"
    )]
    InsufficientStock {
        product_id: String,
        available: u64,
        requested: u64,
    },
    #[error("order {order_id} already holds an active stock reservation")]
    AlreadyReserved { order_id: String },
    #[error("{entity} {id} does not allow '{attempted}' from state {current}")]
    InvalidState {
        entity: &'static str,
        id: String,
        current: String,
        attempted: &'static str,
    },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("a {entity} already exists for {key}")]
    Duplicate { entity: &'static str, key: String },
    #[error("quantity {quantity} is below product {product_id} minimum purchase {min_purchase}")]
    BelowMinimumPurchase {
        product_id: String,
        quantity: u64,
        min_purchase: u64,
    },
    #[error("amount for product {product_id} overflows: price {price} x quantity {quantity}")]
    AmountOverflow {
        product_id: String,
        price: u64,
        quantity: u64,
    },
    #[error("{caller} is not permitted to act on {entity} {id}")]
    NotPermitted {
        caller: String,
        entity: &'static str,
        id: String,
    },
    #[error("lost a concurrent update race on {entity} {id}")]
    ConcurrencyConflict { entity: &'static str, id: String },
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("codec failure: {0}")]
    Codec(String),
}

impl TradeError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid_state(
        entity: &'static str,
        id: impl Into<String>,
        current: impl std::fmt::Debug,
        attempted: &'static str,
    ) -> Self {
        Self::InvalidState {
            entity,
            id: id.into(),
            current: format!("{current:?}"),
            attempted,
        }
    }

    pub fn not_permitted(
        caller: impl Into<String>,
        entity: &'static str,
        id: impl Into<String>,
    ) -> Self {
        Self::NotPermitted {
            caller: caller.into(),
            entity,
            id: id.into(),
        }
    }
}
