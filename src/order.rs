//! Purchase orders spawned from signed contracts
use super::error::TradeError;
use super::product::ProductSnapshot;
use super::timestamp::TimeStamp;
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    #[n(0)]
    Created,
    #[n(1)]
    StockReserved,
    #[n(2)]
    Paid,
    #[n(3)]
    Shipped,
    #[n(4)]
    Delivered,
    #[n(5)]
    Completed,
    #[n(6)]
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// The forward transition table. Cancellation is handled separately
    /// because it is only reachable before shipment.
    fn next(self) -> Option<Self> {
        match self {
            Self::Created => Some(Self::StockReserved),
            Self::StockReserved => Some(Self::Paid),
            Self::Paid => Some(Self::Shipped),
            Self::Shipped => Some(Self::Delivered),
            Self::Delivered => Some(Self::Completed),
            Self::Completed | Self::Cancelled => None,
        }
    }

    pub fn can_cancel(self) -> bool {
        matches!(self, Self::Created | Self::StockReserved | Self::Paid)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PurchaseOrder {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub order_no: String,
    #[n(2)]
    pub contract_id: String,
    #[n(3)]
    pub product_id: String,
    #[n(4)]
    pub snapshot: ProductSnapshot,
    #[n(5)]
    pub quantity: u64,
    #[n(6)]
    pub total_amount: u64,
    /// Filled at delivery time, once inspection happened.
    #[n(7)]
    pub actual_quantity: Option<u64>,
    #[n(8)]
    pub actual_amount: Option<u64>,
    #[n(9)]
    pub inspection_note: Option<String>,
    #[n(10)]
    pub status: OrderStatus,
    #[n(11)]
    pub created_at: TimeStamp<Utc>,
}

impl PurchaseOrder {
    /// Advance one step along the forward table; anything else is
    /// `InvalidState`.
    pub fn advance(&mut self, to: OrderStatus, attempted: &'static str) -> Result<(), TradeError> {
        if self.status.next() != Some(to) {
            return Err(TradeError::invalid_state(
                "order",
                &self.id,
                self.status,
                attempted,
            ));
        }
        self.status = to;
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), TradeError> {
        if !self.status.can_cancel() {
            return Err(TradeError::invalid_state(
                "order",
                &self.id,
                self.status,
                "cancel",
            ));
        }
        self.status = OrderStatus::Cancelled;
        Ok(())
    }
}
