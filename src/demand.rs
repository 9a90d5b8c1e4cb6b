//! Purchaser demands and farmer docking offers
use super::timestamp::TimeStamp;
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemandStatus {
    #[n(0)]
    Open,
    #[n(1)]
    Closed,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct DeliveryWindow {
    #[n(0)]
    pub from: TimeStamp<Utc>,
    #[n(1)]
    pub to: TimeStamp<Utc>,
}

/// A purchaser's open request for produce.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PurchaseDemand {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub purchaser_id: String,
    #[n(2)]
    pub category: String,
    #[n(3)]
    pub product_name: String,
    #[n(4)]
    pub quantity: u64,
    #[n(5)]
    pub delivery_window: DeliveryWindow,
    #[n(6)]
    pub status: DemandStatus,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
}

/// Fields the purchaser supplies when publishing a demand.
#[derive(Debug, Clone)]
pub struct DemandDraft {
    pub category: String,
    pub product_name: String,
    pub quantity: u64,
    pub delivery_window: DeliveryWindow,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockingStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Accepted,
    #[n(2)]
    Rejected,
}

/// A farmer's offer against a purchaser's demand. Exactly one docking per
/// demand may progress to a contract; the rest stay informational.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct DockingRecord {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub demand_id: String,
    #[n(2)]
    pub farmer_id: String,
    #[n(3)]
    pub product_id: Option<String>,
    /// Quoted price per unit in minor currency units
    #[n(4)]
    pub quoted_price: u64,
    #[n(5)]
    pub quantity: u64,
    #[n(6)]
    pub remark: Option<String>,
    #[n(7)]
    pub status: DockingStatus,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
}

/// Fields a farmer supplies when responding to a demand.
#[derive(Debug, Clone)]
pub struct DockingOffer {
    pub product_id: Option<String>,
    pub quoted_price: u64,
    pub quantity: u64,
    pub remark: Option<String>,
}
