//! Farmer products and the frozen terms snapshot
use super::timestamp::TimeStamp;
use chrono::Utc;

/// Bumped whenever [`ProductSnapshot`] gains or loses a field, so stored
/// snapshots can be told apart from newer encodings.
pub const SNAPSHOT_VERSION: u16 = 1;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    OnSale,
    #[n(2)]
    OffSale,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Product {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub farmer_id: String,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub spec: String,
    #[n(4)]
    pub unit: String,
    /// Price per unit in minor currency units (integers for currency)
    #[n(5)]
    pub price: u64,
    /// Available stock. Mutated only by the reservation store.
    #[n(6)]
    pub stock: u64,
    #[n(7)]
    pub min_purchase: u64,
    #[n(8)]
    pub status: ProductStatus,
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
}

/// Fields a farmer supplies when registering a product. Listing starts in
/// Draft until the farmer puts it on sale.
#[derive(Debug, Clone)]
pub struct ProductDraft {
    pub name: String,
    pub spec: String,
    pub unit: String,
    pub price: u64,
    pub stock: u64,
    pub min_purchase: u64,
}

impl Product {
    /// The single mutation point for available stock. Negative `delta`
    /// reserves, positive restores. A decrement past zero fails without
    /// touching the count.
    pub fn adjust_stock(&mut self, delta: i64) -> Result<u64, super::error::TradeError> {
        let next = if delta < 0 {
            let decrement = delta.unsigned_abs();
            self.stock.checked_sub(decrement).ok_or_else(|| {
                super::error::TradeError::InsufficientStock {
                    product_id: self.id.clone(),
                    available: self.stock,
                    requested: decrement,
                }
            })?
        } else {
            self.stock.saturating_add(delta as u64)
        };
        self.stock = next;
        Ok(next)
    }
}

/// Frozen copy of the product terms captured at contract creation, so later
/// product edits never retroactively alter signed terms. Typed and versioned
/// rather than a loose key/value map.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ProductSnapshot {
    #[n(0)]
    pub version: u16,
    #[n(1)]
    pub product_id: String,
    #[n(2)]
    pub farmer_id: String,
    #[n(3)]
    pub name: String,
    #[n(4)]
    pub spec: String,
    #[n(5)]
    pub unit: String,
    #[n(6)]
    pub price: u64,
    #[n(7)]
    pub min_purchase: u64,
    #[n(8)]
    pub captured_at: TimeStamp<Utc>,
}

impl ProductSnapshot {
    pub fn capture(product: &Product, captured_at: TimeStamp<Utc>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            product_id: product.id.clone(),
            farmer_id: product.farmer_id.clone(),
            name: product.name.clone(),
            spec: product.spec.clone(),
            unit: product.unit.clone(),
            price: product.price,
            min_purchase: product.min_purchase,
            captured_at,
        }
    }

    /// Digest of the CBOR encoding, stored alongside the snapshot so readers
    /// can detect drift of signed terms.
    pub fn digest(&self) -> anyhow::Result<String> {
        let cbor = minicbor::to_vec(self)?;
        Ok(sha256::digest(&cbor))
    }
}
