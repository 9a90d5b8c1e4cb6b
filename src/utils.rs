//! Identifier generation helpers

use bech32::Bech32m;
use uuid7::uuid7;

pub const PRODUCT_HRP: &str = "prod_";
pub const DEMAND_HRP: &str = "demand_";
pub const DOCKING_HRP: &str = "dock_";
pub const CONTRACT_HRP: &str = "contract_";
pub const ORDER_HRP: &str = "order_";
pub const RESERVATION_HRP: &str = "resv_";

/// Construct a unique entity id: a fresh uuid7 encoded as bech32 under the
/// given human-readable prefix.
pub fn new_entity_id(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encoded = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encoded)
}
