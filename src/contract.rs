//! Purchase contracts and their signing state machine
use super::error::TradeError;
use super::product::ProductSnapshot;
use super::timestamp::TimeStamp;
use chrono::Utc;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    PurchaserSigned,
    #[n(2)]
    FarmerSigned,
    #[n(3)]
    Signed,
    #[n(4)]
    Withdrawn,
    #[n(5)]
    Rejected,
    #[n(6)]
    Terminated,
}

impl ContractStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Withdrawn | Self::Rejected | Self::Terminated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignRole {
    Purchaser,
    Farmer,
}

/// Bilateral agreement derived from an accepted docking. Carries a frozen
/// snapshot of the product terms plus its digest; product edits after
/// creation never alter the signed terms.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct PurchaseContract {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub contract_no: String,
    #[n(2)]
    pub docking_id: String,
    #[n(3)]
    pub purchaser_id: String,
    #[n(4)]
    pub farmer_id: String,
    #[n(5)]
    pub product_id: String,
    #[n(6)]
    pub snapshot: ProductSnapshot,
    #[n(7)]
    pub snapshot_digest: String,
    #[n(8)]
    pub quantity: u64,
    /// Total in minor currency units: snapshot price * quantity
    #[n(9)]
    pub total_amount: u64,
    #[n(10)]
    pub purchaser_sign_ref: Option<String>,
    #[n(11)]
    pub farmer_sign_ref: Option<String>,
    #[n(12)]
    pub status: ContractStatus,
    #[n(13)]
    pub created_at: TimeStamp<Utc>,
}

impl PurchaseContract {
    /// Apply one party's signature. Signing twice by the same role, or
    /// signing a contract already Signed or terminal, is `InvalidState`.
    pub fn apply_signature(
        &mut self,
        role: SignRole,
        artifact_ref: String,
    ) -> Result<(), TradeError> {
        use ContractStatus::*;

        if self.status.is_terminal() || self.status == Signed {
            return Err(TradeError::invalid_state(
                "contract",
                &self.id,
                self.status,
                "sign",
            ));
        }

        let slot = match role {
            SignRole::Purchaser => &mut self.purchaser_sign_ref,
            SignRole::Farmer => &mut self.farmer_sign_ref,
        };
        if slot.is_some() {
            return Err(TradeError::invalid_state(
                "contract",
                &self.id,
                self.status,
                "sign twice for the same role",
            ));
        }
        *slot = Some(artifact_ref);

        self.status = match (&self.purchaser_sign_ref, &self.farmer_sign_ref) {
            (Some(_), Some(_)) => Signed,
            (Some(_), None) => PurchaserSigned,
            (None, Some(_)) => FarmerSigned,
            (None, None) => unreachable!("a signature was just recorded"),
        };
        Ok(())
    }

    /// Move to a terminal status, checking the transition table.
    pub fn close(&mut self, to: ContractStatus, attempted: &'static str) -> Result<(), TradeError> {
        use ContractStatus::*;

        let allowed = match to {
            // A withdraw can arrive at any point before the contract ends,
            // including after signing while an order is live.
            Withdrawn => !self.status.is_terminal(),
            Rejected => matches!(self.status, Draft | PurchaserSigned | FarmerSigned),
            Terminated => self.status == Signed,
            _ => false,
        };
        if !allowed {
            return Err(TradeError::invalid_state(
                "contract",
                &self.id,
                self.status,
                attempted,
            ));
        }
        self.status = to;
        Ok(())
    }
}
