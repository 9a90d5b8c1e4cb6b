//! Stock reservations: the hold against product stock tied 1:1 to an order
use super::timestamp::TimeStamp;
use chrono::Utc;

/// Release reason stamped by the sweeper on expiry.
pub const AUTO_EXPIRED_REASON: &str = "auto-expired";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    /// Stock decremented, awaiting payment confirmation. The only state the
    /// sweeper or a release may act on.
    #[n(0)]
    Pending,
    /// Payment confirmed; the stock decrement is committed for good.
    #[n(1)]
    Confirmed,
    /// Released by a user action; stock restored exactly once.
    #[n(2)]
    Released,
    /// Reclaimed by the sweeper past the deadline; stock restored exactly once.
    #[n(3)]
    Expired,
}

impl ReservationStatus {
    pub fn is_active(self) -> bool {
        self == Self::Pending
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct StockReservation {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub order_id: String,
    #[n(2)]
    pub product_id: String,
    #[n(3)]
    pub quantity: u64,
    #[n(4)]
    pub status: ReservationStatus,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
    /// Lower bound on validity: the sweeper reclaims the reservation on its
    /// first run after this instant, which may be up to one sweep interval
    /// later.
    #[n(6)]
    pub deadline: TimeStamp<Utc>,
    #[n(7)]
    pub release_reason: Option<String>,
}

impl StockReservation {
    pub fn is_expired_at(&self, now: &TimeStamp<Utc>) -> bool {
        self.status == ReservationStatus::Pending
            && self.deadline.to_datetime_utc() < now.to_datetime_utc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn reservation_with(status: ReservationStatus) -> StockReservation {
        let created_at = TimeStamp::new_with(2026, 3, 1, 12, 0, 0);
        StockReservation {
            id: "resv_test".into(),
            order_id: "order_test".into(),
            product_id: "prod_test".into(),
            quantity: 5,
            status,
            deadline: created_at.plus(Duration::hours(24)),
            created_at,
            release_reason: None,
        }
    }

    #[test]
    fn deadline_is_a_strict_bound() {
        let reservation = reservation_with(ReservationStatus::Pending);

        let at_deadline = TimeStamp::new_with(2026, 3, 2, 12, 0, 0);
        assert!(!reservation.is_expired_at(&at_deadline));

        let past_deadline = at_deadline.plus(Duration::minutes(1));
        assert!(reservation.is_expired_at(&past_deadline));
    }

    #[test]
    fn only_pending_reservations_expire() {
        let far_future = TimeStamp::new_with(2027, 1, 1, 0, 0, 0);
        for status in [
            ReservationStatus::Confirmed,
            ReservationStatus::Released,
            ReservationStatus::Expired,
        ] {
            assert!(!reservation_with(status).is_expired_at(&far_future));
        }
    }
}
