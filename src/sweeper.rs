//! Periodic reclamation of stale pending reservations
//!
//! The sweeper is an explicit component rather than an ambient scheduled
//! method: the hosting process wires `run_sweep` to a timer, and tests drive
//! `run_sweep_at` with a simulated clock.

use super::audit::AuditSink;
use super::error::TradeError;
use super::reservation::AUTO_EXPIRED_REASON;
use super::store::{ReleaseOutcome, TradeStore};
use super::timestamp::TimeStamp;
use chrono::Utc;
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    /// Reservations moved to Expired with their stock restored.
    pub expired: usize,
    /// Candidates another path (confirm/release) resolved first.
    pub skipped: usize,
    /// Candidates that errored; left Pending for the next tick.
    pub failed: usize,
}

pub struct ReservationSweeper {
    store: TradeStore,
    audit: Arc<dyn AuditSink>,
}

impl ReservationSweeper {
    pub fn new(store: TradeStore, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    /// Entry point for the host scheduler. No arguments: the wall clock is
    /// the deadline reference.
    pub fn run_sweep(&self) -> Result<SweepSummary, TradeError> {
        self.run_sweep_at(TimeStamp::now())
    }

    /// Sweep against an injected `now`. Each candidate is an isolated unit
    /// of work: one failing reservation never aborts the rest, and a lost
    /// race against a concurrent confirm/release is skipped silently.
    pub fn run_sweep_at(&self, now: TimeStamp<Utc>) -> Result<SweepSummary, TradeError> {
        let candidates = self.store.pending_expired_at(&now)?;
        let mut summary = SweepSummary::default();

        for reservation in candidates {
            match self.store.expire(&reservation.id, &now, AUTO_EXPIRED_REASON) {
                Ok(ReleaseOutcome::Released { quantity, .. }) => {
                    summary.expired += 1;
                    self.audit.record(
                        "reservation.expired",
                        &reservation.id,
                        &format!(
                            "order={} product={} quantity={quantity}",
                            reservation.order_id, reservation.product_id
                        ),
                    );
                    tracing::info!(
                        reservation = %reservation.id,
                        order = %reservation.order_id,
                        product = %reservation.product_id,
                        quantity,
                        "expired stale reservation, stock restored"
                    );
                }
                Ok(ReleaseOutcome::AlreadyResolved { status, .. }) => {
                    // confirm or release got there first
                    summary.skipped += 1;
                    tracing::debug!(
                        reservation = %reservation.id,
                        ?status,
                        "sweep candidate resolved elsewhere"
                    );
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(
                        reservation = %reservation.id,
                        error = %e,
                        "failed to expire reservation, deferring to next sweep"
                    );
                }
            }
        }

        if summary != SweepSummary::default() {
            tracing::info!(
                expired = summary.expired,
                skipped = summary.skipped,
                failed = summary.failed,
                "reservation sweep finished"
            );
        }
        Ok(summary)
    }
}
