//! Audit/notification sink invoked on lifecycle transitions
//!
//! Side-effect points are fire-and-forget: a sink must never fail a
//! transition, so `record` takes `&self` and returns nothing.

use std::sync::Mutex;

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &str, entity_id: &str, detail: &str);
}

/// Default sink, writes audit lines through `tracing`.
pub struct LogSink;

impl AuditSink for LogSink {
    fn record(&self, event: &str, entity_id: &str, detail: &str) {
        tracing::info!(target: "agri_trade::audit", event, entity_id, detail);
    }
}

/// In-memory sink for tests and embedding hosts that want to inspect the
/// audit trail directly.
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<AuditEntry>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub event: String,
    pub entity_id: String,
    pub detail: String,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn events_for(&self, entity_id: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.entity_id == entity_id)
            .map(|e| e.event)
            .collect()
    }
}

impl AuditSink for MemorySink {
    fn record(&self, event: &str, entity_id: &str, detail: &str) {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(AuditEntry {
                event: event.to_string(),
                entity_id: entity_id.to_string(),
                detail: detail.to_string(),
            });
    }
}
