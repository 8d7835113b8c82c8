//! In-process counters for paging, transitions and aggregation fallbacks.
//!
//! Counters are lock-free so request paths can bump them without contention.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct ServiceMetrics {
    /// Pages returned by the query engine.
    pages_served: AtomicU64,
    /// Continuation tokens rejected by the codec.
    invalid_tokens: AtomicU64,
    /// Creation attempts that hit an existing key.
    duplicate_inserts: AtomicU64,
    /// Conditional state updates that matched a document.
    transitions_applied: AtomicU64,
    /// Conditional state updates that matched nothing.
    transitions_rejected: AtomicU64,
    /// Aggregation responses served from the reference list alone.
    aggregation_fallbacks: AtomicU64,
}

/// Point-in-time copy of [`ServiceMetrics`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceMetricsSnapshot {
    pub pages_served: u64,
    pub invalid_tokens: u64,
    pub duplicate_inserts: u64,
    pub transitions_applied: u64,
    pub transitions_rejected: u64,
    pub aggregation_fallbacks: u64,
}

impl ServiceMetrics {
    pub fn record_page(&self) {
        self.pages_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_token(&self) {
        self.invalid_tokens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_insert(&self) {
        self.duplicate_inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transition(&self, applied: bool) {
        let counter = if applied {
            &self.transitions_applied
        } else {
            &self.transitions_rejected
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aggregation_fallback(&self) {
        self.aggregation_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServiceMetricsSnapshot {
        ServiceMetricsSnapshot {
            pages_served: self.pages_served.load(Ordering::Relaxed),
            invalid_tokens: self.invalid_tokens.load(Ordering::Relaxed),
            duplicate_inserts: self.duplicate_inserts.load(Ordering::Relaxed),
            transitions_applied: self.transitions_applied.load(Ordering::Relaxed),
            transitions_rejected: self.transitions_rejected.load(Ordering::Relaxed),
            aggregation_fallbacks: self.aggregation_fallbacks.load(Ordering::Relaxed),
        }
    }
}
