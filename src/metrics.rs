// metrics.rs - Observability hooks (C10, supplemented — see SPEC_FULL.md §2)
//
// Lightweight read-only counters for host dashboards. Ambient observability
// carried regardless of spec.md's Non-goals, in the spirit of the teacher's
// own `SyncQueueStats`/`get_stats` for its sync queue.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub(crate) mutations_enqueued: AtomicU64,
    pub(crate) mutations_dispatched: AtomicU64,
    pub(crate) mutations_failed: AtomicU64,
    pub(crate) reconciled_events: AtomicU64,
    pub(crate) dropped_stale_events: AtomicU64,
    pub(crate) engine_restarts: AtomicU64,
    pub(crate) last_error_at: AtomicI64,
}

impl EngineMetrics {
    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            mutations_enqueued: self.mutations_enqueued.load(Ordering::Relaxed),
            mutations_dispatched: self.mutations_dispatched.load(Ordering::Relaxed),
            mutations_failed: self.mutations_failed.load(Ordering::Relaxed),
            reconciled_events: self.reconciled_events.load(Ordering::Relaxed),
            dropped_stale_events: self.dropped_stale_events.load(Ordering::Relaxed),
            engine_restarts: self.engine_restarts.load(Ordering::Relaxed),
            last_error_at: {
                let v = self.last_error_at.load(Ordering::Relaxed);
                if v == 0 {
                    None
                } else {
                    Some(v)
                }
            },
        }
    }

    pub(crate) fn record_enqueued(&self) {
        self.mutations_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatched(&self) {
        self.mutations_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_mutation_failed(&self) {
        self.mutations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconciled(&self) {
        self.reconciled_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_stale(&self) {
        self.dropped_stale_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_restart(&self) {
        self.engine_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error_now(&self, unix_seconds: i64) {
        self.last_error_at.store(unix_seconds, Ordering::Relaxed);
    }
}

/// Cheap, point-in-time read of `EngineMetrics`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngineMetricsSnapshot {
    pub mutations_enqueued: u64,
    pub mutations_dispatched: u64,
    pub mutations_failed: u64,
    pub reconciled_events: u64,
    pub dropped_stale_events: u64,
    pub engine_restarts: u64,
    pub last_error_at: Option<i64>,
}
