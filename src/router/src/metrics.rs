//! Per-router routing counters.
//!
//! The design notes (§9) call for replacing "mutable global state for
//! counters" with atomic fetch-add on a per-router metric struct; this is
//! that struct. It is distinct from the ambient process/Prometheus metrics
//! in [`common::metrics`], which this crate still uses for CPU/memory
//! reporting — this one answers the core's own observability contract (§6):
//! a JSON document of routing counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

#[derive(Default)]
struct Counters {
    to_primary: AtomicU64,
    to_replica: AtomicU64,
    to_all: AtomicU64,
    session_commands: AtomicU64,
    re_routes: AtomicU64,
    replica_count_samples: AtomicU64,
    replica_count_total: AtomicU64,
}

/// Cheaply cloneable handle shared across every `RouterSession` on a worker
/// pool. All mutation is via fetch-add; no lock is ever taken.
#[derive(Clone, Default)]
pub struct RouterMetrics(Arc<Counters>);

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub queries_to_primary: u64,
    pub queries_to_replica: u64,
    pub queries_to_all: u64,
    pub session_command_count: u64,
    pub average_replica_count: f64,
    pub re_route_count: u64,
}

impl RouterMetrics {
    pub fn record_primary(&self) {
        self.0.to_primary.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replica(&self) {
        self.0.to_replica.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_all(&self) {
        self.0.to_all.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_command(&self) {
        self.0.session_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_re_route(&self) {
        self.0.re_routes.fetch_add(1, Ordering::Relaxed);
    }

    /// Sampled once per routing decision with the session's current in-use
    /// replica count, to produce a running average.
    pub fn sample_replica_count(&self, count: u64) {
        self.0.replica_count_samples.fetch_add(1, Ordering::Relaxed);
        self.0
            .replica_count_total
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let samples = self.0.replica_count_samples.load(Ordering::Relaxed);
        let total = self.0.replica_count_total.load(Ordering::Relaxed);
        let average_replica_count = if samples == 0 {
            0.0
        } else {
            total as f64 / samples as f64
        };
        MetricsSnapshot {
            queries_to_primary: self.0.to_primary.load(Ordering::Relaxed),
            queries_to_replica: self.0.to_replica.load(Ordering::Relaxed),
            queries_to_all: self.0.to_all.load(Ordering::Relaxed),
            session_command_count: self.0.session_commands.load(Ordering::Relaxed),
            average_replica_count,
            re_route_count: self.0.re_routes.load(Ordering::Relaxed),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_average_replica_count() {
        let m = RouterMetrics::default();
        m.record_primary();
        m.record_replica();
        m.record_replica();
        m.sample_replica_count(2);
        m.sample_replica_count(4);
        let snap = m.snapshot();
        assert_eq!(snap.queries_to_primary, 1);
        assert_eq!(snap.queries_to_replica, 2);
        assert_eq!(snap.average_replica_count, 3.0);
    }
}
