//! Logging and metrics ambient stack.
//!
//! Logging goes through `tracing` directly at call sites (spans scoped to
//! each long-running task, structured fields for `service_name`,
//! `instance_id`, `method`/`pattern`, correlation ids — see spec §7). This
//! module only owns the metrics side: a small atomics-backed snapshot
//! matching the counters §4.5 and §4.7 name explicitly. There is no
//! exporter here; wiring a `Metrics` snapshot to Prometheus/OTel is an
//! adapter concern, same as the broker connection itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Discovery cache counters (§4.5 "Metrics exposed").
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub invalidations_from_watch: AtomicU64,
    pub invalidations_from_ttl: AtomicU64,
    pub watch_reconnects: AtomicU64,
    pub watch_events_total: AtomicU64,
}

impl CacheMetrics {
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            invalidations_from_watch: self.invalidations_from_watch.load(Ordering::Relaxed),
            invalidations_from_ttl: self.invalidations_from_ttl.load(Ordering::Relaxed),
            watch_reconnects: self.watch_reconnects.load(Ordering::Relaxed),
            watch_events_total: self.watch_events_total.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub invalidations_from_watch: u64,
    pub invalidations_from_ttl: u64,
    pub watch_reconnects: u64,
    pub watch_events_total: u64,
}

/// Per-service-instance runtime metrics, refreshed once per heartbeat tick
/// (§4.7 "Heartbeat task": "Update a local metrics snapshot (uptime,
/// counters, gauges, summaries)").
#[derive(Debug)]
pub struct RuntimeMetrics {
    started_at: Instant,
    pub rpc_calls_total: AtomicU64,
    pub rpc_errors_total: AtomicU64,
    pub events_published_total: AtomicU64,
    pub events_handled_total: AtomicU64,
    pub heartbeats_sent_total: AtomicU64,
    pub heartbeat_failures_total: AtomicU64,
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            rpc_calls_total: AtomicU64::new(0),
            rpc_errors_total: AtomicU64::new(0),
            events_published_total: AtomicU64::new(0),
            events_handled_total: AtomicU64::new(0),
            heartbeats_sent_total: AtomicU64::new(0),
            heartbeat_failures_total: AtomicU64::new(0),
        }
    }
}

impl RuntimeMetrics {
    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> RuntimeMetricsSnapshot {
        RuntimeMetricsSnapshot {
            uptime: self.uptime(),
            rpc_calls_total: self.rpc_calls_total.load(Ordering::Relaxed),
            rpc_errors_total: self.rpc_errors_total.load(Ordering::Relaxed),
            events_published_total: self.events_published_total.load(Ordering::Relaxed),
            events_handled_total: self.events_handled_total.load(Ordering::Relaxed),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Relaxed),
            heartbeat_failures_total: self.heartbeat_failures_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimeMetricsSnapshot {
    pub uptime: std::time::Duration,
    pub rpc_calls_total: u64,
    pub rpc_errors_total: u64,
    pub events_published_total: u64,
    pub events_handled_total: u64,
    pub heartbeats_sent_total: u64,
    pub heartbeat_failures_total: u64,
}
