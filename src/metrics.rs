//! Metrics collection for the instrumentation middleware
//!
//! Thread-safe counters built on atomic operations. They track intercepted
//! responses per content path, gateway cache behaviour, transform failures,
//! byte volumes and latencies.

use crate::models::ContentKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metrics collector for the instrumentation middleware
///
/// All operations are thread-safe using atomic operations.
#[derive(Debug, Default)]
pub struct InstrumentMetrics {
    // Response statistics
    total_responses: AtomicU64,
    javascript_responses: AtomicU64,
    html_responses: AtomicU64,
    passthrough_responses: AtomicU64,
    scripts_rewritten: AtomicU64,

    // Gateway statistics
    gateway_cache_hits: AtomicU64,
    gateway_cache_misses: AtomicU64,
    transform_failures: AtomicU64,

    // Byte statistics
    bytes_buffered: AtomicU64,
    bytes_emitted: AtomicU64,

    // Latency statistics (stored as microseconds)
    total_transform_duration_us: AtomicU64,
    total_finalize_duration_us: AtomicU64,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    // Response statistics
    pub total_responses: u64,
    pub javascript_responses: u64,
    pub html_responses: u64,
    pub passthrough_responses: u64,
    pub scripts_rewritten: u64,

    // Gateway statistics
    pub gateway_cache_hits: u64,
    pub gateway_cache_misses: u64,
    pub transform_failures: u64,

    // Byte statistics
    pub bytes_buffered: u64,
    pub bytes_emitted: u64,

    // Latency statistics
    pub total_transform_duration_us: u64,
    pub total_finalize_duration_us: u64,
}

impl InstrumentMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finalized response and the path it took
    pub fn record_response(&self, kind: ContentKind) {
        self.total_responses.fetch_add(1, Ordering::Relaxed);
        let counter = match kind {
            ContentKind::JavaScript => &self.javascript_responses,
            ContentKind::Html => &self.html_responses,
            ContentKind::Passthrough => &self.passthrough_responses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record inline script regions rewritten in an HTML document
    pub fn record_scripts_rewritten(&self, count: u64) {
        self.scripts_rewritten.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a gateway call served from the digest cache
    pub fn record_cache_hit(&self) {
        self.gateway_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a gateway call that invoked the instrumenter
    pub fn record_cache_miss(&self) {
        self.gateway_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an instrumenter failure
    pub fn record_transform_failure(&self) {
        self.transform_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes written by the handler into the buffer
    pub fn record_bytes_buffered(&self, bytes: u64) {
        self.bytes_buffered.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record bytes flushed to the underlying transport
    pub fn record_bytes_emitted(&self, bytes: u64) {
        self.bytes_emitted.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record time spent inside the external instrumenter
    pub fn record_transform_duration(&self, duration: Duration) {
        self.total_transform_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent in finalize, transformation and flush included
    pub fn record_finalize_duration(&self, duration: Duration) {
        self.total_finalize_duration_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    ///
    /// Due to concurrent updates the snapshot may not be perfectly consistent
    /// across all fields.
    pub fn get_stats(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_responses: self.total_responses.load(Ordering::Relaxed),
            javascript_responses: self.javascript_responses.load(Ordering::Relaxed),
            html_responses: self.html_responses.load(Ordering::Relaxed),
            passthrough_responses: self.passthrough_responses.load(Ordering::Relaxed),
            scripts_rewritten: self.scripts_rewritten.load(Ordering::Relaxed),
            gateway_cache_hits: self.gateway_cache_hits.load(Ordering::Relaxed),
            gateway_cache_misses: self.gateway_cache_misses.load(Ordering::Relaxed),
            transform_failures: self.transform_failures.load(Ordering::Relaxed),
            bytes_buffered: self.bytes_buffered.load(Ordering::Relaxed),
            bytes_emitted: self.bytes_emitted.load(Ordering::Relaxed),
            total_transform_duration_us: self.total_transform_duration_us.load(Ordering::Relaxed),
            total_finalize_duration_us: self.total_finalize_duration_us.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// Calculate gateway cache hit rate as a percentage
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.gateway_cache_hits + self.gateway_cache_misses;
        if total == 0 {
            0.0
        } else {
            (self.gateway_cache_hits as f64 / total as f64) * 100.0
        }
    }

    /// Responses that went through either rewriting path
    pub fn transformed_responses(&self) -> u64 {
        self.javascript_responses + self.html_responses
    }

    /// Average time per instrumenter invocation in milliseconds
    pub fn avg_transform_duration_ms(&self) -> f64 {
        if self.gateway_cache_misses == 0 {
            0.0
        } else {
            (self.total_transform_duration_us as f64 / self.gateway_cache_misses as f64) / 1000.0
        }
    }

    /// Average finalize time per response in milliseconds
    pub fn avg_finalize_duration_ms(&self) -> f64 {
        if self.total_responses == 0 {
            0.0
        } else {
            (self.total_finalize_duration_us as f64 / self.total_responses as f64) / 1000.0
        }
    }
}
