//! Pipeline metrics: lock-free counters and a serializable snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters for query outcomes and model resilience events.
#[derive(Debug)]
pub struct PipelineMetrics {
    queries: AtomicU64,
    invalid: AtomicU64,
    short_circuits: AtomicU64,
    not_found: AtomicU64,
    degraded_retrievals: AtomicU64,
    dominant_requeries: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    primary_failures: AtomicU64,
    fallback_uses: AtomicU64,
    breaker_trips: AtomicU64,
    static_fallbacks: AtomicU64,
    start_time: Instant,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counters {
    ($($field:ident => $record:ident),* $(,)?) => {
        impl PipelineMetrics {
            $(
                pub fn $record(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

counters! {
    queries => record_query,
    invalid => record_invalid,
    short_circuits => record_short_circuit,
    not_found => record_not_found,
    degraded_retrievals => record_degraded_retrieval,
    dominant_requeries => record_dominant_requery,
    cache_hits => record_cache_hit,
    cache_misses => record_cache_miss,
    primary_failures => record_primary_failure,
    fallback_uses => record_fallback_use,
    breaker_trips => record_breaker_trip,
    static_fallbacks => record_static_fallback,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            queries: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
            short_circuits: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
            degraded_retrievals: AtomicU64::new(0),
            dominant_requeries: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            primary_failures: AtomicU64::new(0),
            fallback_uses: AtomicU64::new(0),
            breaker_trips: AtomicU64::new(0),
            static_fallbacks: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get a summary snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            queries: load(&self.queries),
            invalid: load(&self.invalid),
            short_circuits: load(&self.short_circuits),
            not_found: load(&self.not_found),
            degraded_retrievals: load(&self.degraded_retrievals),
            dominant_requeries: load(&self.dominant_requeries),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            primary_failures: load(&self.primary_failures),
            fallback_uses: load(&self.fallback_uses),
            breaker_trips: load(&self.breaker_trips),
            static_fallbacks: load(&self.static_fallbacks),
            uptime_secs: self.uptime_secs(),
        }
    }
}

/// Immutable snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub queries: u64,
    pub invalid: u64,
    pub short_circuits: u64,
    pub not_found: u64,
    pub degraded_retrievals: u64,
    pub dominant_requeries: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub primary_failures: u64,
    pub fallback_uses: u64,
    pub breaker_trips: u64,
    pub static_fallbacks: u64,
    pub uptime_secs: u64,
}
