use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Monotonically increasing counter
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Gauge that can increase or decrease
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Gauge {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-cache metrics for observability and testing
///
/// Each Cache instance has its own set of metrics, allowing:
/// - Multiple cache instances with independent metrics
/// - Clean metric validation in tests
pub struct CacheMetrics {
    // Set outcomes
    pub set_insert: Counter,
    pub set_update: Counter,
    pub set_migrate: Counter,
    pub set_deferred: Counter,
    pub set_data_limit: Counter,
    pub set_full_memory: Counter,

    // Read outcomes
    pub get_hit: Counter,
    pub get_miss: Counter,
    pub get_expired: Counter,

    // Delete outcomes
    pub delete_ok: Counter,
    pub delete_not_found: Counter,

    // Shard lifecycle
    pub shard_install: Counter,
    pub shard_retire: Counter,

    // GC activity
    pub gc_runs: Counter,
    pub gc_expired: Counter,        // Entries removed by the expiration sweep
    pub gc_replayed: Counter,       // Deferred inserts replayed successfully
    pub gc_replay_dropped: Counter, // Deferred inserts dropped after a replay error

    // Current state gauges
    pub items_live: Gauge,
    pub shards_active: Gauge,
    pub deferred_pending: Gauge,
}

impl CacheMetrics {
    /// Create a new set of metrics for a cache instance
    pub fn new() -> Self {
        Self {
            set_insert: Counter::new(),
            set_update: Counter::new(),
            set_migrate: Counter::new(),
            set_deferred: Counter::new(),
            set_data_limit: Counter::new(),
            set_full_memory: Counter::new(),
            get_hit: Counter::new(),
            get_miss: Counter::new(),
            get_expired: Counter::new(),
            delete_ok: Counter::new(),
            delete_not_found: Counter::new(),
            shard_install: Counter::new(),
            shard_retire: Counter::new(),
            gc_runs: Counter::new(),
            gc_expired: Counter::new(),
            gc_replayed: Counter::new(),
            gc_replay_dropped: Counter::new(),
            items_live: Gauge::new(),
            shards_active: Gauge::new(),
            deferred_pending: Gauge::new(),
        }
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}
