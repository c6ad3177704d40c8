//! Bounded, expiring, in-process key/value cache for binary payloads.
//!
//! Memory is pre-allocated into three size-segregated sections (small,
//! medium, large), each a pool of shards holding fixed-capacity records
//! with a free-slot stack. Steady-state Set/Get traffic recycles slots
//! instead of allocating. A keyed directory maps each key to its slot and
//! expiration; an asynchronous GC pass reclaims expired entries, retires
//! empty shards, and replays Sets that were deferred while memory was
//! saturated.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use slabcache::{Cache, Ttl};
//!
//! let cache = Cache::builder().build()?;
//!
//! cache.set(b"session", b"payload", Duration::from_secs(30)).await?;
//! let guard = cache.get(b"session").await?;
//! assert_eq!(guard.value(), b"payload");
//!
//! // Overwrite the value but keep the original expiration.
//! cache.set(b"session", b"updated", Ttl::Keep).await?;
//! ```

mod cache;
mod directory;
mod gc;
mod metrics;
mod record;
mod section;
mod shard;

use std::time::Duration;

// Public API exports
pub use cache::{Cache, CacheBuilder, ValueGuard};
pub use metrics::{CacheMetrics, Counter, Gauge};

/// Error types for cache operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// Key not present, expired, or already removed
    NotFound,
    /// Payload longer than the large section's record size
    DataLimit,
    /// Every shard of the target section is saturated and the
    /// deferred-insert buffer is full
    FullMemory,
}

/// Expiration policy for a Set.
///
/// `From<Duration>` lets callers pass a plain duration; `Duration::ZERO`
/// selects the default 48-hour window.
///
/// # Example
///
/// ```ignore
/// cache.set(b"k", b"v", Duration::from_secs(10)).await?; // expires in 10s
/// cache.set(b"k", b"v", Duration::ZERO).await?;          // default window
/// cache.set(b"k", b"w", Ttl::Keep).await?;               // keep prior expiry
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Expire the given duration from now
    After(Duration),
    /// Expire after the default window (48 hours)
    Default,
    /// Preserve the expiration already stored for the key, even one in
    /// the past. On a key with no stored expiration this behaves like
    /// `Default`.
    Keep,
}

impl From<Duration> for Ttl {
    fn from(ttl: Duration) -> Self {
        if ttl.is_zero() {
            Ttl::Default
        } else {
            Ttl::After(ttl)
        }
    }
}
