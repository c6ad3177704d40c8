//! Slab-backed cache coordinator
//!
//! This module provides the top-level `Cache` struct that dispatches
//! Set/Get/Exists/Delete over three size-segregated slab sections.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      Cache (Public API)                       │
//! │                 coordinator reader/writer lock                │
//! │                                                               │
//! │  ┌────────────┐      ┌─────────────────────────────────────┐  │
//! │  │ Directory  │ ───► │ Sections (small / medium / large)   │  │
//! │  │ key → slot │      │ shards of pre-allocated records     │  │
//! │  └────────────┘      └─────────────────────────────────────┘  │
//! │                                                               │
//! │  ┌─────────────────────────┐                                  │
//! │  │ Deferred-insert buffer  │ ◄── Sets that found every shard  │
//! │  └─────────────────────────┘     of their section saturated   │
//! └───────────────────────────────────────────────────────────────┘
//!                │ every gc_starter Sets, or after a spill
//!                ▼
//!     GC task (tokio::spawn): expiration sweep, empty-shard
//!     retirement, deferred-insert replay
//! ```
//!
//! Locking order is coordinator lock first, then a shard's inner lock.
//! Sets, deletes, and the GC pass hold the coordinator lock exclusively;
//! reads share it. No await point is reached while either lock is held.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use clocksource::precise::Instant;
use tokio::sync::{RwLock, RwLockReadGuard};

use crate::directory::{DirEntry, Directory};
use crate::gc::{self, DeferredBuffer, PendingInsert};
use crate::metrics::CacheMetrics;
use crate::section::{Section, SizeClass};
use crate::shard::Shard;
use crate::{CacheError, Ttl};

/// Applied when a Set asks for the default expiration window.
const DEFAULT_TTL: Duration = Duration::from_secs(48 * 60 * 60);

/// Builder for creating a cache
///
/// # Example
///
/// ```ignore
/// use slabcache::Cache;
///
/// let cache = Cache::builder()
///     .record_size_small(512)
///     .record_size_medium(2048)
///     .record_size_large(8128)
///     .build()?;
/// ```
pub struct CacheBuilder {
    record_size_small: usize,
    record_size_medium: usize,
    record_size_large: usize,
    max_records: usize,
    max_shards_small: usize,
    max_shards_medium: usize,
    max_shards_large: usize,
    gc_starter: u64,
}

impl Default for CacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBuilder {
    /// Create a new cache builder with default settings
    ///
    /// Defaults:
    /// - Record sizes: 512 B / 2048 B / 8128 B (small / medium / large)
    /// - 2048 records per shard
    /// - 256 / 128 / 64 shard slots per section
    /// - GC pass every 512000 Sets
    pub fn new() -> Self {
        Self {
            record_size_small: 512,
            record_size_medium: 2048,
            record_size_large: 8128,
            max_records: 2048,
            max_shards_small: 256,
            max_shards_medium: 128,
            max_shards_large: 64,
            gc_starter: 512_000,
        }
    }

    /// Set the record capacity of the small section in bytes (default: 512)
    ///
    /// Payloads up to this length land in the small section.
    pub fn record_size_small(mut self, bytes: usize) -> Self {
        self.record_size_small = bytes;
        self
    }

    /// Set the record capacity of the medium section in bytes (default: 2048)
    pub fn record_size_medium(mut self, bytes: usize) -> Self {
        self.record_size_medium = bytes;
        self
    }

    /// Set the record capacity of the large section in bytes (default: 8128)
    ///
    /// This is also the maximum accepted payload length; anything longer
    /// is rejected with [`CacheError::DataLimit`].
    pub fn record_size_large(mut self, bytes: usize) -> Self {
        self.record_size_large = bytes;
        self
    }

    /// Set the number of records per shard (default: 2048)
    ///
    /// Also bounds the deferred-insert buffer, which absorbs Sets that
    /// arrive while every shard of their section is saturated.
    pub fn max_records(mut self, count: usize) -> Self {
        self.max_records = count;
        self
    }

    /// Set the number of shard slots in the small section (default: 256)
    pub fn max_shards_small(mut self, count: usize) -> Self {
        self.max_shards_small = count;
        self
    }

    /// Set the number of shard slots in the medium section (default: 128)
    pub fn max_shards_medium(mut self, count: usize) -> Self {
        self.max_shards_medium = count;
        self
    }

    /// Set the number of shard slots in the large section (default: 64)
    pub fn max_shards_large(mut self, count: usize) -> Self {
        self.max_shards_large = count;
        self
    }

    /// Set how many Sets elapse between automatic GC passes (default: 512000)
    ///
    /// A Set that spills to the deferred buffer requests a pass
    /// immediately, regardless of the counter.
    pub fn gc_starter(mut self, sets: u64) -> Self {
        self.gc_starter = sets;
        self
    }

    /// Build the cache
    ///
    /// Allocates one initial shard per section.
    ///
    /// # Errors
    ///
    /// Returns an error if record sizes are not strictly increasing, or
    /// any record, shard, or GC count is zero.
    pub fn build(self) -> Result<Cache, std::io::Error> {
        if self.record_size_small == 0
            || self.record_size_small >= self.record_size_medium
            || self.record_size_medium >= self.record_size_large
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "record sizes must be strictly increasing, got {} / {} / {}",
                    self.record_size_small, self.record_size_medium, self.record_size_large
                ),
            ));
        }
        if self.max_records == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "max_records must be at least 1",
            ));
        }
        if self.max_shards_small == 0 || self.max_shards_medium == 0 || self.max_shards_large == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "each section needs at least one shard slot",
            ));
        }
        if self.gc_starter == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "gc_starter must be at least 1",
            ));
        }

        let sections = [
            Section::new(self.record_size_small, self.max_records, self.max_shards_small),
            Section::new(self.record_size_medium, self.max_records, self.max_shards_medium),
            Section::new(self.record_size_large, self.max_records, self.max_shards_large),
        ];

        let metrics = CacheMetrics::new();
        metrics.shards_active.set(SizeClass::ALL.len() as i64);

        Ok(Cache {
            inner: Arc::new(CacheInner {
                state: RwLock::new(CacheState {
                    directory: Directory::new(),
                    sections,
                    deferred: DeferredBuffer::new(self.max_records),
                }),
                set_counter: AtomicU64::new(0),
                gc_requested: AtomicBool::new(false),
                gc_starter: self.gc_starter,
                record_size_small: self.record_size_small,
                record_size_medium: self.record_size_medium,
                record_size_large: self.record_size_large,
                metrics,
            }),
        })
    }
}

/// Everything behind the coordinator lock.
pub(crate) struct CacheState {
    pub(crate) directory: Directory,
    pub(crate) sections: [Section; 3],
    pub(crate) deferred: DeferredBuffer,
}

pub(crate) struct CacheInner {
    pub(crate) state: RwLock<CacheState>,
    pub(crate) set_counter: AtomicU64,
    pub(crate) gc_requested: AtomicBool,
    pub(crate) gc_starter: u64,
    record_size_small: usize,
    record_size_medium: usize,
    record_size_large: usize,
    pub(crate) metrics: CacheMetrics,
}

/// How a Set resolved, for metrics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SetOutcome {
    Inserted,
    Updated,
    Migrated,
    Deferred,
}

impl CacheInner {
    /// The smallest class whose records hold `len` bytes. `None` means the
    /// payload exceeds the large record size.
    fn class_for(&self, len: usize) -> Option<SizeClass> {
        if len <= self.record_size_small {
            Some(SizeClass::Small)
        } else if len <= self.record_size_medium {
            Some(SizeClass::Medium)
        } else if len <= self.record_size_large {
            Some(SizeClass::Large)
        } else {
            None
        }
    }

    /// The Set path: sizing, expiration resolution, and slot placement,
    /// all under the coordinator write lock. Never spawns the GC task;
    /// callers decide that after the lock is released.
    pub(crate) async fn apply_set(
        &self,
        key: &[u8],
        data: &[u8],
        ttl: Ttl,
    ) -> Result<SetOutcome, CacheError> {
        let Some(class) = self.class_for(data.len()) else {
            self.metrics.set_data_limit.increment();
            return Err(CacheError::DataLimit);
        };

        let mut state = self.state.write().await;
        self.set_counter.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();

        let existing = state.directory.get(key).copied();
        match existing {
            Some(entry) if entry.class == class => {
                // Same class: overwrite in place, the slot does not move.
                // A live entry always points at an installed shard; entry
                // removal and shard retirement happen in the same
                // write-locked operation.
                if let Some(shard) = state.sections[class.index()].shard(entry.shard_index) {
                    shard.set_at(entry.record_index, data);
                }
                if let Some(entry) = state.directory.get_mut(key) {
                    entry.expire_at = resolve_expiration(ttl, Some(entry.expire_at), now);
                }
                self.metrics.set_update.increment();
                Ok(SetOutcome::Updated)
            }
            Some(entry) => {
                // The payload crossed a class boundary: free the old slot
                // and allocate afresh in the target section.
                if let Some(shard) = state.sections[entry.class.index()].shard(entry.shard_index) {
                    shard.free(entry.record_index);
                }
                state.directory.remove(key);
                self.metrics.items_live.decrement();
                self.metrics.set_migrate.increment();
                let expire_at = resolve_expiration(ttl, Some(entry.expire_at), now);
                let outcome = self.insert_new(&mut state, class, key, data, ttl, expire_at)?;
                Ok(match outcome {
                    SetOutcome::Inserted => SetOutcome::Migrated,
                    other => other,
                })
            }
            None => {
                let expire_at = resolve_expiration(ttl, None, now);
                self.insert_new(&mut state, class, key, data, ttl, expire_at)
            }
        }
    }

    /// Place a key that has no slot yet: an active shard with space, else
    /// a freshly opened shard, else the deferred buffer.
    fn insert_new(
        &self,
        state: &mut CacheState,
        class: SizeClass,
        key: &[u8],
        data: &[u8],
        ttl: Ttl,
        expire_at: Instant,
    ) -> Result<SetOutcome, CacheError> {
        let section = &mut state.sections[class.index()];

        let mut target = section.acquire_with_space();
        if target.is_none() {
            if let Some(index) = section.acquire_empty_slot() {
                let shard = Arc::new(Shard::new(section.max_records(), section.record_size()));
                section.install(index, shard);
                self.metrics.shard_install.increment();
                self.metrics.shards_active.increment();
                target = Some(index);
            }
        }

        if let Some(shard_index) = target {
            if let Some(shard) = section.shard(shard_index) {
                if let Some(record_index) = shard.set(data) {
                    state.directory.insert(
                        key,
                        DirEntry {
                            class,
                            shard_index,
                            record_index,
                            expire_at,
                        },
                    );
                    self.metrics.set_insert.increment();
                    self.metrics.items_live.increment();
                    return Ok(SetOutcome::Inserted);
                }
            }
        }

        // Every shard slot of the section is saturated: spill to the
        // deferred buffer and request a GC pass.
        let pending = PendingInsert {
            key: Box::from(key),
            data: Box::from(data),
            ttl,
        };
        match state.deferred.push(pending) {
            Ok(()) => {
                self.gc_requested.store(true, Ordering::Relaxed);
                self.metrics.set_deferred.increment();
                self.metrics.deferred_pending.set(state.deferred.len() as i64);
                Ok(SetOutcome::Deferred)
            }
            Err(_) => {
                self.metrics.set_full_memory.increment();
                Err(CacheError::FullMemory)
            }
        }
    }
}

fn resolve_expiration(ttl: Ttl, existing: Option<Instant>, now: Instant) -> Instant {
    match ttl {
        Ttl::After(duration) => now + duration,
        Ttl::Default => now + DEFAULT_TTL,
        // Keep preserves the stored expiration unconditionally, even one
        // already in the past; readers apply the normal expiration check.
        Ttl::Keep => existing.unwrap_or(now + DEFAULT_TTL),
    }
}

/// Bounded, expiring key/value cache over pre-allocated memory slabs.
///
/// Values are copied into fixed-capacity records that are recycled rather
/// than freed, so steady-state Set/Get traffic does not grow the heap.
/// Cloning the handle is cheap and shares the same cache.
#[derive(Clone)]
pub struct Cache {
    pub(crate) inner: Arc<CacheInner>,
}

impl Cache {
    pub fn builder() -> CacheBuilder {
        CacheBuilder::new()
    }

    /// Insert or update a value
    ///
    /// The payload binds to the smallest section whose record capacity
    /// holds it. Updates within the same section overwrite in place; an
    /// update that crosses a section boundary frees the old slot and
    /// allocates in the new section. When every shard of the target
    /// section is saturated the request is parked in the deferred-insert
    /// buffer and replayed by the next GC pass.
    ///
    /// # Returns
    /// - `Ok(())` if the value was stored or parked for replay
    /// - `Err(DataLimit)` if the payload exceeds the large record size
    /// - `Err(FullMemory)` if the section and the deferred buffer are both full
    pub async fn set(
        &self,
        key: &[u8],
        data: &[u8],
        ttl: impl Into<Ttl>,
    ) -> Result<(), CacheError> {
        self.inner.apply_set(key, data, ttl.into()).await?;
        self.maybe_start_gc();
        Ok(())
    }

    /// Read a value without copying it
    ///
    /// The returned [`ValueGuard`] aliases the record's slab memory and
    /// holds the coordinator's read lock, so writers wait until it drops.
    /// Copy the bytes out before doing anything slow.
    ///
    /// Expired entries read as absent; they are reclaimed by the next GC
    /// pass, not by this call.
    ///
    /// # Returns
    /// - `Ok(guard)` if the key is present and unexpired
    /// - `Err(NotFound)` otherwise
    pub async fn get(&self, key: &[u8]) -> Result<ValueGuard<'_>, CacheError> {
        let state = self.inner.state.read().await;

        let entry = match state.directory.get(key) {
            Some(entry) => *entry,
            None => {
                self.inner.metrics.get_miss.increment();
                return Err(CacheError::NotFound);
            }
        };
        if Instant::now() >= entry.expire_at {
            self.inner.metrics.get_expired.increment();
            return Err(CacheError::NotFound);
        }

        let shard = match state.sections[entry.class.index()].shard(entry.shard_index) {
            Some(shard) => Arc::clone(shard),
            None => {
                self.inner.metrics.get_miss.increment();
                return Err(CacheError::NotFound);
            }
        };
        let (ptr, len) = match shard.value_parts(entry.record_index) {
            Some(parts) => parts,
            None => {
                self.inner.metrics.get_miss.increment();
                return Err(CacheError::NotFound);
            }
        };

        self.inner.metrics.get_hit.increment();
        Ok(ValueGuard {
            _state: state,
            _shard: shard,
            ptr,
            len,
        })
    }

    /// Whether `key` is present and unexpired
    pub async fn exists(&self, key: &[u8]) -> bool {
        let state = self.inner.state.read().await;
        match state.directory.get(key) {
            Some(entry) => Instant::now() < entry.expire_at,
            None => false,
        }
    }

    /// Remove a key
    ///
    /// Frees the record slot and retires the shard if that leaves it empty
    /// (a section always keeps at least one active shard). An expired
    /// entry reads as absent here too and is left for the GC.
    ///
    /// # Returns
    /// - `Ok(())` if the key was removed
    /// - `Err(NotFound)` if it was absent or expired
    pub async fn delete(&self, key: &[u8]) -> Result<(), CacheError> {
        let mut state = self.inner.state.write().await;

        let entry = match state.directory.get(key) {
            Some(entry) => *entry,
            None => {
                self.inner.metrics.delete_not_found.increment();
                return Err(CacheError::NotFound);
            }
        };
        if Instant::now() >= entry.expire_at {
            self.inner.metrics.delete_not_found.increment();
            return Err(CacheError::NotFound);
        }

        state.directory.remove(key);
        let section = &mut state.sections[entry.class.index()];
        if let Some(shard) = section.shard(entry.shard_index) {
            shard.free(entry.record_index);
        }
        if section.retire(entry.shard_index) {
            self.inner.metrics.shard_retire.increment();
            self.inner.metrics.shards_active.decrement();
        }

        self.inner.metrics.delete_ok.increment();
        self.inner.metrics.items_live.decrement();
        Ok(())
    }

    /// Number of live directory entries (expired-but-uncollected included)
    pub async fn len(&self) -> usize {
        self.inner.state.read().await.directory.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Access this cache's metrics
    pub fn metrics(&self) -> &CacheMetrics {
        &self.inner.metrics
    }

    /// Spawn a GC pass when the Set counter has run down or a spill
    /// requested one. Called after the coordinator lock is released; the
    /// pass re-acquires it on its own task.
    fn maybe_start_gc(&self) {
        let inner = &self.inner;
        let counter_due = inner.set_counter.load(Ordering::Relaxed) >= inner.gc_starter;
        if counter_due {
            inner.set_counter.store(0, Ordering::Relaxed);
        }
        let requested = inner.gc_requested.swap(false, Ordering::Relaxed);
        if counter_due || requested {
            tokio::spawn(gc::run(Arc::clone(inner)));
        }
    }
}

/// A zero-copy view of a stored value.
///
/// The guard aliases the record's pre-allocated buffer. It holds the
/// coordinator's read lock for its lifetime, which is what keeps the slot
/// from being overwritten, freed, or retired underneath it. Drop the guard
/// promptly; every Set, Delete, and GC pass waits on it.
pub struct ValueGuard<'a> {
    _state: RwLockReadGuard<'a, CacheState>,
    _shard: Arc<Shard>,
    ptr: *const u8,
    len: usize,
}

impl ValueGuard<'_> {
    /// The stored bytes
    pub fn value(&self) -> &[u8] {
        // SAFETY: `ptr`/`len` were captured from the record under the
        // shard lock, `_shard` keeps the record's buffer allocated, and
        // every slot mutation path first takes the coordinator write
        // lock, which `_state` blocks for as long as this guard lives.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// SAFETY: the pointer targets heap memory owned by `_shard` (Send + Sync),
// access through the guard is read-only, and the lock guard it carries is
// Send + Sync for the Send + Sync `CacheState`.
unsafe impl Send for ValueGuard<'_> {}
unsafe impl Sync for ValueGuard<'_> {}
