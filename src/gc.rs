//! Garbage collection and deferred-insert replay
//!
//! A pass runs as a spawned task, never inline in a Set. Under the
//! coordinator's write lock it sweeps expired directory entries, freeing
//! their record slots and retiring shards the sweep empties (a section
//! always keeps one active shard), then snapshots and clears the
//! deferred-insert buffer. The lock is released before the snapshot is
//! replayed through the Set path, one item at a time in enqueue order.
//!
//! The pass is best-effort: the first replay error drops the remainder of
//! the snapshot, and nothing is retried. A replay that finds memory still
//! saturated parks the item in the buffer again and re-arms the
//! collect-garbage flag for the next Set; the pass never spawns a
//! follow-up itself.

use std::collections::VecDeque;
use std::sync::Arc;

use clocksource::precise::Instant;

use crate::Ttl;
use crate::cache::{CacheInner, CacheState};

/// A Set that arrived while every shard of its section was saturated,
/// parked until a pass frees space.
#[derive(Debug)]
pub(crate) struct PendingInsert {
    pub(crate) key: Box<[u8]>,
    pub(crate) data: Box<[u8]>,
    pub(crate) ttl: Ttl,
}

/// Bounded FIFO of pending inserts. Lives inside the coordinator-locked
/// state; overflow surfaces to the caller as `FullMemory`.
pub(crate) struct DeferredBuffer {
    pending: VecDeque<PendingInsert>,
    capacity: usize,
}

impl DeferredBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            capacity,
        }
    }

    /// Park an insert, or hand it back when the buffer is at capacity.
    pub(crate) fn push(&mut self, insert: PendingInsert) -> Result<(), PendingInsert> {
        if self.pending.len() >= self.capacity {
            return Err(insert);
        }
        self.pending.push_back(insert);
        Ok(())
    }

    /// Take the whole buffer, leaving it empty.
    pub(crate) fn drain(&mut self) -> Vec<PendingInsert> {
        self.pending.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// One full GC pass: expiration sweep, shard retirement, buffer replay.
pub(crate) async fn run(inner: Arc<CacheInner>) {
    inner.metrics.gc_runs.increment();

    let drained = {
        let mut state = inner.state.write().await;
        let now = Instant::now();
        let CacheState {
            directory,
            sections,
            deferred,
        } = &mut *state;

        directory.retain(|_key, entry| {
            if now <= entry.expire_at {
                return true;
            }
            let section = &mut sections[entry.class.index()];
            if let Some(shard) = section.shard(entry.shard_index) {
                shard.free(entry.record_index);
            }
            if section.active_shards() > 1 && section.retire(entry.shard_index) {
                inner.metrics.shard_retire.increment();
                inner.metrics.shards_active.decrement();
            }
            inner.metrics.gc_expired.increment();
            inner.metrics.items_live.decrement();
            false
        });

        let drained = deferred.drain();
        inner.metrics.deferred_pending.set(deferred.len() as i64);
        drained
        // Write lock drops here; the replay below re-acquires it per item.
    };

    let total = drained.len();
    let mut replayed = 0usize;
    for pending in drained {
        if inner
            .apply_set(&pending.key, &pending.data, pending.ttl)
            .await
            .is_err()
        {
            break;
        }
        replayed += 1;
        inner.metrics.gc_replayed.increment();
    }
    if replayed < total {
        inner.metrics.gc_replay_dropped.add((total - replayed) as u64);
    }
}
