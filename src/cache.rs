//! Three-tier in-memory block cache.
//!
//! Permanent entries are pinned; transient entries live under a strict LRU
//! bounded by entry count and encoded-byte total; dirty entries are keyed by
//! `(block id, ref nonce, branch)` and are invisible to the LRU. Permanent
//! bytes charge the byte budget so large pins starve transient admission
//! instead of overshooting it, but permanent entries are never evicted.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::trace;

use crate::config::CacheConfig;
use crate::core::block::{Block, BlockId, BlockPointer, ContentHash, FileBlock, RefNonce};
use crate::core::identity::{Branch, TlfId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("block {0} not in cache")]
    NoSuchBlock(BlockId),
}

/// How long a clean entry should survive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheLifetime {
    Transient,
    Permanent,
}

type DirtyKey = (BlockId, RefNonce, Branch);

struct TransientEntry {
    block: Arc<Block>,
    tlf: TlfId,
    size: u64,
    tick: u64,
}

#[derive(Default)]
struct Inner {
    transient: HashMap<BlockId, TransientEntry>,
    /// Access order: tick -> id. Ticks are unique, so LRU ties cannot occur;
    /// insertion order is the natural tiebreak.
    lru: BTreeMap<u64, BlockId>,
    permanent: HashMap<BlockId, (Arc<Block>, u64)>,
    dirty: HashMap<DirtyKey, Arc<Block>>,
    dedup: HashMap<(TlfId, ContentHash), BlockPointer>,
    transient_bytes: u64,
    permanent_bytes: u64,
    tick: u64,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove_transient(&mut self, id: &BlockId) -> Option<TransientEntry> {
        let entry = self.transient.remove(id)?;
        self.lru.remove(&entry.tick);
        self.transient_bytes -= entry.size;
        if let Block::File(fb) = entry.block.as_ref() {
            if let Some(hash) = fb.content_hash() {
                self.dedup.remove(&(entry.tlf, hash));
            }
        }
        Some(entry)
    }

    fn evict_lru(&mut self) -> bool {
        let Some((_, id)) = self.lru.iter().next().map(|(t, id)| (*t, *id)) else {
            return false;
        };
        trace!(block = %id, "evicting transient block");
        self.remove_transient(&id);
        true
    }
}

/// Shared block cache for every folder on this device.
pub struct BlockCache {
    inner: Mutex<Inner>,
    capacity: usize,
    bytes_capacity: u64,
}

impl BlockCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_bounds(config.capacity, config.bytes_capacity)
    }

    pub fn with_bounds(capacity: usize, bytes_capacity: u64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
            bytes_capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Insert a clean block.
    ///
    /// A transient put evicts LRU transients until both bounds hold; if the
    /// block still cannot fit (its size exceeds what the byte budget leaves
    /// after permanent pins) every transient is gone and the block is not
    /// admitted. A permanent put always succeeds.
    pub fn put(&self, ptr: &BlockPointer, tlf: TlfId, block: Block, lifetime: CacheLifetime) {
        let size = block.cache_size();
        let block = Arc::new(block);
        let mut inner = self.lock();
        match lifetime {
            CacheLifetime::Permanent => {
                if let Some((_, old_size)) = inner.permanent.insert(ptr.id, (block, size)) {
                    inner.permanent_bytes -= old_size;
                }
                inner.permanent_bytes += size;
            }
            CacheLifetime::Transient => {
                inner.remove_transient(&ptr.id);
                while !inner.transient.is_empty()
                    && (inner.transient.len() >= self.capacity
                        || inner.transient_bytes + inner.permanent_bytes + size
                            > self.bytes_capacity)
                {
                    inner.evict_lru();
                }
                let fits = inner.transient.len() < self.capacity
                    && inner.transient_bytes + inner.permanent_bytes + size <= self.bytes_capacity;
                if !fits {
                    trace!(block = %ptr.id, size, "transient block not admitted");
                    return;
                }
                if let Block::File(fb) = block.as_ref() {
                    if let Some(hash) = fb.content_hash() {
                        inner.dedup.insert((tlf, hash), ptr.clone());
                    }
                }
                let tick = inner.next_tick();
                inner.transient.insert(
                    ptr.id,
                    TransientEntry {
                        block,
                        tlf,
                        size,
                        tick,
                    },
                );
                inner.lru.insert(tick, ptr.id);
                inner.transient_bytes += size;
            }
        }
    }

    /// Insert an uncommitted block under `(pointer, branch)`.
    ///
    /// Dirty entries ignore the size bounds and never evict. Two dirty
    /// entries for one block id coexist when their `(nonce, branch)` differ.
    pub fn put_dirty(&self, ptr: &BlockPointer, branch: Branch, block: Block) {
        let mut inner = self.lock();
        inner
            .dirty
            .insert((ptr.id, ptr.ref_nonce(), branch), Arc::new(block));
    }

    /// Fetch a block: the dirty entry for `(ptr, branch)` wins, then clean
    /// transient, then permanent.
    pub fn get(&self, ptr: &BlockPointer, branch: Branch) -> Result<Arc<Block>, CacheError> {
        let mut inner = self.lock();
        if let Some(block) = inner.dirty.get(&(ptr.id, ptr.ref_nonce(), branch)) {
            return Ok(Arc::clone(block));
        }
        if let Some(entry) = inner.transient.get(&ptr.id) {
            let block = Arc::clone(&entry.block);
            let old_tick = entry.tick;
            let tick = inner.next_tick();
            inner.lru.remove(&old_tick);
            inner.lru.insert(tick, ptr.id);
            if let Some(entry) = inner.transient.get_mut(&ptr.id) {
                entry.tick = tick;
            }
            return Ok(block);
        }
        if let Some((block, _)) = inner.permanent.get(&ptr.id) {
            return Ok(Arc::clone(block));
        }
        Err(CacheError::NoSuchBlock(ptr.id))
    }

    /// Dirty status is per `(id, nonce, branch)`; a clean-only block reports
    /// false even when a sibling nonce or branch has a dirty entry.
    pub fn is_dirty(&self, ptr: &BlockPointer, branch: Branch) -> bool {
        self.lock()
            .dirty
            .contains_key(&(ptr.id, ptr.ref_nonce(), branch))
    }

    /// Content-dedup probe. Only transient puts feed the index, so a block
    /// that was only ever pinned permanent reports the zero pointer.
    pub fn check_for_known_ptr(&self, tlf: TlfId, block: &FileBlock) -> BlockPointer {
        let Some(hash) = block.content_hash() else {
            return BlockPointer::default();
        };
        self.lock()
            .dedup
            .get(&(tlf, hash))
            .cloned()
            .unwrap_or_default()
    }

    /// Remove a transient entry and its dedup index entry; no-op if absent.
    pub fn delete_transient(&self, ptr: &BlockPointer, _tlf: TlfId) {
        self.lock().remove_transient(&ptr.id);
    }

    /// Remove a permanent entry by id, whatever nonce put it there.
    pub fn delete_permanent(&self, id: BlockId) {
        let mut inner = self.lock();
        if let Some((_, size)) = inner.permanent.remove(&id) {
            inner.permanent_bytes -= size;
        }
    }

    /// Remove one dirty entry.
    pub fn delete_dirty(&self, ptr: &BlockPointer, branch: Branch) {
        self.lock()
            .dirty
            .remove(&(ptr.id, ptr.ref_nonce(), branch));
    }

    /// Drop every dirty entry belonging to one branch (abort path).
    pub fn drop_dirty_branch(&self, branch: Branch) {
        self.lock().dirty.retain(|(_, _, b), _| *b != branch);
    }

    #[cfg(test)]
    fn transient_bytes(&self) -> u64 {
        self.lock().transient_bytes
    }
}
