//! Code cache: compiled units indexed by physical address.
//!
//! A physical address splits into a pool index (everything above bit 8) and a slot (bits 2-7).
//! Pools cover 256 bytes, live in an arena and are created on first touch. Dropping
//! a pool hands every unit in it back to the backend and nulls the table entry, so the next
//! lookup anywhere in the range misses.

use tracing::{debug, trace, warn};

use crate::backend::{BlockId, BlockRelease};

pub const POOL_SHIFT: u32 = 8;
pub const POOL_SIZE: u32 = 1 << POOL_SHIFT;
pub const POOL_SLOTS: usize = (POOL_SIZE / 4) as usize;

/// Which unit for an address. `Boundary` units start at a pool's first instruction and finish a
/// branch whose delay slot didn't fit in the previous unit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Normal,
    Boundary,
}

/// What to do when the pool arena runs out of space
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ArenaPolicy {
    /// Double the arena up to its limit, then flush
    #[default]
    Grow,
    /// Drop every pool (releasing their units) and start over
    FlushAll,
    /// Report the error and let the caller halt
    Fail,
}

#[derive(Debug, thiserror::Error, Copy, Clone, PartialEq, Eq)]
pub enum ArenaError {
    #[error("pool arena exhausted ({capacity} pools)")]
    Exhausted { capacity: usize },
}

#[derive(Debug, thiserror::Error, Copy, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("physical address {0:#010x} is outside the cached range")]
    AddressOutOfRange(u32),
    #[error(transparent)]
    ArenaExhausted(#[from] ArenaError),
}

struct Pool {
    slots: [Option<BlockId>; POOL_SLOTS],
    boundary_entry: Option<BlockId>,
    /// Back-reference into the pool table
    table_index: u32,
}

/// Pool storage. Dropped pools go on a free list and get handed out again before the arena
/// appends. `reset` may only be called once no table entry refers into the arena.
pub struct PoolArena {
    pools: Vec<Pool>,
    free: Vec<PoolHandle>,
    capacity: usize,
}

/// Handle 0 means "no pool"
type PoolHandle = u32;

impl PoolArena {
    pub fn new(capacity: usize) -> PoolArena {
        PoolArena {
            pools: Vec::new(),
            free: Vec::new(),
            capacity,
        }
    }

    fn alloc(&mut self, table_index: u32) -> Result<PoolHandle, ArenaError> {
        if let Some(handle) = self.free.pop() {
            let pool = self.get_mut(handle);
            debug_assert!(pool.slots.iter().all(Option::is_none) && pool.boundary_entry.is_none());
            pool.table_index = table_index;
            return Ok(handle);
        }
        if self.pools.len() >= self.capacity {
            return Err(ArenaError::Exhausted { capacity: self.capacity });
        }
        self.pools.push(Pool {
            slots: [None; POOL_SLOTS],
            boundary_entry: None,
            table_index,
        });
        Ok(self.pools.len() as PoolHandle)
    }

    #[inline(always)]
    fn get(&self, handle: PoolHandle) -> &Pool {
        &self.pools[handle as usize - 1]
    }

    #[inline(always)]
    fn get_mut(&mut self, handle: PoolHandle) -> &mut Pool {
        &mut self.pools[handle as usize - 1]
    }

    pub fn grow(&mut self, capacity: usize) {
        self.capacity = self.capacity.max(capacity);
    }

    /// Takes back a pool whose units have all been released.
    fn free(&mut self, handle: PoolHandle) {
        self.free.push(handle);
    }

    fn reset(&mut self) {
        self.pools.clear();
        self.free.clear();
    }

    /// Pools in use
    pub fn len(&self) -> usize {
        self.pools.len() - self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub pools_created: u64,
    pub pools_invalidated: u64,
    pub units_released: u64,
    pub arena_grows: u64,
    pub arena_flushes: u64,
}

pub struct CodeCache {
    table: Vec<PoolHandle>,
    arena: PoolArena,
    policy: ArenaPolicy,
    max_pools: usize,
    stats: CacheStats,
}

impl CodeCache {
    /// Covers physical addresses below `1 << phys_addr_bits`.
    pub fn new(phys_addr_bits: u32, arena_pools: usize, policy: ArenaPolicy, max_pools: usize) -> CodeCache {
        assert!((POOL_SHIFT..=32).contains(&phys_addr_bits));
        CodeCache {
            table: vec![0; 1 << (phys_addr_bits - POOL_SHIFT)],
            arena: PoolArena::new(arena_pools),
            policy,
            max_pools: max_pools.max(arena_pools),
            stats: CacheStats::default(),
        }
    }

    #[inline(always)]
    fn split(&self, paddr: u32) -> Result<(usize, usize), CacheError> {
        let index = (paddr >> POOL_SHIFT) as usize;
        if index >= self.table.len() {
            return Err(CacheError::AddressOutOfRange(paddr));
        }
        Ok((index, ((paddr & (POOL_SIZE - 1)) >> 2) as usize))
    }

    pub fn lookup(&self, paddr: u32, kind: EntryKind) -> Option<BlockId> {
        let (index, slot) = self.split(paddr).ok()?;
        match self.table[index] {
            0 => None,
            handle => {
                let pool = self.arena.get(handle);
                match kind {
                    EntryKind::Normal => pool.slots[slot],
                    EntryKind::Boundary => pool.boundary_entry,
                }
            }
        }
    }

    /// The slot for `paddr`, creating its pool if needed. Exhausting the arena may flush the whole
    /// cache, depending on the policy, so units get released through `release`.
    pub fn lookup_or_create(
        &mut self,
        paddr: u32,
        kind: EntryKind,
        release: &mut dyn BlockRelease,
    ) -> Result<&mut Option<BlockId>, CacheError> {
        let (index, slot) = self.split(paddr)?;
        debug_assert!(kind == EntryKind::Normal || slot == 0, "boundary entry at {:#010x}", paddr);

        if self.table[index] == 0 {
            let handle = self.alloc_pool(index as u32, release)?;
            self.table[index] = handle;
            self.stats.pools_created += 1;
            trace!("new pool for {:#010x}", paddr & !(POOL_SIZE - 1));
        }

        let pool = self.arena.get_mut(self.table[index]);
        Ok(match kind {
            EntryKind::Normal => &mut pool.slots[slot],
            EntryKind::Boundary => &mut pool.boundary_entry,
        })
    }

    fn alloc_pool(&mut self, table_index: u32, release: &mut dyn BlockRelease) -> Result<PoolHandle, CacheError> {
        let err = match self.arena.alloc(table_index) {
            Ok(handle) => return Ok(handle),
            Err(err) => err,
        };

        match self.policy {
            ArenaPolicy::Fail => return Err(err.into()),
            ArenaPolicy::Grow if self.arena.capacity() < self.max_pools => {
                let capacity = (self.arena.capacity() * 2).max(1).min(self.max_pools);
                debug!("growing pool arena from {} to {} pools", self.arena.capacity(), capacity);
                self.arena.grow(capacity);
                self.stats.arena_grows += 1;
            }
            ArenaPolicy::Grow | ArenaPolicy::FlushAll => {
                warn!("pool arena full at {} pools, flushing the code cache", self.arena.capacity());
                self.flush(release);
                self.stats.arena_flushes += 1;
            }
        }

        Ok(self.arena.alloc(table_index)?)
    }

    /// Drops one unit, leaving the rest of its pool alone.
    pub fn invalidate_block(&mut self, paddr: u32, kind: EntryKind, release: &mut dyn BlockRelease) -> bool {
        let Ok((index, slot)) = self.split(paddr) else {
            return false;
        };
        if self.table[index] == 0 {
            return false;
        }
        let pool = self.arena.get_mut(self.table[index]);
        let entry = match kind {
            EntryKind::Normal => &mut pool.slots[slot],
            EntryKind::Boundary => &mut pool.boundary_entry,
        };
        match entry.take() {
            Some(block) => {
                release.release(block);
                self.stats.units_released += 1;
                true
            }
            None => false,
        }
    }

    fn invalidate_pool(&mut self, index: usize, release: &mut dyn BlockRelease) -> usize {
        let handle = std::mem::replace(&mut self.table[index], 0);
        if handle == 0 {
            return 0;
        }

        let pool = self.arena.get_mut(handle);
        let mut released = 0;
        for block in pool.slots.iter_mut().chain(std::iter::once(&mut pool.boundary_entry)) {
            if let Some(block) = block.take() {
                release.release(block);
                released += 1;
            }
        }

        self.arena.free(handle);

        trace!("dropped pool {:#010x}, {} units", (index as u32) << POOL_SHIFT, released);
        self.stats.pools_invalidated += 1;
        self.stats.units_released += released as u64;
        released
    }

    /// Drops the pool containing `paddr`. Returns the number of units released.
    pub fn invalidate(&mut self, paddr: u32, release: &mut dyn BlockRelease) -> usize {
        match self.split(paddr) {
            Ok((index, _)) => self.invalidate_pool(index, release),
            Err(_) => 0,
        }
    }

    /// Drops every pool overlapping `lo..hi`.
    pub fn invalidate_range(&mut self, lo: u32, hi: u32, release: &mut dyn BlockRelease) -> usize {
        if hi <= lo {
            return 0;
        }
        let first = (lo >> POOL_SHIFT) as usize;
        let last = ((hi - 1) >> POOL_SHIFT) as usize;

        let mut released = 0;
        for index in first..=last {
            if index < self.table.len() {
                released += self.invalidate_pool(index, release);
            }
        }
        if released > 0 {
            debug!("invalidated {:#010x}..{:#010x}, {} units released", lo, hi, released);
        }
        released
    }

    /// Memory write hook: a store of `len` bytes at `paddr` just happened.
    #[inline(always)]
    pub fn notify_write(&mut self, paddr: u32, len: u32, release: &mut dyn BlockRelease) {
        let first = (paddr >> POOL_SHIFT) as usize;
        let last = (paddr.saturating_add(len.max(1) - 1) >> POOL_SHIFT) as usize;
        // PERF: almost every store lands in a pool with no code
        let touched = (first..=last).any(|index| self.table.get(index).map_or(false, |h| *h != 0));
        if touched {
            self.invalidate_range(paddr, paddr.saturating_add(len), release);
        }
    }

    /// Drops every pool and only then reclaims the arena.
    pub fn flush(&mut self, release: &mut dyn BlockRelease) {
        // Free pools keep a stale index, invalidating it again is harmless
        let indices: Vec<u32> = self.arena.pools.iter().map(|pool| pool.table_index).collect();
        let mut released = 0;
        for index in indices {
            released += self.invalidate_pool(index as usize, release);
        }
        debug_assert!(self.table.iter().all(|handle| *handle == 0));
        self.arena.reset();
        debug!("code cache flushed, {} units released", released);
    }

    /// Pools currently reachable from the table
    pub fn live_pools(&self) -> usize {
        self.arena.len()
    }

    pub fn arena(&self) -> &PoolArena {
        &self.arena
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ThreadedBackend, ThreadedEmitter, CodeEmitter};

    fn unit(backend: &mut ThreadedBackend) -> BlockId {
        let mut e = ThreadedEmitter::new();
        e.ret();
        backend.install(e.finish(0, 0).unwrap()).unwrap()
    }

    fn cache(policy: ArenaPolicy, pools: usize, max: usize) -> CodeCache {
        CodeCache::new(20, pools, policy, max)
    }

    #[test]
    fn lookup_is_idempotent() {
        let mut backend = ThreadedBackend::new(1000);
        let mut released = Vec::new();
        let mut cache = cache(ArenaPolicy::Fail, 16, 16);

        assert_eq!(cache.lookup(0x1040, EntryKind::Normal), None);
        let block = unit(&mut backend);
        *cache.lookup_or_create(0x1040, EntryKind::Normal, &mut released).unwrap() = Some(block);

        assert_eq!(cache.lookup(0x1040, EntryKind::Normal), Some(block));
        assert_eq!(*cache.lookup_or_create(0x1040, EntryKind::Normal, &mut released).unwrap(), Some(block));
        // Same pool, different slot
        assert_eq!(cache.lookup(0x1044, EntryKind::Normal), None);
        assert_eq!(cache.lookup(0x1000, EntryKind::Boundary), None);
        assert_eq!(cache.stats().pools_created, 1);
    }

    #[test]
    fn invalidate_range_spanning_three_pools() {
        let mut backend = ThreadedBackend::new(1000);
        let mut released = Vec::new();
        let mut cache = cache(ArenaPolicy::Fail, 16, 16);

        let mut blocks = Vec::new();
        for pool in 0..5u32 {
            let addr = 0x2000 + pool * POOL_SIZE;
            for offset in [0, 0x40, 0xfc] {
                let block = unit(&mut backend);
                *cache.lookup_or_create(addr + offset, EntryKind::Normal, &mut released).unwrap() = Some(block);
                blocks.push((addr + offset, block));
            }
        }
        let boundary = unit(&mut backend);
        *cache.lookup_or_create(0x2200, EntryKind::Boundary, &mut released).unwrap() = Some(boundary);

        // Pools 1..=3, from the middle of the first to the middle of the last
        let count = cache.invalidate_range(0x2180, 0x2384, &mut released);
        assert_eq!(count, 10);
        assert_eq!(released.len(), 10);
        assert!(released.contains(&boundary));

        for (addr, block) in blocks {
            let pool = (addr - 0x2000) / POOL_SIZE;
            if (1..=3).contains(&pool) {
                assert!(released.contains(&block));
                assert_eq!(cache.lookup(addr, EntryKind::Normal), None);
            } else {
                assert!(!released.contains(&block));
                assert_eq!(cache.lookup(addr, EntryKind::Normal), Some(block));
            }
        }
        assert_eq!(cache.live_pools(), 2);
    }

    #[test]
    fn single_unit_and_write_notification() {
        let mut backend = ThreadedBackend::new(1000);
        let mut released = Vec::new();
        let mut cache = cache(ArenaPolicy::Fail, 16, 16);
        let a = unit(&mut backend);
        let b = unit(&mut backend);
        *cache.lookup_or_create(0x100, EntryKind::Normal, &mut released).unwrap() = Some(a);
        *cache.lookup_or_create(0x104, EntryKind::Normal, &mut released).unwrap() = Some(b);

        assert!(cache.invalidate_block(0x100, EntryKind::Normal, &mut released));
        assert!(!cache.invalidate_block(0x100, EntryKind::Normal, &mut released));
        assert_eq!(cache.lookup(0x104, EntryKind::Normal), Some(b));

        // Stores outside any pool don't release anything
        cache.notify_write(0x400, 4, &mut released);
        assert_eq!(released, vec![a]);

        // An 8 byte store straddling into the pool
        cache.notify_write(0xfc, 8, &mut released);
        assert_eq!(released, vec![a, b]);
        assert_eq!(cache.lookup(0x104, EntryKind::Normal), None);
    }

    #[test]
    fn out_of_range() {
        let mut cache = cache(ArenaPolicy::Fail, 16, 16);
        let mut released = Vec::new();
        assert_eq!(cache.lookup(1 << 20, EntryKind::Normal), None);
        assert_eq!(
            cache.lookup_or_create(1 << 20, EntryKind::Normal, &mut released).err(),
            Some(CacheError::AddressOutOfRange(1 << 20))
        );
        assert_eq!(cache.invalidate(1 << 20, &mut released), 0);
    }

    #[test]
    fn fail_policy_reports_exhaustion() {
        let mut cache = cache(ArenaPolicy::Fail, 2, 2);
        let mut released = Vec::new();
        cache.lookup_or_create(0x000, EntryKind::Normal, &mut released).unwrap();
        cache.lookup_or_create(0x100, EntryKind::Normal, &mut released).unwrap();
        assert_eq!(
            cache.lookup_or_create(0x200, EntryKind::Normal, &mut released).err(),
            Some(CacheError::ArenaExhausted(ArenaError::Exhausted { capacity: 2 }))
        );
        // Existing pools are untouched
        assert!(cache.lookup_or_create(0x104, EntryKind::Normal, &mut released).is_ok());
    }

    #[test]
    fn grow_then_flush() {
        let mut backend = ThreadedBackend::new(1000);
        let mut released = Vec::new();
        let mut cache = cache(ArenaPolicy::Grow, 1, 4);

        for pool in 0..4u32 {
            let block = unit(&mut backend);
            *cache.lookup_or_create(pool * POOL_SIZE, EntryKind::Normal, &mut released).unwrap() = Some(block);
        }
        assert_eq!(cache.arena().capacity(), 4);
        assert_eq!(cache.stats().arena_grows, 2);
        assert!(released.is_empty());

        // At the limit: everything goes, in order, before the arena is reused
        cache.lookup_or_create(4 * POOL_SIZE, EntryKind::Normal, &mut released).unwrap();
        assert_eq!(released.len(), 4);
        assert_eq!(cache.stats().arena_flushes, 1);
        assert_eq!(cache.arena().len(), 1);
        for pool in 0..4u32 {
            assert_eq!(cache.lookup(pool * POOL_SIZE, EntryKind::Normal), None);
        }
    }

    #[test]
    fn flush_all_policy() {
        let mut backend = ThreadedBackend::new(1000);
        let mut released = Vec::new();
        let mut cache = cache(ArenaPolicy::FlushAll, 2, 64);

        let a = unit(&mut backend);
        *cache.lookup_or_create(0x000, EntryKind::Normal, &mut released).unwrap() = Some(a);
        let b = unit(&mut backend);
        *cache.lookup_or_create(0x100, EntryKind::Boundary, &mut released).unwrap() = Some(b);

        cache.lookup_or_create(0x200, EntryKind::Normal, &mut released).unwrap();
        assert_eq!(released, vec![a, b]);
        assert_eq!(cache.arena().capacity(), 2);
        assert_eq!(cache.live_pools(), 1);
    }

    #[test]
    fn reinvalidated_pool_misses_once() {
        let mut backend = ThreadedBackend::new(1000);
        let mut released = Vec::new();
        let mut cache = cache(ArenaPolicy::Fail, 16, 16);
        let a = unit(&mut backend);
        *cache.lookup_or_create(0x300, EntryKind::Normal, &mut released).unwrap() = Some(a);
        assert_eq!(cache.invalidate(0x3f0, &mut released), 1);
        assert_eq!(cache.lookup(0x300, EntryKind::Normal), None);

        let b = unit(&mut backend);
        *cache.lookup_or_create(0x300, EntryKind::Normal, &mut released).unwrap() = Some(b);
        assert_eq!(cache.lookup(0x300, EntryKind::Normal), Some(b));
        assert_eq!(cache.live_pools(), 1);
    }

    #[test]
    fn dropped_pools_are_reused() {
        let mut backend = ThreadedBackend::new(1000);
        let mut released = Vec::new();
        let mut cache = cache(ArenaPolicy::Fail, 2, 2);
        let other = unit(&mut backend);
        *cache.lookup_or_create(0x800, EntryKind::Normal, &mut released).unwrap() = Some(other);

        // Code that keeps overwriting itself: one live pool, recreated far more often than the
        // arena has room for
        for _ in 0..10 {
            let block = unit(&mut backend);
            *cache.lookup_or_create(0x300, EntryKind::Normal, &mut released).unwrap() = Some(block);
            cache.notify_write(0x380, 4, &mut released);
        }
        assert_eq!(cache.stats().pools_invalidated, 10);
        assert_eq!(cache.stats().arena_flushes, 0);
        assert_eq!(cache.live_pools(), 1);

        // The reused pool starts out empty
        cache.lookup_or_create(0x300, EntryKind::Normal, &mut released).unwrap();
        assert_eq!(cache.lookup(0x300, EntryKind::Normal), None);
        assert_eq!(cache.lookup(0x800, EntryKind::Normal), Some(other));
        assert_eq!(cache.live_pools(), 2);
    }
}
