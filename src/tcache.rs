//! Per-thread state: the most-recently-used zone cache and the
//! deferred-free quarantine.
//!
//! Both live in `thread_local!` storage and are never visible to another
//! thread. A dying thread leaks at most its cached zone references (safe,
//! the zones live in the root registry) and its pending frees (the
//! quarantine is a best-effort delay, not a durability guarantee).

use std::cell::RefCell;

use crate::isoheap::heap;
use crate::util::constants::*;
use crate::util::Address;

#[derive(Debug, Copy, Clone)]
pub struct ZoneCacheEntry {
    pub index: u16,
    pub chunk_size: usize,
}

pub struct ThreadCache {
    zone_cache: [ZoneCacheEntry; ZONE_CACHE_SZ],
    zone_cache_count: usize,
    zone_cache_cursor: usize,
    chunk_quarantine: [usize; CHUNK_QUARANTINE_SZ],
    chunk_quarantine_count: usize,
}

thread_local! {
    static TCACHE: RefCell<ThreadCache> = RefCell::new(ThreadCache::new());
}

/// Run `f` with the calling thread's cache.
pub fn with<R>(f: impl FnOnce(&mut ThreadCache) -> R) -> R {
    TCACHE.with(|tc| f(&mut tc.borrow_mut()))
}

impl ThreadCache {
    fn new() -> ThreadCache {
        ThreadCache {
            zone_cache: [ZoneCacheEntry {
                index: 0,
                chunk_size: 0,
            }; ZONE_CACHE_SZ],
            zone_cache_count: 0,
            zone_cache_cursor: 0,
            chunk_quarantine: [0; CHUNK_QUARANTINE_SZ],
            chunk_quarantine_count: 0,
        }
    }

    /// The currently cached zones, most of the time the ones this thread
    /// freed into last.
    pub fn zone_entries(&self) -> &[ZoneCacheEntry] {
        &self.zone_cache[..self.zone_cache_count]
    }

    /// Remember a zone this thread just touched. Once the cache is full,
    /// the oldest entry is overwritten.
    pub fn cache_zone(&mut self, index: u16, chunk_size: usize) {
        if self
            .zone_entries()
            .iter()
            .any(|e| e.index == index && e.chunk_size == chunk_size)
        {
            return;
        }
        let pos = if self.zone_cache_count < ZONE_CACHE_SZ {
            let pos = self.zone_cache_count;
            self.zone_cache_count += 1;
            pos
        } else {
            let pos = self.zone_cache_cursor;
            self.zone_cache_cursor = (pos + 1) % ZONE_CACHE_SZ;
            pos
        };
        self.zone_cache[pos] = ZoneCacheEntry { index, chunk_size };
    }

    pub fn clear_zone_cache(&mut self) {
        self.zone_cache_count = 0;
        self.zone_cache_cursor = 0;
    }

    pub fn quarantine_is_full(&self) -> bool {
        self.chunk_quarantine_count == CHUNK_QUARANTINE_SZ
    }

    pub fn quarantine_push(&mut self, p: Address) {
        debug_assert!(!self.quarantine_is_full());
        self.chunk_quarantine[self.chunk_quarantine_count] = p.as_usize();
        self.chunk_quarantine_count += 1;
    }

    fn take_quarantine(&mut self) -> ([usize; CHUNK_QUARANTINE_SZ], usize) {
        let entries = self.chunk_quarantine;
        let count = self.chunk_quarantine_count;
        self.chunk_quarantine_count = 0;
        (entries, count)
    }
}

/// Drain the calling thread's quarantine: every pending pointer is
/// resolved and actually freed.
///
/// Small-zone entries are batch-freed under the root lock. Entries that
/// belong to no small zone are handed to the big-zone list afterwards,
/// under only the big-zone lock; nesting the two is reserved for the
/// full-heap verifier.
pub fn drain(tc: &mut ThreadCache) {
    if tc.chunk_quarantine_count == 0 {
        return;
    }
    let (entries, count) = tc.take_quarantine();
    let mut leftovers = [0usize; CHUNK_QUARANTINE_SZ];
    let mut leftover_count = 0;
    {
        let root = heap().lock_root();
        #[cfg(feature = "fuzz_mode")]
        root.verify_all_zones();
        for &raw in &entries[..count] {
            let p = unsafe { Address::from_usize(raw) };
            match root.locate_small(Some(&*tc), p) {
                Some(index) => root.free_small(tc, index, p, false),
                None => {
                    leftovers[leftover_count] = raw;
                    leftover_count += 1;
                }
            }
        }
    }
    if leftover_count > 0 {
        let big = heap().lock_big();
        for &raw in &leftovers[..leftover_count] {
            let p = unsafe { Address::from_usize(raw) };
            if !big.free(p, false) {
                fatal!("free of {} which no zone owns", p);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_cache_rotates() {
        let mut tc = ThreadCache::new();
        for i in 0..ZONE_CACHE_SZ {
            tc.cache_zone(i as u16, 64);
        }
        assert_eq!(tc.zone_entries().len(), ZONE_CACHE_SZ);

        // A known zone is not duplicated.
        tc.cache_zone(0, 64);
        assert_eq!(tc.zone_entries().len(), ZONE_CACHE_SZ);

        // A new zone overwrites the oldest entry.
        tc.cache_zone(100, 128);
        assert_eq!(tc.zone_entries()[0].index, 100);
        assert_eq!(tc.zone_entries().len(), ZONE_CACHE_SZ);
    }

    #[test]
    fn quarantine_fills() {
        let mut tc = ThreadCache::new();
        for i in 0..CHUNK_QUARANTINE_SZ {
            assert!(!tc.quarantine_is_full());
            tc.quarantine_push(unsafe { Address::from_usize(0x1000 + i * 8) });
        }
        assert!(tc.quarantine_is_full());
        let (entries, count) = tc.take_quarantine();
        assert_eq!(count, CHUNK_QUARANTINE_SZ);
        assert_eq!(entries[0], 0x1000);
        assert!(!tc.quarantine_is_full());
    }
}
