//! Zones: fixed-chunk-size arenas.
//!
//! A zone owns a 4 MiB user region split into equal power-of-two chunks, a
//! bitmap tracking every chunk's state, a cache of known-free bit-slots
//! and a set of randomly placed canary chunks. Both the user region and
//! the bitmap are bracketed by guard pages, and their base addresses are
//! stored XOR-masked with a per-zone secret while at rest; they are only
//! unmasked transiently, under the root lock, through the accessors below.

use std::io::Result;

use crate::bitmap::{slot_split, Bitmap, ChunkState};
use crate::canary;
use crate::util::constants::*;
use crate::util::memory::{self, MapAnnotation, MmapStrategy};
use crate::util::rand::Prng;
use crate::util::Address;

/// A size-class arena. Plain data: records live in the root's mapped zone
/// registry, not on the Rust heap.
#[repr(C)]
pub struct Zone {
    /// Position of this record in the root's registry.
    pub index: u16,
    /// Chunk size in bytes; a power of two, immutable after creation.
    /// A zero chunk size marks a destroyed record.
    pub chunk_size: usize,
    /// Base of the user region, XOR-masked with `pointer_mask` at rest.
    user_pages_start: usize,
    /// Base of the bitmap region, XOR-masked with `pointer_mask` at rest.
    bitmap_start: usize,
    /// Size of the bitmap in bytes.
    pub bitmap_size: usize,
    /// Pre-dequeued free slot, or `BAD_BIT_SLOT`.
    pub next_free_bit_slot: u64,
    free_bit_slot_cache: [u64; BIT_SLOT_CACHE_SZ],
    /// Write cursor into the free-slot cache.
    free_bit_slot_cache_index: usize,
    /// Read cursor; the cache is empty when it catches up with the write
    /// cursor.
    free_bit_slot_cache_usable: usize,
    pub canary_secret: u64,
    pub pointer_mask: u64,
    /// Live (allocated) chunks.
    pub af_count: usize,
    /// Lifetime allocations serviced by this incarnation of the zone.
    pub alloc_count: usize,
    /// Cached "no free slot" flag; cleared by the next free.
    pub is_full: bool,
    /// Shared default zone (true) or caller-owned private zone (false).
    pub internal: bool,
    /// Index of the next zone with the same chunk size, or 0 for end of
    /// chain.
    pub next_sz_index: u16,
    #[cfg(feature = "memory_tagging")]
    tag_strip_start: usize,
    #[cfg(feature = "memory_tagging")]
    pub tagged: bool,
    #[cfg(feature = "cpu_pin")]
    pub cpu_core: i32,
}

impl Zone {
    /// Map and initialise a zone record in place. `chunk_size` must
    /// already be rounded and range-checked by the caller.
    pub fn init(
        record: &mut Zone,
        index: u16,
        chunk_size: usize,
        internal: bool,
        prng: &mut Prng,
    ) -> Result<()> {
        debug_assert!(chunk_size.is_power_of_two());
        debug_assert!((SMALLEST_CHUNK_SZ..=SMALL_SZ_MAX).contains(&chunk_size));

        let chunk_count = ZONE_USER_SIZE / chunk_size;
        let bitmap_size = std::cmp::max(BYTES_IN_WORD, (chunk_count * 2) / BITS_IN_BYTE);

        let bitmap_start = memory::map_guarded(
            bitmap_size,
            MmapStrategy::default(),
            MapAnnotation::Bitmap { chunk_size },
        )?;
        if let Err(e) = memory::advise_will_need(bitmap_start, bitmap_size) {
            debug!("madvise(WILLNEED) on zone bitmap failed: {}", e);
        }

        let user_strategy =
            MmapStrategy::default().populate(cfg!(feature = "prepopulate_pages"));
        let user_pages_start = match memory::map_guarded(
            ZONE_USER_SIZE,
            user_strategy,
            MapAnnotation::UserPages { chunk_size },
        ) {
            Ok(addr) => addr,
            Err(e) => {
                let _ = memory::unmap_guarded(bitmap_start, bitmap_size);
                return Err(e);
            }
        };

        #[cfg(feature = "memory_tagging")]
        let tag_strip_start = match memory::map_guarded(
            chunk_count,
            MmapStrategy::default(),
            MapAnnotation::TagStrip,
        ) {
            Ok(addr) => addr,
            Err(e) => {
                let _ = memory::unmap_guarded(bitmap_start, bitmap_size);
                let _ = memory::unmap_guarded(user_pages_start, ZONE_USER_SIZE);
                return Err(e);
            }
        };

        let pointer_mask = prng.next_u64();
        let canary_secret = prng.next_u64();

        *record = Zone {
            index,
            chunk_size,
            user_pages_start: user_pages_start.as_usize() ^ pointer_mask as usize,
            bitmap_start: bitmap_start.as_usize() ^ pointer_mask as usize,
            bitmap_size,
            next_free_bit_slot: BAD_BIT_SLOT,
            free_bit_slot_cache: [BAD_BIT_SLOT; BIT_SLOT_CACHE_SZ],
            free_bit_slot_cache_index: 0,
            free_bit_slot_cache_usable: 0,
            canary_secret,
            pointer_mask,
            af_count: 0,
            alloc_count: 0,
            is_full: false,
            internal,
            next_sz_index: 0,
            #[cfg(feature = "memory_tagging")]
            tag_strip_start: tag_strip_start.as_usize() ^ pointer_mask as usize,
            #[cfg(feature = "memory_tagging")]
            tagged: true,
            #[cfg(feature = "cpu_pin")]
            cpu_core: unsafe { libc::sched_getcpu() },
        };

        #[cfg(feature = "memory_tagging")]
        record.seed_tags(prng);
        record.seed_canary_chunks(prng);
        record.fill_free_bit_slot_cache(prng);
        record.next_free_bit_slot = record.dequeue_free_slot();

        trace!(
            "created zone {} (chunk size {}, {} chunks, internal: {})",
            index,
            chunk_size,
            chunk_count,
            internal
        );
        Ok(())
    }

    /// Is this record backed by live mappings? False once destroyed.
    pub fn is_live(&self) -> bool {
        self.chunk_size != 0
    }

    /// Unmasked base of the user region. The returned value must not
    /// outlive the current root-lock scope.
    pub fn user_start(&self) -> Address {
        unsafe { Address::from_usize(self.user_pages_start ^ self.pointer_mask as usize) }
    }

    /// Unmasked base of the bitmap region. Same scope rule as
    /// [`Zone::user_start`].
    pub fn bitmap_base(&self) -> Address {
        unsafe { Address::from_usize(self.bitmap_start ^ self.pointer_mask as usize) }
    }

    pub fn bitmap(&self) -> Bitmap {
        Bitmap::new(self.bitmap_base(), self.bitmap_size)
    }

    pub fn chunk_count(&self) -> usize {
        ZONE_USER_SIZE / self.chunk_size
    }

    /// Does the user region contain this address?
    pub fn contains(&self, p: Address) -> bool {
        let start = self.user_start();
        p >= start && p < start + ZONE_USER_SIZE
    }

    /// Does the bitmap region contain this address? Used by metadata
    /// tooling, not by the allocation paths.
    pub fn bitmap_contains(&self, p: Address) -> bool {
        let start = self.bitmap_base();
        p >= start && p < start + self.bitmap_size
    }

    fn chunk_at(&self, chunk_number: usize) -> Address {
        self.user_start() + chunk_number * self.chunk_size
    }

    /// Reserve ~1% of the chunks as permanent canary chunks. Only zones up
    /// to the default sizes carry them.
    fn seed_canary_chunks(&mut self, prng: &mut Prng) {
        if self.chunk_size > MAX_DEFAULT_ZONE_SZ {
            return;
        }
        let bm = self.bitmap();
        let chunks = self.chunk_count();
        for _ in 0..chunks / CANARY_COUNT_DIV {
            let n = prng.below(chunks as u64) as usize;
            let slot = (n * 2) as u64;
            // A collision with an earlier pick is simply dropped.
            if bm.state(slot) == ChunkState::NeverUsed {
                bm.set_state(slot, ChunkState::CanaryChunk);
                canary::write(self.canary_secret, self.chunk_at(n), self.chunk_size);
            }
        }
    }

    /// Refill the free-slot cache: walk the bitmap from a random word to
    /// its end (no wrap-around, so the cache may come back short) and
    /// shuffle what was found so free order does not mirror address order.
    pub fn fill_free_bit_slot_cache(&mut self, prng: &mut Prng) {
        let bm = self.bitmap();
        let start_word = prng.below(bm.words() as u64) as usize;
        let cache = &mut self.free_bit_slot_cache;
        let mut count = 0;
        bm.collect_free(start_word, &mut |slot| {
            cache[count] = slot;
            count += 1;
            count < BIT_SLOT_CACHE_SZ
        });

        let mut i = count;
        while i > 1 {
            let j = prng.below(i as u64) as usize;
            i -= 1;
            cache.swap(i, j);
        }

        self.free_bit_slot_cache_index = count;
        self.free_bit_slot_cache_usable = 0;
    }

    fn cache_is_empty(&self) -> bool {
        self.free_bit_slot_cache_usable >= self.free_bit_slot_cache_index
    }

    fn dequeue_free_slot(&mut self) -> u64 {
        if self.cache_is_empty() {
            return BAD_BIT_SLOT;
        }
        let slot = self.free_bit_slot_cache[self.free_bit_slot_cache_usable];
        self.free_bit_slot_cache[self.free_bit_slot_cache_usable] = BAD_BIT_SLOT;
        self.free_bit_slot_cache_usable += 1;
        slot
    }

    fn push_free_slot(&mut self, slot: u64) {
        if self.free_bit_slot_cache_index < BIT_SLOT_CACHE_SZ {
            self.free_bit_slot_cache[self.free_bit_slot_cache_index] = slot;
            self.free_bit_slot_cache_index += 1;
        }
        // A full cache silently drops the slot; the next refill scan will
        // rediscover it.
    }

    /// Make sure `next_free_bit_slot` holds a usable slot. Marks the zone
    /// full and returns false when nothing can be found.
    pub fn ensure_free_slot(&mut self, prng: &mut Prng) -> bool {
        if self.next_free_bit_slot != BAD_BIT_SLOT {
            return true;
        }
        if self.cache_is_empty() {
            self.fill_free_bit_slot_cache(prng);
        }
        let slot = self.dequeue_free_slot();
        if slot != BAD_BIT_SLOT {
            self.next_free_bit_slot = slot;
            return true;
        }
        let bm = self.bitmap();
        if let Some(slot) = bm.find_zero_word().or_else(|| bm.find_free_slow()) {
            self.next_free_bit_slot = slot;
            return true;
        }
        self.is_full = true;
        false
    }

    /// Turn the pre-dequeued bit-slot into a live chunk.
    pub fn allocate_next_slot(&mut self) -> Address {
        let slot = self.next_free_bit_slot;
        debug_assert_ne!(slot, BAD_BIT_SLOT);
        self.next_free_bit_slot = BAD_BIT_SLOT;

        let (word_index, bit_offset) = slot_split(slot);
        let chunk = self.user_start() + ((slot >> 1) as usize) * self.chunk_size;
        if !self.contains(chunk) {
            fatal!("bit slot {} of zone {} maps outside its user region", slot, self.index);
        }

        let bm = self.bitmap();
        let mut word = bm.word(word_index);
        if word & (1 << bit_offset) != 0 {
            fatal!("allocation found chunk {} already in use", chunk);
        }
        if word & (1 << (bit_offset + 1)) != 0 {
            // The slot was freed earlier and carries a canary.
            canary::verify(self.canary_secret, chunk, self.chunk_size);
            canary::wipe_leading(chunk);
        }
        word = (word | (1 << bit_offset)) & !(1 << (bit_offset + 1));
        bm.set_word(word_index, word);

        self.alloc_count += 1;
        self.af_count += 1;
        chunk
    }

    /// Return a chunk to the zone. With `permanent` the chunk becomes
    /// indistinguishable from a canary chunk and is never handed out
    /// again.
    pub fn free_chunk(&mut self, p: Address, permanent: bool) {
        if !p.is_aligned_to(ALIGNMENT) {
            fatal!("free of unaligned pointer {}", p);
        }
        let offset = p - self.user_start();
        if offset % self.chunk_size != 0 {
            fatal!("free of {} which is not on a chunk boundary", p);
        }
        let chunk_number = offset / self.chunk_size;
        let slot = (chunk_number * 2) as u64;
        let (word_index, bit_offset) = slot_split(slot);
        let bm = self.bitmap();
        if word_index >= bm.words() {
            fatal!("free of {} is outside the zone bitmap", p);
        }

        let mut word = bm.word(word_index);
        if word & (1 << bit_offset) == 0 {
            fatal!("double free of {}", p);
        }
        // A live chunk always has a clear high bit; both bits set is a
        // canary chunk or a permanently freed one, neither of which the
        // caller can legitimately hold.
        if word & (1 << (bit_offset + 1)) != 0 {
            fatal!("free of reserved chunk {}", p);
        }
        // The high bit records that the chunk has history.
        word |= 1 << (bit_offset + 1);
        if !permanent {
            word &= !(1 << bit_offset);
            self.push_free_slot(slot);
            self.is_full = false;
        }

        #[cfg(feature = "sanitize_chunks")]
        memory::set(p, POISON_BYTE, self.chunk_size);
        canary::write(self.canary_secret, p, self.chunk_size);

        bm.set_word(word_index, word);
        self.af_count -= 1;

        // An overflow from a neighbouring chunk shows up here at the
        // latest.
        if chunk_number > 0 && bm.state(slot - 2).carries_canary() {
            canary::verify(self.canary_secret, self.chunk_at(chunk_number - 1), self.chunk_size);
        }
        if chunk_number + 1 < self.chunk_count() && bm.state(slot + 2).carries_canary() {
            canary::verify(self.canary_secret, self.chunk_at(chunk_number + 1), self.chunk_size);
        }
    }

    /// Walk the whole bitmap: verify every canary-carrying chunk and check
    /// the bitmap against the live-chunk count.
    pub fn verify(&self) {
        let bm = self.bitmap();
        let mut in_use = 0;
        for chunk_number in 0..self.chunk_count() {
            let slot = (chunk_number * 2) as u64;
            let state = bm.state(slot);
            if state == ChunkState::InUse {
                in_use += 1;
            } else if state.carries_canary() {
                canary::verify(self.canary_secret, self.chunk_at(chunk_number), self.chunk_size);
            }
        }
        if in_use != self.af_count {
            fatal!(
                "zone {} bitmap holds {} live chunks but af_count says {}",
                self.index,
                in_use,
                self.af_count
            );
        }
    }

    /// Release the zone's mappings. With `never_reuse_zones` the ranges
    /// are sealed instead so the address space is never recycled.
    pub fn destroy_regions(&mut self) {
        let user = self.user_start();
        let bitmap = self.bitmap_base();
        cfg_if::cfg_if! {
            if #[cfg(feature = "never_reuse_zones")] {
                let user_result = memory::seal_guarded(user, ZONE_USER_SIZE);
                let bitmap_result = memory::seal_guarded(bitmap, self.bitmap_size);
            } else {
                let user_result = memory::unmap_guarded(user, ZONE_USER_SIZE);
                let bitmap_result = memory::unmap_guarded(bitmap, self.bitmap_size);
            }
        }
        if let Err(e) = user_result.and(bitmap_result) {
            warn!("releasing regions of zone {} failed: {}", self.index, e);
        }
        #[cfg(feature = "memory_tagging")]
        {
            let strip = self.tag_strip();
            cfg_if::cfg_if! {
                if #[cfg(feature = "never_reuse_zones")] {
                    let _ = memory::seal_guarded(strip, self.chunk_count());
                } else {
                    let _ = memory::unmap_guarded(strip, self.chunk_count());
                }
            }
        }
        trace!("destroyed zone {} (chunk size {})", self.index, self.chunk_size);
    }
}

#[cfg(feature = "memory_tagging")]
impl Zone {
    fn tag_strip(&self) -> Address {
        unsafe { Address::from_usize(self.tag_strip_start ^ self.pointer_mask as usize) }
    }

    fn seed_tags(&mut self, prng: &mut Prng) {
        let strip = self.tag_strip();
        for i in 0..self.chunk_count() {
            unsafe { (strip + i).store(prng.next_u64() as u8) };
        }
    }

    /// The tag of the chunk containing `p`.
    pub fn tag_for(&self, p: Address) -> u8 {
        let chunk_number = (p - self.user_start()) / self.chunk_size;
        unsafe { (self.tag_strip() + chunk_number).load::<u8>() }
    }

    /// Re-randomise a freed chunk's tag so a stale tagged pointer no
    /// longer matches.
    pub fn refresh_tag(&mut self, p: Address, prng: &mut Prng) {
        let chunk_number = (p - self.user_start()) / self.chunk_size;
        unsafe { (self.tag_strip() + chunk_number).store(prng.next_u64() as u8) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_zone(chunk_size: usize) -> (Box<Zone>, Prng) {
        let mut prng = Prng::seeded();
        let mut zone = Box::new(unsafe { std::mem::zeroed::<Zone>() });
        Zone::init(&mut zone, 3, chunk_size, false, &mut prng).expect("zone mapping failed");
        (zone, prng)
    }

    #[test]
    fn alloc_free_cycle() {
        let (mut zone, mut prng) = fresh_zone(1024);
        assert!(zone.ensure_free_slot(&mut prng));
        let p = zone.allocate_next_slot();
        assert!(p.is_aligned_to(ALIGNMENT));
        assert!(zone.contains(p));
        assert_eq!(zone.af_count, 1);
        assert_eq!(zone.alloc_count, 1);

        zone.free_chunk(p, false);
        assert_eq!(zone.af_count, 0);
        let slot = ((p - zone.user_start()) / 1024 * 2) as u64;
        assert_eq!(zone.bitmap().state(slot), ChunkState::FreedWithCanary);
        zone.verify();
        zone.destroy_regions();
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_aborts() {
        let (mut zone, mut prng) = fresh_zone(256);
        assert!(zone.ensure_free_slot(&mut prng));
        let p = zone.allocate_next_slot();
        zone.free_chunk(p, false);
        zone.free_chunk(p, false);
    }

    #[test]
    #[should_panic(expected = "not on a chunk boundary")]
    fn misplaced_free_aborts() {
        let (mut zone, mut prng) = fresh_zone(256);
        assert!(zone.ensure_free_slot(&mut prng));
        let p = zone.allocate_next_slot();
        zone.free_chunk(p + 8usize, false);
    }

    #[test]
    fn permanent_free_reserves_chunk() {
        let (mut zone, mut prng) = fresh_zone(512);
        assert!(zone.ensure_free_slot(&mut prng));
        let p = zone.allocate_next_slot();
        zone.free_chunk(p, true);
        let slot = ((p - zone.user_start()) / 512 * 2) as u64;
        assert_eq!(zone.bitmap().state(slot), ChunkState::CanaryChunk);
        assert_eq!(zone.af_count, 0);
        zone.verify();
        zone.destroy_regions();
    }

    #[test]
    fn zone_fills_and_recovers() {
        // 64 KiB chunks: 64 chunks and no canary chunks in the way.
        let (mut zone, mut prng) = fresh_zone(SMALL_SZ_MAX);
        let mut chunks = vec![];
        for _ in 0..zone.chunk_count() {
            assert!(zone.ensure_free_slot(&mut prng));
            chunks.push(zone.allocate_next_slot());
        }
        assert!(!zone.ensure_free_slot(&mut prng));
        assert!(zone.is_full);

        zone.free_chunk(chunks.pop().unwrap(), false);
        assert!(!zone.is_full);
        assert!(zone.ensure_free_slot(&mut prng));
        zone.verify();
        zone.destroy_regions();
    }

    #[test]
    fn freed_canary_is_checked_on_reuse() {
        let (mut zone, mut prng) = fresh_zone(2048);
        assert!(zone.ensure_free_slot(&mut prng));
        let p = zone.allocate_next_slot();
        zone.free_chunk(p, false);

        // Drain the cache until the freed slot comes back around.
        loop {
            assert!(zone.ensure_free_slot(&mut prng), "freed slot never reappeared");
            let q = zone.allocate_next_slot();
            if q == p {
                break;
            }
        }
        zone.verify();
        zone.destroy_regions();
    }

    #[test]
    #[should_panic(expected = "corrupted leading canary")]
    fn write_after_free_detected_by_verify() {
        let (mut zone, mut prng) = fresh_zone(128);
        assert!(zone.ensure_free_slot(&mut prng));
        let p = zone.allocate_next_slot();
        zone.free_chunk(p, false);
        unsafe { p.store(p.load::<u64>() ^ 1) };
        zone.verify();
    }
}
