//! The process-wide root: the zone registry, its secrets, and the
//! allocation/free control flow for the small-zone engine.
//!
//! The root record itself lives inside a guarded anonymous mapping, as
//! does the registry of zone records. Everything in this module must run
//! under the root lock; see [`crate::isoheap`].

use std::io::Result;
use std::mem::size_of;

use crate::lookup::{ChunkTable, ZoneSizeTable};
use crate::tcache::ThreadCache;
use crate::util::constants::*;
use crate::util::conversions::{page_align_up, round_chunk_size};
use crate::util::memory::{self, MapAnnotation, MmapStrategy};
use crate::util::rand::Prng;
use crate::util::Address;
use crate::zone::Zone;

/// The root record. Placed in its own guarded mapping; never on the Rust
/// heap. Secrets in here must never be logged or written out.
#[repr(C)]
pub struct Root {
    /// Base of the zone registry mapping.
    pub zones_start: Address,
    /// Number of registry slots handed out so far; never shrinks.
    pub zones_used: usize,
    /// Masked head of the big-zone list.
    pub big_zone_head: usize,
    pub zone_handle_mask: u64,
    pub big_zone_next_mask: u64,
    pub big_zone_canary_secret: u64,
    pub prng: Prng,
    pub system_page_size: usize,
    pub chunk_table: Address,
    pub zone_table: Address,
    #[cfg(feature = "no_zero_allocations")]
    pub zero_sentinel: Address,
}

/// An opaque, masked reference to a caller-owned zone. Forging one
/// requires the handle mask.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ZoneHandle(pub(crate) usize);

/// Owner of the root record. All engine operations hang off this; the
/// instance lives inside the root lock.
pub struct RootHandle(Address);

impl RootHandle {
    /// Map and initialise the root, the zone registry, the lookup tables,
    /// the zero sentinel and the default zones. Any failure here is
    /// fatal.
    ///
    /// Returns the handle plus the accessible interiors of the root and
    /// registry mappings, for [`crate::isoheap::IsoHeap`] to protect and
    /// unprotect.
    pub fn boot() -> (RootHandle, (Address, usize), (Address, usize)) {
        let page = memory::page_size();
        let mut prng = Prng::seeded();

        let record = memory::map_guarded(size_of::<Root>(), MmapStrategy::default(), MapAnnotation::Root)
            .unwrap_or_else(|e| fatal!("mapping the allocator root failed: {}", e));

        let zones_bytes = MAX_ZONES * size_of::<Zone>();
        let zones_start =
            memory::map_guarded(zones_bytes, MmapStrategy::default(), MapAnnotation::Zones)
                .unwrap_or_else(|e| fatal!("mapping the zone registry failed: {}", e));

        let chunk_table = ChunkTable::create()
            .unwrap_or_else(|e| fatal!("mapping the chunk lookup table failed: {}", e));
        let zone_table = ZoneSizeTable::create()
            .unwrap_or_else(|e| fatal!("mapping the size lookup table failed: {}", e));

        #[cfg(feature = "no_zero_allocations")]
        let zero_sentinel = memory::map_anonymous(
            page,
            MmapStrategy::default().prot(memory::MmapProtection::NoAccess),
            MapAnnotation::Sentinel,
        )
        .unwrap_or_else(|e| fatal!("mapping the zero sentinel failed: {}", e));

        let zone_handle_mask = prng.next_u64();
        let big_zone_next_mask = prng.next_u64();
        let big_zone_canary_secret = prng.next_u64();
        unsafe {
            record.store(Root {
                zones_start,
                zones_used: 0,
                big_zone_head: big_zone_next_mask as usize,
                zone_handle_mask,
                big_zone_next_mask,
                big_zone_canary_secret,
                prng,
                system_page_size: page,
                chunk_table: chunk_table.base(),
                zone_table: zone_table.base(),
                #[cfg(feature = "no_zero_allocations")]
                zero_sentinel,
            });
        }

        let handle = RootHandle(record);
        for chunk_size in DEFAULT_ZONE_SIZES {
            handle
                .new_zone(chunk_size, true)
                .unwrap_or_else(|e| fatal!("mapping a default zone failed: {}", e));
        }
        info!(
            "isoheap ready: {} default zones, {} registry slots",
            DEFAULT_ZONE_SIZES.len(),
            MAX_ZONES
        );

        (
            handle,
            (record, page_align_up(size_of::<Root>(), page)),
            (zones_start, page_align_up(zones_bytes, page)),
        )
    }

    #[allow(clippy::mut_from_ref)]
    fn root(&self) -> &mut Root {
        unsafe { self.0.as_mut_ref() }
    }

    pub fn record_address(&self) -> Address {
        self.0
    }

    pub fn zones_used(&self) -> usize {
        self.root().zones_used
    }

    #[cfg(feature = "no_zero_allocations")]
    pub fn zero_sentinel(&self) -> Address {
        self.root().zero_sentinel
    }

    fn chunk_table(&self) -> ChunkTable {
        ChunkTable::from_base(self.root().chunk_table)
    }

    fn zone_table(&self) -> ZoneSizeTable {
        ZoneSizeTable::from_base(self.root().zone_table)
    }

    fn zone_record_address(&self, index: usize) -> Address {
        self.root().zones_start + index * size_of::<Zone>()
    }

    #[allow(clippy::mut_from_ref)]
    pub fn zone_mut(&self, index: usize) -> &mut Zone {
        debug_assert!(index < MAX_ZONES);
        unsafe { self.zone_record_address(index).as_mut_ref() }
    }

    /// Create a zone for `size`-byte requests (§ rounded up to a power of
    /// two). Capability violations abort; only upstream mapping failures
    /// surface as errors.
    pub fn new_zone(&self, size: usize, internal: bool) -> Result<u16> {
        if size > SMALL_SZ_MAX {
            fatal!(
                "new_zone asked for {}-byte chunks; requests that large take the big path",
                size
            );
        }
        let chunk_size = round_chunk_size(size);
        let root = self.root();
        if root.zones_used == MAX_ZONES {
            fatal!("all {} zone slots are in use", MAX_ZONES);
        }

        let index = root.zones_used as u16;
        Zone::init(self.zone_mut(index as usize), index, chunk_size, internal, &mut root.prng)?;
        root.zones_used += 1;

        if internal {
            let zone = self.zone_mut(index as usize);
            self.chunk_table().set(zone.user_start(), index);
            self.splice_into_size_chain(chunk_size, index);
        }
        Ok(index)
    }

    /// Append a new internal zone to the chain of its size class.
    fn splice_into_size_chain(&self, chunk_size: usize, index: u16) {
        let table = self.zone_table();
        let first = table.get(chunk_size);
        if first == 0 {
            // Zone 0 itself stays reachable only through the linear scan;
            // 0 means "no chain" to every reader.
            table.set(chunk_size, index);
            return;
        }
        let mut cursor = first as usize;
        loop {
            let zone = self.zone_mut(cursor);
            if zone.chunk_size != chunk_size {
                fatal!(
                    "size chain for {} runs through zone {} of size {}",
                    chunk_size,
                    cursor,
                    zone.chunk_size
                );
            }
            if zone.next_sz_index == 0 {
                zone.next_sz_index = index;
                return;
            }
            cursor = zone.next_sz_index as usize;
        }
    }

    /// The §fit predicate for generic allocations: is this zone willing
    /// and able to service a `size`-byte request right now?
    fn zone_fits(&self, zone: &mut Zone, size: usize) -> bool {
        if !zone.is_live() || zone.is_full || !zone.internal {
            return false;
        }
        if zone.chunk_size < size {
            return false;
        }
        // Size separation: large-chunk zones never service tiny requests.
        if zone.chunk_size >= 1024 && size <= 128 {
            return false;
        }
        // Waste policy, deliberately only applied above 1024 bytes.
        if size > 1024 && zone.chunk_size >= (size << WASTED_SZ_MULTIPLIER_SHIFT) {
            return false;
        }
        #[cfg(feature = "cpu_pin")]
        if zone.cpu_core != unsafe { libc::sched_getcpu() } {
            return false;
        }
        zone.ensure_free_slot(&mut self.root().prng)
    }

    /// Service a small request: thread cache, then the size chain, then a
    /// linear scan, then a brand-new zone.
    pub fn small_alloc(&self, tc: &mut ThreadCache, size: usize) -> Result<Address> {
        let rounded = round_chunk_size(size);
        debug_assert!(rounded <= SMALL_SZ_MAX);

        for entry in tc.zone_entries() {
            if entry.chunk_size < rounded || entry.index as usize >= self.zones_used() {
                continue;
            }
            let zone = self.zone_mut(entry.index as usize);
            if zone.chunk_size == entry.chunk_size && self.zone_fits(zone, rounded) {
                return Ok(zone.allocate_next_slot());
            }
        }

        let first = self.zone_table().get(rounded) as usize;
        if first != 0 {
            let mut cursor = first;
            loop {
                let zone = self.zone_mut(cursor);
                if zone.chunk_size != rounded {
                    fatal!(
                        "size chain for {} runs through zone {} of size {}",
                        rounded,
                        cursor,
                        zone.chunk_size
                    );
                }
                if self.zone_fits(zone, rounded) {
                    return Ok(zone.allocate_next_slot());
                }
                if zone.next_sz_index == 0 {
                    break;
                }
                cursor = zone.next_sz_index as usize;
            }
        }

        for index in 0..self.zones_used() {
            let zone = self.zone_mut(index);
            if self.zone_fits(zone, rounded) {
                return Ok(zone.allocate_next_slot());
            }
        }

        let index = self.new_zone(rounded, true)?;
        Ok(self.zone_mut(index as usize).allocate_next_slot())
    }

    /// Allocation from a caller-owned zone. Requests beyond the chunk
    /// size abort; a full private zone yields no address.
    pub fn private_zone_alloc(&self, index: usize, size: usize) -> Option<Address> {
        let zone = self.zone_mut(index);
        if size > zone.chunk_size {
            fatal!(
                "request of {} bytes from a private zone of {}-byte chunks",
                size,
                zone.chunk_size
            );
        }
        if !zone.ensure_free_slot(&mut self.root().prng) {
            return None;
        }
        Some(zone.allocate_next_slot())
    }

    /// Resolve a user pointer to the small zone owning it: lookup table,
    /// then the thread zone cache, then a linear scan.
    pub fn locate_small(&self, tc: Option<&ThreadCache>, p: Address) -> Option<usize> {
        let entry = self.chunk_table().get(p) as usize;
        if entry > self.zones_used() {
            fatal!("chunk lookup table names zone {} beyond the registry", entry);
        }
        if entry < self.zones_used() {
            let zone = self.zone_mut(entry);
            if zone.is_live() && zone.contains(p) {
                return Some(entry);
            }
        }
        if let Some(tc) = tc {
            for e in tc.zone_entries() {
                if (e.index as usize) < self.zones_used() {
                    let zone = self.zone_mut(e.index as usize);
                    if zone.is_live() && zone.contains(p) {
                        return Some(e.index as usize);
                    }
                }
            }
        }
        for index in 0..self.zones_used() {
            let zone = self.zone_mut(index);
            if zone.is_live() && zone.contains(p) {
                return Some(index);
            }
        }
        None
    }

    /// The metadata-tooling twin of [`RootHandle::locate_small`]: which
    /// zone's bitmap region contains `p`?
    pub fn locate_bitmap(&self, p: Address) -> Option<usize> {
        (0..self.zones_used()).find(|&index| {
            let zone = self.zone_mut(index);
            zone.is_live() && zone.bitmap_contains(p)
        })
    }

    /// Free a chunk into the zone that owns it, remember the zone in the
    /// thread cache, and retire the zone if it has earned it.
    pub fn free_small(&self, tc: &mut ThreadCache, index: usize, p: Address, permanent: bool) {
        let zone = self.zone_mut(index);
        zone.free_chunk(p, permanent);
        #[cfg(feature = "memory_tagging")]
        zone.refresh_tag(p, &mut self.root().prng);
        let chunk_size = zone.chunk_size;
        tc.cache_zone(index as u16, chunk_size);
        self.maybe_retire(index);
    }

    /// Retire a drained, heavily recycled internal zone: same index, same
    /// size, fresh mappings and secrets. Blocks long-lived address reuse.
    fn maybe_retire(&self, index: usize) {
        let zone = self.zone_mut(index);
        if zone.internal
            && zone.af_count == 0
            && zone.alloc_count > zone.chunk_count() * ZONE_ALLOC_RETIRE
            && zone.chunk_size < MAX_DEFAULT_ZONE_SZ * 2
        {
            self.replace_zone(index);
        }
    }

    fn replace_zone(&self, index: usize) {
        let zone = self.zone_mut(index);
        let chunk_size = zone.chunk_size;
        let internal = zone.internal;
        let next_sz_index = zone.next_sz_index;
        debug!("retiring zone {} after {} allocations", index, zone.alloc_count);

        self.chunk_table().clear(zone.user_start(), index as u16);
        zone.destroy_regions();
        Zone::init(zone, index as u16, chunk_size, internal, &mut self.root().prng)
            .unwrap_or_else(|e| fatal!("remapping retired zone {} failed: {}", index, e));
        // The replacement keeps its place in the size chain.
        let zone = self.zone_mut(index);
        zone.next_sz_index = next_sz_index;
        if internal {
            self.chunk_table().set(zone.user_start(), index as u16);
        }
    }

    /// Tear down a caller-owned zone: audit it, release its mappings and
    /// wipe the record. The registry slot is not reused.
    pub fn destroy_zone_at(&self, index: usize) {
        let zone = self.zone_mut(index);
        zone.verify();
        self.chunk_table().clear(zone.user_start(), index as u16);
        zone.destroy_regions();
        unsafe { self.zone_record_address(index).store(std::mem::zeroed::<Zone>()) };
    }

    /// Audit every live zone and the size-chain links between them.
    pub fn verify_all_zones(&self) {
        for index in 0..self.zones_used() {
            let (chunk_size, next) = {
                let zone = self.zone_mut(index);
                if !zone.is_live() {
                    continue;
                }
                zone.verify();
                (zone.chunk_size, zone.next_sz_index as usize)
            };
            if next > self.zones_used() {
                fatal!("zone {} links to {} beyond the registry", index, next);
            }
            if next != 0 && self.zone_mut(next).chunk_size != chunk_size {
                fatal!(
                    "zone {} (size {}) links to zone {} of a different size",
                    index,
                    chunk_size,
                    next
                );
            }
        }
    }

    pub fn handle_for(&self, index: usize) -> ZoneHandle {
        ZoneHandle(
            self.zone_record_address(index).as_usize() ^ self.root().zone_handle_mask as usize,
        )
    }

    /// Unmask and validate a caller-supplied zone handle. Anything that
    /// does not name a live registry record aborts.
    pub fn resolve_handle(&self, handle: ZoneHandle) -> usize {
        let raw = handle.0 ^ self.root().zone_handle_mask as usize;
        let zones_start = self.root().zones_start.as_usize();
        let offset = raw.wrapping_sub(zones_start);
        if raw < zones_start
            || offset % size_of::<Zone>() != 0
            || offset / size_of::<Zone>() >= self.zones_used()
        {
            fatal!("invalid zone handle");
        }
        let index = offset / size_of::<Zone>();
        if !self.zone_mut(index).is_live() {
            fatal!("zone handle names a destroyed zone");
        }
        index
    }
}
