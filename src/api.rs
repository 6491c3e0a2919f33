//! The public allocator interface: safe free functions over the process
//! heap singleton.
//!
//! Every entry point lazily initialises the heap on first use;
//! [`init`] and [`teardown`] exist for embedders that want explicit
//! startup and end-of-process hooks on top of that.

use crate::isoheap::heap;
use crate::root::ZoneHandle;
use crate::tcache;
use crate::util::constants::*;
use crate::util::{logger, Address};
use crate::verify;

/// Explicit eager initialisation: set up logging and map the heap now
/// instead of on the first allocation.
pub fn init() {
    logger::try_init();
    let _ = heap();
}

/// End-of-process audit hook: drains this thread's quarantine, verifies
/// every canary in the heap and logs usage counters. The heap stays
/// usable afterwards so allocations from late shutdown code keep working.
pub fn teardown() {
    flush_caches();
    verify::verify_all();

    let root = heap().lock_root();
    let mut live = 0;
    let mut lifetime = 0;
    for index in 0..root.zones_used() {
        let zone = root.zone_mut(index);
        if zone.is_live() {
            live += zone.af_count;
            lifetime += zone.alloc_count;
        }
    }
    debug!(
        "teardown audit passed: {} zones, {} live chunks, {} lifetime allocations",
        root.zones_used(),
        live,
        lifetime
    );
}

fn finish_alloc(result: std::io::Result<Address>) -> Address {
    match result {
        Ok(p) => p,
        Err(e) => {
            if cfg!(feature = "abort_on_null") {
                fatal!("allocation failed upstream: {}", e);
            }
            warn!("allocation failed upstream: {}", e);
            Address::ZERO
        }
    }
}

/// Allocate `size` bytes. Returns a zero address only when an upstream
/// mapping fails and `abort_on_null` is disabled.
pub fn alloc(size: usize) -> Address {
    #[cfg(feature = "no_zero_allocations")]
    if size == 0 {
        return heap().zero_sentinel();
    }
    if size > SMALL_SZ_MAX {
        let big = heap().lock_big();
        return finish_alloc(big.allocate(size));
    }
    tcache::with(|tc| {
        let root = heap().lock_root();
        #[cfg(feature = "fuzz_mode")]
        root.verify_all_zones();
        finish_alloc(root.small_alloc(tc, size))
    })
}

/// Allocate from a caller-owned zone. The request must fit the zone's
/// chunk size; a full private zone yields a zero address.
pub fn zone_alloc(handle: ZoneHandle, size: usize) -> Address {
    #[cfg(feature = "no_zero_allocations")]
    if size == 0 {
        return heap().zero_sentinel();
    }
    let root = heap().lock_root();
    let index = root.resolve_handle(handle);
    match root.private_zone_alloc(index, size) {
        Some(p) => p,
        None => {
            if cfg!(feature = "abort_on_null") {
                fatal!("private zone {} is out of chunks", index);
            }
            Address::ZERO
        }
    }
}

/// Allocate zeroed memory for an `nmemb` by `size` array. A
/// multiplicative overflow aborts before anything is mapped.
pub fn calloc(nmemb: usize, size: usize) -> Address {
    let total = nmemb
        .checked_mul(size)
        .unwrap_or_else(|| fatal!("calloc({}, {}) overflows", nmemb, size));
    let p = alloc(total);
    if !p.is_zero() && total != 0 {
        crate::util::memory::zero(p, total);
    }
    p
}

/// Is this pointer exempt from being freed (null, or the zero-allocation
/// sentinel)?
fn free_is_noop(p: Address) -> bool {
    if p.is_zero() {
        return true;
    }
    #[cfg(feature = "no_zero_allocations")]
    if p == heap().zero_sentinel() {
        return true;
    }
    false
}

/// Free an allocation. The chunk lands in the calling thread's
/// quarantine; it is only returned to its zone when the quarantine
/// drains. Null and the zero sentinel are no-ops.
pub fn free(p: Address) {
    if free_is_noop(p) {
        return;
    }
    if !p.is_aligned_to(ALIGNMENT) {
        fatal!("free of unaligned pointer {}", p);
    }
    tcache::with(|tc| {
        if tc.quarantine_is_full() {
            tcache::drain(tc);
        }
        tc.quarantine_push(p);
    });
}

/// Free an allocation so its chunk is never handed out again. Bypasses
/// the quarantine.
pub fn free_permanent(p: Address) {
    if free_is_noop(p) {
        return;
    }
    if !p.is_aligned_to(ALIGNMENT) {
        fatal!("free of unaligned pointer {}", p);
    }
    let freed_small = tcache::with(|tc| {
        let root = heap().lock_root();
        #[cfg(feature = "fuzz_mode")]
        root.verify_all_zones();
        match root.locate_small(Some(&*tc), p) {
            Some(index) => {
                root.free_small(tc, index, p, true);
                true
            }
            None => false,
        }
    });
    if freed_small {
        return;
    }
    let big = heap().lock_big();
    if !big.free(p, true) {
        fatal!("free of {} which no zone owns", p);
    }
}

/// Free with a size claim: aborts if the owning zone's chunks are smaller
/// than the caller believes the allocation was.
pub fn free_size(p: Address, size: usize) {
    if free_is_noop(p) {
        return;
    }
    if !p.is_aligned_to(ALIGNMENT) {
        fatal!("free of unaligned pointer {}", p);
    }
    let found_small = {
        let root = heap().lock_root();
        match root.locate_small(None, p) {
            Some(index) => {
                let chunk_size = root.zone_mut(index).chunk_size;
                if chunk_size < size {
                    fatal!(
                        "free_size claims {} bytes but {} sits in a {}-byte zone",
                        size,
                        p,
                        chunk_size
                    );
                }
                true
            }
            None => false,
        }
    };
    if !found_small {
        let big = heap().lock_big();
        match big.size_of(p) {
            Some(big_size) if big_size >= size => {}
            Some(big_size) => {
                fatal!(
                    "free_size claims {} bytes but the big zone at {} holds {}",
                    size,
                    p,
                    big_size
                );
            }
            None => fatal!("free of {} which no zone owns", p),
        }
    }
    free(p);
}

/// The usable size behind a pointer: its zone's chunk size, or a big
/// allocation's page-rounded size. Zero for null and the sentinel.
pub fn chunk_size(p: Address) -> usize {
    if free_is_noop(p) {
        return 0;
    }
    {
        let root = heap().lock_root();
        if let Some(index) = root.locate_small(None, p) {
            return root.zone_mut(index).chunk_size;
        }
    }
    let big = heap().lock_big();
    match big.size_of(p) {
        Some(size) => size,
        None => fatal!("{} is not an isoheap pointer", p),
    }
}

/// Create a caller-owned zone for requests up to `size` (rounded) bytes.
/// Returns nothing only when an upstream mapping fails and
/// `abort_on_null` is disabled.
pub fn new_zone(size: usize) -> Option<ZoneHandle> {
    let root = heap().lock_root();
    match root.new_zone(size, false) {
        Ok(index) => Some(root.handle_for(index as usize)),
        Err(e) => {
            if cfg!(feature = "abort_on_null") {
                fatal!("mapping a new zone failed: {}", e);
            }
            warn!("mapping a new zone failed: {}", e);
            None
        }
    }
}

/// Audit and tear down a caller-owned zone. Its registry slot is retired
/// for good.
pub fn destroy_zone(handle: ZoneHandle) {
    let root = heap().lock_root();
    let index = root.resolve_handle(handle);
    if root.zone_mut(index).internal {
        fatal!("destroy_zone on a shared default zone");
    }
    root.destroy_zone_at(index);
}

/// Verify every canary in one caller-owned zone.
pub fn verify_zone(handle: ZoneHandle) {
    verify::verify_zone(handle);
}

/// Verify every canary in the whole heap.
pub fn verify_all() {
    verify::verify_all();
}

/// Drain the calling thread's quarantine and forget its cached zones.
pub fn flush_caches() {
    tcache::with(|tc| {
        tcache::drain(tc);
        tc.clear_zone_cache();
    });
}

/// Make the allocator unusable until [`unprotect_root`]: every metadata
/// access will fault.
pub fn protect_root() {
    heap().protect_root();
}

pub fn unprotect_root() {
    heap().unprotect_root();
}

/// Does `p` point into one of the allocator's own bitmap regions? For
/// metadata tooling.
pub fn is_metadata_address(p: Address) -> bool {
    let root = heap().lock_root();
    root.locate_bitmap(p).is_some()
}

/// The memory tag of the chunk containing `p`.
#[cfg(feature = "memory_tagging")]
pub fn memory_tag(p: Address) -> u8 {
    let root = heap().lock_root();
    match root.locate_small(None, p) {
        Some(index) => root.zone_mut(index).tag_for(p),
        None => fatal!("{} is not a small-zone pointer", p),
    }
}
