//! Behaviour of the big-allocation path. Kept to one test so reuse
//! assertions cannot race sibling tests over the shared free list.

use isoheap::api;

const FIVE_MB: usize = 5 * 1024 * 1024;

#[test]
fn big_zone_lifecycle() {
    api::init();

    let p = api::alloc(FIVE_MB);
    assert!(!p.is_zero());
    assert!(p.is_aligned_to(4096));
    assert_eq!(api::chunk_size(p), FIVE_MB);

    // The whole payload is usable; the guard pages are not our problem
    // as long as we stay inside it.
    unsafe {
        p.store(0x11u8);
        (p + (FIVE_MB - 1)).store(0x22u8);
        assert_eq!(p.load::<u8>(), 0x11);
        assert_eq!((p + (FIVE_MB - 1)).load::<u8>(), 0x22);
    }

    // A freed big zone is reused for the next request that fits.
    api::free(p);
    api::flush_caches();
    let q = api::alloc(FIVE_MB);
    assert_eq!(q, p);

    // A smaller big request may also reuse it; the entry keeps its size.
    api::free(q);
    api::flush_caches();
    let r = api::alloc(FIVE_MB - 4096);
    assert_eq!(r, p);
    assert_eq!(api::chunk_size(r), FIVE_MB);

    // A permanent free retires the address range for good.
    api::free_permanent(r);
    let s = api::alloc(FIVE_MB);
    assert_ne!(s, p);
    api::free(s);
    api::flush_caches();

    api::verify_all();
}
