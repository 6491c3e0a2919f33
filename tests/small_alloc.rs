//! Behaviour of the small (zone-engine) allocation path through the
//! public API.

use isoheap::api;
use isoheap::util::constants::{ALIGNMENT, SMALL_SZ_MAX};
use isoheap::Address;
use rand::Rng;

#[test]
fn basic_roundtrip() {
    api::init();
    let p = api::alloc(48);
    assert!(!p.is_zero());
    assert!(p.is_aligned_to(ALIGNMENT));
    assert!(api::chunk_size(p) >= 48);
    // The chunk is fully writable.
    unsafe { std::ptr::write_bytes(p.to_mut_ptr::<u8>(), 0x7a, 48) };
    api::free(p);
}

#[test]
fn request_rounds_to_a_size_class() {
    let p = api::alloc(33);
    let got = api::chunk_size(p);
    assert!(got >= 64, "33-byte request got a {}-byte chunk", got);
    // Size separation keeps small requests out of large-chunk zones.
    assert!(got < 1024);
    api::free(p);
}

#[test]
fn calloc_zeroes_memory() {
    let p = api::calloc(10, 25);
    assert!(!p.is_zero());
    for i in 0..250usize {
        assert_eq!(unsafe { (p + i).load::<u8>() }, 0);
    }
    api::free_size(p, 250);
}

#[test]
fn zero_size_returns_the_sentinel() {
    let p = api::alloc(0);
    let q = api::alloc(0);
    assert!(!p.is_zero());
    assert_eq!(p, q);
    assert_eq!(api::chunk_size(p), 0);
    // Freeing the sentinel is a no-op, any number of times.
    api::free(p);
    api::free(q);
}

#[test]
fn free_of_null_is_a_noop() {
    api::free(Address::ZERO);
    api::free(Address::ZERO);
}

#[test]
fn small_and_large_chunks_never_share_a_zone() {
    let small = api::alloc(16);
    let large = api::alloc(4096);
    assert!(api::chunk_size(small) < 1024);
    assert!(api::chunk_size(large) >= 4096);
    assert_ne!(api::chunk_size(small), api::chunk_size(large));
    api::free(small);
    api::free(large);
}

#[test]
fn small_size_boundary() {
    // Exactly SMALL_SZ_MAX is still the zone engine.
    let p = api::alloc(SMALL_SZ_MAX);
    assert_eq!(api::chunk_size(p), SMALL_SZ_MAX);
    // One byte more takes the big path and is page-rounded.
    let q = api::alloc(SMALL_SZ_MAX + 1);
    assert!(api::chunk_size(q) > SMALL_SZ_MAX);
    assert_eq!(api::chunk_size(q) % 4096, 0);
    api::free(p);
    api::free(q);
}

#[test]
fn quarantine_delays_reuse() {
    // Start from an empty quarantine so the drain threshold is ours.
    api::flush_caches();
    let p = api::alloc(32);
    api::free(p);
    // The freed chunk sits in this thread's quarantine; nothing the
    // thread allocates before a drain can be handed that chunk.
    for _ in 0..10 {
        let q = api::alloc(32);
        assert_ne!(q, p);
        api::free(q);
    }
    api::flush_caches();
}

#[test]
fn user_data_is_not_clobbered_by_other_operations() {
    let keeper = api::alloc(128);
    for i in 0..128usize {
        unsafe { (keeper + i).store((i as u8) ^ 0x5a) };
    }
    // Churn the same size class.
    for _ in 0..300 {
        let p = api::alloc(128);
        assert_ne!(p, keeper);
        api::free(p);
    }
    for i in 0..128usize {
        assert_eq!(unsafe { (keeper + i).load::<u8>() }, (i as u8) ^ 0x5a);
    }
    api::free(keeper);
}

#[test]
fn randomized_sizes_roundtrip() {
    let mut rng = rand::rng();
    let mut live = vec![];
    for _ in 0..200 {
        let size = rng.random_range(1..=SMALL_SZ_MAX);
        let p = api::alloc(size);
        assert!(!p.is_zero());
        assert!(p.is_aligned_to(ALIGNMENT));
        assert!(api::chunk_size(p) >= size);
        unsafe { p.store(0xa5u8) };
        live.push(p);
    }
    for p in live {
        api::free(p);
    }
    api::flush_caches();
    api::verify_all();
}

#[test]
fn metadata_addresses_are_not_user_addresses() {
    let p = api::alloc(64);
    assert!(!api::is_metadata_address(p));
    api::free(p);
}
