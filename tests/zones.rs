//! Caller-owned (private) zones and the integrity audits.

use isoheap::api;
use isoheap::util::constants::SMALL_SZ_MAX;

#[test]
fn private_zone_lifecycle() {
    api::init();
    let handle = api::new_zone(256).expect("zone creation failed");
    let p = api::zone_alloc(handle, 200);
    assert!(!p.is_zero());
    assert_eq!(api::chunk_size(p), 256);
    api::verify_zone(handle);

    api::free_permanent(p);
    api::verify_zone(handle);
    api::destroy_zone(handle);
}

#[test]
#[should_panic(expected = "private zone")]
fn oversized_private_request_aborts() {
    let handle = api::new_zone(128).expect("zone creation failed");
    api::zone_alloc(handle, 4096);
}

#[test]
#[should_panic(expected = "destroyed zone")]
fn stale_handle_aborts() {
    let handle = api::new_zone(64).expect("zone creation failed");
    api::destroy_zone(handle);
    api::zone_alloc(handle, 32);
}

#[test]
fn full_private_zone_runs_dry() {
    // 64 KiB chunks: exactly 64 chunks per zone, no canary chunks.
    let handle = api::new_zone(SMALL_SZ_MAX).expect("zone creation failed");
    let mut chunks = vec![];
    for _ in 0..64 {
        let p = api::zone_alloc(handle, SMALL_SZ_MAX);
        assert!(!p.is_zero());
        chunks.push(p);
    }
    assert!(api::zone_alloc(handle, SMALL_SZ_MAX).is_zero());

    for p in chunks {
        api::free_permanent(p);
    }
    api::verify_zone(handle);
    api::destroy_zone(handle);
}

#[test]
fn write_after_free_is_detected() {
    let handle = api::new_zone(512).expect("zone creation failed");
    let p = api::zone_alloc(handle, 512);
    api::free_permanent(p);

    // The freed chunk now carries a canary at both ends. Flip a byte the
    // way a use-after-free write would and the audit must abort.
    let original = unsafe { p.load::<u64>() };
    unsafe { p.store(original ^ 0x80) };
    let audit = std::panic::catch_unwind(|| api::verify_zone(handle));
    assert!(audit.is_err(), "corrupted canary went unnoticed");

    // Restore the canary so the rest of the heap stays auditable.
    unsafe { p.store(original) };
    api::verify_zone(handle);
    api::destroy_zone(handle);
}
