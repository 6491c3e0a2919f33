//! Linear-overflow detection: a write running off the end of a live
//! chunk lands in the neighbouring chunk's leading canary, and the next
//! free of the overflowing chunk trips on it. Own binary: the test
//! leaves a deliberately corrupted canary behind.

use isoheap::api;

#[test]
#[should_panic(expected = "corrupted leading canary")]
fn overflow_into_neighbour_detected_on_free() {
    api::init();
    let handle = api::new_zone(64).expect("zone creation failed");

    // Grab enough chunks that two of them are adjacent; the free-slot
    // cache serves runs of consecutive chunks, so this is plentiful.
    let mut addrs: Vec<_> = (0..2000)
        .map(|_| api::zone_alloc(handle, 64).as_usize())
        .collect();
    addrs.sort_unstable();
    let lower = addrs
        .windows(2)
        .find(|w| w[1] - w[0] == 64)
        .expect("no adjacent chunks among 2000 allocations")[0];
    let p = unsafe { isoheap::Address::from_usize(lower) };
    let q = p + 64usize;

    // Freeing the upper chunk writes its canaries.
    api::free_permanent(q);

    // A 72-byte write through the 64-byte chunk clobbers the neighbour's
    // leading canary.
    unsafe { std::ptr::write_bytes(p.to_mut_ptr::<u8>(), 0x41, 72) };

    // The overflowing chunk's own free checks its neighbours.
    api::free_permanent(p);
}
