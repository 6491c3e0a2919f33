//! The fatal paths: every detected anomaly aborts. Each test trips its
//! check before any heap state is mutated, so the surviving tests keep a
//! consistent heap.

use isoheap::api;
use isoheap::Address;

#[test]
#[should_panic(expected = "overflows")]
fn calloc_overflow_aborts() {
    api::calloc(usize::MAX, 16);
}

#[test]
#[should_panic(expected = "unaligned")]
fn misaligned_free_aborts() {
    let p = api::alloc(64);
    api::free(p + 1usize);
}

#[test]
#[should_panic(expected = "double free")]
fn double_free_aborts_on_drain() {
    let p = api::alloc(32);
    api::free(p);
    api::free(p);
    // Both entries sit in the quarantine; the second one is caught the
    // moment they are actually returned to the zone.
    api::flush_caches();
}

#[test]
#[should_panic(expected = "reserved chunk")]
fn double_permanent_free_aborts() {
    let p = api::alloc(32);
    api::free_permanent(p);
    api::free_permanent(p);
}

#[test]
#[should_panic(expected = "free_size claims")]
fn free_size_with_a_lie_aborts() {
    let p = api::alloc(64);
    api::free_size(p, 4096);
}

#[test]
#[should_panic(expected = "interior")]
fn interior_big_free_aborts() {
    let p = api::alloc(1 << 20);
    api::free_permanent(p + 4096usize);
}

#[test]
#[should_panic(expected = "no zone owns")]
fn foreign_pointer_free_aborts() {
    let foreign = Box::new(0u64);
    api::free_permanent(Address::from_ref(&*foreign));
}
