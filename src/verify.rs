//! Full-heap integrity audits.
//!
//! Walks every zone bitmap verifying each canary-carrying chunk and the
//! size-chain links, then walks the big-zone list verifying both canaries
//! of every record. Used by fuzzing builds on every operation and by the
//! teardown audit.

use crate::isoheap::heap;
use crate::root::ZoneHandle;

/// Audit the whole heap. This is the one path allowed to hold the root
/// and big-zone locks at the same time (root first).
pub fn verify_all() {
    let root = heap().lock_root();
    root.verify_all_zones();
    let big = heap().lock_big();
    big.verify();
    drop(big);
    drop(root);
}

/// Audit a single caller-owned zone.
pub fn verify_zone(handle: ZoneHandle) {
    let root = heap().lock_root();
    let index = root.resolve_handle(handle);
    root.zone_mut(index).verify();
}
