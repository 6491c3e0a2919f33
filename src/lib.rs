//! isoheap is a hardened general-purpose memory allocator. Its design
//! goal is to make the common memory-corruption primitives (linear
//! overflows, use-after-free, double frees, heap metadata attacks, type
//! confusion between differently sized allocations) statistically
//! expensive or deterministically detectable, while keeping
//! small-allocation throughput competitive with conventional size-class
//! allocators.
//!
//! The main moving parts:
//! * [Zones](zone) — fixed-chunk-size arenas with guard pages, a
//!   2-bit-per-chunk [bitmap](bitmap) state machine and randomly placed
//!   [canary](canary) chunks. All zone metadata pointers rest XOR-masked
//!   with per-zone secrets.
//! * The [big-allocation path](big_zone) — one guarded mapping per large
//!   request, tracked in a masked linked list with dual canaries.
//! * The [root](root) — the process-wide registry of zones, its secrets
//!   and the [lookup tables](lookup) that resolve a pointer to its owner
//!   in near-constant time.
//! * [Per-thread caches](tcache) — a most-recently-used zone cache and a
//!   deferred-free quarantine that delays chunk reuse.
//! * The [public API](api) — alloc/calloc/free-style entry points plus
//!   zone management, integrity audits and the root protection toggle.
//!
//! Detected anomalies are never recovered from: the allocator treats
//! them as adversarial and aborts with a diagnostic.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("isoheap only supports 64-bit targets");

#[macro_use]
extern crate log;

#[macro_use]
pub mod util;

pub mod api;
mod big_zone;
mod bitmap;
mod canary;
mod isoheap;
mod lookup;
mod root;
mod tcache;
mod verify;
mod zone;

pub use crate::root::ZoneHandle;
pub use crate::util::address::Address;
