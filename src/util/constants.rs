//! Compile-time configuration of the allocator.
//!
//! Everything in here is a hard build-time choice. The relationships the
//! rest of the crate relies on are pinned down with `const_assert!` so a
//! bad local edit fails the build instead of corrupting a heap.

use static_assertions::const_assert;

/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: usize = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

/// log2 of the number of bytes in a 64-bit word
pub const LOG_BYTES_IN_WORD: usize = 3;
/// The number of bytes in a 64-bit word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
/// log2 of the number of bits in a 64-bit word
pub const LOG_BITS_IN_WORD: usize = LOG_BITS_IN_BYTE + LOG_BYTES_IN_WORD;
/// The number of bits in a 64-bit word
pub const BITS_IN_WORD: usize = 1 << LOG_BITS_IN_WORD;

/// log2 of the number of bytes in a page
pub const LOG_BYTES_IN_PAGE: usize = 12;
/// The number of bytes in a page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: usize = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/// Required alignment of every pointer handed out or taken back.
pub const ALIGNMENT: usize = 8;

/// The smallest chunk size a zone may be created with.
pub const SMALLEST_CHUNK_SZ: usize = 16;

/// The largest request serviced by the zone engine. Anything bigger goes
/// through the big-allocation path.
pub const SMALL_SZ_MAX: usize = 65536;

/// The largest request the big-allocation path accepts.
pub const BIG_SZ_MAX: usize = 1 << 30;

/// log2 of the fixed per-zone user region size.
pub const LOG_ZONE_USER_SIZE: usize = 22;
/// Fixed size of every zone's user region (4 MiB).
pub const ZONE_USER_SIZE: usize = 1 << LOG_ZONE_USER_SIZE;

/// Hard cap on the number of zone records.
pub const MAX_ZONES: usize = 8192;

/// Chunk sizes of the shared zones created at startup.
pub const DEFAULT_ZONE_SIZES: [usize; 10] =
    [16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192];

/// The largest default zone chunk size. Zones at or below this size get
/// canary chunks seeded at creation.
pub const MAX_DEFAULT_ZONE_SZ: usize = 8192;

/// Capacity of the per-zone cache of known-free bit-slots.
pub const BIT_SLOT_CACHE_SZ: usize = 255;

/// Entries in the per-thread most-recently-used zone cache.
pub const ZONE_CACHE_SZ: usize = 8;

/// Entries in the per-thread deferred-free quarantine.
pub const CHUNK_QUARANTINE_SZ: usize = 64;

/// A zone with no live chunks is retired once it has serviced
/// `chunk_count * ZONE_ALLOC_RETIRE` lifetime allocations.
pub const ZONE_ALLOC_RETIRE: usize = 32;

/// One in `CANARY_COUNT_DIV` chunks of a default-sized zone is reserved as
/// a permanent canary chunk (1% at 100).
pub const CANARY_COUNT_DIV: usize = 100;

/// Internal zones refuse requests they would waste more than
/// `1 << WASTED_SZ_MULTIPLIER_SHIFT` times the requested size on.
pub const WASTED_SZ_MULTIPLIER_SHIFT: usize = 3;

/// Canary values have their high byte zeroed so an unbounded string read
/// stops before leaking the full value.
pub const CANARY_VALIDATE_MASK: u64 = 0x00ff_ffff_ffff_ffff;

/// Sentinel for "no bit-slot".
pub const BAD_BIT_SLOT: u64 = u64::MAX;

/// A bitmap word in which all 32 chunks are in the allocated state.
pub const ALLOCATED_BITSLOTS: u64 = 0x5555_5555_5555_5555;

/// The byte pattern written over freed chunk bodies.
pub const POISON_BYTE: u8 = 0xde;

/// log2 of the span of one chunk-lookup-table bucket. One bucket covers
/// exactly one zone user region worth of address space.
pub const LOG_CHUNK_BUCKET: usize = LOG_ZONE_USER_SIZE;
/// Number of buckets in the chunk lookup table. High address bits beyond
/// the table alias; an aliased read fails containment and falls through.
pub const CHUNK_TABLE_ENTRIES: usize = 1 << 19;

/// Number of entries in the size-to-zone lookup table, indexed by
/// `chunk_size >> 4`.
pub const ZONE_TABLE_ENTRIES: usize = (SMALL_SZ_MAX >> 4) + 1;

const_assert!(SMALLEST_CHUNK_SZ.is_power_of_two());
const_assert!(SMALL_SZ_MAX.is_power_of_two());
const_assert!(ZONE_USER_SIZE.is_power_of_two());
const_assert!(CHUNK_TABLE_ENTRIES.is_power_of_two());
// Chunk counts must fill bitmap words exactly: the smallest count is
// ZONE_USER_SIZE / SMALL_SZ_MAX and every word holds 32 chunk states.
const_assert!(ZONE_USER_SIZE / SMALL_SZ_MAX >= 32);
// Zone indices live in u16 lookup-table entries.
const_assert!(MAX_ZONES <= u16::MAX as usize);
const_assert!(SMALLEST_CHUNK_SZ >= 2 * BYTES_IN_WORD);
