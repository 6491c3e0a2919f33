//! Pointer-to-zone and size-to-zone lookup tables.
//!
//! Both tables are shared mappings pinned with `mlock`. They are written
//! only under the root lock (zone creation, retirement, destruction) but
//! read without any lock, so entries are 16-bit atomics. A stale or
//! aliased read is harmless: every hit is re-validated against the zone it
//! names before being believed.

use std::io::Result;
use std::sync::atomic::{AtomicU16, Ordering};

use crate::util::constants::*;
use crate::util::conversions::{address_to_chunk_bucket, chunk_size_to_table_index};
use crate::util::memory::{self, MapAnnotation, MmapStrategy};
use crate::util::Address;

/// Maps the high bits of a chunk address (its bucket) to the index of the
/// zone whose user region starts in that bucket, or 0.
#[derive(Copy, Clone)]
pub struct ChunkTable(Address);

impl ChunkTable {
    pub const BYTES: usize = CHUNK_TABLE_ENTRIES * std::mem::size_of::<u16>();

    pub fn create() -> Result<ChunkTable> {
        let base = memory::map_anonymous(
            Self::BYTES,
            MmapStrategy::default(),
            MapAnnotation::LookupTable,
        )?;
        memory::lock_resident(base, Self::BYTES);
        Ok(ChunkTable(base))
    }

    pub fn from_base(base: Address) -> ChunkTable {
        ChunkTable(base)
    }

    pub fn base(&self) -> Address {
        self.0
    }

    fn entry(&self, bucket: usize) -> Address {
        self.0 + bucket * std::mem::size_of::<u16>()
    }

    /// The zone index recorded for the bucket `p` falls in.
    pub fn get(&self, p: Address) -> u16 {
        let bucket = address_to_chunk_bucket(p);
        unsafe { self.entry(bucket).atomic_load::<AtomicU16>(Ordering::Relaxed) }
    }

    /// Record `index` as the zone whose user region starts at
    /// `user_start`.
    pub fn set(&self, user_start: Address, index: u16) {
        let bucket = address_to_chunk_bucket(user_start);
        unsafe { self.entry(bucket).atomic_store::<AtomicU16>(index, Ordering::Relaxed) }
    }

    /// Drop the bucket entry for `user_start`, but only if it still names
    /// `index` (a later zone may have claimed an aliasing bucket).
    pub fn clear(&self, user_start: Address, index: u16) {
        let bucket = address_to_chunk_bucket(user_start);
        let entry = self.entry(bucket);
        if unsafe { entry.atomic_load::<AtomicU16>(Ordering::Relaxed) } == index {
            unsafe { entry.atomic_store::<AtomicU16>(0, Ordering::Relaxed) }
        }
    }
}

/// Maps a rounded chunk size to the index of the first internal zone of
/// that size, or 0.
#[derive(Copy, Clone)]
pub struct ZoneSizeTable(Address);

impl ZoneSizeTable {
    pub const BYTES: usize = ZONE_TABLE_ENTRIES * std::mem::size_of::<u16>();

    pub fn create() -> Result<ZoneSizeTable> {
        let base = memory::map_anonymous(
            Self::BYTES,
            MmapStrategy::default(),
            MapAnnotation::LookupTable,
        )?;
        memory::lock_resident(base, Self::BYTES);
        Ok(ZoneSizeTable(base))
    }

    pub fn from_base(base: Address) -> ZoneSizeTable {
        ZoneSizeTable(base)
    }

    pub fn base(&self) -> Address {
        self.0
    }

    fn entry(&self, chunk_size: usize) -> Address {
        self.0 + chunk_size_to_table_index(chunk_size) * std::mem::size_of::<u16>()
    }

    pub fn get(&self, chunk_size: usize) -> u16 {
        unsafe { self.entry(chunk_size).atomic_load::<AtomicU16>(Ordering::Relaxed) }
    }

    pub fn set(&self, chunk_size: usize, index: u16) {
        unsafe { self.entry(chunk_size).atomic_store::<AtomicU16>(index, Ordering::Relaxed) }
    }
}
