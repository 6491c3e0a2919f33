//! The big-allocation path.
//!
//! Requests above `SMALL_SZ_MAX` bypass the zone engine entirely. Each
//! one gets its own guarded user mapping plus a metadata record placed at
//! a randomised offset inside a dedicated guarded page. Records form a
//! singly-linked list whose head and `next` fields are stored XOR-masked
//! with a process secret, and every record carries two copies of an
//! address-bound canary; the list is only traversable under the big-zone
//! lock after unmasking.

use std::io::Result;

use crate::root::Root;
use crate::util::constants::*;
use crate::util::conversions;
use crate::util::memory::{self, MapAnnotation, MmapStrategy};
use crate::util::rand;
use crate::util::Address;

/// Metadata for one large allocation.
#[repr(C)]
pub struct BigZone {
    pub user_pages_start: Address,
    /// Page-rounded payload size.
    pub size: usize,
    pub free: bool,
    /// Raw address of the next record XOR the process big-zone mask; a
    /// masked zero ends the list.
    next: usize,
    canary_a: u64,
    canary_b: u64,
}

/// The big-zone list. Holds the root record address; every operation on
/// it must run under the big-zone lock.
pub struct BigList {
    root: Address,
}

impl BigList {
    pub fn new(root: Address) -> BigList {
        BigList { root }
    }

    #[allow(clippy::mut_from_ref)]
    fn root(&self) -> &mut Root {
        unsafe { self.root.as_mut_ref() }
    }

    /// Both canary copies of a record must equal this.
    fn canary_for(&self, record: Address, user_pages_start: Address) -> u64 {
        record.as_usize() as u64
            ^ (user_pages_start.as_usize() as u64).swap_bytes()
            ^ self.root().big_zone_canary_secret
    }

    fn mask(&self, raw: Address) -> usize {
        raw.as_usize() ^ self.root().big_zone_next_mask as usize
    }

    fn unmask(&self, masked: usize) -> Address {
        unsafe { Address::from_usize(masked ^ self.root().big_zone_next_mask as usize) }
    }

    fn head(&self) -> Address {
        self.unmask(self.root().big_zone_head)
    }

    fn set_head(&self, raw: Address) {
        self.root().big_zone_head = self.mask(raw);
    }

    fn check_record(&self, record: Address) -> &mut BigZone {
        let bz: &mut BigZone = unsafe { record.as_mut_ref() };
        let expect = self.canary_for(record, bz.user_pages_start);
        if bz.canary_a != expect || bz.canary_b != expect {
            fatal!("corrupted big zone record at {}", record);
        }
        bz
    }

    /// Service a big request: reuse a freed entry if one is large enough,
    /// otherwise map a new one.
    pub fn allocate(&self, size: usize) -> Result<Address> {
        let size = conversions::page_align_up(std::cmp::max(size, 1), memory::page_size());
        if size > BIG_SZ_MAX {
            fatal!("big allocation of {} bytes exceeds the supported maximum", size);
        }

        let mut cursor = self.head();
        while !cursor.is_zero() {
            let bz = self.check_record(cursor);
            if bz.free && bz.size >= size {
                bz.free = false;
                if let Err(e) = memory::advise_will_need(bz.user_pages_start, bz.size) {
                    debug!("madvise(WILLNEED) on big zone reuse failed: {}", e);
                }
                trace!("reusing big zone at {} ({} bytes)", bz.user_pages_start, bz.size);
                return Ok(bz.user_pages_start);
            }
            cursor = self.unmask(bz.next);
        }

        let user_pages_start =
            memory::map_guarded(size, MmapStrategy::default(), MapAnnotation::BigZoneData)?;
        let meta_page = match memory::map_guarded(
            memory::page_size(),
            MmapStrategy::default(),
            MapAnnotation::BigZoneMeta,
        ) {
            Ok(addr) => addr,
            Err(e) => {
                let _ = memory::unmap_guarded(user_pages_start, size);
                return Err(e);
            }
        };

        // The record sits at a random aligned offset within its page so a
        // leaked page address alone does not give away the metadata.
        let span = memory::page_size() - std::mem::size_of::<BigZone>();
        let offset =
            conversions::raw_align_down(rand::os_entropy_u64() as usize % span, ALIGNMENT);
        let record = meta_page + offset;
        let canary = self.canary_for(record, user_pages_start);
        unsafe {
            record.store(BigZone {
                user_pages_start,
                size,
                free: false,
                next: self.mask(self.head()),
                canary_a: canary,
                canary_b: canary,
            });
        }
        self.set_head(record);
        trace!("created big zone at {} ({} bytes)", user_pages_start, size);
        Ok(user_pages_start)
    }

    /// Free the big allocation starting at `p`. Returns false when no
    /// record matches (the caller decides whether that is fatal). Interior
    /// addresses and double frees abort.
    pub fn free(&self, p: Address, permanent: bool) -> bool {
        let mut predecessor = Address::ZERO;
        let mut cursor = self.head();
        while !cursor.is_zero() {
            let bz = self.check_record(cursor);
            if p == bz.user_pages_start {
                if bz.free {
                    fatal!("double free of big zone at {}", p);
                }
                self.release(cursor, predecessor, permanent);
                return true;
            }
            if p > bz.user_pages_start && p < bz.user_pages_start + bz.size {
                fatal!("free of {} which is interior to the big zone at {}", p, bz.user_pages_start);
            }
            predecessor = cursor;
            cursor = self.unmask(bz.next);
        }
        false
    }

    fn release(&self, record: Address, predecessor: Address, permanent: bool) {
        let bz: &mut BigZone = unsafe { record.as_mut_ref() };
        #[cfg(feature = "sanitize_chunks")]
        memory::set(bz.user_pages_start, POISON_BYTE, bz.size);

        if !permanent {
            bz.free = true;
            if let Err(e) = memory::advise_dont_need(bz.user_pages_start, bz.size) {
                debug!("madvise(DONTNEED) on big zone failed: {}", e);
            }
            return;
        }

        // Unlink, wipe the record, then make both the payload and the
        // metadata page permanently inaccessible.
        // The canaries do not cover `next`, so patching the predecessor
        // needs no canary rewrite.
        let next = bz.next;
        if predecessor.is_zero() {
            self.root().big_zone_head = next;
        } else {
            let prev: &mut BigZone = unsafe { predecessor.as_mut_ref() };
            prev.next = next;
        }
        let user_pages_start = bz.user_pages_start;
        let size = bz.size;
        unsafe {
            record.store(BigZone {
                user_pages_start: Address::ZERO,
                size: 0,
                free: true,
                next: 0,
                canary_a: 0,
                canary_b: 0,
            });
        }
        let page = memory::page_size();
        let meta_page = record.align_down(page);
        if let Err(e) = memory::seal_guarded(user_pages_start, size)
            .and(memory::protect_none(meta_page, page))
        {
            warn!("sealing permanently freed big zone failed: {}", e);
        }
    }

    /// The payload size of the big zone starting exactly at `p`, if any.
    /// Interior addresses abort.
    pub fn size_of(&self, p: Address) -> Option<usize> {
        let mut cursor = self.head();
        while !cursor.is_zero() {
            let bz = self.check_record(cursor);
            if p == bz.user_pages_start {
                return Some(bz.size);
            }
            if p > bz.user_pages_start && p < bz.user_pages_start + bz.size {
                fatal!("{} is interior to the big zone at {}", p, bz.user_pages_start);
            }
            cursor = self.unmask(bz.next);
        }
        None
    }

    /// Walk the whole list verifying both canaries of every record.
    pub fn verify(&self) {
        let mut cursor = self.head();
        while !cursor.is_zero() {
            let bz = self.check_record(cursor);
            cursor = self.unmask(bz.next);
        }
    }
}
