//! OS page primitives.
//!
//! Everything the allocator wants from the kernel goes through here:
//! anonymous private mappings at PRNG-chosen hint addresses, page
//! protection changes, advisory release/population, and pinning of hot
//! structures. All wrappers return `std::io::Result` built from
//! `Error::last_os_error()`.

use std::io::Result;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::util::rand;
use crate::util::Address;

/// The protection flags for a new mapping.
#[derive(Debug, Copy, Clone)]
pub enum MmapProtection {
    /// Allow read + write
    ReadWrite,
    /// Do not allow any access
    NoAccess,
}

impl MmapProtection {
    fn get_native_flags(&self) -> i32 {
        use libc::{PROT_NONE, PROT_READ, PROT_WRITE};
        match self {
            Self::ReadWrite => PROT_READ | PROT_WRITE,
            Self::NoAccess => PROT_NONE,
        }
    }
}

/// Strategy for performing mmap.
#[derive(Debug, Copy, Clone)]
pub struct MmapStrategy {
    /// The protection flags for mmap.
    pub prot: MmapProtection,
    /// Pre-fault the pages (MAP_POPULATE).
    pub populate: bool,
}

impl std::default::Default for MmapStrategy {
    fn default() -> Self {
        Self {
            prot: MmapProtection::ReadWrite,
            populate: false,
        }
    }
}

impl MmapStrategy {
    pub fn prot(self, prot: MmapProtection) -> Self {
        Self { prot, ..self }
    }

    pub fn populate(self, populate: bool) -> Self {
        Self { populate, ..self }
    }

    fn get_mmap_flags(&self) -> i32 {
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if self.populate {
            flags |= libc::MAP_POPULATE;
        }
        flags
    }
}

/// Annotation for an mmap entry.
///
/// With the `named_mappings` feature, human-readable names are attached
/// to every mapping via `prctl(PR_SET_VMA_ANON_NAME)` (Linux 5.17+,
/// logged and ignored on older kernels). Without the feature the
/// annotation still exists so call sites read the same; it just goes
/// nowhere.
#[derive(Debug, Copy, Clone)]
pub enum MapAnnotation {
    Root,
    Zones,
    UserPages { chunk_size: usize },
    Bitmap { chunk_size: usize },
    TagStrip,
    LookupTable,
    BigZoneData,
    BigZoneMeta,
    Sentinel,
}

impl std::fmt::Display for MapAnnotation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MapAnnotation::Root => write!(f, "isoheap:root"),
            MapAnnotation::Zones => write!(f, "isoheap:zones"),
            MapAnnotation::UserPages { chunk_size } => {
                write!(f, "isoheap:user:{}", chunk_size)
            }
            MapAnnotation::Bitmap { chunk_size } => {
                write!(f, "isoheap:bitmap:{}", chunk_size)
            }
            MapAnnotation::TagStrip => write!(f, "isoheap:tags"),
            MapAnnotation::LookupTable => write!(f, "isoheap:lookup"),
            MapAnnotation::BigZoneData => write!(f, "isoheap:big"),
            MapAnnotation::BigZoneMeta => write!(f, "isoheap:bigmeta"),
            MapAnnotation::Sentinel => write!(f, "isoheap:zero-sentinel"),
        }
    }
}

pub fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// The system page size, cached after the first call.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    PAGE_SIZE.store(sz, Ordering::Relaxed);
    sz
}

/// A pseudo-random, page-aligned mapping hint. The kernel is free to
/// ignore it; the point is only that consecutive mappings land at
/// unpredictable, unrelated addresses.
fn random_hint() -> Address {
    let r = rand::os_entropy_u64() as usize;
    unsafe { Address::from_usize(0x100_0000_0000 + ((r << 12) & 0x3fff_ffff_f000)) }
}

/// Map an anonymous private region of `size` bytes (page-rounded by the
/// kernel) at a randomised address.
pub fn map_anonymous(size: usize, strategy: MmapStrategy, anno: MapAnnotation) -> Result<Address> {
    let prot = strategy.prot.get_native_flags();
    let flags = strategy.get_mmap_flags();
    let hint = random_hint();
    let ret = unsafe { libc::mmap(hint.to_mut_ptr(), size, prot, flags, -1, 0) };
    if ret == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    let addr = Address::from_mut_ptr(ret);
    set_vma_name(addr, size, anno);
    Ok(addr)
}

/// Map `size` bytes (page-rounded) bracketed by one PROT_NONE guard page
/// below and one above. Returns the start of the accessible interior.
pub fn map_guarded(size: usize, strategy: MmapStrategy, anno: MapAnnotation) -> Result<Address> {
    let page = page_size();
    let interior = crate::util::conversions::page_align_up(size, page);
    let base = map_anonymous(interior + 2 * page, strategy, anno)?;
    protect_none(base, page)?;
    protect_none(base + (page + interior), page)?;
    Ok(base + page)
}

/// Unmap a region previously created with `map_guarded`, guards included.
pub fn unmap_guarded(data: Address, size: usize) -> Result<()> {
    let page = page_size();
    let interior = crate::util::conversions::page_align_up(size, page);
    munmap(data - page, interior + 2 * page)
}

/// Make a region (guards included) of a `map_guarded` mapping permanently
/// inaccessible instead of returning it to the OS.
pub fn seal_guarded(data: Address, size: usize) -> Result<()> {
    let page = page_size();
    let interior = crate::util::conversions::page_align_up(size, page);
    protect_none(data - page, interior + 2 * page)
}

pub fn munmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

/// Change the protection of a region to no access.
pub fn protect_none(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, libc::PROT_NONE) },
        0,
    )
}

/// Restore read + write access to a region.
pub fn unprotect_rw(start: Address, size: usize) -> Result<()> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    wrap_libc_call(
        &|| unsafe { libc::mprotect(start.to_mut_ptr(), size, prot) },
        0,
    )
}

/// Tell the kernel the region's contents are disposable.
pub fn advise_dont_need(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::madvise(start.to_mut_ptr(), size, libc::MADV_DONTNEED) },
        0,
    )
}

/// Tell the kernel the region is about to be used.
pub fn advise_will_need(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(
        &|| unsafe { libc::madvise(start.to_mut_ptr(), size, libc::MADV_WILLNEED) },
        0,
    )
}

/// Pin a hot structure's pages. Not being able to (RLIMIT_MEMLOCK) costs
/// performance, not correctness, so failure is only logged.
pub fn lock_resident(start: Address, size: usize) {
    let result = wrap_libc_call(&|| unsafe { libc::mlock(start.to_mut_ptr(), size) }, 0);
    if let Err(e) = result {
        debug!("mlock of {} ({} bytes) failed: {}", start, size, e);
    }
}

/// Set a range of memory to 0.
pub fn zero(start: Address, len: usize) {
    set(start, 0, len);
}

/// Set a range of memory to the given value. Similar to memset.
pub fn set(start: Address, val: u8, len: usize) {
    unsafe {
        std::ptr::write_bytes(start.to_mut_ptr::<u8>(), val, len);
    }
}

#[cfg(feature = "named_mappings")]
fn set_vma_name(start: Address, size: usize, annotation: MapAnnotation) {
    // `PR_SET_VMA` is new in Linux 5.17. On an older kernel prctl returns
    // EINVAL; this is debugging aid only, so log instead of failing.
    let anno_cstr = std::ffi::CString::new(annotation.to_string()).unwrap();
    let result = wrap_libc_call(
        &|| unsafe {
            libc::prctl(
                libc::PR_SET_VMA,
                libc::PR_SET_VMA_ANON_NAME,
                start.to_ptr::<libc::c_void>(),
                size,
                anno_cstr.as_ptr(),
            )
        },
        0,
    );
    if let Err(e) = result {
        debug!("prctl(PR_SET_VMA_ANON_NAME) failed: {}", e);
    }
}

#[cfg(not(feature = "named_mappings"))]
fn set_vma_name(_start: Address, _size: usize, _annotation: MapAnnotation) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_mapping_roundtrip() {
        let data = map_guarded(8192, MmapStrategy::default(), MapAnnotation::LookupTable)
            .expect("map_guarded failed");
        assert!(data.is_aligned_to(page_size()));
        // Interior is usable.
        unsafe {
            data.store(0x41u8);
            assert_eq!(data.load::<u8>(), 0x41);
            (data + 8191usize).store(0x42u8);
        }
        unmap_guarded(data, 8192).expect("unmap failed");
    }

    #[test]
    fn set_and_zero() {
        let data = map_guarded(4096, MmapStrategy::default(), MapAnnotation::LookupTable).unwrap();
        set(data, 0xab, 4096);
        assert_eq!(unsafe { (data + 100usize).load::<u8>() }, 0xab);
        zero(data, 4096);
        assert_eq!(unsafe { (data + 100usize).load::<u8>() }, 0);
        unmap_guarded(data, 4096).unwrap();
    }
}
