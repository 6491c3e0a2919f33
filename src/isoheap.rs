//! The process-wide heap singleton and its two global locks.
//!
//! The root lock covers the small-zone engine and quarantine drains; the
//! big-zone lock covers the big-allocation list. They are only ever
//! nested, root then big, by the full-heap verifier. Both are a
//! build-time choice between a std mutex (default) and a spinlock
//! (feature `spin_locks`); neither is reentrant.

use lazy_static::lazy_static;

use crate::big_zone::BigList;
use crate::root::RootHandle;
use crate::util::memory;
use crate::util::Address;

cfg_if::cfg_if! {
    if #[cfg(feature = "spin_locks")] {
        pub type Lock<T> = spin::Mutex<T>;
        pub type LockGuard<'a, T> = spin::MutexGuard<'a, T>;

        fn acquire<T>(lock: &Lock<T>) -> LockGuard<'_, T> {
            lock.lock()
        }
    } else {
        pub type Lock<T> = std::sync::Mutex<T>;
        pub type LockGuard<'a, T> = std::sync::MutexGuard<'a, T>;

        fn acquire<T>(lock: &Lock<T>) -> LockGuard<'_, T> {
            // A thread that panicked under the lock was aborting on
            // corruption; the shared state itself is still consistent,
            // so poisoning carries no extra information here.
            lock.lock().unwrap_or_else(|e| e.into_inner())
        }
    }
}

pub struct IsoHeap {
    root: Lock<RootHandle>,
    big: Lock<BigList>,
    /// Accessible interior of the root record mapping.
    root_region: (Address, usize),
    /// Accessible interior of the zone registry mapping.
    zones_region: (Address, usize),
    #[cfg(feature = "no_zero_allocations")]
    zero_sentinel: Address,
}

lazy_static! {
    static ref HEAP: IsoHeap = IsoHeap::boot();
}

/// The heap singleton, created on first use.
pub fn heap() -> &'static IsoHeap {
    &HEAP
}

impl IsoHeap {
    fn boot() -> IsoHeap {
        let (root, root_region, zones_region) = RootHandle::boot();
        let big = BigList::new(root.record_address());
        #[cfg(feature = "no_zero_allocations")]
        let zero_sentinel = root.zero_sentinel();
        IsoHeap {
            root: Lock::new(root),
            big: Lock::new(big),
            root_region,
            zones_region,
            #[cfg(feature = "no_zero_allocations")]
            zero_sentinel,
        }
    }

    pub fn lock_root(&self) -> LockGuard<'_, RootHandle> {
        acquire(&self.root)
    }

    pub fn lock_big(&self) -> LockGuard<'_, BigList> {
        acquire(&self.big)
    }

    /// The PROT_NONE page returned for zero-size allocations.
    #[cfg(feature = "no_zero_allocations")]
    pub fn zero_sentinel(&self) -> Address {
        self.zero_sentinel
    }

    /// Make the whole allocator unusable: the root record and the zone
    /// registry become inaccessible until [`IsoHeap::unprotect_root`].
    pub fn protect_root(&self) {
        let (root, root_len) = self.root_region;
        let (zones, zones_len) = self.zones_region;
        memory::protect_none(root, root_len)
            .and(memory::protect_none(zones, zones_len))
            .unwrap_or_else(|e| fatal!("protecting the allocator root failed: {}", e));
        debug!("allocator root protected");
    }

    pub fn unprotect_root(&self) {
        let (root, root_len) = self.root_region;
        let (zones, zones_len) = self.zones_region;
        memory::unprotect_rw(root, root_len)
            .and(memory::unprotect_rw(zones, zones_len))
            .unwrap_or_else(|e| fatal!("unprotecting the allocator root failed: {}", e));
        debug!("allocator root unprotected");
    }
}
