//! A 64-bit non-cryptographic PRNG.
//!
//! The generator is xorshift64* — fast, statistically fine for picking
//! slots and deriving masks, and worthless to an attacker only as long as
//! the state stays secret. The state is seeded from the OS and must never
//! be logged or written out.

use crate::util::memory::wrap_libc_call;

/// Read 8 bytes of OS entropy. Failure here is fatal: without a seed none
/// of the masking or canary scheme is worth anything.
pub fn os_entropy_u64() -> u64 {
    let mut val: u64 = 0;
    let val_ptr: *mut u64 = &mut val;
    wrap_libc_call(
        &|| unsafe {
            libc::getrandom(
                val_ptr as *mut libc::c_void,
                std::mem::size_of::<u64>(),
                0,
            )
        },
        std::mem::size_of::<u64>() as libc::ssize_t,
    )
    .unwrap_or_else(|e| panic!("getrandom failed: {}", e));
    val
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct Prng {
    state: u64,
}

impl Prng {
    /// Create a generator seeded from the OS.
    pub fn seeded() -> Prng {
        let mut state = os_entropy_u64();
        // xorshift has a zero fixed point
        while state == 0 {
            state = os_entropy_u64();
        }
        Prng { state }
    }

    pub fn next_u64(&mut self) -> u64 {
        // Vigna's xorshift64* parameters
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    /// A value uniform-ish in `[0, bound)`. `bound` must be non-zero.
    pub fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_differ() {
        // Two seedings colliding would mean the OS entropy source is broken.
        let mut a = Prng::seeded();
        let mut b = Prng::seeded();
        assert_ne!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn below_bound() {
        let mut p = Prng::seeded();
        for _ in 0..1000 {
            assert!(p.below(7) < 7);
        }
    }

    #[test]
    fn entropy_nonconstant() {
        assert_ne!(os_entropy_u64(), os_entropy_u64());
    }
}
