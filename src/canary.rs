//! Chunk canaries.
//!
//! A canary is written at the first and last 8 bytes of a chunk whenever
//! the chunk is freed, and into permanently reserved canary chunks at zone
//! creation. The value is derived from a per-zone secret and the chunk
//! address, with the high byte zeroed so an unbounded string read through
//! the chunk cannot leak the whole value.

use crate::util::constants::*;
use crate::util::Address;

/// The canary value for a chunk.
pub fn value_for(canary_secret: u64, chunk: Address) -> u64 {
    (canary_secret ^ chunk.as_usize() as u64) & CANARY_VALIDATE_MASK
}

/// Write the canary at both ends of a chunk.
pub fn write(canary_secret: u64, chunk: Address, chunk_size: usize) {
    let value = value_for(canary_secret, chunk);
    unsafe {
        chunk.store(value);
        (chunk + (chunk_size - BYTES_IN_WORD)).store(value);
    }
}

/// Verify the canary at both ends of a chunk. Any mismatch is treated as
/// an adversarial write and aborts. The expected value is never printed.
pub fn verify(canary_secret: u64, chunk: Address, chunk_size: usize) {
    let value = value_for(canary_secret, chunk);
    let leading = unsafe { chunk.load::<u64>() };
    if leading != value {
        fatal!("corrupted leading canary in chunk {}", chunk);
    }
    let trailing = unsafe { (chunk + (chunk_size - BYTES_IN_WORD)).load::<u64>() };
    if trailing != value {
        fatal!("corrupted trailing canary in chunk {}", chunk);
    }
}

/// Clear the leading canary before a chunk is handed back out, so the
/// caller never observes a secret-derived value.
pub fn wipe_leading(chunk: Address) {
    unsafe { chunk.store(0u64) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_byte_is_masked() {
        let chunk = Address::from_ptr(&0u64);
        let v = value_for(u64::MAX, chunk);
        assert_eq!(v >> 56, 0);
    }

    #[test]
    fn write_then_verify() {
        let mut buf = vec![0u64; 8];
        let chunk = Address::from_mut_ptr(buf.as_mut_ptr());
        write(0x1122_3344_5566_7788, chunk, 64);
        verify(0x1122_3344_5566_7788, chunk, 64);
    }

    #[test]
    #[should_panic(expected = "corrupted leading canary")]
    fn detects_flip() {
        let mut buf = vec![0u64; 4];
        let chunk = Address::from_mut_ptr(buf.as_mut_ptr());
        write(0xdead_beef, chunk, 32);
        unsafe { chunk.store(chunk.load::<u64>() ^ 1) };
        verify(0xdead_beef, chunk, 32);
    }

    #[test]
    #[should_panic(expected = "corrupted trailing canary")]
    fn detects_trailing_flip() {
        let mut buf = vec![0u64; 4];
        let chunk = Address::from_mut_ptr(buf.as_mut_ptr());
        write(0xdead_beef, chunk, 32);
        unsafe { (chunk + 24usize).store((chunk + 24usize).load::<u64>() ^ 1) };
        verify(0xdead_beef, chunk, 32);
    }

    #[test]
    fn wipe_removes_value() {
        let mut buf = vec![0xffu64; 2];
        let chunk = Address::from_mut_ptr(buf.as_mut_ptr());
        write(42, chunk, 16);
        wipe_leading(chunk);
        assert_eq!(unsafe { chunk.load::<u64>() }, 0);
    }
}
