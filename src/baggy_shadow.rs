//! Baggy shadow size table.
//!
//! One process-lifetime `mmap(MAP_NORESERVE)` reservation covering the
//! full 48-bit canonical userspace range divided by the 16-byte slot size —
//! 16 TiB of *virtual* address space, never committed by the kernel except
//! where a slot is actually touched. This is the same trick AddressSanitizer
//! uses for its shadow memory: reserving an enormous sparse region is cheap
//! as long as nothing walks it densely, and `MAP_NORESERVE` keeps the
//! overcommit accountant from charging for it up front.

use core::sync::atomic::{AtomicU8, Ordering};

pub const SLOT_BITS: u32 = 4;
pub const SLOT_SIZE: usize = 1 << SLOT_BITS;
const ADDR_BITS: u32 = 48;
const TABLE_LEN: usize = 1usize << (ADDR_BITS - SLOT_BITS);

struct ShadowTable {
    base: usize,
}

impl ShadowTable {
    fn new() -> Self {
        let addr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                TABLE_LEN,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        assert_ne!(addr, libc::MAP_FAILED, "failed to reserve baggy shadow table");
        ShadowTable { base: addr as usize }
    }

    fn slot(&self, addr: usize) -> &AtomicU8 {
        let index = addr >> SLOT_BITS;
        debug_assert!(index < TABLE_LEN, "address outside canonical 48-bit range");
        unsafe { &*((self.base + index) as *const AtomicU8) }
    }
}

lazy_static::lazy_static! {
    static ref TABLE: ShadowTable = ShadowTable::new();
}

/// Eagerly reserves the table; call during `pool_init_runtime` so the first
/// baggy allocation isn't also the first touch of this lazy static.
pub fn ensure_initialized() {
    lazy_static::initialize(&TABLE);
}

/// Reads the size class stored for the slot covering `addr`. `0` means no
/// live baggy object covers this slot.
pub fn read(addr: usize) -> u8 {
    TABLE.slot(addr).load(Ordering::Acquire)
}

/// Stamps every slot covering `[base, base + 2^size_class)` with
/// `size_class`. `base` must be `2^size_class`-aligned.
pub fn stamp_range(base: usize, size_class: u8) {
    debug_assert_eq!(base & ((1usize << size_class) - 1), 0);
    let slots = (1usize << size_class) >> SLOT_BITS;
    for i in 0..slots.max(1) {
        TABLE.slot(base + (i << SLOT_BITS)).store(size_class, Ordering::Release);
    }
}

/// Clears every slot covering `[base, base + 2^size_class)`.
pub fn clear_range(base: usize, size_class: u8) {
    let slots = (1usize << size_class) >> SLOT_BITS;
    for i in 0..slots.max(1) {
        TABLE.slot(base + (i << SLOT_BITS)).store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_then_clear_roundtrip() {
        ensure_initialized();
        // Use a base far from other tests' ranges to avoid cross-test
        // interference within the shared process-wide table.
        let base = 0x4000_0000usize;
        stamp_range(base, 6); // 64-byte object, 4 slots
        assert_eq!(read(base), 6);
        assert_eq!(read(base + 48), 6);
        clear_range(base, 6);
        assert_eq!(read(base), 0);
    }
}
