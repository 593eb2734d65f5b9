//! Out-of-bounds rewrite table.
//!
//! A single process-wide reserved virtual region, `PROT_NONE` end to end,
//! handed out one slot at a time by a monotonic cursor. Because the cursor
//! only ever moves forward, the table of `(invalid_ptr, real_ptr)` pairs is
//! naturally sorted by `invalid_ptr` in insertion order — a binary search
//! over an append-only array does the job of a per-pool OOB index without
//! needing a second tree type, and — same payoff as the debug-metadata
//! arena — it's safe for the fault handler to read lock-free.

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Size of the reserved "invalid pointer" region: large enough, and placed
/// high enough in the address space, that a single mask test distinguishes
/// rewrite pointers from ordinary ones.
const REGION_LEN: usize = 1 << 30;
/// Distance between successive minted rewrite pointers. Real code only ever
/// compares a rewrite pointer for equality or feeds it back through
/// `get_actual_value`, but giving each one a page-sized slot means any
/// incidental pointer arithmetic the instrumented program performs on it
/// before doing so doesn't accidentally collide with a neighboring slot.
const SLOT_STRIDE: usize = 4096;
const MAX_ENTRIES: usize = REGION_LEN / SLOT_STRIDE;

#[repr(C)]
struct Entry {
    invalid_ptr: AtomicU64,
    real_ptr: AtomicU64,
    pool_tag: AtomicU32,
    _pad: u32,
}

struct OobRegion {
    base: usize,
    cursor: AtomicUsize,
    entries_base: usize,
    count: AtomicUsize,
}

fn mmap_anon(len: usize, prot: libc::c_int, hint: usize) -> Option<usize> {
    let addr = unsafe {
        libc::mmap(
            hint as *mut libc::c_void,
            len,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        None
    } else {
        Some(addr as usize)
    }
}

impl OobRegion {
    fn init() -> Self {
        // High hint address, best-effort; the kernel picks a real one if the
        // hint is unavailable. 0x7000_0000_0000 sits well above typical heap
        // and mmap-base placements on x86_64 Linux, leaving the mask test
        // `(p & !(REGION_LEN-1)) == base` usable in practice.
        let base = mmap_anon(REGION_LEN, libc::PROT_NONE, 0x7000_0000_0000)
            .or_else(|| mmap_anon(REGION_LEN, libc::PROT_NONE, 0))
            .expect("failed to reserve OOB rewrite region");

        let entries_len = MAX_ENTRIES * core::mem::size_of::<Entry>();
        let entries_base = mmap_anon(entries_len, libc::PROT_READ | libc::PROT_WRITE, 0)
            .expect("failed to reserve OOB rewrite table");

        OobRegion { base, cursor: AtomicUsize::new(0), entries_base, count: AtomicUsize::new(0) }
    }

    fn entry(&self, idx: usize) -> &Entry {
        unsafe { &*((self.entries_base + idx * core::mem::size_of::<Entry>()) as *const Entry) }
    }
}

lazy_static::lazy_static! {
    static ref REGION: OobRegion = OobRegion::init();
}

/// Eagerly reserves the region; call during `pool_init_runtime` so the first
/// bounds violation isn't also the first time we touch this lazy static.
pub fn ensure_initialized() {
    lazy_static::initialize(&REGION);
}

/// True if `p` lies in the reserved rewrite region. The mask test
/// `(p & ~(invalid_upper-1)) != 0` discriminates it from an ordinary
/// heap/stack/global address as long as the region is reserved high enough,
/// which `init` arranges for.
pub fn is_rewrite_pointer(p: usize) -> bool {
    p >= REGION.base && p < REGION.base + REGION_LEN
}

/// Hands out a fresh rewrite pointer standing in for `real_ptr`, tagged with
/// `pool_tag` for diagnostics. Returns `None` once the region is exhausted —
/// callers fall back to permissive (return `real_ptr` unchanged) or strict
/// (abort) behavior.
pub fn mint(real_ptr: usize, pool_tag: u32) -> Option<usize> {
    let slot = REGION.cursor.fetch_add(1, Ordering::Relaxed);
    if slot >= MAX_ENTRIES {
        return None;
    }
    let invalid_ptr = REGION.base + slot * SLOT_STRIDE;
    let e = REGION.entry(slot);
    e.real_ptr.store(real_ptr as u64, Ordering::Relaxed);
    e.pool_tag.store(pool_tag, Ordering::Relaxed);
    e.invalid_ptr.store(invalid_ptr as u64, Ordering::Release);
    REGION.count.fetch_add(1, Ordering::Release);
    Some(invalid_ptr)
}

/// Reverses a rewrite: given a pointer anywhere inside a minted slot, returns
/// the real pointer and the pool tag it was minted for. Lock-free: safe to
/// call from the fault handler as well as from `get_actual_value`.
pub fn resolve(p: usize) -> Option<(usize, u32)> {
    if !is_rewrite_pointer(p) {
        return None;
    }
    let slot = (p - REGION.base) / SLOT_STRIDE;
    let count = REGION.count.load(Ordering::Acquire);
    if slot >= count {
        return None;
    }
    let e = REGION.entry(slot);
    if e.invalid_ptr.load(Ordering::Acquire) == 0 {
        return None;
    }
    Some((e.real_ptr.load(Ordering::Relaxed) as usize, e.pool_tag.load(Ordering::Relaxed)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_and_resolve_roundtrip() {
        ensure_initialized();
        let real = 0x1234_5678usize;
        let r = mint(real, 7).expect("region should have room");
        assert!(is_rewrite_pointer(r));
        let (resolved, tag) = resolve(r).unwrap();
        assert_eq!(resolved, real);
        assert_eq!(tag, 7);
    }

    #[test]
    fn resolve_of_ordinary_pointer_is_none() {
        ensure_initialized();
        let stack_var = 0u8;
        assert_eq!(resolve(&stack_var as *const u8 as usize), None);
    }
}
