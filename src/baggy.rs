//! Baggy-bounds engine.
//!
//! Every allocation is rounded up to a power-of-two size class and placed
//! at an address aligned to that size, so recovering an object's bounds
//! from any interior pointer is two shadow-table loads, an `AND`, and a
//! `SHL` — no tree walk. Per-object metadata (just the requested length)
//! rides in a small trailer packed into the padding at the end of the
//! block, which is why the size class is chosen for `n + trailer size`
//! rather than `n` alone: without that, an exact power-of-two request would
//! leave no padding to write the trailer into.

use crate::baggy_shadow as shadow;
use crate::oob;

#[repr(C)]
struct Trailer {
    requested_len: u64,
}

const TRAILER_LEN: usize = core::mem::size_of::<Trailer>();

/// Smallest `s >= SLOT_BITS` with `2^s >= want`.
fn size_class_for(want: usize) -> u8 {
    let want = want.max(1);
    let mut s = shadow::SLOT_BITS;
    while (1usize << s) < want {
        s += 1;
    }
    s as u8
}

fn mmap_aligned(size: usize, align: usize) -> usize {
    let total = size + align;
    let raw = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            total,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(raw, libc::MAP_FAILED, "baggy engine: mmap failed");
    let raw = raw as usize;
    let aligned = (raw + align - 1) & !(align - 1);
    if aligned > raw {
        unsafe { libc::munmap(raw as *mut libc::c_void, aligned - raw) };
    }
    let tail_start = aligned + size;
    let tail_len = (raw + total) - tail_start;
    if tail_len > 0 {
        unsafe { libc::munmap(tail_start as *mut libc::c_void, tail_len) };
    }
    aligned
}

/// Allocates an object of `n` requested bytes. Returns a `2^s`-aligned
/// pointer to exactly `2^s` bytes, where `s` is the smallest size class
/// that fits `n` plus the trailer.
pub fn alloc(n: usize) -> usize {
    shadow::ensure_initialized();
    let s = size_class_for(n + TRAILER_LEN);
    let size = 1usize << s;
    let ptr = mmap_aligned(size, size);
    write_trailer(ptr, size, n as u64);
    shadow::stamp_range(ptr, s);
    ptr
}

fn write_trailer(base: usize, size: usize, requested_len: u64) {
    let t = (base + size - TRAILER_LEN) as *mut Trailer;
    unsafe {
        (*t).requested_len = requested_len;
    }
}

fn read_trailer(base: usize, size: usize) -> u64 {
    let t = (base + size - TRAILER_LEN) as *const Trailer;
    unsafe { (*t).requested_len }
}

/// Requested length of the live baggy object at `base` (the exact value
/// passed to `alloc`), used by callers that need it (e.g. `realloc`-style
/// wrappers built on top of this engine).
pub fn requested_len(base: usize) -> Option<u64> {
    let s = shadow::read(base);
    if s == 0 {
        return None;
    }
    let size = 1usize << s;
    let aligned_base = base & !(size - 1);
    Some(read_trailer(aligned_base, size))
}

/// Frees the object owning `p`. `p` need not be the exact base; any pointer
/// within the object resolves its size class and true base.
pub fn free(p: usize) {
    let s = shadow::read(p);
    if s == 0 {
        return; // double free / not a baggy object; caller may log INVALID_FREE.
    }
    let size = 1usize << s;
    let base = p & !(size - 1);
    shadow::clear_range(base, s);
    unsafe { libc::munmap(base as *mut libc::c_void, size) };
}

/// Stamps shadow slots for memory the caller already allocated and aligned
/// (stack/global/custom-heap objects). No trailer: the caller, not this
/// engine, owns the block's lifetime and layout.
fn register(p: usize, n: usize) {
    shadow::ensure_initialized();
    let s = size_class_for(n);
    shadow::stamp_range(p, s);
}

pub fn register_heap(p: usize, n: usize) {
    register(p, n);
}

pub fn register_stack(p: usize, n: usize) {
    register(p, n);
}

pub fn register_global(p: usize, n: usize) {
    register(p, n);
}

pub fn unregister(p: usize) {
    let s = shadow::read(p);
    if s != 0 {
        shadow::clear_range(p, s);
    }
}

/// Given a known-in-bounds `src` and a computed `dst`, returns `dst` if it
/// is strictly within `src`'s object. `dst == base + size` (one-past-the-end)
/// and anything further out both mint an OOB rewrite pointer rather than
/// returning `dst` verbatim — see DESIGN.md for why one-past-the-end is
/// treated as out-of-bounds here rather than passed through unchanged.
pub fn boundscheck(src: usize, dst: usize, rewrite_oob: bool) -> BoundsOutcome {
    let s = shadow::read(src);
    if s == 0 {
        return BoundsOutcome::SrcUnknown;
    }
    let base = src & !((1usize << s) - 1);
    let size = 1usize << s;
    if dst >= base && dst < base + size {
        return BoundsOutcome::InBounds(dst);
    }
    if rewrite_oob {
        if let Some(rewritten) = oob::mint(dst, 0) {
            return BoundsOutcome::Rewritten(rewritten);
        }
    }
    BoundsOutcome::OutOfBounds
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundsOutcome {
    InBounds(usize),
    Rewritten(usize),
    OutOfBounds,
    SrcUnknown,
}

/// `s = table[p>>4] != 0` and both `p` and `p+len-1` map to the same base.
pub fn loadcheck(p: usize, len: usize) -> bool {
    let s = shadow::read(p);
    if s == 0 || len == 0 {
        return false;
    }
    let size = 1usize << s;
    let base = p & !(size - 1);
    let last = p + len - 1;
    last >= base && last < base + size
}
