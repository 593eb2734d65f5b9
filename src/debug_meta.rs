//! Debug metadata store.
//!
//! Per-allocation records are bump-allocated into a process-lifetime arena:
//! a single mmap'd array addressed by a stable index, never resized, never
//! freed. That makes reads — the only thing the fault handler ever does
//! with this store — a couple of atomic loads, no lock required.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub type DebugId = u32;

const CAPACITY: usize = 1 << 20;

#[repr(C)]
struct Slot {
    alloc_id: AtomicU64,
    free_id: AtomicU64,
    alloc_pc: AtomicU64,
    free_pc: AtomicU64,
    canon_base: AtomicU64,
    len: AtomicU64,
    /// Address of this object inside its slab's *shadow* mapping, or 0 if
    /// dangling-pointer detection isn't enabled for this object's pool.
    /// Set once at allocation time; read by the fault handler to recognize
    /// a fault as `DANGLING` rather than `UNKNOWN`.
    shadow_base: AtomicU64,
}

struct Arena {
    base: usize,
    next: AtomicUsize,
}

impl Arena {
    fn new() -> Self {
        let len = CAPACITY * core::mem::size_of::<Slot>();
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        assert_ne!(addr, libc::MAP_FAILED, "failed to reserve debug metadata arena");
        Arena { base: addr as usize, next: AtomicUsize::new(0) }
    }

    fn slot(&self, id: DebugId) -> &Slot {
        unsafe { &*((self.base + id as usize * core::mem::size_of::<Slot>()) as *const Slot) }
    }
}

lazy_static::lazy_static! {
    static ref ARENA: Arena = Arena::new();
    static ref GLOBAL_ALLOC_ID: AtomicU64 = AtomicU64::new(0);
    static ref GLOBAL_FREE_ID: AtomicU64 = AtomicU64::new(0);
}

pub fn ensure_initialized() {
    lazy_static::initialize(&ARENA);
}

/// A point-in-time, owned copy of a debug record. Cheap to copy; this is
/// what crosses the "read from signal context" boundary since the `Slot`
/// itself never leaves the arena.
#[derive(Debug, Clone, Copy)]
pub struct DebugRecord {
    pub alloc_id: u64,
    pub free_id: u64,
    pub alloc_pc: usize,
    pub free_pc: usize,
    pub canon_base: usize,
    pub len: usize,
    pub shadow_base: usize,
}

/// Stamps a new record for a just-allocated object and returns its id.
/// `shadow_base` is 0 unless the owning pool has dangling-pointer
/// detection enabled, in which case it's the address of this object inside
/// its slab's shadow mapping.
pub fn record_alloc(canon_base: usize, len: usize, alloc_pc: usize, shadow_base: usize) -> DebugId {
    let idx = ARENA.next.fetch_add(1, Ordering::Relaxed);
    assert!(idx < CAPACITY, "debug metadata arena exhausted");
    let id = idx as DebugId;
    let slot = ARENA.slot(id);
    slot.canon_base.store(canon_base as u64, Ordering::Relaxed);
    slot.len.store(len as u64, Ordering::Relaxed);
    slot.shadow_base.store(shadow_base as u64, Ordering::Relaxed);
    slot.alloc_pc.store(alloc_pc as u64, Ordering::Relaxed);
    slot.free_id.store(0, Ordering::Relaxed);
    slot.free_pc.store(0, Ordering::Relaxed);
    let alloc_id = GLOBAL_ALLOC_ID.fetch_add(1, Ordering::Relaxed) + 1;
    // Published last: readers treat a non-zero alloc_id as "record is live".
    slot.alloc_id.store(alloc_id, Ordering::Release);
    id
}

pub fn record_free(id: DebugId, free_pc: usize) {
    let slot = ARENA.slot(id);
    let free_id = GLOBAL_FREE_ID.fetch_add(1, Ordering::Relaxed) + 1;
    slot.free_pc.store(free_pc as u64, Ordering::Relaxed);
    slot.free_id.store(free_id, Ordering::Release);
}

pub fn get(id: DebugId) -> DebugRecord {
    let slot = ARENA.slot(id);
    DebugRecord {
        alloc_id: slot.alloc_id.load(Ordering::Acquire),
        free_id: slot.free_id.load(Ordering::Acquire),
        alloc_pc: slot.alloc_pc.load(Ordering::Relaxed) as usize,
        free_pc: slot.free_pc.load(Ordering::Relaxed) as usize,
        canon_base: slot.canon_base.load(Ordering::Relaxed) as usize,
        len: slot.len.load(Ordering::Relaxed) as usize,
        shadow_base: slot.shadow_base.load(Ordering::Relaxed) as usize,
    }
}

/// Linear scan for the record whose shadow range contains `addr`. Used only
/// by the fault handler to classify a fault as `DANGLING`; async-signal-safe
/// (plain atomic loads, no allocation, bounded by the number of records
/// created so far in this process).
pub fn find_by_shadow_addr(addr: usize) -> Option<(DebugId, DebugRecord)> {
    let count = ARENA.next.load(Ordering::Acquire).min(CAPACITY);
    for i in 0..count {
        let id = i as DebugId;
        let slot = ARENA.slot(id);
        let shadow_base = slot.shadow_base.load(Ordering::Relaxed) as usize;
        if shadow_base == 0 {
            continue;
        }
        let len = slot.len.load(Ordering::Relaxed) as usize;
        if addr >= shadow_base && addr < shadow_base + len {
            return Some((id, get(id)));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_free_updates_ids() {
        ensure_initialized();
        let id = record_alloc(0x1000, 64, 0xAAAA, 0);
        let r = get(id);
        assert!(r.alloc_id > 0);
        assert_eq!(r.free_id, 0);
        record_free(id, 0xBBBB);
        let r2 = get(id);
        assert!(r2.free_id > 0);
        assert_eq!(r2.free_pc, 0xBBBB);
    }

    #[test]
    fn find_by_shadow_addr_locates_record() {
        ensure_initialized();
        let id = record_alloc(0x2000, 32, 0, 0x9000_0000);
        let (found_id, rec) = find_by_shadow_addr(0x9000_0010).expect("should find by shadow addr");
        assert_eq!(found_id, id);
        assert_eq!(rec.canon_base, 0x2000);
    }
}
