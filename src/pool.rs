//! Pool/Splay engine — ties the page manager, splay index, slab pool, OOB
//! rewrite table and debug metadata store together behind the per-pool
//! operations the instrumented program calls.
//!
//! Pool handles are opaque `usize`s chosen by the caller (the address of
//! whatever storage the compiler pass reserved for the pool descriptor);
//! this engine never dereferences that value, it only uses it as a key
//! into a process-wide table of [`Pool`]s, each independently mutexed.
//! Object records live in a per-pool arena addressed by [`ObjectId`] so
//! the splay tree itself never needs to store anything bigger than an
//! index.

use crate::config;
use crate::debug_meta::{self, DebugId};
use crate::oob;
use crate::page;
use crate::slab::Slab;
use crate::splay::SplayTree;
use crate::sync::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub type ObjectId = u32;

const OWNED_SMALL_THRESHOLD: usize = 8;

/// Address ranges of this pool's own slabs, used to distinguish a
/// `DOUBLE_FREE` (pointer was ours, already gone) from an `INVALID_FREE`
/// (pointer was never ours) on a failed `free`. Starts as a linear `Vec`
/// and escalates to a hash set past a small threshold.
enum OwnedRanges {
    Small(Vec<(usize, usize)>),
    Large(HashMap<usize, usize>),
}

impl OwnedRanges {
    fn new() -> Self {
        OwnedRanges::Small(Vec::new())
    }

    fn insert(&mut self, base: usize, len: usize) {
        match self {
            OwnedRanges::Small(v) => {
                v.push((base, len));
                if v.len() > OWNED_SMALL_THRESHOLD {
                    let map = v.drain(..).collect();
                    *self = OwnedRanges::Large(map);
                }
            }
            OwnedRanges::Large(m) => {
                m.insert(base, len);
            }
        }
    }

    fn contains(&self, addr: usize) -> bool {
        match self {
            OwnedRanges::Small(v) => v.iter().any(|&(b, l)| addr >= b && addr < b + l),
            OwnedRanges::Large(m) => m.iter().any(|(&b, &l)| addr >= b && addr < b + l),
        }
    }
}

struct ObjectRecord {
    canon_base: usize,
    len: usize,
    slab: Option<usize>,
    node_start: usize,
    debug_id: Option<DebugId>,
}

/// Outcome of `boundscheck`/`boundscheckui`. `InBounds` is returned only
/// for `dst` strictly inside the object; one-past-the-end and anything
/// further out both come back `Rewritten` (see `Pool::boundscheck`'s doc
/// comment and DESIGN.md for why one-past-the-end is treated as
/// out-of-bounds here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundsOutcome {
    InBounds(usize),
    Rewritten(usize),
    OutOfBounds,
    SrcUnknown,
}

/// Outcome of `pool_free`: distinguishes a free of an already-freed object
/// (`DOUBLE_FREE`) from a free of a pointer this pool never owned
/// (`INVALID_FREE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    DoubleFree,
    InvalidFree,
}

/// The stack-in-loop guard: re-registering a still-live storage address
/// as a stack object is reported as an explicit error, never a silent
/// success (see DESIGN.md for the reasoning behind treating this as an
/// error rather than a no-op).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackInLoop;

pub struct Pool {
    node_size: usize,
    tag: u32,
    slabs: Vec<Slab>,
    partial: Vec<usize>,
    full: Vec<usize>,
    large: Vec<usize>,
    owned: OwnedRanges,
    index: SplayTree<ObjectId>,
    records: Vec<Option<ObjectRecord>>,
    free_records: Vec<ObjectId>,
    /// Recorded but does not currently restrict behavior; see DESIGN.md.
    pub stack_only: bool,
    destroyed: bool,
}

static NEXT_POOL_TAG: AtomicU32 = AtomicU32::new(1);

impl Pool {
    fn new(node_size: usize) -> Self {
        Pool {
            node_size: node_size.max(1),
            tag: NEXT_POOL_TAG.fetch_add(1, Ordering::Relaxed),
            slabs: Vec::new(),
            partial: Vec::new(),
            full: Vec::new(),
            large: Vec::new(),
            owned: OwnedRanges::new(),
            index: SplayTree::new(),
            records: Vec::new(),
            free_records: Vec::new(),
            stack_only: false,
            destroyed: false,
        }
    }

    fn push_record(&mut self, rec: ObjectRecord) -> ObjectId {
        if let Some(id) = self.free_records.pop() {
            self.records[id as usize] = Some(rec);
            id
        } else {
            self.records.push(Some(rec));
            (self.records.len() - 1) as ObjectId
        }
    }

    fn take_record(&mut self, id: ObjectId) -> ObjectRecord {
        let rec = self.records[id as usize].take().expect("dangling ObjectId");
        self.free_records.push(id);
        rec
    }

    fn alloc_nodes(&mut self, nodes_needed: usize) -> (usize, usize) {
        let mut i = 0;
        while i < self.partial.len() {
            let idx = self.partial[i];
            if let Some(start) = self.slabs[idx].allocate_multiple(nodes_needed) {
                if self.slabs[idx].is_full() {
                    self.partial.remove(i);
                    self.full.push(idx);
                }
                return (idx, start);
            }
            i += 1;
        }
        let slab = Slab::new_nodes(self.node_size);
        let canon_base = slab.canon_base;
        let cap_bytes = slab.capacity() * self.node_size;
        let idx = self.slabs.len();
        self.slabs.push(slab);
        self.owned.insert(canon_base, cap_bytes.max(page::PAGE_SIZE));
        let start = self.slabs[idx]
            .allocate_multiple(nodes_needed)
            .expect("fresh slab must fit a request within its own capacity");
        if self.slabs[idx].is_full() {
            self.full.push(idx);
        } else {
            self.partial.push(idx);
        }
        (idx, start)
    }

    /// `pool_alloc`. `alloc_pc` is the caller's program counter for debug
    /// metadata; the instrumented-program ABI in this implementation
    /// doesn't thread that through (it would require compiler cooperation,
    /// out of scope here), so ABI callers pass `0`.
    pub fn alloc(&mut self, n: usize, alloc_pc: usize) -> usize {
        let n = if n == 0 { 1 } else { n };
        let nodes_needed = (n + self.node_size - 1) / self.node_size;
        let cap = crate::slab::nodes_per_slab(self.node_size);

        let (canon_base, slab_idx, node_start) = if nodes_needed > cap {
            let slab = Slab::new_single_array(self.node_size, nodes_needed);
            let base = slab.canon_base;
            let idx = self.slabs.len();
            self.owned.insert(base, nodes_needed * self.node_size);
            self.slabs.push(slab);
            self.large.push(idx);
            (base, idx, 0)
        } else {
            let (idx, start) = self.alloc_nodes(nodes_needed);
            (self.slabs[idx].node_addr(start), idx, start)
        };

        let dangling = config::dangling_enabled();
        let (key, shadow_base) = if dangling {
            match page::remap_object(canon_base, n) {
                Ok(shadow) => {
                    // The shadow address is what's actually handed back to
                    // the caller and used as the splay key below, so it's
                    // also what a later double-free attempt will be checked
                    // against. The slab-granularity inserts above only cover
                    // canonical addresses; without this, `self.owned` never
                    // contains any shadow address and every double-free in
                    // dangling mode gets misreported as an invalid free.
                    self.owned.insert(shadow.addr, n.max(1));
                    (shadow.addr, shadow.addr)
                }
                Err(_) => (canon_base, 0),
            }
        } else {
            (canon_base, 0)
        };

        let debug_id = debug_meta::record_alloc(canon_base, n, alloc_pc, shadow_base);
        let oid = self.push_record(ObjectRecord {
            canon_base,
            len: n,
            slab: Some(slab_idx),
            node_start,
            debug_id: Some(debug_id),
        });
        self.index.insert(key, n, oid);
        key
    }

    /// `pool_free`. `p` must be exactly the pointer `alloc`/`register`
    /// returned; anything else is a free error.
    pub fn free(&mut self, p: usize, free_pc: usize) -> Result<(), FreeError> {
        let found = self.index.retrieve(p);
        let (start, len, oid) = match found {
            Some(t) if t.0 == p => t,
            Some(_) => return Err(FreeError::InvalidFree),
            None => {
                return Err(if self.owned.contains(p) {
                    FreeError::DoubleFree
                } else {
                    FreeError::InvalidFree
                });
            }
        };
        self.index.delete(start);
        let rec = self.take_record(oid);
        if let Some(id) = rec.debug_id {
            debug_meta::record_free(id, free_pc);
        }
        if config::dangling_enabled() && p != rec.canon_base {
            let _ = page::protect_shadow(p, len);
        }
        if let Some(slab_idx) = rec.slab {
            if !self.slabs[slab_idx].is_single_array() {
                self.slabs[slab_idx].free_element(rec.node_start);
                if let Some(pos) = self.full.iter().position(|&i| i == slab_idx) {
                    self.full.remove(pos);
                    self.partial.push(slab_idx);
                }
            }
        }
        Ok(())
    }

    /// `pool_realloc`. `realloc(0, n) == alloc(n)`; `realloc(p, 0) == free(p)`.
    /// The copy length is `new_size`, clamped to the old object's
    /// node-aligned capacity so a growing realloc can never read unmapped
    /// memory (a plain C allocator can skip this clamp because it has no
    /// memory-safety net of its own to protect; this one does).
    pub fn realloc(&mut self, p: usize, new_size: usize, pc: usize) -> usize {
        if p == 0 {
            return self.alloc(new_size, pc);
        }
        if new_size == 0 {
            let _ = self.free(p, pc);
            return 0;
        }
        let old = self.index.peek(p);
        let new_ptr = self.alloc(new_size, pc);
        if let Some((start, _len, oid)) = old {
            if start == p {
                if let Some(rec) = &self.records[oid as usize] {
                    // Safe upper bound on what's actually mapped for the old
                    // object: its requested length rounded up to the node
                    // boundary it was allocated at.
                    let old_capacity = ((rec.len + self.node_size - 1) / self.node_size) * self.node_size;
                    let copy_len = new_size.min(old_capacity);
                    unsafe {
                        std::ptr::copy_nonoverlapping(p as *const u8, new_ptr as *mut u8, copy_len);
                    }
                }
            }
        }
        let _ = self.free(p, pc);
        new_ptr
    }

    pub fn calloc(&mut self, count: usize, size: usize, pc: usize) -> usize {
        let n = count.saturating_mul(size);
        let ptr = self.alloc(n, pc);
        if ptr != 0 {
            unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, n) };
        }
        ptr
    }

    pub fn strdup(&mut self, s: &std::ffi::CStr, pc: usize) -> usize {
        let bytes = s.to_bytes_with_nul();
        let ptr = self.alloc(bytes.len(), pc);
        if ptr != 0 {
            unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len()) };
        }
        ptr
    }

    /// `pool_register`: adopts externally-owned memory (stack/global/custom
    /// allocations) into this pool's index without routing it through a
    /// slab.
    pub fn register(&mut self, p: usize, n: usize) {
        let oid = self.push_record(ObjectRecord { canon_base: p, len: n.max(1), slab: None, node_start: 0, debug_id: None });
        self.index.insert(p, n.max(1), oid);
    }

    pub fn unregister(&mut self, p: usize) -> bool {
        if let Some((start, _len, oid)) = self.index.peek(p) {
            if start == p {
                self.index.delete(p);
                self.take_record(oid);
                return true;
            }
        }
        false
    }

    /// `pool_register_stack`: as `register`, but refuses to re-register a
    /// still-live address (see the `StackInLoop` doc comment above).
    pub fn register_stack(&mut self, p: usize, n: usize) -> Result<(), StackInLoop> {
        if let Some((start, _, _)) = self.index.peek(p) {
            if start == p {
                return Err(StackInLoop);
            }
        }
        self.register(p, n);
        Ok(())
    }

    pub fn poolcheck(&mut self, p: usize) -> bool {
        self.index.retrieve(p).is_some()
    }

    pub fn poolcheckalign(&mut self, p: usize, lo: usize, hi: usize) -> bool {
        match self.index.retrieve(p) {
            Some((start, _len, _tag)) => {
                let off = (p - start) % self.node_size;
                off >= lo && off <= hi
            }
            None => false,
        }
    }

    /// `dst` strictly inside `[start, start+len)` returns `dst` unchanged.
    /// `dst == start + len` (one-past-the-end) and anything further out
    /// both mint an OOB rewrite pointer rather than returning `dst`
    /// verbatim — see DESIGN.md for why one-past-the-end is treated as
    /// out-of-bounds here rather than passed through unchanged.
    pub fn boundscheck(&mut self, src: usize, dst: usize) -> BoundsOutcome {
        let Some((start, len, _tag)) = self.index.retrieve(src) else {
            return BoundsOutcome::SrcUnknown;
        };
        if dst >= start && dst < start + len {
            return BoundsOutcome::InBounds(dst);
        }
        if config::rewrite_oob_enabled() {
            if let Some(rewritten) = oob::mint(dst, self.tag) {
                return BoundsOutcome::Rewritten(rewritten);
            }
        }
        BoundsOutcome::OutOfBounds
    }

    /// Releases every slab's canonical pages and drops all indices.
    /// `dangling`-enabled shadow mappings are never reclaimed even here —
    /// only the canonical frames go back to the OS.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        for slab in &self.slabs {
            page::free_page(slab.canon_base);
        }
        self.slabs.clear();
        self.partial.clear();
        self.full.clear();
        self.large.clear();
        self.records.clear();
        self.free_records.clear();
        self.index = SplayTree::new();
        self.destroyed = true;
    }
}

lazy_static::lazy_static! {
    static ref POOLS: Mutex<HashMap<usize, Arc<Mutex<Pool>>>> = Mutex::new(HashMap::new());
}

/// `pool_init`: idempotent per pool handle — a second call on an already
/// registered handle is a no-op, matching the ABI table's documented
/// idempotency rather than silently resetting live state out from under
/// the instrumented program.
pub fn pool_init(handle: usize, node_size: usize) {
    let node_size = if node_size == 0 { 1 } else { node_size };
    POOLS.lock().entry(handle).or_insert_with(|| Arc::new(Mutex::new(Pool::new(node_size))));
}

pub fn pool_destroy(handle: usize) {
    if let Some(arc) = POOLS.lock().remove(&handle) {
        arc.lock().destroy();
    }
}

pub fn get(handle: usize) -> Option<Arc<Mutex<Pool>>> {
    POOLS.lock().get(&handle).cloned()
}

/// `funccheck`: stateless, no pool involved.
pub fn funccheck(fptr: usize, candidates: &[usize]) -> bool {
    candidates.contains(&fptr)
}

/// `get_actual_value`: reverses an OOB rewrite pointer. The OOB table is
/// process-wide (see `oob` module docs), so this doesn't actually need
/// the pool handle beyond validating the ABI shape; kept as a free
/// function here for symmetry with the rest of this module.
pub fn get_actual_value(p: usize) -> usize {
    oob::resolve(p).map(|(real, _tag)| real).unwrap_or(p)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_handle() -> usize {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static NEXT: AtomicUsize = AtomicUsize::new(0x1000_0000);
        NEXT.fetch_add(0x1000, Ordering::Relaxed)
    }

    #[test]
    fn alloc_check_free_roundtrip() {
        let h = fresh_handle();
        pool_init(h, 8);
        let arc = get(h).unwrap();
        let p = {
            let mut pool = arc.lock();
            let p = pool.alloc(16, 0);
            assert!(pool.poolcheck(p));
            assert!(pool.poolcheck(p + 15));
            assert!(!pool.poolcheck(p + 16));
            p
        };
        {
            let mut pool = arc.lock();
            assert!(pool.free(p, 0).is_ok());
            assert!(!pool.poolcheck(p));
        }
        pool_destroy(h);
    }

    #[test]
    fn double_free_is_reported_distinctly_from_invalid_free() {
        let h = fresh_handle();
        pool_init(h, 8);
        let arc = get(h).unwrap();
        let mut pool = arc.lock();
        let p = pool.alloc(8, 0);
        assert!(pool.free(p, 0).is_ok());
        assert_eq!(pool.free(p, 0), Err(FreeError::DoubleFree));
        assert_eq!(pool.free(0x7fff_0000, 0), Err(FreeError::InvalidFree));
    }

    /// With dangling-pointer detection on, the pointer handed back by
    /// `alloc`/used as the splay key is the shadow address, not the
    /// canonical slab address. A second free on that same shadow pointer
    /// must still be recognized as this pool's own address (`DoubleFree`),
    /// not misreported as `InvalidFree` just because it doesn't fall
    /// inside any canonical slab range.
    #[test]
    fn double_free_is_still_distinct_from_invalid_free_with_dangling_enabled() {
        let prior = config::RuntimeOptions {
            dangling: config::dangling_enabled(),
            rewrite_oob: config::rewrite_oob_enabled(),
            terminate_on_error: config::terminate_on_error(),
        };
        config::install(config::RuntimeOptions { dangling: true, rewrite_oob: true, terminate_on_error: true });

        let h = fresh_handle();
        pool_init(h, 8);
        let arc = get(h).unwrap();
        let mut pool = arc.lock();
        let p = pool.alloc(8, 0);
        assert!(pool.free(p, 0).is_ok());
        assert_eq!(pool.free(p, 0), Err(FreeError::DoubleFree));
        assert_eq!(pool.free(0x7fff_0000, 0), Err(FreeError::InvalidFree));

        config::install(prior);
    }

    #[test]
    fn boundscheck_rewrites_one_past_end_and_beyond() {
        let h = fresh_handle();
        pool_init(h, 8);
        let arc = get(h).unwrap();
        let mut pool = arc.lock();
        let p = pool.alloc(16, 0);
        assert_eq!(pool.boundscheck(p, p + 15), BoundsOutcome::InBounds(p + 15));
        match pool.boundscheck(p, p + 16) {
            BoundsOutcome::Rewritten(r) => {
                assert!(oob::is_rewrite_pointer(r));
                assert_eq!(get_actual_value(r), p + 16);
            }
            other => panic!("expected rewrite for one-past-the-end, got {:?}", other),
        }
        match pool.boundscheck(p, p + 17) {
            BoundsOutcome::Rewritten(r) => assert_eq!(get_actual_value(r), p + 17),
            other => panic!("expected rewrite, got {:?}", other),
        }
    }

    /// `node_size` bigger than one page is a valid input (`node_size` only
    /// needs to be `>= 1`); a single-node request must still get
    /// an object with every requested byte accessible, routed through
    /// `Slab::new_single_array` rather than a single, too-small page.
    #[test]
    fn alloc_with_node_size_larger_than_a_page_is_fully_accessible() {
        let h = fresh_handle();
        let node_size = crate::page::PAGE_SIZE * 3 + 17;
        pool_init(h, node_size);
        let arc = get(h).unwrap();
        let mut pool = arc.lock();
        let p = pool.alloc(node_size, 0);
        assert!(pool.poolcheck(p));
        assert!(pool.poolcheck(p + node_size - 1));
        unsafe {
            let last_byte = (p + node_size - 1) as *mut u8;
            *last_byte = 0xAB;
            assert_eq!(*last_byte, 0xAB);
        }
        assert!(pool.free(p, 0).is_ok());
    }

    #[test]
    fn poolcheckalign_respects_node_size_modulus() {
        let h = fresh_handle();
        pool_init(h, 8);
        let arc = get(h).unwrap();
        let mut pool = arc.lock();
        let p = pool.alloc(8, 0);
        assert!(pool.poolcheckalign(p, 0, 0));
        assert!(!pool.poolcheckalign(p + 1, 0, 0));
        assert!(pool.poolcheckalign(p + 1, 0, 7));
    }

    #[test]
    fn register_stack_rejects_reregistration_of_live_address() {
        let h = fresh_handle();
        pool_init(h, 1);
        let arc = get(h).unwrap();
        let mut pool = arc.lock();
        let stack_addr = 0x7ffd_0000_1000usize;
        assert!(pool.register_stack(stack_addr, 32).is_ok());
        assert_eq!(pool.register_stack(stack_addr, 32), Err(StackInLoop));
        assert!(pool.unregister(stack_addr));
        assert!(pool.register_stack(stack_addr, 32).is_ok());
    }

    #[test]
    fn funccheck_membership() {
        assert!(funccheck(0x10, &[0x10, 0x20]));
        assert!(!funccheck(0x30, &[0x10, 0x20]));
    }
}
