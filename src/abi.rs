//! Instrumented-program ABI. Every entry the compiler pass is allowed to
//! emit a call to lives here, each a `#[no_mangle] extern "C"` function
//! with the documented signature the compiler emits calls against
//! (module-internal names differ slightly from the suggestive ones used
//! when describing this ABI only where Rust needs a distinct identifier
//! for the `*ui` / baggy variants).
//!
//! Nothing here does real work: every function immediately delegates to
//! `crate::pool`, `crate::baggy`, or `crate::fault`/`crate::oob` and
//! translates between C calling-convention types and the engine's internal
//! `usize`-addressed representation (addresses are `usize` throughout the
//! stored state, never raw pointers — a `usize` has no provenance to lose
//! track of).

use crate::config::{self, RuntimeOptions};
use crate::error::{Violation, ViolationKind};
use crate::fault::{self, Decision};
use crate::pool::{self, BoundsOutcome, FreeError};
use crate::{baggy, baggy_shadow, debug_meta, external, oob};
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};

fn addr(p: *const c_void) -> usize {
    p as usize
}

fn ptr(a: usize) -> *mut c_void {
    a as *mut c_void
}

/// Reports `kind`/`fault_ptr` and returns the abort/continue decision.
/// Every checking primitive below funnels its failure path through this —
/// a violation report (and optional termination) is the only thing the
/// instrumented program ever sees when a check fails. Callers that have no
/// meaningful fallback value abort immediately on `Decision::Abort`;
/// callers that can return a conservative
/// result (bounds-checks) propagate the decision instead.
fn report_violation(kind: ViolationKind, fault_ptr: usize) -> Decision {
    let decision = fault::report_and_decide(Violation::new(kind, 0, fault_ptr));
    if decision == Decision::Abort {
        std::process::abort();
    }
    decision
}

fn report_violation_with_object(kind: ViolationKind, fault_ptr: usize, base: usize, len: usize) -> Decision {
    let v = Violation::new(kind, 0, fault_ptr).with_object(base, len);
    let decision = fault::report_and_decide(v);
    if decision == Decision::Abort {
        std::process::abort();
    }
    decision
}

// ---------------------------------------------------------------- pool_init_runtime

/// `pool_init_runtime`. Installs the fault handler, reserves the OOB
/// rewrite region and the baggy shadow table, and applies the three
/// documented runtime flags plus their `MEMSENTRY_*` environment overrides
/// (§6, "Runtime options").
#[no_mangle]
pub unsafe extern "C" fn pool_init_runtime(dangling: c_int, rewrite_oob: c_int, terminate_on_error: c_int) {
    crate::log::init();
    let opts = RuntimeOptions {
        dangling: dangling != 0,
        rewrite_oob: rewrite_oob != 0,
        terminate_on_error: terminate_on_error != 0,
    }
    .with_env_overrides();
    config::install(opts);
    oob::ensure_initialized();
    debug_meta::ensure_initialized();
    baggy_shadow::ensure_initialized();
    if let Err(e) = fault::install() {
        // Without a working fault handler, dangling/OOB detection can't
        // report anything the instrumented program would see: this is the
        // same "not recoverable" class as the page manager's OOM abort.
        log::error!("pool_init_runtime: failed to install fault handler: {}", e);
        std::process::abort();
    }
}

/// Compiler-generated in the real toolchain (§1: compiler passes are out of
/// scope here); the runtime ships a no-op definition so code that doesn't
/// go through that pass (e.g. this crate's own tests) still links.
#[no_mangle]
pub extern "C" fn register_globals() {}

// ---------------------------------------------------------------- pool lifecycle

#[no_mangle]
pub unsafe extern "C" fn pool_init(pool_handle: *mut c_void, node_size: usize) {
    pool::pool_init(addr(pool_handle), node_size);
}

#[no_mangle]
pub unsafe extern "C" fn pool_destroy(pool_handle: *mut c_void) {
    pool::pool_destroy(addr(pool_handle));
}

// ---------------------------------------------------------------- allocation family

#[no_mangle]
pub unsafe extern "C" fn pool_alloc(pool_handle: *mut c_void, n: usize) -> *mut c_void {
    match pool::get(addr(pool_handle)) {
        Some(p) => ptr(p.lock().alloc(n, 0)),
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn pool_realloc(pool_handle: *mut c_void, p: *mut c_void, n: usize) -> *mut c_void {
    match pool::get(addr(pool_handle)) {
        Some(pl) => ptr(pl.lock().realloc(addr(p), n, 0)),
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn pool_calloc(pool_handle: *mut c_void, count: usize, size: usize) -> *mut c_void {
    match pool::get(addr(pool_handle)) {
        Some(p) => ptr(p.lock().calloc(count, size, 0)),
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn pool_strdup(pool_handle: *mut c_void, s: *const c_char) -> *mut c_char {
    if s.is_null() {
        return std::ptr::null_mut();
    }
    let cstr = CStr::from_ptr(s);
    match pool::get(addr(pool_handle)) {
        Some(p) => ptr(p.lock().strdup(cstr, 0)) as *mut c_char,
        None => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn pool_free(pool_handle: *mut c_void, p: *mut c_void) {
    let Some(pl) = pool::get(addr(pool_handle)) else { return };
    let result = pl.lock().free(addr(p), 0);
    if let Err(e) = result {
        let kind = match e {
            FreeError::DoubleFree => ViolationKind::DoubleFree,
            FreeError::InvalidFree => ViolationKind::InvalidFree,
        };
        let _ = report_violation(kind, addr(p));
    }
}

// ---------------------------------------------------------------- registration family

#[no_mangle]
pub unsafe extern "C" fn pool_register(pool_handle: *mut c_void, p: *mut c_void, n: usize) {
    if let Some(pl) = pool::get(addr(pool_handle)) {
        pl.lock().register(addr(p), n);
    }
}

#[no_mangle]
pub unsafe extern "C" fn pool_unregister(pool_handle: *mut c_void, p: *mut c_void) {
    if let Some(pl) = pool::get(addr(pool_handle)) {
        pl.lock().unregister(addr(p));
    }
}

#[no_mangle]
pub unsafe extern "C" fn pool_register_stack(pool_handle: *mut c_void, p: *mut c_void, n: usize) {
    let Some(pl) = pool::get(addr(pool_handle)) else { return };
    if pl.lock().register_stack(addr(p), n).is_err() {
        log::error!(
            "pool_register_stack: address {:#x} re-registered while still live (stack allocation inside a loop is unsupported)",
            addr(p)
        );
        if config::terminate_on_error() {
            std::process::abort();
        }
    }
}

/// Registers `p` as an external (non-pool) object, for the `*ui` checks and
/// the fault reporter. Not in the pool-keyed ABI table because external
/// objects have no owning pool by definition.
#[no_mangle]
pub unsafe extern "C" fn pool_register_external(p: *mut c_void, n: usize) {
    external::register(addr(p), n);
}

// ---------------------------------------------------------------- checks

#[no_mangle]
pub unsafe extern "C" fn poolcheck(pool_handle: *mut c_void, p: *mut c_void) {
    let ok = pool::get(addr(pool_handle)).map(|pl| pl.lock().poolcheck(addr(p))).unwrap_or(false);
    if !ok {
        let _ = report_violation(ViolationKind::LoadStore, addr(p));
    }
}

#[no_mangle]
pub unsafe extern "C" fn poolcheckui(pool_handle: *mut c_void, p: *mut c_void) {
    let ok = pool::get(addr(pool_handle)).map(|pl| pl.lock().poolcheck(addr(p))).unwrap_or(false)
        || external::contains(addr(p));
    if !ok {
        let _ = report_violation(ViolationKind::LoadStore, addr(p));
    }
}

#[no_mangle]
pub unsafe extern "C" fn poolcheckalign(pool_handle: *mut c_void, p: *mut c_void, start_off: usize, end_off: usize) {
    let ok = pool::get(addr(pool_handle))
        .map(|pl| pl.lock().poolcheckalign(addr(p), start_off, end_off))
        .unwrap_or(false);
    if !ok {
        let _ = report_violation(ViolationKind::Align, addr(p));
    }
}

fn handle_bounds_outcome(outcome: BoundsOutcome, src: usize, dst: usize, checked: bool) -> usize {
    match outcome {
        BoundsOutcome::InBounds(d) | BoundsOutcome::Rewritten(d) => d,
        BoundsOutcome::SrcUnknown => {
            if checked {
                log::warn!("boundscheckui: src {:#x} not in any known object, returning dst unchanged", src);
                dst
            } else {
                match report_violation(ViolationKind::OutOfBounds, dst) {
                    Decision::Abort => unreachable!("report_and_decide aborts the process on Decision::Abort"),
                    Decision::Continue => dst,
                }
            }
        }
        BoundsOutcome::OutOfBounds => match report_violation(ViolationKind::OutOfBounds, dst) {
            Decision::Abort => unreachable!("report_and_decide aborts the process on Decision::Abort"),
            Decision::Continue => dst,
        },
    }
}

#[no_mangle]
pub unsafe extern "C" fn boundscheck(pool_handle: *mut c_void, src: *mut c_void, dst: *mut c_void) -> *mut c_void {
    let outcome = pool::get(addr(pool_handle))
        .map(|pl| pl.lock().boundscheck(addr(src), addr(dst)))
        .unwrap_or(BoundsOutcome::SrcUnknown);
    ptr(handle_bounds_outcome(outcome, addr(src), addr(dst), false))
}

#[no_mangle]
pub unsafe extern "C" fn boundscheckui(pool_handle: *mut c_void, src: *mut c_void, dst: *mut c_void) -> *mut c_void {
    let outcome = pool::get(addr(pool_handle))
        .map(|pl| pl.lock().boundscheck(addr(src), addr(dst)))
        .unwrap_or(BoundsOutcome::SrcUnknown);
    ptr(handle_bounds_outcome(outcome, addr(src), addr(dst), true))
}

/// `exactcheck2`: a bare interval test against caller-supplied bounds, no
/// splay lookup.
#[no_mangle]
pub unsafe extern "C" fn exactcheck2(base: *mut c_void, result: *mut c_void, end: *mut c_void) -> *mut c_void {
    let (b, r, e) = (addr(base), addr(result), addr(end));
    if r >= b && r <= e {
        result
    } else {
        match report_violation_with_object(ViolationKind::OutOfBounds, r, b, e.saturating_sub(b)) {
            Decision::Abort => unreachable!(),
            Decision::Continue => result,
        }
    }
}

/// `fastlscheck`: `base <= ptr && ptr + len <= base + size`.
#[no_mangle]
pub unsafe extern "C" fn fastlscheck(base: *mut c_void, p: *mut c_void, size: usize, len: usize) {
    let (b, pv) = (addr(base), addr(p));
    let ok = pv >= b && pv.saturating_add(len) <= b.saturating_add(size);
    if !ok {
        let _ = report_violation_with_object(ViolationKind::LoadStore, pv, b, size);
    }
}

#[no_mangle]
pub unsafe extern "C" fn get_actual_value(_pool_handle: *mut c_void, p: *mut c_void) -> *mut c_void {
    ptr(pool::get_actual_value(addr(p)))
}

/// `funccheck(n, f, f0, ..)`. C variadic argument lists aren't representable
/// in `extern "C"` Rust, so this takes the candidate list as an array
/// instead: `candidates` must point to `n` function pointers.
#[no_mangle]
pub unsafe extern "C" fn funccheck(n: usize, f: *const c_void, candidates: *const *const c_void) {
    let slice = std::slice::from_raw_parts(candidates, n);
    let list: Vec<usize> = slice.iter().map(|&p| p as usize).collect();
    if !pool::funccheck(f as usize, &list) {
        let _ = report_violation(ViolationKind::Unknown, f as usize);
    }
}

// ---------------------------------------------------------------- baggy-bounds ABI
//
// The baggy engine has no notion of a pool handle, so it needs its own
// externally callable names instead of threading through the pool-keyed
// entries above; these `bb_*` names keep the second engine equally
// linkable, one function per baggy operation.

#[no_mangle]
pub unsafe extern "C" fn bb_alloc(n: usize) -> *mut c_void {
    ptr(baggy::alloc(n))
}

#[no_mangle]
pub unsafe extern "C" fn bb_free(p: *mut c_void) {
    baggy::free(addr(p));
}

#[no_mangle]
pub unsafe extern "C" fn bb_register_heap(p: *mut c_void, n: usize) {
    baggy::register_heap(addr(p), n);
}

#[no_mangle]
pub unsafe extern "C" fn bb_register_stack(p: *mut c_void, n: usize) {
    baggy::register_stack(addr(p), n);
}

#[no_mangle]
pub unsafe extern "C" fn bb_register_global(p: *mut c_void, n: usize) {
    baggy::register_global(addr(p), n);
}

#[no_mangle]
pub unsafe extern "C" fn bb_unregister(p: *mut c_void) {
    baggy::unregister(addr(p));
}

#[no_mangle]
pub unsafe extern "C" fn bb_boundscheck(src: *mut c_void, dst: *mut c_void) -> *mut c_void {
    let outcome = baggy::boundscheck(addr(src), addr(dst), config::rewrite_oob_enabled());
    match outcome {
        baggy::BoundsOutcome::InBounds(d) | baggy::BoundsOutcome::Rewritten(d) => ptr(d),
        baggy::BoundsOutcome::SrcUnknown => {
            let _ = report_violation(ViolationKind::OutOfBounds, addr(dst));
            dst
        }
        baggy::BoundsOutcome::OutOfBounds => {
            let _ = report_violation(ViolationKind::OutOfBounds, addr(dst));
            dst
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn bb_loadcheck(p: *mut c_void, len: usize) {
    if !baggy::loadcheck(addr(p), len) {
        let _ = report_violation(ViolationKind::LoadStore, addr(p));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_abi_roundtrip() {
        unsafe {
            let handle = 0x2000_0000usize as *mut c_void;
            pool_init(handle, 8);
            let p = pool_alloc(handle, 16);
            assert!(!p.is_null());
            poolcheck(handle, p); // would abort the test process on failure
            pool_free(handle, p);
            pool_destroy(handle);
        }
    }

    #[test]
    fn baggy_abi_roundtrip() {
        unsafe {
            let p = bb_alloc(20);
            assert!(!p.is_null());
            bb_loadcheck(p, 4);
            bb_free(p);
        }
    }
}
