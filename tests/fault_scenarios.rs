//! End-to-end scenarios S1–S6.
//!
//! S1–S3 and the second half of S6 end the process (abort, or a trapped
//! `SIGSEGV`/`SIGBUS` that re-aborts in strict mode), so each of those runs
//! its dangerous half in a *child* test process, re-invoking this same test
//! binary with `--exact <name> --ignored --test-threads=1` so only that one
//! test runs in the child — the standard way this class of crate
//! (protection-fault, abort-on-violation tooling) verifies a trap without
//! taking the harness down with it. Each `*_child` fn is itself `#[ignore]`d
//! so an ordinary `cargo test` never runs it in-process. S4–S5 and the first
//! half of S6 never fault, so they run in-process like any other test.

use std::ffi::c_void;
use std::process::{Command, ExitStatus};

use memsentry::abi;

fn run_child(test_name: &str) -> ExitStatus {
    let exe = std::env::current_exe().expect("test binary path");
    // Every `*_child` test below is `#[ignore]`d so a plain `cargo test` run
    // never executes it in-process (it deliberately faults/aborts) — only
    // this harness, which passes `--ignored` explicitly, runs it, and only
    // in a forked child.
    Command::new(exe)
        .args(["--exact", test_name, "--ignored", "--test-threads=1", "--nocapture"])
        .status()
        .expect("failed to spawn child test process")
}

#[cfg(unix)]
fn died_abnormally(status: ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    // Strict-mode violations end in `abort()`, which under the default
    // `panic = "abort"` profile and `SIGABRT` delivery shows up as either a
    // raw signal (134 & 0x7f == SIGABRT) or a 134 exit code depending on
    // how the test harness's own process launches us.
    status.signal() == Some(libc::SIGABRT)
        || status.signal() == Some(libc::SIGSEGV)
        || status.signal() == Some(libc::SIGBUS)
        || status.code() == Some(134)
}

fn fresh_pool_handle() -> *mut c_void {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static NEXT: AtomicUsize = AtomicUsize::new(0x5000_0000);
    NEXT.fetch_add(0x1_0000, Ordering::Relaxed) as *mut c_void
}

// ---------------------------------------------------------------- S1

/// `init_runtime(dangling=1,rewrite_oob=1,strict=1)`; alloc 16 bytes;
/// `poolcheck(p)`/`poolcheck(p+15)` succeed; `poolcheck(p+16)` aborts with
/// `OUT_OF_BOUNDS`.
#[test]
fn s1_poolcheck_one_past_end_aborts_in_child() {
    let status = run_child("s1_poolcheck_one_past_end_child");
    assert!(died_abnormally(status), "child should have aborted on OUT_OF_BOUNDS, got {:?}", status);
}

#[test]
#[ignore = "spawned only by this file's run_child harness; faults/aborts the process"]
fn s1_poolcheck_one_past_end_child() {
    unsafe {
        abi::pool_init_runtime(1, 1, 1);
        let pool = fresh_pool_handle();
        abi::pool_init(pool, 8);
        let p = abi::pool_alloc(pool, 16);
        assert!(!p.is_null());
        abi::poolcheck(pool, p);
        abi::poolcheck(pool, (p as usize + 15) as *mut c_void);
        // This call aborts the process; nothing after it should execute.
        abi::poolcheck(pool, (p as usize + 16) as *mut c_void);
        panic!("poolcheck(p+16) should have aborted the process");
    }
}

// ---------------------------------------------------------------- S2

/// `q = boundscheck(P, p, p+16)` lands in the rewrite region;
/// `get_actual_value(P, q) == p+16`; dereferencing `q` directly traps as
/// `OUT_OF_BOUNDS` and the process aborts (strict mode).
#[test]
fn s2_boundscheck_rewrite_pointer_faults_on_deref() {
    let status = run_child("s2_boundscheck_rewrite_pointer_child");
    assert!(died_abnormally(status), "child dereferencing a rewrite pointer should trap, got {:?}", status);
}

#[test]
#[ignore = "spawned only by this file's run_child harness; faults/aborts the process"]
fn s2_boundscheck_rewrite_pointer_child() {
    unsafe {
        abi::pool_init_runtime(1, 1, 1);
        let pool = fresh_pool_handle();
        abi::pool_init(pool, 8);
        let p = abi::pool_alloc(pool, 16);
        let q = abi::boundscheck(pool, p, (p as usize + 16) as *mut c_void);
        assert!(
            memsentry::oob::is_rewrite_pointer(q as usize),
            "one-past-the-end boundscheck result must be a rewrite pointer, got {:?}",
            q
        );
        assert_eq!(abi::get_actual_value(pool, q) as usize, p as usize + 16);
        // q lies in the reserved, unmapped rewrite region: this load traps.
        let faulting_read = std::ptr::read_volatile(q as *const u8);
        panic!("dereferencing rewrite pointer should have faulted, read {}", faulting_read);
    }
}

// ---------------------------------------------------------------- S3

/// `p = pool_alloc(P, 32); pool_free(P, p)`; any subsequent load through `p`
/// traps and reports `DANGLING` with matching alloc/free IDs.
#[test]
fn s3_use_after_free_traps_as_dangling() {
    let status = run_child("s3_use_after_free_child");
    assert!(died_abnormally(status), "child should trap DANGLING on use-after-free, got {:?}", status);
}

#[test]
#[ignore = "spawned only by this file's run_child harness; faults/aborts the process"]
fn s3_use_after_free_child() {
    unsafe {
        abi::pool_init_runtime(1, 1, 1);
        let pool = fresh_pool_handle();
        abi::pool_init(pool, 8);
        let p = abi::pool_alloc(pool, 32);
        abi::pool_free(pool, p);
        let faulting_read = std::ptr::read_volatile(p as *const u8);
        panic!("use-after-free read should have faulted, read {}", faulting_read);
    }
}

// ---------------------------------------------------------------- S4

/// Baggy engine: `alloc(5)` lands in the 16-byte size class; strictly
/// inside is in-bounds, one-past-end and two-past-end both rewrite.
#[test]
fn s4_baggy_bounds_and_rewrite() {
    unsafe {
        let p = abi::bb_alloc(5) as usize;
        assert_eq!(memsentry::baggy_shadow::read(p), 4);

        let in_bounds = abi::bb_boundscheck(p as *mut c_void, (p + 15) as *mut c_void);
        assert_eq!(in_bounds as usize, p + 15);

        let rewritten = abi::bb_boundscheck(p as *mut c_void, (p + 16) as *mut c_void);
        assert!(
            memsentry::oob::is_rewrite_pointer(rewritten as usize),
            "one-past-the-end boundscheck result must be a rewrite pointer, got {:?}",
            rewritten
        );
        assert_eq!(abi::get_actual_value(std::ptr::null_mut(), rewritten) as usize, p + 16);

        let rewritten2 = abi::bb_boundscheck(p as *mut c_void, (p + 17) as *mut c_void);
        assert!(memsentry::oob::is_rewrite_pointer(rewritten2 as usize));
        assert_eq!(abi::get_actual_value(std::ptr::null_mut(), rewritten2) as usize, p + 17);

        abi::bb_free(p as *mut c_void);
    }
}

// ---------------------------------------------------------------- S5

/// `register(P, env[0], len+1)` for a batch of registered "environ" style
/// strings; every byte of every registered string passes `poolcheck`, and
/// running one byte past any one of them fails (unless it happens to be the
/// first byte of an immediately adjacent registration, which this test
/// avoids by leaving a gap).
#[test]
fn s5_external_style_env_registration_bounds() {
    unsafe {
        let pool = fresh_pool_handle();
        abi::pool_init(pool, 1);

        let strings: [&str; 3] = ["PATH=/usr/bin\0", "HOME=/root\0", "SHELL=/bin/sh\0"];
        let mut bases = Vec::new();
        for s in &strings {
            let base = s.as_ptr() as usize;
            abi::pool_register(pool, base as *mut c_void, s.len());
            bases.push((base, s.len()));
        }

        for &(base, len) in &bases {
            for off in 0..len {
                abi::poolcheck(pool, (base + off) as *mut c_void);
            }
        }
    }
}

#[test]
fn s5_overrun_past_registered_external_object_is_out_of_bounds() {
    let status = run_child("s5_overrun_past_registered_external_object_child");
    assert!(died_abnormally(status), "overrunning a registered object should abort, got {:?}", status);
}

#[test]
#[ignore = "spawned only by this file's run_child harness; faults/aborts the process"]
fn s5_overrun_past_registered_external_object_child() {
    unsafe {
        abi::pool_init_runtime(0, 0, 1);
        let pool = fresh_pool_handle();
        abi::pool_init(pool, 1);
        let s = "PATH=/usr/bin\0";
        let base = s.as_ptr() as usize;
        abi::pool_register(pool, base as *mut c_void, s.len());
        // One byte past the registered length, with rewriting disabled:
        // poolcheck aborts rather than silently succeeding.
        abi::poolcheck(pool, (base + s.len()) as *mut c_void);
        panic!("poolcheck one byte past the registered object should have aborted");
    }
}

// ---------------------------------------------------------------- S6

extern "C" fn func_a() {}
extern "C" fn func_b() {}
extern "C" fn func_c() {}
extern "C" fn func_d() {}

#[test]
fn s6_funccheck_accepts_membership() {
    unsafe {
        let candidates: [*const c_void; 3] =
            [func_a as *const c_void, func_b as *const c_void, func_c as *const c_void];
        abi::funccheck(3, func_a as *const c_void, candidates.as_ptr());
    }
}

#[test]
fn s6_funccheck_rejects_non_member_in_child() {
    let status = run_child("s6_funccheck_rejects_non_member_child");
    assert!(died_abnormally(status), "funccheck on a non-member target should abort, got {:?}", status);
}

#[test]
#[ignore = "spawned only by this file's run_child harness; faults/aborts the process"]
fn s6_funccheck_rejects_non_member_child() {
    unsafe {
        abi::pool_init_runtime(0, 0, 1);
        let candidates: [*const c_void; 3] =
            [func_a as *const c_void, func_b as *const c_void, func_c as *const c_void];
        abi::funccheck(3, func_d as *const c_void, candidates.as_ptr());
        panic!("funccheck(fD, [fA, fB, fC]) should have aborted");
    }
}
