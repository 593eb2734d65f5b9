//! Fault handler & violation reporter.
//!
//! The `SIGSEGV`/`SIGBUS` handler runs in signal context: it must not
//! allocate, must not take any lock a non-handler path could be holding,
//! and can only write to stderr with `write(2)` directly. Every data
//! source it touches — [`crate::oob::resolve`],
//! [`crate::debug_meta::find_by_shadow_addr`] — is already lock-free for
//! exactly this reason.
//!
//! Reporting itself (formatting + the strict/permissive decision) is
//! shared between the signal path and every ordinary (non-signal) checking
//! primitive that detects a violation synchronously (`poolcheck`,
//! `boundscheck`, ...): both funnel through [`report_and_decide`].

use crate::config;
use crate::debug_meta;
use crate::error::{SetupError, Violation, ViolationDebug, ViolationKind};
use crate::log::raw_write_stderr;
use crate::oob;
use core::fmt::Write as _;
use core::sync::atomic::{AtomicBool, Ordering};

/// Addresses below this are treated as "the uninitialized-pointer page":
/// a null-page-sized guard region no live object can ever occupy.
const UNINITIALIZED_LIMIT: usize = 0x1_0000;

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// What a caller should do after a violation has been reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Abort,
    Continue,
}

/// Reports `v` and returns whether the caller should abort, per
/// `terminate_on_error`. This is the *only* place that decision is made —
/// every check primitive and the signal handler both call this.
pub fn report_and_decide(v: Violation) -> Decision {
    report(v);
    if config::terminate_on_error() {
        Decision::Abort
    } else {
        Decision::Continue
    }
}

/// Formats and writes `v` to stderr: one machine-parseable line, then a
/// human-readable block. Uses only stack buffers and `write(2)` — safe to
/// call from signal context.
pub fn report(v: Violation) {
    let mut buf = [0u8; 512];
    let mut w = StackWriter::new(&mut buf);

    let _ = write!(
        w,
        "MEMSENTRY kind={} ptr={:#x} pc={:#x}",
        v.kind, v.fault_ptr, v.fault_pc
    );
    if let (Some(base), Some(len)) = (v.object_base, v.object_len) {
        let _ = write!(w, " obj_base={:#x} obj_len={:#x}", base, len);
    }
    if let Some(d) = v.debug {
        let _ = write!(w, " alloc_id={} free_id={} alloc_pc={:#x} free_pc={:#x}", d.alloc_id, d.free_id, d.alloc_pc, d.free_pc);
    }
    let _ = write!(w, "\n");
    raw_write_stderr(w.as_bytes());

    let mut buf2 = [0u8; 512];
    let mut w2 = StackWriter::new(&mut buf2);
    let _ = write!(
        w2,
        "memsentry: {} violation\n  at pointer {:#x}\n  faulting pc {:#x}\n",
        v.kind, v.fault_ptr, v.fault_pc
    );
    if let (Some(base), Some(len)) = (v.object_base, v.object_len) {
        let _ = write!(w2, "  object [{:#x}, {:#x})\n", base, base + len);
    }
    if let Some(d) = v.debug {
        let _ = write!(
            w2,
            "  allocated as #{} at pc {:#x}, freed as #{} at pc {:#x}\n",
            d.alloc_id, d.alloc_pc, d.free_id, d.free_pc
        );
    }
    raw_write_stderr(w2.as_bytes());
}

/// Installs the `SIGSEGV`/`SIGBUS` handler. Idempotent: a second call is a
/// no-op returning `Ok(())`, not an error — re-arming isn't a usage
/// mistake the caller needs to hear about.
pub fn install() -> Result<(), SetupError> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    unsafe { install_for(libc::SIGSEGV)? };
    unsafe { install_for(libc::SIGBUS)? };
    Ok(())
}

unsafe fn install_for(signum: i32) -> Result<(), SetupError> {
    let mut sa: libc::sigaction = core::mem::zeroed();
    sa.sa_sigaction = handler as usize;
    sa.sa_flags = libc::SA_SIGINFO;
    libc::sigemptyset(&mut sa.sa_mask);
    let rc = libc::sigaction(signum, &sa, core::ptr::null_mut());
    if rc != 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(-1);
        return Err(SetupError::Sigaction { signum, errno });
    }
    Ok(())
}

/// The signal handler proper. No captured state: every input comes from
/// `info`/`ctx`, every output goes through lock-free reads of global
/// singletons.
extern "C" fn handler(signum: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    // Step 1: disarm. A second fault inside this handler (e.g. a bug in the
    // reporter) should crash with the default disposition, not recurse.
    unsafe {
        libc::signal(signum, libc::SIG_DFL);
    }

    let fault_ptr = unsafe { (*info).si_addr() as usize };
    let fault_pc = read_pc(ctx);

    let v = classify(fault_ptr, fault_pc);
    let decision = report_and_decide(v);

    match decision {
        Decision::Abort => unsafe {
            libc::abort();
        },
        Decision::Continue => {
            // Done before reinstalling so the program doesn't immediately
            // refault on the same page: unprotect the shadow range so
            // execution can resume.
            let page_base = fault_ptr & !(crate::page::PAGE_SIZE - 1);
            let _ = crate::page::unprotect_shadow(page_base, crate::page::PAGE_SIZE);
            install_again(signum);
        }
    }
}

/// Called from signal context (the warn-and-continue path): a failure here
/// has no async-signal-safe recovery available, so the result is
/// deliberately discarded rather than logged through the ordinary facade.
fn install_again(signum: i32) {
    let _ = unsafe { install_for(signum) };
}

fn classify(fault_ptr: usize, fault_pc: usize) -> Violation {
    if fault_ptr < UNINITIALIZED_LIMIT {
        return Violation::new(ViolationKind::Uninitialized, fault_pc, fault_ptr);
    }
    if oob::is_rewrite_pointer(fault_ptr) {
        if let Some((real_ptr, _pool_tag)) = oob::resolve(fault_ptr) {
            return Violation::new(ViolationKind::OutOfBounds, fault_pc, fault_ptr).with_object(real_ptr, 0);
        }
    }
    if let Some((_id, rec)) = debug_meta::find_by_shadow_addr(fault_ptr) {
        return Violation::new(ViolationKind::Dangling, fault_pc, fault_ptr)
            .with_object(rec.canon_base, rec.len)
            .with_debug(ViolationDebug {
                alloc_id: rec.alloc_id,
                free_id: rec.free_id,
                alloc_pc: rec.alloc_pc,
                free_pc: rec.free_pc,
            });
    }
    Violation::new(ViolationKind::Unknown, fault_pc, fault_ptr)
}

#[cfg(target_arch = "x86_64")]
fn read_pc(ctx: *mut libc::c_void) -> usize {
    if ctx.is_null() {
        return 0;
    }
    unsafe {
        let ucontext = ctx as *mut libc::ucontext_t;
        (*ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] as usize
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn read_pc(_ctx: *mut libc::c_void) -> usize {
    0
}

/// A `core::fmt::Write` sink over a fixed stack buffer; never allocates,
/// silently truncates instead of panicking if the message overflows.
struct StackWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> StackWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        StackWriter { buf, len: 0 }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl<'a> core::fmt::Write for StackWriter<'a> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let space = self.buf.len() - self.len;
        let n = bytes.len().min(space);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_uninitialized() {
        let v = classify(0x100, 0);
        assert_eq!(v.kind, ViolationKind::Uninitialized);
    }

    #[test]
    fn classify_unknown_for_ordinary_address() {
        let stack_var = 0u8;
        let v = classify(&stack_var as *const u8 as usize, 0);
        assert_eq!(v.kind, ViolationKind::Unknown);
    }

    #[test]
    fn stack_writer_truncates_without_panicking() {
        let mut buf = [0u8; 4];
        let mut w = StackWriter::new(&mut buf);
        let _ = write!(w, "hello world");
        assert_eq!(w.as_bytes(), b"hell");
    }
}
