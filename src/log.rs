//! Logging facade.
//!
//! Everywhere outside the fault handler, code logs through the ordinary
//! `log` crate macros (`log::info!`, `log::warn!`, ...) — `init()` installs
//! `env_logger` honoring `MEMSENTRY_LOG` the way the rest of the ecosystem
//! honors `RUST_LOG`. Inside the fault handler (`crate::fault`), none of
//! that is safe to call: the allocator and any buffering inside `log`'s
//! backend could be mid-mutation when the signal arrives. That path uses
//! [`raw_write_stderr`] instead, which is just `libc::write` on a
//! stack-built buffer.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs the process-wide logger. Safe to call more than once; only the
/// first call takes effect. Honors `MEMSENTRY_LOG` (falls back to `warn`).
pub fn init() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(
            env_logger::Env::new().filter_or("MEMSENTRY_LOG", "warn"),
        )
        .try_init();
    });
}

/// Writes `msg` directly to stderr with `write(2)`, async-signal-safe.
/// Truncates rather than allocates if `msg` doesn't fit in the scratch
/// buffer; never panics.
pub fn raw_write_stderr(msg: &[u8]) {
    unsafe {
        let mut off = 0usize;
        while off < msg.len() {
            let n = libc::write(
                libc::STDERR_FILENO,
                msg[off..].as_ptr() as *const libc::c_void,
                msg.len() - off,
            );
            if n <= 0 {
                break;
            }
            off += n as usize;
        }
    }
}
