//! Runtime options (`pool_init_runtime`) and their environment-variable
//! overrides.

use bitflags::bitflags;
use core::sync::atomic::{AtomicU8, Ordering};

bitflags! {
    /// The process-wide runtime posture, packed into a single byte so the
    /// hot-path reads (`terminate_on_error`, `rewrite_oob_enabled`,
    /// `dangling_enabled`) are one atomic load each instead of three.
    /// One bit per runtime option `pool_init_runtime` accepts.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct RuntimeFlags: u8 {
        /// Enable virtual-page remapping + protect-on-free (pool engine).
        const DANGLING = 0b001;
        /// Enable OOB rewrite pointers; if unset, any out-of-bounds
        /// computation is itself a reported violation instead of producing
        /// a rewrite.
        const REWRITE_OOB = 0b010;
        /// Abort on the first violation instead of warning and continuing.
        const TERMINATE_ON_ERROR = 0b100;
    }
}

/// Flags passed to `pool_init_runtime`. Each corresponds 1:1 to a
/// `RuntimeFlags` bit above.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeOptions {
    /// Enable virtual-page remapping + protect-on-free (pool engine).
    pub dangling: bool,
    /// Enable OOB rewrite pointers; if false, any out-of-bounds computation
    /// is itself a reported violation instead of producing a rewrite.
    pub rewrite_oob: bool,
    /// Abort on the first violation instead of warning and continuing.
    pub terminate_on_error: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions { dangling: false, rewrite_oob: true, terminate_on_error: true }
    }
}

impl RuntimeOptions {
    /// Applies the two documented environment overrides on top of the
    /// caller-supplied options. `MEMSENTRY_STRICT=0` forces warn-and-continue
    /// mode even if the caller asked for strict; any other value (including
    /// unset) leaves the caller's choice alone. `MEMSENTRY_LOG` is handled by
    /// `crate::log::init`, not here.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("MEMSENTRY_STRICT") {
            self.terminate_on_error = v != "0";
        }
        self
    }

    fn to_flags(self) -> RuntimeFlags {
        let mut flags = RuntimeFlags::empty();
        flags.set(RuntimeFlags::DANGLING, self.dangling);
        flags.set(RuntimeFlags::REWRITE_OOB, self.rewrite_oob);
        flags.set(RuntimeFlags::TERMINATE_ON_ERROR, self.terminate_on_error);
        flags
    }
}

static FLAGS: AtomicU8 = AtomicU8::new(RuntimeFlags::REWRITE_OOB.bits() | RuntimeFlags::TERMINATE_ON_ERROR.bits());
static INITIALIZED: AtomicU8 = AtomicU8::new(0);

fn current() -> RuntimeFlags {
    RuntimeFlags::from_bits_truncate(FLAGS.load(Ordering::Relaxed))
}

/// Installs the process-wide runtime posture. Idempotent: later calls
/// overwrite earlier ones, matching `pool_init`'s documented idempotency.
pub fn install(opts: RuntimeOptions) {
    FLAGS.store(opts.to_flags().bits(), Ordering::SeqCst);
    INITIALIZED.store(1, Ordering::SeqCst);
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Relaxed) != 0
}

pub fn terminate_on_error() -> bool {
    current().contains(RuntimeFlags::TERMINATE_ON_ERROR)
}

pub fn rewrite_oob_enabled() -> bool {
    current().contains(RuntimeFlags::REWRITE_OOB)
}

pub fn dangling_enabled() -> bool {
    current().contains(RuntimeFlags::DANGLING)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_round_trips_each_flag() {
        install(RuntimeOptions { dangling: true, rewrite_oob: false, terminate_on_error: false });
        assert!(dangling_enabled());
        assert!(!rewrite_oob_enabled());
        assert!(!terminate_on_error());
        assert!(is_initialized());

        install(RuntimeOptions::default());
        assert!(!dangling_enabled());
        assert!(rewrite_oob_enabled());
        assert!(terminate_on_error());
    }
}
