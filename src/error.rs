//! Violation taxonomy and the small set of internal errors that can occur
//! before any instrumented-program code has run.

use core::fmt;

/// One of the eight violation kinds a checking primitive or the fault
/// handler can report. Every checked operation that fails produces exactly
/// one of these; nothing else is user-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    Uninitialized,
    OutOfBounds,
    Dangling,
    LoadStore,
    Align,
    DoubleFree,
    InvalidFree,
    Unknown,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViolationKind::Uninitialized => "UNINITIALIZED",
            ViolationKind::OutOfBounds => "OUT_OF_BOUNDS",
            ViolationKind::Dangling => "DANGLING",
            ViolationKind::LoadStore => "LOAD_STORE",
            ViolationKind::Align => "ALIGN",
            ViolationKind::DoubleFree => "DOUBLE_FREE",
            ViolationKind::InvalidFree => "INVALID_FREE",
            ViolationKind::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Optional debug metadata attached to a violation report.
#[derive(Debug, Clone, Copy)]
pub struct ViolationDebug {
    pub alloc_id: u64,
    pub free_id: u64,
    pub alloc_pc: usize,
    pub free_pc: usize,
}

/// The single structured record produced at a detection site or inside the
/// fault handler. Never carries a `String` — only the pieces the
/// async-signal-safe reporter can format without allocating.
#[derive(Debug, Clone, Copy)]
pub struct Violation {
    pub kind: ViolationKind,
    pub fault_pc: usize,
    pub fault_ptr: usize,
    pub object_base: Option<usize>,
    pub object_len: Option<usize>,
    pub debug: Option<ViolationDebug>,
}

impl Violation {
    pub fn new(kind: ViolationKind, fault_pc: usize, fault_ptr: usize) -> Self {
        Violation {
            kind,
            fault_pc,
            fault_ptr,
            object_base: None,
            object_len: None,
            debug: None,
        }
    }

    pub fn with_object(mut self, base: usize, len: usize) -> Self {
        self.object_base = Some(base);
        self.object_len = Some(len);
        self
    }

    pub fn with_debug(mut self, debug: ViolationDebug) -> Self {
        self.debug = Some(debug);
        self
    }
}

/// Errors that can occur while bringing the engine up, before any
/// instrumented-program code runs. These are not part of the "only
/// user-visible failure is a violation report" contract: a caller who
/// cannot even reserve the OOB region or the baggy shadow table needs an
/// actual `Result` to act on.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("mmap failed while reserving {what}: errno {errno}")]
    Mmap { what: &'static str, errno: i32 },
    #[error("mprotect failed on {addr:#x}..{len:#x}: errno {errno}")]
    Mprotect { addr: usize, len: usize, errno: i32 },
    #[error("sigaction failed for signal {signum}: errno {errno}")]
    Sigaction { signum: i32, errno: i32 },
}
