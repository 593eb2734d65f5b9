//! `memsentry` — a runtime memory-safety engine for compiler-instrumented
//! C/C++ programs.
//!
//! Two interchangeable engines answer the same three questions on every
//! instrumented pointer access: is this pointer inside a live object, which
//! object, and does a computed address stay inside the object its source
//! pointer came from.
//!
//! * [`pool`] (gated by the `pool-engine` feature) — a slab allocator with a
//!   per-pool splay index of live objects, out-of-bounds pointer rewriting
//!   via [`oob`], and dangling-pointer trapping via [`page`]'s shadow
//!   mappings and [`fault`]'s signal handler.
//! * [`baggy`] (gated by the `baggy-engine` feature) — power-of-two aligned
//!   allocations recovered from a flat shadow byte table ([`baggy_shadow`]).
//!
//! Neither engine is reachable from safe Rust: every entry point an
//! instrumented binary actually calls lives in [`abi`], as `#[no_mangle]
//! extern "C"` functions. Everything else here is `pub` only so the
//! engines can be exercised directly from tests; treat [`abi`] as the
//! real public surface.

#[cfg(not(any(feature = "pool-engine", feature = "baggy-engine")))]
compile_error!("memsentry requires at least one of the `pool-engine` or `baggy-engine` features");

// The `pool-engine`/`baggy-engine` features select which engine(s)
// `pool_init_runtime` actually arms at startup (see `config`/`abi`); both
// engines' code is always compiled in so a single linked `memsentry` can
// back either instrumentation strategy without a rebuild.
pub mod config;
pub mod debug_meta;
pub mod error;
pub mod external;
pub mod fault;
pub mod log;
pub mod oob;
pub mod page;
pub mod splay;
pub mod sync;

pub mod baggy;
pub mod baggy_shadow;

pub mod pool;
pub mod slab;

pub mod abi;
