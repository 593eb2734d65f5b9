//! Concurrency policy (see `DESIGN.md` for the tradeoff): a mutex per
//! pool, plus a handful of named global mutexes for
//! the external-object table, the OOB cursor and the debug-metadata
//! counters. None of these may ever be held across a point where the fault
//! handler could interrupt and need the same data; the handler's own reads
//! (`debug_meta::find_by_shadow_addr`, `oob::resolve`, `baggy_shadow::read`)
//! don't go through this module at all — they're plain per-field atomic
//! loads against process-lifetime arenas owned by those modules, which is
//! enough to be signal-safe without a lock of any kind.
//!
//! `spin::Mutex` is used rather than `std::sync::Mutex`: critical sections
//! here are a handful of pointer/ int writes (splay rotation, bitmap
//! update), short enough that a spinlock beats a futex syscall, and a
//! spinlock can never be "poisoned" by a panicking holder — relevant since
//! `abort()` is a first-class outcome of code running under these locks.

use spin::Mutex as SpinMutex;

pub type Mutex<T> = SpinMutex<T>;
