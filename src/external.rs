//! External-object table.
//!
//! Objects not owned by any pool — `argv`/`environ` strings, anything the
//! instrumented program hands the runtime without going through
//! `pool_alloc` — live in one process-wide splay, schema-identical to a
//! pool's own index but with no slab, debug metadata, or OOB table behind
//! it. Consulted only by the `*ui` check variants and the fault reporter.

use crate::splay::SplayTree;
use crate::sync::Mutex;

lazy_static::lazy_static! {
    static ref TABLE: Mutex<SplayTree<()>> = Mutex::new(SplayTree::new());
}

/// Registers `[p, p+n)` as an external object. Never freed by the engine.
pub fn register(p: usize, n: usize) {
    TABLE.lock().insert(p, n.max(1), ());
}

/// Removes a previously registered external object at exactly `p`.
pub fn unregister(p: usize) -> bool {
    TABLE.lock().delete(p)
}

/// True if `p` lies within some registered external object.
pub fn contains(p: usize) -> bool {
    TABLE.lock().retrieve(p).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_unregister_roundtrip() {
        // Use an address range unlikely to collide with other tests sharing
        // the process-wide table.
        register(0x7f00_0000, 32);
        assert!(contains(0x7f00_0010));
        assert!(!contains(0x7f00_0100));
        assert!(unregister(0x7f00_0000));
        assert!(!contains(0x7f00_0010));
    }
}
