//! Interval splay tree.
//!
//! A top-down splay tree (Sleator & Tarjan) keyed by the half-open interval
//! `[start, start+len)`, carrying an opaque `tag`. Nodes live in a
//! `Vec`-backed arena addressed by index rather than behind `Box`/raw
//! pointers — that's load-bearing here, not cosmetic: it's what lets
//! `ObjectId` tags stay stable across splay rotations and be read from
//! outside the tree (the fault handler never walks this structure
//! directly, but other engine code holds onto `ObjectId`s that the tree
//! itself reshuffles constantly).

use core::cmp::Ordering;

const NIL: usize = usize::MAX;

struct Node<T> {
    start: usize,
    len: usize,
    tag: T,
    left: usize,
    right: usize,
}

pub struct SplayTree<T> {
    nodes: Vec<Node<T>>,
    free: Vec<usize>,
    root: usize,
}

impl<T: Copy> Default for SplayTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy> SplayTree<T> {
    pub fn new() -> Self {
        SplayTree { nodes: Vec::new(), free: Vec::new(), root: NIL }
    }

    pub fn is_empty(&self) -> bool {
        self.root == NIL
    }

    fn alloc(&mut self, start: usize, len: usize, tag: T) -> usize {
        let node = Node { start, len, tag, left: NIL, right: NIL };
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = node;
            idx
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }

    fn cmp(&self, key: usize, idx: usize) -> Ordering {
        let n = &self.nodes[idx];
        if key < n.start {
            Ordering::Less
        } else if key >= n.start + n.len {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    /// Top-down splay on `key`. Afterward the root is either the interval
    /// containing `key`, or (if none does) the last interval visited while
    /// descending — exactly what the classic algorithm gives you when `key`
    /// isn't present, and what lets `insert` decide which side of the new
    /// root the fresh node belongs on.
    fn splay(&mut self, key: usize) {
        if self.root == NIL {
            return;
        }
        let mut t = self.root;
        let mut l_tail = NIL;
        let mut r_tail = NIL;
        let mut l_head = NIL;
        let mut r_head = NIL;

        loop {
            match self.cmp(key, t) {
                Ordering::Less => {
                    let t_left = self.nodes[t].left;
                    if t_left == NIL {
                        break;
                    }
                    if self.cmp(key, t_left) == Ordering::Less {
                        let y = t_left;
                        self.nodes[t].left = self.nodes[y].right;
                        self.nodes[y].right = t;
                        t = y;
                        if self.nodes[t].left == NIL {
                            break;
                        }
                    }
                    if r_tail == NIL {
                        r_head = t;
                    } else {
                        self.nodes[r_tail].left = t;
                    }
                    r_tail = t;
                    t = self.nodes[t].left;
                }
                Ordering::Greater => {
                    let t_right = self.nodes[t].right;
                    if t_right == NIL {
                        break;
                    }
                    if self.cmp(key, t_right) == Ordering::Greater {
                        let y = t_right;
                        self.nodes[t].right = self.nodes[y].left;
                        self.nodes[y].left = t;
                        t = y;
                        if self.nodes[t].right == NIL {
                            break;
                        }
                    }
                    if l_tail == NIL {
                        l_head = t;
                    } else {
                        self.nodes[l_tail].right = t;
                    }
                    l_tail = t;
                    t = self.nodes[t].right;
                }
                Ordering::Equal => break,
            }
        }

        if l_tail != NIL {
            self.nodes[l_tail].right = self.nodes[t].left;
        }
        if r_tail != NIL {
            self.nodes[r_tail].left = self.nodes[t].right;
        }
        self.nodes[t].left = l_head;
        self.nodes[t].right = r_head;
        self.root = t;
    }

    /// Inserts `[start, start+len)` with `tag`. The interval must not
    /// overlap any interval already present — callers (the pool/baggy
    /// engines never hand out overlapping ranges) are trusted here, the
    /// same way the instrumented program is trusted at the ABI boundary;
    /// a debug build catches a violation of that contract.
    pub fn insert(&mut self, start: usize, len: usize, tag: T) {
        debug_assert!(len > 0);
        self.splay(start);
        let new_idx = self.alloc(start, len, tag);
        if self.root == NIL {
            self.root = new_idx;
            return;
        }
        let root = self.root;
        debug_assert_ne!(self.cmp(start, root), Ordering::Equal, "overlapping interval insert");
        if start < self.nodes[root].start {
            self.nodes[new_idx].right = root;
            self.nodes[new_idx].left = self.nodes[root].left;
            self.nodes[root].left = NIL;
        } else {
            self.nodes[new_idx].left = root;
            self.nodes[new_idx].right = self.nodes[root].right;
            self.nodes[root].right = NIL;
        }
        self.root = new_idx;
    }

    /// Removes the interval whose start is exactly `start`. Returns `false`
    /// if no such interval exists (e.g. a double-free or invalid-free
    /// candidate — the caller turns that into `DOUBLE_FREE`/`INVALID_FREE`).
    pub fn delete(&mut self, start: usize) -> bool {
        self.splay(start);
        let root = self.root;
        if root == NIL || self.nodes[root].start != start {
            return false;
        }
        let left = self.nodes[root].left;
        let right = self.nodes[root].right;
        self.free.push(root);
        if left == NIL {
            self.root = right;
        } else {
            self.root = left;
            self.splay(start);
            self.nodes[self.root].right = right;
        }
        true
    }

    /// Finds the interval containing `key`, if any, splaying it to the
    /// root. Returns `(interval_start, interval_len, tag)`.
    pub fn retrieve(&mut self, key: usize) -> Option<(usize, usize, T)> {
        if self.root == NIL {
            return None;
        }
        self.splay(key);
        let root = self.root;
        if self.cmp(key, root) == Ordering::Equal {
            let n = &self.nodes[root];
            Some((n.start, n.len, n.tag))
        } else {
            None
        }
    }

    /// Non-splaying membership probe, used where a caller needs to look up
    /// an interval without reshuffling the tree (e.g. `Pool::register_stack`
    /// checking for a still-live address before deciding whether to splay
    /// at all).
    pub fn peek(&self, key: usize) -> Option<(usize, usize, T)> {
        let mut idx = self.root;
        while idx != NIL {
            match self.cmp(key, idx) {
                Ordering::Less => idx = self.nodes[idx].left,
                Ordering::Greater => idx = self.nodes[idx].right,
                Ordering::Equal => {
                    let n = &self.nodes[idx];
                    return Some((n.start, n.len, n.tag));
                }
            }
        }
        None
    }
}
