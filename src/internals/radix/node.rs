//! The storage unit of the tree. A node owns the compressed edge label
//! that leads into it (the skip), a popmap of outgoing edge bytes, a
//! parallel array of atomic child slots, an atomic value slot, and a
//! version counter.
//!
//! Nodes are published by a single release store into a parent slot and
//! must be fully constructed before that store. Once reachable, a node's
//! skip, popmap and slot layout are never mutated again - structural
//! change builds a replacement node. The value slot and the child slots
//! themselves remain writable (single atomic stores, writer lock held).

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};

use super::popmap::PopMap;

/// Inline capacity for edge labels. Longer skips spill to the heap.
pub(crate) type SkipBuf = SmallVec<[u8; 16]>;

#[repr(align(64))]
pub(crate) struct Node<V> {
    pub(crate) skip: SkipBuf,
    pub(crate) idx: PopMap,
    pub(crate) children: Box<[Atomic<Node<V>>]>,
    pub(crate) value: Atomic<V>,
    version: AtomicU64,
}

impl<V> Node<V> {
    pub(crate) fn new(
        skip: SkipBuf,
        idx: PopMap,
        children: Box<[Atomic<Node<V>>]>,
        value: Atomic<V>,
        version: u64,
    ) -> Owned<Node<V>> {
        debug_assert!(idx.len() == children.len());
        Owned::new(Node {
            skip,
            idx,
            children,
            value,
            version: AtomicU64::new(version),
        })
    }

    /// An empty root: no skip, no edges, no value.
    pub(crate) fn root() -> Owned<Node<V>> {
        Self::new(SkipBuf::new(), PopMap::new(), Box::new([]), Atomic::null(), 0)
    }

    /// A fresh terminator with no children.
    pub(crate) fn leaf(skip: &[u8], value: V) -> Owned<Node<V>> {
        Self::new(
            SkipBuf::from_slice(skip),
            PopMap::new(),
            Box::new([]),
            Atomic::new(value),
            0,
        )
    }

    #[inline(always)]
    pub(crate) fn nr_children(&self) -> usize {
        self.children.len()
    }

    /// Load the child for edge byte c, if such an edge exists.
    #[inline(always)]
    pub(crate) fn child<'g>(&self, c: u8, guard: &'g Guard) -> Option<Shared<'g, Node<V>>> {
        self.idx
            .rank(c)
            .map(|at| self.children[at].load(Ordering::Acquire, guard))
    }

    #[inline(always)]
    pub(crate) fn child_at<'g>(&self, at: usize, guard: &'g Guard) -> Shared<'g, Node<V>> {
        self.children[at].load(Ordering::Acquire, guard)
    }

    #[inline(always)]
    pub(crate) fn value<'g>(&self, guard: &'g Guard) -> Shared<'g, V> {
        self.value.load(Ordering::Acquire, guard)
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Set the value slot. Writer lock must be held; the slot must be
    /// empty (terminal inserts check first).
    pub(crate) fn store_value(&self, value: V) {
        self.value.store(Owned::new(value), Ordering::Release);
    }

    /// Unlink the current value, leaving the slot empty. Writer lock must
    /// be held. The caller retires the returned pointer.
    pub(crate) fn take_value<'g>(&self, guard: &'g Guard) -> Shared<'g, V> {
        self.value.swap(Shared::null(), Ordering::Release, guard)
    }

    /// Replace the current value. Writer lock must be held. The caller
    /// retires the returned pointer.
    pub(crate) fn swap_value<'g>(&self, value: V, guard: &'g Guard) -> Shared<'g, V> {
        self.value.swap(Owned::new(value), Ordering::Release, guard)
    }

    /// Copy the child slots. Writer lock must be held so no slot can be
    /// re-pointed while we copy.
    pub(crate) fn duplicate_children(&self) -> Vec<Atomic<Node<V>>> {
        self.children.to_vec()
    }

    /// Build the replacement node that carries one additional edge. The
    /// new child lands at the slot position its byte ranks at; everything
    /// else is shared by pointer.
    pub(crate) fn with_child_attached(&self, c: u8, child: Owned<Node<V>>) -> Owned<Node<V>> {
        debug_assert!(!self.idx.contains(c));
        let mut idx = self.idx;
        let at = idx.insert(c);
        let mut children = self.duplicate_children();
        children.insert(at, Atomic::from(child));
        Self::new(
            self.skip.clone(),
            idx,
            children.into_boxed_slice(),
            self.value.clone(),
            self.version() + 1,
        )
    }

    /// Build the replacement node that drops the edge for c. Everything
    /// else is shared by pointer. The caller retires the detached child.
    pub(crate) fn with_child_detached(&self, c: u8) -> Owned<Node<V>> {
        debug_assert!(self.idx.contains(c));
        let mut idx = self.idx;
        let at = idx.remove(c);
        let mut children = self.duplicate_children();
        children.remove(at);
        Self::new(
            self.skip.clone(),
            idx,
            children.into_boxed_slice(),
            self.value.clone(),
            self.version() + 1,
        )
    }
}

impl<V> std::fmt::Debug for Node<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("skip", &self.skip)
            .field("idx", &self.idx)
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}
