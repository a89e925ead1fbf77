//! The engine that knits nodes into a tree and keeps readers and writers
//! consistent with each other.
//!
//! Readers descend the live tree without taking any lock. Each edge
//! pointer is consumed with an atomic acquire load under an epoch pin, so
//! a reader always observes a fully constructed subtree for every edge it
//! follows. Writers serialise on a single mutex and publish every
//! structural change with one release store: a replacement node is built
//! completely off to the side, then swung into the parent's edge slot.
//! Displaced nodes and values are retired to the epoch collector, which
//! destroys them once no pinned reader can still hold a pointer to them.

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::node::{Node, SkipBuf};
use super::popmap::PopMap;
use crate::utils::common_prefix_len;

pub(crate) struct RadixTree<V> {
    root: Atomic<Node<V>>,
    count: CachePadded<AtomicUsize>,
    write: Mutex<()>,
}

/// What became of a node during a compaction walk.
enum Compacted<V> {
    /// Unchanged, still referenced in place.
    Keep,
    /// Superseded by a rebuilt node the caller must link in.
    Replace(Owned<Node<V>>),
    /// Valueless and childless - the caller unlinks the edge entirely.
    Remove,
}

impl<V: Clone + Send + Sync + 'static> RadixTree<V> {
    pub(crate) fn new() -> Self {
        RadixTree {
            root: Atomic::from(Node::root()),
            count: CachePadded::new(AtomicUsize::new(0)),
            write: Mutex::new(()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walk to the node whose key path equals key. Takes no lock - the
    /// epoch pin keeps every node we step through alive.
    fn lookup<'g>(&self, key: &[u8], guard: &'g Guard) -> Option<&'g Node<V>> {
        let mut rem = key;
        let mut cur = unsafe { self.root.load(Ordering::Acquire, guard).deref() };
        loop {
            let skip = cur.skip.as_slice();
            if rem.len() < skip.len() || &rem[..skip.len()] != skip {
                return None;
            }
            rem = &rem[skip.len()..];
            if rem.is_empty() {
                return Some(cur);
            }
            let child = cur.child(rem[0], guard)?;
            cur = unsafe { child.deref() };
            rem = &rem[1..];
        }
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<V> {
        let guard = epoch::pin();
        let node = self.lookup(key, &guard)?;
        let v = node.value(&guard);
        if v.is_null() {
            None
        } else {
            Some(unsafe { v.deref() }.clone())
        }
    }

    pub(crate) fn contains_key(&self, key: &[u8]) -> bool {
        let guard = epoch::pin();
        self.lookup(key, &guard)
            .map(|node| !node.value(&guard).is_null())
            .unwrap_or(false)
    }

    /// Insert key if absent. Returns the current value if the key was
    /// already present, in which case nothing changes.
    pub(crate) fn insert(&self, key: &[u8], value: V) -> Option<V> {
        let _wguard = self.write.lock();
        let guard = epoch::pin();
        self.insert_inner(key, value, false, &guard)
    }

    /// Insert key, or replace its value if present. Returns the previous
    /// value.
    pub(crate) fn insert_or_assign(&self, key: &[u8], value: V) -> Option<V> {
        let _wguard = self.write.lock();
        let guard = epoch::pin();
        self.insert_inner(key, value, true, &guard)
    }

    fn insert_inner(&self, key: &[u8], value: V, assign: bool, guard: &Guard) -> Option<V> {
        let mut rem = key;
        let mut slot: &Atomic<Node<V>> = &self.root;
        loop {
            let cur_sh = slot.load(Ordering::Acquire, guard);
            let cur = unsafe { cur_sh.deref() };
            let m = common_prefix_len(cur.skip.as_slice(), rem);

            if m == cur.skip.len() {
                if m == rem.len() {
                    // The key ends exactly at this node.
                    let old = cur.value(guard);
                    if !old.is_null() {
                        let prev = unsafe { old.deref() }.clone();
                        if assign {
                            let displaced = cur.swap_value(value, guard);
                            cur.bump_version();
                            unsafe { guard.defer_destroy(displaced) };
                        }
                        return Some(prev);
                    }
                    cur.store_value(value);
                    cur.bump_version();
                    self.count.fetch_add(1, Ordering::Release);
                    return None;
                }
                let c = rem[m];
                if let Some(at) = cur.idx.rank(c) {
                    slot = &cur.children[at];
                    rem = &rem[m + 1..];
                    continue;
                }
                // No edge for c: attach a fresh terminator. The leaf is
                // complete before the replacement that references it is
                // published.
                let leaf = Node::leaf(&rem[m + 1..], value);
                let replacement = cur.with_child_attached(c, leaf);
                slot.store(replacement, Ordering::Release);
                unsafe { guard.defer_destroy(cur_sh) };
                self.count.fetch_add(1, Ordering::Release);
                return None;
            }

            // The key diverges inside this node's skip: split it.
            let replacement = Self::split(cur, m, rem, value);
            slot.store(replacement, Ordering::Release);
            unsafe { guard.defer_destroy(cur_sh) };
            self.count.fetch_add(1, Ordering::Release);
            return None;
        }
    }

    /// Build the replacement for a node whose skip diverges from the key
    /// at offset m. The successor inherits everything below the split
    /// point by pointer; the displaced node becomes a husk for the epoch
    /// collector.
    fn split(cur: &Node<V>, m: usize, rem: &[u8], value: V) -> Owned<Node<V>> {
        debug_assert!(m < cur.skip.len());
        debug_assert!(m <= rem.len());
        let split_byte = cur.skip[m];
        let successor = Node::new(
            SkipBuf::from_slice(&cur.skip[m + 1..]),
            cur.idx,
            cur.duplicate_children().into_boxed_slice(),
            cur.value.clone(),
            0,
        );
        let prefix = SkipBuf::from_slice(&cur.skip[..m]);

        if m == rem.len() {
            // The key ends at the split point: the truncated node itself
            // becomes the terminator, with the successor as sole child.
            let mut idx = PopMap::new();
            idx.insert(split_byte);
            Node::new(
                prefix,
                idx,
                vec![Atomic::from(successor)].into_boxed_slice(),
                Atomic::new(value),
                cur.version() + 1,
            )
        } else {
            // Two edges diverge at the split point, ordered by byte.
            let c = rem[m];
            debug_assert!(c != split_byte);
            let leaf = Node::leaf(&rem[m + 1..], value);
            let mut idx = PopMap::new();
            idx.insert(split_byte);
            idx.insert(c);
            let children = if split_byte < c {
                vec![Atomic::from(successor), Atomic::from(leaf)]
            } else {
                vec![Atomic::from(leaf), Atomic::from(successor)]
            };
            Node::new(
                prefix,
                idx,
                children.into_boxed_slice(),
                Atomic::null(),
                cur.version() + 1,
            )
        }
    }

    /// Logically erase key. The node keeps its place in the tree; only
    /// the value is unlinked. compact() collapses the shape afterwards.
    pub(crate) fn remove(&self, key: &[u8]) -> bool {
        let _wguard = self.write.lock();
        let guard = epoch::pin();
        let Some(node) = self.lookup(key, &guard) else {
            return false;
        };
        let v = node.take_value(&guard);
        if v.is_null() {
            return false;
        }
        node.bump_version();
        unsafe { guard.defer_destroy(v) };
        self.count.fetch_sub(1, Ordering::Release);
        true
    }

    /// Drop every entry by publishing a fresh empty root, then retire the
    /// detached tree.
    pub(crate) fn clear(&self) {
        let _wguard = self.write.lock();
        let guard = epoch::pin();
        let old = self.root.swap(Node::root(), Ordering::AcqRel, &guard);
        self.count.store(0, Ordering::Release);

        let mut stack = VecDeque::new();
        stack.push_back(old);
        while let Some(sh) = stack.pop_front() {
            let node = unsafe { sh.deref() };
            for slot in node.children.iter() {
                stack.push_back(slot.load(Ordering::Acquire, &guard));
            }
            let v = node.value(&guard);
            if !v.is_null() {
                unsafe { guard.defer_destroy(v) };
            }
            unsafe { guard.defer_destroy(sh) };
        }
    }

    /// Restore the path-compression shape: unlink valueless childless
    /// nodes and merge valueless single-child nodes into their child.
    /// The rebuilt tree shares every unchanged subtree with the old one
    /// and is published with a single store of the root.
    pub(crate) fn compact(&self) {
        let _wguard = self.write.lock();
        let guard = epoch::pin();
        let root_sh = self.root.load(Ordering::Acquire, &guard);
        let mut retired = Vec::new();
        match self.compact_rec(root_sh, true, &mut retired, &guard) {
            Compacted::Keep => debug_assert!(retired.is_empty()),
            Compacted::Replace(new_root) => {
                self.root.store(new_root, Ordering::Release);
                retired.push(root_sh);
            }
            // The root is never removed.
            Compacted::Remove => unreachable!(),
        }
        // Only after the new tree is published may the displaced nodes be
        // handed to the collector.
        for sh in retired {
            unsafe { guard.defer_destroy(sh) };
        }
    }

    fn compact_rec<'g>(
        &self,
        node_sh: Shared<'g, Node<V>>,
        is_root: bool,
        retired: &mut Vec<Shared<'g, Node<V>>>,
        guard: &'g Guard,
    ) -> Compacted<V> {
        let node = unsafe { node_sh.deref() };
        let nr = node.nr_children();

        // Surviving (edge byte, slot) pairs after the children settle.
        let mut entries: Vec<(u8, Atomic<Node<V>>)> = Vec::with_capacity(nr);
        let mut nr_replaced = 0;
        let mut nr_removed = 0;
        let mut removed_byte = None;
        for at in 0..nr {
            let byte = node.idx.char_at(at);
            let child_sh = node.child_at(at, guard);
            match self.compact_rec(child_sh, false, retired, guard) {
                Compacted::Keep => entries.push((byte, node.children[at].clone())),
                Compacted::Replace(o) => {
                    retired.push(child_sh);
                    entries.push((byte, Atomic::from(o)));
                    nr_replaced += 1;
                }
                Compacted::Remove => {
                    retired.push(child_sh);
                    removed_byte = Some(byte);
                    nr_removed += 1;
                }
            }
        }
        let changed = nr_replaced + nr_removed > 0;

        let has_value = !node.value(guard).is_null();

        if !is_root && !has_value && entries.is_empty() {
            return Compacted::Remove;
        }

        if !is_root && !has_value && entries.len() == 1 {
            // Merge: the kept child absorbs this node's skip plus the
            // edge byte, and takes its position under the grandparent.
            let (byte, only) = entries.pop().unwrap();
            let child_sh = only.load(Ordering::Relaxed, guard);
            let child = unsafe { child_sh.deref() };
            let mut skip = node.skip.clone();
            skip.push(byte);
            skip.extend_from_slice(child.skip.as_slice());
            let merged = Node::new(
                skip,
                child.idx,
                child.duplicate_children().into_boxed_slice(),
                child.value.clone(),
                node.version() + 1,
            );
            retired.push(child_sh);
            return Compacted::Replace(merged);
        }

        if !changed {
            return Compacted::Keep;
        }

        if nr_replaced == 0 && nr_removed == 1 {
            // A single edge vanished from an otherwise untouched node.
            let byte = removed_byte.unwrap();
            return Compacted::Replace(node.with_child_detached(byte));
        }

        let mut idx = PopMap::new();
        let mut children = Vec::with_capacity(entries.len());
        for (byte, slot) in entries {
            let at = idx.insert(byte);
            debug_assert!(at == children.len());
            children.push(slot);
        }
        Compacted::Replace(Node::new(
            node.skip.clone(),
            idx,
            children.into_boxed_slice(),
            node.value.clone(),
            node.version() + 1,
        ))
    }

    /// Walk to the topmost node whose key path extends prefix. Returns
    /// that node and its full key path.
    fn find_subtree<'g>(
        &self,
        prefix: &[u8],
        guard: &'g Guard,
    ) -> Option<(Shared<'g, Node<V>>, Vec<u8>)> {
        let mut rem = prefix;
        let mut path: Vec<u8> = Vec::with_capacity(prefix.len());
        let mut cur_sh = self.root.load(Ordering::Acquire, guard);
        loop {
            let cur = unsafe { cur_sh.deref() };
            let skip = cur.skip.as_slice();
            if rem.len() <= skip.len() {
                if &skip[..rem.len()] == rem {
                    path.extend_from_slice(skip);
                    return Some((cur_sh, path));
                }
                return None;
            }
            if &rem[..skip.len()] != skip {
                return None;
            }
            path.extend_from_slice(skip);
            let c = rem[skip.len()];
            let child = cur.child(c, guard)?;
            path.push(c);
            rem = &rem[skip.len() + 1..];
            cur_sh = child;
        }
    }

    /// Visit every terminator under start in lexicographic key order.
    fn collect<'g, F>(&self, start: Shared<'g, Node<V>>, base: Vec<u8>, guard: &'g Guard, f: &mut F)
    where
        F: FnMut(Vec<u8>, &V),
    {
        // Pre-order: a node's own key sorts before any of its extensions,
        // and children are pushed in reverse so the smallest edge byte
        // pops first.
        let mut stack: Vec<(Shared<'g, Node<V>>, Vec<u8>)> = vec![(start, base)];
        while let Some((sh, key)) = stack.pop() {
            let node = unsafe { sh.deref() };
            for at in (0..node.nr_children()).rev() {
                let byte = node.idx.char_at(at);
                let child_sh = node.child_at(at, guard);
                let child = unsafe { child_sh.deref() };
                let mut ckey = Vec::with_capacity(key.len() + 1 + child.skip.len());
                ckey.extend_from_slice(&key);
                ckey.push(byte);
                ckey.extend_from_slice(child.skip.as_slice());
                stack.push((child_sh, ckey));
            }
            let v = node.value(guard);
            if !v.is_null() {
                f(key, unsafe { v.deref() });
            }
        }
    }

    /// Snapshot of all keys extending prefix, in lexicographic order.
    pub(crate) fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        let guard = epoch::pin();
        let mut out = Vec::new();
        if let Some((start, base)) = self.find_subtree(prefix, &guard) {
            self.collect(start, base, &guard, &mut |k, _| out.push(k));
        }
        out
    }

    /// Snapshot of all entries whose key extends prefix, in lexicographic
    /// key order.
    pub(crate) fn prefixed_range(&self, prefix: &[u8]) -> Vec<(Vec<u8>, V)> {
        let guard = epoch::pin();
        let mut out = Vec::new();
        if let Some((start, base)) = self.find_subtree(prefix, &guard) {
            self.collect(start, base, &guard, &mut |k, v| out.push((k, v.clone())));
        }
        out
    }

    #[allow(unused)]
    pub(crate) fn verify(&self) {
        let guard = epoch::pin();
        let root_sh = self.root.load(Ordering::Acquire, &guard);
        let root = unsafe { root_sh.deref() };
        assert!(root.skip.is_empty());

        // Terminator count matches len, keys enumerate strictly ascending.
        let mut keys: Vec<Vec<u8>> = Vec::new();
        self.collect(root_sh, Vec::new(), &guard, &mut |k, _| keys.push(k));
        assert!(keys.len() == self.len());
        for w in keys.windows(2) {
            assert!(w[0] < w[1]);
        }

        // Structural walk: popmap and slot array stay in lockstep, edge
        // bytes strictly ascend and are unique, no slot is null.
        let mut stack = vec![root_sh];
        while let Some(sh) = stack.pop() {
            let node = unsafe { sh.deref() };
            assert!(node.idx.len() == node.nr_children());
            assert!(node.idx.is_empty() == (node.nr_children() == 0));

            // first/next iteration and rank/char_at indexing must agree
            // on the same ordered edge set.
            let mut at = 0;
            let mut cursor = node.idx.first();
            while let Some(b) = cursor {
                assert!(node.idx.contains(b));
                assert!(node.idx.char_at(at) == b);
                assert!(node.idx.rank(b) == Some(at));
                let ch = node.child_at(at, &guard);
                assert!(!ch.is_null());
                stack.push(ch);
                at += 1;
                cursor = node.idx.next(b);
            }
            assert!(at == node.nr_children());
        }
    }

    #[allow(unused)]
    pub(crate) fn verify_compacted(&self) {
        // No valueless node other than the root may be childless or have
        // a sole child.
        let guard = epoch::pin();
        let root_sh = self.root.load(Ordering::Acquire, &guard);
        let mut stack = vec![(root_sh, true)];
        while let Some((sh, is_root)) = stack.pop() {
            let node = unsafe { sh.deref() };
            if !is_root && node.value(&guard).is_null() {
                assert!(node.nr_children() >= 2);
            }
            for at in 0..node.nr_children() {
                stack.push((node.child_at(at, &guard), false));
            }
        }
    }
}

impl<V> Drop for RadixTree<V> {
    fn drop(&mut self) {
        // No guard can be live against this tree any more, so the whole
        // structure is freed directly rather than through the collector.
        let guard = unsafe { epoch::unprotected() };
        let mut stack = vec![self.root.load(Ordering::Relaxed, guard)];
        while let Some(sh) = stack.pop() {
            {
                let node = unsafe { sh.deref() };
                for slot in node.children.iter() {
                    stack.push(slot.load(Ordering::Relaxed, guard));
                }
                let v = node.value.load(Ordering::Relaxed, guard);
                if !v.is_null() {
                    drop(unsafe { v.into_owned() });
                }
            }
            drop(unsafe { sh.into_owned() });
        }
    }
}
