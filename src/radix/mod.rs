//! See the documentation for `RadixMap`.

use std::fmt::Debug;
use std::iter::FromIterator;

use crate::internals::radix::tree::RadixTree;

#[cfg(feature = "serde")]
use serde::{
    de::{Deserialize, Deserializer},
    ser::{Serialize, SerializeSeq, Serializer},
};

/// A concurrently readable, ordered map over byte string keys, stored in
/// a path-compressed radix tree.
///
/// This structure can be used in locations where you would otherwise use
/// `RwLock<BTreeMap>` or `Mutex<BTreeMap>` with byte or string keys, and
/// your workload is dominated by reads. Lookups never take a lock: a
/// reader walks the live tree under an epoch pin, observing each edge
/// with an atomic acquire load. Writers are serialised (one after the
/// other, as with a mutex) and publish every change with a single
/// release store, so a concurrent reader always sees either the state
/// before a mutation or the state after it, never anything in between.
///
/// Keys are arbitrary byte strings - anything `AsRef<[u8]>` - ordered
/// lexicographically, and the empty key is valid. To use integer keys
/// while keeping their numeric order, encode them with [`crate::keycode`].
///
/// Erase is logical: the erased entry's node stays in the tree until
/// [`RadixMap::compact`] is called, which restores the fully compressed
/// shape. Point operations are correct either way; compaction only
/// bounds memory and shortens descents.
///
/// # Examples
/// ```
/// use conradix::RadixMap;
///
/// let map: RadixMap<i64> = RadixMap::new();
/// assert!(map.insert("hello", 1).is_none());
/// assert!(map.insert("help", 2).is_none());
/// assert_eq!(map.get("hello"), Some(1));
/// // "hel" is only a prefix of stored keys, not a key itself.
/// assert_eq!(map.get("hel"), None);
/// assert_eq!(map.keys_with_prefix("hel").len(), 2);
///
/// assert!(map.remove("hello"));
/// map.compact();
/// assert_eq!(map.len(), 1);
/// ```
pub struct RadixMap<V>
where
    V: Clone + Send + Sync + 'static,
{
    inner: RadixTree<V>,
}

impl<V: Clone + Send + Sync + 'static> Default for RadixMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync + 'static> RadixMap<V> {
    /// Construct a new, empty map.
    pub fn new() -> Self {
        RadixMap {
            inner: RadixTree::new(),
        }
    }

    /// The current number of entries. This may be concurrently changing
    /// under you if writers are active.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True if the map currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Assert if a key is present. Takes no lock.
    pub fn contains_key<K: AsRef<[u8]>>(&self, key: K) -> bool {
        self.inner.contains_key(key.as_ref())
    }

    /// Retrieve the value for a key, if present. Takes no lock; the
    /// returned value is a clone taken at the moment the entry was
    /// observed.
    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> Option<V> {
        self.inner.get(key.as_ref())
    }

    /// Insert a value for a key if the key is absent. If the key is
    /// already present its current value is returned and the map is left
    /// unchanged - use [`RadixMap::insert_or_assign`] to overwrite.
    pub fn insert<K: AsRef<[u8]>>(&self, key: K, value: V) -> Option<V> {
        self.inner.insert(key.as_ref(), value)
    }

    /// Insert a value for a key, replacing and returning the previous
    /// value if the key was present.
    pub fn insert_or_assign<K: AsRef<[u8]>>(&self, key: K, value: V) -> Option<V> {
        self.inner.insert_or_assign(key.as_ref(), value)
    }

    /// Erase a key. Returns true if the key was present. The erase is
    /// logical - the node remains in the tree until [`RadixMap::compact`]
    /// runs.
    pub fn remove<K: AsRef<[u8]>>(&self, key: K) -> bool {
        self.inner.remove(key.as_ref())
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.inner.clear()
    }

    /// Collapse the shapes left behind by erase: nodes that carry no
    /// value and have one or zero children are merged away. Runs under
    /// the writer lock; concurrent readers are unaffected. Idempotent.
    pub fn compact(&self) {
        self.inner.compact()
    }

    /// A snapshot of every key, in lexicographic order.
    ///
    /// The snapshot is only a point-in-time copy: entries may be added
    /// or erased concurrently after it is taken.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.inner.keys_with_prefix(b"")
    }

    /// A snapshot of every key that starts with the given prefix, in
    /// lexicographic order.
    pub fn keys_with_prefix<K: AsRef<[u8]>>(&self, prefix: K) -> Vec<Vec<u8>> {
        self.inner.keys_with_prefix(prefix.as_ref())
    }

    /// A snapshot of every entry whose key starts with the given prefix,
    /// in lexicographic key order, with values cloned at the moment each
    /// entry was observed.
    pub fn prefixed_range<K: AsRef<[u8]>>(&self, prefix: K) -> Vec<(Vec<u8>, V)> {
        self.inner.prefixed_range(prefix.as_ref())
    }

    #[cfg(test)]
    pub(crate) fn verify(&self) {
        self.inner.verify();
    }
}

impl<K: AsRef<[u8]>, V: Clone + Send + Sync + 'static> FromIterator<(K, V)> for RadixMap<V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = RadixMap::new();
        for (k, v) in iter {
            map.insert_or_assign(k, v);
        }
        map
    }
}

impl<K: AsRef<[u8]>, V: Clone + Send + Sync + 'static> Extend<(K, V)> for RadixMap<V> {
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.insert_or_assign(k, v);
        }
    }
}

impl<V: Clone + Send + Sync + 'static + Debug> Debug for RadixMap<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_map()
            .entries(self.prefixed_range(b""))
            .finish()
    }
}

#[cfg(feature = "serde")]
impl<V> Serialize for RadixMap<V>
where
    V: Serialize + Clone + Send + Sync + 'static,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        // Byte string keys rule out string-keyed map formats, so the map
        // round-trips as a sequence of entry pairs in key order.
        let entries = self.prefixed_range(b"");
        let mut state = serializer.serialize_seq(Some(entries.len()))?;
        for entry in entries.iter() {
            state.serialize_element(entry)?;
        }
        state.end()
    }
}

#[cfg(feature = "serde")]
impl<'de, V> Deserialize<'de> for RadixMap<V>
where
    V: Deserialize<'de> + Clone + Send + Sync + 'static,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let entries: Vec<(Vec<u8>, V)> = Vec::deserialize(deserializer)?;
        Ok(entries.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::RadixMap;
    use crate::keycode::encode_u64;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread::scope;

    #[test]
    fn test_radix_map_basic() {
        let map: RadixMap<u64> = RadixMap::new();
        assert!(map.is_empty());

        assert!(map.insert("one", 1).is_none());
        assert!(map.insert("two", 2).is_none());
        assert!(map.insert("three", 3).is_none());
        assert!(map.insert("onesie", 4).is_none());
        map.verify();

        assert_eq!(map.len(), 4);
        assert!(map.contains_key("one"));
        assert!(map.contains_key("onesie"));
        assert!(!map.contains_key("on"));
        assert_eq!(map.get("two"), Some(2));
        assert_eq!(map.get("twofold"), None);

        assert!(map.remove("one"));
        assert!(!map.remove("one"));
        assert_eq!(map.len(), 3);
        assert_eq!(map.get("onesie"), Some(4));
        map.verify();
    }

    #[test]
    fn test_radix_map_from_iter() {
        let map: RadixMap<u64> = vec![("zeta", 26), ("alpha", 1), ("beta", 2)]
            .into_iter()
            .collect();
        assert_eq!(map.len(), 3);
        assert_eq!(map.get("alpha"), Some(1));

        let keys = map.keys();
        assert_eq!(keys[0], b"alpha");
        assert_eq!(keys[1], b"beta");
        assert_eq!(keys[2], b"zeta");
        map.verify();
    }

    #[test]
    fn test_radix_map_extend() {
        let mut map: RadixMap<u64> = RadixMap::new();
        map.extend((0..32u64).map(|i| (encode_u64(i), i)));
        assert_eq!(map.len(), 32);
        for i in 0..32u64 {
            assert_eq!(map.get(encode_u64(i)), Some(i));
        }
    }

    #[test]
    fn test_radix_map_clear() {
        let map: RadixMap<u64> = (0..16u64).map(|i| (encode_u64(i), i)).collect();
        assert_eq!(map.len(), 16);
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.get(encode_u64(3)), None);
        assert!(map.insert("again", 1).is_none());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_radix_map_debug() {
        let map: RadixMap<u64> = vec![(b"k".as_slice(), 7)].into_iter().collect();
        let out = format!("{:?}", map);
        assert!(out.contains('7'));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_radix_map_multithread_disjoint_writers() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 256;

        let map: RadixMap<usize> = RadixMap::new();

        scope(|scope| {
            let m = &map;
            let writers: Vec<_> = (0..THREADS)
                .map(|t| {
                    scope.spawn(move || {
                        for i in 0..PER_THREAD {
                            let mut key = vec![t as u8];
                            key.extend_from_slice(&encode_u64(i as u64));
                            assert!(m.insert(key, t * PER_THREAD + i).is_none());
                        }
                    })
                })
                .collect();
            for h in writers {
                h.join().unwrap();
            }
        });

        // No insert may be lost across the serialised writers.
        assert_eq!(map.len(), THREADS * PER_THREAD);
        for t in 0..THREADS {
            for i in 0..PER_THREAD {
                let mut key = vec![t as u8];
                key.extend_from_slice(&encode_u64(i as u64));
                assert_eq!(map.get(key), Some(t * PER_THREAD + i));
            }
        }
        map.verify();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_radix_map_multithread_read_write() {
        let map: RadixMap<u64> = RadixMap::new();
        assert!(map.insert("stable", 0).is_none());
        let done = AtomicBool::new(false);

        scope(|scope| {
            let m = &map;
            let d = &done;

            let readers: Vec<_> = (0..3)
                .map(|_| {
                    scope.spawn(move || {
                        let mut completions = 0u64;
                        while !d.load(Ordering::Acquire) {
                            // The churned key flickers in and out; the
                            // stable key must always be observable.
                            let _ = m.get("flicker");
                            assert_eq!(m.get("stable"), Some(0));
                            completions += 1;
                        }
                        assert!(completions > 0);
                    })
                })
                .collect();

            let writer = scope.spawn(move || {
                for i in 0..20_000u64 {
                    m.insert("flicker", i);
                    m.remove("flicker");
                    if i % 1024 == 0 {
                        m.compact();
                    }
                }
                d.store(true, Ordering::Release);
            });

            writer.join().unwrap();
            for h in readers {
                h.join().unwrap();
            }
        });

        assert_eq!(map.len(), 1);
        map.verify();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_radix_map_multithread_churn() {
        use rand::seq::SliceRandom;

        const THREADS: usize = 16;
        const W: usize = 48;

        let keys: Vec<String> = (0..W).map(|i| format!("key{:03}", i * 3)).collect();
        let map: RadixMap<u64> = RadixMap::new();

        scope(|scope| {
            let m = &map;
            let kref = &keys;
            let workers: Vec<_> = (0..THREADS)
                .map(|t| {
                    scope.spawn(move || {
                        let mut rng = rand::thread_rng();
                        let mut order: Vec<usize> = (0..W).collect();
                        order.shuffle(&mut rng);
                        for &i in order.iter() {
                            let k = &kref[i];
                            let _ = m.get(k);
                            let _ = m.insert(k, t as u64);
                            let _ = m.get(k);
                            let _ = m.remove(k);
                            let _ = m.get(k);
                            let _ = m.insert(k, t as u64 + 1);
                            let _ = m.get(k);
                        }
                    })
                })
                .collect();
            for h in workers {
                h.join().unwrap();
            }
        });

        // Every thread's last operation on each key is an insert, so
        // after the join each key is present exactly once.
        assert_eq!(map.len(), W);
        for k in keys.iter() {
            assert!(map.contains_key(k));
        }
        map.verify();
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_radix_map_serialize_deserialize() {
        let map: RadixMap<u64> = vec![("alpha", 1), ("beta", 2), ("al", 3)]
            .into_iter()
            .collect();

        let value = serde_json::to_value(&map).unwrap();
        let map2: RadixMap<u64> = serde_json::from_value(value).unwrap();

        assert_eq!(map2.len(), 3);
        assert_eq!(map2.get("al"), Some(3));
        assert_eq!(map2.get("alpha"), Some(1));
        assert_eq!(map2.get("beta"), Some(2));
        assert_eq!(map.keys(), map2.keys());
    }
}
