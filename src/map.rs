//! Chained hash table from cache key to arena entry.
//!
//! The spine is a vector of `2^k` buckets; each bucket heads a singly
//! linked chain threaded through the entries' `chain_next` pointers, so the
//! map allocates nothing per entry. The bucket index is the low `k` bits of
//! the key's first eight bytes — uniform for content digests, and spread by
//! the cluster address for location keys.
//!
//! Alongside the spine the map keeps a chain-length histogram
//! (`length -> bucket count`) cheap enough to maintain on every insert and
//! remove; it is surfaced through
//! [`NamespaceInfo`](crate::engine::NamespaceInfo) to spot degenerate
//! distributions in the field.

use std::collections::BTreeMap;
use std::fmt;
use std::ptr;

use crate::entry::ClusterCacheEntry;
use crate::key::ClusterCacheKey;

/// One spine slot: the chain head plus its cached length.
#[derive(Clone, Copy)]
struct Bucket {
    head: *mut ClusterCacheEntry,
    len: u64,
}

impl Bucket {
    const EMPTY: Bucket = Bucket {
        head: ptr::null_mut(),
        len: 0,
    };
}

/// Hash table over intrusive entry chains.
pub(crate) struct ClusterCacheMap {
    spine: Vec<Bucket>,
    mask: u64,
    stats: BTreeMap<u64, u64>,
    num_entries: u64,
}

// SAFETY: the map stores pointers into device arenas; every access is
// serialized by the engine lock (mutation requires the write lock).
unsafe impl Send for ClusterCacheMap {}
// SAFETY: see above.
unsafe impl Sync for ClusterCacheMap {}

impl ClusterCacheMap {
    /// Creates a map with no spine; [`resize`](Self::resize) must run before
    /// the first insert.
    pub(crate) fn new() -> Self {
        ClusterCacheMap {
            spine: Vec::new(),
            mask: 0,
            stats: BTreeMap::new(),
            num_entries: 0,
        }
    }

    /// The spine power giving roughly `expected_entries_per_bin` entries per
    /// bucket for a cache of `capacity_in_clusters` entries, floored at 0.
    pub(crate) fn best_size(expected_entries_per_bin: u64, capacity_in_clusters: u64) -> u8 {
        if expected_entries_per_bin == 0 || capacity_in_clusters <= expected_entries_per_bin {
            return 0;
        }
        (capacity_in_clusters / expected_entries_per_bin).ilog2() as u8
    }

    /// Rebuilds the spine with `1 << power` buckets, rehashing every entry in
    /// place.
    pub(crate) fn resize(&mut self, power: u8) {
        assert!(power < 64, "spine power out of range: {power}");
        let mut spine = vec![Bucket::EMPTY; 1usize << power];
        let mask = (1u64 << power) - 1;

        for bucket in &self.spine {
            let mut cur = bucket.head;
            while !cur.is_null() {
                // SAFETY: chain pointers reference live arena entries; the
                // caller holds the engine write lock.
                unsafe {
                    let next = (*cur).chain_next();
                    let target = &mut spine[((*cur).key.hash_prefix() & mask) as usize];
                    (*cur).set_chain_next(target.head);
                    target.head = cur;
                    target.len += 1;
                    cur = next;
                }
            }
        }

        self.spine = spine;
        self.mask = mask;
        self.rebuild_stats();
    }

    fn rebuild_stats(&mut self) {
        self.stats.clear();
        for bucket in &self.spine {
            *self.stats.entry(bucket.len).or_insert(0) += 1;
        }
    }

    /// Moves one bucket from length `from` to length `to` in the histogram.
    fn track(&mut self, from: u64, to: u64) {
        if let Some(n) = self.stats.get_mut(&from) {
            *n -= 1;
            if *n == 0 {
                self.stats.remove(&from);
            }
        }
        *self.stats.entry(to).or_insert(0) += 1;
    }

    fn index(&self, key: &ClusterCacheKey) -> usize {
        debug_assert!(!self.spine.is_empty(), "map used before resize");
        (key.hash_prefix() & self.mask) as usize
    }

    /// Chains `entry` at the head of its bucket.
    ///
    /// # Safety
    ///
    /// `entry` must be a live arena entry that is not already chained into
    /// any map, and the caller must hold the engine write lock.
    pub(crate) unsafe fn insert(&mut self, entry: *mut ClusterCacheEntry) {
        // SAFETY: entry is live per contract.
        unsafe {
            let ind = self.index(&(*entry).key);
            let bucket = &mut self.spine[ind];
            (*entry).set_chain_next(bucket.head);
            bucket.head = entry;
            bucket.len += 1;
            let len = bucket.len;
            self.track(len - 1, len);
        }
        self.num_entries += 1;
    }

    /// Looks up the entry with `key`, if chained.
    pub(crate) fn find(&self, key: &ClusterCacheKey) -> Option<*mut ClusterCacheEntry> {
        if self.spine.is_empty() {
            return None;
        }
        let mut cur = self.spine[self.index(key)].head;
        while !cur.is_null() {
            // SAFETY: chain pointers reference live arena entries; lookups
            // run under at least the engine read lock and chains only change
            // under the write lock.
            unsafe {
                if (*cur).key == *key {
                    return Some(cur);
                }
                cur = (*cur).chain_next();
            }
        }
        None
    }

    /// Unchains the entry with `key`. Returns whether it was present.
    pub(crate) fn remove(&mut self, key: &ClusterCacheKey) -> bool {
        if self.spine.is_empty() {
            return false;
        }
        let ind = self.index(key);
        let bucket = &mut self.spine[ind];
        let mut prev: *mut ClusterCacheEntry = ptr::null_mut();
        let mut cur = bucket.head;
        while !cur.is_null() {
            // SAFETY: chain pointers reference live arena entries; the
            // caller holds the engine write lock.
            unsafe {
                if (*cur).key == *key {
                    if prev.is_null() {
                        bucket.head = (*cur).chain_next();
                    } else {
                        (*prev).set_chain_next((*cur).chain_next());
                    }
                    (*cur).set_chain_next(ptr::null_mut());
                    bucket.len -= 1;
                    let len = bucket.len;
                    self.track(len + 1, len);
                    self.num_entries -= 1;
                    return true;
                }
                prev = cur;
                cur = (*cur).chain_next();
            }
        }
        false
    }

    /// Visits every chained entry.
    ///
    /// `f` may relink the entries' LRU pointers but must not insert into or
    /// remove from this map while the walk is in progress.
    pub(crate) fn for_each(&self, mut f: impl FnMut(*mut ClusterCacheEntry)) {
        for bucket in &self.spine {
            let mut cur = bucket.head;
            while !cur.is_null() {
                // SAFETY: chain pointers reference live arena entries and
                // `f` leaves the chains alone.
                unsafe {
                    let next = (*cur).chain_next();
                    f(cur);
                    cur = next;
                }
            }
        }
    }

    pub(crate) fn entries(&self) -> u64 {
        self.num_entries
    }

    #[allow(dead_code)]
    pub(crate) fn spine_size(&self) -> u64 {
        self.spine.len() as u64
    }

    /// `log2` of the spine size; what gets persisted across restarts.
    pub(crate) fn spine_size_exp(&self) -> u8 {
        if self.spine.is_empty() {
            0
        } else {
            self.spine.len().ilog2() as u8
        }
    }

    /// Chain length histogram: `length -> number of buckets`.
    pub(crate) fn stats(&self) -> &BTreeMap<u64, u64> {
        &self.stats
    }
}

impl fmt::Debug for ClusterCacheMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCacheMap")
            .field("spine_size", &self.spine.len())
            .field("entries", &self.num_entries)
            .finish()
    }
}
