//! Intrusive doubly linked list over arena-resident entries.
//!
//! Unlike an owning list, this one never allocates or frees the entries it
//! links: they live in device arenas and merely thread their `lru_prev` /
//! `lru_next` pointers through the list. The list itself owns only two
//! sentinel nodes, which keeps every link/unlink branch-free.
//!
//! One pair of link pointers per entry serves three different lists (the
//! global LRU, a namespace LRU, the invalidated pool) because an entry is on
//! at most one of them at any time.
//!
//! No length is tracked; emptiness is a sentinel check and the few callers
//! that need a count walk the list. This mirrors the fact that the cache map
//! already counts the entries that matter.
//!
//! All mutation goes through raw pointers reachable from the sentinels, so
//! every operation takes `&self`: this is what allows the engine's read path
//! to re-head an entry while holding the engine lock in shared mode (the
//! dedicated list lock serializes the pointer writes).

use core::fmt;
use core::ptr;

use crate::entry::ClusterCacheEntry;

/// A non-owning intrusive list of [`ClusterCacheEntry`].
pub(crate) struct EntryList {
    /// Head sentinel; `head.lru_next` is the first element.
    head: *mut ClusterCacheEntry,
    /// Tail sentinel; `tail.lru_prev` is the last element.
    tail: *mut ClusterCacheEntry,
}

// SAFETY: the sentinels are owned by this list and all linked entries live
// in device arenas guarded by the engine lock discipline.
unsafe impl Send for EntryList {}
// SAFETY: see above; `&self` operations are serialized by the engine's
// list lock.
unsafe impl Sync for EntryList {}

impl EntryList {
    /// Creates an empty list (two linked sentinels).
    pub(crate) fn new() -> Self {
        let head = Box::into_raw(Box::new(ClusterCacheEntry::default()));
        let tail = Box::into_raw(Box::new(ClusterCacheEntry::default()));
        // SAFETY: head and tail are freshly allocated, valid and aligned.
        unsafe {
            (*head).set_lru_next(tail);
            (*tail).set_lru_prev(head);
        }
        EntryList { head, tail }
    }

    pub(crate) fn is_empty(&self) -> bool {
        // SAFETY: head is a valid sentinel for the lifetime of the list.
        unsafe { (*self.head).lru_next() == self.tail }
    }

    /// Unlinks `entry` from whatever list it is currently on and resets its
    /// link pointers.
    ///
    /// # Safety
    ///
    /// `entry` must be a valid pointer to an entry that is currently linked
    /// into exactly one list, and the caller must hold the lock protecting
    /// that list.
    pub(crate) unsafe fn unlink(entry: *mut ClusterCacheEntry) {
        // SAFETY: a linked entry has valid neighbours (possibly sentinels).
        unsafe {
            let prev = (*entry).lru_prev();
            let next = (*entry).lru_next();
            (*prev).set_lru_next(next);
            (*next).set_lru_prev(prev);
            (*entry).set_lru_prev(ptr::null_mut());
            (*entry).set_lru_next(ptr::null_mut());
        }
    }

    /// Links `entry` as the first element.
    ///
    /// # Safety
    ///
    /// `entry` must be valid and not currently linked into any list, and the
    /// caller must hold the lock protecting this list.
    pub(crate) unsafe fn push_front(&self, entry: *mut ClusterCacheEntry) {
        // SAFETY: the sentinels are valid and entry is unlinked per contract.
        unsafe {
            let first = (*self.head).lru_next();
            (*entry).set_lru_prev(self.head);
            (*entry).set_lru_next(first);
            (*first).set_lru_prev(entry);
            (*self.head).set_lru_next(entry);
        }
    }

    /// Links `entry` as the last element.
    ///
    /// # Safety
    ///
    /// Same contract as [`push_front`](Self::push_front).
    pub(crate) unsafe fn push_back(&self, entry: *mut ClusterCacheEntry) {
        // SAFETY: the sentinels are valid and entry is unlinked per contract.
        unsafe {
            let last = (*self.tail).lru_prev();
            (*entry).set_lru_next(self.tail);
            (*entry).set_lru_prev(last);
            (*last).set_lru_next(entry);
            (*self.tail).set_lru_prev(entry);
        }
    }

    /// Unlinks and returns the first element, if any.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock protecting this list.
    pub(crate) unsafe fn pop_front(&self) -> Option<*mut ClusterCacheEntry> {
        // SAFETY: sentinels are valid; a non-sentinel first element is a
        // linked entry.
        unsafe {
            let first = (*self.head).lru_next();
            if first == self.tail {
                None
            } else {
                Self::unlink(first);
                Some(first)
            }
        }
    }

    /// Unlinks and returns the last element, if any.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock protecting this list.
    pub(crate) unsafe fn pop_back(&self) -> Option<*mut ClusterCacheEntry> {
        // SAFETY: as for pop_front.
        unsafe {
            let last = (*self.tail).lru_prev();
            if last == self.head {
                None
            } else {
                Self::unlink(last);
                Some(last)
            }
        }
    }

    /// Visits every element front to back.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock protecting this list. `f` must not
    /// relink or unlink entries of this list.
    pub(crate) unsafe fn for_each(&self, mut f: impl FnMut(*mut ClusterCacheEntry)) {
        // SAFETY: walking lru_next from the head sentinel visits linked
        // entries until the tail sentinel.
        unsafe {
            let mut cur = (*self.head).lru_next();
            while cur != self.tail {
                let next = (*cur).lru_next();
                f(cur);
                cur = next;
            }
        }
    }

    /// Visits every element front to back and unlinks those for which `keep`
    /// returns `false`. The successor is captured before the callback runs,
    /// so `keep` may unlink-and-relink the visited entry elsewhere.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock protecting this list. `keep` must not
    /// touch entries of this list other than the one passed to it.
    pub(crate) unsafe fn retain(&self, mut keep: impl FnMut(*mut ClusterCacheEntry) -> bool) {
        // SAFETY: as for for_each; the successor is read before `keep` may
        // unlink the current entry.
        unsafe {
            let mut cur = (*self.head).lru_next();
            while cur != self.tail {
                let next = (*cur).lru_next();
                if !keep(cur) {
                    Self::unlink(cur);
                }
                cur = next;
            }
        }
    }

    /// Number of linked elements. O(n); used by serialization and tests.
    pub(crate) fn len(&self) -> usize {
        let mut n = 0;
        // SAFETY: the list is structurally intact; the caller holds the
        // engine lock.
        unsafe {
            self.for_each(|_| n += 1);
        }
        n
    }

    /// Drops all links without touching the entries themselves.
    pub(crate) fn clear(&self) {
        // SAFETY: the sentinels are valid; relinking them to each other
        // abandons the chain (entries are owned by the device arenas).
        unsafe {
            (*self.head).set_lru_next(self.tail);
            (*self.tail).set_lru_prev(self.head);
        }
    }
}

impl Drop for EntryList {
    fn drop(&mut self) {
        // Only the sentinels are owned; linked entries belong to the arenas.
        // SAFETY: head and tail were created by Box::into_raw in new() and
        // are freed exactly once here.
        unsafe {
            drop(Box::from_raw(self.head));
            drop(Box::from_raw(self.tail));
        }
    }
}

impl fmt::Debug for EntryList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryList")
            .field("empty", &self.is_empty())
            .finish()
    }
}
