//! The arena-resident cache entry.
//!
//! A [`ClusterCacheEntry`] describes one cached cluster. Entries are never
//! allocated individually: each [`Device`](crate::device::Device) owns a
//! contiguous `Vec` of them whose backing buffer never reallocates, so a
//! `*mut ClusterCacheEntry` stays valid for the device's lifetime and an
//! entry's slot on disk is recovered by pointer arithmetic against the
//! arena base.
//!
//! Entries carry their own list linkage (intrusive design): a doubly-linked
//! pair for whichever LRU-style list the entry is currently on, and a singly
//! linked pointer for its cache map bucket chain. With tens of millions of
//! live entries, separate list nodes would double the memory overhead and
//! scatter the pointer chases.
//!
//! The keying mode is packed into the low bits of the `lru_prev` word:
//! entries are 8-byte aligned, so the low three bits of any entry pointer
//! are zero and can host a flag. This keeps the entry at 40 bytes.

use core::fmt;
use core::ptr;

use crate::key::{ClusterCacheKey, ClusterCacheMode};

/// Alignment of an entry, in bits. Pointers stored in `lru_prev` must have
/// this many zero low bits.
const ALIGN_BITS: u64 = 3;
/// Mask selecting the mode flag bits of `lru_prev`.
const TAG_MASK: u64 = (1 << ALIGN_BITS) - 1;
/// Mask selecting the pointer bits of `lru_prev`.
const PTR_MASK: u64 = !TAG_MASK;

const CONTENT_BASED_TAG: u64 = 1;
const LOCATION_BASED_TAG: u64 = 1 << 1;

/// One cached cluster: its key, keying mode, and intrusive list linkage.
///
/// The entry's identity is its address within its device's arena. All
/// linkage mutation happens under the engine's locking discipline (see
/// [`ClusterCache`](crate::engine::ClusterCache)).
pub struct ClusterCacheEntry {
    /// The 16-byte cache key. Interpreted per [`mode`](Self::mode).
    pub key: ClusterCacheKey,
    /// Previous-entry pointer of the LRU-style list this entry is on, with
    /// the mode flag packed into the low bits.
    lru_prev: u64,
    /// Next-entry pointer of the LRU-style list this entry is on.
    lru_next: *mut ClusterCacheEntry,
    /// Next entry in the cache map bucket chain.
    chain_next: *mut ClusterCacheEntry,
}

// SAFETY: an entry is plain data plus pointers into sibling arena slots and
// list sentinels owned by the same engine. All access to entries is
// serialized by the engine's lock discipline; nothing is reference counted
// or thread-local.
unsafe impl Send for ClusterCacheEntry {}
// SAFETY: see above; shared references never mutate without the engine's
// list lock held.
unsafe impl Sync for ClusterCacheEntry {}

impl ClusterCacheEntry {
    /// Creates an unlinked entry with the given key and mode.
    pub fn new(key: ClusterCacheKey, mode: ClusterCacheMode) -> Self {
        let tag = match mode {
            ClusterCacheMode::ContentBased => CONTENT_BASED_TAG,
            ClusterCacheMode::LocationBased => LOCATION_BASED_TAG,
        };
        ClusterCacheEntry {
            key,
            lru_prev: tag,
            lru_next: ptr::null_mut(),
            chain_next: ptr::null_mut(),
        }
    }

    /// The keying mode, recovered from the tag bits of `lru_prev`.
    pub fn mode(&self) -> ClusterCacheMode {
        if self.lru_prev & CONTENT_BASED_TAG != 0 {
            ClusterCacheMode::ContentBased
        } else {
            ClusterCacheMode::LocationBased
        }
    }

    pub(crate) fn lru_prev(&self) -> *mut ClusterCacheEntry {
        (self.lru_prev & PTR_MASK) as *mut ClusterCacheEntry
    }

    pub(crate) fn set_lru_prev(&mut self, prev: *mut ClusterCacheEntry) {
        debug_assert_eq!(prev as u64 & TAG_MASK, 0, "misaligned entry pointer");
        self.lru_prev = (prev as u64 & PTR_MASK) | (self.lru_prev & TAG_MASK);
    }

    pub(crate) fn lru_next(&self) -> *mut ClusterCacheEntry {
        self.lru_next
    }

    pub(crate) fn set_lru_next(&mut self, next: *mut ClusterCacheEntry) {
        self.lru_next = next;
    }

    pub(crate) fn chain_next(&self) -> *mut ClusterCacheEntry {
        self.chain_next
    }

    pub(crate) fn set_chain_next(&mut self, next: *mut ClusterCacheEntry) {
        self.chain_next = next;
    }
}

impl Default for ClusterCacheEntry {
    fn default() -> Self {
        ClusterCacheEntry::new(
            ClusterCacheKey::from_digest([0u8; 16]),
            ClusterCacheMode::ContentBased,
        )
    }
}

impl fmt::Debug for ClusterCacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCacheEntry")
            .field("key", &self.key)
            .field("mode", &self.mode())
            .finish()
    }
}

#[cfg(target_pointer_width = "64")]
const _: () = assert!(core::mem::size_of::<ClusterCacheEntry>() == 40);
const _: () = assert!(core::mem::align_of::<ClusterCacheEntry>() == 1 << ALIGN_BITS);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ClusterCacheHandle;

    #[test]
    fn test_mode_survives_prev_updates() {
        let key = ClusterCacheKey::from_location(ClusterCacheHandle(1), 2);
        let mut e = ClusterCacheEntry::new(key, ClusterCacheMode::LocationBased);
        assert_eq!(e.mode(), ClusterCacheMode::LocationBased);
        assert!(e.lru_prev().is_null());

        let mut other = ClusterCacheEntry::default();
        e.set_lru_prev(&mut other);
        assert_eq!(e.lru_prev(), &mut other as *mut _);
        assert_eq!(e.mode(), ClusterCacheMode::LocationBased);

        e.set_lru_prev(ptr::null_mut());
        assert!(e.lru_prev().is_null());
        assert_eq!(e.mode(), ClusterCacheMode::LocationBased);
    }

    #[test]
    fn test_content_based_tag() {
        let e = ClusterCacheEntry::new(
            ClusterCacheKey::from_digest(*md5::compute(b"x")),
            ClusterCacheMode::ContentBased,
        );
        assert_eq!(e.mode(), ClusterCacheMode::ContentBased);
    }

    #[test]
    fn test_reinit_switches_mode() {
        let key = ClusterCacheKey::from_location(ClusterCacheHandle(9), 0);
        let mut e = ClusterCacheEntry::new(key, ClusterCacheMode::ContentBased);
        e = ClusterCacheEntry::new(e.key, ClusterCacheMode::LocationBased);
        assert_eq!(e.mode(), ClusterCacheMode::LocationBased);
        assert_eq!(e.key, key);
    }
}
