//! A cache device: one disk store plus its in-memory entry arena.
//!
//! The arena is a `Vec<ClusterCacheEntry>` whose capacity is reserved up
//! front at one entry per usable disk slot and never grows beyond that, so
//! the buffer is never reallocated and raw entry pointers stay valid for
//! the device's lifetime. The vector's length only ever increases: slots
//! are claimed in order and recycled through the engine's lists rather
//! than returned to the device.
//!
//! Entry identity is positional: `entry_at(index_of(e)) == e`, and the
//! entry's slot on disk is exactly its arena index.

use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::entry::ClusterCacheEntry;
use crate::key::{ClusterCacheKey, ClusterCacheMode};
use crate::error::Result;
use crate::store::DiskStore;

/// Point-in-time description of one device, as surfaced by
/// [`ClusterCache::device_info`](crate::engine::ClusterCache::device_info).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Filesystem path of the backing file or block device.
    pub path: PathBuf,
    /// Usable bytes (excludes the reserved GUID cluster).
    pub total_size: u64,
    /// Bytes belonging to claimed slots.
    pub used_size: u64,
}

/// Map of device path to [`DeviceInfo`].
pub type DeviceInfoMap = BTreeMap<PathBuf, DeviceInfo>;

/// One backing store and the arena of entries describing its slots.
#[derive(Debug)]
pub(crate) struct Device {
    store: DiskStore,
    entries: Vec<ClusterCacheEntry>,
    /// Number of usable slots; `entries` never grows past this.
    slots: usize,
}

impl Device {
    /// Creates a device over a fresh (or re-created) backing object.
    pub(crate) fn new(path: &Path, size: u64, cluster_size: u64) -> Result<Self> {
        let store = DiskStore::open(path, size, cluster_size)?;
        Ok(Self::with_store(store))
    }

    /// Rebuilds a device from serialized metadata: reopens the backing
    /// object and re-claims the first `used_slots` slots with placeholder
    /// entries, which deserialization then re-keys individually.
    pub(crate) fn reinstate(
        path: &Path,
        total_size: u64,
        cluster_size: u64,
        used_slots: u32,
    ) -> Result<Self> {
        let store = DiskStore::reinstate(path, total_size, cluster_size)?;
        let mut dev = Self::with_store(store);
        for _ in 0..used_slots {
            dev.entries.push(ClusterCacheEntry::default());
        }
        Ok(dev)
    }

    fn with_store(store: DiskStore) -> Self {
        let slots = (store.total_size() / store.cluster_size()) as usize;
        assert!(slots <= u32::MAX as usize, "device too large to index");
        let mut entries = Vec::new();
        entries.reserve_exact(slots);
        Device {
            store,
            entries,
            slots,
        }
    }

    /// Claims the next unclaimed slot for `key`, or `None` when every slot
    /// has been handed out. Recycling of claimed slots is the engine's job.
    pub(crate) fn get_next_free(&mut self, key: &ClusterCacheKey) -> Option<*mut ClusterCacheEntry> {
        if self.entries.len() < self.slots {
            debug_assert!(self.entries.len() < self.entries.capacity());
            self.entries
                .push(ClusterCacheEntry::new(*key, ClusterCacheMode::ContentBased));
            // The push stays within the reserved capacity, so the buffer did
            // not move and existing entry pointers remain valid.
            self.entries.last_mut().map(|e| e as *mut ClusterCacheEntry)
        } else {
            None
        }
    }

    /// Whether `entry` points into this device's arena.
    pub(crate) fn has_entry(&self, entry: *const ClusterCacheEntry) -> bool {
        let base = self.entries.as_ptr() as usize;
        let addr = entry as usize;
        let span = self.entries.len() * mem::size_of::<ClusterCacheEntry>();
        addr >= base && addr < base + span
    }

    /// Arena index (== disk slot) of `entry`.
    ///
    /// # Panics
    ///
    /// Panics if `entry` does not belong to this arena.
    pub(crate) fn index_of(&self, entry: *const ClusterCacheEntry) -> u32 {
        assert!(self.has_entry(entry), "entry not in this device's arena");
        let base = self.entries.as_ptr() as usize;
        ((entry as usize - base) / mem::size_of::<ClusterCacheEntry>()) as u32
    }

    /// The claimed entry at arena index `index`, if in range.
    pub(crate) fn entry_at(&mut self, index: u32) -> Option<*mut ClusterCacheEntry> {
        self.entries
            .get_mut(index as usize)
            .map(|e| e as *mut ClusterCacheEntry)
    }

    /// Reads the cluster belonging to `entry` into `buf`.
    pub(crate) fn read(&self, buf: &mut [u8], entry: *const ClusterCacheEntry) -> io::Result<()> {
        self.store.read(buf, self.index_of(entry))
    }

    /// Writes `buf` into the cluster belonging to `entry`.
    pub(crate) fn write(&self, buf: &[u8], entry: *const ClusterCacheEntry) -> io::Result<()> {
        self.store.write(buf, self.index_of(entry))
    }

    /// Re-digests the on-disk cluster of a content-based entry.
    /// Location-based entries have nothing to verify against.
    ///
    /// # Safety
    ///
    /// `entry` must point to a claimed entry of this arena and the caller
    /// must hold the engine lock.
    pub(crate) unsafe fn check(&self, entry: *const ClusterCacheEntry) -> Result<()> {
        // SAFETY: entry is claimed and live per contract.
        unsafe {
            if (*entry).mode() == ClusterCacheMode::ContentBased {
                self.store.verify((*entry).key.digest(), self.index_of(entry))?;
            }
        }
        Ok(())
    }

    pub(crate) fn write_guid(&self, uuid: &Uuid) {
        self.store.write_guid(uuid);
    }

    pub(crate) fn check_guid(&self, uuid: &Uuid) -> bool {
        self.store.check_guid(uuid)
    }

    pub(crate) fn sync(&self) -> io::Result<()> {
        self.store.sync()
    }

    pub(crate) fn path(&self) -> &Path {
        self.store.path()
    }

    /// Path comparison under symlink resolution, so the same mount point
    /// reached through different names is still recognized.
    pub(crate) fn matches_path(&self, path: &Path) -> bool {
        if self.store.path() == path {
            return true;
        }
        match (self.store.path().canonicalize(), path.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    pub(crate) fn total_size(&self) -> u64 {
        self.store.total_size()
    }

    /// Number of claimed slots.
    pub(crate) fn used_slots(&self) -> u32 {
        self.entries.len() as u32
    }

    pub(crate) fn info(&self) -> DeviceInfo {
        DeviceInfo {
            path: self.store.path().to_path_buf(),
            total_size: self.store.total_size(),
            used_size: self.entries.len() as u64 * self.store.cluster_size(),
        }
    }
}

// SAFETY: the arena entries contain raw pointers but the device itself is
// only reached through the engine, whose lock discipline serializes all
// access.
unsafe impl Send for Device {}
// SAFETY: see above.
unsafe impl Sync for Device {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ClusterCacheHandle;
    use tempfile::TempDir;

    const CLUSTER: u64 = 4096;

    fn device(dir: &TempDir, slots: u64) -> Device {
        Device::new(&dir.path().join("dev"), (slots + 1) * CLUSTER, CLUSTER).unwrap()
    }

    fn key(addr: u64) -> ClusterCacheKey {
        ClusterCacheKey::from_location(ClusterCacheHandle(1), addr)
    }

    #[test]
    fn test_get_next_free_exhausts_slots() {
        let mut dev = device(&TempDir::new().unwrap(), 3);
        for i in 0..3 {
            assert!(dev.get_next_free(&key(i)).is_some(), "slot {i} must be free");
        }
        assert!(dev.get_next_free(&key(3)).is_none());
        assert_eq!(dev.used_slots(), 3);
    }

    #[test]
    fn test_pointer_index_roundtrip() {
        let mut dev = device(&TempDir::new().unwrap(), 4);
        let e0 = dev.get_next_free(&key(0)).unwrap();
        let e1 = dev.get_next_free(&key(1)).unwrap();

        assert_eq!(dev.index_of(e0), 0);
        assert_eq!(dev.index_of(e1), 1);
        assert_eq!(dev.entry_at(0), Some(e0));
        assert_eq!(dev.entry_at(1), Some(e1));
        assert_eq!(dev.entry_at(2), None);

        assert!(dev.has_entry(e0));
        assert!(!dev.has_entry(std::ptr::null()));
    }

    #[test]
    fn test_pointers_stable_while_arena_grows() {
        let mut dev = device(&TempDir::new().unwrap(), 64);
        let first = dev.get_next_free(&key(0)).unwrap();
        for i in 1..64 {
            dev.get_next_free(&key(i)).unwrap();
        }
        // The first pointer still resolves to slot 0 after the arena filled.
        assert_eq!(dev.index_of(first), 0);
        unsafe {
            assert_eq!((*first).key, key(0));
        }
    }

    #[test]
    fn test_entry_io() {
        let dir = TempDir::new().unwrap();
        let mut dev = device(&dir, 2);
        let e = dev.get_next_free(&key(7)).unwrap();

        let data = vec![0x5au8; CLUSTER as usize];
        dev.write(&data, e).unwrap();
        let mut out = vec![0u8; CLUSTER as usize];
        dev.read(&mut out, e).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_check_content_based_entry() {
        let dir = TempDir::new().unwrap();
        let mut dev = device(&dir, 2);

        let data = vec![9u8; CLUSTER as usize];
        let digest = *md5::compute(&data);
        let e = dev
            .get_next_free(&ClusterCacheKey::from_digest(digest))
            .unwrap();
        dev.write(&data, e).unwrap();
        unsafe {
            dev.check(e).unwrap();
        }

        // Corrupt the slot behind the cache's back.
        dev.write(&vec![0u8; CLUSTER as usize], e).unwrap();
        unsafe {
            assert!(dev.check(e).is_err());
        }
    }

    #[test]
    fn test_reinstate_reclaims_slots() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dev");
        let total = {
            let mut dev = Device::new(&path, 5 * CLUSTER, CLUSTER).unwrap();
            dev.get_next_free(&key(0)).unwrap();
            dev.get_next_free(&key(1)).unwrap();
            dev.total_size()
        };

        let mut dev = Device::reinstate(&path, total, CLUSTER, 2).unwrap();
        assert_eq!(dev.used_slots(), 2);
        assert!(dev.entry_at(1).is_some());
        assert!(dev.entry_at(2).is_none());
        // Two of four slots claimed; allocation continues at slot 2.
        let e = dev.get_next_free(&key(2)).unwrap();
        assert_eq!(dev.index_of(e), 2);
    }

    #[test]
    fn test_info() {
        let dir = TempDir::new().unwrap();
        let mut dev = device(&dir, 4);
        dev.get_next_free(&key(0)).unwrap();

        let info = dev.info();
        assert_eq!(info.total_size, 4 * CLUSTER);
        assert_eq!(info.used_size, CLUSTER);
        assert_eq!(info.path, dir.path().join("dev"));
    }
}
