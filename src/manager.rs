//! Ownership and allocation across the set of online devices.
//!
//! Devices are boxed so their arenas keep stable addresses while the set
//! changes. Slot allocation is round-robin: a cursor walks the device list
//! one step per successful allocation, spreading fresh entries (and their
//! I/O) across spindles. Once a full sweep finds no free slot the manager
//! latches a `full` flag so the hot path short-circuits until topology
//! changes.
//!
//! Every topology change mints a fresh manager GUID and stamps it onto all
//! devices. This is what lets a restart distinguish "these devices belonged
//! to my previous incarnation, reinstate them" from "stale device of some
//! other instance, leave it alone" — and it catches the same device being
//! added twice through different names: by the time the newcomer is
//! GUID-checked, the stamp written through the existing devices already
//! shows up in it.

use std::io;
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use uuid::Uuid;

use crate::device::{Device, DeviceInfoMap};
use crate::entry::ClusterCacheEntry;
use crate::error::Result;
use crate::key::ClusterCacheKey;

/// Identity token for a device: its stable address. Used for membership
/// checks and lookups; never dereferenced directly.
pub(crate) type DeviceId = *const Device;

/// The set of online devices plus the allocation cursor.
#[derive(Debug)]
pub(crate) struct DeviceManager {
    devices: Vec<Box<Device>>,
    /// Round-robin start position for the next allocation sweep.
    cursor: usize,
    /// Latched when a sweep found no free slot anywhere.
    full: bool,
    cluster_size: u64,
    guid: Uuid,
}

impl DeviceManager {
    pub(crate) fn new(cluster_size: u64) -> Self {
        DeviceManager {
            devices: Vec::new(),
            cursor: 0,
            full: true,
            cluster_size,
            guid: Uuid::new_v4(),
        }
    }

    pub(crate) fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    pub(crate) fn guid(&self) -> Uuid {
        self.guid
    }

    pub(crate) fn is_full(&self) -> bool {
        self.full
    }

    pub(crate) fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Opens a device and adds it to the set.
    ///
    /// Returns `Ok(false)` when the newcomer turns out to be one of the
    /// devices already in the set (reached through another name); `Err` when
    /// the backing object cannot be opened.
    pub(crate) fn add_device(&mut self, path: &Path, size: u64) -> Result<bool> {
        let dev = Device::new(path, size, self.cluster_size)?;

        self.guid = Uuid::new_v4();
        for d in &self.devices {
            d.write_guid(&self.guid);
        }

        if dev.check_guid(&self.guid) {
            error!(
                "not adding device {} because it seems to be in use already",
                path.display()
            );
            return Ok(false);
        }

        dev.write_guid(&self.guid);
        self.devices.push(Box::new(dev));
        self.cursor = 0;
        self.full = false;
        info!("added device {}", path.display());
        Ok(true)
    }

    /// Adds an already reinstated device (deserialization path). The caller
    /// re-stamps GUIDs itself once the whole set is rebuilt.
    pub(crate) fn push_reinstated(&mut self, dev: Device) -> DeviceId {
        self.devices.push(Box::new(dev));
        self.cursor = 0;
        let id: DeviceId = &*self.devices[self.devices.len() - 1] as *const Device;
        id
    }

    /// Restamps every device with a fresh manager GUID.
    pub(crate) fn refresh_guid(&mut self) {
        self.guid = Uuid::new_v4();
        for d in &self.devices {
            d.write_guid(&self.guid);
        }
    }

    pub(crate) fn set_full(&mut self, full: bool) {
        self.full = full;
    }

    /// Whether `id` still names a device of this set.
    pub(crate) fn contains(&self, id: DeviceId) -> bool {
        self.devices.iter().any(|d| &**d as DeviceId == id)
    }

    fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| &***d as DeviceId == id).map(|d| &**d)
    }

    /// Removes `id` from the set. On-disk data is left alone; the caller has
    /// already purged every in-memory reference.
    pub(crate) fn remove_device(&mut self, id: DeviceId) {
        match self.devices.iter().position(|d| &**d as DeviceId == id) {
            Some(pos) => {
                let dev = self.devices.remove(pos);
                self.cursor = 0;
                info!("removed device {}", dev.path().display());
            }
            None => error!("asked to remove a device that is not in the set"),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.devices.clear();
        self.cursor = 0;
    }

    /// The device whose arena contains `entry`.
    pub(crate) fn device_of(&self, entry: *const ClusterCacheEntry) -> Option<DeviceId> {
        self.devices
            .iter()
            .find(|d| d.has_entry(entry))
            .map(|d| &**d as DeviceId)
    }

    /// `(device index, slot)` of `entry`, for serialization.
    pub(crate) fn entry_location(&self, entry: *const ClusterCacheEntry) -> Option<(u32, u32)> {
        self.devices
            .iter()
            .position(|d| d.has_entry(entry))
            .map(|i| (i as u32, self.devices[i].index_of(entry)))
    }

    pub(crate) fn find_by_path(&self, path: &Path) -> Option<DeviceId> {
        self.devices
            .iter()
            .find(|d| d.matches_path(path))
            .map(|d| &**d as DeviceId)
    }

    pub(crate) fn path_of(&self, id: DeviceId) -> Option<PathBuf> {
        self.get(id).map(|d| d.path().to_path_buf())
    }

    /// Claims a fresh slot, starting the sweep at the round-robin cursor.
    /// Latches `full` after a fruitless sweep.
    pub(crate) fn allocate_slot(
        &mut self,
        key: &ClusterCacheKey,
    ) -> Option<(DeviceId, *mut ClusterCacheEntry)> {
        if self.full || self.devices.is_empty() {
            return None;
        }

        let n = self.devices.len();
        let cursor = self.cursor.min(n - 1);
        for i in (cursor..n).chain(0..cursor) {
            if let Some(entry) = self.devices[i].get_next_free(key) {
                let id = &*self.devices[i] as DeviceId;
                self.cursor = (cursor + 1) % n;
                return Some((id, entry));
            }
        }

        self.full = true;
        None
    }

    pub(crate) fn read_entry(
        &self,
        id: DeviceId,
        buf: &mut [u8],
        entry: *const ClusterCacheEntry,
    ) -> io::Result<()> {
        match self.get(id) {
            Some(d) => d.read(buf, entry),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "device gone")),
        }
    }

    pub(crate) fn write_entry(
        &self,
        id: DeviceId,
        buf: &[u8],
        entry: *const ClusterCacheEntry,
    ) -> io::Result<()> {
        match self.get(id) {
            Some(d) => d.write(buf, entry),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "device gone")),
        }
    }

    /// Runs the digest check for `entry` on its device.
    ///
    /// # Safety
    ///
    /// `entry` must be a claimed entry of the device named by `id`.
    pub(crate) unsafe fn check_entry(
        &self,
        id: DeviceId,
        entry: *const ClusterCacheEntry,
    ) -> Result<()> {
        match self.get(id) {
            // SAFETY: per contract.
            Some(d) => unsafe { d.check(entry) },
            None => Ok(()),
        }
    }

    pub(crate) fn info(&self) -> DeviceInfoMap {
        self.devices
            .iter()
            .map(|d| (d.path().to_path_buf(), d.info()))
            .collect()
    }

    /// Total capacity in clusters across all devices.
    pub(crate) fn total_size_in_entries(&self) -> u64 {
        self.devices
            .iter()
            .map(|d| d.total_size())
            .sum::<u64>()
            / self.cluster_size
    }

    /// Flushes every device; failures are logged, not propagated.
    pub(crate) fn sync(&self) {
        for d in &self.devices {
            if let Err(e) = d.sync() {
                warn!("failed to sync {}: {}", d.path().display(), e);
            }
        }
    }

    /// The devices in index order, for serialization.
    pub(crate) fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().map(|d| &**d)
    }

    /// Mutable access to the device named by `id`, for deserialization.
    pub(crate) fn get_mut_by_id(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.devices
            .iter_mut()
            .find(|d| &***d as DeviceId == id)
            .map(|d| &mut **d)
    }
}
