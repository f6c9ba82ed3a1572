//! The cluster cache engine.
//!
//! [`ClusterCache`] orchestrates everything: volume registration, the
//! read/add/invalidate path, allocation policy, namespace size caps, device
//! lifecycle and persistence of the index across restarts.
//!
//! # Namespaces and eviction
//!
//! Entries are grouped into namespaces keyed by [`ClusterCacheHandle`]. The
//! singleton content-based namespace (handle 0) deduplicates clusters across
//! every volume that caches by content; each location-based volume gets its
//! own namespace whose handle equals the volume's owner tag.
//!
//! Uncapped namespaces share one global LRU. A namespace with a
//! `max_entries` cap keeps a private LRU instead and always evicts its own
//! tail, so a hot neighbour can never push a small tenant's working set out
//! of the cache. Allocation for an add walks, in order: an in-place
//! overwrite (location-based only), the namespace's own LRU when capped and
//! at its limit, the invalidated pool, a fresh device slot, and finally the
//! global LRU tail. When all of those come up empty the add is skipped —
//! the cache never fails a caller over a transient shortage.
//!
//! # Locking
//!
//! Two locks, acquired in this order when both are held:
//!
//! 1. the engine `RwLock`, writer for every mutation except one;
//! 2. a small list mutex that lets a *shared* holder of the engine lock
//!    re-head an entry in its LRU on a read hit — the one mutation on the
//!    hot path.
//!
//! Hit/miss counters are relaxed atomics and may drift relative to entry
//! counts.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::ClusterCacheConfig;
use crate::device::DeviceInfoMap;
use crate::entry::ClusterCacheEntry;
use crate::error::{Error, Result};
use crate::events::{ClusterCacheEvent, EventPublisher, LogPublisher};
use crate::key::{ClusterCacheHandle, ClusterCacheKey, ClusterCacheMode, OwnerTag, NULL_DIGEST};
use crate::list::EntryList;
use crate::manager::{DeviceId, DeviceManager};
use crate::map::ClusterCacheMap;
use crate::serialization;

/// A cache namespace: one map, one private LRU (only populated when
/// `max_entries` is set) and the cap itself.
pub(crate) struct Namespace {
    pub(crate) map: ClusterCacheMap,
    pub(crate) lru: EntryList,
    pub(crate) max_entries: Option<u64>,
}

impl Namespace {
    pub(crate) fn new() -> Self {
        Namespace {
            map: ClusterCacheMap::new(),
            lru: EntryList::new(),
            max_entries: None,
        }
    }
}

/// Point-in-time snapshot of one namespace, as returned by
/// [`ClusterCache::namespace_info`].
#[derive(Debug, Clone)]
pub struct NamespaceInfo {
    /// The namespace's handle.
    pub handle: ClusterCacheHandle,
    /// Number of entries currently cached in it.
    pub entries: u64,
    /// Its size cap, if any.
    pub max_entries: Option<u64>,
    /// Cache map chain-length histogram: `length -> bucket count`.
    pub bucket_lengths: BTreeMap<u64, u64>,
}

/// Everything guarded by the engine lock.
pub(crate) struct Inner {
    pub(crate) manager: DeviceManager,
    pub(crate) namespaces: BTreeMap<ClusterCacheHandle, Box<Namespace>>,
    /// Entries whose storage is recyclable; their keys mean nothing.
    pub(crate) invalidated: EntryList,
    /// LRU for all entries of uncapped namespaces.
    pub(crate) lru: EntryList,
    /// Target chain length for cache map sizing.
    average_entries_per_bin: u32,
}

/// The handle for an entry: content-based entries all live in namespace 0,
/// location-based entries carry their namespace in the key.
///
/// # Safety
///
/// `entry` must point to a live arena entry and the caller must hold the
/// engine lock.
pub(crate) unsafe fn entry_handle(entry: *const ClusterCacheEntry) -> ClusterCacheHandle {
    // SAFETY: entry is live per contract.
    unsafe {
        match (*entry).mode() {
            ClusterCacheMode::ContentBased => ClusterCacheHandle::CONTENT_BASED,
            ClusterCacheMode::LocationBased => (*entry).key.cluster_cache_handle(),
        }
    }
}

fn mode_for(handle: ClusterCacheHandle) -> ClusterCacheMode {
    if handle == ClusterCacheHandle::CONTENT_BASED {
        ClusterCacheMode::ContentBased
    } else {
        ClusterCacheMode::LocationBased
    }
}

impl Inner {
    pub(crate) fn new(cluster_size: u64, average_entries_per_bin: u32) -> Self {
        Inner {
            manager: DeviceManager::new(cluster_size),
            namespaces: BTreeMap::new(),
            invalidated: EntryList::new(),
            lru: EntryList::new(),
            average_entries_per_bin,
        }
    }

    pub(crate) fn namespace(&self, handle: ClusterCacheHandle) -> Option<&Namespace> {
        self.namespaces.get(&handle).map(|ns| &**ns)
    }

    fn namespace_ptr(&mut self, handle: ClusterCacheHandle) -> Option<*mut Namespace> {
        self.namespaces
            .get_mut(&handle)
            .map(|ns| &mut **ns as *mut Namespace)
    }

    pub(crate) fn maybe_create_namespace(&mut self, handle: ClusterCacheHandle) -> *mut Namespace {
        let total = self.manager.total_size_in_entries();
        let average = u64::from(self.average_entries_per_bin);
        let ns = self.namespaces.entry(handle).or_insert_with(|| {
            let mut ns = Box::new(Namespace::new());
            ns.map.resize(ClusterCacheMap::best_size(average, total));
            ns
        });
        &mut **ns as *mut Namespace
    }

    /// Recomputes the spine of every uncapped namespace's map against the
    /// current total capacity. Capped namespaces are sized by their cap and
    /// don't care about topology.
    fn resize_uncapped_maps(&mut self) {
        let total = self.manager.total_size_in_entries();
        let average = u64::from(self.average_entries_per_bin);
        for ns in self.namespaces.values_mut() {
            if ns.max_entries.is_none() {
                ns.map.resize(ClusterCacheMap::best_size(average, total));
            }
        }
    }

    /// Moves every entry of `handle`'s namespace to the invalidated pool and
    /// drops the namespace. Idempotent.
    fn deregister(&mut self, handle: ClusterCacheHandle) {
        if let Some(ns) = self.namespaces.get(&handle) {
            let invalidated = &self.invalidated;
            ns.map.for_each(|e| {
                // SAFETY: a mapped entry is linked into exactly one
                // LRU-style list; the engine write lock is held.
                unsafe {
                    EntryList::unlink(e);
                    invalidated.push_front(e);
                }
            });
            self.namespaces.remove(&handle);
        }
    }

    pub(crate) fn total_entries(&self) -> u64 {
        self.namespaces.values().map(|ns| ns.map.entries()).sum()
    }

    pub(crate) fn maybe_add_device(&mut self, path: &Path, size: u64) -> bool {
        if self.manager.find_by_path(path).is_some() {
            info!("not adding {} because it is already present", path.display());
            return false;
        }
        info!("adding {}", path.display());
        match self.manager.add_device(path, size) {
            Ok(true) => {
                self.resize_uncapped_maps();
                true
            }
            Ok(false) => false,
            Err(e) => {
                error!("failed to add device {}: {e}", path.display());
                false
            }
        }
    }

    /// Takes a device out of service: purges every entry backed by it from
    /// every list and map, then removes it from the manager.
    pub(crate) fn offline_device(
        &mut self,
        id: DeviceId,
        publisher: &dyn EventPublisher,
        announce: bool,
    ) {
        if !self.manager.contains(id) {
            info!("device already offlined");
            return;
        }

        if let Some(path) = self.manager.path_of(id) {
            info!("offlining device {}", path.display());
            if announce {
                publisher.publish(ClusterCacheEvent::MountPointOfflined { path });
            }
        }

        let manager = &self.manager;
        let namespaces = &mut self.namespaces;

        // SAFETY (all three walks): the engine write lock is held; entries
        // unlinked by `retain` are exactly those whose arena is about to be
        // dropped with the device, and they are removed from their maps in
        // the same step.
        unsafe {
            self.lru.retain(|e| {
                if manager.device_of(e) == Some(id) {
                    let handle = entry_handle(e);
                    if let Some(ns) = namespaces.get_mut(&handle) {
                        ns.map.remove(&(*e).key);
                    }
                    false
                } else {
                    true
                }
            });

            // Invalidated entries are unmapped by definition; dropping the
            // links is enough.
            self.invalidated.retain(|e| manager.device_of(e) != Some(id));

            for ns in namespaces.values_mut() {
                let map = &mut ns.map;
                ns.lru.retain(|e| {
                    if manager.device_of(e) == Some(id) {
                        map.remove(&(*e).key);
                        false
                    } else {
                        true
                    }
                });
            }
        }

        self.manager.remove_device(id);
        self.resize_uncapped_maps();
    }

    pub(crate) fn clear(&mut self) {
        self.manager.clear();
        self.namespaces.clear();
        self.lru.clear();
        self.invalidated.clear();
    }
}

/// A persistent, multi-device read cache for fixed-size clusters.
///
/// Construction opens (or reinstates) the configured devices and reloads
/// the persisted index if serialization is enabled; dropping the cache
/// persists the index again. All operations take `&self` and are safe to
/// call from any number of threads.
pub struct ClusterCache {
    inner: RwLock<Inner>,
    /// Serializes LRU pointer updates on the read hot path; only ever taken
    /// while the engine lock is held.
    list_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    config: RwLock<ClusterCacheConfig>,
    publisher: Arc<dyn EventPublisher>,
}

impl ClusterCache {
    /// Creates a cache from `config`, publishing events to the log.
    pub fn new(config: ClusterCacheConfig) -> Result<Self> {
        Self::with_publisher(config, Arc::new(LogPublisher))
    }

    /// Creates a cache from `config` with a custom event publisher.
    pub fn with_publisher(
        config: ClusterCacheConfig,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        config.validate()?;

        let mut inner = Inner::new(config.cluster_size, config.average_entries_per_bin);

        let file = config.serialization_file();
        if config.serialize_read_cache {
            if file.exists() {
                if let Err(e) = serialization::load(&file, &mut inner, &config, &*publisher) {
                    error!("problem reinstating the cache: {e} - starting from clean slate");
                    inner.clear();
                }
                // The file is consumed either way; a crash must not replay it.
                if let Err(e) = fs::remove_file(&file) {
                    warn!("could not remove {}: {e}", file.display());
                }
            } else {
                warn!("no file found for cache deserialization");
            }
        } else if file.exists() {
            info!("removing cache serialization from a previous run");
            let _ = fs::remove_file(&file);
        }

        let mut added = 0;
        let mut skipped = 0;
        for mp in &config.clustercache_mount_points {
            if inner.maybe_add_device(&mp.path, mp.size) {
                added += 1;
            } else {
                skipped += 1;
            }
        }
        info!("added {added} devices, skipped {skipped}");

        inner.maybe_create_namespace(ClusterCacheHandle::CONTENT_BASED);

        Ok(ClusterCache {
            inner: RwLock::new(inner),
            list_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            config: RwLock::new(config),
            publisher,
        })
    }

    /// Registers a volume and returns the namespace handle to use for it.
    ///
    /// Content-based volumes all share handle 0; a location-based volume's
    /// handle is its owner tag. Re-registering an owner as content-based
    /// tears down its location-based namespace first (the owner is switching
    /// modes). Idempotent per `(owner, mode)`.
    pub fn register_volume(
        &self,
        owner: OwnerTag,
        mode: ClusterCacheMode,
    ) -> Result<ClusterCacheHandle> {
        if owner == OwnerTag(0) {
            return Err(Error::InvalidOperation("owner tag 0 is reserved".to_owned()));
        }

        let handle = match mode {
            ClusterCacheMode::LocationBased => ClusterCacheHandle(owner.0),
            ClusterCacheMode::ContentBased => ClusterCacheHandle::CONTENT_BASED,
        };

        let mut guard = self.inner.write();
        if mode == ClusterCacheMode::ContentBased {
            guard.deregister(ClusterCacheHandle(owner.0));
        }
        guard.maybe_create_namespace(handle);
        Ok(handle)
    }

    /// Drops the owner's location-based namespace, recycling its entries.
    /// Idempotent; a no-op for owners that only ever cached by content.
    pub fn deregister_volume(&self, owner: OwnerTag) -> Result<()> {
        if owner == OwnerTag(0) {
            return Err(Error::InvalidOperation("owner tag 0 is reserved".to_owned()));
        }
        self.inner.write().deregister(ClusterCacheHandle(owner.0));
        Ok(())
    }

    /// Combined-key read: picks the key representation from the handle.
    ///
    /// For the content-based handle a null digest cannot hit and is not
    /// counted as a miss. Returns whether `buf` was filled from the cache.
    ///
    /// `buf` must hold at least one cluster.
    pub fn read(
        &self,
        handle: ClusterCacheHandle,
        cluster_address: u64,
        digest: &[u8; 16],
        buf: &mut [u8],
    ) -> Result<bool> {
        if handle != ClusterCacheHandle::CONTENT_BASED {
            self.read_key(
                handle,
                &ClusterCacheKey::from_location(handle, cluster_address),
                buf,
            )
        } else if *digest != NULL_DIGEST {
            self.read_key(handle, &ClusterCacheKey::from_digest(*digest), buf)
        } else {
            Ok(false)
        }
    }

    /// Reads the cluster cached under `key` into `buf`, if present.
    ///
    /// A device I/O failure offlines the device and reports a miss; it is
    /// never surfaced to the caller. `buf` must hold at least one cluster.
    pub fn read_key(
        &self,
        handle: ClusterCacheHandle,
        key: &ClusterCacheKey,
        buf: &mut [u8],
    ) -> Result<bool> {
        let failed_device: DeviceId;
        {
            let inner = self.inner.read();
            let nspace = inner
                .namespace(handle)
                .ok_or(Error::InvalidHandle(handle))?;

            let Some(entry) = nspace.map.find(key) else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(false);
            };

            let Some(device) = inner.manager.device_of(entry) else {
                error!("{handle}: cached entry without an online device, reporting a miss");
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(false);
            };

            match inner.manager.read_entry(device, buf, entry) {
                Ok(()) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);

                    let lru = if nspace.max_entries.is_some() {
                        &nspace.lru
                    } else {
                        &inner.lru
                    };
                    let _list_guard = self.list_lock.lock();
                    // SAFETY: a mapped entry is linked into exactly one
                    // LRU-style list; the list lock serializes these pointer
                    // updates among shared holders of the engine lock.
                    unsafe {
                        EntryList::unlink(entry);
                        lru.push_front(entry);
                    }
                    return Ok(true);
                }
                Err(e) => {
                    let path = inner.manager.path_of(device);
                    error!(
                        "couldn't read from {:?}: {e} - offlining it",
                        path.as_deref().unwrap_or(Path::new("?"))
                    );
                    failed_device = device;
                }
            }
        }

        // Reacquire as writer to take the broken device out of service.
        let mut guard = self.inner.write();
        guard.offline_device(failed_device, &*self.publisher, true);
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(false)
    }

    /// Combined-key add; see [`read`](Self::read) for the key selection.
    /// A null digest on the content-based handle makes this a no-op.
    pub fn add(
        &self,
        handle: ClusterCacheHandle,
        cluster_address: u64,
        digest: &[u8; 16],
        buf: &[u8],
    ) -> Result<()> {
        if handle != ClusterCacheHandle::CONTENT_BASED {
            self.add_key(
                handle,
                &ClusterCacheKey::from_location(handle, cluster_address),
                buf,
            )
        } else if *digest != NULL_DIGEST {
            self.add_key(handle, &ClusterCacheKey::from_digest(*digest), buf)
        } else {
            Ok(())
        }
    }

    /// Caches one cluster under `key`.
    ///
    /// Adding an existing content-based key is a no-op (such entries are
    /// immutable); an existing location-based key is overwritten in place.
    /// When no storage can be found the add is silently skipped. `buf` must
    /// hold at least one cluster.
    pub fn add_key(
        &self,
        handle: ClusterCacheHandle,
        key: &ClusterCacheKey,
        buf: &[u8],
    ) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        // The write lock already excludes readers; taking the list lock too
        // keeps the documented lock order load-bearing rather than implied.
        let _list_guard = self.list_lock.lock();

        let Some(nspace) = inner.namespace_ptr(handle) else {
            return Err(Error::InvalidHandle(handle));
        };

        // SAFETY for this whole section: the engine write lock is held, so
        // nothing else touches entries, lists or maps. `nspace` stays valid
        // because namespaces are boxed and none is removed below.
        unsafe {
            let mut reinit = true;
            let mut device: Option<DeviceId> = None;

            let mut entry = (*nspace).map.find(key);
            if let Some(e) = entry {
                if handle == ClusterCacheHandle::CONTENT_BASED {
                    return Ok(());
                }
                // Location-based entries take a buffer update in place.
                reinit = false;
                EntryList::unlink(e);
            }

            if entry.is_none() {
                if let Some(limit) = (*nspace).max_entries {
                    if (*nspace).map.entries() == limit {
                        if limit == 0 {
                            debug!("namespace {handle} is misconfigured with size 0, not caching anything");
                            return Ok(());
                        }
                        // The namespace is at its cap: recycle from its own
                        // LRU, never from the shared pool.
                        if let Some(victim) = (*nspace).lru.pop_back() {
                            let removed = (*nspace).map.remove(&(*victim).key);
                            debug_assert!(removed);
                            entry = Some(victim);
                        }
                    }
                }
            }

            if entry.is_none() {
                entry = inner.invalidated.pop_back();
            }

            if entry.is_none() {
                if let Some((id, e)) = inner.manager.allocate_slot(key) {
                    device = Some(id);
                    entry = Some(e);
                }
            }

            if entry.is_none() {
                if let Some(victim) = inner.lru.pop_back() {
                    let old_handle = entry_handle(victim);
                    if let Some(old_ns) = inner.namespace_ptr(old_handle) {
                        let removed = (*old_ns).map.remove(&(*victim).key);
                        debug_assert!(removed);
                    }
                    entry = Some(victim);
                }
            }

            let Some(entry) = entry else {
                warn!(
                    "failed to allocate an entry for {handle} - are all devices \
                     gone or all entries consumed by other namespaces?"
                );
                return Ok(());
            };

            let Some(device) = device.or_else(|| inner.manager.device_of(entry)) else {
                error!("{handle}: no online device owns the allocated entry, not caching");
                return Ok(());
            };

            if reinit {
                *entry = ClusterCacheEntry::new(*key, mode_for(handle));
                (*nspace).map.insert(entry);
            }

            if (*nspace).max_entries.is_some() {
                (*nspace).lru.push_front(entry);
            } else {
                inner.lru.push_front(entry);
            }

            if let Err(e) = inner.manager.write_entry(device, buf, entry) {
                let path = inner.manager.path_of(device);
                error!(
                    "couldn't write to {:?}: {e} - offlining it",
                    path.as_deref().unwrap_or(Path::new("?"))
                );
                inner.offline_device(device, &*self.publisher, true);
            }
        }

        Ok(())
    }

    /// Combined-key invalidate. For the content-based handle this is a
    /// no-op even when a digest is supplied: content-addressed entries
    /// cannot be invalidated by location.
    pub fn invalidate(
        &self,
        handle: ClusterCacheHandle,
        cluster_address: u64,
        digest: &[u8; 16],
    ) -> Result<()> {
        let key = if handle != ClusterCacheHandle::CONTENT_BASED {
            ClusterCacheKey::from_location(handle, cluster_address)
        } else {
            ClusterCacheKey::from_digest(*digest)
        };
        self.invalidate_key(handle, &key)
    }

    /// Invalidates a location-based cluster by address.
    pub fn invalidate_location(
        &self,
        handle: ClusterCacheHandle,
        cluster_address: u64,
    ) -> Result<()> {
        if handle == ClusterCacheHandle::CONTENT_BASED {
            return Err(Error::InvalidOperation(
                "cannot invalidate content-based entries by location".to_owned(),
            ));
        }
        self.invalidate_key(handle, &ClusterCacheKey::from_location(handle, cluster_address))
    }

    /// Drops `key` from `handle`'s namespace, recycling the entry's storage.
    /// A no-op for the content-based handle and for absent keys.
    pub fn invalidate_key(&self, handle: ClusterCacheHandle, key: &ClusterCacheKey) -> Result<()> {
        if handle == ClusterCacheHandle::CONTENT_BASED {
            return Ok(());
        }

        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let Some(nspace) = inner.namespace_ptr(handle) else {
            return Err(Error::InvalidHandle(handle));
        };

        // SAFETY: engine write lock held; see add_key.
        unsafe {
            if let Some(entry) = (*nspace).map.find(key) {
                let removed = (*nspace).map.remove(&(*entry).key);
                debug_assert!(removed);
                EntryList::unlink(entry);
                inner.invalidated.push_back(entry);
            }
        }
        Ok(())
    }

    /// Changes (or removes) a namespace's entry cap.
    ///
    /// Shrinking below the current population invalidates the tail surplus.
    /// Removing the cap hands the entries to the global LRU. Imposing a cap
    /// on a previously uncapped namespace has to collect its entries from
    /// the global LRU by walking the map, which loses their relative LRU
    /// order — expect a warning log. `Some(0)` is rejected; use the
    /// volume-level cache behaviour to turn caching off entirely.
    pub fn set_max_entries(
        &self,
        handle: ClusterCacheHandle,
        limit: Option<u64>,
    ) -> Result<()> {
        if limit == Some(0) {
            error!("{handle}: max entries must be > 0");
            return Err(Error::InvalidConfig("max entries must be > 0".to_owned()));
        }

        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let Some(nspace) = inner.namespace_ptr(handle) else {
            return Err(Error::InvalidHandle(handle));
        };

        // SAFETY: engine write lock held; see add_key. The temporary list
        // only ever holds entries unlinked in the same breath.
        unsafe {
            info!(
                "{handle}: changing max entries from {:?} to {limit:?}",
                (*nspace).max_entries
            );

            match ((*nspace).max_entries, limit) {
                (Some(_), Some(new)) => {
                    let surplus = (*nspace).map.entries().saturating_sub(new);
                    for _ in 0..surplus {
                        let Some(e) = (*nspace).lru.pop_back() else { break };
                        let removed = (*nspace).map.remove(&(*e).key);
                        debug_assert!(removed);
                        inner.invalidated.push_front(e);
                    }
                }
                (Some(_), None) => {
                    // Demote to the global pool, preserving LRU order.
                    while let Some(e) = (*nspace).lru.pop_front() {
                        inner.lru.push_back(e);
                    }
                }
                (None, Some(new)) => {
                    let entries = (*nspace).map.entries();
                    let mut surplus = entries.saturating_sub(new) as i64;
                    if entries > 0 {
                        warn!(
                            "{handle}: imposing a max entries limit of {new} on a previously \
                             unlimited namespace holding {entries} entries - this is expensive \
                             and loses LRU ordering"
                        );
                    }

                    // Each entry sits on the global LRU right now and moves
                    // to exactly one of the two lists.
                    let to_invalidate = EntryList::new();
                    (*nspace).map.for_each(|e| {
                        EntryList::unlink(e);
                        if surplus > 0 {
                            to_invalidate.push_front(e);
                            surplus -= 1;
                        } else {
                            (*nspace).lru.push_front(e);
                        }
                    });

                    while let Some(e) = to_invalidate.pop_front() {
                        let removed = (*nspace).map.remove(&(*e).key);
                        debug_assert!(removed);
                        inner.invalidated.push_front(e);
                    }
                }
                (None, None) => {}
            }

            let capacity = limit.unwrap_or_else(|| inner.manager.total_size_in_entries());
            let average = u64::from(inner.average_entries_per_bin);
            (*nspace)
                .map
                .resize(ClusterCacheMap::best_size(average, capacity));
            (*nspace).max_entries = limit;
        }

        Ok(())
    }

    /// The namespace's current entry cap.
    pub fn get_max_entries(&self, handle: ClusterCacheHandle) -> Result<Option<u64>> {
        let inner = self.inner.read();
        inner
            .namespace(handle)
            .map(|ns| ns.max_entries)
            .ok_or(Error::InvalidHandle(handle))
    }

    /// Snapshot of one namespace.
    pub fn namespace_info(&self, handle: ClusterCacheHandle) -> Result<NamespaceInfo> {
        let inner = self.inner.read();
        let ns = inner
            .namespace(handle)
            .ok_or(Error::InvalidHandle(handle))?;
        Ok(NamespaceInfo {
            handle,
            entries: ns.map.entries(),
            max_entries: ns.max_entries,
            bucket_lengths: ns.map.stats().clone(),
        })
    }

    /// All live namespace handles.
    pub fn list_namespaces(&self) -> Vec<ClusterCacheHandle> {
        self.inner.read().namespaces.keys().copied().collect()
    }

    /// Drops a namespace outright. The content-based namespace cannot be
    /// removed.
    pub fn remove_namespace(&self, handle: ClusterCacheHandle) -> Result<()> {
        if handle == ClusterCacheHandle::CONTENT_BASED {
            error!("cannot remove the namespace for content-based entries");
            return Err(Error::InvalidOperation(
                "cannot remove the namespace for content-based entries".to_owned(),
            ));
        }
        self.inner.write().deregister(handle);
        Ok(())
    }

    /// Adds a backing device. Returns whether it was actually added (a
    /// device already in the set, under any name, is refused).
    pub fn add_device(&self, path: &Path, size: u64) -> bool {
        self.inner.write().maybe_add_device(path, size)
    }

    /// Brings a configured mount point (back) online.
    pub fn online_device(&self, path: &Path) -> Result<bool> {
        let mp = self
            .config
            .read()
            .mount_point_for(path)
            .cloned()
            .ok_or_else(|| Error::MountPointNotConfigured(path.to_path_buf()))?;
        Ok(self.inner.write().maybe_add_device(&mp.path, mp.size))
    }

    /// Takes a configured mount point out of service, purging its entries.
    pub fn offline_device(&self, path: &Path) -> Result<()> {
        self.config
            .read()
            .mount_point_for(path)
            .ok_or_else(|| Error::MountPointNotConfigured(path.to_path_buf()))?;

        let mut guard = self.inner.write();
        if let Some(id) = guard.manager.find_by_path(path) {
            guard.offline_device(id, &*self.publisher, true);
        }
        Ok(())
    }

    /// Per-device usage, keyed by path.
    pub fn device_info(&self) -> DeviceInfoMap {
        self.inner.read().manager.info()
    }

    /// Total capacity in clusters across all online devices.
    pub fn total_size_in_entries(&self) -> u64 {
        self.inner.read().manager.total_size_in_entries()
    }

    /// `(hits, misses, cached entries)`.
    pub fn get_stats(&self) -> (u64, u64, u64) {
        let inner = self.inner.read();
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            inner.total_entries(),
        )
    }

    /// Validates a replacement configuration against the live one; returns
    /// the list of problems when it is not acceptable.
    pub fn check_config(&self, new: &ClusterCacheConfig) -> std::result::Result<(), Vec<String>> {
        self.config.read().check(new)
    }

    /// Applies a replacement configuration: opens any newly configured
    /// mount points and adopts the new settings. Run
    /// [`check_config`](Self::check_config) first; this method does not
    /// re-verify the keep-devices-unchanged rule.
    pub fn update_config(&self, new: ClusterCacheConfig) -> Result<()> {
        new.validate()?;
        {
            let mut inner = self.inner.write();
            inner.average_entries_per_bin = new.average_entries_per_bin;
            for mp in &new.clustercache_mount_points {
                inner.maybe_add_device(&mp.path, mp.size);
            }
        }
        *self.config.write() = new;
        Ok(())
    }
}

impl Drop for ClusterCache {
    fn drop(&mut self) {
        let config = self.config.get_mut();
        if !config.serialize_read_cache {
            return;
        }
        let file = config.serialization_file();
        let inner = self.inner.get_mut();
        inner.manager.sync();
        let _ = fs::remove_file(&file);
        if let Err(e) = serialization::save(&file, inner) {
            error!("could not serialize the cache state: {e}");
            // Don't leave half an index behind.
            let _ = fs::remove_file(&file);
        }
    }
}

impl std::fmt::Debug for ClusterCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ClusterCache")
            .field("devices", &inner.manager.device_count())
            .field("namespaces", &inner.namespaces.len())
            .field("entries", &inner.total_entries())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountPointConfig;
    use tempfile::TempDir;

    const CLUSTER: u64 = 4096;

    fn cache_with_device(dir: &TempDir, slots: u64) -> ClusterCache {
        let config = ClusterCacheConfig {
            clustercache_mount_points: vec![MountPointConfig::new(
                dir.path().join("dev0"),
                (slots + 1) * CLUSTER,
            )],
            ..Default::default()
        };
        ClusterCache::new(config).unwrap()
    }

    #[test]
    fn test_content_based_namespace_always_present() {
        let dir = TempDir::new().unwrap();
        let cache = cache_with_device(&dir, 4);
        assert_eq!(
            cache.list_namespaces(),
            vec![ClusterCacheHandle::CONTENT_BASED]
        );
        assert!(cache
            .remove_namespace(ClusterCacheHandle::CONTENT_BASED)
            .is_err());
    }

    #[test]
    fn test_register_volume_handles() {
        let dir = TempDir::new().unwrap();
        let cache = cache_with_device(&dir, 4);

        let h = cache
            .register_volume(OwnerTag(7), ClusterCacheMode::LocationBased)
            .unwrap();
        assert_eq!(h, ClusterCacheHandle(7));

        let h2 = cache
            .register_volume(OwnerTag(8), ClusterCacheMode::ContentBased)
            .unwrap();
        assert_eq!(h2, ClusterCacheHandle::CONTENT_BASED);

        assert!(cache
            .register_volume(OwnerTag(0), ClusterCacheMode::LocationBased)
            .is_err());
    }

    #[test]
    fn test_unknown_handle_is_an_error() {
        let dir = TempDir::new().unwrap();
        let cache = cache_with_device(&dir, 4);
        let mut buf = vec![0u8; CLUSTER as usize];
        let key = ClusterCacheKey::from_location(ClusterCacheHandle(99), 0);
        assert!(matches!(
            cache.read_key(ClusterCacheHandle(99), &key, &mut buf),
            Err(Error::InvalidHandle(_))
        ));
        assert!(cache.get_max_entries(ClusterCacheHandle(99)).is_err());
    }

    #[test]
    fn test_unconfigured_mount_point_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cache = cache_with_device(&dir, 4);
        let stray = dir.path().join("not-configured");
        assert!(matches!(
            cache.offline_device(&stray),
            Err(Error::MountPointNotConfigured(_))
        ));
        assert!(cache.online_device(&stray).is_err());
    }

    #[test]
    fn test_null_digest_read_is_uncounted_miss() {
        let dir = TempDir::new().unwrap();
        let cache = cache_with_device(&dir, 4);
        let mut buf = vec![0u8; CLUSTER as usize];
        assert!(!cache
            .read(ClusterCacheHandle::CONTENT_BASED, 0, &NULL_DIGEST, &mut buf)
            .unwrap());
        let (hits, misses, _) = cache.get_stats();
        assert_eq!((hits, misses), (0, 0));
    }

    #[test]
    fn test_null_digest_add_is_noop() {
        let dir = TempDir::new().unwrap();
        let cache = cache_with_device(&dir, 4);
        let buf = vec![1u8; CLUSTER as usize];
        cache
            .add(ClusterCacheHandle::CONTENT_BASED, 0, &NULL_DIGEST, &buf)
            .unwrap();
        assert_eq!(cache.get_stats().2, 0);
    }

    #[test]
    fn test_set_max_entries_rejects_zero() {
        let dir = TempDir::new().unwrap();
        let cache = cache_with_device(&dir, 4);
        let h = cache
            .register_volume(OwnerTag(1), ClusterCacheMode::LocationBased)
            .unwrap();
        assert!(matches!(
            cache.set_max_entries(h, Some(0)),
            Err(Error::InvalidConfig(_))
        ));
    }
}
