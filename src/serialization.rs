//! Versioned binary persistence of the cache index.
//!
//! Only the *index* is persisted — the cached data itself already lives on
//! the devices. The file is written once at clean shutdown and consumed
//! (deleted) at the next startup; it never exists while the cache runs, so
//! a crash simply means a cold cache.
//!
//! Layout: a 4-byte magic, a little-endian `u32` format version, then a
//! bincode-encoded [`SavedCache`]. Per-entry records are written in
//! `device_index / slot_offset / key / mode` order; that order is the wire
//! format for version 3 and must not change within the version.
//!
//! Loading re-opens each remembered device and only accepts it if it still
//! carries the manager GUID of the generation that wrote the file; devices
//! failing that check are skipped and their entries silently dropped. A
//! sample of one in [`TEST_FREQUENCY`] reloaded content-based entries is
//! re-digested against the on-disk data; a mismatch offlines the whole
//! device. Any decoding failure aborts the load — the caller clears all
//! state and starts cold.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ClusterCacheConfig;
use crate::device::Device;
use crate::engine::{entry_handle, Inner, Namespace};
use crate::entry::ClusterCacheEntry;
use crate::error::{Error, Result};
use crate::events::EventPublisher;
use crate::key::{ClusterCacheHandle, ClusterCacheKey, ClusterCacheMode};
use crate::list::EntryList;
use crate::manager::DeviceId;

const MAGIC: [u8; 4] = *b"CCIX";
const FORMAT_VERSION: u32 = 3;

/// One in this many reloaded entries gets its on-disk data re-digested
/// (content-based entries only; location keys carry nothing to check).
const TEST_FREQUENCY: u64 = 8192;

/// Progress logging cadence while shoveling entry records.
const LOGGING_INTERVAL: u64 = 1 << 19;

const CONTENT_BASED_BYTE: u8 = 1;
const LOCATION_BASED_BYTE: u8 = 2;

fn mode_to_byte(mode: ClusterCacheMode) -> u8 {
    match mode {
        ClusterCacheMode::ContentBased => CONTENT_BASED_BYTE,
        ClusterCacheMode::LocationBased => LOCATION_BASED_BYTE,
    }
}

fn mode_from_byte(byte: u8) -> Option<ClusterCacheMode> {
    match byte {
        CONTENT_BASED_BYTE => Some(ClusterCacheMode::ContentBased),
        LOCATION_BASED_BYTE => Some(ClusterCacheMode::LocationBased),
        _ => None,
    }
}

#[derive(Serialize, Deserialize)]
struct SavedDevice {
    path: PathBuf,
    total_size: u64,
    used_slots: u32,
}

#[derive(Serialize, Deserialize)]
struct SavedManager {
    full: bool,
    guid: Uuid,
    cluster_size: u64,
    devices: Vec<SavedDevice>,
}

#[derive(Serialize, Deserialize)]
struct SavedNamespace {
    handle: u64,
    max_entries: Option<u64>,
    spine_size_exp: u8,
}

/// Field order is the on-disk record order; fixed for format version 3.
#[derive(Serialize, Deserialize)]
struct SavedEntry {
    device_index: u32,
    slot_offset: u32,
    key: [u8; 16],
    mode: u8,
}

#[derive(Serialize, Deserialize)]
struct SavedCache {
    manager: SavedManager,
    namespaces: Vec<SavedNamespace>,
    entries: Vec<SavedEntry>,
    invalidated: Vec<SavedEntry>,
}

/// Appends the records for one list, front to back.
fn collect_list(inner: &Inner, list: &EntryList, what: &str, total: u64, out: &mut Vec<SavedEntry>) {
    // SAFETY: the caller has exclusive access to the engine (shutdown or
    // write lock); list membership and entry locations are stable.
    unsafe {
        list.for_each(|e| {
            let k = out.len() as u64;
            if k % LOGGING_INTERVAL == 0 && total > LOGGING_INTERVAL {
                info!(
                    "serializing metadata of {what}, still {} to go",
                    total.saturating_sub(k)
                );
            }
            match inner.manager.entry_location(e) {
                Some((device_index, slot_offset)) => out.push(SavedEntry {
                    device_index,
                    slot_offset,
                    key: *(*e).key.digest(),
                    mode: mode_to_byte((*e).mode()),
                }),
                None => error!("not serializing an entry without an online device"),
            }
        });
    }
}

/// Writes the whole index to `path`.
pub(crate) fn save(path: &Path, inner: &Inner) -> Result<()> {
    let devices = inner
        .manager
        .devices()
        .map(|d| SavedDevice {
            path: d.path().to_path_buf(),
            total_size: d.total_size(),
            used_slots: d.used_slots(),
        })
        .collect();

    let namespaces = inner
        .namespaces
        .iter()
        .map(|(h, ns)| SavedNamespace {
            handle: h.0,
            max_entries: ns.max_entries,
            spine_size_exp: ns.map.spine_size_exp(),
        })
        .collect();

    let total = inner.total_entries();
    let mut entries = Vec::with_capacity(total as usize);
    for ns in inner.namespaces.values() {
        collect_list(inner, &ns.lru, "entries", total, &mut entries);
    }
    collect_list(inner, &inner.lru, "entries", total, &mut entries);

    let mut invalidated = Vec::new();
    collect_list(
        inner,
        &inner.invalidated,
        "invalidated entries",
        inner.invalidated.len() as u64,
        &mut invalidated,
    );

    let saved = SavedCache {
        manager: SavedManager {
            full: inner.manager.is_full(),
            guid: inner.manager.guid(),
            cluster_size: inner.manager.cluster_size(),
            devices,
        },
        namespaces,
        entries,
        invalidated,
    };

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bincode::serialize_into(&mut bytes, &saved)
        .map_err(|e| Error::Deserialization(format!("cannot encode cache index: {e}")))?;

    let mut file = fs::File::create(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    file.write_all(&bytes).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    file.sync_all().map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;

    info!(
        "serialized {} entries and {} invalidated entries to {}",
        saved.entries.len(),
        saved.invalidated.len(),
        path.display()
    );
    Ok(())
}

/// Rebuilds `inner` from the index at `path`.
///
/// On error the caller must clear the engine and proceed with a cold
/// cache; partial state may have been populated.
pub(crate) fn load(
    path: &Path,
    inner: &mut Inner,
    config: &ClusterCacheConfig,
    publisher: &dyn EventPublisher,
) -> Result<()> {
    let bytes = fs::read(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;

    if bytes.len() < 8 || bytes[..4] != MAGIC {
        return Err(Error::Deserialization("not a cache index file".to_owned()));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != FORMAT_VERSION {
        return Err(Error::Deserialization(format!(
            "unsupported format version {version} (expected {FORMAT_VERSION})"
        )));
    }

    let saved: SavedCache = bincode::deserialize(&bytes[8..])
        .map_err(|e| Error::Deserialization(e.to_string()))?;

    if saved.manager.cluster_size != config.cluster_size {
        return Err(Error::Deserialization(format!(
            "cluster size changed from {} to {}",
            saved.manager.cluster_size, config.cluster_size
        )));
    }

    // Reinstate the devices of the previous generation. A device that can't
    // be reopened or carries a foreign GUID is skipped; entries referring to
    // it fall away silently below.
    let mut mapper: Vec<Option<DeviceId>> = Vec::with_capacity(saved.manager.devices.len());
    for sd in &saved.manager.devices {
        match Device::reinstate(&sd.path, sd.total_size, saved.manager.cluster_size, sd.used_slots)
        {
            Ok(dev) => {
                if dev.check_guid(&saved.manager.guid) {
                    info!("adding {} to the restarted cache", sd.path.display());
                    mapper.push(Some(inner.manager.push_reinstated(dev)));
                } else {
                    error!(
                        "not adding device {} because the guids don't match",
                        sd.path.display()
                    );
                    mapper.push(None);
                }
            }
            Err(e) => {
                error!(
                    "failed to reinstate read cache device {}: {e}",
                    sd.path.display()
                );
                mapper.push(None);
            }
        }
    }

    // Stamp a fresh generation immediately: a crash between here and the
    // next clean shutdown must not re-accept these devices under the old
    // GUID.
    inner.manager.refresh_guid();
    inner.manager.set_full(saved.manager.full);

    for sns in &saved.namespaces {
        let mut ns = Box::new(Namespace::new());
        ns.map.resize(sns.spine_size_exp);
        ns.max_entries = sns.max_entries;
        inner.namespaces.insert(ClusterCacheHandle(sns.handle), ns);
    }

    let total = saved.entries.len() as u64;
    let mut loaded = 0u64;
    for (i, se) in saved.entries.iter().enumerate() {
        if i as u64 % LOGGING_INTERVAL == 0 && total > LOGGING_INTERVAL {
            info!(
                "deserializing metadata of entries, still {} to go",
                total - i as u64
            );
        }

        let Some(entry) = claim_slot(inner, &mapper, se)? else {
            continue;
        };

        // SAFETY: claim_slot returned a live entry of a reinstated device;
        // the engine is exclusively ours during construction.
        unsafe {
            let device = mapper[se.device_index as usize].unwrap_or(std::ptr::null());
            if i as u64 % TEST_FREQUENCY == 0 {
                if let Err(e) = inner.manager.check_entry(device, entry) {
                    error!("verification failed on reload: {e} - offlining the device");
                    inner.offline_device(device, publisher, true);
                    continue;
                }
            }

            let handle = entry_handle(entry);
            let Some(ns) = inner.namespaces.get_mut(&handle) else {
                return Err(Error::Deserialization(format!(
                    "entry references unknown namespace {handle}"
                )));
            };
            ns.map.insert(entry);
            if let Some(limit) = ns.max_entries {
                if ns.map.entries() > limit {
                    return Err(Error::Deserialization(format!(
                        "{handle} holds more entries than its cap {limit}"
                    )));
                }
                ns.lru.push_back(entry);
            } else {
                inner.lru.push_back(entry);
            }
        }
        loaded += 1;
    }

    let mut invalidated = 0u64;
    for (i, se) in saved.invalidated.iter().enumerate() {
        if i as u64 % LOGGING_INTERVAL == 0 && saved.invalidated.len() as u64 > LOGGING_INTERVAL {
            info!(
                "deserializing metadata of invalidated entries, still {} to go",
                saved.invalidated.len() as u64 - i as u64
            );
        }
        let Some(entry) = claim_slot(inner, &mapper, se)? else {
            continue;
        };
        // SAFETY: as above; invalidated entries are linked but never mapped.
        unsafe {
            inner.invalidated.push_back(entry);
        }
        invalidated += 1;
    }

    info!(
        "reinstated {} devices, {loaded} entries, {invalidated} invalidated entries",
        inner.manager.device_count()
    );
    Ok(())
}

/// Resolves one saved record to its arena slot and re-keys the entry.
/// Returns `None` (skip) when the device is gone.
fn claim_slot(
    inner: &mut Inner,
    mapper: &[Option<DeviceId>],
    se: &SavedEntry,
) -> Result<Option<*mut ClusterCacheEntry>> {
    let Some(&Some(id)) = mapper.get(se.device_index as usize) else {
        return Ok(None);
    };
    // The device may have been offlined by an earlier verification failure.
    let Some(dev) = inner.manager.get_mut_by_id(id) else {
        return Ok(None);
    };
    let Some(entry) = dev.entry_at(se.slot_offset) else {
        warn!(
            "slot {} out of range on {}, skipping entry",
            se.slot_offset,
            dev.path().display()
        );
        return Ok(None);
    };
    let Some(mode) = mode_from_byte(se.mode) else {
        return Err(Error::Deserialization(format!(
            "unknown entry mode {}",
            se.mode
        )));
    };
    // SAFETY: entry points at a claimed slot of a live device arena.
    unsafe {
        *entry = ClusterCacheEntry::new(ClusterCacheKey::from_digest(se.key), mode);
    }
    Ok(Some(entry))
}
