//! End-to-end tests of the cache engine against real backing files.
//!
//! Small fixtures (a handful of 4 KiB slots) keep eviction behavior
//! predictable; each test asserts exactly which keys survive.

use std::sync::{Arc, Mutex};

use clustercache::{
    ClusterCache, ClusterCacheConfig, ClusterCacheEvent, ClusterCacheHandle, ClusterCacheMode,
    Error, EventPublisher, MountPointConfig, OwnerTag, NULL_DIGEST,
};
use tempfile::TempDir;

const CLUSTER: u64 = 4096;
const CONTENT: ClusterCacheHandle = ClusterCacheHandle::CONTENT_BASED;

/// Collects published events for assertions.
#[derive(Default)]
struct Collector(Mutex<Vec<ClusterCacheEvent>>);

impl EventPublisher for Collector {
    fn publish(&self, event: ClusterCacheEvent) {
        self.0.lock().unwrap().push(event);
    }
}

fn config(dir: &TempDir, devices: &[(&str, u64)]) -> ClusterCacheConfig {
    ClusterCacheConfig {
        read_cache_serialization_path: dir.path().to_path_buf(),
        clustercache_mount_points: devices
            .iter()
            .map(|(name, slots)| MountPointConfig::new(dir.path().join(name), (slots + 1) * CLUSTER))
            .collect(),
        ..Default::default()
    }
}

fn cache(dir: &TempDir, devices: &[(&str, u64)]) -> ClusterCache {
    ClusterCache::new(config(dir, devices)).unwrap()
}

fn cluster(fill: u8) -> Vec<u8> {
    vec![fill; CLUSTER as usize]
}

/// Location-based add of `fill` at `addr`.
fn put(cache: &ClusterCache, h: ClusterCacheHandle, addr: u64, fill: u8) {
    cache.add(h, addr, &NULL_DIGEST, &cluster(fill)).unwrap();
}

/// Location-based read; returns the fill byte on a hit.
fn get(cache: &ClusterCache, h: ClusterCacheHandle, addr: u64) -> Option<u8> {
    let mut buf = cluster(0);
    match cache.read(h, addr, &NULL_DIGEST, &mut buf).unwrap() {
        true => Some(buf[0]),
        false => None,
    }
}

#[test]
fn test_location_based_basic_hit() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, &[("dev0", 4)]);

    let h = cache
        .register_volume(OwnerTag(1), ClusterCacheMode::LocationBased)
        .unwrap();
    assert_eq!(h, ClusterCacheHandle(1));

    put(&cache, h, 0, 0xaa);
    let mut out = cluster(0);
    assert!(cache.read(h, 0, &NULL_DIGEST, &mut out).unwrap());
    assert_eq!(out, cluster(0xaa));

    assert_eq!(cache.get_stats(), (1, 0, 1));
}

#[test]
fn test_lru_eviction_within_capped_namespace() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, &[("dev0", 4)]);

    let h = cache
        .register_volume(OwnerTag(1), ClusterCacheMode::LocationBased)
        .unwrap();
    cache.set_max_entries(h, Some(2)).unwrap();

    put(&cache, h, 0, 0x0a);
    put(&cache, h, 1, 0x0b);
    put(&cache, h, 2, 0x0c);

    assert_eq!(get(&cache, h, 0), None, "oldest entry must be evicted");
    assert_eq!(get(&cache, h, 1), Some(0x0b));
    assert_eq!(get(&cache, h, 2), Some(0x0c));
}

#[test]
fn test_content_based_dedup_across_owners() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, &[("dev0", 4)]);

    let h1 = cache
        .register_volume(OwnerTag(1), ClusterCacheMode::ContentBased)
        .unwrap();
    let h2 = cache
        .register_volume(OwnerTag(2), ClusterCacheMode::ContentBased)
        .unwrap();
    assert_eq!(h1, CONTENT);
    assert_eq!(h2, CONTENT);

    let data = cluster(0x42);
    let digest = *md5::compute(&data);
    cache.add(CONTENT, 0, &digest, &data).unwrap();

    // Both "owners" read through the same namespace and the same entry.
    let mut out = cluster(0);
    assert!(cache.read(CONTENT, 0, &digest, &mut out).unwrap());
    assert_eq!(out, data);
    assert_eq!(cache.get_stats().2, 1);
}

#[test]
fn test_cross_mode_rebind_destroys_location_namespace() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, &[("dev0", 4)]);

    let h1 = cache
        .register_volume(OwnerTag(1), ClusterCacheMode::LocationBased)
        .unwrap();
    put(&cache, h1, 42, 0x77);
    assert_eq!(cache.get_stats().2, 1);

    // The owner switches to content-based caching: its location namespace
    // goes away and the entry is recycled.
    let h = cache
        .register_volume(OwnerTag(1), ClusterCacheMode::ContentBased)
        .unwrap();
    assert_eq!(h, CONTENT);
    assert_eq!(cache.get_stats().2, 0);

    let mut out = cluster(0);
    assert!(matches!(
        cache.read(h1, 42, &NULL_DIGEST, &mut out),
        Err(Error::InvalidHandle(_))
    ));
}

#[test]
fn test_device_offline_preserves_correctness() {
    let dir = TempDir::new().unwrap();
    let publisher = Arc::new(Collector::default());
    let cache = ClusterCache::with_publisher(
        config(&dir, &[("dev_a", 4), ("dev_b", 4)]),
        Arc::clone(&publisher) as Arc<dyn EventPublisher>,
    )
    .unwrap();

    let h = cache
        .register_volume(OwnerTag(1), ClusterCacheMode::LocationBased)
        .unwrap();
    for addr in 0..8 {
        put(&cache, h, addr, addr as u8 + 1);
    }
    assert_eq!(cache.get_stats().2, 8);
    assert_eq!(cache.device_info().len(), 2);

    // Break device A underneath the cache: its fd stays open but every slot
    // read now comes back short.
    std::fs::OpenOptions::new()
        .write(true)
        .open(dir.path().join("dev_a"))
        .unwrap()
        .set_len(CLUSTER)
        .unwrap();

    let survivors: Vec<u64> = (0..8).filter(|&addr| get(&cache, h, addr).is_some()).collect();
    assert_eq!(survivors.len(), 4, "entries on the intact device must survive");
    for &addr in &survivors {
        assert_eq!(get(&cache, h, addr), Some(addr as u8 + 1));
    }

    let info = cache.device_info();
    assert_eq!(info.len(), 1);
    assert!(!info.contains_key(&dir.path().join("dev_a")));

    let events = publisher.0.lock().unwrap();
    assert_eq!(
        *events,
        vec![ClusterCacheEvent::MountPointOfflined {
            path: dir.path().join("dev_a")
        }]
    );
}

#[test]
fn test_invalidation_law() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, &[("dev0", 4)]);
    let h = cache
        .register_volume(OwnerTag(1), ClusterCacheMode::LocationBased)
        .unwrap();

    put(&cache, h, 5, 0x55);
    assert_eq!(get(&cache, h, 5), Some(0x55));

    cache.invalidate_location(h, 5).unwrap();
    assert_eq!(get(&cache, h, 5), None);
    assert_eq!(cache.get_stats().2, 0);

    // Invalidating something that isn't cached is fine.
    cache.invalidate_location(h, 5).unwrap();
}

#[test]
fn test_invalidated_entries_are_recycled() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, &[("dev0", 2)]);
    let h = cache
        .register_volume(OwnerTag(1), ClusterCacheMode::LocationBased)
        .unwrap();

    put(&cache, h, 0, 1);
    put(&cache, h, 1, 2);
    let used_before = cache.device_info().values().next().unwrap().used_size;

    cache.invalidate_location(h, 0).unwrap();
    put(&cache, h, 2, 3);

    // The new entry reuses the invalidated slot instead of claiming a fresh one.
    let used_after = cache.device_info().values().next().unwrap().used_size;
    assert_eq!(used_before, used_after);
    assert_eq!(get(&cache, h, 2), Some(3));
}

#[test]
fn test_content_based_entries_are_immutable() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, &[("dev0", 4)]);
    cache
        .register_volume(OwnerTag(1), ClusterCacheMode::ContentBased)
        .unwrap();

    let v1 = cluster(0x11);
    let digest = *md5::compute(&v1);
    cache.add(CONTENT, 0, &digest, &v1).unwrap();
    // A second add under the same digest must not overwrite the first.
    cache.add(CONTENT, 0, &digest, &cluster(0x22)).unwrap();

    let mut out = cluster(0);
    assert!(cache.read(CONTENT, 0, &digest, &mut out).unwrap());
    assert_eq!(out, v1);
    assert_eq!(cache.get_stats().2, 1);
}

#[test]
fn test_location_based_entries_are_mutable() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, &[("dev0", 4)]);
    let h = cache
        .register_volume(OwnerTag(1), ClusterCacheMode::LocationBased)
        .unwrap();

    put(&cache, h, 9, 0x11);
    put(&cache, h, 9, 0x22);

    assert_eq!(get(&cache, h, 9), Some(0x22));
    assert_eq!(cache.get_stats().2, 1, "overwrite must not grow the cache");
}

#[test]
fn test_registration_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, &[("dev0", 4)]);

    let h1 = cache
        .register_volume(OwnerTag(3), ClusterCacheMode::LocationBased)
        .unwrap();
    put(&cache, h1, 0, 1);
    let h2 = cache
        .register_volume(OwnerTag(3), ClusterCacheMode::LocationBased)
        .unwrap();
    assert_eq!(h1, h2);
    assert_eq!(cache.get_stats().2, 1, "re-registration must not clear entries");

    cache.deregister_volume(OwnerTag(3)).unwrap();
    cache.deregister_volume(OwnerTag(3)).unwrap();
    assert_eq!(cache.get_stats().2, 0);
}

#[test]
fn test_single_slot_namespace_cycles() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, &[("dev0", 4)]);
    let h = cache
        .register_volume(OwnerTag(1), ClusterCacheMode::LocationBased)
        .unwrap();
    cache.set_max_entries(h, Some(1)).unwrap();

    for addr in 0..5 {
        put(&cache, h, addr, addr as u8 + 1);
        assert_eq!(get(&cache, h, addr), Some(addr as u8 + 1));
    }
    // Only the most recent address survives.
    assert_eq!(cache.namespace_info(h).unwrap().entries, 1);
    assert_eq!(get(&cache, h, 3), None);
}

#[test]
fn test_capped_namespace_evicts_its_own_tail_only() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, &[("dev0", 8)]);

    let capped = cache
        .register_volume(OwnerTag(1), ClusterCacheMode::LocationBased)
        .unwrap();
    cache.set_max_entries(capped, Some(1)).unwrap();
    let global = cache
        .register_volume(OwnerTag(2), ClusterCacheMode::LocationBased)
        .unwrap();

    put(&cache, global, 0, 0xa0);
    put(&cache, global, 1, 0xa1);
    put(&cache, capped, 0, 1);
    put(&cache, capped, 1, 2);
    put(&cache, capped, 2, 3);

    // The capped namespace cycled through one slot; the uncapped one kept
    // everything.
    assert_eq!(cache.namespace_info(capped).unwrap().entries, 1);
    assert_eq!(cache.namespace_info(global).unwrap().entries, 2);
    assert!(get(&cache, global, 0).is_some());
    assert!(get(&cache, global, 1).is_some());
}

#[test]
fn test_add_skips_when_everything_is_spoken_for() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, &[("dev0", 2)]);

    let hoarder = cache
        .register_volume(OwnerTag(1), ClusterCacheMode::LocationBased)
        .unwrap();
    put(&cache, hoarder, 0, 1);
    put(&cache, hoarder, 1, 2);
    // Pin both entries into the namespace's private LRU: the global LRU is
    // now empty while every device slot is claimed.
    cache.set_max_entries(hoarder, Some(2)).unwrap();

    let other = cache
        .register_volume(OwnerTag(2), ClusterCacheMode::LocationBased)
        .unwrap();
    put(&cache, other, 0, 9);

    assert_eq!(get(&cache, other, 0), None, "the add must be silently skipped");
    assert_eq!(cache.namespace_info(hoarder).unwrap().entries, 2);
    assert_eq!(get(&cache, hoarder, 0), Some(1));
    assert_eq!(get(&cache, hoarder, 1), Some(2));
}

#[test]
fn test_uncapping_demotes_to_global_lru() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, &[("dev0", 4)]);
    let h = cache
        .register_volume(OwnerTag(1), ClusterCacheMode::LocationBased)
        .unwrap();
    cache.set_max_entries(h, Some(2)).unwrap();
    put(&cache, h, 0, 1);
    put(&cache, h, 1, 2);

    cache.set_max_entries(h, None).unwrap();
    assert_eq!(cache.get_max_entries(h).unwrap(), None);
    // Entries stay cached across the transition.
    assert_eq!(get(&cache, h, 0), Some(1));
    assert_eq!(get(&cache, h, 1), Some(2));

    // And they are evictable by the global pool again: filling the rest of
    // the device then adding once more recycles the global LRU tail.
    put(&cache, h, 2, 3);
    put(&cache, h, 3, 4);
    put(&cache, h, 4, 5);
    assert_eq!(cache.namespace_info(h).unwrap().entries, 4);
}

#[test]
fn test_capping_below_population_invalidates_surplus() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, &[("dev0", 8)]);
    let h = cache
        .register_volume(OwnerTag(1), ClusterCacheMode::LocationBased)
        .unwrap();
    for addr in 0..6 {
        put(&cache, h, addr, addr as u8 + 1);
    }

    cache.set_max_entries(h, Some(4)).unwrap();
    assert_eq!(cache.namespace_info(h).unwrap().entries, 4);
    assert_eq!(cache.get_max_entries(h).unwrap(), Some(4));

    let hits = (0..6).filter(|&a| get(&cache, h, a).is_some()).count();
    assert_eq!(hits, 4);
}

#[test]
fn test_shrinking_a_capped_namespace_drops_lru_tail() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, &[("dev0", 8)]);
    let h = cache
        .register_volume(OwnerTag(1), ClusterCacheMode::LocationBased)
        .unwrap();
    cache.set_max_entries(h, Some(4)).unwrap();
    for addr in 0..4 {
        put(&cache, h, addr, addr as u8 + 1);
    }
    // Touch 0 and 1 so 2 and 3 sit at the tail.
    assert!(get(&cache, h, 0).is_some());
    assert!(get(&cache, h, 1).is_some());

    cache.set_max_entries(h, Some(2)).unwrap();
    assert_eq!(get(&cache, h, 0), Some(1));
    assert_eq!(get(&cache, h, 1), Some(2));
    assert_eq!(get(&cache, h, 2), None);
    assert_eq!(get(&cache, h, 3), None);
}

#[test]
fn test_namespace_info_shape() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, &[("dev0", 8)]);
    let h = cache
        .register_volume(OwnerTag(1), ClusterCacheMode::LocationBased)
        .unwrap();
    for addr in 0..3 {
        put(&cache, h, addr, 1);
    }

    let info = cache.namespace_info(h).unwrap();
    assert_eq!(info.handle, h);
    assert_eq!(info.entries, 3);
    assert_eq!(info.max_entries, None);
    let entries_by_histogram: u64 = info
        .bucket_lengths
        .iter()
        .map(|(len, count)| len * count)
        .sum();
    assert_eq!(entries_by_histogram, 3);
}

#[test]
fn test_total_size_and_device_listing() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, &[("dev_a", 2), ("dev_b", 4)]);
    assert_eq!(cache.total_size_in_entries(), 6);

    let info = cache.device_info();
    assert_eq!(info.len(), 2);
    assert_eq!(info[&dir.path().join("dev_b")].total_size, 4 * CLUSTER);
}

#[test]
fn test_offline_and_online_configured_device() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, &[("dev0", 4)]);
    let h = cache
        .register_volume(OwnerTag(1), ClusterCacheMode::LocationBased)
        .unwrap();
    put(&cache, h, 0, 0xee);

    let dev = dir.path().join("dev0");
    cache.offline_device(&dev).unwrap();
    assert!(cache.device_info().is_empty());
    assert_eq!(get(&cache, h, 0), None);

    // Offlining again is harmless.
    cache.offline_device(&dev).unwrap();

    assert!(cache.online_device(&dev).unwrap());
    assert_eq!(cache.device_info().len(), 1);
    // The cache is cold for this device but usable again.
    put(&cache, h, 0, 0xef);
    assert_eq!(get(&cache, h, 0), Some(0xef));
}

#[test]
fn test_update_config_adds_new_mount_points() {
    let dir = TempDir::new().unwrap();
    let cache = cache(&dir, &[("dev_a", 2)]);

    let mut new = config(&dir, &[("dev_a", 2), ("dev_b", 2)]);
    cache.check_config(&new).unwrap();
    cache.update_config(new.clone()).unwrap();
    assert_eq!(cache.device_info().len(), 2);

    // Resizing a kept device is rejected by the check.
    new.clustercache_mount_points[0].size = 8 * CLUSTER;
    assert!(cache.check_config(&new).is_err());
}

#[test]
fn test_concurrent_reads_and_adds() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(cache(&dir, &[("dev0", 64)]));

    let handles: Vec<_> = (1..=4u64)
        .map(|owner| {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                let h = cache
                    .register_volume(OwnerTag(owner), ClusterCacheMode::LocationBased)
                    .unwrap();
                for _round in 0..3 {
                    for addr in 0..8u64 {
                        let fill = (owner * 10 + addr) as u8;
                        cache.add(h, addr, &NULL_DIGEST, &vec![fill; CLUSTER as usize]).unwrap();
                    }
                    for addr in 0..8u64 {
                        let mut buf = vec![0u8; CLUSTER as usize];
                        if cache.read(h, addr, &NULL_DIGEST, &mut buf).unwrap() {
                            assert_eq!(buf[0], (owner * 10 + addr) as u8);
                        }
                    }
                }
            })
        })
        .collect();

    for t in handles {
        t.join().unwrap();
    }

    let (hits, _, entries) = cache.get_stats();
    assert!(entries <= 64);
    assert!(hits > 0);
}
