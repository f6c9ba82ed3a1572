//! A persistent, multi-device read cache for fixed-size storage clusters.
//!
//! `clustercache` sits between a volume driver's I/O path and its backing
//! store, absorbing reads that would otherwise hit a remote or object
//! store. Cached data lives on raw devices or files; only the index is kept
//! in memory (and persisted across clean restarts).
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                            ClusterCache                               │
//! │                                                                       │
//! │  namespaces: handle → Namespace          global LRU      invalidated  │
//! │  ┌─────────────────────────────┐      ┌───────────┐    ┌───────────┐  │
//! │  │ 0 (content-based, shared)   │      │ MRU … LRU │    │ recyclable│  │
//! │  │ 7 (location-based, capped)──┼─LRU  └───────────┘    └───────────┘  │
//! │  │ 9 (location-based)          │            │                │        │
//! │  └──────────┬──────────────────┘            │                │        │
//! │             │ map: key → entry              │ intrusive links│        │
//! │             ▼                               ▼                ▼        │
//! │  ┌────────────────────────────────────────────────────────────────┐   │
//! │  │ DeviceManager: round-robin slot allocation                     │   │
//! │  │  ┌──────────────┐  ┌──────────────┐       ┌──────────────┐     │   │
//! │  │  │ Device 0     │  │ Device 1     │  ...  │ Device n     │     │   │
//! │  │  │ entry arena  │  │ entry arena  │       │ entry arena  │     │   │
//! │  │  │ disk store   │  │ disk store   │       │ disk store   │     │   │
//! │  │  └──────────────┘  └──────────────┘       └──────────────┘     │   │
//! │  └────────────────────────────────────────────────────────────────┘   │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each device reserves its first cluster for an identity GUID; every other
//! cluster is a cache slot described by one 40-byte entry in the device's
//! in-memory arena. Entries thread themselves through intrusive lists (the
//! LRUs and the invalidated pool) and through the per-namespace hash maps,
//! so the index allocates nothing per cached cluster.
//!
//! # Keying modes
//!
//! - [`ClusterCacheMode::ContentBased`]: clusters are keyed by a 128-bit
//!   digest of their contents and shared across all volumes — identical
//!   data is cached once. Entries are immutable per key.
//! - [`ClusterCacheMode::LocationBased`]: clusters are keyed by
//!   `(namespace, cluster address)`; each volume has its own namespace,
//!   optionally capped via [`ClusterCache::set_max_entries`], and entries
//!   are overwritten in place.
//!
//! # Degradation, not failure
//!
//! The cache is not authoritative storage. Device I/O errors offline the
//! affected device (purging its entries) and surface as misses; a corrupt
//! or missing index file at startup just means a cold cache. Callers only
//! ever see errors for genuine mistakes such as unknown handles.
//!
//! # Example
//!
//! ```no_run
//! use clustercache::{
//!     ClusterCache, ClusterCacheConfig, ClusterCacheMode, MountPointConfig, OwnerTag,
//! };
//!
//! let config = ClusterCacheConfig {
//!     clustercache_mount_points: vec![MountPointConfig::new("/var/cache/clusters", 1 << 30)],
//!     ..Default::default()
//! };
//! let cache = ClusterCache::new(config)?;
//!
//! let handle = cache.register_volume(OwnerTag(1), ClusterCacheMode::LocationBased)?;
//!
//! let cluster = vec![0u8; 4096];
//! cache.add(handle, 42, &clustercache::NULL_DIGEST, &cluster)?;
//!
//! let mut out = vec![0u8; 4096];
//! if cache.read(handle, 42, &clustercache::NULL_DIGEST, &mut out)? {
//!     assert_eq!(out, cluster);
//! }
//! # Ok::<(), clustercache::Error>(())
//! ```

/// Cache keys, namespace handles and keying modes.
pub mod key;

/// The arena-resident cache entry with intrusive list linkage.
pub(crate) mod entry;

/// Intrusive doubly linked list over arena entries.
///
/// Internal infrastructure: raw pointer surgery behind the engine's lock
/// discipline. Use the engine API instead.
pub(crate) mod list;

/// Chained hash table from cache key to entry.
pub(crate) mod map;

/// Slot-addressed I/O against one backing file or block device.
pub(crate) mod store;

/// One disk store plus its entry arena.
pub(crate) mod device;

/// Device set, round-robin allocation and the manager GUID.
pub(crate) mod manager;

/// Configuration structures and the reconfiguration rules.
pub mod config;

/// Error kinds.
pub mod error;

/// Monitoring events and the publisher trait.
pub mod events;

/// The cache engine: registration, read/add/invalidate, eviction, device
/// lifecycle.
pub mod engine;

/// Versioned save/load of the index across restarts.
pub(crate) mod serialization;

pub use config::{ClusterCacheConfig, MountPointConfig, SERIALIZATION_FILENAME};
pub use device::{DeviceInfo, DeviceInfoMap};
pub use engine::{ClusterCache, NamespaceInfo};
pub use error::{Error, Result};
pub use events::{ClusterCacheEvent, EventPublisher, LogPublisher};
pub use key::{ClusterCacheHandle, ClusterCacheKey, ClusterCacheMode, OwnerTag, NULL_DIGEST};
