//! Cluster cache configuration.
//!
//! The cache takes its whole configuration at construction through
//! [`ClusterCacheConfig`]. Reconfiguration at runtime is limited on
//! purpose: mount points may be added, everything kept must stay exactly as
//! it was — resizing or relocating a device in place would silently orphan
//! its on-disk slots, so it requires an explicit offline and re-add.
//! [`ClusterCacheConfig::check`] enforces that rule before a new
//! configuration is applied.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Filename of the persisted index inside
/// [`serialization_directory`](ClusterCacheConfig::serialization_directory).
pub const SERIALIZATION_FILENAME: &str = ".read_cache_serialization";

/// Default cluster size in bytes.
pub const DEFAULT_CLUSTER_SIZE: u64 = 4096;

/// Default target chain length for cache map sizing.
pub const DEFAULT_AVERAGE_ENTRIES_PER_BIN: u32 = 2;

/// One backing device or file for the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPointConfig {
    /// Filesystem path of the backing file or block device.
    pub path: PathBuf,
    /// Size in bytes; 0 means "use the whole device".
    pub size: u64,
}

impl MountPointConfig {
    /// Creates a mount point description.
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        MountPointConfig {
            path: path.into(),
            size,
        }
    }
}

/// Complete configuration of a [`ClusterCache`](crate::engine::ClusterCache).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterCacheConfig {
    /// Persist the index on clean shutdown and reload it on startup.
    pub serialize_read_cache: bool,
    /// Directory holding the serialized index file.
    pub read_cache_serialization_path: PathBuf,
    /// Target chain length for cache map sizing (typically 2-4).
    pub average_entries_per_bin: u32,
    /// Devices to open at startup.
    pub clustercache_mount_points: Vec<MountPointConfig>,
    /// Cache block size in bytes; must be a power of two.
    pub cluster_size: u64,
}

impl Default for ClusterCacheConfig {
    fn default() -> Self {
        ClusterCacheConfig {
            serialize_read_cache: false,
            read_cache_serialization_path: PathBuf::from("."),
            average_entries_per_bin: DEFAULT_AVERAGE_ENTRIES_PER_BIN,
            clustercache_mount_points: Vec::new(),
            cluster_size: DEFAULT_CLUSTER_SIZE,
        }
    }
}

impl ClusterCacheConfig {
    /// Sanity-checks the values themselves.
    pub fn validate(&self) -> Result<()> {
        if self.cluster_size == 0 || !self.cluster_size.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "cluster size {} is not a power of two",
                self.cluster_size
            )));
        }
        if self.average_entries_per_bin == 0 {
            return Err(Error::InvalidConfig(
                "average entries per bin must be > 0".to_owned(),
            ));
        }
        Ok(())
    }

    /// Checks whether `new` may replace this configuration.
    ///
    /// Every currently configured mount point must reappear with the same
    /// path and identical size; new mount points may be added. Returns the
    /// list of problems when the check fails.
    pub fn check(&self, new: &ClusterCacheConfig) -> std::result::Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if new.cluster_size != self.cluster_size {
            problems.push(format!(
                "cannot change the cluster size from {} to {}",
                self.cluster_size, new.cluster_size
            ));
        }

        for old in &self.clustercache_mount_points {
            match new
                .clustercache_mount_points
                .iter()
                .find(|mp| mp.path == old.path)
            {
                Some(mp) if mp.size == old.size => {}
                Some(mp) => problems.push(format!(
                    "cannot resize mountpoint {} from {} to {}",
                    old.path.display(),
                    old.size,
                    mp.size
                )),
                None => problems.push(format!(
                    "cannot delete mountpoint {}",
                    old.path.display()
                )),
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// Full path of the serialized index file.
    pub fn serialization_file(&self) -> PathBuf {
        self.read_cache_serialization_path
            .join(SERIALIZATION_FILENAME)
    }

    /// The configured mount point for `path`, if any.
    pub fn mount_point_for(&self, path: &Path) -> Option<&MountPointConfig> {
        self.clustercache_mount_points
            .iter()
            .find(|mp| mp.path == path)
    }
}
