//! Error kinds of the cluster cache.
//!
//! Only programmer mistakes reach callers: an unknown namespace handle, an
//! invalid configuration value, or a nonsensical operation. Transient cache
//! conditions never do — device-level failures are absorbed by offlining
//! the affected device and reporting a miss, and a broken index file at
//! startup just means a cold cache.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::key::ClusterCacheHandle;

/// Convenience alias for cluster cache results.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong talking to the cluster cache.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation referenced a namespace handle that does not exist.
    #[error("no such cluster cache namespace: {0}")]
    InvalidHandle(ClusterCacheHandle),

    /// A configuration value is out of range or inconsistent.
    #[error("invalid cluster cache configuration: {0}")]
    InvalidConfig(String),

    /// The operation is not allowed, e.g. removing the content-based
    /// namespace.
    #[error("invalid cluster cache operation: {0}")]
    InvalidOperation(String),

    /// Online/offline was requested for a path absent from the configured
    /// mount points.
    #[error("mount point not configured: {}", .0.display())]
    MountPointNotConfigured(PathBuf),

    /// I/O against a backing device failed. Internal: the engine reacts by
    /// offlining the device rather than propagating this to read/add
    /// callers.
    #[error("I/O error on {}: {}", .path.display(), .source)]
    Io {
        /// Path of the affected backing object.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A content-based entry's on-disk data no longer matches its digest.
    /// Internal: triggers a device offline during the restart check.
    #[error("digest mismatch on {} slot {}", .path.display(), .slot)]
    Verification {
        /// Path of the affected backing object.
        path: PathBuf,
        /// Slot whose contents failed verification.
        slot: u32,
    },

    /// The persisted index could not be decoded. Internal: the engine
    /// clears all state and starts cold.
    #[error("cannot decode cache index: {0}")]
    Deserialization(String),
}
