//! Cache keys, namespace handles and keying modes.
//!
//! A [`ClusterCacheKey`] is 16 bytes with two interpretations sharing the
//! same storage:
//!
//! - **Content-based**: a 128-bit digest of the cluster's contents. All
//!   volumes using content-based caching share one namespace, so identical
//!   clusters are deduplicated across volumes.
//! - **Location-based**: a `(handle, cluster_address)` pair. Each volume
//!   gets its own namespace and entries are overwritable in place.
//!
//! Which interpretation applies is *not* recorded in the key bytes; it is
//! carried by the owning entry's mode flag (see
//! [`ClusterCacheEntry`](crate::entry::ClusterCacheEntry)).

use core::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a cache namespace.
///
/// Handle `0` names the shared content-based namespace; any nonzero handle
/// names a location-based namespace and equals the owning volume's
/// [`OwnerTag`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterCacheHandle(pub u64);

impl ClusterCacheHandle {
    /// The singleton namespace holding all content-based entries.
    pub const CONTENT_BASED: ClusterCacheHandle = ClusterCacheHandle(0);
}

impl fmt::Display for ClusterCacheHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle({})", self.0)
    }
}

/// Opaque identifier the volume driver assigns to a registered volume.
///
/// Tag `0` is reserved and must not be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerTag(pub u64);

impl fmt::Display for OwnerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner({})", self.0)
    }
}

impl From<OwnerTag> for ClusterCacheHandle {
    fn from(tag: OwnerTag) -> Self {
        ClusterCacheHandle(tag.0)
    }
}

/// How a cached cluster is keyed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterCacheMode {
    /// Keyed by a 128-bit digest of the cluster contents; immutable per key.
    ContentBased,
    /// Keyed by `(handle, cluster_address)`; overwritable.
    LocationBased,
}

/// The all-zero digest, used as the "no digest available" sentinel in the
/// combined read/add/invalidate interface.
pub const NULL_DIGEST: [u8; 16] = [0u8; 16];

/// A 16-byte cache key.
///
/// Layout of the location-based interpretation: the cluster address occupies
/// bytes `0..8` (little endian) and the handle bytes `8..16`. The
/// content-based interpretation is the raw digest. The map spine index is
/// derived from the first eight bytes, which for digests is uniform and for
/// location keys varies with the cluster address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterCacheKey {
    bytes: [u8; 16],
}

impl ClusterCacheKey {
    /// Builds a content-based key from a cluster digest.
    pub fn from_digest(digest: [u8; 16]) -> Self {
        ClusterCacheKey { bytes: digest }
    }

    /// Builds a location-based key from a namespace handle and a cluster
    /// address.
    pub fn from_location(handle: ClusterCacheHandle, cluster_address: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&cluster_address.to_le_bytes());
        bytes[8..].copy_from_slice(&handle.0.to_le_bytes());
        ClusterCacheKey { bytes }
    }

    /// The raw key bytes (the digest, for content-based keys).
    pub fn digest(&self) -> &[u8; 16] {
        &self.bytes
    }

    /// The handle half of a location-based key.
    ///
    /// Meaningless for content-based keys; callers must consult the entry's
    /// mode first.
    pub fn cluster_cache_handle(&self) -> ClusterCacheHandle {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.bytes[8..]);
        ClusterCacheHandle(u64::from_le_bytes(buf))
    }

    /// The address half of a location-based key.
    pub fn cluster_address(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.bytes[..8]);
        u64::from_le_bytes(buf)
    }

    /// The first eight key bytes as an integer; the cache map masks the low
    /// bits of this to pick a bucket.
    pub(crate) fn hash_prefix(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.bytes[..8]);
        u64::from_le_bytes(buf)
    }
}

impl fmt::Debug for ClusterCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClusterCacheKey(")?;
        for b in &self.bytes {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

const _: () = assert!(core::mem::size_of::<ClusterCacheKey>() == 16);
