//! Monitoring events emitted by the cache.
//!
//! The cache only reports; delivery is the host's concern. Plug in an
//! [`EventPublisher`] at construction to route events into whatever
//! monitoring pipeline exists — the default [`LogPublisher`] just writes
//! them to the log.

use std::fmt;
use std::path::PathBuf;

use log::error;

/// An event worth telling the monitoring system about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCacheEvent {
    /// A device was taken out of service after an I/O or verification
    /// failure. Its entries are gone; the cache keeps running on the
    /// remaining devices.
    MountPointOfflined {
        /// Path of the offlined device.
        path: PathBuf,
    },
}

impl fmt::Display for ClusterCacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterCacheEvent::MountPointOfflined { path } => {
                write!(f, "cluster cache mount point {} offlined", path.display())
            }
        }
    }
}

/// Sink for [`ClusterCacheEvent`]s.
///
/// Implementations must not block for long and must not call back into the
/// cache: events are published while engine locks are held.
pub trait EventPublisher: Send + Sync {
    /// Delivers one event.
    fn publish(&self, event: ClusterCacheEvent);
}

/// Default publisher that logs events at error level.
#[derive(Debug, Default)]
pub struct LogPublisher;

impl EventPublisher for LogPublisher {
    fn publish(&self, event: ClusterCacheEvent) {
        error!("{event}");
    }
}
