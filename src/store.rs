//! Slot-addressed cluster I/O against one backing file or block device.
//!
//! The first cluster of the backing object is reserved for a 36-byte ASCII
//! GUID identifying the engine generation that owns the device; slot `i`
//! therefore lives at byte offset `(i + 1) * cluster_size`. All I/O is
//! positional (`pread`/`pwrite` through [`FileExt`]) so one shared file
//! descriptor serves all worker threads without per-operation locking.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::{Path, PathBuf};

use log::error;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Length of the ASCII GUID written to the reserved cluster.
pub(crate) const GUID_STRING_LEN: usize = 36;

/// One backing file or block device holding fixed-size cluster slots.
#[derive(Debug)]
pub(crate) struct DiskStore {
    path: PathBuf,
    /// Usable bytes: the backing object's size minus the reserved GUID
    /// cluster.
    total_size: u64,
    cluster_size: u64,
    file: File,
}

impl DiskStore {
    /// Opens (creating if necessary) a backing file of `size` bytes, or the
    /// whole device when `size` is 0.
    pub(crate) fn open(path: &Path, size: u64, cluster_size: u64) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(size != 0)
            .open(path)
            .map_err(|source| Error::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let total = if size == 0 {
            // Whole-device mode: the object (typically a block device)
            // defines its own size.
            file.seek(SeekFrom::End(0)).map_err(|source| Error::Io {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            if size % cluster_size != 0 {
                return Err(Error::InvalidConfig(format!(
                    "size {} of {} is not a multiple of the cluster size {}",
                    size,
                    path.display(),
                    cluster_size
                )));
            }
            file.set_len(size).map_err(|source| Error::Io {
                path: path.to_path_buf(),
                source,
            })?;
            size
        };

        if total <= cluster_size || total % cluster_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "{} is too small ({} bytes) for cluster size {}",
                path.display(),
                total,
                cluster_size
            )));
        }

        Ok(DiskStore {
            path: path.to_path_buf(),
            total_size: total - cluster_size,
            cluster_size,
            file,
        })
    }

    /// Reopens a previously known backing object, verifying it still exists
    /// and has not shrunk below `total_size` usable bytes.
    pub(crate) fn reinstate(path: &Path, total_size: u64, cluster_size: u64) -> Result<Self> {
        let meta = std::fs::metadata(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let file_type = meta.file_type();
        if file_type.is_file() {
            if meta.len() < total_size {
                error!(
                    "{}: file size {} smaller than expected {}",
                    path.display(),
                    meta.len(),
                    total_size
                );
                return Err(Error::InvalidConfig(format!(
                    "cannot reinstate {} - file shrunk?",
                    path.display()
                )));
            }
        } else if !file_type.is_block_device() {
            error!(
                "{} does not refer to a regular file or a block device",
                path.display()
            );
            return Err(Error::InvalidConfig(format!(
                "cannot reinstate {} - neither block device nor file",
                path.display()
            )));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| Error::Io {
                path: path.to_path_buf(),
                source,
            })?;

        if file_type.is_block_device() {
            let dev_size = file.seek(SeekFrom::End(0)).map_err(|source| Error::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if dev_size < total_size {
                error!(
                    "{}: block device size {} smaller than expected {}",
                    path.display(),
                    dev_size,
                    total_size
                );
                return Err(Error::InvalidConfig(format!(
                    "cannot reinstate {} - block device shrunk?",
                    path.display()
                )));
            }
        }

        Ok(DiskStore {
            path: path.to_path_buf(),
            total_size,
            cluster_size,
            file,
        })
    }

    /// Writes the device GUID into the reserved cluster. Failures are logged
    /// and swallowed; a device with an unreadable GUID simply won't be
    /// reinstated after the next restart.
    pub(crate) fn write_guid(&self, uuid: &Uuid) {
        let mut buf = [0u8; GUID_STRING_LEN];
        buf.copy_from_slice(uuid.hyphenated().to_string().as_bytes());
        if let Err(e) = self.file.write_all_at(&buf, 0) {
            error!("could not write guid to {}: {}", self.path.display(), e);
        }
    }

    /// Reads back the reserved cluster and compares against `uuid`.
    /// Malformed or unreadable content counts as a mismatch.
    pub(crate) fn check_guid(&self, uuid: &Uuid) -> bool {
        let mut buf = [0u8; GUID_STRING_LEN];
        if let Err(e) = self.file.read_exact_at(&mut buf, 0) {
            error!("could not read guid from {}: {}", self.path.display(), e);
            return false;
        }
        match std::str::from_utf8(&buf).ok().and_then(|s| Uuid::parse_str(s).ok()) {
            Some(found) => found == *uuid,
            None => false,
        }
    }

    /// Reads slot `index` into `buf` (which must hold one cluster).
    pub(crate) fn read(&self, buf: &mut [u8], index: u32) -> io::Result<()> {
        let buf = &mut buf[..self.cluster_size as usize];
        self.file
            .read_exact_at(buf, (u64::from(index) + 1) * self.cluster_size)
    }

    /// Writes one cluster from `buf` into slot `index`.
    pub(crate) fn write(&self, buf: &[u8], index: u32) -> io::Result<()> {
        let buf = &buf[..self.cluster_size as usize];
        self.file
            .write_all_at(buf, (u64::from(index) + 1) * self.cluster_size)
    }

    /// Re-reads slot `index` and compares its digest against `expected`.
    /// Used by the post-restart sampling check for content-based entries.
    pub(crate) fn verify(&self, expected: &[u8; 16], index: u32) -> Result<()> {
        let mut buf = vec![0u8; self.cluster_size as usize];
        self.read(&mut buf, index).map_err(|source| Error::Io {
            path: self.path.clone(),
            source,
        })?;
        if *md5::compute(&buf) == *expected {
            Ok(())
        } else {
            error!(
                "digest mismatch detected: {} slot {}",
                self.path.display(),
                index
            );
            Err(Error::Verification {
                path: self.path.clone(),
                slot: index,
            })
        }
    }

    pub(crate) fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    pub(crate) fn total_size(&self) -> u64 {
        self.total_size
    }

    pub(crate) fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}
