//! Persistent memory store.
//!
//! This module persists the simulated flash to a flat raw file on the host. It provides:
//! 1. **Load:** Creates a zero-filled image of the declared size when the file is absent,
//!    otherwise reads the whole file back and rejects any length mismatch or short read.
//! 2. **Save:** Rewrites the image from offset 0 at shutdown; failures are reported, not retried.
//! 3. **Hook:** [`FlashBacking`] ties both operations to the machine's init and deinit.
//!
//! The file is opened only for the duration of each operation; no handle or
//! mapping outlives a load or a save.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::common::StorageError;
use crate::machine::Machine;
use crate::sim::context::MachineHooks;

/// Flat-file store for a non-volatile image.
#[derive(Debug, Clone)]
pub struct FlashStore {
    path: PathBuf,
    size: usize,
}

impl FlashStore {
    /// Creates a store for `size` bytes backed by `path`.
    pub fn new(path: impl Into<PathBuf>, size: usize) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Declared image size in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Loads the image; see [`load`].
    pub fn load(&self) -> Result<Vec<u8>, StorageError> {
        load(&self.path, self.size)
    }

    /// Saves the image; see [`save`].
    pub fn save(&self, image: &[u8]) -> Result<(), StorageError> {
        save(&self.path, image)
    }
}

/// Loads a `size`-byte image from `path`.
///
/// An absent file is created and zero-extended to `size`. An existing file
/// must already be exactly `size` bytes long, and must read back in full.
pub fn load(path: &Path, size: usize) -> Result<Vec<u8>, StorageError> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|source| StorageError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    let actual = file
        .metadata()
        .map_err(|source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .len();

    if actual == 0 && size > 0 {
        file.set_len(size as u64)
            .map_err(|source| StorageError::Resize {
                path: path.to_path_buf(),
                size: size as u64,
                source,
            })?;
        info!(path = %path.display(), bytes = size, "created zero-filled flash image");
    } else if actual != size as u64 {
        return Err(StorageError::SizeMismatch {
            path: path.to_path_buf(),
            expected: size as u64,
            actual,
        });
    }

    let mut image = vec![0u8; size];
    let read = read_full(&mut file, &mut image).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if read != size {
        return Err(StorageError::ShortRead {
            path: path.to_path_buf(),
            read,
            expected: size,
        });
    }

    debug!(path = %path.display(), bytes = size, "flash image loaded");
    Ok(image)
}

/// Reads until `buf` is full or the file ends; returns the bytes read.
fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Writes `image` to `path` from offset 0 and syncs it.
///
/// A write that stops early is reported as [`StorageError::ShortWrite`]
/// with the number of bytes that did reach the file.
pub fn save(path: &Path, image: &[u8]) -> Result<(), StorageError> {
    let io_err = |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|source| StorageError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    let _ = file.seek(SeekFrom::Start(0)).map_err(io_err)?;

    let mut written = 0;
    while written < image.len() {
        match file.write(&image[written..]) {
            Ok(0) => {
                return Err(StorageError::ShortWrite {
                    path: path.to_path_buf(),
                    written,
                    expected: image.len(),
                });
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::WriteZero || e.kind() == ErrorKind::StorageFull => {
                warn!(path = %path.display(), written, error = %e, "flash save stopped early");
                return Err(StorageError::ShortWrite {
                    path: path.to_path_buf(),
                    written,
                    expected: image.len(),
                });
            }
            Err(e) => return Err(io_err(e)),
        }
    }

    file.set_len(image.len() as u64).map_err(io_err)?;
    file.sync_data().map_err(io_err)?;
    debug!(path = %path.display(), bytes = written, "flash image saved");
    Ok(())
}

/// Machine hook that restores flash at init and persists it at deinit.
#[derive(Debug, Clone)]
pub struct FlashBacking {
    path: PathBuf,
}

impl FlashBacking {
    /// Creates a hook backed by `path`; the image size follows the machine's flash.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MachineHooks for FlashBacking {
    fn name(&self) -> &'static str {
        "flash-backing"
    }

    fn init(&mut self, machine: &mut Machine) -> Result<(), StorageError> {
        let image = load(&self.path, machine.flash().len())?;
        machine.flash_mut().copy_from_slice(&image);
        info!(path = %self.path.display(), bytes = image.len(), "flash restored");
        Ok(())
    }

    fn deinit(&mut self, machine: &Machine) -> Result<(), StorageError> {
        save(&self.path, machine.flash())?;
        info!(path = %self.path.display(), bytes = machine.flash().len(), "flash saved");
        Ok(())
    }
}
