//! Byte-addressable persistent storage
//!
//! The node keeps everything it must remember across power cycles in one
//! small EEPROM-style image: the provisioned device config, the module
//! table and the credential whitelist. Each region has a fixed offset.
//!
//! ```text
//! 0    ..512   DeviceConfig   (magic + length + postcard body)
//! 512  ..768   ModuleConfig   (version + length + postcard body)
//! 768  ..823   Whitelist      (5 slots x 11 bytes)
//! 823  ..1024  unused
//! ```

use core::cell::Cell;

use crate::error::{Error, Result};

/// Total size of the persistent image
pub const STORAGE_SIZE: usize = 1024;

pub const DEVICE_CONFIG_ADDR: usize = 0;
pub const DEVICE_CONFIG_SIZE: usize = 512;

pub const MODULE_CONFIG_ADDR: usize = 512;
pub const MODULE_CONFIG_SIZE: usize = 256;

pub const WHITELIST_ADDR: usize = 768;

/// Read/write-at-offset contract consumed by the whitelist and config layers.
///
/// Writes may be buffered until [`commit`](PersistentStore::commit).
pub trait PersistentStore {
    /// Addressable size in bytes
    fn capacity(&self) -> usize;

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()>;

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()>;

    /// Flush buffered writes to the medium
    fn commit(&mut self) -> Result<()>;

    /// Overwrite every byte with zero (factory reset)
    fn wipe(&mut self) -> Result<()> {
        let zeros = [0u8; 64];
        let mut offset = 0;
        while offset < self.capacity() {
            let n = zeros.len().min(self.capacity() - offset);
            self.write(offset, &zeros[..n])?;
            offset += n;
        }
        self.commit()
    }

    fn read_byte(&self, offset: usize) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read(offset, &mut b)?;
        Ok(b[0])
    }
}

/// RAM image of the persistent store.
///
/// Fresh images read as `0xFF`, like erased flash. On the device this is the
/// write-back cache behind the NVS blob; on a host it is the whole store.
#[derive(Clone)]
pub struct MemoryStorage {
    image: Vec<u8>,
    dirty: bool,
    commits: usize,
    reads: Cell<usize>,
}

impl MemoryStorage {
    pub fn new(size: usize) -> Self {
        Self {
            image: vec![0xFF; size],
            dirty: false,
            commits: 0,
            reads: Cell::new(0),
        }
    }

    /// Adopt a previously persisted image
    pub fn from_image(image: Vec<u8>) -> Self {
        Self {
            image,
            dirty: false,
            commits: 0,
            reads: Cell::new(0),
        }
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Mark the image as flushed; returns whether anything was pending
    pub fn take_dirty(&mut self) -> bool {
        core::mem::replace(&mut self.dirty, false)
    }

    /// Number of commits observed
    pub fn commits(&self) -> usize {
        self.commits
    }

    /// Number of reads served, successful or not
    pub fn reads(&self) -> usize {
        self.reads.get()
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.image.len() => Ok(()),
            _ => Err(Error::OutOfBounds {
                offset,
                len,
                capacity: self.image.len(),
            }),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(STORAGE_SIZE)
    }
}

impl PersistentStore for MemoryStorage {
    fn capacity(&self) -> usize {
        self.image.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.reads.set(self.reads.get() + 1);
        self.check(offset, buf.len())?;
        buf.copy_from_slice(&self.image[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check(offset, bytes.len())?;
        self.image[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.dirty = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.commits += 1;
        Ok(())
    }
}
