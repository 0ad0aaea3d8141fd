//! Persistent image kept as a single NVS blob

use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use log::{info, warn};

use super::backend;
use crate::error::Result;
use crate::storage::{MemoryStorage, PersistentStore, STORAGE_SIZE};

const NAMESPACE: &str = "latchkey";
const BLOB_KEY: &str = "image";

/// RAM image written back to flash on every commit.
///
/// NVS replaces a blob atomically, so a power cut leaves either the old or
/// the new image, never a mix.
pub struct NvsStorage {
    nvs: EspNvs<NvsDefault>,
    image: MemoryStorage,
}

impl NvsStorage {
    pub fn new(partition: EspDefaultNvsPartition) -> Result<Self> {
        let nvs = EspNvs::new(partition, NAMESPACE, true).map_err(backend)?;

        let mut buf = vec![0u8; STORAGE_SIZE];
        let image = match nvs.get_raw(BLOB_KEY, &mut buf).map_err(backend)? {
            Some(blob) if blob.len() == STORAGE_SIZE => {
                info!("Loaded {} byte image from NVS", blob.len());
                MemoryStorage::from_image(blob.to_vec())
            }
            Some(blob) => {
                warn!("NVS image has size {}, starting erased", blob.len());
                MemoryStorage::new(STORAGE_SIZE)
            }
            None => {
                info!("No NVS image, starting erased");
                MemoryStorage::new(STORAGE_SIZE)
            }
        };

        Ok(Self { nvs, image })
    }
}

impl PersistentStore for NvsStorage {
    fn capacity(&self) -> usize {
        self.image.capacity()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.image.read(offset, buf)
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.image.write(offset, bytes)
    }

    fn commit(&mut self) -> Result<()> {
        if !self.image.take_dirty() {
            return Ok(());
        }
        self.nvs
            .set_raw(BLOB_KEY, self.image.image())
            .map_err(backend)?;
        Ok(())
    }
}
