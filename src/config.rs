//! Persisted configuration
//!
//! Two records live in persistent storage next to the whitelist:
//!
//! - [`DeviceConfig`]: what provisioning delivers (Wi-Fi credentials, broker
//!   address, device identifier). Guarded by a magic marker; when the marker
//!   or body is bad the node simply has no config and waits to be provisioned.
//! - [`ModuleConfig`]: which sensor and relay modules are wired to which
//!   ports. Guarded by a version byte; a bad marker or body is replaced with
//!   defaults and written back, never surfaced as an error.
//!
//! Both bodies are postcard encoded behind a little-endian u16 length.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::{
    PersistentStore, DEVICE_CONFIG_ADDR, DEVICE_CONFIG_SIZE, MODULE_CONFIG_ADDR,
    MODULE_CONFIG_SIZE,
};

const DEVICE_CONFIG_MAGIC: u32 = 0xABCD_1234;
const MODULE_CONFIG_VERSION: u8 = 1;

pub const MAX_CLIMATE: usize = 2;
pub const MAX_LIGHT: usize = 2;
pub const MAX_MOTION: usize = 4;

pub const DEFAULT_BROKER_PORT: u16 = 1883;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiConfig {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_BROKER_PORT,
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Provisioned identity and connectivity settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    pub wifi: WifiConfig,
    pub broker: BrokerConfig,
}

impl DeviceConfig {
    /// A config is usable once it names the device, the network and the broker
    pub fn is_complete(&self) -> bool {
        !self.device_id.is_empty() && !self.wifi.ssid.is_empty() && !self.broker.host.is_empty()
    }

    /// Read the persisted config; `None` when absent, garbled or incomplete
    pub fn load<S: PersistentStore + ?Sized>(storage: &S) -> Option<Self> {
        let mut magic = [0u8; 4];
        storage.read(DEVICE_CONFIG_ADDR, &mut magic).ok()?;
        if u32::from_le_bytes(magic) != DEVICE_CONFIG_MAGIC {
            debug!("No device config stored");
            return None;
        }

        let body = match read_body(storage, DEVICE_CONFIG_ADDR + 4, DEVICE_CONFIG_SIZE - 4) {
            Ok(body) => body,
            Err(e) => {
                warn!("Device config unreadable: {}", e);
                return None;
            }
        };
        match postcard::from_bytes::<DeviceConfig>(&body) {
            Ok(config) if config.is_complete() => Some(config),
            Ok(_) => {
                warn!("Stored device config is incomplete");
                None
            }
            Err(e) => {
                warn!("Device config corrupt: {}", e);
                None
            }
        }
    }

    pub fn save<S: PersistentStore + ?Sized>(&self, storage: &mut S) -> Result<()> {
        let body = postcard::to_allocvec(self).map_err(Error::Encode)?;
        let mut record = DEVICE_CONFIG_MAGIC.to_le_bytes().to_vec();
        record.extend(frame(&body, DEVICE_CONFIG_SIZE - 4)?);
        storage.write(DEVICE_CONFIG_ADDR, &record)?;
        storage.commit()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClimateModule {
    pub id: u8,
    pub dht22_port: u8,
    pub aqi_port: u8,
    /// Buzzer port, when a buzzer is fitted
    pub buzzer_port: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightModule {
    pub id: u8,
    pub port: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionModule {
    pub id: u8,
    pub port: u8,
    pub relay_kind: u8,
    pub relay_port: u8,
}

/// Module table kinds, used for removal and errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleKind {
    Climate,
    Light,
    Motion,
}

impl ModuleKind {
    fn name(self) -> &'static str {
        match self {
            ModuleKind::Climate => "climate",
            ModuleKind::Light => "light",
            ModuleKind::Motion => "motion",
        }
    }
}

/// Sensor and relay wiring table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub climates: heapless::Vec<ClimateModule, MAX_CLIMATE>,
    pub lights: heapless::Vec<LightModule, MAX_LIGHT>,
    pub motions: heapless::Vec<MotionModule, MAX_MOTION>,
}

impl ModuleConfig {
    /// Load the table, reinitializing storage with defaults on any corruption
    pub fn load_or_default<S: PersistentStore + ?Sized>(storage: &mut S) -> Self {
        match Self::load(storage) {
            Ok(config) => config,
            Err(e) => {
                warn!("Module config invalid ({}), resetting to defaults", e);
                let config = Self::default();
                if let Err(e) = config.save(storage) {
                    warn!("Failed to write default module config: {}", e);
                }
                config
            }
        }
    }

    fn load<S: PersistentStore + ?Sized>(storage: &S) -> Result<Self> {
        let version = storage.read_byte(MODULE_CONFIG_ADDR)?;
        if version != MODULE_CONFIG_VERSION {
            return Err(Error::Corrupt(format!("module config version {version:#04x}")));
        }
        let body = read_body(storage, MODULE_CONFIG_ADDR + 1, MODULE_CONFIG_SIZE - 1)?;
        postcard::from_bytes(&body).map_err(Error::Decode)
    }

    pub fn save<S: PersistentStore + ?Sized>(&self, storage: &mut S) -> Result<()> {
        let body = postcard::to_allocvec(self).map_err(Error::Encode)?;
        let mut record = vec![MODULE_CONFIG_VERSION];
        record.extend(frame(&body, MODULE_CONFIG_SIZE - 1)?);
        storage.write(MODULE_CONFIG_ADDR, &record)?;
        storage.commit()
    }

    /// Add a climate module, replacing any entry with the same id
    pub fn set_climate(&mut self, module: ClimateModule) -> Result<()> {
        upsert(&mut self.climates, module, |m| m.id, ModuleKind::Climate)
    }

    pub fn set_light(&mut self, module: LightModule) -> Result<()> {
        upsert(&mut self.lights, module, |m| m.id, ModuleKind::Light)
    }

    pub fn set_motion(&mut self, module: MotionModule) -> Result<()> {
        upsert(&mut self.motions, module, |m| m.id, ModuleKind::Motion)
    }

    pub fn remove(&mut self, kind: ModuleKind, id: u8) -> Result<()> {
        let removed = match kind {
            ModuleKind::Climate => remove_by_id(&mut self.climates, id, |m| m.id),
            ModuleKind::Light => remove_by_id(&mut self.lights, id, |m| m.id),
            ModuleKind::Motion => remove_by_id(&mut self.motions, id, |m| m.id),
        };
        if removed {
            Ok(())
        } else {
            Err(Error::UnknownModule {
                kind: kind.name(),
                id,
            })
        }
    }
}

fn upsert<T, const N: usize>(
    table: &mut heapless::Vec<T, N>,
    module: T,
    id: impl Fn(&T) -> u8,
    kind: ModuleKind,
) -> Result<()> {
    if let Some(existing) = table.iter_mut().find(|m| id(m) == id(&module)) {
        *existing = module;
        return Ok(());
    }
    table
        .push(module)
        .map_err(|_| Error::TableFull { kind: kind.name() })
}

fn remove_by_id<T, const N: usize>(
    table: &mut heapless::Vec<T, N>,
    id: u8,
    key: impl Fn(&T) -> u8,
) -> bool {
    match table.iter().position(|m| key(m) == id) {
        Some(index) => {
            table.remove(index);
            true
        }
        None => false,
    }
}

/// Prefix `body` with its u16 length, checking it fits `region` bytes
fn frame(body: &[u8], region: usize) -> Result<Vec<u8>> {
    if body.len() + 2 > region {
        return Err(Error::RecordTooLarge {
            len: body.len() + 2,
            region,
        });
    }
    let mut out = Vec::with_capacity(body.len() + 2);
    out.extend_from_slice(&(body.len() as u16).to_le_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

fn read_body<S: PersistentStore + ?Sized>(storage: &S, addr: usize, region: usize) -> Result<Vec<u8>> {
    let mut len = [0u8; 2];
    storage.read(addr, &mut len)?;
    let len = u16::from_le_bytes(len) as usize;
    if len + 2 > region {
        return Err(Error::RecordTooLarge { len: len + 2, region });
    }
    let mut body = vec![0u8; len];
    storage.read(addr + 2, &mut body)?;
    Ok(body)
}
