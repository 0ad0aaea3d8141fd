//! Remote message protocol
//!
//! Messages travel through the broker as postcard-encoded payloads under a
//! per-device topic namespace `devices/<device_id>/...`. A payload that fails
//! to decode is dropped whole; nothing is applied from it.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::{ClimateModule, LightModule, ModuleConfig, ModuleKind, MotionModule};
use crate::credential::Credential;
use crate::error::{Error, Result};

/// Fixed channel carrying the outcome of every authentication
pub const STATUS_TOPIC: &str = "device/uid/authenticated";

const NAMESPACE: &str = "devices";

/// Longest correlation id accepted from a remote enrollment request
pub const MAX_CORRELATION_LEN: usize = 128;

/// Opaque id linking an enrollment request to its response
pub type CorrelationId = heapless::String<MAX_CORRELATION_LEN>;

/// Outbound half of the broker connection
pub trait Publisher {
    /// Queue a publication; `false` when the broker could not accept it
    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool;
}

/// Access-control envelope exchanged on `<ns>/rfid`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessEnvelope {
    EnrollRequest { id: CorrelationId },
    EnrollResponse { id: CorrelationId, credential: Credential },
    RevokeRequest { credential: Credential },
}

/// Replacement network credentials, `<ns>/wifi`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

/// Module table mutation, `<ns>/config`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigUpdate {
    Climate(ClimateModule),
    Light(LightModule),
    Motion(MotionModule),
    Full(ModuleConfig),
}

/// Module removal, `<ns>/config/remove`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRemoval {
    pub kind: ModuleKind,
    pub id: u8,
}

/// Relay command, `<ns>/relay`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayState {
    pub kind: u8,
    pub port: u8,
    pub on: bool,
}

/// Snapshot of every relay, published to `<ns>/relay/full` on broker attach
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStateSync {
    pub relays: Vec<RelayState>,
}

/// Climate sample, `<ns>/climate`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClimateData {
    pub id: u8,
    pub temperature: f32,
    pub humidity: f32,
    pub aqi: u32,
}

/// Light level sample, `<ns>/light`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightData {
    pub id: u8,
    pub value: u32,
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(message).map_err(Error::Encode)
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    postcard::from_bytes(payload).map_err(Error::Decode)
}

/// Inbound topic classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    CredentialUpdate,
    AccessControl,
    ConfigUpdate,
    ConfigRemoval,
    ActuatorControl,
    FactoryReset,
}

impl Route {
    pub const ALL: [Route; 6] = [
        Route::CredentialUpdate,
        Route::AccessControl,
        Route::ConfigUpdate,
        Route::ConfigRemoval,
        Route::ActuatorControl,
        Route::FactoryReset,
    ];

    fn suffix(self) -> &'static str {
        match self {
            Route::CredentialUpdate => "wifi",
            Route::AccessControl => "rfid",
            Route::ConfigUpdate => "config",
            Route::ConfigRemoval => "config/remove",
            Route::ActuatorControl => "relay",
            Route::FactoryReset => "factory_reset",
        }
    }
}

/// Topic names for one device, built at runtime from its identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(device_id: &str) -> Self {
        Self {
            prefix: format!("{NAMESPACE}/{device_id}"),
        }
    }

    pub fn topic(&self, route: Route) -> String {
        format!("{}/{}", self.prefix, route.suffix())
    }

    /// Where enrollment responses go (shared with inbound access control)
    pub fn enroll_response(&self) -> String {
        self.topic(Route::AccessControl)
    }

    pub fn relay_snapshot(&self) -> String {
        format!("{}/relay/full", self.prefix)
    }

    pub fn climate(&self) -> String {
        format!("{}/climate", self.prefix)
    }

    pub fn light(&self) -> String {
        format!("{}/light", self.prefix)
    }

    /// Every topic subscribed after broker attach
    pub fn subscriptions(&self) -> Vec<String> {
        Route::ALL.iter().map(|&r| self.topic(r)).collect()
    }

    /// Exact-match classification of an inbound topic
    pub fn route(&self, topic: &str) -> Option<Route> {
        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        Route::ALL.into_iter().find(|r| r.suffix() == rest)
    }
}
