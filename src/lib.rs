//! Latchkey - access-control core of an ESP32 IoT node
//!
//! The node walks a fixed lifecycle (provisioning, network attach, broker
//! attach, operation) and, once operational, guards a physical lock:
//!
//! 1. A proximity tag is scanned
//! 2. Its UID is checked against a small persistent whitelist
//! 3. A match opens the lock for a fixed hold time, anything else keeps it shut
//! 4. The decision is published to the broker
//!
//! Remote operators enroll new tags (the next scan is stored) and revoke old
//! ones through broker messages.
//!
//! Everything here is polled from one loop and never blocks. Hardware is
//! reached through small traits; `platform` implements them on ESP-IDF and
//! [`sim`] implements them in memory.

pub mod config;
pub mod credential;
pub mod error;
pub mod lifecycle;
pub mod lock;
pub mod protocol;
pub mod security;
pub mod sensors;
pub mod sim;
pub mod storage;
pub mod whitelist;

#[cfg(target_os = "espidf")]
pub mod platform;

pub use credential::Credential;
pub use error::{Error, Result};
pub use lifecycle::{Control, DeviceLifecycle, DeviceState, Parts, Platform};
pub use security::{SecurityConfig, SecurityController};
