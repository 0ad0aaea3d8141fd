//! ESP-IDF implementations of the collaborator traits
//!
//! Only built for `target_os = "espidf"`. The reference board is an
//! ESP32-S3 with:
//!
//! - a UART proximity reader module (framed UIDs) on UART2
//! - a hobby servo on the latch, driven by LEDC at 50 Hz
//! - a relay board behind UART1 (4-byte command frames)
//! - PIR inputs and a buzzer on plain GPIO
//! - provisioning frames arriving on the console UART0
//! - Wi-Fi station + MQTT for the broker

use core::fmt::Display;

use crate::error::Error;
use crate::lifecycle::Platform;
use crate::sensors::SensorManager;

mod gpio;
mod mqtt;
mod nvs;
mod servo;
mod uart;
mod wifi;

pub use gpio::GpioSensorBus;
pub use mqtt::EspBroker;
pub use nvs::NvsStorage;
pub use servo::ServoActuator;
pub use uart::{ConsoleProvisioner, UartRelayBus, UartTagReader};
pub use wifi::{EspConnectivity, EspNetwork};

/// The firmware's collaborator set
pub struct EspPlatform;

impl Platform for EspPlatform {
    type Storage = NvsStorage;
    type Reader = UartTagReader;
    type Actuator = ServoActuator;
    type Provisioner = ConsoleProvisioner;
    type Connectivity = EspConnectivity;
    type Relay = UartRelayBus;
    type Sensors = SensorManager<GpioSensorBus>;
}

/// Milliseconds since boot, from the 64-bit ESP timer
pub fn millis() -> u64 {
    (unsafe { esp_idf_sys::esp_timer_get_time() } / 1000) as u64
}

fn backend(e: impl Display) -> Error {
    Error::Backend(e.to_string())
}
