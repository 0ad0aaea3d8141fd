//! Sensor ports on plain GPIO
//!
//! Module ports are GPIO numbers. PIR sensors are digital inputs (high while
//! someone is in view) and buzzers are digital outputs. The reference board
//! carries no DHT22 or ADC wiring, so climate and light reads report a
//! failure for any module configured on it.

use esp_idf_hal::gpio::{AnyIOPin, AnyOutputPin, Input, Output, PinDriver, Pull};
use log::warn;

use super::backend;
use crate::config::{ClimateModule, LightModule, MotionModule};
use crate::error::Result;
use crate::sensors::{ClimateReading, SensorBus};

#[derive(Default)]
pub struct GpioSensorBus {
    inputs: Vec<(u8, PinDriver<'static, AnyIOPin, Input>)>,
    buzzers: Vec<(u8, PinDriver<'static, AnyOutputPin, Output>)>,
}

impl GpioSensorBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route port `port` to a PIR on `pin`, pulled low while idle
    pub fn with_motion_input(mut self, port: u8, pin: AnyIOPin) -> Result<Self> {
        let mut driver = PinDriver::input(pin).map_err(backend)?;
        driver.set_pull(Pull::Down).map_err(backend)?;
        self.inputs.push((port, driver));
        Ok(self)
    }

    /// Route port `port` to a buzzer on `pin`, silent at start
    pub fn with_buzzer(mut self, port: u8, pin: AnyOutputPin) -> Result<Self> {
        let mut driver = PinDriver::output(pin).map_err(backend)?;
        driver.set_low().map_err(backend)?;
        self.buzzers.push((port, driver));
        Ok(self)
    }
}

impl SensorBus for GpioSensorBus {
    fn read_climate(&mut self, _module: &ClimateModule) -> Option<ClimateReading> {
        None
    }

    fn read_light(&mut self, _module: &LightModule) -> Option<u32> {
        None
    }

    fn read_motion(&mut self, module: &MotionModule) -> Option<bool> {
        let (_, pin) = self.inputs.iter().find(|(port, _)| *port == module.port)?;
        Some(pin.is_high())
    }

    fn set_buzzer(&mut self, port: u8, on: bool) {
        let Some((_, pin)) = self.buzzers.iter_mut().find(|(p, _)| *p == port) else {
            warn!("No buzzer wired on port {}", port);
            return;
        };
        let result = if on { pin.set_high() } else { pin.set_low() };
        if let Err(e) = result {
            warn!("Buzzer on port {}: {}", port, e);
        }
    }
}
