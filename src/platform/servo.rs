//! Latch servo on an LEDC channel

use esp_idf_hal::ledc::LedcDriver;

use super::backend;
use crate::error::Result;
use crate::lock::Actuator;

/// PWM period at 50 Hz
const PERIOD_US: u32 = 20_000;

/// Pulse width for 0 degrees (closed)
const CLOSED_PULSE_US: u32 = 500;

/// Pulse width for ~100 degrees (open)
const OPEN_PULSE_US: u32 = 1_600;

pub struct ServoActuator {
    channel: LedcDriver<'static>,
}

impl ServoActuator {
    /// `channel` must be bound to a 50 Hz timer
    pub fn new(channel: LedcDriver<'static>) -> Self {
        Self { channel }
    }

    fn duty_for(&self, pulse_us: u32) -> u32 {
        self.channel.get_max_duty() * pulse_us / PERIOD_US
    }
}

impl Actuator for ServoActuator {
    fn set_open(&mut self, open: bool) -> Result<()> {
        let pulse = if open { OPEN_PULSE_US } else { CLOSED_PULSE_US };
        let duty = self.duty_for(pulse);
        self.channel.set_duty(duty).map_err(backend)
    }
}
