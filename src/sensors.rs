//! Sensor sampling
//!
//! [`SensorManager`] walks the modules listed in the current [`ModuleConfig`]
//! on fixed intervals and publishes what it reads. Climate and light levels
//! go out as telemetry. A presence change on a motion module is turned into
//! a relay command on the node's own relay topic, so whatever listens there
//! (including this node) switches the paired relay.
//!
//! Raw port access sits behind [`SensorBus`]; the manager never touches
//! hardware itself and never reads a clock.

use log::{debug, warn};
use serde::Serialize;

use crate::config::{ClimateModule, LightModule, ModuleConfig, MotionModule, MAX_MOTION};
use crate::lifecycle::SensorPoller;
use crate::protocol::{self, ClimateData, LightData, Publisher, RelayState, Route, Topics};

/// Climate and light sampling period
pub const READ_INTERVAL_MS: u64 = 5000;

/// Presence sampling period
pub const MOTION_INTERVAL_MS: u64 = 100;

const TEMPERATURE_ALARM_C: f32 = 35.0;
const HUMIDITY_ALARM_PCT: f32 = 80.0;
const AQI_ALARM: u32 = 300;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateReading {
    /// Degrees Celsius
    pub temperature: f32,
    /// Relative humidity, percent
    pub humidity: f32,
    pub aqi: u32,
}

impl ClimateReading {
    /// Hot, damp or polluted enough to sound the buzzer
    pub fn is_alarming(&self) -> bool {
        self.temperature > TEMPERATURE_ALARM_C
            || self.humidity > HUMIDITY_ALARM_PCT
            || self.aqi > AQI_ALARM
    }
}

/// Raw reads from the module ports. `None` is a failed read.
pub trait SensorBus {
    fn read_climate(&mut self, module: &ClimateModule) -> Option<ClimateReading>;

    fn read_light(&mut self, module: &LightModule) -> Option<u32>;

    /// Whether the PIR currently sees someone
    fn read_motion(&mut self, module: &MotionModule) -> Option<bool>;

    fn set_buzzer(&mut self, port: u8, on: bool);
}

pub struct SensorManager<B: SensorBus> {
    bus: B,
    last_read: Option<u64>,
    last_motion: Option<u64>,
    /// Last presence published per motion module id
    presence: heapless::Vec<(u8, bool), MAX_MOTION>,
}

impl<B: SensorBus> SensorManager<B> {
    /// The first poll samples everything at once
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            last_read: None,
            last_motion: None,
            presence: heapless::Vec::new(),
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    fn read_climate(&mut self, modules: &ModuleConfig, topics: &Topics, outbox: &mut dyn Publisher) {
        for module in &modules.climates {
            let Some(reading) = self.bus.read_climate(module) else {
                warn!("Climate module {} read failed", module.id);
                continue;
            };
            let data = ClimateData {
                id: module.id,
                temperature: reading.temperature,
                humidity: reading.humidity,
                aqi: reading.aqi,
            };
            send(outbox, &topics.climate(), &data);

            if let Some(port) = module.buzzer_port {
                self.bus.set_buzzer(port, reading.is_alarming());
            }
        }
    }

    fn read_light(&mut self, modules: &ModuleConfig, topics: &Topics, outbox: &mut dyn Publisher) {
        for module in &modules.lights {
            match self.bus.read_light(module) {
                Some(value) => send(outbox, &topics.light(), &LightData { id: module.id, value }),
                None => warn!("Light module {} read failed", module.id),
            }
        }
    }

    fn sample_motion(&mut self, modules: &ModuleConfig, topics: &Topics, outbox: &mut dyn Publisher) {
        // Forget modules that were removed from the table.
        self.presence
            .retain(|(id, _)| modules.motions.iter().any(|m| m.id == *id));

        for module in &modules.motions {
            let Some(present) = self.bus.read_motion(module) else {
                continue;
            };
            match self.presence.iter().position(|(id, _)| *id == module.id) {
                Some(i) if self.presence[i].1 == present => continue,
                Some(i) => self.presence[i].1 = present,
                None => {
                    if self.presence.push((module.id, present)).is_err() {
                        warn!("Too many motion modules, {} untracked", module.id);
                    }
                }
            }

            debug!("Motion module {}: presence {}", module.id, present);
            let command = RelayState {
                kind: module.relay_kind,
                port: module.relay_port,
                on: present,
            };
            send(outbox, &topics.topic(Route::ActuatorControl), &command);
        }
    }
}

impl<B: SensorBus> SensorPoller for SensorManager<B> {
    fn poll(&mut self, now_ms: u64, modules: &ModuleConfig, topics: &Topics, outbox: &mut dyn Publisher) {
        if due(self.last_read, now_ms, READ_INTERVAL_MS) {
            self.last_read = Some(now_ms);
            self.read_climate(modules, topics, outbox);
            self.read_light(modules, topics, outbox);
        }
        if due(self.last_motion, now_ms, MOTION_INTERVAL_MS) {
            self.last_motion = Some(now_ms);
            self.sample_motion(modules, topics, outbox);
        }
    }
}

fn due(last: Option<u64>, now_ms: u64, interval_ms: u64) -> bool {
    last.map_or(true, |t| now_ms.saturating_sub(t) >= interval_ms)
}

fn send<T: Serialize>(outbox: &mut dyn Publisher, topic: &str, message: &T) {
    match protocol::encode(message) {
        Ok(payload) => {
            if !outbox.publish(topic, &payload) {
                debug!("Publication on {} dropped", topic);
            }
        }
        Err(e) => warn!("{}", e),
    }
}
