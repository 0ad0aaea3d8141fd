//! In-memory collaborators
//!
//! Stand-ins for the radio, broker, reader, servo and relay board so the
//! whole node can run on a host: the simulation binary and the tests drive
//! the same [`DeviceLifecycle`](crate::lifecycle::DeviceLifecycle) the
//! firmware does, only with these parts.
//!
//! Network and broker sessions are built by the lifecycle itself, so they
//! report to a shared [`SimWorld`] the test keeps a handle on.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use crate::config::{BrokerConfig, ClimateModule, DeviceConfig, LightModule, MotionModule, WifiConfig};
use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::lifecycle::{Broker, Connectivity, Network, Parts, Platform, Provisioner, RelayBus};
use crate::lock::Actuator;
use crate::protocol::{Publisher, RelayState, RelayStateSync};
use crate::security::CredentialReader;
use crate::sensors::{ClimateReading, SensorBus, SensorManager};
use crate::storage::MemoryStorage;

/// Publications captured in order
#[derive(Debug, Default)]
pub struct Outbox {
    pub messages: Vec<(String, Vec<u8>)>,
}

impl Outbox {
    pub fn payloads_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.messages
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

impl Publisher for Outbox {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        self.messages.push((topic.to_owned(), payload.to_vec()));
        true
    }
}

/// Tags presented to the reader, one per scan
#[derive(Debug, Default)]
pub struct ScriptedReader {
    queue: VecDeque<Credential>,
}

impl ScriptedReader {
    pub fn present(&mut self, uid: Credential) {
        self.queue.push_back(uid);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl CredentialReader for ScriptedReader {
    fn scan(&mut self) -> Option<Credential> {
        self.queue.pop_front()
    }
}

/// Servo that remembers every command
#[derive(Debug, Default)]
pub struct RecordingActuator {
    pub commands: Vec<bool>,
}

impl RecordingActuator {
    /// Whether the latch was ever commanded open
    pub fn opened(&self) -> bool {
        self.commands.iter().any(|&open| open)
    }

    pub fn is_open(&self) -> bool {
        self.commands.last().copied().unwrap_or(false)
    }
}

impl Actuator for RecordingActuator {
    fn set_open(&mut self, open: bool) -> Result<()> {
        self.commands.push(open);
        Ok(())
    }
}

/// Hands out one config after a number of empty polls
#[derive(Debug, Default)]
pub struct ScriptedProvisioner {
    config: Option<DeviceConfig>,
    delay_polls: usize,
}

impl ScriptedProvisioner {
    pub fn new(config: DeviceConfig, delay_polls: usize) -> Self {
        Self {
            config: Some(config),
            delay_polls,
        }
    }
}

impl Provisioner for ScriptedProvisioner {
    fn poll(&mut self) -> Option<DeviceConfig> {
        if self.delay_polls > 0 {
            self.delay_polls -= 1;
            return None;
        }
        self.config.take()
    }
}

/// Shared state of the simulated network and broker
#[derive(Debug, Default)]
pub struct SimWorld {
    pub network_up: bool,
    pub broker_up: bool,
    pub inbound: VecDeque<(String, Vec<u8>)>,
    pub published: Vec<(String, Vec<u8>)>,
    pub subscriptions: Vec<String>,
    pub networks_built: usize,
    pub brokers_built: usize,
    pub client_id: Option<String>,
    /// Sensor readings by module id; a missing entry is a failed read
    pub climate: BTreeMap<u8, ClimateReading>,
    pub light: BTreeMap<u8, u32>,
    pub motion: BTreeMap<u8, bool>,
    /// Buzzer outputs by port
    pub buzzers: BTreeMap<u8, bool>,
}

impl SimWorld {
    pub fn payloads_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

pub type SimHandle = Rc<RefCell<SimWorld>>;

pub struct SimConnectivity {
    world: SimHandle,
}

impl SimConnectivity {
    pub fn new(world: SimHandle) -> Self {
        Self { world }
    }
}

impl Connectivity for SimConnectivity {
    type Network = SimNetwork;
    type Broker = SimBroker;

    fn network(&mut self, wifi: &WifiConfig) -> Result<SimNetwork> {
        if wifi.ssid.is_empty() {
            return Err(Error::Backend("empty ssid".into()));
        }
        self.world.borrow_mut().networks_built += 1;
        Ok(SimNetwork {
            world: Rc::clone(&self.world),
        })
    }

    fn broker(&mut self, _broker: &BrokerConfig, client_id: &str) -> Result<SimBroker> {
        let mut world = self.world.borrow_mut();
        world.brokers_built += 1;
        world.client_id = Some(client_id.to_owned());
        Ok(SimBroker {
            world: Rc::clone(&self.world),
        })
    }
}

pub struct SimNetwork {
    world: SimHandle,
}

impl Network for SimNetwork {
    fn poll(&mut self) -> bool {
        self.world.borrow().network_up
    }

    fn is_connected(&self) -> bool {
        self.world.borrow().network_up
    }
}

pub struct SimBroker {
    world: SimHandle,
}

impl Publisher for SimBroker {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        let mut world = self.world.borrow_mut();
        if !world.broker_up {
            return false;
        }
        world.published.push((topic.to_owned(), payload.to_vec()));
        true
    }
}

impl Broker for SimBroker {
    fn poll(&mut self, deliver: &mut dyn FnMut(&str, &[u8])) {
        // Release the borrow before calling out.
        let inbound: Vec<_> = self.world.borrow_mut().inbound.drain(..).collect();
        for (topic, payload) in inbound {
            deliver(&topic, &payload);
        }
    }

    fn is_connected(&self) -> bool {
        let world = self.world.borrow();
        world.network_up && world.broker_up
    }

    fn subscribe(&mut self, topic: &str) -> bool {
        self.world.borrow_mut().subscriptions.push(topic.to_owned());
        true
    }
}

/// Relay board that applies commands immediately
#[derive(Debug, Default)]
pub struct SimRelayBus {
    relays: Vec<RelayState>,
    pub polls: usize,
}

impl RelayBus for SimRelayBus {
    fn toggle(&mut self, state: RelayState) -> bool {
        match self
            .relays
            .iter_mut()
            .find(|r| r.kind == state.kind && r.port == state.port)
        {
            Some(relay) => relay.on = state.on,
            None => self.relays.push(state),
        }
        true
    }

    fn poll_responses(&mut self) {
        self.polls += 1;
    }

    fn snapshot(&self) -> RelayStateSync {
        RelayStateSync {
            relays: self.relays.clone(),
        }
    }
}

/// Sensor ports backed by the readings in [`SimWorld`]
pub struct SimSensorBus {
    world: SimHandle,
}

impl SimSensorBus {
    pub fn new(world: SimHandle) -> Self {
        Self { world }
    }

    pub fn buzzer(&self, port: u8) -> Option<bool> {
        self.world.borrow().buzzers.get(&port).copied()
    }
}

impl SensorBus for SimSensorBus {
    fn read_climate(&mut self, module: &ClimateModule) -> Option<ClimateReading> {
        self.world.borrow().climate.get(&module.id).copied()
    }

    fn read_light(&mut self, module: &LightModule) -> Option<u32> {
        self.world.borrow().light.get(&module.id).copied()
    }

    fn read_motion(&mut self, module: &MotionModule) -> Option<bool> {
        self.world.borrow().motion.get(&module.id).copied()
    }

    fn set_buzzer(&mut self, port: u8, on: bool) {
        self.world.borrow_mut().buzzers.insert(port, on);
    }
}

/// Host board made of the parts above
pub struct SimPlatform;

impl Platform for SimPlatform {
    type Storage = MemoryStorage;
    type Reader = ScriptedReader;
    type Actuator = RecordingActuator;
    type Provisioner = ScriptedProvisioner;
    type Connectivity = SimConnectivity;
    type Relay = SimRelayBus;
    type Sensors = SensorManager<SimSensorBus>;
}

impl SimPlatform {
    /// Parts over `storage`, reporting to `world`
    pub fn parts(storage: MemoryStorage, provisioner: ScriptedProvisioner, world: &SimHandle) -> Parts<SimPlatform> {
        Parts {
            storage,
            reader: ScriptedReader::default(),
            actuator: RecordingActuator::default(),
            provisioner,
            connectivity: SimConnectivity::new(Rc::clone(world)),
            relay: SimRelayBus::default(),
            sensors: SensorManager::new(SimSensorBus::new(Rc::clone(world))),
        }
    }
}
