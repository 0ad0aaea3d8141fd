//! Device lifecycle: provisioning, network, broker, operation
//!
//! ```text
//! AwaitProvisioning --config--> JoinNetwork --network up--> JoinBroker --broker up--> Operational
//!        ^                                                      |  ^                     |
//!        +------------------- network lost ---------------------+  +---- broker lost ----+
//!        +------------------------------- network lost ----------------------------------+
//! ```
//!
//! [`DeviceLifecycle::tick`] is called once per main-loop iteration and never
//! blocks. Collaborators are polled; state that must survive between polls
//! lives in this struct, not on a stack. Inbound broker messages are
//! collected by the broker's `poll` and routed only after the security
//! controller has been advanced, so a lock transition and a whitelist
//! decision made in one tick are visible before any remote command lands.

use log::{debug, info, warn};

use crate::config::{BrokerConfig, DeviceConfig, ModuleConfig, WifiConfig};
use crate::error::Result;
use crate::lock::Actuator;
use crate::protocol::{
    self, AccessEnvelope, ConfigRemoval, ConfigUpdate, Publisher, RelayState, RelayStateSync,
    Route, Topics, WifiCredentials,
};
use crate::security::{CredentialReader, SecurityConfig, SecurityController};
use crate::storage::PersistentStore;

/// Short-range pairing channel that delivers the first configuration
pub trait Provisioner {
    /// Non-blocking; `Some` once a full configuration has arrived
    fn poll(&mut self) -> Option<DeviceConfig>;
}

pub trait Network {
    /// Drive the join; returns whether the link is up
    fn poll(&mut self) -> bool;

    fn is_connected(&self) -> bool;
}

/// Broker session. Reconnect backoff is the implementation's business.
pub trait Broker: Publisher {
    /// Advance I/O, handing each received message to `deliver`
    fn poll(&mut self, deliver: &mut dyn FnMut(&str, &[u8]));

    fn is_connected(&self) -> bool;

    fn subscribe(&mut self, topic: &str) -> bool;
}

/// Builds network and broker sessions from the provisioned config
pub trait Connectivity {
    type Network: Network;
    type Broker: Broker;

    fn network(&mut self, wifi: &WifiConfig) -> Result<Self::Network>;

    fn broker(&mut self, broker: &BrokerConfig, client_id: &str) -> Result<Self::Broker>;
}

/// Relay board behind a serial link
pub trait RelayBus {
    fn toggle(&mut self, state: RelayState) -> bool;

    /// Drain acknowledgements from the board
    fn poll_responses(&mut self);

    fn snapshot(&self) -> RelayStateSync;
}

/// Climate / light / motion sampling over the current module table
pub trait SensorPoller {
    fn poll(&mut self, now_ms: u64, modules: &ModuleConfig, topics: &Topics, outbox: &mut dyn Publisher);
}

/// Concrete collaborator types for one board
pub trait Platform {
    type Storage: PersistentStore;
    type Reader: CredentialReader;
    type Actuator: Actuator;
    type Provisioner: Provisioner;
    type Connectivity: Connectivity;
    type Relay: RelayBus;
    type Sensors: SensorPoller;
}

/// Everything the lifecycle takes ownership of at boot
pub struct Parts<P: Platform> {
    pub storage: P::Storage,
    pub reader: P::Reader,
    pub actuator: P::Actuator,
    pub provisioner: P::Provisioner,
    pub connectivity: P::Connectivity,
    pub relay: P::Relay,
    pub sensors: P::Sensors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    AwaitProvisioning,
    JoinNetwork,
    JoinBroker,
    Operational,
}

/// What the firmware loop should do after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    /// Persisted state changed in a way that needs a clean boot
    Restart,
}

type NetworkOf<P> = <<P as Platform>::Connectivity as Connectivity>::Network;
type BrokerOf<P> = <<P as Platform>::Connectivity as Connectivity>::Broker;

/// Provisioned session: config, topics and the live connections
struct Session<P: Platform> {
    config: DeviceConfig,
    topics: Topics,
    network: NetworkOf<P>,
    broker: BrokerOf<P>,
}

pub struct DeviceLifecycle<P: Platform> {
    state: DeviceState,
    storage: P::Storage,
    provisioner: P::Provisioner,
    connectivity: P::Connectivity,
    relay: P::Relay,
    sensors: P::Sensors,
    security: SecurityController<P::Reader, P::Actuator>,
    modules: ModuleConfig,
    session: Option<Session<P>>,
    /// Storage held no usable config on entry to AwaitProvisioning
    stored_config_missing: bool,
    restart: bool,
}

impl<P: Platform> DeviceLifecycle<P> {
    pub fn new(parts: Parts<P>, security: SecurityConfig) -> Self {
        let Parts {
            mut storage,
            reader,
            actuator,
            provisioner,
            connectivity,
            relay,
            sensors,
        } = parts;

        let modules = ModuleConfig::load_or_default(&mut storage);
        info!(
            "Module table: {} climate, {} light, {} motion",
            modules.climates.len(),
            modules.lights.len(),
            modules.motions.len()
        );

        Self {
            state: DeviceState::AwaitProvisioning,
            storage,
            provisioner,
            connectivity,
            relay,
            sensors,
            security: SecurityController::new(reader, actuator, "", security),
            modules,
            session: None,
            stored_config_missing: false,
            restart: false,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn storage(&self) -> &P::Storage {
        &self.storage
    }

    /// Hand the storage back, e.g. to reboot the simulation on the same image
    pub fn into_storage(self) -> P::Storage {
        self.storage
    }

    pub fn security(&self) -> &SecurityController<P::Reader, P::Actuator> {
        &self.security
    }

    pub fn security_mut(&mut self) -> &mut SecurityController<P::Reader, P::Actuator> {
        &mut self.security
    }

    pub fn modules(&self) -> &ModuleConfig {
        &self.modules
    }

    pub fn relay(&self) -> &P::Relay {
        &self.relay
    }

    pub fn device_config(&self) -> Option<&DeviceConfig> {
        self.session.as_ref().map(|s| &s.config)
    }

    /// One main-loop iteration
    pub fn tick(&mut self, now_ms: u64) -> Control {
        match self.state {
            DeviceState::AwaitProvisioning => self.await_provisioning(),
            DeviceState::JoinNetwork => self.join_network(),
            DeviceState::JoinBroker => self.join_broker(now_ms),
            DeviceState::Operational => self.operate(now_ms),
        }

        if self.restart {
            Control::Restart
        } else {
            Control::Continue
        }
    }

    fn enter(&mut self, state: DeviceState) {
        info!("Lifecycle {:?} -> {:?}", self.state, state);
        if state == DeviceState::AwaitProvisioning {
            self.stored_config_missing = false;
        }
        self.state = state;
    }

    fn await_provisioning(&mut self) {
        // Storage only changes under us when we write it, so one look per
        // entry is enough.
        let stored = if self.stored_config_missing {
            None
        } else {
            DeviceConfig::load(&self.storage)
        };
        let config = match stored {
            Some(config) => config,
            None => {
                if !self.stored_config_missing {
                    info!("No usable device config stored, waiting for provisioning");
                    self.stored_config_missing = true;
                }
                let Some(config) = self.provisioner.poll() else {
                    return;
                };
                if !config.is_complete() {
                    warn!("Provisioning delivered an incomplete config, ignoring");
                    return;
                }
                if let Err(e) = config.save(&mut self.storage) {
                    warn!("Failed to persist provisioned config: {}", e);
                    return;
                }
                self.stored_config_missing = false;
                info!("Provisioned as {}", config.device_id);
                config
            }
        };

        let network = match self.connectivity.network(&config.wifi) {
            Ok(network) => network,
            Err(e) => {
                warn!("Network setup failed: {}", e);
                return;
            }
        };
        let broker = match self.connectivity.broker(&config.broker, &config.device_id) {
            Ok(broker) => broker,
            Err(e) => {
                warn!("Broker setup failed: {}", e);
                return;
            }
        };

        info!("Broker {}:{}", config.broker.host, config.broker.port);
        self.session = Some(Session {
            topics: Topics::new(&config.device_id),
            config,
            network,
            broker,
        });
        self.enter(DeviceState::JoinNetwork);
    }

    fn join_network(&mut self) {
        let Some(session) = self.session.as_mut() else {
            self.enter(DeviceState::AwaitProvisioning);
            return;
        };
        if session.network.poll() {
            self.enter(DeviceState::JoinBroker);
        }
    }

    fn join_broker(&mut self, now_ms: u64) {
        let Some(session) = self.session.as_mut() else {
            self.enter(DeviceState::AwaitProvisioning);
            return;
        };
        if !session.network.is_connected() {
            warn!("Network lost while joining broker");
            self.drop_session();
            return;
        }

        // Nothing is subscribed yet; anything delivered now is stale.
        session.broker.poll(&mut |topic, _| debug!("Dropping early message on {}", topic));
        if !session.broker.is_connected() {
            return;
        }

        self.security.reinitialize(&session.config.device_id, now_ms);
        for topic in session.topics.subscriptions() {
            if !session.broker.subscribe(&topic) {
                warn!("Subscribe to {} failed", topic);
            }
        }
        match protocol::encode(&self.relay.snapshot()) {
            Ok(payload) => {
                if !session.broker.publish(&session.topics.relay_snapshot(), &payload) {
                    warn!("Relay snapshot publication dropped");
                }
            }
            Err(e) => warn!("{}", e),
        }
        self.enter(DeviceState::Operational);
    }

    fn operate(&mut self, now_ms: u64) {
        let Some(session) = self.session.as_mut() else {
            self.enter(DeviceState::AwaitProvisioning);
            return;
        };
        if !session.network.is_connected() {
            warn!("Network lost");
            self.drop_session();
            return;
        }
        if !session.broker.is_connected() {
            warn!("Broker connection lost");
            self.enter(DeviceState::JoinBroker);
            return;
        }

        let mut inbound: Vec<(String, Vec<u8>)> = Vec::new();
        session
            .broker
            .poll(&mut |topic, payload| inbound.push((topic.to_owned(), payload.to_vec())));

        self.security.tick(now_ms, &mut self.storage, &mut session.broker);
        self.relay.poll_responses();
        self.sensors
            .poll(now_ms, &self.modules, &session.topics, &mut session.broker);

        for (topic, payload) in inbound {
            if self.restart {
                debug!("Restart pending, dropping message on {}", topic);
                continue;
            }
            self.route(&topic, &payload, now_ms);
        }
    }

    fn drop_session(&mut self) {
        self.session = None;
        self.enter(DeviceState::AwaitProvisioning);
    }

    /// Dispatch one inbound message to exactly one handler
    fn route(&mut self, topic: &str, payload: &[u8], now_ms: u64) {
        let Some(route) = self.session.as_ref().and_then(|s| s.topics.route(topic)) else {
            debug!("Ignoring message on {}", topic);
            return;
        };

        let handled = match route {
            Route::CredentialUpdate => self.on_credential_update(payload),
            Route::AccessControl => self.on_access_control(payload, now_ms),
            Route::ConfigUpdate => self.on_config_update(payload),
            Route::ConfigRemoval => self.on_config_removal(payload),
            Route::ActuatorControl => self.on_actuator_control(payload),
            Route::FactoryReset => self.on_factory_reset(),
        };
        if let Err(e) = handled {
            warn!("Dropped {:?} message: {}", route, e);
        }
    }

    fn on_credential_update(&mut self, payload: &[u8]) -> Result<()> {
        let update: WifiCredentials = protocol::decode(payload)?;
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let mut config = session.config.clone();
        config.wifi = WifiConfig {
            ssid: update.ssid,
            password: update.password,
        };
        config.save(&mut self.storage)?;
        info!("Network credentials updated to {}, restarting", config.wifi.ssid);
        session.config = config;
        self.restart = true;
        Ok(())
    }

    fn on_access_control(&mut self, payload: &[u8], now_ms: u64) -> Result<()> {
        match protocol::decode::<AccessEnvelope>(payload)? {
            AccessEnvelope::EnrollRequest { id } => {
                self.security.enable_register_mode(id, now_ms);
            }
            AccessEnvelope::RevokeRequest { credential } => {
                self.security.revoke(&mut self.storage, &credential);
            }
            // Our own responses come back on the shared topic.
            AccessEnvelope::EnrollResponse { .. } => {}
        }
        Ok(())
    }

    fn on_config_update(&mut self, payload: &[u8]) -> Result<()> {
        let mut modules = self.modules.clone();
        match protocol::decode::<ConfigUpdate>(payload)? {
            ConfigUpdate::Climate(module) => modules.set_climate(module)?,
            ConfigUpdate::Light(module) => modules.set_light(module)?,
            ConfigUpdate::Motion(module) => modules.set_motion(module)?,
            ConfigUpdate::Full(table) => modules = table,
        }
        modules.save(&mut self.storage)?;
        info!("Module table updated");
        self.modules = modules;
        Ok(())
    }

    fn on_config_removal(&mut self, payload: &[u8]) -> Result<()> {
        let ConfigRemoval { kind, id } = protocol::decode(payload)?;
        let mut modules = self.modules.clone();
        modules.remove(kind, id)?;
        modules.save(&mut self.storage)?;
        info!("Removed {:?} module {}, restarting", kind, id);
        self.modules = modules;
        self.restart = true;
        Ok(())
    }

    fn on_actuator_control(&mut self, payload: &[u8]) -> Result<()> {
        let state: RelayState = protocol::decode(payload)?;
        if !self.relay.toggle(state) {
            warn!("Relay {}:{} did not accept command", state.kind, state.port);
        }
        Ok(())
    }

    fn on_factory_reset(&mut self) -> Result<()> {
        warn!("Factory reset requested");
        self.storage.wipe()?;
        self.restart = true;
        Ok(())
    }
}
