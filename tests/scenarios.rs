//! End-to-end runs of the node on the in-memory platform

use std::cell::RefCell;
use std::rc::Rc;

use latchkey::config::{
    BrokerConfig, DeviceConfig, LightModule, ModuleConfig, ModuleKind, MotionModule, WifiConfig,
};
use latchkey::lifecycle::RelayBus;
use latchkey::lock::{LockState, ACT_DELAY_MS, HOLD_MS};
use latchkey::protocol::{
    self, AccessEnvelope, ConfigRemoval, ConfigUpdate, CorrelationId, LightData, RelayState,
    RelayStateSync, Route, Topics, WifiCredentials, STATUS_TOPIC,
};
use latchkey::security::{Resolution, Transaction, TransactionKind};
use latchkey::sensors::READ_INTERVAL_MS;
use latchkey::sim::{ScriptedProvisioner, SimHandle, SimPlatform, SimWorld};
use latchkey::storage::MemoryStorage;
use latchkey::whitelist::{WhitelistMode, WhitelistStore};
use latchkey::{Control, Credential, DeviceLifecycle, DeviceState, SecurityConfig};

const DEVICE_ID: &str = "node-7";
const STEP_MS: u64 = 10;

type Node = DeviceLifecycle<SimPlatform>;

fn uid(bytes: &[u8]) -> Credential {
    Credential::from_slice(bytes).unwrap()
}

fn device_config() -> DeviceConfig {
    DeviceConfig {
        device_id: DEVICE_ID.into(),
        wifi: WifiConfig {
            ssid: "lab".into(),
            password: "hunter22".into(),
        },
        broker: BrokerConfig {
            host: "10.0.0.2".into(),
            ..Default::default()
        },
    }
}

fn world() -> SimHandle {
    Rc::new(RefCell::new(SimWorld {
        network_up: true,
        broker_up: true,
        ..Default::default()
    }))
}

fn topics() -> Topics {
    Topics::new(DEVICE_ID)
}

fn boot(storage: MemoryStorage, provisioner: ScriptedProvisioner, world: &SimHandle) -> Node {
    DeviceLifecycle::new(
        SimPlatform::parts(storage, provisioner, world),
        SecurityConfig::default(),
    )
}

/// Tick every step from `*now` up to and including `end`
fn tick_until(node: &mut Node, now: &mut u64, end: u64) -> Control {
    let mut control = Control::Continue;
    while *now <= end {
        if node.tick(*now) == Control::Restart {
            control = Control::Restart;
        }
        *now += STEP_MS;
    }
    control
}

fn tick_once(node: &mut Node, now: &mut u64) -> Control {
    let control = node.tick(*now);
    *now += STEP_MS;
    control
}

/// Fresh node, provisioned and attached
fn operational(storage: MemoryStorage, world: &SimHandle, now: &mut u64) -> Node {
    let mut node = boot(storage, ScriptedProvisioner::new(device_config(), 0), world);
    for _ in 0..3 {
        tick_once(&mut node, now);
    }
    assert_eq!(node.state(), DeviceState::Operational);
    node
}

fn inject<T: serde::Serialize>(world: &SimHandle, route: Route, message: &T) {
    let payload = protocol::encode(message).unwrap();
    world
        .borrow_mut()
        .inbound
        .push_back((topics().topic(route), payload));
}

fn statuses(world: &SimHandle) -> Vec<String> {
    world
        .borrow()
        .payloads_on(STATUS_TOPIC)
        .into_iter()
        .map(|p| String::from_utf8(p).unwrap())
        .collect()
}

fn enrolled(node: Node) -> Vec<Credential> {
    let mut storage = node.into_storage();
    let records = WhitelistStore::new(&mut storage).records().unwrap();
    records
}

#[test]
fn test_unknown_card_is_denied() {
    let world = world();
    let mut now = 0;
    let mut node = operational(MemoryStorage::default(), &world, &mut now);

    node.security_mut().reader_mut().present(uid(&[0x01, 0x02, 0x03]));
    tick_once(&mut node, &mut now);
    tick_once(&mut node, &mut now);

    assert!(!node.security().lock().actuator().opened());
    assert_eq!(node.security().lock_state(), LockState::Locked);
    assert_eq!(
        node.security().transaction(),
        Transaction::Resolved {
            kind: TransactionKind::Authentication,
            resolution: Resolution::Rejected,
        }
    );
    assert_eq!(statuses(&world), vec!["false".to_string()]);
}

#[test]
fn test_remote_enrollment_stores_next_scan() {
    let world = world();
    let mut now = 0;
    let mut node = operational(MemoryStorage::default(), &world, &mut now);

    let id = CorrelationId::try_from("req-1").unwrap();
    inject(&world, Route::AccessControl, &AccessEnvelope::EnrollRequest { id: id.clone() });
    tick_once(&mut node, &mut now);
    assert!(node.security().is_awaiting_enroll());
    assert_eq!(node.security().whitelist().mode(), WhitelistMode::Registration);

    node.security_mut().reader_mut().present(uid(&[0xAA, 0xBB]));
    tick_once(&mut node, &mut now);
    tick_once(&mut node, &mut now);

    assert_eq!(node.security().whitelist().mode(), WhitelistMode::Authentication);
    assert!(!node.security().is_awaiting_enroll());
    assert!(!node.security().lock().actuator().opened());

    let responses = world.borrow().payloads_on(&topics().enroll_response());
    assert_eq!(responses.len(), 1);
    let response: AccessEnvelope = protocol::decode(&responses[0]).unwrap();
    assert_eq!(
        response,
        AccessEnvelope::EnrollResponse {
            id,
            credential: uid(&[0xAA, 0xBB]),
        }
    );
    assert!(statuses(&world).is_empty());
    assert_eq!(enrolled(node), vec![uid(&[0xAA, 0xBB])]);
}

#[test]
fn test_second_enroll_request_owns_the_scan() {
    let world = world();
    let mut now = 0;
    let mut node = operational(MemoryStorage::default(), &world, &mut now);

    let first = CorrelationId::try_from("req-1").unwrap();
    let second = CorrelationId::try_from("req-2").unwrap();
    inject(&world, Route::AccessControl, &AccessEnvelope::EnrollRequest { id: first });
    tick_once(&mut node, &mut now);
    inject(&world, Route::AccessControl, &AccessEnvelope::EnrollRequest { id: second.clone() });
    tick_once(&mut node, &mut now);
    assert_eq!(node.security().whitelist().correlation_id(), "req-2");

    node.security_mut().reader_mut().present(uid(&[0x5A]));
    tick_once(&mut node, &mut now);
    tick_once(&mut node, &mut now);

    let responses = world.borrow().payloads_on(&topics().enroll_response());
    assert_eq!(responses.len(), 1);
    let response: AccessEnvelope = protocol::decode(&responses[0]).unwrap();
    assert_eq!(
        response,
        AccessEnvelope::EnrollResponse {
            id: second,
            credential: uid(&[0x5A]),
        }
    );
    assert_eq!(enrolled(node), vec![uid(&[0x5A])]);
}

#[test]
fn test_known_card_completes_at_odd_tick_spacing() {
    let card = uid(&[0x04, 0xA2]);
    let mut storage = MemoryStorage::default();
    assert!(WhitelistStore::new(&mut storage).insert(&card));

    let world = world();
    let mut now = 0;
    let mut node = operational(storage, &world, &mut now);

    node.security_mut().reader_mut().present(card);
    let scanned_at = now;
    node.tick(now);
    while node.security().is_awaiting_auth() && now < scanned_at + 10_000 {
        now += 7;
        node.tick(now);
    }

    assert_eq!(node.security().lock_state(), LockState::Locked);
    assert_eq!(
        node.security().transaction(),
        Transaction::Resolved {
            kind: TransactionKind::Authentication,
            resolution: Resolution::Completed,
        }
    );
}

#[test]
fn test_known_card_runs_full_lock_cycle() {
    let card = uid(&[0x04, 0xA2, 0x19, 0x7F]);
    let mut storage = MemoryStorage::default();
    assert!(WhitelistStore::new(&mut storage).insert(&card));

    let world = world();
    let mut now = 0;
    let mut node = operational(storage, &world, &mut now);

    node.security_mut().reader_mut().present(card);
    let scanned_at = now;
    tick_once(&mut node, &mut now);
    assert!(node.security().is_awaiting_auth());
    assert!(node.security().lock().actuator().is_open());
    assert_eq!(node.security().lock_state(), LockState::Unlocking);

    tick_until(&mut node, &mut now, scanned_at + ACT_DELAY_MS + HOLD_MS + ACT_DELAY_MS);

    assert_eq!(node.security().lock_state(), LockState::Locked);
    assert!(!node.security().lock().actuator().is_open());
    assert_eq!(
        node.security().transaction(),
        Transaction::Resolved {
            kind: TransactionKind::Authentication,
            resolution: Resolution::Completed,
        }
    );
    assert_eq!(statuses(&world), vec!["true".to_string()]);
}

#[test]
fn test_enrollment_window_times_out() {
    let world = world();
    let mut now = 0;
    let mut node = operational(MemoryStorage::default(), &world, &mut now);

    let opened_at = now;
    let id = CorrelationId::try_from("req-2").unwrap();
    inject(&world, Route::AccessControl, &AccessEnvelope::EnrollRequest { id });
    tick_once(&mut node, &mut now);
    assert!(node.security().is_awaiting_enroll());

    tick_until(&mut node, &mut now, opened_at + 5001);

    assert_eq!(node.security().whitelist().mode(), WhitelistMode::Authentication);
    assert!(!node.security().is_awaiting_enroll());
    assert_eq!(
        node.security().transaction(),
        Transaction::Resolved {
            kind: TransactionKind::Enrollment,
            resolution: Resolution::TimedOut,
        }
    );
    assert!(world.borrow().payloads_on(&topics().enroll_response()).is_empty());
    assert!(enrolled(node).is_empty());
}

#[test]
fn test_revoking_absent_card_changes_nothing() {
    let world = world();
    let mut now = 0;
    let mut node = operational(MemoryStorage::default(), &world, &mut now);
    let image = node.storage().image().to_vec();
    let commits = node.storage().commits();

    inject(
        &world,
        Route::AccessControl,
        &AccessEnvelope::RevokeRequest {
            credential: uid(&[0x0F]),
        },
    );
    assert_eq!(tick_once(&mut node, &mut now), Control::Continue);

    assert_eq!(node.storage().image(), &image[..]);
    assert_eq!(node.storage().commits(), commits);
}

#[test]
fn test_revoked_card_is_denied() {
    let card = uid(&[0x10, 0x20]);
    let mut storage = MemoryStorage::default();
    assert!(WhitelistStore::new(&mut storage).insert(&card));

    let world = world();
    let mut now = 0;
    let mut node = operational(storage, &world, &mut now);

    inject(
        &world,
        Route::AccessControl,
        &AccessEnvelope::RevokeRequest {
            credential: card.clone(),
        },
    );
    tick_once(&mut node, &mut now);
    node.security_mut().reader_mut().present(card);
    tick_once(&mut node, &mut now);
    tick_once(&mut node, &mut now);

    assert!(!node.security().lock().actuator().opened());
    assert_eq!(statuses(&world), vec!["false".to_string()]);
    assert!(enrolled(node).is_empty());
}

#[test]
fn test_provisioning_persists_and_attaches() {
    let world = world();
    let mut now = 0;
    let node = operational(MemoryStorage::default(), &world, &mut now);

    assert_eq!(DeviceConfig::load(node.storage()), Some(device_config()));
    assert_eq!(node.device_config(), Some(&device_config()));

    let world = world.borrow();
    assert_eq!(world.client_id.as_deref(), Some(DEVICE_ID));
    assert_eq!(world.subscriptions, topics().subscriptions());

    let snapshots = world.payloads_on(&topics().relay_snapshot());
    assert_eq!(snapshots.len(), 1);
    let snapshot: RelayStateSync = protocol::decode(&snapshots[0]).unwrap();
    assert_eq!(snapshot, RelayStateSync::default());
}

#[test]
fn test_waits_for_provisioning() {
    let world = world();
    let mut now = 0;
    let mut node = boot(
        MemoryStorage::default(),
        ScriptedProvisioner::new(device_config(), 4),
        &world,
    );

    for _ in 0..4 {
        tick_once(&mut node, &mut now);
        assert_eq!(node.state(), DeviceState::AwaitProvisioning);
    }
    assert_eq!(world.borrow().networks_built, 0);

    tick_once(&mut node, &mut now);
    assert_eq!(node.state(), DeviceState::JoinNetwork);
}

#[test]
fn test_unprovisioned_node_reads_storage_once() {
    let world = world();
    let mut now = 0;
    let mut node = boot(
        MemoryStorage::default(),
        ScriptedProvisioner::new(device_config(), 50),
        &world,
    );

    tick_once(&mut node, &mut now);
    let reads = node.storage().reads();
    for _ in 0..40 {
        tick_once(&mut node, &mut now);
    }
    assert_eq!(node.state(), DeviceState::AwaitProvisioning);
    assert_eq!(node.storage().reads(), reads);

    let end = now + 20 * STEP_MS;
    tick_until(&mut node, &mut now, end);
    assert_eq!(node.state(), DeviceState::Operational);
}

#[test]
fn test_incomplete_config_is_ignored() {
    let world = world();
    let mut now = 0;
    let config = DeviceConfig {
        device_id: String::new(),
        ..device_config()
    };
    let mut node = boot(MemoryStorage::default(), ScriptedProvisioner::new(config, 0), &world);

    tick_until(&mut node, &mut now, 100);

    assert_eq!(node.state(), DeviceState::AwaitProvisioning);
    assert_eq!(DeviceConfig::load(node.storage()), None);
    assert_eq!(world.borrow().networks_built, 0);
}

#[test]
fn test_stored_config_skips_provisioning() {
    let mut storage = MemoryStorage::default();
    device_config().save(&mut storage).unwrap();

    let world = world();
    let mut now = 0;
    let mut node = boot(storage, ScriptedProvisioner::default(), &world);
    for _ in 0..3 {
        tick_once(&mut node, &mut now);
    }

    assert_eq!(node.state(), DeviceState::Operational);
}

#[test]
fn test_waits_for_network() {
    let world = world();
    world.borrow_mut().network_up = false;
    let mut now = 0;
    let mut node = boot(
        MemoryStorage::default(),
        ScriptedProvisioner::new(device_config(), 0),
        &world,
    );

    tick_until(&mut node, &mut now, 200);
    assert_eq!(node.state(), DeviceState::JoinNetwork);

    world.borrow_mut().network_up = true;
    tick_once(&mut node, &mut now);
    tick_once(&mut node, &mut now);
    assert_eq!(node.state(), DeviceState::Operational);
}

#[test]
fn test_network_loss_rebuilds_session() {
    let world = world();
    let mut now = 0;
    let mut node = operational(MemoryStorage::default(), &world, &mut now);

    world.borrow_mut().network_up = false;
    tick_once(&mut node, &mut now);
    assert_eq!(node.state(), DeviceState::AwaitProvisioning);
    assert_eq!(node.device_config(), None);

    world.borrow_mut().network_up = true;
    for _ in 0..3 {
        tick_once(&mut node, &mut now);
    }
    assert_eq!(node.state(), DeviceState::Operational);
    assert_eq!(world.borrow().networks_built, 2);
    assert_eq!(world.borrow().brokers_built, 2);
}

#[test]
fn test_broker_loss_rejoins_and_resets_security() {
    let world = world();
    let mut now = 0;
    let mut node = operational(MemoryStorage::default(), &world, &mut now);

    let id = CorrelationId::try_from("req-3").unwrap();
    inject(&world, Route::AccessControl, &AccessEnvelope::EnrollRequest { id });
    tick_once(&mut node, &mut now);
    assert!(node.security().is_awaiting_enroll());

    world.borrow_mut().broker_up = false;
    tick_once(&mut node, &mut now);
    assert_eq!(node.state(), DeviceState::JoinBroker);

    let end = now + 100;
    tick_until(&mut node, &mut now, end);
    assert_eq!(node.state(), DeviceState::JoinBroker);

    world.borrow_mut().broker_up = true;
    tick_once(&mut node, &mut now);
    assert_eq!(node.state(), DeviceState::Operational);
    assert_eq!(node.security().transaction(), Transaction::Idle);
    assert_eq!(node.security().whitelist().mode(), WhitelistMode::Authentication);

    // Subscribed again on the new attach.
    assert_eq!(world.borrow().subscriptions.len(), 2 * Route::ALL.len());
    assert_eq!(world.borrow().brokers_built, 1);
}

#[test]
fn test_early_messages_are_dropped() {
    let world = world();
    world.borrow_mut().broker_up = false;
    let mut now = 0;
    let mut node = boot(
        MemoryStorage::default(),
        ScriptedProvisioner::new(device_config(), 0),
        &world,
    );
    tick_once(&mut node, &mut now);
    tick_once(&mut node, &mut now);
    assert_eq!(node.state(), DeviceState::JoinBroker);

    inject(&world, Route::ActuatorControl, &RelayState { kind: 1, port: 2, on: true });
    tick_once(&mut node, &mut now);

    world.borrow_mut().broker_up = true;
    tick_once(&mut node, &mut now);
    tick_once(&mut node, &mut now);
    assert_eq!(node.state(), DeviceState::Operational);
    assert!(node.relay().snapshot().relays.is_empty());
}

#[test]
fn test_wifi_update_persists_and_restarts() {
    let world = world();
    let mut now = 0;
    let mut node = operational(MemoryStorage::default(), &world, &mut now);

    inject(
        &world,
        Route::CredentialUpdate,
        &WifiCredentials {
            ssid: "lab-5g".into(),
            password: "correct horse".into(),
        },
    );
    assert_eq!(tick_once(&mut node, &mut now), Control::Restart);

    let stored = DeviceConfig::load(node.storage()).unwrap();
    assert_eq!(stored.wifi.ssid, "lab-5g");
    assert_eq!(stored.wifi.password, "correct horse");
    assert_eq!(stored.device_id, DEVICE_ID);
}

#[test]
fn test_config_update_is_persisted() {
    let world = world();
    let mut now = 0;
    let mut node = operational(MemoryStorage::default(), &world, &mut now);

    let light = LightModule { id: 1, port: 3 };
    inject(&world, Route::ConfigUpdate, &ConfigUpdate::Light(light));
    assert_eq!(tick_once(&mut node, &mut now), Control::Continue);
    assert_eq!(node.modules().lights.as_slice(), &[light]);

    let mut storage = node.into_storage();
    let reloaded = ModuleConfig::load_or_default(&mut storage);
    assert_eq!(reloaded.lights.as_slice(), &[light]);
}

#[test]
fn test_sensor_modules_follow_config_updates() {
    let world = world();
    let mut now = 0;
    let mut node = operational(MemoryStorage::default(), &world, &mut now);

    let light = LightModule { id: 4, port: 33 };
    let pir = MotionModule {
        id: 2,
        port: 6,
        relay_kind: 1,
        relay_port: 5,
    };
    {
        let mut w = world.borrow_mut();
        w.light.insert(4, 640);
        w.motion.insert(2, true);
    }
    inject(&world, Route::ConfigUpdate, &ConfigUpdate::Light(light));
    inject(&world, Route::ConfigUpdate, &ConfigUpdate::Motion(pir));
    let end = now + READ_INTERVAL_MS;
    tick_until(&mut node, &mut now, end);

    let samples = world.borrow().payloads_on(&topics().light());
    assert_eq!(samples.len(), 1);
    assert_eq!(
        protocol::decode::<LightData>(&samples[0]).unwrap(),
        LightData { id: 4, value: 640 }
    );

    let commands: Vec<RelayState> = world
        .borrow()
        .payloads_on(&topics().topic(Route::ActuatorControl))
        .iter()
        .map(|p| protocol::decode(p).unwrap())
        .collect();
    assert_eq!(
        commands,
        vec![RelayState {
            kind: 1,
            port: 5,
            on: true
        }]
    );
}

#[test]
fn test_config_removal_restarts() {
    let world = world();
    let mut now = 0;
    let mut node = operational(MemoryStorage::default(), &world, &mut now);

    inject(&world, Route::ConfigUpdate, &ConfigUpdate::Light(LightModule { id: 4, port: 1 }));
    tick_once(&mut node, &mut now);

    inject(
        &world,
        Route::ConfigRemoval,
        &ConfigRemoval {
            kind: ModuleKind::Light,
            id: 4,
        },
    );
    assert_eq!(tick_once(&mut node, &mut now), Control::Restart);
    assert!(node.modules().lights.is_empty());

    let mut storage = node.into_storage();
    assert!(ModuleConfig::load_or_default(&mut storage).lights.is_empty());
}

#[test]
fn test_removing_unknown_module_is_dropped() {
    let world = world();
    let mut now = 0;
    let mut node = operational(MemoryStorage::default(), &world, &mut now);

    inject(
        &world,
        Route::ConfigRemoval,
        &ConfigRemoval {
            kind: ModuleKind::Motion,
            id: 9,
        },
    );
    assert_eq!(tick_once(&mut node, &mut now), Control::Continue);
}

#[test]
fn test_relay_command_reaches_board() {
    let world = world();
    let mut now = 0;
    let mut node = operational(MemoryStorage::default(), &world, &mut now);

    let state = RelayState { kind: 2, port: 5, on: true };
    inject(&world, Route::ActuatorControl, &state);
    tick_once(&mut node, &mut now);

    assert_eq!(node.relay().snapshot().relays, vec![state]);
    assert!(node.relay().polls > 0);
}

#[test]
fn test_factory_reset_wipes_and_restarts() {
    let card = uid(&[0x77; 10]);
    let mut storage = MemoryStorage::default();
    assert!(WhitelistStore::new(&mut storage).insert(&card));

    let world = world();
    let mut now = 0;
    let mut node = operational(storage, &world, &mut now);

    world
        .borrow_mut()
        .inbound
        .push_back((topics().topic(Route::FactoryReset), Vec::new()));
    // Queued behind the reset in the same poll; must not apply.
    inject(&world, Route::ActuatorControl, &RelayState { kind: 1, port: 1, on: true });
    assert_eq!(tick_once(&mut node, &mut now), Control::Restart);
    assert!(node.relay().snapshot().relays.is_empty());

    let storage = node.into_storage();
    assert!(storage.image().iter().all(|&b| b == 0));
    assert_eq!(DeviceConfig::load(&storage), None);

    let mut node = boot(storage, ScriptedProvisioner::default(), &world);
    let end = now + 100;
    tick_until(&mut node, &mut now, end);
    assert_eq!(node.state(), DeviceState::AwaitProvisioning);
    assert!(enrolled(node).is_empty());
}

#[test]
fn test_unknown_and_malformed_messages_are_ignored() {
    let world = world();
    let mut now = 0;
    let mut node = operational(MemoryStorage::default(), &world, &mut now);
    let image = node.storage().image().to_vec();

    {
        let mut world = world.borrow_mut();
        world
            .inbound
            .push_back(("devices/other-node/factory_reset".into(), Vec::new()));
        world
            .inbound
            .push_back((format!("devices/{}/unknown", DEVICE_ID), vec![1, 2, 3]));
        world
            .inbound
            .push_back((topics().topic(Route::ConfigUpdate), vec![0xFF, 0xFF, 0xFF]));
        world
            .inbound
            .push_back((topics().topic(Route::CredentialUpdate), vec![]));
    }
    assert_eq!(tick_once(&mut node, &mut now), Control::Continue);

    assert_eq!(node.storage().image(), &image[..]);
    assert_eq!(node.modules(), &ModuleConfig::default());
}
