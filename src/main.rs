//! Latchkey node
//!
//! On the ESP32 this is the firmware: bring up the peripherals, hand them to
//! the lifecycle and tick it forever. On a host it runs a short scripted
//! session against the in-memory parts: provision, attach, enroll a tag
//! remotely, use it, revoke it.

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    use esp_idf_hal::delay::FreeRtos;
    use esp_idf_hal::gpio::{AnyIOPin, IOPin, OutputPin};
    use esp_idf_hal::ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution};
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_hal::uart::{config::Config as UartConfig, UartDriver};
    use esp_idf_hal::units::FromValueType;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::log::EspLogger;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use latchkey::platform::{
        millis, ConsoleProvisioner, EspConnectivity, EspPlatform, GpioSensorBus, NvsStorage,
        ServoActuator, UartRelayBus, UartTagReader,
    };
    use latchkey::sensors::SensorManager;
    use latchkey::{Control, DeviceLifecycle, Parts, SecurityConfig};
    use log::{info, warn};

    esp_idf_sys::link_patches();
    EspLogger::initialize_default();

    info!("Latchkey v{} starting", env!("CARGO_PKG_VERSION"));

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let storage = NvsStorage::new(nvs.clone())?;

    // Reader module on UART2 (GPIO17 TX, GPIO18 RX)
    let reader_uart = UartDriver::new(
        peripherals.uart2,
        pins.gpio17,
        pins.gpio18,
        Option::<AnyIOPin>::None,
        Option::<AnyIOPin>::None,
        &UartConfig::default().baudrate(9600.Hz()),
    )?;

    // Relay board on UART1 (GPIO4 TX, GPIO5 RX)
    let relay_uart = UartDriver::new(
        peripherals.uart1,
        pins.gpio4,
        pins.gpio5,
        Option::<AnyIOPin>::None,
        Option::<AnyIOPin>::None,
        &UartConfig::default().baudrate(115_200.Hz()),
    )?;

    // Pairing tool on the console UART
    let console_uart = UartDriver::new(
        peripherals.uart0,
        pins.gpio43,
        pins.gpio44,
        Option::<AnyIOPin>::None,
        Option::<AnyIOPin>::None,
        &UartConfig::default().baudrate(115_200.Hz()),
    )?;

    // Latch servo on GPIO14
    let servo_timer = LedcTimerDriver::new(
        peripherals.ledc.timer0,
        &TimerConfig::default()
            .frequency(50.Hz())
            .resolution(Resolution::Bits14),
    )?;
    let servo = LedcDriver::new(peripherals.ledc.channel0, servo_timer, pins.gpio14)?;

    // PIRs on GPIO6/7, buzzer on GPIO15; ports are the GPIO numbers
    let sensor_bus = GpioSensorBus::new()
        .with_motion_input(6, pins.gpio6.downgrade())?
        .with_motion_input(7, pins.gpio7.downgrade())?
        .with_buzzer(15, pins.gpio15.downgrade_output())?;

    let parts: Parts<EspPlatform> = Parts {
        storage,
        reader: UartTagReader::new(reader_uart),
        actuator: ServoActuator::new(servo),
        provisioner: ConsoleProvisioner::new(console_uart),
        connectivity: EspConnectivity::new(sysloop, nvs),
        relay: UartRelayBus::new(relay_uart),
        sensors: SensorManager::new(sensor_bus),
    };
    let mut node = DeviceLifecycle::new(parts, SecurityConfig::default());

    info!("Entering main loop");

    loop {
        if node.tick(millis()) == Control::Restart {
            warn!("Restarting");
            // Let the log drain.
            FreeRtos::delay_ms(100);
            esp_idf_hal::reset::restart();
        }

        // Small delay to prevent busy-spinning
        FreeRtos::delay_ms(10);
    }
}

#[cfg(not(target_os = "espidf"))]
fn main() -> anyhow::Result<()> {
    sim::run()
}

#[cfg(not(target_os = "espidf"))]
mod sim {
    use std::cell::RefCell;
    use std::rc::Rc;

    use anyhow::anyhow;
    use latchkey::config::{BrokerConfig, DeviceConfig, WifiConfig};
    use latchkey::protocol::{self, AccessEnvelope, CorrelationId, Route, Topics, STATUS_TOPIC};
    use latchkey::sim::{ScriptedProvisioner, SimHandle, SimPlatform, SimWorld};
    use latchkey::storage::MemoryStorage;
    use latchkey::{Control, Credential, DeviceLifecycle, SecurityConfig};
    use log::info;

    const DEVICE_ID: &str = "latchkey-sim";
    const TICK_MS: u64 = 10;

    type Node = DeviceLifecycle<SimPlatform>;

    fn boot(storage: MemoryStorage, provisioner: ScriptedProvisioner, world: &SimHandle) -> Node {
        DeviceLifecycle::new(
            SimPlatform::parts(storage, provisioner, world),
            SecurityConfig::default(),
        )
    }

    /// Tick for `ms` of simulated time, rebooting on request
    fn run_for(mut node: Node, world: &SimHandle, now: &mut u64, ms: u64) -> Node {
        let end = *now + ms;
        while *now < end {
            if node.tick(*now) == Control::Restart {
                info!("Restart requested, rebooting on the same image");
                node = boot(node.into_storage(), ScriptedProvisioner::default(), world);
            }
            *now += TICK_MS;
        }
        node
    }

    fn send(world: &SimHandle, topic: String, message: &AccessEnvelope) -> anyhow::Result<()> {
        let payload = protocol::encode(message)?;
        world.borrow_mut().inbound.push_back((topic, payload));
        Ok(())
    }

    pub fn run() -> anyhow::Result<()> {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

        info!("Latchkey v{} host simulation", env!("CARGO_PKG_VERSION"));

        let world: SimHandle = Rc::new(RefCell::new(SimWorld {
            network_up: true,
            broker_up: true,
            ..Default::default()
        }));
        let config = DeviceConfig {
            device_id: DEVICE_ID.into(),
            wifi: WifiConfig {
                ssid: "bench".into(),
                password: "bench-password".into(),
            },
            broker: BrokerConfig {
                host: "broker.local".into(),
                ..Default::default()
            },
        };
        let topics = Topics::new(DEVICE_ID);
        let access = topics.topic(Route::AccessControl);
        let tag = Credential::from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]).ok_or_else(|| anyhow!("bad tag"))?;
        let stranger = Credential::from_slice(&[0x01, 0x02, 0x03, 0x04]).ok_or_else(|| anyhow!("bad tag"))?;
        let mut now = 0;

        let mut node = boot(MemoryStorage::default(), ScriptedProvisioner::new(config, 5), &world);
        node = run_for(node, &world, &mut now, 200);
        info!("Node is {:?}", node.state());

        let id = CorrelationId::try_from("sim-enroll-1").map_err(|_| anyhow!("correlation id too long"))?;
        send(&world, access.clone(), &AccessEnvelope::EnrollRequest { id })?;
        node = run_for(node, &world, &mut now, 50);
        node.security_mut().reader_mut().present(tag.clone());
        node = run_for(node, &world, &mut now, 50);

        node.security_mut().reader_mut().present(tag.clone());
        node = run_for(node, &world, &mut now, 6000);

        node.security_mut().reader_mut().present(stranger);
        node = run_for(node, &world, &mut now, 50);

        send(&world, access, &AccessEnvelope::RevokeRequest { credential: tag.clone() })?;
        node = run_for(node, &world, &mut now, 50);
        node.security_mut().reader_mut().present(tag);
        node = run_for(node, &world, &mut now, 50);

        let world = world.borrow();
        info!("Enrollment responses: {}", world.payloads_on(&topics.enroll_response()).len());
        for status in world.payloads_on(STATUS_TOPIC) {
            info!("Status: {}", String::from_utf8_lossy(&status));
        }
        info!("Lock ended {:?}", node.security().lock_state());
        Ok(())
    }
}
