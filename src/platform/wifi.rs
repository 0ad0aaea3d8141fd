//! Wi-Fi station and session factory

use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi};
use log::{debug, info};

use super::{backend, millis, EspBroker};
use crate::config::{BrokerConfig, WifiConfig};
use crate::error::{Error, Result};
use crate::lifecycle::{Connectivity, Network};

/// Minimum gap between association attempts
const RETRY_MS: u64 = 5000;

pub struct EspConnectivity {
    sysloop: EspSystemEventLoop,
    nvs: EspDefaultNvsPartition,
}

impl EspConnectivity {
    pub fn new(sysloop: EspSystemEventLoop, nvs: EspDefaultNvsPartition) -> Self {
        Self { sysloop, nvs }
    }
}

impl Connectivity for EspConnectivity {
    type Network = EspNetwork;
    type Broker = EspBroker;

    fn network(&mut self, wifi: &WifiConfig) -> Result<EspNetwork> {
        // The previous session, if any, was dropped before we got here.
        let modem = unsafe { Modem::new() };
        let mut driver =
            EspWifi::new(modem, self.sysloop.clone(), Some(self.nvs.clone())).map_err(backend)?;

        let ssid = wifi
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| Error::Backend(format!("ssid too long: {}", wifi.ssid)))?;
        let password = wifi
            .password
            .as_str()
            .try_into()
            .map_err(|_| Error::Backend("wifi password too long".into()))?;
        let auth_method = if wifi.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };

        driver
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid,
                password,
                auth_method,
                ..Default::default()
            }))
            .map_err(backend)?;
        driver.start().map_err(backend)?;
        info!("Wi-Fi started, joining {}", wifi.ssid);

        Ok(EspNetwork {
            wifi: driver,
            last_attempt: None,
        })
    }

    fn broker(&mut self, broker: &BrokerConfig, client_id: &str) -> Result<EspBroker> {
        EspBroker::connect(broker, client_id)
    }
}

pub struct EspNetwork {
    wifi: EspWifi<'static>,
    last_attempt: Option<u64>,
}

impl Network for EspNetwork {
    fn poll(&mut self) -> bool {
        if self.is_connected() {
            return true;
        }

        let now = millis();
        if matches!(self.last_attempt, Some(at) if now.saturating_sub(at) < RETRY_MS) {
            return false;
        }
        self.last_attempt = Some(now);
        if let Err(e) = self.wifi.connect() {
            debug!("Wi-Fi connect: {}", e);
        }
        false
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }
}
