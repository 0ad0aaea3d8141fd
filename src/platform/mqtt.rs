//! MQTT session over the ESP-IDF client
//!
//! The client runs its own task and reports through a callback. The
//! callback only forwards events into a channel; everything else happens on
//! the main loop when the lifecycle polls.

use std::sync::mpsc::{self, Receiver, Sender};

use esp_idf_svc::mqtt::client::{EspMqttClient, EventPayload, MqttClientConfiguration, QoS};
use log::{debug, info, warn};

use super::backend;
use crate::config::BrokerConfig;
use crate::error::Result;
use crate::lifecycle::Broker;
use crate::protocol::Publisher;

enum BrokerEvent {
    Connected,
    Disconnected,
    Message(String, Vec<u8>),
}

pub struct EspBroker {
    client: EspMqttClient<'static>,
    events: Receiver<BrokerEvent>,
    connected: bool,
}

impl EspBroker {
    pub fn connect(config: &BrokerConfig, client_id: &str) -> Result<Self> {
        let url = format!("mqtt://{}:{}", config.host, config.port);
        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            username: (!config.username.is_empty()).then_some(config.username.as_str()),
            password: (!config.password.is_empty()).then_some(config.password.as_str()),
            ..Default::default()
        };

        let (tx, events) = mpsc::channel();
        let client = EspMqttClient::new_cb(&url, &conf, move |event| forward(&tx, event.payload()))
            .map_err(backend)?;
        info!("MQTT client for {} as {}", url, client_id);

        Ok(Self {
            client,
            events,
            connected: false,
        })
    }
}

fn forward(tx: &Sender<BrokerEvent>, payload: EventPayload<'_, esp_idf_svc::sys::EspError>) {
    let event = match payload {
        EventPayload::Connected(_) => BrokerEvent::Connected,
        EventPayload::Disconnected => BrokerEvent::Disconnected,
        EventPayload::Received {
            topic: Some(topic),
            data,
            ..
        } => BrokerEvent::Message(topic.to_owned(), data.to_vec()),
        _ => return,
    };
    // The receiver is gone only while the session is being dropped.
    let _ = tx.send(event);
}

impl Publisher for EspBroker {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        if !self.connected {
            return false;
        }
        match self.client.enqueue(topic, QoS::AtLeastOnce, false, payload) {
            Ok(_) => true,
            Err(e) => {
                warn!("Publish to {} failed: {}", topic, e);
                false
            }
        }
    }
}

impl Broker for EspBroker {
    fn poll(&mut self, deliver: &mut dyn FnMut(&str, &[u8])) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                BrokerEvent::Connected => {
                    info!("MQTT connected");
                    self.connected = true;
                }
                BrokerEvent::Disconnected => {
                    warn!("MQTT disconnected");
                    self.connected = false;
                }
                BrokerEvent::Message(topic, payload) => {
                    debug!("MQTT {} ({} bytes)", topic, payload.len());
                    deliver(&topic, &payload);
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn subscribe(&mut self, topic: &str) -> bool {
        match self.client.subscribe(topic, QoS::AtLeastOnce) {
            Ok(_) => true,
            Err(e) => {
                warn!("Subscribe to {} failed: {}", topic, e);
                false
            }
        }
    }
}
