//! Serial peripherals: tag reader, relay board, provisioning console

use esp_idf_hal::delay::NON_BLOCK;
use esp_idf_hal::uart::UartDriver;
use log::{debug, info, warn};

use super::millis;
use crate::config::DeviceConfig;
use crate::credential::{self, Credential};
use crate::lifecycle::{Provisioner, RelayBus};
use crate::protocol::{RelayState, RelayStateSync};
use crate::security::CredentialReader;

const STX: u8 = 0x02;
const ETX: u8 = 0x03;

/// The module repeats a held tag; the same UID is reported once per window
const DEBOUNCE_MS: u64 = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Idle,
    Length,
    Body(usize),
    End,
}

/// Reader module emitting `STX len uid.. ETX`
pub struct UartTagReader {
    uart: UartDriver<'static>,
    state: FrameState,
    frame: heapless::Vec<u8, { credential::MAX_LEN }>,
    last: Option<(Credential, u64)>,
}

impl UartTagReader {
    pub fn new(uart: UartDriver<'static>) -> Self {
        Self {
            uart,
            state: FrameState::Idle,
            frame: heapless::Vec::new(),
            last: None,
        }
    }

    /// Feed one byte; returns a UID when a frame closes
    fn feed(&mut self, byte: u8) -> Option<Credential> {
        let (next, uid) = match self.state {
            FrameState::Idle if byte == STX => {
                self.frame.clear();
                (FrameState::Length, None)
            }
            FrameState::Idle => (FrameState::Idle, None),
            FrameState::Length => match byte as usize {
                len @ 1..=credential::MAX_LEN => (FrameState::Body(len), None),
                _ => (FrameState::Idle, None),
            },
            FrameState::Body(left) => {
                // Capacity matches the accepted lengths.
                let _ = self.frame.push(byte);
                if left == 1 {
                    (FrameState::End, None)
                } else {
                    (FrameState::Body(left - 1), None)
                }
            }
            FrameState::End if byte == ETX => (FrameState::Idle, Credential::from_slice(&self.frame)),
            FrameState::End => {
                debug!("Reader frame missing ETX");
                (FrameState::Idle, None)
            }
        };
        self.state = next;
        uid
    }

    fn is_repeat(&self, uid: &Credential, now_ms: u64) -> bool {
        matches!(&self.last, Some((last, at)) if last == uid && now_ms.saturating_sub(*at) < DEBOUNCE_MS)
    }
}

impl CredentialReader for UartTagReader {
    fn scan(&mut self) -> Option<Credential> {
        let mut buf = [0u8; 32];
        let n = match self.uart.read(&mut buf, NON_BLOCK) {
            Ok(n) => n,
            Err(e) => {
                warn!("Reader UART: {}", e);
                return None;
            }
        };

        let mut found = None;
        for &byte in &buf[..n] {
            if let Some(uid) = self.feed(byte) {
                found = Some(uid);
            }
        }

        let uid = found?;
        let now = millis();
        if self.is_repeat(&uid, now) {
            // Refresh so a held tag stays suppressed.
            self.last = Some((uid, now));
            return None;
        }
        self.last = Some((uid.clone(), now));
        Some(uid)
    }
}

const RELAY_COMMAND: u8 = 0xA0;
const RELAY_ACK: u8 = 0xA1;
const RELAY_FRAME_LEN: usize = 4;

/// Relay board speaking `[op, kind, port, on]`
pub struct UartRelayBus {
    uart: UartDriver<'static>,
    rx: heapless::Vec<u8, RELAY_FRAME_LEN>,
    relays: Vec<RelayState>,
}

impl UartRelayBus {
    pub fn new(uart: UartDriver<'static>) -> Self {
        Self {
            uart,
            rx: heapless::Vec::new(),
            relays: Vec::new(),
        }
    }

    fn record(&mut self, state: RelayState) {
        match self
            .relays
            .iter_mut()
            .find(|r| r.kind == state.kind && r.port == state.port)
        {
            Some(relay) => relay.on = state.on,
            None => self.relays.push(state),
        }
    }
}

impl RelayBus for UartRelayBus {
    fn toggle(&mut self, state: RelayState) -> bool {
        let frame = [RELAY_COMMAND, state.kind, state.port, state.on as u8];
        match self.uart.write(&frame) {
            Ok(n) if n == frame.len() => true,
            Ok(n) => {
                warn!("Relay UART short write ({} of {})", n, frame.len());
                false
            }
            Err(e) => {
                warn!("Relay UART: {}", e);
                false
            }
        }
    }

    fn poll_responses(&mut self) {
        let mut buf = [0u8; 16];
        let n = match self.uart.read(&mut buf, NON_BLOCK) {
            Ok(n) => n,
            Err(e) => {
                warn!("Relay UART: {}", e);
                return;
            }
        };

        for &byte in &buf[..n] {
            if self.rx.is_empty() && byte != RELAY_ACK {
                continue;
            }
            let _ = self.rx.push(byte);
            if self.rx.is_full() {
                let state = RelayState {
                    kind: self.rx[1],
                    port: self.rx[2],
                    on: self.rx[3] != 0,
                };
                self.rx.clear();
                debug!("Relay {}:{} is {}", state.kind, state.port, state.on);
                self.record(state);
            }
        }
    }

    fn snapshot(&self) -> RelayStateSync {
        RelayStateSync {
            relays: self.relays.clone(),
        }
    }
}

const PROVISION_FRAME_MAX: usize = 512;

/// Pairing tool on the console UART sending one COBS-framed config
pub struct ConsoleProvisioner {
    uart: UartDriver<'static>,
    frame: heapless::Vec<u8, PROVISION_FRAME_MAX>,
}

impl ConsoleProvisioner {
    pub fn new(uart: UartDriver<'static>) -> Self {
        Self {
            uart,
            frame: heapless::Vec::new(),
        }
    }
}

impl Provisioner for ConsoleProvisioner {
    fn poll(&mut self) -> Option<DeviceConfig> {
        let mut buf = [0u8; 64];
        let n = self.uart.read(&mut buf, NON_BLOCK).ok()?;

        for &byte in &buf[..n] {
            if self.frame.push(byte).is_err() {
                warn!("Provisioning frame too long, discarding");
                self.frame.clear();
                continue;
            }
            if byte != 0x00 {
                continue;
            }
            let decoded = postcard::from_bytes_cobs::<DeviceConfig>(&mut self.frame);
            self.frame.clear();
            match decoded {
                Ok(config) => {
                    info!("Provisioning frame received for {}", config.device_id);
                    return Some(config);
                }
                Err(e) => warn!("Bad provisioning frame: {}", e),
            }
        }
        None
    }
}
