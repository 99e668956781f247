//! Sans-IO link state machine.
//!
//! [`LinkCore`] owns the encryption context, the receive accumulator and
//! the single pending exchange of one pump session. It never performs I/O:
//! every input returns the [`Action`]s the caller must carry out, in order.

use crate::config::LinkConfig;
use crate::error::{LinkError, PairingFault};
use crate::state::PersistedPumpState;
use bytes::Bytes;
use danalink_protocol::packet::{handshake, is_history_opcode, notify, opcode};
use danalink_protocol::{
    password_from_time_information, CommandRegistry, EncryptionContext, Encoder, Frame, Generation, Packet,
    PacketType, ParseOutcome, ParsedResponse, PinPair, ReceiveAccumulator,
};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Acknowledgement pattern ("OK") at message offset 2.
const OK_PATTERN: [u8; 2] = [0x4F, 0x4B];
/// Pump identity rejection ("PUMP").
const PUMP_PATTERN: [u8; 4] = [0x50, 0x55, 0x4D, 0x50];
/// Pump busy ("BUSY").
const BUSY_PATTERN: [u8; 4] = [0x42, 0x55, 0x53, 0x59];

/// Deadline cap for timeouts too long to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Status byte that accepts a passkey or pump check.
const STATUS_ACCEPTED: u8 = 0x05;

/// Connection state of a link session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    NegotiatingEncryption,
    AwaitingPincode,
    Connected,
    Disconnecting,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::NegotiatingEncryption => "negotiating",
            LinkState::AwaitingPincode => "awaiting-pincode",
            LinkState::Connected => "connected",
            LinkState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Events published by a link session.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    StateChanged(LinkState),
    GenerationNegotiated(Generation),
    HardwareIdentified { hardware_model: u8, protocol: u8 },
    /// RSv3 pump is showing a pin pair that must be passed to
    /// `complete_pairing`.
    PincodeRequired,
    /// New pairing material to persist.
    PairingKeysIssued {
        pairing_key: Vec<u8>,
        random_pairing_key: Vec<u8>,
        random_sync_key: u8,
    },
    Notify(ParsedResponse),
    Fault(PairingFault),
}

/// Classification of the pump-check response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// 4-byte acknowledgement: first-level only.
    Default,
    /// 9-byte acknowledgement: RSv3 rolling-sync second level.
    Rsv3 { hardware_model: u8, protocol: u8 },
    /// 14-byte acknowledgement: BLE5 three-key second level.
    Ble5 {
        hardware_model: u8,
        protocol: u8,
        key_material: [u8; 6],
    },
    /// BLE5 acknowledgement carrying a zero key byte.
    InvalidSessionKeys,
    DeviceBusy,
    DeviceIdentity,
    SerialMismatch,
}

/// Classifies a decoded pump-check response given as `[type, opcode, payload..]`.
pub fn classify_handshake_response(message: &[u8]) -> HandshakeOutcome {
    let has = |pattern: &[u8]| message.get(2..2 + pattern.len()) == Some(pattern);

    match message.len() {
        4 if has(&OK_PATTERN) => HandshakeOutcome::Default,
        9 if has(&OK_PATTERN) => HandshakeOutcome::Rsv3 {
            hardware_model: message[5],
            protocol: message[7],
        },
        14 if has(&OK_PATTERN) => {
            let mut key_material = [0u8; 6];
            key_material.copy_from_slice(&message[8..14]);
            if key_material.contains(&0) {
                HandshakeOutcome::InvalidSessionKeys
            } else {
                HandshakeOutcome::Ble5 {
                    hardware_model: message[5],
                    protocol: message[7],
                    key_material,
                }
            }
        }
        6 if has(&PUMP_PATTERN) => HandshakeOutcome::DeviceIdentity,
        6 if has(&BUSY_PATTERN) => HandshakeOutcome::DeviceBusy,
        _ => HandshakeOutcome::SerialMismatch,
    }
}

/// Work the I/O layer must perform after feeding the core.
#[derive(Debug)]
pub enum Action {
    /// Write these chunks to the transport, in order.
    Write(Vec<Bytes>),
    Emit(LinkEvent),
    /// Tear down the transport connection.
    Disconnect,
}

/// Completion handle for a request returned by [`LinkCore::begin_request`].
#[derive(Debug)]
pub struct Ticket {
    pub id: u64,
    pub opcode: u8,
    pub deadline: Instant,
    pub receiver: oneshot::Receiver<Result<ParsedResponse, LinkError>>,
}

/// The single in-flight request.
///
/// Resolving consumes the exchange, so it completes at most once.
#[derive(Debug)]
struct PendingExchange {
    id: u64,
    opcode: u8,
    payload: Bytes,
    responder: oneshot::Sender<Result<ParsedResponse, LinkError>>,
}

impl PendingExchange {
    fn resolve(self, result: Result<ParsedResponse, LinkError>) {
        if self.responder.send(result).is_err() {
            tracing::debug!("Request {:#04x} resolved after its caller went away", self.opcode);
        }
    }
}

/// Link session state machine.
#[derive(Debug)]
pub struct LinkCore {
    config: LinkConfig,
    write_limit: usize,
    state: LinkState,
    crypto: EncryptionContext,
    accumulator: ReceiveAccumulator,
    registry: CommandRegistry,
    pending: Option<PendingExchange>,
    next_id: u64,
    history_mode: bool,
    dose_outstanding: bool,
    peripheral_id: Option<String>,
    hardware_model: Option<u8>,
    protocol: Option<u8>,
    easy_mode: Option<bool>,
    unit_ud: Option<bool>,
    device_password: Option<u16>,
    last_failure: Option<LinkError>,
}

impl LinkCore {
    /// Creates a core for the pump described by `stored`.
    ///
    /// Pairing keys from a previous session are installed so the next
    /// handshake can skip pairing.
    pub fn new(stored: &PersistedPumpState, config: LinkConfig, registry: CommandRegistry) -> Result<Self, LinkError> {
        let mut crypto = EncryptionContext::new(&stored.device_name)?;
        if stored.is_bonded() {
            crypto.set_pairing_keys(&stored.pairing_key, &stored.random_pairing_key, stored.random_sync_key);
        }

        Ok(Self {
            write_limit: config.write_limit.max(1),
            device_password: stored.device_password.or(config.device_password),
            config,
            state: LinkState::Disconnected,
            crypto,
            accumulator: ReceiveAccumulator::new(),
            registry,
            pending: None,
            next_id: 1,
            history_mode: false,
            dose_outstanding: false,
            peripheral_id: stored.peripheral_id.clone(),
            hardware_model: stored.hardware_model,
            protocol: stored.protocol,
            easy_mode: stored.easy_mode,
            unit_ud: stored.unit_ud,
            last_failure: None,
        })
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn generation(&self) -> Generation {
        self.crypto.generation()
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Caps outbound chunks at `limit` bytes (at least 1).
    pub fn set_write_limit(&mut self, limit: usize) {
        self.write_limit = limit.max(1);
    }

    /// Returns whether a request is in flight.
    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    pub fn history_mode(&self) -> bool {
        self.history_mode
    }

    /// Returns whether a bolus has started and not yet completed.
    pub fn dose_outstanding(&self) -> bool {
        self.dose_outstanding
    }

    /// Takes the error that ended the last handshake.
    pub fn take_failure(&mut self) -> Option<LinkError> {
        self.last_failure.take()
    }

    /// Captures the state the host should persist.
    pub fn snapshot(&self) -> PersistedPumpState {
        let secrets = self.crypto.secrets();
        PersistedPumpState {
            device_name: self.crypto.device_name().to_string(),
            peripheral_id: self.peripheral_id.clone(),
            generation: Some(self.crypto.generation()),
            hardware_model: self.hardware_model,
            protocol: self.protocol,
            pairing_key: secrets.pairing_key.clone(),
            random_pairing_key: secrets.random_pairing_key.clone(),
            random_sync_key: self.crypto.stored_sync_key(),
            device_password: self.device_password,
            easy_mode: self.easy_mode,
            unit_ud: self.unit_ud,
        }
    }

    /// Starts a new connection attempt, dropping all per-session state.
    pub fn begin_connect(&mut self) -> Vec<Action> {
        self.crypto.reset_session();
        self.accumulator.clear();
        self.history_mode = false;
        self.dose_outstanding = false;
        self.last_failure = None;
        self.fail_pending(LinkError::ConnectionClosed);
        vec![self.transition(LinkState::Connecting)]
    }

    /// Transport is up: send the pump check.
    pub fn on_transport_connected(&mut self, peripheral_id: Option<String>) -> Result<Vec<Action>, LinkError> {
        if peripheral_id.is_some() {
            self.peripheral_id = peripheral_id;
        }
        let mut actions = vec![self.transition(LinkState::NegotiatingEncryption)];
        actions.push(self.handshake_write(handshake::PUMP_CHECK, &[])?);
        Ok(actions)
    }

    /// Feeds bytes received from the transport.
    pub fn on_notification(&mut self, data: &[u8]) -> Vec<Action> {
        let mut bytes = data.to_vec();
        if self.state == LinkState::Connected && self.crypto.generation().has_second_level() {
            if let Err(e) = self.crypto.decode_session(&mut bytes) {
                tracing::warn!("Dropping {} bytes: {}", bytes.len(), e);
                return Vec::new();
            }
        }

        self.accumulator.extend(&bytes);
        let mut actions = Vec::new();
        loop {
            match self.accumulator.decode_frame() {
                ParseOutcome::Frame(frame) => actions.extend(self.on_frame(frame)),
                ParseOutcome::Incomplete => break,
                ParseOutcome::Invalid(e) => tracing::warn!("Discarding receive buffer: {}", e),
            }
        }
        actions
    }

    fn on_frame(&mut self, frame: Frame) -> Vec<Action> {
        let packet = match self.crypto.decode_frame(&frame) {
            Ok(packet) => packet,
            Err(source) => {
                let raw = frame.encode().map(|b| b.to_vec()).unwrap_or_default();
                tracing::warn!("Failed to decode frame {}: {}", hex::encode(&raw), source);
                if let Some(pending) = self.pending.take() {
                    pending.resolve(Err(LinkError::Decode { source, raw }));
                }
                return Vec::new();
            }
        };

        tracing::debug!(
            "Received {} {:#04x} payload={}",
            packet.packet_type,
            packet.opcode,
            hex::encode(&packet.payload)
        );

        match packet.packet_type {
            PacketType::EncryptionResponse => self.on_handshake(&packet).unwrap_or_else(|e| self.abort(e)),
            PacketType::Response | PacketType::Notify => self.on_message(&packet),
            PacketType::EncryptionRequest | PacketType::Command => {
                tracing::warn!("Ignoring host-bound {} frame", packet.packet_type);
                Vec::new()
            }
        }
    }

    fn on_message(&mut self, packet: &Packet) -> Vec<Action> {
        let parsed = match self.registry.parse(packet) {
            Ok(parsed) => parsed,
            Err(source) => {
                let raw = packet.to_message();
                tracing::warn!("Failed to parse {}: {}", hex::encode(&raw), source);
                if packet.packet_type != PacketType::Response {
                    return Vec::new();
                }
                if let Some(pending) = self.take_pending_for(packet.opcode) {
                    pending.resolve(Err(LinkError::Decode { source, raw }));
                }
                return Vec::new();
            }
        };

        // notify opcodes overlap command opcodes, so they never resolve a request
        if parsed.is_notify() {
            if parsed.opcode == notify::DELIVERY_COMPLETE {
                self.dose_outstanding = false;
            }
            return vec![Action::Emit(LinkEvent::Notify(parsed))];
        }

        match self.take_pending_for(parsed.opcode) {
            Some(pending) => {
                if parsed.success {
                    self.track(pending.opcode, &pending.payload);
                }
                pending.resolve(Ok(parsed));
            }
            None => tracing::warn!("Unsolicited response {} ({:#04x})", parsed.name, parsed.opcode),
        }
        Vec::new()
    }

    /// Updates session flags after a successful response.
    fn track(&mut self, op: u8, payload: &[u8]) {
        match op {
            opcode::SET_HISTORY_UPLOAD_MODE => {
                self.history_mode = payload.first() == Some(&1);
                tracing::debug!("History upload mode {}", self.history_mode);
            }
            opcode::STEP_BOLUS_START => self.dose_outstanding = true,
            opcode::STEP_BOLUS_STOP => self.dose_outstanding = false,
            _ => {}
        }
    }

    fn on_handshake(&mut self, packet: &Packet) -> Result<Vec<Action>, LinkError> {
        let message = packet.to_message();
        let status = packet.status();

        let actions = match packet.opcode {
            handshake::PUMP_CHECK => self.on_pump_check(message)?,
            handshake::TIME_INFORMATION => self.on_time_information(packet, message)?,
            handshake::CHECK_PASSKEY => {
                if status == Some(STATUS_ACCEPTED) {
                    vec![self.time_information_write()?]
                } else {
                    self.crypto.restore_passkey_backup();
                    vec![self.handshake_write(handshake::PASSKEY_REQUEST, &[])?]
                }
            }
            handshake::PASSKEY_REQUEST => match status {
                // user must confirm on the pump, which then sends PASSKEY_RETURN
                Some(0) => Vec::new(),
                other => self.fault(PairingFault::PasskeyRequestRejected(other.unwrap_or(0xFF)), message),
            },
            handshake::PASSKEY_RETURN => {
                let Some(key) = packet.payload.get(..2) else {
                    return Err(LinkError::Decode {
                        source: danalink_protocol::ProtocolError::Truncated {
                            len: packet.payload.len(),
                        },
                        raw: message,
                    });
                };
                self.crypto.set_pairing_keys(key, &[], 0);
                vec![
                    Action::Emit(self.pairing_keys_issued()),
                    self.time_information_write()?,
                ]
            }
            handshake::GET_PUMP_CHECK => {
                if status == Some(STATUS_ACCEPTED) {
                    vec![self.time_information_write()?]
                } else {
                    vec![self.handshake_write(handshake::GET_EASYMENU_CHECK, &[])?]
                }
            }
            handshake::GET_EASYMENU_CHECK => {
                self.easy_mode = Some(packet.payload.first() == Some(&1));
                self.unit_ud = Some(packet.payload.get(1) == Some(&1));
                vec![self.time_information_write()?]
            }
            other => {
                tracing::warn!("Ignoring unknown handshake opcode {:#04x}", other);
                Vec::new()
            }
        };
        Ok(actions)
    }

    fn on_pump_check(&mut self, message: Vec<u8>) -> Result<Vec<Action>, LinkError> {
        let outcome = classify_handshake_response(&message);
        tracing::debug!("Pump check classified as {:?}", outcome);

        match outcome {
            HandshakeOutcome::Default => {
                let mut actions = self.negotiated(Generation::Default);
                let pairing_key = self.crypto.secrets().pairing_key.clone();
                if pairing_key.is_empty() {
                    actions.push(self.handshake_write(handshake::PASSKEY_REQUEST, &[])?);
                } else {
                    self.crypto.set_passkey_secret(&pairing_key);
                    actions.push(self.handshake_write(handshake::CHECK_PASSKEY, &pairing_key)?);
                }
                Ok(actions)
            }
            HandshakeOutcome::Rsv3 {
                hardware_model,
                protocol,
            } => {
                let mut actions = self.negotiated(Generation::Generation2);
                actions.push(self.identified(hardware_model, protocol));
                match hardware_model {
                    0x05 => actions.push(self.time_information_write()?),
                    0x06 => actions.push(self.handshake_write(handshake::GET_EASYMENU_CHECK, &[])?),
                    other => actions.extend(self.fault(PairingFault::UnsupportedHardware(other), message)),
                }
                Ok(actions)
            }
            HandshakeOutcome::Ble5 {
                hardware_model,
                protocol,
                key_material,
            } => {
                let mut actions = self.negotiated(Generation::Generation3);
                actions.push(self.identified(hardware_model, protocol));
                if !matches!(hardware_model, 0x09 | 0x0A) {
                    actions.extend(self.fault(PairingFault::UnsupportedHardware(hardware_model), message));
                } else if let Err(e) = self.crypto.set_session_key_material(&key_material) {
                    tracing::error!("Rejecting BLE5 key material: {}", e);
                    actions.extend(self.fault(PairingFault::InvalidSessionKeys, message));
                } else {
                    actions.push(self.time_information_write()?);
                }
                Ok(actions)
            }
            HandshakeOutcome::InvalidSessionKeys => Ok(self.fault(PairingFault::InvalidSessionKeys, message)),
            HandshakeOutcome::DeviceBusy => Ok(self.fault(PairingFault::DeviceBusy, message)),
            HandshakeOutcome::DeviceIdentity => Ok(self.fault(PairingFault::DeviceIdentity, message)),
            HandshakeOutcome::SerialMismatch => Ok(self.fault(PairingFault::SerialMismatch, message)),
        }
    }

    fn on_time_information(&mut self, packet: &Packet, message: Vec<u8>) -> Result<Vec<Action>, LinkError> {
        match self.crypto.generation() {
            Generation::Generation3 => Ok(self.establish()),
            Generation::Generation2 => match packet.status() {
                Some(0) if self.crypto.has_pairing_keys() => Ok(self.establish()),
                Some(0) => {
                    tracing::info!("Pump is showing a pin pair");
                    Ok(vec![
                        self.transition(LinkState::AwaitingPincode),
                        Action::Emit(LinkEvent::PincodeRequired),
                    ])
                }
                _ => Ok(vec![self.handshake_write(handshake::TIME_INFORMATION, &[1])?]),
            },
            Generation::Default => {
                let actual = password_from_time_information(&packet.payload);
                match (self.device_password, actual) {
                    (Some(expected), Some(actual)) if expected != actual && !self.config.ignore_password => {
                        Ok(self.fault(PairingFault::PasswordMismatch { expected, actual }, message))
                    }
                    (None, Some(actual)) => {
                        self.device_password = Some(actual);
                        Ok(self.establish())
                    }
                    _ => Ok(self.establish()),
                }
            }
        }
    }

    /// Supplies the pin pair shown by an RSv3 pump.
    pub fn complete_pairing(&mut self, pin: &PinPair) -> Result<Vec<Action>, LinkError> {
        if self.state != LinkState::AwaitingPincode {
            return Err(LinkError::NotAwaitingPincode);
        }

        self.crypto.set_pairing_keys(&pin.pairing_key, &pin.random_pairing_key, 0);
        Ok(vec![
            self.transition(LinkState::NegotiatingEncryption),
            Action::Emit(self.pairing_keys_issued()),
            self.handshake_write(handshake::TIME_INFORMATION, &[0])?,
        ])
    }

    /// Encodes a command and installs the pending exchange.
    ///
    /// Fails synchronously if the link is not connected, a request is
    /// already in flight, or a history opcode is sent outside history mode.
    pub fn begin_request(&mut self, op: u8, payload: &[u8]) -> Result<(Ticket, Vec<Bytes>), LinkError> {
        if self.state != LinkState::Connected {
            return Err(LinkError::TransportNotReady);
        }
        if let Some(pending) = &self.pending {
            return Err(LinkError::ConcurrentRequestRejected {
                pending: pending.opcode,
            });
        }
        let history = is_history_opcode(op);
        if history && !self.history_mode {
            return Err(LinkError::HistoryModeRequired(op));
        }

        let wire = self.crypto.encode_message(op, payload)?;
        tracing::debug!("Sending {:#04x} ({} bytes): {}", op, wire.len(), hex::encode(&wire));

        let timeout = if history {
            self.config.history_timeout()
        } else {
            self.config.request_timeout()
        };
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE);
        let (responder, receiver) = oneshot::channel();
        let id = self.next_id;
        self.next_id += 1;
        self.pending = Some(PendingExchange {
            id,
            opcode: op,
            payload: Bytes::copy_from_slice(payload),
            responder,
        });

        let ticket = Ticket {
            id,
            opcode: op,
            deadline,
            receiver,
        };
        Ok((ticket, Encoder::chunks(&wire, self.write_limit)))
    }

    /// Fails the exchange `id` with a timeout if it is still pending.
    pub fn expire(&mut self, id: u64) -> bool {
        match self.pending.take() {
            Some(pending) if pending.id == id => {
                tracing::warn!("Request {:#04x} timed out", pending.opcode);
                let opcode = pending.opcode;
                pending.resolve(Err(LinkError::Timeout { opcode }));
                true
            }
            other => {
                self.pending = other;
                false
            }
        }
    }

    /// Drops the exchange `id` without resolving it.
    pub fn release(&mut self, id: u64) {
        if self.pending.as_ref().is_some_and(|p| p.id == id) {
            self.pending = None;
        }
    }

    /// Starts a local disconnect.
    pub fn begin_disconnect(&mut self) -> Vec<Action> {
        if matches!(self.state, LinkState::Disconnected | LinkState::Disconnecting) {
            return Vec::new();
        }
        vec![self.transition(LinkState::Disconnecting)]
    }

    /// Transport has gone away: fail the pending exchange and clear
    /// negotiation state.
    pub fn on_transport_closed(&mut self) -> Vec<Action> {
        self.fail_pending(LinkError::ConnectionClosed);
        self.accumulator.clear();
        self.crypto.reset_session();
        self.history_mode = false;
        self.dose_outstanding = false;

        if self.state == LinkState::Disconnected {
            return Vec::new();
        }
        vec![self.transition(LinkState::Disconnected)]
    }

    fn fail_pending(&mut self, error: LinkError) {
        if let Some(pending) = self.pending.take() {
            pending.resolve(Err(error));
        }
    }

    fn take_pending_for(&mut self, op: u8) -> Option<PendingExchange> {
        match self.pending.take() {
            Some(pending) if pending.opcode == op => Some(pending),
            other => {
                self.pending = other;
                None
            }
        }
    }

    fn transition(&mut self, state: LinkState) -> Action {
        if self.state != state {
            tracing::info!("Link {} -> {}", self.state, state);
        }
        self.state = state;
        Action::Emit(LinkEvent::StateChanged(state))
    }

    fn negotiated(&mut self, generation: Generation) -> Vec<Action> {
        tracing::info!("Negotiated {} encryption", generation);
        self.crypto.set_generation(generation);
        vec![Action::Emit(LinkEvent::GenerationNegotiated(generation))]
    }

    fn identified(&mut self, hardware_model: u8, protocol: u8) -> Action {
        tracing::info!("Pump hardware model {:#04x}, protocol {:#04x}", hardware_model, protocol);
        self.hardware_model = Some(hardware_model);
        self.protocol = Some(protocol);
        Action::Emit(LinkEvent::HardwareIdentified {
            hardware_model,
            protocol,
        })
    }

    fn establish(&mut self) -> Vec<Action> {
        vec![self.transition(LinkState::Connected)]
    }

    fn fault(&mut self, fault: PairingFault, raw: Vec<u8>) -> Vec<Action> {
        tracing::error!("Pairing failed: {} (raw {})", fault, hex::encode(&raw));
        let mut actions = vec![Action::Emit(LinkEvent::Fault(fault.clone()))];
        actions.extend(self.abort(LinkError::Pairing { fault, raw }));
        actions
    }

    /// Ends the handshake with `error`.
    fn abort(&mut self, error: LinkError) -> Vec<Action> {
        if !matches!(error, LinkError::Pairing { .. }) {
            tracing::error!("Handshake failed: {}", error);
        }
        self.last_failure = Some(error);
        vec![self.transition(LinkState::Disconnecting), Action::Disconnect]
    }

    fn pairing_keys_issued(&self) -> LinkEvent {
        let secrets = self.crypto.secrets();
        LinkEvent::PairingKeysIssued {
            pairing_key: secrets.pairing_key.clone(),
            random_pairing_key: secrets.random_pairing_key.clone(),
            random_sync_key: self.crypto.stored_sync_key(),
        }
    }

    /// Time information for the negotiated generation.
    ///
    /// RSv3 sends the pairing probe: `[0]` with stored keys, `[1]` to ask
    /// for a new pairing. BLE5 sends four zero bytes.
    fn time_information_write(&mut self) -> Result<Action, LinkError> {
        match self.crypto.generation() {
            Generation::Default => self.handshake_write(handshake::TIME_INFORMATION, &[]),
            Generation::Generation2 => {
                let probe = u8::from(!self.crypto.has_pairing_keys());
                self.handshake_write(handshake::TIME_INFORMATION, &[probe])
            }
            Generation::Generation3 => self.handshake_write(handshake::TIME_INFORMATION, &[0, 0, 0, 0]),
        }
    }

    fn handshake_write(&mut self, op: u8, payload: &[u8]) -> Result<Action, LinkError> {
        let wire = self.crypto.encode_handshake(op, payload)?;
        tracing::debug!("Handshake {:#04x}: {}", op, hex::encode(&wire));
        Ok(Action::Write(Encoder::chunks(&wire, self.write_limit)))
    }
}
