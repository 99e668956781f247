//! In-memory pump and transport for tests.

use crate::error::LinkError;
use crate::transport::PumpTransport;
use bytes::Bytes;
use danalink_protocol::packet::{handshake, opcode};
use danalink_protocol::{
    EncryptionContext, Encoder, Frame, Generation, Packet, PacketType, ParseOutcome, PinPair, ReceiveAccumulator,
    PASSWORD_MASK,
};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub(crate) const DEVICE_NAME: &str = "VJH00012FI";

const NOTIFICATION_LEN: usize = 20;

/// What kind of pump to emulate.
#[derive(Debug, Clone)]
pub(crate) enum PumpModel {
    Default { password: u16, passkey: [u8; 2] },
    Rsv3 { hardware_model: u8, pin: PinPair },
    Ble5 { hardware_model: u8, key_material: [u8; 6] },
}

impl PumpModel {
    pub(crate) fn default_model(password: u16, passkey: [u8; 2]) -> Self {
        PumpModel::Default { password, passkey }
    }

    pub(crate) fn rsv3(hardware_model: u8, pin: PinPair) -> Self {
        PumpModel::Rsv3 { hardware_model, pin }
    }

    pub(crate) fn ble5(hardware_model: u8, key_material: [u8; 6]) -> Self {
        PumpModel::Ble5 {
            hardware_model,
            key_material,
        }
    }
}

/// Pump side of the protocol, driven one host write at a time.
pub(crate) struct PumpEmulator {
    model: PumpModel,
    crypto: EncryptionContext,
    accumulator: ReceiveAccumulator,
    session_active: bool,
    passkey_return: bool,
    pump_check_reply: Option<Vec<u8>>,
    silent: HashSet<u8>,
    replies: HashMap<u8, Vec<u8>>,
    received: Vec<Packet>,
}

impl PumpEmulator {
    pub(crate) fn new(model: PumpModel) -> Self {
        let mut crypto = EncryptionContext::new(DEVICE_NAME).unwrap();
        if let PumpModel::Rsv3 { pin, .. } = &model {
            crypto.set_pairing_keys(&pin.pairing_key, &pin.random_pairing_key, 0);
        }
        Self {
            model,
            crypto,
            accumulator: ReceiveAccumulator::new(),
            session_active: false,
            passkey_return: true,
            pump_check_reply: None,
            silent: HashSet::new(),
            replies: HashMap::new(),
            received: Vec::new(),
        }
    }

    /// Forgets the previous connection.
    pub(crate) fn reset(&mut self) {
        self.crypto.reset_session();
        self.accumulator.clear();
        self.session_active = false;
        self.received.clear();
    }

    /// Whether the user confirms a passkey request on the pump.
    pub(crate) fn set_passkey_return(&mut self, enabled: bool) {
        self.passkey_return = enabled;
    }

    pub(crate) fn set_pump_check_reply(&mut self, payload: Vec<u8>) {
        self.pump_check_reply = Some(payload);
    }

    /// Never answer `op`.
    pub(crate) fn silence(&mut self, op: u8) {
        self.silent.insert(op);
    }

    pub(crate) fn set_reply(&mut self, op: u8, payload: Vec<u8>) {
        self.replies.insert(op, payload);
    }

    pub(crate) fn received_opcodes(&self) -> Vec<u8> {
        self.received.iter().map(|p| p.opcode).collect()
    }

    /// Consumes one host write and returns the notifications it triggers.
    pub(crate) fn receive(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        let mut bytes = chunk.to_vec();
        if self.session_active {
            self.crypto.decode_session(&mut bytes).unwrap();
        }
        self.accumulator.extend(&bytes);

        let mut out = Vec::new();
        while let ParseOutcome::Frame(frame) = self.accumulator.decode_frame() {
            let packet = self.crypto.decode_frame(&frame).unwrap();
            self.received.push(packet.clone());
            for reply in self.respond(&packet) {
                out.extend(Encoder::chunks(&reply, NOTIFICATION_LEN));
            }
        }
        out
    }

    /// Builds an unsolicited notify frame.
    pub(crate) fn notify(&mut self, op: u8, payload: &[u8]) -> Bytes {
        self.encode(PacketType::Notify, op, payload.to_vec())
    }

    fn respond(&mut self, packet: &Packet) -> Vec<Bytes> {
        match packet.packet_type {
            PacketType::EncryptionRequest => self.respond_handshake(packet),
            PacketType::Command if self.silent.contains(&packet.opcode) => Vec::new(),
            PacketType::Command => {
                let payload = self
                    .replies
                    .get(&packet.opcode)
                    .cloned()
                    .unwrap_or_else(|| default_reply(packet.opcode));
                vec![self.encode(PacketType::Response, packet.opcode, payload)]
            }
            _ => Vec::new(),
        }
    }

    fn respond_handshake(&mut self, packet: &Packet) -> Vec<Bytes> {
        let ty = PacketType::EncryptionResponse;
        match (packet.opcode, self.model.clone()) {
            (handshake::PUMP_CHECK, model) => {
                let payload = self.pump_check_reply.clone().unwrap_or_else(|| ack(&model));
                let reply = self.encode(ty, handshake::PUMP_CHECK, payload);
                match model {
                    PumpModel::Default { .. } => {}
                    PumpModel::Rsv3 { .. } => self.crypto.set_generation(Generation::Generation2),
                    PumpModel::Ble5 { key_material, .. } => {
                        self.crypto.set_generation(Generation::Generation3);
                        // zero keys are rejected by the host before they matter
                        let _ = self.crypto.set_session_key_material(&key_material);
                    }
                }
                vec![reply]
            }
            (handshake::TIME_INFORMATION, PumpModel::Default { password, .. }) => {
                let [lo, hi] = (password ^ PASSWORD_MASK).to_le_bytes();
                let reply = self.encode(ty, handshake::TIME_INFORMATION, vec![0x18, 0x0A, 0x11, 0x0C, 0x1E, 0x00, lo, hi]);
                self.capture(&reply);
                vec![reply]
            }
            (handshake::TIME_INFORMATION, model) => {
                let reply = self.encode(ty, handshake::TIME_INFORMATION, vec![0x00]);
                let pairing_request = matches!(model, PumpModel::Rsv3 { .. }) && packet.status() != Some(0);
                self.session_active = !pairing_request;
                vec![reply]
            }
            (handshake::CHECK_PASSKEY, PumpModel::Default { passkey, .. }) if packet.payload[..] == passkey[..] => {
                self.crypto.set_passkey_secret(&passkey);
                vec![self.encode(ty, handshake::CHECK_PASSKEY, vec![0x05])]
            }
            (handshake::CHECK_PASSKEY, _) => vec![self.encode(ty, handshake::CHECK_PASSKEY, vec![0x00])],
            (handshake::PASSKEY_REQUEST, model) => {
                let mut out = vec![self.encode(ty, handshake::PASSKEY_REQUEST, vec![0x00])];
                if let (true, PumpModel::Default { passkey, .. }) = (self.passkey_return, model) {
                    let ret = self.encode(ty, handshake::PASSKEY_RETURN, passkey.to_vec());
                    self.capture(&ret);
                    out.push(ret);
                }
                out
            }
            (handshake::GET_EASYMENU_CHECK, _) => vec![self.encode(ty, handshake::GET_EASYMENU_CHECK, vec![0x00, 0x00])],
            _ => Vec::new(),
        }
    }

    fn encode(&mut self, packet_type: PacketType, op: u8, payload: Vec<u8>) -> Bytes {
        let mut buf = self.crypto.encode_packet(&Packet::new(packet_type, op, payload)).unwrap();
        if self.session_active {
            self.crypto.encode_session(&mut buf).unwrap();
        }
        buf.freeze()
    }

    /// Installs the secrets a reply hands to the host, the way the host
    /// will see them.
    fn capture(&mut self, reply: &[u8]) {
        let frame = Frame::from_bytes(reply).unwrap();
        self.crypto.decode_frame(&frame).unwrap();
    }
}

fn ack(model: &PumpModel) -> Vec<u8> {
    match model {
        PumpModel::Default { .. } => vec![0x4F, 0x4B],
        PumpModel::Rsv3 { hardware_model, .. } => vec![0x4F, 0x4B, 0x4D, *hardware_model, 0x00, 0x0B, 0x00],
        PumpModel::Ble5 {
            hardware_model,
            key_material,
        } => {
            let mut payload = vec![0x4F, 0x4B, 0x4D, *hardware_model, 0x00, 0x0C];
            payload.extend_from_slice(key_material);
            payload
        }
    }
}

fn default_reply(op: u8) -> Vec<u8> {
    match op {
        // 12.50 U today, 150.00 U left, 0.80 U/h, 90% battery
        opcode::INITIAL_SCREEN_INFORMATION => vec![
            0x00, 0xE2, 0x04, 0xA0, 0x0F, 0x98, 0x3A, 0x50, 0x00, 0x00, 0x5A, 0x00, 0x00, 0x78, 0x00, 0x00,
        ],
        _ => vec![0x00],
    }
}

struct MockInner {
    pump: Mutex<PumpEmulator>,
    inbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    writes: Mutex<Vec<Bytes>>,
    connects: AtomicUsize,
    refuse_connect: AtomicBool,
    drop_after: Mutex<Option<u8>>,
}

/// Transport wired straight to a [`PumpEmulator`].
#[derive(Clone)]
pub(crate) struct MockTransport {
    inner: Arc<MockInner>,
}

impl MockTransport {
    pub(crate) fn new(model: PumpModel) -> Self {
        Self {
            inner: Arc::new(MockInner {
                pump: Mutex::new(PumpEmulator::new(model)),
                inbound: Mutex::new(None),
                writes: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                refuse_connect: AtomicBool::new(false),
                drop_after: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn pump(&self) -> MutexGuard<'_, PumpEmulator> {
        self.inner.pump.lock()
    }

    pub(crate) fn writes(&self) -> Vec<Bytes> {
        self.inner.writes.lock().clone()
    }

    pub(crate) fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn set_refuse_connect(&self, refuse: bool) {
        self.inner.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Simulates the peripheral dropping the connection.
    pub(crate) fn drop_link(&self) {
        self.inner.inbound.lock().take();
    }

    /// Drops the connection once the pump has answered the next `op` command.
    pub(crate) fn drop_after_reply(&self, op: u8) {
        *self.inner.drop_after.lock() = Some(op);
    }

    /// Pushes a notification from the pump.
    pub(crate) async fn push(&self, data: Bytes) {
        let tx = self.inner.inbound.lock().clone();
        if let Some(tx) = tx {
            tx.send(data).await.unwrap();
        }
    }
}

impl PumpTransport for MockTransport {
    async fn connect(&self) -> Result<mpsc::Receiver<Bytes>, LinkError> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        if self.inner.refuse_connect.load(Ordering::SeqCst) {
            return Err(LinkError::Transport("peripheral not found".into()));
        }

        let (tx, rx) = mpsc::channel(64);
        self.inner.pump.lock().reset();
        *self.inner.inbound.lock() = Some(tx);
        Ok(rx)
    }

    async fn write(&self, chunk: Bytes) -> Result<(), LinkError> {
        let tx = self.inner.inbound.lock().clone().ok_or(LinkError::TransportNotReady)?;
        self.inner.writes.lock().push(chunk.clone());
        let (replies, answered) = {
            let mut pump = self.inner.pump.lock();
            let before = pump.received_opcodes().len();
            let replies = pump.receive(&chunk);
            let answered = pump.received_opcodes()[before..].to_vec();
            (replies, answered)
        };
        for reply in replies {
            tx.send(reply).await.map_err(|_| LinkError::ConnectionClosed)?;
        }

        let mut drop_after = self.inner.drop_after.lock();
        if drop_after.is_some_and(|op| answered.contains(&op)) {
            *drop_after = None;
            self.inner.inbound.lock().take();
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.inner.inbound.lock().take();
    }

    fn peripheral_id(&self) -> Option<String> {
        Some("mock-peripheral".into())
    }
}
