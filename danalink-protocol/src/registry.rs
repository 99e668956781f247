//! Command codec registry.
//!
//! Maps `(packet type, opcode)` to a payload decoder. The link session
//! treats decoders as opaque: it only needs the success flag and a value it
//! can hand back to the caller.

use crate::error::ProtocolError;
use crate::packet::{notify, opcode, Packet, PacketType};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;

/// Decodes a response payload into `(success, value)`.
pub type DecodeFn = fn(&[u8]) -> Result<(bool, ResponseValue), ProtocolError>;

/// Decoder registered for one message kind.
#[derive(Clone, Copy)]
pub struct CommandCodec {
    pub name: &'static str,
    pub decode: DecodeFn,
}

impl std::fmt::Debug for CommandCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandCodec").field("name", &self.name).finish()
    }
}

/// Pump status summary returned by INITIAL_SCREEN_INFORMATION.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitialScreenInformation {
    pub is_pump_suspended: bool,
    pub is_temp_basal_in_progress: bool,
    pub is_extended_in_progress: bool,
    pub is_dual_bolus_in_progress: bool,
    pub daily_total_units: f64,
    pub max_daily_total_units: f64,
    pub reservoir_remaining_units: f64,
    pub current_basal: f64,
    pub temp_basal_percent: u8,
    pub battery_remaining: u8,
    pub extended_bolus_absolute_remaining: f64,
    pub insulin_on_board: f64,
    pub error_state: Option<u8>,
}

/// Decoded value of a response or notify payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseValue {
    /// Status-only response.
    Ack,
    InitialScreen(InitialScreenInformation),
    DeliveryComplete { delivered_units: f64 },
    DeliveryRate { delivered_units: f64 },
    Alarm { code: u8 },
    /// Payload of an opcode without a registered decoder.
    Raw { payload: Vec<u8> },
}

/// A response or notify after payload decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub packet_type: PacketType,
    pub opcode: u8,
    pub name: &'static str,
    pub success: bool,
    pub value: ResponseValue,
    pub raw: Bytes,
}

impl ParsedResponse {
    pub fn is_notify(&self) -> bool {
        self.packet_type == PacketType::Notify
    }
}

fn key(packet_type: PacketType, op: u8) -> u16 {
    (u16::from(packet_type.as_u8()) << 8) | u16::from(op)
}

fn u16_at(payload: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([payload[offset], payload[offset + 1]])
}

fn units_at(payload: &[u8], offset: usize) -> f64 {
    f64::from(u16_at(payload, offset)) / 100.0
}

fn require(op: u8, payload: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if payload.len() < needed {
        return Err(ProtocolError::ShortPayload {
            opcode: op,
            needed,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn decode_status(payload: &[u8]) -> Result<(bool, ResponseValue), ProtocolError> {
    match payload.first() {
        Some(status) => Ok((*status == 0, ResponseValue::Ack)),
        None => Err(ProtocolError::ShortPayload {
            opcode: 0,
            needed: 1,
            actual: 0,
        }),
    }
}

fn decode_initial_screen(payload: &[u8]) -> Result<(bool, ResponseValue), ProtocolError> {
    require(opcode::INITIAL_SCREEN_INFORMATION, payload, 15)?;

    let status = payload[0];
    Ok((
        true,
        ResponseValue::InitialScreen(InitialScreenInformation {
            is_pump_suspended: status & 0x01 == 0x01,
            is_temp_basal_in_progress: status & 0x10 == 0x10,
            is_extended_in_progress: status & 0x04 == 0x04,
            is_dual_bolus_in_progress: status & 0x08 == 0x08,
            daily_total_units: units_at(payload, 1),
            max_daily_total_units: units_at(payload, 3),
            reservoir_remaining_units: units_at(payload, 5),
            current_basal: units_at(payload, 7),
            temp_basal_percent: payload[9],
            battery_remaining: payload[10],
            extended_bolus_absolute_remaining: units_at(payload, 11),
            insulin_on_board: units_at(payload, 13),
            error_state: payload.get(15).copied(),
        }),
    ))
}

fn decode_delivery_complete(payload: &[u8]) -> Result<(bool, ResponseValue), ProtocolError> {
    require(notify::DELIVERY_COMPLETE, payload, 2)?;
    Ok((
        true,
        ResponseValue::DeliveryComplete {
            delivered_units: units_at(payload, 0),
        },
    ))
}

fn decode_delivery_rate(payload: &[u8]) -> Result<(bool, ResponseValue), ProtocolError> {
    require(notify::DELIVERY_RATE_DISPLAY, payload, 2)?;
    Ok((
        true,
        ResponseValue::DeliveryRate {
            delivered_units: units_at(payload, 0),
        },
    ))
}

fn decode_alarm(payload: &[u8]) -> Result<(bool, ResponseValue), ProtocolError> {
    require(notify::ALARM, payload, 1)?;
    Ok((true, ResponseValue::Alarm { code: payload[0] }))
}

/// Registry of payload decoders keyed by packet type and opcode.
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    codecs: HashMap<u16, CommandCodec>,
}

impl CommandRegistry {
    /// Creates an empty registry.
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Creates a registry with the built-in decoders.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        let status_only = [
            (opcode::KEEP_CONNECTION, "KEEP_CONNECTION"),
            (opcode::SET_HISTORY_UPLOAD_MODE, "SET_HISTORY_UPLOAD_MODE"),
            (opcode::STEP_BOLUS_START, "STEP_BOLUS_START"),
            (opcode::STEP_BOLUS_STOP, "STEP_BOLUS_STOP"),
            (opcode::SET_TEMPORARY_BASAL, "SET_TEMPORARY_BASAL"),
            (opcode::CANCEL_TEMPORARY_BASAL, "CANCEL_TEMPORARY_BASAL"),
        ];
        for (op, name) in status_only {
            registry.register(PacketType::Response, op, CommandCodec { name, decode: decode_status });
        }

        registry.register(
            PacketType::Response,
            opcode::INITIAL_SCREEN_INFORMATION,
            CommandCodec {
                name: "INITIAL_SCREEN_INFORMATION",
                decode: decode_initial_screen,
            },
        );
        registry.register(
            PacketType::Notify,
            notify::DELIVERY_COMPLETE,
            CommandCodec {
                name: "NOTIFY_DELIVERY_COMPLETE",
                decode: decode_delivery_complete,
            },
        );
        registry.register(
            PacketType::Notify,
            notify::DELIVERY_RATE_DISPLAY,
            CommandCodec {
                name: "NOTIFY_DELIVERY_RATE_DISPLAY",
                decode: decode_delivery_rate,
            },
        );
        registry.register(
            PacketType::Notify,
            notify::ALARM,
            CommandCodec {
                name: "NOTIFY_ALARM",
                decode: decode_alarm,
            },
        );
        registry
    }

    /// Registers or replaces the decoder for `(packet_type, op)`.
    pub fn register(&mut self, packet_type: PacketType, op: u8, codec: CommandCodec) {
        self.codecs.insert(key(packet_type, op), codec);
    }

    pub fn get(&self, packet_type: PacketType, op: u8) -> Option<&CommandCodec> {
        self.codecs.get(&key(packet_type, op))
    }

    /// Decodes a response or notify packet.
    ///
    /// Unregistered opcodes decode to [`ResponseValue::Raw`] with success
    /// taken from the first payload byte.
    pub fn parse(&self, packet: &Packet) -> Result<ParsedResponse, ProtocolError> {
        let (name, (success, value)) = match self.get(packet.packet_type, packet.opcode) {
            Some(codec) => (codec.name, (codec.decode)(&packet.payload).map_err(|err| match err {
                ProtocolError::ShortPayload { needed, actual, .. } => ProtocolError::ShortPayload {
                    opcode: packet.opcode,
                    needed,
                    actual,
                },
                other => other,
            })?),
            None => (
                "UNKNOWN",
                (
                    packet.status() == Some(0),
                    ResponseValue::Raw {
                        payload: packet.payload.to_vec(),
                    },
                ),
            ),
        };

        Ok(ParsedResponse {
            packet_type: packet.packet_type,
            opcode: packet.opcode,
            name,
            success,
            value,
            raw: packet.payload.clone(),
        })
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Payload encoders for the built-in commands.
pub mod payload {
    /// Bolus delivery speed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(u8)]
    pub enum BolusSpeed {
        Speed12 = 0,
        Speed30 = 1,
        Speed60 = 2,
    }

    /// STEP_BOLUS_START: amount in units (0.01 resolution) and speed.
    pub fn step_bolus_start(units: f64, speed: BolusSpeed) -> Vec<u8> {
        let rate = (units * 100.0).round().clamp(0.0, f64::from(u16::MAX)) as u16;
        let [lo, hi] = rate.to_le_bytes();
        vec![lo, hi, speed as u8]
    }

    /// SET_TEMPORARY_BASAL: ratio in percent, whole hours.
    pub fn temporary_basal(ratio_percent: u8, hours: u8) -> Vec<u8> {
        vec![ratio_percent, hours]
    }

    /// SET_HISTORY_UPLOAD_MODE.
    pub fn history_upload_mode(enabled: bool) -> Vec<u8> {
        vec![u8::from(enabled)]
    }
}
