//! Packet types, operation codes and encryption generations.

use crate::error::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Packet type byte carried at offset 3 of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    EncryptionRequest = 0x01,
    EncryptionResponse = 0x02,
    Command = 0xA1,
    Response = 0xB2,
    Notify = 0xC3,
}

impl PacketType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns whether frames of this type belong to the handshake phase.
    ///
    /// The CRC engine and the first-level transform both key off this.
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            PacketType::EncryptionRequest | PacketType::EncryptionResponse
        )
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::EncryptionRequest),
            0x02 => Ok(PacketType::EncryptionResponse),
            0xA1 => Ok(PacketType::Command),
            0xB2 => Ok(PacketType::Response),
            0xC3 => Ok(PacketType::Notify),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::EncryptionRequest => write!(f, "ENCRYPTION_REQUEST"),
            PacketType::EncryptionResponse => write!(f, "ENCRYPTION_RESPONSE"),
            PacketType::Command => write!(f, "COMMAND"),
            PacketType::Response => write!(f, "RESPONSE"),
            PacketType::Notify => write!(f, "NOTIFY"),
        }
    }
}

/// Encryption generation negotiated during the pump check.
///
/// Selects the CRC variant and the second-level transform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Generation {
    /// DanaRS v1: first-level obfuscation only.
    #[default]
    Default,
    /// DanaRS v3 ("RSv3"): rolling-sync second level.
    Generation2,
    /// Dana-i ("BLE5"): three-key second level.
    Generation3,
}

impl Generation {
    /// Returns whether a second-level transform applies in-session.
    pub fn has_second_level(self) -> bool {
        !matches!(self, Generation::Default)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Generation::Default => write!(f, "DEFAULT"),
            Generation::Generation2 => write!(f, "RSv3"),
            Generation::Generation3 => write!(f, "BLE5"),
        }
    }
}

/// Operation codes used during connection negotiation.
pub mod handshake {
    pub const PUMP_CHECK: u8 = 0x00;
    pub const TIME_INFORMATION: u8 = 0x01;
    pub const CHECK_PASSKEY: u8 = 0xD0;
    pub const PASSKEY_REQUEST: u8 = 0xD1;
    pub const PASSKEY_RETURN: u8 = 0xD2;
    pub const GET_PUMP_CHECK: u8 = 0xF3;
    pub const GET_EASYMENU_CHECK: u8 = 0xF4;
}

/// Operation codes carried by unsolicited notify frames.
pub mod notify {
    pub const DELIVERY_COMPLETE: u8 = 0x01;
    pub const DELIVERY_RATE_DISPLAY: u8 = 0x02;
    pub const ALARM: u8 = 0x03;
    pub const MISSED_BOLUS_ALARM: u8 = 0x04;
}

/// Operation codes for in-session commands.
pub mod opcode {
    pub const INITIAL_SCREEN_INFORMATION: u8 = 0x02;
    pub const DELIVERY_STATUS: u8 = 0x03;
    pub const GET_PASSWORD: u8 = 0x04;

    pub const BOLUS_AVG: u8 = 0x10;
    pub const HISTORY_BOLUS: u8 = 0x11;
    pub const HISTORY_DAILY: u8 = 0x12;
    pub const HISTORY_PRIME: u8 = 0x13;
    pub const HISTORY_REFILL: u8 = 0x14;
    pub const HISTORY_BLOOD_GLUCOSE: u8 = 0x15;
    pub const HISTORY_CARBOHYDRATE: u8 = 0x16;
    pub const HISTORY_TEMPORARY: u8 = 0x17;
    pub const HISTORY_SUSPEND: u8 = 0x18;
    pub const HISTORY_ALARM: u8 = 0x19;
    pub const HISTORY_BASAL: u8 = 0x1A;
    pub const HISTORY_ALL: u8 = 0x1F;

    pub const GET_SHIPPING_INFORMATION: u8 = 0x20;
    pub const GET_PUMP_CHECK: u8 = 0x21;
    pub const GET_USER_TIME_CHANGE_FLAG: u8 = 0x22;
    pub const SET_USER_TIME_CHANGE_FLAG_CLEAR: u8 = 0x23;
    pub const SET_HISTORY_UPLOAD_MODE: u8 = 0x25;

    pub const STEP_BOLUS_STOP: u8 = 0x44;
    pub const EXTENDED_BOLUS_SET: u8 = 0x47;
    pub const EXTENDED_BOLUS_CANCEL: u8 = 0x49;
    pub const STEP_BOLUS_START: u8 = 0x4A;

    pub const SET_TEMPORARY_BASAL: u8 = 0x60;
    pub const CANCEL_TEMPORARY_BASAL: u8 = 0x62;
    pub const SET_SUSPEND_ON: u8 = 0x69;
    pub const SET_SUSPEND_OFF: u8 = 0x6A;

    pub const GET_PUMP_TIME: u8 = 0x70;
    pub const SET_PUMP_TIME: u8 = 0x71;

    pub const APS_SET_TEMPORARY_BASAL: u8 = 0xC1;
    pub const APS_HISTORY_EVENTS: u8 = 0xC2;

    pub const SET_HISTORY_SAVE: u8 = 0xE0;
    pub const KEEP_CONNECTION: u8 = 0xFF;
}

/// Returns whether `op` is one of the handshake-phase operation codes.
pub fn is_handshake_opcode(op: u8) -> bool {
    matches!(
        op,
        handshake::PUMP_CHECK
            | handshake::TIME_INFORMATION
            | handshake::CHECK_PASSKEY
            | handshake::PASSKEY_REQUEST
            | handshake::PASSKEY_RETURN
            | handshake::GET_PUMP_CHECK
            | handshake::GET_EASYMENU_CHECK
    )
}

/// Returns whether `op` reads from the pump's history log.
///
/// These are only accepted while history upload mode is on and use the
/// longer history deadline.
pub fn is_history_opcode(op: u8) -> bool {
    (opcode::HISTORY_BOLUS..=opcode::HISTORY_ALL).contains(&op)
}

/// A decoded message: the frame body after all transforms are removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub opcode: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(packet_type: PacketType, opcode: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            opcode,
            payload: payload.into(),
        }
    }

    /// Returns the message as `[type, opcode, payload..]`.
    ///
    /// Handshake responses are classified on this flattened form, the
    /// same shape the pump firmware documents.
    pub fn to_message(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.payload.len());
        out.push(self.packet_type.as_u8());
        out.push(self.opcode);
        out.extend_from_slice(&self.payload);
        out
    }

    /// First payload byte, the status byte for most responses.
    pub fn status(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}
