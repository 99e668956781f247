//! Link error types.

use danalink_protocol::ProtocolError;
use thiserror::Error;

/// Reasons a pump refuses or breaks the pairing handshake.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingFault {
    #[error("pump did not recognise the device name (wrong serial number)")]
    SerialMismatch,

    #[error("pump is busy")]
    DeviceBusy,

    #[error("pump rejected the pump check")]
    DeviceIdentity,

    #[error("pump sent invalid session keys; forget and re-bond the device")]
    InvalidSessionKeys,

    #[error("pump password mismatch: expected {expected:#06x}, got {actual:#06x}")]
    PasswordMismatch { expected: u16, actual: u16 },

    #[error("unsupported hardware model {0:#04x}")]
    UnsupportedHardware(u8),

    #[error("passkey request rejected with status {0:#04x}")]
    PasskeyRequestRejected(u8),
}

impl PairingFault {
    /// Returns whether the stored bond is unusable and reconnecting is
    /// pointless until the user pairs again.
    pub fn requires_rebond(&self) -> bool {
        matches!(
            self,
            PairingFault::InvalidSessionKeys | PairingFault::UnsupportedHardware(_)
        )
    }
}

/// Link errors.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("failed to decode: {source} (raw {})", hex::encode(.raw))]
    Decode {
        source: ProtocolError,
        raw: Vec<u8>,
    },

    #[error("transport not ready")]
    TransportNotReady,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request {opcode:#04x} timed out")]
    Timeout { opcode: u8 },

    #[error("pairing failed: {fault} (raw {})", hex::encode(.raw))]
    Pairing { fault: PairingFault, raw: Vec<u8> },

    #[error("request {pending:#04x} already in flight")]
    ConcurrentRequestRejected { pending: u8 },

    #[error("opcode {0:#04x} requires history upload mode")]
    HistoryModeRequired(u8),

    #[error("no pairing in progress")]
    NotAwaitingPincode,

    #[error("connection closed")]
    ConnectionClosed,
}

impl LinkError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            LinkError::Timeout { .. } => true,
            LinkError::ConnectionClosed => true,
            LinkError::TransportNotReady => true,
            LinkError::Transport(_) => true,
            LinkError::Pairing { fault, .. } => !fault.requires_rebond(),
            _ => false,
        }
    }
}
