//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during framing, decryption or
/// payload decoding.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unrecognized start markers: {0:#04x} {1:#04x}")]
    InvalidStartMarkers(u8, u8),

    #[error("unrecognized or mismatched end markers: {0:#04x} {1:#04x}")]
    InvalidEndMarkers(u8, u8),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("unknown packet type: {0:#04x}")]
    UnknownPacketType(u8),

    #[error("frame truncated: {len} bytes")]
    Truncated { len: usize },

    #[error("invalid device name {0:?}: expected 10 ASCII characters")]
    InvalidDeviceName(String),

    #[error("invalid session keys: {0}")]
    InvalidSessionKeys(&'static str),

    #[error("pairing keys not installed")]
    MissingPairingKeys,

    #[error("invalid pin: {0}")]
    InvalidPin(&'static str),

    #[error("short payload for opcode {opcode:#04x}: need {needed} bytes, got {actual}")]
    ShortPayload {
        opcode: u8,
        needed: usize,
        actual: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::InvalidStartMarkers(0x12, 0x34);
        assert!(err.to_string().contains("0x12"));

        let err = ProtocolError::CrcMismatch {
            expected: 0xBC7A,
            actual: 0x0001,
        };
        let msg = err.to_string();
        assert!(msg.contains("0xbc7a"));
        assert!(msg.contains("0x0001"));

        let err = ProtocolError::PayloadTooLarge { size: 300, max: 250 };
        assert!(err.to_string().contains("300"));

        let err = ProtocolError::UnknownPacketType(0x42);
        assert!(err.to_string().contains("0x42"));

        let err = ProtocolError::ShortPayload {
            opcode: 0x02,
            needed: 15,
            actual: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("15"));
        assert!(msg.contains("0x02"));

        let err = ProtocolError::InvalidSessionKeys("zero byte in key material");
        assert!(err.to_string().contains("zero byte"));
    }
}
