//! Binary frame format.
//!
//! Frame layout (7 bytes of envelope around the body):
//!
//! ```text
//! +---------+--------+------+--------+-----------+--------+---------+
//! | start   | length | type | opcode | payload   | crc16  | end     |
//! | 2 bytes | 1 byte | 1    | 1      | length-2  | 2 (BE) | 2 bytes |
//! +---------+--------+------+--------+-----------+--------+---------+
//! ```
//!
//! `length` counts type, opcode and payload. The marker pair identifies
//! the channel: plaintext, or one of the second-level encrypted channels.
//! Bytes between the length and the CRC are carried as they appear on the
//! wire; removing the obfuscation is the encryption context's job.

use crate::crc::crc16;
use crate::error::ProtocolError;
use crate::packet::{Generation, PacketType};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Bytes of envelope around the body: 2 start, length, 2 CRC, 2 end.
pub const FRAME_OVERHEAD: usize = 7;

/// Minimum number of buffered bytes before the parser inspects a header.
pub const MIN_PARSE_LEN: usize = 6;

/// Largest payload the single length byte can describe.
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize - 2;

/// Marker pair bracketing a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerPair {
    /// Plaintext channel (`A5 A5 .. 5A 5A`).
    Plain,
    /// RSv3 second-level channel (`7A 7A .. 2E 2E`).
    Rsv3,
    /// BLE5 second-level channel (`AA AA .. EE EE`).
    Ble5,
}

impl MarkerPair {
    pub const ALL: [MarkerPair; 3] = [MarkerPair::Plain, MarkerPair::Rsv3, MarkerPair::Ble5];

    pub fn start(self) -> u8 {
        match self {
            MarkerPair::Plain => 0xA5,
            MarkerPair::Rsv3 => 0x7A,
            MarkerPair::Ble5 => 0xAA,
        }
    }

    pub fn end(self) -> u8 {
        match self {
            MarkerPair::Plain => 0x5A,
            MarkerPair::Rsv3 => 0x2E,
            MarkerPair::Ble5 => 0xEE,
        }
    }

    /// Marker pair used by the second-level channel of `generation`.
    pub fn for_generation(generation: Generation) -> Self {
        match generation {
            Generation::Default => MarkerPair::Plain,
            Generation::Generation2 => MarkerPair::Rsv3,
            Generation::Generation3 => MarkerPair::Ble5,
        }
    }

    pub fn from_start(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.start() == byte)
    }

    pub fn from_end(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.end() == byte)
    }
}

/// Result of one parse attempt over an accumulation buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A complete frame was removed from the front of the buffer.
    Frame(Frame),
    /// More bytes are needed; the buffer is untouched apart from any
    /// orphaned prefix that was dropped while resynchronizing.
    Incomplete,
    /// The envelope was inconsistent; the buffer has been cleared.
    Invalid(ProtocolError),
}

/// A frame as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub markers: MarkerPair,
    pub packet_type: u8,
    pub opcode: u8,
    pub payload: Bytes,
    pub crc: u16,
}

impl Frame {
    /// Creates a plaintext frame and computes its checksum.
    pub fn build(
        packet_type: PacketType,
        opcode: u8,
        payload: impl Into<Bytes>,
        generation: Generation,
    ) -> Result<Self, ProtocolError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut frame = Self {
            markers: MarkerPair::Plain,
            packet_type: packet_type.as_u8(),
            opcode,
            payload,
            crc: 0,
        };
        frame.crc = crc16(&frame.body(), generation, packet_type.is_handshake());
        Ok(frame)
    }

    /// Returns `[type, opcode, payload..]`, the range covered by the CRC.
    pub fn body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.payload.len());
        out.push(self.packet_type);
        out.push(self.opcode);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Total encoded length of this frame.
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + 2 + self.payload.len()
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.markers.start());
        buf.put_u8(self.markers.start());
        buf.put_u8((2 + self.payload.len()) as u8);
        buf.put_u8(self.packet_type);
        buf.put_u8(self.opcode);
        buf.put_slice(&self.payload);
        buf.put_u16(self.crc);
        buf.put_u8(self.markers.end());
        buf.put_u8(self.markers.end());
        Ok(buf)
    }

    /// Parses one frame from the front of `buf`.
    ///
    /// Short input is never an error. A misaligned buffer is
    /// resynchronized on the next start-marker byte, and a buffer without
    /// any start-marker byte, or with an inconsistent envelope, is
    /// cleared.
    pub fn decode(buf: &mut BytesMut) -> ParseOutcome {
        loop {
            if buf.len() < MIN_PARSE_LEN {
                return ParseOutcome::Incomplete;
            }

            let markers = match (MarkerPair::from_start(buf[0]), MarkerPair::from_start(buf[1])) {
                (Some(first), Some(second)) if first == second => first,
                _ => {
                    match buf[1..].iter().position(|b| MarkerPair::from_start(*b).is_some()) {
                        Some(offset) => {
                            tracing::warn!(
                                "Dropping {} orphaned bytes: {}",
                                offset + 1,
                                hex::encode(&buf[..=offset])
                            );
                            buf.advance(offset + 1);
                            continue;
                        }
                        None => {
                            let err = ProtocolError::InvalidStartMarkers(buf[0], buf[1]);
                            tracing::warn!("No start marker in buffer: {}", hex::encode(&buf[..]));
                            buf.clear();
                            return ParseOutcome::Invalid(err);
                        }
                    }
                }
            };

            let length = buf[2] as usize;
            if length < 2 {
                let err = ProtocolError::Truncated { len: length };
                tracing::warn!("Frame length {} too short: {}", length, hex::encode(&buf[..]));
                buf.clear();
                return ParseOutcome::Invalid(err);
            }

            let total = length + FRAME_OVERHEAD;
            if buf.len() < total {
                return ParseOutcome::Incomplete;
            }

            let (end1, end2) = (buf[total - 2], buf[total - 1]);
            if MarkerPair::from_end(end1) != Some(markers) || MarkerPair::from_end(end2) != Some(markers) {
                tracing::warn!("Ending bytes do not match: {}", hex::encode(&buf[..total]));
                buf.clear();
                return ParseOutcome::Invalid(ProtocolError::InvalidEndMarkers(end1, end2));
            }

            let mut raw = buf.split_to(total);
            raw.advance(3);
            let packet_type = raw.get_u8();
            let opcode = raw.get_u8();
            let payload = raw.split_to(length - 2).freeze();
            let crc = raw.get_u16();

            return ParseOutcome::Frame(Frame {
                markers,
                packet_type,
                opcode,
                payload,
                crc,
            });
        }
    }

    /// Parses a buffer that must contain exactly one frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = BytesMut::from(bytes);
        match Self::decode(&mut buf) {
            ParseOutcome::Frame(frame) if buf.is_empty() => Ok(frame),
            ParseOutcome::Frame(_) | ParseOutcome::Incomplete => {
                Err(ProtocolError::Truncated { len: bytes.len() })
            }
            ParseOutcome::Invalid(err) => Err(err),
        }
    }
}
