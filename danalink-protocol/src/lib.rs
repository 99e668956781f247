//! # danalink-protocol
//!
//! Wire protocol for Dana insulin pumps over BLE.
//!
//! This crate provides:
//! - Binary framing with start/end markers and the firmware CRC16
//! - A receive accumulator that resynchronizes on corrupted input
//! - The two-level encryption context (DEFAULT, RSv3 and BLE5 generations)
//! - Packet constants and the command codec registry

pub mod codec;
pub mod crc;
pub mod encryption;
pub mod error;
pub mod frame;
pub mod packet;
pub mod registry;

pub use codec::{Encoder, ReceiveAccumulator, DEFAULT_WRITE_LIMIT};
pub use crc::crc16;
pub use encryption::{
    apply_session_markers, password_from_time_information, EncryptionContext, PinPair,
    SessionSecrets, DEVICE_NAME_LEN, PASSWORD_MASK,
};
pub use error::ProtocolError;
pub use frame::{Frame, MarkerPair, ParseOutcome, FRAME_OVERHEAD, MAX_PAYLOAD_SIZE};
pub use packet::{Generation, Packet, PacketType};
pub use registry::{CommandCodec, CommandRegistry, InitialScreenInformation, ParsedResponse, ResponseValue};
