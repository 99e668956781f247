//! Link checksum used by the pump firmware.
//!
//! A 16-bit CCITT-like checksum whose final scramble depends on the
//! negotiated generation and on whether the frame is a handshake frame.
//! It is a compatibility checksum only and must match the firmware bit
//! for bit.

use crate::packet::Generation;

/// Computes the frame checksum over `bytes` (`[type, opcode, payload..]`).
pub fn crc16(bytes: &[u8], generation: Generation, handshake: bool) -> u16 {
    let mut crc: u16 = 0;

    for &byte in bytes {
        let mut acc = crc.rotate_left(8) ^ u16::from(byte);
        acc ^= (acc & 0xFF) >> 4;
        acc ^= acc << 12;

        let low = acc & 0xFF;
        let scramble = match (generation, handshake) {
            (Generation::Default, _) | (_, true) => (low << 3) | ((low >> 2) << 5),
            (Generation::Generation2, false) => (low << 5) | ((low >> 4) << 2),
            (Generation::Generation3, false) => (low << 4) | ((low >> 3) << 2),
        };
        crc = acc ^ scramble;
    }

    crc
}
