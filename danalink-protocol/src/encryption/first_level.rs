//! First-level transform.
//!
//! Every frame is XORed with a three-byte stream derived from the device
//! name, over the bytes between the length byte and the end markers. On
//! the DEFAULT generation ordinary commands additionally pass their payload
//! through three keyed stages (time, password, passkey).

/// Offset of the packet type byte; the serial stream starts here.
const BODY_OFFSET: usize = 3;

/// Offset of the first payload byte.
const PAYLOAD_OFFSET: usize = 5;

/// Time-information payload bytes 1..4 sent to BLE5 pumps.
pub(crate) const BLE5_TIME_INFORMATION: [u8; 3] = [0x17 ^ 0x1A, 0xD1 ^ 0xC0, 0xAF ^ 0xA9];

/// Derives the serial-number stream from a ten-byte device name.
pub(crate) fn serial_stream(name: &[u8; 10]) -> [u8; 3] {
    let sum = |bytes: &[u8]| bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    [sum(&name[0..3]), sum(&name[3..8]), sum(&name[8..10])]
}

/// Key applied to check-passkey and passkey-return payload bytes.
pub(crate) fn passkey_mask(stream: &[u8; 3]) -> u8 {
    stream[0].wrapping_add(stream[1]).wrapping_add(stream[2])
}

/// XORs the serial stream over a complete frame. Self-inverse.
pub(crate) fn apply_serial_stream(frame: &mut [u8], stream: &[u8; 3]) {
    let Some(end) = frame.len().checked_sub(2) else {
        return;
    };
    if end <= BODY_OFFSET {
        return;
    }
    for (i, byte) in frame[BODY_OFFSET..end].iter_mut().enumerate() {
        *byte ^= stream[i % 3];
    }
}

fn payload_range(frame: &[u8]) -> std::ops::Range<usize> {
    // 2 CRC bytes and 2 end markers trail the payload.
    let end = frame.len().saturating_sub(4).max(PAYLOAD_OFFSET);
    PAYLOAD_OFFSET..end
}

/// Applies the time, password and passkey stages, in that order.
pub(crate) fn scramble_payload(frame: &mut [u8], time: &[u8], password: &[u8], passkey: &[u8]) {
    let range = payload_range(frame);
    let payload = &mut frame[range];

    if !time.is_empty() {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= time[i % time.len()];
        }
    }
    if !password.is_empty() {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte = (*byte ^ password[i % password.len()]).rotate_left(1);
        }
    }
    if !passkey.is_empty() {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte = byte.wrapping_add(passkey[i % passkey.len()]).rotate_left(4);
        }
    }
}

/// Undoes [`scramble_payload`], stages in reverse order.
pub(crate) fn unscramble_payload(frame: &mut [u8], time: &[u8], password: &[u8], passkey: &[u8]) {
    let range = payload_range(frame);
    let payload = &mut frame[range];

    if !passkey.is_empty() {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte = byte.rotate_right(4).wrapping_sub(passkey[i % passkey.len()]);
        }
    }
    if !password.is_empty() {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte = byte.rotate_right(1) ^ password[i % password.len()];
        }
    }
    if !time.is_empty() {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= time[i % time.len()];
        }
    }
}
