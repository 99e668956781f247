//! Second-level transforms applied to whole frames once a session is up.
//!
//! RSv3 chains every byte through the rolling sync byte, so encoder and
//! decoder must each see every byte of their direction in order. BLE5 is a
//! stateless per-byte transform.

use super::lookup::{LONG, SHORT};
use crate::error::ProtocolError;
use crate::frame::MarkerPair;
use crate::packet::Generation;

/// Keys for the RSv3 chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Rsv3Keys {
    pub pairing_key: [u8; 6],
    pub random_pairing_key: [u8; 3],
}

fn swap(b: u8) -> u8 {
    b.rotate_left(4)
}

/// Rewrites plaintext markers to the generation's session markers.
///
/// Only a leading `A5 A5` and a trailing `5A 5A` are rewritten.
pub fn apply_session_markers(buf: &mut [u8], generation: Generation) {
    let markers = MarkerPair::for_generation(generation);
    let plain = MarkerPair::Plain;
    let len = buf.len();
    if len < 4 || markers == plain {
        return;
    }
    if buf[0] == plain.start() && buf[1] == plain.start() {
        buf[0] = markers.start();
        buf[1] = markers.start();
    }
    if buf[len - 2] == plain.end() && buf[len - 1] == plain.end() {
        buf[len - 2] = markers.end();
        buf[len - 1] = markers.end();
    }
}

/// Encodes `buf` in place and returns the updated sync byte.
pub(crate) fn rsv3_encode(buf: &mut [u8], keys: &Rsv3Keys, mut sync: u8) -> u8 {
    let pk = keys.pairing_key;
    let rpk = keys.random_pairing_key;

    for byte in buf.iter_mut() {
        let mut b = *byte;
        b ^= pk[0];
        b = b.wrapping_sub(sync);
        b = swap(b);
        b = b.wrapping_add(pk[1]);
        b ^= pk[2];
        b = swap(b);
        b = b.wrapping_sub(pk[3]);
        b ^= pk[4];
        b = swap(b);
        b ^= pk[5];
        b ^= sync;
        b ^= LONG[pk[0] as usize];
        b = b.wrapping_add(LONG[pk[1] as usize]);
        b = b.wrapping_sub(LONG[pk[2] as usize]);
        b = swap(b);
        b ^= LONG[pk[3] as usize];
        b = b.wrapping_add(LONG[pk[4] as usize]);
        b = b.wrapping_sub(LONG[pk[5] as usize]);
        b ^= LONG[rpk[0] as usize];
        b = b.wrapping_add(LONG[rpk[1] as usize]);
        b = b.wrapping_sub(LONG[rpk[2] as usize]);

        *byte = b;
        sync = b;
    }
    sync
}

/// Inverse of [`rsv3_encode`]; the sync byte follows the cipher bytes.
pub(crate) fn rsv3_decode(buf: &mut [u8], keys: &Rsv3Keys, mut sync: u8) -> u8 {
    let pk = keys.pairing_key;
    let rpk = keys.random_pairing_key;

    for byte in buf.iter_mut() {
        let cipher = *byte;
        let mut b = cipher;
        b = b.wrapping_add(LONG[rpk[2] as usize]);
        b = b.wrapping_sub(LONG[rpk[1] as usize]);
        b ^= LONG[rpk[0] as usize];
        b = b.wrapping_add(LONG[pk[5] as usize]);
        b = b.wrapping_sub(LONG[pk[4] as usize]);
        b ^= LONG[pk[3] as usize];
        b = swap(b);
        b = b.wrapping_add(LONG[pk[2] as usize]);
        b = b.wrapping_sub(LONG[pk[1] as usize]);
        b ^= LONG[pk[0] as usize];
        b ^= sync;
        b ^= pk[5];
        b = swap(b);
        b ^= pk[4];
        b = b.wrapping_add(pk[3]);
        b = swap(b);
        b ^= pk[2];
        b = b.wrapping_sub(pk[1]);
        b = swap(b);
        b = b.wrapping_add(sync);
        b ^= pk[0];

        *byte = b;
        sync = cipher;
    }
    sync
}

pub(crate) fn ble5_encode(buf: &mut [u8], keys: [u8; 3]) {
    for byte in buf.iter_mut() {
        let b = swap(byte.wrapping_add(keys[0]));
        *byte = b.wrapping_sub(keys[1]) ^ keys[2];
    }
}

pub(crate) fn ble5_decode(buf: &mut [u8], keys: [u8; 3]) {
    for byte in buf.iter_mut() {
        let b = (*byte ^ keys[2]).wrapping_add(keys[1]);
        *byte = swap(b).wrapping_sub(keys[0]);
    }
}

/// Derives BLE5 session keys from six ASCII digits.
pub(crate) fn ble5_keys(material: &[u8]) -> Result<[u8; 3], ProtocolError> {
    if material.len() != 6 {
        return Err(ProtocolError::InvalidSessionKeys("key material must be 6 bytes"));
    }
    if material.contains(&0) {
        return Err(ProtocolError::InvalidSessionKeys("zero byte in key material"));
    }
    if !material.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::InvalidSessionKeys("key material is not decimal"));
    }

    let index = |hi: u8, lo: u8| ((hi - b'0') * 10 + (lo - b'0')) as usize;
    Ok([
        SHORT[index(material[0], material[1])],
        SHORT[index(material[2], material[3])],
        SHORT[index(material[4], material[5])],
    ])
}

/// Sync byte for a freshly paired pump.
pub(crate) fn initial_sync_key(pairing_key: &[u8; 6]) -> u8 {
    pairing_key
        .iter()
        .fold(0u8, |acc, b| acc.rotate_left(1) ^ LONG[*b as usize])
}

/// Recovers the live sync byte from its stored form.
pub(crate) fn decrypt_sync_key(stored: u8, random_pairing_key: &[u8; 3]) -> u8 {
    let [r0, r1, r2] = random_pairing_key.map(|b| LONG[b as usize]);
    swap(stored ^ r2).wrapping_sub(r1) ^ r0
}

/// Stored form of a live sync byte; inverse of [`decrypt_sync_key`].
pub(crate) fn encrypt_sync_key(sync: u8, random_pairing_key: &[u8; 3]) -> u8 {
    let [r0, r1, r2] = random_pairing_key.map(|b| LONG[b as usize]);
    swap((sync ^ r0).wrapping_add(r1)) ^ r2
}
