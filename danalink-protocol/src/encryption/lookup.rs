//! Substitution tables for the second-level transforms.
//!
//! Both tables are fixed for the lifetime of the firmware. They are
//! generated at compile time from a byte-wide xorshift sequence so that
//! every entry is reproducible from the seed alone.

/// Table indexed by pairing-key bytes (RSv3 chain).
pub const LONG: [u8; 256] = generate::<256>(0x5D);

/// Table indexed by two-digit decimal key material (BLE5).
pub const SHORT: [u8; 100] = generate::<100>(0xA3);

const fn generate<const N: usize>(seed: u8) -> [u8; N] {
    let mut table = [0u8; N];
    let mut state = seed;
    let mut i = 0;
    while i < N {
        state ^= state << 3;
        state ^= state >> 5;
        state ^= state << 1;
        table[i] = state ^ (i as u8).rotate_left(3);
        i += 1;
    }
    table
}
