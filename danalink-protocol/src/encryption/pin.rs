//! Pin pair shown by RSv3 pumps during pairing.

use crate::error::ProtocolError;

/// Pairing keys entered by the user from the pump display.
///
/// The first pin is 12 hex digits (the pairing key). The second is 8 hex
/// digits: the random pairing key followed by a checksum byte that XORs
/// all nine key bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinPair {
    pub pairing_key: [u8; 6],
    pub random_pairing_key: [u8; 3],
}

impl PinPair {
    pub fn parse(pin1: &str, pin2: &str) -> Result<Self, ProtocolError> {
        let pin1 = pin1.trim();
        let pin2 = pin2.trim();
        if pin1.len() != 12 {
            return Err(ProtocolError::InvalidPin("first pin must be 12 hex digits"));
        }
        if pin2.len() != 8 {
            return Err(ProtocolError::InvalidPin("second pin must be 8 hex digits"));
        }

        let mut pairing_key = [0u8; 6];
        hex::decode_to_slice(pin1, &mut pairing_key)
            .map_err(|_| ProtocolError::InvalidPin("first pin is not hexadecimal"))?;
        let mut tail = [0u8; 4];
        hex::decode_to_slice(pin2, &mut tail)
            .map_err(|_| ProtocolError::InvalidPin("second pin is not hexadecimal"))?;

        let random_pairing_key = [tail[0], tail[1], tail[2]];
        let checksum = pairing_key
            .iter()
            .chain(random_pairing_key.iter())
            .fold(0u8, |acc, b| acc ^ b);
        if checksum != tail[3] {
            return Err(ProtocolError::InvalidPin("checksum mismatch"));
        }

        Ok(Self {
            pairing_key,
            random_pairing_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        // 01^02^03^04^05^06^0a^0b^0c = 0x0a
        let pin = PinPair::parse("010203040506", "0a0b0c0a").unwrap();
        assert_eq!(pin.pairing_key, [1, 2, 3, 4, 5, 6]);
        assert_eq!(pin.random_pairing_key, [0x0A, 0x0B, 0x0C]);
    }

    #[test]
    fn test_parse_uppercase_and_whitespace() {
        let err = PinPair::parse(" A1B2C3D4E5F6 ", "112233FF").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPin("checksum mismatch")));

        // a1^b2^c3^d4^e5^f6^11^22^33 = 0x17
        let pin = PinPair::parse(" A1B2C3D4E5F6 ", "11223317").unwrap();
        assert_eq!(pin.random_pairing_key, [0x11, 0x22, 0x33]);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(PinPair::parse("0102030405", "0a0b0c0f").is_err());
        assert!(PinPair::parse("010203040506", "0a0b0c").is_err());
        assert!(PinPair::parse("01020304050g", "0a0b0c0f").is_err());
        assert!(PinPair::parse("010203040506", "0a0b0c0e").is_err());
    }
}
