//! Decoding of hex-encoded crypto key material.
//!
//! Keys arrive from administrative requests as hex strings. Decoding caps the
//! accepted input length and rejects odd-length or non-hex input before any
//! binary material is produced.

/// Default cap on the length of a hex-encoded key, in characters.
pub const MAX_KEY_HEX_LEN: usize = 1024;

/// Reasons hex key material can be rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HexError {
    #[error("key material is empty")]
    Empty,
    #[error("key material is {len} hex characters, exceeds maximum of {max}")]
    TooLong { len: usize, max: usize },
    #[error("key material has odd length {0}")]
    OddLength(usize),
    #[error("invalid hex character {c:?} at position {index}")]
    InvalidCharacter { c: char, index: usize },
}

/// Decodes `input` into binary key material.
///
/// `max_len` bounds the number of hex characters accepted; inputs of exactly
/// `max_len` characters are allowed.
///
/// # Errors
///
/// Returns a [`HexError`] if the input is empty, longer than `max_len`, of odd
/// length, or contains a non-hex character.
///
/// # Examples
///
/// ```
/// use offload_core::key_hex::{unhexlify, MAX_KEY_HEX_LEN};
///
/// assert_eq!(unhexlify("00ff10", MAX_KEY_HEX_LEN).unwrap(), vec![0x00, 0xff, 0x10]);
/// assert!(unhexlify("abc", MAX_KEY_HEX_LEN).is_err());
/// ```
pub fn unhexlify(input: &str, max_len: usize) -> Result<Vec<u8>, HexError> {
    let len = input.len();
    if len == 0 {
        return Err(HexError::Empty);
    }
    if len > max_len {
        return Err(HexError::TooLong { len, max: max_len });
    }
    hex::decode(input).map_err(|e| match e {
        hex::FromHexError::InvalidHexCharacter { c, index } => {
            HexError::InvalidCharacter { c, index }
        }
        hex::FromHexError::OddLength | hex::FromHexError::InvalidStringLength => {
            HexError::OddLength(len)
        }
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn decodes_mixed_case() {
        assert_eq!(
            unhexlify("DeadBEEF", MAX_KEY_HEX_LEN).unwrap(),
            vec![0xde, 0xad, 0xbe, 0xef]
        );
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(unhexlify("", MAX_KEY_HEX_LEN), Err(HexError::Empty));
    }

    #[test]
    fn rejects_odd_length() {
        assert_eq!(unhexlify("abc", MAX_KEY_HEX_LEN), Err(HexError::OddLength(3)));
    }

    #[test]
    fn rejects_non_hex() {
        assert_eq!(
            unhexlify("zz00", MAX_KEY_HEX_LEN),
            Err(HexError::InvalidCharacter { c: 'z', index: 0 })
        );
    }

    #[test]
    fn length_cap_is_inclusive() {
        let at_cap = "ab".repeat(4);
        assert_eq!(unhexlify(&at_cap, 8).unwrap().len(), 4);

        let over_cap = "ab".repeat(5);
        assert_eq!(
            unhexlify(&over_cap, 8),
            Err(HexError::TooLong { len: 10, max: 8 })
        );
    }

    proptest! {
        #[test]
        fn decodes_what_hex_encodes(bytes in proptest::collection::vec(any::<u8>(), 1..256)) {
            let encoded = hex::encode(&bytes);
            prop_assert_eq!(unhexlify(&encoded, MAX_KEY_HEX_LEN).unwrap(), bytes);
        }

        #[test]
        fn odd_lengths_never_decode(s in "[0-9a-f]{1,101}") {
            prop_assume!(s.len() % 2 == 1);
            prop_assert_eq!(unhexlify(&s, MAX_KEY_HEX_LEN), Err(HexError::OddLength(s.len())));
        }
    }
}
