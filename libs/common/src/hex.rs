//! Hex encoding/decoding utilities
//!
//! Device EUIs, session keys and network addresses all travel through twin
//! configuration as hex strings, so decoding has to be strict about length
//! and character set.

use std::fmt::Write;

use thiserror::Error;

/// Errors produced when decoding hex strings from device configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HexError {
    #[error("odd number of hex digits: {0}")]
    OddLength(usize),
    #[error("invalid hex character {0:?} at offset {1}")]
    InvalidChar(char, usize),
    #[error("expected {expected} bytes, got {actual}")]
    WrongLength { expected: usize, actual: usize },
}

/// Encode bytes to uppercase hex string
/// Example: [0x12, 0x34, 0xAB] -> "1234AB"
pub fn encode_upper(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 2);
    for byte in data {
        // Writing to a String buffer is infallible
        let _ = write!(&mut result, "{:02X}", byte);
    }
    result
}

/// Decode a hex string into bytes, accepting both cases
pub fn decode(input: &str) -> Result<Vec<u8>, HexError> {
    if input.len() % 2 != 0 {
        return Err(HexError::OddLength(input.len()));
    }
    let mut out = Vec::with_capacity(input.len() / 2);
    let bytes = input.as_bytes();
    for i in (0..bytes.len()).step_by(2) {
        let hi = digit(bytes[i]).ok_or(HexError::InvalidChar(bytes[i] as char, i))?;
        let lo = digit(bytes[i + 1]).ok_or(HexError::InvalidChar(bytes[i + 1] as char, i + 1))?;
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

/// Decode a hex string into a fixed-size array
pub fn decode_array<const N: usize>(input: &str) -> Result<[u8; N], HexError> {
    let bytes = decode(input)?;
    let actual = bytes.len();
    bytes.try_into().map_err(|_| HexError::WrongLength {
        expected: N,
        actual,
    })
}

fn digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_upper_basic() {
        assert_eq!(encode_upper(&[0x12, 0x34, 0xAB]), "1234AB");
    }

    #[test]
    fn test_encode_upper_empty() {
        assert_eq!(encode_upper(&[]), "");
    }

    #[test]
    fn test_decode_roundtrip() {
        let data = [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF];
        assert_eq!(decode(&encode_upper(&data)).unwrap(), data);
    }

    #[test]
    fn test_decode_mixed_case() {
        assert_eq!(decode("aAbB").unwrap(), vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_decode_odd_length() {
        assert_eq!(decode("ABC"), Err(HexError::OddLength(3)));
    }

    #[test]
    fn test_decode_invalid_char() {
        assert_eq!(decode("0G"), Err(HexError::InvalidChar('G', 1)));
    }

    #[test]
    fn test_decode_array_wrong_length() {
        let err = decode_array::<4>("ABCD").unwrap_err();
        assert_eq!(
            err,
            HexError::WrongLength {
                expected: 4,
                actual: 2
            }
        );
    }
}
