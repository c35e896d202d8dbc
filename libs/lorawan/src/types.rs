//! Identifier and key newtypes
//!
//! All of these cross two representations: hex strings in device
//! configuration (most-significant byte first) and little-endian byte order
//! on the air. The newtypes keep the two from being mixed up.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use common::hex::{self, HexError};

/// 64-bit extended unique identifier (DevEUI / AppEUI)
///
/// Stored most-significant byte first; `to_le_bytes` flips for the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Eui64([u8; 8]);

impl Eui64 {
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Byte order used inside frames
    pub fn to_le_bytes(self) -> [u8; 8] {
        let mut out = self.0;
        out.reverse();
        out
    }

    pub fn from_le_bytes(mut bytes: [u8; 8]) -> Self {
        bytes.reverse();
        Self(bytes)
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(&self.0))
    }
}

impl FromStr for Eui64 {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(hex::decode_array(s)?))
    }
}

impl TryFrom<String> for Eui64 {
    type Error = HexError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Eui64> for String {
    fn from(v: Eui64) -> Self {
        v.to_string()
    }
}

/// 32-bit short network address (DevAddr)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DevAddr(u32);

impl DevAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }

    /// The 7-bit network identifier in the address prefix
    pub fn nwk_id(self) -> u8 {
        (self.0 >> 25) as u8
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(&self.0.to_be_bytes()))
    }
}

impl FromStr for DevAddr {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(u32::from_be_bytes(hex::decode_array(s)?)))
    }
}

impl TryFrom<String> for DevAddr {
    type Error = HexError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DevAddr> for String {
    fn from(v: DevAddr) -> Self {
        v.to_string()
    }
}

/// 128-bit AES key (AppKey / NwkSKey / AppSKey)
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AesKey([u8; 16]);

impl AesKey {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

// Keys never appear in logs
impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(****)")
    }
}

impl fmt::Display for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(&self.0))
    }
}

impl FromStr for AesKey {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(hex::decode_array(s)?))
    }
}

impl TryFrom<String> for AesKey {
    type Error = HexError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<AesKey> for String {
    fn from(v: AesKey) -> Self {
        v.to_string()
    }
}

/// 16-bit device nonce from a join request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevNonce(pub u16);

impl DevNonce {
    pub fn to_le_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_le_bytes(bytes))
    }
}

impl fmt::Display for DevNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

/// 24-bit application nonce generated by the network for a join accept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppNonce(pub [u8; 3]);

/// 24-bit network identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetId(pub [u8; 3]);

impl NetId {
    /// Low 7 bits, used as the DevAddr prefix
    pub fn nwk_id(self) -> u8 {
        self.0[2] & 0x7F
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(&self.0))
    }
}

impl FromStr for NetId {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(hex::decode_array(s)?))
    }
}

impl TryFrom<String> for NetId {
    type Error = HexError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<NetId> for String {
    fn from(v: NetId) -> Self {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eui_display_roundtrip() {
        let eui: Eui64 = "0004A30B001FBE4A".parse().unwrap();
        assert_eq!(eui.to_string(), "0004A30B001FBE4A");
    }

    #[test]
    fn eui_wire_order_is_reversed() {
        let eui: Eui64 = "0102030405060708".parse().unwrap();
        assert_eq!(
            eui.to_le_bytes(),
            [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
        assert_eq!(Eui64::from_le_bytes(eui.to_le_bytes()), eui);
    }

    #[test]
    fn dev_addr_parse_and_nwk_id() {
        let addr: DevAddr = "26011F22".parse().unwrap();
        assert_eq!(addr.as_u32(), 0x2601_1F22);
        assert_eq!(addr.nwk_id(), 0x13);
        assert_eq!(addr.to_string(), "26011F22");
    }

    #[test]
    fn aes_key_debug_is_masked() {
        let key: AesKey = "000102030405060708090A0B0C0D0E0F".parse().unwrap();
        assert_eq!(format!("{:?}", key), "AesKey(****)");
        assert_eq!(key.to_string(), "000102030405060708090A0B0C0D0E0F");
    }

    #[test]
    fn net_id_nwk_id_masks_high_bit() {
        let net_id: NetId = "0000FF".parse().unwrap();
        assert_eq!(net_id.nwk_id(), 0x7F);
    }
}
