//! LoRaWAN wire layer
//!
//! Everything that touches raw frame bytes lives here: identifier and key
//! newtypes, the physical-payload envelope (join request, data up, join
//! accept, data down), the MAC command codec and the AES/CMAC frame crypto.
//!
//! This crate is synchronous and allocation-light; the network-server
//! service layers async processing on top of it.

pub mod crypto;
pub mod maccmd;
pub mod phy;
pub mod types;

pub use maccmd::{MacCommand, MacError};
pub use phy::{
    DataDownBuilder, DataUpFrame, JoinAcceptBuilder, JoinRequestFrame, MType, Mhdr, ParsedFrame,
    WireError,
};
pub use types::{AesKey, AppNonce, DevAddr, DevNonce, Eui64, NetId};
