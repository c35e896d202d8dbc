//! Shared bootstrap utilities for the LoRaWAN network-server service
//!
//! Small, service-agnostic pieces: logging initialization, hex helpers for
//! keys/EUIs, and graceful shutdown handling.

pub mod hex;
pub mod logging;
pub mod shutdown;
