//! LoRaWAN Network-Server Core
//!
//! Terminates uplink radio frames relayed by packet-forwarder gateways,
//! authenticates and de-duplicates them against the device population,
//! advances per-device frame counters, decrypts and decodes application
//! payloads and, within the receive-window budget, decides whether and how
//! to answer with a downlink. Also drives the OTAA join handshake.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐   ┌──────────────────┐
//! │ Gateway      │──►│ MessageProcessor│──►│ Downlink frame   │
//! │ bridge (ext.)│   │  (state machine)│   │ (RX1/RX2 params) │
//! └──────────────┘   └───────┬────────┘   └──────────────────┘
//!                            │
//!        ┌─────────────┬─────┴──────┬─────────────┐
//!        ▼             ▼            ▼             ▼
//!  DeviceRegistry  RegionSet   TimeWatcher   Collaborators
//!  (DashMap cache) (immutable  (RX deadline  (identity store,
//!                   RF tables)  tracking)     C2D queue, ...)
//! ```
//!
//! The gateway transport, the device-identity store and the cloud-to-device
//! queue are external collaborators behind the traits in [`collaborators`];
//! in-memory implementations back the tests and local runs.

pub mod collaborators;
pub mod config;
pub mod decoder;
pub mod device;
pub mod error;
pub mod processor;
pub mod region;
pub mod registry;
pub mod timing;

pub use config::LnsConfig;
pub use error::{LnsError, Result};
pub use processor::{DownlinkFrame, MessageProcessor, UplinkContext};
