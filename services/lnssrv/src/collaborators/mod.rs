//! External collaborator interfaces
//!
//! The core consumes four external systems and produces to one sink. Each
//! is an async trait here; production deployments plug in their cloud
//! backends while tests and local runs use the in-memory implementations
//! from [`memory`].

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lorawan::{AesKey, DevAddr, DevNonce, Eui64};

pub use memory::{
    MemoryCounterService, MemoryDownlinkQueue, MemoryIdentityStore, MemorySearch,
    MemoryTelemetrySink,
};

/// Twin-style configuration and state fields for one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub dev_eui: Eui64,
    pub app_eui: Option<Eui64>,
    /// Application key; presence marks the device as OTAA
    pub app_key: Option<AesKey>,
    pub nwk_skey: Option<AesKey>,
    pub app_skey: Option<AesKey>,
    pub dev_addr: Option<DevAddr>,
    /// Owning gateway; empty/absent means any gateway may serve it
    pub gateway_id: Option<String>,
    /// Payload decoder identifier (e.g. "DecoderValueSensor")
    pub decoder: Option<String>,
    pub fcnt_up: u32,
    pub fcnt_down: u32,
    pub last_dev_nonce: Option<u16>,
    pub receive_delay1_secs: Option<u64>,
    pub receive_delay2_secs: Option<u64>,
    pub relaxed_fcnt: bool,
    pub prefer_second_window: bool,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            dev_eui: Eui64::new([0; 8]),
            app_eui: None,
            app_key: None,
            nwk_skey: None,
            app_skey: None,
            dev_addr: None,
            gateway_id: None,
            decoder: None,
            fcnt_up: 0,
            fcnt_down: 0,
            last_dev_nonce: None,
            receive_delay1_secs: None,
            receive_delay2_secs: None,
            relaxed_fcnt: false,
            prefer_second_window: false,
        }
    }
}

/// Partial update written back to the identity store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityUpdate {
    pub nwk_skey: Option<AesKey>,
    pub app_skey: Option<AesKey>,
    pub dev_addr: Option<DevAddr>,
    pub fcnt_up: Option<u32>,
    pub fcnt_down: Option<u32>,
    pub last_dev_nonce: Option<u16>,
}

impl IdentityUpdate {
    /// Counter-only update used by the persist path
    pub fn counters(fcnt_up: u32, fcnt_down: u32) -> Self {
        Self {
            fcnt_up: Some(fcnt_up),
            fcnt_down: Some(fcnt_down),
            ..Self::default()
        }
    }
}

/// Device identity store (cloud device twins or equivalent)
#[async_trait]
pub trait IdentityStore: Send + Sync + 'static {
    /// Fetch the stored identity for a device, if it exists
    async fn get_identity(&self, dev_eui: Eui64) -> anyhow::Result<Option<DeviceIdentity>>;

    /// Apply a partial update to the stored identity
    async fn update_identity(&self, dev_eui: Eui64, update: IdentityUpdate) -> anyhow::Result<()>;
}

/// Result of a device search query
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub devices: Vec<DeviceIdentity>,
    /// Set when the queried dev-nonce was already consumed (join replay)
    pub dev_nonce_already_used: bool,
}

/// Device search collaborator resolving frames to candidate devices
#[async_trait]
pub trait DeviceSearch: Send + Sync + 'static {
    /// All devices registered under a network address
    async fn by_address(&self, gateway_id: &str, dev_addr: DevAddr)
        -> anyhow::Result<SearchOutcome>;

    /// OTAA join resolution by (DevEUI, AppEUI, DevNonce)
    async fn by_join(
        &self,
        gateway_id: &str,
        dev_eui: Eui64,
        app_eui: Eui64,
        dev_nonce: DevNonce,
    ) -> anyhow::Result<SearchOutcome>;
}

/// Globally ordered downlink-counter allocation (multi-gateway mode)
#[async_trait]
pub trait CounterService: Send + Sync + 'static {
    /// Allocate the next downlink counter for a device, observed across all
    /// gateways serving it
    async fn next_downlink_counter(
        &self,
        dev_eui: Eui64,
        current_down: u32,
        current_up: u32,
        gateway_id: &str,
    ) -> anyhow::Result<u32>;

    /// Drop the externally cached counter state for an ABP device
    async fn reset_abp_counters(&self, dev_eui: Eui64) -> anyhow::Result<()>;
}

/// One pending cloud-to-device message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedDownlink {
    /// Delivery handle used for complete/abandon
    pub id: u64,
    pub fport: u8,
    pub payload: Vec<u8>,
    /// Request a confirmed downlink
    pub confirmed: bool,
}

/// Cloud-to-device queue with at-least-once delivery semantics
#[async_trait]
pub trait DownlinkQueue: Send + Sync + 'static {
    /// Wait up to `timeout` for a pending message addressed to the device
    async fn receive(
        &self,
        dev_eui: Eui64,
        timeout: Duration,
    ) -> anyhow::Result<Option<QueuedDownlink>>;

    /// Acknowledge delivery; the message will not be redelivered
    async fn complete(&self, dev_eui: Eui64, id: u64) -> anyhow::Result<()>;

    /// Return the message to the queue for redelivery on a later uplink
    async fn abandon(&self, dev_eui: Eui64, id: u64) -> anyhow::Result<()>;
}

/// Structured event published per successfully decoded uplink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkEvent {
    pub dev_eui: Eui64,
    pub gateway_id: String,
    pub received_at: DateTime<Utc>,
    pub fcnt: u32,
    pub fport: Option<u8>,
    /// Decoder identifier that produced `fields`
    pub decoder: String,
    pub fields: serde_json::Value,
}

/// Telemetry sink (produced to)
#[async_trait]
pub trait TelemetrySink: Send + Sync + 'static {
    async fn publish(&self, event: UplinkEvent) -> anyhow::Result<()>;
}
