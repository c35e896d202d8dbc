//! Regional RF parameter tables
//!
//! One immutable [`RegionParams`] value per regulatory region, constructed
//! once and passed by reference into frame processing. Nothing here mutates
//! after construction; the processor holds the selected region for the
//! duration of a frame and callers may cache the selection per gateway.
//!
//! Region selection is frequency-range matching over an explicitly ordered
//! list ([`RegionSet`]); where declared ranges overlap (US915 vs AS923),
//! the configured order decides and the first match wins.

mod as923;
mod au915;
mod cn470;
mod eu868;
mod us915;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LnsError;

pub use as923::as923;
pub use au915::au915;
pub use cn470::{cn470, Cn470Plan};
pub use eu868::eu868;
pub use us915::us915;

/// Region identifier used in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RegionName {
    Eu868,
    Us915,
    Au915,
    Cn470,
    As923,
}

impl FromStr for RegionName {
    type Err = LnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EU868" => Ok(RegionName::Eu868),
            "US915" => Ok(RegionName::Us915),
            "AU915" => Ok(RegionName::Au915),
            "CN470" => Ok(RegionName::Cn470),
            "AS923" => Ok(RegionName::As923),
            other => Err(LnsError::Config(format!("unknown region: {other}"))),
        }
    }
}

impl std::fmt::Display for RegionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RegionName::Eu868 => "EU868",
            RegionName::Us915 => "US915",
            RegionName::Au915 => "AU915",
            RegionName::Cn470 => "CN470",
            RegionName::As923 => "AS923",
        };
        f.write_str(s)
    }
}

/// Modulation settings behind a datarate index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modulation {
    Lora { spreading_factor: u8, bandwidth_khz: u32 },
    Fsk { bitrate: u32 },
}

/// One row of the datarate table
#[derive(Debug, Clone)]
pub struct DatarateConfig {
    pub modulation: Modulation,
    /// Maximum application payload size (N) in bytes
    pub max_payload: u32,
}

/// Helper for LoRa datarate rows
pub(crate) const fn lora(spreading_factor: u8, bandwidth_khz: u32, max_payload: u32) -> Option<DatarateConfig> {
    Some(DatarateConfig {
        modulation: Modulation::Lora {
            spreading_factor,
            bandwidth_khz,
        },
        max_payload,
    })
}

/// How the downstream RX1 frequency is derived from the upstream one
#[derive(Debug, Clone)]
pub enum DownstreamPlan {
    /// Fixed-channel regions answer on the uplink frequency (EU868, AS923)
    Echo,
    /// Frequency-hopping regions fold the upstream channel number onto a
    /// small downstream channel table (US915, AU915)
    ChannelGrid {
        slow_base: u32,
        slow_step: u32,
        /// Number of 125 kHz channels before the fast block
        slow_count: u32,
        fast_base: u32,
        fast_step: u32,
        /// Datarate index that marks a fast (500 kHz) channel
        fast_dr: u8,
        down_base: u32,
        down_step: u32,
        down_count: u32,
    },
    /// Channel-plan-indexed regions map the upstream channel number through
    /// a plan-specific downstream base (CN470 variants)
    JoinIndexed {
        up_base: u32,
        step: u32,
        down_base: u32,
        down_count: u32,
    },
}

/// Immutable parameter set for one regulatory region
#[derive(Debug, Clone)]
pub struct RegionParams {
    pub name: RegionName,
    /// Valid upstream frequency bounds in Hz, inclusive
    pub frequency_min: u32,
    pub frequency_max: u32,
    /// Datarate table indexed by DR; `None` marks an invalid index
    pub datarates: Vec<Option<DatarateConfig>>,
    /// Datarate indexes legal on the uplink
    pub valid_uplink_drs: Vec<u8>,
    /// Datarate indexes legal on the downlink
    pub valid_downlink_drs: Vec<u8>,
    /// RX1 offset matrix: `[upstream DR][RX1DROffset] -> downstream DR`
    pub rx1_offset_matrix: Vec<Vec<u8>>,
    /// TXPower index to EIRP in dBm
    pub tx_power_eirp: Vec<i8>,
    pub rx2_frequency: u32,
    pub rx2_datarate: u8,
    pub receive_delay1: Duration,
    pub receive_delay2: Duration,
    pub join_accept_delay1: Duration,
    pub join_accept_delay2: Duration,
    /// Maximum permissible uplink frame-counter gap
    pub max_fcnt_gap: u32,
    pub adr_ack_limit: u32,
    pub adr_ack_delay: u32,
    pub plan: DownstreamPlan,
}

impl RegionParams {
    /// RX1 downstream frequency for an observed uplink
    pub fn downstream_frequency(&self, up_frequency: u32, up_datarate: u8) -> u32 {
        match &self.plan {
            DownstreamPlan::Echo => up_frequency,
            DownstreamPlan::ChannelGrid {
                slow_base,
                slow_step,
                slow_count,
                fast_base,
                fast_step,
                fast_dr,
                down_base,
                down_step,
                down_count,
            } => {
                let channel = if up_datarate == *fast_dr {
                    slow_count + round_div(up_frequency.saturating_sub(*fast_base), *fast_step)
                } else {
                    round_div(up_frequency.saturating_sub(*slow_base), *slow_step)
                };
                down_base + (channel % down_count) * down_step
            },
            DownstreamPlan::JoinIndexed {
                up_base,
                step,
                down_base,
                down_count,
            } => {
                let channel = round_div(up_frequency.saturating_sub(*up_base), *step);
                down_base + (channel % down_count) * step
            },
        }
    }

    /// RX1 downstream datarate for an upstream datarate and RX1 offset
    ///
    /// Offsets or datarates outside the matrix bounds fall back to the
    /// upstream datarate unchanged.
    pub fn downstream_datarate(&self, up_datarate: u8, rx1_offset: u8) -> u8 {
        self.rx1_offset_matrix
            .get(up_datarate as usize)
            .and_then(|row| row.get(rx1_offset as usize))
            .copied()
            .unwrap_or(up_datarate)
    }

    /// Maximum application payload for a datarate index
    pub fn max_payload_size(&self, datarate: u8) -> Option<u32> {
        self.datarates
            .get(datarate as usize)
            .and_then(|d| d.as_ref())
            .map(|d| d.max_payload)
    }

    pub fn is_valid_frequency(&self, frequency: u32) -> bool {
        frequency >= self.frequency_min && frequency <= self.frequency_max
    }

    pub fn is_valid_uplink_datarate(&self, datarate: u8) -> bool {
        self.valid_uplink_drs.contains(&datarate)
    }

    /// EIRP for a TXPower index, if defined for this region
    pub fn eirp(&self, tx_power: u8) -> Option<i8> {
        self.tx_power_eirp.get(tx_power as usize).copied()
    }
}

/// Integer rounding division used by the channel-number arithmetic
fn round_div(value: u32, step: u32) -> u32 {
    (value + step / 2) / step
}

/// Ordered collection of constructed regions
///
/// Selection walks the configured order and takes the first region whose
/// declared frequency range contains the observed uplink frequency.
#[derive(Debug, Clone, Default)]
pub struct RegionSet {
    regions: Vec<Arc<RegionParams>>,
}

impl RegionSet {
    pub fn new(regions: Vec<Arc<RegionParams>>) -> Self {
        Self { regions }
    }

    pub fn select(&self, frequency: u32) -> Option<Arc<RegionParams>> {
        self.regions
            .iter()
            .find(|r| r.is_valid_frequency(frequency))
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn names(&self) -> Vec<RegionName> {
        self.regions.iter().map(|r| r.name).collect()
    }
}
