//! CN470-510 regional parameters
//!
//! Four channel plans; a device's plan is fixed by the channel it joined
//! on, so one `RegionParams` is constructed per configured plan and the
//! downstream lookup folds the upstream channel number onto that plan's
//! downstream table.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{lora, DatarateConfig, DownstreamPlan, RegionName, RegionParams};

/// CN470 channel plan selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Cn470Plan {
    /// 20 MHz antenna plan A: uplink from 470.3 MHz, downlink from 483.9 MHz
    #[default]
    A20,
    /// 20 MHz antenna plan B: uplink from 476.9 MHz, downlink from 490.3 MHz
    B20,
    /// 26 MHz antenna plan A: uplink from 470.3 MHz, downlink from 490.1 MHz
    A26,
    /// 26 MHz antenna plan B: uplink from 480.3 MHz, downlink from 502.5 MHz
    B26,
}

/// Construct the CN470 parameter set for one channel plan
pub fn cn470(plan: Cn470Plan) -> RegionParams {
    let datarates: Vec<Option<DatarateConfig>> = vec![
        lora(12, 125, 59),
        lora(11, 125, 59),
        lora(10, 125, 59),
        lora(9, 125, 123),
        lora(8, 125, 230),
        lora(7, 125, 230),
    ];

    let rx1_offset_matrix = (0u8..=5)
        .map(|dr| (0u8..=5).map(|off| dr.saturating_sub(off)).collect())
        .collect();

    let plan = match plan {
        Cn470Plan::A20 => DownstreamPlan::JoinIndexed {
            up_base: 470_300_000,
            step: 200_000,
            down_base: 483_900_000,
            down_count: 32,
        },
        Cn470Plan::B20 => DownstreamPlan::JoinIndexed {
            up_base: 476_900_000,
            step: 200_000,
            down_base: 490_300_000,
            down_count: 32,
        },
        Cn470Plan::A26 => DownstreamPlan::JoinIndexed {
            up_base: 470_300_000,
            step: 200_000,
            down_base: 490_100_000,
            down_count: 24,
        },
        Cn470Plan::B26 => DownstreamPlan::JoinIndexed {
            up_base: 480_300_000,
            step: 200_000,
            down_base: 502_500_000,
            down_count: 24,
        },
    };

    RegionParams {
        name: RegionName::Cn470,
        frequency_min: 470_000_000,
        frequency_max: 510_000_000,
        datarates,
        valid_uplink_drs: (0..=5).collect(),
        valid_downlink_drs: (0..=5).collect(),
        rx1_offset_matrix,
        // Max EIRP 19 dBm, 2 dB steps
        tx_power_eirp: (0..=7).map(|i| 19 - 2 * i).collect(),
        rx2_frequency: 505_300_000,
        rx2_datarate: 0,
        receive_delay1: Duration::from_secs(1),
        receive_delay2: Duration::from_secs(2),
        join_accept_delay1: Duration::from_secs(5),
        join_accept_delay2: Duration::from_secs(6),
        max_fcnt_gap: 16_384,
        adr_ack_limit: 64,
        adr_ack_delay: 32,
        plan,
    }
}
