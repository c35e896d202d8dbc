//! AU915-928 regional parameters
//!
//! Same channel-grid structure as US915 with shifted bases and the EU-style
//! SF12..SF7 upstream datarate ladder.

use std::time::Duration;

use super::{lora, DatarateConfig, DownstreamPlan, RegionName, RegionParams};

/// Construct the AU915 parameter set
pub fn au915() -> RegionParams {
    let datarates: Vec<Option<DatarateConfig>> = vec![
        lora(12, 125, 59),
        lora(11, 125, 59),
        lora(10, 125, 59),
        lora(9, 125, 123),
        lora(8, 125, 230),
        lora(7, 125, 230),
        lora(8, 500, 230),
        None, // DR7 reserved
        lora(12, 500, 41),
        lora(11, 500, 117),
        lora(10, 500, 230),
        lora(9, 500, 230),
        lora(8, 500, 230),
        lora(7, 500, 230),
    ];

    // RX1 DR = clamp(upstream DR + 8 - offset, 8, 13)
    let rx1_offset_matrix = (0u8..=6)
        .map(|dr| {
            (0u8..=5)
                .map(|off| (dr + 8).saturating_sub(off).clamp(8, 13))
                .collect()
        })
        .collect();

    RegionParams {
        name: RegionName::Au915,
        frequency_min: 915_000_000,
        frequency_max: 928_000_000,
        datarates,
        valid_uplink_drs: (0..=6).collect(),
        valid_downlink_drs: (8..=13).collect(),
        rx1_offset_matrix,
        tx_power_eirp: (0..=10).map(|i| 30 - 2 * i).collect(),
        rx2_frequency: 923_300_000,
        rx2_datarate: 8,
        receive_delay1: Duration::from_secs(1),
        receive_delay2: Duration::from_secs(2),
        join_accept_delay1: Duration::from_secs(5),
        join_accept_delay2: Duration::from_secs(6),
        max_fcnt_gap: 16_384,
        adr_ack_limit: 64,
        adr_ack_delay: 32,
        plan: DownstreamPlan::ChannelGrid {
            slow_base: 915_200_000,
            slow_step: 200_000,
            slow_count: 64,
            fast_base: 915_900_000,
            fast_step: 1_600_000,
            fast_dr: 6,
            down_base: 923_300_000,
            down_step: 600_000,
            down_count: 8,
        },
    }
}
