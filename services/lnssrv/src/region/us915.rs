//! US902-928 regional parameters
//!
//! 64 upstream 125 kHz channels starting at 902.3 MHz plus 8 upstream
//! 500 kHz channels starting at 903.0 MHz; downstream answers fold the
//! upstream channel number onto the 8 channels starting at 923.3 MHz.

use std::time::Duration;

use super::{lora, DatarateConfig, DownstreamPlan, RegionName, RegionParams};

/// Construct the US915 parameter set
pub fn us915() -> RegionParams {
    let datarates: Vec<Option<DatarateConfig>> = vec![
        lora(10, 125, 19),
        lora(9, 125, 61),
        lora(8, 125, 133),
        lora(7, 125, 250),
        lora(8, 500, 250),
        None, // DR5-7 reserved
        None,
        None,
        lora(12, 500, 41),
        lora(11, 500, 117),
        lora(10, 500, 230),
        lora(9, 500, 230),
        lora(8, 500, 230),
        lora(7, 500, 230),
    ];

    RegionParams {
        name: RegionName::Us915,
        frequency_min: 902_000_000,
        frequency_max: 928_000_000,
        datarates,
        valid_uplink_drs: (0..=4).collect(),
        valid_downlink_drs: (8..=13).collect(),
        rx1_offset_matrix: vec![
            vec![10, 9, 8, 8],
            vec![11, 10, 9, 8],
            vec![12, 11, 10, 9],
            vec![13, 12, 11, 10],
            vec![13, 13, 12, 11],
        ],
        // Max EIRP 30 dBm, 2 dB steps
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
            slow_base: 902_300_000,
            slow_step: 200_000,
            slow_count: 64,
            fast_base: 903_000_000,
            fast_step: 1_600_000,
            fast_dr: 4,
            down_base: 923_300_000,
            down_step: 600_000,
            down_count: 8,
        },
    }
}
