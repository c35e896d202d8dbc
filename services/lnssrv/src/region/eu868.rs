//! EU863-870 regional parameters

use std::time::Duration;

use super::{lora, DatarateConfig, DownstreamPlan, Modulation, RegionName, RegionParams};

/// Construct the EU868 parameter set
pub fn eu868() -> RegionParams {
    let datarates: Vec<Option<DatarateConfig>> = vec![
        lora(12, 125, 59),
        lora(11, 125, 59),
        lora(10, 125, 59),
        lora(9, 125, 123),
        lora(8, 125, 230),
        lora(7, 125, 230),
        lora(7, 250, 230),
        Some(DatarateConfig {
            modulation: Modulation::Fsk { bitrate: 50_000 },
            max_payload: 230,
        }),
    ];

    // RX1 DR = max(0, upstream DR - offset)
    let rx1_offset_matrix = (0u8..=7)
        .map(|dr| (0u8..=5).map(|off| dr.saturating_sub(off)).collect())
        .collect();

    RegionParams {
        name: RegionName::Eu868,
        frequency_min: 863_000_000,
        frequency_max: 870_000_000,
        datarates,
        valid_uplink_drs: (0..=7).collect(),
        valid_downlink_drs: (0..=7).collect(),
        rx1_offset_matrix,
        // Max EIRP 16 dBm, 2 dB steps
        tx_power_eirp: (0..=7).map(|i| 16 - 2 * i).collect(),
        rx2_frequency: 869_525_000,
        rx2_datarate: 0,
        receive_delay1: Duration::from_secs(1),
        receive_delay2: Duration::from_secs(2),
        join_accept_delay1: Duration::from_secs(5),
        join_accept_delay2: Duration::from_secs(6),
        max_fcnt_gap: 16_384,
        adr_ack_limit: 64,
        adr_ack_delay: 32,
        plan: DownstreamPlan::Echo,
    }
}
