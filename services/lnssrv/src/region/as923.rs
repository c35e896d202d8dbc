//! AS923 regional parameters
//!
//! Parametrized by the 400 ms uplink dwell-time limit: with dwell time in
//! force the datarate floor rises to DR2 and the slowest rates become
//! invalid on the uplink. The RX1 offset table carries two negative
//! effective offsets (indexes 6 and 7) that *raise* the downstream rate.

use std::time::Duration;

use super::{lora, DatarateConfig, DownstreamPlan, Modulation, RegionName, RegionParams};

/// Effective RX1 offsets; indexes 6 and 7 are negative
const EFFECTIVE_OFFSETS: [i8; 8] = [0, 1, 2, 3, 4, 5, -1, -2];

/// Construct the AS923 parameter set
pub fn as923(dwell_time: bool) -> RegionParams {
    let datarates: Vec<Option<DatarateConfig>> = vec![
        lora(12, 125, 59),
        lora(11, 125, 59),
        lora(10, 125, if dwell_time { 19 } else { 59 }),
        lora(9, 125, if dwell_time { 61 } else { 123 }),
        lora(8, 125, if dwell_time { 133 } else { 230 }),
        lora(7, 125, 230),
        lora(7, 250, 230),
        Some(DatarateConfig {
            modulation: Modulation::Fsk { bitrate: 50_000 },
            max_payload: 230,
        }),
    ];

    let floor: u8 = if dwell_time { 2 } else { 0 };
    let rx1_offset_matrix = (0u8..=7)
        .map(|dr| {
            EFFECTIVE_OFFSETS
                .iter()
                .map(|&off| {
                    let down = i16::from(dr) - i16::from(off);
                    down.clamp(i16::from(floor), 5) as u8
                })
                .collect()
        })
        .collect();

    RegionParams {
        name: RegionName::As923,
        frequency_min: 915_000_000,
        frequency_max: 928_000_000,
        datarates,
        valid_uplink_drs: (floor..=7).collect(),
        valid_downlink_drs: (0..=7).collect(),
        rx1_offset_matrix,
        // Max EIRP 16 dBm, 2 dB steps
        tx_power_eirp: (0..=7).map(|i| 16 - 2 * i).collect(),
        rx2_frequency: 923_200_000,
        rx2_datarate: 2,
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
