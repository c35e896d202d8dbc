//! MAC command codec
//!
//! One identifier byte followed by a fixed-length field block. The same
//! identifier names different commands depending on direction: 0x02 is
//! LinkCheckReq coming up from a device and LinkCheckAns going down to it,
//! so there are two decode tables sharing one variant set.
//!
//! Uplink FOpts are untrusted radio input: an unknown identifier or a
//! truncated block stops the scan and returns whatever decoded cleanly.
//! Downlink streams are produced by this server, so malformed input there
//! is a programming error and decoding returns a typed error.

use thiserror::Error;

/// Codec errors for the downlink (trusted) path
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MacError {
    #[error("unknown MAC command identifier 0x{0:02X}")]
    UnknownCommand(u8),
    #[error("truncated MAC command 0x{cid:02X}: need {needed} bytes, got {got}")]
    Truncated { cid: u8, needed: usize, got: usize },
    #[error("frequency {0} Hz does not fit the 24-bit field")]
    FrequencyOutOfRange(u32),
}

/// A decoded MAC command, covering both directions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacCommand {
    // ======================================
    // Uplink (device to network)
    // ======================================
    LinkCheckReq,
    LinkAdrAns {
        power_ack: bool,
        data_rate_ack: bool,
        channel_mask_ack: bool,
    },
    DutyCycleAns,
    RxParamSetupAns {
        rx1_dr_offset_ack: bool,
        rx2_data_rate_ack: bool,
        channel_ack: bool,
    },
    DevStatusAns {
        /// 0 = external power, 1-254 = level, 255 = unknown
        battery: u8,
        /// Demodulation margin of the last DevStatusReq, dB
        margin: i8,
    },
    NewChannelAns {
        channel_freq_ok: bool,
        data_rate_ok: bool,
    },
    RxTimingSetupAns,

    // ======================================
    // Downlink (network to device)
    // ======================================
    LinkCheckAns {
        margin: u8,
        gateway_count: u8,
    },
    LinkAdrReq {
        data_rate: u8,
        tx_power: u8,
        ch_mask: u16,
        ch_mask_cntl: u8,
        nb_trans: u8,
    },
    DutyCycleReq {
        max_duty_cycle: u8,
    },
    RxParamSetupReq {
        rx1_dr_offset: u8,
        rx2_data_rate: u8,
        /// RX2 frequency in Hz (stored on the wire as Hz/100)
        frequency: u32,
    },
    DevStatusReq,
    NewChannelReq {
        ch_index: u8,
        /// Channel frequency in Hz (stored on the wire as Hz/100)
        frequency: u32,
        max_dr: u8,
        min_dr: u8,
    },
    RxTimingSetupReq {
        /// RX1 delay in seconds, 0 meaning 1 s
        delay: u8,
    },
}

impl MacCommand {
    /// Command identifier byte
    pub fn cid(&self) -> u8 {
        match self {
            MacCommand::LinkCheckReq | MacCommand::LinkCheckAns { .. } => 0x02,
            MacCommand::LinkAdrAns { .. } | MacCommand::LinkAdrReq { .. } => 0x03,
            MacCommand::DutyCycleAns | MacCommand::DutyCycleReq { .. } => 0x04,
            MacCommand::RxParamSetupAns { .. } | MacCommand::RxParamSetupReq { .. } => 0x05,
            MacCommand::DevStatusAns { .. } | MacCommand::DevStatusReq => 0x06,
            MacCommand::NewChannelAns { .. } | MacCommand::NewChannelReq { .. } => 0x07,
            MacCommand::RxTimingSetupAns | MacCommand::RxTimingSetupReq { .. } => 0x08,
        }
    }

    /// Field-block length, excluding the identifier byte
    pub fn payload_len(&self) -> usize {
        match self {
            MacCommand::LinkCheckReq
            | MacCommand::DutyCycleAns
            | MacCommand::RxTimingSetupAns
            | MacCommand::DevStatusReq => 0,
            MacCommand::LinkAdrAns { .. }
            | MacCommand::RxParamSetupAns { .. }
            | MacCommand::NewChannelAns { .. }
            | MacCommand::DutyCycleReq { .. }
            | MacCommand::RxTimingSetupReq { .. } => 1,
            MacCommand::DevStatusAns { .. } | MacCommand::LinkCheckAns { .. } => 2,
            MacCommand::LinkAdrReq { .. } | MacCommand::RxParamSetupReq { .. } => 4,
            MacCommand::NewChannelReq { .. } => 5,
        }
    }

    /// Append the wire form: identifier byte, then fields
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), MacError> {
        out.push(self.cid());
        match self {
            MacCommand::LinkCheckReq
            | MacCommand::DutyCycleAns
            | MacCommand::RxTimingSetupAns
            | MacCommand::DevStatusReq => {},
            MacCommand::LinkAdrAns {
                power_ack,
                data_rate_ack,
                channel_mask_ack,
            } => {
                out.push(ack_bits(*power_ack, *data_rate_ack, *channel_mask_ack));
            },
            MacCommand::RxParamSetupAns {
                rx1_dr_offset_ack,
                rx2_data_rate_ack,
                channel_ack,
            } => {
                out.push(ack_bits(*rx1_dr_offset_ack, *rx2_data_rate_ack, *channel_ack));
            },
            MacCommand::DevStatusAns { battery, margin } => {
                out.push(*battery);
                out.push(*margin as u8);
            },
            MacCommand::NewChannelAns {
                channel_freq_ok,
                data_rate_ok,
            } => {
                let mut b = 0u8;
                if *channel_freq_ok {
                    b |= 0x02;
                }
                if *data_rate_ok {
                    b |= 0x01;
                }
                out.push(b);
            },
            MacCommand::LinkCheckAns {
                margin,
                gateway_count,
            } => {
                out.push(*margin);
                out.push(*gateway_count);
            },
            MacCommand::LinkAdrReq {
                data_rate,
                tx_power,
                ch_mask,
                ch_mask_cntl,
                nb_trans,
            } => {
                out.push((data_rate << 4) | (tx_power & 0x0F));
                out.extend_from_slice(&ch_mask.to_le_bytes());
                out.push((ch_mask_cntl << 4) | (nb_trans & 0x0F));
            },
            MacCommand::DutyCycleReq { max_duty_cycle } => {
                out.push(*max_duty_cycle);
            },
            MacCommand::RxParamSetupReq {
                rx1_dr_offset,
                rx2_data_rate,
                frequency,
            } => {
                out.push((rx1_dr_offset << 4) | (rx2_data_rate & 0x0F));
                push_frequency(out, *frequency)?;
            },
            MacCommand::NewChannelReq {
                ch_index,
                frequency,
                max_dr,
                min_dr,
            } => {
                out.push(*ch_index);
                push_frequency(out, *frequency)?;
                out.push((max_dr << 4) | (min_dr & 0x0F));
            },
            MacCommand::RxTimingSetupReq { delay } => {
                out.push(delay & 0x0F);
            },
        }
        Ok(())
    }
}

fn ack_bits(bit2: bool, bit1: bool, bit0: bool) -> u8 {
    let mut b = 0u8;
    if bit2 {
        b |= 0x04;
    }
    if bit1 {
        b |= 0x02;
    }
    if bit0 {
        b |= 0x01;
    }
    b
}

fn push_frequency(out: &mut Vec<u8>, frequency: u32) -> Result<(), MacError> {
    let scaled = frequency / 100;
    if scaled > 0x00FF_FFFF {
        return Err(MacError::FrequencyOutOfRange(frequency));
    }
    out.extend_from_slice(&scaled.to_le_bytes()[..3]);
    Ok(())
}

fn read_frequency(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]) * 100
}

/// Encode a command sequence for embedding in FOpts or port-0 payload
pub fn encode_all(commands: &[MacCommand]) -> Result<Vec<u8>, MacError> {
    let mut out = Vec::new();
    for cmd in commands {
        cmd.encode_into(&mut out)?;
    }
    Ok(out)
}

/// Decode the uplink answer stream
///
/// Stops at the first unknown identifier or truncated field block and
/// returns everything decoded up to that point.
pub fn decode_uplink(bytes: &[u8]) -> Vec<MacCommand> {
    let mut out = Vec::new();
    let mut cursor = bytes;
    while let Some((&cid, rest)) = cursor.split_first() {
        let decoded = match cid {
            0x02 => Some((MacCommand::LinkCheckReq, 0)),
            0x03 => rest.first().map(|&b| {
                (
                    MacCommand::LinkAdrAns {
                        power_ack: b & 0x04 != 0,
                        data_rate_ack: b & 0x02 != 0,
                        channel_mask_ack: b & 0x01 != 0,
                    },
                    1,
                )
            }),
            0x04 => Some((MacCommand::DutyCycleAns, 0)),
            0x05 => rest.first().map(|&b| {
                (
                    MacCommand::RxParamSetupAns {
                        rx1_dr_offset_ack: b & 0x04 != 0,
                        rx2_data_rate_ack: b & 0x02 != 0,
                        channel_ack: b & 0x01 != 0,
                    },
                    1,
                )
            }),
            0x06 => (rest.len() >= 2).then(|| {
                (
                    MacCommand::DevStatusAns {
                        battery: rest[0],
                        margin: rest[1] as i8,
                    },
                    2,
                )
            }),
            0x07 => rest.first().map(|&b| {
                (
                    MacCommand::NewChannelAns {
                        channel_freq_ok: b & 0x02 != 0,
                        data_rate_ok: b & 0x01 != 0,
                    },
                    1,
                )
            }),
            0x08 => Some((MacCommand::RxTimingSetupAns, 0)),
            _ => None,
        };
        match decoded {
            Some((cmd, len)) => {
                out.push(cmd);
                cursor = &rest[len..];
            },
            // Untrusted input: salvage what we have
            None => break,
        }
    }
    out
}

/// Decode the downlink request stream
pub fn decode_downlink(bytes: &[u8]) -> Result<Vec<MacCommand>, MacError> {
    let mut out = Vec::new();
    let mut cursor = bytes;
    while let Some((&cid, rest)) = cursor.split_first() {
        let (cmd, len) = match cid {
            0x02 => {
                require(cid, rest, 2)?;
                (
                    MacCommand::LinkCheckAns {
                        margin: rest[0],
                        gateway_count: rest[1],
                    },
                    2,
                )
            },
            0x03 => {
                require(cid, rest, 4)?;
                (
                    MacCommand::LinkAdrReq {
                        data_rate: rest[0] >> 4,
                        tx_power: rest[0] & 0x0F,
                        ch_mask: u16::from_le_bytes([rest[1], rest[2]]),
                        ch_mask_cntl: rest[3] >> 4,
                        nb_trans: rest[3] & 0x0F,
                    },
                    4,
                )
            },
            0x04 => {
                require(cid, rest, 1)?;
                (
                    MacCommand::DutyCycleReq {
                        max_duty_cycle: rest[0],
                    },
                    1,
                )
            },
            0x05 => {
                require(cid, rest, 4)?;
                (
                    MacCommand::RxParamSetupReq {
                        rx1_dr_offset: rest[0] >> 4,
                        rx2_data_rate: rest[0] & 0x0F,
                        frequency: read_frequency(&rest[1..4]),
                    },
                    4,
                )
            },
            0x06 => (MacCommand::DevStatusReq, 0),
            0x07 => {
                require(cid, rest, 5)?;
                (
                    MacCommand::NewChannelReq {
                        ch_index: rest[0],
                        frequency: read_frequency(&rest[1..4]),
                        max_dr: rest[4] >> 4,
                        min_dr: rest[4] & 0x0F,
                    },
                    5,
                )
            },
            0x08 => {
                require(cid, rest, 1)?;
                (
                    MacCommand::RxTimingSetupReq {
                        delay: rest[0] & 0x0F,
                    },
                    1,
                )
            },
            other => return Err(MacError::UnknownCommand(other)),
        };
        out.push(cmd);
        cursor = &rest[len..];
    }
    Ok(out)
}

fn require(cid: u8, rest: &[u8], needed: usize) -> Result<(), MacError> {
    if rest.len() < needed {
        return Err(MacError::Truncated {
            cid,
            needed,
            got: rest.len(),
        });
    }
    Ok(())
}
