//! Physical payload envelope
//!
//! Parsing of the two frame shapes the network server accepts (join request,
//! data up) and builders for the two it produces (join accept, data down).
//! Parsing never panics on untrusted input; every length is checked before
//! the slice is taken.

use thiserror::Error;

use crate::crypto::{self, Direction, MIC_SIZE};
use crate::types::{AesKey, AppNonce, DevAddr, DevNonce, Eui64, NetId};

/// Frame parsing errors (all map to "drop silently" in the processor)
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("unsupported LoRaWAN major version: {0}")]
    UnsupportedMajor(u8),
    #[error("frame options overrun frame body: fopts_len={0}")]
    FOptsOverrun(u8),
    #[error("frame options exceed 15 bytes: {0}")]
    FOptsTooLong(usize),
    #[error("join request must be 23 bytes, got {0}")]
    BadJoinLength(usize),
}

/// Message type from the MHDR high bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MType {
    JoinRequest = 0b000,
    JoinAccept = 0b001,
    UnconfirmedDataUp = 0b010,
    UnconfirmedDataDown = 0b011,
    ConfirmedDataUp = 0b100,
    ConfirmedDataDown = 0b101,
    RejoinRequest = 0b110,
    Proprietary = 0b111,
}

/// MAC header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mhdr(pub u8);

impl Mhdr {
    pub fn new(mtype: MType) -> Self {
        Self((mtype as u8) << 5)
    }

    pub fn mtype(self) -> MType {
        match self.0 >> 5 {
            0b000 => MType::JoinRequest,
            0b001 => MType::JoinAccept,
            0b010 => MType::UnconfirmedDataUp,
            0b011 => MType::UnconfirmedDataDown,
            0b100 => MType::ConfirmedDataUp,
            0b101 => MType::ConfirmedDataDown,
            0b110 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }

    pub fn major(self) -> u8 {
        self.0 & 0x03
    }
}

/// Uplink frame-control byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FCtrlUp(pub u8);

impl FCtrlUp {
    pub fn adr(self) -> bool {
        self.0 & 0x80 != 0
    }

    pub fn adr_ack_req(self) -> bool {
        self.0 & 0x40 != 0
    }

    pub fn ack(self) -> bool {
        self.0 & 0x20 != 0
    }

    pub fn fopts_len(self) -> u8 {
        self.0 & 0x0F
    }
}

/// A parsed physical payload
#[derive(Debug, Clone)]
pub enum ParsedFrame {
    JoinRequest(JoinRequestFrame),
    DataUp(DataUpFrame),
    /// Recognized but not processed by the network server
    Other(MType),
}

impl ParsedFrame {
    /// Parse a raw physical payload
    pub fn parse(bytes: &[u8]) -> Result<ParsedFrame, WireError> {
        if bytes.is_empty() {
            return Err(WireError::TooShort(0));
        }
        let mhdr = Mhdr(bytes[0]);
        if mhdr.major() != 0 {
            return Err(WireError::UnsupportedMajor(mhdr.major()));
        }
        match mhdr.mtype() {
            MType::JoinRequest => JoinRequestFrame::parse(bytes).map(ParsedFrame::JoinRequest),
            MType::UnconfirmedDataUp | MType::ConfirmedDataUp => {
                DataUpFrame::parse(bytes).map(ParsedFrame::DataUp)
            },
            other => Ok(ParsedFrame::Other(other)),
        }
    }
}

/// Join request: MHDR | AppEUI | DevEUI | DevNonce | MIC
#[derive(Debug, Clone)]
pub struct JoinRequestFrame {
    pub mhdr: Mhdr,
    pub app_eui: Eui64,
    pub dev_eui: Eui64,
    pub dev_nonce: DevNonce,
    pub mic: [u8; MIC_SIZE],
    raw: Vec<u8>,
}

const JOIN_REQUEST_LEN: usize = 1 + 8 + 8 + 2 + MIC_SIZE;

impl JoinRequestFrame {
    fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != JOIN_REQUEST_LEN {
            return Err(WireError::BadJoinLength(bytes.len()));
        }
        let mut app_eui = [0u8; 8];
        app_eui.copy_from_slice(&bytes[1..9]);
        let mut dev_eui = [0u8; 8];
        dev_eui.copy_from_slice(&bytes[9..17]);
        let dev_nonce = DevNonce::from_le_bytes([bytes[17], bytes[18]]);
        let mut mic = [0u8; MIC_SIZE];
        mic.copy_from_slice(&bytes[19..23]);
        Ok(Self {
            mhdr: Mhdr(bytes[0]),
            app_eui: Eui64::from_le_bytes(app_eui),
            dev_eui: Eui64::from_le_bytes(dev_eui),
            dev_nonce,
            mic,
            raw: bytes.to_vec(),
        })
    }

    /// Bytes covered by the join-request MIC
    pub fn mic_input(&self) -> &[u8] {
        &self.raw[..JOIN_REQUEST_LEN - MIC_SIZE]
    }

    /// Verify the MIC against the device's application key
    pub fn check_mic(&self, app_key: &AesKey) -> bool {
        crypto::compute_join_mic(app_key, self.mic_input()) == self.mic
    }
}

/// Data uplink: MHDR | FHDR | [FPort | FRMPayload] | MIC
#[derive(Debug, Clone)]
pub struct DataUpFrame {
    pub mhdr: Mhdr,
    pub dev_addr: DevAddr,
    pub fctrl: FCtrlUp,
    pub fcnt: u16,
    pub fopts: Vec<u8>,
    pub fport: Option<u8>,
    pub frm_payload: Vec<u8>,
    pub mic: [u8; MIC_SIZE],
    raw: Vec<u8>,
}

const DATA_UP_MIN_LEN: usize = 1 + 7 + MIC_SIZE;

impl DataUpFrame {
    fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < DATA_UP_MIN_LEN {
            return Err(WireError::TooShort(bytes.len()));
        }
        let fctrl = FCtrlUp(bytes[5]);
        let fopts_len = fctrl.fopts_len() as usize;
        let body_end = bytes.len() - MIC_SIZE;
        let fopts_end = 8 + fopts_len;
        if fopts_end > body_end {
            return Err(WireError::FOptsOverrun(fctrl.fopts_len()));
        }

        let dev_addr = DevAddr::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let fcnt = u16::from_le_bytes([bytes[6], bytes[7]]);
        let fopts = bytes[8..fopts_end].to_vec();

        let (fport, frm_payload) = if fopts_end < body_end {
            (Some(bytes[fopts_end]), bytes[fopts_end + 1..body_end].to_vec())
        } else {
            (None, Vec::new())
        };

        let mut mic = [0u8; MIC_SIZE];
        mic.copy_from_slice(&bytes[body_end..]);

        Ok(Self {
            mhdr: Mhdr(bytes[0]),
            dev_addr,
            fctrl,
            fcnt,
            fopts,
            fport,
            frm_payload,
            mic,
            raw: bytes.to_vec(),
        })
    }

    pub fn is_confirmed(&self) -> bool {
        self.mhdr.mtype() == MType::ConfirmedDataUp
    }

    /// True for a content-less upward acknowledgement
    pub fn is_bare_ack(&self) -> bool {
        self.fctrl.ack() && self.fport.is_none() && self.frm_payload.is_empty()
    }

    /// Bytes covered by the data MIC
    pub fn mic_input(&self) -> &[u8] {
        &self.raw[..self.raw.len() - MIC_SIZE]
    }

    /// Verify the MIC against the device's network session key
    pub fn check_mic(&self, nwk_skey: &AesKey) -> bool {
        crypto::check_data_mic(
            nwk_skey,
            self.dev_addr,
            u32::from(self.fcnt),
            Direction::Up,
            self.mic_input(),
            &self.mic,
        )
    }

    /// Decrypt the FRMPayload with the right session key for its port
    pub fn decrypt_payload(&self, nwk_skey: &AesKey, app_skey: &AesKey) -> Vec<u8> {
        let key = if self.fport == Some(0) { nwk_skey } else { app_skey };
        crypto::encrypt_frame_payload(
            key,
            self.dev_addr,
            u32::from(self.fcnt),
            Direction::Up,
            &self.frm_payload,
        )
    }
}

/// Builder for a join-accept downlink
#[derive(Debug, Clone)]
pub struct JoinAcceptBuilder {
    pub app_nonce: AppNonce,
    pub net_id: NetId,
    pub dev_addr: DevAddr,
    /// RX1 datarate offset (high nibble) and RX2 datarate (low nibble)
    pub dl_settings: u8,
    /// RX1 delay in seconds (0 means the 1 s default)
    pub rx_delay: u8,
    pub cf_list: Option<[u8; 16]>,
}

impl JoinAcceptBuilder {
    /// Assemble and encrypt the join accept
    pub fn build(&self, app_key: &AesKey) -> Vec<u8> {
        let mhdr = Mhdr::new(MType::JoinAccept);
        let mut plain = Vec::with_capacity(12 + 16 + MIC_SIZE);
        plain.extend_from_slice(&self.app_nonce.0);
        plain.extend_from_slice(&self.net_id.0);
        plain.extend_from_slice(&self.dev_addr.to_le_bytes());
        plain.push(self.dl_settings);
        plain.push(self.rx_delay);
        if let Some(cf_list) = &self.cf_list {
            plain.extend_from_slice(cf_list);
        }

        let mut mic_input = Vec::with_capacity(1 + plain.len());
        mic_input.push(mhdr.0);
        mic_input.extend_from_slice(&plain);
        let mic = crypto::compute_join_mic(app_key, &mic_input);
        plain.extend_from_slice(&mic);

        let mut out = Vec::with_capacity(1 + plain.len());
        out.push(mhdr.0);
        out.extend_from_slice(&crypto::wrap_join_accept(app_key, &plain));
        out
    }
}

/// Builder for a data downlink
#[derive(Debug, Clone)]
pub struct DataDownBuilder {
    pub confirmed: bool,
    pub dev_addr: DevAddr,
    pub fcnt_down: u32,
    pub ack: bool,
    pub fpending: bool,
    /// Already-encoded MAC commands riding in FOpts (max 15 bytes)
    pub fopts: Vec<u8>,
    pub fport: Option<u8>,
    /// Plaintext application payload, encrypted during build
    pub payload: Vec<u8>,
}

impl DataDownBuilder {
    pub fn new(dev_addr: DevAddr, fcnt_down: u32) -> Self {
        Self {
            confirmed: false,
            dev_addr,
            fcnt_down,
            ack: false,
            fpending: false,
            fopts: Vec::new(),
            fport: None,
            payload: Vec::new(),
        }
    }

    /// Assemble, encrypt and sign the downlink frame
    pub fn build(&self, nwk_skey: &AesKey, app_skey: &AesKey) -> Result<Vec<u8>, WireError> {
        if self.fopts.len() > 15 {
            return Err(WireError::FOptsTooLong(self.fopts.len()));
        }
        let mtype = if self.confirmed {
            MType::ConfirmedDataDown
        } else {
            MType::UnconfirmedDataDown
        };

        let mut fctrl = self.fopts.len() as u8;
        if self.ack {
            fctrl |= 0x20;
        }
        if self.fpending {
            fctrl |= 0x10;
        }

        let mut out = Vec::with_capacity(DATA_UP_MIN_LEN + self.fopts.len() + self.payload.len());
        out.push(Mhdr::new(mtype).0);
        out.extend_from_slice(&self.dev_addr.to_le_bytes());
        out.push(fctrl);
        out.extend_from_slice(&(self.fcnt_down as u16).to_le_bytes());
        out.extend_from_slice(&self.fopts);

        if let Some(fport) = self.fport {
            out.push(fport);
            let key = if fport == 0 { nwk_skey } else { app_skey };
            let encrypted = crypto::encrypt_frame_payload(
                key,
                self.dev_addr,
                self.fcnt_down,
                Direction::Down,
                &self.payload,
            );
            out.extend_from_slice(&encrypted);
        }

        let mic = crypto::compute_data_mic(
            nwk_skey,
            self.dev_addr,
            self.fcnt_down,
            Direction::Down,
            &out,
        );
        out.extend_from_slice(&mic);
        Ok(out)
    }
}
