pub mod container;
pub mod crypto;
pub mod encoder;
pub mod keys;

use std::fmt;

use crate::error::CodecError;

/// Minimum data frame: MHDR(1) + DevAddr(4) + FCtrl(1) + FCnt(2) + MIC(4)
pub const MIN_PHY_PAYLOAD_LEN: usize = 12;

/// DevAddr(4) + FCtrl(1) + FCnt(2)
pub const FHDR_BASE_LEN: usize = 7;

const MIC_LEN: usize = 4;

/// LoRaWAN MAC Header (MHDR) - Message Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    RejoinRequest,
    Proprietary,
}

impl MType {
    pub fn from_mhdr(mhdr: u8) -> Self {
        match (mhdr >> 5) & 0x07 {
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

    /// MHDR byte for this type with Major = LoRaWAN R1
    pub fn mhdr(self) -> u8 {
        let bits = match self {
            MType::JoinRequest => 0b000,
            MType::JoinAccept => 0b001,
            MType::UnconfirmedDataUp => 0b010,
            MType::UnconfirmedDataDown => 0b011,
            MType::ConfirmedDataUp => 0b100,
            MType::ConfirmedDataDown => 0b101,
            MType::RejoinRequest => 0b110,
            MType::Proprietary => 0b111,
        };
        bits << 5
    }

    pub fn is_uplink_data(self) -> bool {
        matches!(self, MType::UnconfirmedDataUp | MType::ConfirmedDataUp)
    }
}

impl fmt::Display for MType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MType::JoinRequest => write!(f, "JoinRequest"),
            MType::JoinAccept => write!(f, "JoinAccept"),
            MType::UnconfirmedDataUp => write!(f, "UnconfirmedDataUp"),
            MType::UnconfirmedDataDown => write!(f, "UnconfirmedDataDown"),
            MType::ConfirmedDataUp => write!(f, "ConfirmedDataUp"),
            MType::ConfirmedDataDown => write!(f, "ConfirmedDataDown"),
            MType::RejoinRequest => write!(f, "RejoinRequest"),
            MType::Proprietary => write!(f, "Proprietary"),
        }
    }
}

/// Frame Control byte (FCtrl) for uplink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FCtrl {
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    pub class_b: bool,
    pub f_opts_len: u8,
}

impl From<u8> for FCtrl {
    fn from(byte: u8) -> Self {
        Self {
            adr: (byte & 0x80) != 0,
            adr_ack_req: (byte & 0x40) != 0,
            ack: (byte & 0x20) != 0,
            class_b: (byte & 0x10) != 0,
            f_opts_len: byte & 0x0F,
        }
    }
}

/// A parsed uplink data frame.
///
/// The MIC is carried along but never verified here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub mhdr: u8,
    pub mtype: MType,
    /// DevAddr as it appears on the wire (little-endian)
    pub dev_addr_le: [u8; 4],
    pub fctrl: FCtrl,
    pub fcnt: u16,
    pub f_opts: Vec<u8>,
    /// `None` for a MAC-command-only frame with nothing after the FHDR
    pub f_port: Option<u8>,
    pub frm_payload: Vec<u8>,
    pub mic: [u8; 4],
}

impl ParsedFrame {
    pub fn dev_addr(&self) -> u32 {
        u32::from_le_bytes(self.dev_addr_le)
    }

    /// Big-endian uppercase hex, the way network servers display it
    pub fn dev_addr_hex(&self) -> String {
        format!("{:08X}", self.dev_addr())
    }
}

impl fmt::Display for ParsedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} DevAddr={} FCnt={} FPort={} Payload={} bytes MIC={} ADR={}",
            self.mtype,
            self.dev_addr_hex(),
            self.fcnt,
            self.f_port.map(|p| p.to_string()).unwrap_or("-".to_string()),
            self.frm_payload.len(),
            hex::encode_upper(self.mic),
            self.fctrl.adr,
        )
    }
}

/// Parse a PHY payload (raw bytes after base64 decode) into an uplink data frame
pub fn parse_phy_payload(data: &[u8]) -> Result<ParsedFrame, CodecError> {
    if data.len() < MIN_PHY_PAYLOAD_LEN {
        return Err(CodecError::InvalidFrame(format!(
            "PHYPayload too short: {} bytes (minimum {})",
            data.len(),
            MIN_PHY_PAYLOAD_LEN
        )));
    }

    let mhdr = data[0];
    let mtype = MType::from_mhdr(mhdr);
    if !mtype.is_uplink_data() {
        return Err(CodecError::InvalidFrame(format!(
            "PHYPayload is not an uplink data frame ({})",
            mtype
        )));
    }

    let mic_start = data.len() - MIC_LEN;
    let mac_payload = &data[1..mic_start];
    if mac_payload.len() < FHDR_BASE_LEN {
        return Err(CodecError::InvalidFrame(format!(
            "MACPayload too short: {} bytes",
            mac_payload.len()
        )));
    }

    let mut dev_addr_le = [0u8; 4];
    dev_addr_le.copy_from_slice(&mac_payload[0..4]);

    let fctrl = FCtrl::from(mac_payload[4]);

    // FCnt (16-bit, little-endian)
    let fcnt = u16::from_le_bytes([mac_payload[5], mac_payload[6]]);

    let fhdr_len = FHDR_BASE_LEN + fctrl.f_opts_len as usize;
    if mac_payload.len() < fhdr_len {
        return Err(CodecError::InvalidFrame(format!(
            "FHDR length mismatch: FOpts length {} exceeds MACPayload of {} bytes",
            fctrl.f_opts_len,
            mac_payload.len()
        )));
    }
    let f_opts = mac_payload[FHDR_BASE_LEN..fhdr_len].to_vec();

    let (f_port, frm_payload) = match mac_payload[fhdr_len..].split_first() {
        Some((port, rest)) => (Some(*port), rest.to_vec()),
        None => (None, vec![]),
    };

    let mut mic = [0u8; 4];
    mic.copy_from_slice(&data[mic_start..]);

    Ok(ParsedFrame {
        mhdr,
        mtype,
        dev_addr_le,
        fctrl,
        fcnt,
        f_opts,
        f_port,
        frm_payload,
        mic,
    })
}

/// DevAddr (big-endian hex) from a PHY payload too short or too odd to parse fully.
///
/// Used by the log scanner, which only needs bytes 1..5.
pub fn extract_dev_addr(data: &[u8]) -> Option<String> {
    if data.len() < 5 {
        return None;
    }
    let addr = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
    Some(format!("{:08X}", addr))
}
