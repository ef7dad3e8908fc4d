//! LoRaWAN ABP uplink encoder
//!
//! Builds correctly encrypted and signed uplink PHY payloads, used to
//! synthesise test logs.
//!
//! Frame structure (data up, no FOpts):
//!   MHDR(1) | DevAddr(4,LE) | FCtrl(1) | FCnt(2,LE) | FPort(1) | FRMPayload(N) | MIC(4)

use super::crypto::{compute_mic, encrypt_frm_payload, Direction};
use super::keys::SessionKeys;
use super::MType;
use crate::error::CodecError;

/// Largest application payload whose MHDR | MACPayload still fits the
/// single length byte of the MIC block
pub const MAX_APP_PAYLOAD_LEN: usize = 255 - 9;

/// Parameters for building one ABP uplink
#[derive(Debug, Clone)]
pub struct UplinkBuilder {
    /// UnconfirmedDataUp or ConfirmedDataUp
    pub mtype: MType,
    /// 32-bit frame counter; only the low 16 bits go on the wire
    pub fcnt: u32,
    pub f_port: u8,
    /// Cleartext application payload
    pub payload: Vec<u8>,
}

impl UplinkBuilder {
    pub fn new(fcnt: u32, f_port: u8, payload: Vec<u8>, confirmed: bool) -> Self {
        Self {
            mtype: if confirmed {
                MType::ConfirmedDataUp
            } else {
                MType::UnconfirmedDataUp
            },
            fcnt,
            f_port,
            payload,
        }
    }

    /// Build the raw PHY payload, ready for base64 encoding into rxpk.data
    pub fn build(&self, keys: &SessionKeys) -> Result<Vec<u8>, CodecError> {
        let dev_addr_le = keys.dev_addr.to_le_bytes();
        let mut frame = Vec::with_capacity(13 + self.payload.len());

        frame.push(self.mtype.mhdr());

        // FHDR: DevAddr(LE) | FCtrl (no FOpts) | FCnt16(LE)
        frame.extend_from_slice(&dev_addr_le);
        frame.push(0x00);
        frame.extend_from_slice(&(self.fcnt as u16).to_le_bytes());

        frame.push(self.f_port);

        // FPort 0 carries MAC commands under the network key
        let key = keys.key_for_port(Some(self.f_port));
        frame.extend(encrypt_frm_payload(
            key,
            &dev_addr_le,
            self.fcnt,
            &self.payload,
            Direction::Uplink,
        )?);

        let mic = compute_mic(
            &keys.nwk_s_key,
            &dev_addr_le,
            self.fcnt,
            Direction::Uplink,
            &frame,
        )?;
        frame.extend_from_slice(&mic);

        Ok(frame)
    }
}

/// Build an ABP uplink PHY payload
pub fn build_abp_uplink(
    keys: &SessionKeys,
    fcnt: u32,
    app_payload: &[u8],
    f_port: u8,
    confirmed: bool,
) -> Result<Vec<u8>, CodecError> {
    UplinkBuilder::new(fcnt, f_port, app_payload.to_vec(), confirmed).build(keys)
}
