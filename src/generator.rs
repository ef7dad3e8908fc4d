//! Synthetic ABP uplink logs
//!
//! Produces a JSON Lines log in the same shape the scanner accepts, with
//! every frame correctly encrypted and signed for the given session, so the
//! decode and replay paths can be exercised without a real device.

use base64::Engine;
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::error::GeneratorError;
use crate::lorawan::encoder::{build_abp_uplink, MAX_APP_PAYLOAD_LEN};
use crate::lorawan::keys::{clean_hex, SessionKeys};
use crate::udp::protocol::{normalize_gateway_eui, Rxpk, UplinkRecord};

pub const EU868_FREQUENCIES: [&str; 8] = [
    "868.1", "868.3", "868.5", "867.1", "867.3", "867.5", "867.7", "867.9",
];

pub const EU868_DATARATES: [&str; 7] = [
    "SF12BW125",
    "SF11BW125",
    "SF10BW125",
    "SF9BW125",
    "SF8BW125",
    "SF7BW125",
    "SF7BW250",
];

pub const EU868_CODING_RATES: [&str; 4] = ["4/5", "4/6", "4/7", "4/8"];

/// Highest application FPort the generator will emit
pub const MAX_APP_PORT: u8 = 223;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorParams {
    pub gateway_eui: String,
    pub dev_addr: String,
    pub nwk_s_key: String,
    pub app_s_key: String,
    pub payload_hex: String,
    pub fcnt_start: u32,
    pub frames: u32,
    /// MHz, one of [`EU868_FREQUENCIES`]
    pub freq: String,
    pub datarate: String,
    pub coding_rate: String,
    pub f_port: u8,
    /// `YYYY-MM-DDTHH:MM[:SS]`, taken as UTC
    pub start_time: String,
    pub interval_secs: u32,
}

impl Default for GeneratorParams {
    fn default() -> Self {
        Self {
            gateway_eui: "0102030405060708".to_string(),
            dev_addr: "26011BDA".to_string(),
            nwk_s_key: "000102030405060708090A0B0C0D0E0F".to_string(),
            app_s_key: "F0E0D0C0B0A090807060504030201000".to_string(),
            payload_hex: "0102030405060708".to_string(),
            fcnt_start: 0,
            frames: 100,
            freq: "868.3".to_string(),
            datarate: "SF7BW125".to_string(),
            coding_rate: "4/5".to_string(),
            f_port: 1,
            start_time: "2025-01-01T12:00".to_string(),
            interval_secs: 10,
        }
    }
}

/// Fully checked generator input
struct Plan {
    keys: SessionKeys,
    payload: Vec<u8>,
    freq: f64,
    start: NaiveDateTime,
}

impl GeneratorParams {
    fn plan(&self) -> Result<Plan, GeneratorError> {
        if self.gateway_eui.trim().is_empty() {
            return Err(invalid("Gateway EUI is required."));
        }
        normalize_gateway_eui(&self.gateway_eui)?;

        let keys = SessionKeys::from_hex(&self.dev_addr, &self.nwk_s_key, &self.app_s_key)?;

        let payload_hex = clean_hex(&self.payload_hex);
        if payload_hex.is_empty() {
            return Err(invalid("Application payload must be provided."));
        }
        let payload = hex::decode(&payload_hex)
            .map_err(|_| invalid("Application payload must be valid hex."))?;
        if payload.len() > MAX_APP_PAYLOAD_LEN {
            return Err(invalid(format!(
                "Application payload must be at most {} bytes.",
                MAX_APP_PAYLOAD_LEN
            )));
        }

        if self.frames < 1 {
            return Err(invalid("Number of frames must be >= 1."));
        }
        if self.interval_secs < 1 {
            return Err(invalid("Interval between frames must be >= 1."));
        }
        if self.fcnt_start.checked_add(self.frames - 1).is_none() {
            return Err(invalid("Frame counter would overflow."));
        }
        if !(1..=MAX_APP_PORT).contains(&self.f_port) {
            return Err(invalid(format!("FPort must be between 1 and {}.", MAX_APP_PORT)));
        }

        if !is_one_of(&EU868_FREQUENCIES, &self.freq) {
            return Err(invalid("Select a valid EU868 frequency."));
        }
        let freq = self
            .freq
            .trim()
            .parse::<f64>()
            .map_err(|_| invalid("Select a valid EU868 frequency."))?;
        if !is_one_of(&EU868_DATARATES, &self.datarate) {
            return Err(invalid("Select a valid EU868 data rate."));
        }
        if !is_one_of(&EU868_CODING_RATES, &self.coding_rate) {
            return Err(invalid("Select a valid coding rate."));
        }

        let start = parse_start_time(&self.start_time)?;

        Ok(Plan {
            keys,
            payload,
            freq,
            start,
        })
    }
}

fn is_one_of(options: &[&str], value: &str) -> bool {
    options.iter().any(|option| *option == value.trim())
}

fn invalid(message: impl Into<String>) -> GeneratorError {
    GeneratorError::Invalid(message.into())
}

fn parse_start_time(value: &str) -> Result<NaiveDateTime, GeneratorError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(invalid("Start time is required."));
    }
    ["%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .ok_or_else(|| invalid("Start time must be in YYYY-MM-DDTHH:MM format."))
}

/// Build the uplink records of a synthetic log
pub fn generate_records(params: &GeneratorParams) -> Result<Vec<UplinkRecord>, GeneratorError> {
    let plan = params.plan()?;
    let engine = base64::engine::general_purpose::STANDARD;

    (0..params.frames)
        .map(|i| -> Result<UplinkRecord, GeneratorError> {
            let phy = build_abp_uplink(
                &plan.keys,
                params.fcnt_start + i,
                &plan.payload,
                params.f_port,
                false,
            )?;
            let time = plan.start + Duration::seconds(i as i64 * params.interval_secs as i64);

            let mut rxpk = Rxpk::with_data(engine.encode(&phy));
            rxpk.set("time", time.format("%Y-%m-%dT%H:%M:%SZ").to_string());
            rxpk.set("tmst", 1_000_000 + i as u64 * 1000);
            rxpk.set("freq", plan.freq);
            rxpk.set("chan", 0);
            rxpk.set("rfch", 0);
            rxpk.set("stat", 1);
            rxpk.set("modu", "LORA");
            rxpk.set("datr", params.datarate.trim());
            rxpk.set("codr", params.coding_rate.trim());
            rxpk.set("rssi", -60 - (i % 20) as i64);
            rxpk.set("lsnr", 5.5 - (i % 10) as f64 * 0.1);
            rxpk.set("size", phy.len());

            Ok(UplinkRecord {
                gateway_eui: params.gateway_eui.trim().to_string(),
                rxpk,
            })
        })
        .collect()
}

/// Write a synthetic log as JSON Lines
pub fn write_log<W: Write>(params: &GeneratorParams, mut writer: W) -> anyhow::Result<usize> {
    let records = generate_records(params)?;
    for record in &records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(records.len())
}

/// The whole log in memory
pub fn generate_log(params: &GeneratorParams) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    write_log(params, &mut out)?;
    Ok(out)
}
