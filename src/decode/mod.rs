//! Decrypt + decode orchestration over a scanned log
//!
//! For each uplink: parse the frame, pick the session key by FPort, decrypt,
//! expand FPort 29 containers into their sub-messages, run the selected
//! decoder on every message and emit one [`DecodedRow`] per message. Row
//! failures never abort the batch; only missing session keys do, and that
//! is checked before any work starts.

pub mod flatten;
pub mod progress;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::decoder::PayloadDecoder;
use crate::error::{CodecError, DecodeError};
use crate::lorawan::container::{unpack_port29_messages, CONTAINER_PORT};
use crate::lorawan::crypto::{decrypt_frm_payload, Direction};
use crate::lorawan::keys::KeyStore;
use crate::lorawan::parse_phy_payload;
use crate::scan::ScanResult;
use crate::store::TokenStore;
use crate::udp::protocol::{Rxpk, UplinkRecord};
pub use flatten::flatten;
use progress::ProgressHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RowStatus {
    Decoded,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedRow {
    /// 1-based, increments per emitted row
    pub index: usize,
    pub status: RowStatus,
    pub devaddr: String,
    pub fcnt: Option<u16>,
    pub fport: Option<u8>,
    /// Reception time as captured in the rxpk
    pub time: String,
    /// Message time: the container timestamp for FPort 29 messages, else the reception time
    pub time_unix: Option<i64>,
    pub time_utc: String,
    pub gateway_eui: String,
    pub freq: Option<f64>,
    pub payload_hex: String,
    pub decoded: Value,
    pub decoded_flat: BTreeMap<String, Value>,
    pub error: String,
}

/// Result of a completed decode pass
#[derive(Debug, Clone)]
pub struct DecodeOutcome {
    pub rows: Arc<Vec<DecodedRow>>,
    /// Token under which `rows` can be fetched again for export
    pub export_token: String,
    pub decoded: usize,
    pub errors: usize,
}

/// Storage for finished decode passes, keyed by export token
pub type DecodeCache = dyn TokenStore<Arc<Vec<DecodedRow>>>;

/// One payload waiting for the decoder
struct PendingMessage {
    f_port: Option<u8>,
    payload: Vec<u8>,
    time_unix: Option<i64>,
    /// Nested containers are not decoded again
    skip_decoder: bool,
}

/// What one uplink expands into before decoding
enum Expansion {
    Messages(Vec<PendingMessage>),
    Failed {
        payload_hex: String,
        error: String,
    },
}

/// Fields shared by every row produced from the same uplink
struct RowContext<'a> {
    record: &'a UplinkRecord,
    devaddr: String,
    fcnt: Option<u16>,
    fport: Option<u8>,
    received_unix: Option<i64>,
}

pub struct DecodeOrchestrator {
    cache: Arc<DecodeCache>,
}

impl DecodeOrchestrator {
    pub fn new(cache: Arc<DecodeCache>) -> Self {
        Self { cache }
    }

    /// Rows of an earlier decode pass, if still cached
    pub async fn rows(&self, export_token: &str) -> Option<Arc<Vec<DecodedRow>>> {
        self.cache.get(export_token).await
    }

    pub async fn decode(
        &self,
        scan: &ScanResult,
        keys: &KeyStore,
        decoder: &dyn PayloadDecoder,
        progress: Option<ProgressHandle>,
    ) -> Result<DecodeOutcome, DecodeError> {
        let missing = keys.missing(&scan.dev_addrs);
        if !missing.is_empty() {
            warn!("Refusing decode, no session keys for {}", missing.join(", "));
            return Err(DecodeError::MissingKeys(missing));
        }

        let mut rows = Vec::new();
        for (i, record) in scan.records.iter().enumerate() {
            self.decode_record(record, keys, decoder, &mut rows).await;
            if let Some(progress) = &progress {
                progress.update(i + 1).await;
            }
        }
        if let Some(progress) = &progress {
            progress.finish().await;
        }

        let errors = rows
            .iter()
            .filter(|row| row.status == RowStatus::Error)
            .count();
        let decoded = rows.len() - errors;
        info!(
            "Decode complete: {} uplinks, {} rows, decoded={}, errors={}",
            scan.records.len(),
            rows.len(),
            decoded,
            errors
        );

        let rows = Arc::new(rows);
        let export_token = self.cache.insert(rows.clone()).await;
        Ok(DecodeOutcome {
            rows,
            export_token,
            decoded,
            errors,
        })
    }

    async fn decode_record(
        &self,
        record: &UplinkRecord,
        keys: &KeyStore,
        decoder: &dyn PayloadDecoder,
        rows: &mut Vec<DecodedRow>,
    ) {
        let rxpk = &record.rxpk;
        let received_unix = rxpk
            .time()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.timestamp());

        let frame = match rxpk.phy_payload().and_then(|phy| parse_phy_payload(&phy)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Uplink {} failed to parse: {}", rows.len() + 1, e);
                let ctx = RowContext {
                    record,
                    devaddr: String::new(),
                    fcnt: None,
                    fport: None,
                    received_unix,
                };
                rows.push(error_row(rows.len() + 1, &ctx, String::new(), e.to_string()));
                return;
            }
        };

        let ctx = RowContext {
            record,
            devaddr: frame.dev_addr_hex(),
            fcnt: Some(frame.fcnt),
            fport: frame.f_port,
            received_unix,
        };

        let Some(session) = keys.lookup(&ctx.devaddr) else {
            let error = format!("missing session keys for {}", ctx.devaddr);
            rows.push(error_row(rows.len() + 1, &ctx, String::new(), error));
            return;
        };

        let key = session.key_for_port(frame.f_port);
        let plaintext = match decrypt_frm_payload(
            key,
            &frame.dev_addr_le,
            frame.fcnt as u32,
            &frame.frm_payload,
            Direction::Uplink,
        ) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!("Uplink from {} FCnt {}: {}", ctx.devaddr, frame.fcnt, e);
                rows.push(error_row(rows.len() + 1, &ctx, String::new(), e.to_string()));
                return;
            }
        };

        match expand(frame.f_port, plaintext, received_unix) {
            Expansion::Failed { payload_hex, error } => {
                warn!("Uplink from {} FCnt {}: {}", ctx.devaddr, frame.fcnt, error);
                rows.push(error_row(rows.len() + 1, &ctx, payload_hex, error));
            }
            Expansion::Messages(messages) => {
                for message in messages {
                    let row = decode_message(rows.len() + 1, &ctx, message, decoder, rxpk).await;
                    rows.push(row);
                }
            }
        }
    }
}

fn expand(f_port: Option<u8>, plaintext: Vec<u8>, received_unix: Option<i64>) -> Expansion {
    if f_port != Some(CONTAINER_PORT) {
        return Expansion::Messages(vec![PendingMessage {
            f_port,
            payload: plaintext,
            time_unix: received_unix,
            skip_decoder: false,
        }]);
    }

    let payload_hex = hex::encode_upper(&plaintext);
    match unpack_port29_messages(&plaintext) {
        Ok(messages) if messages.is_empty() => Expansion::Failed {
            payload_hex,
            error: CodecError::EmptyContainer.to_string(),
        },
        Ok(messages) => Expansion::Messages(
            messages
                .into_iter()
                .map(|m| PendingMessage {
                    f_port: Some(m.port),
                    skip_decoder: m.port == CONTAINER_PORT,
                    payload: m.payload,
                    time_unix: Some(m.timestamp as i64),
                })
                .collect(),
        ),
        Err(e) => Expansion::Failed {
            payload_hex,
            error: e.to_string(),
        },
    }
}

async fn decode_message(
    index: usize,
    ctx: &RowContext<'_>,
    message: PendingMessage,
    decoder: &dyn PayloadDecoder,
    rxpk: &Rxpk,
) -> DecodedRow {
    let payload_hex = hex::encode_upper(&message.payload);

    let result = if message.skip_decoder {
        Ok(json!({}))
    } else {
        decoder
            .decode(&message.payload, message.f_port, &ctx.devaddr, rxpk)
            .await
    };

    let mut row = base_row(index, ctx, payload_hex);
    row.fport = message.f_port;
    row.time_unix = message.time_unix;
    row.time_utc = format_utc(message.time_unix);

    match result {
        Ok(raw) => {
            let decoded = unwrap_data(raw);
            row.decoded_flat = flatten(&decoded);
            row.decoded = decoded;
        }
        Err(e) => {
            warn!("Decoder failed for {} FCnt {:?}: {}", ctx.devaddr, ctx.fcnt, e);
            row.status = RowStatus::Error;
            row.error = e.to_string();
        }
    }
    row
}

/// `decodeUplink` style results wrap the payload as `{data, warnings, errors}`
fn unwrap_data(raw: Value) -> Value {
    match raw {
        Value::Object(mut map) if map.contains_key("data") && map.len() <= 3 => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn format_utc(unix: Option<i64>) -> String {
    unix.and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_default()
}

fn base_row(index: usize, ctx: &RowContext<'_>, payload_hex: String) -> DecodedRow {
    let rxpk = &ctx.record.rxpk;
    DecodedRow {
        index,
        status: RowStatus::Decoded,
        devaddr: ctx.devaddr.clone(),
        fcnt: ctx.fcnt,
        fport: ctx.fport,
        time: rxpk.time().unwrap_or_default().to_string(),
        time_unix: ctx.received_unix,
        time_utc: format_utc(ctx.received_unix),
        gateway_eui: ctx.record.gateway_eui.clone(),
        freq: rxpk.freq(),
        payload_hex,
        decoded: Value::Null,
        decoded_flat: BTreeMap::new(),
        error: String::new(),
    }
}

fn error_row(index: usize, ctx: &RowContext<'_>, payload_hex: String, error: String) -> DecodedRow {
    DecodedRow {
        status: RowStatus::Error,
        error,
        ..base_row(index, ctx, payload_hex)
    }
}
