//! Semtech UDP Packet Forwarder Protocol (GWMP)
//!
//! Reference: https://github.com/Lora-net/packet_forwarder/blob/master/PROTOCOL.TXT
//!
//! The protocol uses a simple binary header followed by JSON payload.
//! All multi-byte integers are big-endian (network byte order).

use base64::Engine;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CodecError;

/// Protocol version (always 0x02)
pub const PROTOCOL_VERSION: u8 = 0x02;

/// Version(1) + token(2) + identifier(1) + gateway EUI(8)
pub const PUSH_DATA_HEADER_LEN: usize = 12;

/// Packet types (identifier byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    PushData = 0x00,
    PushAck = 0x01,
    PullData = 0x02,
    PullResp = 0x03,
    PullAck = 0x04,
    TxAck = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PacketType::PushData),
            0x01 => Ok(PacketType::PushAck),
            0x02 => Ok(PacketType::PullData),
            0x03 => Ok(PacketType::PullResp),
            0x04 => Ok(PacketType::PullAck),
            0x05 => Ok(PacketType::TxAck),
            _ => Err(anyhow::anyhow!("Unknown packet type: 0x{:02x}", value)),
        }
    }
}

/// Gateway identifier (EUI-64, 8 bytes)
pub type GatewayEui = [u8; 8];

/// Rxpk (received packet) as captured from a gateway.
///
/// The capture is kept as the raw JSON object so a replayed packet carries
/// every field exactly as the gateway wrote it. The accessors below read the
/// fields this crate interprets and return `None` when a field is absent or
/// of an unexpected type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rxpk(Map<String, Value>);

impl Rxpk {
    /// An rxpk holding only `data` (base64 PHYPayload)
    pub fn with_data(data: impl Into<String>) -> Self {
        let mut rxpk = Rxpk::default();
        rxpk.set("data", data.into());
        rxpk
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Base64 encoded RF packet payload, empty when missing
    pub fn data(&self) -> &str {
        self.str_field("data").unwrap_or_default()
    }

    /// UTC time of packet reception
    pub fn time(&self) -> Option<&str> {
        self.str_field("time")
    }

    /// LoRa datarate identifier (e.g., "SF7BW125")
    pub fn datr(&self) -> Option<&str> {
        self.str_field("datr")
    }

    /// Frequency in MHz
    pub fn freq(&self) -> Option<f64> {
        self.0.get("freq").and_then(Value::as_f64)
    }

    /// Concentrator timestamp (microseconds)
    pub fn tmst(&self) -> Option<u64> {
        self.0.get("tmst").and_then(Value::as_u64)
    }

    /// RF packet payload size in bytes
    pub fn size(&self) -> Option<u64> {
        self.0.get("size").and_then(Value::as_u64)
    }

    /// A field rendered for humans: strings unquoted, anything else as JSON
    pub fn display(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn phy_payload(&self) -> Result<Vec<u8>, CodecError> {
        base64::engine::general_purpose::STANDARD
            .decode(self.data())
            .map_err(|_| CodecError::InvalidRxpk("rxpk.data is not valid base64".to_string()))
    }
}

impl From<Map<String, Value>> for Rxpk {
    fn from(map: Map<String, Value>) -> Self {
        Rxpk(map)
    }
}

/// One captured uplink: the forwarding gateway plus its rxpk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UplinkRecord {
    #[serde(rename = "gatewayEui", alias = "gateway_eui")]
    pub gateway_eui: String,
    pub rxpk: Rxpk,
}

/// Push data JSON wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct PushDataPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rxpk: Option<Vec<Rxpk>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stat: Option<Value>,
}

/// Parse a gateway EUI written as 16 hex chars, optionally `:`/`-` separated
pub fn normalize_gateway_eui(eui: &str) -> Result<GatewayEui, CodecError> {
    let cleaned: String = eui
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();
    if cleaned.len() != 16 {
        return Err(CodecError::InvalidGateway(format!(
            "Gateway EUI must be 8 bytes (16 hex chars), got '{}'",
            cleaned
        )));
    }
    let bytes = hex::decode(&cleaned)
        .map_err(|_| CodecError::InvalidGateway(format!("'{}' is not valid hex", cleaned)))?;
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Build a PUSH_DATA datagram carrying a single rxpk.
///
///   [0]    protocol version = 2
///   [1-2]  random token
///   [3]    identifier = 0x00 (PUSH_DATA)
///   [4-11] gateway EUI
///   JSON body: {"rxpk":[ rxpk ]}
pub fn build_push_data(gateway_eui: &str, rxpk: &Rxpk) -> Result<Vec<u8>, CodecError> {
    let eui = normalize_gateway_eui(gateway_eui)?;

    let body = PushDataPayload {
        rxpk: Some(vec![rxpk.clone()]),
        stat: None,
    };
    let json = serde_json::to_vec(&body).map_err(|e| CodecError::InvalidRxpk(e.to_string()))?;

    let mut buf = BytesMut::with_capacity(PUSH_DATA_HEADER_LEN + json.len());
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u16(rand::random::<u16>());
    buf.put_u8(PacketType::PushData as u8);
    buf.put_slice(&eui);
    buf.put_slice(&json);
    Ok(buf.to_vec())
}

/// Parsed GWMP packet (the upstream messages a network server receives)
#[derive(Debug)]
pub enum GwmpPacket {
    PushData {
        random_token: u16,
        gateway_eui: GatewayEui,
        json_payload: String,
    },
    PullData {
        random_token: u16,
        gateway_eui: GatewayEui,
    },
}

impl GwmpPacket {
    /// Parse a raw UDP datagram into a GWMP packet
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < 4 {
            return Err(anyhow::anyhow!("Packet too short: {} bytes", data.len()));
        }

        let mut buf = data;

        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(anyhow::anyhow!(
                "Unsupported protocol version: 0x{:02x}",
                version
            ));
        }

        let random_token = buf.get_u16();
        let packet_type = PacketType::try_from(buf.get_u8())?;

        match packet_type {
            PacketType::PushData => {
                if buf.remaining() < 8 {
                    return Err(anyhow::anyhow!("PUSH_DATA too short for gateway EUI"));
                }
                let mut gateway_eui = [0u8; 8];
                buf.copy_to_slice(&mut gateway_eui);

                let json_payload = String::from_utf8(buf.to_vec())
                    .map_err(|e| anyhow::anyhow!("Invalid UTF-8 in JSON payload: {}", e))?;

                Ok(GwmpPacket::PushData {
                    random_token,
                    gateway_eui,
                    json_payload,
                })
            }
            PacketType::PullData => {
                if buf.remaining() < 8 {
                    return Err(anyhow::anyhow!("PULL_DATA too short for gateway EUI"));
                }
                let mut gateway_eui = [0u8; 8];
                buf.copy_to_slice(&mut gateway_eui);

                Ok(GwmpPacket::PullData {
                    random_token,
                    gateway_eui,
                })
            }
            _ => Err(anyhow::anyhow!(
                "Unexpected packet type for parsing: {:?}",
                packet_type
            )),
        }
    }

    /// Build a PUSH_ACK response
    pub fn push_ack(random_token: u16) -> Vec<u8> {
        Self::ack(random_token, PacketType::PushAck)
    }

    /// Build a PULL_ACK response
    pub fn pull_ack(random_token: u16) -> Vec<u8> {
        Self::ack(random_token, PacketType::PullAck)
    }

    fn ack(random_token: u16, packet_type: PacketType) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u16(random_token);
        buf.put_u8(packet_type as u8);
        buf.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rxpk() -> Rxpk {
        let mut rxpk = Rxpk::with_data(base64::engine::general_purpose::STANDARD.encode([0x40u8; 20]));
        rxpk.set("time", "2025-01-01T12:00:00Z");
        rxpk.set("freq", 868.3);
        rxpk.set("datr", "SF7BW125");
        rxpk.set("size", 20);
        rxpk
    }

    #[test]
    fn test_build_push_data_layout() {
        let packet = build_push_data("0102030405060708", &sample_rxpk()).unwrap();
        assert_eq!(packet[0], 0x02);
        assert_eq!(packet[3], 0x00);
        assert_eq!(&packet[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);

        let body = std::str::from_utf8(&packet[12..]).unwrap();
        assert!(body.starts_with(r#"{"rxpk":["#));
        let payload: PushDataPayload = serde_json::from_str(body).unwrap();
        assert_eq!(payload.rxpk.unwrap()[0], sample_rxpk());
    }

    #[test]
    fn test_push_data_parses_back() {
        let packet = build_push_data("01:02:03:04:05:06:07:08", &sample_rxpk()).unwrap();
        match GwmpPacket::parse(&packet).unwrap() {
            GwmpPacket::PushData {
                gateway_eui,
                json_payload,
                ..
            } => {
                assert_eq!(gateway_eui, [1, 2, 3, 4, 5, 6, 7, 8]);
                assert!(json_payload.contains("SF7BW125"));
            }
            other => panic!("Expected PushData, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_gateway() {
        let err = build_push_data("01020304", &sample_rxpk()).unwrap_err();
        assert!(matches!(err, CodecError::InvalidGateway(_)));
        assert!(matches!(
            normalize_gateway_eui("zz02030405060708"),
            Err(CodecError::InvalidGateway(_))
        ));
    }

    #[test]
    fn test_rxpk_keeps_unknown_fields() {
        let json = r#"{"data":"QAE=","freq":868.1,"brd":3,"rsig":[{"ant":0}]}"#;
        let rxpk: Rxpk = serde_json::from_str(json).unwrap();
        assert_eq!(rxpk.get("brd"), Some(&serde_json::json!(3)));
        assert_eq!(rxpk.freq(), Some(868.1));

        let out = serde_json::to_value(&rxpk).unwrap();
        assert_eq!(out["rsig"][0]["ant"], 0);
        assert!(out.get("time").is_none());
    }

    #[test]
    fn test_push_data_forwards_rxpk_verbatim() {
        let captured = serde_json::json!({
            "time": "2025-01-01T12:00:00.123456Z",
            "tmst": 4294967296u64,
            "chan": 300,
            "rfch": 1,
            "stat": 1,
            "modu": "LORA",
            "datr": "SF7BW125",
            "codr": "4/5",
            "rssi": -60,
            "lsnr": 7.5,
            "size": 16,
            "freq": 868.1,
            "data": "QNobASYAAAAB9r4zLgAAAAA="
        });
        let rxpk: Rxpk = serde_json::from_value(captured.clone()).unwrap();
        let packet = build_push_data("0102030405060708", &rxpk).unwrap();

        let body = std::str::from_utf8(&packet[12..]).unwrap();
        assert!(body.contains(r#""rssi":-60,"#));
        assert!(!body.contains("-60.0"));
        let wire: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(wire["rxpk"][0], captured);
    }

    #[test]
    fn test_accessors_tolerate_odd_types() {
        let rxpk: Rxpk =
            serde_json::from_str(r#"{"data":"QAE=","freq":"fast","rssi":-60,"time":null}"#)
                .unwrap();
        assert_eq!(rxpk.freq(), None);
        assert_eq!(rxpk.time(), None);
        assert_eq!(rxpk.display("rssi").as_deref(), Some("-60"));
        assert_eq!(rxpk.display("time"), None);
        assert_eq!(Rxpk::default().data(), "");
    }

    #[test]
    fn test_record_accepts_both_eui_spellings() {
        let a: UplinkRecord =
            serde_json::from_str(r#"{"gatewayEui":"0102030405060708","rxpk":{"data":""}}"#)
                .unwrap();
        let b: UplinkRecord =
            serde_json::from_str(r#"{"gateway_eui":"0102030405060708","rxpk":{"data":""}}"#)
                .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_acks() {
        assert_eq!(GwmpPacket::push_ack(0x1234), vec![0x02, 0x12, 0x34, 0x01]);
        assert_eq!(GwmpPacket::pull_ack(0x0001), vec![0x02, 0x00, 0x01, 0x04]);
    }
}
