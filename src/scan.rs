//! JSON Lines uplink log scanning
//!
//! Every line is validated on its own; bad lines are reported as
//! `Line N: reason` and left out of the result. A scan only fails outright
//! when no valid uplink remains.

use std::collections::BTreeSet;
use std::io::BufRead;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::ScanError;
use crate::lorawan::extract_dev_addr;
use crate::store::TokenStore;
use crate::udp::protocol::{normalize_gateway_eui, Rxpk, UplinkRecord};

/// How many validation errors a summary shows before collapsing the rest
pub const ERROR_PREVIEW_LIMIT: usize = 10;

/// Maps scan tokens to immutable scan results
pub type ScanIndex = dyn TokenStore<Arc<ScanResult>>;

#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub records: Vec<UplinkRecord>,
    /// Distinct gateway EUIs as written in the log, sorted
    pub gateways: Vec<String>,
    /// Distinct DevAddrs (big-endian hex), sorted
    pub dev_addrs: Vec<String>,
    /// Per-line validation errors
    pub errors: Vec<String>,
}

impl ScanResult {
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![
            "Logfile scan summary:".to_string(),
            format!("Uplinks (valid)={}", self.records.len()),
            format_list("Gateway EUI", &self.gateways, 10),
            format_list("DevAddr (hex)", &self.dev_addrs, 10),
        ];

        if !self.errors.is_empty() {
            lines.push(format!("Validation errors={}.", self.errors.len()));
            lines.extend(self.errors.iter().take(ERROR_PREVIEW_LIMIT).cloned());
            if self.errors.len() > ERROR_PREVIEW_LIMIT {
                lines.push(format!(
                    "... (+{} more)",
                    self.errors.len() - ERROR_PREVIEW_LIMIT
                ));
            }
        }
        lines
    }
}

pub fn format_list(label: &str, items: &[String], limit: usize) -> String {
    if items.is_empty() {
        return format!("{}: none", label);
    }
    if items.len() <= limit {
        return format!("{}: {}", label, items.join(", "));
    }
    format!(
        "{}: {} (+{} more)",
        label,
        items[..limit].join(", "),
        items.len() - limit
    )
}

/// Scan a JSON Lines log
pub fn scan_log<R: BufRead>(reader: R) -> Result<ScanResult, ScanError> {
    let mut records = Vec::new();
    let mut gateways = BTreeSet::new();
    let mut dev_addrs = BTreeSet::new();
    let mut errors = Vec::new();

    for (i, raw_line) in reader.split(b'\n').enumerate() {
        let line_no = i + 1;
        let raw_line = raw_line?;

        let line = match std::str::from_utf8(&raw_line) {
            Ok(line) => line.trim(),
            Err(_) => {
                errors.push(format!("Line {}: invalid UTF-8 encoding.", line_no));
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }

        match validate_line(line) {
            Ok((record, dev_addr)) => {
                gateways.insert(record.gateway_eui.clone());
                dev_addrs.insert(dev_addr);
                records.push(record);
            }
            Err(reason) => {
                debug!("Rejected line {}: {}", line_no, reason);
                errors.push(format!("Line {}: {}", line_no, reason));
            }
        }
    }

    if records.is_empty() {
        return Err(ScanError::NoValidRecords { errors });
    }

    info!(
        "Scanned {} uplinks ({} gateways, {} devices, {} rejected lines)",
        records.len(),
        gateways.len(),
        dev_addrs.len(),
        errors.len()
    );

    Ok(ScanResult {
        records,
        gateways: gateways.into_iter().collect(),
        dev_addrs: dev_addrs.into_iter().collect(),
        errors,
    })
}

fn validate_line(line: &str) -> Result<(UplinkRecord, String), String> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| format!("JSON decode error ({}).", e))?;
    let obj = value
        .as_object()
        .ok_or_else(|| "expected an object.".to_string())?;

    let gateway_eui = obj
        .get("gatewayEui")
        .or_else(|| obj.get("gateway_eui"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty());
    let rxpk = obj.get("rxpk").and_then(|v| v.as_object());
    let (gateway_eui, rxpk) = match (gateway_eui, rxpk) {
        (Some(gw), Some(rxpk)) => (gw.to_string(), Rxpk::from(rxpk.clone())),
        _ => return Err("missing gatewayEui or rxpk.".to_string()),
    };

    normalize_gateway_eui(&gateway_eui).map_err(|e| e.to_string())?;

    if rxpk.data().is_empty() {
        return Err("Missing rxpk.data payload.".to_string());
    }
    let phy = rxpk
        .phy_payload()
        .map_err(|_| "rxpk.data is not valid base64.".to_string())?;
    let dev_addr = extract_dev_addr(&phy)
        .ok_or_else(|| "PHYPayload too short to contain a DevAddr.".to_string())?;

    Ok((UplinkRecord { gateway_eui, rxpk }, dev_addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::udp::protocol::build_push_data;
    use std::io::Cursor;

    const GOOD: &str = r#"{"gatewayEui":"0102030405060708","rxpk":{"time":"2025-01-01T12:00:00Z","freq":868.3,"datr":"SF7BW125","size":16,"data":"QNobASYAAAAB9r4zLgAAAAA="}}"#;

    #[test]
    fn test_scan_valid_log() {
        let log = format!("{}\n\n{}\n", GOOD, GOOD.replace("gatewayEui", "gateway_eui"));
        let result = scan_log(Cursor::new(log)).unwrap();
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.gateways, vec!["0102030405060708"]);
        assert_eq!(result.dev_addrs, vec!["26011BDA"]);
        assert!(result.errors.is_empty());
        assert_eq!(result.records[0].rxpk.freq(), Some(868.3));
    }

    #[test]
    fn test_bad_lines_are_reported_and_skipped() {
        let log = [
            GOOD,
            "not json",
            "[1,2]",
            r#"{"rxpk":{"data":"QAE="}}"#,
            r#"{"gatewayEui":"0102","rxpk":{"data":"QNobASY="}}"#,
            r#"{"gatewayEui":"0102030405060708","rxpk":{"data":"@@@"}}"#,
            r#"{"gatewayEui":"0102030405060708","rxpk":{"data":"QAE="}}"#,
            r#"{"gatewayEui":"0102030405060708","rxpk":{"data":123}}"#,
        ]
        .join("\n");

        let result = scan_log(Cursor::new(log)).unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.errors.len(), 7);
        assert!(result.errors[0].starts_with("Line 2: JSON decode error"));
        assert_eq!(result.errors[1], "Line 3: expected an object.");
        assert_eq!(result.errors[2], "Line 4: missing gatewayEui or rxpk.");
        assert!(result.errors[3].starts_with("Line 5: invalid gateway EUI"));
        assert_eq!(result.errors[4], "Line 6: rxpk.data is not valid base64.");
        assert_eq!(
            result.errors[5],
            "Line 7: PHYPayload too short to contain a DevAddr."
        );
        assert_eq!(result.errors[6], "Line 8: Missing rxpk.data payload.");
    }

    #[test]
    fn test_unusual_rxpk_fields_are_kept_verbatim() {
        let line = r#"{"gatewayEui":"0102030405060708","rxpk":{"chan":300,"tmst":4294967296,"rssi":-60,"freq":"fast","data":"QNobASYAAAAB9r4zLgAAAAA="}}"#;
        let result = scan_log(Cursor::new(line)).unwrap();
        assert!(result.errors.is_empty());

        let rxpk = &result.records[0].rxpk;
        assert_eq!(rxpk.tmst(), Some(4_294_967_296));
        assert_eq!(rxpk.freq(), None);

        let packet = build_push_data(&result.records[0].gateway_eui, rxpk).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&packet[12..]).unwrap();
        let captured: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(body["rxpk"][0], captured["rxpk"]);
        assert!(!String::from_utf8_lossy(&packet[12..]).contains("-60.0"));
    }

    #[test]
    fn test_invalid_utf8_line() {
        let mut log = GOOD.as_bytes().to_vec();
        log.extend_from_slice(b"\n\xff\xfe\n");
        let result = scan_log(Cursor::new(log)).unwrap();
        assert_eq!(result.errors, vec!["Line 2: invalid UTF-8 encoding."]);
    }

    #[test]
    fn test_no_valid_records() {
        let err = scan_log(Cursor::new("garbage\n")).unwrap_err();
        match err {
            ScanError::NoValidRecords { errors } => assert_eq!(errors.len(), 1),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_summary_collapses_long_lists() {
        let result = ScanResult {
            errors: (1..=12).map(|i| format!("Line {}: bad", i)).collect(),
            ..Default::default()
        };
        let lines = result.summary_lines();
        assert_eq!(lines[1], "Uplinks (valid)=0");
        assert_eq!(lines[2], "Gateway EUI: none");
        assert_eq!(lines[4], "Validation errors=12.");
        assert_eq!(lines.last().unwrap(), "... (+2 more)");

        let items: Vec<String> = (0..12).map(|i| i.to_string()).collect();
        assert_eq!(
            format_list("X", &items, 10),
            "X: 0, 1, 2, 3, 4, 5, 6, 7, 8, 9 (+2 more)"
        );
    }
}
