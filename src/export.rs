//! Export of decoded rows as JSON or CSV

use serde_json::Value;
use std::collections::BTreeSet;
use std::io::Write;

use crate::decode::{DecodedRow, RowStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn file_name(&self) -> &'static str {
        match self {
            ExportFormat::Json => "decoded_payloads.json",
            ExportFormat::Csv => "decoded_payloads.csv",
        }
    }
}

const FIXED_COLUMNS: [&str; 13] = [
    "index",
    "status",
    "devaddr",
    "fcnt",
    "fport",
    "time",
    "time_unix",
    "time_utc",
    "gateway_eui",
    "freq",
    "payload_hex",
    "decoded",
    "error",
];

pub fn write_rows<W: Write>(
    rows: &[DecodedRow],
    format: ExportFormat,
    writer: W,
) -> anyhow::Result<()> {
    match format {
        ExportFormat::Json => write_json(rows, writer),
        ExportFormat::Csv => write_csv(rows, writer),
    }
}

pub fn write_json<W: Write>(rows: &[DecodedRow], mut writer: W) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(&mut writer, rows)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Fixed row columns, then one column per flattened decoder key
pub fn write_csv<W: Write>(rows: &[DecodedRow], writer: W) -> anyhow::Result<()> {
    let flat_keys: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| row.decoded_flat.keys().map(String::as_str))
        .collect();
    let flat_columns = flat_columns(&flat_keys);

    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(
        FIXED_COLUMNS
            .iter()
            .copied()
            .chain(flat_columns.iter().map(|(_, column)| column.as_str())),
    )?;

    for row in rows {
        let mut record = vec![
            row.index.to_string(),
            status_label(row.status).to_string(),
            row.devaddr.clone(),
            opt(row.fcnt),
            opt(row.fport),
            row.time.clone(),
            opt(row.time_unix),
            row.time_utc.clone(),
            row.gateway_eui.clone(),
            opt(row.freq),
            row.payload_hex.clone(),
            match &row.decoded {
                Value::Null => String::new(),
                decoded => decoded.to_string(),
            },
            row.error.clone(),
        ];
        for (key, _) in &flat_columns {
            record.push(row.decoded_flat.get(*key).map(cell).unwrap_or_default());
        }
        csv.write_record(&record)?;
    }

    csv.flush()?;
    Ok(())
}

/// Header for each flattened key. Keys that clash with a fixed column are
/// prefixed with `decoded.` until the header is unique.
fn flat_columns<'a>(flat_keys: &BTreeSet<&'a str>) -> Vec<(&'a str, String)> {
    let mut taken: BTreeSet<String> = FIXED_COLUMNS.iter().map(|c| c.to_string()).collect();
    taken.extend(flat_keys.iter().map(|key| key.to_string()));

    flat_keys
        .iter()
        .map(|key| {
            let mut column = key.to_string();
            if FIXED_COLUMNS.iter().any(|fixed| fixed == key) {
                while taken.contains(&column) {
                    column = format!("decoded.{}", column);
                }
                taken.insert(column.clone());
            }
            (*key, column)
        })
        .collect()
}

fn status_label(status: RowStatus) -> &'static str {
    match status {
        RowStatus::Decoded => "Decoded",
        RowStatus::Error => "Error",
    }
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
