//! Packet export writers.

use chrono::{TimeZone, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::models::packet::{HttpInfo, Packet};
use crate::utils::error::{AppError, AppResult};

/// Link type for payloads with no link-layer framing
const LINKTYPE_USER0: u32 = 147;
const PCAP_SNAPLEN: u32 = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
    Har,
    Pcap,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Har => "har",
            ExportFormat::Pcap => "pcap",
        }
    }
}

/// Write `packets` to `path`, or to a kept temp file when no path is given.
/// Returns where the export landed.
pub fn export_packets(packets: &[Packet], format: ExportFormat, path: Option<&Path>) -> AppResult<PathBuf> {
    let (file, target) = match path {
        Some(path) => (File::create(path)?, path.to_path_buf()),
        None => {
            let tmp = tempfile::Builder::new()
                .prefix("hookshark-")
                .suffix(&format!(".{}", format.extension()))
                .tempfile()?;
            tmp.keep().map_err(|e| AppError::ExportError(e.to_string()))?
        }
    };

    let mut writer = BufWriter::new(file);
    write_packets(packets, format, &mut writer)?;
    writer.flush()?;

    info!(
        "Exported {} packets as {} to {}",
        packets.len(),
        format.extension(),
        target.display()
    );
    Ok(target)
}

pub fn write_packets<W: Write>(packets: &[Packet], format: ExportFormat, writer: &mut W) -> AppResult<()> {
    match format {
        ExportFormat::Json => {
            serde_json::to_writer_pretty(&mut *writer, packets)?;
            Ok(())
        }
        ExportFormat::Csv => write_csv(packets, writer),
        ExportFormat::Har => {
            serde_json::to_writer_pretty(&mut *writer, &har_document(packets))?;
            Ok(())
        }
        ExportFormat::Pcap => write_pcap(packets, writer),
    }
}

fn write_csv<W: Write>(packets: &[Packet], writer: &mut W) -> AppResult<()> {
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);
    wtr.write_record([
        "id",
        "timestamp",
        "process",
        "protocol",
        "direction",
        "source",
        "destination",
        "size",
        "function",
        "data",
    ])
    .map_err(csv_error)?;

    for p in packets {
        let data = p
            .raw_data
            .as_ref()
            .map(|raw| raw.hex().to_string())
            .or_else(|| p.packet_data.clone())
            .unwrap_or_default();
        wtr.write_record([
            p.id.to_string(),
            p.timestamp.to_string(),
            p.process_name.clone(),
            p.protocol.as_str().to_string(),
            p.direction.as_str().to_string(),
            p.src_addr.clone(),
            p.dst_addr.clone(),
            p.size.to_string(),
            p.packet_function.map(|f| f.as_str().to_string()).unwrap_or_default(),
            data,
        ])
        .map_err(csv_error)?;
    }
    wtr.flush()?;
    Ok(())
}

fn csv_error(err: csv::Error) -> AppError {
    AppError::ExportError(format!("csv: {}", err))
}

/// HAR 1.2 log. Requests open an entry; the next response on the same
/// connection completes it.
fn har_document(packets: &[Packet]) -> Value {
    let mut entries: Vec<Value> = Vec::new();
    let mut open: Vec<(String, usize)> = Vec::new();

    for p in packets {
        let Some(http) = &p.http else {
            continue;
        };
        if http.is_request() {
            let key = format!("{}|{}", p.src_addr, p.dst_addr);
            entries.push(json!({
                "startedDateTime": iso_time(p.timestamp),
                "time": p.duration.unwrap_or(0),
                "request": har_request(http),
                "response": har_response(None),
                "cache": {},
                "timings": { "send": 0, "wait": p.duration.unwrap_or(0), "receive": 0 },
            }));
            open.push((key, entries.len() - 1));
        } else {
            // a response travels the reverse direction of its request
            let key = format!("{}|{}", p.dst_addr, p.src_addr);
            match open.iter().position(|(k, _)| *k == key) {
                Some(i) => {
                    let (_, index) = open.remove(i);
                    entries[index]["response"] = har_response(Some(http));
                }
                None => entries.push(json!({
                    "startedDateTime": iso_time(p.timestamp),
                    "time": 0,
                    "request": har_request(&HttpInfo::default()),
                    "response": har_response(Some(http)),
                    "cache": {},
                    "timings": { "send": 0, "wait": 0, "receive": 0 },
                })),
            }
        }
    }

    json!({
        "log": {
            "version": "1.2",
            "creator": { "name": "hookshark", "version": env!("CARGO_PKG_VERSION") },
            "entries": entries,
        }
    })
}

fn har_headers(http: &HttpInfo) -> Value {
    Value::Array(
        http.headers
            .iter()
            .map(|h| json!({ "name": h.name, "value": h.value }))
            .collect(),
    )
}

fn har_request(http: &HttpInfo) -> Value {
    let mut request = json!({
        "method": http.method.as_deref().unwrap_or(""),
        "url": http.url.as_deref().unwrap_or(""),
        "httpVersion": http.version,
        "cookies": [],
        "headers": har_headers(http),
        "queryString": [],
        "headersSize": -1,
        "bodySize": http.request_body.as_ref().map_or(0, |b| b.len()),
    });
    if let Some(body) = &http.request_body {
        request["postData"] = json!({
            "mimeType": http.header("content-type").unwrap_or(""),
            "text": body,
        });
    }
    request
}

fn har_response(http: Option<&HttpInfo>) -> Value {
    let Some(http) = http else {
        return json!({
            "status": 0,
            "statusText": "",
            "httpVersion": "",
            "cookies": [],
            "headers": [],
            "content": { "size": 0, "mimeType": "" },
            "redirectURL": "",
            "headersSize": -1,
            "bodySize": -1,
        });
    };
    let body = http.response_body.as_deref().unwrap_or("");
    json!({
        "status": http.status_code.unwrap_or(0),
        "statusText": http.reason.as_deref().unwrap_or(""),
        "httpVersion": http.version,
        "cookies": [],
        "headers": har_headers(http),
        "content": {
            "size": body.len(),
            "mimeType": http.header("content-type").unwrap_or(""),
            "text": body,
        },
        "redirectURL": http.header("location").unwrap_or(""),
        "headersSize": -1,
        "bodySize": body.len(),
    })
}

fn iso_time(timestamp_ms: i64) -> String {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

/// Classic little-endian pcap with one record per packet payload
fn write_pcap<W: Write>(packets: &[Packet], writer: &mut W) -> AppResult<()> {
    writer.write_all(&0xa1b2c3d4u32.to_le_bytes())?;
    writer.write_all(&2u16.to_le_bytes())?;
    writer.write_all(&4u16.to_le_bytes())?;
    writer.write_all(&0i32.to_le_bytes())?;
    writer.write_all(&0u32.to_le_bytes())?;
    writer.write_all(&PCAP_SNAPLEN.to_le_bytes())?;
    writer.write_all(&LINKTYPE_USER0.to_le_bytes())?;

    for p in packets {
        let data = p.raw_data.as_ref().map(|raw| raw.as_bytes()).unwrap_or(&[]);
        let incl_len = data.len().min(PCAP_SNAPLEN as usize);
        let ts_sec = p.timestamp.div_euclid(1000) as u32;
        let ts_usec = (p.timestamp.rem_euclid(1000) * 1000) as u32;

        writer.write_all(&ts_sec.to_le_bytes())?;
        writer.write_all(&ts_usec.to_le_bytes())?;
        writer.write_all(&(incl_len as u32).to_le_bytes())?;
        writer.write_all(&(data.len() as u32).to_le_bytes())?;
        writer.write_all(&data[..incl_len])?;
    }
    Ok(())
}
