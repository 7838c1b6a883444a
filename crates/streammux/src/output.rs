use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// One completed echo exchange on a stream.
#[derive(Debug)]
pub struct EchoReport<'a> {
    pub port: u16,
    pub stream_id: Option<u8>,
    pub priority: u8,
    pub payload: &'a [u8],
    pub elapsed_ms: u128,
}

#[derive(Serialize)]
struct EchoOutput {
    port: u16,
    stream_id: Option<u8>,
    priority: u8,
    payload_size: usize,
    payload: String,
    elapsed_ms: u128,
    timestamp: String,
}

pub fn print_echo(report: &EchoReport<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = EchoOutput {
                port: report.port,
                stream_id: report.stream_id,
                priority: report.priority,
                payload_size: report.payload.len(),
                payload: payload_preview(report.payload),
                elapsed_ms: report.elapsed_ms,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["PORT", "STREAM", "PRIORITY", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    report.port.to_string(),
                    stream_label(report.stream_id),
                    report.priority.to_string(),
                    report.payload.len().to_string(),
                    payload_preview(report.payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "port={} stream={} priority={} size={} elapsed={}ms payload={}",
                report.port,
                stream_label(report.stream_id),
                report.priority,
                report.payload.len(),
                report.elapsed_ms,
                payload_preview(report.payload)
            );
        }
        OutputFormat::Raw => print_raw(report.payload),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn stream_label(id: Option<u8>) -> String {
    id.map_or_else(|| "-".to_string(), |id| id.to_string())
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
