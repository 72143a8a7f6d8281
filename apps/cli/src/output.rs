//! Rendering of command results

use crate::OutputFormat;
use podcatch_types::DownloadStatus;
use serde::Serialize;

/// Render `value` as pretty JSON or through its `Display` impl
pub fn print_output<T: Serialize + std::fmt::Display>(
    value: &T,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let rendered = match format {
        OutputFormat::Json => serde_json::to_string_pretty(value)?,
        OutputFormat::Human => value.to_string(),
    };
    println!("{rendered}");
    Ok(())
}

pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// "12 MB of 40 MB (30%)", or just the received size when the total is unknown
pub fn format_transfer(status: &DownloadStatus) -> String {
    let received = format_bytes(status.bytes_received);
    match (status.total_bytes, status.progress()) {
        (Some(total), Some(percent)) if status.bytes_received < total => {
            format!("{} of {} ({:.0}%)", received, format_bytes(total), percent)
        }
        _ => received,
    }
}
