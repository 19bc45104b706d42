//! Command execution.

use crate::Commands;
use binlog_store::{BinlogError, LogItem, LogManager, RecordAddress, VerifyReport};
use colored::Colorize;
use serde::Serialize;
use thiserror::Error;

/// Command failure.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Store(#[from] BinlogError),

    #[error("failed to read '{0}': {1}")]
    Input(String, std::io::Error),

    /// Verification found problems; carries the rendered report.
    #[error("verification failed")]
    Unclean(String),
}

/// JSON view of a record.
#[derive(Debug, Serialize)]
struct ItemView {
    address: u64,
    segment: u32,
    offset: u64,
    status: i8,
    leading_marker: i64,
    trailing_marker: i64,
    size: usize,
    payload: String,
}

impl From<&LogItem> for ItemView {
    fn from(item: &LogItem) -> Self {
        Self {
            address: item.address.as_u64(),
            segment: item.address.segment(),
            offset: item.address.offset(),
            status: item.status,
            leading_marker: item.leading_marker,
            trailing_marker: item.trailing_marker,
            size: item.payload.len(),
            payload: String::from_utf8_lossy(&item.payload).into_owned(),
        }
    }
}

/// Executes a command, then closes the log.
///
/// The close result is returned beside the command's own result so that a
/// failing close never hides the command output or error.
pub fn execute_and_close(
    log: &LogManager,
    cmd: Commands,
) -> (Result<String, CommandError>, Result<(), BinlogError>) {
    let result = execute(log, cmd);
    (result, log.close())
}

/// Executes a command and returns the formatted output.
pub fn execute(log: &LogManager, cmd: Commands) -> Result<String, CommandError> {
    match cmd {
        Commands::Append {
            data,
            status,
            fsync,
        } => {
            let payload = read_payload(&data)?;
            let address = log.append_with_status(&payload, status, fsync)?;
            tracing::debug!("Appended {} bytes at {}", payload.len(), address);
            Ok(address.as_u64().to_string())
        }

        Commands::Get { address, raw } => {
            let item = log.get_by_id(RecordAddress::from_u64(address))?;
            if raw {
                Ok(String::from_utf8_lossy(&item.payload).into_owned())
            } else {
                Ok(format_json(&ItemView::from(&item)))
            }
        }

        Commands::Pop { after, count } => {
            if let Some(after) = after {
                log.seek(RecordAddress::from_u64(after))?;
            }
            let mut lines = Vec::new();
            for _ in 0..count {
                match log.pop()? {
                    Some(item) => lines.push(format_line(&ItemView::from(&item))),
                    None => break,
                }
            }
            tracing::debug!("Popped {} records", lines.len());
            Ok(lines.join("\n"))
        }

        Commands::Dump { after, limit } => {
            let reader = log.reader(after.map(RecordAddress::from_u64));
            let mut lines = Vec::new();
            for item in reader.take(limit.unwrap_or(usize::MAX)) {
                lines.push(format_line(&ItemView::from(&item?)));
            }
            Ok(lines.join("\n"))
        }

        Commands::Verify => {
            let report = log.verify()?;
            tracing::info!(
                "Verified {} segments: {} valid frames, {} corrupt, {} torn bytes",
                report.segments,
                report.valid_frames,
                report.corrupt_frames.len(),
                report.torn_bytes
            );
            let summary = format_report(&report);
            if report.is_clean() {
                Ok(summary)
            } else {
                Err(CommandError::Unclean(summary))
            }
        }

        Commands::Info => {
            let info = serde_json::json!({
                "dir": log.dir().display().to_string(),
                "base_name": log.base_name(),
                "capacity": log.capacity(),
                "head": log.head_number(),
                "tail": log.tail_number(),
                "segments": log.segment_numbers(),
                "total_size": log.total_size(),
                "stats": log.stats(),
            });
            Ok(format_json(&info))
        }
    }
}

/// Reads a payload argument, loading it from a file when prefixed with `@`.
fn read_payload(data: &str) -> Result<Vec<u8>, CommandError> {
    match data.strip_prefix('@') {
        Some(path) => std::fs::read(path).map_err(|e| CommandError::Input(path.to_string(), e)),
        None => Ok(data.as_bytes().to_vec()),
    }
}

fn format_report(report: &VerifyReport) -> String {
    let mut out = Vec::new();
    out.push(format!(
        "{} segments, {} valid frames",
        report.segments, report.valid_frames
    ));

    for frame in &report.corrupt_frames {
        out.push(format!(
            "{} {}:{} (address {}): {}",
            "CORRUPT".red(),
            frame.segment,
            frame.offset,
            frame.address,
            frame.reason
        ));
    }
    if report.torn_bytes > 0 {
        out.push(format!(
            "{} {} incomplete trailing bytes cut at open",
            "TORN".yellow(),
            report.torn_bytes
        ));
    }

    if report.is_clean() {
        out.push("OK".green().to_string());
    } else {
        out.push(
            format!("{} corrupt frames", report.corrupt_frames.len())
                .red()
                .to_string(),
        );
    }
    out.join("\n")
}

fn format_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| e.to_string())
}

fn format_line<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| e.to_string())
}
