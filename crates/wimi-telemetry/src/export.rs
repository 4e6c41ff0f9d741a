use crate::entry::LogEntry;
use serde::{Deserialize, Serialize};
use wimi_core::{WimiError, WimiResult};

/// Serialization format for log exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// A single JSON array.
    Json,
    /// One JSON object per line.
    Jsonl,
}

impl std::str::FromStr for ExportFormat {
    type Err = WimiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "jsonl" | "ndjson" => Ok(ExportFormat::Jsonl),
            other => Err(WimiError::UserInput(format!("unknown export format '{other}'"))),
        }
    }
}

pub(crate) fn encode(entries: &[LogEntry], format: ExportFormat) -> WimiResult<String> {
    match format {
        ExportFormat::Json => Ok(serde_json::to_string_pretty(entries)?),
        ExportFormat::Jsonl => {
            let mut out = String::new();
            for entry in entries {
                out.push_str(&serde_json::to_string(entry)?);
                out.push('\n');
            }
            Ok(out)
        }
    }
}

/// Parse an export produced by [`TelemetryLog::export`](crate::TelemetryLog::export)
/// back into entries, preserving their order.
pub fn import(data: &str, format: ExportFormat) -> WimiResult<Vec<LogEntry>> {
    match format {
        ExportFormat::Json => Ok(serde_json::from_str(data)?),
        ExportFormat::Jsonl => data
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(WimiError::from))
            .collect(),
    }
}
