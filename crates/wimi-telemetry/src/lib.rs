//! Correlation-scoped telemetry for WIMI workflows.
//!
//! Every component of the orchestrator writes structured [`LogEntry`]
//! records here. Success rates, durations and error frequencies are kept up
//! to date on write so metric reads are constant-time.
//!
//! # Main types
//!
//! - [`TelemetryLog`] — The event log and its aggregates.
//! - [`LogEvent`] — Builder for a new entry.
//! - [`LogEntry`] — An immutable stored record.
//! - [`TelemetrySnapshot`] — Point-in-time metrics.

/// Log entry types.
pub mod entry;
/// Export and import of log snapshots.
pub mod export;
/// The event log.
pub mod log;
/// Incremental aggregates.
pub mod metrics;

pub use entry::{EventType, LogEntry, LogEvent};
pub use export::{import, ExportFormat};
pub use log::{LogQuery, TelemetryConfig, TelemetryLog, UNCORRELATED};
pub use metrics::{AgentSummary, ErrorFrequency, TelemetrySnapshot};
