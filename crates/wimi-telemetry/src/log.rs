use crate::entry::{LogEntry, LogEvent};
use crate::export::{self, ExportFormat};
use crate::metrics::{Aggregates, TelemetrySnapshot};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wimi_core::{Clock, Severity, SystemClock, WimiResult};

/// Correlation id used when an entry has nothing to inherit.
pub const UNCORRELATED: &str = "uncorrelated";

/// Bounds for the in-memory log and its aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Maximum retained entries; the oldest are dropped first.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Size of the sliding error-type sample.
    #[serde(default = "default_error_sample")]
    pub error_sample_size: usize,
    /// How many error types the snapshot reports.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_capacity() -> usize {
    10_000
}
fn default_error_sample() -> usize {
    200
}
fn default_top_k() -> usize {
    5
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            error_sample_size: default_error_sample(),
            top_k: default_top_k(),
        }
    }
}

/// Filter for [`TelemetryLog::query`].
#[derive(Debug, Clone)]
pub enum LogQuery {
    /// Entries of one logical operation.
    Correlation(String),
    /// Entries referencing one plan.
    Plan(String),
    /// Entries written in `[from, to]`.
    TimeRange {
        /// Inclusive lower bound.
        from: DateTime<Utc>,
        /// Inclusive upper bound.
        to: DateTime<Utc>,
    },
}

impl LogQuery {
    fn matches(&self, entry: &LogEntry) -> bool {
        match self {
            LogQuery::Correlation(id) => entry.correlation_id == *id,
            LogQuery::Plan(id) => entry.plan_id.as_deref() == Some(id.as_str()),
            LogQuery::TimeRange { from, to } => entry.timestamp >= *from && entry.timestamp <= *to,
        }
    }
}

struct LogState {
    next_sequence: u64,
    entries: VecDeque<LogEntry>,
    plan_correlations: HashMap<String, String>,
    current_correlation: Option<String>,
    aggregates: Aggregates,
}

/// Correlation-scoped structured event log with incrementally maintained
/// aggregates.
///
/// Every write takes one short global lock; nothing awaits while holding it.
/// Entries are mirrored to `tracing` and, when a file sink is attached,
/// appended as JSON lines by a background task.
pub struct TelemetryLog {
    state: Mutex<LogState>,
    config: TelemetryConfig,
    clock: Arc<dyn Clock>,
    sink: Option<mpsc::UnboundedSender<LogEntry>>,
}

impl TelemetryLog {
    /// Create a log with the given bounds and the system clock.
    pub fn new(config: TelemetryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a log that timestamps entries with `clock`.
    pub fn with_clock(config: TelemetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LogState {
                next_sequence: 0,
                entries: VecDeque::new(),
                plan_correlations: HashMap::new(),
                current_correlation: None,
                aggregates: Aggregates::new(config.error_sample_size),
            }),
            config,
            clock,
            sink: None,
        }
    }

    /// Attach a JSONL file sink under `log_dir`. Spawns a background task
    /// that appends every entry to `events.jsonl`; must be called inside a
    /// tokio runtime.
    pub fn with_file_sink(mut self, log_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogEntry>();

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;

            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                error!(dir = %log_dir.display(), error = %e, "Telemetry sink: cannot create log dir");
                return;
            }
            let path = log_dir.join("events.jsonl");
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Telemetry sink: cannot open log file");
                    return;
                }
            };

            while let Some(entry) = rx.recv().await {
                match serde_json::to_string(&entry) {
                    Ok(line) => {
                        let line = format!("{line}\n");
                        if let Err(e) = file.write_all(line.as_bytes()).await {
                            warn!(error = %e, "Telemetry sink: write failed");
                        }
                        let _ = file.flush().await;
                    }
                    Err(e) => warn!(error = %e, "Telemetry sink: serialization failed"),
                }
            }
        });

        self.sink = Some(tx);
        self
    }

    /// Open a new correlation scope. Entries without an explicit or plan-bound
    /// correlation id inherit the most recently started one.
    pub fn start_correlation(&self, prefix: &str) -> String {
        let simple = Uuid::new_v4().simple().to_string();
        let id = format!("{prefix}_{}", &simple[..12]);
        self.state.lock().current_correlation = Some(id.clone());
        debug!(correlation_id = %id, "Telemetry: correlation started");
        id
    }

    /// Make every later entry for `plan_id` inherit `correlation_id`.
    pub fn bind_plan(&self, plan_id: &str, correlation_id: &str) {
        self.state
            .lock()
            .plan_correlations
            .insert(plan_id.to_string(), correlation_id.to_string());
    }

    /// Forget the correlation bound to `plan_id`. Stored entries keep theirs.
    pub fn unbind_plan(&self, plan_id: &str) {
        self.state.lock().plan_correlations.remove(plan_id);
    }

    /// Number of plans with a bound correlation.
    pub fn bound_plans(&self) -> usize {
        self.state.lock().plan_correlations.len()
    }

    /// Correlation id bound to a plan.
    pub fn correlation_for(&self, plan_id: &str) -> Option<String> {
        self.state.lock().plan_correlations.get(plan_id).cloned()
    }

    /// Append an event. Returns the stored entry.
    pub fn log(&self, event: LogEvent) -> LogEntry {
        let entry = {
            let mut state = self.state.lock();
            let correlation_id = event
                .correlation_id
                .or_else(|| {
                    event
                        .plan_id
                        .as_ref()
                        .and_then(|p| state.plan_correlations.get(p).cloned())
                })
                .or_else(|| state.current_correlation.clone())
                .unwrap_or_else(|| UNCORRELATED.to_string());

            let entry = LogEntry {
                sequence: state.next_sequence,
                timestamp: self.clock.now(),
                correlation_id,
                plan_id: event.plan_id,
                agent_name: event.agent_name,
                event_type: event.event_type,
                severity: event.severity,
                duration_seconds: event.duration_seconds,
                success: event.success,
                message: event.message,
                metadata: event.metadata,
            };
            state.next_sequence += 1;
            state.aggregates.record(&entry);
            state.entries.push_back(entry.clone());
            while state.entries.len() > self.config.capacity {
                state.entries.pop_front();
            }
            entry
        };

        mirror_to_tracing(&entry);
        if let Some(tx) = &self.sink {
            let _ = tx.send(entry.clone());
        }
        entry
    }

    /// Entries matching `query`, in arrival order.
    pub fn query(&self, query: &LogQuery) -> Vec<LogEntry> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect()
    }

    /// Every retained entry, in arrival order.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.state.lock().entries.iter().cloned().collect()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the log holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current aggregates.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let state = self.state.lock();
        state
            .aggregates
            .snapshot(state.entries.len(), self.config.top_k)
    }

    /// Serialize every retained entry.
    pub fn export(&self, format: ExportFormat) -> WimiResult<String> {
        export::encode(&self.entries(), format)
    }

    /// Serialize the entries matching `query`.
    pub fn export_query(&self, query: &LogQuery, format: ExportFormat) -> WimiResult<String> {
        export::encode(&self.query(query), format)
    }
}

impl Default for TelemetryLog {
    fn default() -> Self {
        Self::new(TelemetryConfig::default())
    }
}

fn mirror_to_tracing(entry: &LogEntry) {
    let plan_id = entry.plan_id.as_deref().unwrap_or("-");
    let agent = entry.agent_name.as_deref().unwrap_or("-");
    match entry.severity {
        Severity::Critical | Severity::High => warn!(
            correlation_id = %entry.correlation_id,
            plan_id = %plan_id,
            agent = %agent,
            event = %entry.event_type,
            severity = %entry.severity,
            "{}",
            entry.message
        ),
        Severity::Medium | Severity::Low => info!(
            correlation_id = %entry.correlation_id,
            plan_id = %plan_id,
            agent = %agent,
            event = %entry.event_type,
            "{}",
            entry.message
        ),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::entry::EventType;
    use chrono::Duration;
    use wimi_core::ManualClock;

    #[test]
    fn test_correlation_inheritance() {
        let log = TelemetryLog::default();
        let corr = log.start_correlation("plan");
        assert!(corr.starts_with("plan_"));

        let entry = log.log(LogEvent::new(EventType::WorkflowStarted, "started"));
        assert_eq!(entry.correlation_id, corr);

        log.bind_plan("plan_a", "corr_a");
        let other = log.start_correlation("sweep");
        let bound = log.log(LogEvent::new(EventType::StateTransition, "x").plan("plan_a"));
        assert_eq!(bound.correlation_id, "corr_a");
        let inherited = log.log(LogEvent::new(EventType::ApprovalExpired, "y"));
        assert_eq!(inherited.correlation_id, other);
    }

    #[test]
    fn test_unbind_plan_keeps_entries() {
        let log = TelemetryLog::default();
        log.bind_plan("plan_a", "corr_a");
        log.log(LogEvent::new(EventType::StateTransition, "x").plan("plan_a"));
        assert_eq!(log.bound_plans(), 1);

        log.unbind_plan("plan_a");
        assert_eq!(log.bound_plans(), 0);
        assert_eq!(log.correlation_for("plan_a"), None);
        let kept = log.query(&LogQuery::Plan("plan_a".into()));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].correlation_id, "corr_a");
    }

    #[test]
    fn test_uncorrelated_default() {
        let log = TelemetryLog::default();
        let entry = log.log(LogEvent::new(EventType::ErrorRecorded, "boom"));
        assert_eq!(entry.correlation_id, UNCORRELATED);
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let log = TelemetryLog::default();
        let seqs: Vec<u64> = (0..5)
            .map(|i| log.log(LogEvent::new(EventType::AgentStarted, format!("step {i}"))).sequence)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let log = TelemetryLog::new(TelemetryConfig {
            capacity: 3,
            ..TelemetryConfig::default()
        });
        for i in 0..5 {
            log.log(LogEvent::new(EventType::AgentStarted, format!("{i}")));
        }
        let entries = log.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "2");
        assert_eq!(log.snapshot().total_entries, 3);
    }

    #[test]
    fn test_query_filters() {
        let clock = Arc::new(ManualClock::starting_now());
        let log = TelemetryLog::with_clock(TelemetryConfig::default(), clock.clone());
        let start = clock.now();

        log.log(LogEvent::new(EventType::WorkflowStarted, "a").plan("p1").correlation("c1"));
        clock.advance(Duration::minutes(10));
        log.log(LogEvent::new(EventType::WorkflowStarted, "b").plan("p2").correlation("c2"));
        clock.advance(Duration::minutes(10));
        log.log(LogEvent::new(EventType::AgentStarted, "c").plan("p1").correlation("c1"));

        let p1 = log.query(&LogQuery::Plan("p1".into()));
        assert_eq!(p1.iter().map(|e| e.message.as_str()).collect::<Vec<_>>(), vec!["a", "c"]);

        let c2 = log.query(&LogQuery::Correlation("c2".into()));
        assert_eq!(c2.len(), 1);

        let early = log.query(&LogQuery::TimeRange {
            from: start,
            to: start + Duration::minutes(15),
        });
        assert_eq!(early.len(), 2);
    }

    #[test]
    fn test_aggregates_on_write() {
        let log = TelemetryLog::default();
        log.log(LogEvent::new(EventType::AgentCompleted, "ok").agent("gmail").success(true).duration(2.0));
        log.log(LogEvent::new(EventType::AgentFailed, "bad").agent("gmail").success(false).duration(4.0));
        log.log(LogEvent::new(EventType::AgentCompleted, "ok").agent("invoice").success(true));
        log.log(LogEvent::new(EventType::WorkflowCompleted, "done").duration(60.0));
        log.log(LogEvent::new(EventType::WorkflowFailed, "failed").duration(30.0));

        let snap = log.snapshot();
        let gmail = &snap.agents["gmail"];
        assert_eq!(gmail.attempts, 2);
        assert!((gmail.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((gmail.average_duration_seconds - 3.0).abs() < f64::EPSILON);
        assert!((snap.global_success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(snap.workflows_finished, 2);
        assert!((snap.average_workflow_duration_seconds - 45.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_top_errors_sliding_sample() {
        let log = TelemetryLog::new(TelemetryConfig {
            error_sample_size: 4,
            top_k: 2,
            ..TelemetryConfig::default()
        });
        for kind in ["NETWORK", "NETWORK", "TIMEOUT", "VALIDATION", "VALIDATION", "VALIDATION"] {
            log.log(LogEvent::new(EventType::ErrorRecorded, "err").meta("error_type", kind));
        }
        // sample now holds TIMEOUT, VALIDATION x3
        let top = log.snapshot().top_errors;
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].error_type, "VALIDATION");
        assert_eq!(top[0].count, 3);
        assert_eq!(top[1].error_type, "TIMEOUT");
    }

    #[tokio::test]
    async fn test_file_sink_writes_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("telemetry");
        let log = TelemetryLog::default().with_file_sink(dir.clone());
        log.log(LogEvent::new(EventType::WorkflowStarted, "one").correlation("c"));
        log.log(LogEvent::new(EventType::WorkflowCompleted, "two").correlation("c"));

        let path = dir.join("events.jsonl");
        let mut content = String::new();
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            content = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            if content.lines().count() == 2 {
                break;
            }
        }
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("workflow_completed"));
    }
}
