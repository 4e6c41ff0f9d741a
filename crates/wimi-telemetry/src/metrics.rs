use crate::entry::{EventType, LogEntry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

#[derive(Debug, Clone, Default)]
struct AgentCounters {
    attempts: u64,
    successes: u64,
    timed_runs: u64,
    total_duration: f64,
}

/// Aggregates updated on every write. Reads never rescan the log.
#[derive(Debug)]
pub(crate) struct Aggregates {
    agents: HashMap<String, AgentCounters>,
    outcomes: u64,
    successes: u64,
    workflows_finished: u64,
    workflow_duration_total: f64,
    error_sample: VecDeque<String>,
    error_counts: HashMap<String, usize>,
    sample_size: usize,
}

impl Aggregates {
    pub(crate) fn new(sample_size: usize) -> Self {
        Self {
            agents: HashMap::new(),
            outcomes: 0,
            successes: 0,
            workflows_finished: 0,
            workflow_duration_total: 0.0,
            error_sample: VecDeque::with_capacity(sample_size),
            error_counts: HashMap::new(),
            sample_size,
        }
    }

    pub(crate) fn record(&mut self, entry: &LogEntry) {
        if let Some(success) = entry.success {
            self.outcomes += 1;
            if success {
                self.successes += 1;
            }
            if let Some(agent) = &entry.agent_name {
                let counters = self.agents.entry(agent.clone()).or_default();
                counters.attempts += 1;
                if success {
                    counters.successes += 1;
                }
                if let Some(d) = entry.duration_seconds {
                    counters.timed_runs += 1;
                    counters.total_duration += d;
                }
            }
        }

        if entry.event_type.is_workflow_end() {
            if let Some(d) = entry.duration_seconds {
                self.workflows_finished += 1;
                self.workflow_duration_total += d;
            }
        }

        if entry.event_type == EventType::ErrorRecorded {
            let error_type = entry
                .metadata
                .get("error_type")
                .and_then(|v| v.as_str())
                .map_or_else(|| entry.event_type.as_str().to_string(), str::to_string);
            self.push_error(error_type);
        }
    }

    fn push_error(&mut self, error_type: String) {
        if self.sample_size == 0 {
            return;
        }
        if self.error_sample.len() == self.sample_size {
            if let Some(evicted) = self.error_sample.pop_front() {
                if let Some(count) = self.error_counts.get_mut(&evicted) {
                    *count -= 1;
                    if *count == 0 {
                        self.error_counts.remove(&evicted);
                    }
                }
            }
        }
        *self.error_counts.entry(error_type.clone()).or_insert(0) += 1;
        self.error_sample.push_back(error_type);
    }

    pub(crate) fn snapshot(&self, total_entries: usize, top_k: usize) -> TelemetrySnapshot {
        let agents = self
            .agents
            .iter()
            .map(|(name, c)| {
                (
                    name.clone(),
                    AgentSummary {
                        attempts: c.attempts,
                        successes: c.successes,
                        success_rate: ratio(c.successes, c.attempts),
                        average_duration_seconds: if c.timed_runs == 0 {
                            0.0
                        } else {
                            c.total_duration / c.timed_runs as f64
                        },
                    },
                )
            })
            .collect();

        let mut top_errors: Vec<ErrorFrequency> = self
            .error_counts
            .iter()
            .map(|(error_type, count)| ErrorFrequency {
                error_type: error_type.clone(),
                count: *count,
            })
            .collect();
        top_errors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.error_type.cmp(&b.error_type)));
        top_errors.truncate(top_k);

        TelemetrySnapshot {
            total_entries,
            global_success_rate: ratio(self.successes, self.outcomes),
            agents,
            workflows_finished: self.workflows_finished,
            average_workflow_duration_seconds: if self.workflows_finished == 0 {
                0.0
            } else {
                self.workflow_duration_total / self.workflows_finished as f64
            },
            top_errors,
        }
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Per-agent success and timing summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    /// Runs with a recorded outcome.
    pub attempts: u64,
    /// Successful runs.
    pub successes: u64,
    /// `successes / attempts`, 0 when no runs.
    pub success_rate: f64,
    /// Mean duration over timed runs.
    pub average_duration_seconds: f64,
}

/// How often an error type appears in the sliding sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrequency {
    /// Error category or type name.
    pub error_type: String,
    /// Occurrences within the sample.
    pub count: usize,
}

/// Point-in-time view of the telemetry aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Entries currently retained.
    pub total_entries: usize,
    /// Share of successful outcomes across every entry that had one.
    pub global_success_rate: f64,
    /// Per-agent summaries keyed by agent id.
    pub agents: BTreeMap<String, AgentSummary>,
    /// Workflows that reached a terminal status with a measured duration.
    pub workflows_finished: u64,
    /// Mean workflow duration.
    pub average_workflow_duration_seconds: f64,
    /// Most frequent error types, highest first.
    pub top_errors: Vec<ErrorFrequency>,
}
