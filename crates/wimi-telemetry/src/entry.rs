use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use wimi_core::Severity;

/// Kind of event recorded in the telemetry log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A task was submitted and a plan context created.
    WorkflowStarted,
    /// The planner produced a sequence.
    PlanGenerated,
    /// The planner had to break a dependency deadlock or dropped an agent.
    PlanningWarning,
    /// A workflow status transition was applied.
    StateTransition,
    /// An approval request was issued.
    ApprovalRequested,
    /// An approval request was approved, rejected or modified.
    ApprovalResolved,
    /// An approval request passed its deadline.
    ApprovalExpired,
    /// An agent step started.
    AgentStarted,
    /// An agent step finished successfully.
    AgentCompleted,
    /// An agent step failed.
    AgentFailed,
    /// Fixture data was substituted for a failed agent.
    MockFallback,
    /// The resilience manager recorded an error event.
    ErrorRecorded,
    /// A workflow reached COMPLETED.
    WorkflowCompleted,
    /// A workflow reached FAILED.
    WorkflowFailed,
    /// A workflow was cancelled.
    WorkflowCancelled,
    /// A workflow reached RESTARTED.
    WorkflowRestarted,
}

impl EventType {
    /// Wire name of the event type.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::WorkflowStarted => "workflow_started",
            EventType::PlanGenerated => "plan_generated",
            EventType::PlanningWarning => "planning_warning",
            EventType::StateTransition => "state_transition",
            EventType::ApprovalRequested => "approval_requested",
            EventType::ApprovalResolved => "approval_resolved",
            EventType::ApprovalExpired => "approval_expired",
            EventType::AgentStarted => "agent_started",
            EventType::AgentCompleted => "agent_completed",
            EventType::AgentFailed => "agent_failed",
            EventType::MockFallback => "mock_fallback",
            EventType::ErrorRecorded => "error_recorded",
            EventType::WorkflowCompleted => "workflow_completed",
            EventType::WorkflowFailed => "workflow_failed",
            EventType::WorkflowCancelled => "workflow_cancelled",
            EventType::WorkflowRestarted => "workflow_restarted",
        }
    }

    /// Events that close a workflow and carry its total duration.
    pub fn is_workflow_end(self) -> bool {
        matches!(
            self,
            EventType::WorkflowCompleted
                | EventType::WorkflowFailed
                | EventType::WorkflowCancelled
                | EventType::WorkflowRestarted
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable record in the telemetry log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Global arrival order.
    pub sequence: u64,
    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
    /// Logical operation this entry belongs to.
    pub correlation_id: String,
    /// Plan reference, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    /// Agent reference, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// What happened.
    pub event_type: EventType,
    /// How serious it is.
    pub severity: Severity,
    /// Duration of the step or workflow, when measured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    /// Outcome, when the event has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// Human-readable text.
    pub message: String,
    /// Free-form structured data.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Builder for an event before the log assigns sequence, timestamp and
/// correlation id.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub(crate) event_type: EventType,
    pub(crate) message: String,
    pub(crate) correlation_id: Option<String>,
    pub(crate) plan_id: Option<String>,
    pub(crate) agent_name: Option<String>,
    pub(crate) severity: Severity,
    pub(crate) duration_seconds: Option<f64>,
    pub(crate) success: Option<bool>,
    pub(crate) metadata: BTreeMap<String, serde_json::Value>,
}

impl LogEvent {
    /// Start an event of `event_type` with `message`, severity LOW.
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            event_type,
            message: message.into(),
            correlation_id: None,
            plan_id: None,
            agent_name: None,
            severity: Severity::Low,
            duration_seconds: None,
            success: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Use an explicit correlation id instead of inheriting one.
    pub fn correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Attach a plan reference.
    pub fn plan(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }

    /// Attach an agent reference.
    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent_name = Some(agent.into());
        self
    }

    /// Set the severity.
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Record a measured duration.
    pub fn duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    /// Record an outcome.
    pub fn success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    /// Add a metadata field.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
