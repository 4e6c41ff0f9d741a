use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use wimi_core::{DataToken, ErrorCategory};

/// Lifecycle status of a workflow.
///
/// ```text
/// Created → Planning → AwaitingPlanApproval → PlanApproved → Executing
///                              ↘ PlanRejected          → AwaitingFinalApproval → Completed
///                                                                          ↘ Restarted
/// any non-terminal → Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Accepted, not yet planned.
    Created,
    /// Computing the sequence.
    Planning,
    /// Waiting on the plan gate.
    AwaitingPlanApproval,
    /// Sequence approved, ready to run.
    PlanApproved,
    /// Sequence declined.
    PlanRejected,
    /// Agents are running.
    Executing,
    /// Waiting on the result gate.
    AwaitingFinalApproval,
    /// Results accepted.
    Completed,
    /// Results declined; a new plan may be submitted.
    Restarted,
    /// Ended early; `failure` says why.
    Failed,
}

impl WorkflowStatus {
    /// No transition leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::PlanRejected
                | WorkflowStatus::Completed
                | WorkflowStatus::Restarted
                | WorkflowStatus::Failed
        )
    }

    /// Whether `self → next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Created, Planning)
                | (Planning, AwaitingPlanApproval)
                | (AwaitingPlanApproval, PlanApproved)
                | (AwaitingPlanApproval, PlanRejected)
                | (PlanApproved, Executing)
                | (Executing, AwaitingFinalApproval)
                | (AwaitingFinalApproval, Completed)
                | (AwaitingFinalApproval, Restarted)
        )
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Created => "created",
            WorkflowStatus::Planning => "planning",
            WorkflowStatus::AwaitingPlanApproval => "awaiting_plan_approval",
            WorkflowStatus::PlanApproved => "plan_approved",
            WorkflowStatus::PlanRejected => "plan_rejected",
            WorkflowStatus::Executing => "executing",
            WorkflowStatus::AwaitingFinalApproval => "awaiting_final_approval",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Restarted => "restarted",
            WorkflowStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a single agent step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// The agent returned its outputs.
    Succeeded,
    /// The agent returned some of its outputs.
    PartialSuccess,
    /// Fixture data was substituted after an explicitly allowed fallback.
    Mocked,
    /// No output; execution went on without it.
    Failed,
}

/// Record of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Zero-based position in the sequence.
    pub step: usize,
    /// Agent that ran.
    pub agent_id: String,
    /// How the step ended.
    pub outcome: StepOutcome,
    /// Wall time of the run.
    pub duration_seconds: f64,
    /// Tokens the step contributed.
    #[serde(default)]
    pub output_tokens: Vec<DataToken>,
    /// Error event of a failed or mocked step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_event_id: Option<String>,
    /// Short summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Why a workflow ended in FAILED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Why the plan failed.
    pub reason: String,
    /// Taxonomy category of the cause.
    pub category: ErrorCategory,
    /// Id of the error event that caused the failure, for log correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_event_id: Option<String>,
    /// When the plan failed.
    pub failed_at: DateTime<Utc>,
}

/// One entry of a workflow's ordered history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Starts at 1 and increases by one per event of the plan.
    pub sequence: u64,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Event name, usually the new status.
    pub event: String,
    /// Status before, for transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<WorkflowStatus>,
    /// Status after, for transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<WorkflowStatus>,
    /// Human-readable detail.
    pub message: String,
}

/// The state of one plan. Only the state machine mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    /// Plan id.
    pub plan_id: String,
    /// Caller session.
    pub session_id: String,
    /// Correlation id shared by every log entry of the plan.
    pub correlation_id: String,
    /// Task as submitted.
    pub task_description: String,
    /// Agents the analyzer required.
    #[serde(default)]
    pub required_agents: Vec<String>,
    /// Agents the analyzer suggested.
    #[serde(default)]
    pub optional_agents: Vec<String>,
    /// Approved execution order.
    pub agent_sequence: Vec<String>,
    /// Index of the next step to run.
    pub current_step: usize,
    /// Lifecycle status.
    pub status: WorkflowStatus,
    /// Data returned by each finished agent, keyed by agent id.
    #[serde(default)]
    pub agent_outputs: BTreeMap<String, serde_json::Value>,
    /// Tokens produced so far during execution.
    #[serde(default)]
    pub available_tokens: BTreeSet<DataToken>,
    /// One record per finished step.
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    /// The plan gate approved the sequence.
    pub plan_approved: bool,
    /// The result gate approved the results.
    pub final_approved: bool,
    /// Reviewer comments, oldest first.
    #[serde(default)]
    pub feedback: Vec<String>,
    /// Planner warnings from submission.
    #[serde(default)]
    pub planner_warnings: Vec<String>,
    /// Set once the plan is FAILED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    /// When the plan was submitted.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
    /// Every event, oldest first.
    pub history: Vec<HistoryEvent>,
}

impl WorkflowContext {
    /// A fresh context in CREATED.
    pub fn new(
        plan_id: impl Into<String>,
        session_id: impl Into<String>,
        task_description: impl Into<String>,
        correlation_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut ctx = Self {
            plan_id: plan_id.into(),
            session_id: session_id.into(),
            correlation_id: correlation_id.into(),
            task_description: task_description.into(),
            required_agents: Vec::new(),
            optional_agents: Vec::new(),
            agent_sequence: Vec::new(),
            current_step: 0,
            status: WorkflowStatus::Created,
            agent_outputs: BTreeMap::new(),
            available_tokens: BTreeSet::new(),
            steps: Vec::new(),
            plan_approved: false,
            final_approved: false,
            feedback: Vec::new(),
            planner_warnings: Vec::new(),
            failure: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        };
        ctx.record("created", None, Some(WorkflowStatus::Created), "task submitted", now);
        ctx
    }

    /// Number of agents in the sequence.
    pub fn total_steps(&self) -> usize {
        self.agent_sequence.len()
    }

    /// Agent due to run next, if any.
    pub fn current_agent(&self) -> Option<&str> {
        self.agent_sequence.get(self.current_step).map(String::as_str)
    }

    /// Whether the workflow reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the plan was cancelled by its owner.
    pub fn is_cancelled(&self) -> bool {
        self.status == WorkflowStatus::Failed
            && self
                .failure
                .as_ref()
                .is_some_and(|f| f.category == ErrorCategory::UserCancelled)
    }

    /// Seconds since creation as of `updated_at`.
    pub fn elapsed_seconds(&self) -> f64 {
        (self.updated_at - self.created_at).num_milliseconds() as f64 / 1000.0
    }

    pub(crate) fn record(
        &mut self,
        event: &str,
        from: Option<WorkflowStatus>,
        to: Option<WorkflowStatus>,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) {
        let sequence = self.history.last().map_or(1, |h| h.sequence + 1);
        self.history.push(HistoryEvent {
            sequence,
            timestamp: at,
            event: event.to_string(),
            from,
            to,
            message: message.into(),
        });
        self.updated_at = at;
    }
}

/// An agent ordering offered for approval, with the reasoning shown to the
/// reviewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceProposal {
    /// Agent ids in execution order.
    pub agents: Vec<String>,
    /// Why each agent is in the sequence, keyed by agent id.
    pub reasoning: BTreeMap<String, String>,
    /// Sum of the agents' estimates.
    pub estimated_duration_seconds: f64,
}
