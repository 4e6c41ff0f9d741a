use crate::planner::{SequencePlanner, ValidationReport};
use crate::resilience::ResilienceManager;
use crate::state::{failure, StateMachine};
use crate::types::{SequenceProposal, WorkflowContext, WorkflowStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use wimi_core::{
    deadline_after, Clock, ErrorCategory, Notification, NotificationChannel, NotificationKind, Severity, WimiError,
    WimiResult,
};
use wimi_telemetry::{EventType, LogEvent, TelemetryLog};

/// Which checkpoint a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    /// Before execution, on the proposed sequence.
    Plan,
    /// After execution, on the gathered result.
    Final,
}

impl ApprovalKind {
    fn awaiting(self) -> WorkflowStatus {
        match self {
            ApprovalKind::Plan => WorkflowStatus::AwaitingPlanApproval,
            ApprovalKind::Final => WorkflowStatus::AwaitingFinalApproval,
        }
    }
}

/// Lifecycle of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting on a reviewer.
    Pending,
    /// Accepted.
    Approved,
    /// Declined.
    Rejected,
    /// Superseded by a request carrying a modified sequence.
    Modified,
    /// The deadline passed without an answer.
    Expired,
    /// The plan ended while the request was pending.
    Cancelled,
}

/// A reviewer's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    /// Accept the sequence or the results.
    Approve,
    /// Decline it.
    Reject,
    /// Replace the proposed sequence and ask again. Plan gate only.
    Modify(Vec<String>),
}

impl ApprovalDecision {
    fn label(&self) -> &'static str {
        match self {
            ApprovalDecision::Approve => "approve",
            ApprovalDecision::Reject => "reject",
            ApprovalDecision::Modify(_) => "modify",
        }
    }
}

/// An approval gate instance for one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Request id.
    pub id: String,
    /// Plan the request belongs to.
    pub plan_id: String,
    /// Which gate this is.
    pub kind: ApprovalKind,
    /// Sequence shown to the reviewer.
    pub proposal: SequenceProposal,
    /// Planner validation of `proposal`, plan gate only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    /// When the request was created.
    pub issued_at: DateTime<Utc>,
    /// Deadline after which the request expires.
    pub timeout_at: DateTime<Utc>,
    /// Current state.
    pub status: ApprovalStatus,
    /// Reviewer comment given with the decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    /// When the request left PENDING.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    /// Still waiting on a decision.
    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    /// The window is closed from `timeout_at` on.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now >= self.timeout_at
    }
}

/// What a successful [`ApprovalGateway::resolve`] did.
#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    /// The request as resolved.
    pub request: ApprovalRequest,
    /// Context after the resulting transition.
    pub context: WorkflowContext,
    /// Fresh request issued by a `Modify` decision.
    pub follow_up: Option<ApprovalRequest>,
}

/// Issues and resolves approval requests, backed by the state machine.
///
/// Request bookkeeping is guarded by one short lock that is released before
/// any transition is applied or a notification is sent.
pub struct ApprovalGateway {
    requests: Mutex<HashMap<String, Vec<ApprovalRequest>>>,
    state: Arc<StateMachine>,
    planner: Arc<SequencePlanner>,
    resilience: Arc<ResilienceManager>,
    notifier: Arc<dyn NotificationChannel>,
    telemetry: Arc<TelemetryLog>,
    clock: Arc<dyn Clock>,
    window: chrono::Duration,
}

impl ApprovalGateway {
    /// Gateway whose requests expire `window` after they are issued.
    pub fn new(
        state: Arc<StateMachine>,
        planner: Arc<SequencePlanner>,
        resilience: Arc<ResilienceManager>,
        notifier: Arc<dyn NotificationChannel>,
        telemetry: Arc<TelemetryLog>,
        clock: Arc<dyn Clock>,
        window: chrono::Duration,
    ) -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
            state,
            planner,
            resilience,
            notifier,
            telemetry,
            clock,
            window,
        }
    }

    /// Issue a request for `plan_id`. Refused while another one is pending.
    pub fn create(
        &self,
        plan_id: &str,
        kind: ApprovalKind,
        proposal: SequenceProposal,
        validation: Option<ValidationReport>,
    ) -> WimiResult<ApprovalRequest> {
        let request = {
            let mut requests = self.requests.lock();
            let history = requests.entry(plan_id.to_string()).or_default();
            if history.iter().any(ApprovalRequest::is_pending) {
                return Err(WimiError::InvalidState(format!(
                    "plan {plan_id} already has a pending approval request"
                )));
            }
            let request = self.new_request(plan_id, kind, proposal, validation);
            history.push(request.clone());
            request
        };
        self.announce(&request);
        Ok(request)
    }

    /// Apply a reviewer decision.
    ///
    /// Fails with `InvalidState` and changes nothing when no request of
    /// `kind` is pending. A decision arriving at or after the deadline
    /// expires the request and fails the plan instead.
    pub fn resolve(
        &self,
        plan_id: &str,
        kind: ApprovalKind,
        decision: ApprovalDecision,
        feedback: Option<String>,
    ) -> WimiResult<ApprovalOutcome> {
        let now = self.clock.now();

        let claimed = {
            let mut requests = self.requests.lock();
            let pending = requests
                .get_mut(plan_id)
                .and_then(|h| h.iter_mut().find(|r| r.is_pending() && r.kind == kind));
            let Some(request) = pending else {
                return Err(self.nothing_pending(plan_id, kind));
            };

            if request.is_overdue(now) {
                request.status = ApprovalStatus::Expired;
                request.resolved_at = Some(now);
                Claim::Expired(request.clone())
            } else {
                match &decision {
                    ApprovalDecision::Approve if kind == ApprovalKind::Plan => {
                        let report = self.planner.validate(&request.proposal.agents);
                        if !report.valid {
                            return Err(WimiError::Validation(format!(
                                "sequence cannot be approved: {}",
                                report.recommendations.join("; ")
                            )));
                        }
                        Claim::Resolved(settle(request, ApprovalStatus::Approved, feedback.clone(), now))
                    }
                    ApprovalDecision::Approve => {
                        Claim::Resolved(settle(request, ApprovalStatus::Approved, feedback.clone(), now))
                    }
                    ApprovalDecision::Reject => {
                        Claim::Resolved(settle(request, ApprovalStatus::Rejected, feedback.clone(), now))
                    }
                    ApprovalDecision::Modify(_) if kind == ApprovalKind::Final => {
                        return Err(WimiError::UserInput(
                            "the final result can only be approved or rejected".into(),
                        ));
                    }
                    ApprovalDecision::Modify(agents) => {
                        let sequence = self.resolve_sequence(agents)?;
                        let report = self.planner.validate(&sequence);
                        let resolved =
                            settle(request, ApprovalStatus::Modified, feedback.clone(), now);
                        let follow_up = self.new_request(
                            plan_id,
                            kind,
                            self.planner.proposal(&sequence),
                            Some(report),
                        );
                        if let Some(history) = requests.get_mut(plan_id) {
                            history.push(follow_up.clone());
                        }
                        Claim::Modified(resolved, follow_up)
                    }
                }
            }
        };

        match claimed {
            Claim::Expired(request) => {
                self.expire_plan(&request);
                Err(WimiError::Timeout(format!(
                    "{kind:?} approval for plan {plan_id} expired at {}",
                    request.timeout_at
                )))
            }
            Claim::Resolved(request) => {
                let context = match self.apply(&request, &decision, feedback.as_deref()) {
                    Ok(ctx) => ctx,
                    Err(err) => {
                        self.mark(&request.id, plan_id, ApprovalStatus::Cancelled);
                        return Err(err);
                    }
                };
                self.log_resolution(&request, &decision);
                Ok(ApprovalOutcome {
                    request,
                    context,
                    follow_up: None,
                })
            }
            Claim::Modified(request, follow_up) => {
                let sequence = follow_up.proposal.agents.clone();
                let note = feedback.clone();
                let result = self.state.update(
                    plan_id,
                    WorkflowStatus::AwaitingPlanApproval,
                    "plan_modified",
                    &format!("sequence modified to [{}]", sequence.join(", ")),
                    move |ctx| {
                        ctx.agent_sequence = sequence;
                        if let Some(note) = note {
                            ctx.feedback.push(note);
                        }
                        Ok(())
                    },
                );
                let context = match result {
                    Ok(ctx) => ctx,
                    Err(err) => {
                        self.mark(&follow_up.id, plan_id, ApprovalStatus::Cancelled);
                        return Err(err);
                    }
                };
                self.log_resolution(&request, &decision);
                self.announce(&follow_up);
                Ok(ApprovalOutcome {
                    request,
                    context,
                    follow_up: Some(follow_up),
                })
            }
        }
    }

    /// Expire every pending request whose deadline has passed. Their plans
    /// are driven to FAILED with category TIMEOUT.
    pub fn expire_due(&self) -> Vec<ApprovalRequest> {
        let now = self.clock.now();
        let expired: Vec<ApprovalRequest> = {
            let mut requests = self.requests.lock();
            requests
                .values_mut()
                .flat_map(|h| h.iter_mut())
                .filter(|r| r.is_pending() && r.is_overdue(now))
                .map(|r| {
                    r.status = ApprovalStatus::Expired;
                    r.resolved_at = Some(now);
                    r.clone()
                })
                .collect()
        };
        for request in &expired {
            self.expire_plan(request);
        }
        expired
    }

    /// Expire the pending request of one plan if its deadline has passed.
    pub fn expire_if_due(&self, plan_id: &str) -> Option<ApprovalRequest> {
        let now = self.clock.now();
        let expired = {
            let mut requests = self.requests.lock();
            let request = requests
                .get_mut(plan_id)?
                .iter_mut()
                .find(|r| r.is_pending() && r.is_overdue(now))?;
            request.status = ApprovalStatus::Expired;
            request.resolved_at = Some(now);
            request.clone()
        };
        self.expire_plan(&expired);
        Some(expired)
    }

    /// Mark any pending request of `plan_id` as cancelled.
    pub fn withdraw(&self, plan_id: &str) -> Option<ApprovalRequest> {
        let mut requests = self.requests.lock();
        let request = requests
            .get_mut(plan_id)?
            .iter_mut()
            .find(|r| r.is_pending())?;
        request.status = ApprovalStatus::Cancelled;
        request.resolved_at = Some(self.clock.now());
        Some(request.clone())
    }

    /// The pending request of a plan.
    pub fn pending(&self, plan_id: &str) -> Option<ApprovalRequest> {
        self.requests
            .lock()
            .get(plan_id)
            .and_then(|h| h.iter().find(|r| r.is_pending()).cloned())
    }

    /// Every request ever issued for a plan, oldest first.
    pub fn history(&self, plan_id: &str) -> Vec<ApprovalRequest> {
        self.requests.lock().get(plan_id).cloned().unwrap_or_default()
    }

    /// Pending requests across all plans.
    pub fn pending_count(&self) -> usize {
        self.requests
            .lock()
            .values()
            .flat_map(|h| h.iter())
            .filter(|r| r.is_pending())
            .count()
    }

    /// Drop every request of `plan_id`, pending or not.
    pub fn forget(&self, plan_id: &str) {
        self.requests.lock().remove(plan_id);
    }

    /// Number of plans with at least one request on record.
    pub fn tracked_plans(&self) -> usize {
        self.requests.lock().len()
    }

    fn new_request(
        &self,
        plan_id: &str,
        kind: ApprovalKind,
        proposal: SequenceProposal,
        validation: Option<ValidationReport>,
    ) -> ApprovalRequest {
        let issued_at = self.clock.now();
        ApprovalRequest {
            id: format!("apr_{}", Uuid::new_v4().simple()),
            plan_id: plan_id.to_string(),
            kind,
            proposal,
            validation,
            issued_at,
            timeout_at: deadline_after(issued_at, self.window),
            status: ApprovalStatus::Pending,
            feedback: None,
            resolved_at: None,
        }
    }

    fn resolve_sequence(&self, agents: &[String]) -> WimiResult<Vec<String>> {
        if agents.is_empty() {
            return Err(WimiError::Validation("modified sequence is empty".into()));
        }
        let registry = self.planner.registry();
        let mut unknown = Vec::new();
        let mut sequence = Vec::with_capacity(agents.len());
        for name in agents {
            match registry.resolve_alias(name) {
                Ok(id) => sequence.push(id),
                Err(_) => unknown.push(name.clone()),
            }
        }
        if unknown.is_empty() {
            Ok(sequence)
        } else {
            Err(WimiError::Validation(format!(
                "unknown agents in modified sequence: {}",
                unknown.join(", ")
            )))
        }
    }

    fn apply(
        &self,
        request: &ApprovalRequest,
        decision: &ApprovalDecision,
        feedback: Option<&str>,
    ) -> WimiResult<WorkflowContext> {
        let from = request.kind.awaiting();
        let approve = matches!(decision, ApprovalDecision::Approve);
        let to = match (request.kind, approve) {
            (ApprovalKind::Plan, true) => WorkflowStatus::PlanApproved,
            (ApprovalKind::Plan, false) => WorkflowStatus::PlanRejected,
            (ApprovalKind::Final, true) => WorkflowStatus::Completed,
            (ApprovalKind::Final, false) => WorkflowStatus::Restarted,
        };
        let sequence = request.proposal.agents.clone();
        let kind = request.kind;
        let note = feedback.map(str::to_string);
        let message = format!("{:?} approval: {}", kind, decision.label());
        self.state.transition_with(&request.plan_id, from, to, &message, move |ctx| {
            match (kind, approve) {
                (ApprovalKind::Plan, true) => {
                    ctx.agent_sequence = sequence;
                    ctx.plan_approved = true;
                }
                (ApprovalKind::Final, true) => ctx.final_approved = true,
                _ => {}
            }
            if let Some(note) = note {
                ctx.feedback.push(note);
            }
            Ok(())
        })
    }

    fn expire_plan(&self, request: &ApprovalRequest) {
        warn!(
            plan_id = %request.plan_id,
            request_id = %request.id,
            "Approval window elapsed"
        );
        self.telemetry.log(
            LogEvent::new(EventType::ApprovalExpired, format!("{:?} approval expired", request.kind))
                .plan(&request.plan_id)
                .severity(Severity::High)
                .success(false)
                .meta("request_id", request.id.clone()),
        );
        let mut context = BTreeMap::new();
        context.insert("request_id".to_string(), serde_json::json!(request.id));
        context.insert("timeout_at".to_string(), serde_json::json!(request.timeout_at));
        let reason = format!("{:?} approval not given before {}", request.kind, request.timeout_at);
        let event = self.resilience.handle(
            Some(&request.plan_id),
            ErrorCategory::Timeout,
            reason.clone(),
            None,
            context,
        );
        let info = failure(ErrorCategory::Timeout, reason, Some(event.id), self.clock.now());
        if let Err(e) = self.state.fail(&request.plan_id, info) {
            warn!(plan_id = %request.plan_id, error = %e, "Expired plan was already terminal");
        }
    }

    fn nothing_pending(&self, plan_id: &str, kind: ApprovalKind) -> WimiError {
        match self.state.snapshot(plan_id) {
            Ok(ctx) => WimiError::InvalidState(format!(
                "no pending {kind:?} approval for plan {plan_id} (status {})",
                ctx.status
            )),
            Err(err) => err,
        }
    }

    fn mark(&self, request_id: &str, plan_id: &str, status: ApprovalStatus) {
        if let Some(history) = self.requests.lock().get_mut(plan_id) {
            if let Some(request) = history.iter_mut().find(|r| r.id == request_id) {
                request.status = status;
            }
        }
    }

    fn log_resolution(&self, request: &ApprovalRequest, decision: &ApprovalDecision) {
        info!(
            plan_id = %request.plan_id,
            request_id = %request.id,
            decision = decision.label(),
            "Approval resolved"
        );
        self.telemetry.log(
            LogEvent::new(
                EventType::ApprovalResolved,
                format!("{:?} approval: {}", request.kind, decision.label()),
            )
            .plan(&request.plan_id)
            .success(!matches!(decision, ApprovalDecision::Reject))
            .duration(
                (request.resolved_at.unwrap_or(request.issued_at) - request.issued_at)
                    .num_milliseconds() as f64
                    / 1000.0,
            )
            .meta("request_id", request.id.clone())
            .meta("decision", decision.label()),
        );
    }

    fn announce(&self, request: &ApprovalRequest) {
        self.telemetry.log(
            LogEvent::new(
                EventType::ApprovalRequested,
                format!("{:?} approval requested", request.kind),
            )
            .plan(&request.plan_id)
            .meta("request_id", request.id.clone())
            .meta("timeout_at", request.timeout_at.to_rfc3339())
            .meta("agents", request.proposal.agents.clone()),
        );

        let kind = match request.kind {
            ApprovalKind::Plan => NotificationKind::PlanApprovalRequested,
            ApprovalKind::Final => NotificationKind::FinalApprovalRequested,
        };
        let notification = Notification::new(
            request.plan_id.clone(),
            kind,
            format!(
                "Approval needed for [{}] before {}",
                request.proposal.agents.join(" -> "),
                request.timeout_at.to_rfc3339()
            ),
        )
        .with_payload(serde_json::to_value(request).unwrap_or_default());

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(plan_id = %request.plan_id, "No runtime for notification delivery");
            return;
        };
        let notifier = Arc::clone(&self.notifier);
        handle.spawn(async move {
            if let Err(e) = notifier.send(notification).await {
                warn!(error = %e, "Approval notification failed");
            }
        });
    }
}

enum Claim {
    Expired(ApprovalRequest),
    Resolved(ApprovalRequest),
    Modified(ApprovalRequest, ApprovalRequest),
}

fn settle(
    request: &mut ApprovalRequest,
    status: ApprovalStatus,
    feedback: Option<String>,
    now: DateTime<Utc>,
) -> ApprovalRequest {
    request.status = status;
    request.feedback = feedback;
    request.resolved_at = Some(now);
    request.clone()
}
