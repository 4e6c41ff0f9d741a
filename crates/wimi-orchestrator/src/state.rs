use crate::types::{FailureInfo, WorkflowContext, WorkflowStatus};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use wimi_core::{Clock, ErrorCategory, Severity, WimiError, WimiResult};
use wimi_telemetry::{EventType, LogEvent, TelemetryLog};

/// Published on every status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    /// Plan that changed.
    pub plan_id: String,
    /// Status before.
    pub from: WorkflowStatus,
    /// Status after.
    pub to: WorkflowStatus,
    /// Step index at the change.
    pub current_step: usize,
    /// Steps in the sequence.
    pub total_steps: usize,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Result of [`StateMachine::cancel`].
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// This call moved the plan to FAILED.
    Cancelled(WorkflowContext),
    /// The plan had already been cancelled; nothing changed.
    AlreadyCancelled(WorkflowContext),
}

impl CancelOutcome {
    /// The plan's context, whichever way the cancel went.
    pub fn into_context(self) -> WorkflowContext {
        match self {
            CancelOutcome::Cancelled(ctx) | CancelOutcome::AlreadyCancelled(ctx) => ctx,
        }
    }
}

enum Slot {
    Active(Arc<Mutex<WorkflowContext>>),
    Archived(WorkflowContext),
}

/// Owner of every workflow context.
///
/// Each plan has its own lock, so work on different plans never contends.
/// Every write is a compare-and-swap on the status: callers name the status
/// they expect and lose with [`WimiError::StateConflict`] if someone else
/// moved the plan first. No lock is held across an await.
pub struct StateMachine {
    active: RwLock<HashMap<String, Arc<Mutex<WorkflowContext>>>>,
    archived: RwLock<HashMap<String, WorkflowContext>>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<TelemetryLog>,
    changes: broadcast::Sender<StatusChange>,
}

impl StateMachine {
    /// Empty state machine.
    pub fn new(clock: Arc<dyn Clock>, telemetry: Arc<TelemetryLog>) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            active: RwLock::new(HashMap::new()),
            archived: RwLock::new(HashMap::new()),
            clock,
            telemetry,
            changes,
        }
    }

    /// Register a new context. Fails if the plan id is taken.
    pub fn create(&self, ctx: WorkflowContext) -> WimiResult<WorkflowContext> {
        let plan_id = ctx.plan_id.clone();
        if self.archived.read().contains_key(&plan_id) {
            return Err(WimiError::InvalidState(format!("plan {plan_id} already exists")));
        }
        let mut active = self.active.write();
        if active.contains_key(&plan_id) {
            return Err(WimiError::InvalidState(format!("plan {plan_id} already exists")));
        }
        active.insert(plan_id, Arc::new(Mutex::new(ctx.clone())));
        Ok(ctx)
    }

    /// Copy of the current context.
    pub fn snapshot(&self, plan_id: &str) -> WimiResult<WorkflowContext> {
        match self.slot(plan_id)? {
            Slot::Active(cell) => Ok(cell.lock().clone()),
            Slot::Archived(ctx) => Ok(ctx),
        }
    }

    /// Move `plan_id` from `from` to `to`.
    pub fn transition(
        &self,
        plan_id: &str,
        from: WorkflowStatus,
        to: WorkflowStatus,
        message: &str,
    ) -> WimiResult<WorkflowContext> {
        self.transition_with(plan_id, from, to, message, |_| Ok(()))
    }

    /// Move `plan_id` from `from` to `to`, applying `apply` in the same
    /// critical section. If `apply` fails nothing is changed, so it must
    /// check before it mutates.
    pub fn transition_with<F>(
        &self,
        plan_id: &str,
        from: WorkflowStatus,
        to: WorkflowStatus,
        message: &str,
        apply: F,
    ) -> WimiResult<WorkflowContext>
    where
        F: FnOnce(&mut WorkflowContext) -> WimiResult<()>,
    {
        if !from.can_transition_to(to) {
            return Err(WimiError::InvalidState(format!(
                "illegal transition {from} -> {to}"
            )));
        }
        let cell = self.active_cell(plan_id, from)?;
        let now = self.clock.now();
        let snapshot = {
            let mut ctx = cell.lock();
            check_status(&ctx, from)?;
            apply(&mut ctx)?;
            ctx.status = to;
            ctx.record(to.as_str(), Some(from), Some(to), message, now);
            ctx.clone()
        };
        self.after_transition(&snapshot, from, message);
        Ok(snapshot)
    }

    /// Mutate a context without changing its status. The CAS on `expected`
    /// still applies.
    pub fn update<F>(
        &self,
        plan_id: &str,
        expected: WorkflowStatus,
        event: &str,
        message: &str,
        apply: F,
    ) -> WimiResult<WorkflowContext>
    where
        F: FnOnce(&mut WorkflowContext) -> WimiResult<()>,
    {
        let cell = self.active_cell(plan_id, expected)?;
        let now = self.clock.now();
        let mut ctx = cell.lock();
        check_status(&ctx, expected)?;
        apply(&mut ctx)?;
        ctx.record(event, None, None, message, now);
        Ok(ctx.clone())
    }

    /// Move any non-terminal plan to FAILED.
    pub fn fail(&self, plan_id: &str, failure: FailureInfo) -> WimiResult<WorkflowContext> {
        let cell = match self.slot(plan_id)? {
            Slot::Active(cell) => cell,
            Slot::Archived(ctx) => return Err(already_ended(plan_id, &ctx)),
        };
        let (snapshot, from) = {
            let mut ctx = cell.lock();
            if ctx.status.is_terminal() {
                return Err(already_ended(plan_id, &ctx));
            }
            let from = self.mark_failed(&mut ctx, failure);
            (ctx.clone(), from)
        };
        self.after_transition(&snapshot, from, "failed");
        Ok(snapshot)
    }

    /// Cancel a plan. Cancelling an already-cancelled plan is a no-op;
    /// cancelling one that ended any other way is an error.
    ///
    /// `make_failure` runs at most once, under the plan lock, and only for
    /// the caller that actually moves the plan to FAILED.
    pub fn cancel<F>(&self, plan_id: &str, make_failure: F) -> WimiResult<CancelOutcome>
    where
        F: FnOnce() -> FailureInfo,
    {
        let cell = match self.slot(plan_id)? {
            Slot::Archived(ctx) if ctx.is_cancelled() => {
                return Ok(CancelOutcome::AlreadyCancelled(ctx))
            }
            Slot::Archived(ctx) => return Err(already_ended(plan_id, &ctx)),
            Slot::Active(cell) => cell,
        };
        let (snapshot, from) = {
            let mut ctx = cell.lock();
            if ctx.is_cancelled() {
                return Ok(CancelOutcome::AlreadyCancelled(ctx.clone()));
            }
            if ctx.status.is_terminal() {
                return Err(already_ended(plan_id, &ctx));
            }
            let from = self.mark_failed(&mut ctx, make_failure());
            (ctx.clone(), from)
        };
        self.after_transition(&snapshot, from, "failed");
        Ok(CancelOutcome::Cancelled(snapshot))
    }

    /// Drop an archived plan from memory. Active plans are left alone.
    pub fn forget(&self, plan_id: &str) -> bool {
        self.archived.write().remove(plan_id).is_some()
    }

    fn mark_failed(&self, ctx: &mut WorkflowContext, failure: FailureInfo) -> WorkflowStatus {
        let from = ctx.status;
        let message = format!("{}: {}", failure.category, failure.reason);
        ctx.status = WorkflowStatus::Failed;
        ctx.failure = Some(failure);
        ctx.record("failed", Some(from), Some(WorkflowStatus::Failed), message, self.clock.now());
        from
    }

    /// Ids of plans that have not reached a terminal status.
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of plans still in flight.
    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    /// Number of terminal plans still held in memory.
    pub fn archived_count(&self) -> usize {
        self.archived.read().len()
    }

    /// Receive every later status change.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.changes.subscribe()
    }

    fn slot(&self, plan_id: &str) -> WimiResult<Slot> {
        if let Some(cell) = self.active.read().get(plan_id) {
            return Ok(Slot::Active(Arc::clone(cell)));
        }
        if let Some(ctx) = self.archived.read().get(plan_id) {
            return Ok(Slot::Archived(ctx.clone()));
        }
        Err(WimiError::NotFound(format!("plan {plan_id}")))
    }

    fn active_cell(&self, plan_id: &str, expected: WorkflowStatus) -> WimiResult<Arc<Mutex<WorkflowContext>>> {
        match self.slot(plan_id)? {
            Slot::Active(cell) => Ok(cell),
            Slot::Archived(ctx) => Err(conflict(plan_id, expected, ctx.status)),
        }
    }

    fn after_transition(&self, ctx: &WorkflowContext, from: WorkflowStatus, message: &str) {
        let to = ctx.status;
        if to.is_terminal() {
            self.archived.write().insert(ctx.plan_id.clone(), ctx.clone());
            self.active.write().remove(&ctx.plan_id);
        }

        debug!(plan_id = %ctx.plan_id, from = %from, to = %to, "Workflow transition");
        self.telemetry.log(
            LogEvent::new(EventType::StateTransition, format!("{from} -> {to}"))
                .plan(&ctx.plan_id)
                .meta("from", from.as_str())
                .meta("to", to.as_str())
                .meta("note", message),
        );
        if to.is_terminal() {
            self.log_terminal(ctx);
        }

        let _ = self.changes.send(StatusChange {
            plan_id: ctx.plan_id.clone(),
            from,
            to,
            current_step: ctx.current_step,
            total_steps: ctx.total_steps(),
            at: ctx.updated_at,
        });
    }

    fn log_terminal(&self, ctx: &WorkflowContext) {
        let (event_type, success, severity) = match ctx.status {
            WorkflowStatus::Completed => (EventType::WorkflowCompleted, true, Severity::Low),
            WorkflowStatus::Restarted => (EventType::WorkflowRestarted, false, Severity::Low),
            WorkflowStatus::PlanRejected => (EventType::WorkflowRestarted, false, Severity::Low),
            _ if ctx.is_cancelled() => (EventType::WorkflowCancelled, false, Severity::Low),
            _ => (
                EventType::WorkflowFailed,
                false,
                ctx.failure
                    .as_ref()
                    .map_or(Severity::High, |f| f.category.severity()),
            ),
        };
        let mut event = LogEvent::new(event_type, format!("workflow {}", ctx.status))
            .plan(&ctx.plan_id)
            .severity(severity)
            .success(success)
            .duration(ctx.elapsed_seconds())
            .meta("steps_completed", ctx.current_step)
            .meta("total_steps", ctx.total_steps());
        if let Some(failure) = &ctx.failure {
            event = event
                .meta("category", failure.category.to_string())
                .meta("reason", failure.reason.clone());
            if let Some(id) = &failure.error_event_id {
                event = event.meta("error_event_id", id.clone());
            }
        }
        self.telemetry.log(event);
        info!(plan_id = %ctx.plan_id, status = %ctx.status, "Workflow finished");
    }
}

fn check_status(ctx: &WorkflowContext, expected: WorkflowStatus) -> WimiResult<()> {
    if ctx.status == expected {
        Ok(())
    } else {
        Err(conflict(&ctx.plan_id, expected, ctx.status))
    }
}

fn conflict(plan_id: &str, expected: WorkflowStatus, actual: WorkflowStatus) -> WimiError {
    WimiError::StateConflict {
        plan_id: plan_id.to_string(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

fn already_ended(plan_id: &str, ctx: &WorkflowContext) -> WimiError {
    WimiError::InvalidState(format!("plan {plan_id} already {}", ctx.status))
}

/// Failure record helper shared by the gateway and the engine.
pub(crate) fn failure(
    category: ErrorCategory,
    reason: impl Into<String>,
    error_event_id: Option<String>,
    at: DateTime<Utc>,
) -> FailureInfo {
    FailureInfo {
        reason: reason.into(),
        category,
        error_event_id,
        failed_at: at,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wimi_core::ManualClock;
    use wimi_telemetry::TelemetryConfig;
    use WorkflowStatus::*;

    fn machine() -> (StateMachine, Arc<TelemetryLog>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
        let telemetry = Arc::new(TelemetryLog::with_clock(TelemetryConfig::default(), clock.clone()));
        (StateMachine::new(clock, telemetry.clone()), telemetry)
    }

    fn seeded(sm: &StateMachine, plan_id: &str) {
        sm.create(WorkflowContext::new(plan_id, "s", "task", "corr", Utc::now()))
            .unwrap();
    }

    fn cancel_info() -> FailureInfo {
        failure(ErrorCategory::UserCancelled, "user cancelled", None, Utc::now())
    }

    #[test]
    fn test_happy_transitions() {
        let (sm, telemetry) = machine();
        seeded(&sm, "p1");
        sm.transition("p1", Created, Planning, "").unwrap();
        let ctx = sm.transition("p1", Planning, AwaitingPlanApproval, "").unwrap();
        assert_eq!(ctx.status, AwaitingPlanApproval);
        assert_eq!(ctx.history.len(), 3);
        assert_eq!(telemetry.len(), 2);
        assert_eq!(sm.active_count(), 1);
    }

    #[test]
    fn test_illegal_edge_is_invalid_state() {
        let (sm, _) = machine();
        seeded(&sm, "p1");
        let err = sm.transition("p1", Created, Executing, "").unwrap_err();
        assert!(matches!(err, WimiError::InvalidState(_)));
    }

    #[test]
    fn test_stale_expected_status_is_conflict() {
        let (sm, _) = machine();
        seeded(&sm, "p1");
        sm.transition("p1", Created, Planning, "").unwrap();
        let err = sm.transition("p1", Created, Planning, "").unwrap_err();
        assert!(matches!(err, WimiError::StateConflict { .. }));
        assert_eq!(sm.snapshot("p1").unwrap().history.len(), 2);
    }

    #[test]
    fn test_failed_apply_leaves_context_untouched() {
        let (sm, _) = machine();
        seeded(&sm, "p1");
        let before = sm.snapshot("p1").unwrap();
        let err = sm
            .transition_with("p1", Created, Planning, "", |_| {
                Err(WimiError::Validation("nope".into()))
            })
            .unwrap_err();
        assert!(matches!(err, WimiError::Validation(_)));
        assert_eq!(sm.snapshot("p1").unwrap(), before);
    }

    #[test]
    fn test_terminal_plans_are_archived() {
        let (sm, _) = machine();
        seeded(&sm, "p1");
        sm.transition("p1", Created, Planning, "").unwrap();
        sm.transition("p1", Planning, AwaitingPlanApproval, "").unwrap();
        sm.transition("p1", AwaitingPlanApproval, PlanRejected, "no").unwrap();
        assert_eq!(sm.active_count(), 0);
        assert_eq!(sm.archived_count(), 1);
        assert_eq!(sm.snapshot("p1").unwrap().status, PlanRejected);

        let err = sm.transition("p1", AwaitingPlanApproval, PlanApproved, "").unwrap_err();
        assert!(matches!(err, WimiError::StateConflict { .. }));
        assert!(matches!(
            sm.fail("p1", cancel_info()),
            Err(WimiError::InvalidState(_))
        ));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (sm, _) = machine();
        seeded(&sm, "p1");
        let first = sm.cancel("p1", cancel_info).unwrap();
        assert!(matches!(first, CancelOutcome::Cancelled(_)));
        let events = sm.snapshot("p1").unwrap().history.len();

        let second = sm.cancel("p1", cancel_info).unwrap();
        assert!(matches!(second, CancelOutcome::AlreadyCancelled(_)));
        assert_eq!(sm.snapshot("p1").unwrap().history.len(), events);
    }

    #[test]
    fn test_cancel_after_other_terminal_is_rejected() {
        let (sm, _) = machine();
        seeded(&sm, "p1");
        sm.fail("p1", failure(ErrorCategory::System, "boom", None, Utc::now()))
            .unwrap();
        assert!(matches!(
            sm.cancel("p1", cancel_info),
            Err(WimiError::InvalidState(_))
        ));
    }

    #[test]
    fn test_unknown_plan() {
        let (sm, _) = machine();
        assert!(matches!(sm.snapshot("nope"), Err(WimiError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_status_changes_are_broadcast() {
        let (sm, _) = machine();
        let mut rx = sm.subscribe();
        seeded(&sm, "p1");
        sm.transition("p1", Created, Planning, "").unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.from, Created);
        assert_eq!(change.to, Planning);
    }

    #[test]
    fn test_concurrent_transitions_have_one_winner() {
        let (sm, _) = machine();
        let sm = Arc::new(sm);
        seeded(&sm, "p1");
        sm.transition("p1", Created, Planning, "").unwrap();
        sm.transition("p1", Planning, AwaitingPlanApproval, "").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let sm = Arc::clone(&sm);
                std::thread::spawn(move || {
                    let to = if i % 2 == 0 { PlanApproved } else { PlanRejected };
                    sm.transition("p1", AwaitingPlanApproval, to, "").is_ok()
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert!(matches!(
            sm.snapshot("p1").unwrap().status,
            PlanApproved | PlanRejected
        ));
    }

    #[test]
    fn test_concurrent_cancels_build_one_failure() {
        let (sm, _) = machine();
        let sm = Arc::new(sm);
        seeded(&sm, "p1");
        let built = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sm = Arc::clone(&sm);
                let built = Arc::clone(&built);
                std::thread::spawn(move || {
                    sm.cancel("p1", || {
                        built.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        cancel_info()
                    })
                    .unwrap()
                })
            })
            .collect();
        let cancelled = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|outcome| matches!(outcome, CancelOutcome::Cancelled(_)))
            .count();
        assert_eq!(cancelled, 1);
        assert_eq!(built.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forget_only_drops_archived_plans() {
        let (sm, _) = machine();
        seeded(&sm, "live");
        seeded(&sm, "done");
        sm.cancel("done", cancel_info).unwrap();

        assert!(!sm.forget("live"));
        assert!(sm.forget("done"));
        assert_eq!(sm.archived_count(), 0);
        assert_eq!(sm.active_count(), 1);
        assert!(matches!(sm.snapshot("done"), Err(WimiError::NotFound(_))));
    }
}
