use crate::approval::{ApprovalDecision, ApprovalGateway, ApprovalKind, ApprovalOutcome, ApprovalRequest};
use crate::config::OrchestratorConfig;
use crate::notify::TracingNotifier;
use crate::planner::SequencePlanner;
use crate::registry::{AgentDescriptor, AgentRegistry};
use crate::resilience::{
    ErrorEvent, FallbackSwitches, ResilienceManager, StabilityStatus, StaticFallbackSwitches,
    StepFailure,
};
use crate::state::{failure, CancelOutcome, StateMachine, StatusChange};
use crate::types::{SequenceProposal, StepOutcome, StepRecord, WorkflowContext, WorkflowStatus};
use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wimi_core::{
    AgentExecution, AgentExecutor, Clock, DataToken, ErrorCategory, ExecutionInput,
    ExecutionStatus, NotificationChannel, Severity, SystemClock, TaskAnalyzer, WimiError,
    WimiResult,
};
use wimi_store::{FilePlanStore, InMemoryPlanStore, PlanStore, RecordKind};
use wimi_telemetry::{EventType, ExportFormat, LogEvent, LogQuery, TelemetryLog, TelemetrySnapshot};

/// Health and throughput at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Event log aggregates.
    pub telemetry: TelemetrySnapshot,
    /// Aggregate health.
    pub stability: StabilityStatus,
    /// Errors in the current rolling window.
    pub errors_in_window: u32,
    /// Plans not yet terminal.
    pub active_plans: usize,
    /// Terminal plans still held in memory.
    pub retained_plans: usize,
    /// Requests waiting on a reviewer.
    pub pending_approvals: usize,
    /// Most recent errors, newest first.
    pub recent_errors: Vec<ErrorEvent>,
}

/// Wires the collaborators of an [`Orchestrator`]. Anything not supplied
/// falls back to an in-process default.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    registry: Option<Arc<AgentRegistry>>,
    analyzer: Option<Arc<dyn TaskAnalyzer>>,
    executor: Option<Arc<dyn AgentExecutor>>,
    store: Option<Arc<dyn PlanStore>>,
    notifier: Option<Arc<dyn NotificationChannel>>,
    switches: Option<Arc<dyn FallbackSwitches>>,
    clock: Option<Arc<dyn Clock>>,
}

impl OrchestratorBuilder {
    /// Agent catalogue. Defaults to the vendor-inquiry catalog.
    pub fn registry(mut self, registry: AgentRegistry) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    /// Task analyzer. Required.
    pub fn analyzer(mut self, analyzer: Arc<dyn TaskAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Agent executor. Required.
    pub fn executor(mut self, executor: Arc<dyn AgentExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Plan store. Defaults to a file store under `data_dir`, else in memory.
    pub fn store(mut self, store: Arc<dyn PlanStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Notification channel. Defaults to tracing output.
    pub fn notifier(mut self, notifier: Arc<dyn NotificationChannel>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Mock-fallback switches. Defaults to the config map.
    pub fn fallback_switches(mut self, switches: Arc<dyn FallbackSwitches>) -> Self {
        self.switches = Some(switches);
        self
    }

    /// Time source. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Assemble the orchestrator. An analyzer and an executor are required.
    /// With a `data_dir` configured and no explicit store, plan snapshots go
    /// to `<data_dir>/plans` and the event log to `<data_dir>/telemetry`.
    pub async fn build(self) -> WimiResult<Orchestrator> {
        self.config.validate()?;
        let analyzer = self
            .analyzer
            .ok_or_else(|| WimiError::Config("a task analyzer is required".into()))?;
        let executor = self
            .executor
            .ok_or_else(|| WimiError::Config("an agent executor is required".into()))?;

        let config = self.config;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(AgentRegistry::default_catalog()));

        let mut telemetry = TelemetryLog::with_clock(config.telemetry.clone(), Arc::clone(&clock));
        let store: Arc<dyn PlanStore> = match (self.store, &config.data_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(FilePlanStore::new(dir.join("plans")).await?),
            (None, None) => Arc::new(InMemoryPlanStore::new()),
        };
        if let Some(dir) = &config.data_dir {
            telemetry = telemetry.with_file_sink(dir.join("telemetry"));
        }
        let telemetry = Arc::new(telemetry);

        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(TracingNotifier));
        let switches = self.switches.unwrap_or_else(|| {
            Arc::new(StaticFallbackSwitches::new(config.resilience.mock_fallback.clone()))
        });

        let planner = Arc::new(SequencePlanner::new(
            Arc::clone(&registry),
            config.planner.clone(),
        ));
        let state = Arc::new(StateMachine::new(Arc::clone(&clock), Arc::clone(&telemetry)));
        let resilience = Arc::new(
            ResilienceManager::new(
                config.resilience.clone(),
                switches,
                Arc::clone(&telemetry),
                Arc::clone(&clock),
            )
            .with_escalation(Arc::clone(&notifier)),
        );
        let gateway = Arc::new(ApprovalGateway::new(
            Arc::clone(&state),
            Arc::clone(&planner),
            Arc::clone(&resilience),
            notifier,
            Arc::clone(&telemetry),
            Arc::clone(&clock),
            config.approval_window(),
        ));

        info!(
            agents = registry.len(),
            approval_timeout_secs = config.approval_timeout_secs,
            "Orchestrator ready"
        );

        Ok(Orchestrator {
            config,
            registry,
            planner,
            state,
            gateway,
            resilience,
            telemetry,
            analyzer,
            executor,
            store,
            clock,
            retired: Mutex::new(VecDeque::new()),
        })
    }
}

/// The workflow engine.
///
/// Owns the registry, planner, state machine, approval gateway, resilience
/// manager and telemetry of one deployment. Every operation is short and
/// applied to a single plan; nothing blocks while waiting on a human or an
/// agent.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<AgentRegistry>,
    planner: Arc<SequencePlanner>,
    state: Arc<StateMachine>,
    gateway: Arc<ApprovalGateway>,
    resilience: Arc<ResilienceManager>,
    telemetry: Arc<TelemetryLog>,
    analyzer: Arc<dyn TaskAnalyzer>,
    executor: Arc<dyn AgentExecutor>,
    store: Arc<dyn PlanStore>,
    clock: Arc<dyn Clock>,
    /// Persisted terminal plans still held in memory, oldest first.
    retired: Mutex<VecDeque<String>>,
}

impl Orchestrator {
    /// Start wiring an orchestrator.
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            registry: None,
            analyzer: None,
            executor: None,
            store: None,
            notifier: None,
            switches: None,
            clock: None,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Agent catalogue.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Sequence planner.
    pub fn planner(&self) -> &Arc<SequencePlanner> {
        &self.planner
    }

    /// Event log.
    pub fn telemetry(&self) -> &Arc<TelemetryLog> {
        &self.telemetry
    }

    /// Error tracking and stability.
    pub fn resilience(&self) -> &Arc<ResilienceManager> {
        &self.resilience
    }

    /// Approval requests.
    pub fn approvals(&self) -> &Arc<ApprovalGateway> {
        &self.gateway
    }

    /// Accept a task, plan it and ask for plan approval. Returns the plan id.
    pub async fn submit_task(&self, task_description: &str, session_id: &str) -> WimiResult<String> {
        if task_description.trim().is_empty() {
            return Err(WimiError::UserInput("task description is empty".into()));
        }

        let correlation_id = self.telemetry.start_correlation("wimi");
        let plan_id = format!("plan_{}", Uuid::new_v4().simple());
        self.telemetry.bind_plan(&plan_id, &correlation_id);
        self.state.create(WorkflowContext::new(
            &plan_id,
            session_id,
            task_description,
            &correlation_id,
            self.clock.now(),
        ))?;
        self.telemetry.log(
            LogEvent::new(EventType::WorkflowStarted, "task submitted")
                .plan(&plan_id)
                .meta("session_id", session_id),
        );
        info!(plan_id = %plan_id, session_id, "Task submitted");

        self.state
            .transition(&plan_id, WorkflowStatus::Created, WorkflowStatus::Planning, "planning requested")?;

        let analysis = match self.analyzer.analyze(task_description).await {
            Ok(analysis) => analysis,
            Err(err) => {
                self.fail_plan(&plan_id, err.category(), format!("task analysis failed: {err}"), None)
                    .await?;
                return Err(err);
            }
        };

        let outcome = self
            .planner
            .plan(&analysis.required_agent_ids, &analysis.optional_agent_ids);
        for warning in &outcome.warnings {
            self.telemetry.log(
                LogEvent::new(EventType::PlanningWarning, warning.clone())
                    .plan(&plan_id)
                    .severity(Severity::Medium),
            );
        }
        if outcome.resolved_required.is_empty() {
            let reason = format!(
                "no known agent among [{}]",
                analysis.required_agent_ids.join(", ")
            );
            self.fail_plan(&plan_id, ErrorCategory::Validation, reason.clone(), None)
                .await?;
            return Err(WimiError::Validation(reason));
        }

        self.telemetry.log(
            LogEvent::new(EventType::PlanGenerated, outcome.sequence.join(" -> "))
                .plan(&plan_id)
                .success(outcome.validation.valid)
                .meta("agents", outcome.sequence.clone())
                .meta("complexity", analysis.complexity_score),
        );

        let proposal = self.planner.proposal(&outcome.sequence);
        let sequence = outcome.sequence.clone();
        let required = outcome.resolved_required.clone();
        let optional = analysis.optional_agent_ids.clone();
        let warnings = outcome.warnings.clone();
        self.state.transition_with(
            &plan_id,
            WorkflowStatus::Planning,
            WorkflowStatus::AwaitingPlanApproval,
            "sequence ready",
            move |ctx| {
                ctx.agent_sequence = sequence;
                ctx.required_agents = required;
                ctx.optional_agents = optional;
                ctx.planner_warnings = warnings;
                Ok(())
            },
        )?;
        self.gateway
            .create(&plan_id, ApprovalKind::Plan, proposal, Some(outcome.validation))?;
        self.persist(&plan_id).await;
        Ok(plan_id)
    }

    /// Current context of a plan. An approval deadline that has passed is
    /// applied first, so a timed-out plan reads as FAILED without waiting
    /// for the sweeper. Plans no longer in memory are read from the store.
    pub async fn get_status(&self, plan_id: &str) -> WimiResult<WorkflowContext> {
        if self.gateway.expire_if_due(plan_id).is_some() {
            self.persist(plan_id).await;
        }
        self.load(plan_id).await
    }

    /// Answer the plan approval request.
    pub async fn decide_plan_approval(
        &self,
        plan_id: &str,
        decision: ApprovalDecision,
        feedback: Option<String>,
    ) -> WimiResult<ApprovalOutcome> {
        self.decide(plan_id, ApprovalKind::Plan, decision, feedback).await
    }

    /// Answer the final result approval request.
    pub async fn decide_final_approval(
        &self,
        plan_id: &str,
        approve: bool,
        feedback: Option<String>,
    ) -> WimiResult<ApprovalOutcome> {
        let decision = if approve {
            ApprovalDecision::Approve
        } else {
            ApprovalDecision::Reject
        };
        self.decide(plan_id, ApprovalKind::Final, decision, feedback).await
    }

    /// Cancel a plan. Repeating the call on a cancelled plan is a no-op.
    pub async fn cancel(&self, plan_id: &str, reason: Option<String>) -> WimiResult<WorkflowContext> {
        let ctx = self.load(plan_id).await?;
        if ctx.is_cancelled() {
            return Ok(ctx);
        }
        if ctx.is_terminal() {
            return Err(WimiError::InvalidState(format!(
                "plan {plan_id} already {}",
                ctx.status
            )));
        }

        let reason = reason.unwrap_or_else(|| "cancelled by user".into());
        let outcome = self.state.cancel(plan_id, || {
            let event = self.resilience.handle(
                Some(plan_id),
                ErrorCategory::UserCancelled,
                reason.clone(),
                None,
                BTreeMap::new(),
            );
            failure(ErrorCategory::UserCancelled, reason, Some(event.id), self.clock.now())
        })?;
        let ctx = match outcome {
            CancelOutcome::Cancelled(ctx) => ctx,
            CancelOutcome::AlreadyCancelled(ctx) => return Ok(ctx),
        };
        self.gateway.withdraw(plan_id);
        self.persist(plan_id).await;
        info!(plan_id, "Plan cancelled");
        Ok(ctx)
    }

    /// Health and throughput right now.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            telemetry: self.telemetry.snapshot(),
            stability: self.resilience.stability(),
            errors_in_window: self.resilience.errors_in_window(),
            active_plans: self.state.active_count(),
            retained_plans: self.state.archived_count(),
            pending_approvals: self.gateway.pending_count(),
            recent_errors: self.resilience.recent_errors(10),
        }
    }

    /// Every later status change of every plan.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.state.subscribe()
    }

    /// Event log of one plan, oldest first.
    pub fn export_log(&self, plan_id: &str, format: ExportFormat) -> WimiResult<String> {
        self.telemetry
            .export_query(&LogQuery::Plan(plan_id.to_string()), format)
    }

    /// Expire every overdue approval request.
    pub async fn expire_due(&self) -> Vec<ApprovalRequest> {
        let expired = self.gateway.expire_due();
        for request in &expired {
            self.persist(&request.plan_id).await;
        }
        expired
    }

    /// Run [`expire_due`](Self::expire_due) every `interval` until the
    /// orchestrator is dropped or the handle aborted.
    pub fn spawn_expiry_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(orchestrator) = weak.upgrade() else {
                    debug!("Expiry sweeper stopping");
                    break;
                };
                let expired = orchestrator.expire_due().await;
                if !expired.is_empty() {
                    info!(count = expired.len(), "Expired approval requests");
                }
            }
        })
    }

    /// Drive an approved plan through its agents with the configured
    /// executor, one step at a time, and request final approval at the end.
    ///
    /// Returns early with the current context if the plan leaves EXECUTING
    /// while an agent is running (for example because it was cancelled).
    pub async fn execute(&self, plan_id: &str) -> WimiResult<WorkflowContext> {
        self.state.transition(
            plan_id,
            WorkflowStatus::PlanApproved,
            WorkflowStatus::Executing,
            "execution started",
        )?;
        self.persist(plan_id).await;
        let step_timeout = self.config.step_timeout();

        loop {
            let ctx = self.state.snapshot(plan_id)?;
            if ctx.status != WorkflowStatus::Executing {
                return Ok(ctx);
            }
            let Some(agent_id) = ctx.current_agent().map(str::to_string) else {
                return self.finish_execution(plan_id).await;
            };

            let input = ExecutionInput {
                plan_id: plan_id.to_string(),
                task_description: ctx.task_description.clone(),
                step: ctx.current_step,
                total_steps: ctx.total_steps(),
                prior_outputs: ctx.agent_outputs.clone(),
            };
            self.telemetry.log(
                LogEvent::new(
                    EventType::AgentStarted,
                    format!("step {}/{}", ctx.current_step + 1, ctx.total_steps()),
                )
                .plan(plan_id)
                .agent(&agent_id),
            );

            let started = Instant::now();
            let result = tokio::time::timeout(step_timeout, self.executor.execute(&agent_id, &input)).await;
            let elapsed = started.elapsed().as_secs_f64();

            let recorded = match result {
                Ok(Ok(execution)) => {
                    let execution = if execution.duration_seconds > 0.0 {
                        execution
                    } else {
                        execution.with_duration(elapsed)
                    };
                    self.record_step_result(plan_id, &agent_id, execution).await
                }
                Ok(Err(err)) => self.record_step_failure(plan_id, &agent_id, err).await,
                Err(_) => {
                    let err = WimiError::Timeout(format!(
                        "{agent_id} did not finish within {}s",
                        step_timeout.as_secs()
                    ));
                    self.record_step_failure(plan_id, &agent_id, err).await
                }
            };

            match recorded {
                Ok(_) => {}
                Err(WimiError::StateConflict { .. }) => return self.state.snapshot(plan_id),
                Err(err) => return Err(err),
            }
        }
    }

    /// Feed back the result of the current step. For drivers that run the
    /// agents themselves instead of calling [`execute`](Self::execute).
    pub async fn record_step_result(
        &self,
        plan_id: &str,
        agent_id: &str,
        execution: AgentExecution,
    ) -> WimiResult<WorkflowContext> {
        let outcome = match execution.status {
            ExecutionStatus::Success => StepOutcome::Succeeded,
            ExecutionStatus::PartialSuccess => StepOutcome::PartialSuccess,
            ExecutionStatus::Error => {
                let detail = execution
                    .data
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("agent reported an error")
                    .to_string();
                return self
                    .record_step_failure(plan_id, agent_id, WimiError::Agent(format!("{agent_id}: {detail}")))
                    .await;
            }
        };

        self.current_step_of(plan_id, agent_id)?;
        self.telemetry.log(
            LogEvent::new(EventType::AgentCompleted, format!("{agent_id} finished"))
                .plan(plan_id)
                .agent(agent_id)
                .success(true)
                .duration(execution.duration_seconds)
                .meta("outcome", format!("{outcome:?}")),
        );
        self.advance(plan_id, agent_id, outcome, execution, None).await
    }

    /// Report that the current step failed. Classification decides whether
    /// fixture data is used, the step is skipped, or the plan fails.
    pub async fn record_step_failure(
        &self,
        plan_id: &str,
        agent_id: &str,
        err: WimiError,
    ) -> WimiResult<WorkflowContext> {
        let ctx = self.current_step_of(plan_id, agent_id)?;
        let descriptor = self.registry.lookup(agent_id)?.clone();
        let category = err.category();
        let fixture = if category.is_external_service_failure() {
            self.executor.fixture(agent_id)
        } else {
            None
        };

        let mut context = BTreeMap::new();
        context.insert("step".to_string(), serde_json::json!(ctx.current_step));
        let decision = self.resilience.handle_step_failure(StepFailure {
            plan_id,
            agent_id,
            integration: descriptor.integration.as_deref(),
            category,
            message: err.to_string(),
            fixture_available: fixture.is_some(),
            context,
        });
        let event = decision.event;

        if let (true, Some(fixture)) = (decision.use_mock, fixture) {
            let message = format!("{agent_id} replaced by fixture: {err}");
            self.telemetry.log(
                LogEvent::new(EventType::AgentFailed, message)
                    .plan(plan_id)
                    .agent(agent_id)
                    .severity(event.severity)
                    .success(false)
                    .meta("outcome", format!("{:?}", StepOutcome::Mocked))
                    .meta("error_event_id", event.id.clone()),
            );
            return self
                .advance(plan_id, agent_id, StepOutcome::Mocked, fixture, Some(event))
                .await;
        }

        self.telemetry.log(
            LogEvent::new(EventType::AgentFailed, err.to_string())
                .plan(plan_id)
                .agent(agent_id)
                .severity(event.severity)
                .success(false)
                .meta("error_event_id", event.id.clone()),
        );

        if category == ErrorCategory::Timeout || event.severity == Severity::Critical {
            error!(plan_id, agent = agent_id, category = %category, "Step failure is fatal");
            let reason = format!("{agent_id} failed: {err}");
            return self.fail_plan(plan_id, category, reason, Some(event.id)).await;
        }

        if category.is_external_service_failure() && self.breaks_aggregation(&ctx, &descriptor) {
            warn!(plan_id, agent = agent_id, "Aggregation no longer has enough data providers");
            let reason = format!(
                "{agent_id} failed and the remaining data providers cannot satisfy {}",
                DataToken::AllData
            );
            return self.fail_plan(plan_id, category, reason, Some(event.id)).await;
        }

        warn!(plan_id, agent = agent_id, category = %category, "Continuing without step output");
        let failed = AgentExecution {
            status: ExecutionStatus::Error,
            output_tokens: Vec::new(),
            data: serde_json::json!({ "error": err.to_string() }),
            duration_seconds: 0.0,
        };
        self.advance(plan_id, agent_id, StepOutcome::Failed, failed, Some(event))
            .await
    }

    async fn decide(
        &self,
        plan_id: &str,
        kind: ApprovalKind,
        decision: ApprovalDecision,
        feedback: Option<String>,
    ) -> WimiResult<ApprovalOutcome> {
        let result = self.gateway.resolve(plan_id, kind, decision, feedback);
        match &result {
            Ok(outcome) => {
                debug!(plan_id, status = %outcome.context.status, "Approval applied");
                self.persist(plan_id).await;
            }
            Err(err @ WimiError::Timeout(_)) => {
                warn!(plan_id, error = %err, "Decision arrived after the deadline");
                self.persist(plan_id).await;
            }
            Err(err) if err.category().is_locally_resolved() => {
                warn!(plan_id, error = %err, "Approval decision refused");
            }
            Err(err) => debug!(plan_id, error = %err, "Approval decision rejected"),
        }
        result
    }

    /// Snapshot of a plan that must be EXECUTING with `agent_id` as its
    /// current step.
    fn current_step_of(&self, plan_id: &str, agent_id: &str) -> WimiResult<WorkflowContext> {
        let ctx = self.state.snapshot(plan_id)?;
        if ctx.status != WorkflowStatus::Executing {
            return Err(WimiError::StateConflict {
                plan_id: plan_id.to_string(),
                expected: WorkflowStatus::Executing.to_string(),
                actual: ctx.status.to_string(),
            });
        }
        match ctx.current_agent() {
            Some(current) if current == agent_id => Ok(ctx),
            current => Err(WimiError::InvalidState(format!(
                "plan {plan_id} is at step {} ({}), not {agent_id}",
                ctx.current_step,
                current.unwrap_or("none")
            ))),
        }
    }

    async fn advance(
        &self,
        plan_id: &str,
        agent_id: &str,
        outcome: StepOutcome,
        execution: AgentExecution,
        error: Option<ErrorEvent>,
    ) -> WimiResult<WorkflowContext> {
        let event = match outcome {
            StepOutcome::Failed => "step_failed",
            StepOutcome::Mocked => "step_mocked",
            StepOutcome::Succeeded | StepOutcome::PartialSuccess => "step_completed",
        };
        let message = format!("{agent_id}: {outcome:?}");
        let owner = agent_id.to_string();
        let ctx = self.state.update(
            plan_id,
            WorkflowStatus::Executing,
            event,
            &message,
            move |ctx| {
                if ctx.current_agent() != Some(owner.as_str()) {
                    return Err(WimiError::InvalidState(format!(
                        "step {} does not belong to {owner}",
                        ctx.current_step
                    )));
                }
                if outcome != StepOutcome::Failed {
                    ctx.agent_outputs.insert(owner.clone(), execution.data);
                    ctx.available_tokens.extend(execution.output_tokens.iter().copied());
                }
                ctx.steps.push(StepRecord {
                    step: ctx.current_step,
                    agent_id: owner,
                    outcome,
                    duration_seconds: execution.duration_seconds,
                    output_tokens: execution.output_tokens,
                    error_event_id: error.as_ref().map(|e| e.id.clone()),
                    message: error.map(|e| e.message),
                });
                ctx.current_step += 1;
                Ok(())
            },
        )?;

        if ctx.current_step >= ctx.total_steps() {
            self.finish_execution(plan_id).await
        } else {
            self.persist(plan_id).await;
            Ok(ctx)
        }
    }

    async fn finish_execution(&self, plan_id: &str) -> WimiResult<WorkflowContext> {
        let ctx = self.state.transition(
            plan_id,
            WorkflowStatus::Executing,
            WorkflowStatus::AwaitingFinalApproval,
            "all steps finished",
        )?;
        let reasoning = ctx
            .steps
            .iter()
            .map(|s| {
                let line = match s.outcome {
                    StepOutcome::Succeeded => format!("succeeded in {:.1}s", s.duration_seconds),
                    StepOutcome::PartialSuccess => {
                        format!("partially succeeded in {:.1}s", s.duration_seconds)
                    }
                    StepOutcome::Mocked => "used fixture data after a failure".to_string(),
                    StepOutcome::Failed => format!(
                        "failed: {}",
                        s.message.as_deref().unwrap_or("no detail")
                    ),
                };
                (s.agent_id.clone(), line)
            })
            .collect();
        let proposal = SequenceProposal {
            agents: ctx.agent_sequence.clone(),
            reasoning,
            estimated_duration_seconds: ctx.steps.iter().map(|s| s.duration_seconds).sum(),
        };
        self.gateway
            .create(plan_id, ApprovalKind::Final, proposal, None)?;
        self.persist(plan_id).await;
        info!(plan_id, steps = ctx.steps.len(), "Execution finished; awaiting final approval");
        Ok(ctx)
    }

    /// Whether losing `failed` leaves a downstream `ALL_DATA` consumer
    /// without enough data.
    fn breaks_aggregation(&self, ctx: &WorkflowContext, failed: &AgentDescriptor) -> bool {
        if !failed.is_data_provider() {
            return false;
        }
        let mut lost: HashSet<&str> = ctx
            .steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Failed)
            .map(|s| s.agent_id.as_str())
            .collect();
        lost.insert(failed.id.as_str());

        ctx.agent_sequence
            .iter()
            .skip(ctx.current_step + 1)
            .filter_map(|id| self.registry.get(id))
            .filter(|d| d.needs_all_data())
            .any(|consumer| {
                if !self.planner.is_aggregator(consumer) {
                    return true;
                }
                let healthy = ctx
                    .agent_sequence
                    .iter()
                    .filter(|id| !lost.contains(id.as_str()) && **id != consumer.id)
                    .filter_map(|id| self.registry.get(id))
                    .filter(|d| d.is_data_provider())
                    .count();
                healthy < self.planner.policy().min_data_providers
            })
    }

    /// Drive a plan to FAILED. Records an error event when the caller has
    /// none yet. A plan that already ended is returned as is.
    async fn fail_plan(
        &self,
        plan_id: &str,
        category: ErrorCategory,
        reason: String,
        error_event_id: Option<String>,
    ) -> WimiResult<WorkflowContext> {
        let event_id = error_event_id.unwrap_or_else(|| {
            self.resilience
                .handle(Some(plan_id), category, reason.clone(), None, BTreeMap::new())
                .id
        });
        let info = failure(category, reason, Some(event_id), self.clock.now());
        let result = match self.state.fail(plan_id, info) {
            Ok(ctx) => Ok(ctx),
            Err(WimiError::InvalidState(msg)) => {
                warn!(plan_id, reason = %msg, "Plan already ended");
                self.state.snapshot(plan_id)
            }
            Err(e) => Err(e),
        };
        self.persist(plan_id).await;
        result
    }

    /// Write the plan's context and approval history to the store. Failures
    /// are logged; the in-memory state stays authoritative.
    /// In-memory snapshot, or the stored one for plans already released.
    async fn load(&self, plan_id: &str) -> WimiResult<WorkflowContext> {
        match self.state.snapshot(plan_id) {
            Ok(ctx) => Ok(ctx),
            Err(WimiError::NotFound(what)) => match self.store.get(plan_id, RecordKind::Status).await? {
                Some(value) => Ok(serde_json::from_value(value)?),
                None => Err(WimiError::NotFound(what)),
            },
            Err(err) => Err(err),
        }
    }

    async fn persist(&self, plan_id: &str) {
        let Ok(ctx) = self.state.snapshot(plan_id) else {
            return;
        };
        let records = [
            (RecordKind::Status, serde_json::to_value(&ctx)),
            (RecordKind::Approvals, serde_json::to_value(self.gateway.history(plan_id))),
        ];
        let mut written = true;
        for (kind, value) in records {
            let result = match value {
                Ok(value) => self.store.set(plan_id, kind, value).await,
                Err(e) => Err(WimiError::from(e)),
            };
            if let Err(e) = result {
                warn!(plan_id, kind = ?kind, error = %e, "Plan snapshot not persisted");
                written = false;
            }
        }
        if written && ctx.is_terminal() {
            self.retire(plan_id);
        }
    }

    /// Queue a persisted terminal plan and drop the oldest ones from memory
    /// once more than `retained_plans` are held. Dropped plans stay readable
    /// through [`Orchestrator::get_status`].
    fn retire(&self, plan_id: &str) {
        let evicted: Vec<String> = {
            let mut retired = self.retired.lock();
            if !retired.iter().any(|id| id == plan_id) {
                retired.push_back(plan_id.to_string());
            }
            let excess = retired.len().saturating_sub(self.config.retained_plans);
            retired.drain(..excess).collect()
        };
        for id in evicted {
            self.state.forget(&id);
            self.gateway.forget(&id);
            self.resilience.forget_plan(&id);
            self.telemetry.unbind_plan(&id);
            debug!(plan_id = %id, "Terminal plan released from memory");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use wimi_core::FixedTaskAnalyzer;

    struct IdleExecutor;

    #[async_trait]
    impl AgentExecutor for IdleExecutor {
        async fn execute(&self, agent_id: &str, _input: &ExecutionInput) -> WimiResult<AgentExecution> {
            Err(WimiError::Agent(format!("{agent_id} is idle")))
        }
    }

    async fn orchestrator() -> Orchestrator {
        Orchestrator::builder(OrchestratorConfig::default())
            .analyzer(Arc::new(FixedTaskAnalyzer::new(vec!["gmail".into()])))
            .executor(Arc::new(IdleExecutor))
            .build()
            .await
            .unwrap()
    }

    fn executing(sequence: &[&str], step: usize) -> WorkflowContext {
        let mut ctx = WorkflowContext::new("p1", "s1", "task", "c1", Utc::now());
        ctx.status = WorkflowStatus::Executing;
        ctx.agent_sequence = sequence.iter().map(|s| s.to_string()).collect();
        ctx.current_step = step;
        ctx
    }

    #[tokio::test]
    async fn test_losing_one_of_three_providers_keeps_quorum() {
        let o = orchestrator().await;
        let ctx = executing(&["planner", "gmail", "invoice", "salesforce", "analysis"], 3);
        let salesforce = o.registry().get("salesforce").unwrap();
        assert!(!o.breaks_aggregation(&ctx, salesforce));
    }

    #[tokio::test]
    async fn test_second_provider_loss_breaks_quorum() {
        let o = orchestrator().await;
        let mut ctx = executing(&["planner", "gmail", "invoice", "salesforce", "analysis"], 3);
        ctx.steps.push(StepRecord {
            step: 1,
            agent_id: "gmail".into(),
            outcome: StepOutcome::Failed,
            duration_seconds: 0.0,
            output_tokens: Vec::new(),
            error_event_id: None,
            message: None,
        });
        let salesforce = o.registry().get("salesforce").unwrap();
        assert!(o.breaks_aggregation(&ctx, salesforce));
    }

    #[tokio::test]
    async fn test_non_provider_or_no_consumer_never_breaks() {
        let o = orchestrator().await;
        let ctx = executing(&["planner", "gmail", "analysis"], 0);
        assert!(!o.breaks_aggregation(&ctx, o.registry().get("planner").unwrap()));

        let ctx = executing(&["planner", "gmail"], 1);
        assert!(!o.breaks_aggregation(&ctx, o.registry().get("gmail").unwrap()));
    }

    #[tokio::test]
    async fn test_builder_requires_an_analyzer() {
        let result = Orchestrator::builder(OrchestratorConfig::default())
            .executor(Arc::new(IdleExecutor))
            .build()
            .await;
        assert!(matches!(result, Err(WimiError::Config(_))));
    }

    #[tokio::test]
    async fn test_builder_rejects_unbounded_windows() {
        let config = OrchestratorConfig {
            approval_timeout_secs: u64::MAX,
            ..OrchestratorConfig::default()
        };
        let result = Orchestrator::builder(config)
            .analyzer(Arc::new(FixedTaskAnalyzer::new(vec!["gmail".into()])))
            .executor(Arc::new(IdleExecutor))
            .build()
            .await;
        assert!(matches!(result, Err(WimiError::Config(_))));
    }
}
