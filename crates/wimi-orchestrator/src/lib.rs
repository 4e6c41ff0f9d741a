//! Human-in-the-loop workflow orchestration for the WIMI agent pipeline.
//!
//! A task is analysed, turned into a dependency-safe agent sequence, held for
//! plan approval, executed step by step with mock fallback for flaky
//! integrations, and finally held for a second approval before it completes.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Top-level engine driving a plan through its lifecycle.
//! - [`AgentRegistry`] — Catalogue of agents, their dependencies and aliases.
//! - [`SequencePlanner`] — Dependency-ordered sequencing and validation.
//! - [`StateMachine`] — Guarded per-plan status transitions.
//! - [`ApprovalGateway`] — Plan and final approval requests with deadlines.
//! - [`ResilienceManager`] — Error tracking, stability and mock fallback.

/// Approval requests, decisions and deadlines.
pub mod approval;
/// Engine configuration.
pub mod config;
/// Orchestration engine.
pub mod engine;
/// Built-in notification channels.
pub mod notify;
/// Agent sequencing and validation.
pub mod planner;
/// Agent catalogue.
pub mod registry;
/// Error tracking and fallback decisions.
pub mod resilience;
/// Workflow state machine.
pub mod state;
/// Shared workflow types (WorkflowContext, WorkflowStatus, StepRecord, etc.).
pub mod types;

pub use approval::{
    ApprovalDecision, ApprovalGateway, ApprovalKind, ApprovalOutcome, ApprovalRequest,
    ApprovalStatus,
};
pub use config::OrchestratorConfig;
pub use engine::{MetricsSnapshot, Orchestrator, OrchestratorBuilder};
pub use notify::{BroadcastNotifier, CollectingNotifier, TracingNotifier};
pub use planner::{MissingDependency, PlanOutcome, PlannerPolicy, SequencePlanner, ValidationReport};
pub use registry::{AgentCategory, AgentDescriptor, AgentRegistry, RegistryBuilder};
pub use resilience::{
    EnvFallbackSwitches, ErrorEvent, FallbackDecision, FallbackSwitches, ResilienceConfig,
    ResilienceManager, StabilityStatus, StaticFallbackSwitches, StepFailure,
};
pub use state::{CancelOutcome, StateMachine, StatusChange};
pub use types::{
    FailureInfo, HistoryEvent, SequenceProposal, StepOutcome, StepRecord, WorkflowContext,
    WorkflowStatus,
};
