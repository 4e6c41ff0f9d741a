//! Core types and error definitions for the WIMI workflow engine.
//!
//! This crate provides the foundational types shared by every WIMI crate:
//! error handling, the failure taxonomy, data tokens, the clock abstraction
//! and the traits through which the orchestrator talks to its external
//! collaborators.
//!
//! # Main types
//!
//! - [`WimiError`] — Unified error enum, mapped onto the failure taxonomy.
//! - [`WimiResult`] — Convenience alias for `Result<T, WimiError>`.
//! - [`ErrorCategory`] / [`Severity`] — Failure taxonomy.
//! - [`DataToken`] — Dependency/output tokens exchanged between agents.
//! - [`Clock`] — Injectable time source.
//! - [`AgentExecutor`], [`TaskAnalyzer`], [`NotificationChannel`] — Collaborator interfaces.

/// Task analysis interface.
pub mod analyzer;
/// Time source abstraction.
pub mod clock;
/// Error types.
pub mod error;
/// Agent execution interface.
pub mod executor;
/// Notification delivery interface.
pub mod notify;
/// Failure taxonomy.
pub mod taxonomy;
/// Data tokens.
pub mod token;

pub use analyzer::{FixedTaskAnalyzer, TaskAnalysis, TaskAnalyzer};
pub use clock::{deadline_after, span_secs, Clock, ManualClock, SystemClock};
pub use error::{WimiError, WimiResult};
pub use executor::{AgentExecution, AgentExecutor, ExecutionInput, ExecutionStatus};
pub use notify::{Notification, NotificationChannel, NotificationKind};
pub use taxonomy::{ErrorCategory, Severity};
pub use token::DataToken;
