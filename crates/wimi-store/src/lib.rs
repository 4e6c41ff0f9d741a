//! Persistence interface for WIMI plans.
//!
//! The orchestrator stores a status snapshot and the approval history of each
//! plan, keyed by plan id. It stays correct with the in-memory store; the
//! file store adds restart survival for single-node deployments.
//!
//! # Main types
//!
//! - [`PlanStore`] — get/set by plan id and record kind.
//! - [`InMemoryPlanStore`] — Process-local store.
//! - [`FilePlanStore`] — One JSON file per plan and record kind.

/// Store trait and implementations.
pub mod store;

pub use store::{FilePlanStore, InMemoryPlanStore, PlanStore, RecordKind};
