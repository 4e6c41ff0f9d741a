//! Notification channel for approval requests and escalations.
//!
//! Lives in `wimi-core` so the orchestrator and any host transport (web
//! socket, chat bot, e-mail) share one trait.

use crate::WimiResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A plan is waiting for human approval.
    PlanApprovalRequested,
    /// A result is waiting for human approval.
    FinalApprovalRequested,
    /// A HIGH or CRITICAL error was recorded.
    Escalation,
    /// Workflow status changed.
    StatusChanged,
}

/// A message pushed to observers of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Plan the message concerns.
    pub plan_id: String,
    /// Message category.
    pub kind: NotificationKind,
    /// Human-readable text.
    pub message: String,
    /// Structured payload for UIs.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Notification {
    /// Build a notification without payload.
    pub fn new(plan_id: impl Into<String>, kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            kind,
            message: message.into(),
            payload: serde_json::Value::Null,
        }
    }

    /// Attach a structured payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Fire-and-forget delivery of notifications. Callers never wait for
/// confirmation; a returned error is only logged.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Deliver `notification`.
    async fn send(&self, notification: Notification) -> WimiResult<()>;
}
