//! Agent execution interface.
//!
//! The orchestrator never knows what an agent does; it hands the agent an
//! [`ExecutionInput`] and receives an [`AgentExecution`] back.

use crate::token::DataToken;
use crate::WimiResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome reported by an agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The agent produced every output it declares.
    Success,
    /// The agent produced some data but not all of it.
    PartialSuccess,
    /// The agent ran but reported failure.
    Error,
}

/// Result of one agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecution {
    /// How the run ended.
    pub status: ExecutionStatus,
    /// Tokens this run actually produced.
    pub output_tokens: Vec<DataToken>,
    /// Opaque agent payload.
    pub data: serde_json::Value,
    /// Wall time the agent spent.
    pub duration_seconds: f64,
}

impl AgentExecution {
    /// A successful run producing `tokens` and `data`.
    pub fn success(tokens: Vec<DataToken>, data: serde_json::Value) -> Self {
        Self {
            status: ExecutionStatus::Success,
            output_tokens: tokens,
            data,
            duration_seconds: 0.0,
        }
    }

    /// Set the reported duration.
    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = seconds;
        self
    }
}

/// Everything an agent is given when it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionInput {
    /// Plan the step belongs to.
    pub plan_id: String,
    /// Original task text.
    pub task_description: String,
    /// Zero-based step index.
    pub step: usize,
    /// Total number of steps in the sequence.
    pub total_steps: usize,
    /// Outputs of every agent that already ran, keyed by agent id.
    pub prior_outputs: BTreeMap<String, serde_json::Value>,
}

/// Runs a single agent. Implementations live outside the core.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run `agent_id` with the given input.
    async fn execute(&self, agent_id: &str, input: &ExecutionInput) -> WimiResult<AgentExecution>;

    /// Deterministic fixture data used when mock fallback is explicitly
    /// enabled for the agent's integration.
    fn fixture(&self, _agent_id: &str) -> Option<AgentExecution> {
        None
    }
}
