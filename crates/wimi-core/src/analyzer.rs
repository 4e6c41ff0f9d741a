use crate::WimiResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Classification of a submitted task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskAnalysis {
    /// Agents (ids or aliases) the task cannot be answered without.
    pub required_agent_ids: Vec<String>,
    /// Agents that may help but are not needed.
    #[serde(default)]
    pub optional_agent_ids: Vec<String>,
    /// Rough complexity estimate in `[0, 1]`.
    #[serde(default)]
    pub complexity_score: f64,
}

/// Decides which agents a task needs.
#[async_trait]
pub trait TaskAnalyzer: Send + Sync {
    /// Analyze the task text.
    async fn analyze(&self, task_description: &str) -> WimiResult<TaskAnalysis>;
}

/// Analyzer that returns the same agent set for every task.
///
/// Used by hosts that select agents up front (CLI flags, API parameters).
pub struct FixedTaskAnalyzer {
    analysis: TaskAnalysis,
}

impl FixedTaskAnalyzer {
    /// Always require `agents`.
    pub fn new(agents: Vec<String>) -> Self {
        Self {
            analysis: TaskAnalysis {
                required_agent_ids: agents,
                optional_agent_ids: Vec::new(),
                complexity_score: 0.5,
            },
        }
    }

    /// Attach optional hints.
    pub fn with_optional(mut self, agents: Vec<String>) -> Self {
        self.analysis.optional_agent_ids = agents;
        self
    }
}

#[async_trait]
impl TaskAnalyzer for FixedTaskAnalyzer {
    async fn analyze(&self, _task_description: &str) -> WimiResult<TaskAnalysis> {
        Ok(self.analysis.clone())
    }
}
