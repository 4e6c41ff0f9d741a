//! Offline stand-ins for the real agents, used by `wimi run`.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use wimi_core::{AgentExecution, AgentExecutor, ExecutionInput, WimiError, WimiResult};
use wimi_orchestrator::{AgentRegistry, EnvFallbackSwitches, FallbackSwitches, StaticFallbackSwitches};

/// Answers every agent with canned data derived from its registry entry.
/// Agents named in `unreachable` fail with a network error, which
/// exercises the mock fallback path.
pub struct DemoExecutor {
    registry: Arc<AgentRegistry>,
    unreachable: HashSet<String>,
}

impl DemoExecutor {
    /// Executor answering from `registry`, failing the agents in `unreachable`.
    pub fn new(registry: Arc<AgentRegistry>, unreachable: impl IntoIterator<Item = String>) -> Self {
        Self {
            registry,
            unreachable: unreachable.into_iter().collect(),
        }
    }

    fn canned(&self, agent_id: &str, source: &str) -> WimiResult<AgentExecution> {
        let descriptor = self.registry.lookup(agent_id)?;
        let data = serde_json::json!({
            "agent": agent_id,
            "source": source,
            "summary": format!("{} ({})", descriptor.description, source),
            "provides": descriptor.provides.iter().map(ToString::to_string).collect::<Vec<_>>(),
        });
        Ok(AgentExecution::success(descriptor.provides.clone(), data))
    }
}

#[async_trait]
impl AgentExecutor for DemoExecutor {
    async fn execute(&self, agent_id: &str, input: &ExecutionInput) -> WimiResult<AgentExecution> {
        debug!(agent = agent_id, step = input.step, "Demo agent running");
        if self.unreachable.contains(agent_id) {
            return Err(WimiError::Network(format!("{agent_id}: connection refused")));
        }
        self.canned(agent_id, "live")
    }

    fn fixture(&self, agent_id: &str) -> Option<AgentExecution> {
        let descriptor = self.registry.get(agent_id)?;
        descriptor.integration.as_ref()?;
        self.canned(agent_id, "fixture").ok()
    }
}

/// Config switches, overridable per integration through the environment.
pub struct LayeredSwitches {
    config: StaticFallbackSwitches,
    env: EnvFallbackSwitches,
}

impl LayeredSwitches {
    /// Environment switches override the config ones when set.
    pub fn new(config: StaticFallbackSwitches, env: EnvFallbackSwitches) -> Self {
        Self { config, env }
    }
}

impl FallbackSwitches for LayeredSwitches {
    fn mock_enabled(&self, integration: &str) -> bool {
        self.env.mock_enabled(integration) || self.config.mock_enabled(integration)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use wimi_core::DataToken;

    fn input() -> ExecutionInput {
        ExecutionInput {
            plan_id: "plan_1".into(),
            task_description: "demo".into(),
            step: 0,
            total_steps: 1,
            prior_outputs: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_demo_agent_provides_registry_tokens() {
        let executor = DemoExecutor::new(Arc::new(AgentRegistry::default_catalog()), Vec::new());
        let result = executor.execute("invoice", &input()).await.unwrap();
        assert_eq!(result.output_tokens, vec![DataToken::ApData]);
        assert_eq!(result.data["source"], "live");
    }

    #[tokio::test]
    async fn test_unreachable_agent_has_fixture_only_with_integration() {
        let executor = DemoExecutor::new(
            Arc::new(AgentRegistry::default_catalog()),
            vec!["gmail".to_string(), "analysis".to_string()],
        );
        let err = executor.execute("gmail", &input()).await.unwrap_err();
        assert!(matches!(err, WimiError::Network(_)));
        assert_eq!(executor.fixture("gmail").unwrap().data["source"], "fixture");
        assert!(executor.fixture("analysis").is_none());
        assert!(executor.fixture("nobody").is_none());
    }

    #[test]
    fn test_layered_switches_fall_back_to_config() {
        let switches = LayeredSwitches::new(
            StaticFallbackSwitches::new(HashMap::from([("coupa".to_string(), true)])),
            EnvFallbackSwitches::with_prefix("WIMI_TEST_UNSET_"),
        );
        assert!(switches.mock_enabled("coupa"));
        assert!(!switches.mock_enabled("gmail"));
    }
}
