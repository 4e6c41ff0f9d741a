use crate::planner::PlannerPolicy;
use crate::resilience::ResilienceConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use wimi_core::{span_secs, WimiError, WimiResult};
use wimi_telemetry::TelemetryConfig;

/// Configuration of an [`Orchestrator`](crate::Orchestrator).
///
/// Every field has a default, so an empty TOML table is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// How long a reviewer has to answer an approval request.
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
    /// Tick of the background expiry sweeper.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Deadline for a single agent run of the built-in driver.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// How many terminal plans stay in memory before the oldest are dropped.
    /// Dropped plans remain readable from the store.
    #[serde(default = "default_retained_plans")]
    pub retained_plans: usize,
    /// Sequencing rules.
    #[serde(default)]
    pub planner: PlannerPolicy,
    /// Error window and mock fallback switches.
    #[serde(default)]
    pub resilience: ResilienceConfig,
    /// Event log sizing.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Where plan snapshots and the event log are written. In-memory when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_approval_timeout_secs() -> u64 {
    30 * 60
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_retained_plans() -> usize {
    1000
}

/// Upper bound for every configured span: one leap year.
pub const MAX_SPAN_SECS: u64 = 366 * 24 * 60 * 60;

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            approval_timeout_secs: default_approval_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            step_timeout_secs: default_step_timeout_secs(),
            retained_plans: default_retained_plans(),
            planner: PlannerPolicy::default(),
            resilience: ResilienceConfig::default(),
            telemetry: TelemetryConfig::default(),
            data_dir: None,
        }
    }
}

impl OrchestratorConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> WimiResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| WimiError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the engine unusable.
    pub fn validate(&self) -> WimiResult<()> {
        check_span("approval_timeout_secs", self.approval_timeout_secs)?;
        check_span("step_timeout_secs", self.step_timeout_secs)?;
        check_span("sweep_interval_secs", self.sweep_interval_secs)?;
        check_span("resilience.window_secs", self.resilience.window_secs)?;
        if self.retained_plans == 0 {
            return Err(WimiError::Config("retained_plans must be positive".into()));
        }
        if self.telemetry.capacity == 0 {
            return Err(WimiError::Config("telemetry.capacity must be positive".into()));
        }
        Ok(())
    }

    /// Time a reviewer has before an approval request expires.
    pub fn approval_window(&self) -> chrono::Duration {
        span_secs(self.approval_timeout_secs)
    }

    /// Deadline for one agent run.
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    /// Tick of the expiry sweeper.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn check_span(name: &str, secs: u64) -> WimiResult<()> {
    if secs == 0 {
        return Err(WimiError::Config(format!("{name} must be positive")));
    }
    if secs > MAX_SPAN_SECS {
        return Err(WimiError::Config(format!(
            "{name} must be at most {MAX_SPAN_SECS} seconds, got {secs}"
        )));
    }
    Ok(())
}
